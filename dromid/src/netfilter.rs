//! The netfilter queue. One thread owns the `nfq::Queue`: it parks each
//! received message until a verdict for its packet id is posted back through a
//! [`QueueHandle`], from any thread.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dromi_interface::{Action, PacketId};
use log::warn;

/// Full packets: DNS answers have to be visible to the classifier.
const COPY_RANGE: u16 = 0xFFFF;
/// How long the queue thread waits for verdicts before polling the kernel again.
const VERDICT_WAIT: Duration = Duration::from_millis(5);

/// Where decisions go. Every packet gets exactly one verdict.
pub trait VerdictSink: Send + Sync {
    fn submit(&self, id: PacketId, action: Action);
}

pub struct NfQueue {
    queue: nfq::Queue,
    pending: HashMap<PacketId, nfq::Message>,
    verdicts: Receiver<(PacketId, Action)>,
}

#[derive(Clone)]
pub struct QueueHandle {
    verdicts: Sender<(PacketId, Action)>,
}

impl VerdictSink for QueueHandle {
    fn submit(&self, id: PacketId, action: Action) {
        // only fails once the queue thread is gone; the kernel drops what it still holds
        let _ = self.verdicts.send((id, action));
    }
}

/// Waits up to `wait` for a first verdict, then takes whatever else is queued.
/// `None` once every handle is dropped.
fn verdict_batch(verdicts: &Receiver<(PacketId, Action)>, wait: Duration) -> Option<Vec<(PacketId, Action)>> {
    let first = match verdicts.recv_timeout(wait) {
        Ok(v) => v,
        Err(RecvTimeoutError::Timeout) => return Some(Vec::new()),
        Err(RecvTimeoutError::Disconnected) => return None,
    };
    let mut batch = vec![first];
    batch.extend(verdicts.try_iter());
    Some(batch)
}

impl NfQueue {
    pub fn open(queue_num: u16) -> io::Result<(NfQueue, QueueHandle)> {
        let mut queue = nfq::Queue::open()?;
        queue.bind(queue_num)?;
        queue.set_copy_range(queue_num, COPY_RANGE)?;
        queue.set_nonblocking(true);

        let (sender, receiver) = unbounded();
        let nfq = NfQueue {
            queue,
            pending: HashMap::new(),
            verdicts: receiver,
        };
        Ok((nfq, QueueHandle { verdicts: sender }))
    }

    /// Feeds `(id, payload)` to the workers until `shutdown` is set. Blocks
    /// while the workers are saturated.
    pub fn run(mut self, packets: Sender<(PacketId, Vec<u8>)>, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            loop {
                match self.queue.recv() {
                    Ok(msg) => {
                        let id = msg.get_packet_id();
                        let payload = msg.get_payload().to_vec();
                        self.pending.insert(id, msg);
                        if packets.send((id, payload)).is_err() {
                            return Ok(());
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            match verdict_batch(&self.verdicts, VERDICT_WAIT) {
                Some(batch) => self.apply_verdicts(batch)?,
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn apply_verdicts(&mut self, batch: Vec<(PacketId, Action)>) -> io::Result<()> {
        for (id, action) in batch {
            let mut msg = match self.pending.remove(&id) {
                Some(msg) => msg,
                None => {
                    warn!("verdict for unknown packet {}", id);
                    continue;
                }
            };
            msg.set_verdict(match action {
                Action::Allow => nfq::Verdict::Accept,
                Action::Deny => nfq::Verdict::Drop,
            });
            self.queue.verdict(msg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Instant;

    /// Keeps every verdict in submission order.
    #[derive(Default)]
    pub(crate) struct Recorder(Mutex<Vec<(PacketId, Action)>>);

    impl Recorder {
        pub(crate) fn verdicts(&self) -> Vec<(PacketId, Action)> {
            self.0.lock().clone()
        }
    }

    impl VerdictSink for Recorder {
        fn submit(&self, id: PacketId, action: Action) {
            self.0.lock().push((id, action));
        }
    }

    #[test]
    fn handle_queues_verdicts_in_order() {
        let (sender, receiver) = unbounded();
        let handle = QueueHandle { verdicts: sender };
        handle.submit(3, Action::Allow);
        handle.submit(4, Action::Deny);
        assert_eq!(
            verdict_batch(&receiver, Duration::ZERO).unwrap(),
            vec![(3, Action::Allow), (4, Action::Deny)]
        );
        assert_eq!(verdict_batch(&receiver, Duration::from_millis(1)).unwrap(), vec![]);
    }

    #[test]
    fn verdict_wait_ends_on_submit() {
        let (sender, receiver) = unbounded();
        let handle = QueueHandle { verdicts: sender };
        let submitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.submit(9, Action::Deny);
        });
        let started = Instant::now();
        let batch = verdict_batch(&receiver, Duration::from_secs(10)).unwrap();
        assert_eq!(batch, vec![(9, Action::Deny)]);
        assert!(started.elapsed() < Duration::from_secs(5));
        submitter.join().unwrap();
        // every handle gone
        assert_eq!(verdict_batch(&receiver, Duration::from_millis(1)), None);
    }
}
