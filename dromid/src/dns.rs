//! Names learned from DNS answers seen in transit, and the set of addresses
//! that belong to this host.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::iter;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use log::{debug, error, info, warn};
use parking_lot::RwLock;

const LOCALHOST: &str = "localhost";

#[derive(Default)]
struct Hosts {
    names: HashMap<IpAddr, String>,
    local: HashSet<IpAddr>,
}

#[derive(Default)]
pub struct DnsCache {
    hosts: RwLock<Hosts>,
    journal: Option<Sender<(String, IpAddr)>>,
}

impl DnsCache {
    /// A cache that forgets everything on exit.
    #[cfg(test)]
    pub fn new() -> Self {
        Default::default()
    }

    /// A cache seeded from the `name address` lines at `path`. New records
    /// are queued for the returned [`DnsJournal`] to append to the same file.
    pub fn with_journal(path: &Path) -> io::Result<(DnsCache, DnsJournal)> {
        let (sender, receiver) = unbounded();
        let cache = DnsCache {
            hosts: Default::default(),
            journal: Some(sender),
        };
        let loaded = cache.load(path)?;
        info!("loaded {} dns records from {}", loaded, path.display());
        let journal = DnsJournal {
            path: path.to_owned(),
            records: receiver,
        };
        Ok((cache, journal))
    }

    fn load(&self, path: &Path) -> io::Result<usize> {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(path)?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let mut hosts = self.hosts.write();
        let mut count = 0;
        for line in BufReader::new(f).lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().map(str::parse::<IpAddr>), parts.next()) {
                (None, ..) => continue,
                (Some(name), Some(Ok(addr)), None) => {
                    hosts.names.insert(addr, name.to_lowercase());
                    count += 1;
                }
                _ => warn!("bad dns record in {}: {:?}", path.display(), line),
            }
        }
        Ok(count)
    }

    /// Records `name` for `addr`. Returns false when it was already known.
    pub fn update(&self, name: &str, addr: IpAddr) -> bool {
        let name = name.to_lowercase();
        {
            let mut hosts = self.hosts.write();
            if hosts.names.get(&addr) == Some(&name) {
                return false;
            }
            hosts.names.insert(addr, name.clone());
        }
        info!("dns {} -> {}", name, addr);
        if let Some(journal) = &self.journal {
            // only fails once the journal thread is gone
            let _ = journal.send((name, addr));
        }
        true
    }

    /// The learned name, or the address itself.
    pub fn resolve(&self, addr: IpAddr) -> String {
        self.hosts
            .read()
            .names
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| addr.to_string())
    }

    pub fn is_localhost(&self, addr: IpAddr) -> bool {
        self.hosts.read().local.contains(&addr)
    }

    /// Replaces the local address set; each address also resolves to `localhost`.
    pub fn set_local_addresses(&self, addrs: HashSet<IpAddr>) {
        let mut hosts = self.hosts.write();
        for addr in &addrs {
            hosts.names.insert(*addr, LOCALHOST.to_owned());
        }
        hosts.local = addrs;
    }

    pub fn refresh_local_addresses(&self) -> io::Result<usize> {
        let addrs: HashSet<IpAddr> = get_if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| iface.ip())
            .collect();
        let n = addrs.len();
        self.set_local_addresses(addrs);
        Ok(n)
    }
}

/// Polls the interface list. The view is up to `interval` stale.
pub fn spawn_localhost_refresher(
    cache: Arc<DnsCache>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("localhost-refresher".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                if let Err(e) = cache.refresh_local_addresses() {
                    error!("listing local interfaces: {}", e);
                }
                thread::sleep(interval);
            }
        })
}

/// Appends learned records to the DNS log, off the packet path.
pub struct DnsJournal {
    path: PathBuf,
    records: Receiver<(String, IpAddr)>,
}

impl DnsJournal {
    /// Writes whatever is queued without waiting.
    #[cfg(test)]
    pub fn write_pending(&self) -> io::Result<usize> {
        self.append(self.records.try_iter())
    }

    fn append<I: Iterator<Item = (String, IpAddr)>>(&self, records: I) -> io::Result<usize> {
        let mut records = records.peekable();
        if records.peek().is_none() {
            return Ok(0);
        }
        let f = OpenOptions::new().append(true).create(true).open(&self.path)?;
        let mut w = BufWriter::new(f);
        let mut n = 0;
        for (name, addr) in records {
            writeln!(w, "{} {}", name, addr)?;
            n += 1;
        }
        w.flush()?;
        Ok(n)
    }

    /// Runs until every [`DnsCache`] holding the sender is dropped.
    pub fn run(self) {
        while let Ok(first) = self.records.recv() {
            let batch = iter::once(first).chain(self.records.try_iter());
            if let Err(e) = self.append(batch) {
                error!("appending to {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Name/address pairs from the answer section of a DNS response. When the
/// answer follows a CNAME chain, addresses are recorded under the first
/// CNAME owner, the name the client actually asked for.
pub fn dns_answers(payload: &[u8]) -> Vec<(String, IpAddr)> {
    let msg = match Message::from_vec(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("undecodable dns payload: {}", e);
            return Vec::new();
        }
    };
    if msg.message_type() != MessageType::Response {
        return Vec::new();
    }
    let mut alias = None;
    let mut pairs = Vec::new();
    for record in msg.answers() {
        let owner = record.name().to_string().trim_end_matches('.').to_owned();
        match record.data() {
            Some(RData::CNAME(_)) => {
                alias.get_or_insert(owner);
            }
            Some(RData::A(a)) => pairs.push((owner, IpAddr::V4(a.0))),
            Some(RData::AAAA(aaaa)) => pairs.push((owner, IpAddr::V6(aaaa.0))),
            _ => (),
        }
    }
    if let Some(alias) = alias {
        for (name, _) in &mut pairs {
            name.clone_from(&alias);
        }
    }
    pairs
}
