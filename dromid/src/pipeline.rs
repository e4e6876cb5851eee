use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use dromi_interface::{Action, Flow, PacketId, Port, Proto, Rule};
use log::{debug, error, info};

use crate::classify::{classify, is_inbound_dns, is_quiet, is_udp_loopback};
use crate::dns::DnsCache;
use crate::netfilter::VerdictSink;
use crate::rules::RuleStore;

/// Turns queued packets into verdicts, or into prompt requests when no rule
/// applies.
pub struct Pipeline {
    rules: Arc<RuleStore>,
    dns: Arc<DnsCache>,
    sink: Arc<dyn VerdictSink>,
    ephemeral: RangeInclusive<u16>,
    prompts: Sender<Flow>,
}

impl Pipeline {
    pub fn new(
        rules: Arc<RuleStore>,
        dns: Arc<DnsCache>,
        sink: Arc<dyn VerdictSink>,
        ephemeral: RangeInclusive<u16>,
        prompts: Sender<Flow>,
    ) -> Self {
        Pipeline {
            rules,
            dns,
            sink,
            ephemeral,
            prompts,
        }
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn handle_packet(&self, id: PacketId, payload: &[u8]) {
        let flow = match classify(id, payload, &self.dns, &*self.sink) {
            Some(flow) => flow,
            None => return,
        };
        if is_udp_loopback(&flow) || is_inbound_dns(&flow, &self.dns) {
            self.finalize(&flow, Action::Allow);
            return;
        }
        self.decide(flow);
    }

    pub fn decide(&self, mut flow: Flow) {
        flow.src = self.dns.resolve(flow.src_ip);
        flow.dst = self.dns.resolve(flow.dst_ip);
        if self.is_ephemeral_reply(&flow) {
            flow.flip();
        }
        match self.lookup(&flow) {
            Some(rule) => self.finalize(&flow, rule.action),
            None => self.enqueue(flow),
        }
    }

    /// A TCP packet from a service port to one of our ephemeral ports is the
    /// reply half of an outbound connection.
    fn is_ephemeral_reply(&self, flow: &Flow) -> bool {
        match (flow.proto, flow.src_port, flow.dst_port) {
            (Proto::Tcp, Port::Num(sport), Port::Num(dport)) => {
                self.ephemeral.contains(&dport)
                    && !self.ephemeral.contains(&sport)
                    && self.dns.is_localhost(flow.dst_ip)
            }
            _ => false,
        }
    }

    /// The matching rule; UDP has no direction, so it is also tried reversed.
    pub fn lookup(&self, flow: &Flow) -> Option<Rule> {
        if let Some(rule) = self.rules.lookup(flow) {
            return Some(rule);
        }
        if flow.proto != Proto::Udp {
            return None;
        }
        let mut reversed = flow.clone();
        reversed.flip();
        self.rules.lookup(&reversed)
    }

    fn enqueue(&self, flow: Flow) {
        debug!("no rule for {}, queued for prompt", flow);
        let id = flow.id;
        // blocks while the prompt queue is full
        if let Err(e) = self.prompts.send(flow) {
            error!("prompt queue closed, deny {}", e.0);
            self.sink.submit(id, Action::Deny);
        }
    }

    pub fn finalize(&self, flow: &Flow, action: Action) {
        if is_quiet(flow, &self.dns) {
            debug!("{} {}", action, flow);
        } else {
            info!("{} {}", action, flow);
        }
        self.sink.submit(flow.id, action);
    }
}

/// Workers exit once the packet sender is dropped.
pub fn spawn_workers(
    n: usize,
    packets: Receiver<(PacketId, Vec<u8>)>,
    pipeline: Arc<Pipeline>,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    (0..n.max(1))
        .map(|i| {
            let packets = packets.clone();
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    for (id, payload) in packets.iter() {
                        pipeline.handle_packet(id, &payload);
                    }
                })
        })
        .collect()
}
