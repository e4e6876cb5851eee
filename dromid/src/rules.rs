use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use dromi_interface::{subdomain_wildcard, Action, Flow, Port, Rule, RuleKey};
use log::info;
use parking_lot::RwLock;

/// Every rule the daemon knows, permanent and temporary, at most one per key.
#[derive(Default)]
pub struct RuleStore {
    rules: RwLock<HashMap<RuleKey, Rule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// The most specific rule for the flow's destination, see [`candidates`].
    /// Protocols rules cannot name are allowed by a synthesized rule.
    pub fn lookup(&self, flow: &Flow) -> Option<Rule> {
        if !flow.proto.is_matchable() {
            return Some(Rule::permanent(flow.key(), Action::Allow));
        }
        let keys = candidates(flow);
        let rules = self.rules.read();
        keys.iter().find_map(|k| rules.get(k)).cloned()
    }

    /// Inserts or replaces the rule at its key. Returns whether the table
    /// changed; nothing is logged for a redundant insert.
    pub fn add(&self, rule: Rule, log: bool) -> bool {
        let mut rules = self.rules.write();
        if rules.get(&rule.key) == Some(&rule) {
            return false;
        }
        if log {
            if rule.is_permanent() {
                info!("add rule {}", rule);
            } else {
                info!("add temporary rule {}s {}", rule.duration.as_secs(), rule);
            }
        }
        rules.insert(rule.key.clone(), rule);
        true
    }

    /// Drops temporary rules older than their duration.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<Rule> {
        let mut expired = Vec::new();
        self.rules.write().retain(|_, rule| {
            if rule.is_expired(now) {
                expired.push(rule.clone());
                false
            } else {
                true
            }
        });
        for rule in &expired {
            info!("expire rule {}", rule);
        }
        expired
    }

    /// Drops permanent rules whose key is not in `on_disk`. Temporary rules
    /// are left alone.
    pub fn reconcile_permanent(&self, on_disk: &HashSet<RuleKey>) -> Vec<Rule> {
        let mut removed = Vec::new();
        self.rules.write().retain(|key, rule| {
            if rule.is_permanent() && !on_disk.contains(key) {
                removed.push(rule.clone());
                false
            } else {
                true
            }
        });
        for rule in &removed {
            info!("remove rule {}", rule);
        }
        removed
    }

    #[cfg(test)]
    pub fn get(&self, key: &RuleKey) -> Option<Rule> {
        self.rules.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }
}

/// Keys to look up for a flow, most specific first:
///
/// 1. destination, port
/// 2. destination, `*`
/// 3. IPv4 destinations: `a.b.c.*`, `a.b.*.*`, `a.*.*.*` with the port,
///    then the same three with `*`
/// 4. hostnames with a parent domain: `*.<last two labels>` with the port,
///    then with `*`
pub fn candidates(flow: &Flow) -> Vec<RuleKey> {
    let (dst, port, proto) = (flow.dst.as_str(), flow.dst_port, flow.proto);
    let mut keys = vec![
        RuleKey::new(dst, port, proto),
        RuleKey::new(dst, Port::Any, proto),
    ];
    match dst.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            let masked = ipv4_wildcards(ip);
            for &p in &[port, Port::Any] {
                for address in &masked {
                    keys.push(RuleKey::new(address.as_str(), p, proto));
                }
            }
        }
        Ok(IpAddr::V6(_)) => (),
        Err(_) => {
            if has_parent_domain(dst) {
                let wildcard = subdomain_wildcard(dst);
                keys.push(RuleKey::new(wildcard.as_str(), port, proto));
                keys.push(RuleKey::new(wildcard, Port::Any, proto));
            }
        }
    }
    keys
}

/// Whether `*.<last two labels>` can cover `name`. `example.com` is not a
/// subdomain of itself, and addresses have no domains.
pub fn has_parent_domain(name: &str) -> bool {
    name.parse::<IpAddr>().is_err() && name.split('.').count() > 2
}

fn ipv4_wildcards(ip: Ipv4Addr) -> [String; 3] {
    let [a, b, c, _] = ip.octets();
    [
        format!("{}.{}.{}.*", a, b, c),
        format!("{}.{}.*.*", a, b),
        format!("{}.*.*.*", a),
    ]
}
