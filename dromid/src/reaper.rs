use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::rules::RuleStore;

/// Evicts expired temporary rules every `interval`.
pub fn spawn(rules: Arc<RuleStore>, interval: Duration, shutdown: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("reaper".into()).spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(interval);
            rules.remove_expired(Utc::now());
        }
    })
}
