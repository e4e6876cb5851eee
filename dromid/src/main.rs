#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info};
use nix::unistd::Uid;

mod classify;
mod cli;
mod config;
mod dns;
mod netfilter;
mod pipeline;
mod prompt;
mod reaper;
mod reconcile;
mod rules;
mod system;

use dns::DnsCache;
use netfilter::NfQueue;
use pipeline::Pipeline;
use prompt::{PromptConsumer, SuPrompter};
use reconcile::{RuleFileReconciler, TempRuleWatcher};
use rules::RuleStore;

const REAP_INTERVAL: Duration = Duration::from_secs(1);
/// Packets buffered per worker between the queue thread and the workers.
const PACKETS_PER_WORKER: usize = 64;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    let dir = cli.config_dir.clone().unwrap_or_else(config::default_config_dir);
    let mut config = config::load(&dir)?;
    cli.apply(&mut config);

    if !Uid::effective().is_root() {
        bail!("dromid must run as root");
    }
    let prompt_user = system::prompt_user(Path::new("/home"))?;
    let ephemeral = system::ephemeral_ports()?;
    info!(
        "prompting as {}, ephemeral ports {}-{}",
        prompt_user,
        ephemeral.start(),
        ephemeral.end()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutting down");
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let (dns, journal) = DnsCache::with_journal(&config.dns_log_file)
        .with_context(|| format!("loading {}", config.dns_log_file.display()))?;
    let dns = Arc::new(dns);
    dns.refresh_local_addresses().context("listing local interfaces")?;
    thread::Builder::new()
        .name("dns-journal".into())
        .spawn(move || journal.run())?;
    dns::spawn_localhost_refresher(dns.clone(), config.localhost_refresh(), shutdown.clone())?;

    let rules = Arc::new(RuleStore::new());
    let mut reconciler = RuleFileReconciler::new(
        rules.clone(),
        vec![config.rules_file.clone(), config.blocklist_file.clone()],
    );
    reconciler.poll();
    info!("{} rules in effect", rules.len());
    reconciler.spawn(config.poll_interval(), shutdown.clone())?;
    TempRuleWatcher::new(rules.clone(), config.temp_rules_file.clone())
        .spawn(config.poll_interval(), shutdown.clone())?;
    reaper::spawn(rules.clone(), REAP_INTERVAL, shutdown.clone())?;

    let (queue, handle) =
        NfQueue::open(config.queue_num).with_context(|| format!("opening netfilter queue {}", config.queue_num))?;
    let (prompt_sender, prompt_receiver) = bounded(config.prompt_queue_capacity);
    let pipeline = Arc::new(Pipeline::new(
        rules,
        dns,
        Arc::new(handle),
        ephemeral,
        prompt_sender,
    ));

    let prompter = SuPrompter::new(prompt_user, config.prompt_command.clone(), config.display.clone());
    PromptConsumer::new(prompt_receiver, pipeline.clone(), prompter, config.rules_file.clone()).spawn()?;

    let (packet_sender, packet_receiver) = bounded(config.workers.max(1) * PACKETS_PER_WORKER);
    pipeline::spawn_workers(config.workers, packet_receiver, pipeline)?;

    info!("listening on netfilter queue {}", config.queue_num);
    queue.run(packet_sender, &shutdown).context("netfilter queue")?;
    Ok(())
}
