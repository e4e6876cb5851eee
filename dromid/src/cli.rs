use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

/// dromid: asks before any program on this host talks to a new destination.
#[derive(Parser, Debug, Clone)]
#[command(name = "dromid", version, about, long_about = None)]
pub struct Cli {
    /// Directory holding config.json and, unless it says otherwise, the rule
    /// files. Defaults to $DROMID_CONFIG_DIR, then /etc/dromid.
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Netfilter queue number the iptables NFQUEUE rules send packets to.
    #[arg(short = 'q', long = "queue-num", value_name = "N")]
    pub queue_num: Option<u16>,

    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,
}

impl Cli {
    /// Flags given on the command line win over the file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.queue_num {
            config.queue_num = n;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
    }
}
