//! Rule files on disk. Permanent rules follow the rule and block-list files;
//! temporary rules are dropped into a separate file by other programs.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use dromi_interface::{Rule, RuleKey};
use log::{error, info, warn};

use crate::rules::RuleStore;

/// Rule text on a line, without its `#` comment.
fn rule_text(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}

/// Appends a permanent rule to `path`, creating it if needed.
pub fn append_rule(path: &Path, rule: &Rule) -> io::Result<()> {
    let mut f = OpenOptions::new().append(true).create(true).open(path)?;
    writeln!(f, "{}", rule)?;
    f.sync_data()
}

/// Keeps the permanent rules in a [`RuleStore`] equal to the union of its
/// rule files, re-reading them whenever one's mtime changes.
pub struct RuleFileReconciler {
    rules: Arc<RuleStore>,
    files: Vec<PathBuf>,
    mtimes: HashMap<PathBuf, Option<SystemTime>>,
    loaded: bool,
}

impl RuleFileReconciler {
    pub fn new(rules: Arc<RuleStore>, files: Vec<PathBuf>) -> Self {
        RuleFileReconciler {
            rules,
            files,
            mtimes: HashMap::new(),
            loaded: false,
        }
    }

    /// Reloads when any file changed since the last poll. The first poll
    /// always loads.
    pub fn poll(&mut self) -> bool {
        let mut changed = !self.loaded;
        for file in &self.files {
            let mtime = fs::metadata(file).and_then(|m| m.modified()).ok();
            if self.mtimes.insert(file.clone(), mtime) != Some(mtime) {
                changed = true;
            }
        }
        if changed {
            self.reload();
        }
        changed
    }

    /// Adds every rule in the files, then drops permanent rules none of them
    /// mention. Nothing is dropped when a file could not be read.
    pub fn reload(&mut self) {
        let mut on_disk = HashSet::new();
        let mut complete = true;
        for file in &self.files {
            match self.load_file(file, &mut on_disk) {
                Ok(n) if !self.loaded => info!("loaded {} rules from {}", n, file.display()),
                Ok(_) => (),
                Err(e) => {
                    error!("reading {}: {}", file.display(), e);
                    complete = false;
                }
            }
        }
        if complete {
            self.rules.reconcile_permanent(&on_disk);
        }
        self.loaded = true;
    }

    fn load_file(&self, path: &Path, on_disk: &mut HashSet<RuleKey>) -> io::Result<usize> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(path)?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let mut n = 0;
        for (i, line) in content.lines().enumerate() {
            let text = rule_text(line);
            if text.is_empty() {
                continue;
            }
            match text.parse::<Rule>() {
                Ok(rule) => {
                    on_disk.insert(rule.key.clone());
                    self.rules.add(rule, self.loaded);
                    n += 1;
                }
                Err(e) => warn!("{}:{}: {}", path.display(), i + 1, e),
            }
        }
        Ok(n)
    }

    pub fn spawn(mut self, interval: Duration, shutdown: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("rule-files".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    self.poll();
                }
            })
    }
}

/// Picks up `<amount>-<minute|hour> <rule>` lines written to a well-known
/// path. The file is renamed away before reading so a writer replacing it
/// concurrently never loses lines.
pub struct TempRuleWatcher {
    rules: Arc<RuleStore>,
    path: PathBuf,
    claimed: PathBuf,
}

impl TempRuleWatcher {
    pub fn new(rules: Arc<RuleStore>, path: PathBuf) -> Self {
        let mut claimed = path.clone().into_os_string();
        claimed.push(format!(".{}.claimed", std::process::id()));
        TempRuleWatcher {
            rules,
            path,
            claimed: claimed.into(),
        }
    }

    /// Number of rules taken in. A missing file means nothing to do.
    pub fn poll(&self) -> io::Result<usize> {
        match fs::rename(&self.path, &self.claimed) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        }
        let content = match fs::read_to_string(&self.claimed) {
            Ok(content) => content,
            Err(e) => {
                // a claimed file is never retried
                let _ = fs::remove_file(&self.claimed);
                return Err(e);
            }
        };
        let now = Utc::now();
        let mut n = 0;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Rule::parse_temporary(line, now) {
                Ok(rule) => {
                    self.rules.add(rule, true);
                    n += 1;
                }
                Err(e) => warn!("{}: {}", self.path.display(), e),
            }
        }
        fs::remove_file(&self.claimed)?;
        Ok(n)
    }

    pub fn spawn(self, interval: Duration, shutdown: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("temp-rules".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    if let Err(e) = self.poll() {
                        error!("reading {}: {}", self.path.display(), e);
                    }
                    thread::sleep(interval);
                }
            })
    }
}
