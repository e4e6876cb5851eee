//! Asking the user about flows no rule covers, one prompt at a time.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::Receiver;
use dromi_interface::{subdomain_wildcard, Action, Flow, Lifetime, Port, PromptAnswer, Rule, RuleKey};
use log::{debug, error, info};

use crate::pipeline::Pipeline;
use crate::reconcile::append_rule;
use crate::rules::has_parent_domain;

pub trait Prompter {
    /// The prompt program's stdout.
    fn ask(&self, flow: &Flow) -> Result<String>;
}

/// Runs the prompt program through `su` as the desktop user.
pub struct SuPrompter {
    user: String,
    command: String,
    display: String,
}

impl SuPrompter {
    pub fn new(user: String, command: String, display: String) -> Self {
        SuPrompter { user, command, display }
    }
}

impl Prompter for SuPrompter {
    fn ask(&self, flow: &Flow) -> Result<String> {
        let script = format!("DISPLAY={} {} {}", self.display, self.command, flow.to_prompt_arg());
        let output = Command::new("su")
            .arg(&self.user)
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("running {} as {}", self.command, self.user))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("prompt output is not utf-8")
    }
}

pub struct PromptConsumer<P> {
    flows: Receiver<Flow>,
    pipeline: Arc<Pipeline>,
    prompter: P,
    rules_file: PathBuf,
}

impl<P: Prompter> PromptConsumer<P> {
    pub fn new(flows: Receiver<Flow>, pipeline: Arc<Pipeline>, prompter: P, rules_file: PathBuf) -> Self {
        PromptConsumer {
            flows,
            pipeline,
            prompter,
            rules_file,
        }
    }

    pub fn run(self) {
        for flow in self.flows.iter() {
            self.handle(flow);
        }
    }

    pub fn handle(&self, flow: Flow) {
        // an earlier answer may already cover it
        if let Some(rule) = self.pipeline.lookup(&flow) {
            debug!("{} decided while queued", flow);
            self.pipeline.finalize(&flow, rule.action);
            return;
        }
        let output = match self.prompter.ask(&flow) {
            Ok(output) => output,
            Err(e) => {
                error!("prompt for {}: {:#}", flow, e);
                self.pipeline.finalize(&flow, Action::Deny);
                return;
            }
        };
        match output.parse::<PromptAnswer>() {
            Ok(answer) => self.apply(flow, answer),
            Err(e) => {
                error!("bad prompt answer {:?}: {}", output.trim(), e);
                self.pipeline.finalize(&flow, Action::Deny);
            }
        }
    }

    fn apply(&self, flow: Flow, answer: PromptAnswer) {
        let mut target = flow.clone();
        if answer.reverse {
            target.flip();
        }
        let port = if answer.any_port { Port::Any } else { target.dst_port };
        // `*.example.com` would not cover `example.com` itself
        let address = if answer.subdomains && has_parent_domain(&target.dst) {
            subdomain_wildcard(&target.dst)
        } else {
            target.dst
        };
        let key = RuleKey::new(address, port, target.proto);
        let rule = match answer.lifetime {
            Lifetime::Once => {
                info!("{} once {}", answer.action, key);
                self.pipeline.finalize(&flow, answer.action);
                return;
            }
            Lifetime::Forever => Rule::permanent(key, answer.action),
            Lifetime::For(duration) => Rule::temporary(key, answer.action, duration, Utc::now()),
        };
        // on disk first, so a concurrent reload cannot prune it
        if rule.is_permanent() {
            if let Err(e) = append_rule(&self.rules_file, &rule) {
                error!("saving rule {} to {}: {}", rule, self.rules_file.display(), e);
            }
        }
        self.pipeline.rules().add(rule, true);
        self.pipeline.finalize(&flow, answer.action);
    }
}

impl<P: Prompter + Send + 'static> PromptConsumer<P> {
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name("prompt".into()).spawn(move || self.run())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::test::{fixture, Fixture, LOCAL};
    use crate::reconcile::RuleFileReconciler;
    use anyhow::anyhow;
    use dromi_interface::Proto;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::fs;
    use std::time::Duration;

    /// Replies from a script and remembers what it was asked.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        asked: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Self {
            Scripted {
                replies: Mutex::new(replies.into()),
                asked: Default::default(),
            }
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().clone()
        }
    }

    impl Prompter for &Scripted {
        fn ask(&self, flow: &Flow) -> Result<String> {
            self.asked.lock().push(flow.to_string());
            self.replies.lock().pop_front().unwrap_or_else(|| Err(anyhow!("no reply scripted")))
        }
    }

    fn ok(reply: &str) -> Result<String> {
        Ok(format!("{}\n", reply))
    }

    fn flow(id: u32, dst: [u8; 4], dport: u16) -> Flow {
        Flow::new(id, Proto::Tcp, LOCAL.into(), Port::Num(50000), dst.into(), Port::Num(dport))
    }

    fn consumer<'a>(f: &Fixture, prompter: &'a Scripted, rules_file: PathBuf) -> PromptConsumer<&'a Scripted> {
        PromptConsumer::new(f.prompts.clone(), f.pipeline.clone(), prompter, rules_file)
    }

    #[test]
    fn once_applies_to_a_single_flow() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![ok("once no allow no no"), ok("once no allow no no")]);
        let consumer = consumer(&f, &prompter, dir.path().join("rules"));

        f.pipeline.decide(flow(1, [198, 51, 100, 7], 8443));
        consumer.handle(f.prompts.try_recv().unwrap());
        assert_eq!(f.rules.len(), 0);

        f.pipeline.decide(flow(2, [198, 51, 100, 7], 8443));
        consumer.handle(f.prompts.try_recv().unwrap());
        assert_eq!(f.sink.verdicts(), vec![(1, Action::Allow), (2, Action::Allow)]);
        assert_eq!(prompter.asked().len(), 2);
        assert!(!dir.path().join("rules").exists());
    }

    #[test]
    fn forever_subdomain_deny_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let rules_file = dir.path().join("rules");
        let f = fixture(&[]);
        f.dns.update("api.example.com", [203, 0, 113, 9].into());
        let prompter = Scripted::new(vec![ok("forever yes deny no no")]);
        let consumer = consumer(&f, &prompter, rules_file.clone());

        f.pipeline.decide(flow(3, [203, 0, 113, 9], 443));
        consumer.handle(f.prompts.try_recv().unwrap());

        assert_eq!(f.sink.verdicts(), vec![(3, Action::Deny)]);
        assert_eq!(prompter.asked(), vec!["tcp localhost:50000 -> api.example.com:443"]);
        let key = RuleKey::new("*.example.com", Port::Num(443), Proto::Tcp);
        assert!(f.rules.get(&key).unwrap().is_permanent());
        assert_eq!(fs::read_to_string(&rules_file).unwrap(), "deny *.example.com 443 tcp\n");
    }

    #[test]
    fn temporary_any_port_rule_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let rules_file = dir.path().join("rules");
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![ok("2-hour no allow yes no")]);
        let consumer = consumer(&f, &prompter, rules_file.clone());

        f.pipeline.decide(flow(4, [198, 51, 100, 7], 8443));
        consumer.handle(f.prompts.try_recv().unwrap());

        let rule = f.rules.get(&RuleKey::new("198.51.100.7", Port::Any, Proto::Tcp)).unwrap();
        assert_eq!(rule.duration, Duration::from_secs(7200));
        assert_eq!(rule.action, Action::Allow);
        assert!(!rules_file.exists());
        assert_eq!(f.sink.verdicts(), vec![(4, Action::Allow)]);
    }

    #[test]
    fn reverse_builds_the_rule_for_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![ok("1-minute no deny no yes")]);
        let consumer = consumer(&f, &prompter, dir.path().join("rules"));

        let mut reply = Flow::new(5, Proto::Udp, [10, 0, 0, 7].into(), Port::Num(5000), [10, 0, 0, 8].into(), Port::Num(6000));
        f.pipeline.decide(reply.clone());
        consumer.handle(f.prompts.try_recv().unwrap());

        assert!(f.rules.get(&RuleKey::new("10.0.0.7", Port::Num(5000), Proto::Udp)).is_some());
        assert_eq!(f.sink.verdicts(), vec![(5, Action::Deny)]);
        // later replies match through the reversed lookup
        reply.id = 6;
        f.pipeline.decide(reply);
        assert_eq!(f.sink.verdicts()[1], (6, Action::Deny));
    }

    #[test]
    fn failures_deny_without_rules() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![
            Err(anyhow!("prompt exited with exit status: 1")),
            ok("once allow"),
            ok("sometimes no allow no no"),
            ok("forever maybe allow no no"),
        ]);
        let consumer = consumer(&f, &prompter, dir.path().join("rules"));
        for id in 1..=4 {
            f.pipeline.decide(flow(id, [198, 51, 100, 7], 8443));
            consumer.handle(f.prompts.try_recv().unwrap());
        }
        assert_eq!(
            f.sink.verdicts(),
            (1..=4).map(|id| (id, Action::Deny)).collect::<Vec<_>>()
        );
        assert_eq!(f.rules.len(), 0);
        assert!(!dir.path().join("rules").exists());
    }

    #[test]
    fn one_prompt_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![ok("forever no allow no no")]);
        let consumer = consumer(&f, &prompter, dir.path().join("rules"));

        for id in 1..=3 {
            f.pipeline.decide(flow(id, [198, 51, 100, 7], 8443));
        }
        assert_eq!(f.prompts.len(), 3);
        for _ in 0..3 {
            consumer.handle(f.prompts.try_recv().unwrap());
        }
        assert_eq!(prompter.asked().len(), 1);
        assert_eq!(
            f.sink.verdicts(),
            vec![(1, Action::Allow), (2, Action::Allow), (3, Action::Allow)]
        );
    }

    #[test]
    fn ip_destinations_are_not_widened() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&[]);
        let prompter = Scripted::new(vec![ok("forever yes allow no no")]);
        let consumer = consumer(&f, &prompter, dir.path().join("rules"));
        f.pipeline.decide(flow(1, [198, 51, 100, 7], 8443));
        consumer.handle(f.prompts.try_recv().unwrap());
        assert!(f.rules.get(&RuleKey::new("198.51.100.7", Port::Num(8443), Proto::Tcp)).is_some());
    }

    #[test]
    fn two_label_destinations_keep_their_name() {
        let dir = tempfile::tempdir().unwrap();
        let rules_file = dir.path().join("rules");
        let f = fixture(&[]);
        f.dns.update("example.com", [203, 0, 113, 9].into());
        let prompter = Scripted::new(vec![ok("forever yes deny no no")]);
        let consumer = consumer(&f, &prompter, rules_file.clone());

        f.pipeline.decide(flow(1, [203, 0, 113, 9], 443));
        consumer.handle(f.prompts.try_recv().unwrap());
        assert!(f.rules.get(&RuleKey::new("example.com", Port::Num(443), Proto::Tcp)).is_some());
        assert_eq!(fs::read_to_string(&rules_file).unwrap(), "deny example.com 443 tcp\n");

        // the next flow is covered without asking again
        f.pipeline.decide(flow(2, [203, 0, 113, 9], 443));
        assert!(f.prompts.is_empty());
        assert_eq!(f.sink.verdicts(), vec![(1, Action::Deny), (2, Action::Deny)]);
        assert_eq!(prompter.asked().len(), 1);
    }

    #[test]
    fn saved_rule_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let rules_file = dir.path().join("rules");
        let f = fixture(&[]);
        let mut reconciler = RuleFileReconciler::new(f.rules.clone(), vec![rules_file.clone()]);
        reconciler.reload();
        let prompter = Scripted::new(vec![ok("forever no allow no no")]);
        let consumer = consumer(&f, &prompter, rules_file);

        f.pipeline.decide(flow(1, [198, 51, 100, 7], 8443));
        consumer.handle(f.prompts.try_recv().unwrap());
        reconciler.reload();

        let rule = f.rules.get(&RuleKey::new("198.51.100.7", Port::Num(8443), Proto::Tcp)).unwrap();
        assert!(rule.is_permanent());
    }
}
