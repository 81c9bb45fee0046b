//! Firewall/NAT rule sets installed and removed as a unit.

use px_common::{Error, Result, TeardownError};
use tokio::process::Command;
use tracing::{info, warn};

use crate::iface::Interface;

/// An iptables rule as an ordered list of (option, value) pairs.
///
/// Only append rules are supported: the matching delete invocation is derived
/// by swapping `--append` for `--delete`, which holds for every rule this
/// tool installs.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    options: Vec<(String, String)>,
}

impl Rule {
    pub fn new<K, V>(options: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            options: options
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_append(&self) -> bool {
        self.options.iter().any(|(k, _)| k == "append")
    }

    /// Arguments for the iptables call that adds the rule.
    /// Snake_cased option names are rendered with the dashes iptables takes.
    pub fn add_args(&self) -> Vec<String> {
        self.args_with("append")
    }

    /// Arguments for the call that deletes the rule again.
    pub fn delete_args(&self) -> Vec<String> {
        self.args_with("delete")
    }

    fn args_with(&self, action: &str) -> Vec<String> {
        self.options
            .iter()
            .flat_map(|(key, value)| {
                let key = if key == "append" { action } else { key.as_str() };
                [format!("--{}", key.replace('_', "-")), value.clone()]
            })
            .collect()
    }

    pub fn describe(&self) -> String {
        self.add_args().join(" ")
    }
}

/// Executes rule add/delete invocations. The production implementation shells
/// out to iptables; tests substitute a recording fake.
pub trait RuleRunner {
    #[allow(async_fn_in_trait)]
    async fn run(&mut self, args: &[String]) -> Result<()>;
}

/// Runs rules through the host's iptables binary.
#[derive(Debug, Default)]
pub struct Iptables;

impl RuleRunner for Iptables {
    async fn run(&mut self, args: &[String]) -> Result<()> {
        info!("iptables {}", args.join(" "));
        let output = Command::new("iptables").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("File exists") || stderr.contains("already exists") {
                return Err(Error::AlreadyExists(format!("rule {}", args.join(" "))));
            }
            return Err(Error::RuleApplication(format!(
                "iptables {} failed: {stderr}",
                args.join(" ")
            )));
        }
        Ok(())
    }
}

/// An ordered set of applied rules, removed in reverse order on release.
#[derive(Debug)]
pub struct RuleSet<R: RuleRunner = Iptables> {
    runner: R,
    applied: Vec<Rule>,
}

impl RuleSet<Iptables> {
    /// Applies each rule's add action in order.
    ///
    /// If any add fails, the previously applied adds are reversed before the
    /// failure is propagated; no partial rule set survives.
    pub async fn apply(rules: Vec<Rule>) -> Result<Self> {
        Self::apply_with(rules, Iptables).await
    }
}

impl<R: RuleRunner> RuleSet<R> {
    pub async fn apply_with(rules: Vec<Rule>, mut runner: R) -> Result<Self> {
        let mut applied: Vec<Rule> = Vec::with_capacity(rules.len());
        for rule in rules {
            if !rule.is_append() {
                return Err(Error::RuleApplication(format!(
                    "non-append rules are not supported: {}",
                    rule.describe()
                )));
            }
            match runner.run(&rule.add_args()).await {
                Ok(()) => applied.push(rule),
                Err(Error::AlreadyExists(what)) => {
                    // Idempotent success; the rule still belongs to this set.
                    info!("{what}, keeping it");
                    applied.push(rule);
                }
                Err(e) => {
                    for done in applied.iter().rev() {
                        if let Err(undo) = runner.run(&done.delete_args()).await {
                            warn!("rollback of [{}] failed: {undo}", done.describe());
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { runner, applied })
    }

    /// Invokes every applied rule's delete action in strict reverse order,
    /// continuing through failures and aggregating them.
    pub async fn release(mut self) -> Result<()> {
        let mut failures = Vec::new();
        for rule in self.applied.iter().rev() {
            if let Err(e) = self.runner.run(&rule.delete_args()).await {
                failures.push((format!("rule [{}]", rule.describe()), e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError::new(failures).into())
        }
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// The rule set for crude masquerading through the uplink interface, so that
/// netboot clients have an internet connection during the install.
pub fn masquerade_rules(uplink: &Interface) -> Vec<Rule> {
    vec![
        Rule::new([
            ("append", "FORWARD"),
            ("out_interface", uplink.name.as_str()),
            ("jump", "ACCEPT"),
        ]),
        Rule::new([
            ("append", "FORWARD"),
            ("in_interface", uplink.name.as_str()),
            ("jump", "ACCEPT"),
        ]),
        Rule::new([
            ("table", "nat"),
            ("append", "POSTROUTING"),
            ("out_interface", uplink.name.as_str()),
            ("jump", "MASQUERADE"),
        ]),
    ]
}
