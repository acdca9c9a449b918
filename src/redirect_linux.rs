//! iptables NAT-table redirection for linux hosts.

use crate::error::SupervisorError;
use crate::redirect::{excluded_networks, run_admin, stderr_snippet, RedirectSpec, Redirector};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{info, warn};

/// Every rule we add carries this comment so leftovers are identifiable.
const SENTINEL: &str = "torflock";

pub struct IptablesRedirector {
    iptables: PathBuf,
    /// `iptables -t nat -S` listing captured before our first mutation.
    snapshot: Option<Vec<String>>,
}

impl IptablesRedirector {
    pub fn new(iptables: PathBuf) -> Self {
        Self {
            iptables,
            snapshot: None,
        }
    }

    async fn nat(&self, args: Vec<String>) -> Result<std::process::Output, String> {
        let mut full = vec!["-t".to_string(), "nat".to_string()];
        full.extend(args);
        run_admin(&self.iptables, &full).await
    }

    async fn capture_nat_listing(&self) -> Result<Vec<String>, SupervisorError> {
        let output = self
            .nat(vec!["-S".to_string()])
            .await
            .map_err(SupervisorError::RedirectInstallFailed)?;
        if !output.status.success() {
            return Err(SupervisorError::RedirectInstallFailed(format!(
                "nat listing failed: {}",
                stderr_snippet(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Flush the NAT table and replay a previously captured listing.
    async fn flush_and_replay(&self, listing: &[String]) -> Result<(), String> {
        let flush = self.nat(vec!["-F".to_string()]).await?;
        if !flush.status.success() {
            return Err(format!("nat flush failed: {}", stderr_snippet(&flush)));
        }
        for line in listing {
            let Some(args) = replay_args(line) else {
                continue;
            };
            let recreate_chain = args.first().map(String::as_str) == Some("-N");
            let output = self.nat(args).await?;
            if !output.status.success() {
                // A chain that survived the flush is fine; anything else is not.
                if recreate_chain {
                    continue;
                }
                return Err(format!(
                    "replaying `{}` failed: {}",
                    line,
                    stderr_snippet(&output)
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Redirector for IptablesRedirector {
    async fn install(&mut self, spec: &RedirectSpec) -> Result<(), SupervisorError> {
        if self.snapshot.is_some() {
            return Err(SupervisorError::AlreadyActive);
        }
        let listing = self.capture_nat_listing().await?;

        for rule in install_rules(spec) {
            let output = self
                .nat(rule.clone())
                .await
                .map_err(SupervisorError::RedirectInstallFailed)?;
            if !output.status.success() {
                let detail = format!(
                    "rule `{}` rejected: {}",
                    rule.join(" "),
                    stderr_snippet(&output)
                );
                // Undo the partial install before surfacing.
                if let Err(undo_err) = self.flush_and_replay(&listing).await {
                    warn!(target: "redirect", error = %undo_err, "undo after failed install also failed");
                }
                return Err(SupervisorError::RedirectInstallFailed(detail));
            }
        }

        self.snapshot = Some(listing);
        info!(
            target: "redirect",
            lb_port = spec.lb_front_port,
            dns_port = spec.dns_port,
            run_root = %spec.run_root.display(),
            "nat redirection installed"
        );
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), SupervisorError> {
        let Some(listing) = self.snapshot.clone() else {
            return Ok(());
        };
        match self.flush_and_replay(&listing).await {
            Ok(()) => {
                self.snapshot = None;
                info!(target: "redirect", "stop ok");
                Ok(())
            }
            Err(detail) => {
                // Leave the table flushed rather than half-replayed: a
                // flushed table carries no redirect rules.
                if let Err(flush_err) = self.nat(vec!["-F".to_string()]).await {
                    warn!(target: "redirect", error = %flush_err, "post-failure flush also failed");
                }
                Err(SupervisorError::RestoreFailed {
                    stage: "nat-replay",
                    detail,
                    hints: self.cleanup_hints(),
                })
            }
        }
    }

    fn active(&self) -> bool {
        self.snapshot.is_some()
    }

    async fn probe(&self) -> bool {
        matches!(
            self.nat(vec!["-S".to_string()]).await,
            Ok(output) if output.status.success()
        )
    }

    fn cleanup_hints(&self) -> Vec<String> {
        let bin = self.iptables.display();
        vec![
            format!("{} -t nat -S | grep {}", bin, SENTINEL),
            format!("{} -t nat -F", bin),
        ]
    }
}

/// The rule set, as argument vectors for `iptables -t nat`.
fn install_rules(spec: &RedirectSpec) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    let tag = |mut rule: Vec<String>| -> Vec<String> {
        rule.extend(
            ["-m", "comment", "--comment", SENTINEL]
                .iter()
                .map(|s| s.to_string()),
        );
        rule
    };

    // Loopback stays local.
    let mut lo: Vec<String> = ["-A", "OUTPUT", "-o", "lo"].iter().map(|s| s.to_string()).collect();
    lo = tag(lo);
    lo.extend(["-j", "RETURN"].iter().map(|s| s.to_string()));
    rules.push(lo);

    // Private ranges are never steered into the chain.
    for net in excluded_networks() {
        let mut rule: Vec<String> = ["-A", "OUTPUT", "-d"].iter().map(|s| s.to_string()).collect();
        rule.push(net.to_string());
        rule = tag(rule);
        rule.extend(["-j", "RETURN"].iter().map(|s| s.to_string()));
        rules.push(rule);
    }

    // New outbound TCP connections land on the load balancer.
    let mut tcp: Vec<String> = ["-A", "OUTPUT", "-p", "tcp", "--syn"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    tcp = tag(tcp);
    tcp.extend(
        ["-j", "REDIRECT", "--to-ports"]
            .iter()
            .map(|s| s.to_string()),
    );
    tcp.push(spec.lb_front_port.to_string());
    rules.push(tcp);

    // DNS goes to the dns-role instance.
    let mut dns: Vec<String> = ["-A", "OUTPUT", "-p", "udp", "--dport", "53"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    dns = tag(dns);
    dns.extend(
        ["-j", "REDIRECT", "--to-ports"]
            .iter()
            .map(|s| s.to_string()),
    );
    dns.push(spec.dns_port.to_string());
    rules.push(dns);

    rules
}

/// Turn one `iptables -S` line back into arguments for reapplication.
/// Policy, chain-creation and append lines are replayed; anything else
/// (comments, empty lines) is skipped.
fn replay_args(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if !(trimmed.starts_with("-P ") || trimmed.starts_with("-N ") || trimmed.starts_with("-A ")) {
        return None;
    }
    Some(shell_split(trimmed))
}

/// `-S` output quotes arguments that contain whitespace (comments do).
fn shell_split(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in line.chars() {
        match ch {
            '"' => quoted = !quoted,
            ' ' if !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
