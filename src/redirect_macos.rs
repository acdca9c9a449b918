//! pf-based redirection for macos hosts.
//!
//! The primary interface is resolved once at install time and recorded in
//! the snapshot. If the default route moves to another interface during the
//! run, redirection does not follow it; the coordinator warns about this at
//! start.

use crate::error::SupervisorError;
use crate::redirect::{run_admin, stderr_snippet, RedirectSpec, Redirector};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_RESOLVER: &str = "# temporary resolver installed by torflock\nnameserver 1.1.1.1\n";

struct PfSnapshot {
    was_enabled: bool,
    ruleset: String,
    /// `None` when /etc/resolv.conf did not exist before the run.
    resolv_conf: Option<Vec<u8>>,
    interface: String,
}

pub struct PfRedirector {
    pfctl: PathBuf,
    route: PathBuf,
    snapshot: Option<PfSnapshot>,
}

impl PfRedirector {
    pub fn new(pfctl: PathBuf, route: PathBuf) -> Self {
        Self {
            pfctl,
            route,
            snapshot: None,
        }
    }

    async fn pfctl(&self, args: &[&str]) -> Result<std::process::Output, String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        run_admin(&self.pfctl, &args).await
    }

    async fn default_interface(&self) -> Result<String, SupervisorError> {
        let args: Vec<String> = ["-n", "get", "default"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = run_admin(&self.route, &args)
            .await
            .map_err(SupervisorError::RedirectInstallFailed)?;
        if !output.status.success() {
            return Err(SupervisorError::RedirectInstallFailed(format!(
                "no default route: {}",
                stderr_snippet(&output)
            )));
        }
        parse_default_interface(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            SupervisorError::RedirectInstallFailed("default route has no interface".into())
        })
    }

    async fn pf_enabled(&self) -> Result<bool, SupervisorError> {
        let output = self
            .pfctl(&["-s", "info"])
            .await
            .map_err(SupervisorError::RedirectInstallFailed)?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("Status: Enabled"))
    }

    async fn current_ruleset(&self) -> Result<String, SupervisorError> {
        let output = self
            .pfctl(&["-sr"])
            .await
            .map_err(SupervisorError::RedirectInstallFailed)?;
        if !output.status.success() {
            return Err(SupervisorError::RedirectInstallFailed(format!(
                "ruleset listing failed: {}",
                stderr_snippet(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn load_ruleset_file(&self, path: &Path) -> Result<(), String> {
        let path = path.display().to_string();
        let output = self.pfctl(&["-f", &path]).await?;
        if !output.status.success() {
            return Err(format!("pfctl -f failed: {}", stderr_snippet(&output)));
        }
        Ok(())
    }

    /// Reload the snapshot ruleset from a transient file; the snapshot
    /// itself lives only in memory.
    async fn reload_snapshot_ruleset(
        &self,
        run_root: &Path,
        ruleset: &str,
    ) -> Result<(), String> {
        let path = run_root.join("pf.previous.rules");
        std::fs::write(&path, ruleset).map_err(|err| err.to_string())?;
        let result = self.load_ruleset_file(&path).await;
        let _ = std::fs::remove_file(&path);
        result
    }

    async fn rollback_pf(&self, was_enabled: bool, run_root: &Path, ruleset: &str) {
        if !was_enabled {
            if let Err(err) = self.pfctl(&["-d"]).await {
                warn!(target: "redirect", error = %err, "pf disable during rollback failed");
            }
        }
        if let Err(err) = self.reload_snapshot_ruleset(run_root, ruleset).await {
            warn!(target: "redirect", error = %err, "pf ruleset rollback failed");
        }
    }
}

#[async_trait]
impl Redirector for PfRedirector {
    async fn install(&mut self, spec: &RedirectSpec) -> Result<(), SupervisorError> {
        if self.snapshot.is_some() {
            return Err(SupervisorError::AlreadyActive);
        }

        // Snapshot everything before the first mutation.
        let interface = self.default_interface().await?;
        let was_enabled = self.pf_enabled().await?;
        let ruleset = self.current_ruleset().await?;
        let resolv_conf = std::fs::read(RESOLV_CONF).ok();

        let rules_path = spec.run_root.join("pf.rules");
        std::fs::write(&rules_path, pf_rules(spec, &interface))?;
        std::fs::set_permissions(&rules_path, std::fs::Permissions::from_mode(0o600))?;

        if let Err(detail) = self.load_ruleset_file(&rules_path).await {
            // The load may have replaced the ruleset before failing.
            self.rollback_pf(was_enabled, &spec.run_root, &ruleset).await;
            return Err(SupervisorError::RedirectInstallFailed(detail));
        }
        match self.pfctl(&["-E"]).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let detail = format!("pfctl -E failed: {}", stderr_snippet(&output));
                self.rollback_pf(was_enabled, &spec.run_root, &ruleset).await;
                return Err(SupervisorError::RedirectInstallFailed(detail));
            }
            Err(detail) => {
                self.rollback_pf(was_enabled, &spec.run_root, &ruleset).await;
                return Err(SupervisorError::RedirectInstallFailed(detail));
            }
        }

        // Rules and resolver substitution are one atomic unit.
        if let Err(err) = replace_file_atomically(RESOLV_CONF, FALLBACK_RESOLVER.as_bytes()) {
            self.rollback_pf(was_enabled, &spec.run_root, &ruleset).await;
            return Err(SupervisorError::RedirectInstallFailed(format!(
                "resolver substitution failed: {}",
                err
            )));
        }

        info!(
            target: "redirect",
            interface = %interface,
            lb_port = spec.lb_front_port,
            "pf redirection installed"
        );
        warn!(
            target: "redirect",
            interface = %interface,
            "interface pinned for this run; switching networks bypasses redirection"
        );
        self.snapshot = Some(PfSnapshot {
            was_enabled,
            ruleset,
            resolv_conf,
            interface,
        });
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), SupervisorError> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        let mut failure: Option<(&'static str, String)> = None;

        match &snapshot.resolv_conf {
            Some(bytes) => {
                if let Err(err) = replace_file_atomically(RESOLV_CONF, bytes) {
                    failure = Some(("resolv-conf", err.to_string()));
                }
            }
            None => {
                let _ = std::fs::remove_file(RESOLV_CONF);
            }
        }

        if snapshot.was_enabled {
            let run_root = std::env::temp_dir();
            if let Err(err) = self
                .reload_snapshot_ruleset(&run_root, &snapshot.ruleset)
                .await
            {
                failure.get_or_insert(("pf-reload", err));
            }
        } else {
            match self.pfctl(&["-d"]).await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    failure.get_or_insert(("pf-disable", stderr_snippet(&output)));
                }
                Err(err) => {
                    failure.get_or_insert(("pf-disable", err));
                }
            }
        }

        match failure {
            None => {
                info!(target: "redirect", interface = %snapshot.interface, "stop ok");
                Ok(())
            }
            Some((stage, detail)) => {
                // Keep the snapshot so a retry can still restore.
                self.snapshot = Some(snapshot);
                Err(SupervisorError::RestoreFailed {
                    stage,
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
            self.pfctl(&["-s", "info"]).await,
            Ok(output) if output.status.success()
        )
    }

    fn cleanup_hints(&self) -> Vec<String> {
        let bin = self.pfctl.display();
        vec![
            format!("{} -s info", bin),
            format!("{} -sr", bin),
            format!("{} -d", bin),
            format!("cat {}", RESOLV_CONF),
        ]
    }
}

fn pf_rules(spec: &RedirectSpec, interface: &str) -> String {
    format!(
        "# torflock transparent redirection\n\
         rdr pass on {iface} inet proto tcp from any to any -> 127.0.0.1 port {lb}\n\
         rdr pass on {iface} inet proto udp from any to any port 53 -> 127.0.0.1 port {dns}\n",
        iface = interface,
        lb = spec.lb_front_port,
        dns = spec.dns_port,
    )
}

fn parse_default_interface(route_output: &str) -> Option<String> {
    route_output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("interface:"))
        .map(|rest| rest.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Write-then-rename so concurrent readers always see a complete file.
fn replace_file_atomically(path: &str, contents: &[u8]) -> std::io::Result<()> {
    let staged = format!("{}.torflock", path);
    std::fs::write(&staged, contents)?;
    std::fs::rename(&staged, path)
}

#[cfg(test)]
mod tests {
    use super::{parse_default_interface, pf_rules};
    use crate::redirect::RedirectSpec;
    use std::path::PathBuf;

    fn spec() -> RedirectSpec {
        RedirectSpec {
            lb_front_port: 16379,
            dns_port: 9902,
            run_root: PathBuf::from("/tmp/torflock-test"),
        }
    }

    #[test]
    fn rules_pin_the_given_interface() {
        let rules = pf_rules(&spec(), "en0");
        assert!(rules.contains("on en0 inet proto tcp"));
        assert!(rules.contains("port 16379"));
        assert!(rules.contains("port 53 -> 127.0.0.1 port 9902"));
    }

    #[test]
    fn route_output_parses_to_an_interface() {
        let output = "   route to: default\ndestination: default\n  interface: en0\n";
        assert_eq!(parse_default_interface(output), Some("en0".to_string()));
        assert_eq!(parse_default_interface("no interface line"), None);
    }
}
