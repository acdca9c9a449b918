//! Transparent-redirection control, dispatched on the host OS.
//!
//! The one genuinely polymorphic seam in the supervisor: every platform
//! implements install/restore/probe over its own packet-filter admin tool,
//! and the coordinator only ever sees the trait.

use crate::error::SupervisorError;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ADMIN_CMD_DEADLINE: Duration = Duration::from_secs(10);

/// What the redirector needs to know about the running chain.
#[derive(Debug, Clone)]
pub struct RedirectSpec {
    /// Target for outbound TCP.
    pub lb_front_port: u16,
    /// Target for UDP destined to port 53.
    pub dns_port: u16,
    /// Where rule files may be written.
    pub run_root: PathBuf,
}

#[async_trait]
pub trait Redirector: Send {
    /// Capture the pre-change host state, then install redirection rules.
    /// Rule installation and resolver substitution are one atomic unit; a
    /// second install without an intervening restore is `AlreadyActive`.
    async fn install(&mut self, spec: &RedirectSpec) -> Result<(), SupervisorError>;

    /// Put the host back exactly as found. Without a snapshot this is a
    /// successful no-op, so stop is idempotent.
    async fn restore(&mut self) -> Result<(), SupervisorError>;

    fn active(&self) -> bool;

    /// Cheap capability check: can the packet-filter admin tool be driven
    /// at all? Used by preflight, never mutates.
    async fn probe(&self) -> bool;

    /// Commands an operator can run by hand after a failed restore.
    fn cleanup_hints(&self) -> Vec<String>;
}

pub fn for_current_platform(
    packet_filter: PathBuf,
    route: Option<PathBuf>,
) -> Result<Box<dyn Redirector>, SupervisorError> {
    #[cfg(target_os = "linux")]
    {
        let _ = route;
        Ok(Box::new(crate::redirect_linux::IptablesRedirector::new(
            packet_filter,
        )))
    }
    #[cfg(target_os = "macos")]
    {
        let route = route.ok_or_else(|| SupervisorError::MissingBinary("route".into()))?;
        Ok(Box::new(crate::redirect_macos::PfRedirector::new(
            packet_filter,
            route,
        )))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (packet_filter, route);
        Err(SupervisorError::InvalidConfig(
            "transparent redirection is not supported on this platform".into(),
        ))
    }
}

/// Loopback plus the private ranges that must keep flowing directly.
pub fn excluded_networks() -> Vec<Ipv4Net> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
    ]
    .iter()
    .map(|net| net.parse().expect("static prefix parses"))
    .collect()
}

/// Run a packet-filter admin command with a bounded deadline, capturing
/// output. Callers decide what a non-zero exit means.
pub(crate) async fn run_admin(
    bin: &Path,
    args: &[String],
) -> Result<std::process::Output, String> {
    let result = tokio::time::timeout(
        ADMIN_CMD_DEADLINE,
        tokio::process::Command::new(bin)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(format!("{} failed to run: {}", bin.display(), err)),
        Err(_) => Err(format!("{} timed out", bin.display())),
    }
}

pub(crate) fn stderr_snippet(output: &std::process::Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        format!("exit status {}", output.status)
    } else {
        trimmed.chars().take(200).collect()
    }
}
