use crate::error::SupervisorError;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INSTANCES: usize = 2;
pub const DEFAULT_SOCKS_BASE_PORT: u16 = 9000;
pub const DEFAULT_CONTROL_BASE_PORT: u16 = 9900;
pub const DEFAULT_LB_FRONT_PORT: u16 = 16379;
pub const DEFAULT_FILTER_LISTEN_PORT: u16 = 8119;
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_GRACE_SECS: u64 = 10;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_START_DEADLINE_SECS: u64 = 180;
pub const DEFAULT_STOP_DEADLINE_SECS: u64 = 60;

/// Everything the supervisor needs for one run. Immutable once validated.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub instances: usize,
    pub socks_base_port: u16,
    pub control_base_port: u16,
    pub lb_front_port: u16,
    /// 0 disables the HTTP filter entirely.
    pub filter_listen_port: u16,
    /// Effective user for the onion-router children; `None` means the invoker.
    pub user: Option<String>,
    pub bootstrap_timeout: Duration,
    pub health_interval: Duration,
    pub grace: Duration,
    pub probe_timeout: Duration,
    pub start_deadline: Duration,
    pub stop_deadline: Duration,
    pub templates_dir: PathBuf,
    pub run_dir: PathBuf,
    pub binaries: BinaryConfig,
}

#[derive(Debug, Clone)]
pub struct BinaryConfig {
    pub tor: PathBuf,
    pub haproxy: PathBuf,
    pub privoxy: Option<PathBuf>,
    /// iptables on linux, pfctl on macos.
    pub packet_filter: PathBuf,
    /// Used on macos to resolve the default-route interface.
    pub route: Option<PathBuf>,
}

/// Binary paths after resolution: absolute and executable, checked once at
/// startup so later stages never fail on a missing program mid-mutation.
#[derive(Debug, Clone)]
pub struct ResolvedBinaries {
    pub tor: PathBuf,
    pub haproxy: PathBuf,
    pub privoxy: Option<PathBuf>,
    pub packet_filter: PathBuf,
    pub route: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn filter_enabled(&self) -> bool {
        self.filter_listen_port != 0
    }

    /// Start must return within max(bootstrapTimeout + 30 s, configured deadline).
    pub fn effective_start_deadline(&self) -> Duration {
        self.start_deadline
            .max(self.bootstrap_timeout + Duration::from_secs(30))
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.instances == 0 {
            return Err(SupervisorError::InvalidConfig(
                "instances must be at least 1".into(),
            ));
        }
        if self.socks_base_port == 0 || self.control_base_port == 0 || self.lb_front_port == 0 {
            return Err(SupervisorError::InvalidConfig(
                "socks, control and load-balancer ports must be non-zero".into(),
            ));
        }
        if self.filter_enabled() && self.filter_listen_port == self.lb_front_port {
            return Err(SupervisorError::InvalidConfig(format!(
                "filter port and load-balancer port both set to {}",
                self.lb_front_port
            )));
        }
        if self.templates_dir.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "templates directory is required".into(),
            ));
        }
        if self.run_dir.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "run directory is required".into(),
            ));
        }
        for (name, value) in [
            ("bootstrap-timeout", self.bootstrap_timeout),
            ("health-interval", self.health_interval),
            ("grace", self.grace),
            ("probe-timeout", self.probe_timeout),
            ("start-deadline", self.start_deadline),
            ("stop-deadline", self.stop_deadline),
        ] {
            if value.is_zero() {
                return Err(SupervisorError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl BinaryConfig {
    /// Resolve every required binary to an absolute, executable path.
    /// The filter binary is only required when the filter is enabled, and
    /// `route` only on macos where the redirector pins the default interface.
    pub fn resolve(&self, filter_enabled: bool) -> Result<ResolvedBinaries, SupervisorError> {
        let privoxy = if filter_enabled {
            let path = self
                .privoxy
                .as_ref()
                .ok_or_else(|| SupervisorError::MissingBinary("privoxy".into()))?;
            Some(resolve_one("privoxy", path)?)
        } else {
            None
        };
        let route = if cfg!(target_os = "macos") {
            let path = self
                .route
                .as_ref()
                .ok_or_else(|| SupervisorError::MissingBinary("route".into()))?;
            Some(resolve_one("route", path)?)
        } else {
            None
        };
        Ok(ResolvedBinaries {
            tor: resolve_one("tor", &self.tor)?,
            haproxy: resolve_one("haproxy", &self.haproxy)?,
            privoxy,
            packet_filter: resolve_one(
                if cfg!(target_os = "macos") { "pfctl" } else { "iptables" },
                &self.packet_filter,
            )?,
            route,
        })
    }
}

fn resolve_one(name: &str, path: &Path) -> Result<PathBuf, SupervisorError> {
    let absolute = std::fs::canonicalize(path)
        .map_err(|_| SupervisorError::MissingBinary(name.to_string()))?;
    if !is_executable(&absolute) {
        return Err(SupervisorError::MissingBinary(name.to_string()));
    }
    Ok(absolute)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_config() -> SupervisorConfig {
        SupervisorConfig {
            instances: DEFAULT_INSTANCES,
            socks_base_port: DEFAULT_SOCKS_BASE_PORT,
            control_base_port: DEFAULT_CONTROL_BASE_PORT,
            lb_front_port: DEFAULT_LB_FRONT_PORT,
            filter_listen_port: DEFAULT_FILTER_LISTEN_PORT,
            user: None,
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            grace: Duration::from_secs(DEFAULT_GRACE_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            start_deadline: Duration::from_secs(DEFAULT_START_DEADLINE_SECS),
            stop_deadline: Duration::from_secs(DEFAULT_STOP_DEADLINE_SECS),
            templates_dir: "/etc/torflock/templates".into(),
            run_dir: "/run/torflock".into(),
            binaries: BinaryConfig {
                tor: "/usr/bin/tor".into(),
                haproxy: "/usr/sbin/haproxy".into(),
                privoxy: Some("/usr/sbin/privoxy".into()),
                packet_filter: "/usr/sbin/iptables".into(),
                route: None,
            },
        }
    }

    #[test]
    fn default_config_validates() {
        base_config().validate().expect("defaults should be valid");
    }

    #[test]
    fn zero_instances_is_rejected() {
        let mut cfg = base_config();
        cfg.instances = 0;
        let err = cfg.validate().expect_err("zero instances must fail");
        assert!(format!("{}", err).contains("instances"));
    }

    #[test]
    fn colliding_explicit_ports_are_rejected() {
        let mut cfg = base_config();
        cfg.filter_listen_port = cfg.lb_front_port;
        let err = cfg.validate().expect_err("port collision must fail");
        assert!(err.is_precondition());
    }

    #[test]
    fn filter_port_zero_disables_the_filter() {
        let mut cfg = base_config();
        cfg.filter_listen_port = 0;
        assert!(!cfg.filter_enabled());
        cfg.validate().expect("disabled filter is valid");
    }

    #[test]
    fn start_deadline_stretches_with_long_bootstrap() {
        let mut cfg = base_config();
        cfg.bootstrap_timeout = Duration::from_secs(300);
        assert_eq!(
            cfg.effective_start_deadline(),
            Duration::from_secs(330),
            "deadline must cover bootstrap plus margin"
        );
    }

    #[test]
    fn missing_binary_is_a_precondition_error() {
        let binaries = BinaryConfig {
            tor: "/nonexistent/torflock-test/tor".into(),
            haproxy: "/nonexistent/torflock-test/haproxy".into(),
            privoxy: None,
            packet_filter: "/nonexistent/torflock-test/iptables".into(),
            route: None,
        };
        let err = binaries
            .resolve(false)
            .expect_err("unresolvable binaries must fail");
        assert!(err.is_precondition());
        assert!(format!("{}", err).contains("tor"));
    }
}
