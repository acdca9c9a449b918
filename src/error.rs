//! Error types for the supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the supervisor core.
///
/// The taxonomy splits into preconditions (nothing on the host was touched),
/// startup failures (partial state, full rollback expected), runtime failures
/// (after reaching Running) and teardown failures.
#[derive(Error, Debug)]
pub enum SupervisorError {
    // Precondition errors: no host mutation has happened.
    #[error("required binary not found or not executable: {0}")]
    MissingBinary(String),

    #[error("template not found: {0}")]
    TemplateNotFound(PathBuf),

    #[error("explicitly requested port {port} is already in use")]
    ExplicitPortTaken { port: u16 },

    #[error("no free port found near base {base} after scanning {scanned} candidates")]
    PortUnavailable { base: u16, scanned: u16 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Startup errors: partial state exists and must be rolled back.
    #[error("control password derivation failed: {0}")]
    CredentialDerivationFailed(String),

    #[error("unresolved placeholder {placeholder} in template {template}")]
    TemplateRenderError { template: String, placeholder: String },

    #[error("data directory {0} is not owned by the instance user")]
    DataDirOwnership(PathBuf),

    #[error("failed to spawn {component}: {source}")]
    SpawnFailed {
        component: String,
        #[source]
        source: std::io::Error,
    },

    #[error("instance {instance} did not bootstrap within the deadline")]
    BootstrapTimeout { instance: usize },

    #[error("{component} did not answer on port {port} after start")]
    FrontEndProbeFailed { component: &'static str, port: u16 },

    #[error("failed to install transparent redirection: {0}")]
    RedirectInstallFailed(String),

    #[error("transparent redirection is already active")]
    AlreadyActive,

    #[error("start did not complete within the overall deadline (stage {stage})")]
    StartDeadlineExceeded { stage: &'static str },

    #[error("start cancelled by shutdown signal")]
    Cancelled,

    // Runtime errors: the run had reached Running.
    #[error("instance {instance} lost health and could not be recovered")]
    HealthLost { instance: usize },

    #[error("instance {instance} crashed (exit code {exit_code:?}, signal {signal:?})")]
    Crashed {
        instance: usize,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    // Teardown errors: host state may need manual inspection.
    #[error("failed to restore host state during {stage}: {detail}")]
    RestoreFailed {
        stage: &'static str,
        detail: String,
        /// Commands the operator can run by hand to inspect and clean up.
        hints: Vec<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// True for errors that are guaranteed to have left the host untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SupervisorError::MissingBinary(_)
                | SupervisorError::TemplateNotFound(_)
                | SupervisorError::ExplicitPortTaken { .. }
                | SupervisorError::PortUnavailable { .. }
                | SupervisorError::InvalidConfig(_)
        )
    }

    pub fn is_restore_failure(&self) -> bool {
        matches!(self, SupervisorError::RestoreFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorError;

    #[test]
    fn precondition_errors_are_classified() {
        assert!(SupervisorError::MissingBinary("tor".into()).is_precondition());
        assert!(SupervisorError::ExplicitPortTaken { port: 16379 }.is_precondition());
        assert!(SupervisorError::InvalidConfig("instances must be > 0".into()).is_precondition());
        assert!(!SupervisorError::BootstrapTimeout { instance: 0 }.is_precondition());
        assert!(!SupervisorError::AlreadyActive.is_precondition());
    }

    #[test]
    fn restore_failures_are_distinct_from_other_teardown_paths() {
        let err = SupervisorError::RestoreFailed {
            stage: "nat-replay",
            detail: "iptables exited with status 4".into(),
            hints: vec!["iptables -t nat -S".into()],
        };
        assert!(err.is_restore_failure());
        assert!(!SupervisorError::HealthLost { instance: 1 }.is_restore_failure());
    }

    #[test]
    fn crash_error_carries_exit_and_signal() {
        let err = SupervisorError::Crashed {
            instance: 1,
            exit_code: None,
            signal: Some(9),
        };
        let text = format!("{}", err);
        assert!(text.contains("instance 1"));
        assert!(text.contains("Some(9)"));
    }
}
