use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportLevel {
    Supported,
    Partial,
    Unsupported,
}

impl SupportLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SupportLevel::Supported => "supported",
            SupportLevel::Partial => "partial",
            SupportLevel::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlatformProfile {
    pub os: &'static str,
    pub arch: &'static str,
    pub process_supervision: SupportLevel,
    pub transparent_redirect: SupportLevel,
    pub packet_filter: &'static str,
    pub note: &'static str,
}

pub fn current() -> PlatformProfile {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    match os {
        "linux" => PlatformProfile {
            os,
            arch,
            process_supervision: SupportLevel::Supported,
            transparent_redirect: SupportLevel::Supported,
            packet_filter: "iptables",
            note: "linux is the primary supported platform; redirection uses the iptables NAT table",
        },
        "macos" => PlatformProfile {
            os,
            arch,
            process_supervision: SupportLevel::Supported,
            transparent_redirect: SupportLevel::Partial,
            packet_filter: "pf",
            note: "macos redirection uses pf rdr rules on the primary interface and is experimental",
        },
        _ => PlatformProfile {
            os,
            arch,
            process_supervision: SupportLevel::Partial,
            transparent_redirect: SupportLevel::Unsupported,
            packet_filter: "none",
            note: "this platform is not a supported target; only preflight checks are available",
        },
    }
}

pub fn require_transparent_redirect(command_name: &str) -> Result<()> {
    require_transparent_redirect_for(current(), command_name)
}

fn require_transparent_redirect_for(profile: PlatformProfile, command_name: &str) -> Result<()> {
    if profile.transparent_redirect != SupportLevel::Unsupported {
        return Ok(());
    }
    Err(anyhow!(
        "{} needs transparent redirection, which is unsupported on host {}-{}; only `check` and `status` work here",
        command_name,
        profile.os,
        profile.arch
    ))
}

#[cfg(test)]
mod tests {
    use super::{current, require_transparent_redirect_for, PlatformProfile, SupportLevel};

    fn unsupported_profile() -> PlatformProfile {
        PlatformProfile {
            os: "freebsd",
            arch: "x86_64",
            process_supervision: SupportLevel::Partial,
            transparent_redirect: SupportLevel::Unsupported,
            packet_filter: "none",
            note: "preflight only",
        }
    }

    #[test]
    fn current_platform_has_non_empty_identity() {
        let profile = current();
        assert!(!profile.os.is_empty());
        assert!(!profile.arch.is_empty());
    }

    #[test]
    fn linux_uses_the_iptables_backend() {
        if std::env::consts::OS == "linux" {
            let profile = current();
            assert_eq!(profile.transparent_redirect, SupportLevel::Supported);
            assert_eq!(profile.packet_filter, "iptables");
        }
    }

    #[test]
    fn unsupported_redirection_returns_clear_error() {
        let err = require_transparent_redirect_for(unsupported_profile(), "up")
            .expect_err("unsupported profile should return an error");
        let text = format!("{}", err);
        assert!(text.contains("up"));
        assert!(text.contains("unsupported on host"));
    }
}
