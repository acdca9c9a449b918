use crate::error::SupervisorError;
use crate::ports::PortMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const TORRC_TEMPLATE: &str = "torrc.tpl";
pub const HAPROXY_TEMPLATE: &str = "haproxy.cfg.tpl";
pub const PRIVOXY_TEMPLATE: &str = "privoxy.cfg.tpl";

/// Raw template text loaded from the templates directory.
#[derive(Debug)]
pub struct TemplateSet {
    torrc: String,
    haproxy: String,
    privoxy: Option<String>,
}

/// On-disk artifacts for one run, rooted at `run_dir/<run_id>` and removed
/// as a unit on teardown.
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub root: PathBuf,
    pub torrc: Vec<PathBuf>,
    pub data_dirs: Vec<PathBuf>,
    pub haproxy_cfg: PathBuf,
    pub privoxy_cfg: Option<PathBuf>,
}

impl RenderedConfig {
    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_dir_all(&self.root)
    }
}

pub fn load(dir: &Path, filter_enabled: bool) -> Result<TemplateSet, SupervisorError> {
    let torrc = read_template(dir.join(TORRC_TEMPLATE))?;
    let haproxy = read_template(dir.join(HAPROXY_TEMPLATE))?;
    let privoxy = if filter_enabled {
        Some(read_template(dir.join(PRIVOXY_TEMPLATE))?)
    } else {
        None
    };
    Ok(TemplateSet {
        torrc,
        haproxy,
        privoxy,
    })
}

fn read_template(path: PathBuf) -> Result<String, SupervisorError> {
    fs::read_to_string(&path).map_err(|_| SupervisorError::TemplateNotFound(path))
}

/// Expand every template with the run's concrete values and write the
/// results under `run_root`. Config files get mode 0600, directories 0700.
pub fn render(
    set: &TemplateSet,
    ports: &PortMap,
    password_hash: &str,
    run_root: &Path,
) -> Result<RenderedConfig, SupervisorError> {
    create_private_dir(run_root)?;

    let backends = ports
        .socks
        .iter()
        .enumerate()
        .map(|(i, port)| format!("    server s{} 127.0.0.1:{} check", i, port))
        .collect::<Vec<_>>()
        .join("\n");
    let filter_port = ports.filter_listen.unwrap_or(0);

    let mut torrc = Vec::with_capacity(ports.socks.len());
    let mut data_dirs = Vec::with_capacity(ports.socks.len());
    for (i, (&socks, &control)) in ports.socks.iter().zip(ports.control.iter()).enumerate() {
        let data_dir = run_root.join(format!("instance-{}", i));
        // Instance 0 carries the dns role; DNSPort 0 disables it elsewhere.
        let dns = if i == 0 { ports.dns } else { 0 };
        let tokens = token_map(
            socks,
            control,
            dns,
            password_hash,
            &data_dir,
            ports.lb_front,
            filter_port,
            &backends,
        );
        let rendered = substitute(TORRC_TEMPLATE, &set.torrc, &tokens)?;
        let path = run_root.join(format!("torrc-{}", i));
        write_private_file(&path, &rendered)?;
        torrc.push(path);
        data_dirs.push(data_dir);
    }

    // Front-end configs see the same token set with per-instance fields
    // pointing at instance 0.
    let tokens = token_map(
        ports.socks[0],
        ports.control[0],
        ports.dns,
        password_hash,
        &run_root.join("instance-0"),
        ports.lb_front,
        filter_port,
        &backends,
    );
    let haproxy_cfg = run_root.join("haproxy.cfg");
    write_private_file(&haproxy_cfg, &substitute(HAPROXY_TEMPLATE, &set.haproxy, &tokens)?)?;

    let privoxy_cfg = match &set.privoxy {
        Some(template) => {
            let path = run_root.join("privoxy.cfg");
            write_private_file(&path, &substitute(PRIVOXY_TEMPLATE, template, &tokens)?)?;
            Some(path)
        }
        None => None,
    };

    Ok(RenderedConfig {
        root: run_root.to_path_buf(),
        torrc,
        data_dirs,
        haproxy_cfg,
        privoxy_cfg,
    })
}

#[allow(clippy::too_many_arguments)]
fn token_map(
    socks: u16,
    control: u16,
    dns: u16,
    password_hash: &str,
    data_dir: &Path,
    lb_front: u16,
    filter_listen: u16,
    backends: &str,
) -> Vec<(&'static str, String)> {
    vec![
        ("{SOCKS_PORT}", socks.to_string()),
        ("{CONTROL_PORT}", control.to_string()),
        ("{DNS_PORT}", dns.to_string()),
        ("{CONTROL_PASSWORD_HASH}", password_hash.to_string()),
        ("{DATA_DIR}", data_dir.display().to_string()),
        ("{LB_FRONT_PORT}", lb_front.to_string()),
        ("{FILTER_LISTEN_PORT}", filter_listen.to_string()),
        ("{BACKENDS}", backends.to_string()),
    ]
}

fn substitute(
    name: &str,
    template: &str,
    tokens: &[(&'static str, String)],
) -> Result<String, SupervisorError> {
    let mut out = template.to_string();
    for (token, value) in tokens {
        out = out.replace(token, value);
    }
    if let Some(placeholder) = leftover_placeholder(&out) {
        return Err(SupervisorError::TemplateRenderError {
            template: name.to_string(),
            placeholder,
        });
    }
    Ok(out)
}

/// Find a `{UPPER_SNAKE}` token that survived substitution. Lowercase brace
/// expressions (haproxy log formats and the like) are not placeholders.
fn leftover_placeholder(rendered: &str) -> Option<String> {
    let bytes = rendered.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_uppercase() || bytes[j] == b'_' || bytes[j].is_ascii_digit()) {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b'}' && bytes[i + 1].is_ascii_uppercase() {
                return Some(rendered[i..=j].to_string());
            }
        }
        i += 1;
    }
    None
}

fn create_private_dir(path: &Path) -> Result<(), SupervisorError> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn write_private_file(path: &Path, contents: &str) -> Result<(), SupervisorError> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortMap;

    fn sample_ports() -> PortMap {
        PortMap {
            socks: vec![9000, 9001],
            control: vec![9900, 9901],
            dns: 9902,
            lb_front: 16379,
            filter_listen: Some(8119),
        }
    }

    fn write_templates(dir: &Path, torrc: &str, haproxy: &str, privoxy: Option<&str>) {
        fs::write(dir.join(TORRC_TEMPLATE), torrc).expect("write torrc template");
        fs::write(dir.join(HAPROXY_TEMPLATE), haproxy).expect("write haproxy template");
        if let Some(text) = privoxy {
            fs::write(dir.join(PRIVOXY_TEMPLATE), text).expect("write privoxy template");
        }
    }

    #[test]
    fn renders_per_instance_torrc_with_distinct_ports() {
        let templates = tempfile::tempdir().expect("tempdir");
        let run = tempfile::tempdir().expect("tempdir");
        write_templates(
            templates.path(),
            "SocksPort {SOCKS_PORT}\nControlPort {CONTROL_PORT}\nDNSPort {DNS_PORT}\nDataDirectory {DATA_DIR}\nHashedControlPassword {CONTROL_PASSWORD_HASH}\n",
            "frontend fe\n    bind 127.0.0.1:{LB_FRONT_PORT}\nbackend pool\n{BACKENDS}\n",
            Some("listen-address 127.0.0.1:{FILTER_LISTEN_PORT}\nforward-socks5 / 127.0.0.1:{LB_FRONT_PORT} .\n"),
        );
        let set = load(templates.path(), true).expect("load");
        let rendered =
            render(&set, &sample_ports(), "16:HASH", &run.path().join("run-1")).expect("render");

        assert_eq!(rendered.torrc.len(), 2);
        let first = fs::read_to_string(&rendered.torrc[0]).expect("read torrc-0");
        let second = fs::read_to_string(&rendered.torrc[1]).expect("read torrc-1");
        assert!(first.contains("SocksPort 9000"));
        assert!(first.contains("DNSPort 9902"));
        assert!(second.contains("SocksPort 9001"));
        assert!(second.contains("DNSPort 0"), "only instance 0 serves dns");
        assert!(first.contains("16:HASH"));
    }

    #[test]
    fn backends_expand_to_one_line_per_socks_port() {
        let templates = tempfile::tempdir().expect("tempdir");
        let run = tempfile::tempdir().expect("tempdir");
        write_templates(templates.path(), "SocksPort {SOCKS_PORT}\n", "{BACKENDS}\n", None);
        let set = load(templates.path(), false).expect("load");
        let rendered =
            render(&set, &sample_ports(), "16:HASH", &run.path().join("run-1")).expect("render");
        let haproxy = fs::read_to_string(&rendered.haproxy_cfg).expect("read haproxy.cfg");
        assert!(haproxy.contains("server s0 127.0.0.1:9000 check"));
        assert!(haproxy.contains("server s1 127.0.0.1:9001 check"));
    }

    #[test]
    fn unknown_placeholder_is_fatal() {
        let templates = tempfile::tempdir().expect("tempdir");
        let run = tempfile::tempdir().expect("tempdir");
        write_templates(
            templates.path(),
            "SocksPort {SOCKS_PORT}\nMystery {NOT_A_TOKEN}\n",
            "{BACKENDS}\n",
            None,
        );
        let set = load(templates.path(), false).expect("load");
        let err = render(&set, &sample_ports(), "16:HASH", &run.path().join("run-1"))
            .expect_err("unknown placeholder must fail");
        match err {
            SupervisorError::TemplateRenderError { placeholder, .. } => {
                assert_eq!(placeholder, "{NOT_A_TOKEN}")
            }
            other => panic!("expected TemplateRenderError, got {:?}", other),
        }
    }

    #[test]
    fn lowercase_braces_are_not_placeholders() {
        assert_eq!(leftover_placeholder("log-format {haproxy}"), None);
        assert_eq!(leftover_placeholder("plain text"), None);
        assert_eq!(
            leftover_placeholder("x {LEFT_OVER} y"),
            Some("{LEFT_OVER}".to_string())
        );
    }

    #[test]
    fn rendered_files_are_private() {
        let templates = tempfile::tempdir().expect("tempdir");
        let run = tempfile::tempdir().expect("tempdir");
        write_templates(templates.path(), "SocksPort {SOCKS_PORT}\n", "{BACKENDS}\n", None);
        let set = load(templates.path(), false).expect("load");
        let rendered =
            render(&set, &sample_ports(), "16:HASH", &run.path().join("run-1")).expect("render");

        let dir_mode = fs::metadata(&rendered.root).expect("root meta").permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = fs::metadata(&rendered.torrc[0])
            .expect("torrc meta")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn missing_template_is_a_precondition_error() {
        let templates = tempfile::tempdir().expect("tempdir");
        let err = load(templates.path(), false).expect_err("empty dir must fail");
        assert!(err.is_precondition());
        assert!(format!("{}", err).contains(TORRC_TEMPLATE));
    }

    #[test]
    fn remove_deletes_the_whole_run_root() {
        let templates = tempfile::tempdir().expect("tempdir");
        let run = tempfile::tempdir().expect("tempdir");
        write_templates(templates.path(), "SocksPort {SOCKS_PORT}\n", "{BACKENDS}\n", None);
        let set = load(templates.path(), false).expect("load");
        let rendered =
            render(&set, &sample_ports(), "16:HASH", &run.path().join("run-1")).expect("render");
        rendered.remove().expect("remove");
        assert!(!rendered.root.exists());
    }
}
