//! TCP load balancer and optional HTTP filter, probe-verified.
//!
//! Ordering is load balancer before filter on start and filter before load
//! balancer on stop, so the filter never points at a dead back-end while
//! both are alive.

use crate::error::SupervisorError;
use crate::probe;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    pub haproxy_bin: PathBuf,
    pub privoxy_bin: Option<PathBuf>,
    pub haproxy_cfg: PathBuf,
    pub privoxy_cfg: Option<PathBuf>,
    pub lb_front_port: u16,
    pub filter_listen_port: Option<u16>,
    pub probe_timeout: Duration,
    pub listen_deadline: Duration,
    pub grace: Duration,
    pub log_dir: PathBuf,
}

#[derive(Debug)]
struct FrontProcess {
    name: &'static str,
    child: Child,
    port: u16,
}

#[derive(Debug)]
pub struct ProxyFrontEnd {
    lb: Option<FrontProcess>,
    filter: Option<FrontProcess>,
    grace: Duration,
}

/// Bring up the front-end chain. Each subprocess must answer a connect
/// probe on its listen port before the next one starts.
pub async fn start(cfg: FrontEndConfig) -> Result<ProxyFrontEnd, SupervisorError> {
    let mut front = ProxyFrontEnd {
        lb: None,
        filter: None,
        grace: cfg.grace,
    };

    let lb_child = spawn_front(
        "haproxy",
        &cfg.haproxy_bin,
        &["-f"],
        &cfg.haproxy_cfg,
        &cfg.log_dir,
    )?;
    front.lb = Some(FrontProcess {
        name: "lb",
        child: lb_child,
        port: cfg.lb_front_port,
    });
    if !probe::wait_for_listen(
        probe::loopback(cfg.lb_front_port),
        cfg.probe_timeout,
        cfg.listen_deadline,
    )
    .await
    {
        front.stop().await;
        return Err(SupervisorError::FrontEndProbeFailed {
            component: "haproxy",
            port: cfg.lb_front_port,
        });
    }
    info!(target: "frontend", port = cfg.lb_front_port, "lb up");

    // The filter is optional; its absence is not an error.
    if let (Some(privoxy_bin), Some(privoxy_cfg), Some(filter_port)) = (
        cfg.privoxy_bin.as_ref(),
        cfg.privoxy_cfg.as_ref(),
        cfg.filter_listen_port,
    ) {
        let filter_child = spawn_front(
            "privoxy",
            privoxy_bin,
            &["--no-daemon"],
            privoxy_cfg,
            &cfg.log_dir,
        )?;
        front.filter = Some(FrontProcess {
            name: "filter",
            child: filter_child,
            port: filter_port,
        });
        if !probe::wait_for_listen(
            probe::loopback(filter_port),
            cfg.probe_timeout,
            cfg.listen_deadline,
        )
        .await
        {
            front.stop().await;
            return Err(SupervisorError::FrontEndProbeFailed {
                component: "privoxy",
                port: filter_port,
            });
        }
        info!(target: "frontend", port = filter_port, "filter up");
    }

    Ok(front)
}

fn spawn_front(
    name: &'static str,
    binary: &Path,
    args: &[&str],
    config: &Path,
    log_dir: &Path,
) -> Result<Child, SupervisorError> {
    let log = open_log(log_dir, name)?;
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .arg(config)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .process_group(0)
        .kill_on_drop(true);
    cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
        component: name.to_string(),
        source,
    })
}

fn open_log(dir: &Path, name: &str) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(dir.join(format!("{}.log", name)))
}

impl ProxyFrontEnd {
    pub fn pids(&self) -> Vec<u32> {
        self.lb
            .iter()
            .chain(self.filter.iter())
            .filter_map(|proc| proc.child.id())
            .collect()
    }

    /// Stop the chain in reverse start order: filter first, then the LB.
    pub async fn stop(&mut self) {
        if let Some(mut filter) = self.filter.take() {
            terminate(&mut filter, self.grace).await;
            info!(target: "frontend", "filter stop ok");
        }
        if let Some(mut lb) = self.lb.take() {
            terminate(&mut lb, self.grace).await;
            info!(target: "frontend", "lb stop ok");
        }
    }
}

async fn terminate(proc: &mut FrontProcess, grace: Duration) {
    if let Some(pid) = proc.child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(grace, proc.child.wait()).await.is_err() {
            warn!(target: "frontend", component = proc.name, pid = pid, port = proc.port, "grace expired, killing");
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = proc.child.wait().await;
        }
    } else {
        let _ = proc.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    fn stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create stub");
        writeln!(file, "#!/bin/sh\n{}", body).expect("write stub");
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
        path
    }

    fn config(dir: &Path, haproxy: PathBuf, lb_port: u16) -> FrontEndConfig {
        FrontEndConfig {
            haproxy_bin: haproxy,
            privoxy_bin: None,
            haproxy_cfg: dir.join("haproxy.cfg"),
            privoxy_cfg: None,
            lb_front_port: lb_port,
            filter_listen_port: None,
            probe_timeout: Duration::from_millis(200),
            listen_deadline: Duration::from_millis(800),
            grace: Duration::from_secs(2),
            log_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn silent_lb_fails_the_probe_and_is_reaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let haproxy = stub(dir.path(), "haproxy-stub", "sleep 60");
        std::fs::write(dir.path().join("haproxy.cfg"), "# empty\n").expect("cfg");
        // A port nobody listens on.
        let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = holder.local_addr().expect("addr").port();
        drop(holder);

        let err = start(config(dir.path(), haproxy, port))
            .await
            .expect_err("probe must fail");
        match err {
            SupervisorError::FrontEndProbeFailed {
                component: "haproxy",
                port: failed_port,
            } => assert_eq!(failed_port, port),
            other => panic!("expected FrontEndProbeFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn verified_front_end_reports_pids_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let haproxy = stub(dir.path(), "haproxy-stub", "sleep 60");
        std::fs::write(dir.path().join("haproxy.cfg"), "# empty\n").expect("cfg");
        // Stand in for the stub's listener so the probe sees the port open.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let mut front = start(config(dir.path(), haproxy, port))
            .await
            .expect("front-end should verify");
        let pids = front.pids();
        assert_eq!(pids.len(), 1);
        front.stop().await;
        assert!(front.pids().is_empty());
        // The child group received SIGTERM; kill(pid, 0) must now fail.
        let rc = unsafe { libc::kill(pids[0] as i32, 0) };
        assert_eq!(rc, -1, "stub should be gone after stop");
    }
}
