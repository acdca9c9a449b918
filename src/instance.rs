//! One onion-router child: spawn, bootstrap gating, health probing,
//! in-place restart and graceful stop.

use crate::error::SupervisorError;
use crate::probe;
use anyhow::{anyhow, bail};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const BOOTSTRAP_MARKER: &str = "Bootstrapped 100";
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Socks,
    Dns,
}

/// Immutable description of one instance. Ports are pairwise distinct across
/// the whole run by construction (see `ports::allocate`).
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub index: usize,
    pub socks_port: u16,
    pub control_port: u16,
    pub dns_port: Option<u16>,
    pub role: Role,
    pub data_dir: PathBuf,
    pub torrc: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Starting,
    Ready,
    Degraded,
    Terminating,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Degraded => "degraded",
            InstanceState::Terminating => "terminating",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }
}

/// Mutable runtime view. `pid` is set exactly while the state is one of
/// Starting, Ready, Degraded, Terminating.
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub last_probe_ok: Option<bool>,
}

#[derive(Debug)]
pub enum HealthEvent {
    Ready { index: usize },
    Degraded { index: usize },
    Recovered { index: usize },
    Failed { index: usize, error: SupervisorError },
}

enum InstanceCommand {
    Stop {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
    RotateCircuit {
        done: oneshot::Sender<anyhow::Result<()>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RunUser {
    pub uid: u32,
    pub gid: u32,
}

pub fn resolve_run_user(name: &str) -> Result<RunUser, SupervisorError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|err| SupervisorError::InvalidConfig(format!("user lookup failed: {}", err)))?
        .ok_or_else(|| SupervisorError::InvalidConfig(format!("unknown user: {}", name)))?;
    Ok(RunUser {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    })
}

/// Shared per-run parameters for every instance supervisor.
#[derive(Clone)]
pub struct InstanceRuntime {
    pub tor_bin: PathBuf,
    pub password: Arc<Zeroizing<String>>,
    pub probe_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub health_interval: Duration,
    pub grace: Duration,
    pub run_user: Option<RunUser>,
}

/// Handle to a started instance; owned by the pool. The monitor task owns
/// the child and is the only writer of the status map besides `start`.
#[derive(Debug)]
pub struct RunningInstance {
    pub spec: InstanceSpec,
    status: Arc<Mutex<InstanceHealth>>,
    commands: mpsc::Sender<InstanceCommand>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl RunningInstance {
    pub fn health(&self) -> InstanceHealth {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// SIGTERM the child's process group, escalate to SIGKILL after `grace`.
    /// Returns once the child is reaped and the monitor task has exited.
    pub async fn stop(&mut self, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .commands
            .send(InstanceCommand::Stop {
                grace,
                done: done_tx,
            })
            .await
            .is_ok();
        if sent {
            let _ = timeout(grace + Duration::from_secs(15), done_rx).await;
        }
        // The monitor returns right after acknowledging the stop.
        if let Some(handle) = self.monitor.take() {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// SIGNAL NEWNYM over the control port.
    pub async fn rotate_circuit(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(InstanceCommand::RotateCircuit { done: done_tx })
            .await
            .map_err(|_| anyhow!("instance {} monitor is gone", self.spec.index))?;
        done_rx
            .await
            .map_err(|_| anyhow!("instance {} monitor dropped the request", self.spec.index))?
    }
}

/// Bring one instance up: data dir, spawn, log tee, bootstrap gate. On
/// success the monitor task takes over and health events flow to `events`.
pub async fn start(
    spec: InstanceSpec,
    runtime: InstanceRuntime,
    events: mpsc::Sender<HealthEvent>,
) -> Result<RunningInstance, SupervisorError> {
    let status = Arc::new(Mutex::new(InstanceHealth {
        state: InstanceState::Pending,
        pid: None,
        last_probe_ok: None,
    }));

    prepare_data_dir(&spec, runtime.run_user)?;

    let mut child = spawn_router(&spec, &runtime)?;
    set_status(&status, InstanceState::Starting, child.id());
    info!(
        target: "instance",
        index = spec.index,
        pid = child.id().unwrap_or_default(),
        socks_port = spec.socks_port,
        "spawned"
    );

    let marker = tee_child_logs(&spec, &mut child)?;
    if let Err(err) = wait_bootstrap(&spec, &runtime, &mut child, marker).await {
        set_status(&status, InstanceState::Terminating, child.id());
        terminate(&spec, &mut child, runtime.grace).await;
        set_status(&status, InstanceState::Failed, None);
        return Err(err);
    }

    set_status(&status, InstanceState::Ready, child.id());
    info!(target: "instance", index = spec.index, "ready");
    let _ = events.try_send(HealthEvent::Ready { index: spec.index });

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let monitor = tokio::spawn(monitor(
        spec.clone(),
        runtime,
        child,
        Arc::clone(&status),
        events,
        cmd_rx,
    ));

    Ok(RunningInstance {
        spec,
        status,
        commands: cmd_tx,
        monitor: Some(monitor),
    })
}

fn prepare_data_dir(spec: &InstanceSpec, run_user: Option<RunUser>) -> Result<(), SupervisorError> {
    let euid = unsafe { libc::geteuid() };
    let expected_uid = run_user.map(|user| user.uid).unwrap_or(euid);

    // Ownership is settled before any chmod: a stale wrong-owner directory
    // from a prior run must surface as DataDirOwnership, not as the EPERM a
    // non-root chmod would hit first.
    std::fs::create_dir_all(&spec.data_dir)?;
    let meta = std::fs::metadata(&spec.data_dir)?;
    if meta.uid() != expected_uid {
        // Only root can repair ownership left behind by a prior run.
        if euid != 0 {
            return Err(SupervisorError::DataDirOwnership(spec.data_dir.clone()));
        }
        nix::unistd::chown(
            &spec.data_dir,
            Some(nix::unistd::Uid::from_raw(expected_uid)),
            run_user.map(|user| nix::unistd::Gid::from_raw(user.gid)),
        )
        .map_err(|_| SupervisorError::DataDirOwnership(spec.data_dir.clone()))?;
    }
    std::fs::set_permissions(&spec.data_dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn spawn_router(spec: &InstanceSpec, runtime: &InstanceRuntime) -> Result<Child, SupervisorError> {
    let mut cmd = Command::new(&runtime.tor_bin);
    cmd.arg("-f")
        .arg(&spec.torrc)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(user) = runtime.run_user {
        cmd.uid(user.uid);
        cmd.gid(user.gid);
    }
    cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
        component: format!("instance-{}", spec.index),
        source,
    })
}

/// Tee stdout and stderr into the per-instance log file and watch for the
/// bootstrap-complete marker.
fn tee_child_logs(
    spec: &InstanceSpec,
    child: &mut Child,
) -> Result<watch::Receiver<bool>, SupervisorError> {
    let (marker_tx, marker_rx) = watch::channel(false);
    let marker_tx = Arc::new(marker_tx);
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

    let log_path = spec.log_path.clone();
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&log_path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(err) => {
                warn!(target: "instance", path = %log_path.display(), error = %err, "log_open_failed");
                while line_rx.recv().await.is_some() {}
                return;
            }
        };
        while let Some(line) = line_rx.recv().await {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
    });

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone(), Some(Arc::clone(&marker_tx)));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx, Some(marker_tx));
    }
    Ok(marker_rx)
}

fn spawn_line_reader<R>(
    reader: R,
    line_tx: mpsc::Sender<String>,
    marker_tx: Option<Arc<watch::Sender<bool>>>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &marker_tx {
                if line.contains(BOOTSTRAP_MARKER) {
                    let _ = tx.send(true);
                }
            }
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Readiness is the first of: bootstrap marker in the log, or SOCKS connect
/// plus an authenticated control-port round trip. Bounded by the bootstrap
/// deadline; an exiting child short-circuits to `Crashed`.
async fn wait_bootstrap(
    spec: &InstanceSpec,
    runtime: &InstanceRuntime,
    child: &mut Child,
    mut marker: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    let deadline = sleep(runtime.bootstrap_timeout);
    tokio::pin!(deadline);

    let socks = probe::loopback(spec.socks_port);
    let control_port = spec.control_port;
    let password = Arc::clone(&runtime.password);
    let probe_timeout = runtime.probe_timeout;
    let ports_ready = async move {
        loop {
            if probe::connect_probe(socks, probe_timeout).await
                && control_authenticate(control_port, &password, probe_timeout)
                    .await
                    .is_ok()
            {
                return;
            }
            sleep(PORT_POLL_INTERVAL).await;
        }
    };
    tokio::pin!(ports_ready);

    let mut marker_open = true;
    loop {
        tokio::select! {
            changed = marker.changed(), if marker_open => {
                match changed {
                    Ok(()) if *marker.borrow() => return Ok(()),
                    Ok(()) => {}
                    Err(_) => marker_open = false,
                }
            }
            _ = &mut ports_ready => return Ok(()),
            _ = &mut deadline => {
                return Err(SupervisorError::BootstrapTimeout { instance: spec.index });
            }
            status = child.wait() => {
                return Err(match status {
                    Ok(status) => crash_error(spec.index, status),
                    Err(err) => SupervisorError::SpawnFailed { component: format!("instance-{}", spec.index), source: err },
                });
            }
        }
    }
}

fn crash_error(index: usize, status: std::process::ExitStatus) -> SupervisorError {
    SupervisorError::Crashed {
        instance: index,
        exit_code: status.code(),
        signal: status.signal(),
    }
}

/// Long-lived monitor: owns the child, answers commands, runs the health
/// loop. Probes are issued inline so at most one is outstanding per
/// instance; two consecutive failures degrade, one in-place restart is
/// attempted, then the instance is declared failed.
async fn monitor(
    spec: InstanceSpec,
    runtime: InstanceRuntime,
    mut child: Child,
    status: Arc<Mutex<InstanceHealth>>,
    events: mpsc::Sender<HealthEvent>,
    mut commands: mpsc::Receiver<InstanceCommand>,
) {
    let mut consecutive_failures = 0u32;
    let mut restart_used = false;
    let mut interval = tokio::time::interval(runtime.health_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(InstanceCommand::Stop { grace, done }) => {
                    let last_probe = status.lock().expect("status lock poisoned").last_probe_ok;
                    debug!(target: "instance", index = spec.index, last_probe = ?last_probe, "stopping");
                    set_status(&status, InstanceState::Terminating, child.id());
                    terminate(&spec, &mut child, grace).await;
                    set_status(&status, InstanceState::Stopped, None);
                    info!(target: "instance", index = spec.index, "stop ok");
                    let _ = done.send(());
                    return;
                }
                Some(InstanceCommand::RotateCircuit { done }) => {
                    let result = rotate_circuit(
                        spec.control_port,
                        &runtime.password,
                        runtime.probe_timeout,
                    )
                    .await;
                    let _ = done.send(result);
                }
                None => {
                    // Every handle dropped: treat as an orderly stop.
                    set_status(&status, InstanceState::Terminating, child.id());
                    terminate(&spec, &mut child, runtime.grace).await;
                    set_status(&status, InstanceState::Stopped, None);
                    return;
                }
            },
            exit = child.wait() => {
                let error = match exit {
                    Ok(exit_status) => crash_error(spec.index, exit_status),
                    Err(err) => SupervisorError::SpawnFailed { component: format!("instance-{}", spec.index), source: err },
                };
                warn!(target: "instance", index = spec.index, error = %error, "child exited");
                if restart_used {
                    set_status(&status, InstanceState::Failed, None);
                    let _ = events.try_send(HealthEvent::Failed { index: spec.index, error });
                    return;
                }
                restart_used = true;
                match restart_in_place(&spec, &runtime, &mut child).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        set_status(&status, InstanceState::Ready, child.id());
                        info!(target: "instance", index = spec.index, "restarted");
                        let _ = events.try_send(HealthEvent::Recovered { index: spec.index });
                    }
                    Err(restart_err) => {
                        warn!(target: "instance", index = spec.index, error = %restart_err, "restart failed");
                        set_status(&status, InstanceState::Failed, None);
                        let _ = events.try_send(HealthEvent::Failed { index: spec.index, error });
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                let healthy = probe_once(&spec, &runtime).await;
                status.lock().expect("status lock poisoned").last_probe_ok = Some(healthy);
                if healthy {
                    if current_state(&status) == InstanceState::Degraded {
                        set_status(&status, InstanceState::Ready, child.id());
                        let _ = events.try_send(HealthEvent::Recovered { index: spec.index });
                    }
                    consecutive_failures = 0;
                    continue;
                }
                consecutive_failures += 1;
                debug!(
                    target: "instance",
                    index = spec.index,
                    failures = consecutive_failures,
                    "probe failed"
                );
                if consecutive_failures < 2 {
                    continue;
                }
                set_status(&status, InstanceState::Degraded, child.id());
                let _ = events.try_send(HealthEvent::Degraded { index: spec.index });
                if restart_used {
                    set_status(&status, InstanceState::Terminating, child.id());
                    terminate(&spec, &mut child, runtime.grace).await;
                    set_status(&status, InstanceState::Failed, None);
                    let _ = events.try_send(HealthEvent::Failed {
                        index: spec.index,
                        error: SupervisorError::HealthLost { instance: spec.index },
                    });
                    return;
                }
                restart_used = true;
                match restart_in_place(&spec, &runtime, &mut child).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        set_status(&status, InstanceState::Ready, child.id());
                        let _ = events.try_send(HealthEvent::Recovered { index: spec.index });
                    }
                    Err(err) => {
                        warn!(target: "instance", index = spec.index, error = %err, "restart failed");
                        set_status(&status, InstanceState::Failed, None);
                        let _ = events.try_send(HealthEvent::Failed {
                            index: spec.index,
                            error: SupervisorError::HealthLost { instance: spec.index },
                        });
                        return;
                    }
                }
            }
        }
    }
}

async fn restart_in_place(
    spec: &InstanceSpec,
    runtime: &InstanceRuntime,
    child: &mut Child,
) -> Result<(), SupervisorError> {
    terminate(spec, child, runtime.grace).await;
    let mut fresh = spawn_router(spec, runtime)?;
    let marker = tee_child_logs(spec, &mut fresh)?;
    wait_bootstrap(spec, runtime, &mut fresh, marker).await?;
    *child = fresh;
    Ok(())
}

/// Health is SOCKS connect plus an authenticated control round trip.
async fn probe_once(spec: &InstanceSpec, runtime: &InstanceRuntime) -> bool {
    if !probe::connect_probe(probe::loopback(spec.socks_port), runtime.probe_timeout).await {
        return false;
    }
    control_authenticate(spec.control_port, &runtime.password, runtime.probe_timeout)
        .await
        .is_ok()
}

async fn control_authenticate(
    port: u16,
    password: &Zeroizing<String>,
    deadline: Duration,
) -> anyhow::Result<()> {
    let run = async {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(format!("AUTHENTICATE \"{}\"\r\n", password.as_str()).as_bytes())
            .await?;
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if !line.starts_with("250") {
            bail!("control authentication rejected");
        }
        let _ = reader.get_mut().write_all(b"QUIT\r\n").await;
        Ok(())
    };
    timeout(deadline, run)
        .await
        .map_err(|_| anyhow!("control probe timed out"))?
}

async fn rotate_circuit(
    port: u16,
    password: &Zeroizing<String>,
    deadline: Duration,
) -> anyhow::Result<()> {
    let run = async {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(format!("AUTHENTICATE \"{}\"\r\n", password.as_str()).as_bytes())
            .await?;
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if !line.starts_with("250") {
            bail!("control authentication rejected");
        }
        reader.get_mut().write_all(b"SIGNAL NEWNYM\r\n").await?;
        line.clear();
        reader.read_line(&mut line).await?;
        if !line.starts_with("250") {
            bail!("NEWNYM rejected");
        }
        let _ = reader.get_mut().write_all(b"QUIT\r\n").await;
        Ok(())
    };
    timeout(deadline * 2, run)
        .await
        .map_err(|_| anyhow!("circuit rotation timed out"))?
}

/// SIGTERM the whole process group, escalate to SIGKILL after `grace`, reap.
async fn terminate(spec: &InstanceSpec, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::SIGTERM);
        if timeout(grace, child.wait()).await.is_err() {
            warn!(target: "instance", index = spec.index, pid = pid, "grace expired, killing");
            signal_group(pid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    } else {
        let _ = child.wait().await;
    }
}

fn signal_group(pid: u32, sig: Signal) {
    let _ = killpg(Pid::from_raw(pid as i32), sig);
}

fn set_status(status: &Arc<Mutex<InstanceHealth>>, state: InstanceState, pid: Option<u32>) {
    let mut guard = status.lock().expect("status lock poisoned");
    guard.state = state;
    guard.pid = match state {
        InstanceState::Starting
        | InstanceState::Ready
        | InstanceState::Degraded
        | InstanceState::Terminating => pid,
        _ => None,
    };
    debug!(target: "instance", state = state.as_str(), "state");
}

fn current_state(status: &Arc<Mutex<InstanceHealth>>) -> InstanceState {
    status.lock().expect("status lock poisoned").state
}
