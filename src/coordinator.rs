//! Top-level lifecycle: strict stage ordering on the way up, mandatory
//! ordered rollback on the way down, and one place that owns the run state.

use crate::config::{ResolvedBinaries, SupervisorConfig};
use crate::credentials::Credentials;
use crate::error::SupervisorError;
use crate::frontend::{self, FrontEndConfig, ProxyFrontEnd};
use crate::instance::{HealthEvent, InstanceRuntime, InstanceSpec, Role};
use crate::pool::{self, PoolManager};
use crate::ports::{self, PortMap};
use crate::redirect::{self, RedirectSpec, Redirector};
use crate::template::{self, RenderedConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    PortsAllocated,
    ConfigsRendered,
    InstancesUp,
    FrontEndUp,
    RedirectionActive,
    Running,
    Draining,
    Stopped,
    Failed(&'static str),
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::PortsAllocated => "ports-allocated",
            RunState::ConfigsRendered => "configs-rendered",
            RunState::InstancesUp => "instances-up",
            RunState::FrontEndUp => "front-end-up",
            RunState::RedirectionActive => "redirection-active",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Stopped => "stopped",
            RunState::Failed(_) => "failed",
        }
    }
}

/// What one lifecycle operation left behind. `error` is the original
/// trigger; rollback failures ride along instead of replacing it.
#[derive(Debug)]
pub struct Outcome {
    pub error: Option<SupervisorError>,
    pub rollback_errors: Vec<(&'static str, SupervisorError)>,
}

impl Outcome {
    pub fn success() -> Self {
        Outcome {
            error: None,
            rollback_errors: Vec::new(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        let restore_trouble = !self.rollback_errors.is_empty()
            || self
                .error
                .as_ref()
                .map(SupervisorError::is_restore_failure)
                .unwrap_or(false);
        if restore_trouble {
            return 4;
        }
        match &self.error {
            None => 0,
            Some(err) if err.is_precondition() => 2,
            Some(_) => 3,
        }
    }
}

pub struct Coordinator {
    cfg: SupervisorConfig,
    binaries: ResolvedBinaries,
    state: Arc<Mutex<RunState>>,
    run_root: PathBuf,
    credentials: Option<Credentials>,
    port_map: Option<PortMap>,
    rendered: Option<RenderedConfig>,
    pool: Option<PoolManager>,
    frontend: Option<ProxyFrontEnd>,
    redirector: Box<dyn Redirector>,
    health_tx: mpsc::Sender<HealthEvent>,
    health_rx: Option<mpsc::Receiver<HealthEvent>>,
    /// Set by the signal watcher; checked at stage boundaries so a SIGTERM
    /// during bring-up turns into an orderly stop instead of a half-built
    /// chain.
    cancel: tokio::sync::watch::Receiver<bool>,
}

impl Coordinator {
    /// Validate config and resolve binaries. Fails closed before anything
    /// on the host is touched.
    pub fn new(cfg: SupervisorConfig) -> Result<Self, SupervisorError> {
        cfg.validate()?;
        let binaries = cfg.binaries.resolve(cfg.filter_enabled())?;
        let redirector = redirect::for_current_platform(
            binaries.packet_filter.clone(),
            binaries.route.clone(),
        )?;
        let run_root = cfg.run_dir.join(format!(
            "run-{}-{}",
            time::OffsetDateTime::now_utc().unix_timestamp(),
            std::process::id()
        ));
        let (health_tx, health_rx) = mpsc::channel(64);
        let cancel = spawn_signal_watcher();
        Ok(Self {
            cfg,
            binaries,
            state: Arc::new(Mutex::new(RunState::Init)),
            run_root,
            credentials: None,
            port_map: None,
            rendered: None,
            pool: None,
            frontend: None,
            redirector,
            health_tx,
            health_rx: Some(health_rx),
            cancel,
        })
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: RunState) {
        let mut guard = self.state.lock().expect("state lock poisoned");
        info!(
            target: "coordinator",
            from = guard.as_str(),
            to = next.as_str(),
            "state"
        );
        *guard = next;
    }

    /// Drive Init through Running. On any stage failure the full rollback
    /// runs before this returns; the outcome carries the trigger error.
    pub async fn start(&mut self) -> Outcome {
        let deadline = Instant::now() + self.cfg.effective_start_deadline();
        match self.bring_up(deadline).await {
            Ok(()) => Outcome::success(),
            Err(SupervisorError::Cancelled) => {
                info!(target: "coordinator", "shutdown signal during start");
                self.set_state(RunState::Draining);
                let rollback_errors = self.roll_back().await;
                self.set_state(RunState::Stopped);
                Outcome {
                    error: None,
                    rollback_errors,
                }
            }
            Err(err) => {
                // Credential derivation shares the PortsAllocated state with
                // rendering; the error type names the step precisely.
                let step = match &err {
                    SupervisorError::CredentialDerivationFailed(_) => "credentials",
                    _ => failing_step(self.state()),
                };
                error!(target: "coordinator", step = step, error = %err, "start failed");
                let rollback_errors = self.roll_back().await;
                self.set_state(RunState::Failed(step));
                Outcome {
                    error: Some(err),
                    rollback_errors,
                }
            }
        }
    }

    async fn bring_up(&mut self, deadline: Instant) -> Result<(), SupervisorError> {
        self.check_stage(deadline, "ports")?;
        let port_map = ports::allocate(&self.cfg)?;
        info!(
            target: "coordinator",
            socks = ?port_map.socks,
            control = ?port_map.control,
            dns = port_map.dns,
            lb = port_map.lb_front,
            "ports allocated"
        );
        self.port_map = Some(port_map);
        self.set_state(RunState::PortsAllocated);

        self.check_stage(deadline, "credentials")?;
        let credentials = Credentials::materialize(&self.binaries.tor).await?;
        self.credentials = Some(credentials);

        self.check_stage(deadline, "render")?;
        let templates = template::load(&self.cfg.templates_dir, self.cfg.filter_enabled())?;
        let rendered = template::render(
            &templates,
            self.port_map.as_ref().expect("ports allocated above"),
            &self
                .credentials
                .as_ref()
                .expect("credentials materialized above")
                .hashed,
            &self.run_root,
        )?;
        self.rendered = Some(rendered);
        self.set_state(RunState::ConfigsRendered);

        self.check_stage(deadline, "instances")?;
        let specs = self.build_specs();
        let runtime = self.instance_runtime()?;
        let pool = pool::start(specs, runtime, self.health_tx.clone()).await?;
        self.pool = Some(pool);
        self.set_state(RunState::InstancesUp);

        self.check_stage(deadline, "front-end")?;
        let front = frontend::start(self.front_end_config()).await?;
        self.frontend = Some(front);
        self.set_state(RunState::FrontEndUp);

        self.check_stage(deadline, "redirect")?;
        let port_map = self.port_map.as_ref().expect("ports allocated above");
        self.redirector
            .install(&RedirectSpec {
                lb_front_port: port_map.lb_front,
                dns_port: port_map.dns,
                run_root: self.run_root.clone(),
            })
            .await?;
        self.set_state(RunState::RedirectionActive);

        self.set_state(RunState::Running);
        let running = self.pool.as_ref().map(PoolManager::len).unwrap_or(0);
        info!(target: "coordinator", instances = running, "running");
        Ok(())
    }

    /// Wait in Running until a shutdown signal arrives or the pool reports
    /// a terminal failure, then drain.
    pub async fn supervise(&mut self) -> Outcome {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sighup = signal(SignalKind::hangup()).ok();
        let mut health_rx = self.health_rx.take();

        loop {
            tokio::select! {
                _ = recv_signal(&mut sigint) => {
                    info!(target: "coordinator", signal = "SIGINT", "shutdown requested");
                    return self.stop().await;
                }
                _ = recv_signal(&mut sigterm) => {
                    info!(target: "coordinator", signal = "SIGTERM", "shutdown requested");
                    return self.stop().await;
                }
                _ = recv_signal(&mut sighup) => {
                    info!(target: "coordinator", signal = "SIGHUP", "rotating circuits");
                    if let Some(pool) = &self.pool {
                        pool.rotate_circuits().await;
                    }
                }
                event = recv_event(&mut health_rx) => match event {
                    HealthEvent::Failed { index, error } => {
                        warn!(target: "coordinator", index = index, error = %error, "pool failure");
                        self.set_state(RunState::Draining);
                        let rollback_errors = self.roll_back().await;
                        self.set_state(RunState::Failed("health"));
                        return Outcome { error: Some(error), rollback_errors };
                    }
                    HealthEvent::Degraded { index } => {
                        let aggregate = self
                            .pool
                            .as_ref()
                            .map(|pool| pool.health().as_str())
                            .unwrap_or("unknown");
                        warn!(target: "coordinator", index = index, aggregate = aggregate, "instance degraded");
                    }
                    HealthEvent::Recovered { index } => {
                        let aggregate = self
                            .pool
                            .as_ref()
                            .map(|pool| pool.health().as_str())
                            .unwrap_or("unknown");
                        info!(target: "coordinator", index = index, aggregate = aggregate, "instance recovered");
                    }
                    HealthEvent::Ready { .. } => {}
                },
            }
        }
    }

    /// Orderly stop. Idempotent: from Init or Stopped this is a successful
    /// no-op.
    pub async fn stop(&mut self) -> Outcome {
        let state = self.state();
        if matches!(state, RunState::Init | RunState::Stopped) {
            return Outcome::success();
        }
        self.set_state(RunState::Draining);
        let started = Instant::now();
        let rollback_errors = self.roll_back().await;
        if started.elapsed() > self.cfg.stop_deadline {
            warn!(
                target: "coordinator",
                elapsed_secs = started.elapsed().as_secs(),
                "stop exceeded its deadline"
            );
        }
        self.set_state(RunState::Stopped);
        Outcome {
            error: None,
            rollback_errors,
        }
    }

    /// The one rollback path, in mandatory order: redirection, front-end,
    /// pool (reverse index), rendered configs, credentials. A failing step
    /// is recorded and the next step still runs.
    async fn roll_back(&mut self) -> Vec<(&'static str, SupervisorError)> {
        let mut errors: Vec<(&'static str, SupervisorError)> = Vec::new();

        if self.redirector.active() {
            if let Err(err) = self.redirector.restore().await {
                error!(target: "coordinator", error = %err, "host state restore failed");
                let hints = match &err {
                    SupervisorError::RestoreFailed { hints, .. } => hints.clone(),
                    _ => self.redirector.cleanup_hints(),
                };
                for hint in &hints {
                    error!(target: "coordinator", hint = %hint, "manual cleanup");
                }
                errors.push(("redirector", err));
            } else {
                info!(target: "coordinator", "redirector stop ok");
            }
        }

        if let Some(mut front) = self.frontend.take() {
            front.stop().await;
        }

        if let Some(mut pool) = self.pool.take() {
            pool.stop().await;
        }

        if let Some(rendered) = self.rendered.take() {
            if let Err(err) = rendered.remove() {
                errors.push(("rendered-config", err.into()));
            } else {
                info!(target: "coordinator", "rendered configs removed");
            }
        }

        // Dropping the credentials zeroizes the plaintext buffer.
        self.credentials = None;
        self.port_map = None;

        errors
    }

    fn build_specs(&self) -> Vec<InstanceSpec> {
        let port_map = self.port_map.as_ref().expect("ports allocated");
        let rendered = self.rendered.as_ref().expect("configs rendered");
        (0..self.cfg.instances)
            .map(|i| InstanceSpec {
                index: i,
                socks_port: port_map.socks[i],
                control_port: port_map.control[i],
                dns_port: (i == 0).then_some(port_map.dns),
                role: if i == 0 { Role::Dns } else { Role::Socks },
                data_dir: rendered.data_dirs[i].clone(),
                torrc: rendered.torrc[i].clone(),
                log_path: self.run_root.join(format!("instance-{}.log", i)),
            })
            .collect()
    }

    fn instance_runtime(&self) -> Result<InstanceRuntime, SupervisorError> {
        let run_user = match &self.cfg.user {
            Some(name) => Some(crate::instance::resolve_run_user(name)?),
            None => None,
        };
        Ok(InstanceRuntime {
            tor_bin: self.binaries.tor.clone(),
            password: Arc::new(
                self.credentials
                    .as_ref()
                    .expect("credentials materialized")
                    .plaintext
                    .clone(),
            ),
            probe_timeout: self.cfg.probe_timeout,
            bootstrap_timeout: self.cfg.bootstrap_timeout,
            health_interval: self.cfg.health_interval,
            grace: self.cfg.grace,
            run_user,
        })
    }

    fn check_stage(&self, deadline: Instant, stage: &'static str) -> Result<(), SupervisorError> {
        if *self.cancel.borrow() {
            return Err(SupervisorError::Cancelled);
        }
        check_deadline(deadline, stage)
    }

    fn front_end_config(&self) -> FrontEndConfig {
        let port_map = self.port_map.as_ref().expect("ports allocated");
        let rendered = self.rendered.as_ref().expect("configs rendered");
        FrontEndConfig {
            haproxy_bin: self.binaries.haproxy.clone(),
            privoxy_bin: self.binaries.privoxy.clone(),
            haproxy_cfg: rendered.haproxy_cfg.clone(),
            privoxy_cfg: rendered.privoxy_cfg.clone(),
            lb_front_port: port_map.lb_front,
            filter_listen_port: port_map.filter_listen,
            probe_timeout: self.cfg.probe_timeout,
            listen_deadline: Duration::from_secs(15),
            grace: self.cfg.grace,
            log_dir: self.run_root.clone(),
        }
    }
}

/// One watcher per coordinator: flips the cancel flag on the first
/// SIGINT/SIGTERM so bring-up stops issuing new stages.
fn spawn_signal_watcher() -> tokio::sync::watch::Receiver<bool> {
    use tokio::signal::unix::{signal, SignalKind};
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigterm = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = recv_signal(&mut sigint) => {}
            _ = recv_signal(&mut sigterm) => {}
        }
        let _ = tx.send(true);
    });
    rx
}

fn check_deadline(deadline: Instant, stage: &'static str) -> Result<(), SupervisorError> {
    if Instant::now() >= deadline {
        Err(SupervisorError::StartDeadlineExceeded { stage })
    } else {
        Ok(())
    }
}

/// Name of the stage that was being attempted when the given state was
/// current; used for `Failed(step)`.
fn failing_step(state: RunState) -> &'static str {
    match state {
        RunState::Init => "ports",
        RunState::PortsAllocated => "render",
        RunState::ConfigsRendered => "instances",
        RunState::InstancesUp => "front-end",
        RunState::FrontEndUp => "redirect",
        RunState::RedirectionActive | RunState::Running => "running",
        RunState::Draining => "draining",
        RunState::Stopped => "stopped",
        RunState::Failed(step) => step,
    }
}

async fn recv_signal(slot: &mut Option<tokio::signal::unix::Signal>) {
    match slot {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_event(slot: &mut Option<mpsc::Receiver<HealthEvent>>) -> HealthEvent {
    match slot {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BinaryConfig, SupervisorConfig};
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create stub");
        writeln!(file, "#!/bin/sh\n{}", body).expect("write stub");
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
        path
    }

    /// A router stub that answers the hash subcommand but never opens its
    /// ports or prints a bootstrap marker.
    fn silent_router(dir: &Path) -> PathBuf {
        stub(
            dir,
            "tor-stub",
            "case \"$1\" in\n--hash-password) cat > /dev/null; echo '16:STUBHASH'; exit 0 ;;\nesac\nsleep 60",
        )
    }

    fn write_templates(dir: &Path) {
        std::fs::write(
            dir.join(crate::template::TORRC_TEMPLATE),
            "SocksPort {SOCKS_PORT}\nControlPort {CONTROL_PORT}\nDNSPort {DNS_PORT}\nDataDirectory {DATA_DIR}\nHashedControlPassword {CONTROL_PASSWORD_HASH}\n",
        )
        .expect("torrc template");
        std::fs::write(
            dir.join(crate::template::HAPROXY_TEMPLATE),
            "frontend fe\n    bind 127.0.0.1:{LB_FRONT_PORT}\nbackend pool\n{BACKENDS}\n",
        )
        .expect("haproxy template");
    }

    fn test_config(work: &Path, tor: PathBuf, lb_port: u16) -> SupervisorConfig {
        let haproxy = stub(work, "haproxy-stub", "sleep 60");
        SupervisorConfig {
            instances: 2,
            socks_base_port: 47000,
            control_base_port: 47100,
            lb_front_port: lb_port,
            filter_listen_port: 0,
            user: None,
            bootstrap_timeout: Duration::from_millis(700),
            health_interval: Duration::from_secs(10),
            grace: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            start_deadline: Duration::from_secs(180),
            stop_deadline: Duration::from_secs(60),
            templates_dir: work.join("templates"),
            run_dir: work.join("run"),
            binaries: BinaryConfig {
                tor,
                haproxy,
                privoxy: None,
                packet_filter: "/bin/true".into(),
                route: None,
            },
        }
    }

    #[tokio::test]
    async fn stop_from_init_is_a_successful_noop() {
        let work = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(work.path().join("templates")).expect("templates dir");
        write_templates(&work.path().join("templates"));
        let tor = silent_router(work.path());
        let cfg = test_config(work.path(), tor, 47200);
        let mut coordinator = Coordinator::new(cfg).expect("coordinator");

        let outcome = coordinator.stop().await;
        assert!(outcome.error.is_none());
        assert!(outcome.rollback_errors.is_empty());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(coordinator.state(), RunState::Init);
    }

    #[tokio::test]
    async fn explicit_port_conflict_fails_before_any_mutation() {
        let work = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(work.path().join("templates")).expect("templates dir");
        write_templates(&work.path().join("templates"));
        let tor = silent_router(work.path());

        let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let held = holder.local_addr().expect("addr").port();
        let cfg = test_config(work.path(), tor, held);
        let run_dir = cfg.run_dir.clone();
        let mut coordinator = Coordinator::new(cfg).expect("coordinator");

        let outcome = coordinator.start().await;
        match outcome.error {
            Some(SupervisorError::ExplicitPortTaken { port }) => assert_eq!(port, held),
            other => panic!("expected ExplicitPortTaken, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(coordinator.state(), RunState::Failed("ports"));
        // No run root was ever created.
        assert!(!run_dir.exists() || std::fs::read_dir(&run_dir).expect("dir").next().is_none());
    }

    #[tokio::test]
    async fn bootstrap_timeout_rolls_back_rendered_configs() {
        let work = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(work.path().join("templates")).expect("templates dir");
        write_templates(&work.path().join("templates"));
        let tor = silent_router(work.path());
        let cfg = test_config(work.path(), tor, 47300);
        let run_dir = cfg.run_dir.clone();
        let mut coordinator = Coordinator::new(cfg).expect("coordinator");

        let outcome = coordinator.start().await;
        match outcome.error {
            Some(SupervisorError::BootstrapTimeout { .. }) => {}
            other => panic!("expected BootstrapTimeout, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 3, "full rollback should keep code 3");
        assert!(matches!(coordinator.state(), RunState::Failed("instances")));
        // The rendered run root is gone again.
        let leftovers: Vec<_> = std::fs::read_dir(&run_dir)
            .map(|entries| entries.flatten().collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "run root should be removed: {:?}", leftovers);
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(Outcome::success().exit_code(), 0);
        let precondition = Outcome {
            error: Some(SupervisorError::MissingBinary("tor".into())),
            rollback_errors: Vec::new(),
        };
        assert_eq!(precondition.exit_code(), 2);
        let runtime = Outcome {
            error: Some(SupervisorError::BootstrapTimeout { instance: 0 }),
            rollback_errors: Vec::new(),
        };
        assert_eq!(runtime.exit_code(), 3);
        let partial = Outcome {
            error: Some(SupervisorError::BootstrapTimeout { instance: 0 }),
            rollback_errors: vec![(
                "redirector",
                SupervisorError::RestoreFailed {
                    stage: "nat-replay",
                    detail: "iptables exited 4".into(),
                    hints: vec!["iptables -t nat -S".into()],
                },
            )],
        };
        assert_eq!(partial.exit_code(), 4);
        let stop_with_restore_failure = Outcome {
            error: None,
            rollback_errors: vec![(
                "redirector",
                SupervisorError::RestoreFailed {
                    stage: "pf-reload",
                    detail: "pfctl exited 1".into(),
                    hints: Vec::new(),
                },
            )],
        };
        assert_eq!(stop_with_restore_failure.exit_code(), 4);
    }

    #[test]
    fn failing_step_names_the_stage_in_progress() {
        assert_eq!(failing_step(RunState::Init), "ports");
        assert_eq!(failing_step(RunState::ConfigsRendered), "instances");
        assert_eq!(failing_step(RunState::FrontEndUp), "redirect");
    }
}
