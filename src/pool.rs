//! Pool of instance supervisors: parallel start, strictly reverse-order stop.

use crate::error::SupervisorError;
use crate::instance::{
    self, HealthEvent, InstanceRuntime, InstanceSpec, InstanceState, RunningInstance,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Failed,
}

impl PoolHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub struct PoolManager {
    instances: Vec<RunningInstance>,
    grace: Duration,
}

/// Start every instance concurrently. The pool is up only when all of them
/// reach Ready; the first terminal failure aborts the remainder, stops what
/// already started (reverse index order) and is surfaced to the caller.
pub async fn start(
    specs: Vec<InstanceSpec>,
    runtime: InstanceRuntime,
    events: mpsc::Sender<HealthEvent>,
) -> Result<PoolManager, SupervisorError> {
    let total = specs.len();
    let grace = runtime.grace;
    let (result_tx, mut result_rx) =
        mpsc::channel::<(usize, Result<RunningInstance, SupervisorError>)>(total.max(1));

    let mut tasks = Vec::with_capacity(total);
    for spec in specs {
        let runtime = runtime.clone();
        let events = events.clone();
        let result_tx = result_tx.clone();
        let index = spec.index;
        tasks.push(tokio::spawn(async move {
            let result = instance::start(spec, runtime, events).await;
            let _ = result_tx.send((index, result)).await;
        }));
    }
    drop(result_tx);

    let mut started: Vec<RunningInstance> = Vec::new();
    let mut failure: Option<SupervisorError> = None;
    while let Some((index, result)) = result_rx.recv().await {
        match result {
            Ok(running) => {
                started.push(running);
                if started.len() == total {
                    break;
                }
            }
            Err(err) => {
                warn!(target: "pool", index = index, error = %err, "instance failed to start");
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = failure {
        // Children of aborted start tasks die via kill_on_drop.
        for task in &tasks {
            task.abort();
        }
        // Collect instances that finished between the failure and the abort.
        while let Ok(Some((_, result))) =
            tokio::time::timeout(Duration::from_millis(200), result_rx.recv()).await
        {
            if let Ok(running) = result {
                started.push(running);
            }
        }
        stop_reverse(&mut started, grace).await;
        return Err(err);
    }

    started.sort_by_key(|running| running.spec.index);
    info!(target: "pool", instances = started.len(), "all ready");
    Ok(PoolManager {
        instances: started,
        grace,
    })
}

async fn stop_reverse(instances: &mut Vec<RunningInstance>, grace: Duration) {
    instances.sort_by_key(|running| running.spec.index);
    for running in instances.iter_mut().rev() {
        running.stop(grace).await;
        info!(target: "pool", index = running.spec.index, "stop ok");
    }
}

impl PoolManager {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[RunningInstance] {
        &self.instances
    }

    /// Healthy iff every instance is Ready; Failed if any instance failed;
    /// Degraded otherwise.
    pub fn health(&self) -> PoolHealth {
        let mut all_ready = true;
        for running in &self.instances {
            match running.health().state {
                InstanceState::Failed => return PoolHealth::Failed,
                InstanceState::Ready => {}
                _ => all_ready = false,
            }
        }
        if all_ready {
            PoolHealth::Healthy
        } else {
            PoolHealth::Degraded
        }
    }

    /// Sequential stop in reverse index order.
    pub async fn stop(&mut self) {
        stop_reverse(&mut self.instances, self.grace).await;
    }

    /// Ask every instance for a fresh circuit; failures degrade nothing by
    /// themselves, they are just logged.
    pub async fn rotate_circuits(&self) {
        if self.is_empty() {
            return;
        }
        for running in &self.instances {
            match running.rotate_circuit().await {
                Ok(()) => {
                    info!(target: "pool", index = running.spec.index, "circuit rotated")
                }
                Err(err) => {
                    warn!(target: "pool", index = running.spec.index, error = %err, "circuit rotation failed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Role;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use zeroize::Zeroizing;

    fn stub_router(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("tor-stub");
        let mut file = std::fs::File::create(&path).expect("create stub");
        writeln!(file, "#!/bin/sh\n{}", body).expect("write stub");
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
        path
    }

    fn specs_for(dir: &Path, count: usize) -> Vec<InstanceSpec> {
        (0..count)
            .map(|i| InstanceSpec {
                index: i,
                socks_port: 1,
                control_port: 2,
                dns_port: None,
                role: if i == 0 { Role::Dns } else { Role::Socks },
                data_dir: dir.join(format!("instance-{}", i)),
                torrc: dir.join(format!("torrc-{}", i)),
                log_path: dir.join(format!("instance-{}.log", i)),
            })
            .collect()
    }

    fn runtime_for(tor_bin: PathBuf) -> InstanceRuntime {
        InstanceRuntime {
            tor_bin,
            password: Arc::new(Zeroizing::new("test-password".to_string())),
            probe_timeout: Duration::from_millis(200),
            bootstrap_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(10),
            grace: Duration::from_secs(2),
            run_user: None,
        }
    }

    #[tokio::test]
    async fn pool_reaches_healthy_when_all_bootstrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = stub_router(dir.path(), "echo 'Bootstrapped 100% (done)'\nsleep 60");
        let specs = specs_for(dir.path(), 2);
        for spec in &specs {
            std::fs::write(&spec.torrc, "SocksPort 0\n").expect("torrc");
        }
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut pool = start(specs, runtime_for(stub), events_tx)
            .await
            .expect("pool start");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.health(), PoolHealth::Healthy);
        pool.stop().await;
        for running in pool.instances() {
            assert_eq!(running.health().state, InstanceState::Stopped);
        }
    }

    #[tokio::test]
    async fn one_crashing_instance_fails_the_pool_and_stops_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Instance 1 exits after a moment; instance 0 bootstraps fine.
        let stub = stub_router(
            dir.path(),
            "case \"$2\" in\n*torrc-1) sleep 1; exit 5 ;;\nesac\necho 'Bootstrapped 100% (done)'\nsleep 60",
        );
        let specs = specs_for(dir.path(), 2);
        for spec in &specs {
            std::fs::write(&spec.torrc, "SocksPort 0\n").expect("torrc");
        }
        let (events_tx, _events_rx) = mpsc::channel(16);
        let err = start(specs, runtime_for(stub), events_tx)
            .await
            .expect_err("crashing instance must fail the pool");
        match err {
            SupervisorError::Crashed {
                instance: 1,
                exit_code: Some(5),
                ..
            } => {}
            other => panic!("expected Crashed for instance 1, got {:?}", other),
        }
    }

    #[test]
    fn health_names_are_stable() {
        assert_eq!(PoolHealth::Healthy.as_str(), "healthy");
        assert_eq!(PoolHealth::Degraded.as_str(), "degraded");
        assert_eq!(PoolHealth::Failed.as_str(), "failed");
    }
}
