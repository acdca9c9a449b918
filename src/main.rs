mod config;
mod coordinator;
mod credentials;
mod error;
mod frontend;
mod guard;
mod instance;
mod logging;
mod platform;
mod pool;
mod ports;
mod probe;
mod redirect;
#[cfg(target_os = "linux")]
mod redirect_linux;
#[cfg(target_os = "macos")]
mod redirect_macos;
mod template;

use clap::{Args as ClapArgs, Parser, Subcommand};
use config::{BinaryConfig, SupervisorConfig};
use coordinator::{Coordinator, Outcome};
use error::SupervisorError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "torflock",
    about = "multi-instance tor proxy supervisor with transparent host redirection"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunOptions {
    #[arg(long, default_value_t = config::DEFAULT_INSTANCES)]
    instances: usize,
    #[arg(long, default_value_t = config::DEFAULT_SOCKS_BASE_PORT)]
    socks_base_port: u16,
    #[arg(long, default_value_t = config::DEFAULT_CONTROL_BASE_PORT)]
    control_base_port: u16,
    #[arg(long, default_value_t = config::DEFAULT_LB_FRONT_PORT)]
    lb_front_port: u16,
    /// 0 disables the HTTP filter.
    #[arg(long, default_value_t = config::DEFAULT_FILTER_LISTEN_PORT)]
    filter_listen_port: u16,
    /// Effective user for the onion-router children (defaults to the invoker).
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value_t = config::DEFAULT_BOOTSTRAP_TIMEOUT_SECS, value_name = "SECONDS")]
    bootstrap_timeout: u64,
    #[arg(long, default_value_t = config::DEFAULT_HEALTH_INTERVAL_SECS, value_name = "SECONDS")]
    health_interval: u64,
    #[arg(long, default_value_t = config::DEFAULT_GRACE_SECS, value_name = "SECONDS")]
    grace: u64,
    #[arg(long, default_value_t = config::DEFAULT_PROBE_TIMEOUT_SECS, value_name = "SECONDS")]
    probe_timeout: u64,
    #[arg(long, default_value_t = config::DEFAULT_START_DEADLINE_SECS, value_name = "SECONDS")]
    start_deadline: u64,
    #[arg(long, default_value_t = config::DEFAULT_STOP_DEADLINE_SECS, value_name = "SECONDS")]
    stop_deadline: u64,
    #[arg(long)]
    templates_dir: PathBuf,
    #[arg(long)]
    run_dir: PathBuf,
    #[arg(long, default_value = "/usr/bin/tor")]
    tor_bin: PathBuf,
    #[arg(long, default_value = "/usr/sbin/haproxy")]
    haproxy_bin: PathBuf,
    #[arg(long, default_value = "/usr/sbin/privoxy")]
    privoxy_bin: PathBuf,
    /// iptables on linux, pfctl on macos.
    #[arg(long, default_value = default_packet_filter())]
    packet_filter_bin: PathBuf,
    #[arg(long, default_value = "/sbin/route")]
    route_bin: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the proxy chain up and run until SIGINT/SIGTERM.
    Up(RunOptions),
    /// Preflight only: binaries, templates, ports, packet-filter access.
    /// Never mutates host state.
    Check(RunOptions),
    /// Show the platform capability profile.
    Status {
        #[arg(long)]
        json: bool,
    },
}

const fn default_packet_filter() -> &'static str {
    if cfg!(target_os = "macos") {
        "/sbin/pfctl"
    } else {
        "/usr/sbin/iptables"
    }
}

fn build_config(opts: &RunOptions) -> SupervisorConfig {
    SupervisorConfig {
        instances: opts.instances,
        socks_base_port: opts.socks_base_port,
        control_base_port: opts.control_base_port,
        lb_front_port: opts.lb_front_port,
        filter_listen_port: opts.filter_listen_port,
        user: opts.user.clone(),
        bootstrap_timeout: Duration::from_secs(opts.bootstrap_timeout),
        health_interval: Duration::from_secs(opts.health_interval),
        grace: Duration::from_secs(opts.grace),
        probe_timeout: Duration::from_secs(opts.probe_timeout),
        start_deadline: Duration::from_secs(opts.start_deadline),
        stop_deadline: Duration::from_secs(opts.stop_deadline),
        templates_dir: opts.templates_dir.clone(),
        run_dir: opts.run_dir.clone(),
        binaries: BinaryConfig {
            tor: opts.tor_bin.clone(),
            haproxy: opts.haproxy_bin.clone(),
            privoxy: Some(opts.privoxy_bin.clone()),
            packet_filter: opts.packet_filter_bin.clone(),
            route: cfg!(target_os = "macos").then(|| opts.route_bin.clone()),
        },
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Up(opts) => run_up(opts).await,
        Command::Check(opts) => run_check(opts).await,
        Command::Status { json } => run_status(json),
    };
    std::process::exit(code);
}

async fn run_up(opts: RunOptions) -> i32 {
    if let Err(err) = platform::require_transparent_redirect("up") {
        eprintln!("torflock: {}", err);
        return 2;
    }
    let cfg = build_config(&opts);

    let lock_path = cfg.run_dir.join("torflock.pid");
    let _lock = match guard::RunLock::acquire(&lock_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            eprintln!(
                "torflock: another supervisor is already running (pid file {})",
                lock_path.display()
            );
            return 2;
        }
        Err(err) => {
            eprintln!("torflock: cannot take the run lock: {}", err);
            return 2;
        }
    };

    let mut coordinator = match Coordinator::new(cfg) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            eprintln!("torflock: {}", err);
            return 2;
        }
    };

    let outcome = coordinator.start().await;
    if let Some(err) = &outcome.error {
        eprintln!("torflock: start failed: {}", err);
        print_teardown_failures(&outcome);
        return outcome.exit_code();
    }

    let outcome = coordinator.supervise().await;
    if let Some(err) = &outcome.error {
        eprintln!("torflock: run ended with failure: {}", err);
        print_restore_hints(err);
    }
    print_teardown_failures(&outcome);
    outcome.exit_code()
}

fn print_teardown_failures(outcome: &Outcome) {
    for (stage, err) in &outcome.rollback_errors {
        eprintln!("torflock: teardown step {} failed: {}", stage, err);
        print_restore_hints(err);
    }
}

/// A failed restore leaves the host in a state the operator must look at;
/// the commands to do that go to stderr, not just the structured log.
fn print_restore_hints(err: &SupervisorError) {
    let SupervisorError::RestoreFailed { hints, .. } = err else {
        return;
    };
    if hints.is_empty() {
        return;
    }
    eprintln!("torflock: inspect and clean up by hand:");
    for hint in hints {
        eprintln!("torflock:   {}", hint);
    }
}

/// Everything `up` would verify before touching the host, reported without
/// side effects.
async fn run_check(opts: RunOptions) -> i32 {
    let cfg = build_config(&opts);
    let mut failed = false;

    if let Err(err) = cfg.validate() {
        println!("config: FAIL ({})", err);
        failed = true;
    } else {
        println!("config: ok");
    }

    match cfg.binaries.resolve(cfg.filter_enabled()) {
        Ok(binaries) => {
            println!("binaries: ok (tor {})", binaries.tor.display());
            match redirect::for_current_platform(binaries.packet_filter.clone(), binaries.route) {
                Ok(redirector) => {
                    if redirector.probe().await {
                        println!("packet filter: ok");
                    } else {
                        println!(
                            "packet filter: FAIL ({} not usable; missing privileges?)",
                            binaries.packet_filter.display()
                        );
                        failed = true;
                    }
                }
                Err(err) => {
                    println!("packet filter: FAIL ({})", err);
                    failed = true;
                }
            }
        }
        Err(err) => {
            println!("binaries: FAIL ({})", err);
            failed = true;
        }
    }

    match template::load(&cfg.templates_dir, cfg.filter_enabled()) {
        Ok(_) => println!("templates: ok"),
        Err(err) => {
            println!("templates: FAIL ({})", err);
            failed = true;
        }
    }

    match ports::allocate(&cfg) {
        Ok(map) => println!(
            "ports: ok (socks {:?}, control {:?}, dns {}, lb {})",
            map.socks, map.control, map.dns, map.lb_front
        ),
        Err(err) => {
            println!("ports: FAIL ({})", err);
            failed = true;
        }
    }

    let profile = platform::current();
    println!(
        "platform: {}-{} redirect={} ({})",
        profile.os,
        profile.arch,
        profile.transparent_redirect.as_str(),
        profile.note
    );

    if failed {
        2
    } else {
        0
    }
}

#[derive(serde::Serialize)]
struct StatusReport<'a> {
    os: &'a str,
    arch: &'a str,
    process_supervision: &'a str,
    transparent_redirect: &'a str,
    packet_filter: &'a str,
    note: &'a str,
}

fn run_status(json: bool) -> i32 {
    let profile = platform::current();
    if json {
        let report = StatusReport {
            os: profile.os,
            arch: profile.arch,
            process_supervision: profile.process_supervision.as_str(),
            transparent_redirect: profile.transparent_redirect.as_str(),
            packet_filter: profile.packet_filter,
            note: profile.note,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("torflock: cannot serialize status: {}", err);
                return 2;
            }
        }
    } else {
        println!("os: {}-{}", profile.os, profile.arch);
        println!(
            "process supervision: {}",
            profile.process_supervision.as_str()
        );
        println!(
            "transparent redirect: {} via {}",
            profile.transparent_redirect.as_str(),
            profile.packet_filter
        );
        println!("note: {}", profile.note);
    }
    0
}
