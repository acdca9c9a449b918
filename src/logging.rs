use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// One line per event: UTC timestamp, level, component target, event
/// message, key=value fields. Sensitive values (the control password) are
/// never passed as fields anywhere in the crate.
pub fn init() {
    let timer = UtcTime::new(time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
    ));
    let filter = EnvFilter::try_from_env("TORFLOCK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(timer)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
