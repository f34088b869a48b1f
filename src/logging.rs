use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Install a global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(level: Level, json_output: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zcache={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(false);

        Registry::default().with(env_filter).with(fmt_layer).try_init().is_ok()
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true);

        Registry::default().with(env_filter).with(fmt_layer).try_init().is_ok()
    }
}
