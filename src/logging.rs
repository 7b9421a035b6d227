use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("MG24_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize stderr logging based on `MG24_LOG`/`RUST_LOG`.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_rust_logging() {
    let level = env_level();
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}
