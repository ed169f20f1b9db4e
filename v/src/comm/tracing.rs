use anyhow::Result;
use chrono::{Datelike, Timelike};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(
            w,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis()
        )
    }
}

/// 初始化日志（级别来自 logging.level，RUST_LOG 优先）
/// Initialise tracing (level from logging.level, RUST_LOG wins when set)
pub fn init_tracing() -> Result<()> {
    let level: String = crate::comm::config::get_global_config_manager()
        .ok()
        .and_then(|mgr| mgr.get("logging.level").ok())
        .unwrap_or_else(|| "info".to_string());
    init_tracing_with_level(&level)
}

pub fn init_tracing_with_level(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},sled=warn,actix_server=warn", level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    LogTracer::init().ok();
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}
