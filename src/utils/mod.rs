// src/utils/mod.rs
use log::info;
use std::str::FromStr;

/// Installs the global fern logger. `level` accepts the usual `log` names
/// (`trace`..`error`); anything unparseable falls back to `info`.
pub fn setup_logging(level: &str) -> Result<(), fern::InitError> {
    let level = log::LevelFilter::from_str(level.trim()).unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("tokio_tungstenite", log::LevelFilter::Warn)
        .level_for("tungstenite", log::LevelFilter::Warn)
        .level_for("sqlx", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized at {}.", level);
    Ok(())
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shortens a base58 key for log lines.
pub fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
