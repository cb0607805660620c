//! Structured JSON logging.
//!
//! One JSON object per line on stdout: timestamp, level, logger, message,
//! module, line. Context such as camera ids travels inline in the message
//! (`"[cam-a] ..."`), keeping call sites on the plain `log` macros.

use std::io::Write;

use chrono::{SecondsFormat, Utc};
use log::LevelFilter;

const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Parse a `LOG_LEVEL` value. Accepts the python-style `WARNING` alias;
/// unknown values fall back to `INFO`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARNING" | "WARN" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("unknown LOG_LEVEL '{}', using INFO", other);
            LevelFilter::Info
        }
    }
}

/// Initialise logging from the `LOG_LEVEL` environment variable
/// (DEBUG|INFO|WARNING|ERROR, default INFO).
pub fn init_from_env() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "INFO".to_string());
    init_with_level(parse_level(&level));
}

pub fn init_with_level(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let entry = serde_json::json!({
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "level": record.level().to_string(),
                "logger": record.target(),
                "message": record.args().to_string(),
                "module": record.module_path().unwrap_or_default(),
                "line": record.line().unwrap_or_default(),
            });
            writeln!(buf, "{}", entry)
        })
        .try_init();
    // Re-initialisation (tests) is fine; keep the first logger.
    if result.is_err() {
        log::debug!("logger already initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_python_style_names() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("info"), LevelFilter::Info);
        assert_eq!(parse_level("WARNING"), LevelFilter::Warn);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("Error"), LevelFilter::Error);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("verbose"), LevelFilter::Info);
    }
}
