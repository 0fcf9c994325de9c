//! Structured logging setup via `simplelog` + the `log` facade — the
//! teacher's own logging stack, retargeted from screen-recorder diagnostics
//! to decode-pipeline diagnostics.

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

/// Resolves the effective level from an explicit `--log-level` string, or
/// else from a `-v` occurrence count, defaulting to `Info`.
pub fn resolve_level(explicit: Option<&str>, verbose_count: u8) -> LevelFilter {
    if let Some(name) = explicit {
        return match name.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            other => {
                eprintln!("unrecognized log level {other:?}, falling back to info");
                LevelFilter::Info
            }
        };
    }
    match verbose_count {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(level: LevelFilter) {
    if let Err(e) = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("failed to initialize terminal logger: {e}");
    }
}
