//! Logging setup for the `duet` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// `-v` steps up from the default.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// The WebRTC stack logs every STUN binding and SCTP chunk at debug level.
const NOISY_DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_mdns",
    "tokio_tungstenite",
    "tungstenite",
    "mio",
];

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level.to_filter()))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    INIT.set(()).ok();
    Ok(())
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    if let Ok(filter) = std::env::var("DUET_LOG_FILTER").or_else(|_| std::env::var("RUST_LOG")) {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level, allow_dependency_logs()))
}

fn allow_dependency_logs() -> bool {
    std::env::var("DUET_TRACE_DEPS").is_ok_and(|value| value != "0" && !value.is_empty())
}

fn default_filter_for(level: LevelFilter, deps: bool) -> String {
    let mut filter = match level {
        LevelFilter::TRACE => "info,duet=trace,duet_session=trace".to_owned(),
        LevelFilter::DEBUG => "info,duet=debug,duet_session=debug".to_owned(),
        other => other.to_string().to_lowercase(),
    };
    if level >= LevelFilter::DEBUG && !deps {
        for target in NOISY_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=warn");
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn verbose_levels_quiet_the_webrtc_stack() {
        let filter = default_filter_for(LevelFilter::DEBUG, false);
        assert!(filter.starts_with("info,duet=debug"));
        assert!(filter.contains("webrtc_ice=warn"));
        assert!(!default_filter_for(LevelFilter::DEBUG, true).contains("webrtc_ice"));
    }

    #[test_timeout::timeout]
    fn quiet_levels_pass_through() {
        assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(7), LogLevel::Trace);
    }
}
