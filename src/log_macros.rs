//! Thin wrapper over the `log` crate giving call sites the `log!(Level, "...")`
//! shape used throughout this codebase, instead of the four separate
//! `log::{error,warn,info,debug}!` macros.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

impl From<LogLevel> for log::Level {
    fn from(l: LogLevel) -> log::Level {
        match l {
            LogLevel::LogError => log::Level::Error,
            LogLevel::LogWarn => log::Level::Warn,
            LogLevel::LogInfo => log::Level::Info,
            LogLevel::LogDebug => log::Level::Debug,
        }
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        log::log!(log::Level::from($level), $($arg)+)
    };
}

/// `verbosity` is the `-v` occurrence count from the CLI:
/// 0 -> warnings and above, 1 -> info, 2 -> debug, 3+ -> trace. `RUST_LOG`
/// still overrides this default if set.
pub fn init(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}
