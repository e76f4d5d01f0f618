use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{RaftError, Result};

/// Install the global subscriber. Log lines are written from a background thread, which is
/// flushed when the returned guard is dropped.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
    let (writer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "raftlock.log");
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter(&config.level)?)
        .with(
            fmt::Layer::new()
                .compact()
                .with_ansi(config.directory.is_none())
                .with_writer(writer),
        );
    tracing::subscriber::set_global_default(subscriber).map_err(|err| RaftError::Internal {
        error_msg: err.to_string(),
    })?;
    Ok(guard)
}

fn filter(level: &str) -> Result<EnvFilter> {
    let config_error = |error_msg: String| RaftError::Config {
        file_path: String::new(),
        error_msg,
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|err| config_error(err.to_string()))?,
    };
    let waker = "tokio::task::waker=off"
        .parse()
        .map_err(|err: tracing_subscriber::filter::ParseError| config_error(err.to_string()))?;
    Ok(filter.add_directive(waker))
}
