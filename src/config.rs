use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use crate::raft::config::RaftConfig;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RaftlockConfig {
    pub raft: RaftConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, such as `info` or `raftlock::raft=debug`. `RUST_LOG` takes
    /// precedence when set.
    pub level: String,
    /// Write to a daily rolling file in this directory instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Load the config file at `config_path`, overridden by `RAFTLOCK_` environment variables, e.g.
/// `RAFTLOCK_RAFT__PORT=6670`.
pub fn load<P: AsRef<Path>>(config_path: P) -> Result<RaftlockConfig> {
    let path = config_path.as_ref();
    let config_error = |err: config::ConfigError| RaftError::Config {
        file_path: path.display().to_string(),
        error_msg: err.to_string(),
    };

    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("RAFTLOCK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(config_error)?;
    let config: RaftlockConfig = settings.try_deserialize().map_err(config_error)?;

    config.raft.validate().map_err(|err| RaftError::Config {
        file_path: path.display().to_string(),
        error_msg: err.to_string(),
    })?;
    Ok(config)
}
