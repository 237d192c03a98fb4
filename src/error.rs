use std::io;

/// Startup failures that terminate the process. Everything below the
/// local-port level is absorbed by the sweep and reported through the
/// log instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error reading config file: {0}")]
    ConfigRead(#[source] io::Error),

    #[error("error parsing config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no InfiniBand channel adapters found")]
    NoAdapters,

    #[error(transparent)]
    Io(#[from] io::Error),
}
