//! Configuration errors shared by the gateway and its crates

use std::path::PathBuf;

/// Failure to load or validate gateway configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value was present but unusable
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// The file named by `credentials.keys_file` could not be read
    #[error("failed to read keys_file {}: {source}", path.display())]
    KeysFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
