//! Error types for configuration, module installation and hook chaining.

use std::path::PathBuf;

/// Rejected configuration write. The previous value stays in effect.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized configuration parameter \"{0}\"")]
    UnknownParameter(String),

    #[error("invalid value for parameter \"{name}\": \"{value}\"")]
    InvalidValue { name: String, value: String },

    #[error("{value} is outside the valid range for parameter \"{name}\" ({min} .. {max})")]
    OutOfRange {
        name: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("directory \"{}\" is not writable: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Module could not be installed. Nothing was hooked.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InitError {
    #[error("this module can only be loaded via shared_preload_libraries")]
    NotPreloaded,
}

/// Hook chain manipulation failed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("hook {0} is not installed")]
    UnknownHook(u64),

    #[error("hook {id} cannot be removed while {above} hook(s) installed after it are active")]
    NotTopmost { id: u64, above: usize },
}
