//! Error types shared across the core library.
//!
//! Most stage code never returns these to the orchestrator: a failed tool
//! invocation is turned into a `false` plus a log line at the stage boundary.
//! The enums below cover the cases where a caller genuinely needs to branch.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to run an external program at all (as opposed to the program
/// running and exiting non-zero, which is a normal [`crate::runner::CommandOutput`]).
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while looking for a candidate device.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("lsblk exited with {code:?}: {stderr}")]
    Lsblk { code: Option<i32>, stderr: String },

    #[error("could not parse lsblk output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("refusing to choose between {} USB disks: {}", .0.len(), .0.join(", "))]
    Ambiguous(Vec<String>),
}

/// Errors raised while loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by an illumination output.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("PWM channel {path} is unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a write is refused before any data reaches the device.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("cannot read image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image is {image} bytes but the device only holds {device} bytes")]
    TooLarge { image: u64, device: u64 },
}
