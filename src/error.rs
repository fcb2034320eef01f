use std::io;

use thiserror::Error;

/// Startup-fatal configuration failures. Everything else the daemon logs and
/// survives.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid listen address {addr}: {reason}")]
    ListenAddr { addr: String, reason: String },

    #[error("startup failed: {0}")]
    Startup(String),
}

/// Reasons a frame launch is refused at admission. Surfaced to the caller as
/// a typed RPC status; the daemon state is unchanged when any of these fire.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("frame {0} is already running on this host")]
    AlreadyExists(String),

    #[error("insufficient cores: requested {requested}, available {available}")]
    InsufficientCores { requested: i32, available: i32 },

    #[error("host is locked pending {0}")]
    PendingHostAction(&'static str),

    #[error("NIMBY is enabled and a user is logged in")]
    NimbyLocked,

    #[error("invalid run frame: {0}")]
    Invalid(String),
}

/// A lookup for a frame id the registry does not know.
#[derive(Debug, Error)]
#[error("no such frame: {0}")]
pub struct FrameNotFound(pub String);
