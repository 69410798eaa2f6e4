//! Error types for the watch core.
//!
//! Remote fetch failures are not errors here: they travel as
//! [`FetchResult::Failure`](crate::source::FetchResult) values. What remains
//! is configuration trouble, I/O in the sinks, and programmer errors in the
//! pool's reference counting, which are reported immediately.

use config::ConfigError;

use crate::target::WatchTarget;
use crate::watcher::ListenerId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration sources could not be read or deserialized
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration loaded but its values are unusable
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid watch target: {0:?}")]
    InvalidTarget(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The polling thread has exited and no longer accepts commands
    #[error("Watch service is not running")]
    ServiceStopped,

    /// The HTTP client could not be built
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Misuse of the loader pool's obtain/release pairing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Release for a listener that never obtained this target, or was
    /// already released.
    #[error("Loader does not exist for {target} (listener {listener})")]
    NotObtained {
        target: WatchTarget,
        listener: ListenerId,
    },

    #[error("Listener {listener} is already attached to {target}")]
    AlreadyAttached {
        target: WatchTarget,
        listener: ListenerId,
    },

    /// A command addressed a target with no live watcher.
    #[error("No live watcher for {0}")]
    NoWatcher(WatchTarget),
}
