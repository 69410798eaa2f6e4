//! Thread source abstraction layer.
//!
//! This module defines the [`ThreadSource`] trait, the [`FetchResult`] every
//! fetch completes with, and the failure classification rules the watcher
//! and the backoff depend on. Concrete sources live in sub-modules
//! (currently only [`chan`]).
//!
//! ## For contributors: adding a new source
//!
//! 1. Create a new file in this directory (e.g. `lynx.rs`).
//! 2. Define a struct and implement [`ThreadSource`] for it.
//! 3. Map every transport/HTTP/decode failure to a [`FetchError`] and run it
//!    through [`classify`]; never invent a [`FailureKind`] directly.
//! 4. Construct an instance in `main.rs` and hand it to `poll::spawn`.
//!
//! The polling loop, the diffing, and the backoff are all source-agnostic.

pub mod chan;
mod post;

pub use chan::ChanSource;
pub use post::Post;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::target::{LoadMode, WatchTarget};

// ---------------------------------------------------------------------------
// Fetch results
// ---------------------------------------------------------------------------

/// Why a fetch produced no posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No HTTP response at all (DNS, connect, timeout).
    Network,
    /// The remote answered with an error status, or anything unclassified.
    Server,
    /// The response body was not valid data.
    Parse,
    /// Catalog mode walked past the last page. Not a fault.
    EndOfThread,
}

impl FailureKind {
    /// Whether this failure should put the target into error state.
    pub fn is_error(self) -> bool {
        !matches!(self, FailureKind::EndOfThread)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Network => "network error",
            FailureKind::Server => "server error",
            FailureKind::Parse => "parse error",
            FailureKind::EndOfThread => "end of thread",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Human-readable detail for logs and the status bar.
    pub message: String,
}

/// Outcome of exactly one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// The current posts. `incremental` is set when `posts` is one more
    /// catalog page to append rather than a full replacement.
    Success { posts: Vec<Post>, incremental: bool },
    Failure(Failure),
}

impl FetchResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        FetchResult::Failure(Failure {
            kind,
            message: message.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Raw failure as observed by a source, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request never produced an HTTP response.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    /// The body could not be decoded.
    #[error("decode failure: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// Map a raw failure to the kind the watcher acts on.
///
/// An HTTP error status is the normal "no more pages" signal in catalog mode
/// once at least one page has loaded (`page > 0`); anywhere else it is a
/// genuine server error.
pub fn classify(error: &FetchError, mode: LoadMode, page: u32) -> FailureKind {
    match error {
        FetchError::Transport(_) => FailureKind::Network,
        FetchError::Status(_) if mode == LoadMode::Catalog && page > 0 => FailureKind::EndOfThread,
        FetchError::Decode(_) => FailureKind::Parse,
        FetchError::Status(_) | FetchError::Other(_) => FailureKind::Server,
    }
}

impl FetchError {
    /// Classify and wrap into a failed [`FetchResult`].
    pub fn into_result(self, request: &FetchRequest) -> FetchResult {
        let kind = classify(&self, request.target.mode, request.page);
        FetchResult::failure(kind, self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Everything a source needs to perform one fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub target: WatchTarget,
    /// Zero-based catalog page; always `0` in thread mode.
    pub page: u32,
    /// Posts from the last successful fetch, for sources that can reuse
    /// already-parsed posts.
    pub known: Arc<Vec<Post>>,
}

pub type FetchFuture = Pin<Box<dyn Future<Output = FetchResult> + Send + 'static>>;

/// Trait that every thread source must implement.
///
/// The returned future must resolve exactly once, to either a success or a
/// classified failure. It is spawned on the tokio runtime and may be
/// aborted at any `.await` point; it must not rely on running to
/// completion for cleanup.
pub trait ThreadSource: Send + Sync {
    /// Human-readable label for logs.
    fn name(&self) -> &str;

    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels one outstanding fetch.
///
/// Cancelling is idempotent: a second call, or a call after the fetch
/// already completed, does nothing.
#[derive(Debug)]
pub struct FetchHandle {
    inner: HandleInner,
}

#[derive(Debug)]
enum HandleInner {
    Task(AbortHandle),
    Flag(Arc<AtomicBool>),
    Spent,
}

impl FetchHandle {
    /// Wrap a spawned tokio task.
    pub fn from_task(handle: AbortHandle) -> Self {
        Self {
            inner: HandleInner::Task(handle),
        }
    }

    /// A handle that only raises a flag, for dispatchers that do not run on
    /// tokio. The flag reads `true` once the fetch was cancelled.
    pub fn flag() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = Self {
            inner: HandleInner::Flag(Arc::clone(&flag)),
        };
        (handle, flag)
    }

    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.inner, HandleInner::Spent) {
            HandleInner::Task(handle) => handle.abort(),
            HandleInner::Flag(flag) => flag.store(true, Ordering::SeqCst),
            HandleInner::Spent => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_is_network_error() {
        let e = FetchError::Transport("connection refused".into());
        assert_eq!(classify(&e, LoadMode::Thread, 0), FailureKind::Network);
        assert_eq!(classify(&e, LoadMode::Catalog, 3), FailureKind::Network);
    }

    #[test]
    fn status_after_first_catalog_page_is_end_of_thread() {
        let e = FetchError::Status(404);
        assert_eq!(classify(&e, LoadMode::Catalog, 1), FailureKind::EndOfThread);
        assert_eq!(classify(&e, LoadMode::Catalog, 9), FailureKind::EndOfThread);
    }

    #[test]
    fn status_on_first_catalog_page_is_server_error() {
        let e = FetchError::Status(404);
        assert_eq!(classify(&e, LoadMode::Catalog, 0), FailureKind::Server);
    }

    #[test]
    fn status_in_thread_mode_is_server_error() {
        let e = FetchError::Status(404);
        assert_eq!(classify(&e, LoadMode::Thread, 0), FailureKind::Server);
        assert_eq!(classify(&FetchError::Status(500), LoadMode::Thread, 0), FailureKind::Server);
    }

    #[test]
    fn decode_failure_is_parse_error() {
        let e = FetchError::Decode("expected value".into());
        assert_eq!(classify(&e, LoadMode::Thread, 0), FailureKind::Parse);
        assert_eq!(classify(&e, LoadMode::Catalog, 2), FailureKind::Parse);
    }

    #[test]
    fn unclassified_failure_is_server_error() {
        let e = FetchError::Other("redirect loop".into());
        assert_eq!(classify(&e, LoadMode::Thread, 0), FailureKind::Server);
    }

    #[test]
    fn end_of_thread_is_not_an_error() {
        assert!(!FailureKind::EndOfThread.is_error());
        assert!(FailureKind::Network.is_error());
        assert!(FailureKind::Parse.is_error());
    }

    #[test]
    fn cancel_is_idempotent() {
        let (mut handle, flag) = FetchHandle::flag();
        handle.cancel();
        assert!(flag.load(Ordering::SeqCst));
        handle.cancel();
        assert!(flag.load(Ordering::SeqCst));
    }
}
