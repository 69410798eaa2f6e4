//! Sinks the watch core reports into.
//!
//! Both traits are fire-and-forget and are called on the polling thread.
//! Implementations must not block for long; anything slow should be handed
//! off to another thread.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::source::Post;
use crate::target::WatchTarget;

/// Receives the aggregate after every poll pass.
pub trait NotificationSink: Send {
    fn notify(&self, unseen_total: usize, with_mentions: &BTreeSet<WatchTarget>);
}

/// Receives the full post list after every successful fetch.
pub trait PersistenceSink: Send {
    fn persist(&self, target: &WatchTarget, posts: &[Post]);
}

// ---------------------------------------------------------------------------
// Notification sinks
// ---------------------------------------------------------------------------

/// Logs the aggregate and nothing else.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, unseen_total: usize, with_mentions: &BTreeSet<WatchTarget>) {
        info!(unseen_total, mentions = with_mentions.len(), "watch pass settled");
    }
}

/// One pass's aggregate, as delivered by [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Summary {
    pub unseen_total: usize,
    pub with_mentions: BTreeSet<WatchTarget>,
}

/// Forwards each aggregate over a channel, typically to the UI thread.
pub struct ChannelNotifier {
    tx: Sender<Summary>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, Receiver<Summary>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, unseen_total: usize, with_mentions: &BTreeSet<WatchTarget>) {
        let summary = Summary {
            unseen_total,
            with_mentions: with_mentions.clone(),
        };
        if self.tx.send(summary).is_err() {
            debug!("summary receiver dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// JSON store
// ---------------------------------------------------------------------------

/// Keeps the last fetched post list of every target as a JSON file, so a
/// thread can be shown before the first live fetch completes.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, target: &WatchTarget) -> PathBuf {
        self.dir.join(format!("{}.json", target.storage_key()))
    }

    /// The stored posts for `target`, or `None` if nothing was stored yet.
    pub fn load(&self, target: &WatchTarget) -> Result<Option<Vec<Post>>> {
        match fs::read(self.path_for(target)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, target: &WatchTarget, posts: &[Post]) -> Result<()> {
        let path = self.path_for(target);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(posts)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl PersistenceSink for JsonStore {
    fn persist(&self, target: &WatchTarget, posts: &[Post]) {
        if let Err(e) = self.save(target, posts) {
            warn!(thread = %target, error = %e, "failed to store posts");
        }
    }
}
