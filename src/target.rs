//! Identity of a watched remote thread or board.
//!
//! A [`WatchTarget`] is the sharing key for the loader pool: two targets
//! that compare equal always resolve to the same watcher.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// How a target is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoadMode {
    /// Page through a board's thread listing, one page per poll.
    Catalog,
    /// Re-fetch a single thread's full post list on every poll.
    Thread,
}

/// A remote thread (or board listing) to poll.
///
/// Immutable once built. Catalog targets always carry thread number `0`;
/// the page cursor lives in the watcher, not in the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchTarget {
    pub board: String,
    pub no: u64,
    pub mode: LoadMode,
}

impl WatchTarget {
    pub fn thread(board: impl Into<String>, no: u64) -> Self {
        Self {
            board: board.into(),
            no,
            mode: LoadMode::Thread,
        }
    }

    pub fn catalog(board: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            no: 0,
            mode: LoadMode::Catalog,
        }
    }

    pub fn is_catalog(&self) -> bool {
        self.mode == LoadMode::Catalog
    }

    /// File-name-safe key, used by the JSON store.
    pub fn storage_key(&self) -> String {
        match self.mode {
            LoadMode::Thread => format!("{}_{}", self.board, self.no),
            LoadMode::Catalog => format!("{}_catalog", self.board),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            LoadMode::Thread => write!(f, "/{}/{}", self.board, self.no),
            LoadMode::Catalog => write!(f, "/{}/", self.board),
        }
    }
}

/// Parses `board/no` as a thread and `board` as a catalog. Leading and
/// trailing slashes are ignored, so `/g/123` and `g/` also work.
impl FromStr for WatchTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        let mut parts = trimmed.split('/');

        let board = match parts.next() {
            Some(b) if !b.is_empty() && b.chars().all(|c| c.is_ascii_alphanumeric()) => b,
            _ => return Err(Error::InvalidTarget(s.to_string())),
        };

        let target = match parts.next() {
            None => WatchTarget::catalog(board),
            Some(no) => {
                let no: u64 = no
                    .parse()
                    .map_err(|_| Error::InvalidTarget(s.to_string()))?;
                if no == 0 {
                    return Err(Error::InvalidTarget(s.to_string()));
                }
                WatchTarget::thread(board, no)
            }
        };

        if parts.next().is_some() {
            return Err(Error::InvalidTarget(s.to_string()));
        }

        Ok(target)
    }
}
