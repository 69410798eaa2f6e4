//! The post type shared by every thread source.
//!
//! `Post` carries only what the watch core needs: identity, the reply graph,
//! and the "mentions viewer" flag. Rendering concerns (formatted comment
//! text, images, flags) stay with the source that produced it.
//!
//! ## For contributors
//!
//! Posts are compared across fetches by `no` only. Two posts with the same
//! number are the same post even if an edit or a moderator action changed
//! their fields in between.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single post, normalised from any thread source.
///
/// ## Sorting
///
/// `Post` implements [`Ord`] by post number, ascending, which is thread
/// order on every imageboard this crate talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post number, unique per board.
    pub no: u64,

    /// Number of the thread's opening post; `0` when this post *is* the
    /// opening post.
    pub resto: u64,

    /// When the post was made.
    pub time: DateTime<Utc>,

    /// Subject line, usually only present on the opening post.
    #[serde(default)]
    pub subject: Option<String>,

    /// Raw comment markup as delivered by the remote.
    #[serde(default)]
    pub comment: String,

    /// Post numbers this post quotes.
    #[serde(default)]
    pub replies_to: BTreeSet<u64>,

    /// Set when the post quotes one of the viewer's own posts.
    #[serde(default)]
    pub mentions_viewer: bool,

    /// Thread closed to new replies (opening post only).
    #[serde(default)]
    pub closed: bool,

    /// Thread moved to the archive (opening post only).
    #[serde(default)]
    pub archived: bool,
}

impl Post {
    pub fn is_op(&self) -> bool {
        self.resto == 0
    }
}

impl Ord for Post {
    fn cmp(&self, other: &Self) -> Ordering {
        self.no.cmp(&other.no)
    }
}

impl PartialOrd for Post {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
