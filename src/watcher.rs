//! One subscription to one remote thread.
//!
//! A [`ThreadWatcher`] issues fetches through a [`Dispatch`] implementation,
//! applies their results, and keeps the per-target [`WatchState`]. It never
//! blocks: starting a fetch hands a [`FetchRequest`] to the dispatcher and
//! returns, and the result comes back later through
//! [`ThreadWatcher::complete`].
//!
//! At most one fetch is in flight. Every fetch carries a sequence number;
//! a completion whose number is not the current one belongs to a cancelled
//! fetch and is dropped.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::backoff::{BackoffScheduler, BackoffTable};
use crate::errors::PoolError;
use crate::notify::PersistenceSink;
use crate::source::{Failure, FetchHandle, FetchRequest, FetchResult, Post};
use crate::target::WatchTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Messages sent from the polling thread to a listener's thread.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A fetch succeeded. `append` is set when `posts` grew by one more
    /// catalog page; otherwise it replaces what the listener had.
    Posts {
        target: WatchTarget,
        posts: Arc<Vec<Post>>,
        append: bool,
    },
    /// A fetch failed; the listener should show the error state.
    Failed { target: WatchTarget, failure: Failure },
    /// Catalog pagination reached the last page.
    EndOfThread { target: WatchTarget },
}

/// One consumer attached to a watcher.
#[derive(Debug)]
pub struct Listener {
    pub id: ListenerId,
    /// Where to deliver [`WatchEvent`]s; `None` for consumers that only
    /// read snapshots (pins).
    pub events: Option<Sender<WatchEvent>>,
    /// Keep re-fetching on the backoff timer while attached.
    pub auto_reload: bool,
}

impl Listener {
    pub fn silent(id: ListenerId) -> Self {
        Self {
            id,
            events: None,
            auto_reload: false,
        }
    }
}

/// Starts fetches on behalf of watchers.
///
/// The completion must come back to [`ThreadWatcher::complete`] on the
/// polling thread with the same watcher id and sequence number.
pub trait Dispatch {
    fn dispatch(&self, watcher: WatcherId, seq: u64, request: FetchRequest) -> FetchHandle;
}

/// Unseen post ids, as a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unseen {
    pub posts: BTreeSet<u64>,
    pub mentions: BTreeSet<u64>,
}

/// Mutable per-target record, owned by its watcher.
#[derive(Debug, Clone)]
pub struct WatchState {
    backoff: BackoffScheduler,
    error: Option<Failure>,
    unseen: Unseen,
}

impl WatchState {
    fn new(table: BackoffTable) -> Self {
        Self {
            backoff: BackoffScheduler::new(table),
            error: None,
            unseen: Unseen::default(),
        }
    }

    pub fn last_post_count(&self) -> usize {
        self.backoff.last_post_count()
    }

    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.backoff.last_fetch()
    }

    pub fn backoff_index(&self) -> usize {
        self.backoff.index()
    }

    pub fn error(&self) -> Option<&Failure> {
        self.error.as_ref()
    }
}

/// Read-only view of a watcher for display.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSnapshot {
    pub watcher: WatcherId,
    pub target: WatchTarget,
    pub last_post_count: usize,
    pub last_fetch: Option<DateTime<Utc>>,
    pub backoff_index: usize,
    pub error: Option<Failure>,
    pub unseen_posts: usize,
    pub unseen_mentions: usize,
    pub fetching: bool,
    pub archived: bool,
    pub fully_paginated: bool,
    pub listeners: usize,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    handle: FetchHandle,
}

pub struct ThreadWatcher {
    id: WatcherId,
    target: WatchTarget,
    state: WatchState,
    listeners: Vec<Listener>,
    /// Posts from the last successful fetch; emptied on error.
    posts: Arc<Vec<Post>>,
    /// Every post number seen since the first load, for diffing.
    known: HashSet<u64>,
    loaded_once: bool,
    in_flight: Option<InFlight>,
    next_seq: u64,
    next_page: u32,
    fully_paginated: bool,
    archived: bool,
    timer: Option<DateTime<Utc>>,
}

impl ThreadWatcher {
    pub fn new(id: WatcherId, target: WatchTarget, table: BackoffTable) -> Self {
        debug!(%id, thread = %target, "watcher created");
        Self {
            id,
            target,
            state: WatchState::new(table),
            listeners: Vec::new(),
            posts: Arc::new(Vec::new()),
            known: HashSet::new(),
            loaded_once: false,
            in_flight: None,
            next_seq: 0,
            next_page: 0,
            fully_paginated: false,
            archived: false,
            timer: None,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    pub fn posts(&self) -> Arc<Vec<Post>> {
        Arc::clone(&self.posts)
    }

    // -- listeners -----------------------------------------------------------

    pub fn attach(&mut self, listener: Listener) -> Result<(), PoolError> {
        if self.listeners.iter().any(|l| l.id == listener.id) {
            return Err(PoolError::AlreadyAttached {
                target: self.target.clone(),
                listener: listener.id,
            });
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Detach a listener and return how many remain.
    pub fn detach(&mut self, listener: ListenerId) -> Result<usize, PoolError> {
        let pos = self
            .listeners
            .iter()
            .position(|l| l.id == listener)
            .ok_or_else(|| PoolError::NotObtained {
                target: self.target.clone(),
                listener,
            })?;
        self.listeners.remove(pos);
        if !self.wants_auto_reload() {
            self.timer = None;
        }
        Ok(self.listeners.len())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn wants_auto_reload(&self) -> bool {
        self.listeners.iter().any(|l| l.auto_reload)
    }

    // -- scheduling ----------------------------------------------------------

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn time_until_next_poll(&self, now: DateTime<Utc>) -> TimeDelta {
        self.state.backoff.time_until_next_poll(now)
    }

    /// Whether a pass should poll this watcher now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_fetching()
            && !self.archived
            && !(self.target.is_catalog() && self.fully_paginated)
            && self.time_until_next_poll(now) <= TimeDelta::zero()
    }

    /// Apply or lift the background floor. An armed auto-reload timer is
    /// re-armed against the new step.
    pub fn set_background_floor(&mut self, enabled: bool) {
        self.state.backoff.set_background_floor(enabled);
        if self.timer.take().is_some() {
            self.ensure_timer();
        }
    }

    /// The armed auto-reload deadline, if any.
    pub fn timer(&self) -> Option<DateTime<Utc>> {
        self.timer
    }

    /// Arm the auto-reload timer from the last fetch, if a listener wants
    /// live updates and nothing is pending yet.
    pub fn ensure_timer(&mut self) {
        if self.wants_auto_reload() && !self.is_fetching() && !self.archived && self.timer.is_none() {
            self.timer = self.state.backoff.next_deadline();
        }
    }

    /// Fire the auto-reload timer if it is due. Returns whether it fired.
    pub fn fire_timer(&mut self, dispatcher: &dyn Dispatch, now: DateTime<Utc>) -> bool {
        match self.timer {
            Some(at) if at <= now => {
                self.timer = None;
                self.poll(dispatcher)
            }
            _ => false,
        }
    }

    // -- fetching ------------------------------------------------------------

    /// Issue a fetch unless one is already outstanding. Returns whether a
    /// fetch was started.
    pub fn poll(&mut self, dispatcher: &dyn Dispatch) -> bool {
        if self.is_fetching() {
            debug!(thread = %self.target, "poll coalesced with in-flight fetch");
            return false;
        }
        if self.target.is_catalog() && self.fully_paginated {
            return false;
        }
        self.start_fetch(dispatcher);
        true
    }

    /// User-requested reload: drop any in-flight fetch and start over now.
    pub fn reload(&mut self, dispatcher: &dyn Dispatch) {
        self.cancel();
        self.state.backoff.force_immediate();
        if self.target.is_catalog() {
            self.next_page = 0;
            self.fully_paginated = false;
        }
        self.start_fetch(dispatcher);
    }

    fn start_fetch(&mut self, dispatcher: &dyn Dispatch) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let page = if self.target.is_catalog() { self.next_page } else { 0 };
        let request = FetchRequest {
            target: self.target.clone(),
            page,
            known: Arc::clone(&self.posts),
        };

        debug!(thread = %self.target, seq, page, "fetch started");
        let handle = dispatcher.dispatch(self.id, seq, request);
        self.in_flight = Some(InFlight { seq, handle });
        self.timer = None;
    }

    /// Cancel the in-flight fetch and the pending timer. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(mut in_flight) = self.in_flight.take() {
            debug!(thread = %self.target, seq = in_flight.seq, "fetch cancelled");
            in_flight.handle.cancel();
        }
        self.timer = None;
    }

    /// Apply the result of fetch `seq`. Returns `false` when the result was
    /// stale and dropped.
    pub fn complete(
        &mut self,
        seq: u64,
        result: FetchResult,
        now: DateTime<Utc>,
        store: Option<&dyn PersistenceSink>,
    ) -> bool {
        if self.in_flight.as_ref().map(|f| f.seq) != Some(seq) {
            warn!(thread = %self.target, seq, "dropping stale fetch result");
            return false;
        }
        self.in_flight = None;

        match result {
            FetchResult::Success { posts, incremental } => {
                self.on_success(posts, incremental, now, store)
            }
            FetchResult::Failure(failure) if !failure.kind.is_error() => self.on_end_of_thread(),
            FetchResult::Failure(failure) => self.on_failure(failure),
        }
        true
    }

    fn on_success(
        &mut self,
        posts: Vec<Post>,
        incremental: bool,
        now: DateTime<Utc>,
        store: Option<&dyn PersistenceSink>,
    ) {
        let append = self.target.is_catalog() && incremental;

        let mut fresh = 0;
        for post in &posts {
            if self.known.insert(post.no) && self.loaded_once {
                fresh += 1;
                self.state.unseen.posts.insert(post.no);
                if post.mentions_viewer {
                    self.state.unseen.mentions.insert(post.no);
                }
            }
        }

        let merged = if append {
            let mut all = (*self.posts).clone();
            all.extend(posts);
            all
        } else {
            posts
        };
        self.posts = Arc::new(merged);

        if self.target.is_catalog() {
            self.next_page += 1;
        }

        self.loaded_once = true;
        self.state.error = None;

        if !self.target.is_catalog() {
            if let Some(op) = self.posts.iter().find(|p| p.is_op()) {
                if (op.archived || op.closed) && !self.archived {
                    info!(thread = %self.target, archived = op.archived, closed = op.closed, "thread stopped accepting replies");
                    self.archived = true;
                }
            }
        }

        self.state.backoff.on_fetch_completed(self.posts.len(), now);
        if self.wants_auto_reload() && !self.archived {
            self.timer = self.state.backoff.next_deadline();
        }

        debug!(
            thread = %self.target,
            posts = self.posts.len(),
            fresh,
            unseen = self.state.unseen.posts.len(),
            "fetch applied"
        );

        self.broadcast(WatchEvent::Posts {
            target: self.target.clone(),
            posts: Arc::clone(&self.posts),
            append,
        });

        if let Some(store) = store {
            store.persist(&self.target, &self.posts);
        }
    }

    fn on_end_of_thread(&mut self) {
        debug!(thread = %self.target, pages = self.next_page, "reached last page");
        self.fully_paginated = true;
        self.broadcast(WatchEvent::EndOfThread {
            target: self.target.clone(),
        });
    }

    fn on_failure(&mut self, failure: Failure) {
        warn!(thread = %self.target, kind = %failure.kind, message = %failure.message, "fetch failed");

        self.state.error = Some(failure.clone());
        self.posts = Arc::new(Vec::new());
        if self.target.is_catalog() {
            self.next_page = 0;
        }

        // No auto-reload after an error; pin passes and manual reloads retry
        // at the unchanged backoff step.
        self.timer = None;

        self.broadcast(WatchEvent::Failed {
            target: self.target.clone(),
            failure,
        });
    }

    fn broadcast(&self, event: WatchEvent) {
        for listener in &self.listeners {
            if let Some(events) = &listener.events {
                if events.send(event.clone()).is_err() {
                    debug!(listener = %listener.id, "listener channel closed");
                }
            }
        }
    }

    // -- unseen counters -----------------------------------------------------

    /// Current unseen ids. Reading does not clear them.
    pub fn unseen(&self) -> Unseen {
        self.state.unseen.clone()
    }

    /// Mark everything seen so far as read.
    pub fn acknowledge(&mut self) {
        self.state.unseen = Unseen::default();
    }

    pub fn snapshot(&self) -> WatchSnapshot {
        WatchSnapshot {
            watcher: self.id,
            target: self.target.clone(),
            last_post_count: self.state.last_post_count(),
            last_fetch: self.state.last_fetch(),
            backoff_index: self.state.backoff_index(),
            error: self.state.error.clone(),
            unseen_posts: self.state.unseen.posts.len(),
            unseen_mentions: self.state.unseen.mentions.len(),
            fetching: self.is_fetching(),
            archived: self.archived,
            fully_paginated: self.fully_paginated,
            listeners: self.listeners.len(),
        }
    }

    /// Tear down for good. Consumes the watcher so nothing can poll it
    /// afterwards.
    pub fn destroy(mut self) {
        self.cancel();
        debug!(id = %self.id, thread = %self.target, "watcher destroyed");
    }
}

impl fmt::Debug for ThreadWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWatcher")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("listeners", &self.listeners.len())
            .field("fetching", &self.is_fetching())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
