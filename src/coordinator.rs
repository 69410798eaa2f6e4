//! The process-wide polling driver.
//!
//! The coordinator owns the loader pool and the list of pins. While
//! running it performs a *pass* every interval: each watching pin whose
//! watcher is due gets polled, and once every poll issued by the pass has
//! completed, the aggregate unseen count is handed to the notification sink
//! exactly once.
//!
//! Everything here runs on the polling thread. Methods take `now`
//! explicitly so the timing logic can be tested without a clock.
//!
//! ## For contributors
//!
//! The pass interval depends on two inputs, the foreground flag and
//! [`WatchSettings::background_enabled`]:
//!
//! | foreground | background enabled | interval |
//! |------------|--------------------|----------|
//! | yes        | any                | `foreground_interval_ms` |
//! | no         | yes                | `background_interval_ms` |
//! | no         | no                 | none, wait for a command |

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::mpsc::Sender;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::errors::{Error, PoolError, Result};
use crate::notify::{NotificationSink, PersistenceSink};
use crate::pool::LoaderPool;
use crate::settings::WatchSettings;
use crate::source::FetchResult;
use crate::target::WatchTarget;
use crate::watcher::{Dispatch, Listener, ListenerId, Unseen, WatchEvent, WatchSnapshot, WatcherId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Running,
}

#[derive(Debug)]
struct Pin {
    target: WatchTarget,
    listener: ListenerId,
    watching: bool,
}

/// A pin as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct PinStatus {
    pub target: WatchTarget,
    pub watching: bool,
    pub watch: Option<WatchSnapshot>,
}

/// Proof of an `obtain`; hand it back to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub target: WatchTarget,
    pub listener: ListenerId,
    pub watcher: WatcherId,
}

pub struct Coordinator<D> {
    pool: LoaderPool,
    pins: Vec<Pin>,
    settings: WatchSettings,
    foreground: bool,
    phase: Phase,
    last_pass: Option<DateTime<Utc>>,
    /// Polls of the current pass still outstanding; `None` once settled.
    pass: Option<HashSet<WatchTarget>>,
    notifier: Box<dyn NotificationSink>,
    store: Option<Box<dyn PersistenceSink>>,
    dispatcher: D,
    next_listener: u64,
}

impl<D: Dispatch> Coordinator<D> {
    pub fn new(
        settings: WatchSettings,
        dispatcher: D,
        notifier: Box<dyn NotificationSink>,
        store: Option<Box<dyn PersistenceSink>>,
    ) -> Result<Self> {
        settings.validate()?;
        let table = settings.backoff_table()?;
        let capacity = NonZeroUsize::new(settings.cache_capacity)
            .ok_or_else(|| Error::InvalidSettings("cache_capacity must be at least 1".into()))?;

        Ok(Self {
            pool: LoaderPool::new(capacity, table),
            pins: Vec::new(),
            settings,
            foreground: true,
            phase: Phase::Stopped,
            last_pass: None,
            pass: None,
            notifier,
            store,
            dispatcher,
            next_listener: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn allocate_listener(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }

    // -- consumers -----------------------------------------------------------

    /// Attach a new consumer to `target`'s watcher. A watcher that has
    /// never fetched, or is already due, is polled right away.
    pub fn obtain(
        &mut self,
        target: &WatchTarget,
        events: Option<Sender<WatchEvent>>,
        auto_reload: bool,
        now: DateTime<Utc>,
    ) -> std::result::Result<Subscription, PoolError> {
        let listener = self.allocate_listener();
        let watcher = self.pool.obtain(
            target,
            Listener {
                id: listener,
                events,
                auto_reload,
            },
        )?;

        let floor = self.background_floor();
        if let Some(w) = self.pool.get_mut(target) {
            w.set_background_floor(floor);
            if w.is_due(now) {
                w.poll(&self.dispatcher);
            } else {
                w.ensure_timer();
            }
        }

        debug!(thread = %target, %listener, %watcher, "listener attached");
        Ok(Subscription {
            target: target.clone(),
            listener,
            watcher,
        })
    }

    pub fn release(&mut self, subscription: &Subscription) -> std::result::Result<(), PoolError> {
        self.pool.release(&subscription.target, subscription.listener)?;
        if self.pool.get(&subscription.target).is_none() {
            self.forget_pending(&subscription.target);
        }
        Ok(())
    }

    /// Manual reload: cancel whatever is in flight and fetch now.
    pub fn reload(&mut self, target: &WatchTarget) -> std::result::Result<(), PoolError> {
        let watcher = self
            .pool
            .get_mut(target)
            .ok_or_else(|| PoolError::NoWatcher(target.clone()))?;
        info!(thread = %target, "manual reload");
        watcher.reload(&self.dispatcher);
        Ok(())
    }

    pub fn unseen(&self, target: &WatchTarget) -> std::result::Result<Unseen, PoolError> {
        self.pool
            .get(target)
            .map(|w| w.unseen())
            .ok_or_else(|| PoolError::NoWatcher(target.clone()))
    }

    pub fn acknowledge(&mut self, target: &WatchTarget) -> std::result::Result<(), PoolError> {
        let watcher = self
            .pool
            .get_mut(target)
            .ok_or_else(|| PoolError::NoWatcher(target.clone()))?;
        watcher.acknowledge();
        Ok(())
    }

    // -- pins ----------------------------------------------------------------

    /// Pin `target`. Returns `false` if it was already pinned.
    pub fn add_pin(&mut self, target: WatchTarget, now: DateTime<Utc>) -> std::result::Result<bool, PoolError> {
        if self.pins.iter().any(|p| p.target == target) {
            return Ok(false);
        }

        let listener = self.allocate_listener();
        self.pool.obtain(&target, Listener::silent(listener))?;
        info!(thread = %target, "pinned");
        self.pins.push(Pin {
            target: target.clone(),
            listener,
            watching: true,
        });

        let was_running = self.phase == Phase::Running;
        self.update_state(now);

        // A fresh pin should not wait a whole interval for its first load.
        if was_running {
            if let Some(w) = self.pool.get_mut(&target) {
                if w.is_due(now) {
                    w.poll(&self.dispatcher);
                }
            }
        }
        Ok(true)
    }

    /// Unpin `target`. Returns `false` if it was not pinned.
    pub fn remove_pin(&mut self, target: &WatchTarget, now: DateTime<Utc>) -> std::result::Result<bool, PoolError> {
        let Some(index) = self.pins.iter().position(|p| &p.target == target) else {
            return Ok(false);
        };
        let pin = self.pins.remove(index);
        self.pool.release(&pin.target, pin.listener)?;
        info!(thread = %target, "unpinned");

        self.forget_pending(target);
        self.update_state(now);
        Ok(true)
    }

    /// Turn polling of one pin on or off. Returns `false` if not pinned.
    pub fn set_pin_watching(&mut self, target: &WatchTarget, watching: bool, now: DateTime<Utc>) -> bool {
        let Some(pin) = self.pins.iter_mut().find(|p| &p.target == target) else {
            return false;
        };
        pin.watching = watching;
        if !watching {
            self.forget_pending(target);
        }
        self.update_state(now);
        true
    }

    /// Stop polling every pin, keeping them pinned.
    pub fn pause_all(&mut self, now: DateTime<Utc>) {
        for pin in &mut self.pins {
            pin.watching = false;
        }
        info!("all pins paused");
        self.update_state(now);
    }

    pub fn pins(&self) -> Vec<PinStatus> {
        self.pins
            .iter()
            .map(|pin| PinStatus {
                target: pin.target.clone(),
                watching: pin.watching,
                watch: self.pool.get(&pin.target).map(|w| w.snapshot()),
            })
            .collect()
    }

    // -- lifecycle -----------------------------------------------------------

    pub fn set_foreground(&mut self, foreground: bool, now: DateTime<Utc>) {
        if self.foreground == foreground {
            return;
        }
        info!(foreground, "foreground state changed");
        self.foreground = foreground;
        self.update_state(now);
    }

    /// Apply new settings. Invalid settings are logged and ignored.
    pub fn update_settings(&mut self, settings: WatchSettings, now: DateTime<Utc>) {
        if let Err(e) = settings.validate() {
            warn!(error = %e, "rejected settings update");
            return;
        }
        if settings.backoff_secs != self.settings.backoff_secs
            || settings.cache_capacity != self.settings.cache_capacity
        {
            info!("backoff table and cache capacity changes apply after restart");
        }
        self.settings = settings;
        self.update_state(now);
    }

    fn background_floor(&self) -> bool {
        !self.foreground && !self.settings.background_enabled
    }

    fn update_state(&mut self, now: DateTime<Utc>) {
        let floor = self.background_floor();
        for watcher in self.pool.live_mut() {
            watcher.set_background_floor(floor);
        }

        let should_run = self.settings.enabled && self.pins.iter().any(|p| p.watching);
        match (self.phase, should_run) {
            (Phase::Stopped, true) => {
                info!(pins = self.pins.len(), "watching started");
                self.phase = Phase::Running;
                self.run_pass(now);
            }
            (Phase::Running, false) => {
                info!("watching stopped");
                self.phase = Phase::Stopped;
                for pin in &self.pins {
                    if let Some(w) = self.pool.get_mut(&pin.target) {
                        w.cancel();
                    }
                }
                self.settle_pass();
                self.last_pass = None;
            }
            _ => {}
        }
    }

    /// Interval between passes in the current mode.
    pub fn pass_interval(&self) -> Option<TimeDelta> {
        if self.foreground {
            Some(self.settings.foreground_interval())
        } else if self.settings.background_enabled {
            Some(self.settings.background_interval())
        } else {
            None
        }
    }

    fn next_pass(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.phase != Phase::Running {
            return None;
        }
        let interval = self.pass_interval()?;
        match self.last_pass {
            Some(last) => last.checked_add_signed(interval),
            None => Some(now),
        }
    }

    /// When the polling thread should wake up next; `None` means sleep
    /// until a command arrives.
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timers = self.pool.live().filter_map(|w| w.timer()).min();
        match (self.next_pass(now), timers) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run whatever is due at `now`: a pass, and any auto-reload timers.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if matches!(self.next_pass(now), Some(at) if at <= now) {
            self.run_pass(now);
        }
        for watcher in self.pool.live_mut() {
            watcher.fire_timer(&self.dispatcher, now);
        }
    }

    // -- passes --------------------------------------------------------------

    fn run_pass(&mut self, now: DateTime<Utc>) {
        self.settle_pass();
        self.last_pass = Some(now);

        let mut issued = HashSet::new();
        for pin in self.pins.iter().filter(|p| p.watching) {
            if let Some(w) = self.pool.get_mut(&pin.target) {
                if w.is_due(now) && w.poll(&self.dispatcher) {
                    issued.insert(pin.target.clone());
                }
            }
        }

        debug!(polled = issued.len(), pins = self.pins.len(), "pass started");
        let settled = issued.is_empty();
        self.pass = Some(issued);
        if settled {
            self.settle_pass();
        }
    }

    fn forget_pending(&mut self, target: &WatchTarget) {
        let drained = match self.pass.as_mut() {
            Some(pending) => pending.remove(target) && pending.is_empty(),
            None => false,
        };
        if drained {
            self.settle_pass();
        }
    }

    fn settle_pass(&mut self) {
        if self.pass.take().is_some() {
            self.notify();
        }
    }

    fn notify(&self) {
        let mut unseen_total = 0;
        let mut with_mentions = BTreeSet::new();
        for pin in self.pins.iter().filter(|p| p.watching) {
            if let Some(w) = self.pool.get(&pin.target) {
                let unseen = w.unseen();
                unseen_total += unseen.posts.len();
                if !unseen.mentions.is_empty() {
                    with_mentions.insert(pin.target.clone());
                }
            }
        }
        self.notifier.notify(unseen_total, &with_mentions);
    }

    /// Route a fetch completion to its watcher.
    pub fn on_fetch_completed(
        &mut self,
        watcher: WatcherId,
        target: &WatchTarget,
        seq: u64,
        result: FetchResult,
        now: DateTime<Utc>,
    ) {
        let Some(w) = self.pool.get_mut(target) else {
            debug!(thread = %target, seq, "completion for a parked watcher dropped");
            return;
        };
        if w.id() != watcher {
            debug!(thread = %target, seq, "completion for a destroyed watcher dropped");
            return;
        }

        if w.complete(seq, result, now, self.store.as_deref()) {
            self.forget_pending(target);
        }
    }

    /// Cancel everything and destroy all watchers.
    pub fn shutdown(&mut self) {
        info!("shutting down watch coordinator");
        self.phase = Phase::Stopped;
        self.pass = None;
        self.pins.clear();
        self.pool.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
