//! Adaptive poll timing.
//!
//! A watcher waits `table[index]` after each fetch before polling again.
//! The index drops to zero whenever a fetch finds more posts than the one
//! before it, and climbs one step (up to the last entry) whenever it does
//! not. Failed fetches never move the index; only
//! [`BackoffScheduler::on_fetch_completed`] does, and the watcher calls it
//! for successes only.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::{Error, Result};

/// Representative wait steps, in seconds.
pub const DEFAULT_BACKOFF_SECS: [u64; 13] = [10, 15, 20, 30, 60, 90, 120, 180, 240, 300, 600, 1800, 3600];

/// Shortest wait allowed for subscriptions polled in the background while
/// background watching is disabled.
pub const DEFAULT_BACKGROUND_FLOOR_SECS: u64 = 60;

/// Longest wait any step or poll interval may configure: one week.
pub const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

/// Validated, shareable timeout table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffTable {
    steps: Arc<[TimeDelta]>,
    /// First index whose step reaches the background floor.
    floor_index: usize,
}

impl BackoffTable {
    /// Build a table from second values. The values must be non-empty,
    /// non-decreasing and at most [`MAX_WAIT_SECS`].
    pub fn new(secs: &[u64], background_floor_secs: u64) -> Result<Self> {
        if secs.is_empty() {
            return Err(Error::InvalidSettings("backoff table is empty".into()));
        }
        if secs.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::InvalidSettings(format!(
                "backoff table must be non-decreasing, got {secs:?}"
            )));
        }

        if let Some(&too_long) = secs.iter().find(|&&s| s > MAX_WAIT_SECS) {
            return Err(Error::InvalidSettings(format!(
                "backoff step {too_long}s exceeds the {MAX_WAIT_SECS}s maximum"
            )));
        }

        let floor_index = secs
            .iter()
            .position(|&s| s >= background_floor_secs)
            .unwrap_or(secs.len() - 1);

        let steps = secs
            .iter()
            .map(|&s| TimeDelta::try_seconds(s as i64))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::InvalidSettings(format!("backoff table out of range: {secs:?}")))?
            .into();

        Ok(Self { steps, floor_index })
    }

    pub fn max_index(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn step(&self, index: usize) -> TimeDelta {
        self.steps[index.min(self.max_index())]
    }

    pub fn floor_index(&self) -> usize {
        self.floor_index
    }
}

impl Default for BackoffTable {
    fn default() -> Self {
        // The constant table is non-empty and sorted.
        Self::new(&DEFAULT_BACKOFF_SECS, DEFAULT_BACKGROUND_FLOOR_SECS)
            .expect("default backoff table is valid")
    }
}

/// Per-watcher backoff state.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    table: BackoffTable,
    index: usize,
    last_post_count: usize,
    last_fetch: Option<DateTime<Utc>>,
    background_floor: bool,
}

impl BackoffScheduler {
    pub fn new(table: BackoffTable) -> Self {
        Self {
            table,
            index: 0,
            last_post_count: 0,
            last_fetch: None,
            background_floor: false,
        }
    }

    /// Record a successful fetch that returned `post_count` posts at `now`.
    pub fn on_fetch_completed(&mut self, post_count: usize, now: DateTime<Utc>) {
        if post_count > self.last_post_count {
            self.index = 0;
        } else {
            self.index = (self.index + 1).min(self.table.max_index());
        }
        self.last_post_count = post_count;
        self.last_fetch = Some(now);

        tracing::trace!(
            index = self.index,
            wait_secs = self.current_step().num_seconds(),
            "backoff updated"
        );
    }

    /// Time left before the next poll is due. Zero or negative means due.
    pub fn time_until_next_poll(&self, now: DateTime<Utc>) -> TimeDelta {
        match self.last_fetch {
            Some(last) => self.current_step() - (now - last),
            None => TimeDelta::zero(),
        }
    }

    /// When the next poll becomes due, if a fetch has completed yet.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.last_fetch.map(|last| last + self.current_step())
    }

    /// Make the next due-check fire immediately (manual reload).
    pub fn force_immediate(&mut self) {
        self.index = 0;
        self.last_fetch = None;
    }

    /// Keep background-only subscriptions at or above the floor step.
    pub fn set_background_floor(&mut self, enabled: bool) {
        self.background_floor = enabled;
    }

    /// Index in effect, after the background floor.
    pub fn index(&self) -> usize {
        if self.background_floor {
            self.index.max(self.table.floor_index())
        } else {
            self.index
        }
    }

    pub fn current_step(&self) -> TimeDelta {
        self.table.step(self.index())
    }

    pub fn last_post_count(&self) -> usize {
        self.last_post_count
    }

    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.last_fetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    #[test]
    fn table_rejects_empty_and_decreasing() {
        assert!(BackoffTable::new(&[], 60).is_err());
        assert!(BackoffTable::new(&[10, 5], 60).is_err());
        assert!(BackoffTable::new(&[10, 10, 20], 60).is_ok());
    }

    #[test]
    fn table_rejects_steps_past_the_maximum() {
        assert!(BackoffTable::new(&[10, 1 << 60], 60).is_err());
        assert!(BackoffTable::new(&[10, u64::MAX], 60).is_err());
        let longest = BackoffTable::new(&[10, MAX_WAIT_SECS], 60).unwrap();
        assert_eq!(longest.step(1), secs(MAX_WAIT_SECS as i64));
    }

    #[test]
    fn floor_index_is_first_step_reaching_floor() {
        let table = BackoffTable::default();
        assert_eq!(table.floor_index(), 4);
        assert_eq!(table.step(table.floor_index()), secs(60));

        let short = BackoffTable::new(&[5, 10], 60).unwrap();
        assert_eq!(short.floor_index(), 1, "clamps to the last step");
    }

    #[test]
    fn flat_post_count_never_decreases_index_and_stays_in_bounds() {
        let table = BackoffTable::default();
        let mut backoff = BackoffScheduler::new(table.clone());
        backoff.on_fetch_completed(5, t0());

        let mut previous = backoff.index();
        for i in 0..40 {
            backoff.on_fetch_completed(5, t0() + secs(i));
            assert!(backoff.index() >= previous);
            assert!(backoff.index() <= table.max_index());
            previous = backoff.index();
        }
        assert_eq!(backoff.index(), table.max_index());
    }

    #[test]
    fn shrinking_post_count_also_backs_off() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        backoff.on_fetch_completed(10, t0());
        backoff.on_fetch_completed(8, t0());
        assert_eq!(backoff.index(), 1);
        assert_eq!(backoff.last_post_count(), 8);
    }

    #[test]
    fn growth_resets_index() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        backoff.on_fetch_completed(5, t0());
        for _ in 0..6 {
            backoff.on_fetch_completed(5, t0());
        }
        assert!(backoff.index() > 0);

        backoff.on_fetch_completed(6, t0());
        assert_eq!(backoff.index(), 0);
        assert_eq!(backoff.time_until_next_poll(t0()), secs(10));
    }

    #[test]
    fn time_until_next_poll_counts_down_and_goes_negative() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        assert_eq!(backoff.time_until_next_poll(t0()), TimeDelta::zero());

        backoff.on_fetch_completed(3, t0());
        assert_eq!(backoff.time_until_next_poll(t0() + secs(4)), secs(6));
        assert_eq!(backoff.time_until_next_poll(t0() + secs(25)), secs(-15));
        assert_eq!(backoff.next_deadline(), Some(t0() + secs(10)));
    }

    #[test]
    fn force_immediate_makes_poll_due_now() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        backoff.on_fetch_completed(3, t0());
        backoff.on_fetch_completed(3, t0());
        backoff.force_immediate();

        assert_eq!(backoff.index(), 0);
        assert!(backoff.time_until_next_poll(t0()) <= TimeDelta::zero());
        assert_eq!(backoff.last_post_count(), 3, "baseline survives a reload");
    }

    #[test]
    fn background_floor_holds_at_least_sixty_seconds() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        backoff.on_fetch_completed(1, t0());
        assert_eq!(backoff.current_step(), secs(10));

        backoff.set_background_floor(true);
        assert_eq!(backoff.current_step(), secs(60));

        backoff.on_fetch_completed(2, t0());
        assert_eq!(backoff.current_step(), secs(60), "growth cannot go under the floor");

        backoff.set_background_floor(false);
        assert_eq!(backoff.current_step(), secs(10));
    }

    #[test]
    fn scenario_flat_then_growth() {
        let mut backoff = BackoffScheduler::new(BackoffTable::default());
        backoff.on_fetch_completed(5, t0());
        backoff.force_immediate();
        backoff.on_fetch_completed(5, t0());
        assert_eq!(backoff.current_step(), secs(15));

        backoff.on_fetch_completed(8, t0() + secs(20));
        assert_eq!(backoff.index(), 0);
        assert_eq!(backoff.current_step(), secs(10));
    }
}
