use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use anyhow::Result;
use ratatui::widgets::ListState;
use tracing::{info, warn};

use chanwatch::coordinator::{PinStatus, Subscription};
use chanwatch::notify::{JsonStore, Summary};
use chanwatch::poll::WatchService;
use chanwatch::settings::WatchSettings;
use chanwatch::source::{Failure, Post};
use chanwatch::watcher::WatchEvent;
use chanwatch::WatchTarget;

use crate::input::Action;

/// The thread shown in the right-hand panel.
pub struct OpenThread {
    pub subscription: Subscription,
    pub posts: Arc<Vec<Post>>,
    /// Showing the stored copy until the first live fetch lands.
    pub stored: bool,
    pub error: Option<Failure>,
    pub fully_paginated: bool,
    events: Receiver<WatchEvent>,
}

impl OpenThread {
    pub fn target(&self) -> &WatchTarget {
        &self.subscription.target
    }

    fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Posts { posts, .. } => {
                self.posts = posts;
                self.stored = false;
                self.error = None;
            }
            WatchEvent::Failed { failure, .. } => {
                self.posts = Arc::new(Vec::new());
                self.stored = false;
                self.error = Some(failure);
            }
            WatchEvent::EndOfThread { .. } => self.fully_paginated = true,
        }
    }
}

pub struct App {
    /// Latest pin snapshots from the polling thread.
    pub pins: Vec<PinStatus>,
    pub list_state: ListState,
    pub open: Option<OpenThread>,
    /// Aggregate from the last settled pass.
    pub summary: Summary,
    /// Mirror of the runtime watch settings, for the global toggle.
    pub settings: WatchSettings,
    pub quit: bool,
    /// Last action outcome or error.
    pub status: String,
}

impl App {
    pub fn new(settings: WatchSettings) -> Self {
        Self {
            pins: Vec::new(),
            list_state: ListState::default(),
            open: None,
            summary: Summary::default(),
            settings,
            quit: false,
            status: "Starting…".into(),
        }
    }

    /// Replace the pin list, keeping the selection in range.
    pub fn set_pins(&mut self, pins: Vec<PinStatus>) {
        self.pins = pins;
        match self.list_state.selected() {
            _ if self.pins.is_empty() => self.list_state.select(None),
            Some(i) if i >= self.pins.len() => self.list_state.select(Some(self.pins.len() - 1)),
            None => self.list_state.select(Some(0)),
            Some(_) => {}
        }
    }

    pub fn set_summary(&mut self, summary: Summary) {
        self.summary = summary;
    }

    /// Apply everything the open thread's watcher sent since last time.
    pub fn drain_events(&mut self) {
        if let Some(open) = self.open.as_mut() {
            while let Ok(event) = open.events.try_recv() {
                open.apply(event);
            }
        }
    }

    pub fn selected_pin(&self) -> Option<&PinStatus> {
        self.list_state.selected().and_then(|i| self.pins.get(i))
    }

    /// Target actions like reload apply to: the open thread, else the
    /// selected pin.
    pub fn focused_target(&self) -> Option<WatchTarget> {
        self.open
            .as_ref()
            .map(|o| o.target().clone())
            .or_else(|| self.selected_pin().map(|p| p.target.clone()))
    }

    // -- navigation ----------------------------------------------------------

    pub fn select_next(&mut self) {
        if self.pins.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) => (i + 1).min(self.pins.len() - 1),
            None => 0,
        };
        self.list_state.select(Some(i));
    }

    pub fn select_previous(&mut self) {
        if self.pins.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) => i.saturating_sub(1),
            None => 0,
        };
        self.list_state.select(Some(i));
    }

    pub fn select_first(&mut self) {
        if !self.pins.is_empty() {
            self.list_state.select(Some(0));
        }
    }

    pub fn select_last(&mut self) {
        if !self.pins.is_empty() {
            self.list_state.select(Some(self.pins.len() - 1));
        }
    }

    // -- actions -------------------------------------------------------------

    /// Carry out `action` against the watch service.
    pub fn perform(&mut self, action: Action, service: &WatchService, store: Option<&JsonStore>) -> Result<()> {
        match action {
            Action::Quit => self.quit = true,
            Action::SelectNext => self.select_next(),
            Action::SelectPrevious => self.select_previous(),
            Action::SelectFirst => self.select_first(),
            Action::SelectLast => self.select_last(),
            Action::Open => {
                if let Some(target) = self.selected_pin().map(|p| p.target.clone()) {
                    self.open_thread(target, service, store)?;
                }
            }
            Action::Close => self.close_thread(service)?,
            Action::Reload => {
                if let Some(target) = self.focused_target() {
                    service.reload(target.clone())?;
                    self.status = format!("Reloading {target}");
                }
            }
            Action::Acknowledge => {
                if let Some(target) = self.focused_target() {
                    service.acknowledge(target.clone())?;
                    self.status = format!("Marked {target} as read");
                }
            }
            Action::TogglePinWatching => {
                if let Some(pin) = self.selected_pin() {
                    let (target, watching) = (pin.target.clone(), !pin.watching);
                    service.set_pin_watching(target.clone(), watching)?;
                    self.status = format!("{target}: watching {}", if watching { "on" } else { "off" });
                }
            }
            Action::PauseAll => {
                service.pause_all()?;
                self.status = "All pins paused".into();
            }
            Action::RemovePin => {
                if let Some(target) = self.selected_pin().map(|p| p.target.clone()) {
                    if self.open.as_ref().is_some_and(|o| o.target() == &target) {
                        self.close_thread(service)?;
                    }
                    service.remove_pin(target.clone())?;
                    self.status = format!("Unpinned {target}");
                }
            }
            Action::ToggleWatching => {
                self.settings.enabled = !self.settings.enabled;
                service.update_settings(self.settings.clone())?;
                self.status = format!("Watching {}", if self.settings.enabled { "enabled" } else { "disabled" });
            }
            Action::Focus(foreground) => service.set_foreground(foreground)?,
        }
        Ok(())
    }

    fn open_thread(&mut self, target: WatchTarget, service: &WatchService, store: Option<&JsonStore>) -> Result<()> {
        self.close_thread(service)?;

        let stored = match store.map(|s| s.load(&target)).transpose() {
            Ok(posts) => posts.flatten(),
            Err(e) => {
                warn!(thread = %target, error = %e, "stored posts unreadable");
                None
            }
        };

        let (tx, events) = mpsc::channel();
        let subscription = service.obtain(target.clone(), Some(tx), true)?;
        service.acknowledge(target.clone())?;
        info!(thread = %target, "opened");

        self.open = Some(OpenThread {
            subscription,
            stored: stored.is_some(),
            posts: Arc::new(stored.unwrap_or_default()),
            error: None,
            fully_paginated: false,
            events,
        });
        self.status = format!("Opened {target}");
        Ok(())
    }

    fn close_thread(&mut self, service: &WatchService) -> Result<()> {
        if let Some(open) = self.open.take() {
            service.release(open.subscription)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chanwatch::source::FailureKind;
    use chanwatch::watcher::{ListenerId, WatchSnapshot, WatcherId};
    use chrono::{TimeZone, Utc};

    pub(crate) fn pin(no: u64, unseen: usize, mentions: usize) -> PinStatus {
        let target = WatchTarget::thread("g", no);
        PinStatus {
            target: target.clone(),
            watching: true,
            watch: Some(WatchSnapshot {
                watcher: WatcherId(no),
                target,
                last_post_count: 10,
                last_fetch: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
                backoff_index: 0,
                error: None,
                unseen_posts: unseen,
                unseen_mentions: mentions,
                fetching: false,
                archived: false,
                fully_paginated: false,
                listeners: 1,
            }),
        }
    }

    pub(crate) fn post(no: u64, comment: &str) -> Post {
        Post {
            no,
            resto: if no == 1 { 0 } else { 1 },
            time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            subject: None,
            comment: comment.into(),
            replies_to: Default::default(),
            mentions_viewer: false,
            closed: false,
            archived: false,
        }
    }

    /// An open thread fed by the returned sender.
    pub(crate) fn open_thread(no: u64) -> (OpenThread, mpsc::Sender<WatchEvent>) {
        let (tx, events) = mpsc::channel();
        let target = WatchTarget::thread("g", no);
        let open = OpenThread {
            subscription: Subscription {
                target,
                listener: ListenerId(1),
                watcher: WatcherId(no),
            },
            posts: Arc::new(vec![post(1, "stored")]),
            stored: true,
            error: None,
            fully_paginated: false,
            events,
        };
        (open, tx)
    }

    fn app_with_pins(n: u64) -> App {
        let mut app = App::new(WatchSettings::default());
        app.set_pins((1..=n).map(|no| pin(no, 0, 0)).collect());
        app
    }

    #[test]
    fn new_app_starts_empty() {
        let app = App::new(WatchSettings::default());
        assert!(app.pins.is_empty());
        assert!(!app.quit);
        assert!(app.list_state.selected().is_none());
        assert!(app.focused_target().is_none());
    }

    #[test]
    fn set_pins_selects_first_and_clamps() {
        let mut app = app_with_pins(3);
        assert_eq!(app.list_state.selected(), Some(0));

        app.select_last();
        app.set_pins(vec![pin(1, 0, 0)]);
        assert_eq!(app.list_state.selected(), Some(0));

        app.set_pins(Vec::new());
        assert_eq!(app.list_state.selected(), None);
    }

    #[test]
    fn selection_clamps_at_both_ends() {
        let mut app = app_with_pins(3);
        app.select_previous();
        assert_eq!(app.list_state.selected(), Some(0));

        app.select_next();
        app.select_next();
        app.select_next();
        assert_eq!(app.list_state.selected(), Some(2));

        app.select_first();
        assert_eq!(app.list_state.selected(), Some(0));
    }

    #[test]
    fn navigation_on_empty_is_noop() {
        let mut app = App::new(WatchSettings::default());
        app.select_next();
        app.select_last();
        assert!(app.list_state.selected().is_none());
    }

    #[test]
    fn focused_target_prefers_open_thread() {
        let mut app = app_with_pins(2);
        assert_eq!(app.focused_target(), Some(WatchTarget::thread("g", 1)));

        let (open, _tx) = open_thread(7);
        app.open = Some(open);
        assert_eq!(app.focused_target(), Some(WatchTarget::thread("g", 7)));
    }

    #[test]
    fn live_posts_replace_the_stored_copy() {
        let mut app = app_with_pins(1);
        let (open, tx) = open_thread(1);
        app.open = Some(open);

        let target = WatchTarget::thread("g", 1);
        tx.send(WatchEvent::Posts {
            target: target.clone(),
            posts: Arc::new(vec![post(1, "op"), post(2, "reply")]),
            append: false,
        })
        .unwrap();
        app.drain_events();

        let open = app.open.as_ref().unwrap();
        assert!(!open.stored);
        assert_eq!(open.posts.len(), 2);
    }

    #[test]
    fn failure_clears_posts_until_next_success() {
        let mut app = app_with_pins(1);
        let (open, tx) = open_thread(1);
        app.open = Some(open);
        let target = WatchTarget::thread("g", 1);

        tx.send(WatchEvent::Failed {
            target: target.clone(),
            failure: Failure {
                kind: FailureKind::Server,
                message: "HTTP status 500".into(),
            },
        })
        .unwrap();
        app.drain_events();
        let open = app.open.as_ref().unwrap();
        assert!(open.posts.is_empty());
        assert_eq!(open.error.as_ref().map(|f| f.kind), Some(FailureKind::Server));

        tx.send(WatchEvent::Posts {
            target,
            posts: Arc::new(vec![post(1, "op")]),
            append: false,
        })
        .unwrap();
        app.drain_events();
        assert!(app.open.as_ref().unwrap().error.is_none());
    }

    #[test]
    fn end_of_thread_is_not_an_error() {
        let mut app = app_with_pins(1);
        let (open, tx) = open_thread(1);
        app.open = Some(open);
        tx.send(WatchEvent::EndOfThread {
            target: WatchTarget::catalog("g"),
        })
        .unwrap();
        app.drain_events();
        let open = app.open.as_ref().unwrap();
        assert!(open.fully_paginated);
        assert!(open.error.is_none());
    }
}
