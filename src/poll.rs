//! The polling thread.
//!
//! A dedicated thread owns the [`Coordinator`] and everything under it.
//! Other threads talk to it through [`WatchService`], which sends
//! [`Command`]s over an [`mpsc`] channel and waits for the reply. Fetches
//! run as tasks on a tokio runtime; each task posts its result back into
//! the same channel, so every state change happens on the polling thread.
//!
//! ## For contributors
//!
//! The loop is: run whatever is due, work out when something is next due,
//! then block on the channel until that deadline. Any incoming command
//! wakes the thread early, which is how foreground changes and settings
//! updates take effect without waiting out a long background sleep.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::coordinator::{Coordinator, PinStatus, Subscription};
use crate::errors::{Error, PoolError, Result};
use crate::notify::{NotificationSink, PersistenceSink};
use crate::settings::WatchSettings;
use crate::source::{FetchHandle, FetchRequest, FetchResult, ThreadSource};
use crate::target::WatchTarget;
use crate::watcher::{Dispatch, Unseen, WatchEvent, WatcherId};

type Reply<T> = Sender<T>;

/// Messages handled by the polling thread.
pub enum Command {
    Obtain {
        target: WatchTarget,
        events: Option<Sender<WatchEvent>>,
        auto_reload: bool,
        reply: Reply<std::result::Result<Subscription, PoolError>>,
    },
    Release {
        subscription: Subscription,
        reply: Reply<std::result::Result<(), PoolError>>,
    },
    Reload {
        target: WatchTarget,
        reply: Reply<std::result::Result<(), PoolError>>,
    },
    Acknowledge {
        target: WatchTarget,
        reply: Reply<std::result::Result<(), PoolError>>,
    },
    Peek {
        target: WatchTarget,
        reply: Reply<std::result::Result<Unseen, PoolError>>,
    },
    AddPin {
        target: WatchTarget,
        reply: Reply<std::result::Result<bool, PoolError>>,
    },
    RemovePin {
        target: WatchTarget,
        reply: Reply<std::result::Result<bool, PoolError>>,
    },
    SetPinWatching {
        target: WatchTarget,
        watching: bool,
        reply: Reply<bool>,
    },
    PauseAll,
    SetForeground(bool),
    UpdateSettings(WatchSettings),
    Pins {
        reply: Reply<Vec<PinStatus>>,
    },
    /// Posted by fetch tasks, never by front-ends.
    FetchCompleted {
        watcher: WatcherId,
        target: WatchTarget,
        seq: u64,
        result: FetchResult,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Dispatch onto tokio
// ---------------------------------------------------------------------------

/// Runs fetches as tokio tasks and routes results back to the polling
/// thread.
pub struct TokioDispatcher {
    runtime: Handle,
    source: Arc<dyn ThreadSource>,
    commands: Sender<Command>,
}

impl TokioDispatcher {
    pub fn new(runtime: Handle, source: Arc<dyn ThreadSource>, commands: Sender<Command>) -> Self {
        Self {
            runtime,
            source,
            commands,
        }
    }
}

impl Dispatch for TokioDispatcher {
    fn dispatch(&self, watcher: WatcherId, seq: u64, request: FetchRequest) -> FetchHandle {
        let target = request.target.clone();
        let fetch = self.source.fetch(request);
        let commands = self.commands.clone();

        let task = self.runtime.spawn(async move {
            let result = fetch.await;
            // The polling thread is gone once shutdown completes.
            let _ = commands.send(Command::FetchCompleted {
                watcher,
                target,
                seq,
                result,
            });
        });
        FetchHandle::from_task(task.abort_handle())
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

fn run<D: Dispatch>(mut coordinator: Coordinator<D>, commands: Receiver<Command>) {
    info!("polling thread started");
    loop {
        let now = Utc::now();
        coordinator.tick(now);

        let received = match coordinator.next_wakeup(now) {
            Some(at) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                commands.recv_timeout(wait)
            }
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(command) => {
                if !handle(&mut coordinator, command) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("command channel closed");
                break;
            }
        }
    }
    coordinator.shutdown();
    info!("polling thread stopped");
}

/// Apply one command. Returns `false` to stop the loop.
fn handle<D: Dispatch>(c: &mut Coordinator<D>, command: Command) -> bool {
    let now = Utc::now();
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Obtain {
            target,
            events,
            auto_reload,
            reply,
        } => {
            let _ = reply.send(c.obtain(&target, events, auto_reload, now));
        }
        Command::Release { subscription, reply } => {
            let _ = reply.send(c.release(&subscription));
        }
        Command::Reload { target, reply } => {
            let _ = reply.send(c.reload(&target));
        }
        Command::Acknowledge { target, reply } => {
            let _ = reply.send(c.acknowledge(&target));
        }
        Command::Peek { target, reply } => {
            let _ = reply.send(c.unseen(&target));
        }
        Command::AddPin { target, reply } => {
            let _ = reply.send(c.add_pin(target, now));
        }
        Command::RemovePin { target, reply } => {
            let _ = reply.send(c.remove_pin(&target, now));
        }
        Command::SetPinWatching {
            target,
            watching,
            reply,
        } => {
            let _ = reply.send(c.set_pin_watching(&target, watching, now));
        }
        Command::PauseAll => c.pause_all(now),
        Command::SetForeground(foreground) => c.set_foreground(foreground, now),
        Command::UpdateSettings(settings) => c.update_settings(settings, now),
        Command::Pins { reply } => {
            let _ = reply.send(c.pins());
        }
        Command::FetchCompleted {
            watcher,
            target,
            seq,
            result,
        } => c.on_fetch_completed(watcher, &target, seq, result, now),
        Command::Shutdown => return false,
    }
    true
}

// ---------------------------------------------------------------------------
// Front-end handle
// ---------------------------------------------------------------------------

/// Handle to the polling thread. Dropping it shuts the thread down.
pub struct WatchService {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

/// Start the polling thread.
///
/// Fails if `settings` do not describe a usable backoff table or cache.
pub fn spawn(
    settings: WatchSettings,
    source: Arc<dyn ThreadSource>,
    runtime: Handle,
    notifier: Box<dyn NotificationSink>,
    store: Option<Box<dyn PersistenceSink>>,
) -> Result<WatchService> {
    let (tx, rx) = mpsc::channel();
    info!(source = source.name(), "starting watch service");

    let dispatcher = TokioDispatcher::new(runtime, source, tx.clone());
    let coordinator = Coordinator::new(settings, dispatcher, notifier, store)?;

    let thread = thread::Builder::new()
        .name("chanwatch-poll".into())
        .spawn(move || run(coordinator, rx))?;

    Ok(WatchService {
        commands: tx,
        thread: Some(thread),
    })
}

impl WatchService {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ServiceStopped)
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = mpsc::channel();
        self.send(build(reply))?;
        rx.recv().map_err(|_| Error::ServiceStopped)
    }

    /// Attach a consumer to `target`. Events arrive on `events` until the
    /// returned subscription is released.
    pub fn obtain(
        &self,
        target: WatchTarget,
        events: Option<Sender<WatchEvent>>,
        auto_reload: bool,
    ) -> Result<Subscription> {
        Ok(self.request(|reply| Command::Obtain {
            target,
            events,
            auto_reload,
            reply,
        })??)
    }

    pub fn release(&self, subscription: Subscription) -> Result<()> {
        Ok(self.request(|reply| Command::Release { subscription, reply })??)
    }

    pub fn reload(&self, target: WatchTarget) -> Result<()> {
        Ok(self.request(|reply| Command::Reload { target, reply })??)
    }

    pub fn acknowledge(&self, target: WatchTarget) -> Result<()> {
        Ok(self.request(|reply| Command::Acknowledge { target, reply })??)
    }

    pub fn unseen(&self, target: WatchTarget) -> Result<Unseen> {
        Ok(self.request(|reply| Command::Peek { target, reply })??)
    }

    pub fn add_pin(&self, target: WatchTarget) -> Result<bool> {
        Ok(self.request(|reply| Command::AddPin { target, reply })??)
    }

    pub fn remove_pin(&self, target: WatchTarget) -> Result<bool> {
        Ok(self.request(|reply| Command::RemovePin { target, reply })??)
    }

    pub fn set_pin_watching(&self, target: WatchTarget, watching: bool) -> Result<bool> {
        self.request(|reply| Command::SetPinWatching {
            target,
            watching,
            reply,
        })
    }

    pub fn pause_all(&self) -> Result<()> {
        self.send(Command::PauseAll)
    }

    pub fn set_foreground(&self, foreground: bool) -> Result<()> {
        self.send(Command::SetForeground(foreground))
    }

    pub fn update_settings(&self, settings: WatchSettings) -> Result<()> {
        self.send(Command::UpdateSettings(settings))
    }

    pub fn pins(&self) -> Result<Vec<PinStatus>> {
        self.request(|reply| Command::Pins { reply })
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Shutdown);
            if thread.join().is_err() {
                error!("polling thread panicked");
            }
        }
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.stop();
    }
}
