//! chanwatch: watch imageboard threads and catalogs for new posts.
//!
//! ## Architecture overview
//!
//! ```text
//!  front-end thread                 polling thread              tokio runtime
//! ┌──────────────┐  Command   ┌──────────────────────┐  spawn  ┌─────────────┐
//! │ WatchService │ ─────────► │ Coordinator          │ ──────► │ ThreadSource│
//! │  (poll.rs)   │ ◄───────── │  └ LoaderPool        │ ◄────── │  (fetch)    │
//! └──────────────┘   reply    │     └ ThreadWatcher  │ Fetch-  └─────────────┘
//!        ▲                    │        └ Backoff...  │ Completed
//!        │ WatchEvent/Summary └──────────────────────┘
//! ```
//!
//! * **`source/`**: the `ThreadSource` trait, fetch results and failure
//!   classification, and the JSON API implementation.
//! * **`backoff`**: adaptive wait between polls of one target.
//! * **`watcher`**: one target's fetch lifecycle, unseen tracking and
//!   listeners.
//! * **`pool`**: shares watchers between consumers and parks released
//!   ones in an LRU cache.
//! * **`coordinator`**: pins, poll passes, foreground/background mode and
//!   aggregate notification.
//! * **`poll`**: the polling thread and its command channel.
//! * **`notify`**: notification and persistence sinks.
//! * **`settings`**: layered configuration.

pub mod backoff;
pub mod coordinator;
pub mod errors;
pub mod notify;
pub mod poll;
pub mod pool;
pub mod settings;
pub mod source;
pub mod target;
pub mod watcher;

pub use errors::{Error, Result};
pub use target::{LoadMode, WatchTarget};
