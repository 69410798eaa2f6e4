//! chanwatch: a terminal thread watcher for imageboards.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌──────────────┐  Summary / WatchEvent  ┌──────────┐  draw()  ┌──────────┐
//! │ WatchService │ ─────────────────────► │  app.rs  │ ───────► │  ui.rs   │
//! │  (lib poll)  │ ◄───────────────────── │ (state)  │          │ (render) │
//! └──────────────┘        commands        └──────────┘          └──────────┘
//!                                              ▲
//!                                              │ Action
//!                                         ┌──────────┐
//!                                         │ input.rs │
//!                                         └──────────┘
//! ```
//!
//! * **`app`**: front-end state: pin snapshots, the open thread, status.
//! * **`ui`**: pure rendering: reads `App` state and draws widgets.
//! * **`input`**: maps terminal events to `Action`s.
//! * **`main`**: wires everything together: parse args, load settings, set
//!   up logging and the terminal, and run the event loop.

mod app;
mod input;
mod ui;

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, DisableFocusChange, EnableFocusChange},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chanwatch::notify::{ChannelNotifier, JsonStore, PersistenceSink};
use chanwatch::settings::Settings;
use chanwatch::source::ChanSource;
use chanwatch::{poll, WatchTarget};

use app::App;

#[derive(Debug, Parser)]
#[command(version, about = "Watch imageboard threads for new posts and replies")]
struct Args {
    /// TOML settings file (defaults to ./chanwatch.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the log; the terminal belongs to the UI
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Extra targets to pin, as `board/no` (thread) or `board` (catalog)
    pins: Vec<WatchTarget>,
}

// ---------------------------------------------------------------------------
// RAII terminal guard
// ---------------------------------------------------------------------------

/// Manages raw mode, the alternate screen and focus reporting via [`Drop`],
/// so a panic never leaves the terminal broken.
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
}

impl TerminalGuard {
    fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;
        Ok(Self { terminal })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), DisableFocusChange, LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Restore the terminal before the default hook prints the panic.
fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), DisableFocusChange, LeaveAlternateScreen);
        original_hook(info);
    }));
}

fn init_logging(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let filter = EnvFilter::try_from_env("CHANWATCH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("chanwatch=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;

    let cache_dir = settings.storage.resolved_cache_dir();
    init_logging(args.log_file.unwrap_or_else(|| cache_dir.join("chanwatch.log")))?;
    info!(cache_dir = %cache_dir.display(), "chanwatch starting");

    // -- watch core ----------------------------------------------------------
    let runtime = tokio::runtime::Runtime::new()?;
    let source = Arc::new(ChanSource::new(&settings.source)?);
    let store = match JsonStore::open(cache_dir.join("threads")) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "post store unavailable, continuing without it");
            None
        }
    };

    let (notifier, summaries) = ChannelNotifier::new();
    let sink = store.clone().map(|s| Box::new(s) as Box<dyn PersistenceSink>);
    let service = poll::spawn(
        settings.watch.clone(),
        source,
        runtime.handle().clone(),
        Box::new(notifier),
        sink,
    )?;

    for target in settings.pin_targets()?.into_iter().chain(args.pins) {
        service.add_pin(target)?;
    }

    // -- terminal setup (RAII, Drop restores on exit or panic) --------------
    install_panic_hook();
    let mut guard = TerminalGuard::new()?;
    let mut app = App::new(settings.watch);

    // -- main event loop -----------------------------------------------------
    // ~10 fps. Each iteration drains the watch service, renders, then waits
    // up to one tick for terminal input.
    let tick_rate = Duration::from_millis(100);

    loop {
        // 1. Pull state from the polling thread
        while let Ok(summary) = summaries.try_recv() {
            app.set_summary(summary);
        }
        app.set_pins(service.pins()?);
        app.drain_events();

        // 2. Render
        guard.terminal.draw(|f| ui::draw(&mut app, f))?;

        // 3. Handle input
        if event::poll(tick_rate)? {
            if let Some(action) = input::map_event(&event::read()?) {
                if let Err(e) = app.perform(action, &service, store.as_ref()) {
                    warn!(error = %e, ?action, "action failed");
                    app.status = format!("Error: {e}");
                }
            }
        }

        if app.quit {
            break;
        }
    }

    drop(guard);
    service.shutdown();
    info!("chanwatch stopped");
    Ok(())
}
