//! Terminal UI rendering.
//!
//! All drawing logic lives here, separated from application state ([`App`])
//! and input handling ([`crate::input`]).
//!
//! ## For contributors
//!
//! * The layout is the pin list on the left, the open thread on the right
//!   and a one-line status bar at the bottom.
//! * Comments arrive as the remote's HTML markup; [`plain_text`] reduces
//!   them to one display line.

use std::sync::LazyLock;

use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};
use regex::Regex;

use chanwatch::coordinator::PinStatus;
use chanwatch::source::Post;

use crate::app::{App, OpenThread};

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

/// Draw the complete UI for one frame.
pub fn draw(app: &mut App, frame: &mut Frame) {
    let [main_area, status_area] = Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(frame.area());
    let [pins_area, thread_area] =
        Layout::horizontal([Constraint::Percentage(35), Constraint::Percentage(65)]).areas(main_area);

    draw_pins(app, frame, pins_area);
    draw_thread(app.open.as_ref(), frame, thread_area);
    draw_status_bar(app, frame, status_area);
}

fn pin_line(pin: &PinStatus) -> Line<'_> {
    let marker = if pin.watching { "●" } else { "○" };
    let mut spans = vec![
        Span::styled(format!("{marker} "), Style::default().fg(Color::Cyan)),
        Span::styled(pin.target.to_string(), Style::default().fg(Color::White)),
    ];

    let Some(watch) = &pin.watch else {
        return Line::from(spans);
    };

    spans.push(Span::styled(
        format!("  {} posts", watch.last_post_count),
        Style::default().fg(Color::DarkGray),
    ));
    if watch.unseen_posts > 0 {
        spans.push(Span::styled(
            format!("  +{}", watch.unseen_posts),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ));
    }
    if watch.unseen_mentions > 0 {
        spans.push(Span::styled(
            format!("  @{}", watch.unseen_mentions),
            Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
        ));
    }
    if watch.archived {
        spans.push(Span::styled("  archived", Style::default().fg(Color::DarkGray)));
    }
    if let Some(error) = &watch.error {
        spans.push(Span::styled(format!("  ! {}", error.kind), Style::default().fg(Color::Red)));
    }
    if watch.fetching {
        spans.push(Span::styled("  …", Style::default().fg(Color::DarkGray)));
    }
    Line::from(spans)
}

/// Render the pin list with per-pin counters.
fn draw_pins(app: &mut App, frame: &mut Frame, area: Rect) {
    let items: Vec<ListItem> = app.pins.iter().map(|pin| ListItem::new(pin_line(pin))).collect();

    let title = if app.settings.enabled { " Pins " } else { " Pins (watching off) " };
    let list = List::new(items)
        .block(Block::default().title(title).borders(Borders::ALL))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).bg(Color::DarkGray))
        .highlight_symbol("▸ ");

    frame.render_stateful_widget(list, area, &mut app.list_state);
}

/// Reduce comment markup to a single line of text.
pub fn plain_text(markup: &str) -> String {
    let spaced = markup.replace("<br>", " ");
    TAG.replace_all(&spaced, "")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

fn post_line(post: &Post) -> Line<'_> {
    let mut spans = vec![
        Span::styled(
            format!("{:<10}", post.no),
            Style::default().fg(if post.mentions_viewer { Color::Magenta } else { Color::Cyan }),
        ),
        Span::styled(
            post.time.format("%m-%d %H:%M ").to_string(),
            Style::default().fg(Color::DarkGray),
        ),
    ];
    if let Some(subject) = &post.subject {
        spans.push(Span::styled(
            format!("{} ", plain_text(subject)),
            Style::default().add_modifier(Modifier::BOLD),
        ));
    }
    spans.push(Span::raw(plain_text(&post.comment)));
    Line::from(spans)
}

/// Render the open thread, or a hint when nothing is open.
fn draw_thread(open: Option<&OpenThread>, frame: &mut Frame, area: Rect) {
    let Some(open) = open else {
        let hint = Paragraph::new("Select a pin and press Enter to open it.")
            .block(Block::default().title(" Thread ").borders(Borders::ALL))
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(hint, area);
        return;
    };

    let mut title = format!(" {} ", open.target());
    if open.stored {
        title.push_str("(stored) ");
    }
    if open.fully_paginated {
        title.push_str("(all pages) ");
    }
    let block = Block::default().title(title).borders(Borders::ALL);

    if let Some(failure) = &open.error {
        let error = Paragraph::new(format!("{}: {}", failure.kind, failure.message))
            .block(block)
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: true });
        frame.render_widget(error, area);
        return;
    }

    let items: Vec<ListItem> = open.posts.iter().map(|p| ListItem::new(post_line(p))).collect();
    frame.render_widget(List::new(items).block(block), area);
}

/// Render the bottom status bar.
fn draw_status_bar(app: &App, frame: &mut Frame, area: Rect) {
    let mut spans = vec![
        Span::raw(" "),
        Span::styled(&app.status, Style::default().fg(Color::Yellow)),
        Span::raw("  "),
        Span::styled(
            format!("{} unseen", app.summary.unseen_total),
            Style::default().fg(Color::Green),
        ),
    ];
    if !app.summary.with_mentions.is_empty() {
        spans.push(Span::styled(
            format!("  {} with replies to you", app.summary.with_mentions.len()),
            Style::default().fg(Color::Magenta),
        ));
    }
    spans.push(Span::raw(
        "  q quit  j/k move  ⏎ open  esc close  r reload  a read  p/P pause  d unpin  w watch",
    ));
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chanwatch::notify::Summary;
    use chanwatch::settings::WatchSettings;
    use chanwatch::WatchTarget;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    use crate::app::tests::{open_thread, pin};

    fn render(app: &mut App) -> String {
        let backend = TestBackend::new(120, 24);
        let mut terminal = Terminal::new(backend).unwrap();
        terminal.draw(|f| draw(app, f)).unwrap();
        let buf = terminal.backend().buffer().clone();
        buf.content().iter().map(|c| c.symbol().chars().next().unwrap_or(' ')).collect()
    }

    #[test]
    fn plain_text_strips_markup() {
        let markup = r##"<a href="#p2" class="quotelink">&gt;&gt;2</a><br>it&#039;s &amp; <b>so</b>"##;
        assert_eq!(plain_text(markup), ">>2 it's & so");
    }

    #[test]
    fn draw_does_not_panic_when_empty() {
        let mut app = App::new(WatchSettings::default());
        let text = render(&mut app);
        assert!(text.contains("Pins"));
    }

    #[test]
    fn pins_show_unseen_and_mentions() {
        let mut app = App::new(WatchSettings::default());
        app.set_pins(vec![pin(1, 3, 1), pin(2, 0, 0)]);
        app.set_summary(Summary {
            unseen_total: 3,
            with_mentions: BTreeSet::from([WatchTarget::thread("g", 1)]),
        });

        let text = render(&mut app);
        assert!(text.contains("/g/1"));
        assert!(text.contains("+3"));
        assert!(text.contains("@1"));
        assert!(text.contains("3 unseen"), "status bar shows the aggregate");
    }

    #[test]
    fn open_thread_shows_posts_and_stored_marker() {
        let mut app = App::new(WatchSettings::default());
        app.set_pins(vec![pin(1, 0, 0)]);
        let (open, _tx) = open_thread(1);
        app.open = Some(open);

        let text = render(&mut app);
        assert!(text.contains("(stored)"));
        assert!(text.contains("stored"));
    }

    #[test]
    fn disabled_watching_is_visible() {
        let mut app = App::new(WatchSettings {
            enabled: false,
            ..WatchSettings::default()
        });
        let text = render(&mut app);
        assert!(text.contains("watching off"));
    }
}
