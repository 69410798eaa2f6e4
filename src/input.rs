//! Terminal input handling.
//!
//! Maps terminal events to [`Action`]s. Applying an action is
//! [`App::perform`](crate::app::App::perform)'s job; keeping the mapping
//! separate lets it be tested without a running watch service.
//!
//! ## For contributors
//!
//! To add a new keybinding:
//!
//! 1. Add an [`Action`] variant and handle it in `App::perform`.
//! 2. Add a `KeyCode` match arm in [`map_event`].
//! 3. Update the help text in `ui::draw_status_bar`.

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    SelectNext,
    SelectPrevious,
    SelectFirst,
    SelectLast,
    Open,
    Close,
    Reload,
    Acknowledge,
    TogglePinWatching,
    PauseAll,
    RemovePin,
    ToggleWatching,
    /// Terminal focus gained (`true`) or lost.
    Focus(bool),
}

/// Translate one terminal event. Only key presses count (not release or
/// repeat), so each physical keypress triggers exactly one action.
pub fn map_event(event: &Event) -> Option<Action> {
    match event {
        Event::Key(key) => map_key(key),
        Event::FocusGained => Some(Action::Focus(true)),
        Event::FocusLost => Some(Action::Focus(false)),
        _ => None,
    }
}

fn map_key(key: &KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }

    let action = match key.code {
        KeyCode::Char('q') => Action::Quit,
        KeyCode::Down | KeyCode::Char('j') => Action::SelectNext,
        KeyCode::Up | KeyCode::Char('k') => Action::SelectPrevious,
        KeyCode::Home | KeyCode::Char('g') => Action::SelectFirst,
        KeyCode::End | KeyCode::Char('G') => Action::SelectLast,
        KeyCode::Enter => Action::Open,
        KeyCode::Esc => Action::Close,
        KeyCode::Char('r') => Action::Reload,
        KeyCode::Char('a') => Action::Acknowledge,
        KeyCode::Char('p') => Action::TogglePinWatching,
        KeyCode::Char('P') => Action::PauseAll,
        KeyCode::Char('d') => Action::RemovePin,
        KeyCode::Char('w') => Action::ToggleWatching,
        _ => return None,
    };
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventState, KeyModifiers};

    fn press(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn navigation_keys() {
        assert_eq!(map_event(&press(KeyCode::Char('j'))), Some(Action::SelectNext));
        assert_eq!(map_event(&press(KeyCode::Down)), Some(Action::SelectNext));
        assert_eq!(map_event(&press(KeyCode::Char('k'))), Some(Action::SelectPrevious));
        assert_eq!(map_event(&press(KeyCode::End)), Some(Action::SelectLast));
    }

    #[test]
    fn esc_closes_instead_of_quitting() {
        assert_eq!(map_event(&press(KeyCode::Esc)), Some(Action::Close));
        assert_eq!(map_event(&press(KeyCode::Char('q'))), Some(Action::Quit));
    }

    #[test]
    fn pin_keys_are_case_sensitive() {
        assert_eq!(map_event(&press(KeyCode::Char('p'))), Some(Action::TogglePinWatching));
        assert_eq!(map_event(&press(KeyCode::Char('P'))), Some(Action::PauseAll));
    }

    #[test]
    fn focus_changes_map_to_foreground() {
        assert_eq!(map_event(&Event::FocusGained), Some(Action::Focus(true)));
        assert_eq!(map_event(&Event::FocusLost), Some(Action::Focus(false)));
    }

    #[test]
    fn release_events_are_ignored() {
        let release = Event::Key(KeyEvent {
            code: KeyCode::Char('q'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        });
        assert_eq!(map_event(&release), None);
    }

    #[test]
    fn unbound_keys_do_nothing() {
        assert_eq!(map_event(&press(KeyCode::Char('z'))), None);
        assert_eq!(map_event(&Event::Resize(80, 24)), None);
    }
}
