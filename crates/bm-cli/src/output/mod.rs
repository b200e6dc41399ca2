//! Output formatting utilities for the CLI
//!
//! Session tables for `status`, one-line renderings of state changes, and
//! colored status messages.

use tabled::{settings::Style, Table, Tabled};

use bm_core::ipc::ControlEvent;
use bm_core::time::{elapsed_millis, format_age};
use bm_core::SessionInfo;

/// Format sessions as a table, or "No sessions" when there are none
pub fn format_sessions(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "No sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "ROLE")]
        role: String,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "CONNECT")]
        connect: String,
        #[tabled(rename = "SHELL")]
        shell: String,
        #[tabled(rename = "AGE")]
        age: String,
        #[tabled(rename = "IDLE")]
        idle: String,
        #[tabled(rename = "RECONNECTS")]
        reconnects: u32,
        #[tabled(rename = "REASON")]
        reason: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            id: s.id.to_string(),
            role: s.role.to_string(),
            state: s.state.to_string(),
            connect: s.connect_string(),
            shell: s
                .shell
                .map(|k| k.to_string())
                .unwrap_or_else(|| "-".to_string()),
            age: format_age(elapsed_millis(s.created_at)),
            idle: format_age(elapsed_millis(s.last_activity_at)),
            reconnects: s.reconnects,
            reason: s
                .reason
                .as_deref()
                .map(|r| truncate(r, 40))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One line describing a session change
pub fn format_event(event: &ControlEvent) -> String {
    let change = match (event.from, event.to) {
        (None, Some(to)) => format!("created ({})", to),
        (Some(from), Some(to)) => format!("{} -> {}", from, to),
        (_, None) => "removed".to_string(),
    };
    match &event.reason {
        Some(reason) => format!("{}: {} ({})", event.session_id, change, reason),
        None => format!("{}: {}", event.session_id, change),
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix (stderr)
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow (stderr)
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_core::time::current_time_millis;
    use bm_core::{RelayTarget, Role, SessionId, SessionState, ShellKind};

    fn session(state: SessionState, reason: Option<&str>) -> SessionInfo {
        let now = current_time_millis();
        SessionInfo {
            id: SessionId::from("0badcafe"),
            role: Role::Host,
            relay: RelayTarget::new("relay.test", 22),
            tunnel_port: 41523,
            state,
            created_at: now - 90_000,
            last_activity_at: now,
            shell: Some(ShellKind::Bash),
            reason: reason.map(String::from),
            reconnects: 2,
        }
    }

    #[test]
    fn test_format_empty_sessions() {
        assert_eq!(format_sessions(&[]), "No sessions");
    }

    #[test]
    fn test_format_sessions_table() {
        let table = format_sessions(&[session(SessionState::Listening, None)]);
        assert!(table.contains("0badcafe"));
        assert!(table.contains("relay.test:41523"));
        assert!(table.contains("RECONNECTS"));
        assert!(table.contains("1m"));
    }

    #[test]
    fn test_format_event() {
        let event = ControlEvent {
            session_id: SessionId::from("0badcafe"),
            from: Some(SessionState::Connected),
            to: Some(SessionState::Disconnected),
            reason: Some("tunnel stream ended".to_string()),
        };
        let line = format_event(&event);
        assert!(line.starts_with("0badcafe: "));
        assert!(line.contains("tunnel stream ended"));

        let removed = ControlEvent {
            to: None,
            reason: None,
            ..event
        };
        assert_eq!(format_event(&removed), "0badcafe: removed");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer reason", 10), "a much ...");
    }
}
