//! Line-oriented terminal front end: command parsing and event rendering.
//!
//! ```text
//! Bob: hello there     send "hello there" to the peer named Bob
//! /peers               list known peers
//! /scan                scan for peers
//! /state               print the connection state
//! /help                list commands
//! /quit                exit
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use nearchat_core::NodeEvent;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { destination: String, text: String },
    Peers,
    Scan,
    State,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub const HELP: &str = "\
commands:
  <name>: <text>   send a message
  /peers           list known peers
  /scan            scan for peers
  /state           show the connection state
  /quit            exit";

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if let Some(command) = line.strip_prefix('/') {
        return match command.trim() {
            "peers" => Command::Peers,
            "scan" => Command::Scan,
            "state" => Command::State,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        };
    }
    match line.split_once(':') {
        Some((destination, text)) if !destination.trim().is_empty() => Command::Send {
            destination: destination.trim().to_string(),
            text: text.trim_start().to_string(),
        },
        _ => Command::Unknown(line.to_string()),
    }
}

/// Renders an event as conversation text or a timestamped status line.
/// Returns `None` for events the user does not need to see.
pub fn render_event(event: &NodeEvent, clock: &str) -> Option<String> {
    let status = |text: String| Some(format!("{clock} >> {text}"));
    match event {
        NodeEvent::MessageSent { payload, .. } => {
            Some(format!("Me: {}", String::from_utf8_lossy(payload)))
        }
        NodeEvent::MessageReceived { from, payload } => {
            Some(format!("{from}: {}", String::from_utf8_lossy(payload)))
        }
        NodeEvent::StateChanged(state) => status(format!("state: {state}")),
        NodeEvent::DeviceNameResolved { peer } => status(format!("connected to {peer}")),
        NodeEvent::ScanStarted { .. } => status("Discovery started".to_string()),
        NodeEvent::PeerDiscovered { name, address } => status(format!("found {name} ({address})")),
        NodeEvent::ScanFinished { .. } => status("Discovery finished".to_string()),
        NodeEvent::Unreachable { destination } => {
            status(format!("{destination} is not reachable, message dropped"))
        }
        NodeEvent::TransientFailure { failure, .. } => status(failure.to_string()),
        NodeEvent::SendFinished { .. } => None,
    }
}

/// Current wall-clock time as `HH:MM:SS UTC`.
pub fn clock_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{} UTC", format_clock(secs))
}

fn format_clock(unix_secs: u64) -> String {
    let of_day = unix_secs % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        of_day / 3600,
        (of_day % 3600) / 60,
        of_day % 60
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nearchat_core::{ConnectionState, PeerAddress, ScanId, SessionFailure};

    #[test]
    fn test_parse_send_line_splits_on_first_colon() {
        assert_eq!(
            parse_command("Bob: meet at 10:30"),
            Command::Send {
                destination: "Bob".to_string(),
                text: "meet at 10:30".to_string()
            }
        );
    }

    #[test]
    fn test_parse_slash_commands() {
        assert_eq!(parse_command("/peers"), Command::Peers);
        assert_eq!(parse_command("  /scan "), Command::Scan);
        assert_eq!(parse_command("/state"), Command::State);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert_eq!(parse_command("/nope"), Command::Unknown("nope".to_string()));
    }

    #[test]
    fn test_parse_line_without_destination_is_unknown() {
        assert_eq!(parse_command(": hi"), Command::Unknown(": hi".to_string()));
        assert_eq!(parse_command("hello"), Command::Unknown("hello".to_string()));
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn test_render_conversation_lines() {
        let sent = NodeEvent::MessageSent {
            attempt: nearchat_core::AttemptId(1),
            destination: "Bob".to_string(),
            payload: b"hi".to_vec(),
        };
        let received = NodeEvent::MessageReceived {
            from: "Bob".to_string(),
            payload: b"hey".to_vec(),
        };

        assert_eq!(render_event(&sent, "12:00:00").as_deref(), Some("Me: hi"));
        assert_eq!(render_event(&received, "12:00:00").as_deref(), Some("Bob: hey"));
    }

    #[test]
    fn test_render_status_lines_carry_the_clock() {
        let started = NodeEvent::ScanStarted { scan: ScanId(1) };
        let state = NodeEvent::StateChanged(ConnectionState::Listening);
        let found = NodeEvent::PeerDiscovered {
            name: "Bob".to_string(),
            address: PeerAddress::from("0xAA"),
        };

        assert_eq!(
            render_event(&started, "12:00:01").as_deref(),
            Some("12:00:01 >> Discovery started")
        );
        assert_eq!(
            render_event(&state, "12:00:02").as_deref(),
            Some("12:00:02 >> state: listening")
        );
        assert_eq!(
            render_event(&found, "12:00:03").as_deref(),
            Some("12:00:03 >> found Bob (0xAA)")
        );
    }

    #[test]
    fn test_render_failure_and_hidden_events() {
        let failure = NodeEvent::TransientFailure {
            attempt: None,
            failure: SessionFailure::TimedOut { operation: "read" },
        };
        let finished = NodeEvent::SendFinished {
            destination: "Bob".to_string(),
            delivered: true,
        };

        assert_eq!(
            render_event(&failure, "00:00:00").as_deref(),
            Some("00:00:00 >> read timed out")
        );
        assert_eq!(render_event(&finished, "00:00:00"), None);
    }

    #[test]
    fn test_clock_now_is_labelled_utc() {
        let clock = clock_now();

        assert!(clock.ends_with(" UTC"));
        assert_eq!(clock.len(), "00:00:00 UTC".len());
    }

    #[test]
    fn test_format_clock_wraps_at_midnight() {
        assert_eq!(format_clock(0), "00:00:00");
        assert_eq!(format_clock(86_400 + 3_661), "01:01:01");
        assert_eq!(format_clock(86_399), "23:59:59");
    }
}
