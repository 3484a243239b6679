//! Line-oriented terminal front end for a chat session.

use log::{ error, warn };
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines };
use crate::config::prompt::QuickAction;
use crate::models::chat::{ ConversationEntry, Delivery, Sender };
use crate::pagination::{ self, PageView };
use crate::places::SavedPlaceTracker;
use crate::session::{ Session, SessionError, SessionState };

const HELP: &str = concat!(
    "Commands:\n",
    "  /sights /food /cafe   ask for popular places in the trip's city\n",
    "  /place                ask about a specific place\n",
    "  /next <n> /prev <n>   page through the results of message <n>\n",
    "  /retry <n>            resend unanswered message <n>\n",
    "  /cancel               stop waiting for the current reply\n",
    "  /places               show the trip's saved places\n",
    "  /history              print the whole conversation\n",
    "  /reload               reload the trip and its conversation\n",
    "  /quit                 leave\n",
    "Anything else is sent as a message."
);

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Ask(String),
    Quick(QuickAction),
    Next(usize),
    Previous(usize),
    Retry(usize),
    Cancel,
    Places,
    History,
    Reload,
    Help,
    Quit,
    Invalid(String),
}

/// Parses one input line; blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Ask(line.to_string()));
    }

    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let index = parts.next().map(str::parse::<usize>);
    let command = match (name, index) {
        ("/sights", None) => Command::Quick(QuickAction::Sights),
        ("/food", None) => Command::Quick(QuickAction::Restaurants),
        ("/cafe", None) => Command::Quick(QuickAction::Cafes),
        ("/place", None) => Command::Quick(QuickAction::AskForPlace),
        ("/next", Some(Ok(n))) => Command::Next(n),
        ("/prev", Some(Ok(n))) => Command::Previous(n),
        ("/retry", Some(Ok(n))) => Command::Retry(n),
        ("/cancel", None) => Command::Cancel,
        ("/places", None) => Command::Places,
        ("/history", None) => Command::History,
        ("/reload", None) => Command::Reload,
        ("/help", None) => Command::Help,
        ("/quit", None) | ("/exit", None) => Command::Quit,
        _ => Command::Invalid(line.to_string()),
    };
    Some(command)
}

fn render_page(index: usize, view: &PageView<'_>, out: &mut String) {
    for item in &view.items {
        let mut lines = item.location.lines();
        if let Some(first) = lines.next() {
            out.push_str(&format!("  * {}\n", first));
        }
        for line in lines {
            out.push_str(&format!("    {}\n", line));
        }
        if let Some(point) = item.coordinate {
            out.push_str(&format!("    @ {:.5}, {:.5}\n", point.latitude, point.longitude));
        }
    }
    if view.is_paginated() {
        out.push_str(&format!("  page {}/{}", view.cursor.saturating_add(1), view.page_count()));
        if view.has_previous {
            out.push_str(&format!("  /prev {}", index));
        }
        if view.has_next {
            out.push_str(&format!("  /next {}", index));
        }
        out.push('\n');
    }
}

pub fn render_entry(index: usize, entry: &ConversationEntry) -> String {
    let speaker = match entry.sender {
        Sender::User => "You",
        Sender::Bot => "Bot",
    };
    let mut out = format!("[{}] {}:", index, speaker);
    match entry.delivery {
        Delivery::Unsent => out.push_str(" (unsent)"),
        Delivery::Pending => out.push_str(" (saving)"),
        Delivery::Persisted | Delivery::Local => {}
    }
    if entry.unanswered {
        out.push_str(&format!(" (no answer, /retry {})", index));
    }
    out.push('\n');

    match pagination::page_view(entry) {
        Some(view) => render_page(index, &view, &mut out),
        None => {
            for line in entry.text.lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
    }
    out
}

async fn print<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.flush().await
}

fn render_from(session: &Session, start: usize) -> String {
    session.with_store(|store| {
        store
            .entries()
            .iter()
            .enumerate()
            .skip(start)
            .map(|(index, entry)| render_entry(index, entry))
            .collect()
    })
}

fn report(e: &SessionError) -> Option<String> {
    match e {
        SessionError::EmptyQuery => None,
        SessionError::NotReady(SessionState::Uninitialized) =>
            Some("The trip is not loaded yet; try /reload.\n".to_string()),
        other => {
            error!("{}", other);
            None
        }
    }
}

const PENDING_REFRESH: Duration = Duration::from_millis(100);

/// Drives a submission to completion while keeping the terminal live: entries
/// appended in the meantime (the user's own message first) are printed as soon
/// as they land, and `/cancel` aborts the query in flight.
async fn wait_for<F, R, W>(
    session: &Session,
    pending: F,
    lines: &mut Lines<R>,
    stdout: &mut W,
    shown: &mut usize
) -> io::Result<Result<(), SessionError>>
    where F: Future<Output = Result<usize, SessionError>>, R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin
{
    tokio::pin!(pending);
    let mut stdin_open = true;
    loop {
        tokio::select! {
            outcome = &mut pending => return Ok(outcome.map(|_| ())),
            _ = tokio::time::sleep(PENDING_REFRESH) => {
                if session.len() > *shown {
                    let fresh = render_from(session, *shown);
                    *shown = session.len();
                    print(stdout, &fresh).await?;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = line?;
                if line.is_none() {
                    stdin_open = false;
                }
                match line.as_deref().and_then(parse_command) {
                    Some(Command::Cancel) => {
                        if !session.cancel_pending() {
                            print(stdout, "Nothing to cancel yet.\n").await?;
                        }
                    }
                    Some(_) => print(stdout, "Still waiting for the reply; /cancel to stop.\n").await?,
                    None => {}
                }
            }
        }
    }
}

pub async fn run_console(session: Arc<Session>, tracker: Arc<SavedPlaceTracker>) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = 0;

    print(&mut stdout, &format!("{}\n\n", HELP)).await?;
    let transcript = render_from(&session, shown);
    shown = session.len();
    print(&mut stdout, &transcript).await?;

    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };

        let mut repaint = None;
        let outcome = match command {
            Command::Quit => break,
            Command::Help => {
                print(&mut stdout, &format!("{}\n", HELP)).await?;
                continue;
            }
            Command::Invalid(text) => {
                print(&mut stdout, &format!("Unknown command: {} (see /help)\n", text)).await?;
                continue;
            }
            Command::History => {
                print(&mut stdout, &render_from(&session, 0)).await?;
                continue;
            }
            Command::Places => {
                if let Err(e) = tracker.refresh_if_stale().await {
                    warn!("Showing cached saved places: {}", e);
                }
                let mut out = String::from("Saved places:\n");
                for place in tracker.places() {
                    out.push_str(&format!("  * {} ({})\n", place.title, place.address));
                }
                print(&mut stdout, &out).await?;
                continue;
            }
            Command::Reload => {
                let outcome = session.activate().await.map(|_| ());
                if outcome.is_ok() {
                    shown = 0;
                }
                outcome
            }
            Command::Next(index) => {
                repaint = Some(index);
                session.next_page(index).map(|_| ())
            }
            Command::Previous(index) => {
                repaint = Some(index);
                session.previous_page(index).map(|_| ())
            }
            Command::Cancel => {
                if !session.cancel_pending() {
                    print(&mut stdout, "Nothing to cancel.\n").await?;
                }
                continue;
            }
            Command::Retry(index) => wait_for(&session, session.retry(index), &mut lines, &mut stdout, &mut shown).await?,
            Command::Quick(action) => wait_for(&session, session.trigger(action), &mut lines, &mut stdout, &mut shown).await?,
            Command::Ask(text) => wait_for(&session, session.submit(&text), &mut lines, &mut stdout, &mut shown).await?,
        };

        match (&outcome, repaint) {
            (Err(e), _) => {
                if let Some(message) = report(e) {
                    print(&mut stdout, &message).await?;
                }
            }
            (Ok(()), Some(index)) => {
                if let Some(entry) = session.entry(index) {
                    print(&mut stdout, &render_entry(index, &entry)).await?;
                }
            }
            (Ok(()), None) => {}
        }

        let fresh = render_from(&session, shown);
        shown = session.len();
        print(&mut stdout, &fresh).await?;

        if let Err(e) = tracker.refresh_if_stale().await {
            warn!("Saved places not refreshed: {}", e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::ScriptedGateway;
    use crate::gateway::QueryReply;
    use crate::models::chat::GeoPoint;
    use crate::models::trip::{ TripContext, TripKey };
    use crate::session::SessionSettings;

    async fn ready_session(reply_delay: Duration) -> Session {
        let gateway = Arc::new(
            ScriptedGateway::new(TripContext {
                trip_id: "t1".into(),
                owner_user_id: "u1".into(),
                city: "Suwon".into(),
                start_date: "2024-09-01".into(),
                end_date: "2024-09-02".into(),
                owner_display_name: "Dana".into(),
            })
        );
        gateway.script_delayed_reply(reply_delay, Ok(QueryReply::plain("Try the galbi street.")));
        let session = Session::new(TripKey::new("u1", "t1"), "Dana", gateway, SessionSettings::default());
        session.activate().await.unwrap();
        session
    }

    #[test]
    fn parses_commands_and_free_text() {
        assert_eq!(parse_command("  "), None);
        assert_eq!(parse_command("where to eat?"), Some(Command::Ask("where to eat?".into())));
        assert_eq!(parse_command("/cafe"), Some(Command::Quick(QuickAction::Cafes)));
        assert_eq!(parse_command("/next 3"), Some(Command::Next(3)));
        assert_eq!(parse_command("/prev x"), Some(Command::Invalid("/prev x".into())));
        assert_eq!(parse_command("/next"), Some(Command::Invalid("/next".into())));
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
        assert_eq!(parse_command("/cancel"), Some(Command::Cancel));
    }

    #[test]
    fn renders_plain_text_line_by_line() {
        let mut entry = ConversationEntry::user("first line\nsecond line").with_delivery(Delivery::Unsent);
        entry.unanswered = true;
        assert_eq!(
            render_entry(2, &entry),
            "[2] You: (unsent) (no answer, /retry 2)\n  first line\n  second line\n"
        );
    }

    #[test]
    fn renders_current_page_with_markers() {
        let text = (1..=6).map(|i| format!("Cafe {}\nOpen 9-18", i)).collect::<Vec<_>>().join("\n\n");
        let mut entry = ConversationEntry::structured(text, vec![GeoPoint::from([37.5, 127.0]); 5]).with_delivery(
            Delivery::Persisted
        );
        entry.page_cursor = 1;

        let rendered = render_entry(4, &entry);
        assert!(rendered.starts_with("[4] Bot:\n  * Cafe 5\n    Open 9-18\n    @ 37.50000, 127.00000\n  * Cafe 6\n"));
        assert!(rendered.ends_with("  page 2/2  /prev 4\n"));
        assert_eq!(rendered.matches('@').count(), 1);
    }

    #[tokio::test]
    async fn pending_user_entry_is_printed_before_the_reply() {
        let session = ready_session(Duration::from_millis(400)).await;
        let mut lines = BufReader::new(&b""[..]).lines();
        let mut out = Vec::new();
        let mut shown = session.len();

        let outcome = wait_for(
            &session,
            session.submit("where to eat?"),
            &mut lines,
            &mut out,
            &mut shown
        ).await.unwrap();

        assert!(outcome.is_ok());
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.starts_with("[1] You:"));
        assert!(printed.contains("  where to eat?\n"));
        assert!(!printed.contains("galbi"));
        assert_eq!(shown, 2);
        assert_eq!(session.len(), 3);
    }

    #[tokio::test]
    async fn cancel_command_stops_waiting() {
        let session = ready_session(Duration::from_secs(5)).await;
        let (reader, mut writer) = tokio::io::duplex(64);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.write_all(b"/cancel\n").await.unwrap();
        });
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();
        let mut shown = session.len();

        let outcome = wait_for(
            &session,
            session.submit("slow one"),
            &mut lines,
            &mut out,
            &mut shown
        ).await.unwrap();

        assert!(matches!(outcome, Err(SessionError::Cancelled)));
        assert!(session.entry(1).unwrap().unanswered);
    }
}
