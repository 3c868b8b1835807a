//! Interactive renderer for an SSH session (spec §4.10).
//!
//! Grounded on the teacher's `terminal_ui.rs` box-drawing helpers, repurposed
//! from one-shot activation/success boxes into a redrawable three-mode
//! status screen. All writes to the SSH channel still come from a single
//! caller per session (spec §5: "interactive channel writes: serialized per
//! session") — this module only builds the bytes, the SSH handler owns
//! actually sending them.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use console::{pad_str, style, Alignment};

use crate::error::TunnelError;
use crate::registry::{ForwardKind, InteractiveMode, Session, SessionKey};

const BOX_WIDTH: usize = 58;

fn top_border() -> String {
    format!("\x1B[2J\x1B[H╔{}╗\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn middle_border() -> String {
    format!("╠{}╣\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn bottom_border() -> String {
    format!("╚{}╝\r\n", "═".repeat(BOX_WIDTH + 2))
}

fn content_line(text: &str) -> String {
    let padded = pad_str(text, BOX_WIDTH, Alignment::Left, None);
    format!("║ {} ║\r\n", padded)
}

fn centered_line(text: &str) -> String {
    let padded = pad_str(text, BOX_WIDTH, Alignment::Center, None);
    format!("║ {} ║\r\n", padded)
}

fn empty_line() -> String {
    content_line("")
}

/// Renders whichever of the three modes the session is currently in.
pub async fn render(session: &Arc<Session>, domain: &str) -> Result<Vec<u8>, TunnelError> {
    let mode = *session.mode.lock().await;
    let body = match mode {
        InteractiveMode::Status => render_status(session, domain).await,
        InteractiveMode::EditSlug => render_edit_slug(session).await,
        InteractiveMode::ConfirmDrop => render_confirm_drop(session).await,
    };
    Ok(body.into_bytes())
}

async fn render_status(session: &Arc<Session>, domain: &str) -> String {
    let mut out = String::new();
    out.push_str(&top_border());
    out.push_str(&centered_line(&format!("{} TUNNELS", style("\u{25cf}").green())));
    out.push_str(&middle_border());

    let forwards = session.forwards.lock().await;
    if forwards.is_empty() {
        out.push_str(&content_line("No active forwards yet."));
    } else {
        for record in forwards.values() {
            let label = match record.kind {
                ForwardKind::Http => {
                    let slug = record.key.lock().await.clone();
                    format!("https://{}.{}", slug, domain)
                }
                ForwardKind::Tcp | ForwardKind::Unknown => {
                    format!("tcp://{}:{}", domain, record.bind_port)
                }
            };
            let bytes_in = record.bytes_in.load(Ordering::Relaxed);
            let bytes_out = record.bytes_out.load(Ordering::Relaxed);
            out.push_str(&content_line(&format!("{}  in:{}B out:{}B", label, bytes_in, bytes_out)));
        }
    }
    drop(forwards);

    out.push_str(&empty_line());
    out.push_str(&content_line(&format!("uptime: {}s", session.started_at.elapsed().as_secs())));
    out.push_str(&middle_border());
    out.push_str(&content_line("[e] edit slug   [d] drop session   [q] quit"));
    out.push_str(&bottom_border());
    out
}

async fn render_edit_slug(session: &Arc<Session>) -> String {
    let buffer = session.edit_buffer.lock().await.clone();
    let mut out = String::new();
    out.push_str(&top_border());
    out.push_str(&centered_line("RENAME SLUG"));
    out.push_str(&middle_border());
    out.push_str(&content_line(&format!("new slug: {}", buffer)));
    out.push_str(&empty_line());
    out.push_str(&content_line("[enter] commit   [esc] cancel"));
    out.push_str(&bottom_border());
    out
}

/// Appends or rejects a keystroke in `EditSlug` mode and, on `enter`,
/// attempts the rename. Returns the error message to display inline, if any
/// (spec §4.10: "showing the returned error inline without leaving the
/// mode").
pub async fn edit_slug_keystroke(
    session: &Arc<Session>,
    owner: &str,
    registry: &crate::registry::Registry,
    ch: char,
) -> Option<String> {
    match ch {
        '\r' | '\n' => {
            let Some(old) = session.selected.lock().await.clone() else {
                return Some("no slug selected".to_string());
            };
            let new_id = session.edit_buffer.lock().await.clone();
            let new = SessionKey { id: new_id, kind: ForwardKind::Http };
            match registry.update(owner, &old, &new).await {
                Ok(()) => {
                    *session.mode.lock().await = InteractiveMode::Status;
                    None
                }
                Err(e) => Some(e.to_string()),
            }
        }
        '\x1b' => {
            *session.mode.lock().await = InteractiveMode::Status;
            None
        }
        '\x7f' | '\x08' => {
            session.edit_buffer.lock().await.pop();
            None
        }
        c if c.is_ascii_graphic() => {
            session.edit_buffer.lock().await.push(c);
            None
        }
        _ => None,
    }
}

async fn render_confirm_drop(session: &Arc<Session>) -> String {
    let _ = session;
    let mut out = String::new();
    out.push_str(&top_border());
    out.push_str(&centered_line("DROP SESSION?"));
    out.push_str(&middle_border());
    out.push_str(&content_line("This closes every forward on this connection."));
    out.push_str(&empty_line());
    out.push_str(&content_line("[y] confirm   [n] cancel"));
    out.push_str(&bottom_border());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;
    use tokio::sync::{Mutex, Notify};

    fn fake_session() -> Arc<Session> {
        Arc::new(Session {
            id: "s1".into(),
            owner: "owner1".into(),
            started_at: Instant::now(),
            active: AtomicBool::new(true),
            handle: None,
            term_size: Mutex::new((80, 24)),
            mode: Mutex::new(InteractiveMode::Status),
            selected: Mutex::new(None),
            edit_buffer: Mutex::new(String::new()),
            forwards: Mutex::new(std::collections::HashMap::new()),
            redraw: Notify::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn status_mode_renders_empty_list() {
        let session = fake_session();
        let out = render(&session, "example.com").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("No active forwards yet."));
    }

    #[tokio::test]
    async fn edit_slug_backspace_and_commit() {
        let registry = Registry::new();
        let session = fake_session();
        let key = SessionKey::http("alpha");
        registry.register(key.clone(), session.clone()).await;
        *session.selected.lock().await = Some(key);
        *session.mode.lock().await = InteractiveMode::EditSlug;

        for c in "bravoo".chars() {
            edit_slug_keystroke(&session, "owner1", &registry, c).await;
        }
        edit_slug_keystroke(&session, "owner1", &registry, '\x7f').await;
        assert_eq!(*session.edit_buffer.lock().await, "bravo");

        let err = edit_slug_keystroke(&session, "owner1", &registry, '\r').await;
        assert!(err.is_none());
        assert_eq!(*session.mode.lock().await, InteractiveMode::Status);
        assert!(registry.get(&SessionKey::http("bravo")).await.is_some());
    }

    #[tokio::test]
    async fn edit_slug_invalid_shows_inline_error() {
        let registry = Registry::new();
        let session = fake_session();
        let key = SessionKey::http("alpha");
        registry.register(key.clone(), session.clone()).await;
        *session.selected.lock().await = Some(key);
        *session.mode.lock().await = InteractiveMode::EditSlug;

        for c in "admin".chars() {
            edit_slug_keystroke(&session, "owner1", &registry, c).await;
        }
        let err = edit_slug_keystroke(&session, "owner1", &registry, '\r').await;
        assert!(err.is_some());
        assert_eq!(*session.mode.lock().await, InteractiveMode::EditSlug);
    }
}
