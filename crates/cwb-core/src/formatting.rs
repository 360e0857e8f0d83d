//! Formatting utilities (notice text, Telegram HTML escaping).

use crate::{
    domain::{RepositoryId, RevisionInfo, WatchEntry},
    source::FetchError,
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Truncate to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Notice for a new revision. The commit message is cut before escaping so an
/// entity is never split.
pub fn revision_notice(repo: &RepositoryId, info: &RevisionInfo, max_len: usize) -> String {
    let head = format!("latest revision for {repo} by {}: ", info.author);
    let budget = max_len.saturating_sub(head.chars().count()).max(16);
    let mut message = truncate_chars(info.message.trim_end(), budget);
    let mut html = escape_html(&format!("{head}{message}"));

    // Escaping grows the text; shrink the message until it fits.
    while html.chars().count() > max_len && !message.is_empty() {
        let shorter = message.chars().count().saturating_sub(64);
        message = truncate_chars(&message, shorter);
        if shorter <= 3 {
            message.clear();
        }
        html = escape_html(&format!("{head}{message}"));
    }
    html
}

pub fn fetch_failure_notice(repo: &RepositoryId, err: &FetchError) -> String {
    escape_html(&format!(
        "Failed to retrieve commit information for {repo} ({err}). Please check the repository name and try again."
    ))
}

/// `/list` reply body.
pub fn watch_list_html(entries: &[WatchEntry]) -> String {
    if entries.is_empty() {
        return "No repositories are being watched.".to_string();
    }

    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(format!("<b>Watched repositories ({})</b>", entries.len()));
    for e in entries {
        let dests = e
            .destinations
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "• <code>{}</code> → {}",
            escape_html(e.repo.as_str()),
            escape_html(&dests)
        ));
    }
    lines.join("\n")
}
