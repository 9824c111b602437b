//! Deterministic bounding of step output and error text.
//!
//! Step results and blocker reports are persisted for the life of a
//! workflow, so their text fields are capped. The newest content is kept:
//! the tail of command output is what explains a failure.

/// Maximum number of lines kept in a bounded field.
pub const MAX_LINES: usize = 100;
/// Maximum number of characters kept in a bounded field.
pub const MAX_CHARS: usize = 4000;

/// Characters reserved for the truncation marker line.
const MARKER_RESERVE: usize = 64;

/// Bound `text` to [`MAX_LINES`] lines and [`MAX_CHARS`] characters.
///
/// Text within both caps is returned unchanged. Otherwise the oldest content
/// is dropped and a one-line marker is prepended; the result (marker
/// included) stays within both caps.
pub fn truncate_output(text: &str) -> String {
    let line_count = text.lines().count();
    let char_count = text.chars().count();
    if line_count <= MAX_LINES && char_count <= MAX_CHARS {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let keep_from = lines.len().saturating_sub(MAX_LINES - 1);
    let mut kept = lines[keep_from..].join("\n");

    let budget = MAX_CHARS - MARKER_RESERVE;
    let kept_chars = kept.chars().count();
    if kept_chars > budget {
        kept = kept.chars().skip(kept_chars - budget).collect();
    }

    let dropped_chars = char_count.saturating_sub(kept.chars().count());
    format!("[truncated {dropped_chars} earlier characters]\n{kept}")
}
