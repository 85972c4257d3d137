//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps free-text fields bounded so one long note cannot wreck a listing.

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Left-align `input` in a `width`-char cell, truncating long values.
pub fn cell(input: &str, width: usize) -> String {
    let text = compact_line(input, width.saturating_sub(3).max(1));
    format!("{:<width$}", text, width = width)
}
