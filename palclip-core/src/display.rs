//! Display strings for history rows.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::ClipEntry;

/// Trimmed content longer than this many characters is shortened.
pub const TRUNCATE_THRESHOLD: usize = 40;
pub const TRUNCATED_PREVIEW_CHARS: usize = 30;
pub const SECRET_VISIBLE_CHARS: usize = 3;
pub const MASK_SUFFIX: &str = "******";
pub const ELLIPSIS: &str = "...";

/// Compute the text shown for an entry.
///
/// Empty content is returned as is. Secret entries show at most three non-whitespace
/// characters followed by [`MASK_SUFFIX`], whatever the original length. Other content is
/// trimmed, and when it is longer than [`TRUNCATE_THRESHOLD`] characters its whitespace runs
/// are collapsed and it is cut to thirty characters plus [`ELLIPSIS`].
pub fn format_entry(entry: &ClipEntry) -> String {
    if entry.content.is_empty() {
        return String::new();
    }

    let trimmed = entry.content.trim();
    if entry.is_secret {
        let mut out: String = trimmed
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .take(SECRET_VISIBLE_CHARS)
            .collect();
        out.push_str(MASK_SUFFIX);
        return out;
    }

    if trimmed.chars().count() > TRUNCATE_THRESHOLD {
        let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut out: String = collapsed.chars().take(TRUNCATED_PREVIEW_CHARS).collect();
        out.push_str(ELLIPSIS);
        return out;
    }

    trimmed.to_owned()
}

/// RFC 3339 UTC label with millisecond precision, or an empty string when out of range.
pub fn timestamp_label(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
