use crate::ClipEntry;

/// Derive the visible view from the full history.
///
/// An entry is kept when `term` is empty or its lower-cased content contains the lower-cased
/// term. The term is used verbatim (no trimming or tokenizing) and input order is preserved.
pub fn filter_entries(entries: &[ClipEntry], term: &str) -> Vec<ClipEntry> {
    if term.is_empty() {
        return entries.to_vec();
    }

    let needle = term.to_lowercase();
    entries
        .iter()
        .filter(|entry| content_matches(&entry.content, &needle))
        .cloned()
        .collect()
}

fn content_matches(content: &str, lowered_needle: &str) -> bool {
    !content.is_empty() && content.to_lowercase().contains(lowered_needle)
}
