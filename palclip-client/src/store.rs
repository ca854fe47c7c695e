use palclip_core::{ClipEntry, filter_entries};

/// The full clip history as last delivered by the backend, plus the filtered view.
///
/// The history is only ever replaced as a whole. The view is recomputed on every
/// replacement using whatever search term is current at that moment.
#[derive(Debug, Default)]
pub struct ClipStore {
    entries: Vec<ClipEntry>,
    view: Vec<ClipEntry>,
}

impl ClipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, entries: Vec<ClipEntry>, term: &str) {
        self.entries = entries;
        self.apply_filter(term);
    }

    pub fn apply_filter(&mut self, term: &str) {
        self.view = filter_entries(&self.entries, term);
    }

    pub fn current(&self) -> &[ClipEntry] {
        &self.entries
    }

    pub fn view(&self) -> &[ClipEntry] {
        &self.view
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.view.clear();
    }
}
