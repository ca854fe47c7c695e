use std::{sync::Arc, time::Duration};

use palclip_core::{ClipEntry, Signal, decode_clip_list, format_entry, log_preview, timestamp_label};
use tracing::{debug, info, warn};

use crate::{
    backend::Backend,
    bridge::{EventBridge, Inbound},
    events::EventBus,
    settings::{SettingsLoadError, SettingsSaveError, SettingsStorage},
    store::ClipStore,
};

/// Rows reachable through the digit keys 0-9.
pub const QUICK_COPY_SLOTS: usize = 10;

pub const COPIED_NOTICE: &str = "Copied!";
pub const MARKED_SECRET_NOTICE: &str = "Marked secret!";
pub const ABOUT_NOTICE: &str = "Cross platform clipboard manager";

const SHORT_NOTICE_DURATION: Duration = Duration::from_millis(500);
const ABOUT_NOTICE_DURATION: Duration = Duration::from_millis(4000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Clear,
    Settings,
    About,
    Quit,
}

/// A transient confirmation for the presentation layer to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub duration: Duration,
}

impl Notice {
    fn new(text: &str, duration: Duration) -> Self {
        Self {
            text: text.to_owned(),
            duration,
        }
    }
}

/// One visible row, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRow {
    pub entry: ClipEntry,
    pub text: String,
    pub timestamp_label: String,
    /// Digit key bound to this row, if any.
    pub shortcut: Option<usize>,
}

/// Owns the clip store, the search term and the settings slot, and routes everything the
/// presentation layer does to the backend through one [`EventBridge`].
///
/// Nothing runs on its own: backend replies and notifications queue up until
/// [`Session::poll_events`] is called, and are applied in arrival order.
pub struct Session {
    bridge: EventBridge,
    store: ClipStore,
    search_term: String,
    settings: Box<dyn SettingsStorage>,
    notices: Vec<Notice>,
}

impl Session {
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: Box<dyn SettingsStorage>,
        keyboard: EventBus<char>,
    ) -> Self {
        Self {
            bridge: EventBridge::new(backend, keyboard),
            store: ClipStore::new(),
            search_term: String::new(),
            settings,
            notices: Vec::new(),
        }
    }

    /// Subscribe and request the initial clip list.
    pub fn start(&mut self) {
        self.bridge.install();
    }

    pub fn teardown(&mut self) {
        self.bridge.teardown();
    }

    /// Drop all state and start over with fresh subscriptions.
    pub fn reload(&mut self) {
        info!("reloading session");
        self.teardown();
        self.store.clear();
        self.search_term.clear();
        self.start();
    }

    pub fn is_started(&self) -> bool {
        self.bridge.is_installed()
    }

    /// Apply everything that arrived since the last call. Returns true when the clip list
    /// was replaced.
    pub fn poll_events(&mut self) -> bool {
        let mut changed = false;
        for inbound in self.bridge.drain() {
            match inbound {
                Inbound::Fetched(Ok(payload)) => match decode_clip_list(&payload) {
                    Ok(entries) => {
                        debug!(entries = entries.len(), "clip list replaced");
                        self.store.replace_all(entries, &self.search_term);
                        changed = true;
                    }
                    Err(err) => warn!("discarding malformed clip list: {err}"),
                },
                Inbound::Fetched(Err(err)) => warn!("clip list fetch failed: {err}"),
                Inbound::ItemCopied => self.bridge.refetch(),
                Inbound::HotkeyPressed => self.bridge.signal(Signal::WindowShow),
                Inbound::QuickCopy(index) => {
                    self.on_quick_copy(index);
                }
            }
        }
        changed
    }

    pub fn on_search_change(&mut self, term: &str) {
        self.search_term = term.to_owned();
        self.store.apply_filter(term);
    }

    pub fn on_copy_click(&mut self, entry: &ClipEntry) {
        info!(hash = %entry.hash, preview = %log_preview(&entry.content), "copy");
        self.bridge.copy(&entry.content);
        self.notices
            .push(Notice::new(COPIED_NOTICE, SHORT_NOTICE_DURATION));
    }

    /// Flag the entry as secret, then reload everything so the new flag is fetched.
    pub fn on_mark_secret_click(&mut self, hash: &str) {
        info!(hash, "mark secret");
        self.bridge.mark_secret(hash);
        self.notices
            .push(Notice::new(MARKED_SECRET_NOTICE, SHORT_NOTICE_DURATION));
        self.reload();
    }

    pub fn on_menu_action(&mut self, action: MenuAction) {
        debug!(?action, "menu action");
        match action {
            MenuAction::Clear => self.bridge.signal(Signal::MenuClear(true)),
            MenuAction::Settings => self.bridge.signal(Signal::MenuSettings(true)),
            MenuAction::Quit => self.bridge.signal(Signal::MenuQuit(true)),
            MenuAction::About => self
                .notices
                .push(Notice::new(ABOUT_NOTICE, ABOUT_NOTICE_DURATION)),
        }
    }

    pub fn on_settings_open(&self) -> Result<Option<String>, SettingsLoadError> {
        self.settings.load()
    }

    pub fn on_settings_save(&mut self, text: &str) -> Result<(), SettingsSaveError> {
        self.settings.save(text)?;
        info!(bytes = text.len(), "settings saved");
        Ok(())
    }

    /// Copy the row at `index` of the filtered view. Returns false (and does nothing) when
    /// the index is not a quick-copy slot or the view is shorter.
    pub fn on_quick_copy(&mut self, index: usize) -> bool {
        if index >= QUICK_COPY_SLOTS {
            return false;
        }
        let Some(entry) = self.store.view().get(index).cloned() else {
            debug!(index, visible = self.store.view().len(), "quick copy out of range");
            return false;
        };
        self.on_copy_click(&entry);
        true
    }

    pub fn entries(&self) -> &[ClipEntry] {
        self.store.current()
    }

    pub fn view(&self) -> &[ClipEntry] {
        self.store.view()
    }

    pub fn search_term(&self) -> &str {
        &self.search_term
    }

    pub fn rows(&self) -> Vec<ClipRow> {
        self.store
            .view()
            .iter()
            .enumerate()
            .map(|(index, entry)| ClipRow {
                entry: entry.clone(),
                text: format_entry(entry),
                timestamp_label: timestamp_label(entry.timestamp),
                shortcut: (index < QUICK_COPY_SLOTS).then_some(index),
            })
            .collect()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn subscription_count(&self) -> usize {
        self.bridge.subscription_count()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
