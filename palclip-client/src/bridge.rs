//! The only place the session touches the backend and the keyboard.

use std::sync::{
    Arc,
    mpsc::{self, Receiver, Sender},
};

use palclip_core::{BackendEvent, BackendEventKind, NO_SERVER_FILTER, Signal};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, EventHandler, TransportError},
    events::{EventBus, Subscription},
};

/// Something that happened outside the session, queued for the next poll.
#[derive(Debug)]
pub(crate) enum Inbound {
    Fetched(Result<String, TransportError>),
    ItemCopied,
    HotkeyPressed,
    QuickCopy(usize),
}

pub struct EventBridge {
    backend: Arc<dyn Backend>,
    keyboard: EventBus<char>,
    subscriptions: Vec<Subscription>,
    inbox: Option<Receiver<Inbound>>,
    outbox: Option<Sender<Inbound>>,
}

impl EventBridge {
    pub fn new(backend: Arc<dyn Backend>, keyboard: EventBus<char>) -> Self {
        Self {
            backend,
            keyboard,
            subscriptions: Vec::new(),
            inbox: None,
            outbox: None,
        }
    }

    /// Subscribe to backend notifications and digit keys, then request the first fetch.
    ///
    /// Any earlier installation is torn down first, so handlers never accumulate. Each
    /// installation gets a fresh inbox; replies addressed to an older one are dropped.
    pub fn install(&mut self) {
        self.teardown();

        let (tx, rx) = mpsc::channel::<Inbound>();

        let copied_tx = tx.clone();
        self.subscribe_backend(
            BackendEventKind::ItemCopied,
            Box::new(move |_: &BackendEvent| {
                let _ = copied_tx.send(Inbound::ItemCopied);
            }),
        );

        let hotkey_tx = tx.clone();
        self.subscribe_backend(
            BackendEventKind::GlobalHotkeyPressed,
            Box::new(move |_: &BackendEvent| {
                let _ = hotkey_tx.send(Inbound::HotkeyPressed);
            }),
        );

        let key_tx = tx.clone();
        self.subscriptions.push(self.keyboard.subscribe(move |key: &char| {
            if let Some(index) = key.to_digit(10) {
                let _ = key_tx.send(Inbound::QuickCopy(index as usize));
            }
        }));

        self.inbox = Some(rx);
        self.outbox = Some(tx);
        info!(subscriptions = self.subscriptions.len(), "event bridge installed");

        self.refetch();
    }

    fn subscribe_backend(&mut self, kind: BackendEventKind, handler: EventHandler) {
        match self.backend.on(kind, handler) {
            Ok(subscription) => self.subscriptions.push(subscription),
            Err(err) => warn!(?kind, "subscribe failed: {err}"),
        }
    }

    /// Release every subscription and close the inbox.
    pub fn teardown(&mut self) {
        let released = self.subscriptions.len();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.inbox = None;
        self.outbox = None;
        if released > 0 {
            debug!(released, "event bridge torn down");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Ask for the full clip list. The reply lands in the inbox.
    pub fn refetch(&self) {
        let Some(tx) = self.outbox.clone() else {
            return;
        };
        self.backend.get_clip_data(
            NO_SERVER_FILTER,
            Box::new(move |result| {
                let _ = tx.send(Inbound::Fetched(result));
            }),
        );
    }

    pub(crate) fn drain(&self) -> Vec<Inbound> {
        match &self.inbox {
            Some(rx) => rx.try_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Put `content` on the system clipboard and hide the window.
    pub fn copy(&self, content: &str) {
        if let Err(err) = self.backend.copy_item_content(content) {
            warn!("copy item content failed: {err}");
        }
        self.signal(Signal::WindowHide);
    }

    pub fn mark_secret(&self, hash: &str) {
        self.signal(Signal::MarkSecret {
            hash: hash.to_owned(),
        });
    }

    pub fn signal(&self, signal: Signal) {
        if let Err(err) = self.backend.emit(signal) {
            warn!("emit failed: {err}");
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}
