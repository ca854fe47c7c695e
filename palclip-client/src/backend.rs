//! The backend surface the session talks to.

use palclip_core::{BackendEvent, BackendEventKind, Signal};
use thiserror::Error;

use crate::events::{EventBus, Subscription};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Completion callback for a clip list request. Receives the raw JSON payload.
pub type FetchReply = Box<dyn FnOnce(Result<String, TransportError>) + Send>;

/// Handler for one kind of backend push notification.
pub type EventHandler = Box<dyn Fn(&BackendEvent) + Send + Sync>;

/// Backend calls are asynchronous and never acknowledged, except for the clip list fetch
/// whose reply arrives through `reply`, possibly on another thread.
pub trait Backend: Send + Sync {
    fn get_clip_data(&self, filter: &str, reply: FetchReply);

    fn copy_item_content(&self, content: &str) -> Result<(), TransportError>;

    fn emit(&self, signal: Signal) -> Result<(), TransportError>;

    fn on(
        &self,
        kind: BackendEventKind,
        handler: EventHandler,
    ) -> Result<Subscription, TransportError>;
}

/// Subscribe `handler` to the events of one kind published on `bus`.
pub fn subscribe_kind(
    bus: &EventBus<BackendEvent>,
    kind: BackendEventKind,
    handler: EventHandler,
) -> Subscription {
    bus.subscribe(move |event: &BackendEvent| {
        if event.kind() == kind {
            handler(event);
        }
    })
}
