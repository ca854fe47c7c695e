//! Client-side state for the PalClip clipboard history.

pub mod backend;
pub mod bridge;
pub mod events;
pub mod session;
pub mod settings;
pub mod store;
pub mod ws_backend;

pub use backend::{Backend, EventHandler, FetchReply, TransportError};
pub use events::{EventBus, Subscription};
pub use session::{ClipRow, MenuAction, Notice, Session};
pub use settings::{FileSettingsStore, MemorySettingsStore, SettingsStorage};
pub use ws_backend::{WsBackend, WsBackendConfig};
