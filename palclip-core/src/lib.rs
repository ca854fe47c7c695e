use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod display;
pub mod filter;

pub use display::{MASK_SUFFIX, TRUNCATE_THRESHOLD, format_entry, timestamp_label};
pub use filter::filter_entries;

pub const MAX_FRAME_BYTES: usize = 512 * 1024;
/// Largest capture the backend records or the client sends back for copying.
pub const MAX_CLIP_TEXT_BYTES: usize = 128 * 1024;
pub const MAX_CLIENT_NAME_LEN: usize = 128;
/// Filter argument for `GetClipData` meaning "no server-side filter".
pub const NO_SERVER_FILTER: &str = "none";

pub type RequestId = u64;
pub type ClipHash = String;

/// One recorded clipboard capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipEntry {
    pub hash: ClipHash,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub is_secret: bool,
}

impl ClipEntry {
    pub fn new(content: impl Into<String>, timestamp: i64) -> Self {
        let content = content.into();
        Self {
            hash: content_hash(&content),
            content,
            timestamp,
            is_secret: false,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackendEventKind {
    ItemCopied,
    GlobalHotkeyPressed,
}

/// Notifications pushed by the backend on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BackendEvent {
    ItemCopied,
    GlobalHotkeyPressed,
}

impl BackendEvent {
    pub fn kind(&self) -> BackendEventKind {
        match self {
            BackendEvent::ItemCopied => BackendEventKind::ItemCopied,
            BackendEvent::GlobalHotkeyPressed => BackendEventKind::GlobalHotkeyPressed,
        }
    }
}

/// Named signals emitted by the client on the event channel.
///
/// Menu signals carry only a boolean marker; the backend never answers them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Signal {
    MarkSecret { hash: ClipHash },
    MenuClear(bool),
    MenuSettings(bool),
    MenuQuit(bool),
    WindowHide,
    WindowShow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub client_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetClipData {
    pub request_id: RequestId,
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipData {
    pub request_id: RequestId,
    /// JSON text of the entry list, decoded on the client with [`decode_clip_list`].
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    Hello(Hello),
    GetClipData(GetClipData),
    CopyItemContent { content: String },
    Signal(Signal),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    ClipData(ClipData),
    Event(BackendEvent),
    /// `request_id` is set when the error answers a `GetClipData`.
    Error {
        #[serde(default)]
        request_id: Option<RequestId>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Client(ClientMessage),
    Server(ServerMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Client = 0,
    Server = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("clip text is {len} bytes, limit is {max}")]
    ClipTooLarge { len: usize, max: usize },
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("clip list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a `GetClipData` payload into an ordered entry list.
///
/// A JSON `null` decodes as an empty history.
pub fn decode_clip_list(payload: &str) -> Result<Vec<ClipEntry>, DecodeError> {
    let entries: Option<Vec<ClipEntry>> = serde_json::from_str(payload)?;
    Ok(entries.unwrap_or_default())
}

pub fn check_clip_size(content: &str) -> Result<(), CoreError> {
    if content.len() > MAX_CLIP_TEXT_BYTES {
        return Err(CoreError::ClipTooLarge {
            len: content.len(),
            max: MAX_CLIP_TEXT_BYTES,
        });
    }
    Ok(())
}

pub fn encode_clip_list(entries: &[ClipEntry]) -> Result<String, CoreError> {
    serde_json::to_string(entries).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Client(client) => (
            MessageType::Client as u8,
            serde_json::to_vec(client).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        WireMessage::Server(server) => (
            MessageType::Server as u8,
            serde_json::to_vec(server).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        });
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        });
    }
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Client as u8 => {
            let client: ClientMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Client(client))
        }
        x if x == MessageType::Server as u8 => {
            let server: ServerMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Server(server))
        }
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

/// Stable identity of a capture: hex SHA-256 of its content.
pub fn content_hash(content: &str) -> ClipHash {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)
}

/// Short single-line preview for log lines; never the full content.
pub fn log_preview(content: &str) -> String {
    let standardized = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out: String = standardized.chars().take(10).collect();
    if standardized.chars().count() > 10 {
        out.push_str("...");
    }
    out
}
