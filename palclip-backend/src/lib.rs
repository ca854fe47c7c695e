use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use palclip_core::{
    BackendEvent, ClientMessage, ClipData, ClipEntry, ClipHash, CoreError, GetClipData, Hello,
    MAX_CLIENT_NAME_LEN, MAX_FRAME_BYTES, NO_SERVER_FILTER, RequestId, ServerMessage, Signal,
    WireMessage, check_clip_size, decode_frame, encode_clip_list, encode_frame, log_preview,
};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc, watch},
};
use tracing::{debug, error, info, warn};

/// Destination for `CopyItemContent`.
pub trait ClipboardWriter: Send + Sync {
    fn write_text(&self, text: &str) -> Result<(), String>;
}

/// Writes to the OS clipboard.
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl ClipboardWriter for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<(), String> {
        let mut clipboard = arboard::Clipboard::new().map_err(|err| err.to_string())?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| err.to_string())
    }
}

/// Keeps the last written text; used when no system clipboard is wanted.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    last: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn last_written(&self) -> Option<String> {
        self.last.lock().ok().and_then(|guard| guard.clone())
    }
}

impl ClipboardWriter for MemoryClipboard {
    fn write_text(&self, text: &str) -> Result<(), String> {
        let mut slot = self
            .last
            .lock()
            .map_err(|_| "memory clipboard lock poisoned".to_owned())?;
        *slot = Some(text.to_owned());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Connection {
    client_name: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug)]
struct BackendState {
    clips: HashMap<ClipHash, ClipEntry>,
    connections: HashMap<u64, Connection>,
    next_connection_id: u64,
    last_timestamp: i64,
    window_visible: bool,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            clips: HashMap::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
            last_timestamp: 0,
            window_visible: true,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<BackendState>>,
    clipboard: Arc<dyn ClipboardWriter>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AppState {
    #[must_use]
    pub fn new(clipboard: Arc<dyn ClipboardWriter>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RwLock::new(BackendState::default())),
            clipboard,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryClipboard::default()))
    }

    /// Record a capture and notify every connected client with `item-copied`.
    ///
    /// Re-recording the same content refreshes its timestamp and keeps its secret flag.
    /// Captures over [`palclip_core::MAX_CLIP_TEXT_BYTES`] are rejected.
    pub async fn record_clip(&self, content: String) -> Result<ClipEntry, CoreError> {
        check_clip_size(&content)?;

        let mut backend = self.inner.write().await;
        let timestamp = now_unix_ms().max(backend.last_timestamp + 1);
        backend.last_timestamp = timestamp;

        let mut entry = ClipEntry::new(content, timestamp);
        entry.is_secret = backend
            .clips
            .get(&entry.hash)
            .is_some_and(|existing| existing.is_secret);
        info!(preview = %log_preview(&entry.content), "copied");

        backend.clips.insert(entry.hash.clone(), entry.clone());
        let recipients = connected_senders(&backend);
        drop(backend);

        broadcast(recipients, ServerMessage::Event(BackendEvent::ItemCopied));
        Ok(entry)
    }

    pub async fn press_hotkey(&self) {
        let recipients = connected_senders(&*self.inner.read().await);
        info!(clients = recipients.len(), "global hotkey pressed");
        broadcast(
            recipients,
            ServerMessage::Event(BackendEvent::GlobalHotkeyPressed),
        );
    }

    /// History ordered newest first.
    pub async fn clip_list(&self) -> Vec<ClipEntry> {
        let backend = self.inner.read().await;
        let mut clips: Vec<ClipEntry> = backend.clips.values().cloned().collect();
        clips.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        clips
    }

    pub async fn window_visible(&self) -> bool {
        self.inner.read().await.window_visible
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    async fn apply_signal(&self, client_name: &str, signal: Signal) {
        match signal {
            Signal::MarkSecret { hash } => {
                let mut backend = self.inner.write().await;
                match backend.clips.get_mut(&hash) {
                    Some(entry) => {
                        entry.is_secret = true;
                        info!(%hash, "entry marked secret");
                    }
                    None => warn!(%hash, "mark-secret for unknown entry"),
                }
            }
            Signal::MenuClear(_) => {
                let mut backend = self.inner.write().await;
                let removed = backend.clips.len();
                backend.clips.clear();
                info!(removed, "history cleared");
            }
            Signal::MenuSettings(_) => {
                info!(client = client_name, "settings requested");
            }
            Signal::MenuQuit(_) => {
                info!(client = client_name, "quit requested");
                self.request_shutdown();
            }
            Signal::WindowHide => {
                self.inner.write().await.window_visible = false;
                debug!("window hidden");
            }
            Signal::WindowShow => {
                self.inner.write().await.window_visible = true;
                debug!("window shown");
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[derive(Debug, Deserialize)]
struct RecordClipRequest {
    content: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/clips", post(record_clip_handler))
        .route("/hotkey", post(hotkey_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Serve until a client sends `menu-quit` or [`AppState::request_shutdown`] is called.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "backend listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    let shutdown_state = state.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown_state.shutdown_signal().await })
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn record_clip_handler(
    State(state): State<AppState>,
    Json(request): Json<RecordClipRequest>,
) -> Response {
    match state.record_clip(request.content).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => {
            warn!("capture rejected: {}", err);
            (StatusCode::PAYLOAD_TOO_LARGE, err.to_string()).into_response()
        }
    }
}

async fn hotkey_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.press_hotkey().await;
    StatusCode::NO_CONTENT
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // Frames above MAX_FRAME_BYTES are dropped by the session, not by the socket.
    ws.max_message_size(MAX_FRAME_BYTES * 4)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()));
    let hello = match first_message.and_then(|message| parse_hello_message(&message)) {
        Ok(hello) => hello,
        Err(err) => {
            send_task.abort();
            return Err(err);
        }
    };

    let client_name = hello.client_name;
    let connection_id = register_client(
        &state,
        Connection {
            client_name: client_name.clone(),
            tx: outbound_tx.clone(),
        },
    )
    .await;

    info!(connection_id, client = %client_name, "client connected");

    loop {
        let next_message = tokio::select! {
            next = ws_receiver.next() => next,
            _ = state.shutdown_signal() => break,
        };
        let Some(next_message) = next_message else {
            break;
        };
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    warn!("dropping oversized message from {}", client_name);
                    continue;
                }

                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!("failed to decode frame from {}: {}", client_name, err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Client(client_message) => {
                        handle_client_message(&state, &client_name, &outbound_tx, client_message)
                            .await;
                    }
                    WireMessage::Server(_) => {
                        warn!("unexpected server message from {}", client_name);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_client(&state, connection_id).await;
    send_task.abort();
    info!(connection_id, client = %client_name, "client disconnected");
    Ok(())
}

async fn handle_client_message(
    state: &AppState,
    client_name: &str,
    reply_tx: &mpsc::UnboundedSender<Message>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Hello(_) => {
            warn!("duplicate hello from {}", client_name);
        }
        ClientMessage::GetClipData(GetClipData { request_id, filter }) => {
            if filter != NO_SERVER_FILTER {
                debug!(request_id, %filter, "server-side filter ignored");
            }
            let clips = state.clip_list().await;
            match clip_data_frame(request_id, &clips) {
                Ok((frame, served)) => {
                    if served < clips.len() {
                        warn!(
                            request_id,
                            served,
                            total = clips.len(),
                            "history exceeds frame limit, oldest entries left out"
                        );
                    }
                    debug!(request_id, entries = served, "clip data served");
                    let _ = reply_tx.send(Message::Binary(frame.into()));
                }
                Err(err) => {
                    error!(request_id, "failed to encode clip list: {}", err);
                    send_to(
                        reply_tx,
                        ServerMessage::Error {
                            request_id: Some(request_id),
                            message: "clip list unavailable".to_owned(),
                        },
                    );
                }
            }
        }
        ClientMessage::CopyItemContent { content } => {
            match state.clipboard.write_text(&content) {
                Ok(()) => info!(preview = %log_preview(&content), "content placed on clipboard"),
                Err(err) => warn!("clipboard write failed: {}", err),
            }
        }
        ClientMessage::Signal(signal) => {
            state.apply_signal(client_name, signal).await;
        }
    }
}

/// Encode a `ClipData` reply holding the newest entries that fit in one frame.
/// Returns the frame and the number of entries it carries.
fn clip_data_frame(
    request_id: RequestId,
    clips: &[ClipEntry],
) -> Result<(Vec<u8>, usize), CoreError> {
    let encode = |count: usize| -> Result<Vec<u8>, CoreError> {
        let payload = encode_clip_list(&clips[..count])?;
        encode_frame(&WireMessage::Server(ServerMessage::ClipData(ClipData {
            request_id,
            payload,
        })))
    };

    match encode(clips.len()) {
        Err(CoreError::FrameTooLarge { .. }) => {}
        other => return other.map(|frame| (frame, clips.len())),
    }

    // An empty list always fits.
    let mut best = encode(0)?;
    let (mut fits, mut too_large) = (0, clips.len());
    while too_large - fits > 1 {
        let mid = fits + (too_large - fits) / 2;
        match encode(mid) {
            Ok(frame) => {
                best = frame;
                fits = mid;
            }
            Err(CoreError::FrameTooLarge { .. }) => too_large = mid,
            Err(err) => return Err(err),
        }
    }
    Ok((best, fits))
}

fn parse_hello_message(message: &Message) -> Result<Hello, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary hello frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid hello frame: {}", err))?;
    match frame {
        WireMessage::Client(ClientMessage::Hello(hello)) => {
            let name = hello.client_name.trim();
            if name.is_empty() {
                return Err("client_name cannot be empty".to_owned());
            }
            if name.len() > MAX_CLIENT_NAME_LEN {
                return Err(format!(
                    "client_name too long ({} > {} chars)",
                    name.len(),
                    MAX_CLIENT_NAME_LEN
                ));
            }
            Ok(hello)
        }
        _ => Err("first client message must be Hello".to_owned()),
    }
}

async fn register_client(state: &AppState, connection: Connection) -> u64 {
    let mut backend = state.inner.write().await;
    let connection_id = backend.next_connection_id;
    backend.next_connection_id += 1;
    backend.connections.insert(connection_id, connection);
    connection_id
}

async fn unregister_client(state: &AppState, connection_id: u64) {
    let mut backend = state.inner.write().await;
    if let Some(connection) = backend.connections.remove(&connection_id) {
        debug!(connection_id, client = %connection.client_name, "connection removed");
    }
}

fn connected_senders(backend: &BackendState) -> Vec<mpsc::UnboundedSender<Message>> {
    backend
        .connections
        .values()
        .map(|conn| conn.tx.clone())
        .collect()
}

fn send_to(tx: &mpsc::UnboundedSender<Message>, message: ServerMessage) {
    match encode_frame(&WireMessage::Server(message)) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize server message: {}", err),
    }
}

fn broadcast(recipients: Vec<mpsc::UnboundedSender<Message>>, message: ServerMessage) {
    let frame = match encode_frame(&WireMessage::Server(message)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize server message: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}

fn now_unix_ms() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use palclip_core::MAX_CLIP_TEXT_BYTES;

    use super::*;

    #[tokio::test]
    async fn recopy_keeps_secret_flag_and_refreshes_timestamp() {
        let state = AppState::in_memory();
        let first = state.record_clip("token".to_owned()).await.unwrap();
        state
            .apply_signal(
                "test",
                Signal::MarkSecret {
                    hash: first.hash.clone(),
                },
            )
            .await;

        let second = state.record_clip("token".to_owned()).await.unwrap();
        assert_eq!(second.hash, first.hash);
        assert!(second.is_secret);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(state.clip_list().await.len(), 1);
    }

    #[tokio::test]
    async fn clip_list_is_newest_first() {
        let state = AppState::in_memory();
        state.record_clip("one".to_owned()).await.unwrap();
        state.record_clip("two".to_owned()).await.unwrap();
        state.record_clip("three".to_owned()).await.unwrap();

        let contents: Vec<_> = state
            .clip_list()
            .await
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["three", "two", "one"]);
    }

    #[tokio::test]
    async fn oversized_capture_is_rejected() {
        let state = AppState::in_memory();
        let err = state
            .record_clip("x".repeat(MAX_CLIP_TEXT_BYTES + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ClipTooLarge { .. }));
        assert!(state.clip_list().await.is_empty());

        let response = record_clip_handler(
            State(state.clone()),
            Json(RecordClipRequest {
                content: "y".repeat(MAX_CLIP_TEXT_BYTES + 1),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.clip_list().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_over_frame_limit_serves_newest_entries() {
        let state = AppState::in_memory();
        for fill in ['a', 'b', 'c', 'd', 'e', 'f'] {
            state
                .record_clip(fill.to_string().repeat(MAX_CLIP_TEXT_BYTES))
                .await
                .unwrap();
        }
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_message(
            &state,
            "test",
            &tx,
            ClientMessage::GetClipData(GetClipData {
                request_id: 7,
                filter: NO_SERVER_FILTER.to_owned(),
            }),
        )
        .await;

        let Ok(Message::Binary(frame)) = rx.try_recv() else {
            panic!("fetch was not answered");
        };
        let Ok(WireMessage::Server(ServerMessage::ClipData(ClipData {
            request_id,
            payload,
        }))) = decode_frame(&frame)
        else {
            panic!("expected clip data reply");
        };
        assert_eq!(request_id, 7);
        let entries = palclip_core::decode_clip_list(&payload).unwrap();
        assert!(!entries.is_empty());
        assert!(entries.len() < 6);
        assert!(entries[0].content.starts_with('f'));
    }

    #[test]
    fn clip_data_frame_fits_everything_when_small() {
        let clips = vec![ClipEntry::new("one", 1), ClipEntry::new("two", 2)];
        let (frame, served) = clip_data_frame(3, &clips).unwrap();
        assert_eq!(served, 2);
        assert!(frame.len() <= MAX_FRAME_BYTES);
    }

    #[tokio::test]
    async fn window_signals_track_visibility() {
        let state = AppState::in_memory();
        assert!(state.window_visible().await);
        state.apply_signal("test", Signal::WindowHide).await;
        assert!(!state.window_visible().await);
        state.apply_signal("test", Signal::WindowShow).await;
        assert!(state.window_visible().await);
    }

    #[test]
    fn memory_clipboard_keeps_last_write() {
        let clipboard = MemoryClipboard::default();
        assert_eq!(clipboard.last_written(), None);
        clipboard.write_text("a").unwrap();
        clipboard.write_text("b").unwrap();
        assert_eq!(clipboard.last_written().as_deref(), Some("b"));
    }

    #[test]
    fn hello_must_come_first() {
        let frame = encode_frame(&WireMessage::Client(ClientMessage::Signal(
            Signal::WindowShow,
        )))
        .unwrap();
        let err = parse_hello_message(&Message::Binary(frame.into())).unwrap_err();
        assert!(err.contains("Hello"), "unexpected error: {err}");

        let frame = encode_frame(&WireMessage::Client(ClientMessage::Hello(Hello {
            client_name: "  ".to_owned(),
        })))
        .unwrap();
        assert!(parse_hello_message(&Message::Binary(frame.into())).is_err());
    }
}
