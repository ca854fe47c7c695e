//! [`Backend`] over the framed websocket protocol.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use palclip_core::{
    BackendEvent, BackendEventKind, ClientMessage, ClipData, GetClipData, Hello, RequestId,
    ServerMessage, Signal, WireMessage, check_clip_size, decode_frame, encode_frame, log_preview,
};
use tokio::{net::TcpStream, runtime::Handle, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    backend::{Backend, EventHandler, FetchReply, TransportError, subscribe_kind},
    events::{EventBus, Subscription},
};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsBackendConfig {
    pub server_url: String,
    pub client_name: String,
}

struct Shared {
    pending: Mutex<HashMap<RequestId, FetchReply>>,
    events: EventBus<BackendEvent>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the connection finished and fail every outstanding fetch.
    fn close(&self, reason: TransportError) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<FetchReply> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, reply)| reply).collect(),
            Err(_) => Vec::new(),
        };
        for reply in drained {
            reply(Err(reason.clone()));
        }
    }

    fn take_pending(&self, request_id: RequestId) -> Option<FetchReply> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&request_id))
    }
}

/// Websocket client. Calls made before the connection is up are queued and flushed once
/// the handshake completes; the connection task retries the initial connect a few times.
pub struct WsBackend {
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    task: JoinHandle<()>,
}

impl WsBackend {
    pub fn connect(handle: &Handle, config: WsBackendConfig) -> Result<Self, TransportError> {
        Url::parse(&config.server_url)
            .map_err(|err| TransportError::InvalidUrl(format!("{}: {err}", config.server_url)))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            closed: AtomicBool::new(false),
        });

        let task = handle.spawn(run_connection(config, outbound_rx, Arc::clone(&shared)));

        Ok(Self {
            outbound_tx,
            shared,
            next_request_id: AtomicU64::new(1),
            task,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

impl Backend for WsBackend {
    fn get_clip_data(&self, filter: &str, reply: FetchReply) {
        if self.shared.is_closed() {
            reply(Err(TransportError::Closed));
            return;
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        match self.shared.pending.lock() {
            Ok(mut pending) => {
                pending.insert(request_id, reply);
            }
            Err(_) => {
                reply(Err(TransportError::Unavailable(
                    "pending request table poisoned".to_owned(),
                )));
                return;
            }
        }

        let sent = self.send(ClientMessage::GetClipData(GetClipData {
            request_id,
            filter: filter.to_owned(),
        }));

        // The connection may have ended between the insert and the send.
        let failure = match sent {
            Err(err) => Some(err),
            Ok(()) if self.shared.is_closed() => Some(TransportError::Closed),
            Ok(()) => None,
        };
        match failure {
            Some(err) => {
                if let Some(reply) = self.shared.take_pending(request_id) {
                    reply(Err(err));
                }
            }
            None => debug!(request_id, "clip data requested"),
        }
    }

    fn copy_item_content(&self, content: &str) -> Result<(), TransportError> {
        debug!(preview = %log_preview(content), "copy item content");
        check_clip_size(content).map_err(|err| TransportError::Send(err.to_string()))?;
        self.send(ClientMessage::CopyItemContent {
            content: content.to_owned(),
        })
    }

    fn emit(&self, signal: Signal) -> Result<(), TransportError> {
        debug!(?signal, "emit signal");
        self.send(ClientMessage::Signal(signal))
    }

    fn on(
        &self,
        kind: BackendEventKind,
        handler: EventHandler,
    ) -> Result<Subscription, TransportError> {
        Ok(subscribe_kind(&self.shared.events, kind, handler))
    }
}

impl Drop for WsBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection(
    config: WsBackendConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    shared: Arc<Shared>,
) {
    let ws_stream = match connect_with_retry(&config.server_url).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => {
            shared.close(err);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    let hello = ClientMessage::Hello(Hello {
        client_name: config.client_name.clone(),
    });
    let hello_sent = match encode_frame(&WireMessage::Client(hello)) {
        Ok(frame) => write
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    if let Err(err) = hello_sent {
        error!("failed to send hello: {err}");
        shared.close(TransportError::Send(err));
        return;
    }

    info!(server_url = %config.server_url, client_name = %config.client_name, "connected");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let frame = match encode_frame(&WireMessage::Client(message)) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("encode frame failed: {err}");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Binary(frame.into())).await {
                    warn!("send failed: {err}");
                    break;
                }
            }
            inbound = read.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!("read failed: {err}");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Binary(data) => handle_frame(&shared, &data),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = write.close().await;
    info!("disconnected");
    shared.close(TransportError::Closed);
}

async fn connect_with_retry(server_url: &str) -> Result<WsStream, TransportError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            server_url = %server_url,
            "connecting"
        );

        let failure = match timeout(CONNECT_TIMEOUT, connect_async(server_url)).await {
            Ok(Ok((ws_stream, _))) => return Ok(ws_stream),
            Ok(Err(err)) => format!("connect failed: {err}"),
            Err(_) => format!("connect timed out after {:?}", CONNECT_TIMEOUT),
        };

        error!(attempt, server_url = %server_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(TransportError::Unavailable(failure));
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

fn handle_frame(shared: &Shared, data: &[u8]) {
    match decode_frame(data) {
        Ok(WireMessage::Server(ServerMessage::ClipData(ClipData {
            request_id,
            payload,
        }))) => match shared.take_pending(request_id) {
            Some(reply) => reply(Ok(payload)),
            None => debug!(request_id, "reply for unknown request"),
        },
        Ok(WireMessage::Server(ServerMessage::Event(event))) => {
            debug!(?event, "backend event");
            shared.events.publish(&event);
        }
        Ok(WireMessage::Server(ServerMessage::Error {
            request_id,
            message,
        })) => {
            warn!(?request_id, "backend error: {message}");
            if let Some(reply) = request_id.and_then(|id| shared.take_pending(id)) {
                reply(Err(TransportError::Rejected(message)));
            }
        }
        Ok(WireMessage::Client(_)) => warn!("unexpected client frame from backend"),
        Err(err) => warn!("decode frame failed: {err}"),
    }
}
