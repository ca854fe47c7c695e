use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use palclip_backend::{AppState, MemoryClipboard, serve};
use palclip_core::{
    BackendEvent, ClientMessage, ClipData, ClipEntry, GetClipData, Hello, MAX_CLIP_TEXT_BYTES,
    MAX_FRAME_BYTES, NO_SERVER_FILTER, ServerMessage, Signal, WireMessage, decode_clip_list, decode_frame,
    encode_frame,
};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    write: WsWrite,
    read: WsRead,
}

struct TestBackend {
    address: String,
    state: AppState,
    server: JoinHandle<Result<(), String>>,
}

#[tokio::test]
async fn clip_data_is_served_newest_first() {
    let backend = start_backend(AppState::in_memory()).await;
    backend.state.record_clip("first".to_owned()).await.unwrap();
    backend.state.record_clip("second".to_owned()).await.unwrap();

    let mut client = connect_client(&backend.address, "reader").await;
    let entries = fetch_clips(&mut client, 1).await;
    let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["second", "first"]);

    backend.state.request_shutdown();
}

#[tokio::test]
async fn recorded_clip_notifies_every_client() {
    let backend = start_backend(AppState::in_memory()).await;
    let mut client_a = connect_client(&backend.address, "a").await;
    let mut client_b = connect_client(&backend.address, "b").await;
    wait_for_connections(&backend.state, 2).await;

    backend.state.record_clip("hello".to_owned()).await.unwrap();

    for client in [&mut client_a, &mut client_b] {
        let event = recv_event(client, Duration::from_secs(2)).await;
        assert_eq!(event, Some(BackendEvent::ItemCopied));
    }

    backend.state.request_shutdown();
}

#[tokio::test]
async fn hotkey_is_broadcast() {
    let backend = start_backend(AppState::in_memory()).await;
    let mut client = connect_client(&backend.address, "hotkey").await;
    wait_for_connections(&backend.state, 1).await;

    backend.state.press_hotkey().await;

    let event = recv_event(&mut client, Duration::from_secs(2)).await;
    assert_eq!(event, Some(BackendEvent::GlobalHotkeyPressed));

    backend.state.request_shutdown();
}

#[tokio::test]
async fn mark_secret_flags_entry_by_hash() {
    let backend = start_backend(AppState::in_memory()).await;
    let plain = backend.state.record_clip("same text".to_owned()).await.unwrap();
    let target = backend.state.record_clip("hunter2pass".to_owned()).await.unwrap();

    let mut client = connect_client(&backend.address, "secret").await;
    send(
        &mut client,
        ClientMessage::Signal(Signal::MarkSecret {
            hash: target.hash.clone(),
        }),
    )
    .await;

    let entries = fetch_clips(&mut client, 7).await;
    let secret = entries.iter().find(|e| e.hash == target.hash).unwrap();
    let other = entries.iter().find(|e| e.hash == plain.hash).unwrap();
    assert!(secret.is_secret);
    assert!(!other.is_secret);

    backend.state.request_shutdown();
}

#[tokio::test]
async fn menu_clear_empties_history() {
    let backend = start_backend(AppState::in_memory()).await;
    backend.state.record_clip("one".to_owned()).await.unwrap();
    backend.state.record_clip("two".to_owned()).await.unwrap();

    let mut client = connect_client(&backend.address, "clear").await;
    send(&mut client, ClientMessage::Signal(Signal::MenuClear(true))).await;

    assert!(fetch_clips(&mut client, 2).await.is_empty());

    backend.state.request_shutdown();
}

#[tokio::test]
async fn copy_item_content_reaches_clipboard_writer() {
    let clipboard = Arc::new(MemoryClipboard::default());
    let backend = start_backend(AppState::new(clipboard.clone())).await;

    let mut client = connect_client(&backend.address, "copier").await;
    send(
        &mut client,
        ClientMessage::CopyItemContent {
            content: "paste me".to_owned(),
        },
    )
    .await;
    // Messages on one socket are handled in order, so the fetch reply means the copy is done.
    let _ = fetch_clips(&mut client, 3).await;

    assert_eq!(clipboard.last_written().as_deref(), Some("paste me"));

    backend.state.request_shutdown();
}

#[tokio::test]
async fn window_signals_update_visibility() {
    let backend = start_backend(AppState::in_memory()).await;
    let mut client = connect_client(&backend.address, "window").await;

    send(&mut client, ClientMessage::Signal(Signal::WindowHide)).await;
    let _ = fetch_clips(&mut client, 4).await;
    assert!(!backend.state.window_visible().await);

    send(&mut client, ClientMessage::Signal(Signal::WindowShow)).await;
    let _ = fetch_clips(&mut client, 5).await;
    assert!(backend.state.window_visible().await);

    backend.state.request_shutdown();
}

#[tokio::test]
async fn invalid_first_frame_is_rejected() {
    let backend = start_backend(AppState::in_memory()).await;

    let (ws_stream, _) = connect_async(&backend.address)
        .await
        .expect("connect websocket");
    let (mut write, mut read) = ws_stream.split();

    let frame = encode_frame(&WireMessage::Client(ClientMessage::GetClipData(
        GetClipData {
            request_id: 1,
            filter: NO_SERVER_FILTER.to_owned(),
        },
    )))
    .expect("encode request");
    write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send invalid first frame");

    let closed = timeout(Duration::from_secs(2), read.next())
        .await
        .expect("server should close websocket quickly");
    assert!(
        closed.is_none()
            || matches!(closed, Some(Ok(Message::Close(_))))
            || matches!(closed, Some(Err(_))),
        "expected websocket termination after invalid first frame"
    );

    backend.state.request_shutdown();
}

#[tokio::test]
async fn malformed_and_oversized_frames_are_dropped() {
    let backend = start_backend(AppState::in_memory()).await;
    backend.state.record_clip("survivor".to_owned()).await.unwrap();

    let mut client = connect_client(&backend.address, "noisy").await;
    client
        .write
        .send(Message::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");
    client
        .write
        .send(Message::Binary(vec![0_u8; MAX_FRAME_BYTES + 1].into()))
        .await
        .expect("send oversized frame");

    let entries = fetch_clips(&mut client, 9).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content, "survivor");

    backend.state.request_shutdown();
}

#[tokio::test]
async fn history_over_frame_limit_is_still_served() {
    let backend = start_backend(AppState::in_memory()).await;
    for fill in ['a', 'b', 'c', 'd', 'e'] {
        backend
            .state
            .record_clip(fill.to_string().repeat(MAX_CLIP_TEXT_BYTES))
            .await
            .unwrap();
    }
    assert!(
        backend
            .state
            .record_clip("z".repeat(MAX_CLIP_TEXT_BYTES + 1))
            .await
            .is_err()
    );

    let mut client = connect_client(&backend.address, "big").await;
    let entries = fetch_clips(&mut client, 11).await;
    assert!(!entries.is_empty() && entries.len() < 5);
    assert!(entries[0].content.starts_with('e'));

    // Later captures keep showing up at the top.
    backend.state.record_clip("small".to_owned()).await.unwrap();
    let entries = fetch_clips(&mut client, 12).await;
    assert_eq!(entries[0].content, "small");

    backend.state.request_shutdown();
}

#[tokio::test]
async fn menu_quit_stops_the_server() {
    let backend = start_backend(AppState::in_memory()).await;
    let mut client = connect_client(&backend.address, "quitter").await;

    send(&mut client, ClientMessage::Signal(Signal::MenuQuit(true))).await;

    let result = timeout(Duration::from_secs(3), backend.server)
        .await
        .expect("server should stop after menu-quit")
        .expect("server task should not panic");
    assert!(result.is_ok());
}

async fn start_backend(state: AppState) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral backend socket");
    let address = listener.local_addr().expect("backend local addr");

    let server = tokio::spawn(serve(listener, state.clone()));

    TestBackend {
        address: format!("ws://{}/ws", address),
        state,
        server,
    }
}

async fn connect_client(ws_url: &str, client_name: &str) -> TestClient {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    let mut client = TestClient { write, read };

    send(
        &mut client,
        ClientMessage::Hello(Hello {
            client_name: client_name.to_owned(),
        }),
    )
    .await;
    client
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.connection_count().await < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "clients did not register in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send(client: &mut TestClient, message: ClientMessage) {
    let frame = encode_frame(&WireMessage::Client(message)).expect("encode client message");
    client
        .write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send frame");
}

async fn fetch_clips(client: &mut TestClient, request_id: u64) -> Vec<ClipEntry> {
    send(
        client,
        ClientMessage::GetClipData(GetClipData {
            request_id,
            filter: NO_SERVER_FILTER.to_owned(),
        }),
    )
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("clip data reply timed out");
        match recv_server_message(client, remaining).await {
            Some(ServerMessage::ClipData(ClipData {
                request_id: got,
                payload,
            })) if got == request_id => {
                return decode_clip_list(&payload).expect("decode clip list");
            }
            Some(_) => continue,
            None => panic!("connection ended before clip data reply"),
        }
    }
}

async fn recv_event(client: &mut TestClient, wait: Duration) -> Option<BackendEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_server_message(client, remaining).await {
            Some(ServerMessage::Event(event)) => return Some(event),
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn recv_server_message(client: &mut TestClient, wait: Duration) -> Option<ServerMessage> {
    let next = timeout(wait, client.read.next()).await.ok()?;
    let ws_result = next?;
    let message = ws_result.ok()?;

    match message {
        Message::Binary(bytes) => match decode_frame(&bytes).ok()? {
            WireMessage::Server(server) => Some(server),
            WireMessage::Client(_) => None,
        },
        _ => None,
    }
}
