//! End-to-end tests: each test binds a real `Server` on an OS-assigned
//! port, drives it with a bare `TcpStream` that performs its own HTTP
//! Upgrade handshake and hand-assembles masked client frames, and asserts
//! on events recorded by the callbacks.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use websocket_engine::config::ServerConfigBuilder;
use websocket_engine::frame::MessageType;
use websocket_engine::server::Server;
use websocket_engine::ConnectionHandle;

#[derive(Debug)]
enum Event {
    Open(ConnectionHandle),
    Message(ConnectionHandle, Vec<u8>, MessageType),
    Close(ConnectionHandle),
}

/// Binds an ephemeral listener just to learn a free port, then drops it.
/// Racy in the abstract, fine for a test running on localhost.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Spawns an echoing server plus a recorder that every callback forwards
/// events into. Returns the port and the event receiver.
async fn spawn_echo_server() -> (u16, mpsc::UnboundedReceiver<Event>) {
    let port = free_port().await;
    let (tx, rx) = mpsc::unbounded_channel();

    let tx_open = tx.clone();
    let tx_message = tx.clone();
    let tx_close = tx;

    let config = ServerConfigBuilder::new(port, ())
        .host("127.0.0.1")
        .on_open(move |_server, handle| {
            let _ = tx_open.send(Event::Open(handle));
        })
        .on_message(move |server, handle, bytes, kind| {
            let _ = tx_message.send(Event::Message(handle, bytes.to_vec(), kind));
            let server = server.clone();
            let payload = bytes.to_vec();
            tokio::spawn(async move {
                let _ = server.send_frame(handle, kind, &payload).await;
            });
        })
        .on_close(move |_server, handle| {
            let _ = tx_close.send(Event::Close(handle));
        })
        .build();

    Server::new(config).serve_background();
    wait_for_listener(port).await;

    (port, rx)
}

/// The accept loop binds asynchronously; give it a moment to come up
/// before the test's client tries to connect.
async fn wait_for_listener(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server never came up on port {port}");
}

/// Performs the client side of the handshake: sends the Upgrade request
/// and reads until the blank line terminating the 101 response.
async fn handshake(stream: &mut TcpStream) {
    let request = "GET / HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 101"), "unexpected response: {text}");
}

/// Masks and writes one client frame. Always sent as a single, final
/// fragment; tests that need fragmentation call this per fragment with
/// `fin` set accordingly.
async fn send_client_frame(stream: &mut TcpStream, fin: bool, opcode: u8, payload: &[u8]) {
    let mut header = Vec::new();
    header.push((if fin { 0x80 } else { 0x00 }) | opcode);

    let mask_bit = 0x80u8;
    let len = payload.len();
    if len < 126 {
        header.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let mask = [0x12u8, 0x34, 0x56, 0x78];
    header.extend_from_slice(&mask);

    let mut masked = payload.to_vec();
    for (i, byte) in masked.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    stream.write_all(&header).await.unwrap();
    stream.write_all(&masked).await.unwrap();
}

struct ServerFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Reads one unmasked server frame, or `None` on a clean EOF.
async fn read_server_frame(stream: &mut TcpStream) -> Option<ServerFrame> {
    let mut header = [0u8; 2];
    if stream.read_exact(&mut header).await.is_err() {
        return None;
    }
    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0, "server frames must never be masked");
    let mut len = (header[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.unwrap();
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.unwrap();
        len = u64::from_be_bytes(ext);
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    Some(ServerFrame { fin, opcode, payload })
}

const OP_CONT: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

#[tokio::test]
async fn echoes_a_single_text_frame() {
    let (port, mut events) = spawn_echo_server().await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
        Event::Open(_) => {}
        other => panic!("expected Open, got {other:?}"),
    }

    send_client_frame(&mut client, true, OP_TEXT, b"hello").await;

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
        Event::Message(_, payload, MessageType::Text) => assert_eq!(payload, b"hello"),
        other => panic!("expected Message, got {other:?}"),
    }

    let reply = read_server_frame(&mut client).await.expect("echo reply");
    assert!(reply.fin);
    assert_eq!(reply.opcode, OP_TEXT);
    assert_eq!(reply.payload, b"hello");
}

#[tokio::test]
async fn reassembles_a_fragmented_binary_message() {
    let (port, mut events) = spawn_echo_server().await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    assert!(matches!(events.recv().await.unwrap(), Event::Open(_)));

    send_client_frame(&mut client, false, OP_BINARY, &[1, 2, 3]).await;
    send_client_frame(&mut client, false, OP_CONT, &[4, 5]).await;
    send_client_frame(&mut client, true, OP_CONT, &[6]).await;

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
        Event::Message(_, payload, MessageType::Binary) => {
            assert_eq!(payload, vec![1, 2, 3, 4, 5, 6]);
        }
        other => panic!("expected Message, got {other:?}"),
    }

    let reply = read_server_frame(&mut client).await.expect("echo reply");
    assert_eq!(reply.opcode, OP_BINARY);
    assert_eq!(reply.payload, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn oversized_message_aborts_without_delivering_it() {
    let port = free_port().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let tx_open = tx.clone();
    let tx_message = tx.clone();
    let tx_close = tx;

    let config = ServerConfigBuilder::new(port, ())
        .host("127.0.0.1")
        .websocket_config(websocket_engine::config::WebSocketConfig {
            max_frame_length: 4,
            read_buffer_size: 2048,
        })
        .on_open(move |_s, h| {
            let _ = tx_open.send(Event::Open(h));
        })
        .on_message(move |_s, h, bytes, kind| {
            let _ = tx_message.send(Event::Message(h, bytes.to_vec(), kind));
        })
        .on_close(move |_s, h| {
            let _ = tx_close.send(Event::Close(h));
        })
        .build();
    Server::new(config).serve_background();
    wait_for_listener(port).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    assert!(matches!(events.recv().await.unwrap(), Event::Open(_)));

    send_client_frame(&mut client, true, OP_TEXT, b"this is too long").await;

    // The connection is aborted with no CLOSE frame (FrameTooLarge maps to
    // no close code) and no Message event, but on_close still fires.
    assert!(read_server_frame(&mut client).await.is_none());
    let next = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(matches!(next, Event::Close(_)), "expected Close, got {next:?}");
}

#[tokio::test]
async fn close_handshake_is_echoed() {
    let (port, mut events) = spawn_echo_server().await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    assert!(matches!(events.recv().await.unwrap(), Event::Open(_)));

    send_client_frame(&mut client, true, OP_CLOSE, &1000u16.to_be_bytes()).await;

    let reply = read_server_frame(&mut client).await.expect("close echo");
    assert_eq!(reply.opcode, OP_CLOSE);
    assert_eq!(&reply.payload[..2], &1000u16.to_be_bytes());

    let next = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(matches!(next, Event::Close(_)), "expected Close, got {next:?}");
}

#[tokio::test]
async fn invalid_utf8_text_is_rejected_with_1007() {
    let (port, mut events) = spawn_echo_server().await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    assert!(matches!(events.recv().await.unwrap(), Event::Open(_)));

    // 0xC3 0x28 is an invalid two-byte sequence (bad continuation byte).
    send_client_frame(&mut client, true, OP_TEXT, &[0xC3, 0x28]).await;

    let reply = read_server_frame(&mut client).await.expect("close frame");
    assert_eq!(reply.opcode, OP_CLOSE);
    assert_eq!(u16::from_be_bytes([reply.payload[0], reply.payload[1]]), 1007);

    let next = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(matches!(next, Event::Close(_)), "expected Close, got {next:?}");
}

#[tokio::test]
async fn ping_all_force_closes_after_threshold_exceeded() {
    let port = free_port().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let tx_open = tx.clone();
    let tx_close = tx;

    let config = ServerConfigBuilder::new(port, ())
        .host("127.0.0.1")
        .on_open(move |_s, h| {
            let _ = tx_open.send(Event::Open(h));
        })
        .on_close(move |_s, h| {
            let _ = tx_close.send(Event::Close(h));
        })
        .build();
    let server = Server::new(config);
    server.clone().serve_background();
    wait_for_listener(port).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    let handle = match events.recv().await.unwrap() {
        Event::Open(handle) => handle,
        other => panic!("expected Open, got {other:?}"),
    };

    // The client never answers the PING, so the very first call already
    // has one PING outstanding against zero PONGs received; with
    // threshold 0 that immediately exceeds it and force-closes the slot.
    let _ = server.ping(handle, 0).await;

    let reply = read_server_frame(&mut client).await;
    // The PING itself may or may not surface as a readable frame before
    // the force close tears the socket down, depending on scheduling;
    // either way the worker must observe the closed state and dispatch
    // on_close promptly.
    if let Some(frame) = reply {
        assert_eq!(frame.opcode, OP_PING);
    }

    let next = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(matches!(next, Event::Close(_)), "expected Close, got {next:?}");
}

#[tokio::test]
async fn pong_echoes_ping() {
    let (port, mut events) = spawn_echo_server().await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    handshake(&mut client).await;
    assert!(matches!(events.recv().await.unwrap(), Event::Open(_)));

    send_client_frame(&mut client, true, OP_PING, b"ping-payload").await;

    let reply = read_server_frame(&mut client).await.expect("pong reply");
    assert_eq!(reply.opcode, OP_PONG);
    assert_eq!(reply.payload, b"ping-payload");
}
