//! Server configuration: bind address, capacity, frame limits, and the
//! three application callbacks. Built via `ServerConfigBuilder` for
//! ergonomic construction, mirroring the builder pattern already implicit
//! in the teacher crate's `ServerConfig`/`WebSocketConfig` split.

use std::sync::Arc;
use std::time::Duration;

use crate::frame::{MessageType, DEFAULT_MAX_FRAME_LENGTH, MESSAGE_LENGTH};
use crate::registry::ConnectionHandle;
use crate::server::Server;

/// Whether `Server::serve` blocks the calling task forever, or the
/// application instead spawns it itself via `serve_background`. Both modes
/// run the identical accept loop; this flag only documents caller intent
/// and does not change behavior (the application is always the one that
/// decides whether to `.await` `serve()` inline or hand it to `tokio::spawn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    Blocking,
    Background,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Caps the summed length of a (possibly fragmented) message.
    pub max_frame_length: usize,
    /// Size of the buffered reader each connection uses to pull bytes off the socket.
    pub read_buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_buffer_size: MESSAGE_LENGTH,
        }
    }
}

pub type OnOpen<S> = Arc<dyn Fn(Server<S>, ConnectionHandle) + Send + Sync>;
pub type OnMessage<S> =
    Arc<dyn Fn(Server<S>, ConnectionHandle, &[u8], MessageType) + Send + Sync>;
pub type OnClose<S> = Arc<dyn Fn(Server<S>, ConnectionHandle) + Send + Sync>;

/// Everything the accept loop and connection workers need: where to listen,
/// how many connections to hold at once, the frame-level limits, and the
/// three event callbacks. `S` is the application's opaque server context,
/// carried by value rather than type-erased (more idiomatic than a raw
/// pointer, and it still satisfies "opaque server context" since the
/// application chooses `S`).
pub struct ServerConfig<S = ()> {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub send_timeout: Option<Duration>,
    pub accept_mode: AcceptMode,
    pub websocket: WebSocketConfig,
    pub(crate) on_open: OnOpen<S>,
    pub(crate) on_message: OnMessage<S>,
    pub(crate) on_close: OnClose<S>,
    pub server_context: S,
}

/// Default capacity of the connection slot table (MAX_CLIENTS).
pub const DEFAULT_MAX_CLIENTS: usize = 8;

pub struct ServerConfigBuilder<S = ()> {
    host: String,
    port: u16,
    max_clients: usize,
    send_timeout: Option<Duration>,
    accept_mode: AcceptMode,
    websocket: WebSocketConfig,
    on_open: OnOpen<S>,
    on_message: OnMessage<S>,
    on_close: OnClose<S>,
    server_context: S,
}

impl<S> ServerConfigBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(port: u16, server_context: S) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            max_clients: DEFAULT_MAX_CLIENTS,
            send_timeout: None,
            accept_mode: AcceptMode::Background,
            websocket: WebSocketConfig::default(),
            on_open: Arc::new(|_, _| {}),
            on_message: Arc::new(|_, _, _, _| {}),
            on_close: Arc::new(|_, _| {}),
            server_context,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn accept_mode(mut self, mode: AcceptMode) -> Self {
        self.accept_mode = mode;
        self
    }

    pub fn websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(Server<S>, ConnectionHandle) + Send + Sync + 'static,
    {
        self.on_open = Arc::new(f);
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Server<S>, ConnectionHandle, &[u8], MessageType) + Send + Sync + 'static,
    {
        self.on_message = Arc::new(f);
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(Server<S>, ConnectionHandle) + Send + Sync + 'static,
    {
        self.on_close = Arc::new(f);
        self
    }

    pub fn build(self) -> ServerConfig<S> {
        ServerConfig {
            host: self.host,
            port: self.port,
            max_clients: self.max_clients,
            send_timeout: self.send_timeout,
            accept_mode: self.accept_mode,
            websocket: self.websocket,
            on_open: self.on_open,
            on_message: self.on_message,
            on_close: self.on_close,
            server_context: self.server_context,
        }
    }
}
