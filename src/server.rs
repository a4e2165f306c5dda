//! The accept loop and the public API surface: a cheaply-`Clone`able
//! `Server<S>` handle that the application keeps around to `serve()`, to
//! send/broadcast/close/ping from callbacks or from its own tasks, and to
//! query connection state.

use std::any::Any;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection;
use crate::error::Error;
use crate::frame::{MessageType, OpCode};
use crate::keepalive;
use crate::reaper;
use crate::registry::{ConnState, ConnectionHandle, Registry};
use crate::send;

/// An embeddable WebSocket server. Cloning is cheap (it's `Arc` under the
/// hood) and every clone shares the same connection registry, so the
/// application can freely hand copies to callbacks, background tasks, or
/// whatever else needs to address connections.
pub struct Server<S> {
    config: Arc<ServerConfig<S>>,
    registry: Arc<Registry>,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S> Server<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(config: ServerConfig<S>) -> Self {
        let registry = Arc::new(Registry::new(config.max_clients));
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Binds and accepts forever, blocking the calling task. Use this when
    /// the application has a task to dedicate to the server; use
    /// `serve_background` otherwise.
    pub async fn serve(self) -> Result<(), Error> {
        self.accept_loop().await
    }

    /// Spawns the accept loop onto its own task and returns immediately.
    pub fn serve_background(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.accept_loop())
    }

    async fn accept_loop(self) -> Result<(), Error> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(Error::Io)?;
        info!("listening on {}:{}", self.config.host, self.config.port);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!("accept failed: {}", err);
                    continue;
                }
            };

            if let Err(err) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY on {}: {}", peer, err);
            }

            let (read_half, write_half) = stream.into_split();
            let remote_addr = peer.ip().to_string();
            let remote_port = peer.port();

            match self.registry.assign(
                write_half,
                self.config.port,
                remote_addr,
                remote_port,
                self.config.send_timeout,
            ) {
                Some((handle, slot)) => {
                    debug!("{} accepted from {}", handle, peer);
                    let server = self.clone();
                    tokio::spawn(async move {
                        connection::run(server, slot, read_half).await;
                    });
                }
                None => {
                    info!(
                        "registry full ({} slots); rejecting {}",
                        self.registry.capacity(),
                        peer
                    );
                    drop(read_half);
                }
            }
        }
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn max_frame_length(&self) -> usize {
        self.config.websocket.max_frame_length
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.config.websocket.read_buffer_size
    }

    pub(crate) fn dispatch_open(&self, handle: ConnectionHandle) {
        (self.config.on_open)(self.clone(), handle);
    }

    pub(crate) fn dispatch_message(&self, handle: ConnectionHandle, payload: &[u8], kind: MessageType) {
        (self.config.on_message)(self.clone(), handle, payload, kind);
    }

    pub(crate) fn dispatch_close(&self, handle: ConnectionHandle) {
        (self.config.on_close)(self.clone(), handle);
    }

    /// Sends a single frame to `handle`. Returns the number of bytes
    /// written (header + payload), or an error if the handle is unknown,
    /// no longer live, or the write failed (in which case the connection
    /// is aborted and `on_close` will fire, per the send-error policy).
    pub async fn send_frame(
        &self,
        handle: ConnectionHandle,
        kind: MessageType,
        payload: &[u8],
    ) -> Result<usize, Error> {
        let slot = self.registry.get(handle).ok_or(Error::UnknownHandle)?;
        send::write_to_slot(&slot, send::message_opcode(kind), payload).await
    }

    pub async fn send_text(&self, handle: ConnectionHandle, text: &str) -> Result<usize, Error> {
        self.send_frame(handle, MessageType::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&self, handle: ConnectionHandle, data: &[u8]) -> Result<usize, Error> {
        self.send_frame(handle, MessageType::Binary, data).await
    }

    /// Sends `payload` to every OPEN connection on this server's listen
    /// port. A recipient whose write fails is aborted individually; it does
    /// not stop delivery to the rest. Returns the summed byte count across
    /// recipients that accepted the write.
    pub async fn broadcast_frame(&self, kind: MessageType, payload: &[u8]) -> usize {
        send::broadcast(&self.registry, self.config.port, send::message_opcode(kind), payload).await
    }

    pub async fn broadcast_text(&self, text: &str) -> usize {
        self.broadcast_frame(MessageType::Text, text.as_bytes()).await
    }

    pub async fn broadcast_binary(&self, data: &[u8]) -> usize {
        self.broadcast_frame(MessageType::Binary, data).await
    }

    /// Requests that `handle` be closed: sends a CLOSE frame with code 1000
    /// and transitions the connection to CLOSING. This is a request, not a
    /// synchronous operation — teardown and `on_close` happen later, driven
    /// by the peer's CLOSE echo or by the timeout reaper. A no-op if the
    /// connection is not currently OPEN.
    pub async fn close(&self, handle: ConnectionHandle) -> Result<(), Error> {
        let slot = self.registry.get(handle).ok_or(Error::UnknownHandle)?;
        if slot.get_state() != ConnState::Open {
            return Ok(());
        }
        slot.set_state(ConnState::Closing);
        let _ = send::write_to_slot(&slot, OpCode::Close, &connection::close_payload(1000, &[])).await;
        reaper::spawn(slot);
        Ok(())
    }

    pub fn get_state(&self, handle: ConnectionHandle) -> Option<ConnState> {
        self.registry.get(handle).map(|slot| slot.get_state())
    }

    pub fn get_address(&self, handle: ConnectionHandle) -> Option<String> {
        self.registry.get(handle).map(|slot| slot.remote_addr.clone())
    }

    pub fn get_port(&self, handle: ConnectionHandle) -> Option<u16> {
        self.registry.get(handle).map(|slot| slot.remote_port)
    }

    /// Emits one PING to `handle` and force-closes it if more than
    /// `threshold` PINGs are now outstanding unanswered. The caller decides
    /// the interval between calls; that interval is the effective timeout.
    pub async fn ping(&self, handle: ConnectionHandle, threshold: i64) -> Result<(), Error> {
        let slot = self.registry.get(handle).ok_or(Error::UnknownHandle)?;
        keepalive::ping_one(&slot, threshold).await
    }

    /// Pings every OPEN connection on this server's port. Individual
    /// failures (a slot that raced to CLOSED) are swallowed, matching
    /// `broadcast_frame`'s best-effort delivery.
    pub async fn ping_all(&self, threshold: i64) {
        for slot in self.registry.broadcast_targets(self.config.port) {
            let _ = keepalive::ping_one(&slot, threshold).await;
        }
    }

    /// Stores an application-defined per-connection context value,
    /// replacing any previous one. Retrieve it with `get_connection_context`.
    pub fn set_connection_context<C>(&self, handle: ConnectionHandle, context: C) -> Result<(), Error>
    where
        C: Send + Sync + 'static,
    {
        let slot = self.registry.get(handle).ok_or(Error::UnknownHandle)?;
        *slot.context.lock().expect("slot context mutex poisoned") =
            Some(Box::new(context) as Box<dyn Any + Send + Sync>);
        Ok(())
    }

    /// Retrieves the per-connection context previously stored with
    /// `set_connection_context`, cloning it out from behind the slot's lock.
    /// Returns `Err(ContextTypeMismatch)` if one was stored at a different
    /// type, and `Ok(None)` if none was ever set.
    pub fn get_connection_context<C>(&self, handle: ConnectionHandle) -> Result<Option<C>, Error>
    where
        C: Clone + Send + Sync + 'static,
    {
        let slot = self.registry.get(handle).ok_or(Error::UnknownHandle)?;
        let guard = slot.context.lock().expect("slot context mutex poisoned");
        match guard.as_ref() {
            None => Ok(None),
            Some(boxed) => boxed
                .downcast_ref::<C>()
                .cloned()
                .map(Some)
                .ok_or(Error::ContextTypeMismatch),
        }
    }

    /// The opaque, application-supplied server context passed to
    /// `ServerConfigBuilder::new`.
    pub fn get_server_context(&self) -> S {
        self.config.server_context.clone()
    }
}
