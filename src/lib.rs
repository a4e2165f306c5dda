//! An embeddable, multi-tenant server-side implementation of the WebSocket
//! protocol (RFC 6455), built on tokio.
//!
//! A [`Server`](server::Server) binds a port, accepts connections, performs
//! the HTTP Upgrade handshake, and then drives each connection's frame
//! codec, fragment reassembly, UTF-8 validation, and PING/PONG/CLOSE
//! bookkeeping on its own task, dispatching complete messages to
//! application-supplied callbacks. No extension negotiation, no
//! per-message compression, no client role, no TLS termination — those are
//! either out of scope or left to a front proxy.
//!
//! ```no_run
//! use websocket_engine::config::ServerConfigBuilder;
//! use websocket_engine::frame::MessageType;
//! use websocket_engine::server::Server;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), websocket_engine::error::Error> {
//! let config = ServerConfigBuilder::new(9002, ())
//!     .on_open(|_server, handle| log::info!("{} connected", handle))
//!     .on_message(|server, handle, bytes, kind| {
//!         if kind == MessageType::Text {
//!             let server = server.clone();
//!             let text = String::from_utf8_lossy(bytes).into_owned();
//!             tokio::spawn(async move {
//!                 let _ = server.send_text(handle, &text).await;
//!             });
//!         }
//!     })
//!     .build();
//!
//! Server::new(config).serve().await
//! # }
//! ```

mod connection;
pub mod config;
mod decoder;
mod encoder;
pub mod error;
pub mod frame;
mod handshake;
mod keepalive;
mod reaper;
mod registry;
mod send;
pub mod server;
mod utf8;

pub use registry::{ConnState, ConnectionHandle};
