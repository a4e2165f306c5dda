//! The connection worker: one task per live connection, driving handshake,
//! the frame-read loop, control-frame handling and `on_message` dispatch,
//! through to a graceful or forced close.

use std::sync::Arc;

use log::{debug, warn};
use tokio::net::tcp::OwnedReadHalf;

use crate::decoder::{DecodedItem, FrameDecoder};
use crate::frame::OpCode;
use crate::handshake;
use crate::keepalive;
use crate::reaper;
use crate::registry::{ConnState, Slot};
use crate::send;
use crate::server::Server;

/// Builds a CLOSE frame payload: a 2-byte big-endian code followed by an
/// optional UTF-8 reason.
pub(crate) fn close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

/// Drives one connection from its CONNECTING slot through to release.
/// `read_half` is not stored in the slot (only the write half is, so the
/// send path and this worker never contend over reads); it is dropped when
/// this function returns, at which point both halves of the split socket
/// are gone and the underlying file descriptor is released.
pub(crate) async fn run<S>(server: Server<S>, slot: Arc<Slot>, mut read_half: OwnedReadHalf)
where
    S: Clone + Send + Sync + 'static,
{
    let handle = slot.handle;

    let leftover = {
        let mut write_guard = slot.write.lock().await;
        let Some(write_half) = write_guard.as_mut() else {
            // The slot was torn down (e.g. registry full races) before the
            // worker even started; nothing to do.
            return;
        };
        match handshake::perform(&mut read_half, write_half).await {
            Ok(outcome) => outcome.leftover,
            Err(err) => {
                warn!("{} handshake failed: {}", handle, err);
                drop(write_guard);
                server.registry().release(handle);
                return;
            }
        }
    };

    slot.set_state(ConnState::Open);
    debug!("{} handshake complete, dispatching on_open", handle);
    server.dispatch_open(handle);

    read_loop(&server, &slot, read_half, leftover).await;

    debug!("{} dispatching on_close", handle);
    server.dispatch_close(handle);

    reaper::join_if_spawned(&slot).await;
    slot.finalize_close().await;
    server.registry().release(handle);
}

async fn read_loop<S>(
    server: &Server<S>,
    slot: &Arc<Slot>,
    read_half: OwnedReadHalf,
    leftover: Vec<u8>,
) where
    S: Clone + Send + Sync + 'static,
{
    let mut decoder = FrameDecoder::new(read_half, leftover, server.read_buffer_size());
    let max_frame_len = server.max_frame_length();

    loop {
        if slot.get_state() == ConnState::Closed {
            // Forced closed out-of-band (ping threshold, reaper timeout)
            // since the last time round this loop.
            break;
        }

        let item = tokio::select! {
            _ = slot.state_changed.notified() => {
                if slot.get_state() == ConnState::Closed {
                    break;
                }
                continue;
            }
            item = decoder.read_item(max_frame_len) => item,
        };

        let already_closing = slot.get_state() == ConnState::Closing;

        match item {
            Ok(DecodedItem::Message { kind, payload }) => {
                if already_closing {
                    warn!("{} sent a data frame while closing; aborting", slot.handle);
                    break;
                }
                server.dispatch_message(slot.handle, &payload, kind);
            }
            Ok(DecodedItem::Ping { payload }) => {
                if already_closing {
                    break;
                }
                let _ = send::write_to_slot(slot, OpCode::Pong, &payload).await;
            }
            Ok(DecodedItem::Pong { payload }) => {
                keepalive::record_pong(slot, &payload);
            }
            Ok(DecodedItem::Close { code, reason }) => {
                if !already_closing {
                    slot.set_state(ConnState::Closing);
                    let resp_code = code.unwrap_or(1002);
                    let _ =
                        send::write_to_slot(slot, OpCode::Close, &close_payload(resp_code, &reason))
                            .await;
                }
                break;
            }
            Err(err) => {
                if !already_closing {
                    if let Some(code) = err.close_code() {
                        let _ = send::write_to_slot(slot, OpCode::Close, &close_payload(code, &[]))
                            .await;
                    }
                }
                warn!("{} aborting after read error: {}", slot.handle, err);
                break;
            }
        }
    }
}
