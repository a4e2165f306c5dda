//! The send path: single-target frame emission and broadcast fan-out.
//! Both share `write_to_slot`; broadcasting snapshots the OPEN slots for a
//! listen port under the registry lock (see `Registry::broadcast_targets`)
//! and then sends to each independently, so a slow recipient can never
//! block a worker's own send or another recipient's delivery.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::time;

use crate::encoder::encode_header;
use crate::error::Error;
use crate::frame::{MessageType, OpCode};
use crate::registry::{Registry, Slot};

/// Writes one frame to `slot` under its send mutex. Header and payload are
/// written as a single logical operation so no other sender can interleave
/// bytes on the same socket; outbound frames are always FIN and never
/// fragmented. Bounded by the slot's configured send timeout (mirroring
/// SO_SNDTIMEO) when one is set; a timed-out write is treated the same as
/// any other send failure.
pub(crate) async fn write_to_slot(slot: &Slot, opcode: OpCode, payload: &[u8]) -> Result<usize, Error> {
    let mut guard = slot.write.lock().await;
    let Some(writer) = guard.as_mut() else {
        return Err(Error::SendFailed);
    };

    let header = encode_header(opcode, payload.len());
    let total = header.len() + payload.len();

    let write_fut = async {
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        Ok::<(), std::io::Error>(())
    };

    let write_result = match slot.send_timeout {
        Some(duration) => match time::timeout(duration, write_fut).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "send timed out")),
        },
        None => write_fut.await,
    };

    match write_result {
        Ok(()) => Ok(total),
        Err(_) => {
            drop(guard);
            slot.finalize_close().await;
            Err(Error::SendFailed)
        }
    }
}

pub(crate) fn message_opcode(kind: MessageType) -> OpCode {
    match kind {
        MessageType::Text => OpCode::Text,
        MessageType::Binary => OpCode::Binary,
    }
}

/// Sends `payload` under `opcode` to every OPEN connection bound to
/// `listen_port`. Returns the summed byte count across all recipients that
/// accepted the write; a failed recipient does not abort the others.
pub(crate) async fn broadcast(
    registry: &Arc<Registry>,
    listen_port: u16,
    opcode: OpCode,
    payload: &[u8],
) -> usize {
    let targets = registry.broadcast_targets(listen_port);
    let mut total = 0usize;
    for slot in targets {
        if let Ok(n) = write_to_slot(&slot, opcode, payload).await {
            total += n;
        }
    }
    total
}
