//! The keepalive engine: application-invoked PING emission with
//! per-connection outstanding-PING accounting. The application decides the
//! timer cadence; calling `ping` repeatedly with no PONG in between is what
//! drives a connection towards the configured threshold.

use std::sync::Arc;

use log::warn;

use crate::error::Error;
use crate::frame::OpCode;
use crate::registry::Slot;
use crate::send;

/// Emits one PING, encoding the post-increment `current_ping_id` as a 4-byte
/// big-endian payload, then force-closes the connection if the gap between
/// `current_ping_id` and `last_pong_id` now exceeds `threshold`.
///
/// The specification's pseudocode holds a single ping-mutex critical section
/// across the send; a `std::sync::Mutex` guard cannot be held across an
/// `.await` point, so this splits it into two short, non-awaiting critical
/// sections bracketing the send instead (see DESIGN.md).
pub(crate) async fn ping_one(slot: &Arc<Slot>, threshold: i64) -> Result<(), Error> {
    let current_ping_id = {
        let mut ping = slot.ping.lock().expect("slot ping mutex poisoned");
        ping.current_ping_id += 1;
        ping.current_ping_id
    };

    let payload = (current_ping_id as u32).to_be_bytes();
    send::write_to_slot(slot, OpCode::Ping, &payload).await?;

    let gap = {
        let ping = slot.ping.lock().expect("slot ping mutex poisoned");
        current_ping_id - ping.last_pong_id
    };

    if gap > threshold {
        warn!(
            "{} exceeded ping threshold ({} unanswered > {}); forcing close",
            slot.handle, gap, threshold
        );
        slot.finalize_close().await;
    }

    Ok(())
}

/// Decodes an incoming PONG payload and, if it is exactly 4 bytes and its
/// value falls in `[0, current_ping_id]`, advances `last_pong_id`. Any other
/// shape is ignored, per RFC 6455's allowance for unsolicited PONGs.
pub(crate) fn record_pong(slot: &Slot, payload: &[u8]) {
    let mut ping = slot.ping.lock().expect("slot ping mutex poisoned");
    if let Some(value) = resolve_pong(ping.current_ping_id, payload) {
        ping.last_pong_id = value;
    }
}

/// Pure decode-and-range-check, factored out so it can be unit tested
/// without standing up a full `Slot`.
fn resolve_pong(current_ping_id: i64, payload: &[u8]) -> Option<i64> {
    let [a, b, c, d] = payload else { return None };
    let value = u32::from_be_bytes([*a, *b, *c, *d]) as i64;
    (value >= 0 && value <= current_ping_id).then_some(value)
}
