//! Persistence contract between the decoder and the payload store.
//!
//! The store itself lives outside this crate; the decoder only needs a way
//! to hand records over and learn whether they were accepted.

use crate::frame::{CanPacket, DecodedPayload};
use crate::spacecraft::SpacecraftId;

/// Where completed payload records go.
///
/// Implementations are shared across every connection worker, so they must
/// be internally synchronized. Returning `false` from either method tells
/// the decoder to stop saving the rest of the frame's slots; slots already
/// saved are not rolled back.
pub trait PayloadSink: Send + Sync {
    /// Persist one decoded telemetry payload, keyed by
    /// (id, resets, uptime, layout type).
    fn add(&self, id: SpacecraftId, uptime: u32, resets: u16, payload: &DecodedPayload) -> bool;

    /// Persist one bus sub-packet. `serial` disambiguates multiple packets
    /// sharing the same (resets, uptime) epoch within one frame.
    fn add_packet(
        &self,
        id: SpacecraftId,
        uptime: u32,
        resets: u16,
        serial: u32,
        packet: &CanPacket,
    ) -> bool;
}
