//! Amateur-radio smallsat telemetry decoding and relay.
//!
//! The pieces fit together like this: a [`server::ConnectionServer`] accepts
//! TCP connections from ground-station producers and hands each one to a
//! worker that owns a [`frame::FrameDecoder`]. The decoder assembles the byte
//! stream into frames using the per-spacecraft bit layouts held by a
//! [`spacecraft::SpacecraftRegistry`], persists decoded payloads through the
//! [`sink::PayloadSink`] contract, and hands frames from relay-flagged
//! spacecraft to the durable [`queue::ForwardingQueue`] for delivery to
//! downstream servers.

mod error;

pub mod frame;
pub mod layout;
pub mod queue;
pub mod server;
pub mod sink;
pub mod spacecraft;

pub use error::{Error, Result};
