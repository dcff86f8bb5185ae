//! Downlink frame protocol.
//!
//! Every frame on the wire is the same length: an 8-byte header, a 468-byte
//! payload region, and a 96-byte reserved trailer the ground segment ignores.
//! The header's frame-type code selects, from a fixed table, how the payload
//! region splits into slots and which layout each slot is unpacked with.

mod bits;
mod can;
mod decoder;

pub use can::*;
pub use decoder::*;

use serde::{Deserialize, Serialize};

use crate::spacecraft::{
    Family, SpacecraftId, MAX_LAYOUT, MIN_LAYOUT, RAD_LAYOUT, REAL_TIME_LAYOUT, WOD_LAYOUT,
    WOD_RAD_LAYOUT,
};

/// Fixed payload slot size in bytes.
pub const SLOT_LEN: usize = 78;
/// Number of slots in a fixed-slot frame.
pub const SLOTS_PER_FRAME: usize = 6;
/// Payload region size in bytes.
pub const PAYLOAD_LEN: usize = SLOT_LEN * SLOTS_PER_FRAME;
/// Reserved trailer size in bytes.
pub const TRAILER_LEN: usize = 96;
/// Total wire length of one frame.
pub const FRAME_LEN: usize = FrameHeader::LEN + PAYLOAD_LEN + TRAILER_LEN;

/// Frame header fields.
///
/// The header is byte-oriented and little-endian regardless of the owning
/// spacecraft's payload endianness flags, since the id must be readable
/// before any descriptor is resolved.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct FrameHeader {
    pub id: SpacecraftId,
    /// Count of IHU resets, the coarse half of the epoch pair.
    pub resets: u16,
    /// Seconds since the last reset, the fine half of the epoch pair.
    pub uptime: u32,
    /// Frame-type code, 0 through 10.
    pub frame_type: u8,
}

impl FrameHeader {
    /// Header length in bytes.
    pub const LEN: usize = 8;

    /// Construct from the provided bytes, or `None` if there are not enough.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        Some(FrameHeader {
            id: dat[0],
            resets: u16::from_le_bytes([dat[1], dat[2]]),
            uptime: u32::from_le_bytes([dat[3], dat[4], dat[5], dat[6]]),
            frame_type: dat[7],
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.id;
        out[1..3].copy_from_slice(&self.resets.to_le_bytes());
        out[3..7].copy_from_slice(&self.uptime.to_le_bytes());
        out[7] = self.frame_type;
        out
    }
}

/// The closed set of frame kinds the IHU transmits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    AllWod = 0,
    Health = 1,
    MinMax = 2,
    HealthBeacon = 3,
    WodBeacon = 4,
    SciencePackets = 5,
    CameraPackets = 6,
    ExperimentWod = 7,
    ExperimentBeacon = 8,
    HealthMinMaxExperiment = 9,
    HealthExperiment = 10,
}

impl FrameType {
    /// Number of frame kinds.
    pub const COUNT: usize = 11;

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        use FrameType as F;
        Some(match code {
            0 => F::AllWod,
            1 => F::Health,
            2 => F::MinMax,
            3 => F::HealthBeacon,
            4 => F::WodBeacon,
            5 => F::SciencePackets,
            6 => F::CameraPackets,
            7 => F::ExperimentWod,
            8 => F::ExperimentBeacon,
            9 => F::HealthMinMaxExperiment,
            10 => F::HealthExperiment,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Frame types whose single slot absorbs the whole payload region as a
    /// run of self-delimiting bus packets.
    #[must_use]
    pub fn is_packet_frame(self) -> bool {
        matches!(self, FrameType::SciencePackets | FrameType::CameraPackets)
    }

    /// The ordered slot kinds for this frame type.
    #[must_use]
    pub fn slots(self) -> &'static [SlotKind] {
        use SlotKind as S;
        match self {
            FrameType::AllWod => &[
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
                S::Wod,
            ],
            FrameType::Health => &[
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
                S::Wod,
                S::Realtime,
                S::Experiment,
            ],
            FrameType::MinMax => &[
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
                S::Wod,
                S::Maximum,
                S::Minimum,
            ],
            FrameType::HealthBeacon => {
                &[S::Realtime, S::Wod, S::Wod, S::Wod, S::Wod, S::Wod]
            }
            FrameType::WodBeacon => &[S::Wod; 6],
            FrameType::SciencePackets | FrameType::CameraPackets => &[S::Experiment],
            FrameType::ExperimentWod => &[
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
                S::Wod,
                S::Experiment,
                S::Experiment,
            ],
            FrameType::ExperimentBeacon => &[
                S::WodExperiment,
                S::Wod,
                S::Wod,
                S::Experiment,
                S::Experiment,
                S::Experiment,
            ],
            FrameType::HealthMinMaxExperiment => &[
                S::Realtime,
                S::Minimum,
                S::Maximum,
                S::WodExperiment,
                S::Wod,
                S::WodExperiment,
            ],
            FrameType::HealthExperiment => &[
                S::Realtime,
                S::Experiment,
                S::Experiment,
                S::Experiment,
                S::Wod,
                S::WodExperiment,
            ],
        }
    }
}

/// The payload kind a slot carries, before binding to a concrete layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Housekeeping real-time values.
    Realtime,
    /// Housekeeping minimum values.
    Minimum,
    /// Housekeeping maximum values.
    Maximum,
    /// Whole-orbit-data historical samples.
    Wod,
    /// Experiment data: radiation counters, or bus packets for
    /// `Family::BusExperiment` craft.
    Experiment,
    /// Whole-orbit experiment data.
    WodExperiment,
}

impl SlotKind {
    /// Name of the layout this slot binds to.
    #[must_use]
    pub fn layout_name(self) -> &'static str {
        match self {
            SlotKind::Realtime => REAL_TIME_LAYOUT,
            SlotKind::Minimum => MIN_LAYOUT,
            SlotKind::Maximum => MAX_LAYOUT,
            SlotKind::Wod => WOD_LAYOUT,
            SlotKind::Experiment => RAD_LAYOUT,
            SlotKind::WodExperiment => WOD_RAD_LAYOUT,
        }
    }

    /// Whether this slot holds bus sub-packets on the given family.
    #[must_use]
    pub fn is_bus_slot(self, family: Family) -> bool {
        family == Family::BusExperiment
            && matches!(self, SlotKind::Experiment | SlotKind::WodExperiment)
    }
}
