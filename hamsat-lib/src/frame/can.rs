//! Self-delimiting bus sub-packets carried in experiment slots.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One CAN bus packet recovered from an experiment slot.
///
/// On the wire each packet is a 4-byte big-endian bus id, a 1-byte data
/// length, and up to [`CanPacket::MAX_DATA`] data bytes. An all-zero header
/// terminates the run; the rest of the slot is padding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanPacket {
    pub bus_id: u32,
    pub data: Vec<u8>,
}

impl CanPacket {
    /// Bus id + length prefix size in bytes.
    pub const HEADER_LEN: usize = 5;
    /// Maximum data bytes one packet can carry.
    pub const MAX_DATA: usize = 8;

    /// Wire length of this packet.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    /// Serialize back to the relay wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.bus_id.to_be_bytes());
        out.push(self.data.len() as u8);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse every packet packed into `dat`.
    ///
    /// Parsing stops at the zero terminator, at the end of the buffer, or at
    /// the first malformed header; packets before the damage are kept.
    #[must_use]
    pub fn parse_all(dat: &[u8]) -> Vec<CanPacket> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset + Self::HEADER_LEN <= dat.len() {
            let bus_id = u32::from_be_bytes([
                dat[offset],
                dat[offset + 1],
                dat[offset + 2],
                dat[offset + 3],
            ]);
            let len = dat[offset + 4] as usize;
            if bus_id == 0 && len == 0 {
                break;
            }
            if len > Self::MAX_DATA {
                warn!(offset, len, "bad bus packet length, dropping rest of slot");
                break;
            }
            let start = offset + Self::HEADER_LEN;
            if start + len > dat.len() {
                warn!(offset, len, "truncated bus packet, dropping rest of slot");
                break;
            }
            packets.push(CanPacket {
                bus_id,
                data: dat[start..start + len].to_vec(),
            });
            offset = start + len;
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(packets: &[CanPacket], pad_to: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for p in packets {
            out.extend_from_slice(&p.to_bytes());
        }
        out.resize(pad_to, 0);
        out
    }

    #[test]
    fn parse_two_packets_then_terminator() {
        let a = CanPacket {
            bus_id: 0x1234,
            data: vec![1, 2, 3],
        };
        let b = CanPacket {
            bus_id: 0x0899_aabb,
            data: vec![9; 8],
        };
        let dat = packed(&[a.clone(), b.clone()], 78);
        let packets = CanPacket::parse_all(&dat);
        assert_eq!(packets, vec![a, b]);
    }

    #[test]
    fn empty_slot_parses_to_nothing() {
        assert!(CanPacket::parse_all(&[0u8; 78]).is_empty());
    }

    #[test]
    fn zero_length_packet_is_kept() {
        // nonzero id with no data bytes is a valid packet
        let p = CanPacket {
            bus_id: 7,
            data: vec![],
        };
        let dat = packed(&[p.clone()], 20);
        assert_eq!(CanPacket::parse_all(&dat), vec![p]);
    }

    #[test]
    fn bad_length_drops_rest() {
        let good = CanPacket {
            bus_id: 5,
            data: vec![0xaa],
        };
        let mut dat = good.to_bytes();
        dat.extend_from_slice(&[0, 0, 0, 1, 200]); // length 200 is impossible
        dat.extend_from_slice(&[0xff; 30]);
        assert_eq!(CanPacket::parse_all(&dat), vec![good]);
    }

    #[test]
    fn truncated_packet_dropped() {
        let mut dat = vec![0, 0, 0, 1, 6]; // claims 6 data bytes
        dat.extend_from_slice(&[1, 2]); // only 2 present
        assert!(CanPacket::parse_all(&dat).is_empty());
    }

    #[test]
    fn round_trip_bytes() {
        let p = CanPacket {
            bus_id: 0x1fff_ffff,
            data: vec![1, 2, 3, 4],
        };
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), p.encoded_len());
        assert_eq!(CanPacket::parse_all(&bytes), vec![p]);
    }
}
