#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use hamsat::frame::{CanPacket, DecodedPayload, FrameHeader, FRAME_LEN, PAYLOAD_LEN};
use hamsat::layout::{Conversion, FieldDescriptor, Layout};
use hamsat::queue::QueueClass;
use hamsat::sink::PayloadSink;
use hamsat::spacecraft::{
    Family, RelayTarget, SpacecraftDescriptor, SpacecraftId, SpacecraftRegistry,
};

pub fn field(name: &str, bits: usize) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        short_name: name.to_string(),
        description: String::new(),
        bit_length: bits,
        units: String::new(),
        conversion: Conversion::Integer,
        module: String::new(),
        module_num: 0,
        module_line: 0,
        display_type: 0,
    }
}

/// A craft with every slot layout defined as `alpha:8, beta:16, gamma:4`.
pub fn craft(id: SpacecraftId, family: Family, forward_port: Option<u16>) -> SpacecraftDescriptor {
    let mut sc = SpacecraftDescriptor::new(id, format!("TEST-{id}"));
    sc.family = family;
    sc.class = QueueClass::HighRate;
    sc.forward = forward_port.map(|port| RelayTarget {
        host: "127.0.0.1".into(),
        port,
    });
    for name in [
        hamsat::spacecraft::REAL_TIME_LAYOUT,
        hamsat::spacecraft::MAX_LAYOUT,
        hamsat::spacecraft::MIN_LAYOUT,
        hamsat::spacecraft::RAD_LAYOUT,
        hamsat::spacecraft::WOD_LAYOUT,
        hamsat::spacecraft::WOD_RAD_LAYOUT,
    ] {
        sc.add_layout(Layout::new(
            name,
            vec![field("alpha", 8), field("beta", 16), field("gamma", 4)],
        ));
    }
    sc
}

pub fn registry(craft_list: Vec<SpacecraftDescriptor>) -> Arc<SpacecraftRegistry> {
    Arc::new(SpacecraftRegistry::from_descriptors(craft_list).unwrap())
}

pub fn frame_bytes(id: u8, resets: u16, uptime: u32, frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        id,
        resets,
        uptime,
        frame_type,
    };
    let mut dat = header.encode().to_vec();
    dat.extend_from_slice(payload);
    dat.resize(FRAME_LEN, 0);
    dat
}

/// A payload region whose first slot starts with `alpha`.
pub fn payload_with_alpha(alpha: u8) -> Vec<u8> {
    let mut payload = vec![0u8; PAYLOAD_LEN];
    payload[0] = alpha;
    payload
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedPayload {
    pub id: SpacecraftId,
    pub uptime: u32,
    pub resets: u16,
    pub layout: String,
    pub values: Vec<u64>,
}

#[derive(Default)]
pub struct MemorySink {
    pub added: Mutex<Vec<AddedPayload>>,
    pub packets: Mutex<Vec<(SpacecraftId, u32, CanPacket)>>,
}

impl MemorySink {
    pub fn count(&self) -> usize {
        self.added.lock().unwrap().len()
    }
}

impl PayloadSink for MemorySink {
    fn add(&self, id: SpacecraftId, uptime: u32, resets: u16, payload: &DecodedPayload) -> bool {
        self.added.lock().unwrap().push(AddedPayload {
            id,
            uptime,
            resets,
            layout: payload.layout_name().to_string(),
            values: payload.values.clone(),
        });
        true
    }

    fn add_packet(
        &self,
        id: SpacecraftId,
        _uptime: u32,
        _resets: u16,
        serial: u32,
        packet: &CanPacket,
    ) -> bool {
        self.packets.lock().unwrap().push((id, serial, packet.clone()));
        true
    }
}
