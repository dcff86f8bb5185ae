//! Per-connection frame assembly state machine.

use std::mem;
use std::sync::Arc;

use tracing::{debug, warn};

use super::bits::extract_fields;
use super::{CanPacket, FrameHeader, FrameType, FRAME_LEN, PAYLOAD_LEN, SLOT_LEN};
use crate::layout::Layout;
use crate::queue::QueueEntry;
use crate::sink::PayloadSink;
use crate::spacecraft::{SpacecraftDescriptor, SpacecraftId, SpacecraftRegistry};
use crate::{Error, Result};

/// Where the decoder is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Collecting the fixed-length header.
    AwaitingHeader,
    /// Filling fixed-size slot `i` by cumulative payload offset.
    FillingSlot(usize),
    /// A packet frame's single slot absorbing the whole payload region.
    FillingVariableSlot,
    /// Payload complete; trailer bytes are absorbed and ignored.
    Complete,
    /// Frame discarded; remaining bytes are absorbed to stay framed.
    Corrupt,
}

struct Slot {
    /// Slot bytes hold self-delimiting bus packets rather than a bit layout.
    bus: bool,
    layout: Arc<Layout>,
    data: Vec<u8>,
}

/// One slot's extracted telemetry values.
#[derive(Debug, Clone)]
pub struct DecodedPayload {
    pub spacecraft: SpacecraftId,
    pub resets: u16,
    pub uptime: u32,
    pub layout: Arc<Layout>,
    /// Raw field values in layout order, post bit-extraction and
    /// pre unit-conversion.
    pub values: Vec<u64>,
}

impl DecodedPayload {
    /// Bit-extract `layout` from `dat` using the craft's endianness flags.
    ///
    /// # Errors
    /// [`Error::Protocol`] when the layout overruns `dat`.
    pub fn extract(
        craft: &SpacecraftDescriptor,
        resets: u16,
        uptime: u32,
        layout: &Arc<Layout>,
        dat: &[u8],
    ) -> Result<Self> {
        let values = extract_fields(layout, dat, craft.msb_first_bits, craft.little_endian_words)?;
        Ok(DecodedPayload {
            spacecraft: craft.id,
            resets,
            uptime,
            layout: layout.clone(),
            values,
        })
    }

    #[must_use]
    pub fn layout_name(&self) -> &str {
        &self.layout.name
    }

    /// Raw value of the named field. Duplicate names resolve to the last
    /// matching layout entry.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<u64> {
        self.layout
            .position_by_name(field)
            .and_then(|i| self.values.get(i).copied())
    }
}

/// One bus/CAN slot's recovered sub-packets.
#[derive(Debug, Clone)]
pub struct CanPayload {
    pub spacecraft: SpacecraftId,
    pub resets: u16,
    pub uptime: u32,
    pub layout: Arc<Layout>,
    pub packets: Vec<CanPacket>,
}

/// A populated payload slot with its save/export behavior fixed at decode
/// time.
#[derive(Debug, Clone)]
pub enum PayloadRecord {
    Telemetry(DecodedPayload),
    Experiment(CanPayload),
}

impl PayloadRecord {
    #[must_use]
    pub fn layout_name(&self) -> &str {
        match self {
            PayloadRecord::Telemetry(p) => &p.layout.name,
            PayloadRecord::Experiment(p) => &p.layout.name,
        }
    }
}

/// A fully received, decodable frame.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub header: FrameHeader,
    pub frame_type: FrameType,
    pub craft: Arc<SpacecraftDescriptor>,
    pub payloads: Vec<PayloadRecord>,
    /// The frame exactly as received, for queue persistence.
    pub raw: Vec<u8>,
}

impl CompletedFrame {
    /// Persist every populated slot through the sink.
    ///
    /// Bus sub-packets get an increasing serial that continues across slots,
    /// so packets sharing the frame's (resets, uptime) epoch stay
    /// individually addressable. Stops at the first slot the sink rejects
    /// and returns `false`; earlier slots stay persisted.
    pub fn save_payloads(&self, sink: &dyn PayloadSink) -> bool {
        let id = self.header.id;
        let uptime = self.header.uptime;
        let resets = self.header.resets;
        let mut serial: u32 = 0;
        for record in &self.payloads {
            match record {
                PayloadRecord::Telemetry(payload) => {
                    if !sink.add(id, uptime, resets, payload) {
                        return false;
                    }
                }
                PayloadRecord::Experiment(payload) => {
                    for packet in &payload.packets {
                        if !sink.add_packet(id, uptime, resets, serial, packet) {
                            return false;
                        }
                        serial += 1;
                    }
                }
            }
        }
        true
    }

    /// Every bus sub-packet's wire buffer, slot order then packet order,
    /// ready for relay delivery.
    #[must_use]
    pub fn relay_buffers(&self) -> Vec<Vec<u8>> {
        let mut buffers = Vec::new();
        for record in &self.payloads {
            if let PayloadRecord::Experiment(payload) = record {
                buffers.extend(payload.packets.iter().map(CanPacket::to_bytes));
            }
        }
        buffers
    }

    /// Entry for the forwarding queue, classed by the craft's downlink.
    #[must_use]
    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            spacecraft: self.header.id,
            class: self.craft.class,
            data: self.raw.clone(),
        }
    }
}

/// Assembles a connection's byte stream into [`CompletedFrame`]s.
///
/// Feed bytes with [`consume`](Self::consume); once
/// [`frame_done`](Self::frame_done) reports true, collect the result with
/// [`take_frame`](Self::take_frame), which also resets the machine for the
/// next frame on the stream.
pub struct FrameDecoder {
    registry: Arc<SpacecraftRegistry>,
    state: DecodeState,
    header_buf: Vec<u8>,
    header: Option<FrameHeader>,
    frame_type: Option<FrameType>,
    craft: Option<Arc<SpacecraftDescriptor>>,
    slots: Vec<Slot>,
    raw: Vec<u8>,
    bytes_seen: usize,
    overrun_logged: bool,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(registry: Arc<SpacecraftRegistry>) -> Self {
        FrameDecoder {
            registry,
            state: DecodeState::AwaitingHeader,
            header_buf: Vec::with_capacity(FrameHeader::LEN),
            header: None,
            frame_type: None,
            craft: None,
            slots: Vec::new(),
            raw: Vec::with_capacity(FRAME_LEN),
            bytes_seen: 0,
            overrun_logged: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// True once a full frame's worth of bytes has been absorbed and the
    /// result (good or corrupt) can be taken.
    #[must_use]
    pub fn frame_done(&self) -> bool {
        self.bytes_seen >= FRAME_LEN
    }

    /// Consume the next byte from the stream.
    pub fn consume(&mut self, b: u8) {
        if self.bytes_seen < FRAME_LEN {
            self.raw.push(b);
        }
        match self.state {
            DecodeState::AwaitingHeader => {
                self.header_buf.push(b);
                if self.header_buf.len() == FrameHeader::LEN {
                    self.finish_header();
                }
            }
            DecodeState::FillingSlot(i) => {
                let slot = &mut self.slots[i];
                slot.data.push(b);
                if slot.data.len() == SLOT_LEN {
                    self.state = if i + 1 < self.slots.len() {
                        DecodeState::FillingSlot(i + 1)
                    } else {
                        DecodeState::Complete
                    };
                }
            }
            DecodeState::FillingVariableSlot => {
                let slot = &mut self.slots[0];
                slot.data.push(b);
                if slot.data.len() == PAYLOAD_LEN {
                    self.state = DecodeState::Complete;
                }
            }
            DecodeState::Complete | DecodeState::Corrupt => {
                if self.bytes_seen >= FRAME_LEN && !self.overrun_logged {
                    warn!("attempt to add byte past end of frame");
                    self.overrun_logged = true;
                }
            }
        }
        self.bytes_seen += 1;
    }

    /// Header is full: resolve the spacecraft and bind slots to layouts.
    fn finish_header(&mut self) {
        let Some(header) = FrameHeader::decode(&self.header_buf) else {
            self.state = DecodeState::Corrupt;
            return;
        };

        let Some(frame_type) = FrameType::from_code(header.frame_type) else {
            warn!(
                id = header.id,
                frame_type = header.frame_type,
                "frame type not valid, decode not possible"
            );
            self.header = Some(header);
            self.state = DecodeState::Corrupt;
            return;
        };

        let Some(craft) = self.registry.lookup(header.id) else {
            warn!(
                id = header.id,
                "spacecraft id is not configured, decode not possible"
            );
            self.header = Some(header);
            self.state = DecodeState::Corrupt;
            return;
        };

        let mut slots = Vec::with_capacity(frame_type.slots().len());
        for kind in frame_type.slots() {
            let name = kind.layout_name();
            let Some(layout) = craft.layout(name) else {
                warn!(
                    id = header.id,
                    layout = name,
                    "layout not configured for spacecraft, decode not possible"
                );
                self.header = Some(header);
                self.state = DecodeState::Corrupt;
                return;
            };
            slots.push(Slot {
                bus: frame_type.is_packet_frame() || kind.is_bus_slot(craft.family),
                layout,
                data: Vec::with_capacity(if frame_type.is_packet_frame() {
                    PAYLOAD_LEN
                } else {
                    SLOT_LEN
                }),
            });
        }

        debug!(
            id = header.id,
            resets = header.resets,
            uptime = header.uptime,
            frame_type = header.frame_type,
            "header complete"
        );
        self.state = if frame_type.is_packet_frame() {
            DecodeState::FillingVariableSlot
        } else {
            DecodeState::FillingSlot(0)
        };
        self.header = Some(header);
        self.frame_type = Some(frame_type);
        self.craft = Some(craft);
        self.slots = slots;
    }

    /// Take the finished frame and reset for the next one.
    ///
    /// Returns `None` for a corrupt or undecodable frame (already logged);
    /// the decoder is ready for the next frame either way.
    pub fn take_frame(&mut self) -> Option<CompletedFrame> {
        if !self.frame_done() {
            return None;
        }
        let registry = self.registry.clone();
        let finished = mem::replace(self, FrameDecoder::new(registry));
        match finished.into_completed() {
            Ok(frame) => Some(frame),
            Err(err) => {
                debug!(%err, "discarding frame");
                None
            }
        }
    }

    /// Decode one frame held entirely in `dat` (at least header + payload).
    ///
    /// # Errors
    /// [`Error::Protocol`] when the buffer is short, corrupt, or names an
    /// unknown spacecraft.
    pub fn decode_frame(registry: &Arc<SpacecraftRegistry>, dat: &[u8]) -> Result<CompletedFrame> {
        let mut decoder = FrameDecoder::new(registry.clone());
        for &b in dat {
            decoder.consume(b);
        }
        decoder.into_completed()
    }

    fn into_completed(self) -> Result<CompletedFrame> {
        if self.state != DecodeState::Complete {
            return Err(Error::Protocol(format!(
                "frame not complete in state {:?} after {} bytes",
                self.state, self.bytes_seen
            )));
        }
        // Complete is only reachable with header, type, and craft resolved
        let (Some(header), Some(frame_type), Some(craft)) =
            (self.header, self.frame_type, self.craft)
        else {
            return Err(Error::Protocol("complete frame missing header".into()));
        };

        let mut payloads = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if slot.bus {
                payloads.push(PayloadRecord::Experiment(CanPayload {
                    spacecraft: header.id,
                    resets: header.resets,
                    uptime: header.uptime,
                    layout: slot.layout.clone(),
                    packets: CanPacket::parse_all(&slot.data),
                }));
            } else {
                payloads.push(PayloadRecord::Telemetry(DecodedPayload::extract(
                    &craft,
                    header.resets,
                    header.uptime,
                    &slot.layout,
                    &slot.data,
                )?));
            }
        }

        Ok(CompletedFrame {
            header,
            frame_type,
            craft,
            payloads,
            raw: self.raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Conversion, FieldDescriptor};
    use crate::queue::QueueClass;
    use crate::spacecraft::{Family, RelayTarget};
    use std::sync::Mutex;

    fn field(name: &str, bits: usize) -> FieldDescriptor {
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

    fn layout(name: &str, fields: Vec<FieldDescriptor>) -> Layout {
        Layout::new(name, fields)
    }

    fn craft(id: SpacecraftId, family: Family) -> SpacecraftDescriptor {
        let mut sc = SpacecraftDescriptor::new(id, format!("SAT-{id}"));
        sc.family = family;
        sc.class = QueueClass::HighRate;
        sc.forward = Some(RelayTarget {
            host: "127.0.0.1".into(),
            port: 8587,
        });
        for name in [
            crate::spacecraft::REAL_TIME_LAYOUT,
            crate::spacecraft::MAX_LAYOUT,
            crate::spacecraft::MIN_LAYOUT,
            crate::spacecraft::RAD_LAYOUT,
            crate::spacecraft::WOD_LAYOUT,
            crate::spacecraft::WOD_RAD_LAYOUT,
        ] {
            sc.add_layout(layout(
                name,
                vec![field("alpha", 8), field("beta", 16), field("gamma", 4)],
            ));
        }
        sc
    }

    fn registry() -> Arc<SpacecraftRegistry> {
        Arc::new(
            SpacecraftRegistry::from_descriptors(vec![
                craft(1, Family::Standard),
                craft(4, Family::BusExperiment),
            ])
            .unwrap(),
        )
    }

    fn frame_bytes(id: u8, resets: u16, uptime: u32, frame_type: u8, payload: &[u8]) -> Vec<u8> {
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

    #[derive(Default)]
    struct MemorySink {
        added: Mutex<Vec<(SpacecraftId, u32, u16, String)>>,
        packets: Mutex<Vec<(u32, CanPacket)>>,
        fail_after: Mutex<Option<usize>>,
    }

    impl PayloadSink for MemorySink {
        fn add(&self, id: SpacecraftId, uptime: u32, resets: u16, payload: &DecodedPayload) -> bool {
            let mut added = self.added.lock().unwrap();
            if let Some(limit) = *self.fail_after.lock().unwrap() {
                if added.len() >= limit {
                    return false;
                }
            }
            added.push((id, uptime, resets, payload.layout_name().to_string()));
            true
        }

        fn add_packet(
            &self,
            _id: SpacecraftId,
            _uptime: u32,
            _resets: u16,
            serial: u32,
            packet: &CanPacket,
        ) -> bool {
            self.packets.lock().unwrap().push((serial, packet.clone()));
            true
        }
    }

    #[test]
    fn byte_at_a_time_matches_direct_extraction() {
        let registry = registry();
        let mut payload = vec![0u8; PAYLOAD_LEN];
        payload[0] = 0xab; // alpha
        payload[1] = 0x34; // beta low byte (little-endian word)
        payload[2] = 0x12; // beta high byte
        payload[3] = 0xf0; // gamma in the top nibble

        let dat = frame_bytes(1, 7, 1234, FrameType::HealthBeacon.code(), &payload);
        let mut decoder = FrameDecoder::new(registry.clone());
        for &b in &dat {
            decoder.consume(b);
        }
        assert!(decoder.frame_done());
        let frame = decoder.take_frame().unwrap();

        let craft = registry.lookup(1).unwrap();
        let rt = craft.layout(crate::spacecraft::REAL_TIME_LAYOUT).unwrap();
        let direct = DecodedPayload::extract(&craft, 7, 1234, &rt, &payload[..SLOT_LEN]).unwrap();

        let PayloadRecord::Telemetry(got) = &frame.payloads[0] else {
            panic!("expected telemetry payload");
        };
        assert_eq!(got.values, direct.values);
        assert_eq!(got.value("alpha"), Some(0xab));
        assert_eq!(got.value("beta"), Some(0x1234));
        assert_eq!(got.value("gamma"), Some(0xf));
    }

    #[test]
    fn health_beacon_yields_one_rt_five_wod() {
        let registry = registry();
        let dat = frame_bytes(1, 0, 0, FrameType::HealthBeacon.code(), &[0u8; PAYLOAD_LEN]);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();
        assert_eq!(frame.payloads.len(), 6);
        assert_eq!(
            frame.payloads[0].layout_name(),
            crate::spacecraft::REAL_TIME_LAYOUT
        );
        for p in &frame.payloads[1..] {
            assert_eq!(p.layout_name(), crate::spacecraft::WOD_LAYOUT);
        }
    }

    #[test]
    fn every_frame_type_yields_documented_slot_count() {
        let registry = registry();
        for code in 0..=10u8 {
            let ft = FrameType::from_code(code).unwrap();
            let dat = frame_bytes(1, 0, 0, code, &[0u8; PAYLOAD_LEN]);
            let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();
            assert_eq!(frame.payloads.len(), ft.slots().len(), "type {code}");
            for (record, kind) in frame.payloads.iter().zip(ft.slots()) {
                assert_eq!(record.layout_name(), kind.layout_name(), "type {code}");
            }
        }
    }

    #[test]
    fn unknown_spacecraft_goes_corrupt_yields_nothing() {
        let registry = registry();
        let dat = frame_bytes(99, 0, 0, 1, &[0u8; PAYLOAD_LEN]);
        let mut decoder = FrameDecoder::new(registry);
        for &b in &dat {
            decoder.consume(b);
        }
        assert_eq!(decoder.state(), DecodeState::Corrupt);
        assert!(decoder.frame_done());
        assert!(decoder.take_frame().is_none());
        // machine is reset and usable for the next frame
        assert_eq!(decoder.state(), DecodeState::AwaitingHeader);
    }

    #[test]
    fn invalid_frame_type_goes_corrupt() {
        let registry = registry();
        let dat = frame_bytes(1, 0, 0, 42, &[0u8; PAYLOAD_LEN]);
        let mut decoder = FrameDecoder::new(registry);
        for &b in &dat {
            decoder.consume(b);
        }
        assert!(decoder.take_frame().is_none());
    }

    #[test]
    fn two_frames_back_to_back() {
        let registry = registry();
        let mut stream = frame_bytes(1, 1, 10, FrameType::WodBeacon.code(), &[0u8; PAYLOAD_LEN]);
        stream.extend(frame_bytes(
            1,
            1,
            20,
            FrameType::HealthBeacon.code(),
            &[0u8; PAYLOAD_LEN],
        ));

        let mut decoder = FrameDecoder::new(registry);
        let mut frames = Vec::new();
        for &b in &stream {
            decoder.consume(b);
            if decoder.frame_done() {
                frames.extend(decoder.take_frame());
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.uptime, 10);
        assert_eq!(frames[1].header.uptime, 20);
        assert_eq!(frames[1].frame_type, FrameType::HealthBeacon);
    }

    #[test]
    fn packet_frame_explodes_sub_packets_with_serials() {
        let registry = registry();
        let a = CanPacket {
            bus_id: 0x100,
            data: vec![1, 2],
        };
        let b = CanPacket {
            bus_id: 0x200,
            data: vec![3],
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(&a.to_bytes());
        payload.extend_from_slice(&b.to_bytes());
        payload.resize(PAYLOAD_LEN, 0);

        let dat = frame_bytes(4, 2, 99, FrameType::SciencePackets.code(), &payload);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();
        assert_eq!(frame.payloads.len(), 1);
        let PayloadRecord::Experiment(exp) = &frame.payloads[0] else {
            panic!("expected experiment payload");
        };
        assert_eq!(exp.packets, vec![a.clone(), b.clone()]);

        let sink = MemorySink::default();
        assert!(frame.save_payloads(&sink));
        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], (0, a.clone()));
        assert_eq!(packets[1], (1, b.clone()));

        assert_eq!(frame.relay_buffers(), vec![a.to_bytes(), b.to_bytes()]);
    }

    #[test]
    fn serials_continue_across_bus_slots() {
        let registry = registry();
        let pkt = CanPacket {
            bus_id: 0x42,
            data: vec![7],
        };
        // HealthExperiment on a bus-family craft has three Experiment slots
        // and one WodExperiment slot; give each one packet
        let mut payload = vec![0u8; PAYLOAD_LEN];
        let bus_slots = [1usize, 2, 3, 5];
        for i in &bus_slots {
            let start = i * SLOT_LEN;
            let bytes = pkt.to_bytes();
            payload[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        let dat = frame_bytes(4, 0, 0, FrameType::HealthExperiment.code(), &payload);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();

        let sink = MemorySink::default();
        assert!(frame.save_payloads(&sink));
        let packets = sink.packets.lock().unwrap();
        let serials: Vec<u32> = packets.iter().map(|(s, _)| *s).collect();
        assert_eq!(serials, vec![0, 1, 2, 3]);
        assert_eq!(frame.relay_buffers().len(), 4);
    }

    #[test]
    fn standard_family_experiment_slots_stay_telemetry() {
        let registry = registry();
        let dat = frame_bytes(1, 0, 0, FrameType::Health.code(), &[0u8; PAYLOAD_LEN]);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();
        assert!(frame
            .payloads
            .iter()
            .all(|p| matches!(p, PayloadRecord::Telemetry(_))));
    }

    #[test]
    fn save_stops_at_first_sink_failure() {
        let registry = registry();
        let dat = frame_bytes(1, 0, 0, FrameType::HealthBeacon.code(), &[0u8; PAYLOAD_LEN]);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();

        let sink = MemorySink::default();
        *sink.fail_after.lock().unwrap() = Some(2);
        assert!(!frame.save_payloads(&sink));
        // the two slots saved before the failure are not rolled back
        assert_eq!(sink.added.lock().unwrap().len(), 2);
    }

    #[test]
    fn queue_entry_carries_raw_frame() {
        let registry = registry();
        let dat = frame_bytes(4, 5, 6, FrameType::SciencePackets.code(), &[0u8; PAYLOAD_LEN]);
        let frame = FrameDecoder::decode_frame(&registry, &dat).unwrap();
        let entry = frame.queue_entry();
        assert_eq!(entry.spacecraft, 4);
        assert_eq!(entry.class, QueueClass::HighRate);
        assert_eq!(entry.data, dat);
    }

    #[test]
    fn short_buffer_is_protocol_error() {
        let registry = registry();
        let err = FrameDecoder::decode_frame(&registry, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
