//! JSON-lines payload store.
//!
//! One file per spacecraft under the payload directory: decoded telemetry in
//! `satNNN.jsonl`, bus packets in `satNNN_packets.jsonl`. Appends are
//! serialized so records from concurrent connection workers never interleave
//! mid-line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::json;
use tracing::error;

use hamsat::frame::{CanPacket, DecodedPayload};
use hamsat::sink::PayloadSink;
use hamsat::spacecraft::SpacecraftId;

pub struct JsonlSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(dir: PathBuf) -> Self {
        JsonlSink {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn append(&self, file: &str, record: &serde_json::Value) -> bool {
        let path = self.dir.join(file);
        let _guard = self.write_lock.lock().expect("sink lock poisoned");
        let zult = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{record}"));
        if let Err(err) = zult {
            error!(?path, %err, "could not append payload record");
            return false;
        }
        true
    }
}

impl PayloadSink for JsonlSink {
    fn add(&self, id: SpacecraftId, uptime: u32, resets: u16, payload: &DecodedPayload) -> bool {
        let record = json!({
            "id": id,
            "resets": resets,
            "uptime": uptime,
            "type": payload.layout_name(),
            "values": payload.values,
        });
        self.append(&format!("sat{id:03}.jsonl"), &record)
    }

    fn add_packet(
        &self,
        id: SpacecraftId,
        uptime: u32,
        resets: u16,
        serial: u32,
        packet: &CanPacket,
    ) -> bool {
        let record = json!({
            "id": id,
            "resets": resets,
            "uptime": uptime,
            "serial": serial,
            "busId": packet.bus_id,
            "data": packet.data,
        });
        self.append(&format!("sat{id:03}_packets.jsonl"), &record)
    }
}
