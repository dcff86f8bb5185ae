//! Bulk import of captured raw frame files.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use hamsat::frame::FrameDecoder;
use hamsat::sink::PayloadSink;
use hamsat::spacecraft::SpacecraftRegistry;

/// Decode every regular file in `dir` as one raw frame and store its
/// payloads. Files that do not decode are logged and skipped so one bad
/// capture cannot stop a bulk load.
pub fn import_dir(
    dir: &Path,
    registry: &Arc<SpacecraftRegistry>,
    sink: &dyn PayloadSink,
) -> Result<()> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading import directory {}", dir.display()))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    info!(files = paths.len(), dir = %dir.display(), "importing raw frames");
    let mut imported = 0usize;
    for (i, path) in paths.iter().enumerate() {
        let dat = match fs::read(path) {
            Ok(dat) => dat,
            Err(err) => {
                warn!(?path, %err, "could not read file, skipping");
                continue;
            }
        };
        match FrameDecoder::decode_frame(registry, &dat) {
            Ok(frame) => {
                if frame.save_payloads(sink) {
                    imported += 1;
                } else {
                    warn!(?path, "payload store rejected a slot, remaining slots skipped");
                }
            }
            Err(err) => {
                warn!(?path, %err, "file is not a decodable frame, skipping");
            }
        }
        if (i + 1) % 100 == 0 {
            info!("imported {} of {}", i + 1, paths.len());
        }
    }
    info!(imported, total = paths.len(), "import finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hamsat::frame::{CanPacket, DecodedPayload, FrameHeader, FRAME_LEN};
    use hamsat::layout::{Conversion, FieldDescriptor, Layout};
    use hamsat::spacecraft::{SpacecraftDescriptor, SpacecraftId};

    #[derive(Default)]
    struct CountingSink {
        added: Mutex<usize>,
    }

    impl PayloadSink for CountingSink {
        fn add(&self, _: SpacecraftId, _: u32, _: u16, _: &DecodedPayload) -> bool {
            *self.added.lock().unwrap() += 1;
            true
        }
        fn add_packet(&self, _: SpacecraftId, _: u32, _: u16, _: u32, _: &CanPacket) -> bool {
            true
        }
    }

    fn test_registry() -> Arc<SpacecraftRegistry> {
        let mut sc = SpacecraftDescriptor::new(1, "TEST-1");
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
                vec![FieldDescriptor {
                    name: "v".into(),
                    short_name: "v".into(),
                    description: String::new(),
                    bit_length: 8,
                    units: String::new(),
                    conversion: Conversion::Integer,
                    module: String::new(),
                    module_num: 0,
                    module_line: 0,
                    display_type: 0,
                }],
            ));
        }
        Arc::new(SpacecraftRegistry::from_descriptors(vec![sc]).unwrap())
    }

    #[test]
    fn imports_good_frames_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let header = FrameHeader {
            id: 1,
            resets: 0,
            uptime: 1,
            frame_type: 4,
        };
        let mut frame = header.encode().to_vec();
        frame.resize(FRAME_LEN, 0);
        fs::write(dir.path().join("a.frame"), &frame).unwrap();
        fs::write(dir.path().join("b.frame"), b"not a frame").unwrap();

        let registry = test_registry();
        let sink = CountingSink::default();
        import_dir(dir.path(), &registry, &sink).unwrap();
        // one wod beacon frame stored six slots; the bad file was skipped
        assert_eq!(*sink.added.lock().unwrap(), 6);
    }
}
