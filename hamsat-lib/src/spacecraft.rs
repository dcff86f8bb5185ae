//! Spacecraft descriptors and the registry that owns them.
//!
//! Each spacecraft is described by a JSON file in the spacecraft directory
//! naming its id, frequency bounds, endianness, downlink class, relay target,
//! and the CSV layout files its payloads are unpacked with. Descriptors are
//! loaded once at startup and immutable afterwards, so the registry can be
//! shared read-only across every connection worker without synchronization.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::layout::Layout;
use crate::queue::QueueClass;
use crate::{Error, Result};

/// Spacecraft identifier as carried in the frame header.
pub type SpacecraftId = u8;

/// Layout bound to housekeeping real-time slots.
pub const REAL_TIME_LAYOUT: &str = "rttelemetry";
/// Layout bound to maximum-values slots.
pub const MAX_LAYOUT: &str = "maxtelemetry";
/// Layout bound to minimum-values slots.
pub const MIN_LAYOUT: &str = "mintelemetry";
/// Layout bound to experiment slots.
pub const RAD_LAYOUT: &str = "radtelemetry";
/// Layout bound to whole-orbit-data slots.
pub const WOD_LAYOUT: &str = "wodtelemetry";
/// Layout bound to whole-orbit experiment slots.
pub const WOD_RAD_LAYOUT: &str = "wodradtelemetry";

/// Selects special-case payload handling for a spacecraft.
///
/// `BusExperiment` craft carry self-delimiting CAN bus sub-packets in their
/// experiment slots instead of plain radiation counters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Family {
    #[default]
    Standard,
    BusExperiment,
}

/// Downstream relay endpoint for a forwarding-eligible spacecraft.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorFile {
    id: u16,
    name: String,
    #[serde(default)]
    catalog_number: u32,
    downlink_freq_khz: u32,
    min_freq_khz: u32,
    max_freq_khz: u32,
    #[serde(default = "default_true")]
    msb_first_bits: bool,
    #[serde(default = "default_true")]
    little_endian_words: bool,
    #[serde(default)]
    family: Family,
    #[serde(default)]
    class: QueueClass,
    #[serde(default)]
    forward: Option<RelayTarget>,
    layouts: Vec<LayoutRef>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutRef {
    name: String,
    file: String,
    #[serde(default)]
    parent: Option<String>,
}

/// Everything known about one spacecraft. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct SpacecraftDescriptor {
    pub id: SpacecraftId,
    pub name: String,
    pub catalog_number: u32,
    pub downlink_freq_khz: u32,
    pub min_freq_khz: u32,
    pub max_freq_khz: u32,
    /// Bits within payload bytes are transmitted most-significant first.
    pub msb_first_bits: bool,
    /// Multi-byte payload fields are stored little-endian by the IHU.
    pub little_endian_words: bool,
    pub family: Family,
    /// Downlink class, which selects the forwarding queue this craft's
    /// frames are relayed through.
    pub class: QueueClass,
    pub forward: Option<RelayTarget>,
    layouts: HashMap<String, Arc<Layout>>,
}

impl SpacecraftDescriptor {
    #[must_use]
    pub fn new(id: SpacecraftId, name: impl Into<String>) -> Self {
        SpacecraftDescriptor {
            id,
            name: name.into(),
            catalog_number: 0,
            downlink_freq_khz: 0,
            min_freq_khz: 0,
            max_freq_khz: 0,
            msb_first_bits: true,
            little_endian_words: true,
            family: Family::Standard,
            class: QueueClass::default(),
            forward: None,
            layouts: HashMap::new(),
        }
    }

    /// Load a descriptor file, resolving its layout CSVs relative to `dir`.
    ///
    /// # Errors
    /// [`Error::SpacecraftConfig`] on malformed JSON or an out-of-range id;
    /// [`Error::LayoutLoad`] if any referenced layout fails to load.
    pub fn load(path: &Path, dir: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let parsed: DescriptorFile = serde_json::from_reader(file)
            .map_err(|err| Error::SpacecraftConfig(format!("{}: {err}", path.display())))?;

        let id = SpacecraftId::try_from(parsed.id).ok().filter(|id| *id > 0).ok_or_else(|| {
            Error::SpacecraftConfig(format!(
                "{}: spacecraft id {} out of range",
                path.display(),
                parsed.id
            ))
        })?;

        let mut descriptor = SpacecraftDescriptor {
            id,
            name: parsed.name,
            catalog_number: parsed.catalog_number,
            downlink_freq_khz: parsed.downlink_freq_khz,
            min_freq_khz: parsed.min_freq_khz,
            max_freq_khz: parsed.max_freq_khz,
            msb_first_bits: parsed.msb_first_bits,
            little_endian_words: parsed.little_endian_words,
            family: parsed.family,
            class: parsed.class,
            forward: parsed.forward,
            layouts: HashMap::new(),
        };
        for layout_ref in parsed.layouts {
            let mut layout = Layout::load(dir.join(&layout_ref.file))?;
            layout.name = layout_ref.name;
            layout.parent = layout_ref.parent;
            descriptor.add_layout(layout);
        }
        Ok(descriptor)
    }

    /// Register a layout under its (case-insensitive) name.
    pub fn add_layout(&mut self, layout: Layout) {
        self.layouts
            .insert(layout.name.to_ascii_lowercase(), Arc::new(layout));
    }

    /// Layout lookup by name, case-insensitive.
    #[must_use]
    pub fn layout(&self, name: &str) -> Option<Arc<Layout>> {
        self.layouts.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Whether frames from this craft are relayed to a downstream server.
    #[must_use]
    pub fn forwards(&self) -> bool {
        self.forward.is_some()
    }
}

/// Maps spacecraft ids to their descriptors.
#[derive(Debug, Default)]
pub struct SpacecraftRegistry {
    craft: HashMap<SpacecraftId, Arc<SpacecraftDescriptor>>,
}

impl SpacecraftRegistry {
    /// Load every `*.json` descriptor in `dir`.
    ///
    /// A descriptor that fails to load is logged and skipped so one bad
    /// config cannot take down the rest; a duplicate id keeps the first file
    /// seen. Zero successfully loaded spacecraft is an error, since a server
    /// with no spacecraft can decode nothing.
    ///
    /// # Errors
    /// [`Error::Io`] reading the directory, or [`Error::SpacecraftConfig`]
    /// when no descriptor loads.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut registry = SpacecraftRegistry::default();
        for path in paths {
            match SpacecraftDescriptor::load(&path, dir) {
                Ok(descriptor) => {
                    if registry.craft.contains_key(&descriptor.id) {
                        warn!(
                            id = descriptor.id,
                            ?path,
                            "duplicate spacecraft id, skipping file"
                        );
                        continue;
                    }
                    info!(id = descriptor.id, name = %descriptor.name, "loaded spacecraft");
                    registry.insert(descriptor);
                }
                Err(err) => {
                    error!(?path, %err, "this spacecraft will not be loaded");
                }
            }
        }

        if registry.craft.is_empty() {
            return Err(Error::SpacecraftConfig(format!(
                "no spacecraft configurations could be loaded from {}",
                dir.display()
            )));
        }
        Ok(registry)
    }

    /// Build a registry directly from descriptors.
    ///
    /// # Errors
    /// [`Error::SpacecraftConfig`] on a duplicate id or an empty set.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = SpacecraftDescriptor>,
    ) -> Result<Self> {
        let mut registry = SpacecraftRegistry::default();
        for descriptor in descriptors {
            if registry.craft.contains_key(&descriptor.id) {
                return Err(Error::SpacecraftConfig(format!(
                    "duplicate spacecraft id {}",
                    descriptor.id
                )));
            }
            registry.insert(descriptor);
        }
        if registry.craft.is_empty() {
            return Err(Error::SpacecraftConfig("no spacecraft given".into()));
        }
        Ok(registry)
    }

    fn insert(&mut self, descriptor: SpacecraftDescriptor) {
        self.craft.insert(descriptor.id, Arc::new(descriptor));
    }

    #[must_use]
    pub fn lookup(&self, id: SpacecraftId) -> Option<Arc<SpacecraftDescriptor>> {
        self.craft.get(&id).cloned()
    }

    /// Layout for the given spacecraft, or `None` if either is unknown.
    #[must_use]
    pub fn layout_by_name(&self, id: SpacecraftId, name: &str) -> Option<Arc<Layout>> {
        self.craft.get(&id).and_then(|sc| sc.layout(name))
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<SpacecraftDescriptor>> {
        let mut all: Vec<_> = self.craft.values().cloned().collect();
        all.sort_by_key(|sc| sc.id);
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.craft.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.craft.is_empty()
    }
}
