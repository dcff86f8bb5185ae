//! Telemetry field layouts.
//!
//! A [`Layout`] is the ordered set of bit fields that one payload slot is
//! unpacked with. Layouts are loaded from the CSV files shipped alongside a
//! spacecraft's config at program start and never change afterwards, so no
//! provision is made for versioning or reloading.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Rule for turning an extracted raw integer into a physical value.
///
/// The numeric codes appear verbatim in the layout CSV files and are fixed by
/// the on-board software, so the discriminants here are load-bearing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    None = 0,
    Integer = 1,
    V25Sensor = 2,
    V3Sensor = 3,
    Battery = 4,
    SolarPanel = 5,
    SolarPanelTemp = 6,
    Temp = 7,
    BatteryTemp = 8,
    BatteryCurrent = 9,
    PaCurrent = 10,
    PsuCurrent = 11,
    Spin = 12,
    MemsRotation = 13,
    Rssi = 14,
    IhuTemp = 15,
    Antenna = 16,
    StatusBit = 17,
    IhuDiagnostic = 18,
    HardError = 19,
    SoftError = 20,
    Boolean = 21,
    MpptCurrent = 22,
    MpptSolarPanel = 23,
    MpptSolarPanelTemp = 24,
    Uptime16Sec = 25,
    Freq = 26,
    VulcanStatus = 27,
    HerciHex = 28,
    HerciSource = 29,
    HerciMicroPktType = 30,
    HerciMicroPktSource = 31,
    HerciMicroPktHex = 32,
    Timestamp = 33,
    IcrCommandCount = 34,
    IcrDiagnostic = 35,
    WodStored = 36,
    LtTxRxTemp = 37,
    LtPaCurrent = 38,
    SoftError84488 = 39,
    LtTxFwdPower = 40,
    LtTxRefPower = 41,
    LtVga = 42,
    IcrVoltSensor = 43,
    StatusEnabled = 44,
    Com1Accelerometer = 45,
    Com1Magnetometer = 46,
    Com1Spin = 47,
    Com1GyroTemp = 48,
    IsisAntTemp = 49,
    IsisAntTime = 50,
    IsisAntDeployment = 51,
    BusSolarPanel = 52,
}

impl Conversion {
    /// Look up a conversion by its CSV code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        use Conversion as C;
        Some(match code {
            0 => C::None,
            1 => C::Integer,
            2 => C::V25Sensor,
            3 => C::V3Sensor,
            4 => C::Battery,
            5 => C::SolarPanel,
            6 => C::SolarPanelTemp,
            7 => C::Temp,
            8 => C::BatteryTemp,
            9 => C::BatteryCurrent,
            10 => C::PaCurrent,
            11 => C::PsuCurrent,
            12 => C::Spin,
            13 => C::MemsRotation,
            14 => C::Rssi,
            15 => C::IhuTemp,
            16 => C::Antenna,
            17 => C::StatusBit,
            18 => C::IhuDiagnostic,
            19 => C::HardError,
            20 => C::SoftError,
            21 => C::Boolean,
            22 => C::MpptCurrent,
            23 => C::MpptSolarPanel,
            24 => C::MpptSolarPanelTemp,
            25 => C::Uptime16Sec,
            26 => C::Freq,
            27 => C::VulcanStatus,
            28 => C::HerciHex,
            29 => C::HerciSource,
            30 => C::HerciMicroPktType,
            31 => C::HerciMicroPktSource,
            32 => C::HerciMicroPktHex,
            33 => C::Timestamp,
            34 => C::IcrCommandCount,
            35 => C::IcrDiagnostic,
            36 => C::WodStored,
            37 => C::LtTxRxTemp,
            38 => C::LtPaCurrent,
            39 => C::SoftError84488,
            40 => C::LtTxFwdPower,
            41 => C::LtTxRefPower,
            42 => C::LtVga,
            43 => C::IcrVoltSensor,
            44 => C::StatusEnabled,
            45 => C::Com1Accelerometer,
            46 => C::Com1Magnetometer,
            47 => C::Com1Spin,
            48 => C::Com1GyroTemp,
            49 => C::IsisAntTemp,
            50 => C::IsisAntTime,
            51 => C::IsisAntDeployment,
            52 => C::BusSolarPanel,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// One bit field within a [`Layout`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub short_name: String,
    pub description: String,
    /// Width of the field in bits.
    pub bit_length: usize,
    /// Units as they would appear on a graph axis, e.g. `C` for Celsius.
    pub units: String,
    pub conversion: Conversion,
    /// Display module this field is grouped under, e.g. `Radio`.
    pub module: String,
    /// Order the module is shown on screen, 1-9 top row, 10-19 bottom.
    pub module_num: u16,
    /// Line within the module, starting from 1.
    pub module_line: u16,
    /// Whether the field spans all columns or sits in the RT/MIN/MAX columns.
    pub display_type: u16,
}

/// Named, ordered set of field descriptors defining how a payload slot's raw
/// bytes are bit-extracted. Immutable once loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Name used to index the layout from a spacecraft config.
    pub name: String,
    /// Set when this layout describes a secondary payload spawned from a
    /// primary one.
    pub parent: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    total_bits: usize,
}

impl Layout {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        let total_bits = fields.iter().map(|f| f.bit_length).sum();
        Layout {
            name: name.into(),
            parent: None,
            fields,
            total_bits,
        }
    }

    /// Load a layout from a CSV file.
    ///
    /// The first line is a header whose first token is the declared field
    /// count; each following line is one field row. The loaded layout keeps
    /// the file stem as its name until the spacecraft config renames it.
    ///
    /// # Errors
    /// [`Error::LayoutLoad`] when the declared field count does not match the
    /// rows actually parsed, a required token is missing, or a numeric field
    /// is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Layout> {
        let path = path.as_ref();
        debug!(?path, "loading layout");
        let text = fs::read_to_string(path).map_err(|err| Error::LayoutLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&text, name).map_err(|reason| Error::LayoutLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(text: &str, name: String) -> std::result::Result<Layout, String> {
        let mut lines = text.lines();
        let header = lines.next().ok_or("empty layout file")?;
        let declared: usize = header
            .split(',')
            .next()
            .ok_or("missing field count in header")?
            .trim()
            .parse()
            .map_err(|_| "malformed field count in header".to_string())?;

        let mut fields = Vec::with_capacity(declared);
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            fields.push(parse_row(line).map_err(|e| format!("row {}: {e}", lineno + 2))?);
        }

        if fields.len() != declared {
            return Err(format!(
                "expected {declared} fields, but loaded {}",
                fields.len()
            ));
        }

        let total_bits = fields.iter().map(|f| f.bit_length).sum();
        Ok(Layout {
            name,
            parent: None,
            fields,
            total_bits,
        })
    }

    /// Total number of bits across all fields.
    #[must_use]
    pub fn max_bits(&self) -> usize {
        self.total_bits
    }

    /// Number of whole bytes needed to hold all fields.
    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.total_bits.div_ceil(8)
    }

    #[must_use]
    pub fn is_secondary(&self) -> bool {
        self.parent.is_some()
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.position_by_name(name).is_some()
    }

    /// Index of the named field, matched case-insensitively.
    ///
    /// When a field name appears more than once the last entry wins. That
    /// matches how flight layout files have always been interpreted, so a
    /// duplicate is honored rather than corrected.
    #[must_use]
    pub fn position_by_name(&self, name: &str) -> Option<usize> {
        let mut pos = None;
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.eq_ignore_ascii_case(name) {
                pos = Some(i);
            }
        }
        pos
    }

    #[must_use]
    pub fn conversion_by_name(&self, name: &str) -> Conversion {
        self.position_by_name(name)
            .map_or(Conversion::None, |i| self.fields[i].conversion)
    }

    #[must_use]
    pub fn units_by_name(&self, name: &str) -> &str {
        self.position_by_name(name)
            .map_or("", |i| self.fields[i].units.as_str())
    }

    #[must_use]
    pub fn short_name_by_name(&self, name: &str) -> &str {
        self.position_by_name(name)
            .map_or("", |i| self.fields[i].short_name.as_str())
    }

    #[must_use]
    pub fn module_by_name(&self, name: &str) -> &str {
        self.position_by_name(name)
            .map_or("", |i| self.fields[i].module.as_str())
    }
}

fn token<'a>(
    tokens: &mut std::str::Split<'a, char>,
    what: &str,
) -> std::result::Result<&'a str, String> {
    tokens
        .next()
        .map(str::trim)
        .ok_or_else(|| format!("missing {what}"))
}

fn number(
    tokens: &mut std::str::Split<'_, char>,
    what: &str,
) -> std::result::Result<u64, String> {
    let tok = token(tokens, what)?;
    tok.parse().map_err(|_| format!("malformed {what}: {tok:?}"))
}

/// Parse one CSV field row:
/// `id,type,name,bits,units,conversion,module,module_num,module_line,display_type,short_name,description`
fn parse_row(line: &str) -> std::result::Result<FieldDescriptor, String> {
    let mut tokens = line.split(',');

    number(&mut tokens, "field id")?;
    token(&mut tokens, "field type")?;
    let name = token(&mut tokens, "field name")?.to_string();
    let bit_length = number(&mut tokens, "bit length")? as usize;
    let units = token(&mut tokens, "units")?.to_string();
    let code = number(&mut tokens, "conversion code")? as u16;
    let conversion =
        Conversion::from_code(code).ok_or_else(|| format!("unknown conversion code {code}"))?;
    let module = token(&mut tokens, "module")?.to_string();
    let module_num = number(&mut tokens, "module number")? as u16;
    let module_line = number(&mut tokens, "module line")? as u16;
    let display_type = number(&mut tokens, "display type")? as u16;
    let short_name = token(&mut tokens, "short name")?.to_string();
    let description = token(&mut tokens, "description")?.to_string();

    Ok(FieldDescriptor {
        name,
        short_name,
        description,
        bit_length,
        units,
        conversion,
        module,
        module_num,
        module_line,
        display_type,
    })
}
