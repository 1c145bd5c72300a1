//! Connection configuration read from an ini style database
//!
//! Every connection owns one section, `CCP Configuration for Target N` or
//! `XCP Configuration for Target N`. Besides scalar keys a section carries two open
//! ended lists, `v0, v1, ...` with measurement signals and `p0, p1, ...` with
//! calibration parameters. Both use the record format
//! `type,name,address[,unit[,conversion[,min,max]]]`.

use std::{fmt, path::Path};

use bitflags::bitflags;
use strum_macros::Display;

use crate::{
    codec::{ByteOrder, ScalarType},
    variables::VariableMeta,
};

/// Configuration result
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
/// Error produced while reading configuration
pub enum ConfigError {
    /// Ini file could not be read
    #[error("cannot read configuration file")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// A line of the ini file is neither a section header, a key/value pair nor a comment
    #[error("line {line}: cannot parse {text:?}")]
    Syntax {
        /// 1 based line number
        line: usize,
        /// Offending line
        text: String,
    },
    /// A signal or parameter record has fewer than 3 fields
    #[error("missing parameter in string {0}")]
    MissingField(String),
    /// Section to copy does not exist
    #[error("there is no section [{0}]")]
    MissingSection(String),
}

/// One `[section]` of an ini file. Keys keep their file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    /// Creates an empty section
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Section name without brackets
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of a key. Key lookup ignores ASCII case
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Sets or replaces a key
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// All key/value pairs in file order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).map(parse_c_long).unwrap_or(default)
    }

    fn yes_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "yes",
            None => default,
        }
    }

    fn ulong_or(&self, key: &str, default: u32) -> u32 {
        self.get(key).map(parse_c_ulong).unwrap_or(default)
    }

    /// Reads `prefix0`, `prefix1`, ... until the first missing index
    fn indexed(&self, prefix: &str) -> Vec<&str> {
        (0..)
            .map_while(|i| self.get(&format!("{prefix}{i}")))
            .collect()
    }
}

/// In memory ini database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: Vec<IniSection>,
}

impl IniFile {
    /// Creates an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses ini text. Lines starting with `;` or `#` are comments,
    /// keys before the first section header are rejected
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let mut ini = IniFile::new();
        let mut current: Option<usize> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(ini.section_index_or_insert(name.trim()));
                continue;
            }
            match (line.split_once('='), current) {
                (Some((key, value)), Some(section)) => {
                    ini.sections[section].set(key.trim(), value.trim());
                }
                _ => {
                    return Err(ConfigError::Syntax {
                        line: idx + 1,
                        text: raw.to_string(),
                    });
                }
            }
        }
        Ok(ini)
    }

    /// Reads and parses an ini file. Environment variables in the path are expanded
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(expand_path(&path.as_ref().to_string_lossy()))?;
        Self::parse(&text)
    }

    /// Looks up a section. Section lookup ignores ASCII case
    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Returns a section for modification, creating it if missing
    pub fn section_mut(&mut self, name: &str) -> &mut IniSection {
        let idx = self.section_index_or_insert(name);
        &mut self.sections[idx]
    }

    /// Copies section `src` of `from` into this database as section `dst`,
    /// replacing whatever `dst` held before
    pub fn copy_section(&mut self, from: &IniFile, src: &str, dst: &str) -> ConfigResult<()> {
        let source = from
            .section(src)
            .ok_or_else(|| ConfigError::MissingSection(src.to_string()))?;
        let target = self.section_mut(dst);
        target.entries = source.entries.clone();
        Ok(())
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name.eq_ignore_ascii_case(name)) {
            Some(idx) => idx,
            None => {
                self.sections.push(IniSection::new(name));
                self.sections.len() - 1
            }
        }
    }
}

impl fmt::Display for IniFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f, "[{}]", section.name)?;
            for (k, v) in &section.entries {
                writeln!(f, "{k}={v}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Parses an unsigned integer the way `strtoul(text, NULL, 0)` does: `0x` prefix is hex,
/// a leading `0` is octal, anything else decimal. Parsing stops at the first invalid
/// character and yields 0 if there are no digits at all.
pub fn parse_c_ulong(text: &str) -> u32 {
    parse_c_long(text) as u32
}

/// Signed variant of [parse_c_ulong]
pub fn parse_c_long(text: &str) -> i64 {
    let t = text.trim();
    let (negative, t) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let (radix, digits) = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        (16, hex)
    } else if t.len() > 1 && t.starts_with('0') {
        (8, &t[1..])
    } else {
        (10, t)
    };
    let mut value: i64 = 0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => value = value.wrapping_mul(radix as i64).wrapping_add(d as i64),
            None => break,
        }
    }
    if negative { value.wrapping_neg() } else { value }
}

/// Expands `~` and `$VAR` / `${VAR}` references. Unknown variables leave the text unchanged
pub fn expand_path(raw: &str) -> String {
    match shellexpand::full(raw) {
        Ok(expanded) => expanded.into_owned(),
        Err(e) => {
            log::warn!("Cannot expand {raw:?}: {e}");
            raw.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Calibration protocol of a connection
pub enum Protocol {
    /// CAN Calibration Protocol
    #[strum(serialize = "CCP")]
    Ccp,
    /// Universal Measurement and Calibration Protocol
    #[strum(serialize = "XCP")]
    Xcp,
}

impl Protocol {
    /// Name of the ini section configuring connection `index`
    pub fn section_name(self, index: usize) -> String {
        format!("{self} Configuration for Target {index}")
    }

    /// Transport connection number of connection `index`. XCP uses 0...3, CCP 4...7
    pub fn transport_connection(self, index: usize) -> usize {
        match self {
            Protocol::Xcp => index,
            Protocol::Ccp => index + 4,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Target quirks selected through the CCP protocol version string
    pub struct CcpQuirks: u8 {
        /// Stop measurement with a single START_STOP instead of START_STOP_ALL ("2.1 ESV1")
        const SINGLE_LIST_STOP = 0x01;
        /// Maintain the DAQ bit of the session status ("2.1 S_STATUS")
        const SESSION_STATUS = 0x02;
    }
}

/// Translates a `Protocol Version` string into `(version, quirks)`.
/// Unknown strings select plain 2.1
pub fn parse_ccp_version(text: &str) -> (u16, CcpQuirks) {
    match text {
        "2.0" => (0x0200, CcpQuirks::empty()),
        "2.1" => (0x0201, CcpQuirks::empty()),
        "2.1 ESV1" => (0x0201, CcpQuirks::SINGLE_LIST_STOP),
        "2.1 S_STATUS" => (0x0201, CcpQuirks::SESSION_STATUS),
        other => {
            log::warn!("Unknown CCP protocol version {other:?}, using 2.1");
            (0x0201, CcpQuirks::empty())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// How a connection answers a seed
pub enum SeedKeyMode {
    /// Target is not protected
    #[default]
    None,
    /// Key is all zeros, for targets that only check that UNLOCK happens
    Simulated,
    /// Key is computed by a vendor library
    Dll,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Which optional record fields are copied onto the local variables
pub struct MetaFlags {
    /// Copy the unit
    pub unit: bool,
    /// Copy the conversion formula
    pub conversion: bool,
    /// Copy the min/max limits
    pub min_max: bool,
}

/// A `v%i` or `p%i` record
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalRecord {
    /// Type name as written, `None` if it is not a known type
    pub kind: Option<ScalarType>,
    /// Variable name
    pub name: String,
    /// Target address
    pub address: u32,
    /// Unit
    pub unit: Option<String>,
    /// Conversion formula
    pub conversion: Option<String>,
    /// Lower limit
    pub min: Option<f64>,
    /// Upper limit
    pub max: Option<f64>,
}

impl SignalRecord {
    /// Parses `type,name,address[,unit[,conversion[,min,max]]]`
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(ConfigError::MissingField(text.to_string()));
        }
        let opt = |i: usize| fields.get(i).map(|s| s.to_string());
        let num = |i: usize| fields.get(i).and_then(|s| s.parse::<f64>().ok());
        let (min, max) = match (num(5), num(6)) {
            (Some(min), Some(max)) => (Some(min), Some(max)),
            _ => (None, None),
        };
        Ok(Self {
            kind: fields[0].parse().ok(),
            name: fields[1].to_string(),
            address: parse_c_ulong(fields[2]),
            unit: opt(3),
            conversion: opt(4),
            min,
            max,
        })
    }

    /// Metadata to attach the local variable with
    pub fn meta(&self, flags: MetaFlags) -> VariableMeta {
        VariableMeta {
            unit: if flags.unit { self.unit.clone() } else { None },
            conversion: if flags.conversion {
                self.conversion.clone().filter(|c| !c.is_empty())
            } else {
                None
            },
            min: if flags.min_max { self.min } else { None },
            max: if flags.min_max { self.max } else { None },
        }
    }
}

/// Reference page handling before a calibration session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationPages {
    /// Copy the ROM image into RAM before calibrating
    pub move_rom_to_ram: bool,
    /// Activate the RAM page before calibrating
    pub select_cal_page: bool,
    /// CCP: ROM start address
    pub rom_start: u32,
    /// CCP: RAM start address
    pub ram_start: u32,
    /// CCP: bytes to copy
    pub size: u32,
    /// XCP: ROM segment
    pub rom_segment: u8,
    /// XCP: ROM page
    pub rom_page: u8,
    /// XCP: RAM segment
    pub ram_segment: u8,
    /// XCP: RAM page
    pub ram_page: u8,
}

/// Settings of a single CCP or XCP connection
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Protocol of the connection
    pub protocol: Protocol,
    /// Log every frame
    pub debug: bool,
    /// CCP version requested from the target (0x0200 or 0x0201)
    pub version: u16,
    /// CCP target quirks
    pub quirks: CcpQuirks,
    /// CAN channel
    pub channel: u8,
    /// Byte order of the target
    pub byte_order: ByteOrder,
    /// Command receive object
    pub cro_id: u32,
    /// Command return message
    pub crm_id: u32,
    /// Data transmission object
    pub dto_id: u32,
    /// 29 bit identifiers
    pub extended_ids: bool,
    /// Acknowledge timeout in milliseconds. 0 waits forever
    pub timeout_ms: u32,
    /// CCP station address
    pub station_address: u16,
    /// DAQ prescaler
    pub prescaler: u16,
    /// DAQ event channel
    pub event_channel: u16,
    /// Seed & key handling
    pub seed_key: SeedKeyMode,
    /// Library computing keys for the DAQ resource
    pub seed_key_dll: String,
    /// Library computing keys for the CAL resource
    pub seed_key_dll_cal: String,
    /// Page handling before calibration
    pub calibration: CalibrationPages,
    /// Upload every parameter again after it has been downloaded
    pub read_parameter_after_calib: bool,
    /// Metadata copied onto local variables
    pub meta: MetaFlags,
    /// Added to every calibration parameter address
    pub param_offset: u32,
    /// `v%i` records
    pub signals: Vec<SignalRecord>,
    /// `p%i` records
    pub parameters: Vec<SignalRecord>,
}

impl ConnectionConfig {
    /// Built in defaults of a protocol
    pub fn defaults(protocol: Protocol) -> Self {
        let cal_default = protocol == Protocol::Ccp;
        Self {
            protocol,
            debug: false,
            version: 0x0201,
            quirks: CcpQuirks::empty(),
            channel: 0,
            byte_order: ByteOrder::LsbFirst,
            cro_id: 0,
            crm_id: 0,
            dto_id: 0,
            extended_ids: false,
            timeout_ms: 500,
            station_address: 0x0039,
            prescaler: 1,
            event_channel: 0,
            seed_key: SeedKeyMode::None,
            seed_key_dll: String::new(),
            seed_key_dll_cal: String::new(),
            calibration: CalibrationPages {
                move_rom_to_ram: cal_default,
                select_cal_page: cal_default,
                ..CalibrationPages::default()
            },
            read_parameter_after_calib: false,
            meta: MetaFlags::default(),
            param_offset: 0,
            signals: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Reads the configuration of connection `index` from `ini`.
    ///
    /// Missing keys take their defaults, malformed `v%i`/`p%i` records are logged and skipped
    pub fn from_ini(ini: &IniFile, protocol: Protocol, index: usize) -> Self {
        let name = protocol.section_name(index);
        let mut cfg = Self::defaults(protocol);
        let Some(section) = ini.section(&name) else {
            log::warn!("No section [{name}], using defaults");
            cfg.param_offset = param_offset_from_env(protocol, index);
            return cfg;
        };
        let cal_default = protocol == Protocol::Ccp;

        match protocol {
            Protocol::Ccp => {
                cfg.debug = section.yes_or("Debug", false);
                let (version, quirks) = parse_ccp_version(&section.string_or("Protocol Version", "2.1"));
                cfg.version = version;
                cfg.quirks = quirks;
            }
            Protocol::Xcp => {
                cfg.debug = section
                    .get("DebugMessages")
                    .is_some_and(|v| v.eq_ignore_ascii_case("yes"));
            }
        }
        cfg.channel = section.int_or("Channel", 0) as u8;
        cfg.byte_order = match section.get("ByteOrder") {
            Some(v) if v.eq_ignore_ascii_case("msb_first") => ByteOrder::MsbFirst,
            _ => ByteOrder::LsbFirst,
        };
        cfg.cro_id = section.ulong_or("CRO_ID", 0);
        cfg.crm_id = section.ulong_or("CRM_ID", 0);
        cfg.dto_id = section.ulong_or("DTO_ID", 0);
        cfg.extended_ids = section.int_or("ExtIds", 0) != 0;
        cfg.timeout_ms = section.int_or("Timeout", 500) as u32;
        cfg.station_address = section.ulong_or("StationAddress", 0x0039) as u16;
        cfg.prescaler = section.int_or("Prescaler", 1) as u16;
        cfg.event_channel = section.int_or("EventChannel", 0) as u16;

        cfg.seed_key_dll = expand_path(&section.string_or("SeedKeyDll", ""));
        match protocol {
            Protocol::Ccp => {
                cfg.seed_key = if cfg.seed_key_dll == "BB" {
                    SeedKeyMode::Simulated
                } else if section.int_or("SeedKeyFlag", 0) != 0 {
                    SeedKeyMode::Dll
                } else {
                    SeedKeyMode::None
                };
                cfg.seed_key_dll_cal = if cfg.version >= 0x0201 {
                    expand_path(&section.string_or("SeedKeyDllCal", ""))
                } else {
                    cfg.seed_key_dll.clone()
                };
            }
            Protocol::Xcp => {
                cfg.seed_key = if cfg.seed_key_dll.is_empty() {
                    SeedKeyMode::None
                } else {
                    SeedKeyMode::Dll
                };
                cfg.seed_key_dll_cal = cfg.seed_key_dll.clone();
            }
        }

        cfg.calibration.move_rom_to_ram = section.yes_or("MoveROM2RAM", cal_default);
        cfg.calibration.select_cal_page = section.yes_or("SelCalPage", cal_default);
        match protocol {
            Protocol::Ccp => {
                cfg.calibration.rom_start = section_address(section, "CalibROMStartAddr");
                cfg.calibration.ram_start = section_address(section, "CalibRAMStartAddr");
                cfg.calibration.size = section_address(section, "CalibROMRAMSize");
            }
            Protocol::Xcp => {
                cfg.calibration.rom_segment = section.ulong_or("CalibROMSegment", 0) as u8;
                cfg.calibration.rom_page = section.ulong_or("CalibROMPageNo", 0) as u8;
                cfg.calibration.ram_segment = section.ulong_or("CalibRAMSegment", 0) as u8;
                cfg.calibration.ram_page = section.ulong_or("CalibRAMPageNo", 0) as u8;
            }
        }
        cfg.read_parameter_after_calib = section.int_or("ReadParameterAfterCalib", 0) != 0;
        cfg.meta = MetaFlags {
            unit: section.yes_or("UseUnit", false),
            conversion: section.yes_or("UseConversion", false),
            min_max: section.yes_or("UseMinMax", false),
        };
        cfg.param_offset = param_offset_from_env(protocol, index);
        cfg.signals = records(section, "v");
        cfg.parameters = records(section, "p");
        cfg
    }

    /// Finds the `v%i` record of a signal
    pub fn signal(&self, name: &str) -> Option<&SignalRecord> {
        self.signals.iter().find(|r| r.name == name)
    }

    /// Finds the `p%i` record of a parameter
    pub fn parameter(&self, name: &str) -> Option<&SignalRecord> {
        self.parameters.iter().find(|r| r.name == name)
    }
}

fn section_address(section: &IniSection, key: &str) -> u32 {
    let raw = expand_path(&section.string_or(key, "0x0"));
    parse_c_ulong(&raw)
}

fn records(section: &IniSection, prefix: &str) -> Vec<SignalRecord> {
    section
        .indexed(prefix)
        .into_iter()
        .filter_map(|line| match SignalRecord::parse(line) {
            Ok(r) => Some(r),
            Err(e) => {
                log::error!("[{}] {e}", section.name());
                None
            }
        })
        .collect()
}

/// Parameter address offset from `ECU_CALIBRATION_<P><n>_PARAM_OFFSET`. Connection 0
/// also accepts `ECU_CALIBRATION_<P>_PARAM_OFFSET`
fn param_offset_from_env(protocol: Protocol, index: usize) -> u32 {
    let specific = format!("ECU_CALIBRATION_{protocol}{index}_PARAM_OFFSET");
    let value = std::env::var(&specific).ok().or_else(|| {
        (index == 0)
            .then(|| std::env::var(format!("ECU_CALIBRATION_{protocol}_PARAM_OFFSET")).ok())
            .flatten()
    });
    value.map(|v| parse_c_ulong(&v)).unwrap_or(0)
}

/// Options of the engine itself
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineOptions {
    /// Period the engine is ticked with
    pub tick_period_ms: u32,
    /// Prefix of the published status variables
    pub status_prefix: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tick_period_ms: 10,
            status_prefix: "CAN".to_string(),
        }
    }
}

impl EngineOptions {
    /// Idle ticks between two alive pings of a calibration only session, about 200ms but
    /// never fewer than 5 ticks
    pub fn alive_ping_ticks(&self) -> u32 {
        (200 / self.tick_period_ms.max(1)).max(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CCP_INI: &str = r#"
; target 0
[CCP Configuration for Target 0]
Protocol Version=2.1 S_STATUS
ByteOrder=msb_first
CRO_ID=0x7E0
CRM_ID=0x7E8
DTO_ID=0x7E9
Timeout=100
StationAddress=0x0020
SeedKeyDll=BB
MoveROM2RAM=no
UseUnit=yes
v0=UWORD,Engine.Rpm,0x1000,rpm
v1=UBYTE,Engine.Load,0x1002
v2=broken
v3=FLOAT,Ignored,0x2000
p0=UWORD,k_gain,0x3000,,x*2,0,100
"#;

    #[test]
    fn c_style_integers() {
        assert_eq!(parse_c_ulong("0x7E8"), 0x7E8);
        assert_eq!(parse_c_ulong("010"), 8);
        assert_eq!(parse_c_ulong("  42abc"), 42);
        assert_eq!(parse_c_ulong(""), 0);
        assert_eq!(parse_c_long("-5"), -5);
    }

    #[test]
    fn reads_ccp_section() {
        let ini = IniFile::parse(CCP_INI).unwrap();
        let cfg = ConnectionConfig::from_ini(&ini, Protocol::Ccp, 0);
        assert_eq!(cfg.version, 0x0201);
        assert_eq!(cfg.quirks, CcpQuirks::SESSION_STATUS);
        assert_eq!(cfg.byte_order, ByteOrder::MsbFirst);
        assert_eq!((cfg.cro_id, cfg.crm_id, cfg.dto_id), (0x7E0, 0x7E8, 0x7E9));
        assert_eq!(cfg.timeout_ms, 100);
        assert_eq!(cfg.station_address, 0x20);
        assert_eq!(cfg.seed_key, SeedKeyMode::Simulated);
        assert!(!cfg.calibration.move_rom_to_ram);
        assert!(cfg.calibration.select_cal_page);

        // broken record is skipped, list stops at the first missing index
        assert_eq!(cfg.signals.len(), 3);
        let rpm = cfg.signal("Engine.Rpm").unwrap();
        assert_eq!(rpm.kind, Some(ScalarType::U16));
        assert_eq!(rpm.address, 0x1000);
        assert_eq!(rpm.meta(cfg.meta).unit.as_deref(), Some("rpm"));

        let gain = cfg.parameter("k_gain").unwrap();
        assert_eq!(gain.min, Some(0.0));
        assert_eq!(gain.max, Some(100.0));
        assert_eq!(gain.meta(cfg.meta).conversion, None);
    }

    #[test]
    fn missing_section_uses_protocol_defaults() {
        let ini = IniFile::new();
        let ccp = ConnectionConfig::from_ini(&ini, Protocol::Ccp, 2);
        let xcp = ConnectionConfig::from_ini(&ini, Protocol::Xcp, 2);
        assert!(ccp.calibration.move_rom_to_ram && ccp.calibration.select_cal_page);
        assert!(!xcp.calibration.move_rom_to_ram && !xcp.calibration.select_cal_page);
        assert_eq!(xcp.timeout_ms, 500);
        assert_eq!(xcp.station_address, 0x39);
    }

    #[test]
    fn xcp_seed_key_follows_library_name() {
        let ini = IniFile::parse(
            "[XCP Configuration for Target 1]\nSeedKeyDll=libseed.so\nCalibRAMSegment=2\nCalibRAMPageNo=1\n",
        )
        .unwrap();
        let cfg = ConnectionConfig::from_ini(&ini, Protocol::Xcp, 1);
        assert_eq!(cfg.seed_key, SeedKeyMode::Dll);
        assert_eq!(cfg.calibration.ram_segment, 2);
        assert_eq!(cfg.calibration.ram_page, 1);
    }

    #[test]
    fn syntax_errors_report_line() {
        match IniFile::parse("[a]\nkey=1\nnonsense\n") {
            Err(ConfigError::Syntax { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn copy_and_render_section() {
        let src = IniFile::parse("[CCP Configuration for Target]\nCRO_ID=0x100\n").unwrap();
        let mut main = IniFile::new();
        main.copy_section(&src, "CCP Configuration for Target", &Protocol::Ccp.section_name(3))
            .unwrap();
        assert_eq!(
            main.section("CCP Configuration for Target 3").unwrap().get("cro_id"),
            Some("0x100")
        );
        let text = main.to_string();
        assert!(text.contains("[CCP Configuration for Target 3]"));
        assert!(text.contains("CRO_ID=0x100"));
    }

    #[test]
    fn alive_ping_threshold() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.alive_ping_ticks(), 20);
        opts.tick_period_ms = 100;
        assert_eq!(opts.alive_ping_ticks(), 5);
    }
}
