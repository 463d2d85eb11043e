//! Module for common Diagnostic trouble code data
//!
//! [DtcDecoder] turns the raw 4 byte records an ECU reports (3 byte code + status byte)
//! into [DtcRecord]s, describing each code through a [DtcTable]. Codes missing from
//! the table still decode, with a placeholder description.

use std::{collections::HashMap, path::Path};

use crate::{config::ConfigError, DiagError, DiagServerResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
/// DTC name interpretation format specifier
pub enum DTCFormatType {
    /// ISO15031-6 DTC Format
    ISO15031_6,
    /// ISO14229-1 DTC Format
    ISO14229_1,
    /// SAEJ1939-73 DTC Format
    SAEJ1939_73,
    /// ISO11992-4 DTC Format
    ISO11992_4,
    /// Unknown DTC Format
    UNKNOWN(u8),
}

pub(crate) fn dtc_format_from_uds(fmt: u8) -> DTCFormatType {
    match fmt {
        0x00 => DTCFormatType::ISO15031_6,
        0x01 => DTCFormatType::ISO14229_1,
        0x02 => DTCFormatType::SAEJ1939_73,
        0x03 => DTCFormatType::ISO11992_4,
        x => DTCFormatType::UNKNOWN(x),
    }
}

bitflags::bitflags! {
    /// DTC status byte (ISO14229-1 D.2)
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
    pub struct DtcStatusMask: u8 {
        /// Most recent test result was a failure
        const TEST_FAILED = 0x01;
        /// Test failed during the current operation cycle
        const TEST_FAILED_THIS_OPERATION_CYCLE = 0x02;
        /// Failed during the current or last completed operation cycle
        const PENDING_DTC = 0x04;
        /// Failure confirmed and stored
        const CONFIRMED_DTC = 0x08;
        /// Test has not completed since DTCs were last cleared
        const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR = 0x10;
        /// Test failed at least once since DTCs were last cleared
        const TEST_FAILED_SINCE_LAST_CLEAR = 0x20;
        /// Test has not completed this operation cycle
        const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE = 0x40;
        /// ECU requests the warning indicator (MIL)
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
    serde::Serialize,
)]
/// Storage state of the DTC
pub enum DTCStatus {
    /// No DTC is stored in non volatile memory
    None,
    /// DTC has not met criteria for it to become active or stored,
    /// but a failure condition has been met
    Pending,
    /// DTC is no longer present, but is stored in non volatile memory
    Stored,
    /// DTC is present and stored in non volatile memory
    Active,
}

impl From<DtcStatusMask> for DTCStatus {
    fn from(s: DtcStatusMask) -> Self {
        if s.contains(DtcStatusMask::TEST_FAILED | DtcStatusMask::CONFIRMED_DTC) {
            Self::Active
        } else if s.contains(DtcStatusMask::CONFIRMED_DTC) {
            Self::Stored
        } else if s.contains(DtcStatusMask::PENDING_DTC) {
            Self::Pending
        } else {
            Self::None
        }
    }
}

/// Category letter of an ISO15031-6 code
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
    serde::Serialize,
)]
pub enum DtcCategory {
    /// P - Powertrain
    #[strum(serialize = "P")]
    Powertrain,
    /// C - Chassis
    #[strum(serialize = "C")]
    Chassis,
    /// B - Body
    #[strum(serialize = "B")]
    Body,
    /// U - Network
    #[strum(serialize = "U")]
    Network,
}

/// A decoded diagnostic trouble code
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DtcRecord {
    /// Raw 3 byte code
    pub code: [u8; 3],
    /// Status byte
    pub status: DtcStatusMask,
    /// Description from the [DtcTable], or a placeholder
    pub description: String,
    /// True if the table did not know the code
    pub unknown_code: bool,
    /// Storage state derived from the status
    pub state: DTCStatus,
}

impl DtcRecord {
    /// Code as a 24bit number
    pub fn raw(&self) -> u32 {
        u32::from_be_bytes([0, self.code[0], self.code[1], self.code[2]])
    }

    /// Code as 6 upper case hex digits
    pub fn code_hex(&self) -> String {
        format!("{:06X}", self.raw())
    }

    /// ISO15031-6 category of the code
    pub fn category(&self) -> DtcCategory {
        match self.code[0] >> 6 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// ISO15031-6 display form with failure type, for example `C1234-56`
    pub fn display_code(&self) -> String {
        format!(
            "{}{:01X}{:01X}{:02X}-{:02X}",
            self.category(),
            (self.code[0] >> 4) & 0x03,
            self.code[0] & 0x0F,
            self.code[1],
            self.code[2]
        )
    }

    /// Indication if the DTC turns on the MIL lamp (Malfunction indicator lamp)
    pub fn mil_on(&self) -> bool {
        self.status.contains(DtcStatusMask::WARNING_INDICATOR_REQUESTED)
    }

    /// Names of the status bits which are set
    pub fn status_flags(&self) -> Vec<&'static str> {
        self.status.iter_names().map(|(name, _)| name).collect()
    }
}

/// Descriptions of DTC codes, keyed by the 24bit code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtcTable {
    entries: HashMap<u32, String>,
}

fn parse_code(key: &str) -> Result<u32, ConfigError> {
    let hex = key
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    match u32::from_str_radix(hex, 16) {
        Ok(c) if c <= 0xFF_FFFF => Ok(c),
        _ => Err(ConfigError::Invalid(format!("'{key}' is not a 24bit hex DTC code"))),
    }
}

impl DtcTable {
    /// Loads a table from JSON of the form `{"0xC12387": "Description", ...}`
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: HashMap<String, String> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .map(|(k, v)| parse_code(&k).map(|c| (c, v)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        log::debug!("Loaded {} DTC descriptions", entries.len());
        Ok(Self { entries })
    }

    /// Loads a table from a JSON file. See [DtcTable::from_json_str]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Adds or replaces a description
    pub fn insert(&mut self, code: u32, desc: impl Into<String>) {
        self.entries.insert(code & 0xFF_FFFF, desc.into());
    }

    /// Description of a code
    pub fn get(&self, code: u32) -> Option<&str> {
        self.entries.get(&code).map(String::as_str)
    }

    /// Number of known codes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decodes raw DTC records
#[derive(Debug, Clone, Default)]
pub struct DtcDecoder {
    table: DtcTable,
}

impl DtcDecoder {
    /// Creates a decoder describing codes with `table`
    pub fn new(table: DtcTable) -> Self {
        Self { table }
    }

    /// Table in use
    pub fn table(&self) -> &DtcTable {
        &self.table
    }

    /// Decodes one code and its status byte. Never fails, unknown codes get a
    /// placeholder description and [DtcRecord::unknown_code] set
    pub fn decode(&self, code: [u8; 3], status: u8) -> DtcRecord {
        let status = DtcStatusMask::from_bits_retain(status);
        let raw = u32::from_be_bytes([0, code[0], code[1], code[2]]);
        let (description, unknown_code) = match self.table.get(raw) {
            Some(d) => (d.to_string(), false),
            None => (format!("DTC {raw:06X}"), true),
        };
        DtcRecord {
            code,
            status,
            description,
            unknown_code,
            state: status.into(),
        }
    }

    /// Decodes a list of 4 byte records (3 byte code, status byte)
    pub fn decode_records(&self, records: &[u8]) -> DiagServerResult<Vec<DtcRecord>> {
        if records.len() % 4 != 0 {
            return Err(DiagError::InvalidResponseLength); // Each DTC should be 4 bytes!
        }
        Ok(records
            .chunks_exact(4)
            .map(|r| self.decode([r[0], r[1], r[2]], r[3]))
            .collect())
    }
}
