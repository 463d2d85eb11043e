//! Decoding of the standard ISO14229-1 data identifiers

use std::fmt;

use super::UdsSessionType;
use crate::bcd_to_u8;

/// Standard data identifiers understood by [decode_did]
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum_macros::Display,
    strum_macros::EnumIter,
    serde::Serialize,
)]
pub enum StandardDid {
    /// 0xF186
    ActiveDiagnosticSession,
    /// 0xF187
    SparePartNumber,
    /// 0xF18A
    SystemSupplierIdentifier,
    /// 0xF18B
    EcuManufacturingDate,
    /// 0xF190
    Vin,
    /// 0xF195
    SoftwareVersion,
    /// 0xF1A4
    HardwareVersion,
}

impl From<StandardDid> for u16 {
    fn from(d: StandardDid) -> Self {
        match d {
            StandardDid::ActiveDiagnosticSession => 0xF186,
            StandardDid::SparePartNumber => 0xF187,
            StandardDid::SystemSupplierIdentifier => 0xF18A,
            StandardDid::EcuManufacturingDate => 0xF18B,
            StandardDid::Vin => 0xF190,
            StandardDid::SoftwareVersion => 0xF195,
            StandardDid::HardwareVersion => 0xF1A4,
        }
    }
}

impl TryFrom<u16> for StandardDid {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0xF186 => Ok(Self::ActiveDiagnosticSession),
            0xF187 => Ok(Self::SparePartNumber),
            0xF18A => Ok(Self::SystemSupplierIdentifier),
            0xF18B => Ok(Self::EcuManufacturingDate),
            0xF190 => Ok(Self::Vin),
            0xF195 => Ok(Self::SoftwareVersion),
            0xF1A4 => Ok(Self::HardwareVersion),
            x => Err(x),
        }
    }
}

/// A decoded data identifier value
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum DidValue {
    /// Active session (0xF186)
    Session {
        /// Raw session byte
        id: u8,
        /// Known session, if any
        session: Option<UdsSessionType>,
    },
    /// ASCII identification string
    Text(String),
    /// Calendar date (0xF18B)
    Date {
        /// Year
        year: u16,
        /// Month (1-12)
        month: u8,
        /// Day of month
        day: u8,
    },
    /// Anything else, as lower case hex
    Raw(String),
}

impl fmt::Display for DidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session {
                session: Some(s), ..
            } => write!(f, "{s:?}"),
            Self::Session { id, .. } => write!(f, "0x{id:02X}"),
            Self::Text(s) | Self::Raw(s) => f.write_str(s),
            Self::Date { year, month, day } => write!(f, "{year:04}-{month:02}-{day:02}"),
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// ASCII bytes of the first `max_len` bytes, non ASCII bytes are dropped
fn ascii(data: &[u8], max_len: usize) -> String {
    let s: String = data
        .iter()
        .take(max_len)
        .filter(|b| b.is_ascii())
        .map(|b| *b as char)
        .collect();
    s.trim_end_matches(|c: char| c.is_ascii_whitespace() || c == '\0')
        .to_string()
}

/// Decodes the data of a read data by identifier response (Without the SID and identifier).
///
/// Identifiers this does not know, or data too short for the identifier, come back as [DidValue::Raw]
pub fn decode_did(did: u16, data: &[u8]) -> DidValue {
    let Ok(std_did) = StandardDid::try_from(did) else {
        return DidValue::Raw(hex(data));
    };
    match std_did {
        StandardDid::ActiveDiagnosticSession => match data.first() {
            Some(&id) => DidValue::Session {
                id,
                session: UdsSessionType::from_repr(id),
            },
            None => DidValue::Raw(String::new()),
        },
        StandardDid::SparePartNumber | StandardDid::SoftwareVersion => {
            DidValue::Text(ascii(data, 8))
        }
        StandardDid::SystemSupplierIdentifier | StandardDid::HardwareVersion => {
            DidValue::Text(ascii(data, 10))
        }
        StandardDid::Vin => DidValue::Text(ascii(data, data.len()).trim_start().to_string()),
        StandardDid::EcuManufacturingDate => match data {
            [y_hi, y_lo, m, d, ..] => DidValue::Date {
                year: bcd_to_u8(*y_hi) as u16 * 100 + bcd_to_u8(*y_lo) as u16,
                month: bcd_to_u8(*m),
                day: bcd_to_u8(*d),
            },
            _ => DidValue::Raw(hex(data)),
        },
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn standard_ids_roundtrip() {
        for d in StandardDid::iter() {
            assert_eq!(StandardDid::try_from(u16::from(d)), Ok(d));
        }
        assert_eq!(StandardDid::try_from(0xFD00), Err(0xFD00));
    }

    #[test]
    fn vin() {
        let v = decode_did(0xF190, b"WVWZZZ1JZXW000001");
        assert_eq!(v, DidValue::Text("WVWZZZ1JZXW000001".into()));
    }

    #[test]
    fn part_number_is_truncated_and_trimmed() {
        assert_eq!(
            decode_did(0xF187, b"12345   EXTRA"),
            DidValue::Text("12345".into())
        );
        assert_eq!(
            decode_did(0xF18A, &[b'B', b'O', 0xFF, b'S', b'C', b'H', 0, 0]),
            DidValue::Text("BOSCH".into())
        );
    }

    #[test]
    fn manufacturing_date() {
        let v = decode_did(0xF18B, &[0x20, 0x24, 0x03, 0x15]);
        assert_eq!(
            v,
            DidValue::Date {
                year: 2024,
                month: 3,
                day: 15
            }
        );
        assert_eq!(v.to_string(), "2024-03-15");
        assert_eq!(decode_did(0xF18B, &[0x20, 0x24]), DidValue::Raw("2024".into()));
    }

    #[test]
    fn session() {
        assert_eq!(decode_did(0xF186, &[0x03]).to_string(), "Extended");
        assert_eq!(decode_did(0xF186, &[0x60]).to_string(), "0x60");
    }

    #[test]
    fn unknown_is_hex() {
        assert_eq!(
            decode_did(0xFD00, &[0x01, 0xAB]),
            DidValue::Raw("01ab".into())
        );
    }
}
