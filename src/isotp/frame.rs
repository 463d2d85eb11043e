//! ISO-TP (ISO15765-2) frame codec
//!
//! Converts between raw CAN payload bytes and [IsoTpFrame] values. Only classic CAN
//! (8 byte) frames with normal addressing are handled, so the PCI byte is always the
//! first byte of the CAN payload.

use std::time::Duration;

use super::{IsoTpError, IsoTpResult};

/// Largest payload that fits in a single frame
pub const MAX_SINGLE_FRAME_LEN: usize = 7;
/// Payload bytes carried by a first frame
pub const FIRST_FRAME_DATA_LEN: usize = 6;
/// Payload bytes carried by a consecutive frame
pub const CONSECUTIVE_FRAME_DATA_LEN: usize = 7;
/// Largest payload the 12bit first frame length can describe
pub const MAX_PAYLOAD_LEN: usize = 4095;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Flow status of a flow control frame
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
pub enum FlowStatus {
    /// Receiver is ready, sender may transmit the next block
    ContinueToSend,
    /// Receiver is busy, sender must wait for another flow control frame
    Wait,
    /// Receiver cannot take a payload this large. The transfer is aborted
    Overflow,
}

impl TryFrom<u8> for FlowStatus {
    type Error = IsoTpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::ContinueToSend),
            0x01 => Ok(Self::Wait),
            0x02 => Ok(Self::Overflow),
            x => Err(IsoTpError::MalformedFrame(format!(
                "unknown flow status 0x{x:02X}"
            ))),
        }
    }
}

impl From<FlowStatus> for u8 {
    fn from(fs: FlowStatus) -> Self {
        match fs {
            FlowStatus::ContinueToSend => 0x00,
            FlowStatus::Wait => 0x01,
            FlowStatus::Overflow => 0x02,
        }
    }
}

/// A decoded ISO-TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// A complete payload of up to 7 bytes
    Single(Vec<u8>),
    /// Start of a multi frame payload
    First {
        /// Length of the complete payload
        total_len: u16,
        /// First 6 bytes of the payload
        data: Vec<u8>,
    },
    /// Continuation of a multi frame payload
    Consecutive {
        /// Sequence number (0-15)
        index: u8,
        /// Up to 7 bytes of payload. May include padding on the final frame
        data: Vec<u8>,
    },
    /// Pacing information from the receiver of a multi frame payload
    FlowControl {
        /// Flow status
        status: FlowStatus,
        /// Number of consecutive frames before the next flow control. 0 means no limit
        block_size: u8,
        /// Raw STmin byte. See [st_min_to_duration]
        st_min: u8,
    },
}

impl IsoTpFrame {
    /// Decodes a raw CAN payload into an ISO-TP frame
    pub fn decode(payload: &[u8]) -> IsoTpResult<Self> {
        let pci = *payload
            .first()
            .ok_or_else(|| IsoTpError::MalformedFrame("empty frame".into()))?;
        match pci & 0xF0 {
            PCI_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > MAX_SINGLE_FRAME_LEN {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "single frame length {len} out of range"
                    )));
                }
                if len > payload.len() - 1 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "single frame declares {len} bytes but carries {}",
                        payload.len() - 1
                    )));
                }
                Ok(Self::Single(payload[1..1 + len].to_vec()))
            }
            PCI_FIRST => {
                if payload.len() < 8 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "first frame is {} bytes, expected 8",
                        payload.len()
                    )));
                }
                let total_len = (((pci & 0x0F) as u16) << 8) | payload[1] as u16;
                if total_len == 0 {
                    // 32bit length escape, payloads over 4095 bytes are not supported
                    return Err(IsoTpError::MalformedFrame(format!(
                        "first frame length exceeds {MAX_PAYLOAD_LEN}"
                    )));
                }
                if (total_len as usize) <= MAX_SINGLE_FRAME_LEN {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "first frame declares {total_len} bytes, which fits a single frame"
                    )));
                }
                Ok(Self::First {
                    total_len,
                    data: payload[2..8].to_vec(),
                })
            }
            PCI_CONSECUTIVE => {
                if payload.len() < 2 {
                    return Err(IsoTpError::MalformedFrame(
                        "consecutive frame without data".into(),
                    ));
                }
                Ok(Self::Consecutive {
                    index: pci & 0x0F,
                    data: payload[1..].to_vec(),
                })
            }
            PCI_FLOW_CONTROL => {
                if payload.len() < 3 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "flow control frame is {} bytes, expected at least 3",
                        payload.len()
                    )));
                }
                Ok(Self::FlowControl {
                    status: FlowStatus::try_from(pci & 0x0F)?,
                    block_size: payload[1],
                    st_min: payload[2],
                })
            }
            _ => Err(IsoTpError::MalformedFrame(format!(
                "unknown PCI type 0x{pci:02X}"
            ))),
        }
    }

    /// Encodes the frame into raw CAN payload bytes.
    ///
    /// If `padding` is set, the frame is padded to 8 bytes with that value
    pub fn encode(&self, padding: Option<u8>) -> IsoTpResult<Vec<u8>> {
        let mut tx = Vec::with_capacity(8);
        match self {
            Self::Single(data) => {
                if data.is_empty() || data.len() > MAX_SINGLE_FRAME_LEN {
                    return Err(IsoTpError::InvalidSegment(format!(
                        "single frame cannot carry {} bytes",
                        data.len()
                    )));
                }
                tx.push(PCI_SINGLE | data.len() as u8);
                tx.extend_from_slice(data);
            }
            Self::First { total_len, data } => {
                let len = *total_len as usize;
                if len <= MAX_SINGLE_FRAME_LEN || len > MAX_PAYLOAD_LEN {
                    return Err(IsoTpError::InvalidSegment(format!(
                        "first frame length {len} out of range"
                    )));
                }
                if data.len() != FIRST_FRAME_DATA_LEN {
                    return Err(IsoTpError::InvalidSegment(format!(
                        "first frame must carry {FIRST_FRAME_DATA_LEN} bytes, got {}",
                        data.len()
                    )));
                }
                tx.push(PCI_FIRST | ((len >> 8) & 0x0F) as u8);
                tx.push((len & 0xFF) as u8);
                tx.extend_from_slice(data);
            }
            Self::Consecutive { index, data } => {
                if *index > 0x0F {
                    return Err(IsoTpError::InvalidSegment(format!(
                        "consecutive frame index {index} out of range"
                    )));
                }
                if data.is_empty() || data.len() > CONSECUTIVE_FRAME_DATA_LEN {
                    return Err(IsoTpError::InvalidSegment(format!(
                        "consecutive frame cannot carry {} bytes",
                        data.len()
                    )));
                }
                tx.push(PCI_CONSECUTIVE | index);
                tx.extend_from_slice(data);
            }
            Self::FlowControl {
                status,
                block_size,
                st_min,
            } => {
                tx.push(PCI_FLOW_CONTROL | u8::from(*status));
                tx.push(*block_size);
                tx.push(*st_min);
            }
        }
        if let Some(pad) = padding {
            tx.resize(8, pad);
        }
        Ok(tx)
    }
}

/// Converts a raw STmin byte into a duration.
///
/// * 0x00-0x7F - 0-127 milliseconds
/// * 0xF1-0xF9 - 100-900 microseconds
/// * Reserved values are treated as 127ms, as required by ISO15765-2
pub fn st_min_to_duration(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}
