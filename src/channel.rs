//! Module for the communication channels the diagnostic stack runs on
//!
//! Two channel types are defined:
//! * [CanChannel] - Raw CAN access. This is supplied by whatever adapter driver is in use
//! (SocketCAN, a serial adapter, ...) and is the only thing the stack needs from hardware.
//! * [PayloadChannel] - A channel carrying complete diagnostic payloads. This is what the
//! [crate::uds::UdsDiagnosticServer] talks to. [crate::isotp::IsoTpEndpoint] implements it
//! on top of a [CanChannel].

use std::time::Duration;

use crate::isotp::IsoTpResult;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    #[error("channel's Receive buffer is empty")]
    BufferEmpty,
    /// The channel's Tx buffer is full
    #[error("channel's Transmit buffer is full")]
    BufferFull,
    /// The other end of the channel has gone away
    #[error("channel is disconnected")]
    Disconnected,
    /// Underlying driver error
    #[error("channel error: {0}")]
    Other(String),
}

/// Maximum 11bit CAN identifier
pub const CAN_STD_ID_MASK: u32 = 0x7FF;
/// Maximum 29bit CAN identifier
pub const CAN_EXT_ID_MASK: u32 = 0x1FFF_FFFF;

/// A classic CAN frame (Up to 8 data bytes)
#[derive(Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:03X}", self.id))
            .field("data", &format_args!("{:02X?}", self.get_data()))
            .field("ext", &self.ext)
            .finish()
    }
}

impl CanFrame {
    /// Creates a new CAN frame.
    ///
    /// ## Parameters
    /// * id - Arbitration ID. Masked to 11 or 29 bits depending on `ext`
    /// * data - Frame payload. Anything past the 8th byte is dropped
    /// * ext - True if the frame uses an extended (29bit) identifier
    pub fn new(id: u32, data: &[u8], ext: bool) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        let mask = if ext { CAN_EXT_ID_MASK } else { CAN_STD_ID_MASK };
        Self {
            id: id & mask,
            dlc: dlc as u8,
            data: buf,
            ext,
        }
    }

    /// Arbitration ID of the frame
    pub fn get_address(&self) -> u32 {
        self.id
    }

    /// Data bytes of the frame
    pub fn get_data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Returns true if the frame uses a 29bit identifier
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

/// Raw CAN access provided by an adapter driver.
///
/// Implementations are expected to preserve frame order per arbitration ID. Both
/// functions take `&self` so the bus reader and writers can share the channel.
pub trait CanChannel: Send + Sync {
    /// Writes a single frame to the bus
    fn write_frame(&self, frame: &CanFrame) -> ChannelResult<()>;

    /// Reads the next frame from the bus.
    ///
    /// ## Parameters
    /// * timeout_ms - Maximum time to block. A value of 0 returns immediately with
    /// [ChannelError::BufferEmpty] if nothing is queued, otherwise [ChannelError::ReadTimeout]
    /// is returned once the timeout expires
    fn read_frame(&self, timeout_ms: u32) -> ChannelResult<CanFrame>;
}

/// A channel carrying complete (reassembled) diagnostic payloads to and from one ECU
pub trait PayloadChannel: Send + Sync {
    /// Sends a complete payload to the ECU. Blocks until the last frame is on the bus
    fn write_bytes(&self, buffer: &[u8]) -> IsoTpResult<()>;

    /// Waits up to `timeout` for the next complete payload from the ECU.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. Transport failures on the
    /// receive side (sequence errors, reassembly timeouts) are returned as errors
    fn read_bytes(&self, timeout: Duration) -> IsoTpResult<Option<Vec<u8>>>;

    /// Discards any in-progress receive session and any payload waiting to be read
    fn clear_rx_buffer(&self);
}
