//! Software ISO-TP (ISO15765-2) layer
//!
//! This turns a raw [crate::channel::CanChannel] into [crate::channel::PayloadChannel]s,
//! one per ECU, for adapters which do not support ISO-TP natively.
//!
//! * [frame] - Encoding and decoding of the 4 ISO-TP frame types
//! * [reassembly] - Per-peer receive and send state machines
//! * [transport] - The bus reader and the per-peer endpoints

use crate::channel::ChannelError;

pub mod frame;
pub mod reassembly;
pub mod transport;

pub use frame::{FlowStatus, IsoTpFrame};
pub use transport::{IsoTpEndpoint, IsoTpTransport};

/// ISO-TP result
pub type IsoTpResult<T> = Result<T, IsoTpError>;

/// Errors produced by the ISO-TP layer. All of these only affect the session
/// they occurred in
#[derive(Debug, Clone, thiserror::Error)]
pub enum IsoTpError {
    /// Received CAN payload is not a valid ISO-TP frame
    #[error("malformed ISO-TP frame: {0}")]
    MalformedFrame(String),
    /// The frame or payload to send cannot be represented in ISO-TP
    #[error("invalid ISO-TP segment: {0}")]
    InvalidSegment(String),
    /// Consecutive frame arrived out of order
    #[error("consecutive frame out of order. Expected index {expected}, got {received}")]
    SequenceMismatch {
        /// Index the session was waiting for
        expected: u8,
        /// Index that arrived
        received: u8,
    },
    /// Peer stopped sending consecutive frames mid payload
    #[error("reassembly timed out after {received} of {expected} bytes")]
    ReassemblyTimeout {
        /// Bytes received before the timeout
        received: usize,
        /// Declared payload length
        expected: usize,
    },
    /// Receiver aborted the transfer (Overflow), or sent too many Wait frames
    #[error("flow control aborted the transfer ({0})")]
    FlowControlAborted(FlowStatus),
    /// Receiver never answered the first frame or a finished block
    #[error("timeout waiting for flow control")]
    FlowControlTimeout,
    /// An endpoint for this receive ID already exists on the transport
    #[error("an endpoint already listens on 0x{0:03X}")]
    PeerInUse(u32),
    /// Error with the underlying CAN channel
    #[error("CAN channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
}

/// Identifies an ISO-TP peer by its arbitration ID pair
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    /// ID the tester sends on (ECU listens on this ID)
    pub tx_id: u32,
    /// ID the ECU responds on
    pub rx_id: u32,
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IsoTPSettings {
    /// Block size advertised in our flow control frames. 0 lets the sender
    /// transmit every consecutive frame without waiting
    pub block_size: u8,
    /// Minimum separation time advertised in our flow control frames (Raw STmin byte)
    pub st_min: u8,
    /// Pad frames over ISO-TP if data size < 8
    pub pad_frame: bool,
    /// Byte used for padding when `pad_frame` is set
    pub padding_byte: u8,
    /// Does the CAN Network use extended (29bit) identifiers
    pub can_use_ext_addr: bool,
    /// Maximum gap between consecutive frames while receiving before the
    /// session is destroyed (N_Cr)
    pub rx_timeout_ms: u32,
    /// Maximum time to wait for a flow control frame while sending (N_Bs)
    pub fc_timeout_ms: u32,
    /// Number of consecutive Wait flow control frames tolerated before aborting (WFTmax)
    pub max_wait_frames: u8,
}

impl Default for IsoTPSettings {
    fn default() -> Self {
        Self {
            block_size: 8,
            st_min: 10,
            pad_frame: true,
            padding_byte: 0xCC,
            can_use_ext_addr: false,
            rx_timeout_ms: 1000,
            fc_timeout_ms: 1000,
            max_wait_frames: 10,
        }
    }
}

impl IsoTPSettings {
    /// Padding to pass to [IsoTpFrame::encode]
    pub fn padding(&self) -> Option<u8> {
        self.pad_frame.then_some(self.padding_byte)
    }
}
