//! Per-peer ISO-TP session state.
//!
//! [Reassembler] owns the receive direction for one peer, [TxSession] segments one
//! outgoing payload. Neither does any IO, the [super::transport] module drives them.

use std::{
    cmp::min,
    time::{Duration, Instant},
};

use super::{
    frame::{
        FlowStatus, IsoTpFrame, CONSECUTIVE_FRAME_DATA_LEN, FIRST_FRAME_DATA_LEN,
        MAX_PAYLOAD_LEN, MAX_SINGLE_FRAME_LEN,
    },
    IsoTpError, IsoTpResult,
};

#[derive(Debug)]
pub(crate) struct RxSession {
    pub total_len: usize,
    pub data: Vec<u8>,
    pub next_index: u8,
    pub frames_in_block: u8,
    pub last_rx_time: Instant,
}

/// What the transport has to do after feeding a frame into the [Reassembler]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxAction {
    /// Nothing to do
    None,
    /// A payload is complete
    Completed(Vec<u8>),
    /// A flow control frame must be sent back to the peer
    SendFlowControl(IsoTpFrame),
}

impl RxSession {
    fn start(total_len: usize, first_chunk: &[u8]) -> Self {
        let mut data = Vec::with_capacity(total_len);
        data.extend_from_slice(first_chunk);
        Self {
            total_len,
            data,
            next_index: 1,
            frames_in_block: 0,
            last_rx_time: Instant::now(),
        }
    }

    fn add_consecutive_frame(
        &mut self,
        index: u8,
        s: &[u8],
        block_size: u8,
        st_min: u8,
    ) -> IsoTpResult<RxAction> {
        if index != self.next_index {
            return Err(IsoTpError::SequenceMismatch {
                expected: self.next_index,
                received: index,
            });
        }
        let remaining = self.total_len - self.data.len();
        let max_copy = min(remaining, min(s.len(), CONSECUTIVE_FRAME_DATA_LEN));
        self.data.extend_from_slice(&s[..max_copy]);
        self.next_index = (self.next_index + 1) & 0x0F;
        self.frames_in_block += 1;
        self.last_rx_time = Instant::now();
        if self.data.len() == self.total_len {
            Ok(RxAction::Completed(std::mem::take(&mut self.data)))
        } else if block_size != 0 && self.frames_in_block == block_size {
            self.frames_in_block = 0;
            Ok(RxAction::SendFlowControl(continue_to_send(block_size, st_min)))
        } else {
            Ok(RxAction::None)
        }
    }
}

fn continue_to_send(block_size: u8, st_min: u8) -> IsoTpFrame {
    IsoTpFrame::FlowControl {
        status: FlowStatus::ContinueToSend,
        block_size,
        st_min,
    }
}

/// Receive side state machine for a single peer
#[derive(Debug)]
pub struct Reassembler {
    session: Option<RxSession>,
    block_size: u8,
    st_min: u8,
}

impl Reassembler {
    /// Creates a reassembler which advertises the given block size and STmin
    /// in its flow control frames
    pub fn new(block_size: u8, st_min: u8) -> Self {
        Self {
            session: None,
            block_size,
            st_min,
        }
    }

    /// True while a multi frame payload is being received
    pub fn is_receiving(&self) -> bool {
        self.session.is_some()
    }

    /// Feeds a data frame (Single, First or Consecutive) into the reassembler.
    ///
    /// Flow control frames belong to the send direction and are ignored here.
    /// On error the in-progress session is discarded.
    pub fn on_frame(&mut self, frame: IsoTpFrame) -> IsoTpResult<RxAction> {
        match frame {
            IsoTpFrame::Single(data) => {
                if self.session.take().is_some() {
                    log::warn!("Single frame received mid-transfer, dropping partial payload");
                }
                Ok(RxAction::Completed(data))
            }
            IsoTpFrame::First { total_len, data } => {
                if self.session.is_some() {
                    log::warn!("First frame received mid-transfer, restarting reception");
                }
                self.session = Some(RxSession::start(total_len as usize, &data));
                Ok(RxAction::SendFlowControl(continue_to_send(self.block_size, self.st_min)))
            }
            IsoTpFrame::Consecutive { index, data } => {
                let Some(session) = self.session.as_mut() else {
                    log::debug!("Consecutive frame {index} with no open session, ignoring");
                    return Ok(RxAction::None);
                };
                match session.add_consecutive_frame(index, &data, self.block_size, self.st_min) {
                    Ok(RxAction::Completed(payload)) => {
                        self.session = None;
                        Ok(RxAction::Completed(payload))
                    }
                    Ok(other) => Ok(other),
                    Err(e) => {
                        self.session = None;
                        Err(e)
                    }
                }
            }
            IsoTpFrame::FlowControl { .. } => Ok(RxAction::None),
        }
    }

    /// Destroys the open session if no frame arrived within `timeout`
    pub fn check_timeout(&mut self, timeout: Duration) -> IsoTpResult<()> {
        match &self.session {
            Some(s) if s.last_rx_time.elapsed() > timeout => {
                let received = s.data.len();
                let expected = s.total_len;
                self.session = None;
                Err(IsoTpError::ReassemblyTimeout { received, expected })
            }
            _ => Ok(()),
        }
    }

    /// Drops any in-progress session
    pub fn abort(&mut self) {
        self.session = None;
    }
}

/// Segments one outgoing payload into a first frame followed by consecutive frames
#[derive(Debug)]
pub struct TxSession {
    data: Vec<u8>,
    current_pos: usize,
    next_index: u8,
}

impl TxSession {
    /// Creates a new session. The payload must need more than a single frame
    /// and fit the 12bit ISO-TP length
    pub fn new(data: &[u8]) -> IsoTpResult<Self> {
        if data.len() <= MAX_SINGLE_FRAME_LEN || data.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::InvalidSegment(format!(
                "cannot segment a payload of {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            data: data.to_vec(),
            current_pos: 0,
            next_index: 1,
        })
    }

    /// Returns the first frame. Must be called once, before [TxSession::next_consecutive]
    pub fn first_frame(&mut self) -> IsoTpFrame {
        self.current_pos = FIRST_FRAME_DATA_LEN;
        IsoTpFrame::First {
            total_len: self.data.len() as u16,
            data: self.data[..FIRST_FRAME_DATA_LEN].to_vec(),
        }
    }

    /// Returns the next consecutive frame, or None once everything has been segmented
    pub fn next_consecutive(&mut self) -> Option<IsoTpFrame> {
        if self.is_complete() {
            return None;
        }
        let max_data = min(CONSECUTIVE_FRAME_DATA_LEN, self.data.len() - self.current_pos);
        let frame = IsoTpFrame::Consecutive {
            index: self.next_index,
            data: self.data[self.current_pos..self.current_pos + max_data].to_vec(),
        };
        self.current_pos += max_data;
        self.next_index = (self.next_index + 1) & 0x0F;
        Some(frame)
    }

    /// True once every byte has been placed into a frame
    pub fn is_complete(&self) -> bool {
        self.current_pos >= self.data.len()
    }
}
