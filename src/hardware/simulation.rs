//! Simulated CAN bus for testing diagnostic servers without hardware

use std::{
    sync::{mpsc, Mutex, PoisonError},
    time::Duration,
};

use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult};

/// Builds cross-connected in-memory CAN channels.
///
/// Whatever one end writes, the other end reads, in order. There is no arbitration
/// and no ID filtering, every frame reaches the other side.
#[derive(Debug, Copy, Clone)]
pub struct SimulationCanBus;

impl SimulationCanBus {
    /// Creates two connected channel ends. The names are only used for logging
    pub fn pair(
        name_a: &'static str,
        name_b: &'static str,
    ) -> (SimulationCanChannel, SimulationCanChannel) {
        let (a_tx, a_rx) = mpsc::channel::<CanFrame>();
        let (b_tx, b_rx) = mpsc::channel::<CanFrame>();
        (
            SimulationCanChannel {
                name: name_a,
                in_queue: Mutex::new(b_rx),
                out_queue: Mutex::new(a_tx),
            },
            SimulationCanChannel {
                name: name_b,
                in_queue: Mutex::new(a_rx),
                out_queue: Mutex::new(b_tx),
            },
        )
    }
}

/// One end of a [SimulationCanBus]
#[derive(Debug)]
pub struct SimulationCanChannel {
    name: &'static str,
    in_queue: Mutex<mpsc::Receiver<CanFrame>>,
    out_queue: Mutex<mpsc::Sender<CanFrame>>,
}

impl CanChannel for SimulationCanChannel {
    fn write_frame(&self, frame: &CanFrame) -> ChannelResult<()> {
        log::debug!("{} Out -> {frame:02X?}", self.name);
        self.out_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(*frame)
            .map_err(|_| ChannelError::Disconnected)
    }

    fn read_frame(&self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        let rx = self.in_queue.lock().unwrap_or_else(PoisonError::into_inner);
        let f = if timeout_ms == 0 {
            rx.try_recv().map_err(|e| match e {
                mpsc::TryRecvError::Empty => ChannelError::BufferEmpty,
                mpsc::TryRecvError::Disconnected => ChannelError::Disconnected,
            })?
        } else {
            rx.recv_timeout(Duration::from_millis(timeout_ms as u64))
                .map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => ChannelError::ReadTimeout,
                    mpsc::RecvTimeoutError::Disconnected => ChannelError::Disconnected,
                })?
        };
        log::debug!("{} In  -> {f:02X?}", self.name);
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_over() {
        let (a, b) = SimulationCanBus::pair("a", "b");
        a.write_frame(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03], false))
            .unwrap();
        let f = b.read_frame(100).unwrap();
        assert_eq!(f.get_address(), 0x7E0);
        assert_eq!(f.get_data(), &[0x02, 0x10, 0x03]);
        assert!(matches!(a.read_frame(0), Err(ChannelError::BufferEmpty)));
        assert!(matches!(a.read_frame(5), Err(ChannelError::ReadTimeout)));
    }

    #[test]
    fn dropped_end_disconnects() {
        let (a, b) = SimulationCanBus::pair("a", "b");
        drop(b);
        assert!(matches!(a.read_frame(5), Err(ChannelError::Disconnected)));
        assert!(matches!(
            a.write_frame(&CanFrame::new(0x7E0, &[0], false)),
            Err(ChannelError::Disconnected)
        ));
    }
}
