//! Software ISO-TP transport.
//!
//! One [IsoTpTransport] owns a [CanChannel] and a background thread which drains it.
//! Every ECU the tester talks to gets its own [IsoTpEndpoint], keyed by the ID the
//! ECU responds on. The reader thread feeds each endpoint's [Reassembler], answers
//! first frames with flow control, and hands complete payloads over through a single
//! slot channel. A payload arriving while the slot is still full waits for it to empty. Flow control frames addressed to an endpoint are forwarded to
//! whichever thread is currently sending on it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use super::{
    frame::{st_min_to_duration, FlowStatus, IsoTpFrame, MAX_SINGLE_FRAME_LEN},
    reassembly::{Reassembler, RxAction, TxSession},
    IsoTPSettings, IsoTpError, IsoTpResult, PeerId,
};
use crate::channel::{CanChannel, CanFrame, ChannelError, PayloadChannel};

/// How long the reader thread blocks on the bus before checking for shutdown and timeouts
const READ_POLL_MS: u32 = 10;
/// Longest time the reader thread waits for an endpoint to take its previous payload
const SLOT_WAIT: Duration = Duration::from_millis(250);
const SLOT_RETRY: Duration = Duration::from_millis(1);
/// Flow control frames queued for a sender. Extra ones are dropped
const FC_QUEUE_LEN: usize = 4;

type FlowControl = (FlowStatus, u8, u8);
type RouteMap = Arc<RwLock<HashMap<u32, PeerRoute>>>;

struct PeerRoute {
    tx_id: u32,
    reassembler: Arc<Mutex<Reassembler>>,
    payload_tx: mpsc::SyncSender<IsoTpResult<Vec<u8>>>,
    fc_tx: mpsc::SyncSender<FlowControl>,
}

impl PeerRoute {
    /// Hands a result to the endpoint. While the slot still holds the previous
    /// result, waits up to [SLOT_WAIT] for the endpoint to take it
    fn deliver(&self, mut res: IsoTpResult<Vec<u8>>, running: &AtomicBool) {
        let deadline = Instant::now() + SLOT_WAIT;
        loop {
            match self.payload_tx.try_send(res) {
                Ok(()) | Err(mpsc::TrySendError::Disconnected(_)) => return,
                Err(mpsc::TrySendError::Full(r)) => {
                    if !running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                        error!(
                            "Payload slot for 0x{:03X} not emptied in time, dropping {r:02X?}",
                            self.tx_id
                        );
                        return;
                    }
                    res = r;
                    std::thread::sleep(SLOT_RETRY);
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_routes(r: &RwLock<HashMap<u32, PeerRoute>>) -> RwLockReadGuard<'_, HashMap<u32, PeerRoute>> {
    r.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_routes(
    r: &RwLock<HashMap<u32, PeerRoute>>,
) -> RwLockWriteGuard<'_, HashMap<u32, PeerRoute>> {
    r.write().unwrap_or_else(PoisonError::into_inner)
}

fn encode_to_can(
    frame: &IsoTpFrame,
    id: u32,
    settings: &IsoTPSettings,
) -> IsoTpResult<CanFrame> {
    let data = frame.encode(settings.padding())?;
    Ok(CanFrame::new(id, &data, settings.can_use_ext_addr))
}

/// Software ISO-TP layer on top of a raw CAN channel.
///
/// Dropping the transport stops the reader thread. Endpoints opened from it then
/// report [ChannelError::Disconnected] on their next read.
pub struct IsoTpTransport {
    channel: Arc<dyn CanChannel>,
    settings: IsoTPSettings,
    routes: RouteMap,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for IsoTpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpTransport")
            .field("settings", &self.settings)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl IsoTpTransport {
    /// Creates a transport and starts its bus reader thread
    pub fn new<C: CanChannel + 'static>(channel: C, settings: IsoTPSettings) -> Self {
        Self::new_shared(Arc::new(channel), settings)
    }

    /// Like [IsoTpTransport::new], but for a channel which is also used elsewhere
    pub fn new_shared(channel: Arc<dyn CanChannel>, settings: IsoTPSettings) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let routes: RouteMap = Arc::new(RwLock::new(HashMap::new()));

        let running_c = running.clone();
        let routes_c = routes.clone();
        let channel_c = channel.clone();
        let reader = std::thread::spawn(move || {
            bus_reader(channel_c, settings, routes_c, running_c);
        });

        Self {
            channel,
            settings,
            routes,
            running,
            reader: Some(reader),
        }
    }

    /// ISO-TP settings in use
    pub fn settings(&self) -> &IsoTPSettings {
        &self.settings
    }

    /// Opens an endpoint for one peer.
    ///
    /// ## Parameters
    /// * tx_id - ID to send payloads on
    /// * rx_id - ID the peer responds on. Only one endpoint may listen on an ID
    pub fn open_endpoint(&self, tx_id: u32, rx_id: u32) -> IsoTpResult<IsoTpEndpoint> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(IsoTpError::Channel(ChannelError::Disconnected));
        }
        let mut routes = write_routes(&self.routes);
        if routes.contains_key(&rx_id) {
            return Err(IsoTpError::PeerInUse(rx_id));
        }
        let reassembler = Arc::new(Mutex::new(Reassembler::new(
            self.settings.block_size,
            self.settings.st_min,
        )));
        let (payload_tx, payload_rx) = mpsc::sync_channel(1);
        let (fc_tx, fc_rx) = mpsc::sync_channel(FC_QUEUE_LEN);
        routes.insert(
            rx_id,
            PeerRoute {
                tx_id,
                reassembler: reassembler.clone(),
                payload_tx,
                fc_tx,
            },
        );
        debug!("Opened ISO-TP endpoint 0x{tx_id:03X} -> 0x{rx_id:03X}");
        Ok(IsoTpEndpoint {
            peer: PeerId { tx_id, rx_id },
            channel: self.channel.clone(),
            settings: self.settings,
            reassembler,
            payload_rx: Mutex::new(payload_rx),
            fc_rx: Mutex::new(fc_rx),
            routes: self.routes.clone(),
        })
    }
}

impl Drop for IsoTpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        write_routes(&self.routes).clear();
    }
}

fn bus_reader(
    channel: Arc<dyn CanChannel>,
    settings: IsoTPSettings,
    routes: RouteMap,
    running: Arc<AtomicBool>,
) {
    let rx_timeout = Duration::from_millis(settings.rx_timeout_ms as u64);
    while running.load(Ordering::Relaxed) {
        match channel.read_frame(READ_POLL_MS) {
            Ok(frame) => on_can_frame(&*channel, &settings, &routes, &running, frame),
            Err(ChannelError::ReadTimeout | ChannelError::BufferEmpty) => {}
            Err(ChannelError::Disconnected) => {
                error!("CAN channel disconnected, stopping ISO-TP reader");
                let mut routes = write_routes(&routes);
                for route in routes.values() {
                    // Endpoints see the disconnect once the route is gone, even with a full slot
                    let _ = route
                        .payload_tx
                        .try_send(Err(IsoTpError::Channel(ChannelError::Disconnected)));
                }
                routes.clear();
                running.store(false, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                error!("CAN read failed: {e}");
                std::thread::sleep(Duration::from_millis(READ_POLL_MS as u64));
            }
        }
        for route in read_routes(&routes).values() {
            // Reassembler lock must be released before delivering
            let timed_out = lock(&route.reassembler).check_timeout(rx_timeout);
            if let Err(e) = timed_out {
                warn!("Receive session from peer of 0x{:03X} failed: {e}", route.tx_id);
                route.deliver(Err(e), &running);
            }
        }
    }
    debug!("ISO-TP reader stopped");
}

fn on_can_frame(
    channel: &dyn CanChannel,
    settings: &IsoTPSettings,
    routes: &RwLock<HashMap<u32, PeerRoute>>,
    running: &AtomicBool,
    frame: CanFrame,
) {
    let routes = read_routes(routes);
    let Some(route) = routes.get(&frame.get_address()) else {
        return;
    };
    let decoded = match IsoTpFrame::decode(frame.get_data()) {
        Ok(f) => f,
        Err(e) => {
            warn!("Ignoring frame on 0x{:03X}: {e}", frame.get_address());
            return;
        }
    };
    debug!("0x{:03X} In  -> {decoded:02X?}", frame.get_address());
    if let IsoTpFrame::FlowControl {
        status,
        block_size,
        st_min,
    } = decoded
    {
        // Only meaningful while a send is waiting on it, stale ones are drained by the sender
        let queued = route.fc_tx.try_send((status, block_size, st_min));
        if let Err(mpsc::TrySendError::Full(_)) = queued {
            debug!("No sender waiting on 0x{:03X}, dropping flow control", route.tx_id);
        }
        return;
    }
    let action = lock(&route.reassembler).on_frame(decoded);
    match action {
        Ok(RxAction::None) => {}
        Ok(RxAction::Completed(payload)) => {
            debug!("0x{:03X} payload complete: {payload:02X?}", frame.get_address());
            route.deliver(Ok(payload), running);
        }
        Ok(RxAction::SendFlowControl(fc)) => {
            let res = encode_to_can(&fc, route.tx_id, settings)
                .and_then(|f| channel.write_frame(&f).map_err(IsoTpError::from));
            if let Err(e) = res {
                error!("Could not send flow control to 0x{:03X}: {e}", route.tx_id);
                lock(&route.reassembler).abort();
                route.deliver(Err(e), running);
            }
        }
        Err(e) => {
            warn!("Receive session on 0x{:03X} failed: {e}", frame.get_address());
            route.deliver(Err(e), running);
        }
    }
}

/// A payload channel to one peer on an [IsoTpTransport]
pub struct IsoTpEndpoint {
    peer: PeerId,
    channel: Arc<dyn CanChannel>,
    settings: IsoTPSettings,
    reassembler: Arc<Mutex<Reassembler>>,
    payload_rx: Mutex<mpsc::Receiver<IsoTpResult<Vec<u8>>>>,
    fc_rx: Mutex<mpsc::Receiver<FlowControl>>,
    routes: RouteMap,
}

impl std::fmt::Debug for IsoTpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpEndpoint")
            .field("peer", &self.peer)
            .finish()
    }
}

impl IsoTpEndpoint {
    /// ID pair of this endpoint
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    fn write_frame(&self, frame: &IsoTpFrame) -> IsoTpResult<()> {
        debug!("0x{:03X} Out -> {frame:02X?}", self.peer.tx_id);
        let f = encode_to_can(frame, self.peer.tx_id, &self.settings)?;
        self.channel.write_frame(&f)?;
        Ok(())
    }

    /// Blocks until the receiver allows the next block. Returns its block size and STmin
    fn await_clear_to_send(&self, fc_rx: &mpsc::Receiver<FlowControl>) -> IsoTpResult<(u8, u8)> {
        let timeout = Duration::from_millis(self.settings.fc_timeout_ms as u64);
        let mut waits = 0u8;
        loop {
            match fc_rx.recv_timeout(timeout) {
                Ok((FlowStatus::ContinueToSend, bs, st_min)) => return Ok((bs, st_min)),
                Ok((FlowStatus::Wait, _, _)) => {
                    waits = waits.saturating_add(1);
                    if waits > self.settings.max_wait_frames {
                        warn!("Peer sent {waits} wait frames, aborting transfer");
                        return Err(IsoTpError::FlowControlAborted(FlowStatus::Wait));
                    }
                    debug!("Peer asked to wait ({waits})");
                }
                Ok((FlowStatus::Overflow, _, _)) => {
                    return Err(IsoTpError::FlowControlAborted(FlowStatus::Overflow));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(IsoTpError::FlowControlTimeout),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(IsoTpError::Channel(ChannelError::Disconnected));
                }
            }
        }
    }
}

impl PayloadChannel for IsoTpEndpoint {
    fn write_bytes(&self, buffer: &[u8]) -> IsoTpResult<()> {
        if buffer.is_empty() {
            return Err(IsoTpError::InvalidSegment("empty payload".into()));
        }
        if buffer.len() <= MAX_SINGLE_FRAME_LEN {
            return self.write_frame(&IsoTpFrame::Single(buffer.to_vec()));
        }
        let mut tx = TxSession::new(buffer)?;
        // Holding the receiver serializes concurrent senders on this endpoint
        let fc_rx = lock(&self.fc_rx);
        while fc_rx.try_recv().is_ok() {}
        self.write_frame(&tx.first_frame())?;
        loop {
            let (bs, st_min) = self.await_clear_to_send(&fc_rx)?;
            let separation = st_min_to_duration(st_min);
            let mut sent_in_block = 0u8;
            while let Some(cf) = tx.next_consecutive() {
                self.write_frame(&cf)?;
                if tx.is_complete() {
                    return Ok(());
                }
                sent_in_block = sent_in_block.wrapping_add(1);
                if bs != 0 && sent_in_block == bs {
                    break;
                }
                if !separation.is_zero() {
                    std::thread::sleep(separation);
                }
            }
        }
    }

    fn read_bytes(&self, timeout: Duration) -> IsoTpResult<Option<Vec<u8>>> {
        match lock(&self.payload_rx).recv_timeout(timeout) {
            Ok(res) => res.map(Some),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(IsoTpError::Channel(ChannelError::Disconnected))
            }
        }
    }

    fn clear_rx_buffer(&self) {
        lock(&self.reassembler).abort();
        let rx = lock(&self.payload_rx);
        while rx.try_recv().is_ok() {}
    }
}

impl Drop for IsoTpEndpoint {
    fn drop(&mut self) {
        write_routes(&self.routes).remove(&self.peer.rx_id);
        debug!("Closed ISO-TP endpoint 0x{:03X}", self.peer.tx_id);
    }
}
