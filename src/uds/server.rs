//! The UDS request/response engine

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use automotive_diag::uds::UdsCommand;
use log::{debug, error, warn};

use super::{
    sid, NrcTable, SessionState, UdsError, UdsRequest, UdsResponse, UdsServerOptions,
    UdsSessionType, NEGATIVE_RESPONSE_SID, NRC_RESPONSE_PENDING, SUPPRESS_POSITIVE_RESPONSE,
};
use crate::{
    channel::PayloadChannel,
    isotp::{IsoTpEndpoint, IsoTpError, IsoTpTransport},
    DiagError, DiagServerResult,
};

/// Longest time a waiting request goes without checking for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(10);

const IDLE: u8 = 0;
const IN_FLIGHT: u8 = 1;
const CANCELLED: u8 = 2;

const NRC_INVALID_KEY: u8 = UdsError::InvalidKey as u8;
const NRC_EXCEEDED_ATTEMPTS: u8 = UdsError::ExceedNumberOfAttempts as u8;

enum Correlation {
    Response(UdsResponse),
    Pending,
    Unrelated,
}

/// Holds the single in-flight slot of a server until dropped
struct InFlightGuard<'a>(&'a AtomicU8);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(IDLE, Ordering::Release);
    }
}

/// UDS Diagnostic server
///
/// Only one request can be outstanding at a time. Every function takes `&self`, so the
/// server can be shared between threads (For example to call
/// [UdsDiagnosticServer::cancel_request] from a UI thread).
pub struct UdsDiagnosticServer<P: PayloadChannel> {
    channel: P,
    options: UdsServerOptions,
    nrc_table: NrcTable,
    state: Mutex<SessionState>,
    request_state: AtomicU8,
}

impl<P: PayloadChannel> std::fmt::Debug for UdsDiagnosticServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsDiagnosticServer")
            .field("options", &self.options)
            .field("state", &*self.state())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl UdsDiagnosticServer<IsoTpEndpoint> {
    /// Creates a new UDS server over an ISO-TP connection with the ECU, using
    /// the IDs from `options`
    pub fn new_over_iso_tp(
        transport: &IsoTpTransport,
        options: UdsServerOptions,
    ) -> DiagServerResult<Self> {
        let endpoint = transport.open_endpoint(options.send_id, options.recv_id)?;
        Ok(Self::new(endpoint, options))
    }
}

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Creates a new UDS server on an existing payload channel
    pub fn new(channel: P, options: UdsServerOptions) -> Self {
        Self {
            channel,
            options,
            nrc_table: NrcTable::default(),
            state: Mutex::new(SessionState::default()),
            request_state: AtomicU8::new(IDLE),
        }
    }

    /// Replaces the table used to describe negative response codes
    pub fn with_nrc_table(mut self, table: NrcTable) -> Self {
        self.nrc_table = table;
        self
    }

    /// Returns the current settings used by the UDS Server
    pub fn get_settings(&self) -> UdsServerOptions {
        self.options
    }

    /// Table used to describe negative response codes
    pub fn nrc_table(&self) -> &NrcTable {
        &self.nrc_table
    }

    /// Snapshot of the session and security state of the connection
    pub fn session_state(&self) -> SessionState {
        self.state().clone()
    }

    /// Forgets the session and security state (Back to Default / Locked) and clears
    /// any security lockout. Use after the ECU was power cycled
    pub fn reset_session(&self) {
        debug!("Resetting session state");
        self.state().reset();
    }

    /// True while a request is waiting for its response
    pub fn is_busy(&self) -> bool {
        self.request_state.load(Ordering::Acquire) != IDLE
    }

    /// Makes the request currently waiting for a response return [DiagError::Cancelled].
    ///
    /// Returns false if no request was in flight
    pub fn cancel_request(&self) -> bool {
        let cancelled = self
            .request_state
            .compare_exchange(IN_FLIGHT, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            debug!("Cancelling in-flight request");
        }
        cancelled
    }

    /// Sends a request and waits up to the configured response timeout for the
    /// correlated response. Negative responses are returned as [UdsResponse::Negative]
    pub fn request(&self, req: &UdsRequest) -> DiagServerResult<UdsResponse> {
        self.request_with_timeout(
            req,
            Duration::from_millis(self.options.response_timeout_ms as u64),
        )
    }

    /// Like [UdsDiagnosticServer::request], with an explicit response timeout.
    /// Useful for routines which take many seconds to answer
    pub fn request_with_timeout(
        &self,
        req: &UdsRequest,
        timeout: Duration,
    ) -> DiagServerResult<UdsResponse> {
        if req.service == sid(UdsCommand::SecurityAccess) {
            self.state().check_security_allowed()?;
        }
        let _guard = self.reserve()?;
        self.send(req)?;
        let res = self.await_response(req, timeout);
        if let Err(DiagError::Transport(e)) = &res {
            self.on_transport_error(e);
        }
        let resp = res?;
        self.track_state(req, &resp)?;
        Ok(resp)
    }

    /// Sends a request the ECU will not answer (Suppressed positive response)
    pub fn send_no_response(&self, req: &UdsRequest) -> DiagServerResult<()> {
        let _guard = self.reserve()?;
        self.send(req)?;
        if req.service == sid(UdsCommand::DiagnosticSessionControl) {
            let session = req
                .sub_function
                .and_then(|s| UdsSessionType::from_repr(s & !SUPPRESS_POSITIVE_RESPONSE));
            if let Some(session) = session {
                debug!("Assuming session change to {session:?} was accepted");
                self.state().on_session_change(session);
            }
        }
        Ok(())
    }

    /// Sends a request and returns the data of the positive response.
    /// Negative responses become [DiagError::ECUError]
    pub fn send_command_with_response(&self, req: UdsRequest) -> DiagServerResult<Vec<u8>> {
        let resp = self.request(&req)?;
        self.positive_data(resp)
    }

    /// [UdsDiagnosticServer::send_command_with_response] with an explicit response timeout
    pub fn send_command_with_timeout(
        &self,
        req: UdsRequest,
        timeout: Duration,
    ) -> DiagServerResult<Vec<u8>> {
        let resp = self.request_with_timeout(&req, timeout)?;
        self.positive_data(resp)
    }

    fn positive_data(&self, resp: UdsResponse) -> DiagServerResult<Vec<u8>> {
        match resp {
            UdsResponse::Positive { data, .. } => Ok(data),
            UdsResponse::Negative { nrc, .. } => Err(DiagError::ECUError {
                code: nrc,
                def: Some(self.nrc_table.describe(nrc)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self) -> DiagServerResult<InFlightGuard<'_>> {
        self.request_state
            .compare_exchange(IDLE, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DiagError::RequestInFlight)?;
        Ok(InFlightGuard(&self.request_state))
    }

    fn send(&self, req: &UdsRequest) -> DiagServerResult<()> {
        self.channel.clear_rx_buffer();
        let bytes = req.to_bytes();
        debug!("Sending req to ECU: {bytes:02X?}");
        self.channel.write_bytes(&bytes).map_err(|e| {
            error!("Channel send error: {e}");
            self.on_transport_error(&e);
            DiagError::from(e)
        })
    }

    fn on_transport_error(&self, e: &IsoTpError) {
        if matches!(e, IsoTpError::Channel(_)) {
            warn!("Connection to ECU lost, assuming default session");
            self.state().reset();
        }
    }

    fn correlate(&self, req: &UdsRequest, payload: &[u8]) -> Correlation {
        let service = req.service;
        match payload {
            [NEGATIVE_RESPONSE_SID, s, nrc, ..] if *s == service => {
                if *nrc == NRC_RESPONSE_PENDING {
                    Correlation::Pending
                } else {
                    Correlation::Response(UdsResponse::Negative { service, nrc: *nrc })
                }
            }
            [r, body @ ..] if *r == service.wrapping_add(0x40) => {
                // Too short to carry the echoed header counts as not ours
                let echo = req.echo();
                match body.strip_prefix(echo.as_slice()) {
                    Some(data) => Correlation::Response(UdsResponse::Positive {
                        service,
                        data: data.to_vec(),
                    }),
                    None => Correlation::Unrelated,
                }
            }
            _ => Correlation::Unrelated,
        }
    }

    fn await_response(&self, req: &UdsRequest, timeout: Duration) -> DiagServerResult<UdsResponse> {
        let mut deadline = Instant::now() + timeout;
        let mut pending_count = 0;
        loop {
            if self.request_state.load(Ordering::Acquire) == CANCELLED {
                self.channel.clear_rx_buffer();
                debug!("Request 0x{:02X} cancelled", req.service);
                return Err(DiagError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Timeout waiting for response to 0x{:02X}", req.service);
                return Err(DiagError::ResponseTimeout);
            }
            let Some(payload) = self.channel.read_bytes(CANCEL_POLL.min(deadline - now))? else {
                continue;
            };
            debug!("ECU Response: {payload:02X?}");
            match self.correlate(req, &payload) {
                Correlation::Response(resp) => return Ok(resp),
                Correlation::Pending => {
                    pending_count += 1;
                    if pending_count > self.options.max_pending_extensions {
                        warn!("ECU stayed busy after {pending_count} response pending messages");
                        return Err(DiagError::ResponseTimeout);
                    }
                    debug!("ECU is busy, awaiting response");
                    deadline =
                        Instant::now() + Duration::from_millis(self.options.pending_timeout_ms as u64);
                }
                Correlation::Unrelated => {
                    warn!("{}", DiagError::UnexpectedResponse(payload));
                }
            }
        }
    }

    /// Applies the session / security transitions caused by a response
    fn track_state(&self, req: &UdsRequest, resp: &UdsResponse) -> DiagServerResult<()> {
        let Some(sub) = req.sub_function.map(|s| s & !SUPPRESS_POSITIVE_RESPONSE) else {
            return Ok(());
        };
        let mut state = self.state();
        if req.service == sid(UdsCommand::DiagnosticSessionControl) {
            if resp.is_positive() {
                match UdsSessionType::from_repr(sub) {
                    Some(session) => {
                        debug!("Diagnostic session is now {session:?}");
                        state.on_session_change(session);
                    }
                    None => warn!("ECU accepted unknown session 0x{sub:02X}"),
                }
            }
        } else if req.service == sid(UdsCommand::ECUReset) {
            if resp.is_positive() {
                debug!("ECU reset, back to default session");
                state.reset();
            }
        } else if req.service == sid(UdsCommand::SecurityAccess) {
            let seed_request = sub % 2 == 1;
            match resp {
                UdsResponse::Positive { data, .. } if seed_request => state.on_seed(sub, data),
                UdsResponse::Positive { .. } => state.on_key_accepted(sub.saturating_sub(1)),
                UdsResponse::Negative { nrc, .. } if *nrc == NRC_EXCEEDED_ATTEMPTS => {
                    warn!("ECU reports exceeded security attempts");
                    state.on_attempts_exceeded();
                    return Err(DiagError::SecurityLockout);
                }
                UdsResponse::Negative { nrc, .. } if *nrc == NRC_INVALID_KEY && !seed_request => {
                    if state.on_invalid_key(self.options.security_retry_limit) {
                        warn!(
                            "{} invalid keys in a row, security access locked out",
                            state.invalid_key_count
                        );
                        return Err(DiagError::SecurityLockout);
                    }
                }
                UdsResponse::Negative { .. } => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::isotp::IsoTpResult;

    /// Payload channel answering each write with a scripted list of payloads
    #[derive(Default)]
    struct ScriptedChannel {
        script: Mutex<VecDeque<Vec<Vec<u8>>>>,
        rx: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedChannel {
        fn answer(self, resp: &[&[u8]]) -> Self {
            self.script
                .lock()
                .unwrap()
                .push_back(resp.iter().map(|r| r.to_vec()).collect());
            self
        }
    }

    impl PayloadChannel for Arc<ScriptedChannel> {
        fn write_bytes(&self, buffer: &[u8]) -> IsoTpResult<()> {
            self.sent.lock().unwrap().push(buffer.to_vec());
            if let Some(resp) = self.script.lock().unwrap().pop_front() {
                self.rx.lock().unwrap().extend(resp);
            }
            Ok(())
        }

        fn read_bytes(&self, timeout: Duration) -> IsoTpResult<Option<Vec<u8>>> {
            let r = self.rx.lock().unwrap().pop_front();
            if r.is_none() {
                std::thread::sleep(timeout);
            }
            Ok(r)
        }

        fn clear_rx_buffer(&self) {
            self.rx.lock().unwrap().clear();
        }
    }

    fn server(
        ch: ScriptedChannel,
    ) -> (UdsDiagnosticServer<Arc<ScriptedChannel>>, Arc<ScriptedChannel>) {
        let ch = Arc::new(ch);
        let opts = UdsServerOptions {
            response_timeout_ms: 50,
            pending_timeout_ms: 50,
            max_pending_extensions: 2,
            security_retry_limit: 2,
            ..Default::default()
        };
        (UdsDiagnosticServer::new(ch.clone(), opts), ch)
    }

    fn rdbi(did: u16) -> UdsRequest {
        UdsRequest::new(UdsCommand::ReadDataByIdentifier, None, &did.to_be_bytes())
    }

    #[test]
    fn positive_response_strips_echo() {
        let (s, ch) = server(ScriptedChannel::default().answer(&[&[0x62, 0xF1, 0x90, b'W', b'0']]));
        let resp = s.request(&rdbi(0xF190)).unwrap();
        assert_eq!(
            resp,
            UdsResponse::Positive {
                service: 0x22,
                data: b"W0".to_vec()
            }
        );
        assert_eq!(ch.sent.lock().unwrap()[0], vec![0x22, 0xF1, 0x90]);
        assert!(!s.is_busy());
    }

    #[test]
    fn unrelated_payloads_are_skipped() {
        let (s, _) = server(ScriptedChannel::default().answer(&[
            &[0x50, 0x03],
            &[0x62, 0xF1, 0x87, 0x01],
            &[0x7F, 0x10, 0x11],
            &[0x62, 0xF1, 0x90, 0x02],
        ]));
        let resp = s.request(&rdbi(0xF190)).unwrap();
        assert_eq!(
            resp,
            UdsResponse::Positive {
                service: 0x22,
                data: vec![0x02]
            }
        );
    }

    #[test]
    fn no_response_times_out_and_releases() {
        let (s, _) = server(ScriptedChannel::default());
        assert!(matches!(
            s.request(&rdbi(0xF190)),
            Err(DiagError::ResponseTimeout)
        ));
        assert!(!s.is_busy());
        assert!(!s.cancel_request());
    }

    #[test]
    fn response_pending_extends_until_limit() {
        let (s, _) = server(
            ScriptedChannel::default()
                .answer(&[&[0x7F, 0x22, 0x78], &[0x7F, 0x22, 0x78], &[0x62, 0xF1, 0x90, 0x01]])
                .answer(&[&[0x7F, 0x22, 0x78], &[0x7F, 0x22, 0x78], &[0x7F, 0x22, 0x78]]),
        );
        assert!(s.request(&rdbi(0xF190)).unwrap().is_positive());
        assert!(matches!(
            s.request(&rdbi(0xF190)),
            Err(DiagError::ResponseTimeout)
        ));
    }

    #[test]
    fn negative_response_is_described() {
        let (s, _) = server(ScriptedChannel::default().answer(&[&[0x7F, 0x22, 0x31]]));
        match s.send_command_with_response(rdbi(0x1234)) {
            Err(DiagError::ECUError { code, def }) => {
                assert_eq!(code, 0x31);
                assert_eq!(def.as_deref(), Some("RequestOutOfRange"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_responses_are_skipped() {
        let (s, _) = server(ScriptedChannel::default().answer(&[
            &[0x7F, 0x22],
            &[0x62, 0xF1],
            &[0x62],
            &[0x62, 0xF1, 0x90, 0x05],
        ]));
        assert_eq!(
            s.request(&rdbi(0xF190)).unwrap(),
            UdsResponse::Positive {
                service: 0x22,
                data: vec![0x05]
            }
        );

        let (s, _) = server(ScriptedChannel::default().answer(&[&[0x62, 0xF1]]));
        assert!(matches!(
            s.request(&rdbi(0xF190)),
            Err(DiagError::ResponseTimeout)
        ));
        assert!(!s.is_busy());
    }

    #[test]
    fn invalid_keys_lock_out() {
        let send_key = UdsRequest::new(UdsCommand::SecurityAccess, Some(0x02), &[0xAA, 0xBB]);
        let (s, ch) = server(
            ScriptedChannel::default()
                .answer(&[&[0x7F, 0x27, 0x35]])
                .answer(&[&[0x7F, 0x27, 0x35]])
                .answer(&[&[0x7F, 0x27, 0x35]])
                .answer(&[&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]]),
        );
        for _ in 0..2 {
            assert!(matches!(
                s.request(&send_key).unwrap(),
                UdsResponse::Negative { nrc: 0x35, .. }
            ));
        }
        assert!(matches!(s.request(&send_key), Err(DiagError::SecurityLockout)));
        // Refused locally, nothing goes on the wire
        assert!(matches!(s.request(&send_key), Err(DiagError::SecurityLockout)));
        assert_eq!(ch.sent.lock().unwrap().len(), 3);

        s.request(&UdsRequest::new(
            UdsCommand::DiagnosticSessionControl,
            Some(0x03),
            &[],
        ))
        .unwrap();
        let state = s.session_state();
        assert!(!state.locked_out);
        assert_eq!(state.session, UdsSessionType::Extended);
    }

    #[test]
    fn in_flight_request_is_refused_and_cancellable() {
        let (s, _) = server(ScriptedChannel::default());
        let s = Arc::new(UdsDiagnosticServer::new(
            s.channel.clone(),
            UdsServerOptions {
                response_timeout_ms: 5000,
                ..Default::default()
            },
        ));
        let s_c = s.clone();
        let waiter = std::thread::spawn(move || s_c.request(&rdbi(0xF190)));
        while !s.is_busy() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            s.request(&rdbi(0xF187)),
            Err(DiagError::RequestInFlight)
        ));
        assert!(s.cancel_request());
        assert!(matches!(waiter.join().unwrap(), Err(DiagError::Cancelled)));
        assert!(!s.is_busy());
    }
}
