use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use isotp_uds::{
    actuator::{ActuatorCommand, ActuatorController, ActuatorOptions, ActuatorOutcome},
    channel::PayloadChannel,
    dtc::{DTCStatus, DtcDecoder, DtcTable},
    hardware::SimulationCanBus,
    isotp::{IsoTPSettings, IsoTpEndpoint, IsoTpTransport},
    uds::{
        did::DidValue, ResetType, UdsDiagnosticServer, UdsServerOptions, UdsSessionType,
        XorShiftKey,
    },
    DiagError, DiagServerResult,
};

const VIN: &[u8; 17] = b"WDB2030461A123456";

/// A reply the simulated ECU sends, after waiting `.0`
type Reply = (Duration, Vec<u8>);
type Handler = Box<dyn FnMut(&[u8]) -> Vec<Reply> + Send>;

fn now(data: &[u8]) -> Reply {
    (Duration::ZERO, data.to_vec())
}

/// ECU simulated on the far end of a [SimulationCanBus], answering through a callback
pub struct UdsSimEcu {
    running: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl UdsSimEcu {
    fn start(transport: IsoTpTransport, mut on_data: Handler) -> Self {
        let endpoint = transport
            .open_endpoint(0x790, 0x710)
            .expect("ECU endpoint");
        let running = Arc::new(AtomicBool::new(true));
        let received = Arc::new(Mutex::new(Vec::new()));
        let running_c = running.clone();
        let received_c = received.clone();
        let handle = std::thread::spawn(move || {
            // Transport must outlive the endpoint
            let _transport = transport;
            while running_c.load(Ordering::Relaxed) {
                let req = match endpoint.read_bytes(Duration::from_millis(20)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("Sim ECU read failed: {e}");
                        return;
                    }
                };
                log::debug!("Sim ECU got {req:02X?}");
                received_c.lock().unwrap().push(req.clone());
                for (delay, reply) in on_data(&req) {
                    std::thread::sleep(delay);
                    if let Err(e) = endpoint.write_bytes(&reply) {
                        log::error!("Sim ECU write failed: {e}");
                    }
                }
            }
        });
        Self {
            running,
            received,
            handle: Some(handle),
        }
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for UdsSimEcu {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

struct Bench {
    server: Arc<UdsDiagnosticServer<IsoTpEndpoint>>,
    ecu: UdsSimEcu,
    _tester: IsoTpTransport,
}

fn bench(options: UdsServerOptions, on_data: Handler) -> Bench {
    let _ = env_logger::try_init();
    let (a, b) = SimulationCanBus::pair("Tester", "ECU");
    let settings = IsoTPSettings {
        st_min: 0,
        ..Default::default()
    };
    let tester = IsoTpTransport::new(a, settings);
    let ecu = UdsSimEcu::start(IsoTpTransport::new(b, settings), on_data);
    let server = UdsDiagnosticServer::new_over_iso_tp(&tester, options).unwrap();
    Bench {
        server: Arc::new(server),
        ecu,
        _tester: tester,
    }
}

fn fast() -> UdsServerOptions {
    UdsServerOptions {
        response_timeout_ms: 200,
        pending_timeout_ms: 500,
        ..Default::default()
    }
}

/// Answers the standard services like a well behaved ECU
fn standard_ecu(req: &[u8]) -> Vec<Reply> {
    match req {
        [0x10, s] => vec![now(&[0x50, *s, 0x00, 0x32, 0x01, 0xF4])],
        [0x11, r] => vec![now(&[0x51, *r])],
        [0x22, 0xF1, 0x90] => {
            let mut r = vec![0x62, 0xF1, 0x90];
            r.extend_from_slice(VIN);
            vec![now(&r)]
        }
        [0x27, 0x01] => vec![now(&[0x67, 0x01, 0x12, 0x34])],
        [0x27, 0x02, 0xA7, 0xFC] => vec![now(&[0x67, 0x02])],
        [0x27, 0x02, ..] => vec![now(&[0x7F, 0x27, 0x35])],
        [0x14, 0xFF, 0xFF, 0xFF] => vec![now(&[0x54])],
        [0x19, 0x02, 0x04] => vec![now(&[0x59, 0x02, 0xFF, 0x5E, 0x03, 0x00, 0x04])],
        [0x19, 0x02, 0x01] => vec![now(&[
            0x59, 0x02, 0xFF, 0x5E, 0x03, 0x00, 0x2D, 0xC1, 0x23, 0x87, 0x09,
        ])],
        [0x2F, hi, lo, 0x00] => vec![now(&[0x6F, *hi, *lo, 0x00])],
        // Actuator commands never get an answer
        [0x2F, ..] => vec![],
        [0x31, 0x01, 0xF0, 0x03] => vec![
            now(&[0x7F, 0x31, 0x78]),
            (Duration::from_millis(300), vec![0x71, 0x01, 0xF0, 0x03, 0x00]),
        ],
        [0x3E, 0x80] => vec![],
        [sid, ..] => vec![now(&[0x7F, *sid, 0x11])],
        [] => vec![],
    }
}

#[test]
fn read_vin() {
    let b = bench(fast(), Box::new(standard_ecu));
    // 20 byte response, so this is a multi frame transfer
    assert_eq!(b.server.read_data_by_identifier(0xF190).unwrap(), VIN.to_vec());
    assert_eq!(
        b.server.read_decoded_identifier(0xF190).unwrap(),
        DidValue::Text("WDB2030461A123456".into())
    );
    assert_eq!(b.ecu.received()[0], vec![0x22, 0xF1, 0x90]);
}

#[test]
fn unsupported_service() {
    let b = bench(fast(), Box::new(standard_ecu));
    match b.server.read_data_by_identifier(0xF18C) {
        Err(DiagError::ECUError { code, def }) => {
            assert_eq!(code, 0x11);
            assert_eq!(def.as_deref(), Some("ServiceNotSupported"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn no_response_releases_reservation() {
    let b = bench(fast(), Box::new(|_| vec![]));
    assert!(matches!(
        b.server.read_data_by_identifier(0xF190),
        Err(DiagError::ResponseTimeout)
    ));
    assert!(!b.server.is_busy());
    assert!(matches!(
        b.server.read_data_by_identifier(0xF190),
        Err(DiagError::ResponseTimeout)
    ));
    assert_eq!(b.ecu.received().len(), 2);
}

#[test]
fn session_and_reset() {
    let b = bench(fast(), Box::new(standard_ecu));
    let timing = b.server.set_session_mode(UdsSessionType::Extended).unwrap().unwrap();
    assert_eq!(timing.p2_max_ms, 50);
    assert_eq!(timing.p2_ext_max_ms, 5000);
    assert_eq!(b.server.session_state().session, UdsSessionType::Extended);

    b.server.ecu_reset(ResetType::HardReset).unwrap();
    assert_eq!(b.server.session_state().session, UdsSessionType::Default);

    b.server.tester_present(true).unwrap();
    b.server.clear_diagnostic_information(0xFF_FFFF).unwrap();
}

#[test]
fn security_unlock() {
    let b = bench(fast(), Box::new(standard_ecu));
    b.server.set_session_mode(UdsSessionType::Extended).unwrap();
    b.server.unlock(0x01, &XorShiftKey).unwrap();
    assert_eq!(b.server.session_state().unlocked_level(), Some(0x01));

    // Session change relocks
    b.server.set_session_mode(UdsSessionType::Extended).unwrap();
    assert_eq!(b.server.session_state().unlocked_level(), None);
}

#[test]
fn security_lockout_after_invalid_keys() {
    let b = bench(fast(), Box::new(standard_ecu));
    let bad_key = |_: u8, _: &[u8]| -> DiagServerResult<Vec<u8>> { Ok(vec![0x00, 0x01]) };
    // Retry limit 3: three rejections are reported as such, the fourth locks out
    for _ in 0..3 {
        assert!(matches!(
            b.server.unlock(0x01, &bad_key),
            Err(DiagError::ECUError { code: 0x35, .. })
        ));
    }
    assert!(matches!(
        b.server.unlock(0x01, &bad_key),
        Err(DiagError::SecurityLockout)
    ));
    let sent = b.ecu.received().len();
    assert!(matches!(
        b.server.request_seed(0x01),
        Err(DiagError::SecurityLockout)
    ));
    assert_eq!(b.ecu.received().len(), sent);

    b.server.set_session_mode(UdsSessionType::Extended).unwrap();
    b.server.unlock(0x01, &XorShiftKey).unwrap();
}

#[test]
fn response_pending_extends_deadline() {
    let b = bench(fast(), Box::new(standard_ecu));
    // Answer arrives 300ms in, after the 200ms response timeout
    let status = b
        .server
        .start_routine(0xF003, &[], Duration::from_millis(200))
        .unwrap();
    assert_eq!(status, vec![0x00]);
}

#[test]
fn back_to_back_payloads_all_reach_the_request() {
    let b = bench(
        fast(),
        Box::new(|req: &[u8]| match req {
            // Busy, then the answer, without any gap
            [0x22, 0xF1, 0x90] => vec![now(&[0x7F, 0x22, 0x78]), now(&[0x62, 0xF1, 0x90, 0x42])],
            // Someone else's answer, then ours
            [0x22, hi, lo] => vec![now(&[0x62, 0xF1, 0x87, 0x01]), now(&[0x62, *hi, *lo, 0x42])],
            _ => vec![],
        }),
    );
    for i in 0..10 {
        let did = if i % 2 == 0 { 0xF190 } else { 0xF195 };
        assert_eq!(
            b.server.read_data_by_identifier(did).unwrap(),
            vec![0x42],
            "request {i}"
        );
    }
}

#[test]
fn one_request_at_a_time() {
    let b = bench(
        fast(),
        Box::new(|req: &[u8]| match req {
            [0x22, hi, lo] => vec![(Duration::from_millis(100), vec![0x62, *hi, *lo, 0x01])],
            _ => vec![],
        }),
    );
    let s = b.server.clone();
    let first = std::thread::spawn(move || s.read_data_by_identifier(0xF187));
    while !b.server.is_busy() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(
        b.server.read_data_by_identifier(0xF195),
        Err(DiagError::RequestInFlight)
    ));
    assert_eq!(first.join().unwrap().unwrap(), vec![0x01]);
    assert_eq!(b.server.read_data_by_identifier(0xF195).unwrap(), vec![0x01]);
}

#[test]
fn cancel_waiting_request() {
    let b = bench(
        UdsServerOptions {
            response_timeout_ms: 5000,
            ..Default::default()
        },
        Box::new(|_| vec![]),
    );
    let s = b.server.clone();
    let waiter = std::thread::spawn(move || s.read_data_by_identifier(0xF190));
    while !b.server.is_busy() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(b.server.cancel_request());
    assert!(matches!(waiter.join().unwrap(), Err(DiagError::Cancelled)));
    assert!(!b.server.is_busy());
}

#[test]
fn read_dtcs() {
    let b = bench(fast(), Box::new(standard_ecu));
    let mut table = DtcTable::default();
    table.insert(0x5E0300, "Pump motor relay");
    let decoder = DtcDecoder::new(table);
    let dtcs = b.server.read_all_dtcs(&[], &decoder).unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!(dtcs[0].description, "Pump motor relay");
    assert_eq!(dtcs[0].state, DTCStatus::Pending);
    assert_eq!(dtcs[1].description, "DTC C12387");
    assert!(dtcs[1].unknown_code);
    assert_eq!(dtcs[1].state, DTCStatus::Active);
}

#[test]
fn actuator_without_response_returns_control() {
    let b = bench(fast(), Box::new(standard_ecu));
    let ctrl = ActuatorController::new(
        b.server.clone(),
        ActuatorOptions {
            response_deadline_ms: 100,
        },
    );
    let outcome = ctrl
        .execute(&ActuatorCommand::short_term_adjustment(0x0150, &[0xFF, 0xFF]))
        .unwrap();
    assert_eq!(outcome, ActuatorOutcome::TimedOut);
    let received = b.ecu.received();
    assert_eq!(received[0], vec![0x2F, 0x01, 0x50, 0x03, 0xFF, 0xFF]);
    assert_eq!(received[1], vec![0x2F, 0x01, 0x50, 0x00]);
    assert_eq!(ctrl.state(0x0150), None);
}
