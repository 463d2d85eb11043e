#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides a UDS (ISO14229) diagnostic client running over a software
//! ISO-TP (ISO15765-2) transport on a CAN bus.
//!
//! ## Layers
//!
//! ### ISO-TP
//! [isotp::IsoTpTransport] takes any [channel::CanChannel] (the only thing an adapter
//! driver has to provide) and runs a bus reader thread on it. Each ECU gets an
//! [isotp::IsoTpEndpoint], which segments outgoing payloads with flow control and
//! reassembles incoming ones.
//!
//! ### Unified diagnostic services (UDS)
//! [uds::UdsDiagnosticServer] sends one request at a time over a
//! [channel::PayloadChannel], correlates the ECU's response, handles response pending
//! (NRC 0x78) and tracks the diagnostic session and security access state of the
//! connection. Typed wrappers exist for the common services (session control, security
//! access, tester present, read data by identifier, DTC reading and clearing, routine
//! control and ECU reset).
//!
//! ### DTCs and actuators
//! [dtc::DtcDecoder] turns raw DTC records into described [dtc::DtcRecord]s using a
//! pluggable [dtc::DtcTable]. [actuator::ActuatorController] runs input output control
//! commands and guarantees control is handed back to the ECU afterwards.
//!
//! ## Hardware
//! No adapter drivers are included. [hardware::SimulationCanBus] provides an in-memory
//! bus for testing.
//!
//! ## Example
//! ```no_run
//! use isotp_uds::{
//!     hardware::SimulationCanBus,
//!     isotp::{IsoTPSettings, IsoTpTransport},
//!     uds::{UdsDiagnosticServer, UdsServerOptions, UdsSessionType},
//! };
//!
//! let (tester, _ecu) = SimulationCanBus::pair("tester", "ecu");
//! let transport = IsoTpTransport::new(tester, IsoTPSettings::default());
//! let server = UdsDiagnosticServer::new_over_iso_tp(&transport, UdsServerOptions::default())?;
//! server.set_session_mode(UdsSessionType::Extended)?;
//! let vin = server.read_data_by_identifier(0xF190)?;
//! # Ok::<(), isotp_uds::DiagError>(())
//! ```

use isotp::IsoTpError;

pub mod actuator;
pub mod channel;
pub mod config;
pub mod dtc;
pub mod hardware;
pub mod isotp;
pub mod uds;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic server error
pub enum DiagError {
    /// ECU did not respond within the deadline, including any response pending extensions
    #[error("ECU did not respond to the request in time")]
    ResponseTimeout,
    /// ECU sent something which was not a reply to the request
    #[error("ECU response does not match the request: {0:02X?}")]
    UnexpectedResponse(Vec<u8>),
    /// Too many invalid keys were sent, or the ECU reported exceeded attempts.
    /// Cleared by a successful session change or [uds::UdsDiagnosticServer::reset_session]
    #[error("Security access is locked out")]
    SecurityLockout,
    /// Another request is already waiting for a response on this connection
    #[error("A request is already in flight on this connection")]
    RequestInFlight,
    /// A command for this actuator is still pending, or the actuator is still under tester control
    #[error("Actuator 0x{0:04X} is busy")]
    ActuatorBusy(u16),
    /// The request was cancelled while waiting for the response
    #[error("Request was cancelled")]
    Cancelled,
    /// Diagnostic error code from the ECU itself
    #[error("ECU Negative response. Error 0x{:02X?}, definition: {:?}", code, def)]
    ECUError {
        /// Raw Negative response code from ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: Option<String>,
    },
    /// ECU Responded with a message, but the length was incorrect
    #[error("ECU response size was not the correct length")]
    InvalidResponseLength,
    /// A parameter given to the function is invalid. Check the function's documentation
    /// for more information
    #[error("Diagnostic function parameter invalid")]
    ParameterInvalid,
    /// Error with the underlying transport
    #[error("Diagnostic server transport error")]
    Transport(
        #[from]
        #[source]
        IsoTpError,
    ),
}

/// Converts a BCD byte into its numeric value
pub fn bcd_to_u8(input: u8) -> u8 {
    ((input >> 4) * 10) + (input & 0x0F)
}
