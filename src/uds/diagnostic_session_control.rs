//!  Provides methods to manipulate the ECUs diagnostic session mode

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest, UdsSessionType};
use crate::{channel::PayloadChannel, DiagServerResult};

/// Timing parameters an ECU reports when entering a session
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionTiming {
    /// Maximum time until the ECU starts its response (P2server_max)
    pub p2_max_ms: u16,
    /// Maximum time until the ECU responds after a response pending (P2*server_max)
    pub p2_ext_max_ms: u32,
}

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Requests the ECU to go into a specific diagnostic session mode.
    ///
    /// On success security access is locked again, as the ECU does the same on session change.
    ///
    /// ## Returns
    /// The session timing parameters, if the ECU sent them
    pub fn set_session_mode(&self, session: UdsSessionType) -> DiagServerResult<Option<SessionTiming>> {
        let res = self.send_command_with_response(UdsRequest::new(
            UdsCommand::DiagnosticSessionControl,
            Some(session.into()),
            &[],
        ))?;
        Ok(match res.as_slice() {
            [p2_hi, p2_lo, ext_hi, ext_lo, ..] => Some(SessionTiming {
                p2_max_ms: u16::from_be_bytes([*p2_hi, *p2_lo]),
                p2_ext_max_ms: u16::from_be_bytes([*ext_hi, *ext_lo]) as u32 * 10,
            }),
            _ => None,
        })
    }
}
