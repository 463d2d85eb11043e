//!  Provides methods to reset the ECU in order to simulate power cycling and resetting memory regions

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{channel::PayloadChannel, DiagServerResult};

pub use automotive_diag::uds::ResetType;

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Asks the ECU to reset. Once accepted the connection is back in the default
    /// session with security access locked
    pub fn ecu_reset(&self, reset_type: ResetType) -> DiagServerResult<()> {
        log::debug!("Requesting ECU {reset_type:?}");
        self.send_command_with_response(UdsRequest::new(
            UdsCommand::ECUReset,
            Some(reset_type.into()),
            &[],
        ))
        .map(|_| ())
    }
}
