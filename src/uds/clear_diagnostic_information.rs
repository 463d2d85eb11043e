//!  Provides methods to clear diagnostic trouble codes from the ECU

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{channel::PayloadChannel, DiagServerResult};

/// Group of DTC to clear every stored DTC
pub const ALL_DTC_GROUPS: u32 = 0xFF_FFFF;

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Clears diagnostic information (DTCs) from the ECU.
    ///
    /// ## Parameters
    /// * group - Group of DTCs to clear. Only the lower 3 bytes are used (from 0x00000000 - 0x00FFFFFF).
    ///   Use [ALL_DTC_GROUPS] to clear everything
    pub fn clear_diagnostic_information(&self, group: u32) -> DiagServerResult<()> {
        let bytes = group.to_be_bytes();
        self.send_command_with_response(UdsRequest::new(
            UdsCommand::ClearDiagnosticInformation,
            None,
            &bytes[1..],
        ))
        .map(|_| ())
    }
}
