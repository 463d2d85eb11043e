//! Tester present, keeps a non default session alive

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{channel::PayloadChannel, DiagServerResult};

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Sends tester present to the ECU.
    ///
    /// ## Parameters
    /// * suppress_response - If true the ECU is asked not to answer, and this
    ///   returns as soon as the request is sent
    pub fn tester_present(&self, suppress_response: bool) -> DiagServerResult<()> {
        let req = UdsRequest::new(UdsCommand::TesterPresent, Some(0x00), &[]);
        if suppress_response {
            self.send_no_response(&req.suppress_positive_response())
        } else {
            self.send_command_with_response(req).map(|_| ())
        }
    }
}
