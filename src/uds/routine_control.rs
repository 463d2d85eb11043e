//! Routine control (Start / stop routines on the ECU and collect their results)

use std::time::Duration;

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{channel::PayloadChannel, DiagServerResult};

pub use automotive_diag::uds::RoutineControlType;

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Runs a routine control request.
    ///
    /// Routines such as sensor calibrations can take many seconds before the ECU answers,
    /// so each call takes its own response timeout. Response pending messages from the ECU
    /// extend it as usual.
    ///
    /// ## Returns
    /// The routine status record (Everything after the routine ID in the response)
    pub fn routine_control(
        &self,
        control: RoutineControlType,
        routine_id: u16,
        params: &[u8],
        timeout: Duration,
    ) -> DiagServerResult<Vec<u8>> {
        let mut args = routine_id.to_be_bytes().to_vec();
        args.extend_from_slice(params);
        log::debug!("{control:?} 0x{routine_id:04X}");
        self.send_command_with_timeout(
            UdsRequest::new(UdsCommand::RoutineControl, Some(control.into()), &args),
            timeout,
        )
    }

    /// Starts a routine with optional option record bytes
    pub fn start_routine(
        &self,
        routine_id: u16,
        params: &[u8],
        timeout: Duration,
    ) -> DiagServerResult<Vec<u8>> {
        self.routine_control(RoutineControlType::StartRoutine, routine_id, params, timeout)
    }

    /// Stops a running routine
    pub fn stop_routine(&self, routine_id: u16, timeout: Duration) -> DiagServerResult<Vec<u8>> {
        self.routine_control(RoutineControlType::StopRoutine, routine_id, &[], timeout)
    }

    /// Requests the results of a routine
    pub fn request_routine_results(
        &self,
        routine_id: u16,
        timeout: Duration,
    ) -> DiagServerResult<Vec<u8>> {
        self.routine_control(
            RoutineControlType::RequestRoutineResult,
            routine_id,
            &[],
            timeout,
        )
    }
}
