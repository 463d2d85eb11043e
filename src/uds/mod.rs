//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! Theoretically, this module should be compliant with any ECU which implements
//! UDS (Typically any ECU produced after 2006 supports this)

use std::collections::HashMap;

use automotive_diag::uds::UdsCommand;

pub use automotive_diag::uds::{UdsError, UdsErrorByte};

mod clear_diagnostic_information;
mod diagnostic_session_control;
pub mod did;
mod ecu_reset;
mod read_data_by_identifier;
mod read_dtc_information;
mod routine_control;
mod security_access;
mod server;
mod session;
mod tester_present;

pub use diagnostic_session_control::*;
pub use ecu_reset::*;
pub use read_dtc_information::*;
pub use routine_control::*;
pub use security_access::*;
pub use server::*;
pub use session::*;

/// Bit set in a sub-function byte to ask the ECU not to send a positive response
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
/// Service ID of every negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// NRC sent by an ECU which needs more time before it can answer
pub const NRC_RESPONSE_PENDING: u8 = UdsError::RequestCorrectlyReceivedResponsePending as u8;

pub(crate) fn sid(cmd: UdsCommand) -> u8 {
    cmd.into()
}

/// A UDS request
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UdsRequest {
    /// Service ID
    pub service: u8,
    /// Sub-function byte, for services that have one
    pub sub_function: Option<u8>,
    /// Everything after the sub-function
    pub params: Vec<u8>,
}

impl UdsRequest {
    /// Creates a new request
    pub fn new<T: Into<u8>>(service: T, sub_function: Option<u8>, params: &[u8]) -> Self {
        Self {
            service: service.into(),
            sub_function,
            params: params.to_vec(),
        }
    }

    /// Sets the suppress positive response bit of the sub-function
    pub fn suppress_positive_response(mut self) -> Self {
        if let Some(s) = self.sub_function.as_mut() {
            *s |= SUPPRESS_POSITIVE_RESPONSE;
        }
        self
    }

    /// Serialized request as sent to the ECU
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.params.len() + 2);
        b.push(self.service);
        if let Some(s) = self.sub_function {
            b.push(s);
        }
        b.extend_from_slice(&self.params);
        b
    }

    /// The part of the request a positive response repeats after its SID
    /// (sub-function, data identifier, routine identifier)
    pub(crate) fn echo(&self) -> Vec<u8> {
        let mut e = Vec::with_capacity(4);
        if let Some(s) = self.sub_function {
            e.push(s & !SUPPRESS_POSITIVE_RESPONSE);
        }
        let id_len = if self.service == sid(UdsCommand::ReadDataByIdentifier)
            || self.service == sid(UdsCommand::WriteDataByIdentifier)
            || self.service == sid(UdsCommand::RoutineControl)
        {
            2
        } else if self.service == sid(UdsCommand::InputOutputControlByIdentifier) {
            // Identifier and the input output control parameter
            3
        } else {
            0
        };
        e.extend(self.params.iter().take(id_len));
        e
    }
}

/// A response correlated to a [UdsRequest]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum UdsResponse {
    /// ECU accepted the request
    Positive {
        /// Service ID of the request (Not the response SID)
        service: u8,
        /// Response data after the SID and the repeated request header
        data: Vec<u8>,
    },
    /// ECU rejected the request
    Negative {
        /// Service ID of the request
        service: u8,
        /// Negative response code
        nrc: u8,
    },
}

impl UdsResponse {
    /// Service ID the response belongs to
    pub fn service(&self) -> u8 {
        match self {
            Self::Positive { service, .. } | Self::Negative { service, .. } => *service,
        }
    }

    /// True for a positive response
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }
}

/// Describes negative response codes. Starts from the ISO14229-1 names of [UdsError],
/// entries can be replaced or added for manufacturer specific codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NrcTable {
    overrides: HashMap<u8, String>,
}

impl NrcTable {
    /// Creates a table with the given overrides on top of the ISO14229-1 names
    pub fn with_overrides(overrides: HashMap<u8, String>) -> Self {
        Self { overrides }
    }

    /// Replaces the description of one code
    pub fn set_description(&mut self, code: u8, desc: impl Into<String>) {
        self.overrides.insert(code, desc.into());
    }

    /// Description of a negative response code
    pub fn describe(&self, code: u8) -> String {
        match self.overrides.get(&code) {
            Some(d) => d.clone(),
            None => format!("{:?}", UdsErrorByte::from(code)),
        }
    }
}

/// UDS server options
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UdsServerOptions {
    /// ECU Send ID (The ID the ECU listens on)
    pub send_id: u32,
    /// ECU Receive ID (The ID the ECU responds on)
    pub recv_id: u32,
    /// How long to wait for the response to a request
    pub response_timeout_ms: u32,
    /// New deadline after each response pending (NRC 0x78) from the ECU
    pub pending_timeout_ms: u32,
    /// How many response pending NRCs are accepted for a single request
    pub max_pending_extensions: u32,
    /// Number of invalid keys accepted before security access is locked out
    pub security_retry_limit: u32,
}

impl Default for UdsServerOptions {
    fn default() -> Self {
        Self {
            send_id: 0x710,
            recv_id: 0x790,
            response_timeout_ms: 2000,
            pending_timeout_ms: 5000,
            max_pending_extensions: 10,
            security_retry_limit: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bytes_and_echo() {
        let req = UdsRequest::new(UdsCommand::ReadDataByIdentifier, None, &[0xF1, 0x90]);
        assert_eq!(req.to_bytes(), vec![0x22, 0xF1, 0x90]);
        assert_eq!(req.echo(), vec![0xF1, 0x90]);

        let req = UdsRequest::new(UdsCommand::RoutineControl, Some(0x01), &[0xF1, 0x05, 0xAA]);
        assert_eq!(req.to_bytes(), vec![0x31, 0x01, 0xF1, 0x05, 0xAA]);
        assert_eq!(req.echo(), vec![0x01, 0xF1, 0x05]);

        let req = UdsRequest::new(UdsCommand::TesterPresent, Some(0x00), &[]).suppress_positive_response();
        assert_eq!(req.to_bytes(), vec![0x3E, 0x80]);
        assert_eq!(req.echo(), vec![0x00]);

        let req = UdsRequest::new(UdsCommand::ClearDiagnosticInformation, None, &[0xFF, 0xFF, 0xFF]);
        assert!(req.echo().is_empty());
    }

    #[test]
    fn nrc_descriptions() {
        let mut table = NrcTable::default();
        assert_eq!(table.describe(0x35), "InvalidKey");
        assert_eq!(table.describe(0x78), "RequestCorrectlyReceivedResponsePending");
        assert_eq!(table.describe(0x01), "Extended(0x01)");
        table.set_description(0xF0, "Pump relay fault");
        assert_eq!(table.describe(0xF0), "Pump relay fault");
    }
}
