//! Provides methods to read data identifiers from the ECU

use automotive_diag::uds::UdsCommand;

use super::{
    did::{decode_did, DidValue},
    UdsDiagnosticServer, UdsRequest,
};
use crate::{channel::PayloadChannel, DiagServerResult};

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Reads a data identifier.
    ///
    /// ## Returns
    /// The identifier's data, without the repeated identifier
    pub fn read_data_by_identifier(&self, did: u16) -> DiagServerResult<Vec<u8>> {
        self.send_command_with_response(UdsRequest::new(
            UdsCommand::ReadDataByIdentifier,
            None,
            &did.to_be_bytes(),
        ))
    }

    /// Reads a data identifier and decodes it with [decode_did]
    pub fn read_decoded_identifier(&self, did: u16) -> DiagServerResult<DidValue> {
        let data = self.read_data_by_identifier(did)?;
        Ok(decode_did(did, &data))
    }
}
