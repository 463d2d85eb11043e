//!  Provides methods to read and query DTCs on the ECU

use automotive_diag::uds::{DtcSubFunction, UdsCommand};

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{
    channel::PayloadChannel,
    dtc::{self, DTCFormatType, DtcDecoder, DtcRecord},
    DiagError, DiagServerResult,
};

/// Status masks queried by [UdsDiagnosticServer::read_all_dtcs] when none are given.
/// Pending DTCs, then DTCs whose last test failed
pub const DEFAULT_DTC_MASKS: [u8; 2] = [0x04, 0x01];

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Returns the number of DTCs stored on the ECU
    /// matching the provided status_mask
    ///
    /// ## Returns
    /// Returns a tuple of the given information:
    /// 1. (u8) - DTCStatusAvailabilityMask
    /// 2. ([DTCFormatType]) - Format of the DTCs
    /// 3. (u16) - Number of DTCs which match the status mask
    pub fn get_number_of_dtcs_by_status_mask(
        &self,
        status_mask: u8,
    ) -> DiagServerResult<(u8, DTCFormatType, u16)> {
        let resp = self.send_command_with_response(UdsRequest::new(
            UdsCommand::ReadDTCInformation,
            Some(DtcSubFunction::ReportNumberOfDtcByStatusMask.into()),
            &[status_mask],
        ))?;
        match resp.as_slice() {
            [avail, fmt, hi, lo] => Ok((
                *avail,
                dtc::dtc_format_from_uds(*fmt),
                u16::from_be_bytes([*hi, *lo]),
            )),
            _ => Err(DiagError::InvalidResponseLength),
        }
    }

    /// Returns a list of DTCs stored on the ECU
    /// matching the provided status_mask
    pub fn get_dtcs_by_status_mask(
        &self,
        status_mask: u8,
        decoder: &DtcDecoder,
    ) -> DiagServerResult<Vec<DtcRecord>> {
        self.read_dtc_records(DtcSubFunction::ReportDtcByStatusMask, &[status_mask], decoder)
    }

    /// Returns every DTC the ECU supports, regardless of status
    pub fn get_supported_dtcs(&self, decoder: &DtcDecoder) -> DiagServerResult<Vec<DtcRecord>> {
        self.read_dtc_records(DtcSubFunction::ReportSupportedDtc, &[], decoder)
    }

    /// Queries the ECU once per status mask and merges the results. A code reported
    /// under several masks is only returned once, with the first status seen.
    ///
    /// An empty `masks` uses [DEFAULT_DTC_MASKS]
    pub fn read_all_dtcs(
        &self,
        masks: &[u8],
        decoder: &DtcDecoder,
    ) -> DiagServerResult<Vec<DtcRecord>> {
        let masks = if masks.is_empty() { &DEFAULT_DTC_MASKS[..] } else { masks };
        let mut all: Vec<DtcRecord> = Vec::new();
        for mask in masks {
            for record in self.get_dtcs_by_status_mask(*mask, decoder)? {
                if !all.iter().any(|r| r.code == record.code) {
                    all.push(record);
                }
            }
        }
        log::debug!("Read {} DTCs using masks {masks:02X?}", all.len());
        Ok(all)
    }

    fn read_dtc_records(
        &self,
        sub: DtcSubFunction,
        args: &[u8],
        decoder: &DtcDecoder,
    ) -> DiagServerResult<Vec<DtcRecord>> {
        let resp = self.send_command_with_response(UdsRequest::new(
            UdsCommand::ReadDTCInformation,
            Some(sub.into()),
            args,
        ))?;
        // First byte is the DTCStatusAvailabilityMask
        match resp.split_first() {
            Some((_, records)) => decoder.decode_records(records),
            None => Err(DiagError::InvalidResponseLength),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        dtc::{DTCStatus, DtcTable},
        isotp::IsoTpResult,
        uds::UdsServerOptions,
    };

    /// Answers each request with the next canned payload
    #[derive(Default)]
    struct Canned {
        answers: Mutex<Vec<Vec<u8>>>,
        rx: Mutex<Option<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl PayloadChannel for Arc<Canned> {
        fn write_bytes(&self, buffer: &[u8]) -> IsoTpResult<()> {
            self.sent.lock().unwrap().push(buffer.to_vec());
            let mut answers = self.answers.lock().unwrap();
            if !answers.is_empty() {
                *self.rx.lock().unwrap() = Some(answers.remove(0));
            }
            Ok(())
        }

        fn read_bytes(&self, _timeout: Duration) -> IsoTpResult<Option<Vec<u8>>> {
            Ok(self.rx.lock().unwrap().take())
        }

        fn clear_rx_buffer(&self) {}
    }

    fn server(answers: Vec<Vec<u8>>) -> (UdsDiagnosticServer<Arc<Canned>>, Arc<Canned>) {
        let ch = Arc::new(Canned {
            answers: Mutex::new(answers),
            ..Default::default()
        });
        let opts = UdsServerOptions {
            response_timeout_ms: 20,
            ..Default::default()
        };
        (UdsDiagnosticServer::new(ch.clone(), opts), ch)
    }

    #[test]
    fn number_of_dtcs() {
        let (s, ch) = server(vec![vec![0x59, 0x01, 0xFF, 0x01, 0x00, 0x03]]);
        let (avail, fmt, count) = s.get_number_of_dtcs_by_status_mask(0x08).unwrap();
        assert_eq!(avail, 0xFF);
        assert_eq!(fmt, DTCFormatType::ISO14229_1);
        assert_eq!(count, 3);
        assert_eq!(ch.sent.lock().unwrap()[0], vec![0x19, 0x01, 0x08]);
    }

    #[test]
    fn dtcs_are_merged_across_masks() {
        let (s, ch) = server(vec![
            vec![0x59, 0x02, 0xFF, 0x5E, 0x03, 0x00, 0x04],
            vec![0x59, 0x02, 0xFF, 0x5E, 0x03, 0x00, 0x09, 0xC1, 0x23, 0x87, 0x09],
        ]);
        let mut table = DtcTable::default();
        table.insert(0x5E0300, "Pump motor relay");
        let decoder = DtcDecoder::new(table);

        let dtcs = s.read_all_dtcs(&[], &decoder).unwrap();
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].description, "Pump motor relay");
        assert_eq!(dtcs[0].state, DTCStatus::Pending);
        assert!(dtcs[1].unknown_code);
        assert_eq!(dtcs[1].state, DTCStatus::Active);

        let sent = ch.sent.lock().unwrap();
        assert_eq!(sent[0], vec![0x19, 0x02, 0x04]);
        assert_eq!(sent[1], vec![0x19, 0x02, 0x01]);
    }

    #[test]
    fn no_dtcs_and_bad_lengths() {
        let (s, _) = server(vec![
            vec![0x59, 0x02, 0xFF],
            vec![0x59, 0x02, 0xFF, 0x01, 0x02],
            vec![0x59, 0x02],
        ]);
        let d = DtcDecoder::default();
        assert!(s.get_dtcs_by_status_mask(0x08, &d).unwrap().is_empty());
        assert!(matches!(
            s.get_dtcs_by_status_mask(0x08, &d),
            Err(DiagError::InvalidResponseLength)
        ));
        assert!(matches!(
            s.get_dtcs_by_status_mask(0x08, &d),
            Err(DiagError::InvalidResponseLength)
        ));
    }
}
