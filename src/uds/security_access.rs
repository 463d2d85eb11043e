//! Provides methods for security seed/key access to the ECU in order to unlock functions which
//! are considered secure such as actuator tests or writing identifiers

use automotive_diag::uds::UdsCommand;

use super::{UdsDiagnosticServer, UdsRequest};
use crate::{channel::PayloadChannel, DiagError, DiagServerResult};

/// Computes the key for a seed
pub trait SecurityKeyAlgorithm: Send + Sync {
    /// Computes the key to send for `seed` at security `level` (The odd request seed sub-function)
    fn compute_key(&self, level: u8, seed: &[u8]) -> DiagServerResult<Vec<u8>>;
}

impl<F> SecurityKeyAlgorithm for F
where
    F: Fn(u8, &[u8]) -> DiagServerResult<Vec<u8>> + Send + Sync,
{
    fn compute_key(&self, level: u8, seed: &[u8]) -> DiagServerResult<Vec<u8>> {
        self(level, seed)
    }
}

/// Shift and XOR key algorithm, `((seed >> 2) ^ seed) << 3 ^ seed`, truncated to the
/// width of the seed. Seeds are big endian, up to 8 bytes
#[derive(Debug, Copy, Clone, Default)]
pub struct XorShiftKey;

impl SecurityKeyAlgorithm for XorShiftKey {
    fn compute_key(&self, _level: u8, seed: &[u8]) -> DiagServerResult<Vec<u8>> {
        if seed.is_empty() || seed.len() > 8 {
            return Err(DiagError::InvalidResponseLength);
        }
        let s = seed.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let key = (((s >> 2) ^ s) << 3) ^ s;
        Ok(key.to_be_bytes()[8 - seed.len()..].to_vec())
    }
}

fn check_level(level: u8) -> DiagServerResult<()> {
    // Seed levels are odd, 0x7F and up collide with the suppress bit
    if level % 2 == 0 || level >= 0x7F {
        Err(DiagError::ParameterInvalid)
    } else {
        Ok(())
    }
}

impl<P: PayloadChannel> UdsDiagnosticServer<P> {
    /// Requests a seed from the ECU for security access.
    ///
    /// Once the key is calculated from the seed, run [UdsDiagnosticServer::send_key] to send the computed key to the ECU
    ///
    /// ## Parameters
    /// * level - Odd security level (0x01, 0x03, ...)
    ///
    /// ## Returns
    /// Returns the security key's seed. An all zero seed means the level is already unlocked
    pub fn request_seed(&self, level: u8) -> DiagServerResult<Vec<u8>> {
        check_level(level)?;
        self.send_command_with_response(UdsRequest::new(UdsCommand::SecurityAccess, Some(level), &[]))
    }

    /// Sends the computed key to the ECU.
    ///
    /// ## Parameters
    /// * level - The level the seed was requested for. The key is sent with `level + 1`
    /// * key - The computed key to send to the ECU
    pub fn send_key(&self, level: u8, key: &[u8]) -> DiagServerResult<()> {
        check_level(level)?;
        self.send_command_with_response(UdsRequest::new(
            UdsCommand::SecurityAccess,
            Some(level + 1),
            key,
        ))
        .map(|_| ())
    }

    /// Runs the full seed / key exchange for `level`
    pub fn unlock(&self, level: u8, algo: &dyn SecurityKeyAlgorithm) -> DiagServerResult<()> {
        let seed = self.request_seed(level)?;
        if seed.iter().all(|b| *b == 0) {
            log::debug!("Security level 0x{level:02X} already unlocked");
            return Ok(());
        }
        let key = algo.compute_key(level, &seed)?;
        log::debug!("Seed {seed:02X?} -> key {key:02X?}");
        self.send_key(level, &key)
    }
}
