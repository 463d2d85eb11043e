//! Diagnostic session and security access state of a connection

use crate::{DiagError, DiagServerResult};

pub use automotive_diag::uds::UdsSessionType;

/// Security access state. Levels are the odd request seed sub-function values
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub enum SecurityState {
    /// No level unlocked
    #[default]
    Locked,
    /// A seed was handed out and the ECU waits for the key
    SeedIssued {
        /// Seed from the ECU
        seed: Vec<u8>,
        /// Level the seed belongs to
        level: u8,
    },
    /// A level is unlocked
    Unlocked(u8),
}

/// Session and security state of one ECU connection
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionState {
    /// Active diagnostic session
    pub session: UdsSessionType,
    /// Security access state
    pub security: SecurityState,
    /// Invalid keys sent in a row
    pub invalid_key_count: u32,
    /// Security access refused locally until the next session change
    pub locked_out: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session: UdsSessionType::Default,
            security: SecurityState::default(),
            invalid_key_count: 0,
            locked_out: false,
        }
    }
}

impl SessionState {
    /// Back to Default / Locked, as after an ECU reset or a lost connection
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// A session change was accepted. Security always relocks on session change
    pub fn on_session_change(&mut self, session: UdsSessionType) {
        self.session = session;
        self.security = SecurityState::Locked;
        self.invalid_key_count = 0;
        self.locked_out = false;
    }

    /// The ECU handed out a seed. An all zero seed means the level is already unlocked
    pub fn on_seed(&mut self, level: u8, seed: &[u8]) {
        self.security = if seed.iter().all(|b| *b == 0) {
            SecurityState::Unlocked(level)
        } else {
            SecurityState::SeedIssued {
                seed: seed.to_vec(),
                level,
            }
        };
    }

    /// The ECU accepted a key
    pub fn on_key_accepted(&mut self, level: u8) {
        self.security = SecurityState::Unlocked(level);
        self.invalid_key_count = 0;
    }

    /// The ECU rejected a key. Returns true once more than `retry_limit` keys were
    /// rejected in a row
    pub fn on_invalid_key(&mut self, retry_limit: u32) -> bool {
        self.security = SecurityState::Locked;
        self.invalid_key_count += 1;
        if self.invalid_key_count > retry_limit {
            self.locked_out = true;
        }
        self.locked_out
    }

    /// The ECU reported too many failed attempts
    pub fn on_attempts_exceeded(&mut self) {
        self.security = SecurityState::Locked;
        self.locked_out = true;
    }

    /// Fails with [DiagError::SecurityLockout] while locked out
    pub fn check_security_allowed(&self) -> DiagServerResult<()> {
        if self.locked_out {
            Err(DiagError::SecurityLockout)
        } else {
            Ok(())
        }
    }

    /// Level currently unlocked, if any
    pub fn unlocked_level(&self) -> Option<u8> {
        match self.security {
            SecurityState::Unlocked(l) => Some(l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_default_session() {
        let s = SessionState::default();
        assert_eq!(s.session, UdsSessionType::Default);
        assert_eq!(s.security, SecurityState::Locked);
        assert!(s.check_security_allowed().is_ok());
    }

    #[test]
    fn lockout_after_retry_limit() {
        let mut s = SessionState::default();
        s.on_session_change(UdsSessionType::Extended);
        s.on_seed(0x01, &[0x12, 0x34]);
        assert!(!s.on_invalid_key(2));
        assert!(!s.on_invalid_key(2));
        assert!(s.check_security_allowed().is_ok());
        assert!(s.on_invalid_key(2));
        assert!(matches!(
            s.check_security_allowed(),
            Err(DiagError::SecurityLockout)
        ));
        // Only a session change clears it
        s.on_session_change(UdsSessionType::Extended);
        assert!(s.check_security_allowed().is_ok());
        assert_eq!(s.invalid_key_count, 0);
    }

    #[test]
    fn accepted_key_clears_counter() {
        let mut s = SessionState::default();
        s.on_seed(0x01, &[0xAB]);
        assert_eq!(
            s.security,
            SecurityState::SeedIssued {
                seed: vec![0xAB],
                level: 0x01
            }
        );
        s.on_invalid_key(3);
        s.on_key_accepted(0x01);
        assert_eq!(s.unlocked_level(), Some(0x01));
        assert_eq!(s.invalid_key_count, 0);
    }

    #[test]
    fn zero_seed_means_unlocked() {
        let mut s = SessionState::default();
        s.on_seed(0x03, &[0, 0, 0, 0]);
        assert_eq!(s.security, SecurityState::Unlocked(0x03));
    }

    #[test]
    fn session_change_relocks() {
        let mut s = SessionState::default();
        s.on_key_accepted(0x01);
        s.on_session_change(UdsSessionType::Programming);
        assert_eq!(s.security, SecurityState::Locked);
        assert_eq!(s.session, UdsSessionType::Programming);
        s.reset();
        assert_eq!(s, SessionState::default());
    }
}
