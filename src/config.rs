//! Loading of the diagnostic stack configuration from JSON
//!
//! Every section and field is optional, missing ones take their defaults:
//!
//! ```json
//! {
//!     "isotp": { "block_size": 8, "st_min": 10, "rx_timeout_ms": 1000 },
//!     "uds": { "send_id": 1808, "recv_id": 1936, "response_timeout_ms": 2000 },
//!     "actuator": { "response_deadline_ms": 1000 },
//!     "dtc_table": "dtc_descriptions.json",
//!     "nrc_descriptions": { "0xF0": "Manufacturer specific" }
//! }
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{
    actuator::ActuatorOptions,
    channel::{CAN_EXT_ID_MASK, CAN_STD_ID_MASK},
    dtc::DtcTable,
    isotp::IsoTPSettings,
    uds::{NrcTable, UdsServerOptions},
};

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid JSON, or has the wrong shape
    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// Values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of the whole diagnostic stack
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    /// ISO-TP transport settings
    pub isotp: IsoTPSettings,
    /// UDS server settings
    pub uds: UdsServerOptions,
    /// Actuator controller settings
    pub actuator: ActuatorOptions,
    /// JSON file with DTC descriptions, see [DtcTable::from_json_str]. Relative paths are
    /// resolved against the configuration file's directory by [DiagConfig::from_file]
    pub dtc_table: Option<PathBuf>,
    /// Negative response code descriptions replacing the built in ones. Keys are hex codes
    pub nrc_descriptions: HashMap<String, String>,
}

impl DiagConfig {
    /// Parses and validates a configuration
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut cfg = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        if let (Some(table), Some(dir)) = (&cfg.dtc_table, path.parent()) {
            if table.is_relative() {
                cfg.dtc_table = Some(dir.join(table));
            }
        }
        log::debug!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Checks the values are usable together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uds = &self.uds;
        if uds.send_id == uds.recv_id {
            return Err(ConfigError::Invalid(format!(
                "send and receive IDs are both 0x{:X}",
                uds.send_id
            )));
        }
        let id_limit = if self.isotp.can_use_ext_addr {
            CAN_EXT_ID_MASK
        } else {
            CAN_STD_ID_MASK
        };
        for id in [uds.send_id, uds.recv_id] {
            if id > id_limit {
                return Err(ConfigError::Invalid(format!(
                    "CAN ID 0x{id:X} does not fit the configured addressing"
                )));
            }
        }
        for (name, v) in [
            ("isotp.rx_timeout_ms", self.isotp.rx_timeout_ms),
            ("isotp.fc_timeout_ms", self.isotp.fc_timeout_ms),
            ("uds.response_timeout_ms", uds.response_timeout_ms),
            ("uds.pending_timeout_ms", uds.pending_timeout_ms),
            ("actuator.response_deadline_ms", self.actuator.response_deadline_ms),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be above 0")));
            }
        }
        self.nrc_overrides().map(|_| ())
    }

    fn nrc_overrides(&self) -> Result<HashMap<u8, String>, ConfigError> {
        self.nrc_descriptions
            .iter()
            .map(|(k, v)| {
                let hex = k.trim().trim_start_matches("0x").trim_start_matches("0X");
                u8::from_str_radix(hex, 16)
                    .map(|code| (code, v.clone()))
                    .map_err(|_| ConfigError::Invalid(format!("'{k}' is not a hex NRC")))
            })
            .collect()
    }

    /// NRC table with the configured overrides
    pub fn nrc_table(&self) -> Result<NrcTable, ConfigError> {
        Ok(NrcTable::with_overrides(self.nrc_overrides()?))
    }

    /// Loads the configured DTC table, or an empty one if none is configured
    pub fn load_dtc_table(&self) -> Result<DtcTable, ConfigError> {
        match &self.dtc_table {
            Some(p) => DtcTable::from_file(p),
            None => Ok(DtcTable::default()),
        }
    }
}
