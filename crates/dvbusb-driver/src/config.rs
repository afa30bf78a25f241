//! Runtime configuration
//!
//! Knobs an administrator can turn without rebuilding. Read once per device
//! from the environment:
//!
//! | Variable                   | Effect                                   |
//! |----------------------------|------------------------------------------|
//! | `DVBUSB_FORCE_PID_FILTER`  | use optional hardware PID filters always |
//! | `DVBUSB_DISABLE_RC`        | never start remote-control polling       |
//! | `DVBUSB_FIRMWARE_DIR`      | search this directory for firmware first |

use std::env;
use std::path::PathBuf;

use tracing::debug;

/// Firmware directories searched after `DVBUSB_FIRMWARE_DIR`
pub const DEFAULT_FIRMWARE_DIRS: &[&str] = &["/lib/firmware/updates", "/lib/firmware"];

/// Per-device configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Use optional hardware PID filters even on high-speed links
    pub force_pid_filter: bool,
    /// Skip remote-control polling
    pub disable_remote: bool,
    /// Extra firmware directory, searched first
    pub firmware_dir: Option<PathBuf>,
}

impl DeviceConfig {
    /// Read the configuration from the environment
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self {
            force_pid_filter: env_flag("DVBUSB_FORCE_PID_FILTER"),
            disable_remote: env_flag("DVBUSB_DISABLE_RC"),
            firmware_dir: env::var_os("DVBUSB_FIRMWARE_DIR").map(PathBuf::from),
        };
        debug!("device config: {config:?}");
        config
    }

    /// Directories searched for firmware, in order
    #[must_use]
    pub fn firmware_search_path(&self) -> Vec<PathBuf> {
        self.firmware_dir
            .iter()
            .cloned()
            .chain(DEFAULT_FIRMWARE_DIRS.iter().map(PathBuf::from))
            .collect()
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| parse_flag(&value))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "true" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["1", "Y", "yes", "TRUE", " on "] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["0", "", "no", "off", "2"] {
            assert!(!parse_flag(value), "{value}");
        }
    }

    #[test]
    fn custom_firmware_dir_is_searched_first() {
        let config = DeviceConfig {
            firmware_dir: Some(PathBuf::from("/opt/fw")),
            ..DeviceConfig::default()
        };
        let path = config.firmware_search_path();
        assert_eq!(path[0], PathBuf::from("/opt/fw"));
        assert_eq!(path.len(), 1 + DEFAULT_FIRMWARE_DIRS.len());
    }
}
