//! Firmware loading for cold devices

use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::info;

use crate::config::DeviceConfig;
use crate::error::{DvbUsbError, Result};

/// Where firmware images come from
pub trait FirmwareSource: Debug + Send + Sync {
    /// Load the image called `name`
    ///
    /// # Errors
    ///
    /// `Firmware` if the image cannot be found or read.
    fn load(&self, name: &str) -> Result<Bytes>;
}

/// Firmware from a list of directories, first match wins
#[derive(Debug, Clone)]
pub struct FileFirmware {
    search_path: Vec<PathBuf>,
}

impl FileFirmware {
    /// Search `dirs` in order
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_path: dirs.into_iter().collect(),
        }
    }

    /// Search the directories `config` names
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.firmware_search_path())
    }
}

impl FirmwareSource for FileFirmware {
    fn load(&self, name: &str) -> Result<Bytes> {
        if name.is_empty() || name.contains("..") {
            return Err(DvbUsbError::firmware(name, "invalid file name"));
        }

        for dir in &self.search_path {
            let path = dir.join(name);
            match std::fs::read(&path) {
                Ok(image) if image.is_empty() => {
                    return Err(DvbUsbError::firmware(name, format!("{} is empty", path.display())));
                }
                Ok(image) => {
                    info!("loaded firmware {} ({} bytes)", path.display(), image.len());
                    return Ok(Bytes::from(image));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DvbUsbError::firmware(name, format!("{}: {e}", path.display())));
                }
            }
        }

        Err(DvbUsbError::firmware(
            name,
            format!("not found in {:?}", self.search_path),
        ))
    }
}
