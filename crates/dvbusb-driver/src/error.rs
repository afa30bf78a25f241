//! Error types for DVB-USB streaming operations

use dvbusb_hw::stream::LayoutError;
use thiserror::Error;

/// Result type alias for DVB-USB operations
pub type Result<T> = std::result::Result<T, DvbUsbError>;

/// Errors that can occur in the streaming core
#[derive(Debug, Error)]
pub enum DvbUsbError {
    /// Coherent buffer or transfer object allocation failed
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failing allocation
        requested: usize,
    },

    /// Bus-level submission or transfer failure
    #[error("Transport error on transfer {index}: {reason}")]
    TransportError {
        /// Index of the transfer object that failed
        index: usize,
        /// Reason for failure
        reason: String,
    },

    /// Missing sink, bad stream layout, out-of-range index
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong
        reason: String,
    },

    /// No table entry matches the USB ids
    #[error("No driver entry for USB device {vendor:04x}:{product:04x}")]
    DeviceNotFound {
        /// idVendor
        vendor: u16,
        /// idProduct
        product: u16,
    },

    /// A device-specific hook failed
    #[error("Device error: {reason}")]
    DeviceError {
        /// Reason for failure
        reason: String,
    },

    /// Firmware could not be found or loaded
    #[error("Firmware {name}: {reason}")]
    Firmware {
        /// Firmware file name
        name: String,
        /// Reason for failure
        reason: String,
    },

    /// I/O error (sysfs, firmware files)
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DvbUsbError {
    /// Create an out-of-memory error
    pub const fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Create a transport error for transfer `index`
    pub fn transport(index: usize, reason: impl Into<String>) -> Self {
        Self::TransportError {
            index,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Create a device error
    pub fn device_error(reason: impl Into<String>) -> Self {
        Self::DeviceError {
            reason: reason.into(),
        }
    }

    /// Create a firmware error
    pub fn firmware(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Firmware {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<LayoutError> for DvbUsbError {
    fn from(err: LayoutError) -> Self {
        Self::invalid_config(err.to_string())
    }
}
