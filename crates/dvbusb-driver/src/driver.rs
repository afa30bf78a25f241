//! Device-specific driver hooks and static properties
//!
//! A [`DeviceDriver`] describes one family of devices: its id table, the
//! layout of its adapters and streams, and the hooks the generic core calls
//! at well-defined points. Every hook but `properties` and
//! `frontend_attach` is optional.

use std::sync::Arc;
use std::time::Duration;

use dvbusb_hw::limits::{DEFAULT_RC_INTERVAL_MS, MAX_ADAPTERS_PER_DEVICE, MAX_FRONTENDS_PER_ADAPTER};
use dvbusb_hw::{DeviceDescription, StreamProperties, UsbDeviceId};

use crate::bus::BusTransport;
use crate::discovery::Identified;
use crate::error::{DvbUsbError, Result};
use crate::frontend::Frontend;
use crate::i2c::{I2cAdapter, I2cAlgorithm};
use crate::remote::RcEvent;

/// Hardware PID filter capability of a frontend slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFilterCaps {
    /// No hardware filter
    None,
    /// The hardware always filters; `count` table entries
    Required {
        /// Filter table size
        count: usize,
    },
    /// The hardware filter can be switched off; `count` table entries
    Optional {
        /// Filter table size
        count: usize,
    },
}

impl PidFilterCaps {
    /// Filter table size, if there is a table
    pub const fn count(self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Required { count } | Self::Optional { count } => Some(count),
        }
    }
}

/// Properties of one frontend slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendSlotProperties {
    /// Hardware PID filter
    pub pid_filter: PidFilterCaps,
    /// Transport stream endpoint layout
    pub stream: StreamProperties,
}

/// Properties of one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterProperties {
    /// Frontend slots, at least one
    pub frontends: Vec<FrontendSlotProperties>,
}

/// Remote-control polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteProperties {
    /// Interval between `rc_query` calls
    pub interval: Duration,
}

impl Default for RemoteProperties {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RC_INTERVAL_MS),
        }
    }
}

/// Static description of a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Device-table entries handled by this driver
    pub devices: Vec<DeviceDescription>,
    /// Firmware file for cold devices
    pub firmware: Option<String>,
    /// Adapter layout
    pub adapters: Vec<AdapterProperties>,
    /// Remote-control polling, if the device has a receiver
    pub remote: Option<RemoteProperties>,
}

impl DeviceProperties {
    /// Check the adapter and frontend counts and every stream layout
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` naming the first offending adapter or slot.
    pub fn validate(&self) -> Result<()> {
        if self.adapters.is_empty() || self.adapters.len() > MAX_ADAPTERS_PER_DEVICE {
            return Err(DvbUsbError::invalid_config(format!(
                "{} adapters (1..={MAX_ADAPTERS_PER_DEVICE} supported)",
                self.adapters.len()
            )));
        }
        for (a, adapter) in self.adapters.iter().enumerate() {
            let slots = adapter.frontends.len();
            if slots == 0 || slots > MAX_FRONTENDS_PER_ADAPTER {
                return Err(DvbUsbError::invalid_config(format!(
                    "adapter {a}: {slots} frontends (1..={MAX_FRONTENDS_PER_ADAPTER} supported)"
                )));
            }
            for (s, slot) in adapter.frontends.iter().enumerate() {
                slot.stream.check().map_err(|e| {
                    DvbUsbError::invalid_config(format!("adapter {a} frontend {s}: {e}"))
                })?;
                if slot.pid_filter.count() == Some(0) {
                    return Err(DvbUsbError::invalid_config(format!(
                        "adapter {a} frontend {s}: empty pid filter table"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What a frontend or tuner attach hook gets to work with
pub struct AttachContext<'a> {
    /// Adapter index
    pub adapter: usize,
    /// Frontend slot
    pub slot: usize,
    /// The device's bus
    pub bus: &'a Arc<dyn BusTransport>,
    /// The device's I2C adapter, if the driver provides an algorithm
    pub i2c: Option<&'a I2cAdapter>,
}

/// Device-specific hooks
pub trait DeviceDriver: Send + Sync {
    /// Static properties
    fn properties(&self) -> &DeviceProperties;

    /// Override the table lookup; `found` is the table's answer
    ///
    /// # Errors
    ///
    /// A failure to query the device.
    fn identify_state(
        &self,
        _id: UsbDeviceId,
        found: Option<Identified>,
    ) -> Result<Option<Identified>> {
        Ok(found)
    }

    /// Download `image` to a cold device
    ///
    /// # Errors
    ///
    /// `Firmware` if the device rejects the image or cannot be written.
    fn download_firmware(&self, _bus: &dyn BusTransport, _image: &[u8]) -> Result<()> {
        Err(DvbUsbError::device_error(
            "driver does not support firmware download",
        ))
    }

    /// Switch device power
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn power_ctrl(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    /// I2C master transfer implementation, if the device has a bus
    fn i2c_algorithm(&self) -> Option<Arc<dyn I2cAlgorithm>> {
        None
    }

    /// Create the demodulator for a slot; `None` leaves the slot empty
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn frontend_attach(&self, ctx: &AttachContext<'_>) -> Result<Option<Box<dyn Frontend>>>;

    /// Attach the tuner behind a freshly attached demodulator
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn tuner_attach(&self, _ctx: &AttachContext<'_>, _frontend: &mut dyn Frontend) -> Result<()> {
        Ok(())
    }

    /// Start or stop the transport stream of an adapter
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn streaming_ctrl(&self, _adapter: usize, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Program entry `index` of the hardware PID filter
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn pid_filter(&self, _adapter: usize, _index: usize, _pid: u16, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Enable or bypass the hardware PID filter
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn pid_filter_ctrl(&self, _adapter: usize, _enabled: bool) -> Result<()> {
        Ok(())
    }

    /// Frontend-specific wake/sleep control
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn frontend_ctrl(&self, _adapter: usize, _slot: usize, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Poll the remote-control receiver
    ///
    /// # Errors
    ///
    /// Device-specific failure; polling continues.
    fn rc_query(&self) -> Result<Option<RcEvent>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(pid_filter: PidFilterCaps) -> FrontendSlotProperties {
        FrontendSlotProperties {
            pid_filter,
            stream: StreamProperties::bulk(4, 2, 4096),
        }
    }

    fn props(adapters: Vec<AdapterProperties>) -> DeviceProperties {
        DeviceProperties {
            devices: Vec::new(),
            firmware: None,
            adapters,
            remote: None,
        }
    }

    #[test]
    fn rejects_adapter_and_frontend_counts() {
        assert!(props(Vec::new()).validate().is_err());

        let empty = AdapterProperties {
            frontends: Vec::new(),
        };
        assert!(props(vec![empty]).validate().is_err());

        let many = AdapterProperties {
            frontends: vec![slot(PidFilterCaps::None); MAX_FRONTENDS_PER_ADAPTER + 1],
        };
        assert!(props(vec![many]).validate().is_err());
    }

    #[test]
    fn rejects_bad_stream_layout_and_empty_filter() {
        let mut bad = slot(PidFilterCaps::None);
        bad.stream = StreamProperties::bulk(0, 2, 4096);
        let adapter = AdapterProperties {
            frontends: vec![bad],
        };
        assert!(matches!(
            props(vec![adapter]).validate(),
            Err(DvbUsbError::InvalidConfiguration { .. })
        ));

        let adapter = AdapterProperties {
            frontends: vec![slot(PidFilterCaps::Required { count: 0 })],
        };
        assert!(props(vec![adapter]).validate().is_err());
    }

    #[test]
    fn accepts_two_adapters() {
        let adapter = AdapterProperties {
            frontends: vec![slot(PidFilterCaps::Optional { count: 32 })],
        };
        assert!(props(vec![adapter.clone(), adapter]).validate().is_ok());
    }
}
