//! Device lifecycle
//!
//! Bring-up, in order, with the device powered for the duration:
//!
//! 1. I2C adapter (if the driver has an algorithm)
//! 2. every adapter: streams, DVB registration, demux and net, frontends
//! 3. remote-control polling (feature `remote`)
//!
//! Any failure tears down everything completed so far, in reverse, and the
//! error is returned. `exit` runs the same teardown and is idempotent.

use std::fmt;
use std::sync::Arc;

use dvbusb_hw::{DeviceDescription, UsbDeviceId};
use tracing::{debug, error, info, warn};

use crate::adapter::Adapter;
use crate::bus::BusTransport;
use crate::config::DeviceConfig;
use crate::context::DeviceContext;
use crate::discovery::{identify, Identified};
use crate::driver::DeviceDriver;
use crate::dvb::DvbCore;
use crate::error::{DvbUsbError, Result};
use crate::firmware::FirmwareSource;
use crate::i2c::I2cAdapter;
#[cfg(feature = "remote")]
use crate::remote::{RcEvent, RemoteControl};

/// How far bring-up got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    /// Nothing initialized (or torn down)
    Uninitialized,
    /// I2C adapter registered (or not needed)
    I2cReady,
    /// All adapters initialized
    AdaptersReady,
    /// Fully initialized
    Ready,
}

/// Outcome of probing a USB device
#[derive(Debug)]
pub enum Probe {
    /// A cold device received its firmware and will re-enumerate warm
    FirmwareDownloaded(Identified),
    /// A warm device is initialized
    Ready(Box<DvbUsbDevice>),
}

/// A DVB-USB device
pub struct DvbUsbDevice {
    description: DeviceDescription,
    ctx: Arc<DeviceContext>,
    core: Arc<dyn DvbCore>,
    state: DeviceState,
    i2c: Option<I2cAdapter>,
    adapters: Vec<Adapter>,
    #[cfg(feature = "remote")]
    remote: Option<RemoteControl>,
}

impl DvbUsbDevice {
    /// Identify a device and either load its firmware (cold) or bring it
    /// up (warm)
    ///
    /// # Errors
    ///
    /// - `DeviceNotFound` if the driver does not handle `id`
    /// - `Firmware` if a cold device's image cannot be loaded or sent
    /// - anything [`init`](Self::init) returns
    pub fn probe(
        id: UsbDeviceId,
        bus: Arc<dyn BusTransport>,
        driver: Arc<dyn DeviceDriver>,
        core: Arc<dyn DvbCore>,
        firmware: &dyn FirmwareSource,
        config: DeviceConfig,
    ) -> Result<Probe> {
        let identified = identify(driver.as_ref(), id)?;

        if identified.cold {
            let name = driver.properties().firmware.clone().ok_or_else(|| {
                DvbUsbError::firmware(
                    identified.description.name,
                    "cold device but the driver names no firmware",
                )
            })?;
            info!("{}: downloading firmware {name}", identified.description.name);
            let image = firmware.load(&name)?;
            driver
                .download_firmware(bus.as_ref(), &image)
                .map_err(|e| DvbUsbError::firmware(&name, e.to_string()))?;
            info!(
                "{}: firmware downloaded, waiting for warm re-enumeration",
                identified.description.name
            );
            return Ok(Probe::FirmwareDownloaded(identified));
        }

        Self::init(identified.description, bus, driver, core, config)
            .map(|device| Probe::Ready(Box::new(device)))
    }

    /// Bring up a warm device
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for bad driver properties, or the first error
    /// of any bring-up step. Nothing stays registered or allocated.
    pub fn init(
        description: DeviceDescription,
        bus: Arc<dyn BusTransport>,
        driver: Arc<dyn DeviceDriver>,
        core: Arc<dyn DvbCore>,
        config: DeviceConfig,
    ) -> Result<Self> {
        let adapters = driver.properties().adapters.len();
        driver.properties().validate()?;

        let ctx = Arc::new(DeviceContext::new(
            description.name,
            driver,
            bus,
            config,
            adapters,
        ));
        let mut device = Self {
            description,
            ctx,
            core,
            state: DeviceState::Uninitialized,
            i2c: None,
            adapters: Vec::new(),
            #[cfg(feature = "remote")]
            remote: None,
        };

        device.ctx.power_up()?;

        if let Err(e) = device.init_subsystems() {
            error!("{}: initialization failed: {e}", description.name);
            device.teardown();
            if let Err(power) = device.ctx.power_down() {
                warn!("{}: power off failed: {power}", description.name);
            }
            return Err(e);
        }

        if let Err(e) = device.ctx.power_down() {
            warn!("{}: power off after init failed: {e}", description.name);
        }

        info!("{} successfully initialized and connected", description.name);
        Ok(device)
    }

    fn init_subsystems(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);

        if let Some(algorithm) = ctx.driver.i2c_algorithm() {
            let i2c = I2cAdapter::new(format!("{} i2c", ctx.name), algorithm);
            debug!("registered {}", i2c.name());
            self.i2c = Some(i2c);
        }
        self.state = DeviceState::I2cReady;

        for (index, props) in ctx.driver.properties().adapters.iter().enumerate() {
            let mut adapter = Adapter::new(index, Arc::clone(&ctx), props);
            let result = adapter.init(self.core.as_ref(), self.i2c.as_ref());
            self.adapters.push(adapter);
            result?;
        }
        self.state = DeviceState::AdaptersReady;

        self.init_remote()?;
        self.state = DeviceState::Ready;
        Ok(())
    }

    #[cfg(feature = "remote")]
    fn init_remote(&mut self) -> Result<()> {
        let Some(props) = self.ctx.driver.properties().remote else {
            return Ok(());
        };
        if self.ctx.config.disable_remote {
            info!("{}: remote control disabled", self.ctx.name);
            return Ok(());
        }
        self.remote = Some(RemoteControl::start(Arc::clone(&self.ctx.driver), props)?);
        Ok(())
    }

    #[cfg(not(feature = "remote"))]
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    fn init_remote(&mut self) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self) {
        #[cfg(feature = "remote")]
        if let Some(mut remote) = self.remote.take() {
            remote.stop();
        }

        while let Some(mut adapter) = self.adapters.pop() {
            adapter.exit(self.core.as_ref());
        }

        if let Some(i2c) = self.i2c.take() {
            debug!("removed {}", i2c.name());
        }
        self.state = DeviceState::Uninitialized;
    }

    /// Tear the device down; idempotent, also runs on drop
    pub fn exit(&mut self) {
        if self.state == DeviceState::Uninitialized && self.adapters.is_empty() {
            return;
        }
        self.teardown();
        info!("{} successfully deinitialized and disconnected", self.ctx.name);
    }

    /// Device-table entry
    #[must_use]
    pub const fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// Product name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Bring-up progress
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Initialized adapters
    #[must_use]
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Adapter `index`
    #[must_use]
    pub fn adapter(&self, index: usize) -> Option<&Adapter> {
        self.adapters.get(index)
    }

    /// I2C adapter, if the driver provides one
    #[must_use]
    pub const fn i2c(&self) -> Option<&I2cAdapter> {
        self.i2c.as_ref()
    }

    /// Current number of power references
    #[must_use]
    pub fn power_users(&self) -> usize {
        self.ctx.power_users()
    }

    /// Remote-control key events, if polling runs
    #[cfg(feature = "remote")]
    #[must_use]
    pub fn remote_events(&self) -> Option<&crossbeam_channel::Receiver<RcEvent>> {
        self.remote.as_ref().map(RemoteControl::events)
    }
}

impl fmt::Debug for DvbUsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DvbUsbDevice")
            .field("name", &self.ctx.name)
            .field("state", &self.state)
            .field("adapters", &self.adapters)
            .field("i2c", &self.i2c)
            .finish_non_exhaustive()
    }
}

impl Drop for DvbUsbDevice {
    fn drop(&mut self) {
        self.exit();
    }
}
