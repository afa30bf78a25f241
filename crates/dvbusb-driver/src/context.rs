//! Device-wide state shared by adapters and frontends.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::bus::BusTransport;
use crate::config::DeviceConfig;
use crate::driver::DeviceDriver;
use crate::error::{DvbUsbError, Result};
use crate::power::{PowerRail, PowerState};
use crate::stream::DataStream;
use crate::sync::lock;

/// Feed bookkeeping of one adapter
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FeedState {
    pub(crate) feedcount: usize,
    pub(crate) active_fe: Option<usize>,
    /// Slot whose stream the first feed started
    pub(crate) streaming_fe: Option<usize>,
}

/// Everything the per-device mutex serializes
#[derive(Debug)]
pub(crate) struct ControlState {
    pub(crate) power: PowerRail,
    pub(crate) adapters: Vec<FeedState>,
}

pub(crate) struct DeviceContext {
    pub(crate) name: String,
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) bus: Arc<dyn BusTransport>,
    pub(crate) config: DeviceConfig,
    control: Mutex<ControlState>,
}

impl DeviceContext {
    pub(crate) fn new(
        name: impl Into<String>,
        driver: Arc<dyn DeviceDriver>,
        bus: Arc<dyn BusTransport>,
        config: DeviceConfig,
        adapters: usize,
    ) -> Self {
        Self {
            name: name.into(),
            driver,
            bus,
            config,
            control: Mutex::new(ControlState {
                power: PowerRail::new(),
                adapters: vec![FeedState::default(); adapters],
            }),
        }
    }

    pub(crate) fn control(&self) -> MutexGuard<'_, ControlState> {
        lock(&self.control)
    }

    /// Take a power reference; the hook runs on the off to on edge only
    pub(crate) fn power_up(&self) -> Result<()> {
        let mut control = self.control();
        if control.power.acquire() == Some(PowerState::On) {
            debug!("{}: power on", self.name);
            if let Err(e) = self.driver.power_ctrl(true) {
                let _ = control.power.release();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop a power reference; the hook runs on the on to off edge only
    pub(crate) fn power_down(&self) -> Result<()> {
        let mut control = self.control();
        if control.power.release() == Some(PowerState::Off) {
            debug!("{}: power off", self.name);
            self.driver.power_ctrl(false)?;
        }
        Ok(())
    }

    pub(crate) fn power_users(&self) -> usize {
        self.control().power.users()
    }

    /// Make `slot` the adapter's active frontend
    ///
    /// Refused while another slot's stream carries feeds.
    pub(crate) fn select_frontend(&self, adapter: usize, slot: usize) -> Result<()> {
        let mut control = self.control();
        let state = control
            .adapters
            .get_mut(adapter)
            .ok_or_else(|| DvbUsbError::invalid_config(format!("no adapter {adapter}")))?;
        if let Some(busy) = state.streaming_fe.filter(|&fe| fe != slot) {
            return Err(DvbUsbError::device_error(format!(
                "adapter {adapter}: frontend {busy} is streaming {} feeds",
                state.feedcount
            )));
        }
        state.active_fe = Some(slot);
        Ok(())
    }

    /// Deselect `slot`, stopping its stream if the feeds are running on it
    ///
    /// The feeds stay registered; the next `start_feed` restarts streaming.
    pub(crate) fn release_frontend(
        &self,
        adapter: usize,
        slot: usize,
        stream: &Mutex<DataStream>,
    ) {
        let mut control = self.control();
        let Some(state) = control.adapters.get_mut(adapter) else {
            return;
        };
        if state.active_fe == Some(slot) {
            state.active_fe = None;
        }
        if state.streaming_fe == Some(slot) {
            warn!(
                "{}: adapter {adapter} frontend {slot} sleeping with {} feeds, stopping its stream",
                self.name, state.feedcount
            );
            lock(stream).kill();
            state.streaming_fe = None;
            if let Err(e) = self.driver.streaming_ctrl(adapter, false) {
                warn!("{}: adapter {adapter}: streaming control off failed: {e}", self.name);
            }
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.name)
            .field("bus", &self.bus)
            .field("control", &*self.control())
            .finish_non_exhaustive()
    }
}
