//! Device power reference counting and the frontend power binder
//!
//! Any number of users may hold the device powered: the initialization
//! sequence, and every awake frontend. The device-specific power hook runs
//! only when the count crosses zero.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::Result;
use crate::frontend::Frontend;
use crate::stream::DataStream;

/// Device power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// No users
    Off,
    /// At least one user
    On,
}

/// Reference-counted power switch
#[derive(Debug, Default)]
pub struct PowerRail {
    users: usize,
}

impl PowerRail {
    /// Unpowered rail
    pub const fn new() -> Self {
        Self { users: 0 }
    }

    /// Add a user; returns `Some(On)` if this turned the device on
    #[must_use]
    pub fn acquire(&mut self) -> Option<PowerState> {
        self.users += 1;
        (self.users == 1).then_some(PowerState::On)
    }

    /// Remove a user; returns `Some(Off)` if this turned the device off
    ///
    /// Releasing an unpowered rail is logged and ignored.
    #[must_use]
    pub fn release(&mut self) -> Option<PowerState> {
        if self.users == 0 {
            warn!("power release without a matching acquire");
            return None;
        }
        self.users -= 1;
        (self.users == 0).then_some(PowerState::Off)
    }

    /// Current number of users
    pub const fn users(&self) -> usize {
        self.users
    }

    /// Current state
    pub const fn state(&self) -> PowerState {
        if self.users > 0 {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

/// Frontend decorator that ties wake/sleep to device power
///
/// Wake: power reference, frontend-control hook, select this slot as the
/// adapter's active frontend, then the demodulator's own `init`.
/// Sleep: demodulator `sleep`, frontend-control hook, deselect (stopping
/// this slot's stream if feeds still run on it), then drop the power
/// reference.
pub struct PoweredFrontend {
    inner: Box<dyn Frontend>,
    ctx: Arc<DeviceContext>,
    stream: Arc<Mutex<DataStream>>,
    adapter: usize,
    slot: usize,
}

impl PoweredFrontend {
    pub(crate) fn new(
        inner: Box<dyn Frontend>,
        ctx: Arc<DeviceContext>,
        stream: Arc<Mutex<DataStream>>,
        adapter: usize,
        slot: usize,
    ) -> Self {
        Self {
            inner,
            ctx,
            stream,
            adapter,
            slot,
        }
    }

    /// Slot within the adapter
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl Frontend for PoweredFrontend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&mut self) -> Result<()> {
        debug!("adapter {} frontend {}: wake", self.adapter, self.slot);
        self.ctx.power_up()?;

        if let Err(e) = self.ctx.driver.frontend_ctrl(self.adapter, self.slot, true) {
            if let Err(power) = self.ctx.power_down() {
                warn!("power off after failed wake: {power}");
            }
            return Err(e);
        }
        if let Err(e) = self.ctx.select_frontend(self.adapter, self.slot) {
            if let Err(ctrl) = self.ctx.driver.frontend_ctrl(self.adapter, self.slot, false) {
                warn!("frontend control off after failed wake: {ctrl}");
            }
            if let Err(power) = self.ctx.power_down() {
                warn!("power off after failed wake: {power}");
            }
            return Err(e);
        }
        self.inner.init()
    }

    fn sleep(&mut self) -> Result<()> {
        debug!("adapter {} frontend {}: sleep", self.adapter, self.slot);
        let result = self.inner.sleep();

        if let Err(e) = self.ctx.driver.frontend_ctrl(self.adapter, self.slot, false) {
            warn!(
                "adapter {} frontend {}: frontend control off failed: {e}",
                self.adapter, self.slot
            );
        }
        self.ctx.release_frontend(self.adapter, self.slot, &self.stream);
        self.ctx.power_down()?;
        result
    }

    fn detach(&mut self) {
        self.inner.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_zero_crossings_are_transitions() {
        let mut rail = PowerRail::new();
        assert_eq!(rail.acquire(), Some(PowerState::On));
        assert_eq!(rail.acquire(), None);
        assert_eq!(rail.release(), None);
        assert_eq!(rail.state(), PowerState::On);
        assert_eq!(rail.release(), Some(PowerState::Off));
        assert_eq!(rail.state(), PowerState::Off);
    }

    #[test]
    fn unbalanced_release_is_ignored() {
        let mut rail = PowerRail::new();
        assert_eq!(rail.release(), None);
        assert_eq!(rail.users(), 0);
        assert_eq!(rail.acquire(), Some(PowerState::On));
    }
}
