//! Frontends
//!
//! A frontend is the demodulator/tuner pair behind one slot of an adapter.
//! The device driver's attach hook produces one; the adapter wraps it in a
//! [`PoweredFrontend`](crate::power::PoweredFrontend) and hands out a
//! [`FrontendHandle`] to whoever drives tuning.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::power::PoweredFrontend;
use crate::sync::lock;

/// Demodulator operations the streaming core needs
pub trait Frontend: Send {
    /// Display name, used when registering the frontend
    fn name(&self) -> &str;

    /// Wake the demodulator
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Put the demodulator to sleep
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn sleep(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release tuner and demodulator resources after unregistration
    fn detach(&mut self) {}
}

/// Shared handle to a registered, power-bound frontend
#[derive(Clone)]
pub struct FrontendHandle {
    inner: Arc<Mutex<PoweredFrontend>>,
}

impl FrontendHandle {
    pub(crate) fn new(frontend: PoweredFrontend) -> Self {
        Self {
            inner: Arc::new(Mutex::new(frontend)),
        }
    }

    /// Wake the frontend: powers the device up and selects this slot
    ///
    /// # Errors
    ///
    /// Propagates power-control, frontend-control or demodulator failures.
    pub fn init(&self) -> Result<()> {
        lock(&self.inner).init()
    }

    /// Put the frontend to sleep and drop its power reference
    ///
    /// # Errors
    ///
    /// Propagates demodulator or power-control failures.
    pub fn sleep(&self) -> Result<()> {
        lock(&self.inner).sleep()
    }

    /// Frontend name
    pub fn name(&self) -> String {
        lock(&self.inner).name().to_owned()
    }

    /// Frontend slot within the adapter
    pub fn slot(&self) -> usize {
        lock(&self.inner).slot()
    }

    pub(crate) fn detach(&self) {
        lock(&self.inner).detach();
    }
}

impl fmt::Debug for FrontendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontendHandle")
            .field("name", &self.name())
            .finish()
    }
}
