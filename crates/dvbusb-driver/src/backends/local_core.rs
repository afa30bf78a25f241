//! In-process DVB core
//!
//! Keeps a journal of registrations and hands out a [`SoftwareDemux`] per
//! adapter. Individual registrations can be made to fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::demux::{Demux, SoftwareDemux};
use crate::dvb::{DemuxLimits, DvbCore};
use crate::error::{DvbUsbError, Result};
use crate::sync::lock;

/// Registration journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Adapter registered
    AdapterRegistered(usize),
    /// Adapter unregistered
    AdapterUnregistered(usize),
    /// Demux and device node registered
    DemuxRegistered(usize, DemuxLimits),
    /// Demux and device node unregistered
    DemuxUnregistered(usize),
    /// Network interface registered
    NetRegistered(usize),
    /// Network interface unregistered
    NetUnregistered(usize),
    /// Frontend registered (adapter, slot, name)
    FrontendRegistered(usize, usize, String),
    /// Frontend unregistered (adapter, slot)
    FrontendUnregistered(usize, usize),
}

/// Which registration to refuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoreFault {
    /// `register_adapter` for this adapter
    Adapter(usize),
    /// `register_demux` for this adapter
    Demux(usize),
    /// `register_net` for this adapter
    Net(usize),
    /// `register_frontend` for this adapter and slot
    Frontend(usize, usize),
}

#[derive(Debug, Default)]
struct CoreState {
    events: Vec<CoreEvent>,
    demuxes: BTreeMap<usize, Arc<SoftwareDemux>>,
    faults: BTreeSet<CoreFault>,
}

/// DVB core living in this process
#[derive(Debug)]
pub struct LocalDvbCore {
    state: Mutex<CoreState>,
    demux_depth: usize,
}

impl LocalDvbCore {
    /// Core whose demuxes use the default ring depth
    pub fn new() -> Self {
        Self::with_demux_depth(SoftwareDemux::DEFAULT_DEPTH)
    }

    /// Core whose demuxes hold `depth` chunks
    pub fn with_demux_depth(depth: usize) -> Self {
        Self {
            state: Mutex::default(),
            demux_depth: depth,
        }
    }

    /// Make a registration fail
    pub fn inject_fault(&self, fault: CoreFault) {
        lock(&self.state).faults.insert(fault);
    }

    /// Journal so far
    pub fn events(&self) -> Vec<CoreEvent> {
        lock(&self.state).events.clone()
    }

    /// Demux currently registered for `adapter`
    pub fn demux(&self, adapter: usize) -> Option<Arc<SoftwareDemux>> {
        lock(&self.state).demuxes.get(&adapter).cloned()
    }

    /// Whether nothing is left registered
    pub fn is_clean(&self) -> bool {
        let state = lock(&self.state);
        let registered = state
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CoreEvent::AdapterRegistered(_)
                        | CoreEvent::DemuxRegistered(..)
                        | CoreEvent::NetRegistered(_)
                        | CoreEvent::FrontendRegistered(..)
                )
            })
            .count();
        state.demuxes.is_empty() && registered * 2 == state.events.len()
    }

    fn check(&self, fault: CoreFault) -> Result<()> {
        if lock(&self.state).faults.contains(&fault) {
            return Err(DvbUsbError::device_error(format!("{fault:?} registration refused")));
        }
        Ok(())
    }

    fn record(&self, event: CoreEvent) {
        debug!("dvb core: {event:?}");
        lock(&self.state).events.push(event);
    }
}

impl Default for LocalDvbCore {
    fn default() -> Self {
        Self::new()
    }
}

impl DvbCore for LocalDvbCore {
    fn register_adapter(&self, adapter: usize, name: &str) -> Result<()> {
        self.check(CoreFault::Adapter(adapter))?;
        info!("DVB adapter {adapter}: {name}");
        self.record(CoreEvent::AdapterRegistered(adapter));
        Ok(())
    }

    fn unregister_adapter(&self, adapter: usize) {
        self.record(CoreEvent::AdapterUnregistered(adapter));
    }

    fn register_demux(&self, adapter: usize, limits: DemuxLimits) -> Result<Arc<dyn Demux>> {
        self.check(CoreFault::Demux(adapter))?;
        let demux = Arc::new(SoftwareDemux::new(self.demux_depth));
        lock(&self.state).demuxes.insert(adapter, Arc::clone(&demux));
        self.record(CoreEvent::DemuxRegistered(adapter, limits));
        Ok(demux)
    }

    fn unregister_demux(&self, adapter: usize) {
        lock(&self.state).demuxes.remove(&adapter);
        self.record(CoreEvent::DemuxUnregistered(adapter));
    }

    fn register_net(&self, adapter: usize) -> Result<()> {
        self.check(CoreFault::Net(adapter))?;
        self.record(CoreEvent::NetRegistered(adapter));
        Ok(())
    }

    fn unregister_net(&self, adapter: usize) {
        self.record(CoreEvent::NetUnregistered(adapter));
    }

    fn register_frontend(&self, adapter: usize, slot: usize, name: &str) -> Result<()> {
        self.check(CoreFault::Frontend(adapter, slot))?;
        self.record(CoreEvent::FrontendRegistered(adapter, slot, name.to_owned()));
        Ok(())
    }

    fn unregister_frontend(&self, adapter: usize, slot: usize) {
        self.record(CoreEvent::FrontendUnregistered(adapter, slot));
    }
}
