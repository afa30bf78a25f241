//! DVB core registration interface
//!
//! The device lifecycle registers each adapter, its demux (with the device
//! node facade and network interface) and its frontends with a [`DvbCore`].
//! [`LocalDvbCore`](crate::backends::LocalDvbCore) is the in-process
//! implementation.

use std::fmt::Debug;
use std::sync::Arc;

use crate::demux::Demux;
use crate::error::Result;

/// Demux capabilities announced at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxLimits {
    /// Maximum number of simultaneous feeds
    pub max_feeds: usize,
    /// Whether a hardware PID filter pre-selects the stream
    pub hardware_filter: bool,
}

/// Adapter, demux and frontend registration
pub trait DvbCore: Debug + Send + Sync {
    /// Register adapter `adapter` under `name`
    ///
    /// # Errors
    ///
    /// Implementation-defined registration failure.
    fn register_adapter(&self, adapter: usize, name: &str) -> Result<()>;

    /// Undo [`register_adapter`](Self::register_adapter)
    fn unregister_adapter(&self, adapter: usize);

    /// Register the demux and its device node; returns the demux that will
    /// receive the adapter's stream
    ///
    /// # Errors
    ///
    /// Implementation-defined registration failure.
    fn register_demux(&self, adapter: usize, limits: DemuxLimits) -> Result<Arc<dyn Demux>>;

    /// Undo [`register_demux`](Self::register_demux)
    fn unregister_demux(&self, adapter: usize);

    /// Register the network interface of the adapter
    ///
    /// # Errors
    ///
    /// Implementation-defined registration failure.
    fn register_net(&self, adapter: usize) -> Result<()>;

    /// Undo [`register_net`](Self::register_net)
    fn unregister_net(&self, adapter: usize);

    /// Register frontend `slot` of adapter `adapter`
    ///
    /// # Errors
    ///
    /// Implementation-defined registration failure.
    fn register_frontend(&self, adapter: usize, slot: usize, name: &str) -> Result<()>;

    /// Undo [`register_frontend`](Self::register_frontend)
    fn unregister_frontend(&self, adapter: usize, slot: usize);
}
