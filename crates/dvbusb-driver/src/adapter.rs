//! Adapters and the feed controller
//!
//! An adapter is one DVB adapter of a device: a demux, up to three frontend
//! slots, and one data stream per slot. Only the active slot streams, and
//! the active slot cannot change while its stream carries feeds.
//!
//! Streaming is edge-triggered on the adapter's feed count:
//!
//! ```text
//!  start_feed  0 ─▶ 1 : kill (no-op), streaming_ctrl(on), submit,
//!                       pid_filter_ctrl (switchable filters only)
//!  start_feed  n ─▶ n+1: nothing but the filter entry
//!  stop_feed   1 ─▶ 0 : (filter entry off first) kill, streaming_ctrl(off)
//! ```
//!
//! The stream that is stopped is the one the first feed started, whichever
//! frontend is active by then. Sleeping that frontend stops its stream early;
//! the next `start_feed` starts it again.
//!
//! The stream sink forwards to the demux only while the count is non-zero.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dvbusb_hw::limits::{MAX_PID, SOFTWARE_MAX_FEEDS};
use tracing::{debug, info, warn};

use crate::bus::BusSpeed;
use crate::context::{DeviceContext, FeedState};
use crate::demux::Demux;
use crate::driver::{AdapterProperties, AttachContext, FrontendSlotProperties, PidFilterCaps};
use crate::dvb::{DemuxLimits, DvbCore};
use crate::error::{DvbUsbError, Result};
use crate::frontend::FrontendHandle;
use crate::i2c::I2cAdapter;
use crate::power::PoweredFrontend;
use crate::stream::{DataStream, StreamSink, StreamStatsSnapshot};
use crate::sync::lock;

/// How PIDs are selected for a frontend slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFiltering {
    /// The device filters in hardware with a table of `table_size` entries
    Hardware {
        /// Filter table size
        table_size: usize,
    },
    /// The full transport stream goes to the software demux
    Software,
}

impl PidFiltering {
    /// Choose filtering for a slot
    ///
    /// Required filters are always used. Optional filters are used on
    /// full-speed links, where the full stream does not fit, or when forced.
    pub const fn choose(caps: PidFilterCaps, speed: BusSpeed, force: bool) -> Self {
        match caps {
            PidFilterCaps::None => Self::Software,
            PidFilterCaps::Required { count } => Self::Hardware { table_size: count },
            PidFilterCaps::Optional { count } => {
                if force || matches!(speed, BusSpeed::Full) {
                    Self::Hardware { table_size: count }
                } else {
                    Self::Software
                }
            }
        }
    }

    /// Number of simultaneous feeds this filtering supports
    pub const fn max_feeds(self) -> usize {
        match self {
            Self::Hardware { table_size } => table_size,
            Self::Software => SOFTWARE_MAX_FEEDS,
        }
    }

    /// Whether a hardware table is in use
    pub const fn is_hardware(self) -> bool {
        matches!(self, Self::Hardware { .. })
    }
}

/// A feed requested by the demux
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedDescriptor {
    /// Packet id
    pub pid: u16,
    /// Hardware filter table entry for this feed
    pub index: usize,
}

impl FeedDescriptor {
    /// Feed for `pid` in filter entry `index`
    pub const fn new(pid: u16, index: usize) -> Self {
        Self { pid, index }
    }
}

/// Stream sink of an adapter
struct AdapterSink {
    feeds: Arc<AtomicUsize>,
    demux: Arc<OnceLock<Arc<dyn Demux>>>,
}

impl StreamSink for AdapterSink {
    fn deliver(&self, data: &[u8]) {
        if self.feeds.load(Ordering::Acquire) == 0 {
            return;
        }
        if let Some(demux) = self.demux.get() {
            demux.deliver(data);
        }
    }
}

struct FrontendSlot {
    props: FrontendSlotProperties,
    filtering: PidFiltering,
    stream: Arc<Mutex<DataStream>>,
    frontend: Option<FrontendHandle>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Registered {
    adapter: bool,
    demux: bool,
    net: bool,
}

/// One DVB adapter of a device
pub struct Adapter {
    id: usize,
    ctx: Arc<DeviceContext>,
    slots: Vec<FrontendSlot>,
    feeds: Arc<AtomicUsize>,
    demux: Arc<OnceLock<Arc<dyn Demux>>>,
    registered: Registered,
}

impl Adapter {
    pub(crate) fn new(id: usize, ctx: Arc<DeviceContext>, props: &AdapterProperties) -> Self {
        let feeds = Arc::new(AtomicUsize::new(0));
        let demux = Arc::new(OnceLock::new());
        let sink: Arc<dyn StreamSink> = Arc::new(AdapterSink {
            feeds: Arc::clone(&feeds),
            demux: Arc::clone(&demux),
        });

        let speed = ctx.bus.speed();
        let slots = props
            .frontends
            .iter()
            .enumerate()
            .map(|(s, slot)| {
                let filtering =
                    PidFiltering::choose(slot.pid_filter, speed, ctx.config.force_pid_filter);
                match filtering {
                    PidFiltering::Hardware { table_size } => {
                        info!("adapter {id} frontend {s}: hardware PID filter of {table_size}");
                    }
                    PidFiltering::Software => {
                        info!("adapter {id} frontend {s}: full transport stream to the demux");
                    }
                }
                FrontendSlot {
                    props: slot.clone(),
                    filtering,
                    stream: Arc::new(Mutex::new(
                        DataStream::new(Arc::clone(&ctx.bus)).with_sink(Arc::clone(&sink)),
                    )),
                    frontend: None,
                }
            })
            .collect();

        Self {
            id,
            ctx,
            slots,
            feeds,
            demux,
            registered: Registered::default(),
        }
    }

    /// Streams, DVB registration, demux and net, then frontends
    ///
    /// Partial progress is recorded so [`exit`](Self::exit) can undo it.
    pub(crate) fn init(&mut self, core: &dyn DvbCore, i2c: Option<&I2cAdapter>) -> Result<()> {
        for slot in &self.slots {
            lock(&slot.stream).init(&slot.props.stream)?;
        }

        core.register_adapter(self.id, &self.ctx.name)?;
        self.registered.adapter = true;

        let limits = DemuxLimits {
            max_feeds: self.max_feeds(),
            hardware_filter: self.slots.iter().any(|s| s.filtering.is_hardware()),
        };
        let demux = core.register_demux(self.id, limits)?;
        // A fresh adapter has an empty cell
        let _ = self.demux.set(demux);
        self.registered.demux = true;

        core.register_net(self.id)?;
        self.registered.net = true;

        self.attach_frontends(core, i2c)
    }

    fn attach_frontends(&mut self, core: &dyn DvbCore, i2c: Option<&I2cAdapter>) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);

        for s in 0..self.slots.len() {
            let attach = AttachContext {
                adapter: self.id,
                slot: s,
                bus: &ctx.bus,
                i2c,
            };

            let mut frontend = match ctx.driver.frontend_attach(&attach) {
                Ok(Some(frontend)) => frontend,
                Ok(None) => {
                    warn!("adapter {} frontend {s}: no frontend attached, skipping", self.id);
                    continue;
                }
                Err(e) => {
                    warn!("adapter {} frontend {s}: attach failed: {e}", self.id);
                    break;
                }
            };

            if let Err(e) = core.register_frontend(self.id, s, frontend.name()) {
                frontend.detach();
                if s == 0 {
                    return Err(DvbUsbError::device_error(format!(
                        "adapter {}: registering frontend 0 failed: {e}",
                        self.id
                    )));
                }
                warn!(
                    "adapter {} frontend {s}: registration failed, running with {s} frontends: {e}",
                    self.id
                );
                break;
            }

            if let Err(e) = ctx.driver.tuner_attach(&attach, frontend.as_mut()) {
                warn!("adapter {} frontend {s}: no tuner attached: {e}", self.id);
            }

            info!("adapter {} frontend {s}: {}", self.id, frontend.name());
            self.slots[s].frontend = Some(FrontendHandle::new(PoweredFrontend::new(
                frontend,
                Arc::clone(&ctx),
                Arc::clone(&self.slots[s].stream),
                self.id,
                s,
            )));
        }
        Ok(())
    }

    /// Undo whatever `init` completed, in reverse
    pub(crate) fn exit(&mut self, core: &dyn DvbCore) {
        self.feeds.store(0, Ordering::Release);

        for s in (0..self.slots.len()).rev() {
            if let Some(frontend) = self.slots[s].frontend.take() {
                core.unregister_frontend(self.id, s);
                frontend.detach();
            }
        }

        let registered = std::mem::take(&mut self.registered);
        if registered.net {
            core.unregister_net(self.id);
        }
        if registered.demux {
            core.unregister_demux(self.id);
        }
        if registered.adapter {
            core.unregister_adapter(self.id);
        }

        for slot in &self.slots {
            lock(&slot.stream).exit();
        }

        if let Some(state) = self.ctx.control().adapters.get_mut(self.id) {
            *state = FeedState::default();
        }
        debug!("adapter {} torn down", self.id);
    }

    /// Start a feed
    ///
    /// On the first feed the active slot's stream is started. Later feeds
    /// join the stream already running.
    ///
    /// # Errors
    ///
    /// - `DeviceError`: no active frontend, or a device hook failed
    /// - `InvalidConfiguration`: bad PID, filter index beyond the table, or
    ///   feed limit reached
    /// - `TransportError`: the stream could not be submitted
    pub fn start_feed(&self, feed: &FeedDescriptor) -> Result<()> {
        if feed.pid > MAX_PID {
            return Err(DvbUsbError::invalid_config(format!(
                "pid {:#x} out of range",
                feed.pid
            )));
        }

        let mut control = self.ctx.control();
        let state = control
            .adapters
            .get_mut(self.id)
            .ok_or_else(|| DvbUsbError::invalid_config(format!("no adapter {}", self.id)))?;
        let slot = match state.streaming_fe {
            Some(fe) => self.slot(fe)?,
            None => self.active_slot(state)?,
        };

        if let PidFiltering::Hardware { table_size } = slot.filtering {
            if feed.index >= table_size {
                return Err(DvbUsbError::invalid_config(format!(
                    "pid filter index {} beyond table of {table_size}",
                    feed.index
                )));
            }
        }
        if state.feedcount >= slot.filtering.max_feeds() {
            return Err(DvbUsbError::invalid_config(format!(
                "adapter {}: all {} feeds in use",
                self.id, state.feedcount
            )));
        }

        debug!(
            "adapter {}: start feed pid {:#06x} index {} ({} active)",
            self.id, feed.pid, feed.index, state.feedcount
        );

        if state.streaming_fe.is_none() {
            self.feeds.store(state.feedcount + 1, Ordering::Release);
            if let Err(e) = self.start_streaming(slot) {
                self.feeds.store(state.feedcount, Ordering::Release);
                return Err(e);
            }
            state.streaming_fe = state.active_fe;
        }
        state.feedcount += 1;
        self.feeds.store(state.feedcount, Ordering::Release);

        if slot.filtering.is_hardware() {
            if let Err(e) = self.ctx.driver.pid_filter(self.id, feed.index, feed.pid, true) {
                warn!(
                    "adapter {}: adding pid {:#06x} to filter entry {} failed: {e}",
                    self.id, feed.pid, feed.index
                );
            }
        }
        if let Some(demux) = self.demux.get() {
            demux.set_filter(feed.pid, true);
        }
        Ok(())
    }

    fn start_streaming(&self, slot: &FrontendSlot) -> Result<()> {
        let mut stream = lock(&slot.stream);
        stream.kill();

        info!("adapter {}: start streaming", self.id);
        self.ctx
            .driver
            .streaming_ctrl(self.id, true)
            .map_err(|e| DvbUsbError::device_error(format!("streaming control on: {e}")))?;

        if let Err(e) = stream.submit() {
            self.streaming_off_after_failure();
            return Err(e);
        }

        if let PidFilterCaps::Optional { .. } = slot.props.pid_filter {
            let enabled = slot.filtering.is_hardware();
            if let Err(e) = self.ctx.driver.pid_filter_ctrl(self.id, enabled) {
                stream.kill();
                self.streaming_off_after_failure();
                return Err(DvbUsbError::device_error(format!(
                    "pid filter control ({}): {e}",
                    if enabled { "on" } else { "off" }
                )));
            }
        }
        Ok(())
    }

    fn streaming_off_after_failure(&self) {
        if let Err(e) = self.ctx.driver.streaming_ctrl(self.id, false) {
            warn!("adapter {}: streaming control off failed: {e}", self.id);
        }
    }

    /// Stop a feed
    ///
    /// The hardware filter entry is cleared on every call; the stream is
    /// stopped when the last feed goes. Stopping with no feeds active is
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// `DeviceError` if streaming control fails.
    pub fn stop_feed(&self, feed: &FeedDescriptor) -> Result<()> {
        let mut control = self.ctx.control();
        let state = control
            .adapters
            .get_mut(self.id)
            .ok_or_else(|| DvbUsbError::invalid_config(format!("no adapter {}", self.id)))?;

        if state.feedcount == 0 {
            warn!(
                "adapter {}: stop feed pid {:#06x} with no feeds active",
                self.id, feed.pid
            );
            return Ok(());
        }

        debug!(
            "adapter {}: stop feed pid {:#06x} index {} ({} active)",
            self.id, feed.pid, feed.index, state.feedcount
        );

        let slot = state.streaming_fe.and_then(|fe| self.slots.get(fe));
        if slot.is_some_and(|slot| slot.filtering.is_hardware()) {
            if let Err(e) = self.ctx.driver.pid_filter(self.id, feed.index, feed.pid, false) {
                warn!(
                    "adapter {}: clearing filter entry {} failed: {e}",
                    self.id, feed.index
                );
            }
        }
        if let Some(demux) = self.demux.get() {
            demux.set_filter(feed.pid, false);
        }

        state.feedcount -= 1;
        self.feeds.store(state.feedcount, Ordering::Release);

        if state.feedcount > 0 {
            return Ok(());
        }
        if let Some(slot) = slot {
            state.streaming_fe = None;
            info!("adapter {}: stop streaming", self.id);
            lock(&slot.stream).kill();
            self.ctx
                .driver
                .streaming_ctrl(self.id, false)
                .map_err(|e| DvbUsbError::device_error(format!("streaming control off: {e}")))?;
        }
        Ok(())
    }

    fn active_slot(&self, state: &FeedState) -> Result<&FrontendSlot> {
        let index = state.active_fe.ok_or_else(|| {
            DvbUsbError::device_error(format!("adapter {}: no active frontend", self.id))
        })?;
        self.slot(index)
    }

    fn slot(&self, index: usize) -> Result<&FrontendSlot> {
        self.slots.get(index).ok_or_else(|| {
            DvbUsbError::device_error(format!(
                "adapter {}: frontend {index} not initialized",
                self.id
            ))
        })
    }

    /// Adapter index within the device
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Number of frontend slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Registered frontend of `slot`
    pub fn frontend(&self, slot: usize) -> Option<&FrontendHandle> {
        self.slots.get(slot)?.frontend.as_ref()
    }

    /// Number of registered frontends
    pub fn frontend_count(&self) -> usize {
        self.slots.iter().filter(|s| s.frontend.is_some()).count()
    }

    /// PID filtering chosen for `slot`
    pub fn pid_filtering(&self, slot: usize) -> Option<PidFiltering> {
        self.slots.get(slot).map(|s| s.filtering)
    }

    /// Feeds the demux may open; the tightest of all slots
    pub fn max_feeds(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.filtering.max_feeds())
            .min()
            .unwrap_or(SOFTWARE_MAX_FEEDS)
    }

    /// Active feeds
    pub fn feed_count(&self) -> usize {
        self.ctx
            .control()
            .adapters
            .get(self.id)
            .map_or(0, |state| state.feedcount)
    }

    /// Currently selected frontend slot
    pub fn active_frontend(&self) -> Option<usize> {
        self.ctx
            .control()
            .adapters
            .get(self.id)
            .and_then(|state| state.active_fe)
    }

    /// Whether the stream of `slot` is submitted
    pub fn is_streaming(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| lock(&s.stream).is_submitted())
    }

    /// Completion counters of the stream of `slot`
    pub fn stream_stats(&self, slot: usize) -> Option<StreamStatsSnapshot> {
        self.slots.get(slot).map(|s| lock(&s.stream).stats())
    }

    /// The registered demux
    pub fn demux(&self) -> Option<Arc<dyn Demux>> {
        self.demux.get().cloned()
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.id)
            .field("slots", &self.slots.len())
            .field("feeds", &self.feeds.load(Ordering::Relaxed))
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}
