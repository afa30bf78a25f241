//! Data streams
//!
//! A [`DataStream`] owns up to `MAX_URBS_PER_STREAM` (10) transfer objects and
//! their coherent buffers, and keeps them all in flight while submitted.
//!
//! ```text
//!  Uninitialized ──init()──▶ Initialized ──submit()──▶ Submitted
//!        ▲                      ▲   │                     │
//!        └────────exit()────────┘   └◀──────kill()────────┘
//! ```
//!
//! # Completion path
//!
//! Completions arrive on the bus's completion thread. The handler forwards
//! data to the [`StreamSink`] and immediately resubmits the URB, so no buffer
//! idles while the stream is submitted. Kill sets a gate under the same lock
//! the handler holds while resubmitting, cancels every URB and then waits
//! until each one has been parked back in the stream. Once `kill()` returns,
//! no completion for this stream can run.
//!
//! Latency budget of the handler: one sink call per bulk transfer (or per
//! isochronous frame), two short uncontended lock acquisitions and one bus
//! submit. Sinks must not block; [`SoftwareDemux`](crate::SoftwareDemux)
//! enqueues into a bounded ring and drops on overflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dvbusb_hw::stream::{IsocLayout, StreamProperties, TransferKind};
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, CoherentBuffer};
use crate::bus::{BusTransport, Pipe, UrbKey};
use crate::error::{DvbUsbError, Result};
use crate::sync::{lock, wait_timeout};
use crate::urb::{Urb, UrbCompletion};

/// How long `kill()` waits before re-issuing cancels for missing URBs.
const KILL_RECHECK: Duration = Duration::from_secs(1);

/// Consumer of received stream data
///
/// Called from the completion context: implementations must return quickly
/// and never block.
pub trait StreamSink: Send + Sync {
    /// Consume `data`; the slice is only valid for the duration of the call
    fn deliver(&self, data: &[u8]);
}

impl<F> StreamSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn deliver(&self, data: &[u8]) {
        self(data);
    }
}

/// Completion counters of one stream
#[derive(Debug, Default)]
pub struct StreamStats {
    completed: AtomicU64,
    bytes_delivered: AtomicU64,
    frame_errors: AtomicU64,
    transport_errors: AtomicU64,
    resubmit_failures: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatsSnapshot {
    /// Transfers completed with data processing
    pub completed: u64,
    /// Bytes forwarded to the sink
    pub bytes_delivered: u64,
    /// Isochronous frames skipped for a bad status
    pub frame_errors: u64,
    /// Transfers completed with a transport error status
    pub transport_errors: u64,
    /// Resubmissions the bus refused
    pub resubmit_failures: u64,
}

impl StreamStats {
    pub(crate) fn record_bytes(&self, len: usize) {
        self.bytes_delivered.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a stream and its in-flight URBs
struct StreamShared {
    id: u64,
    bus: Arc<dyn BusTransport>,
    sink: Arc<dyn StreamSink>,
    /// `true` while the stream is being killed; held across resubmission
    killing: Mutex<bool>,
    /// URBs not owned by the bus, by slot
    parked: Mutex<Vec<Option<Box<Urb>>>>,
    returned: Condvar,
    stats: Arc<StreamStats>,
}

impl StreamShared {
    fn park(&self, urb: Box<Urb>) {
        let index = urb.key().index;
        let mut parked = lock(&self.parked);
        if let Some(slot) = parked.get_mut(index) {
            *slot = Some(urb);
        }
        drop(parked);
        self.returned.notify_all();
    }

    fn take(&self, index: usize) -> Option<Box<Urb>> {
        lock(&self.parked).get_mut(index).and_then(Option::take)
    }
}

impl UrbCompletion for StreamShared {
    fn complete(&self, mut urb: Box<Urb>) {
        let status = urb.status();
        if status.is_terminal() {
            debug!("urb {} returned: {status}", urb.key().index);
            self.park(urb);
            return;
        }
        if status.is_error() {
            debug!("urb {} completion error: {status}", urb.key().index);
            self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        }

        urb.deliver(self.sink.as_ref(), &self.stats);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);

        let killing = lock(&self.killing);
        if *killing {
            drop(killing);
            self.park(urb);
            return;
        }
        if let Err(rejected) = self.bus.submit(urb) {
            drop(killing);
            warn!(
                "resubmit of urb {} failed: {}",
                rejected.urb.key().index,
                rejected.reason
            );
            self.stats.resubmit_failures.fetch_add(1, Ordering::Relaxed);
            self.park(rejected.urb);
        }
    }
}

/// Bulk or isochronous receive stream
pub struct DataStream {
    bus: Arc<dyn BusTransport>,
    pool: BufferPool,
    sink: Option<Arc<dyn StreamSink>>,
    props: Option<StreamProperties>,
    shared: Option<Arc<StreamShared>>,
    stats: Arc<StreamStats>,
    urbs_initialized: usize,
    urbs_submitted: usize,
}

impl DataStream {
    /// Create an uninitialized stream on `bus`
    pub fn new(bus: Arc<dyn BusTransport>) -> Self {
        Self {
            pool: BufferPool::new(Arc::clone(&bus)),
            bus,
            sink: None,
            props: None,
            shared: None,
            stats: Arc::new(StreamStats::default()),
            urbs_initialized: 0,
            urbs_submitted: 0,
        }
    }

    /// Set the completion sink (takes effect at the next `init`)
    pub fn set_sink(&mut self, sink: Arc<dyn StreamSink>) {
        self.sink = Some(sink);
    }

    /// Builder form of [`set_sink`](Self::set_sink)
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.set_sink(sink);
        self
    }

    /// Allocate buffers and transfer objects for `props`
    ///
    /// # Errors
    ///
    /// - `InvalidConfiguration`: no sink, a bad layout, or already initialized
    /// - `OutOfMemory`: a buffer allocation failed; everything this call
    ///   allocated has been released and the stream stays uninitialized
    pub fn init(&mut self, props: &StreamProperties) -> Result<()> {
        if self.urbs_initialized > 0 {
            return Err(DvbUsbError::invalid_config("stream already initialized"));
        }
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| DvbUsbError::invalid_config("stream has no completion sink"))?;
        props.check()?;

        let pipe = match props.kind {
            TransferKind::Bulk { .. } => Pipe::bulk_in(props.endpoint),
            TransferKind::Isoc(_) => Pipe::isoc_in(props.endpoint),
        };
        if let Err(e) = self.bus.clear_halt(pipe) {
            warn!("clear halt on endpoint {:#04x} failed: {e}", pipe.address());
        }

        // Streams are told apart on the bus by the address of their shared
        // state, which is unique while any of their URBs exist.
        let shared = Arc::new_cyclic(|weak| StreamShared {
            id: weak.as_ptr() as usize as u64,
            bus: Arc::clone(&self.bus),
            sink,
            killing: Mutex::new(false),
            parked: Mutex::new(Vec::with_capacity(props.count)),
            returned: Condvar::new(),
            stats: Arc::clone(&self.stats),
        });

        let urbs = match props.kind {
            TransferKind::Bulk { buffer_size } => {
                self.init_bulk(&shared, props.count, props.endpoint, buffer_size)?
            }
            TransferKind::Isoc(layout) => {
                self.init_isoc(&shared, props.count, props.endpoint, layout)?
            }
        };

        *lock(&shared.parked) = urbs.into_iter().map(Some).collect();
        self.urbs_initialized = props.count;
        self.urbs_submitted = 0;
        self.props = Some(*props);
        self.shared = Some(shared);

        info!(
            "stream on endpoint {:#04x}: {} urbs of {} bytes",
            pipe.address(),
            props.count,
            props.buffer_size()
        );
        Ok(())
    }

    fn init_bulk(
        &mut self,
        shared: &Arc<StreamShared>,
        count: usize,
        endpoint: u8,
        buffer_size: usize,
    ) -> Result<Vec<Box<Urb>>> {
        let buffers = self.pool.allocate(count, buffer_size)?;
        Ok(Self::build(shared, buffers, |key, buffer, completion| {
            Urb::bulk(key, endpoint, buffer, completion)
        }))
    }

    fn init_isoc(
        &mut self,
        shared: &Arc<StreamShared>,
        count: usize,
        endpoint: u8,
        layout: IsocLayout,
    ) -> Result<Vec<Box<Urb>>> {
        let buffers = self
            .pool
            .allocate(count, layout.frames_per_urb * layout.frame_size)?;
        Ok(Self::build(shared, buffers, |key, buffer, completion| {
            Urb::isoc(key, endpoint, buffer, layout, completion)
        }))
    }

    fn build(
        shared: &Arc<StreamShared>,
        buffers: Vec<CoherentBuffer>,
        make: impl Fn(UrbKey, CoherentBuffer, Arc<dyn UrbCompletion>) -> Urb,
    ) -> Vec<Box<Urb>> {
        buffers
            .into_iter()
            .enumerate()
            .map(|(index, buffer)| {
                let key = UrbKey {
                    stream: shared.id,
                    index,
                };
                let completion: Arc<dyn UrbCompletion> = shared.clone();
                Box::new(make(key, buffer, completion))
            })
            .collect()
    }

    /// Submit every initialized URB
    ///
    /// # Errors
    ///
    /// `TransportError { index }` if the bus refuses URB `index`; URBs
    /// submitted by this call have been killed again before returning.
    /// `InvalidConfiguration` if the stream is already submitted.
    pub fn submit(&mut self) -> Result<()> {
        let Some(shared) = self.shared.clone() else {
            return Ok(());
        };
        if self.urbs_submitted > 0 {
            return Err(DvbUsbError::invalid_config("stream already submitted"));
        }

        *lock(&shared.killing) = false;

        for index in 0..self.urbs_initialized {
            let Some(urb) = shared.take(index) else {
                self.kill();
                return Err(DvbUsbError::transport(index, "urb still owned by the bus"));
            };
            if let Err(rejected) = self.bus.submit(urb) {
                warn!("submitting urb {index} failed: {}", rejected.reason);
                let reason = rejected.reason.clone();
                shared.park(rejected.urb);
                self.kill();
                return Err(DvbUsbError::transport(index, reason));
            }
            self.urbs_submitted = index + 1;
        }

        debug!("submitted {} urbs", self.urbs_submitted);
        Ok(())
    }

    /// Cancel every submitted URB and wait until all are back
    ///
    /// Idempotent: a no-op on an idle stream.
    pub fn kill(&mut self) {
        let Some(shared) = self.shared.clone() else {
            self.urbs_submitted = 0;
            return;
        };

        *lock(&shared.killing) = true;

        if self.urbs_submitted > 0 {
            for index in 0..self.urbs_initialized {
                self.bus.cancel(UrbKey {
                    stream: shared.id,
                    index,
                });
            }
        }

        let mut parked = lock(&shared.parked);
        while parked.iter().any(Option::is_none) {
            let (guard, timed_out) = wait_timeout(&shared.returned, parked, KILL_RECHECK);
            parked = guard;
            if timed_out {
                let missing: Vec<usize> = parked
                    .iter()
                    .enumerate()
                    .filter(|(_, urb)| urb.is_none())
                    .map(|(index, _)| index)
                    .collect();
                warn!("kill still waiting for urbs {missing:?}, cancelling again");
                drop(parked);
                for index in missing {
                    self.bus.cancel(UrbKey {
                        stream: shared.id,
                        index,
                    });
                }
                parked = lock(&shared.parked);
            }
        }
        drop(parked);

        if self.urbs_submitted > 0 {
            debug!("killed {} urbs", self.urbs_submitted);
        }
        self.urbs_submitted = 0;
    }

    /// Kill, release every URB and free the buffers
    ///
    /// Idempotent; also runs on drop.
    pub fn exit(&mut self) {
        self.kill();

        if let Some(shared) = self.shared.take() {
            let urbs: Vec<Box<Urb>> = lock(&shared.parked).drain(..).flatten().collect();
            self.urbs_initialized = 0;
            let buffers = urbs.into_iter().map(|urb| urb.into_buffer()).collect();
            self.pool.release(buffers);
        }
        self.urbs_initialized = 0;
        self.props = None;
    }

    /// Number of URBs built by the last successful `init`
    pub const fn urbs_initialized(&self) -> usize {
        self.urbs_initialized
    }

    /// Number of URBs submitted (0 after kill)
    pub const fn urbs_submitted(&self) -> usize {
        self.urbs_submitted
    }

    /// Whether the stream is submitted
    pub const fn is_submitted(&self) -> bool {
        self.urbs_submitted > 0
    }

    /// Properties of the current initialization
    pub const fn properties(&self) -> Option<&StreamProperties> {
        self.props.as_ref()
    }

    /// Completion counters (survive re-initialization)
    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Buffers currently allocated from the bus
    pub const fn buffers_outstanding(&self) -> usize {
        self.pool.outstanding()
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("props", &self.props)
            .field("urbs_initialized", &self.urbs_initialized)
            .field("urbs_submitted", &self.urbs_submitted)
            .finish_non_exhaustive()
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        self.exit();
    }
}
