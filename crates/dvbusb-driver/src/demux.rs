//! Demux interface and the software demux
//!
//! The adapter's stream sink hands every received chunk to a [`Demux`]. The
//! [`SoftwareDemux`] splits that in two halves:
//!
//! - `deliver` (completion context): copy the chunk into a bounded ring and
//!   return; a full ring drops the chunk and counts it.
//! - `drain` (caller's thread): reassemble 188-byte packets across chunk
//!   boundaries, re-align on the sync byte, filter by enabled PID and keep
//!   per-PID packet and continuity-error counts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dvbusb_hw::ts;
use tracing::{debug, trace};

use crate::sync::lock;

/// Demux core entry points used by the adapter
pub trait Demux: Send + Sync {
    /// Software filtering entry point; called from the completion context
    fn deliver(&self, data: &[u8]);

    /// A feed for `pid` was started or stopped
    fn set_filter(&self, _pid: u16, _enabled: bool) {}
}

/// Per-PID counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PidStats {
    /// Packets seen for this PID
    pub packets: u64,
    /// Continuity-counter discontinuities
    pub cc_errors: u64,
    last_cc: Option<u8>,
}

/// Snapshot of the software demux counters
#[derive(Debug, Clone, Default)]
pub struct DemuxStats {
    /// Counters of every enabled PID that has seen traffic
    pub pids: BTreeMap<u16, PidStats>,
    /// Chunks dropped because the ring was full
    pub dropped_chunks: u64,
    /// Bytes skipped while searching for a sync byte
    pub resync_bytes: u64,
}

#[derive(Debug, Default)]
struct Reassembly {
    carry: Vec<u8>,
    filters: BTreeSet<u16>,
    pids: BTreeMap<u16, PidStats>,
    resync_bytes: u64,
}

/// Ring-buffered software demux
#[derive(Debug)]
pub struct SoftwareDemux {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    dropped: AtomicU64,
    state: Mutex<Reassembly>,
}

impl SoftwareDemux {
    /// Default ring depth in chunks
    pub const DEFAULT_DEPTH: usize = 256;

    /// Create a demux whose ring holds `depth` chunks
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
            state: Mutex::new(Reassembly::default()),
        }
    }

    /// Process every queued chunk; returns the number of matching packets
    pub fn drain(&self) -> usize {
        let mut state = lock(&self.state);
        let mut matched = 0;
        while let Ok(chunk) = self.rx.try_recv() {
            matched += state.consume(&chunk);
        }
        matched
    }

    /// Packets counted for `pid` so far
    pub fn packets(&self, pid: u16) -> u64 {
        lock(&self.state).pids.get(&pid).map_or(0, |s| s.packets)
    }

    /// Copy of all counters
    pub fn stats(&self) -> DemuxStats {
        let state = lock(&self.state);
        DemuxStats {
            pids: state.pids.clone(),
            dropped_chunks: self.dropped.load(Ordering::Relaxed),
            resync_bytes: state.resync_bytes,
        }
    }

    /// PIDs with an active filter
    pub fn filters(&self) -> Vec<u16> {
        lock(&self.state).filters.iter().copied().collect()
    }
}

impl Default for SoftwareDemux {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DEPTH)
    }
}

impl Demux for SoftwareDemux {
    fn deliver(&self, data: &[u8]) {
        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn set_filter(&self, pid: u16, enabled: bool) {
        let mut state = lock(&self.state);
        if enabled {
            state.filters.insert(pid);
        } else {
            state.filters.remove(&pid);
        }
        debug!("demux filter {pid:#06x} {}", if enabled { "on" } else { "off" });
    }
}

impl Reassembly {
    fn consume(&mut self, chunk: &[u8]) -> usize {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut matched = 0;
        let mut pos = 0;
        while pos + ts::PACKET_SIZE <= data.len() {
            if data[pos] != ts::SYNC_BYTE {
                pos += 1;
                self.resync_bytes += 1;
                continue;
            }
            let packet = &data[pos..pos + ts::PACKET_SIZE];
            if let Some(pid) = ts::pid(packet) {
                if self.filters.contains(&pid) {
                    self.count(pid, packet);
                    matched += 1;
                }
            }
            pos += ts::PACKET_SIZE;
        }

        data.drain(..pos);
        self.carry = data;
        matched
    }

    fn count(&mut self, pid: u16, packet: &[u8]) {
        let stats = self.pids.entry(pid).or_default();
        stats.packets += 1;
        if !ts::has_payload(packet) {
            return;
        }
        if let Some(cc) = ts::continuity_counter(packet) {
            if let Some(last) = stats.last_cc {
                if cc != (last + 1) & 0x0F {
                    stats.cc_errors += 1;
                    trace!("pid {pid:#06x}: continuity {last} -> {cc}");
                }
            }
            stats.last_cc = Some(cc);
        }
    }
}
