//! Software bus
//!
//! A [`BusTransport`] without hardware: a completion thread takes queued
//! transfers in order, fills them with MPEG-TS packets for a configurable
//! set of PIDs and gives them back. Useful for exercising the full streaming
//! path in tests and in `dvbusb simulate`.
//!
//! ```text
//!  submit() ──▶ queue ──▶ completion thread ──▶ fill ──▶ give_back()
//!                 ▲                                         │
//!                 └──── cancel(): remove + give back ◀──────┘ (resubmit)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dvbusb_hw::ts;
use tracing::{debug, error, trace};

use crate::buffer::{CoherentBuffer, PAGE_SIZE};
use crate::bus::{BusSpeed, BusTransport, Pipe, Rejected, UrbKey, UrbStatus};
use crate::error::Result;
use crate::sync::lock;
use crate::urb::Urb;

/// Base of the simulated bus address space
const BUS_ADDR_BASE: u64 = 0x1000_0000;

/// Software bus settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareBusConfig {
    /// Reported link speed
    pub speed: BusSpeed,
    /// PIDs the generated stream carries, round robin
    pub pids: Vec<u16>,
    /// Delay before each completion
    pub completion_delay: Duration,
    /// Mark every n-th isochronous frame as failed
    pub iso_error_every: Option<usize>,
}

impl Default for SoftwareBusConfig {
    fn default() -> Self {
        Self {
            speed: BusSpeed::High,
            pids: vec![ts::PAT_PID],
            completion_delay: Duration::from_millis(1),
            iso_error_every: None,
        }
    }
}

/// Round-robin packet source with per-PID continuity counters
#[derive(Debug)]
struct PacketGenerator {
    pids: Vec<(u16, u8)>,
    next: usize,
    frames: usize,
}

impl PacketGenerator {
    fn new(pids: &[u16]) -> Self {
        let pids = if pids.is_empty() {
            vec![(ts::NULL_PID, 0)]
        } else {
            pids.iter().map(|&pid| (pid, 0)).collect()
        };
        Self {
            pids,
            next: 0,
            frames: 0,
        }
    }

    /// Fill whole packets into `out`; returns bytes written
    fn fill(&mut self, out: &mut [u8]) -> usize {
        let packets = out.len() / ts::PACKET_SIZE;
        for chunk in out.chunks_exact_mut(ts::PACKET_SIZE) {
            let (pid, cc) = &mut self.pids[self.next];
            ts::write_packet(chunk, *pid, *cc);
            *cc = (*cc + 1) & 0x0F;
            self.next = (self.next + 1) % self.pids.len();
        }
        packets * ts::PACKET_SIZE
    }
}

#[derive(Debug)]
struct BusInner {
    config: SoftwareBusConfig,
    queue: Mutex<VecDeque<Box<Urb>>>,
    pending: Condvar,
    running: AtomicBool,
    generator: Mutex<PacketGenerator>,
    next_bus_addr: AtomicU64,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    completed: AtomicU64,
}

impl BusInner {
    fn next_urb(&self) -> Option<Box<Urb>> {
        let mut queue = lock(&self.queue);
        loop {
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(urb) = queue.pop_front() {
                return Some(urb);
            }
            queue = self
                .pending
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn fill(&self, urb: &mut Urb) {
        let mut generator = lock(&self.generator);
        let (data, frames) = urb.io_mut();

        if frames.is_empty() {
            let len = generator.fill(data);
            drop(generator);
            urb.set_result(UrbStatus::Ok, len);
            return;
        }

        let mut total = 0;
        for frame in frames.iter_mut() {
            generator.frames += 1;
            if self
                .config
                .iso_error_every
                .is_some_and(|n| n > 0 && generator.frames % n == 0)
            {
                frame.status = UrbStatus::Error(-71);
                frame.actual_length = 0;
                continue;
            }
            let end = (frame.offset + frame.length).min(data.len());
            let len = generator.fill(&mut data[frame.offset..end]);
            frame.status = UrbStatus::Ok;
            frame.actual_length = len;
            total += len;
        }
        drop(generator);
        urb.set_result(UrbStatus::Ok, total);
    }

    fn run(&self) {
        debug!("software bus completion thread started");
        while let Some(mut urb) = self.next_urb() {
            if !self.config.completion_delay.is_zero() {
                thread::sleep(self.config.completion_delay);
            }
            self.fill(&mut urb);
            self.completed.fetch_add(1, Ordering::Relaxed);
            trace!("completing urb {:?}", urb.key());
            urb.give_back();
        }
        debug!("software bus completion thread stopped");
    }
}

/// Simulated host controller producing a transport stream
#[derive(Debug)]
pub struct SoftwareBus {
    inner: Arc<BusInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwareBus {
    /// Start a bus with `config`
    ///
    /// # Errors
    ///
    /// I/O error if the completion thread cannot be spawned.
    pub fn new(config: SoftwareBusConfig) -> Result<Arc<Self>> {
        let inner = Arc::new(BusInner {
            generator: Mutex::new(PacketGenerator::new(&config.pids)),
            config,
            queue: Mutex::new(VecDeque::new()),
            pending: Condvar::new(),
            running: AtomicBool::new(true),
            next_bus_addr: AtomicU64::new(BUS_ADDR_BASE),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("dvbusb-swbus".into())
            .spawn(move || worker_inner.run())?;

        Ok(Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Coherent buffers handed out so far
    pub fn allocations(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Coherent buffers returned so far
    pub fn frees(&self) -> usize {
        self.inner.freed.load(Ordering::Relaxed)
    }

    /// Transfers completed with data
    pub fn completions(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Transfers currently queued
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }
}

impl BusTransport for SoftwareBus {
    fn alloc_coherent(&self, size: usize) -> Result<CoherentBuffer> {
        let stride = size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let bus_addr = self
            .inner
            .next_bus_addr
            .fetch_add(stride as u64, Ordering::Relaxed);
        let buffer = CoherentBuffer::allocate(size, bus_addr)?;
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        self.inner.freed.fetch_add(1, Ordering::Relaxed);
        drop(buffer);
    }

    fn clear_halt(&self, pipe: Pipe) -> Result<()> {
        trace!("clear halt on {:#04x}", pipe.address());
        Ok(())
    }

    fn submit(&self, urb: Box<Urb>) -> std::result::Result<(), Rejected> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Rejected {
                urb,
                reason: "bus shut down".into(),
            });
        }
        lock(&self.inner.queue).push_back(urb);
        self.inner.pending.notify_one();
        Ok(())
    }

    fn cancel(&self, key: UrbKey) {
        let cancelled = {
            let mut queue = lock(&self.inner.queue);
            queue
                .iter()
                .position(|urb| urb.key() == key)
                .and_then(|pos| queue.remove(pos))
        };
        if let Some(mut urb) = cancelled {
            urb.set_result(UrbStatus::Cancelled, 0);
            urb.give_back();
        }
    }

    fn speed(&self) -> BusSpeed {
        self.inner.config.speed
    }
}

impl Drop for SoftwareBus {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        let leftovers: Vec<Box<Urb>> = {
            let mut queue = lock(&self.inner.queue);
            self.inner.pending.notify_all();
            queue.drain(..).collect()
        };
        for mut urb in leftovers {
            urb.set_result(UrbStatus::Shutdown, 0);
            urb.give_back();
        }

        if let Some(worker) = lock(&self.worker).take() {
            // The last reference may be released from a completion
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("software bus completion thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_round_robins_with_continuity() {
        let mut generator = PacketGenerator::new(&[0x100, 0x200]);
        let mut out = vec![0u8; 4 * ts::PACKET_SIZE + 10];

        assert_eq!(generator.fill(&mut out), 4 * ts::PACKET_SIZE);

        let packets: Vec<_> = out
            .chunks_exact(ts::PACKET_SIZE)
            .map(|p| (ts::pid(p).unwrap(), ts::continuity_counter(p).unwrap()))
            .collect();
        assert_eq!(packets, vec![(0x100, 0), (0x200, 0), (0x100, 1), (0x200, 1)]);
    }

    #[test]
    fn allocations_get_distinct_page_aligned_addresses() {
        let bus = SoftwareBus::new(SoftwareBusConfig::default()).unwrap();
        let a = bus.alloc_coherent(100).unwrap();
        let b = bus.alloc_coherent(5000).unwrap();

        assert_eq!(a.bus_addr() % PAGE_SIZE as u64, 0);
        assert_eq!(b.bus_addr(), a.bus_addr() + PAGE_SIZE as u64);

        bus.free_coherent(a);
        bus.free_coherent(b);
        assert_eq!((bus.allocations(), bus.frees()), (2, 2));
    }
}
