//! Shared fixtures: a bus whose completions are driven by the test thread.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use dvbusb_driver::backends::{LocalDvbCore, SimulatedDriver};
use dvbusb_driver::{
    BusSpeed, BusTransport, CoherentBuffer, DeviceConfig, DeviceDriver, DvbUsbDevice, DvbUsbError,
    Pipe, Rejected, Result, StreamSink, Urb, UrbKey, UrbStatus,
};
use dvbusb_hw::ts;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct MockState {
    queue: Vec<Box<Urb>>,
    alloc_attempts: usize,
    allocs: usize,
    frees: usize,
    submits: usize,
    cancels: usize,
    fail_alloc_at: Option<usize>,
    fail_submit_at: Option<usize>,
    reject_submits: bool,
}

/// Bus that queues transfers until the test completes them
#[derive(Debug)]
pub struct MockBus {
    state: Mutex<MockState>,
    speed: BusSpeed,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        init_logging();
        Self::with_speed(BusSpeed::High)
    }

    pub fn with_speed(speed: BusSpeed) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::default(),
            speed,
        })
    }

    /// The `n`-th allocation attempt from now (1-based) fails
    pub fn fail_alloc_at(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_alloc_at = Some(state.alloc_attempts + n);
    }

    /// The `n`-th submission from now (1-based) is rejected
    pub fn fail_submit_at(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_submit_at = Some(state.submits + n);
    }

    /// Reject every submission
    pub fn reject_submits(&self, reject: bool) {
        self.state.lock().unwrap().reject_submits = reject;
    }

    pub fn allocs(&self) -> usize {
        self.state.lock().unwrap().allocs
    }

    pub fn frees(&self) -> usize {
        self.state.lock().unwrap().frees
    }

    pub fn submits(&self) -> usize {
        self.state.lock().unwrap().submits
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().unwrap().cancels
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Complete every transfer queued right now; resubmissions stay queued
    pub fn complete_all(&self, mut fill: impl FnMut(&mut Urb)) -> usize {
        let batch: Vec<Box<Urb>> = std::mem::take(&mut self.state.lock().unwrap().queue);
        let count = batch.len();
        for mut urb in batch {
            fill(&mut urb);
            urb.give_back();
        }
        count
    }

    /// Complete the oldest queued transfer
    pub fn complete_next(&self, fill: impl FnOnce(&mut Urb)) -> bool {
        let urb = {
            let mut state = self.state.lock().unwrap();
            if state.queue.is_empty() {
                None
            } else {
                Some(state.queue.remove(0))
            }
        };
        match urb {
            Some(mut urb) => {
                fill(&mut urb);
                urb.give_back();
                true
            }
            None => false,
        }
    }
}

impl BusTransport for MockBus {
    fn alloc_coherent(&self, size: usize) -> Result<CoherentBuffer> {
        let mut state = self.state.lock().unwrap();
        state.alloc_attempts += 1;
        if state.fail_alloc_at == Some(state.alloc_attempts) {
            return Err(DvbUsbError::out_of_memory(size));
        }
        let buffer = CoherentBuffer::allocate(size, 0x2000_0000 + state.allocs as u64 * 0x10000)?;
        state.allocs += 1;
        Ok(buffer)
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        self.state.lock().unwrap().frees += 1;
        drop(buffer);
    }

    fn clear_halt(&self, _pipe: Pipe) -> Result<()> {
        Ok(())
    }

    fn submit(&self, urb: Box<Urb>) -> std::result::Result<(), Rejected> {
        let mut state = self.state.lock().unwrap();
        state.submits += 1;
        if state.reject_submits || state.fail_submit_at == Some(state.submits) {
            return Err(Rejected {
                urb,
                reason: "injected submit failure".into(),
            });
        }
        state.queue.push(urb);
        Ok(())
    }

    fn cancel(&self, key: UrbKey) {
        let urb = {
            let mut state = self.state.lock().unwrap();
            state.cancels += 1;
            let pos = state.queue.iter().position(|urb| urb.key() == key);
            pos.map(|pos| state.queue.remove(pos))
        };
        if let Some(mut urb) = urb {
            urb.set_result(UrbStatus::Cancelled, 0);
            urb.give_back();
        }
    }

    fn speed(&self) -> BusSpeed {
        self.speed
    }
}

/// Sink that records every delivery
#[derive(Debug, Default)]
pub struct Capture {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl Capture {
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }
}

impl StreamSink for Capture {
    fn deliver(&self, data: &[u8]) {
        self.chunks.lock().unwrap().push(data.to_vec());
    }
}

/// Fill a bulk transfer with `len` bytes of `value`
pub fn bulk_fill(value: u8, len: usize) -> impl FnMut(&mut Urb) {
    move |urb: &mut Urb| {
        let (data, _) = urb.io_mut();
        let len = len.min(data.len());
        data[..len].fill(value);
        urb.set_result(UrbStatus::Ok, len);
    }
}

/// Complete with a status and no data
pub fn status(status: UrbStatus) -> impl FnMut(&mut Urb) {
    move |urb: &mut Urb| urb.set_result(status, 0)
}

/// Fill a bulk transfer with whole TS packets of `pid`
pub fn ts_fill(pid: u16) -> impl FnMut(&mut Urb) {
    let mut cc = 0u8;
    move |urb: &mut Urb| {
        let (data, _) = urb.io_mut();
        let mut len = 0;
        for packet in data.chunks_exact_mut(ts::PACKET_SIZE) {
            ts::write_packet(packet, pid, cc);
            cc = (cc + 1) & 0x0f;
            len += ts::PACKET_SIZE;
        }
        urb.set_result(UrbStatus::Ok, len);
    }
}

/// A device brought up on a mock bus with a local DVB core
pub struct Rig {
    pub bus: Arc<MockBus>,
    pub driver: Arc<SimulatedDriver>,
    pub core: Arc<LocalDvbCore>,
    pub device: DvbUsbDevice,
}

pub fn rig(driver: SimulatedDriver, speed: BusSpeed) -> Rig {
    rig_with_config(driver, speed, DeviceConfig::default())
}

/// Log to the test harness when `RUST_LOG` is set
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "off".into()))
        .with_test_writer()
        .try_init();
}

pub fn rig_with_config(driver: SimulatedDriver, speed: BusSpeed, config: DeviceConfig) -> Rig {
    init_logging();
    let bus = MockBus::with_speed(speed);
    let driver = Arc::new(driver);
    let core = Arc::new(LocalDvbCore::new());
    let description = driver.properties().devices[0];
    let device = DvbUsbDevice::init(description, bus.clone(), driver.clone(), core.clone(), config)
        .expect("device init");
    driver.clear_journal();
    Rig {
        bus,
        driver,
        core,
        device,
    }
}
