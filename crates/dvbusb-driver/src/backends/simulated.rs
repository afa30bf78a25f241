//! Simulated device driver
//!
//! A [`DeviceDriver`] whose hooks succeed (or fail on request) and write
//! every call to a shared journal, so the order of hook invocations can be
//! checked. Its frontends journal their wake/sleep/detach calls into the
//! same log.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dvbusb_hw::{DeviceDescription, StreamProperties, UsbDeviceId};

use crate::bus::BusTransport;
use crate::discovery::Identified;
use crate::driver::{
    AdapterProperties, AttachContext, DeviceDriver, DeviceProperties, FrontendSlotProperties,
    PidFilterCaps,
};
use crate::error::{DvbUsbError, Result};
use crate::frontend::Frontend;
use crate::i2c::{I2cAlgorithm, I2cMsg};
use crate::remote::RcEvent;
use crate::sync::lock;

/// One journaled hook call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    /// `power_ctrl`
    Power(bool),
    /// `download_firmware` with the image length
    DownloadFirmware(usize),
    /// `frontend_attach` (adapter, slot)
    FrontendAttach(usize, usize),
    /// `tuner_attach` (adapter, slot)
    TunerAttach(usize, usize),
    /// `streaming_ctrl` (adapter, on)
    Streaming(usize, bool),
    /// `pid_filter` (adapter, index, pid, on)
    PidFilter(usize, usize, u16, bool),
    /// `pid_filter_ctrl` (adapter, enabled)
    PidFilterCtrl(usize, bool),
    /// `frontend_ctrl` (adapter, slot, on)
    FrontendCtrl(usize, usize, bool),
    /// Demodulator `init` (adapter, slot)
    DemodInit(usize, usize),
    /// Demodulator `sleep` (adapter, slot)
    DemodSleep(usize, usize),
    /// Demodulator `detach` (adapter, slot)
    DemodDetach(usize, usize),
    /// I2C transfer with the number of messages
    I2cTransfer(usize),
}

/// Hooks that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookFault {
    /// `power_ctrl(true)`
    PowerOn,
    /// `streaming_ctrl(_, true)`
    StreamingOn,
    /// `pid_filter_ctrl`
    PidFilterCtrl,
    /// `frontend_attach` returns an error for (adapter, slot)
    AttachError(usize, usize),
    /// `frontend_attach` returns no frontend for (adapter, slot)
    NoFrontend(usize, usize),
    /// `download_firmware`
    Firmware,
}

type Journal = Arc<Mutex<Vec<HookCall>>>;

struct SimulatedFrontend {
    name: String,
    adapter: usize,
    slot: usize,
    journal: Journal,
}

impl Frontend for SimulatedFrontend {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<()> {
        lock(&self.journal).push(HookCall::DemodInit(self.adapter, self.slot));
        Ok(())
    }

    fn sleep(&mut self) -> Result<()> {
        lock(&self.journal).push(HookCall::DemodSleep(self.adapter, self.slot));
        Ok(())
    }

    fn detach(&mut self) {
        lock(&self.journal).push(HookCall::DemodDetach(self.adapter, self.slot));
    }
}

struct SimulatedI2c {
    journal: Journal,
}

impl I2cAlgorithm for SimulatedI2c {
    fn master_xfer(&self, msgs: &mut [I2cMsg<'_>]) -> Result<usize> {
        lock(&self.journal).push(HookCall::I2cTransfer(msgs.len()));
        Ok(msgs.len())
    }
}

/// Journaling driver for tests and the simulator
pub struct SimulatedDriver {
    props: DeviceProperties,
    journal: Journal,
    faults: Mutex<BTreeSet<HookFault>>,
    firmware_loaded: AtomicBool,
    keys: Mutex<VecDeque<RcEvent>>,
    with_i2c: bool,
}

impl SimulatedDriver {
    /// Driver with `props`
    pub fn new(props: DeviceProperties) -> Self {
        Self {
            props,
            journal: Arc::default(),
            faults: Mutex::default(),
            firmware_loaded: AtomicBool::new(false),
            keys: Mutex::default(),
            with_i2c: false,
        }
    }

    /// One adapter with one frontend slot
    pub fn single(
        description: DeviceDescription,
        pid_filter: PidFilterCaps,
        stream: StreamProperties,
    ) -> Self {
        Self::new(DeviceProperties {
            devices: vec![description],
            firmware: Some("dvb-usb-simulated.fw".into()),
            adapters: vec![AdapterProperties {
                frontends: vec![FrontendSlotProperties { pid_filter, stream }],
            }],
            remote: None,
        })
    }

    /// Also provide an I2C algorithm
    #[must_use]
    pub fn with_i2c(mut self) -> Self {
        self.with_i2c = true;
        self
    }

    /// Make a hook fail
    pub fn inject_fault(&self, fault: HookFault) {
        lock(&self.faults).insert(fault);
    }

    /// Let a hook succeed again
    pub fn clear_fault(&self, fault: HookFault) {
        lock(&self.faults).remove(&fault);
    }

    /// Queue a key press for `rc_query`
    pub fn press_key(&self, scancode: u32) {
        lock(&self.keys).push_back(RcEvent {
            scancode,
            pressed: true,
        });
    }

    /// Calls so far
    pub fn journal(&self) -> Vec<HookCall> {
        lock(&self.journal).clone()
    }

    /// Forget the calls so far
    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    fn record(&self, call: HookCall) {
        lock(&self.journal).push(call);
    }

    fn fails(&self, fault: HookFault) -> bool {
        lock(&self.faults).contains(&fault)
    }
}

impl DeviceDriver for SimulatedDriver {
    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    // Devices with a single id report it cold until firmware is loaded
    fn identify_state(
        &self,
        _id: UsbDeviceId,
        found: Option<Identified>,
    ) -> Result<Option<Identified>> {
        Ok(found.map(|mut identified| {
            if identified.cold
                && identified.description.warm_ids.is_empty()
                && self.firmware_loaded.load(Ordering::Acquire)
            {
                identified.cold = false;
            }
            identified
        }))
    }

    fn download_firmware(&self, _bus: &dyn BusTransport, image: &[u8]) -> Result<()> {
        self.record(HookCall::DownloadFirmware(image.len()));
        if self.fails(HookFault::Firmware) {
            return Err(DvbUsbError::device_error("device rejected the image"));
        }
        self.firmware_loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn power_ctrl(&self, on: bool) -> Result<()> {
        self.record(HookCall::Power(on));
        if on && self.fails(HookFault::PowerOn) {
            return Err(DvbUsbError::device_error("power on failed"));
        }
        Ok(())
    }

    fn i2c_algorithm(&self) -> Option<Arc<dyn I2cAlgorithm>> {
        self.with_i2c.then(|| {
            Arc::new(SimulatedI2c {
                journal: Arc::clone(&self.journal),
            }) as Arc<dyn I2cAlgorithm>
        })
    }

    fn frontend_attach(&self, ctx: &AttachContext<'_>) -> Result<Option<Box<dyn Frontend>>> {
        self.record(HookCall::FrontendAttach(ctx.adapter, ctx.slot));
        if self.fails(HookFault::AttachError(ctx.adapter, ctx.slot)) {
            return Err(DvbUsbError::device_error("demodulator did not answer"));
        }
        if self.fails(HookFault::NoFrontend(ctx.adapter, ctx.slot)) {
            return Ok(None);
        }
        if let Some(i2c) = ctx.i2c {
            i2c.write(0x12, &[0x00])?;
        }
        Ok(Some(Box::new(SimulatedFrontend {
            name: format!("Simulated DVB-T demod {}.{}", ctx.adapter, ctx.slot),
            adapter: ctx.adapter,
            slot: ctx.slot,
            journal: Arc::clone(&self.journal),
        })))
    }

    fn tuner_attach(&self, ctx: &AttachContext<'_>, _frontend: &mut dyn Frontend) -> Result<()> {
        self.record(HookCall::TunerAttach(ctx.adapter, ctx.slot));
        Ok(())
    }

    fn streaming_ctrl(&self, adapter: usize, on: bool) -> Result<()> {
        self.record(HookCall::Streaming(adapter, on));
        if on && self.fails(HookFault::StreamingOn) {
            return Err(DvbUsbError::device_error("streaming on failed"));
        }
        Ok(())
    }

    fn pid_filter(&self, adapter: usize, index: usize, pid: u16, on: bool) -> Result<()> {
        self.record(HookCall::PidFilter(adapter, index, pid, on));
        Ok(())
    }

    fn pid_filter_ctrl(&self, adapter: usize, enabled: bool) -> Result<()> {
        self.record(HookCall::PidFilterCtrl(adapter, enabled));
        if self.fails(HookFault::PidFilterCtrl) {
            return Err(DvbUsbError::device_error("pid filter control failed"));
        }
        Ok(())
    }

    fn frontend_ctrl(&self, adapter: usize, slot: usize, on: bool) -> Result<()> {
        self.record(HookCall::FrontendCtrl(adapter, slot, on));
        Ok(())
    }

    fn rc_query(&self) -> Result<Option<RcEvent>> {
        Ok(lock(&self.keys).pop_front())
    }
}

impl std::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("props", &self.props)
            .field("faults", &*lock(&self.faults))
            .finish_non_exhaustive()
    }
}
