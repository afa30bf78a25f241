//! User-space DVB-USB streaming core.
//!
//! Moves an MPEG-2 transport stream from a USB receiver to a demux: a small
//! pool of bulk or isochronous transfers is kept in flight, and completed
//! transfers are forwarded and resubmitted from the completion context.
//!
//! # Layers
//!
//! ```text
//!   DvbUsbDevice   probe/firmware, power-bracketed bring-up, teardown
//!     Adapter      feed-count edge triggering, PID filter selection
//!       PoweredFrontend   wake/sleep bound to the device power count
//!       DataStream        URB ring: init / submit / kill / exit
//!         Urb + CoherentBuffer   one transfer object per buffer
//!   BusTransport   host controller seam (SoftwareBus in process)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dvbusb_driver::prelude::*;
//! use dvbusb_driver::backends::{LocalDvbCore, SimulatedDriver, SoftwareBus, SoftwareBusConfig};
//! use dvbusb_hw::ids::KNOWN_DEVICES;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let bus = SoftwareBus::new(SoftwareBusConfig::default())?;
//! let core = Arc::new(LocalDvbCore::new());
//! let driver = Arc::new(SimulatedDriver::single(
//!     KNOWN_DEVICES[1],
//!     PidFilterCaps::None,
//!     StreamProperties::bulk(4, 2, 4096),
//! ));
//!
//! let device = DvbUsbDevice::init(
//!     KNOWN_DEVICES[1],
//!     bus,
//!     driver,
//!     core.clone(),
//!     DeviceConfig::default(),
//! )?;
//! let adapter = device.adapter(0).ok_or("no adapter")?;
//! adapter.frontend(0).ok_or("no frontend")?.init()?;
//! adapter.start_feed(&FeedDescriptor::new(0x0000, 0))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod adapter;
pub mod backends;
mod buffer;
mod bus;
mod config;
mod context;
mod demux;
mod device;
pub mod discovery;
mod driver;
mod dvb;
mod error;
mod firmware;
mod frontend;
mod i2c;
mod power;
pub mod remote;
mod stream;
mod sync;
mod urb;

pub use adapter::{Adapter, FeedDescriptor, PidFiltering};
pub use buffer::{BufferPool, CoherentBuffer, PAGE_SIZE};
pub use bus::{BusSpeed, BusTransport, Pipe, PipeKind, Rejected, UrbKey, UrbStatus};
pub use config::{DeviceConfig, DEFAULT_FIRMWARE_DIRS};
pub use demux::{Demux, DemuxStats, PidStats, SoftwareDemux};
pub use device::{DeviceState, DvbUsbDevice, Probe};
pub use discovery::{find_device, identify, Identified, UsbDeviceInfo};
pub use driver::{
    AdapterProperties, AttachContext, DeviceDriver, DeviceProperties, FrontendSlotProperties,
    PidFilterCaps, RemoteProperties,
};
pub use dvb::{DemuxLimits, DvbCore};
pub use error::{DvbUsbError, Result};
pub use firmware::{FileFirmware, FirmwareSource};
pub use frontend::{Frontend, FrontendHandle};
pub use i2c::{I2cAdapter, I2cAlgorithm, I2cDirection, I2cMsg};
pub use power::{PowerRail, PowerState, PoweredFrontend};
pub use remote::RcEvent;
#[cfg(feature = "remote")]
pub use remote::RemoteControl;
pub use stream::{DataStream, StreamSink, StreamStats, StreamStatsSnapshot};
pub use urb::{IsoFrame, Transfer, Urb, UrbCompletion};

pub use dvbusb_hw::{DeviceDescription, IsocLayout, StreamProperties, TransferKind, UsbDeviceId};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Adapter, BusTransport, DataStream, DeviceConfig, DeviceDriver, DvbCore, DvbUsbDevice,
        DvbUsbError, FeedDescriptor, FrontendHandle, PidFilterCaps, Probe, Result,
        StreamProperties, StreamSink,
    };
}
