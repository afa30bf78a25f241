//! Hardware model for DVB-USB receivers.
//!
//! This crate has **no dependencies** and **no hardware access**. It describes
//! the devices the streaming core drives: USB vendor/product identifiers and the
//! cold/warm device table, the endpoint layout of a data stream (bulk or
//! isochronous), the fixed limits the core is built around, and MPEG-TS
//! packet framing.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ids`] | Vendor/product ids, `DeviceDescription`, known-device table |
//! | [`stream`] | `StreamProperties`, bulk and isochronous transfer layouts |
//! | [`limits`] | Per-device, per-adapter and per-stream maxima |
//! | [`ts`] | Transport-stream packet size, sync byte, PID extraction |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ids;
pub mod limits;
pub mod stream;
pub mod ts;

pub use ids::{DeviceDescription, UsbDeviceId};
pub use stream::{IsocLayout, StreamProperties, TransferKind};
