//! In-process implementations of the bus, the DVB core and a device driver
//!
//! - [`SoftwareBus`]: completion thread generating an MPEG-TS stream
//! - [`LocalDvbCore`]: registration journal with a software demux per adapter
//! - [`SimulatedDriver`]: hook journal with fault injection
//!
//! Together they run the whole streaming core without hardware.

pub mod local_core;
pub mod simulated;
pub mod software;

pub use local_core::{CoreEvent, CoreFault, LocalDvbCore};
pub use simulated::{HookCall, HookFault, SimulatedDriver};
pub use software::{SoftwareBus, SoftwareBusConfig};
