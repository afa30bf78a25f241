//! Bus transport abstraction
//!
//! The streaming core never talks to a host controller directly. It asks a
//! [`BusTransport`] for coherent memory, hands it transfer objects to run and
//! asks it to cancel them. Completed transfers come back through
//! [`Urb::give_back`], on whatever thread the transport completes on.
//!
//! # Transfer ownership
//!
//! ```text
//!   parked in stream ──submit()──▶ owned by bus ──give_back()──▶ completion
//!          ▲                            │                          │
//!          └──────── park ◀─────────────┴── cancel() ◀─────────────┘
//!                                              (resubmit ─▶ owned by bus)
//! ```

use std::fmt::{self, Debug};

use crate::buffer::CoherentBuffer;
use crate::error::Result;
use crate::urb::Urb;

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSpeed {
    /// USB 1.1 full speed (12 Mbit/s)
    Full,
    /// USB 2.0 high speed (480 Mbit/s)
    High,
    /// USB 3.x
    Super,
}

/// Pipe transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Bulk pipe
    Bulk,
    /// Isochronous pipe
    Isoc,
}

/// Receive pipe on one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipe {
    /// Endpoint number (without direction bit)
    pub endpoint: u8,
    /// Transfer type
    pub kind: PipeKind,
}

impl Pipe {
    /// Bulk IN pipe
    pub const fn bulk_in(endpoint: u8) -> Self {
        Self {
            endpoint,
            kind: PipeKind::Bulk,
        }
    }

    /// Isochronous IN pipe
    pub const fn isoc_in(endpoint: u8) -> Self {
        Self {
            endpoint,
            kind: PipeKind::Isoc,
        }
    }

    /// Endpoint address with the IN direction bit
    pub const fn address(&self) -> u8 {
        0x80 | self.endpoint
    }
}

/// Identifies one transfer object on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbKey {
    /// Owning stream
    pub stream: u64,
    /// Slot within the stream
    pub index: usize,
}

/// Completion status of a transfer or isochronous frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrbStatus {
    /// Completed normally
    #[default]
    Ok,
    /// Timed out / NAKed; treated as normal continuation
    Timeout,
    /// Killed synchronously (ENOENT)
    Cancelled,
    /// Unlinked asynchronously (ECONNRESET)
    Unlinked,
    /// Host controller shutting down (ESHUTDOWN)
    Shutdown,
    /// Device removed (ENODEV)
    NoDevice,
    /// Endpoint stalled (EPIPE)
    Stall,
    /// Device sent more data than the buffer holds (EOVERFLOW)
    Overflow,
    /// Any other transport error, as a negative errno
    Error(i32),
}

impl UrbStatus {
    /// Statuses that mean "stop, do not resubmit"
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Unlinked | Self::Shutdown | Self::NoDevice
        )
    }

    /// Statuses that indicate a transport error worth logging
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Stall | Self::Overflow | Self::Error(_))
    }
}

impl fmt::Display for UrbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unlinked => write!(f, "unlinked"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::NoDevice => write!(f, "no device"),
            Self::Stall => write!(f, "stall"),
            Self::Overflow => write!(f, "overflow"),
            Self::Error(errno) => write!(f, "error {errno}"),
        }
    }
}

/// A transfer object the bus refused to queue
pub struct Rejected {
    /// The transfer, handed back to the caller
    pub urb: Box<Urb>,
    /// Why the bus refused it
    pub reason: String,
}

impl Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("key", &self.urb.key())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Host-controller facilities the streaming core consumes
///
/// # Contract
///
/// - `submit` never completes a transfer on the calling thread.
/// - `cancel` of a queued transfer removes it and gives it back with
///   [`UrbStatus::Cancelled`] before returning. Cancelling a transfer the bus
///   does not hold (idle, or currently being completed) is a no-op.
/// - Completions may run on any thread and must not block.
pub trait BusTransport: Debug + Send + Sync {
    /// Allocate a zeroed coherent buffer of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the mapping facility is exhausted.
    fn alloc_coherent(&self, size: usize) -> Result<CoherentBuffer>;

    /// Return a coherent buffer
    fn free_coherent(&self, buffer: CoherentBuffer) {
        drop(buffer);
    }

    /// Clear a halt/stall condition on `pipe`
    ///
    /// # Errors
    ///
    /// Returns an error if the control request fails.
    fn clear_halt(&self, pipe: Pipe) -> Result<()>;

    /// Queue a transfer
    ///
    /// # Errors
    ///
    /// Hands the transfer back with a reason if it cannot be queued.
    fn submit(&self, urb: Box<Urb>) -> std::result::Result<(), Rejected>;

    /// Cancel a queued transfer (see the trait contract)
    fn cancel(&self, key: UrbKey);

    /// Negotiated speed of the device's link
    fn speed(&self) -> BusSpeed {
        BusSpeed::High
    }
}
