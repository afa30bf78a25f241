//! Coherent transfer buffers and the per-stream buffer pool
//!
//! A [`CoherentBuffer`] is page-aligned, zeroed host memory plus the address
//! the bus master uses for it. It is owned by exactly one stream slot and
//! travels inside its transfer object while that object is submitted, so the
//! CPU and the device never touch it at the same time.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use rustix::mm::{mlock, munlock};
use tracing::{debug, warn};

use crate::bus::BusTransport;
use crate::error::{DvbUsbError, Result};

/// Allocation granularity of coherent memory.
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned buffer visible to the bus master
#[derive(Debug)]
pub struct CoherentBuffer {
    /// Host address
    vaddr: NonNull<u8>,
    /// Bus (DMA) address
    bus_addr: u64,
    /// Usable length in bytes
    len: usize,
    /// Allocated length (page multiple)
    alloc_len: usize,
    /// Whether the pages are locked in RAM
    pinned: bool,
}

impl CoherentBuffer {
    /// Allocate `len` zeroed bytes that the bus will address as `bus_addr`.
    ///
    /// The pages are locked with `mlock` when the process may do so; a
    /// refused lock is logged and the buffer is used unpinned.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a zero length, `OutOfMemory` when the
    /// allocator refuses.
    pub fn allocate(len: usize, bus_addr: u64) -> Result<Self> {
        if len == 0 {
            return Err(DvbUsbError::invalid_config("zero-length coherent buffer"));
        }
        let alloc_len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Layout::from_size_align(alloc_len, PAGE_SIZE)
            .map_err(|_| DvbUsbError::out_of_memory(len))?;

        // SAFETY: layout has non-zero size (len > 0 checked above) and a
        // power-of-two alignment; the pointer is released in Drop with the
        // same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let vaddr = NonNull::new(raw).ok_or(DvbUsbError::out_of_memory(len))?;

        // SAFETY: [vaddr, vaddr + alloc_len) is the allocation made above.
        let pinned = match unsafe { mlock(vaddr.as_ptr().cast(), alloc_len) } {
            Ok(()) => true,
            Err(e) => {
                debug!("mlock of {alloc_len} bytes refused ({e}), buffer stays pageable");
                false
            }
        };

        Ok(Self {
            vaddr,
            bus_addr,
            len,
            alloc_len,
            pinned,
        })
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: vaddr is valid for alloc_len >= len bytes for the lifetime
        // of self; &self excludes concurrent mutation.
        unsafe { std::slice::from_raw_parts(self.vaddr.as_ptr(), self.len) }
    }

    /// Mutable buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.vaddr.as_ptr(), self.len) }
    }

    /// Bus (DMA) address
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Usable length
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty (never true for an allocated buffer)
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the pages are locked in RAM
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        if self.pinned {
            // SAFETY: the range was locked in allocate().
            if let Err(e) = unsafe { munlock(self.vaddr.as_ptr().cast(), self.alloc_len) } {
                debug!("munlock failed: {e}");
            }
        }
        // alloc_len and PAGE_SIZE produced a valid layout in allocate().
        if let Ok(layout) = Layout::from_size_align(self.alloc_len, PAGE_SIZE) {
            // SAFETY: vaddr came from alloc_zeroed with this layout and no
            // slice borrowed from self can outlive it.
            unsafe { std::alloc::dealloc(self.vaddr.as_ptr(), layout) };
        }
    }
}

// SAFETY: CoherentBuffer owns its allocation exclusively.
unsafe impl Send for CoherentBuffer {}

// SAFETY: shared access is read-only; writes need &mut self.
unsafe impl Sync for CoherentBuffer {}

/// Allocates and frees the coherent buffers of one data stream
#[derive(Debug)]
pub struct BufferPool {
    bus: Arc<dyn BusTransport>,
    outstanding: usize,
}

impl BufferPool {
    /// Create a pool that allocates through `bus`
    pub fn new(bus: Arc<dyn BusTransport>) -> Self {
        Self {
            bus,
            outstanding: 0,
        }
    }

    /// Allocate `count` zeroed buffers of `size` bytes
    ///
    /// Buffers are allocated one at a time. If buffer *k* fails, buffers
    /// `0..k` are released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if any allocation fails.
    pub fn allocate(&mut self, count: usize, size: usize) -> Result<Vec<CoherentBuffer>> {
        let mut buffers = Vec::with_capacity(count);

        for index in 0..count {
            match self.bus.alloc_coherent(size) {
                Ok(mut buffer) => {
                    buffer.as_mut_slice().fill(0);
                    debug!(
                        "buffer {index}: {size} bytes at bus {:#x}",
                        buffer.bus_addr()
                    );
                    buffers.push(buffer);
                }
                Err(e) => {
                    warn!("coherent allocation {index}/{count} of {size} bytes failed: {e}");
                    self.free_all(buffers);
                    return Err(DvbUsbError::out_of_memory(size));
                }
            }
        }

        self.outstanding += count;
        Ok(buffers)
    }

    /// Free every buffer in `buffers` (no-op for an empty set)
    pub fn release(&mut self, buffers: Vec<CoherentBuffer>) {
        self.outstanding = self.outstanding.saturating_sub(buffers.len());
        self.free_all(buffers);
    }

    /// Buffers handed out and not yet released
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn free_all(&self, buffers: Vec<CoherentBuffer>) {
        for buffer in buffers {
            self.bus.free_coherent(buffer);
        }
    }
}
