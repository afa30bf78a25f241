//! Data-stream endpoint layouts.
//!
//! A receiver streams its transport stream over one IN endpoint, either as
//! bulk transfers of a fixed buffer size or as isochronous transfers made of
//! `frames_per_urb` frames of `frame_size` bytes each.

use std::fmt;

use crate::limits::MAX_URBS_PER_STREAM;

/// Isochronous stream layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsocLayout {
    /// Frames per transfer object.
    pub frames_per_urb: usize,
    /// Bytes per frame.
    pub frame_size: usize,
    /// Polling interval in (micro)frames.
    pub interval: u32,
}

/// Transfer type of a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Bulk IN transfers with a fixed buffer size.
    Bulk {
        /// Bytes per transfer object.
        buffer_size: usize,
    },
    /// Isochronous IN transfers.
    Isoc(IsocLayout),
}

/// Properties of one data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperties {
    /// Number of transfer objects (and buffers) kept in flight.
    pub count: usize,
    /// IN endpoint number.
    pub endpoint: u8,
    /// Transfer type and layout.
    pub kind: TransferKind,
}

/// Reason a stream layout is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// `count` is zero or above [`MAX_URBS_PER_STREAM`].
    Count(usize),
    /// A size or frame count is zero.
    EmptyBuffer,
    /// Endpoint 0 is the control pipe.
    ControlEndpoint,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(
                f,
                "transfer count {count} outside 1..={MAX_URBS_PER_STREAM}"
            ),
            Self::EmptyBuffer => write!(f, "transfer buffer size is zero"),
            Self::ControlEndpoint => write!(f, "endpoint 0 cannot carry a data stream"),
        }
    }
}

impl StreamProperties {
    /// Bulk stream on `endpoint` with `count` buffers of `buffer_size` bytes.
    #[must_use]
    pub const fn bulk(count: usize, endpoint: u8, buffer_size: usize) -> Self {
        Self {
            count,
            endpoint,
            kind: TransferKind::Bulk { buffer_size },
        }
    }

    /// Isochronous stream on `endpoint`.
    #[must_use]
    pub const fn isoc(
        count: usize,
        endpoint: u8,
        frames_per_urb: usize,
        frame_size: usize,
        interval: u32,
    ) -> Self {
        Self {
            count,
            endpoint,
            kind: TransferKind::Isoc(IsocLayout {
                frames_per_urb,
                frame_size,
                interval,
            }),
        }
    }

    /// Bytes of coherent memory each transfer object needs.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        match self.kind {
            TransferKind::Bulk { buffer_size } => buffer_size,
            TransferKind::Isoc(layout) => layout.frames_per_urb * layout.frame_size,
        }
    }

    /// Validate the layout.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub const fn check(&self) -> Result<(), LayoutError> {
        if self.count == 0 || self.count > MAX_URBS_PER_STREAM {
            return Err(LayoutError::Count(self.count));
        }
        if self.endpoint == 0 {
            return Err(LayoutError::ControlEndpoint);
        }
        if self.buffer_size() == 0 {
            return Err(LayoutError::EmptyBuffer);
        }
        Ok(())
    }
}
