//! Transfer objects (URBs)
//!
//! One [`Urb`] describes one bulk or isochronous receive request bound to one
//! coherent buffer. Isochronous URBs carry a frame-descriptor list that the
//! bus fills per frame on completion.

use std::fmt;
use std::sync::Arc;

use dvbusb_hw::stream::IsocLayout;
use tracing::debug;

use crate::bus::{Pipe, UrbKey, UrbStatus};
use crate::buffer::CoherentBuffer;
use crate::stream::{StreamSink, StreamStats};

/// Receives transfer objects when the bus gives them back
pub trait UrbCompletion: Send + Sync {
    /// Handle a completed (or cancelled) transfer
    ///
    /// Runs in the bus's completion context: must not block.
    fn complete(&self, urb: Box<Urb>);
}

/// Isochronous frame descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoFrame {
    /// Offset of the frame within the buffer
    pub offset: usize,
    /// Bytes reserved for the frame
    pub length: usize,
    /// Bytes the device actually sent
    pub actual_length: usize,
    /// Per-frame status
    pub status: UrbStatus,
}

/// Transfer-type specific part of a URB
#[derive(Debug)]
pub enum Transfer {
    /// Bulk receive
    Bulk,
    /// Isochronous receive
    Isoc {
        /// Polling interval
        interval: u32,
        /// Schedule as soon as possible instead of at a fixed frame
        asap: bool,
        /// Frame descriptors
        frames: Vec<IsoFrame>,
    },
}

/// One transfer object
pub struct Urb {
    key: UrbKey,
    pipe: Pipe,
    buffer: CoherentBuffer,
    transfer: Transfer,
    status: UrbStatus,
    actual_length: usize,
    completion: Arc<dyn UrbCompletion>,
}

impl Urb {
    /// Bulk receive URB over the whole of `buffer`
    pub fn bulk(
        key: UrbKey,
        endpoint: u8,
        buffer: CoherentBuffer,
        completion: Arc<dyn UrbCompletion>,
    ) -> Self {
        Self {
            key,
            pipe: Pipe::bulk_in(endpoint),
            buffer,
            transfer: Transfer::Bulk,
            status: UrbStatus::Ok,
            actual_length: 0,
            completion,
        }
    }

    /// Isochronous receive URB; frame *i* covers
    /// `[i * frame_size, (i + 1) * frame_size)` of `buffer`
    pub fn isoc(
        key: UrbKey,
        endpoint: u8,
        buffer: CoherentBuffer,
        layout: IsocLayout,
        completion: Arc<dyn UrbCompletion>,
    ) -> Self {
        let frames = (0..layout.frames_per_urb)
            .map(|i| IsoFrame {
                offset: i * layout.frame_size,
                length: layout.frame_size,
                actual_length: 0,
                status: UrbStatus::Ok,
            })
            .collect();

        Self {
            key,
            pipe: Pipe::isoc_in(endpoint),
            buffer,
            transfer: Transfer::Isoc {
                interval: layout.interval,
                asap: true,
                frames,
            },
            status: UrbStatus::Ok,
            actual_length: 0,
            completion,
        }
    }

    /// Identity on the bus
    pub const fn key(&self) -> UrbKey {
        self.key
    }

    /// Receive pipe
    pub const fn pipe(&self) -> Pipe {
        self.pipe
    }

    /// Transfer details
    pub const fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    /// Completion status
    pub const fn status(&self) -> UrbStatus {
        self.status
    }

    /// Bytes received (bulk)
    pub const fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Transfer buffer
    pub const fn buffer(&self) -> &CoherentBuffer {
        &self.buffer
    }

    /// Buffer and frame list for the bus to fill
    ///
    /// The frame list is empty for bulk URBs.
    pub fn io_mut(&mut self) -> (&mut [u8], &mut [IsoFrame]) {
        let frames: &mut [IsoFrame] = match &mut self.transfer {
            Transfer::Bulk => &mut [],
            Transfer::Isoc { frames, .. } => frames,
        };
        (self.buffer.as_mut_slice(), frames)
    }

    /// Record the overall result before [`give_back`](Self::give_back)
    pub fn set_result(&mut self, status: UrbStatus, actual_length: usize) {
        self.status = status;
        self.actual_length = actual_length;
    }

    /// Return the URB to its owner's completion handler
    pub fn give_back(self: Box<Self>) {
        let completion = Arc::clone(&self.completion);
        completion.complete(self);
    }

    /// Forward received data to `sink` and reset per-transfer state
    ///
    /// Bulk: the first `actual_length` bytes, if any. Isochronous: every
    /// frame with ok status and data, at its own offset; frames with an
    /// error status are counted and skipped. All frame descriptors are reset
    /// so the URB can be resubmitted as is.
    pub(crate) fn deliver(&mut self, sink: &dyn StreamSink, stats: &StreamStats) {
        match &mut self.transfer {
            Transfer::Bulk => {
                let len = self.actual_length.min(self.buffer.len());
                if len > 0 {
                    sink.deliver(&self.buffer.as_slice()[..len]);
                    stats.record_bytes(len);
                }
            }
            Transfer::Isoc { frames, .. } => {
                let data = self.buffer.as_slice();
                for (i, frame) in frames.iter_mut().enumerate() {
                    if frame.status != UrbStatus::Ok {
                        debug!(
                            "iso frame {i} of urb {} failed: {}",
                            self.key.index, frame.status
                        );
                        stats.record_frame_error();
                    } else if frame.actual_length > 0 {
                        let len = frame.actual_length.min(frame.length);
                        let end = (frame.offset + len).min(data.len());
                        if frame.offset < end {
                            sink.deliver(&data[frame.offset..end]);
                            stats.record_bytes(end - frame.offset);
                        }
                    }
                    frame.status = UrbStatus::Ok;
                    frame.actual_length = 0;
                }
            }
        }
        self.actual_length = 0;
    }

    /// Take the buffer back out of a parked URB
    pub(crate) fn into_buffer(self) -> CoherentBuffer {
        self.buffer
    }
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Urb")
            .field("key", &self.key)
            .field("pipe", &self.pipe)
            .field("transfer", &self.transfer)
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Discard;

    impl UrbCompletion for Discard {
        fn complete(&self, _urb: Box<Urb>) {}
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<Vec<u8>>>);

    impl StreamSink for Capture {
        fn deliver(&self, data: &[u8]) {
            self.0.lock().unwrap().push(data.to_vec());
        }
    }

    fn key() -> UrbKey {
        UrbKey {
            stream: 1,
            index: 0,
        }
    }

    #[test]
    fn isoc_frames_are_prepopulated() {
        let layout = IsocLayout {
            frames_per_urb: 4,
            frame_size: 188,
            interval: 1,
        };
        let buffer = CoherentBuffer::allocate(4 * 188, 0).unwrap();
        let urb = Urb::isoc(key(), 2, buffer, layout, Arc::new(Discard));

        let Transfer::Isoc { frames, asap, .. } = urb.transfer() else {
            panic!("expected isochronous transfer");
        };
        assert!(*asap);
        let offsets: Vec<_> = frames.iter().map(|f| (f.offset, f.length)).collect();
        assert_eq!(offsets, vec![(0, 188), (188, 188), (376, 188), (564, 188)]);
        assert_eq!(urb.pipe().address(), 0x82);
    }

    #[test]
    fn bulk_delivers_only_received_bytes() {
        let buffer = CoherentBuffer::allocate(512, 0).unwrap();
        let mut urb = Urb::bulk(key(), 2, buffer, Arc::new(Discard));
        let sink = Capture::default();
        let stats = StreamStats::default();

        urb.io_mut().0[..3].copy_from_slice(&[1, 2, 3]);
        urb.set_result(UrbStatus::Ok, 3);
        urb.deliver(&sink, &stats);
        urb.set_result(UrbStatus::Ok, 0);
        urb.deliver(&sink, &stats);

        assert_eq!(*sink.0.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(stats.snapshot().bytes_delivered, 3);
    }
}
