//! Data stream lifecycle: init / submit / kill / exit, completion handling
//! and rollback on failure.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{bulk_fill, status, Capture, MockBus};
use dvbusb_driver::backends::{SoftwareBus, SoftwareBusConfig};
use dvbusb_driver::{DataStream, DvbUsbError, StreamProperties, UrbStatus};
use dvbusb_hw::ts;

fn stream(bus: &Arc<MockBus>, sink: &Arc<Capture>) -> DataStream {
    DataStream::new(bus.clone()).with_sink(sink.clone())
}

#[test]
fn test_init_exit_cycles_are_leak_free() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);

    for _ in 0..3 {
        stream
            .init(&StreamProperties::bulk(5, 2, 4096))
            .expect("init");
        assert_eq!(stream.urbs_initialized(), 5);
        stream.submit().expect("submit");
        assert_eq!(bus.queued(), 5);
        stream.kill();
        stream.exit();
        assert_eq!(stream.urbs_initialized(), 0);
        assert_eq!(stream.buffers_outstanding(), 0);
    }

    assert_eq!(bus.allocs(), 15);
    assert_eq!(bus.frees(), 15);
}

#[test]
fn test_kill_is_idempotent() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);

    stream.kill();
    stream
        .init(&StreamProperties::bulk(3, 2, 1024))
        .expect("init");
    stream.kill();
    stream.submit().expect("submit");

    stream.kill();
    assert_eq!(bus.queued(), 0);
    assert_eq!(stream.urbs_submitted(), 0);
    let cancels = bus.cancels();

    stream.kill();
    assert_eq!(bus.cancels(), cancels, "second kill must not touch the bus");
    assert!(!stream.is_submitted());
}

#[test]
fn test_allocation_failure_releases_earlier_buffers() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);

    bus.fail_alloc_at(3);
    let err = stream
        .init(&StreamProperties::bulk(5, 2, 4096))
        .expect_err("third allocation fails");

    assert!(matches!(err, DvbUsbError::OutOfMemory { requested: 4096 }));
    assert_eq!(bus.allocs(), 2);
    assert_eq!(bus.frees(), 2);
    assert_eq!(stream.urbs_initialized(), 0);

    stream
        .init(&StreamProperties::bulk(5, 2, 4096))
        .expect("retry succeeds");
    assert_eq!(stream.urbs_initialized(), 5);
}

#[test]
fn test_submit_failure_reports_index_and_kills_the_rest() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(4, 2, 1024))
        .expect("init");

    bus.fail_submit_at(3);
    let err = stream.submit().expect_err("third submit fails");

    assert!(matches!(err, DvbUsbError::TransportError { index: 2, .. }));
    assert_eq!(bus.queued(), 0);
    assert_eq!(stream.urbs_submitted(), 0);

    stream.submit().expect("every urb is back and can be resubmitted");
    assert_eq!(bus.queued(), 4);
}

#[test]
fn test_bulk_completion_forwards_and_resubmits() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(2, 2, 512))
        .expect("init");
    stream.submit().expect("submit");

    assert_eq!(bus.complete_all(bulk_fill(0xab, 100)), 2);

    assert_eq!(sink.chunks(), vec![vec![0xab; 100], vec![0xab; 100]]);
    assert_eq!(bus.queued(), 2, "both urbs resubmitted");
    let stats = stream.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.bytes_delivered, 200);
}

#[test]
fn test_empty_bulk_completion_is_not_forwarded() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(1, 2, 512))
        .expect("init");
    stream.submit().expect("submit");

    bus.complete_all(status(UrbStatus::Timeout));

    assert!(sink.chunks().is_empty());
    assert_eq!(bus.queued(), 1);
}

#[test]
fn test_terminal_status_stops_resubmission() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(2, 2, 512))
        .expect("init");
    stream.submit().expect("submit");

    bus.complete_all(status(UrbStatus::NoDevice));

    assert_eq!(bus.queued(), 0);
    assert!(sink.chunks().is_empty());
    stream.kill();
    stream.exit();
    assert_eq!(bus.frees(), 2);
}

#[test]
fn test_transport_error_is_counted_and_streaming_continues() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(2, 2, 512))
        .expect("init");
    stream.submit().expect("submit");

    bus.complete_all(status(UrbStatus::Stall));

    assert_eq!(bus.queued(), 2);
    assert_eq!(stream.stats().transport_errors, 2);
}

#[test]
fn test_rejected_resubmission_parks_the_urb() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::bulk(2, 2, 512))
        .expect("init");
    stream.submit().expect("submit");

    bus.reject_submits(true);
    bus.complete_all(bulk_fill(1, 10));

    assert_eq!(bus.queued(), 0);
    assert_eq!(stream.stats().resubmit_failures, 2);
    stream.kill();
    stream.exit();
    assert_eq!(bus.frees(), 2);
}

#[test]
fn test_isoc_frames_are_processed_independently() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    stream
        .init(&StreamProperties::isoc(1, 3, 4, 188, 1))
        .expect("init");
    stream.submit().expect("submit");

    bus.complete_next(|urb| {
        let (data, frames) = urb.io_mut();
        for (i, frame) in frames.iter_mut().enumerate() {
            data[frame.offset..frame.offset + frame.length].fill(i as u8 + 1);
            frame.actual_length = frame.length;
            frame.status = if i % 2 == 1 {
                UrbStatus::Error(-71)
            } else {
                UrbStatus::Ok
            };
        }
        urb.set_result(UrbStatus::Ok, 0);
    });

    assert_eq!(sink.chunks(), vec![vec![1u8; 188], vec![3u8; 188]]);
    assert_eq!(stream.stats().frame_errors, 2);
    assert_eq!(bus.queued(), 1, "urb resubmitted");

    let mut reset = false;
    bus.complete_next(|urb| {
        let (_, frames) = urb.io_mut();
        reset = frames
            .iter()
            .all(|f| f.status == UrbStatus::Ok && f.actual_length == 0);
        urb.set_result(UrbStatus::Ok, 0);
    });
    assert!(reset, "frame descriptors reset before resubmission");
}

#[test]
fn test_configuration_errors() {
    let bus = MockBus::new();
    let mut bare = DataStream::new(bus.clone());
    assert!(matches!(
        bare.init(&StreamProperties::bulk(2, 2, 512)),
        Err(DvbUsbError::InvalidConfiguration { .. })
    ));
    bare.submit().expect("submit of an uninitialized stream is a no-op");

    let sink = Arc::new(Capture::default());
    let mut stream = stream(&bus, &sink);
    assert!(matches!(
        stream.init(&StreamProperties::bulk(11, 2, 512)),
        Err(DvbUsbError::InvalidConfiguration { .. })
    ));
    assert!(matches!(
        stream.init(&StreamProperties::bulk(2, 2, 0)),
        Err(DvbUsbError::InvalidConfiguration { .. })
    ));

    stream
        .init(&StreamProperties::bulk(2, 2, 512))
        .expect("init");
    assert!(stream.init(&StreamProperties::bulk(2, 2, 512)).is_err());
    stream.submit().expect("submit");
    assert!(matches!(
        stream.submit(),
        Err(DvbUsbError::InvalidConfiguration { .. })
    ));
    assert_eq!(bus.allocs(), 2);
}

#[test]
fn test_drop_releases_everything() {
    let bus = MockBus::new();
    let sink = Arc::new(Capture::default());
    {
        let mut stream = stream(&bus, &sink);
        stream
            .init(&StreamProperties::bulk(3, 2, 512))
            .expect("init");
        stream.submit().expect("submit");
    }
    assert_eq!(bus.queued(), 0);
    assert_eq!(bus.frees(), 3);
}

#[test]
fn test_software_bus_streams_until_killed() {
    let bus = SoftwareBus::new(SoftwareBusConfig {
        pids: vec![0x100],
        completion_delay: Duration::from_millis(1),
        ..SoftwareBusConfig::default()
    })
    .expect("software bus");
    let sink = Arc::new(Capture::default());
    let mut stream = DataStream::new(bus.clone()).with_sink(sink.clone());
    stream
        .init(&StreamProperties::bulk(4, 2, 4 * ts::PACKET_SIZE))
        .expect("init");
    stream.submit().expect("submit");

    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.chunks().len() < 8 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    stream.kill();

    let chunks = sink.chunks();
    assert!(chunks.len() >= 8, "got {} chunks", chunks.len());
    assert_eq!(bus.queued(), 0);
    for chunk in &chunks {
        assert_eq!(chunk.len(), 4 * ts::PACKET_SIZE);
        assert_eq!(ts::pid(chunk), Some(0x100));
    }

    let delivered = sink.chunks().len();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(sink.chunks().len(), delivered, "no completions after kill");

    stream.exit();
    assert_eq!(bus.allocations(), bus.frees());
}
