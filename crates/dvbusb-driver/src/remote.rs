//! Remote-control polling
//!
//! Devices with an IR receiver are polled on a fixed interval through the
//! driver's `rc_query` hook. Decoded events are published on a bounded
//! channel; events nobody reads are dropped and counted.

/// One remote-control key event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcEvent {
    /// Protocol scancode as reported by the receiver
    pub scancode: u32,
    /// Key pressed (`true`) or released
    pub pressed: bool,
}

#[cfg(feature = "remote")]
pub use polling::RemoteControl;

#[cfg(feature = "remote")]
mod polling {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
    use tracing::{debug, error, warn};

    use super::RcEvent;
    use crate::driver::{DeviceDriver, RemoteProperties};
    use crate::error::Result;

    /// Running poller; stops on [`stop`](Self::stop) or drop
    #[derive(Debug)]
    pub struct RemoteControl {
        stop: Option<Sender<()>>,
        events: Receiver<RcEvent>,
        dropped: Arc<AtomicU64>,
        worker: Option<JoinHandle<()>>,
    }

    impl RemoteControl {
        /// Unread events held before new ones are dropped
        pub const EVENT_DEPTH: usize = 32;

        /// Start polling `driver`
        ///
        /// # Errors
        ///
        /// I/O error if the polling thread cannot be spawned.
        pub fn start(driver: Arc<dyn DeviceDriver>, props: RemoteProperties) -> Result<Self> {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let (event_tx, event_rx) = bounded(Self::EVENT_DEPTH);
            let dropped = Arc::new(AtomicU64::new(0));
            let dropped_by_worker = Arc::clone(&dropped);

            let worker = thread::Builder::new()
                .name("dvbusb-rc".into())
                .spawn(move || {
                    debug!("remote polling every {:?}", props.interval);
                    loop {
                        match stop_rx.recv_timeout(props.interval) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                        match driver.rc_query() {
                            Ok(Some(event)) => {
                                debug!("rc key {:#x} pressed={}", event.scancode, event.pressed);
                                match event_tx.try_send(event) {
                                    Ok(()) => {}
                                    Err(TrySendError::Full(_)) => {
                                        dropped_by_worker.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(TrySendError::Disconnected(_)) => break,
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("rc query failed: {e}"),
                        }
                    }
                    debug!("remote polling stopped");
                })?;

            Ok(Self {
                stop: Some(stop_tx),
                events: event_rx,
                dropped,
                worker: Some(worker),
            })
        }

        /// Received key events
        pub const fn events(&self) -> &Receiver<RcEvent> {
            &self.events
        }

        /// Events dropped because the channel was full
        pub fn dropped(&self) -> u64 {
            self.dropped.load(Ordering::Relaxed)
        }

        /// Stop polling and wait for the poller to exit
        pub fn stop(&mut self) {
            drop(self.stop.take());
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    error!("remote polling thread panicked");
                }
            }
        }
    }

    impl Drop for RemoteControl {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(all(test, feature = "remote"))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::driver::{AttachContext, DeviceDriver, DeviceProperties, RemoteProperties};
    use crate::error::Result;
    use crate::frontend::Frontend;

    struct Keys {
        props: DeviceProperties,
        pending: Mutex<Vec<u32>>,
    }

    impl DeviceDriver for Keys {
        fn properties(&self) -> &DeviceProperties {
            &self.props
        }

        fn frontend_attach(&self, _ctx: &AttachContext<'_>) -> Result<Option<Box<dyn Frontend>>> {
            Ok(None)
        }

        fn rc_query(&self) -> Result<Option<RcEvent>> {
            Ok(self.pending.lock().unwrap().pop().map(|scancode| RcEvent {
                scancode,
                pressed: true,
            }))
        }
    }

    #[test]
    fn polled_keys_arrive_on_the_channel() {
        let driver = Arc::new(Keys {
            props: DeviceProperties {
                devices: Vec::new(),
                firmware: None,
                adapters: Vec::new(),
                remote: None,
            },
            pending: Mutex::new(vec![0x0c, 0x0b]),
        });
        let mut rc = RemoteControl::start(
            driver,
            RemoteProperties {
                interval: Duration::from_millis(5),
            },
        )
        .unwrap();

        let first = rc.events().recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rc.events().recv_timeout(Duration::from_secs(5)).unwrap();
        rc.stop();

        assert_eq!((first.scancode, second.scancode), (0x0b, 0x0c));
    }

    #[test]
    fn unread_keys_are_dropped_once_the_channel_is_full() {
        let extra = 8;
        let driver = Arc::new(Keys {
            props: DeviceProperties {
                devices: Vec::new(),
                firmware: None,
                adapters: Vec::new(),
                remote: None,
            },
            pending: Mutex::new((0..(RemoteControl::EVENT_DEPTH + extra) as u32).collect()),
        });
        let mut rc = RemoteControl::start(
            Arc::clone(&driver) as Arc<dyn DeviceDriver>,
            RemoteProperties {
                interval: Duration::from_millis(1),
            },
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !driver.pending.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "keys not polled");
            std::thread::sleep(Duration::from_millis(2));
        }
        rc.stop();

        assert_eq!(rc.events().len(), RemoteControl::EVENT_DEPTH);
        assert_eq!(rc.dropped(), extra as u64);
    }
}
