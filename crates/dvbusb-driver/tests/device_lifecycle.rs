//! Device probe, bring-up, teardown and failure unwinding.

mod common;

use std::sync::Arc;

use common::MockBus;
use dvbusb_driver::backends::{
    CoreEvent, CoreFault, HookCall, HookFault, LocalDvbCore, SimulatedDriver,
};
use dvbusb_driver::{
    AdapterProperties, DeviceConfig, DeviceProperties, DeviceState, DvbUsbDevice, DvbUsbError,
    FileFirmware, FrontendSlotProperties, PidFilterCaps, Probe, Result, StreamProperties,
    UsbDeviceId,
};
use dvbusb_hw::ids::{product, vendor, KNOWN_DEVICES};

struct Parts {
    bus: Arc<MockBus>,
    driver: Arc<SimulatedDriver>,
    core: Arc<LocalDvbCore>,
}

impl Parts {
    fn new(driver: SimulatedDriver) -> Self {
        Self {
            bus: MockBus::new(),
            driver: Arc::new(driver),
            core: Arc::new(LocalDvbCore::new()),
        }
    }

    fn init(&self) -> Result<DvbUsbDevice> {
        self.init_with(DeviceConfig::default())
    }

    fn init_with(&self, config: DeviceConfig) -> Result<DvbUsbDevice> {
        DvbUsbDevice::init(
            KNOWN_DEVICES[1],
            self.bus.clone(),
            self.driver.clone(),
            self.core.clone(),
            config,
        )
    }

    fn assert_clean(&self) {
        assert!(self.core.is_clean(), "left registered: {:?}", self.core.events());
        assert_eq!(self.bus.allocs(), self.bus.frees(), "coherent buffers leaked");
    }
}

fn slot() -> FrontendSlotProperties {
    FrontendSlotProperties {
        pid_filter: PidFilterCaps::None,
        stream: StreamProperties::bulk(3, 2, 4096),
    }
}

fn driver(adapters: usize, slots: usize) -> SimulatedDriver {
    SimulatedDriver::new(DeviceProperties {
        devices: vec![KNOWN_DEVICES[1]],
        firmware: Some("dvb-usb-nova-t-usb2-02.fw".into()),
        adapters: vec![
            AdapterProperties {
                frontends: vec![slot(); slots],
            };
            adapters
        ],
        remote: None,
    })
}

#[test]
fn test_init_registers_in_order_with_power_bracket() {
    let parts = Parts::new(driver(1, 1));
    let device = parts.init().expect("init");

    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(device.power_users(), 0);
    assert_eq!(
        parts.driver.journal(),
        vec![
            HookCall::Power(true),
            HookCall::FrontendAttach(0, 0),
            HookCall::TunerAttach(0, 0),
            HookCall::Power(false),
        ]
    );

    let events = parts.core.events();
    assert_eq!(events[0], CoreEvent::AdapterRegistered(0));
    assert!(matches!(events[1], CoreEvent::DemuxRegistered(0, _)));
    assert_eq!(events[2], CoreEvent::NetRegistered(0));
    assert!(matches!(events[3], CoreEvent::FrontendRegistered(0, 0, _)));
    assert_eq!(parts.bus.allocs(), 3);
}

#[test]
fn test_exit_unregisters_in_reverse_and_frees_buffers() {
    let parts = Parts::new(driver(2, 1));
    let mut device = parts.init().expect("init");
    let registered = parts.core.events().len();

    device.exit();

    let events = parts.core.events();
    assert_eq!(
        events[registered..],
        [
            CoreEvent::FrontendUnregistered(1, 0),
            CoreEvent::NetUnregistered(1),
            CoreEvent::DemuxUnregistered(1),
            CoreEvent::AdapterUnregistered(1),
            CoreEvent::FrontendUnregistered(0, 0),
            CoreEvent::NetUnregistered(0),
            CoreEvent::DemuxUnregistered(0),
            CoreEvent::AdapterUnregistered(0),
        ]
    );
    assert!(parts.driver.journal().contains(&HookCall::DemodDetach(0, 0)));
    assert_eq!(device.state(), DeviceState::Uninitialized);
    parts.assert_clean();

    device.exit();
    assert_eq!(parts.core.events().len(), events.len(), "exit is idempotent");
}

#[test]
fn test_drop_tears_down() {
    let parts = Parts::new(driver(1, 2));
    drop(parts.init().expect("init"));
    parts.assert_clean();
}

#[test]
fn test_failure_in_second_adapter_unwinds_everything() {
    let parts = Parts::new(driver(2, 1));
    parts.core.inject_fault(CoreFault::Net(1));

    let err = parts.init().expect_err("net registration fails");

    assert!(matches!(err, DvbUsbError::DeviceError { .. }));
    parts.assert_clean();
    assert_eq!(
        parts.driver.journal().last(),
        Some(&HookCall::Power(false)),
        "device powered off after unwinding"
    );
}

#[test]
fn test_allocation_failure_unwinds_everything() {
    let parts = Parts::new(driver(2, 1));
    parts.bus.fail_alloc_at(5);

    let err = parts.init().expect_err("fifth buffer fails");

    assert!(matches!(err, DvbUsbError::OutOfMemory { .. }));
    assert_eq!(parts.bus.allocs(), 4);
    parts.assert_clean();
}

#[test]
fn test_first_frontend_registration_failure_is_fatal() {
    let parts = Parts::new(driver(1, 2));
    parts.core.inject_fault(CoreFault::Frontend(0, 0));

    let err = parts.init().expect_err("frontend 0 refused");

    assert!(matches!(err, DvbUsbError::DeviceError { .. }));
    assert!(parts.driver.journal().contains(&HookCall::DemodDetach(0, 0)));
    parts.assert_clean();
}

#[test]
fn test_later_frontend_registration_failure_degrades() {
    let parts = Parts::new(driver(1, 3));
    parts.core.inject_fault(CoreFault::Frontend(0, 1));

    let device = parts.init().expect("init succeeds with one frontend");
    let adapter = device.adapter(0).expect("adapter 0");

    assert_eq!(adapter.frontend_count(), 1);
    assert!(adapter.frontend(1).is_none());
    assert!(adapter.frontend(2).is_none(), "registration stops at the failed slot");
    assert!(parts.driver.journal().contains(&HookCall::DemodDetach(0, 1)));
}

#[test]
fn test_missing_frontend_skips_the_slot() {
    let parts = Parts::new(driver(1, 2));
    parts.driver.inject_fault(HookFault::NoFrontend(0, 0));

    let device = parts.init().expect("init");
    let adapter = device.adapter(0).expect("adapter 0");

    assert!(adapter.frontend(0).is_none());
    assert!(adapter.frontend(1).is_some());
}

#[test]
fn test_invalid_properties_are_rejected_before_power_on() {
    let parts = Parts::new(driver(3, 1));

    let err = parts.init().expect_err("three adapters");

    assert!(matches!(err, DvbUsbError::InvalidConfiguration { .. }));
    assert!(parts.driver.journal().is_empty());
}

#[test]
fn test_i2c_adapter_is_available_to_attach() {
    let parts = Parts::new(driver(1, 1).with_i2c());
    let device = parts.init().expect("init");

    assert!(device.i2c().is_some());
    assert!(parts.driver.journal().contains(&HookCall::I2cTransfer(1)));
}

#[test]
fn test_probe_cold_device_downloads_firmware() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("dvb-usb-nova-t-usb2-02.fw"), [0u8; 64]).expect("write");
    let firmware = FileFirmware::new([dir.path().to_path_buf()]);
    let parts = Parts::new(driver(1, 1));

    let cold = UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_COLD);
    let probe = DvbUsbDevice::probe(
        cold,
        parts.bus.clone(),
        parts.driver.clone(),
        parts.core.clone(),
        &firmware,
        DeviceConfig::default(),
    )
    .expect("probe");

    assert!(matches!(probe, Probe::FirmwareDownloaded(id) if id.cold));
    assert_eq!(parts.driver.journal(), vec![HookCall::DownloadFirmware(64)]);
    assert!(parts.core.events().is_empty());

    let warm = UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_WARM);
    let probe = DvbUsbDevice::probe(
        warm,
        parts.bus.clone(),
        parts.driver.clone(),
        parts.core.clone(),
        &firmware,
        DeviceConfig::default(),
    )
    .expect("probe");
    let Probe::Ready(device) = probe else {
        panic!("warm device should come up");
    };
    assert_eq!(device.name(), "Hauppauge WinTV-NOVA-T usb2");
}

#[test]
fn test_probe_single_id_device_uses_identify_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("dvb-usb-simulated.fw"), [1u8; 16]).expect("write");
    let firmware = FileFirmware::new([dir.path().to_path_buf()]);
    let parts = Parts::new(SimulatedDriver::single(
        KNOWN_DEVICES[0],
        PidFilterCaps::None,
        StreamProperties::bulk(2, 2, 4096),
    ));
    let id = UsbDeviceId::new(vendor::DIBCOM, product::DIBCOM_STK7700P);

    let probe = |parts: &Parts| {
        DvbUsbDevice::probe(
            id,
            parts.bus.clone(),
            parts.driver.clone(),
            parts.core.clone(),
            &firmware,
            DeviceConfig::default(),
        )
    };

    assert!(matches!(probe(&parts), Ok(Probe::FirmwareDownloaded(_))));
    assert!(matches!(probe(&parts), Ok(Probe::Ready(_))));
}

#[test]
fn test_probe_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let firmware = FileFirmware::new([dir.path().to_path_buf()]);
    let parts = Parts::new(driver(1, 1));
    let probe = |id: UsbDeviceId| {
        DvbUsbDevice::probe(
            id,
            parts.bus.clone(),
            parts.driver.clone(),
            parts.core.clone(),
            &firmware,
            DeviceConfig::default(),
        )
    };

    assert!(matches!(
        probe(UsbDeviceId::new(0x1234, 0x5678)),
        Err(DvbUsbError::DeviceNotFound {
            vendor: 0x1234,
            product: 0x5678
        })
    ));
    assert!(matches!(
        probe(UsbDeviceId::new(
            vendor::HAUPPAUGE,
            product::WINTV_NOVA_T_USB2_COLD
        )),
        Err(DvbUsbError::Firmware { .. })
    ));

    std::fs::write(dir.path().join("dvb-usb-nova-t-usb2-02.fw"), [0u8; 8]).expect("write");
    parts.driver.inject_fault(HookFault::Firmware);
    assert!(matches!(
        probe(UsbDeviceId::new(
            vendor::HAUPPAUGE,
            product::WINTV_NOVA_T_USB2_COLD
        )),
        Err(DvbUsbError::Firmware { .. })
    ));
}

#[cfg(feature = "remote")]
mod remote {
    use std::time::Duration;

    use super::*;
    use dvbusb_driver::RemoteProperties;

    fn with_remote() -> SimulatedDriver {
        SimulatedDriver::new(DeviceProperties {
            devices: vec![KNOWN_DEVICES[1]],
            firmware: None,
            adapters: vec![AdapterProperties {
                frontends: vec![slot()],
            }],
            remote: Some(RemoteProperties {
                interval: Duration::from_millis(5),
            }),
        })
    }

    #[test]
    fn test_remote_keys_are_polled() {
        let parts = Parts::new(with_remote());
        let device = parts.init().expect("init");
        parts.driver.press_key(0x1e);

        let events = device.remote_events().expect("remote running");
        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("key event");
        assert_eq!(event.scancode, 0x1e);
        assert!(event.pressed);
    }

    #[test]
    fn test_remote_can_be_disabled() {
        let parts = Parts::new(with_remote());
        let device = parts
            .init_with(DeviceConfig {
                disable_remote: true,
                ..DeviceConfig::default()
            })
            .expect("init");
        assert!(device.remote_events().is_none());
    }
}
