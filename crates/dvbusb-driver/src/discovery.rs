//! Device identification and USB discovery
//!
//! Two halves: matching a (vendor, product) pair against a driver's device
//! table, and scanning `/sys/bus/usb/devices` for attached devices that any
//! known table recognises.

use std::fs;
use std::path::{Path, PathBuf};

use dvbusb_hw::ids::KNOWN_DEVICES;
use dvbusb_hw::{DeviceDescription, UsbDeviceId};
use tracing::{debug, info};

use crate::driver::DeviceDriver;
use crate::error::{DvbUsbError, Result};

/// Default sysfs root for USB devices
pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Result of a device-table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identified {
    /// Matching table entry
    pub description: DeviceDescription,
    /// Whether the id is a cold (pre-firmware) id
    pub cold: bool,
}

/// Look `id` up in `table`
///
/// Entries are tried in order; within an entry the cold ids are tried before
/// the warm ids.
#[must_use]
pub fn find_device(table: &[DeviceDescription], id: UsbDeviceId) -> Option<Identified> {
    table.iter().find_map(|description| {
        if description.matches_cold(id) {
            Some(Identified {
                description: *description,
                cold: true,
            })
        } else if description.matches_warm(id) {
            Some(Identified {
                description: *description,
                cold: false,
            })
        } else {
            None
        }
    })
}

/// Table lookup followed by the driver's `identify_state` override
///
/// # Errors
///
/// `DeviceNotFound` when neither the table nor the override recognises `id`.
pub fn identify(driver: &dyn DeviceDriver, id: UsbDeviceId) -> Result<Identified> {
    let found = find_device(&driver.properties().devices, id);
    if found.is_none() {
        debug!("{id} not in the device table, asking the driver");
    }

    let identified = driver
        .identify_state(id, found)?
        .ok_or(DvbUsbError::DeviceNotFound {
            vendor: id.vendor,
            product: id.product,
        })?;

    info!(
        "{id}: {} in {} state",
        identified.description.name,
        if identified.cold { "cold" } else { "warm" }
    );
    Ok(identified)
}

/// A USB device found in sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// sysfs directory
    pub path: PathBuf,
    /// Vendor and product id
    pub id: UsbDeviceId,
    /// Bus number
    pub busnum: u32,
    /// Device address on the bus
    pub devnum: u32,
    /// Match against [`KNOWN_DEVICES`], if any
    pub known: Option<Identified>,
}

/// Scan the system's USB devices
///
/// # Errors
///
/// I/O error if the sysfs directory cannot be read.
pub fn enumerate() -> Result<Vec<UsbDeviceInfo>> {
    enumerate_at(Path::new(SYSFS_USB_DEVICES))
}

/// Scan USB devices below `root`
///
/// Interface directories and entries without readable ids are skipped.
/// Results are sorted by bus and address.
///
/// # Errors
///
/// I/O error if `root` cannot be read.
pub fn enumerate_at(root: &Path) -> Result<Vec<UsbDeviceInfo>> {
    debug!("Scanning {} for USB devices", root.display());

    let mut devices = Vec::new();
    for entry in fs::read_dir(root)?.flatten() {
        let path = entry.path();
        let (Ok(vendor), Ok(product)) = (
            read_hex_sysfs(&path.join("idVendor")),
            read_hex_sysfs(&path.join("idProduct")),
        ) else {
            continue;
        };
        let id = UsbDeviceId::new(vendor, product);
        let busnum = read_dec_sysfs(&path.join("busnum")).unwrap_or(0);
        let devnum = read_dec_sysfs(&path.join("devnum")).unwrap_or(0);
        let known = find_device(KNOWN_DEVICES, id);
        if let Some(known) = known {
            info!(
                "{busnum:03}:{devnum:03} {id} {} ({})",
                known.description.name,
                if known.cold { "cold" } else { "warm" }
            );
        }
        devices.push(UsbDeviceInfo {
            path,
            id,
            busnum,
            devnum,
            known,
        });
    }

    devices.sort_by_key(|d| (d.busnum, d.devnum));
    Ok(devices)
}

fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).map_err(|e| {
        DvbUsbError::invalid_config(format!("{}: bad hex value: {e}", path.display()))
    })
}

fn read_dec_sysfs(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)?;
    content.trim().parse().map_err(|e| {
        DvbUsbError::invalid_config(format!("{}: bad value: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvbusb_hw::ids::{product, vendor};

    #[test]
    fn cold_and_warm_ids_are_distinguished() {
        let cold = UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_COLD);
        let warm = UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_WARM);

        let found = find_device(KNOWN_DEVICES, cold).unwrap();
        assert!(found.cold);
        let found = find_device(KNOWN_DEVICES, warm).unwrap();
        assert!(!found.cold);
        assert_eq!(found.description.name, "Hauppauge WinTV-NOVA-T usb2");
    }

    #[test]
    fn unknown_id_is_not_found() {
        assert!(find_device(KNOWN_DEVICES, UsbDeviceId::new(0xdead, 0xbeef)).is_none());
    }

    #[test]
    fn scans_fake_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let write = |dir: &str, vendor: &str, product: &str, bus: &str, dev: &str| {
            let path = root.path().join(dir);
            fs::create_dir(&path).unwrap();
            fs::write(path.join("idVendor"), vendor).unwrap();
            fs::write(path.join("idProduct"), product).unwrap();
            fs::write(path.join("busnum"), bus).unwrap();
            fs::write(path.join("devnum"), dev).unwrap();
        };
        write("2-1", "0fe9\n", "d501\n", "2\n", "5\n");
        write("1-1", "1d6b\n", "0002\n", "1\n", "1\n");
        fs::create_dir(root.path().join("1-1:1.0")).unwrap();

        let devices = enumerate_at(root.path()).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].busnum, 1);
        assert!(devices[0].known.is_none());
        let known = devices[1].known.unwrap();
        assert!(!known.cold);
        assert_eq!(devices[1].id, UsbDeviceId::new(0x0fe9, 0xd501));
    }
}
