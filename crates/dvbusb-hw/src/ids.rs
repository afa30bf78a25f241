//! USB identifiers and the cold/warm device table.
//!
//! A DVB-USB receiver shows up twice in its life: *cold*, with a minimal
//! descriptor and no firmware, and *warm*, after the host has uploaded firmware
//! and the device has re-enumerated. Drivers describe each supported product
//! with the ids it uses in both states. Some chipsets use the same id for
//! both; their drivers tell the states apart with an `identify_state` hook.

use std::fmt;

/// USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbDeviceId {
    /// idVendor
    pub vendor: u16,
    /// idProduct
    pub product: u16,
}

impl UsbDeviceId {
    /// Build an id from vendor and product.
    #[must_use]
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// One product a driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Marketing name.
    pub name: &'static str,
    /// Ids the product reports before firmware upload.
    pub cold_ids: &'static [UsbDeviceId],
    /// Ids the product reports with firmware running.
    pub warm_ids: &'static [UsbDeviceId],
}

impl DeviceDescription {
    /// Whether `id` is one of this product's cold ids.
    #[must_use]
    pub fn matches_cold(&self, id: UsbDeviceId) -> bool {
        self.cold_ids.contains(&id)
    }

    /// Whether `id` is one of this product's warm ids.
    #[must_use]
    pub fn matches_warm(&self, id: UsbDeviceId) -> bool {
        self.warm_ids.contains(&id)
    }
}

/// Vendor ids.
pub mod vendor {
    /// DiBcom.
    pub const DIBCOM: u16 = 0x10B8;
    /// Hauppauge.
    pub const HAUPPAUGE: u16 = 0x2040;
    /// DViCO (Cypress FX2 based boards).
    pub const DVICO: u16 = 0x0FE9;
    /// Afatech.
    pub const AFATECH: u16 = 0x15A4;
}

/// Product ids.
pub mod product {
    /// DiBcom STK7700P reference design (same id cold and warm).
    pub const DIBCOM_STK7700P: u16 = 0x1E14;
    /// Hauppauge WinTV-NOVA-T USB2, cold.
    pub const WINTV_NOVA_T_USB2_COLD: u16 = 0x9300;
    /// Hauppauge WinTV-NOVA-T USB2, warm.
    pub const WINTV_NOVA_T_USB2_WARM: u16 = 0x9301;
    /// DViCO FusionHDTV Bluebird LG064F, cold.
    pub const DVICO_BLUEBIRD_LG064F_COLD: u16 = 0xD500;
    /// DViCO FusionHDTV Bluebird LG064F, warm.
    pub const DVICO_BLUEBIRD_LG064F_WARM: u16 = 0xD501;
    /// Afatech AF9015 reference design.
    pub const AFATECH_AF9015: u16 = 0x9016;
}

/// Representative table of receivers driven by the streaming core.
pub const KNOWN_DEVICES: &[DeviceDescription] = &[
    DeviceDescription {
        name: "DiBcom STK7700P reference design",
        cold_ids: &[UsbDeviceId::new(vendor::DIBCOM, product::DIBCOM_STK7700P)],
        warm_ids: &[],
    },
    DeviceDescription {
        name: "Hauppauge WinTV-NOVA-T usb2",
        cold_ids: &[UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_COLD)],
        warm_ids: &[UsbDeviceId::new(vendor::HAUPPAUGE, product::WINTV_NOVA_T_USB2_WARM)],
    },
    DeviceDescription {
        name: "DViCO FusionHDTV5 USB Gold",
        cold_ids: &[UsbDeviceId::new(vendor::DVICO, product::DVICO_BLUEBIRD_LG064F_COLD)],
        warm_ids: &[UsbDeviceId::new(vendor::DVICO, product::DVICO_BLUEBIRD_LG064F_WARM)],
    },
    DeviceDescription {
        name: "Afatech AF9015 DVB-T USB2.0 stick",
        cold_ids: &[],
        warm_ids: &[UsbDeviceId::new(vendor::AFATECH, product::AFATECH_AF9015)],
    },
];
