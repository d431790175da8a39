//! BLE GATT Service Constants for Parking Locks
//!
//! The two lock generations expose different GATT layouts. Gen2 uses the
//! Nordic UART style 128-bit vendor UUIDs, Gen1 uses 16-bit UUIDs on the
//! Bluetooth base UUID.

use crate::Generation;

/// Gen2 service UUID: 6E400001-B5A3-F393-E0A9-E50E24DCCA9E
///
/// Its presence during discovery marks the peripheral as Gen2.
pub const GEN2_SERVICE_UUID: u128 = 0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E;

/// Gen2 write characteristic UUID (commands)
pub const GEN2_WRITE_UUID: u128 = 0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E;

/// Gen2 notify characteristic UUID (responses)
pub const GEN2_NOTIFY_UUID: u128 = 0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E;

/// Gen1 service UUID (0xFFF0)
pub const GEN1_SERVICE_UUID: u128 = base_uuid(0xFFF0);

/// Gen1 notify characteristic UUID (0xFFF1)
pub const GEN1_NOTIFY_UUID: u128 = base_uuid(0xFFF1);

/// Gen1 write characteristic UUID (0xFFF2)
pub const GEN1_WRITE_UUID: u128 = base_uuid(0xFFF2);

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit assigned UUID onto the Bluetooth base UUID.
pub const fn base_uuid(short: u16) -> u128 {
    BLUETOOTH_BASE_UUID | ((short as u128) << 96)
}

/// Characteristic layout used by one lock generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: u128,
    pub notify: u128,
    pub write: u128,
}

pub const fn gatt_profile(generation: Generation) -> GattProfile {
    match generation {
        Generation::Gen1 => GattProfile {
            service: GEN1_SERVICE_UUID,
            notify: GEN1_NOTIFY_UUID,
            write: GEN1_WRITE_UUID,
        },
        Generation::Gen2 => GattProfile {
            service: GEN2_SERVICE_UUID,
            notify: GEN2_NOTIFY_UUID,
            write: GEN2_WRITE_UUID,
        },
    }
}
