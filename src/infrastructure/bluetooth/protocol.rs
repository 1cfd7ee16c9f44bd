//! GATT identifier helpers
//!
//! Service and characteristic identifiers are 128-bit UUIDs. Adopted SIG
//! identifiers are usually written in their 16- or 32-bit short form, which
//! maps onto the Bluetooth base UUID.

use crate::error::{Error, Result};
use uuid::Uuid;

/// Bluetooth base UUID: `0000xxxx-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_BITS);

const BASE_UUID_BITS: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Generic Access service (0x1800).
pub const GENERIC_ACCESS_SERVICE: Uuid = from_short(0x1800);

/// Device Name characteristic (0x2A00).
pub const DEVICE_NAME_CHAR: Uuid = from_short(0x2A00);

/// Battery service (0x180F).
pub const BATTERY_SERVICE: Uuid = from_short(0x180F);

/// Battery Level characteristic (0x2A19).
pub const BATTERY_LEVEL_CHAR: Uuid = from_short(0x2A19);

/// Expand a 16- or 32-bit SIG identifier onto the base UUID.
pub const fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

/// Parse a service or characteristic identifier.
///
/// Accepts full UUIDs (hyphenated or not) and 4 or 8 digit hex short forms.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if digits.len() == 4 || digits.len() == 8 {
        let short =
            u32::from_str_radix(digits, 16).map_err(|_| Error::InvalidUuid(uuid_str.to_string()))?;
        return Ok(from_short(short));
    }

    Uuid::parse_str(trimmed).map_err(|_| Error::InvalidUuid(uuid_str.to_string()))
}
