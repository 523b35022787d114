use uuid::Uuid;

use crate::{Error, ErrorKind, Result};

/// UUID extension trait to convert to and from Bluetooth short UUIDs.
pub trait UuidExt {
    /// 32-bit short form of Bluetooth UUID.
    fn as_u32(&self) -> Option<u32>;
    /// 16-bit short form of Bluetooth UUID.
    fn as_u16(&self) -> Option<u16>;
    /// Long form of 32-bit short form Bluetooth UUID.
    fn from_u32(v: u32) -> Uuid;
    /// Long form of 16-bit short form Bluetooth UUID.
    fn from_u16(v: u16) -> Uuid;
    /// Parses a UUID in any of the forms accepted on the bus.
    ///
    /// 16-bit and 32-bit hexadecimal short forms, with an optional `0x`
    /// prefix, are expanded against the Bluetooth base UUID. Full-form input
    /// must be in dashed notation and is normalized to lowercase.
    fn parse_bluetooth(s: &str) -> Result<Uuid>;
}

const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

impl UuidExt for Uuid {
    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BASE_MASK_32 == BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BASE_MASK_16 == BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn from_u32(v: u32) -> Uuid {
        Uuid::from_u128(BASE_UUID | ((v as u128) << 96))
    }

    fn from_u16(v: u16) -> Uuid {
        Uuid::from_u128(BASE_UUID | ((v as u128) << 96))
    }

    fn parse_bluetooth(s: &str) -> Result<Uuid> {
        let lower = s.to_ascii_lowercase();
        let hex = lower.strip_prefix("0x").unwrap_or(&lower);
        if !hex.is_empty() && hex.len() <= 8 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            let v = u32::from_str_radix(hex, 16)
                .map_err(|_| Error::with_message(ErrorKind::InvalidArguments, format!("invalid Bluetooth UUID: {s}")))?;
            return Ok(Uuid::from_u32(v));
        }
        if lower.len() == 36 {
            if let Ok(uuid) = Uuid::parse_str(&lower) {
                return Ok(uuid);
            }
        }
        Err(Error::with_message(ErrorKind::InvalidArguments, format!("invalid Bluetooth UUID: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_expand_against_base() {
        let uuid = Uuid::parse_bluetooth("0xFFF1").unwrap();
        assert_eq!(uuid.to_string(), "0000fff1-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid.as_u16(), Some(0xfff1));

        let uuid = Uuid::parse_bluetooth("f100").unwrap();
        assert_eq!(uuid.to_string(), "0000f100-0000-1000-8000-00805f9b34fb");

        let uuid = Uuid::parse_bluetooth("0x12345678").unwrap();
        assert_eq!(uuid.to_string(), "12345678-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid.as_u32(), Some(0x12345678));
        assert_eq!(uuid.as_u16(), None);
    }

    #[test]
    fn full_form_is_idempotent() {
        let s = "0000fff1-0000-1000-8000-00805f9b34fb";
        let uuid = Uuid::parse_bluetooth(s).unwrap();
        assert_eq!(uuid.to_string(), s);
        let again = Uuid::parse_bluetooth(&uuid.to_string()).unwrap();
        assert_eq!(again, uuid);
    }

    #[test]
    fn uppercase_full_form_normalizes() {
        let uuid = Uuid::parse_bluetooth("0000FFF1-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(uuid.to_string(), "0000fff1-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn malformed_uuids_rejected() {
        for s in ["", "0x", "xyz", "123456789", "0000fff1-0000-1000-8000", "not-a-uuid-at-all-really-not-a-uuid!"] {
            assert!(Uuid::parse_bluetooth(s).is_err(), "accepted {s:?}");
        }
    }
}
