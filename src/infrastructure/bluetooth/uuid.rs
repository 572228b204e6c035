//! Bluetooth UUID Resolution
//!
//! Expands 16-bit Bluetooth SIG assigned numbers ("180D", "0x2A37") into full
//! 128-bit identifiers via the SIG base UUID template and parses full UUID
//! strings. Malformed input resolves to the all-zero sentinel instead of
//! failing; the sentinel means "no identity" and never matches a real
//! characteristic or service.

use windows::core::GUID;

const MAX_SHORT_UUID_LEN: usize = 6;
const SIG_BASE_PREFIX: &str = "0000";
const SIG_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";
const HEX_PREFIX: &str = "0x";

/// The all-zero "no identity" UUID.
pub const EMPTY_UUID: GUID = GUID::zeroed();

/// Resolves a UUID string into a `GUID`. Inputs of up to six characters are
/// treated as 16-bit assigned numbers and expanded through the SIG base
/// template; anything longer must be a full UUID. Invalid input yields
/// [`EMPTY_UUID`].
pub fn resolve_uuid(input: &str) -> GUID {
    let expanded = if input.len() <= MAX_SHORT_UUID_LEN {
        format!(
            "{}{}{}",
            SIG_BASE_PREFIX,
            input.replace(HEX_PREFIX, ""),
            SIG_BASE_SUFFIX
        )
    } else {
        input.to_string()
    };

    parse_guid(&expanded).unwrap_or(EMPTY_UUID)
}

pub fn is_empty_uuid(uuid: &GUID) -> bool {
    *uuid == EMPTY_UUID
}

/// Extracts the 16-bit assigned number from a SIG-based UUID. Only meaningful
/// for UUIDs built on the base template.
pub fn short_id(uuid: &GUID) -> u16 {
    (uuid.data1 & 0xFFFF) as u16
}

fn parse_guid(text: &str) -> Option<GUID> {
    let hex: String = text.replace('-', "");
    if hex.len() != 32 {
        return None;
    }

    let data1 = u32::from_str_radix(&hex[0..8], 16).ok()?;
    let data2 = u16::from_str_radix(&hex[8..12], 16).ok()?;
    let data3 = u16::from_str_radix(&hex[12..16], 16).ok()?;

    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).ok()?;
    }

    Some(GUID {
        data1,
        data2,
        data3,
        data4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_expands_through_base_template() {
        assert_eq!(
            resolve_uuid("180D"),
            resolve_uuid("0000180d-0000-1000-8000-00805f9b34fb")
        );
        assert_eq!(resolve_uuid("2A37").data1, 0x2A37);
    }

    #[test]
    fn hex_prefix_is_stripped() {
        assert_eq!(resolve_uuid("0x2A19"), resolve_uuid("2A19"));
    }

    #[test]
    fn full_uuid_parses_verbatim() {
        let uuid = resolve_uuid("c8c51726-81bc-483b-a052-f7a14ea3d281");
        assert_eq!(uuid.data1, 0xc8c51726);
        assert_eq!(uuid.data2, 0x81bc);
        assert_eq!(uuid.data4[0], 0xa0);
    }

    #[test]
    fn malformed_input_resolves_to_sentinel() {
        assert!(is_empty_uuid(&resolve_uuid("not-a-uuid-at-all")));
        assert!(is_empty_uuid(&resolve_uuid("XYZ")));
        assert!(is_empty_uuid(&resolve_uuid("")));
    }

    #[test]
    fn short_id_recovers_assigned_number() {
        assert_eq!(short_id(&resolve_uuid("180F")), 0x180F);
        assert_eq!(short_id(&resolve_uuid("0x2A37")), 0x2A37);
    }
}
