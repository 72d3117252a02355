//! Account address handling.
//!
//! Supports the raw hex form (`workchain:hash`) and the user-friendly
//! base64 form (36 bytes: tag, workchain, hash, CRC16).

use std::fmt;

use base64::Engine;

use crate::tvm::error::{CellError, Result};

// CRC16 (polynomial 0x1021) over the 34-byte address body.
fn crc16(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc.to_be_bytes()
}

/// A standard account address: workchain plus a 256-bit hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Workchain ID (-1 for masterchain, 0 for basechain).
    pub workchain: i8,
    /// 32-byte hash part of the address.
    pub hash_part: [u8; 32],
    /// Whether the user-friendly form marks the address bounceable.
    pub is_bounceable: bool,
    /// Whether the user-friendly form marks the address test-only.
    pub is_test_only: bool,
}

impl Address {
    pub fn new(workchain: i8, hash_part: [u8; 32]) -> Self {
        Self {
            workchain,
            hash_part,
            is_bounceable: true,
            is_test_only: false,
        }
    }

    /// Parses either the hex or the base64 form.
    pub fn parse(address: &str) -> Result<Self> {
        if address.contains(':') {
            Self::from_hex(address)
        } else {
            Self::from_base64(address)
        }
    }

    /// Parses the raw form `workchain:hash`.
    pub fn from_hex(address: &str) -> Result<Self> {
        let (workchain, hash_hex) = address.split_once(':').ok_or_else(|| {
            CellError::AddressFormat("expected workchain:hash".to_string())
        })?;
        let workchain = workchain
            .parse::<i8>()
            .map_err(|e| CellError::AddressFormat(format!("bad workchain: {}", e)))?;
        if hash_hex.len() != 64 {
            return Err(CellError::AddressFormat(
                "hash part must be 64 hex characters".to_string(),
            ));
        }
        let bytes = hex::decode(hash_hex)
            .map_err(|e| CellError::AddressFormat(format!("bad hash hex: {}", e)))?;
        let mut hash_part = [0u8; 32];
        hash_part.copy_from_slice(&bytes);
        Ok(Self::new(workchain, hash_part))
    }

    /// Parses the 36-byte user-friendly base64 form.
    pub fn from_base64(address: &str) -> Result<Self> {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(address)
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(address))
            .map_err(|e| CellError::AddressFormat(format!("bad base64: {}", e)))?;
        if decoded.len() != 36 {
            return Err(CellError::AddressFormat(format!(
                "expected 36 bytes, got {}",
                decoded.len()
            )));
        }

        let mut tag = decoded[0];
        let is_test_only = tag & 0x80 != 0;
        tag &= 0x7f;
        let is_bounceable = match tag {
            0x11 => true,
            0x51 => false,
            _ => {
                return Err(CellError::AddressFormat(format!(
                    "unknown address tag {:#04x}",
                    tag
                )));
            }
        };

        let expected = &decoded[34..36];
        let actual = crc16(&decoded[0..34]);
        if expected != actual {
            return Err(CellError::AddressFormat("CRC16 mismatch".to_string()));
        }

        let workchain = decoded[1] as i8;
        let mut hash_part = [0u8; 32];
        hash_part.copy_from_slice(&decoded[2..34]);
        Ok(Self {
            workchain,
            hash_part,
            is_bounceable,
            is_test_only,
        })
    }

    /// The raw form `workchain:hash`.
    pub fn to_hex(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash_part))
    }

    /// The user-friendly base64 form with the given flags.
    pub fn to_user_friendly(&self, url_safe: bool, bounceable: bool, test_only: bool) -> String {
        let mut tag: u8 = if bounceable { 0x11 } else { 0x51 };
        if test_only {
            tag |= 0x80;
        }

        let mut data = Vec::with_capacity(36);
        data.push(tag);
        data.push(self.workchain as u8);
        data.extend_from_slice(&self.hash_part);
        let crc = crc16(&data);
        data.extend_from_slice(&crc);

        if url_safe {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&data)
        } else {
            base64::engine::general_purpose::STANDARD.encode(&data)
        }
    }

    pub fn to_base64(&self) -> String {
        self.to_user_friendly(true, self.is_bounceable, self.is_test_only)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl std::str::FromStr for Address {
    type Err = CellError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let addr =
            Address::from_hex("0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8")
                .unwrap();
        assert_eq!(addr.workchain, 0);
        assert_eq!(
            addr.to_hex(),
            "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8"
        );
    }

    #[test]
    fn test_base64_known_value() {
        let addr = Address::from_base64("EQCD39VS5jcptHL8vMjEXrzGaRcCVYto7HUn4bpAOg8xqB2N").unwrap();
        assert_eq!(addr.workchain, 0);
        assert!(addr.is_bounceable);
        assert!(!addr.is_test_only);
    }

    #[test]
    fn test_zero_address_formats() {
        let addr = Address::new(0, [0u8; 32]);
        assert_eq!(
            addr.to_user_friendly(true, true, false),
            "EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9c"
        );
        assert_eq!(
            addr.to_user_friendly(true, false, false),
            "UQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAJKZ"
        );
    }

    #[test]
    fn test_crc_rejected() {
        // Flip the final CRC character of a valid address.
        let err = Address::from_base64("EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9d");
        assert!(matches!(err, Err(CellError::AddressFormat(_))));
    }

    #[test]
    fn test_parse_dispatch() {
        assert!(Address::parse("not an address").is_err());
        let hex_form =
            "0:0000000000000000000000000000000000000000000000000000000000000000";
        assert_eq!(Address::parse(hex_form).unwrap().to_hex(), hex_form);
    }
}
