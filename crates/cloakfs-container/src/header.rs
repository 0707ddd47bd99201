//! Container header codec.
//!
//! ```text
//! magic[32] ‖ version:u32 LE ‖ unit:u32 LE ‖ reserved:u64 LE ‖ random[16]
//! ```
//! The random tail makes every header unique, which in turn makes the
//! padding split derived from it unique per container.

use rand::RngCore;

use cloakfs_core::{Error, Result};

/// `\x7f` prefix plus a readable name, zero-padded to 32 bytes.
pub(crate) const MAGIC: &[u8; 32] = b"\x7fCloakFS Encrypted Container\n\0\0\0";

pub(crate) const VERSION: u32 = 0x0001_0000;

pub(crate) const HEADER_LEN: usize = 64;

/// Largest encrypted chunk size accepted when opening a container.
pub(crate) const MAX_UNIT: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub unit: u32,
    random: [u8; 16],
}

impl Header {
    pub fn new(unit: u32) -> Self {
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        Self { unit, random }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..32].copy_from_slice(MAGIC);
        out[32..36].copy_from_slice(&VERSION.to_le_bytes());
        out[36..40].copy_from_slice(&self.unit.to_le_bytes());
        // reserved u64 stays zero
        out[48..64].copy_from_slice(&self.random);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        if &raw[..32] != MAGIC {
            return Err(Error::InvalidFormat("container magic mismatch"));
        }
        let version = u32::from_le_bytes(raw[32..36].try_into().unwrap());
        if version != VERSION {
            return Err(Error::InvalidFormat("unsupported container version"));
        }

        let unit = u32::from_le_bytes(raw[36..40].try_into().unwrap());
        if unit == 0 || unit > MAX_UNIT {
            return Err(Error::corrupt(format!("chunk size {unit} out of range")));
        }

        let mut random = [0u8; 16];
        random.copy_from_slice(&raw[48..64]);
        Ok(Self { unit, random })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let h = Header::new(66_580);
        let raw = h.encode();
        let back = Header::decode(&raw).unwrap();
        assert_eq!(back.unit, 66_580);
        assert_eq!(back.random, h.random);
    }

    #[test]
    fn two_headers_differ() {
        // The random tail makes the padding split input unique.
        assert_ne!(Header::new(4096).encode(), Header::new(4096).encode());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut raw = Header::new(4096).encode();
        raw[0] = b'X';
        assert!(matches!(
            Header::decode(&raw),
            Err(Error::InvalidFormat(_))
        ));

        let mut raw = Header::new(4096).encode();
        raw[32] ^= 1;
        assert!(matches!(
            Header::decode(&raw),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_oversized_unit() {
        let mut raw = Header::new(4096).encode();
        raw[36..40].copy_from_slice(&(MAX_UNIT + 1).to_le_bytes());
        assert!(matches!(Header::decode(&raw), Err(Error::Corrupt(_))));
    }
}
