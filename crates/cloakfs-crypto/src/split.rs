//! Deterministic padding split derived from a container header.
//!
//! The split decides how the container's random padding is divided between
//! the region before the first chunk and the region after the last one. It
//! must be recomputable from the header alone (given the DEK) so a reopened
//! container finds its chunks again, and it must look random to anyone
//! without the key.

use aes::{Aes128, Aes256};
use anyhow::anyhow;
use cipher::KeyInit;
use sha2::{Digest, Sha256};
use xts_mode::Xts128;

use cloakfs_core::{Error, Result};

/// Split `unit` bytes of padding based on `data` and the DEK: SHA-256 the
/// input, XTS-encrypt the digest under the DEK with a zero tweak, fold the
/// result as little-endian u16 words, reduce modulo `unit`.
pub(crate) fn padding_split(dek: &[u8], unit: usize, data: &[u8]) -> Result<usize> {
    if unit == 0 {
        return Err(Error::invalid_argument("padding unit must be non-zero"));
    }

    let digest = Sha256::digest(data);
    let mut block = [0u8; 32];
    block.copy_from_slice(&digest);

    let tweak = [0u8; 16];
    match dek.len() {
        32 => {
            let c1 = Aes128::new_from_slice(&dek[..16])
                .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
            let c2 = Aes128::new_from_slice(&dek[16..])
                .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
            Xts128::new(c1, c2).encrypt_sector(&mut block, tweak);
        }
        64 => {
            let c1 = Aes256::new_from_slice(&dek[..32])
                .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
            let c2 = Aes256::new_from_slice(&dek[32..])
                .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
            Xts128::new(c1, c2).encrypt_sector(&mut block, tweak);
        }
        _ => {
            return Err(Error::invalid_argument(
                "padding split needs a 32- or 64-byte key",
            ));
        }
    }

    let mut split: u16 = 0;
    for pair in block.chunks_exact(2) {
        split ^= u16::from_le_bytes([pair[0], pair[1]]);
    }

    Ok(split as usize % unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_bounded() {
        let dek = [0x11u8; 32];
        let data = b"header bytes";

        let a = padding_split(&dek, 4096, data).unwrap();
        let b = padding_split(&dek, 4096, data).unwrap();
        assert_eq!(a, b);
        assert!(a < 4096);
    }

    #[test]
    fn key_and_data_both_matter() {
        let data = b"header bytes";
        let a = padding_split(&[0x11u8; 32], 65536, data).unwrap();
        let b = padding_split(&[0x22u8; 32], 65536, data).unwrap();
        let c = padding_split(&[0x11u8; 32], 65536, b"other bytes!").unwrap();
        // Collisions are possible but astronomically unlikely for fixed inputs.
        assert!(a != b || a != c);
    }

    #[test]
    fn rejects_unsupported_key_size() {
        assert!(matches!(
            padding_split(&[0u8; 16], 4096, b"x"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn sixty_four_byte_key_works() {
        let split = padding_split(&[0x5au8; 64], 1024, b"data").unwrap();
        assert!(split < 1024);
    }
}
