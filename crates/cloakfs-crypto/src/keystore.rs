//! Password-protected key store: a fixed-size binary record wrapping a DEK.
//!
//! Record layout (252 bytes, little-endian, base64-encoded for transport):
//! ```text
//! magic:u32 ‖ version:u16 ‖ pad:u16 ‖ cipher[32] ‖ kdf[32] ‖ cbKey:u32
//! ‖ dekDigest[32] ‖ cbDekDigest:u32 ‖ dekDigestSalt[32] ‖ digestIters:u32
//! ‖ dekSalt[32] ‖ dekIters:u32 ‖ cbDekEnc:u32 ‖ dekEnc[64]
//! ```
//! The DEK is wrapped with AES-XTS under a PBKDF2-derived key; the zero
//! tweak is safe because every wrapping key is random, per-store, and used
//! exactly once. The verification digest (PBKDF2 over the raw DEK with an
//! independent salt) lets a load distinguish "wrong password" from "corrupt
//! store" before any wrapped data is trusted.

use std::time::{Duration, Instant};

use aes::{Aes128, Aes256};
use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cipher::KeyInit;
use hmac::Hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use xts_mode::Xts128;
use zeroize::Zeroizing;

use cloakfs_core::{Error, Result};

/// Record magic ("ENCS").
pub const KEYSTORE_MAGIC: u32 = 0x454e_4353;

/// Record format version.
pub const KEYSTORE_VERSION: u16 = 0x0200;

/// Floor for every PBKDF2 iteration count in the store.
pub const MIN_PBKDF2_ITERATIONS: u32 = 20_000;

/// Wall-clock budget for the iteration-count benchmark.
const PBKDF2_BENCH_BUDGET: Duration = Duration::from_millis(250);

const RECORD_LEN: usize = 252;
const NAME_CAP: usize = 32;
const SALT_LEN: usize = 32;
const DIGEST_CAP: usize = 32;
const DEK_ENC_CAP: usize = 64;
const DEK_LEN_MAX: u32 = 1 << 20;

/// Key derivation function named in the record. Stores are always created
/// with SHA-256 but the other variants must load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kdf {
    Pbkdf2Sha1,
    Pbkdf2Sha256,
    Pbkdf2Sha512,
}

impl Kdf {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "PBKDF2-SHA1" => Some(Kdf::Pbkdf2Sha1),
            "PBKDF2-SHA256" => Some(Kdf::Pbkdf2Sha256),
            "PBKDF2-SHA512" => Some(Kdf::Pbkdf2Sha512),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Kdf::Pbkdf2Sha1 => "PBKDF2-SHA1",
            Kdf::Pbkdf2Sha256 => "PBKDF2-SHA256",
            Kdf::Pbkdf2Sha512 => "PBKDF2-SHA512",
        }
    }

    const fn hash_len(self) -> usize {
        match self {
            Kdf::Pbkdf2Sha1 => 20,
            Kdf::Pbkdf2Sha256 => 32,
            Kdf::Pbkdf2Sha512 => 64,
        }
    }

    fn derive(self, secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
        let res = match self {
            Kdf::Pbkdf2Sha1 => pbkdf2::pbkdf2::<Hmac<Sha1>>(secret, salt, iterations, out),
            Kdf::Pbkdf2Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, iterations, out),
            Kdf::Pbkdf2Sha512 => pbkdf2::pbkdf2::<Hmac<Sha512>>(secret, salt, iterations, out),
        };
        res.map_err(|e| Error::Other(anyhow!("PBKDF2 failed: {e}")))
    }
}

/// The DEK is always wrapped in XTS mode; the variant follows the key size
/// of the DEK's target cipher family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapCipher {
    XtsAes128,
    XtsAes256,
}

impl WrapCipher {
    fn for_cipher_name(name: &str) -> Option<Self> {
        match name {
            "AES-XTS128-PLAIN64" | "AES-GCM128" | "AES-CTR128" => Some(WrapCipher::XtsAes128),
            "AES-XTS256-PLAIN64" | "AES-GCM256" | "AES-CTR256" => Some(WrapCipher::XtsAes256),
            _ => None,
        }
    }

    const fn key_len(self) -> usize {
        match self {
            WrapCipher::XtsAes128 => 32,
            WrapCipher::XtsAes256 => 64,
        }
    }

    /// En-/decrypt `data` in place with the zero tweak.
    fn apply(self, key: &[u8], data: &mut [u8], decrypt: bool) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::invalid_argument("wrapping key has the wrong size"));
        }
        if data.len() < 16 {
            return Err(Error::invalid_argument(
                "XTS needs at least one block of data",
            ));
        }
        let tweak = [0u8; 16];
        match self {
            WrapCipher::XtsAes128 => {
                let c1 = Aes128::new_from_slice(&key[..16])
                    .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
                let c2 = Aes128::new_from_slice(&key[16..])
                    .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
                let xts = Xts128::new(c1, c2);
                if decrypt {
                    xts.decrypt_sector(data, tweak);
                } else {
                    xts.encrypt_sector(data, tweak);
                }
            }
            WrapCipher::XtsAes256 => {
                let c1 = Aes256::new_from_slice(&key[..32])
                    .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
                let c2 = Aes256::new_from_slice(&key[32..])
                    .map_err(|e| Error::Other(anyhow!("XTS key setup: {e}")))?;
                let xts = Xts128::new(c1, c2);
                if decrypt {
                    xts.decrypt_sector(data, tweak);
                } else {
                    xts.encrypt_sector(data, tweak);
                }
            }
        }
        Ok(())
    }
}

/// Decoded key store record. Host representation only; the wire form is
/// produced/consumed by `encode`/`decode` and never mutated in place.
#[derive(Clone)]
struct KeyStoreRecord {
    cipher: String,
    key_deriv: String,
    cb_key: u32,
    dek_digest: [u8; DIGEST_CAP],
    cb_dek_digest: u32,
    dek_digest_salt: [u8; SALT_LEN],
    dek_digest_iterations: u32,
    dek_salt: [u8; SALT_LEN],
    dek_iterations: u32,
    cb_dek_enc: u32,
    dek_enc: [u8; DEK_ENC_CAP],
}

impl KeyStoreRecord {
    fn empty(cipher: String, key_deriv: String) -> Self {
        Self {
            cipher,
            key_deriv,
            cb_key: 0,
            dek_digest: [0; DIGEST_CAP],
            cb_dek_digest: 0,
            dek_digest_salt: [0; SALT_LEN],
            dek_digest_iterations: 0,
            dek_salt: [0; SALT_LEN],
            dek_iterations: 0,
            cb_dek_enc: 0,
            dek_enc: [0; DEK_ENC_CAP],
        }
    }

    fn encode(&self) -> Result<String> {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.extend_from_slice(&KEYSTORE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&KEYSTORE_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&fixed_name(&self.cipher)?);
        buf.extend_from_slice(&fixed_name(&self.key_deriv)?);
        buf.extend_from_slice(&self.cb_key.to_le_bytes());
        buf.extend_from_slice(&self.dek_digest);
        buf.extend_from_slice(&self.cb_dek_digest.to_le_bytes());
        buf.extend_from_slice(&self.dek_digest_salt);
        buf.extend_from_slice(&self.dek_digest_iterations.to_le_bytes());
        buf.extend_from_slice(&self.dek_salt);
        buf.extend_from_slice(&self.dek_iterations.to_le_bytes());
        buf.extend_from_slice(&self.cb_dek_enc.to_le_bytes());
        buf.extend_from_slice(&self.dek_enc);
        debug_assert_eq!(buf.len(), RECORD_LEN);
        Ok(BASE64.encode(&buf))
    }

    fn decode(enc: &str) -> Result<Self> {
        let raw = BASE64
            .decode(enc.trim())
            .map_err(|_| Error::InvalidFormat("key store is not valid base64"))?;
        if raw.len() != RECORD_LEN {
            return Err(Error::InvalidFormat("key store record has the wrong size"));
        }

        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let version = u16::from_le_bytes(raw[4..6].try_into().unwrap());
        if magic != KEYSTORE_MAGIC || version != KEYSTORE_VERSION {
            return Err(Error::InvalidFormat("key store magic/version mismatch"));
        }

        let cipher = parse_name(&raw[8..8 + NAME_CAP])?;
        let key_deriv = parse_name(&raw[40..40 + NAME_CAP])?;

        let mut rec = KeyStoreRecord::empty(cipher, key_deriv);
        rec.cb_key = u32::from_le_bytes(raw[72..76].try_into().unwrap());
        rec.dek_digest.copy_from_slice(&raw[76..108]);
        rec.cb_dek_digest = u32::from_le_bytes(raw[108..112].try_into().unwrap());
        rec.dek_digest_salt.copy_from_slice(&raw[112..144]);
        rec.dek_digest_iterations = u32::from_le_bytes(raw[144..148].try_into().unwrap());
        rec.dek_salt.copy_from_slice(&raw[148..180]);
        rec.dek_iterations = u32::from_le_bytes(raw[180..184].try_into().unwrap());
        rec.cb_dek_enc = u32::from_le_bytes(raw[184..188].try_into().unwrap());
        rec.dek_enc.copy_from_slice(&raw[188..252]);

        // Sanity bounds against corrupt input.
        if rec.cb_key > DEK_LEN_MAX
            || rec.cb_dek_digest as usize > DIGEST_CAP
            || rec.cb_dek_enc as usize > DEK_ENC_CAP
        {
            return Err(Error::corrupt("key store field exceeds its capacity"));
        }

        Ok(rec)
    }
}

fn fixed_name(name: &str) -> Result<[u8; NAME_CAP]> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_CAP {
        return Err(Error::invalid_argument("name does not fit the record"));
    }
    let mut out = [0u8; NAME_CAP];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn parse_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| Error::corrupt("name field is not valid UTF-8"))
}

/// Benchmarks PBKDF2 on this machine: run floor-sized rounds until the time
/// budget is spent and return the accumulated count. Decouples the stored
/// iteration count from any fixed guess about hardware speed.
fn benchmark_iterations(kdf: Kdf, password_len: usize, dek_len: usize) -> Result<u32> {
    let input = vec![0u8; password_len.max(1)];
    let salt = [0u8; SALT_LEN];
    let mut out = vec![0u8; dek_len];

    let start = Instant::now();
    let mut iterations: u32 = 0;
    while start.elapsed() < PBKDF2_BENCH_BUDGET {
        kdf.derive(&input, &salt, MIN_PBKDF2_ITERATIONS, &mut out)?;
        iterations = iterations.saturating_add(MIN_PBKDF2_ITERATIONS);
    }

    Ok(iterations.max(MIN_PBKDF2_ITERATIONS))
}

fn derive_wrap_key(
    password: &SecretString,
    kdf: Kdf,
    wrap: WrapCipher,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(vec![0u8; wrap.key_len()]);
    kdf.derive(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key,
    )?;
    Ok(key)
}

/// Create a new key store wrapping `dek` for `cipher_name` under `password`.
/// Returns the base64-encoded record.
pub fn create(password: &SecretString, dek: &[u8], cipher_name: &str) -> Result<String> {
    if password.expose_secret().is_empty() {
        return Err(Error::invalid_argument("password must not be empty"));
    }
    if cipher_name.is_empty() {
        return Err(Error::invalid_argument("cipher name must not be empty"));
    }
    if dek.is_empty() || dek.len() > DEK_ENC_CAP {
        return Err(Error::invalid_argument("DEK size out of range"));
    }

    let wrap = WrapCipher::for_cipher_name(cipher_name)
        .ok_or_else(|| Error::not_supported(format!("no DEK wrapping cipher for {cipher_name}")))?;
    let kdf = Kdf::Pbkdf2Sha256;

    let mut rec = KeyStoreRecord::empty(cipher_name.to_owned(), kdf.name().to_owned());
    rec.cb_key = dek.len() as u32;
    rand::thread_rng().fill_bytes(&mut rec.dek_salt);

    rec.dek_iterations =
        benchmark_iterations(kdf, password.expose_secret().len(), dek.len())?;
    tracing::debug!(
        iterations = rec.dek_iterations,
        "benchmarked DEK wrapping iteration count"
    );

    // Verification digest over the raw DEK, with its own salt.
    rand::thread_rng().fill_bytes(&mut rec.dek_digest_salt);
    rec.dek_digest_iterations = MIN_PBKDF2_ITERATIONS;
    let digest_len = kdf.hash_len().min(DIGEST_CAP);
    kdf.derive(
        dek,
        &rec.dek_digest_salt,
        rec.dek_digest_iterations,
        &mut rec.dek_digest[..digest_len],
    )?;
    rec.cb_dek_digest = digest_len as u32;

    // Wrap the DEK.
    let wrap_key = derive_wrap_key(password, kdf, wrap, &rec.dek_salt, rec.dek_iterations)?;
    rec.dek_enc[..dek.len()].copy_from_slice(dek);
    wrap.apply(&wrap_key, &mut rec.dek_enc[..dek.len()], false)?;
    rec.cb_dek_enc = dek.len() as u32;

    rec.encode()
}

/// Unlock the key store with `password`, returning the DEK and the cipher
/// name it targets. A digest mismatch is [`Error::AccessDenied`], distinct
/// from every format-level failure.
pub fn unlock(enc: &str, password: &SecretString) -> Result<(Zeroizing<Vec<u8>>, String)> {
    if password.expose_secret().is_empty() {
        return Err(Error::invalid_argument("password must not be empty"));
    }

    let rec = KeyStoreRecord::decode(enc)?;
    let kdf = Kdf::from_name(&rec.key_deriv)
        .ok_or_else(|| Error::not_supported(format!("unknown key derivation {}", rec.key_deriv)))?;
    let wrap = WrapCipher::for_cipher_name(&rec.cipher).ok_or_else(|| {
        Error::not_supported(format!("no DEK wrapping cipher for {}", rec.cipher))
    })?;

    if rec.cb_key != rec.cb_dek_enc
        || rec.cb_dek_enc == 0
        || rec.cb_dek_digest == 0
        || rec.dek_iterations == 0
        || rec.dek_digest_iterations == 0
    {
        return Err(Error::corrupt("inconsistent key store fields"));
    }

    let wrap_key = derive_wrap_key(password, kdf, wrap, &rec.dek_salt, rec.dek_iterations)?;

    let mut dek = Zeroizing::new(rec.dek_enc[..rec.cb_dek_enc as usize].to_vec());
    wrap.apply(&wrap_key, &mut dek, true)?;

    // Recompute the verification digest over the candidate DEK and compare.
    let mut digest = vec![0u8; rec.cb_dek_digest as usize];
    kdf.derive(
        &dek,
        &rec.dek_digest_salt,
        rec.dek_digest_iterations,
        &mut digest,
    )?;
    if digest[..] != rec.dek_digest[..digest.len()] {
        return Err(Error::AccessDenied);
    }

    Ok((dek, rec.cipher))
}

/// Cheap metadata query: the cipher name a key store targets, without
/// deriving anything.
pub fn query_cipher(enc: &str) -> Result<String> {
    Ok(KeyStoreRecord::decode(enc)?.cipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn create_unlock_roundtrip() {
        let dek = [0x5au8; 32];
        let enc = create(&password("correcthorse"), &dek, "AES-GCM256").unwrap();

        let (unlocked, cipher) = unlock(&enc, &password("correcthorse")).unwrap();
        assert_eq!(cipher, "AES-GCM256");
        assert_eq!(&unlocked[..], &dek[..]);
    }

    #[test]
    fn wrong_password_is_access_denied() {
        let dek = [7u8; 32];
        let enc = create(&password("right"), &dek, "AES-CTR256").unwrap();

        match unlock(&enc, &password("wrong")) {
            Err(Error::AccessDenied) => {}
            other => panic!("expected AccessDenied, got {other:?}"),
        }
    }

    #[test]
    fn query_cipher_without_password() {
        let dek = [1u8; 16];
        let enc = create(&password("pw"), &dek, "AES-GCM128").unwrap();
        assert_eq!(query_cipher(&enc).unwrap(), "AES-GCM128");
    }

    #[test]
    fn rejects_bad_magic() {
        let dek = [1u8; 32];
        let enc = create(&password("pw"), &dek, "AES-GCM256").unwrap();

        let mut raw = BASE64.decode(enc).unwrap();
        raw[0] ^= 0xff;
        let tampered = BASE64.encode(&raw);

        assert!(matches!(
            unlock(&tampered, &password("pw")),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_oversized_fields() {
        let dek = [1u8; 32];
        let enc = create(&password("pw"), &dek, "AES-GCM256").unwrap();

        let mut raw = BASE64.decode(enc).unwrap();
        // cbDekEnc lives at offset 184; 0xff makes it exceed the 64-byte slot.
        raw[184] = 0xff;
        let tampered = BASE64.encode(&raw);

        assert!(matches!(
            unlock(&tampered, &password("pw")),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn rejects_truncated_blob() {
        assert!(matches!(
            unlock("AAAA", &password("pw")),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn unknown_wrap_cipher_not_supported() {
        let dek = [1u8; 16];
        assert!(matches!(
            create(&password("pw"), &dek, "XOR"),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn accepts_sha1_and_sha512_kdf_names() {
        // Rewrite the KDF name in a freshly created record and confirm the
        // loader accepts it (digest check then fails as AccessDenied since
        // the digest was computed with SHA-256, which is fine: the name
        // itself parsed).
        let dek = [3u8; 32];
        let enc = create(&password("pw"), &dek, "AES-GCM256").unwrap();
        let mut raw = BASE64.decode(enc).unwrap();

        for name in [&b"PBKDF2-SHA1\0"[..], &b"PBKDF2-SHA512\0"[..]] {
            raw[40..40 + NAME_CAP].fill(0);
            raw[40..40 + name.len()].copy_from_slice(name);
            let enc2 = BASE64.encode(&raw);
            match unlock(&enc2, &password("pw")) {
                Err(Error::AccessDenied) => {}
                other => panic!("expected AccessDenied for {name:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn record_is_exactly_252_bytes() {
        let dek = [9u8; 32];
        let enc = create(&password("pw"), &dek, "AES-CTR256").unwrap();
        assert_eq!(BASE64.decode(enc).unwrap().len(), RECORD_LEN);
    }
}
