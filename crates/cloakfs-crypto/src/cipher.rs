//! Cipher contexts: a DEK paired with an algorithm, plus the key store
//! blob that wraps the DEK for persistence.
//!
//! Wire formats produced by [`CipherContext::encrypt`]:
//! ```text
//! AES-GCM:  IV(12) ‖ TAG(16) ‖ ciphertext          one-shot only
//! AES-CTR:  IV(16) ‖ ciphertext                    streamable
//! XOR:      ciphertext (= plaintext ^ cyclic DEK)  testing only
//! ```
//! CTR streaming: the first `partial` call emits the IV and leaves the
//! keystream live; later `partial` calls append raw ciphertext; the first
//! non-partial call finalizes and drops the stream state.

use std::fmt;

use aes::{Aes128, Aes256};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use anyhow::anyhow;
use cipher::{KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroizing;

use cloakfs_core::{Error, Result};

use crate::algo::{self, AlgoEntry, Mode};
use crate::{keystore, split, CTR_IV_LEN, GCM_IV_LEN, GCM_TAG_LEN};

/// Data encryption key. Wiped on drop, redacted in debug output.
struct Dek(Zeroizing<Vec<u8>>);

impl Dek {
    fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Live CTR keystream spanning multiple partial calls.
enum CtrStream {
    Aes128(Ctr128BE<Aes128>),
    Aes256(Ctr128BE<Aes256>),
}

impl CtrStream {
    fn init(key: &[u8], iv: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(CtrStream::Aes128)
                .map_err(|e| Error::Other(anyhow!("CTR init: {e}"))),
            32 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(CtrStream::Aes256)
                .map_err(|e| Error::Other(anyhow!("CTR init: {e}"))),
            n => Err(Error::invalid_argument(format!(
                "no CTR variant for a {n}-byte key"
            ))),
        }
    }

    fn apply(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let res = match self {
            CtrStream::Aes128(c) => c.apply_keystream_b2b(input, output),
            CtrStream::Aes256(c) => c.apply_keystream_b2b(input, output),
        };
        res.map_err(|e| Error::Other(anyhow!("CTR keystream: {e}")))
    }
}

/// A DEK bound to one algorithm, ready to transform data.
///
/// Contexts created via [`CipherContext::create`] or loaded via
/// [`CipherContext::load`] also carry the key store blob and can persist
/// themselves; [`CipherContext::from_dek`] contexts cannot.
pub struct CipherContext {
    algo: &'static AlgoEntry,
    dek: Dek,
    keystore: Option<String>,
    ctr: Option<CtrStream>,
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("cipher", &self.algo.name)
            .field("dek", &self.dek)
            .finish_non_exhaustive()
    }
}

impl CipherContext {
    /// Create a fresh context: random DEK of the algorithm's key size,
    /// wrapped into a new key store under `password`.
    pub fn create(cipher_name: &str, password: &SecretString) -> Result<Self> {
        let algo = lookup(cipher_name)?;
        let mut dek = Zeroizing::new(vec![0u8; algo.key_len]);
        rand::thread_rng().fill_bytes(&mut dek);

        let blob = keystore::create(password, &dek, cipher_name)?;
        tracing::debug!(cipher = cipher_name, "created cipher context");

        Ok(Self {
            algo,
            dek: Dek::new(dek.to_vec()),
            keystore: Some(blob),
            ctr: None,
        })
    }

    /// Load a context from an existing key store blob.
    pub fn load(keystore_blob: &str, password: &SecretString) -> Result<Self> {
        let (dek, cipher_name) = keystore::unlock(keystore_blob, password)?;
        let algo = lookup(&cipher_name)?;
        if dek.len() != algo.key_len {
            return Err(Error::corrupt(format!(
                "key store holds a {}-byte DEK but {cipher_name} needs {}",
                dek.len(),
                algo.key_len
            )));
        }

        Ok(Self {
            algo,
            dek: Dek::new(dek.to_vec()),
            keystore: Some(keystore_blob.to_owned()),
            ctr: None,
        })
    }

    /// Build a context around an externally supplied DEK. No key store is
    /// attached, so [`CipherContext::save`] will fail.
    pub fn from_dek(cipher_name: &str, dek: &[u8]) -> Result<Self> {
        let algo = lookup(cipher_name)?;
        if dek.len() != algo.key_len {
            return Err(Error::invalid_argument(format!(
                "{cipher_name} needs a {}-byte key, got {}",
                algo.key_len,
                dek.len()
            )));
        }

        Ok(Self {
            algo,
            dek: Dek::new(dek.to_vec()),
            keystore: None,
            ctr: None,
        })
    }

    /// The key store blob this context was created from or loaded with.
    pub fn save(&self) -> Result<String> {
        self.keystore
            .clone()
            .ok_or_else(|| Error::not_supported("context has no key store attached"))
    }

    /// Re-wrap the DEK under a new password. The old password must unlock
    /// the current key store first.
    pub fn password_change(&mut self, old: &SecretString, new: &SecretString) -> Result<()> {
        let blob = self
            .keystore
            .as_deref()
            .ok_or_else(|| Error::not_supported("context has no key store attached"))?;
        let (dek, cipher_name) = keystore::unlock(blob, old)?;

        self.keystore = Some(keystore::create(new, &dek, &cipher_name)?);
        Ok(())
    }

    pub fn cipher_name(&self) -> &'static str {
        self.algo.name
    }

    /// Size on the wire for `plain` bytes of input.
    pub fn encrypted_size(&self, plain: usize) -> usize {
        match self.algo.mode {
            Mode::Xor => plain,
            Mode::Gcm => plain + GCM_IV_LEN + GCM_TAG_LEN,
            Mode::Ctr => plain + CTR_IV_LEN,
        }
    }

    /// Plaintext size recovered from `enc` wire bytes. Saturates at zero
    /// for inputs shorter than the mode's overhead.
    pub fn decrypted_size(&self, enc: usize) -> usize {
        match self.algo.mode {
            Mode::Xor => enc,
            Mode::Gcm => enc.saturating_sub(GCM_IV_LEN + GCM_TAG_LEN),
            Mode::Ctr => enc.saturating_sub(CTR_IV_LEN),
        }
    }

    /// Derive the padding split for a `unit`-byte pad from `data`.
    pub fn padding_split(&self, unit: usize, data: &[u8]) -> Result<usize> {
        split::padding_split(self.dek.as_bytes(), unit, data)
    }

    /// Encrypt `plaintext` into `out`, returning the bytes written.
    ///
    /// `iv` overrides the randomly generated IV (tests only; reusing an IV
    /// under the same key breaks both modes). `partial` enables CTR
    /// streaming and is rejected for GCM. `aad` is authenticated by GCM and
    /// ignored by the other modes.
    pub fn encrypt(
        &mut self,
        partial: bool,
        iv: Option<&[u8]>,
        plaintext: &[u8],
        aad: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<usize> {
        match self.algo.mode {
            Mode::Xor => self.xor_apply(plaintext, out),
            Mode::Gcm => {
                if partial {
                    return Err(Error::invalid_argument(
                        "AES-GCM cannot encrypt partial data",
                    ));
                }
                self.gcm_encrypt(iv, plaintext, aad, out)
            }
            Mode::Ctr => self.ctr_apply(partial, iv, plaintext, out, true),
        }
    }

    /// Decrypt `enc` into `out`, returning the bytes written. Mirrors
    /// [`CipherContext::encrypt`], including CTR streaming.
    pub fn decrypt(
        &mut self,
        partial: bool,
        enc: &[u8],
        aad: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<usize> {
        match self.algo.mode {
            Mode::Xor => self.xor_apply(enc, out),
            Mode::Gcm => {
                if partial {
                    return Err(Error::invalid_argument(
                        "AES-GCM cannot decrypt partial data",
                    ));
                }
                self.gcm_decrypt(enc, aad, out)
            }
            Mode::Ctr => self.ctr_apply(partial, None, enc, out, false),
        }
    }

    fn xor_apply(&self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        if out.len() < input.len() {
            return Err(Error::invalid_argument("output buffer too small"));
        }
        let key = self.dek.as_bytes();
        for (i, b) in input.iter().enumerate() {
            out[i] = b ^ key[i % key.len()];
        }
        Ok(input.len())
    }

    fn gcm_encrypt(
        &self,
        iv: Option<&[u8]>,
        plaintext: &[u8],
        aad: Option<&[u8]>,
        out: &mut [u8],
    ) -> Result<usize> {
        let total = plaintext.len() + GCM_IV_LEN + GCM_TAG_LEN;
        if out.len() < total {
            return Err(Error::invalid_argument("output buffer too small"));
        }

        let mut nonce = [0u8; GCM_IV_LEN];
        match iv {
            Some(iv) => {
                if iv.len() != GCM_IV_LEN {
                    return Err(Error::invalid_argument("AES-GCM IV must be 12 bytes"));
                }
                nonce.copy_from_slice(iv);
            }
            None => rand::thread_rng().fill_bytes(&mut nonce),
        }

        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or(&[]),
        };
        // The aead crate returns ciphertext ‖ tag; the wire order is
        // IV ‖ tag ‖ ciphertext.
        let ct_tag = match self.dek.as_bytes().len() {
            16 => Aes128Gcm::new_from_slice(self.dek.as_bytes())
                .map_err(|e| Error::Other(anyhow!("GCM init: {e}")))?
                .encrypt(Nonce::from_slice(&nonce), payload),
            32 => Aes256Gcm::new_from_slice(self.dek.as_bytes())
                .map_err(|e| Error::Other(anyhow!("GCM init: {e}")))?
                .encrypt(Nonce::from_slice(&nonce), payload),
            n => {
                return Err(Error::invalid_argument(format!(
                    "no GCM variant for a {n}-byte key"
                )))
            }
        }
        .map_err(|_| Error::Authentication("AES-GCM encryption failed".into()))?;

        let ct_len = ct_tag.len() - GCM_TAG_LEN;
        out[..GCM_IV_LEN].copy_from_slice(&nonce);
        out[GCM_IV_LEN..GCM_IV_LEN + GCM_TAG_LEN].copy_from_slice(&ct_tag[ct_len..]);
        out[GCM_IV_LEN + GCM_TAG_LEN..total].copy_from_slice(&ct_tag[..ct_len]);
        Ok(total)
    }

    fn gcm_decrypt(&self, enc: &[u8], aad: Option<&[u8]>, out: &mut [u8]) -> Result<usize> {
        if enc.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(Error::corrupt("AES-GCM data shorter than IV plus tag"));
        }
        let ct_len = enc.len() - GCM_IV_LEN - GCM_TAG_LEN;
        if out.len() < ct_len {
            return Err(Error::invalid_argument("output buffer too small"));
        }

        let nonce = &enc[..GCM_IV_LEN];
        let tag = &enc[GCM_IV_LEN..GCM_IV_LEN + GCM_TAG_LEN];
        let ct = &enc[GCM_IV_LEN + GCM_TAG_LEN..];

        let mut ct_tag = Vec::with_capacity(ct.len() + GCM_TAG_LEN);
        ct_tag.extend_from_slice(ct);
        ct_tag.extend_from_slice(tag);

        let payload = Payload {
            msg: &ct_tag,
            aad: aad.unwrap_or(&[]),
        };
        let plain = match self.dek.as_bytes().len() {
            16 => Aes128Gcm::new_from_slice(self.dek.as_bytes())
                .map_err(|e| Error::Other(anyhow!("GCM init: {e}")))?
                .decrypt(Nonce::from_slice(nonce), payload),
            32 => Aes256Gcm::new_from_slice(self.dek.as_bytes())
                .map_err(|e| Error::Other(anyhow!("GCM init: {e}")))?
                .decrypt(Nonce::from_slice(nonce), payload),
            n => {
                return Err(Error::invalid_argument(format!(
                    "no GCM variant for a {n}-byte key"
                )))
            }
        }
        .map_err(|_| Error::Authentication("AES-GCM tag verification failed".into()))?;

        out[..plain.len()].copy_from_slice(&plain);
        Ok(plain.len())
    }

    fn ctr_apply(
        &mut self,
        partial: bool,
        iv: Option<&[u8]>,
        input: &[u8],
        out: &mut [u8],
        encrypting: bool,
    ) -> Result<usize> {
        if let Some(mut stream) = self.ctr.take() {
            // Continuation of a streamed transform, no IV on the wire.
            if out.len() < input.len() {
                return Err(Error::invalid_argument("output buffer too small"));
            }
            stream.apply(input, &mut out[..input.len()])?;
            if partial {
                self.ctr = Some(stream);
            }
            return Ok(input.len());
        }

        // First (or only) call carries the IV.
        let (mut stream, data, written) = if encrypting {
            if out.len() < input.len() + CTR_IV_LEN {
                return Err(Error::invalid_argument("output buffer too small"));
            }
            let mut nonce = [0u8; CTR_IV_LEN];
            match iv {
                Some(iv) => {
                    if iv.len() != CTR_IV_LEN {
                        return Err(Error::invalid_argument("AES-CTR IV must be 16 bytes"));
                    }
                    nonce.copy_from_slice(iv);
                }
                None => rand::thread_rng().fill_bytes(&mut nonce),
            }
            out[..CTR_IV_LEN].copy_from_slice(&nonce);
            let stream = CtrStream::init(self.dek.as_bytes(), &nonce)?;
            (stream, input, CTR_IV_LEN)
        } else {
            if input.len() < CTR_IV_LEN {
                return Err(Error::corrupt("AES-CTR data shorter than the IV"));
            }
            if out.len() < input.len() - CTR_IV_LEN {
                return Err(Error::invalid_argument("output buffer too small"));
            }
            let stream = CtrStream::init(self.dek.as_bytes(), &input[..CTR_IV_LEN])?;
            (stream, &input[CTR_IV_LEN..], 0)
        };

        stream.apply(data, &mut out[written..written + data.len()])?;
        if partial {
            self.ctr = Some(stream);
        }
        Ok(written + data.len())
    }
}

fn lookup(name: &str) -> Result<&'static AlgoEntry> {
    algo::lookup(name).ok_or_else(|| Error::not_supported(format!("unknown cipher {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx(cipher: &str) -> CipherContext {
        let entry = algo::lookup(cipher).unwrap();
        let dek: Vec<u8> = (0..entry.key_len as u8).collect();
        CipherContext::from_dek(cipher, &dek).unwrap()
    }

    #[test]
    fn gcm_roundtrip_with_aad() {
        let mut c = ctx("AES-GCM256");
        let plain = b"attack at dawn";
        let aad = 7u64.to_le_bytes();

        let mut enc = vec![0u8; c.encrypted_size(plain.len())];
        let n = c.encrypt(false, None, plain, Some(&aad), &mut enc).unwrap();
        assert_eq!(n, plain.len() + GCM_IV_LEN + GCM_TAG_LEN);

        let mut dec = vec![0u8; plain.len()];
        let n = c.decrypt(false, &enc, Some(&aad), &mut dec).unwrap();
        assert_eq!(&dec[..n], plain);
    }

    #[test]
    fn gcm_detects_tampering_and_wrong_aad() {
        let mut c = ctx("AES-GCM128");
        let plain = b"payload";
        let mut enc = vec![0u8; c.encrypted_size(plain.len())];
        c.encrypt(false, None, plain, Some(b"aad"), &mut enc).unwrap();

        let mut dec = vec![0u8; plain.len()];

        // A flip anywhere on the wire must fail: IV, tag, and ciphertext.
        for idx in [0, GCM_IV_LEN, enc.len() - 1] {
            let mut flipped = enc.clone();
            flipped[idx] ^= 1;
            assert!(matches!(
                c.decrypt(false, &flipped, Some(b"aad"), &mut dec),
                Err(Error::Authentication(_))
            ));
        }

        assert!(matches!(
            c.decrypt(false, &enc, Some(b"bad"), &mut dec),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn gcm_rejects_partial() {
        let mut c = ctx("AES-GCM256");
        let mut out = vec![0u8; 64];
        assert!(matches!(
            c.encrypt(true, None, b"data", None, &mut out),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn ctr_one_shot_roundtrip() {
        let mut c = ctx("AES-CTR256");
        let plain = b"counter mode payload";

        let mut enc = vec![0u8; c.encrypted_size(plain.len())];
        let n = c.encrypt(false, None, plain, None, &mut enc).unwrap();
        assert_eq!(n, plain.len() + CTR_IV_LEN);

        let mut dec = vec![0u8; plain.len()];
        let n = c.decrypt(false, &enc, None, &mut dec).unwrap();
        assert_eq!(&dec[..n], plain);
    }

    #[test]
    fn ctr_streaming_matches_one_shot() {
        let dek: Vec<u8> = (0..32).collect();
        let iv = [0xabu8; CTR_IV_LEN];
        let plain: Vec<u8> = (0..200u8).map(|i| i.wrapping_mul(3)).collect();

        let mut whole = CipherContext::from_dek("AES-CTR256", &dek).unwrap();
        let mut enc_whole = vec![0u8; whole.encrypted_size(plain.len())];
        whole
            .encrypt(false, Some(&iv), &plain, None, &mut enc_whole)
            .unwrap();

        let mut streamed = CipherContext::from_dek("AES-CTR256", &dek).unwrap();
        let mut enc_stream = vec![0u8; CTR_IV_LEN + plain.len()];
        let n1 = streamed
            .encrypt(true, Some(&iv), &plain[..77], None, &mut enc_stream)
            .unwrap();
        assert_eq!(n1, CTR_IV_LEN + 77);
        let n2 = streamed
            .encrypt(true, None, &plain[77..150], None, &mut enc_stream[n1..])
            .unwrap();
        let n3 = streamed
            .encrypt(false, None, &plain[150..], None, &mut enc_stream[n1 + n2..])
            .unwrap();
        assert_eq!(n1 + n2 + n3, enc_whole.len());
        assert_eq!(enc_stream, enc_whole);
    }

    #[test]
    fn ctr_streaming_decrypt() {
        let mut c = ctx("AES-CTR128");
        let plain: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let mut enc = vec![0u8; c.encrypted_size(plain.len())];
        c.encrypt(false, None, &plain, None, &mut enc).unwrap();

        let mut dec = vec![0u8; plain.len()];
        let n1 = c.decrypt(true, &enc[..CTR_IV_LEN + 40], None, &mut dec).unwrap();
        assert_eq!(n1, 40);
        let n2 = c
            .decrypt(false, &enc[CTR_IV_LEN + 40..], None, &mut dec[n1..])
            .unwrap();
        assert_eq!(n1 + n2, plain.len());
        assert_eq!(dec, plain);
    }

    #[test]
    fn xor_roundtrip_equal_lengths() {
        let mut c = ctx("XOR");
        let plain = b"xor is not crypto";
        assert_eq!(c.encrypted_size(plain.len()), plain.len());

        let mut enc = vec![0u8; plain.len()];
        c.encrypt(false, None, plain, None, &mut enc).unwrap();
        assert_ne!(&enc[..], &plain[..]);

        let mut dec = vec![0u8; plain.len()];
        c.decrypt(false, &enc, None, &mut dec).unwrap();
        assert_eq!(&dec[..], &plain[..]);
    }

    #[test]
    fn size_accounting() {
        let gcm = ctx("AES-GCM256");
        assert_eq!(gcm.encrypted_size(1000), 1028);
        assert_eq!(gcm.decrypted_size(1028), 1000);
        assert_eq!(gcm.decrypted_size(10), 0);

        let ctr = ctx("AES-CTR256");
        assert_eq!(ctr.encrypted_size(1000), 1016);
        assert_eq!(ctr.decrypted_size(1016), 1000);
        assert_eq!(ctr.decrypted_size(3), 0);
    }

    #[test]
    fn from_dek_validates_key_length() {
        assert!(matches!(
            CipherContext::from_dek("AES-GCM256", &[0u8; 16]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            CipherContext::from_dek("AES-NOPE", &[0u8; 32]),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn from_dek_cannot_save() {
        let c = ctx("AES-GCM256");
        assert!(matches!(c.save(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn create_load_and_password_change() {
        let pw = SecretString::from("correcthorse");
        let mut c = CipherContext::create("AES-GCM256", &pw).unwrap();
        assert_eq!(c.cipher_name(), "AES-GCM256");

        let blob = c.save().unwrap();
        let mut loaded = CipherContext::load(&blob, &pw).unwrap();

        // Same DEK on both sides: one encrypts, the other decrypts.
        let plain = b"shared secret state";
        let mut enc = vec![0u8; c.encrypted_size(plain.len())];
        c.encrypt(false, None, plain, None, &mut enc).unwrap();
        let mut dec = vec![0u8; plain.len()];
        loaded.decrypt(false, &enc, None, &mut dec).unwrap();
        assert_eq!(&dec[..], plain);

        let new_pw = SecretString::from("battery staple");
        c.password_change(&pw, &new_pw).unwrap();
        let blob2 = c.save().unwrap();
        assert!(CipherContext::load(&blob2, &pw).is_err());
        let mut reloaded = CipherContext::load(&blob2, &new_pw).unwrap();
        reloaded.decrypt(false, &enc, None, &mut dec).unwrap();
        assert_eq!(&dec[..], plain);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn gcm_roundtrips_arbitrary_payloads(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut c = ctx("AES-GCM256");
            let mut enc = vec![0u8; c.encrypted_size(data.len())];
            let n = c.encrypt(false, None, &data, None, &mut enc).unwrap();
            prop_assert_eq!(n, enc.len());

            let mut dec = vec![0u8; data.len()];
            let n = c.decrypt(false, &enc, None, &mut dec).unwrap();
            prop_assert_eq!(&dec[..n], &data[..]);
        }

        #[test]
        fn ctr_roundtrips_arbitrary_payloads(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut c = ctx("AES-CTR128");
            let mut enc = vec![0u8; c.encrypted_size(data.len())];
            c.encrypt(false, None, &data, None, &mut enc).unwrap();

            let mut dec = vec![0u8; data.len()];
            let n = c.decrypt(false, &enc, None, &mut dec).unwrap();
            prop_assert_eq!(&dec[..n], &data[..]);
        }
    }
}
