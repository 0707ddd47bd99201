//! cloakfs-crypto: password-protected key stores and the cipher contexts
//! built on top of them.
//!
//! Key material flow:
//! ```text
//! password ── PBKDF2 (benchmarked iterations, per-store salt) ──> wrapping key
//! wrapping key ── AES-XTS (zero tweak, single use) ──> encrypted DEK
//! DEK ── PBKDF2 (independent salt) ──> verification digest
//! ```
//! The key store record carries everything needed to re-derive and verify
//! the DEK; it is the only persisted artifact and travels as a base64
//! string. A [`CipherContext`] pairs the unwrapped DEK with one of the
//! supported algorithms and does the actual chunk encryption for the
//! container layer.

pub mod algo;
pub mod cipher;
pub mod keystore;
mod split;

pub use algo::{Algorithm, Mode};
pub use cipher::CipherContext;

/// AES-GCM nonce length on the wire.
pub const GCM_IV_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const GCM_TAG_LEN: usize = 16;

/// AES-CTR IV length on the wire.
pub const CTR_IV_LEN: usize = 16;
