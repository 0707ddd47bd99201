//! cloakfs-container: an authenticated, chunked, random-access encrypted
//! byte stream on top of any [`cloakfs_core::Storage`] backend.
//!
//! A container pairs a [`cloakfs_crypto::CipherContext`] with a storage
//! object. Data is split into fixed-size chunks, each encrypted
//! independently with its index bound in as associated data, bracketed by
//! key-dependent random padding so the chunk grid is not visible from the
//! outside. See [`container`] for the exact layout.

mod container;
mod header;

pub use container::{CreateOptions, EncryptedContainer};
