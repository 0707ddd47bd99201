//! cloakfs-core: shared error taxonomy and the storage seam.
//!
//! The container engine never talks to files directly; it consumes the
//! [`Storage`] capability so it can wrap plain files, in-memory buffers, or
//! forward-only streams alike.

pub mod error;
pub mod storage;

pub use error::{Error, Result};
pub use storage::{MemStorage, SeekStorage, Storage, StreamStorage};
