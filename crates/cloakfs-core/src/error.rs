use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by all cloakfs crates.
///
/// The split between [`Error::AccessDenied`] and the format-level variants
/// matters to callers: a wrong password should lead to a re-prompt, while
/// `InvalidFormat`/`Corrupt` mean the stored data itself is unusable.
#[derive(Debug, Error)]
pub enum Error {
    /// Magic, version, or overall length of a stored record did not match.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    /// A field inside an otherwise well-formed record is out of bounds or
    /// inconsistent with the rest of the data.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The password did not unlock the key store (DEK digest mismatch).
    #[error("access denied: wrong password")]
    AccessDenied,

    /// Authenticated decryption failed: tampered ciphertext, a misplaced
    /// chunk, or key material that does not belong to this data.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Contract violation caught before any state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// More data was requested than the stream holds.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// Propagated verbatim from the underlying storage; no retries here.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }
}
