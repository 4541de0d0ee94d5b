//! Error types for the icedrive-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key is not valid hex or has the wrong length
    #[error("invalid key: {0}")]
    BadKey(String),

    /// Ciphertext is malformed (bad hex, truncated, not block-aligned, …)
    #[error("invalid ciphertext: {0}")]
    BadCiphertext(String),

    /// Encrypted stream ended before its 32-byte framing header
    #[error("encrypted stream shorter than its 32-byte header")]
    ShortHeader,

    /// Framing header carries a version this implementation does not know
    #[error("unsupported encrypted file version: {0}")]
    UnsupportedVersion(u8),

    /// Stream source produced a different number of bytes than declared
    #[error("stream length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    /// Proof-of-work counter wrapped without finding a solution
    #[error("proof-of-work counter exhausted without a solution")]
    PowCounterExhausted,

    /// Proof-of-work challenge could not be decoded
    #[error("invalid proof-of-work challenge: {0}")]
    BadChallenge(String),

    /// Proof-of-work difficulty outside 1..=256
    #[error("proof-of-work difficulty out of range: {0}")]
    BadDifficulty(u32),

    /// IO error from the underlying reader or writer
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
