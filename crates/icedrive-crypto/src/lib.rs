//! # Icedrive Crypto
//!
//! Cryptographic primitives for the Icedrive "crypto" namespace and login
//! flows:
//!
//! - **Filename codec**: deterministic Twofish-CBC under a fixed IV, so the
//!   same name always maps to the same server-side lookup key
//! - **Stream codec**: framed Twofish-CBC for file bodies, with the content
//!   IV and padding count carried in an encrypted 32-byte header
//! - **Key derivation**: PBKDF2-HMAC-SHA1 from the account's crypto password
//! - **Proof of work**: both solver variants the login endpoints accept
//!
//! Everything here is synchronous and I/O-agnostic; the client crate bridges
//! the stream codec onto its async transport.

pub mod error;
pub mod filename;
pub mod hashing;
pub mod keys;
pub mod pow;
pub mod stream;

pub use error::{CryptoError, Result};
pub use keys::CryptoKey;

/// Twofish block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Fixed IV used for filenames and the stream framing header. Filenames
/// double as server-side lookup keys, so identical plaintexts must produce
/// identical ciphertexts.
pub const FIXED_IV: [u8; BLOCK_SIZE] = *b"1234567887654321";
