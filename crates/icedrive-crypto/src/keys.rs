//! Crypto-key handling and derivation.
//!
//! The crypto namespace uses a single 256-bit Twofish key derived from the
//! account's crypto password and a server-provided salt. The rest of the
//! client passes the key around in its 64-char lowercase hex form.

use hmac::Hmac;
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result};

/// Size of the Twofish key for the crypto namespace (256 bits).
pub const KEY_SIZE: usize = 32;

/// PBKDF2 iteration count used by the service's own clients.
pub const PBKDF2_ITERATIONS: u32 = 50_000;

/// A 32-byte Twofish key for the crypto namespace.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey {
    key: [u8; KEY_SIZE],
}

impl CryptoKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::BadKey(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Parse a key from its 64-char hex form.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes =
            hex::decode(key_hex).map_err(|e| CryptoError::BadKey(format!("not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CryptoKey(..)")
    }
}

/// Derive the crypto key from the account's crypto password and the salt
/// extracted from `/crypto-auth`. Returns the 64-char hex form.
pub fn derive_crypto_key(password: &str, salt: &str) -> Result<String> {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha1>>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    )
    .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    Ok(hex::encode(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let k1 = derive_crypto_key("hunter2", "salt-abc").unwrap();
        let k2 = derive_crypto_key("hunter2", "salt-abc").unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(CryptoKey::from_hex(&k1).is_ok());
    }

    #[test]
    fn test_derive_differs_by_salt_and_password() {
        let base = derive_crypto_key("hunter2", "salt-abc").unwrap();
        assert_ne!(base, derive_crypto_key("hunter2", "salt-xyz").unwrap());
        assert_ne!(base, derive_crypto_key("hunter3", "salt-abc").unwrap());
    }

    #[test]
    fn test_from_hex_rejects_bad_keys() {
        assert!(CryptoKey::from_hex("zz").is_err());
        assert!(CryptoKey::from_hex(&"00".repeat(16)).is_err());
        assert!(CryptoKey::from_hex(&"00".repeat(32)).is_ok());
    }

    #[test]
    fn test_hex_roundtrip() {
        let hex = "0d9af1bf0e54ed4c7469741ad2796a7e557f3e973f00ba316b7f63327701a5d3";
        let key = CryptoKey::from_hex(hex).unwrap();
        assert_eq!(key.to_hex(), hex);
    }
}
