//! SHA-256 and HMAC helpers shared by the proof-of-work flows.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{CryptoError, Result};

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hex-encoded SHA-256 digest of a string.
pub fn sha256_hex(s: &str) -> String {
    hex::encode(sha256(s.as_bytes()))
}

/// HMAC-SHA256 over `message` keyed with a hex-encoded key, hex output.
pub fn hmac_sha256_hex(message: &str, key_hex: &str) -> Result<String> {
    let key = hex::decode(key_hex).map_err(|e| CryptoError::BadKey(format!("not hex: {e}")))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_hex_known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let key_hex = hex::encode(b"Jefe");
        let mac = hmac_sha256_hex("what do ya want for nothing?", &key_hex).unwrap();
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_rejects_bad_key() {
        assert!(hmac_sha256_hex("msg", "not-hex").is_err());
    }
}
