//! Filename codec for the crypto namespace.
//!
//! Filenames double as server-side lookup keys, so the cipher must be
//! deterministic: percent-escape the name, zero-pad to a block multiple,
//! Twofish-CBC under the fixed IV, lowercase hex out.

use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use twofish::Twofish;

use crate::{CryptoError, CryptoKey, Result, BLOCK_SIZE, FIXED_IV};

type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

/// Escape set matching JavaScript's `encodeURIComponent`: everything but
/// ALPHA / DIGIT / `- _ . ! ~ * ' ( )` is percent-encoded, spaces as `%20`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encryptor(key: &CryptoKey) -> Result<TwofishCbcEnc> {
    TwofishCbcEnc::new_from_slices(key.as_bytes(), &FIXED_IV)
        .map_err(|e| CryptoError::BadKey(e.to_string()))
}

fn decryptor(key: &CryptoKey) -> Result<TwofishCbcDec> {
    TwofishCbcDec::new_from_slices(key.as_bytes(), &FIXED_IV)
        .map_err(|e| CryptoError::BadKey(e.to_string()))
}

/// Encrypt a plaintext filename into the hex form stored by the service.
pub fn encrypt_filename(key_hex: &str, filename: &str) -> Result<String> {
    let key = CryptoKey::from_hex(key_hex)?;

    let mut plain = utf8_percent_encode(filename, COMPONENT).to_string().into_bytes();
    // zero-pad to a non-empty block multiple; an already aligned name gets
    // no extra pad block
    let pad = (BLOCK_SIZE - plain.len() % BLOCK_SIZE) % BLOCK_SIZE;
    plain.resize(plain.len() + pad, 0);
    if plain.is_empty() {
        plain.resize(BLOCK_SIZE, 0);
    }

    let mut enc = encryptor(&key)?;
    for block in plain.chunks_exact_mut(BLOCK_SIZE) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(hex::encode(plain))
}

/// Decrypt a hex-encoded filename back to its plaintext form.
///
/// Undecodable percent-escapes are tolerated: the raw trimmed string is
/// returned so callers can still display something.
pub fn decrypt_filename(key_hex: &str, cipher_hex: &str) -> Result<String> {
    let key = CryptoKey::from_hex(key_hex)?;

    let mut ct = hex::decode(cipher_hex)
        .map_err(|e| CryptoError::BadCiphertext(format!("not hex: {e}")))?;
    if ct.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::BadCiphertext(format!(
            "length {} is not a multiple of the block size",
            ct.len()
        )));
    }

    let mut dec = decryptor(&key)?;
    for block in ct.chunks_exact_mut(BLOCK_SIZE) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    // strip trailing zero padding
    let end = ct.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let raw = String::from_utf8_lossy(&ct[..end]).into_owned();

    match percent_decode_str(&raw).decode_utf8() {
        Ok(decoded) => Ok(decoded.into_owned()),
        Err(_) => Ok(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0d9af1bf0e54ed4c7469741ad2796a7e557f3e973f00ba316b7f63327701a5d3";

    #[test]
    fn test_roundtrip_simple_name() {
        // "hello.txt" escapes to 9 bytes, one cipher block
        let ct = encrypt_filename(KEY, "hello.txt").unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(decrypt_filename(KEY, &ct).unwrap(), "hello.txt");
    }

    #[test]
    fn test_deterministic() {
        let a = encrypt_filename(KEY, "report.pdf").unwrap();
        let b = encrypt_filename(KEY, "report.pdf").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_space_escapes_as_percent_20() {
        let ct = encrypt_filename(KEY, "my file.txt").unwrap();
        let plus_variant = encrypt_filename(KEY, "my+file.txt").unwrap();
        assert_ne!(ct, plus_variant);
        assert_eq!(decrypt_filename(KEY, &ct).unwrap(), "my file.txt");
        assert_eq!(decrypt_filename(KEY, &plus_variant).unwrap(), "my+file.txt");
    }

    #[test]
    fn test_aligned_name_gets_no_extra_block() {
        // 16 unreserved chars escape to exactly one block
        let ct = encrypt_filename(KEY, "abcdefgh12345678").unwrap();
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn test_ciphertext_length_formula() {
        let long = "x".repeat(33);
        for (name, blocks) in [("a", 1), ("0123456789abcdefg", 2), (long.as_str(), 3)] {
            let ct = encrypt_filename(KEY, name).unwrap();
            assert_eq!(ct.len(), blocks * BLOCK_SIZE * 2, "name {name:?}");
        }
    }

    #[test]
    fn test_unicode_roundtrip() {
        let name = "ünïcødé 文件.bin";
        let ct = encrypt_filename(KEY, name).unwrap();
        assert_eq!(decrypt_filename(KEY, &ct).unwrap(), name);
    }

    #[test]
    fn test_long_name_roundtrip() {
        let name = "d".repeat(255);
        let ct = encrypt_filename(KEY, &name).unwrap();
        assert_eq!(decrypt_filename(KEY, &ct).unwrap(), name);
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(matches!(
            encrypt_filename("00ff", "x"),
            Err(CryptoError::BadKey(_))
        ));
        assert!(matches!(
            decrypt_filename("00ff", "00"),
            Err(CryptoError::BadKey(_))
        ));
    }

    #[test]
    fn test_bad_ciphertext_rejected() {
        assert!(matches!(
            decrypt_filename(KEY, "zz"),
            Err(CryptoError::BadCiphertext(_))
        ));
        // 8 bytes: not a block multiple
        assert!(matches!(
            decrypt_filename(KEY, &"00".repeat(8)),
            Err(CryptoError::BadCiphertext(_))
        ));
    }

    #[test]
    fn test_empty_ciphertext_decrypts_to_empty_name() {
        // zero bytes is a valid block multiple
        assert_eq!(decrypt_filename(KEY, "").unwrap(), "");
    }
}
