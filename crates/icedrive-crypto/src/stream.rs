//! Framed Twofish-CBC codec for encrypted file bodies.
//!
//! Wire format:
//!
//! ```text
//! cipher = CBC_fixedIV(header) || CBC_contentIV(body || 0x00 * num_padding)
//! header = content_iv(16) || num_padding(1) || version=0(1) || zeros(14)
//! ```
//!
//! The body CBC chain is re-seeded from the content IV at every 4 MiB
//! ciphertext boundary; the framing header counts toward the first window.
//!
//! Both directions are synchronous and block only on the supplied reader and
//! writer, so a transfer can run the codec on a dedicated blocking thread
//! with pipes on either side.

use std::io::{Read, Write};

use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use twofish::Twofish;

use crate::keys::KEY_SIZE;
use crate::{CryptoError, CryptoKey, Result, BLOCK_SIZE, FIXED_IV};

/// Size of the encrypted framing header (two cipher blocks).
pub const HEADER_SIZE: usize = 2 * BLOCK_SIZE;

/// Ciphertext window after which the CBC chain restarts from the content IV.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const READ_BUF_SIZE: usize = 128 * 1024;

type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

/// Decrypted contents of the 32-byte framing header.
#[derive(Debug, Clone, Copy)]
pub struct StreamHeader {
    /// Random IV the body CBC chain starts from.
    pub content_iv: [u8; BLOCK_SIZE],
    /// Number of trailing zero bytes appended to the plaintext (0..=15).
    pub num_padding: u8,
}

impl StreamHeader {
    /// Plaintext size of a stream given its total ciphertext size.
    pub fn plain_size(&self, total_cipher_size: u64) -> Result<u64> {
        (total_cipher_size)
            .checked_sub(HEADER_SIZE as u64 + u64::from(self.num_padding))
            .ok_or_else(|| {
                CryptoError::BadCiphertext(format!(
                    "cipher size {total_cipher_size} smaller than header and padding"
                ))
            })
    }
}

/// Decrypt the 32-byte framing header.
pub fn open_header(key: &CryptoKey, header_cipher: &[u8; HEADER_SIZE]) -> Result<StreamHeader> {
    let mut plain = *header_cipher;
    let mut dec = TwofishCbcDec::new_from_slices(key.as_bytes(), &FIXED_IV)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    for block in plain.chunks_exact_mut(BLOCK_SIZE) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    let version = plain[BLOCK_SIZE + 1];
    if version != 0 {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    let num_padding = plain[BLOCK_SIZE];
    if usize::from(num_padding) >= BLOCK_SIZE {
        return Err(CryptoError::BadCiphertext(format!(
            "padding count {num_padding} exceeds a block"
        )));
    }
    let mut content_iv = [0u8; BLOCK_SIZE];
    content_iv.copy_from_slice(&plain[..BLOCK_SIZE]);
    Ok(StreamHeader {
        content_iv,
        num_padding,
    })
}

fn seal_header(key: &CryptoKey, content_iv: &[u8; BLOCK_SIZE], num_padding: u8) -> Result<[u8; HEADER_SIZE]> {
    let mut header = [0u8; HEADER_SIZE];
    header[..BLOCK_SIZE].copy_from_slice(content_iv);
    header[BLOCK_SIZE] = num_padding;
    // bytes 17..32 stay zero: version 0 plus reserved
    let mut enc = TwofishCbcEnc::new_from_slices(key.as_bytes(), &FIXED_IV)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    for block in header.chunks_exact_mut(BLOCK_SIZE) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(header)
}

/// CBC transform that restarts its chain from the content IV at every 4 MiB
/// ciphertext boundary. The restart is deferred until more data actually
/// arrives, so a stream ending exactly on a boundary never re-seeds.
struct ChunkedCbc<M> {
    key: [u8; KEY_SIZE],
    iv: [u8; BLOCK_SIZE],
    mode: M,
    window_remaining: usize,
    needs_reseed: bool,
}

impl<M: KeyIvInit> ChunkedCbc<M> {
    fn new(key: &CryptoKey, iv: [u8; BLOCK_SIZE]) -> Result<Self> {
        let mode = M::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        Ok(Self {
            key: *key.as_bytes(),
            iv,
            mode,
            window_remaining: CHUNK_SIZE - HEADER_SIZE,
            needs_reseed: false,
        })
    }

    fn apply<F>(&mut self, mut data: &mut [u8], mut transform: F) -> Result<()>
    where
        F: FnMut(&mut M, &mut [u8]),
    {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        while !data.is_empty() {
            if self.needs_reseed {
                self.mode = M::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| CryptoError::BadKey(e.to_string()))?;
                self.window_remaining = CHUNK_SIZE;
                self.needs_reseed = false;
            }
            let take = data.len().min(self.window_remaining);
            let (head, rest) = data.split_at_mut(take);
            transform(&mut self.mode, head);
            self.window_remaining -= take;
            if self.window_remaining == 0 {
                self.needs_reseed = true;
            }
            data = rest;
        }
        Ok(())
    }
}

impl ChunkedCbc<TwofishCbcEnc> {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.apply(data, |mode, bytes| {
            for block in bytes.chunks_exact_mut(BLOCK_SIZE) {
                mode.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        })
    }
}

impl ChunkedCbc<TwofishCbcDec> {
    fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.apply(data, |mode, bytes| {
            for block in bytes.chunks_exact_mut(BLOCK_SIZE) {
                mode.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        })
    }
}

/// Encrypt `plaintext_size` bytes from `src` into the framed wire format on
/// `dst`. The source must yield exactly the declared number of bytes; the
/// padding count in the header is fixed before the first body byte is read.
pub fn encrypt_stream<R: Read, W: Write>(
    dst: &mut W,
    src: &mut R,
    key_hex: &str,
    plaintext_size: u64,
) -> Result<()> {
    let mut content_iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut content_iv);
    encrypt_stream_with_iv(dst, src, key_hex, plaintext_size, content_iv)
}

fn encrypt_stream_with_iv<R: Read, W: Write>(
    dst: &mut W,
    src: &mut R,
    key_hex: &str,
    plaintext_size: u64,
    content_iv: [u8; BLOCK_SIZE],
) -> Result<()> {
    let key = CryptoKey::from_hex(key_hex)?;
    let block = BLOCK_SIZE as u64;
    let num_padding = ((block - plaintext_size % block) % block) as u8;

    let header = seal_header(&key, &content_iv, num_padding)?;
    dst.write_all(&header)?;

    let mut cbc = ChunkedCbc::<TwofishCbcEnc>::new(&key, content_iv)?;
    let mut carry: Vec<u8> = Vec::with_capacity(BLOCK_SIZE);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            if total != plaintext_size {
                return Err(CryptoError::LengthMismatch {
                    declared: plaintext_size,
                    actual: total,
                });
            }
            carry.extend(std::iter::repeat(0u8).take(usize::from(num_padding)));
            if !carry.is_empty() {
                cbc.encrypt(&mut carry)?;
                dst.write_all(&carry)?;
            }
            return Ok(());
        }
        total += n as u64;
        if total > plaintext_size {
            return Err(CryptoError::LengthMismatch {
                declared: plaintext_size,
                actual: total,
            });
        }
        carry.extend_from_slice(&buf[..n]);
        let aligned = carry.len() / BLOCK_SIZE * BLOCK_SIZE;
        if aligned > 0 {
            cbc.encrypt(&mut carry[..aligned])?;
            dst.write_all(&carry[..aligned])?;
            carry.drain(..aligned);
        }
    }
}

/// Decrypt a framed stream from `src`, writing the plaintext to `dst` and
/// stripping the trailing padding at end of stream.
pub fn decrypt_stream<R: Read, W: Write>(dst: &mut W, src: &mut R, key_hex: &str) -> Result<()> {
    let key = CryptoKey::from_hex(key_hex)?;

    let mut header_cipher = [0u8; HEADER_SIZE];
    src.read_exact(&mut header_cipher).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptoError::ShortHeader
        } else {
            CryptoError::Io(e)
        }
    })?;
    let header = open_header(&key, &header_cipher)?;

    let mut cbc = ChunkedCbc::<TwofishCbcDec>::new(&key, header.content_iv)?;
    let mut carry: Vec<u8> = Vec::new();
    // last decrypted block is held back until EOF so the padding can be
    // stripped from it
    let mut holdback: Vec<u8> = Vec::with_capacity(BLOCK_SIZE);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            if !carry.is_empty() {
                return Err(CryptoError::BadCiphertext(format!(
                    "truncated stream: {} trailing bytes are not a full block",
                    carry.len()
                )));
            }
            if holdback.is_empty() {
                if header.num_padding != 0 {
                    return Err(CryptoError::BadCiphertext(
                        "empty body with nonzero padding count".into(),
                    ));
                }
                return Ok(());
            }
            let keep = holdback.len() - usize::from(header.num_padding);
            dst.write_all(&holdback[..keep])?;
            return Ok(());
        }
        carry.extend_from_slice(&buf[..n]);
        let aligned = carry.len() / BLOCK_SIZE * BLOCK_SIZE;
        if aligned == 0 {
            continue;
        }
        cbc.decrypt(&mut carry[..aligned])?;
        if !holdback.is_empty() {
            dst.write_all(&holdback)?;
            holdback.clear();
        }
        dst.write_all(&carry[..aligned - BLOCK_SIZE])?;
        holdback.extend_from_slice(&carry[aligned - BLOCK_SIZE..aligned]);
        carry.drain(..aligned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    fn encrypt_to_vec(plain: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(&mut out, &mut Cursor::new(plain), KEY, plain.len() as u64).unwrap();
        out
    }

    fn decrypt_to_vec(cipher: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(&mut out, &mut Cursor::new(cipher), KEY)?;
        Ok(out)
    }

    #[test]
    fn test_one_mebibyte_roundtrip() {
        let plain: Vec<u8> = (0..1024 * 1024).map(|i| (i % 256) as u8).collect();
        let cipher = encrypt_to_vec(&plain);
        // header + padded body; 1 MiB is block-aligned so num_padding == 0
        assert_eq!(cipher.len(), 1_048_608);
        assert_eq!(decrypt_to_vec(&cipher).unwrap(), plain);
    }

    #[test]
    fn test_roundtrip_assorted_sizes() {
        for size in [0usize, 1, 15, 16, 17, 31, 255, 4096, 100_000] {
            let plain: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
            let cipher = encrypt_to_vec(&plain);
            assert_eq!(
                cipher.len(),
                HEADER_SIZE + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE,
                "size {size}"
            );
            assert_eq!(decrypt_to_vec(&cipher).unwrap(), plain, "size {size}");
        }
    }

    #[test]
    fn test_roundtrip_across_reseed_boundary() {
        // crosses the 4 MiB ciphertext window where the chain restarts
        let size = CHUNK_SIZE + 100;
        let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let cipher = encrypt_to_vec(&plain);
        assert_eq!(decrypt_to_vec(&cipher).unwrap(), plain);
    }

    #[test]
    fn test_roundtrip_exactly_on_reseed_boundary() {
        // ciphertext (header included) ends exactly at the window edge, so
        // the deferred re-seed must never happen
        let size = CHUNK_SIZE - HEADER_SIZE;
        let plain = vec![0xa5u8; size];
        let cipher = encrypt_to_vec(&plain);
        assert_eq!(cipher.len(), CHUNK_SIZE);
        assert_eq!(decrypt_to_vec(&cipher).unwrap(), plain);
    }

    #[test]
    fn test_header_reports_padding_and_plain_size() {
        // 2041 % 16 == 9, so 7 bytes of padding and 2080 cipher bytes
        let plain = vec![1u8; 2041];
        let cipher = encrypt_to_vec(&plain);
        assert_eq!(cipher.len(), 2080);

        let key = CryptoKey::from_hex(KEY).unwrap();
        let mut head = [0u8; HEADER_SIZE];
        head.copy_from_slice(&cipher[..HEADER_SIZE]);
        let header = open_header(&key, &head).unwrap();
        assert_eq!(header.num_padding, 7);
        assert_eq!(header.plain_size(2080).unwrap(), 2041);
    }

    #[test]
    fn test_short_header_rejected() {
        let mut out = Vec::new();
        let err = decrypt_stream(&mut out, &mut Cursor::new(&[0u8; 31]), KEY).unwrap_err();
        assert!(matches!(err, CryptoError::ShortHeader));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let key = CryptoKey::from_hex(KEY).unwrap();
        let mut header = [0u8; HEADER_SIZE];
        header[BLOCK_SIZE + 1] = 3;
        let mut enc = TwofishCbcEnc::new_from_slices(key.as_bytes(), &FIXED_IV).unwrap();
        for block in header.chunks_exact_mut(BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        let mut out = Vec::new();
        let err = decrypt_stream(&mut out, &mut Cursor::new(&header[..]), KEY).unwrap_err();
        assert!(matches!(err, CryptoError::UnsupportedVersion(3)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let plain = vec![9u8; 64];
        let mut cipher = encrypt_to_vec(&plain);
        cipher.truncate(cipher.len() - 5);
        assert!(matches!(
            decrypt_to_vec(&cipher),
            Err(CryptoError::BadCiphertext(_))
        ));
    }

    #[test]
    fn test_empty_body_with_padding_rejected() {
        // header alone claiming padding, but no body blocks follow
        let key = CryptoKey::from_hex(KEY).unwrap();
        let header = seal_header(&key, &[0u8; BLOCK_SIZE], 3).unwrap();
        assert!(matches!(
            decrypt_to_vec(&header),
            Err(CryptoError::BadCiphertext(_))
        ));
    }

    #[test]
    fn test_declared_size_mismatch_rejected() {
        let plain = vec![2u8; 100];
        let mut out = Vec::new();
        let err =
            encrypt_stream(&mut out, &mut Cursor::new(&plain), KEY, 200).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::LengthMismatch {
                declared: 200,
                actual: 100
            }
        ));

        let mut out = Vec::new();
        let err = encrypt_stream(&mut out, &mut Cursor::new(&plain), KEY, 40).unwrap_err();
        assert!(matches!(err, CryptoError::LengthMismatch { declared: 40, .. }));
    }

    #[test]
    fn test_distinct_streams_use_distinct_ivs() {
        let plain = vec![0u8; 32];
        let a = encrypt_to_vec(&plain);
        let b = encrypt_to_vec(&plain);
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_iv_recoverable_from_header() {
        let key = CryptoKey::from_hex(KEY).unwrap();
        let iv = [0x42u8; BLOCK_SIZE];
        let mut cipher = Vec::new();
        let plain = vec![7u8; 48];
        encrypt_stream_with_iv(&mut cipher, &mut Cursor::new(&plain), KEY, 48, iv).unwrap();

        let mut head = [0u8; HEADER_SIZE];
        head.copy_from_slice(&cipher[..HEADER_SIZE]);
        let header = open_header(&key, &head).unwrap();
        assert_eq!(header.content_iv, iv);
        assert_eq!(header.num_padding, 0);
    }
}
