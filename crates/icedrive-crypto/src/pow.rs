//! Proof-of-work solvers for the login endpoints.
//!
//! Two variants are in the wild, depending on endpoint vintage:
//!
//! - **legacy** (`form_secure`): brute-force a decimal nonce until the
//!   SHA-256 of `"proof-of-work" || nonce` starts with four hex zeros, then
//!   HMAC-sign a stable JSON payload
//! - **current** (`pow_proof`): brute-force a 4-byte counter appended to the
//!   server challenge and 12 random bytes until the digest has enough
//!   leading zero bits

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

use crate::hashing::{hmac_sha256_hex, sha256, sha256_hex};
use crate::{CryptoError, Result};

const LEGACY_CHALLENGE: &str = "proof-of-work";
const LEGACY_DIFFICULTY: u32 = 4;

/// Random prefix length of the current-variant nonce.
pub const NONCE_RANDOM_LEN: usize = 12;

/// Inner payload of the legacy `form_secure` proof.
#[derive(Debug, Clone, Serialize)]
pub struct LegacyPayload {
    pub challenge: String,
    pub nonce: u64,
    pub hash: String,
    pub difficulty: u32,
    pub expires: u64,
}

#[derive(Serialize)]
struct LegacyEnvelope<'a> {
    payload: &'a LegacyPayload,
    signature: String,
}

/// Stringify the payload with keys in ascending order. The server verifies
/// the HMAC against exactly this byte sequence, so it cannot go through a
/// map with unspecified ordering. All values are plain ASCII.
fn stable_stringify(p: &LegacyPayload) -> String {
    format!(
        "{{\"challenge\":\"{}\",\"difficulty\":{},\"expires\":{},\"hash\":\"{}\",\"nonce\":{}}}",
        p.challenge, p.difficulty, p.expires, p.hash, p.nonce
    )
}

/// Compute the legacy `form_secure` string for the given server time and
/// HMAC key. Deterministic for fixed inputs.
pub fn compute_form_secure(server_time_sec: u64, hmac_key_hex: &str) -> Result<String> {
    let expires = server_time_sec * 1000 + 60_000;

    let prefix = "0".repeat(LEGACY_DIFFICULTY as usize);
    let mut nonce: u64 = 0;
    let hash = loop {
        let candidate = sha256_hex(&format!("{LEGACY_CHALLENGE}{nonce}"));
        if candidate.starts_with(&prefix) {
            break candidate;
        }
        nonce += 1;
    };

    let payload = LegacyPayload {
        challenge: LEGACY_CHALLENGE.to_string(),
        nonce,
        hash,
        difficulty: LEGACY_DIFFICULTY,
        expires,
    };
    let signature = hmac_sha256_hex(&stable_stringify(&payload), hmac_key_hex)?;
    let json = serde_json::to_vec(&LegacyEnvelope {
        payload: &payload,
        signature,
    })?;
    Ok(STANDARD.encode(json))
}

/// A solved current-variant challenge.
#[derive(Debug, Clone)]
pub struct PowSolution {
    /// url-safe base64 of the 16 nonce bytes (12 random + 4 counter).
    pub nonce_b64: String,
    /// Hex digest that met the difficulty target.
    pub hash_hex: String,
}

/// Solve a current-variant challenge: find the smallest big-endian u32
/// counter such that `sha256(challenge || random || counter)` has at least
/// `difficulty_bits` leading zero bits.
pub fn solve_challenge(challenge_b64: &str, difficulty_bits: u32) -> Result<PowSolution> {
    let mut random = [0u8; NONCE_RANDOM_LEN];
    OsRng.fill_bytes(&mut random);
    solve_challenge_with_random(challenge_b64, difficulty_bits, &random)
}

fn solve_challenge_with_random(
    challenge_b64: &str,
    difficulty_bits: u32,
    random: &[u8; NONCE_RANDOM_LEN],
) -> Result<PowSolution> {
    if difficulty_bits == 0 || difficulty_bits > 256 {
        return Err(CryptoError::BadDifficulty(difficulty_bits));
    }
    let challenge = URL_SAFE_NO_PAD
        .decode(challenge_b64)
        .map_err(|e| CryptoError::BadChallenge(e.to_string()))?;

    let counter_at = challenge.len() + NONCE_RANDOM_LEN;
    let mut buf = Vec::with_capacity(counter_at + 4);
    buf.extend_from_slice(&challenge);
    buf.extend_from_slice(random);
    buf.extend_from_slice(&[0u8; 4]);

    let mut counter: u32 = 0;
    loop {
        buf[counter_at..].copy_from_slice(&counter.to_be_bytes());
        let digest = sha256(&buf);
        if leading_zero_bits(&digest) >= difficulty_bits {
            let mut nonce = Vec::with_capacity(NONCE_RANDOM_LEN + 4);
            nonce.extend_from_slice(random);
            nonce.extend_from_slice(&counter.to_be_bytes());
            return Ok(PowSolution {
                nonce_b64: URL_SAFE_NO_PAD.encode(nonce),
                hash_hex: hex::encode(digest),
            });
        }
        counter = counter
            .checked_add(1)
            .ok_or(CryptoError::PowCounterExhausted)?;
    }
}

/// Count leading zero bits, walking bytes MSB-first.
pub fn leading_zero_bits(data: &[u8]) -> u32 {
    let mut count = 0;
    for &byte in data {
        if byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[]), 0);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0x40]), 1);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
        assert_eq!(leading_zero_bits(&[0x00]), 8);
        assert_eq!(leading_zero_bits(&[0x00, 0x20]), 10);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
    }

    #[test]
    fn test_form_secure_deterministic_and_well_formed() {
        let key_hex = "00".repeat(32);
        let a = compute_form_secure(1_700_000_000, &key_hex).unwrap();
        let b = compute_form_secure(1_700_000_000, &key_hex).unwrap();
        assert_eq!(a, b);

        let decoded = STANDARD.decode(&a).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["payload"]["challenge"], "proof-of-work");
        assert_eq!(value["payload"]["difficulty"], 4);
        assert_eq!(value["payload"]["expires"], 1_700_000_060_000u64);
        let hash = value["payload"]["hash"].as_str().unwrap();
        assert!(hash.starts_with("0000"));
        assert_eq!(value["signature"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_form_secure_signature_matches_stable_payload() {
        let key_hex = hex::encode(b"test-hmac-key");
        let encoded = compute_form_secure(1_000, &key_hex).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();

        let payload = LegacyPayload {
            challenge: value["payload"]["challenge"].as_str().unwrap().to_string(),
            nonce: value["payload"]["nonce"].as_u64().unwrap(),
            hash: value["payload"]["hash"].as_str().unwrap().to_string(),
            difficulty: value["payload"]["difficulty"].as_u64().unwrap() as u32,
            expires: value["payload"]["expires"].as_u64().unwrap(),
        };
        let expected = hmac_sha256_hex(&stable_stringify(&payload), &key_hex).unwrap();
        assert_eq!(value["signature"].as_str().unwrap(), expected);
    }

    #[test]
    fn test_solve_challenge_meets_difficulty() {
        let solution = solve_challenge("AAAA", 8).unwrap();

        let challenge = URL_SAFE_NO_PAD.decode("AAAA").unwrap();
        let nonce = URL_SAFE_NO_PAD.decode(&solution.nonce_b64).unwrap();
        assert_eq!(nonce.len(), NONCE_RANDOM_LEN + 4);

        let mut buf = challenge;
        buf.extend_from_slice(&nonce);
        let digest = sha256(&buf);
        assert!(leading_zero_bits(&digest) >= 8);
        assert_eq!(hex::encode(digest), solution.hash_hex);
    }

    #[test]
    fn test_solve_finds_smallest_counter() {
        // with a fixed random prefix the counter search is deterministic
        let random = [7u8; NONCE_RANDOM_LEN];
        let a = solve_challenge_with_random("AAAA", 4, &random).unwrap();
        let b = solve_challenge_with_random("AAAA", 4, &random).unwrap();
        assert_eq!(a.nonce_b64, b.nonce_b64);
        assert_eq!(a.hash_hex, b.hash_hex);
    }

    #[test]
    fn test_bad_difficulty_rejected() {
        assert!(matches!(
            solve_challenge("AAAA", 0),
            Err(CryptoError::BadDifficulty(0))
        ));
        assert!(matches!(
            solve_challenge("AAAA", 300),
            Err(CryptoError::BadDifficulty(300))
        ));
    }

    #[test]
    fn test_bad_challenge_rejected() {
        assert!(matches!(
            solve_challenge("!!not-base64!!", 8),
            Err(CryptoError::BadChallenge(_))
        ));
    }
}
