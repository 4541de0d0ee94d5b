//! Login flows and serialized re-login.
//!
//! The auth manager retains credentials supplied by the caller and exposes a
//! re-login hook to the pool. Re-login runs on a standalone sender — never
//! one borrowed from the pool, since the hook fires from inside a held
//! sender and a pool of size one would deadlock otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::debug;

use icedrive_crypto::pow::{compute_form_secure, solve_challenge};

use crate::error::{ClientError, Result};
use crate::multipart::FormBuilder;
use crate::pool::SenderPool;
use crate::sender::{parse_response, ReloginFn, Sender};
use crate::types::{LoginResponse, PowChallenge, User};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Percent-encode form values (everything outside ALPHA / DIGIT).
pub(crate) fn form_encode(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, NON_ALPHANUMERIC),
                utf8_percent_encode(v, NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Wire envelope for the current-variant proof: the solved challenge plus
/// its own fields echoed back, JSON then base64.
fn build_pow_proof(challenge: &PowChallenge) -> Result<String> {
    let solution = solve_challenge(&challenge.challenge, challenge.difficulty_bits)?;
    let envelope = serde_json::json!({
        "client_id": "",
        "token": challenge.token,
        "challenge": challenge.challenge,
        "ver": "1",
        "hash": solution.hash_hex,
        "nonce": solution.nonce_b64,
        "exp": challenge.exp,
        "difficultyBits": challenge.difficulty_bits,
        "scope": challenge.scope,
    });
    Ok(STANDARD.encode(serde_json::to_vec(&envelope)?))
}

#[derive(Clone)]
pub(crate) struct Credentials {
    pub email: String,
    pub password: String,
}

pub(crate) struct AuthManager {
    pool: Arc<SenderPool>,
    hmac_key_hex: String,
    metadata_timeout: Duration,
    transfer_timeout: Duration,
    credentials: RwLock<Option<Credentials>>,
    user: RwLock<Option<User>>,
    relogin_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl AuthManager {
    pub fn new(
        pool: Arc<SenderPool>,
        hmac_key_hex: String,
        metadata_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            hmac_key_hex,
            metadata_timeout,
            transfer_timeout,
            credentials: RwLock::new(None),
            user: RwLock::new(None),
            relogin_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn user(&self) -> Option<User> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_user(&self, user: Option<User>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_credentials(&self, email: &str, password: &str) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Credentials {
            email: email.to_string(),
            password: password.to_string(),
        });
    }

    /// Full credential handshake on the given sender: fetch a login-scoped
    /// challenge, solve it, post the login form, store the bearer, then
    /// fetch the user profile.
    pub async fn login_on(&self, sender: &Sender, email: &str, password: &str) -> Result<User> {
        let challenge = sender.fetch_pow_challenge("login").await?;
        let pow_proof = build_pow_proof(&challenge)?;

        let form = form_encode(&[
            ("password", password),
            ("pow_proof", &pow_proof),
            ("request", "login"),
            ("email", email),
            ("no_token_check", "true"),
            ("app", "ios"),
        ]);
        let resp = sender.post("/api", FORM_URLENCODED, Bytes::from(form)).await?;
        let login: LoginResponse = parse_response(&resp)?;
        if login.token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "login response carried no token".into(),
            ));
        }
        sender.set_bearer_token(&login.token);
        sender.user_data().await
    }

    /// Legacy handshake: server time, `form_secure` proof, multipart POST to
    /// `/login`.
    pub async fn login_with_form_secure_on(
        &self,
        sender: &Sender,
        email: &str,
        password: &str,
    ) -> Result<User> {
        let server_time = sender.server_time().await?;
        let form_secure = compute_form_secure(server_time, &self.hmac_key_hex)?;

        let mut form = FormBuilder::new();
        form.field("e-mail", "")
            .field("email", email)
            .field("password", password)
            .field("form_secure", &form_secure);
        let content_type = form.content_type();
        let resp = sender.post("/login", &content_type, form.finish()).await?;
        let login: LoginResponse = parse_response(&resp)?;
        if login.token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "login response carried no token".into(),
            ));
        }
        sender.set_bearer_token(&login.token);
        sender.user_data().await
    }

    /// Serialized re-login. Concurrent callers that arrive while one
    /// re-login is in flight wait for it and reuse its token instead of
    /// initiating another handshake.
    pub async fn relogin(&self) -> Result<()> {
        let creds = self
            .credentials()
            .ok_or_else(|| ClientError::ReloginFailed("no credentials retained".into()))?;

        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.relogin_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            return Ok(());
        }

        debug!("re-authenticating");
        let sender = Sender::new(self.metadata_timeout, self.transfer_timeout)?;
        sender.set_api_base(&self.pool.api_base());
        sender.set_headers(&self.pool.headers());
        sender.set_debug(self.pool.debug());
        // no re-login hook on the standalone sender: a failing handshake
        // must not recurse

        let user = self
            .login_on(&sender, &creds.email, &creds.password)
            .await
            .map_err(|e| ClientError::ReloginFailed(e.to_string()))?;

        self.pool.set_bearer_token(&sender.bearer_token());
        self.set_user(Some(user));
        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Install this manager's `relogin` as the pool's re-login hook.
    pub fn register_relogin(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let hook: ReloginFn = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(auth) => auth.relogin().await,
                    None => Err(ClientError::ReloginFailed("client dropped".into())),
                }
            })
        });
        self.pool.set_relogin(Some(hook));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_encode_escapes_reserved_bytes() {
        let encoded = form_encode(&[("email", "a+b@example.com"), ("password", "p&s=w d")]);
        assert_eq!(
            encoded,
            "email=a%2Bb%40example%2Ecom&password=p%26s%3Dw%20d"
        );
    }

    #[test]
    fn test_pow_proof_envelope_shape() {
        let challenge = PowChallenge {
            challenge: "AAAA".into(),
            difficulty_bits: 4,
            exp: 1_700_000_123,
            scope: "login".into(),
            token: "tok".into(),
        };
        let proof = build_pow_proof(&challenge).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(proof).unwrap()).unwrap();
        assert_eq!(value["client_id"], "");
        assert_eq!(value["token"], "tok");
        assert_eq!(value["challenge"], "AAAA");
        assert_eq!(value["ver"], "1");
        assert_eq!(value["difficultyBits"], 4);
        assert_eq!(value["scope"], "login");
        assert_eq!(value["exp"], 1_700_000_123u64);
        assert!(value["hash"].as_str().unwrap().len() == 64);
        assert!(!value["nonce"].as_str().unwrap().is_empty());
    }
}
