//! Single HTTP sender: header policy, URL resolution, response handling and
//! the one-shot auth-retry wrapper.
//!
//! A sender owns one reqwest client with its own cookie jar and carries a
//! copy of the shared session state (bearer, crypto key, base URL, header
//! overrides). The pool snapshots the shared state into a sender on acquire
//! and copies a rotated bearer back on release.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, AUTHORIZATION,
    CONTENT_TYPE, COOKIE, RANGE, USER_AGENT,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::types::ApiEnvelope;

/// Future returned by a re-login hook.
pub type ReloginFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Hook invoked by the auth-retry wrapper to refresh the session.
pub type ReloginFn = Arc<dyn Fn() -> ReloginFuture + Send + Sync>;

/// Header names honored from the raw header-overrides string. Anything else
/// in the string is ignored.
pub(crate) const HEADER_WHITELIST: &[&str] = &[
    "User-Agent",
    "Accept",
    "Accept-Language",
    "Accept-Encoding",
    "Referer",
    "Origin",
    "Connection",
    "Upgrade-Insecure-Requests",
    "Sec-Fetch-Dest",
    "Sec-Fetch-Mode",
    "Sec-Fetch-Site",
    "Sec-Fetch-User",
    "Sec-GPC",
    "Priority",
    "TE",
    "Content-Type",
    "Authorization",
];

#[derive(Default)]
struct SenderState {
    bearer: String,
    crypto_key_hex: String,
    api_base: String,
    headers: String,
    cookie: String,
    debug: bool,
    relogin: Option<ReloginFn>,
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One reusable HTTP executor.
pub struct Sender {
    http: reqwest::Client,
    metadata_timeout: Duration,
    state: RwLock<SenderState>,
}

impl Sender {
    pub fn new(metadata_timeout: Duration, transfer_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(transfer_timeout)
            .build()?;
        Ok(Self {
            http,
            metadata_timeout,
            state: RwLock::new(SenderState::default()),
        })
    }

    fn state(&self) -> RwLockReadGuard<'_, SenderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SenderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_bearer_token(&self, token: &str) {
        self.state_mut().bearer = token.to_string();
    }

    pub fn bearer_token(&self) -> String {
        self.state().bearer.clone()
    }

    pub fn set_crypto_key_hex(&self, key_hex: &str) {
        self.state_mut().crypto_key_hex = key_hex.to_string();
    }

    pub fn crypto_key_hex(&self) -> String {
        self.state().crypto_key_hex.clone()
    }

    pub fn set_api_base(&self, api_base: &str) {
        self.state_mut().api_base = api_base.to_string();
    }

    pub fn api_base(&self) -> String {
        self.state().api_base.clone()
    }

    pub fn set_headers(&self, headers: &str) {
        self.state_mut().headers = headers.to_string();
    }

    pub fn headers(&self) -> String {
        self.state().headers.clone()
    }

    pub fn set_cookie(&self, cookie: &str) {
        self.state_mut().cookie = cookie.to_string();
    }

    pub fn set_debug(&self, debug: bool) {
        self.state_mut().debug = debug;
    }

    pub fn debug(&self) -> bool {
        self.state().debug
    }

    pub fn set_relogin(&self, relogin: Option<ReloginFn>) {
        self.state_mut().relogin = relogin;
    }

    pub(crate) fn require_bearer(&self) -> Result<()> {
        if self.state().bearer.trim().is_empty() {
            Err(ClientError::Unauthenticated)
        } else {
            Ok(())
        }
    }

    /// Resolve an endpoint path against the API base. Absolute URLs (per-file
    /// fileserver hosts) pass through untouched.
    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with('/') || !path.contains("://") {
            format!("{}{}", self.state().api_base, path)
        } else {
            path.to_string()
        }
    }

    /// Header map for the next request: whitelist overrides, then the bearer
    /// (which beats any configured `Authorization`), then defaults for
    /// whatever is still unset.
    fn request_headers(&self) -> HeaderMap {
        let (bearer, overrides, cookie) = {
            let st = self.state();
            (st.bearer.clone(), st.headers.clone(), st.cookie.clone())
        };

        let mut map = HeaderMap::new();
        for (name, value) in parse_header_overrides(&overrides) {
            if name.eq_ignore_ascii_case("authorization") && !bearer.is_empty() {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(n), Ok(v)) => {
                    map.insert(n, v);
                }
                _ => debug!(header = %name, "skipping unrepresentable header override"),
            }
        }
        if !bearer.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {bearer}")) {
                map.insert(AUTHORIZATION, v);
            }
        }
        if !cookie.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                map.insert(COOKIE, v);
            }
        }
        if !map.contains_key(USER_AGENT) {
            map.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        }
        if !map.contains_key(ACCEPT) {
            map.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        if !map.contains_key(ACCEPT_LANGUAGE) {
            map.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        }
        map
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        content_type: Option<&str>,
        body: Option<Bytes>,
    ) -> Result<ApiResponse> {
        let url = self.resolve_url(path);
        let debug_on = self.state().debug;

        let mut headers = self.request_headers();
        if let Some(ct) = content_type {
            if let Ok(v) = HeaderValue::from_str(ct) {
                headers.insert(CONTENT_TYPE, v);
            }
        }

        let mut req = self
            .http
            .request(method.clone(), &url)
            .timeout(self.metadata_timeout)
            .headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        if debug_on {
            debug!(%method, %url, "sending request");
        }
        let res = req.send().await?;
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        let body = res.bytes().await?;
        if debug_on {
            debug!(status, bytes = body.len(), %url, "response");
        }
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Whether a response marks an expired session: wire status 401/403, or a
    /// JSON body carrying the service's auth-expiry code.
    fn is_auth_failure(resp: &ApiResponse) -> bool {
        if resp.status == 401 || resp.status == 403 {
            return true;
        }
        match serde_json::from_slice::<ApiEnvelope>(&resp.body) {
            Ok(env) => env.error && env.code == Some(crate::error::AUTH_EXPIRED_CODE),
            Err(_) => false,
        }
    }

    /// Run the registered re-login hook once, clearing the stale bearer
    /// first. On failure the old bearer is restored for diagnostics. Returns
    /// whether the session was refreshed.
    pub(crate) async fn try_relogin(&self) -> bool {
        let relogin = self.state().relogin.clone();
        let Some(relogin) = relogin else {
            return false;
        };
        let old = std::mem::take(&mut self.state_mut().bearer);
        match relogin().await {
            Ok(()) => true,
            Err(err) => {
                warn!("re-login failed: {err}");
                let mut st = self.state_mut();
                if st.bearer.is_empty() {
                    st.bearer = old;
                }
                false
            }
        }
    }

    /// Execute `op`; if the result marks an expired session and a re-login
    /// hook is registered, refresh once and re-execute exactly once. Any
    /// other outcome, including a failed re-login, yields the first result.
    async fn with_auth_retry<F, Fut>(&self, mut op: F) -> Result<ApiResponse>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ApiResponse>>,
    {
        let first = op().await?;
        if !Self::is_auth_failure(&first) {
            return Ok(first);
        }
        if !self.try_relogin().await {
            return Ok(first);
        }
        op().await
    }

    /// GET an endpoint, with auth-retry.
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.with_auth_retry(|| self.execute(Method::GET, path, None, None))
            .await
    }

    /// POST a buffered body, with auth-retry (the body is replayable).
    pub async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<ApiResponse> {
        self.with_auth_retry(|| {
            self.execute(
                Method::POST,
                path,
                Some(content_type),
                Some(body.clone()),
            )
        })
        .await
    }

    /// POST a streaming body. The body cannot be replayed once transmission
    /// begins, so an auth failure is surfaced instead of retried.
    pub async fn post_stream(
        &self,
        path: &str,
        content_type: &str,
        body: reqwest::Body,
    ) -> Result<ApiResponse> {
        let url = self.resolve_url(path);
        let mut headers = self.request_headers();
        if let Ok(v) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, v);
        }
        if self.state().debug {
            debug!(%url, "streaming POST");
        }
        let res = self.http.post(&url).headers(headers).body(body).send().await?;
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        let body = res.bytes().await?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_identity_get(&self, url: &str) -> Result<reqwest::Response> {
        let url = self.resolve_url(url);
        let mut headers = self.request_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        // no transparent decoder may wrap a streamed body
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        Ok(self.http.get(&url).headers(headers).send().await?)
    }

    /// GET returning the live response for streaming consumption, identity
    /// encoded. Retries once on 401/403 (nothing has been transmitted yet).
    pub async fn get_stream(&self, url: &str) -> Result<reqwest::Response> {
        let mut res = self.send_identity_get(url).await?;
        if matches!(res.status().as_u16(), 401 | 403) && self.try_relogin().await {
            res = self.send_identity_get(url).await?;
        }
        let status = res.status().as_u16();
        if !(200..300).contains(&status) {
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::BadStatus { status, body });
        }
        Ok(res)
    }

    /// HEAD a URL (no auth-retry; used for size probes on fileserver hosts).
    pub async fn head(&self, url: &str) -> Result<ApiResponse> {
        self.execute(Method::HEAD, url, None, None).await
    }

    /// Ranged GET on a URL, e.g. `bytes=0-31` for the encrypted header.
    pub async fn get_range(&self, url: &str, range: &str) -> Result<ApiResponse> {
        let url = self.resolve_url(url);
        let mut headers = self.request_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if let Ok(v) = HeaderValue::from_str(range) {
            headers.insert(RANGE, v);
        }
        let res = self
            .http
            .get(&url)
            .timeout(self.metadata_timeout)
            .headers(headers)
            .send()
            .await?;
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        let body = res.bytes().await?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Require 2xx/3xx, surface the service's error envelope, then parse the
/// typed payload. The uniform decode path every endpoint wrapper uses.
pub(crate) fn parse_response<T: DeserializeOwned>(resp: &ApiResponse) -> Result<T> {
    if !(200..400).contains(&resp.status) {
        return Err(ClientError::BadStatus {
            status: resp.status,
            body: String::from_utf8_lossy(&resp.body).into_owned(),
        });
    }
    if let Ok(env) = serde_json::from_slice::<ApiEnvelope>(&resp.body) {
        if env.error {
            return Err(ClientError::Service {
                code: env.code.unwrap_or(0),
                message: env.message.unwrap_or_default(),
            });
        }
    }
    Ok(serde_json::from_slice(&resp.body)?)
}

fn find_ci(haystack: &[u8], needle: &str, from: usize) -> Option<usize> {
    let n = needle.as_bytes();
    if haystack.len() < from + n.len() {
        return None;
    }
    (from..=haystack.len() - n.len()).find(|&i| haystack[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Parse the raw header-overrides string by scanning for whitelisted header
/// names; each value runs up to the next whitelisted name or end of string,
/// with trailing `;` and whitespace stripped.
pub(crate) fn parse_header_overrides(raw: &str) -> Vec<(String, String)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let bytes = trimmed.as_bytes();

    let next_header_at = |from: usize| -> Option<(usize, &'static str)> {
        let mut best: Option<(usize, &'static str)> = None;
        for name in HEADER_WHITELIST {
            let needle = format!("{name}:");
            if let Some(pos) = find_ci(bytes, &needle, from) {
                if best.map_or(true, |(b, _)| pos < b) {
                    best = Some((pos, name));
                }
            }
        }
        best
    };

    let mut out = Vec::new();
    let mut at = 0;
    while let Some((idx, name)) = next_header_at(at) {
        let mut val_start = idx + name.len() + 1;
        while val_start < bytes.len() && (bytes[val_start] == b' ' || bytes[val_start] == b'\t') {
            val_start += 1;
        }
        let val_end = next_header_at(val_start)
            .map(|(pos, _)| pos)
            .unwrap_or(bytes.len());
        let val = String::from_utf8_lossy(&bytes[val_start..val_end]);
        let val = val.trim().trim_end_matches(';').trim().to_string();
        out.push((name.to_string(), val));
        at = val_end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_header() {
        let parsed = parse_header_overrides("User-Agent: icedrive-ios/2.3.1");
        assert_eq!(
            parsed,
            vec![("User-Agent".to_string(), "icedrive-ios/2.3.1".to_string())]
        );
    }

    #[test]
    fn test_parse_run_on_header_blob() {
        let raw = "User-Agent: Mozilla/5.0 (X11; Linux) Accept: */* Accept-Language: en-US,en;q=0.5; Origin: https://icedrive.net";
        let parsed = parse_header_overrides(raw);
        assert_eq!(
            parsed,
            vec![
                ("User-Agent".into(), "Mozilla/5.0 (X11; Linux)".into()),
                ("Accept".into(), "*/*".into()),
                ("Accept-Language".into(), "en-US,en;q=0.5".into()),
                ("Origin".into(), "https://icedrive.net".into()),
            ]
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let parsed = parse_header_overrides("user-agent: test-ua");
        assert_eq!(parsed, vec![("User-Agent".into(), "test-ua".into())]);
    }

    #[test]
    fn test_parse_ignores_unknown_headers() {
        let parsed = parse_header_overrides("X-Custom: nope Accept: text/html");
        assert_eq!(parsed, vec![("Accept".into(), "text/html".into())]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_header_overrides("").is_empty());
        assert!(parse_header_overrides("   ").is_empty());
        assert!(parse_header_overrides("no headers here").is_empty());
    }

    #[test]
    fn test_bearer_beats_configured_authorization() {
        let sender = Sender::new(Duration::from_secs(5), Duration::from_secs(10)).unwrap();
        sender.set_headers("Authorization: Basic abc User-Agent: ua");
        sender.set_bearer_token("tok");
        let map = sender.request_headers();
        assert_eq!(map.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(map.get(USER_AGENT).unwrap(), "ua");
    }

    #[test]
    fn test_defaults_fill_unset_headers() {
        let sender = Sender::new(Duration::from_secs(5), Duration::from_secs(10)).unwrap();
        let map = sender.request_headers();
        assert_eq!(map.get(USER_AGENT).unwrap(), "Mozilla/5.0");
        assert_eq!(map.get(ACCEPT).unwrap(), "*/*");
        assert_eq!(map.get(ACCEPT_LANGUAGE).unwrap(), "en-US,en;q=0.5");
        assert!(map.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_resolve_url() {
        let sender = Sender::new(Duration::from_secs(5), Duration::from_secs(10)).unwrap();
        sender.set_api_base("https://api.example/v3");
        assert_eq!(
            sender.resolve_url("/collection"),
            "https://api.example/v3/collection"
        );
        assert_eq!(
            sender.resolve_url("https://files.example/dl/1"),
            "https://files.example/dl/1"
        );
    }

    #[test]
    fn test_auth_failure_detection() {
        let auth = |status: u16, body: &str| {
            Sender::is_auth_failure(&ApiResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from(body.to_string()),
            })
        };
        assert!(auth(401, ""));
        assert!(auth(403, ""));
        assert!(auth(200, r#"{"error":true,"code":1001,"message":"expired"}"#));
        assert!(!auth(200, r#"{"error":true,"code":5,"message":"other"}"#));
        assert!(!auth(200, r#"{"error":false}"#));
        assert!(!auth(200, "not json"));
        assert!(!auth(500, ""));
    }
}
