//! Client configuration
//!
//! The original tooling around this API reads a `.env`-style file into a
//! process-wide map; here the same keys land in an explicit `Config` record
//! passed to the client constructor.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Default API base used by the service's mobile clients.
pub const DEFAULT_API_BASE: &str = "https://apis.icedrive.net/v3/mobile";

/// Header string the mobile client identifies with by default.
pub const DEFAULT_API_HEADERS: &str = "User-Agent: icedrive-ios/2.3.1";

/// HMAC key (hex) the legacy `form_secure` login signs with.
pub const DEFAULT_HMAC_KEY_HEX: &str =
    "436f6e67726174756c6174696f6e7320494620796f7520676f742054484953206661722121203b2921203a29";

/// Client configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// API base URL for relative endpoint paths
    pub api_base: String,
    /// Number of pooled senders
    pub pool_size: usize,
    /// Credentials for password login (retained for automatic re-login)
    pub email: Option<String>,
    pub password: Option<String>,
    /// Pre-obtained bearer token
    pub bearer: Option<String>,
    /// Hex HMAC key for the legacy proof-of-work
    pub hmac_key_hex: String,
    /// Pre-derived crypto key, 64-char hex
    pub crypto_key_hex: Option<String>,
    /// Raw header lines applied to every request (see the header policy)
    pub api_headers: String,
    /// Raw cookie header
    pub cookie: String,
    /// Verbose request/response logging
    pub debug: bool,
    /// Timeout for metadata requests
    pub metadata_timeout: Duration,
    /// Timeout for uploads and downloads; must stay well above the
    /// metadata timeout
    pub transfer_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            pool_size: 3,
            email: None,
            password: None,
            bearer: None,
            hmac_key_hex: DEFAULT_HMAC_KEY_HEX.to_string(),
            crypto_key_hex: None,
            api_headers: DEFAULT_API_HEADERS.to_string(),
            cookie: String::new(),
            debug: false,
            metadata_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Create a config with the given API base.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    /// Populate from `ICEDRIVE_*` process environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        for (key, value) in std::env::vars() {
            cfg.apply(&key, &value);
        }
        cfg
    }

    /// Populate from a `.env`-style file: `KEY=VALUE` lines, `#` comments,
    /// blank lines and unknown keys ignored.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut cfg = Self::default();
        for (key, value) in parse_env_lines(&content) {
            cfg.apply(&key, &value);
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "ICEDRIVE_EMAIL" => self.email = Some(value.to_string()),
            "ICEDRIVE_PASSWORD" => self.password = Some(value.to_string()),
            "ICEDRIVE_BEARER" => self.bearer = Some(value.to_string()),
            "ICEDRIVE_HMAC" => self.hmac_key_hex = value.to_string(),
            // raw 32-byte key; normalized to the hex form used everywhere else
            "ICEDRIVE_CRYPTO_KEY" => self.crypto_key_hex = Some(hex::encode(value.as_bytes())),
            "ICEDRIVE_CRYPTO_KEY_64" => self.crypto_key_hex = Some(value.to_string()),
            "ICEDRIVE_API_HEADERS" => self.api_headers = value.to_string(),
            "ICEDRIVE_COOKIE" => self.cookie = value.to_string(),
            _ => {}
        }
    }

    /// Set the bearer token.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Set login credentials.
    pub fn with_credentials(
        mut self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.email = Some(email.into());
        self.password = Some(password.into());
        self
    }

    /// Set a pre-derived crypto key (64-char hex).
    pub fn with_crypto_key_hex(mut self, key_hex: impl Into<String>) -> Self {
        self.crypto_key_hex = Some(key_hex.into());
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Enable verbose logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            return Err(ClientError::Config("api_base must not be empty".into()));
        }
        if self.metadata_timeout >= self.transfer_timeout {
            return Err(ClientError::Config(
                "transfer_timeout must exceed metadata_timeout".into(),
            ));
        }
        if let Some(key) = &self.crypto_key_hex {
            icedrive_crypto::CryptoKey::from_hex(key)
                .map_err(|e| ClientError::Config(format!("crypto key: {e}")))?;
        }
        Ok(())
    }
}

fn parse_env_lines(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "# credentials\nICEDRIVE_EMAIL=me@example.com\nICEDRIVE_PASSWORD = s3cret \n\nbogus line\nUNKNOWN_KEY=1\nICEDRIVE_BEARER=tok123"
        )
        .unwrap();

        let cfg = Config::from_env_file(file.path()).unwrap();
        assert_eq!(cfg.email.as_deref(), Some("me@example.com"));
        assert_eq!(cfg.password.as_deref(), Some("s3cret"));
        assert_eq!(cfg.bearer.as_deref(), Some("tok123"));
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn test_raw_crypto_key_is_normalized_to_hex() {
        let mut cfg = Config::default();
        cfg.apply("ICEDRIVE_CRYPTO_KEY", "0123456789abcdef0123456789abcdef");
        let hex_key = cfg.crypto_key_hex.unwrap();
        assert_eq!(hex_key.len(), 64);
        assert!(icedrive_crypto::CryptoKey::from_hex(&hex_key).is_ok());

        let mut cfg = Config::default();
        cfg.apply("ICEDRIVE_CRYPTO_KEY_64", &"ab".repeat(32));
        assert_eq!(cfg.crypto_key_hex.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn test_validate_rejects_bad_key_and_timeouts() {
        let cfg = Config::default().with_crypto_key_hex("zz");
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transfer_timeout = Duration::from_secs(10);
        assert!(cfg.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }
}
