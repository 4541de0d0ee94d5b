//! Client error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Service error code marking an expired bearer token.
pub const AUTH_EXPIRED_CODE: i64 = 1001;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// No session; log in first
    #[error("not logged in")]
    Unauthenticated,

    /// Operation touches the crypto namespace but no crypto key is set
    #[error("crypto key not set; call set_crypto_password first")]
    CryptoKeyMissing,

    /// Bearer token rejected by the service
    #[error("authentication expired")]
    AuthExpired,

    /// Automatic re-login failed
    #[error("re-login failed: {0}")]
    ReloginFailed(String),

    /// HTTP transport error
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("unexpected status {status}: {body}")]
    BadStatus { status: u16, body: String },

    /// Business error reported by the service
    #[error("service error ({code}): {message}")]
    Service { code: i64, message: String },

    /// No upload endpoints returned by `/geo-fileserver-list`
    #[error("no upload endpoints available")]
    NoUploadEndpoints,

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] icedrive_crypto::CryptoError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Response did not have the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this error marks an expired session (wire status or the
    /// service's code 1001).
    pub fn is_auth_expired(&self) -> bool {
        match self {
            ClientError::AuthExpired => true,
            ClientError::Service { code, .. } => *code == AUTH_EXPIRED_CODE,
            ClientError::BadStatus { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}
