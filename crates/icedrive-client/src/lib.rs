//! # Icedrive Client
//!
//! An async client for the Icedrive HTTPS API, including the end-to-end
//! encrypted "crypto" namespace whose filenames and file bodies are opaque
//! to the server.
//!
//! ## Features
//!
//! - **Proof-of-work login**: both challenge variants the service accepts
//! - **Streaming crypto**: uploads encrypted and downloads decrypted in
//!   flight with the service's framed Twofish-CBC format
//! - **Automatic re-login**: expired sessions are refreshed once and the
//!   failing request retried transparently
//! - **Sender pool**: a bounded pool of HTTP senders sharing one session,
//!   so metadata calls proceed while transfers stream
//!
//! ## Example
//!
//! ```rust,ignore
//! use icedrive_client::{Config, IcedriveClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env_file(".env")?;
//!     let client = IcedriveClient::new(config)?;
//!     let user = client.login().await?;
//!     println!("logged in as {}", user.email);
//!
//!     client.set_crypto_password("crypto-password").await?;
//!     for item in client.list_folder_encrypted(0).await? {
//!         println!("{} ({} bytes)", item.filename, item.filesize);
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod endpoints;
mod transfer;

pub mod config;
pub mod error;
pub mod multipart;
pub mod pool;
pub mod sender;
pub mod types;

pub use client::IcedriveClient;
pub use config::Config;
pub use error::{ClientError, Result};
pub use pool::{PooledSender, SenderPool, DEFAULT_POOL_SIZE};
pub use sender::{ApiResponse, ReloginFn, Sender};
pub use transfer::{DownloadStream, UploadWriter};
pub use types::*;
