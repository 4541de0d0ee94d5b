//! High-level client: session management plus user-level operations over
//! the sender pool and endpoint wrappers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::TryStreamExt;
use tracing::{debug, instrument};

use icedrive_crypto::filename::encrypt_filename;
use icedrive_crypto::keys::derive_crypto_key;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::pool::SenderPool;
use crate::transfer::{
    decrypt_response, encrypt_reader, first_upload_endpoint, upload_via, DownloadStream,
    UploadParams, UploadWriter, PIPE_BUF_SIZE,
};
use crate::types::*;

/// Icedrive client over a pool of senders sharing one session.
pub struct IcedriveClient {
    pool: Arc<SenderPool>,
    auth: Arc<AuthManager>,
    crypto_salt: RwLock<String>,
}

impl IcedriveClient {
    /// Create a client from a configuration record. Nothing touches the
    /// network until a login or operation runs.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let pool = SenderPool::new(
            config.pool_size,
            config.metadata_timeout,
            config.transfer_timeout,
        )?;
        pool.set_api_base(&config.api_base);
        pool.set_headers(&config.api_headers);
        pool.set_cookie(&config.cookie);
        pool.set_debug(config.debug);
        if let Some(bearer) = &config.bearer {
            pool.set_bearer_token(bearer);
        }
        if let Some(key_hex) = &config.crypto_key_hex {
            pool.set_crypto_key_hex(key_hex);
        }

        let auth = AuthManager::new(
            Arc::clone(&pool),
            config.hmac_key_hex.clone(),
            config.metadata_timeout,
            config.transfer_timeout,
        );
        if let (Some(email), Some(password)) = (&config.email, &config.password) {
            auth.set_credentials(email, password);
        }

        Ok(Self {
            pool,
            auth,
            crypto_salt: RwLock::new(String::new()),
        })
    }

    /// Create a client with the default configuration.
    pub fn default_client() -> Result<Self> {
        Self::new(Config::default())
    }

    /// The sender pool, for advanced callers.
    pub fn pool(&self) -> &Arc<SenderPool> {
        &self.pool
    }

    // ==================== Session ====================

    /// Log in with whatever the configuration provides: a bearer token if
    /// present, otherwise credentials.
    pub async fn login(&self) -> Result<User> {
        let bearer = self.pool.bearer_token();
        if !bearer.is_empty() {
            return self.login_with_bearer_token(&bearer).await;
        }
        let creds = self.auth.credentials().ok_or(ClientError::Unauthenticated)?;
        self.login_with_credentials(&creds.email, &creds.password)
            .await
    }

    /// Proof-of-work credential login. On success the credentials are
    /// retained and automatic re-login is armed.
    #[instrument(skip(self, password))]
    pub async fn login_with_credentials(&self, email: &str, password: &str) -> Result<User> {
        let (user, token) = {
            let sender = self.pool.acquire().await;
            let user = self.auth.login_on(&sender, email, password).await?;
            (user, sender.bearer_token())
        };
        self.pool.set_bearer_token(&token);
        self.auth.set_credentials(email, password);
        self.auth.set_user(Some(user.clone()));
        self.auth.register_relogin();
        debug!(%email, "logged in");
        Ok(user)
    }

    /// Legacy form login (`form_secure` proof against `/login`).
    #[instrument(skip(self, password))]
    pub async fn login_with_form_secure(&self, email: &str, password: &str) -> Result<User> {
        let (user, token) = {
            let sender = self.pool.acquire().await;
            let user = self
                .auth
                .login_with_form_secure_on(&sender, email, password)
                .await?;
            (user, sender.bearer_token())
        };
        self.pool.set_bearer_token(&token);
        self.auth.set_credentials(email, password);
        self.auth.set_user(Some(user.clone()));
        self.auth.register_relogin();
        Ok(user)
    }

    /// Log in with a pre-obtained bearer token. Automatic re-login is armed
    /// only if credentials were supplied via config or `set_credentials`.
    #[instrument(skip(self, token))]
    pub async fn login_with_bearer_token(&self, token: &str) -> Result<User> {
        self.pool.set_bearer_token(token);
        let user = {
            let sender = self.pool.acquire().await;
            sender.user_data().await?
        };
        self.auth.set_user(Some(user.clone()));
        if self.auth.credentials().is_some() {
            self.auth.register_relogin();
        }
        Ok(user)
    }

    /// Retain credentials for automatic re-login after a bearer login.
    pub fn set_credentials(&self, email: &str, password: &str) {
        self.auth.set_credentials(email, password);
        if self.auth.user().is_some() {
            self.auth.register_relogin();
        }
    }

    /// The logged-in user, if any.
    pub fn user(&self) -> Option<User> {
        self.auth.user()
    }

    pub fn token(&self) -> String {
        self.pool.bearer_token()
    }

    pub fn set_token(&self, token: &str) {
        self.pool.set_bearer_token(token);
    }

    /// Derive the crypto key from the crypto password, fetching the account
    /// salt on first use, and share it with every sender.
    #[instrument(skip(self, password))]
    pub async fn set_crypto_password(&self, password: &str) -> Result<()> {
        let salt = {
            self.crypto_salt
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        };
        let salt = if salt.is_empty() {
            let sender = self.pool.acquire().await;
            let (_stored_hex, salt) = sender.crypto_salt().await?;
            *self
                .crypto_salt
                .write()
                .unwrap_or_else(PoisonError::into_inner) = salt.clone();
            salt
        } else {
            salt
        };
        let key_hex = derive_crypto_key(password, &salt)?;
        self.pool.set_crypto_key_hex(&key_hex);
        Ok(())
    }

    /// Install a pre-derived crypto key (64-char hex).
    pub fn set_crypto_key_hex(&self, key_hex: &str) -> Result<()> {
        icedrive_crypto::CryptoKey::from_hex(key_hex)?;
        self.pool.set_crypto_key_hex(key_hex);
        Ok(())
    }

    pub fn crypto_key_hex(&self) -> String {
        self.pool.crypto_key_hex()
    }

    fn ensure_auth(&self, crypto: bool) -> Result<()> {
        if self.auth.user().is_none() {
            return Err(ClientError::Unauthenticated);
        }
        if crypto && self.pool.crypto_key_hex().is_empty() {
            return Err(ClientError::CryptoKeyMissing);
        }
        Ok(())
    }

    // ==================== Listing ====================

    #[instrument(skip(self))]
    pub async fn list_folder(&self, folder_id: u64) -> Result<Vec<Item>> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.collection(CollectionKind::Cloud, folder_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_folder_encrypted(&self, folder_id: u64) -> Result<Vec<Item>> {
        self.ensure_auth(true)?;
        let sender = self.pool.acquire().await;
        sender.collection(CollectionKind::Crypto, folder_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_trash(&self, folder_id: u64) -> Result<Vec<Item>> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.collection(CollectionKind::Trash, folder_id).await
    }

    pub async fn folder_properties(
        &self,
        folder_uid: &str,
        crypto: bool,
    ) -> Result<FolderProperties> {
        self.ensure_auth(crypto)?;
        let sender = self.pool.acquire().await;
        sender.folder_properties(folder_uid, crypto).await
    }

    // ==================== Folder / item operations ====================

    pub async fn create_folder(&self, parent_id: u64, name: &str) -> Result<()> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.create_folder(parent_id, name, false).await
    }

    pub async fn create_folder_encrypted(&self, parent_id: u64, name: &str) -> Result<()> {
        self.ensure_auth(true)?;
        let sender = self.pool.acquire().await;
        sender.create_folder(parent_id, name, true).await
    }

    /// Rename an item, dispatching on its folder flag.
    pub async fn rename(&self, item: &Item, new_name: &str) -> Result<()> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        if item.folder() {
            sender.rename_folder(&item.uid, new_name).await
        } else {
            sender.rename_file(&item.uid, new_name, false).await
        }
    }

    pub async fn move_items(&self, target_folder_id: u64, items: &[Item]) -> Result<()> {
        self.ensure_auth(false)?;
        let uids: Vec<String> = items.iter().map(|i| i.uid.clone()).collect();
        let sender = self.pool.acquire().await;
        sender.move_items(target_folder_id, &uids).await
    }

    /// Permanently delete an item.
    pub async fn delete(&self, item: &Item) -> Result<()> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.erase(&item.uid).await
    }

    pub async fn trash_add(&self, items: &[Item]) -> Result<String> {
        self.ensure_auth(false)?;
        let uids: Vec<String> = items.iter().map(|i| i.uid.clone()).collect();
        let sender = self.pool.acquire().await;
        sender.trash_add(&uids).await
    }

    pub async fn trash_restore(&self, item: &Item) -> Result<()> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.trash_restore(&item.uid).await
    }

    pub async fn trash_erase_all(&self) -> Result<()> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.trash_erase_all().await
    }

    pub async fn list_versions(&self, item: &Item) -> Result<Vec<FileVersion>> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.list_versions(&item.uid).await
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        sender.storage_stats().await
    }

    /// Plaintext size of an item; for crypto items this probes the encrypted
    /// framing header with a ranged GET.
    pub async fn plain_size(&self, item: &Item) -> Result<u64> {
        self.ensure_auth(item.encrypted())?;
        let sender = self.pool.acquire().await;
        sender.plain_size(&item.uid, item.encrypted()).await
    }

    // ==================== Uploads ====================

    /// Upload a local file into the cloud tree.
    #[instrument(skip_all)]
    pub async fn upload_file(&self, folder_id: u64, path: impl AsRef<Path>) -> Result<UploadResponse> {
        self.ensure_auth(false)?;
        let path = path.as_ref();
        let params = file_upload_params(folder_id, path).await?;

        let sender = self.pool.acquire().await;
        let endpoint = first_upload_endpoint(&sender).await?;
        let file = tokio::fs::File::open(path).await?;
        upload_via(&sender, &endpoint, &params, None, file).await
    }

    /// Upload a local file into the crypto tree, encrypting the name and
    /// body in flight.
    #[instrument(skip_all)]
    pub async fn upload_file_encrypted(
        &self,
        folder_id: u64,
        path: impl AsRef<Path>,
    ) -> Result<UploadResponse> {
        self.ensure_auth(true)?;
        let path = path.as_ref();
        let params = file_upload_params(folder_id, path).await?;
        let plaintext_size = tokio::fs::metadata(path).await?.len();

        let key_hex = self.pool.crypto_key_hex();
        let encrypted_name = encrypt_filename(&key_hex, &params.file_name)?;

        let sender = self.pool.acquire().await;
        let endpoint = first_upload_endpoint(&sender).await?;
        let file = tokio::fs::File::open(path).await?;
        let cipher = encrypt_reader(file, key_hex, plaintext_size);
        upload_via(&sender, &endpoint, &params, Some(encrypted_name.as_str()), cipher).await
    }

    /// Streaming plain upload: returns a write handle whose `finish` yields
    /// the server response. The pooled sender backing the request is held
    /// until the request completes.
    pub async fn upload_writer(&self, folder_id: u64, file_name: &str) -> Result<UploadWriter> {
        self.ensure_auth(false)?;
        let params = UploadParams {
            folder_id,
            file_name: file_name.to_string(),
            moddate: now_epoch_seconds(),
            content_type: content_type_for(file_name),
        };

        let sender = self.pool.acquire().await;
        let endpoint = first_upload_endpoint(&sender).await?;
        let (pipe, body) = tokio::io::duplex(PIPE_BUF_SIZE);
        let task = tokio::spawn(async move {
            upload_via(&sender, &endpoint, &params, None, body).await
        });
        Ok(UploadWriter::new(pipe, task))
    }

    /// Streaming crypto upload. The plaintext size must be declared up
    /// front: the framing header's padding count depends on it.
    pub async fn upload_writer_encrypted(
        &self,
        folder_id: u64,
        file_name: &str,
        plaintext_size: u64,
    ) -> Result<UploadWriter> {
        self.ensure_auth(true)?;
        let key_hex = self.pool.crypto_key_hex();
        let encrypted_name = encrypt_filename(&key_hex, file_name)?;
        let params = UploadParams {
            folder_id,
            file_name: file_name.to_string(),
            moddate: now_epoch_seconds(),
            content_type: content_type_for(file_name),
        };

        let sender = self.pool.acquire().await;
        let endpoint = first_upload_endpoint(&sender).await?;
        let (pipe, body) = tokio::io::duplex(PIPE_BUF_SIZE);
        let cipher = encrypt_reader(body, key_hex, plaintext_size);
        let task = tokio::spawn(async move {
            upload_via(&sender, &endpoint, &params, Some(encrypted_name.as_str()), cipher).await
        });
        Ok(UploadWriter::new(pipe, task))
    }

    // ==================== Downloads ====================

    /// Download an item into `dest_dir`, via a `.part` temp file renamed on
    /// completion. Returns the final path.
    #[instrument(skip_all, fields(uid = %item.uid))]
    pub async fn download_file(
        &self,
        item: &Item,
        dest_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        self.download_file_inner(item, dest_dir.as_ref(), false).await
    }

    /// Download and decrypt a crypto item into `dest_dir`.
    #[instrument(skip_all, fields(uid = %item.uid))]
    pub async fn download_file_encrypted(
        &self,
        item: &Item,
        dest_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        self.download_file_inner(item, dest_dir.as_ref(), true).await
    }

    async fn download_file_inner(
        &self,
        item: &Item,
        dest_dir: &Path,
        crypto: bool,
    ) -> Result<PathBuf> {
        self.ensure_auth(crypto)?;
        let sender = self.pool.acquire().await;
        let urls = sender.download_urls(&[item.uid.clone()], crypto).await?;
        let response = sender.get_stream(&urls[0].url).await?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let final_path = dest_dir.join(&item.filename);
        let tmp_path = dest_dir.join(format!("{}.part", item.filename));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        if crypto {
            let mut reader = decrypt_response(response, self.pool.crypto_key_hex());
            tokio::io::copy(&mut reader, &mut file).await?;
        } else {
            let stream = response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            let mut reader = tokio_util::io::StreamReader::new(Box::pin(stream));
            tokio::io::copy(&mut reader, &mut file).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(final_path)
    }

    /// Open a plain download as an async reader.
    pub async fn download_stream(&self, item: &Item) -> Result<DownloadStream> {
        self.ensure_auth(false)?;
        let sender = self.pool.acquire().await;
        let urls = sender.download_urls(&[item.uid.clone()], false).await?;
        let response = sender.get_stream(&urls[0].url).await?;
        Ok(DownloadStream::plain(response, sender))
    }

    /// Open a crypto download as an async reader yielding plaintext.
    pub async fn download_stream_encrypted(&self, item: &Item) -> Result<DownloadStream> {
        self.ensure_auth(true)?;
        let sender = self.pool.acquire().await;
        let urls = sender.download_urls(&[item.uid.clone()], true).await?;
        let response = sender.get_stream(&urls[0].url).await?;
        let key_hex = self.pool.crypto_key_hex();
        Ok(DownloadStream::decrypted(response, key_hex, sender))
    }
}

fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

async fn file_upload_params(folder_id: u64, path: &Path) -> Result<UploadParams> {
    let meta = tokio::fs::metadata(path).await?;
    let moddate = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_else(now_epoch_seconds);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ClientError::Config(format!("not a file path: {}", path.display())))?;
    let content_type = content_type_for(&file_name);
    Ok(UploadParams {
        folder_id,
        file_name,
        moddate,
        content_type,
    })
}
