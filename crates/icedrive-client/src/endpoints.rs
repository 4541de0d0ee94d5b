//! Per-endpoint wrappers.
//!
//! Every wrapper has the same shape: build a URL-encoded or multipart
//! request, require a 2xx/3xx status, parse the JSON, surface the service's
//! `error` flag with its `code` and `message`. Streaming uploads and
//! downloads live in `transfer`.

use bytes::Bytes;
use reqwest::header::CONTENT_LENGTH;
use tracing::debug;

use icedrive_crypto::filename::{decrypt_filename, encrypt_filename};
use icedrive_crypto::stream::{open_header, HEADER_SIZE};
use icedrive_crypto::CryptoKey;

use crate::error::{ClientError, Result};
use crate::multipart::FormBuilder;
use crate::sender::{parse_response, Sender};
use crate::types::*;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

impl Sender {
    /// Fetch a fresh proof-of-work challenge for the given scope.
    pub async fn fetch_pow_challenge(&self, scope: &str) -> Result<PowChallenge> {
        let body = crate::auth::form_encode(&[
            ("app", "ios"),
            ("request", "pow-new"),
            ("scope", scope),
        ]);
        let resp = self.post("/api", FORM_URLENCODED, Bytes::from(body)).await?;
        parse_response(&resp)
    }

    /// Current server time in epoch seconds.
    pub async fn server_time(&self) -> Result<u64> {
        let resp = self.get("/current-server-time").await?;
        let parsed: ServerTimeResponse = parse_response(&resp)?;
        Ok(parsed.time_unix)
    }

    /// Profile of the authenticated user.
    pub async fn user_data(&self) -> Result<User> {
        self.require_bearer()?;
        let resp = self.get("/user-data").await?;
        parse_response(&resp)
    }

    /// List one folder of a collection tree. In the crypto tree, filenames
    /// are decrypted with the session key; entries that fail to decrypt keep
    /// their ciphertext so the caller can still see them.
    pub async fn collection(&self, kind: CollectionKind, folder_id: u64) -> Result<Vec<Item>> {
        self.require_bearer()?;
        let path = format!("/collection?type={}&folderId={}", kind.as_str(), folder_id);
        let resp = self.get(&path).await?;
        let parsed: CollectionResponse = parse_response(&resp)?;
        let mut items = parsed.data;

        if kind == CollectionKind::Crypto {
            let key_hex = self.crypto_key_hex();
            if !key_hex.is_empty() {
                for item in &mut items {
                    match decrypt_filename(&key_hex, &item.filename) {
                        Ok(name) => item.filename = name,
                        Err(err) => {
                            debug!(uid = %item.uid, "keeping undecryptable filename: {err}")
                        }
                    }
                }
            }
        }
        Ok(items)
    }

    /// Metadata for one folder.
    pub async fn folder_properties(
        &self,
        folder_uid: &str,
        crypto: bool,
    ) -> Result<FolderProperties> {
        self.require_bearer()?;
        let mut path = format!("/folder-properties?id={folder_uid}");
        if crypto {
            path.push_str("&crypto=1");
        }
        let resp = self.get(&path).await?;
        parse_response(&resp)
    }

    /// Resolve absolute fileserver URLs for the given item UIDs.
    pub async fn download_urls(&self, item_uids: &[String], crypto: bool) -> Result<Vec<DownloadUrl>> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("items", &item_uids.join(","));
        if crypto {
            form.field("crypto", "1");
        }
        let content_type = form.content_type();
        let resp = self
            .post("/download-multi", &content_type, form.finish())
            .await?;
        let parsed: DownloadMultiResponse = parse_response(&resp)?;
        if parsed.urls.is_empty() {
            return Err(ClientError::InvalidResponse(
                "download-multi returned no urls".into(),
            ));
        }
        Ok(parsed.urls)
    }

    /// Ordered upload endpoints from geo discovery; callers use the first.
    pub async fn upload_endpoints(&self) -> Result<Vec<String>> {
        self.require_bearer()?;
        let resp = self.get("/geo-fileserver-list").await?;
        let parsed: GeoFileserverList = parse_response(&resp)?;
        Ok(parsed.upload_endpoints)
    }

    pub async fn rename_file(&self, item_uid: &str, new_name: &str, keep_ext: bool) -> Result<()> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("request", "file-rename")
            .field("filename", new_name)
            .field("id", item_uid)
            .field("keep_ext", if keep_ext { "true" } else { "false" });
        let content_type = form.content_type();
        let resp = self.post("/file-rename", &content_type, form.finish()).await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    pub async fn rename_folder(&self, item_uid: &str, new_name: &str) -> Result<()> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("request", "folder-rename")
            .field("filename", new_name)
            .field("id", item_uid);
        let content_type = form.content_type();
        let resp = self
            .post("/folder-rename", &content_type, form.finish())
            .await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    /// Create a folder. In the crypto tree the name is stored encrypted,
    /// like any other crypto filename.
    pub async fn create_folder(&self, parent_id: u64, name: &str, crypto: bool) -> Result<()> {
        self.require_bearer()?;
        let stored_name = if crypto {
            let key_hex = self.crypto_key_hex();
            if key_hex.is_empty() {
                return Err(ClientError::CryptoKeyMissing);
            }
            encrypt_filename(&key_hex, name)?
        } else {
            name.to_string()
        };

        let mut form = FormBuilder::new();
        form.field("request", "folder-create")
            .field("type", "folder-create")
            .field("parentId", &parent_id.to_string())
            .field("filename", &stored_name);
        if crypto {
            form.field("crypto", "1");
        }
        let content_type = form.content_type();
        let resp = self
            .post("/folder-create", &content_type, form.finish())
            .await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    pub async fn move_items(&self, folder_id: u64, item_uids: &[String]) -> Result<()> {
        self.require_bearer()?;
        let uids: Vec<&str> = item_uids
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .collect();
        if uids.is_empty() {
            return Err(ClientError::InvalidResponse("no items provided".into()));
        }
        let mut form = FormBuilder::new();
        form.field("request", "move")
            .field("items", &uids.join(","))
            .field("folderId", &folder_id.to_string());
        let content_type = form.content_type();
        let resp = self.post("/move", &content_type, form.finish()).await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    /// Permanently delete an item.
    pub async fn erase(&self, item_uid: &str) -> Result<()> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("request", "erase").field("items", item_uid);
        let content_type = form.content_type();
        let resp = self.post("/erase", &content_type, form.finish()).await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    /// Move items to the trash; returns the server's message.
    pub async fn trash_add(&self, item_uids: &[String]) -> Result<String> {
        self.require_bearer()?;
        if item_uids.is_empty() {
            return Err(ClientError::InvalidResponse("no items provided".into()));
        }
        let mut form = FormBuilder::new();
        form.field("request", "trash-add")
            .field("items", &item_uids.join(","));
        let content_type = form.content_type();
        let resp = self.post("/trash-add", &content_type, form.finish()).await?;
        let parsed: MessageResponse = parse_response(&resp)?;
        Ok(parsed.message)
    }

    pub async fn trash_restore(&self, item_uid: &str) -> Result<()> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("request", "trash-restore")
            .field("items", item_uid);
        let content_type = form.content_type();
        let resp = self
            .post("/trash-restore", &content_type, form.finish())
            .await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    pub async fn trash_erase_all(&self) -> Result<()> {
        self.require_bearer()?;
        let mut form = FormBuilder::new();
        form.field("request", "trash-erase-all");
        let content_type = form.content_type();
        let resp = self
            .post("/trash-erase-all", &content_type, form.finish())
            .await?;
        parse_response::<MessageResponse>(&resp).map(|_| ())
    }

    /// Version history of a file.
    pub async fn list_versions(&self, item_uid: &str) -> Result<Vec<FileVersion>> {
        self.require_bearer()?;
        if item_uid.is_empty() {
            return Err(ClientError::InvalidResponse("missing item UID".into()));
        }
        let resp = self.get(&format!("/version-list?id={item_uid}")).await?;
        let parsed: VersionListResponse = parse_response(&resp)?;
        Ok(parsed.versions)
    }

    /// Account storage usage.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        self.require_bearer()?;
        let resp = self.get("/stats-storage").await?;
        parse_response(&resp)
    }

    /// Fetch the crypto verification hash and salt. The wire form is
    /// `ICE::<storedHex>::<salt>`.
    pub async fn crypto_salt(&self) -> Result<(String, String)> {
        let resp = self.get("/crypto-auth").await?;
        let parsed: CryptoAuthResponse = parse_response(&resp)?;
        let rest = parsed
            .hash
            .strip_prefix("ICE::")
            .ok_or_else(|| ClientError::InvalidResponse("bad crypto-auth response".into()))?;
        let (stored_hex, salt) = rest
            .split_once("::")
            .ok_or_else(|| ClientError::InvalidResponse("unexpected crypto-auth hash format".into()))?;
        Ok((stored_hex.to_string(), salt.to_string()))
    }

    /// Plaintext size of an item. Plain files report their Content-Length;
    /// crypto files subtract the framing header and padding, read via a
    /// ranged GET of the first 32 cipher bytes.
    pub async fn plain_size(&self, item_uid: &str, crypto: bool) -> Result<u64> {
        self.require_bearer()?;
        let urls = self
            .download_urls(&[item_uid.to_string()], crypto)
            .await?;
        let url = urls[0].url.clone();

        let head = self.head(&url).await?;
        if !(200..300).contains(&head.status) {
            return Err(ClientError::BadStatus {
                status: head.status,
                body: String::from_utf8_lossy(&head.body).into_owned(),
            });
        }
        let total: u64 = head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ClientError::InvalidResponse("missing Content-Length".into()))?;
        if !crypto {
            return Ok(total);
        }

        let key_hex = self.crypto_key_hex();
        if key_hex.is_empty() {
            return Err(ClientError::CryptoKeyMissing);
        }
        let ranged = self.get_range(&url, "bytes=0-31").await?;
        if !(200..300).contains(&ranged.status) {
            return Err(ClientError::BadStatus {
                status: ranged.status,
                body: String::from_utf8_lossy(&ranged.body).into_owned(),
            });
        }
        if ranged.body.len() < HEADER_SIZE {
            return Err(icedrive_crypto::CryptoError::ShortHeader.into());
        }
        let key = CryptoKey::from_hex(&key_hex)?;
        let mut header_cipher = [0u8; HEADER_SIZE];
        header_cipher.copy_from_slice(&ranged.body[..HEADER_SIZE]);
        let header = open_header(&key, &header_cipher)?;
        Ok(header.plain_size(total)?)
    }
}
