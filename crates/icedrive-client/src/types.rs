//! Wire types for the service's JSON API.
//!
//! Every response carries an `error` flag and, on failure, `code` and
//! `message`; `code == 1001` marks an expired session. Fields the service
//! sometimes omits are defaulted so partial payloads still parse.

use serde::Deserialize;

/// Generic error envelope present on every JSON response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of a collection listing: a file or folder handle.
///
/// After construction only `uid`, `filename`, `is_folder` and `crypto` are
/// authoritative; the rest is display metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub uid: String,
    pub filename: String,
    pub parent_id: i64,
    pub moddate: i64,
    pub is_folder: i64,
    pub filesize: i64,
    pub extension: String,
    pub fave: i64,
    pub is_public: i64,
    pub color: serde_json::Value,
    pub is_owner: i64,
    pub is_shared: i64,
    pub file_type: String,
    pub crypto: i64,
    pub thumbnail: serde_json::Value,
}

impl Item {
    /// Whether this item is a folder.
    pub fn folder(&self) -> bool {
        self.is_folder == 1
    }

    /// Whether this item lives in the crypto namespace.
    pub fn encrypted(&self) -> bool {
        self.crypto == 1
    }

    /// Numeric part of the uid (`"folder-123"` / `"file-123"` → `123`).
    pub fn numeric_id(&self) -> Option<u64> {
        self.uid.rsplit('-').next()?.parse().ok()
    }
}

/// Which collection tree to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Cloud,
    Crypto,
    Trash,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Cloud => "cloud",
            CollectionKind::Crypto => "crypto",
            CollectionKind::Trash => "trash",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub results: i64,
    #[serde(default)]
    pub data: Vec<Item>,
}

/// The authenticated user's profile from `/user-data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "fullName")]
    pub full_name: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub level_id: i64,
    #[serde(default)]
    pub level_type: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub bearer_token: bool,
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub token: String,
}

/// A `pow-new` challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct PowChallenge {
    pub challenge: String,
    #[serde(rename = "difficultyBits")]
    pub difficulty_bits: u32,
    #[serde(default)]
    pub exp: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTimeResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub time_unix: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoFileserverList {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub upload_endpoints: Vec<String>,
}

/// One resolved download target from `/download-multi`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadUrl {
    pub id: u64,
    pub filename: String,
    pub filesize: u64,
    pub folder_id: u64,
    pub moddate: u64,
    pub path: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadMultiResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub urls: Vec<DownloadUrl>,
}

/// The created object inside an upload response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadFileObj {
    pub id: u64,
    pub uid: String,
    pub is_folder: i64,
    pub filename: String,
    #[serde(rename = "filename_raw")]
    pub filename_raw: String,
    pub filesize: u64,
    pub moddate: u64,
    pub file_type: String,
    pub extension: String,
    pub crypto: i64,
    pub padding: i64,
    pub folder_id: u64,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadResponse {
    pub error: bool,
    pub message: String,
    pub id: u64,
    pub time: u64,
    /// Semantics undocumented; parsed but never interpreted.
    pub overwrite: bool,
    pub folder_id: u64,
    pub file_obj: UploadFileObj,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileVersion {
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub filesize: i64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionListResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub versions: Vec<FileVersion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageStats {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub used_human: String,
    #[serde(default)]
    pub max: u64,
    #[serde(default)]
    pub max_human: String,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub free_human: String,
    #[serde(default)]
    pub pcent: i64,
    #[serde(default)]
    pub pcent_raw: f64,
}

/// Folder metadata from `/folder-properties`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FolderProperties {
    pub error: bool,
    pub filename: String,
    pub files: i64,
    pub folders: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoAuthResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub hash: String,
}

/// Minimal response for operations that only return a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_parses_collection_entry() {
        let json = r#"{
            "id": 3351995902, "uid": "file-3351995902", "filename": "notes.txt",
            "parentId": 0, "moddate": 1700000000, "isFolder": 0,
            "filesize": 2080, "extension": "txt", "fave": 0, "isPublic": 0,
            "color": null, "isOwner": 1, "isShared": 0, "fileType": "text",
            "crypto": 1, "thumbnail": null
        }"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.uid, "file-3351995902");
        assert!(!item.folder());
        assert!(item.encrypted());
        assert_eq!(item.numeric_id(), Some(3351995902));
    }

    #[test]
    fn test_item_tolerates_missing_fields() {
        let item: Item = serde_json::from_str(r#"{"uid":"folder-7","isFolder":1}"#).unwrap();
        assert!(item.folder());
        assert_eq!(item.numeric_id(), Some(7));
    }

    #[test]
    fn test_envelope_detects_auth_expiry() {
        let env: ApiEnvelope =
            serde_json::from_str(r#"{"error":true,"code":1001,"message":"expired"}"#).unwrap();
        assert!(env.error);
        assert_eq!(env.code, Some(1001));
    }

    #[test]
    fn test_pow_challenge_field_names() {
        let ch: PowChallenge = serde_json::from_str(
            r#"{"challenge":"AAAA","difficultyBits":12,"exp":1700000000,"scope":"login","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(ch.difficulty_bits, 12);
        assert_eq!(ch.scope, "login");
    }
}
