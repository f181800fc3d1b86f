//! Image payload storage.
//!
//! Records never hold raw bytes, only a [`BlobRef`]: an inline data URL, a key
//! into the disk store (`guestbook/...`, `gallery/...`), or an external URL left
//! as written. Disk keys resolve to short-lived signed URLs on every read.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::{
    id::{is_ulid_string, new_ulid_string},
    store::BoxFuture,
};

/// Uploads must stay strictly below 5 MiB.
pub const MAX_BLOB_BYTES: usize = 5 * 1024 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_FILENAME_CHARS: usize = 64;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum BlobError {
    PayloadTooLarge { size: usize, limit: usize },
    InvalidDataUrl { reason: &'static str },
    Io(io::Error),
    NotFound { key: String },
    InvalidSignature,
    Expired,
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "image is {size} bytes; uploads must be under {limit} bytes")
            }
            Self::InvalidDataUrl { reason } => write!(f, "invalid data url: {reason}"),
            Self::Io(e) => write!(f, "blob io error: {e}"),
            Self::NotFound { key } => write!(f, "blob not found: {key}"),
            Self::InvalidSignature => write!(f, "blob url signature is invalid"),
            Self::Expired => write!(f, "blob url is expired"),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BlobError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobScope {
    Guestbook,
    Gallery,
}

impl BlobScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guestbook => "guestbook",
            Self::Gallery => "gallery",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "guestbook" => Some(Self::Guestbook),
            "gallery" => Some(Self::Gallery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRef {
    Inline(String),
    Stored { key: String },
    External(String),
}

impl BlobRef {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("data:") {
            return Self::Inline(raw.to_string());
        }
        match raw.split_once('/') {
            Some((scope, rest)) if BlobScope::from_str(scope).is_some() && !rest.is_empty() => {
                Self::Stored {
                    key: raw.to_string(),
                }
            }
            _ => Self::External(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline(s) | Self::External(s) => s,
            Self::Stored { key } => key,
        }
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub fn check_size(size: usize) -> Result<(), BlobError> {
    if size >= MAX_BLOB_BYTES {
        return Err(BlobError::PayloadTooLarge {
            size,
            limit: MAX_BLOB_BYTES,
        });
    }
    Ok(())
}

/// Decodes a `data:<type>;base64,<payload>` URL. The decoded length is checked
/// from the encoded length first so oversized payloads are never decoded.
pub fn parse_data_url(raw: &str) -> Result<DataUrl, BlobError> {
    let rest = raw.strip_prefix("data:").ok_or(BlobError::InvalidDataUrl {
        reason: "missing data: scheme",
    })?;
    let (meta, payload) = rest.split_once(',').ok_or(BlobError::InvalidDataUrl {
        reason: "missing comma",
    })?;
    let content_type = meta
        .strip_suffix(";base64")
        .ok_or(BlobError::InvalidDataUrl {
            reason: "only base64 payloads are supported",
        })?;
    let content_type = if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        content_type.to_string()
    };

    let padding = payload.bytes().rev().take_while(|b| *b == b'=').count().min(2);
    let estimated = (payload.len() / 4 * 3 + (payload.len() % 4) * 3 / 4).saturating_sub(padding);
    check_size(estimated)?;

    let bytes = STANDARD
        .decode(payload.as_bytes())
        .map_err(|_| BlobError::InvalidDataUrl {
            reason: "payload is not valid base64",
        })?;
    check_size(bytes.len())?;

    Ok(DataUrl {
        content_type,
        bytes,
    })
}

pub fn to_data_url(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(bytes))
}

pub trait BlobStore: Send + Sync + 'static {
    fn backend(&self) -> &'static str;

    fn put(
        &self,
        bytes: Vec<u8>,
        content_type: String,
        filename_hint: Option<String>,
        scope: BlobScope,
    ) -> BoxFuture<'_, Result<BlobRef, BlobError>>;

    /// Turns a reference into something a browser can load.
    fn resolve(&self, reference: &BlobRef) -> String;
}

/// Moves an inline payload into `store` and returns the reference to record.
/// Non-inline references pass through unchanged.
pub async fn ingest(
    store: &dyn BlobStore,
    raw: &str,
    filename_hint: Option<String>,
    scope: BlobScope,
) -> Result<String, BlobError> {
    match BlobRef::parse(raw) {
        BlobRef::Inline(url) => {
            let decoded = parse_data_url(&url)?;
            let size = decoded.bytes.len();
            let stored = store
                .put(decoded.bytes, decoded.content_type, filename_hint, scope)
                .await?;
            debug!(backend = store.backend(), scope = scope.as_str(), size, "image ingested");
            Ok(stored.to_string())
        }
        other => Ok(other.to_string()),
    }
}

/// Size check for payloads forwarded elsewhere untouched.
pub fn check_reference(raw: &str) -> Result<(), BlobError> {
    match BlobRef::parse(raw) {
        BlobRef::Inline(url) => parse_data_url(&url).map(|_| ()),
        _ => Ok(()),
    }
}

/// Keeps uploads as data URLs inside the record itself.
#[derive(Debug, Default, Clone)]
pub struct InlineBlobStore;

impl BlobStore for InlineBlobStore {
    fn backend(&self) -> &'static str {
        "inline"
    }

    fn put(
        &self,
        bytes: Vec<u8>,
        content_type: String,
        _filename_hint: Option<String>,
        _scope: BlobScope,
    ) -> BoxFuture<'_, Result<BlobRef, BlobError>> {
        Box::pin(async move {
            check_size(bytes.len())?;
            Ok(BlobRef::Inline(to_data_url(&content_type, &bytes)))
        })
    }

    fn resolve(&self, reference: &BlobRef) -> String {
        reference.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobMeta {
    content_type: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// HMAC-SHA256 over `<key>\n<expires>`, base64url without padding.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: Option<&str>) -> Self {
        match secret.filter(|s| !s.is_empty()) {
            Some(s) => Self {
                secret: s.as_bytes().to_vec(),
            },
            None => {
                let mut secret = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut secret);
                Self { secret }
            }
        }
    }

    fn mac(&self, key: &str, expires: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    pub fn sign(&self, key: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(key, expires).finalize().into_bytes())
    }

    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig.as_bytes())
            .map_err(|_| BlobError::InvalidSignature)?;
        self.mac(key, expires)
            .verify_slice(&sig_bytes)
            .map_err(|_| BlobError::InvalidSignature)?;
        if now.timestamp() > expires {
            return Err(BlobError::Expired);
        }
        Ok(())
    }
}

/// Files under `<data_dir>/blobs/<scope>/`, each with a `.meta.json` sidecar.
pub struct DiskBlobStore {
    root: PathBuf,
    url_base: String,
    signer: UrlSigner,
    ttl: Duration,
}

impl DiskBlobStore {
    /// `url_base` is prepended to `/blobs/<key>`: the public origin (possibly
    /// empty) followed by the API prefix.
    pub fn new(data_dir: &Path, url_base: String, signer: UrlSigner, ttl: Duration) -> Self {
        Self {
            root: data_dir.join("blobs"),
            url_base: url_base.trim_end_matches('/').to_string(),
            signer,
            ttl,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub fn signed_url(&self, key: &str, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + self.ttl.as_secs() as i64;
        let sig = self.signer.sign(key, expires);
        format!("{}/blobs/{key}?expires={expires}&sig={sig}", self.url_base)
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let (scope, file) = key.split_once('/')?;
        let scope = BlobScope::from_str(scope)?;
        let valid_name = file.len() > 27
            && file.is_char_boundary(26)
            && is_ulid_string(&file[..26])
            && file.as_bytes()[26] == b'-'
            && file.chars().all(is_filename_char);
        valid_name.then(|| self.root.join(scope.as_str()).join(file))
    }

    pub async fn read(&self, key: &str) -> Result<StoredBlob, BlobError> {
        let not_found = || BlobError::NotFound {
            key: key.to_string(),
        };
        let path = self.path_for(key).ok_or_else(not_found)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let content_type = match tokio::fs::read(meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice::<BlobMeta>(&raw)
                .map(|m| m.content_type)
                .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string()),
            Err(_) => DEFAULT_CONTENT_TYPE.to_string(),
        };
        Ok(StoredBlob {
            content_type,
            bytes,
        })
    }
}

impl BlobStore for DiskBlobStore {
    fn backend(&self) -> &'static str {
        "disk"
    }

    fn put(
        &self,
        bytes: Vec<u8>,
        content_type: String,
        filename_hint: Option<String>,
        scope: BlobScope,
    ) -> BoxFuture<'_, Result<BlobRef, BlobError>> {
        Box::pin(async move {
            check_size(bytes.len())?;
            let file = format!(
                "{}-{}",
                new_ulid_string(),
                sanitize_filename(filename_hint.as_deref().unwrap_or(""))
            );
            let dir = self.root.join(scope.as_str());
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(&file);

            let meta = BlobMeta {
                content_type,
                filename: filename_hint,
            };
            let meta_json = serde_json::to_vec(&meta)
                .map_err(|e| BlobError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            tokio::fs::write(meta_path(&path), meta_json).await?;
            write_atomic(&path, &bytes).await?;

            Ok(BlobRef::Stored {
                key: format!("{}/{file}", scope.as_str()),
            })
        })
    }

    fn resolve(&self, reference: &BlobRef) -> String {
        match reference {
            BlobRef::Stored { key } => self.signed_url(key, Utc::now()),
            other => other.to_string(),
        }
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn is_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn sanitize_filename(hint: &str) -> String {
    let name: String = hint
        .chars()
        .map(|c| if is_filename_char(c) { c } else { '_' })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let name = name.trim_matches('.');
    if name.is_empty() {
        "upload".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn disk(dir: &Path) -> DiskBlobStore {
        DiskBlobStore::new(
            dir,
            "/api".to_string(),
            UrlSigner::new(Some("test-secret")),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn reference_kinds() {
        assert!(matches!(
            BlobRef::parse("data:image/png;base64,AA=="),
            BlobRef::Inline(_)
        ));
        assert!(matches!(
            BlobRef::parse("gallery/01J0000000000000000000000-a.png"),
            BlobRef::Stored { .. }
        ));
        assert!(matches!(
            BlobRef::parse("src/media/images/gallery/1.jpg"),
            BlobRef::External(_)
        ));
        assert!(matches!(
            BlobRef::parse("https://example.com/a.png"),
            BlobRef::External(_)
        ));
    }

    #[test]
    fn size_limit_is_exclusive() {
        assert!(check_size(MAX_BLOB_BYTES - 1).is_ok());
        assert!(matches!(
            check_size(MAX_BLOB_BYTES),
            Err(BlobError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn data_url_limit_matches_decoded_size() {
        let ok = to_data_url("image/png", &vec![7u8; MAX_BLOB_BYTES - 1]);
        let decoded = parse_data_url(&ok).unwrap();
        assert_eq!(decoded.bytes.len(), MAX_BLOB_BYTES - 1);
        assert_eq!(decoded.content_type, "image/png");

        let too_big = to_data_url("image/png", &vec![7u8; MAX_BLOB_BYTES]);
        assert!(matches!(
            parse_data_url(&too_big),
            Err(BlobError::PayloadTooLarge { size, .. }) if size == MAX_BLOB_BYTES
        ));
    }

    #[test]
    fn data_url_rejects_malformed_input() {
        for raw in [
            "data:image/png,plain",
            "data:image/png;base64",
            "data:image/png;base64,@@@@",
        ] {
            assert!(
                matches!(parse_data_url(raw), Err(BlobError::InvalidDataUrl { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn sanitizes_filename_hints() {
        assert_eq!(sanitize_filename("my ghost.png"), "my_ghost.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename(&"a".repeat(200)).len(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn signature_checks_key_and_expiry() {
        let signer = UrlSigner::new(Some("k"));
        let now = Utc.with_ymd_and_hms(2025, 10, 31, 19, 0, 0).unwrap();
        let expires = now.timestamp() + 60;
        let sig = signer.sign("gallery/x", expires);

        assert!(signer.verify("gallery/x", expires, &sig, now).is_ok());
        assert!(matches!(
            signer.verify("gallery/y", expires, &sig, now),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify("gallery/x", expires + 1, &sig, now),
            Err(BlobError::InvalidSignature)
        ));
        let later = now + chrono::Duration::seconds(61);
        assert!(matches!(
            signer.verify("gallery/x", expires, &sig, later),
            Err(BlobError::Expired)
        ));
        assert!(matches!(
            UrlSigner::new(None).verify("gallery/x", expires, &sig, now),
            Err(BlobError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn disk_store_round_trips_through_signed_url() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk(tmp.path());
        let url = to_data_url("image/jpeg", b"jpeg-bytes");

        let key = ingest(&store, &url, Some("Porch Party.jpg".to_string()), BlobScope::Gallery)
            .await
            .unwrap();
        assert!(key.starts_with("gallery/"));
        assert!(key.ends_with("-Porch_Party.jpg"));

        let resolved = store.resolve(&BlobRef::parse(&key));
        assert!(resolved.starts_with(&format!("/api/blobs/{key}?expires=")));

        let blob = store.read(&key).await.unwrap();
        assert_eq!(blob.bytes, b"jpeg-bytes".to_vec());
        assert_eq!(blob.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn disk_store_rejects_unknown_or_traversing_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk(tmp.path());
        for key in [
            "gallery/../local.json",
            "other/01J0000000000000000000000-a.png",
            "guestbook/not-a-ulid",
        ] {
            assert!(
                matches!(store.read(key).await, Err(BlobError::NotFound { .. })),
                "{key}"
            );
        }
        let missing = format!("guestbook/{}-a.png", new_ulid_string());
        assert!(matches!(
            store.read(&missing).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn external_references_pass_through() {
        let store = InlineBlobStore;
        let raw = "src/media/images/gallery/porch.jpg";
        assert_eq!(
            ingest(&store, raw, None, BlobScope::Gallery).await.unwrap(),
            raw
        );
        assert_eq!(store.resolve(&BlobRef::parse(raw)), raw);
    }
}
