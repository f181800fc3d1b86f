//! Decides, per record kind, whether a read or write goes to the durable
//! backend, the local fallback, or both, and merges the results.

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    blob::{self, BlobError, BlobRef, BlobScope, BlobStore},
    domain::{
        self, DomainError, Fund, GalleryImage, GalleryInput, GuestbookEntry, GuestbookInput,
        RecordKind,
    },
    store::{BoxFuture, RecordStore, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SyncMode {
    /// Everything stays in the local snapshot; the durable backend is never contacted.
    LocalOnly,
    /// The durable backend is the source of truth; reads fall back to local.
    RemoteRequired,
    /// As `remote-required`, but gallery reads merge in the static seed manifest.
    RemoteWithSeed,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "local-only",
            Self::RemoteRequired => "remote-required",
            Self::RemoteWithSeed => "remote-with-seed",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a read. `Unavailable` means no backend answered, which is not
/// the same as an empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    Fresh { source: &'static str, items: Vec<T> },
    Unavailable,
}

impl<T> Loaded<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Self::Fresh { items, .. } => items,
            Self::Unavailable => Vec::new(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    fn map_items(self, f: impl FnOnce(Vec<T>) -> Vec<T>) -> Self {
        match self {
            Self::Fresh { source, items } => Self::Fresh {
                source,
                items: f(items),
            },
            Self::Unavailable => Self::Unavailable,
        }
    }
}

#[derive(Debug)]
pub enum SyncError {
    Domain(DomainError),
    Store(StoreError),
    Blob(BlobError),
}

impl SyncError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable { .. }))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Blob(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Blob(e) => Some(e),
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(e) => Self::Domain(e),
            other => Self::Store(other),
        }
    }
}

impl From<BlobError> for SyncError {
    fn from(value: BlobError) -> Self {
        Self::Blob(value)
    }
}

type ListFn<T> = for<'a> fn(&'a dyn RecordStore) -> BoxFuture<'a, Result<Vec<T>, StoreError>>;

pub struct Reconciler {
    mode: SyncMode,
    durable: Option<Arc<dyn RecordStore>>,
    fallback: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    seed_manifest: Option<PathBuf>,
}

impl Reconciler {
    /// Without a durable backend every mode behaves as `local-only`.
    pub fn new(
        mode: SyncMode,
        durable: Option<Arc<dyn RecordStore>>,
        fallback: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            mode,
            durable,
            fallback,
            blobs,
            seed_manifest: None,
        }
    }

    pub fn with_seed_manifest(mut self, path: Option<PathBuf>) -> Self {
        self.seed_manifest = path;
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    fn durable(&self) -> Option<&dyn RecordStore> {
        match self.mode {
            SyncMode::LocalOnly => None,
            SyncMode::RemoteRequired | SyncMode::RemoteWithSeed => self.durable.as_deref(),
        }
    }

    /// Backend that receives creates and pledges. Writes never fall back.
    pub fn write_target(&self) -> &dyn RecordStore {
        match self.durable() {
            Some(durable) => durable,
            None => self.fallback.as_ref(),
        }
    }

    async fn read_with_fallback<T>(&self, kind: RecordKind, list: ListFn<T>) -> Loaded<T> {
        if let Some(durable) = self.durable() {
            match list(durable).await {
                Ok(items) => {
                    return Loaded::Fresh {
                        source: durable.backend(),
                        items,
                    };
                }
                Err(error) => warn!(
                    backend = durable.backend(),
                    %kind,
                    %error,
                    "durable read failed; serving local fallback"
                ),
            }
        }

        let fallback: &dyn RecordStore = self.fallback.as_ref();
        match list(fallback).await {
            Ok(items) => Loaded::Fresh {
                source: fallback.backend(),
                items,
            },
            Err(error) => {
                warn!(backend = fallback.backend(), %kind, %error, "fallback read failed");
                Loaded::Unavailable
            }
        }
    }

    pub async fn load_funds(&self) -> Loaded<Fund> {
        self.read_with_fallback(RecordKind::Fund, |s| s.list_funds())
            .await
            .map_items(|funds| funds.into_iter().map(|f| self.resolve_fund(f)).collect())
    }

    pub async fn load_guestbook(&self) -> Loaded<GuestbookEntry> {
        self.read_with_fallback(RecordKind::GuestbookEntry, |s| s.list_guestbook())
            .await
            .map_items(|entries| {
                entries
                    .into_iter()
                    .map(|e| self.resolve_guestbook(e))
                    .collect()
            })
    }

    pub async fn load_gallery(&self) -> Loaded<GalleryImage> {
        let loaded = match self.mode {
            SyncMode::RemoteWithSeed => self.load_gallery_with_seed().await,
            SyncMode::LocalOnly | SyncMode::RemoteRequired => {
                self.read_with_fallback(RecordKind::GalleryImage, |s| s.list_gallery())
                    .await
            }
        };
        loaded.map_items(|images| {
            images
                .into_iter()
                .map(|i| self.resolve_gallery(i))
                .collect()
        })
    }

    async fn load_gallery_with_seed(&self) -> Loaded<GalleryImage> {
        // Uploads live wherever writes go, so read the seed alongside that backend.
        let target = self.write_target();
        let (seed, stored) =
            futures_util::future::join(self.load_seed(), target.list_gallery()).await;

        match stored {
            Ok(stored) => Loaded::Fresh {
                source: target.backend(),
                items: merge_gallery(stored, seed),
            },
            Err(error) => {
                warn!(
                    backend = target.backend(),
                    %error,
                    "gallery read failed; serving seed manifest only"
                );
                Loaded::Fresh {
                    source: "seed",
                    items: seed,
                }
            }
        }
    }

    async fn load_seed(&self) -> Vec<GalleryImage> {
        let Some(path) = &self.seed_manifest else {
            return Vec::new();
        };
        match load_seed_manifest(path).await {
            Ok(images) => images,
            Err(error) => {
                warn!(path = %path.display(), %error, "gallery seed manifest unreadable");
                Vec::new()
            }
        }
    }

    pub async fn submit_guestbook(
        &self,
        input: GuestbookInput,
    ) -> Result<Vec<GuestbookEntry>, SyncError> {
        let mut entry = domain::validate_guestbook_input(input, &domain::now_rfc3339())?;
        let target = self.write_target();

        if let Some(image_url) = entry.image_url.take() {
            let hint = entry.image_alt.clone();
            entry.image_url = Some(self.ingest(target, &image_url, hint, BlobScope::Guestbook).await?);
        }

        let created = target.create_guestbook_entry(entry).await?;
        info!(backend = target.backend(), id = created.id, "guestbook entry created");

        Ok(self.load_guestbook().await.into_items())
    }

    pub async fn submit_gallery(&self, input: GalleryInput) -> Result<Vec<GalleryImage>, SyncError> {
        let mut image = domain::validate_gallery_input(input, &domain::now_rfc3339())?;
        let target = self.write_target();

        image.src = self
            .ingest(target, &image.src, image.caption.clone(), BlobScope::Gallery)
            .await?;

        let created = target.create_gallery_image(image).await?;
        info!(backend = target.backend(), id = created.id, "gallery image created");

        Ok(self.load_gallery().await.into_items())
    }

    async fn ingest(
        &self,
        target: &dyn RecordStore,
        raw: &str,
        hint: Option<String>,
        scope: BlobScope,
    ) -> Result<String, BlobError> {
        if target.stores_blob_keys() {
            blob::ingest(self.blobs.as_ref(), raw, hint, scope).await
        } else {
            blob::check_reference(raw)?;
            debug!(backend = target.backend(), "forwarding image payload untouched");
            Ok(raw.to_string())
        }
    }

    fn resolve(&self, raw: &str) -> String {
        self.blobs.resolve(&BlobRef::parse(raw))
    }

    pub fn resolve_fund(&self, mut fund: Fund) -> Fund {
        fund.image = fund.image.map(|i| self.resolve(&i));
        fund
    }

    fn resolve_guestbook(&self, mut entry: GuestbookEntry) -> GuestbookEntry {
        entry.image_url = entry.image_url.map(|u| self.resolve(&u));
        entry
    }

    fn resolve_gallery(&self, mut image: GalleryImage) -> GalleryImage {
        image.src = self.resolve(&image.src);
        image
    }
}

/// Remote records first, then seed records, stable-sorted newest first, so
/// ties keep remote ahead of seed.
pub fn merge_gallery(remote: Vec<GalleryImage>, seed: Vec<GalleryImage>) -> Vec<GalleryImage> {
    let mut merged = remote;
    merged.extend(seed);
    domain::sort_newest_first(&mut merged, |i| i.created_at.as_str());
    merged
}

#[derive(Debug, Deserialize)]
struct SeedImage {
    src: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
}

/// Reads the static gallery manifest. Entries get ids `-1, -2, ...` and, when
/// undated, the Unix epoch so stored uploads always sort ahead of them.
pub async fn load_seed_manifest(path: &std::path::Path) -> Result<Vec<GalleryImage>, StoreError> {
    let raw = tokio::fs::read(path).await?;
    let entries: Vec<SeedImage> = serde_json::from_slice(&raw)?;
    let epoch = domain::format_timestamp(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, seed)| GalleryImage {
            id: -(i as i64 + 1),
            src: seed.src,
            caption: domain::normalize_optional(seed.caption),
            tags: seed.tags,
            created_at: seed
                .created_at
                .and_then(|at| domain::parse_timestamp(&at))
                .map(domain::format_timestamp)
                .unwrap_or_else(|| epoch.clone()),
        })
        .collect())
}
