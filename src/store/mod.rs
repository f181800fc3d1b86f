//! Row persistence for funds, pledges, guestbook entries and gallery images.
//!
//! Three interchangeable backends sit behind [`RecordStore`]:
//! - [`local::LocalStore`]: session-scoped fallback, a JSON snapshot on disk.
//! - [`sqlite::SqliteStore`]: durable tables with an atomic fund increment.
//! - [`remote::RemoteStore`]: durable, reached over HTTP with a bounded timeout.

use std::{future::Future, io, pin::Pin};

use crate::domain::{
    DomainError, Fund, GalleryImage, GuestbookEntry, NewGalleryImage, NewGuestbookEntry,
    NewPledge, Pledge, Record, RecordKind,
};

pub mod local;
pub mod remote;
pub mod sqlite;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum StoreError {
    Domain(DomainError),
    NotFound { kind: RecordKind, key: String },
    Unavailable { backend: &'static str, reason: String },
    /// An upstream record API refused the request (4xx other than 404).
    Rejected { backend: &'static str, status: u16, reason: String },
    Unsupported { backend: &'static str, kind: RecordKind },
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Sqlite(rusqlite::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl StoreError {
    pub fn unavailable(backend: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// True when the failure is about the request, not the backend.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Domain(_) | Self::NotFound { .. } | Self::Rejected { .. }
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::NotFound { kind, key } => write!(f, "{kind} not found: {key}"),
            Self::Unavailable { backend, reason } => {
                write!(f, "{backend} backend unavailable: {reason}")
            }
            Self::Rejected {
                backend,
                status,
                reason,
            } => write!(f, "{backend} backend rejected request ({status}): {reason}"),
            Self::Unsupported { backend, kind } => {
                write!(f, "{backend} backend does not list {kind} records")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::NotFound { .. }
            | Self::Unavailable { .. }
            | Self::Rejected { .. }
            | Self::Unsupported { .. }
            | Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Result of the atomic pledge unit: the fund after the increment and the
/// pledge row that was appended with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PledgeOutcome {
    pub fund: Fund,
    pub pledge: Pledge,
}

pub trait RecordStore: Send + Sync + 'static {
    /// Short backend label used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Whether image payloads written here should be ingested into the local
    /// blob store first. Upstream record APIs own their blobs and receive
    /// inline payloads untouched.
    fn stores_blob_keys(&self) -> bool {
        true
    }

    fn list_funds(&self) -> BoxFuture<'_, Result<Vec<Fund>, StoreError>>;

    fn get_fund(&self, fund_id: &str) -> BoxFuture<'_, Result<Option<Fund>, StoreError>>;

    /// Increments `fund.current` by `pledge.amount` and appends the pledge,
    /// both or neither. Unknown funds yield `NotFound` with nothing written.
    fn apply_pledge(
        &self,
        fund_id: &str,
        pledge: NewPledge,
    ) -> BoxFuture<'_, Result<PledgeOutcome, StoreError>>;

    /// Newest first.
    fn list_guestbook(&self) -> BoxFuture<'_, Result<Vec<GuestbookEntry>, StoreError>>;

    fn create_guestbook_entry(
        &self,
        entry: NewGuestbookEntry,
    ) -> BoxFuture<'_, Result<GuestbookEntry, StoreError>>;

    /// Newest first.
    fn list_gallery(&self) -> BoxFuture<'_, Result<Vec<GalleryImage>, StoreError>>;

    fn create_gallery_image(
        &self,
        image: NewGalleryImage,
    ) -> BoxFuture<'_, Result<GalleryImage, StoreError>>;

    fn list_pledges(&self) -> BoxFuture<'_, Result<Vec<Pledge>, StoreError>> {
        let backend = self.backend();
        Box::pin(async move {
            Err(StoreError::Unsupported {
                backend,
                kind: RecordKind::Pledge,
            })
        })
    }

    fn list(&self, kind: RecordKind) -> BoxFuture<'_, Result<Vec<Record>, StoreError>> {
        Box::pin(async move {
            let records: Vec<Record> = match kind {
                RecordKind::Fund => self
                    .list_funds()
                    .await?
                    .into_iter()
                    .map(Record::Fund)
                    .collect(),
                RecordKind::Pledge => self
                    .list_pledges()
                    .await?
                    .into_iter()
                    .map(Record::Pledge)
                    .collect(),
                RecordKind::GuestbookEntry => self
                    .list_guestbook()
                    .await?
                    .into_iter()
                    .map(Record::GuestbookEntry)
                    .collect(),
                RecordKind::GalleryImage => self
                    .list_gallery()
                    .await?
                    .into_iter()
                    .map(Record::GalleryImage)
                    .collect(),
            };
            Ok(records)
        })
    }
}
