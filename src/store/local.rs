use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{BoxFuture, PledgeOutcome, RecordStore, StoreError};
use crate::domain::{
    Fund, GalleryImage, GuestbookEntry, NewGalleryImage, NewGuestbookEntry, NewPledge, Pledge,
    RecordKind, default_funds, sort_newest_first,
};

pub const SCHEMA_VERSION: u32 = 1;
pub const SNAPSHOT_FILE_NAME: &str = "local.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub schema_version: u32,
    #[serde(default)]
    pub next_id: i64,
    #[serde(default)]
    pub funds: Vec<Fund>,
    #[serde(default)]
    pub pledges: Vec<Pledge>,
    /// Newest insertion first.
    #[serde(default)]
    pub guestbook: Vec<GuestbookEntry>,
    /// Newest insertion first.
    #[serde(default)]
    pub gallery: Vec<GalleryImage>,
}

impl LocalSnapshot {
    pub fn seeded() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_id: 1,
            funds: default_funds(),
            pledges: Vec::new(),
            guestbook: Vec::new(),
            gallery: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }
}

/// Session-scoped fallback store. Lives in process memory and, when opened on
/// a data dir, mirrors every write to `local.json`. Nothing written here is
/// ever pushed to a durable backend.
pub struct LocalStore {
    snapshot_path: Option<PathBuf>,
    state: Mutex<LocalSnapshot>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            snapshot_path: None,
            state: Mutex::new(LocalSnapshot::seeded()),
        }
    }

    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let snapshot_path = data_dir.join(SNAPSHOT_FILE_NAME);
        let (snapshot, is_new) = if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)?;
            let snapshot: LocalSnapshot = serde_json::from_slice(&bytes)?;
            if snapshot.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: snapshot.schema_version,
                });
            }
            (snapshot, false)
        } else {
            (LocalSnapshot::seeded(), true)
        };

        if is_new {
            save_snapshot(&snapshot_path, &snapshot)?;
        }
        debug!(path = %snapshot_path.display(), is_new, "opened local snapshot store");

        Ok(Self {
            snapshot_path: Some(snapshot_path),
            state: Mutex::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> LocalSnapshot {
        self.state.lock().await.clone()
    }

    /// Writes on the blocking pool; the caller keeps the state lock so
    /// snapshots land on disk in commit order.
    async fn persist(&self, snapshot: &LocalSnapshot) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        let bytes = encode_snapshot(snapshot)?;
        tokio::task::spawn_blocking(move || replace_file(&path, &bytes))
            .await
            .map_err(|e| StoreError::unavailable("local", e))??;
        Ok(())
    }
}

impl RecordStore for LocalStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn list_funds(&self) -> BoxFuture<'_, Result<Vec<Fund>, StoreError>> {
        Box::pin(async move { Ok(self.state.lock().await.funds.clone()) })
    }

    fn get_fund(&self, fund_id: &str) -> BoxFuture<'_, Result<Option<Fund>, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.funds.iter().find(|f| f.fund_id == fund_id).cloned())
        })
    }

    fn apply_pledge(
        &self,
        fund_id: &str,
        pledge: NewPledge,
    ) -> BoxFuture<'_, Result<PledgeOutcome, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();

            let fund = next
                .funds
                .iter_mut()
                .find(|f| f.fund_id == fund_id)
                .ok_or_else(|| StoreError::NotFound {
                    kind: RecordKind::Fund,
                    key: fund_id.clone(),
                })?;
            fund.current = fund.current.checked_add(pledge.amount).ok_or_else(|| {
                crate::domain::DomainError::InvalidAmount {
                    reason: "fund total would overflow".to_string(),
                }
            })?;
            let fund = fund.clone();

            let id = next.allocate_id();
            let pledge = Pledge {
                id,
                fund_id,
                amount: pledge.amount,
                name: pledge.name,
                message: pledge.message,
                created_at: pledge.created_at,
            };
            next.pledges.push(pledge.clone());

            // Commit only once the snapshot made it to disk.
            self.persist(&next).await?;
            *state = next;
            Ok(PledgeOutcome { fund, pledge })
        })
    }

    fn list_guestbook(&self) -> BoxFuture<'_, Result<Vec<GuestbookEntry>, StoreError>> {
        Box::pin(async move {
            let mut entries = self.state.lock().await.guestbook.clone();
            sort_newest_first(&mut entries, |e| e.created_at.as_str());
            Ok(entries)
        })
    }

    fn create_guestbook_entry(
        &self,
        entry: NewGuestbookEntry,
    ) -> BoxFuture<'_, Result<GuestbookEntry, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let entry = GuestbookEntry {
                id: next.allocate_id(),
                name: entry.name,
                message: entry.message,
                image_url: entry.image_url,
                image_alt: entry.image_alt,
                created_at: entry.created_at,
            };
            next.guestbook.insert(0, entry.clone());
            self.persist(&next).await?;
            *state = next;
            Ok(entry)
        })
    }

    fn list_gallery(&self) -> BoxFuture<'_, Result<Vec<GalleryImage>, StoreError>> {
        Box::pin(async move {
            let mut images = self.state.lock().await.gallery.clone();
            sort_newest_first(&mut images, |i| i.created_at.as_str());
            Ok(images)
        })
    }

    fn create_gallery_image(
        &self,
        image: NewGalleryImage,
    ) -> BoxFuture<'_, Result<GalleryImage, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let image = GalleryImage {
                id: next.allocate_id(),
                src: image.src,
                caption: image.caption,
                tags: image.tags,
                created_at: image.created_at,
            };
            next.gallery.insert(0, image.clone());
            self.persist(&next).await?;
            *state = next;
            Ok(image)
        })
    }

    fn list_pledges(&self) -> BoxFuture<'_, Result<Vec<Pledge>, StoreError>> {
        Box::pin(async move { Ok(self.state.lock().await.pledges.clone()) })
    }
}

fn encode_snapshot(snapshot: &LocalSnapshot) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(snapshot)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn save_snapshot(path: &Path, snapshot: &LocalSnapshot) -> Result<(), StoreError> {
    replace_file(path, &encode_snapshot(snapshot)?)?;
    Ok(())
}

/// Write to a sibling temp file, then rename over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    // Windows refuses to rename onto an existing file.
    if cfg!(windows) && path.exists() {
        fs::remove_file(path)?;
    }
    fs::rename(&tmp_path, path)
}
