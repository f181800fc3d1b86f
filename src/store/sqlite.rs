use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::{Connection, OptionalExtension as _, Row, params, types::Type};
use tracing::{debug, info};

use super::{BoxFuture, PledgeOutcome, RecordStore, StoreError};
use crate::domain::{
    DomainError, Fund, GalleryImage, GuestbookEntry, NewGalleryImage, NewGuestbookEntry, NewPledge,
    Pledge, RecordKind, default_funds,
};

const BACKEND: &str = "sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS funds (
    fund_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    current INTEGER NOT NULL DEFAULT 0 CHECK (current >= 0),
    image TEXT
);
CREATE TABLE IF NOT EXISTS pledges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fund_id TEXT NOT NULL REFERENCES funds(fund_id),
    amount INTEGER NOT NULL CHECK (amount > 0),
    name TEXT,
    message TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS guestbook_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    message TEXT NOT NULL,
    image_url TEXT,
    image_alt TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS gallery_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    src TEXT NOT NULL,
    caption TEXT,
    tags TEXT,
    created_at TEXT NOT NULL
);
";

/// A fund whose stored total disagrees with the sum of its pledge log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMismatch {
    pub fund_id: String,
    pub current: i64,
    pub pledged: i64,
}

/// Durable backend. One connection behind a mutex; every call runs on the
/// blocking pool so request handlers never block the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening sqlite database");

        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("opening in-memory sqlite database");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(SCHEMA)?;

        let seeded = seed_funds(&conn)?;
        if seeded > 0 {
            info!(count = seeded, "seeded default funds");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::unavailable(BACKEND, "connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::unavailable(BACKEND, e))?
    }

    pub async fn ledger_mismatches(&self) -> Result<Vec<LedgerMismatch>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.fund_id, f.current, COALESCE(SUM(p.amount), 0) AS pledged
                 FROM funds f LEFT JOIN pledges p ON p.fund_id = f.fund_id
                 GROUP BY f.fund_id
                 HAVING f.current != pledged
                 ORDER BY f.fund_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(LedgerMismatch {
                        fund_id: row.get(0)?,
                        current: row.get(1)?,
                        pledged: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

/// Inserts the default funds when the table is empty. Returns the number inserted.
pub fn seed_funds(conn: &Connection) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM funds", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(0);
    }

    let funds = default_funds();
    let tx = conn.unchecked_transaction()?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO funds (fund_id, name, description, current, image)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for fund in &funds {
            insert.execute(params![
                fund.fund_id,
                fund.name,
                fund.description,
                fund.current,
                fund.image
            ])?;
        }
    }
    tx.commit()?;
    Ok(funds.len())
}

fn fund_from_row(row: &Row<'_>) -> rusqlite::Result<Fund> {
    Ok(Fund {
        fund_id: row.get("fund_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        current: row.get("current")?,
        image: row.get("image")?,
    })
}

fn pledge_from_row(row: &Row<'_>) -> rusqlite::Result<Pledge> {
    Ok(Pledge {
        id: row.get("id")?,
        fund_id: row.get("fund_id")?,
        amount: row.get("amount")?,
        name: row.get("name")?,
        message: row.get("message")?,
        created_at: row.get("created_at")?,
    })
}

fn guestbook_from_row(row: &Row<'_>) -> rusqlite::Result<GuestbookEntry> {
    Ok(GuestbookEntry {
        id: row.get("id")?,
        name: row.get("name")?,
        message: row.get("message")?,
        image_url: row.get("image_url")?,
        image_alt: row.get("image_alt")?,
        created_at: row.get("created_at")?,
    })
}

fn gallery_from_row(row: &Row<'_>) -> rusqlite::Result<GalleryImage> {
    let tags: Option<String> = row.get("tags")?;
    let tags = match tags.as_deref() {
        None | Some("") => Vec::new(),
        Some(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
        })?,
    };
    Ok(GalleryImage {
        id: row.get("id")?,
        src: row.get("src")?,
        caption: row.get("caption")?,
        tags,
        created_at: row.get("created_at")?,
    })
}

const SELECT_FUND: &str =
    "SELECT fund_id, name, description, current, image FROM funds WHERE fund_id = ?1";
const SELECT_GUESTBOOK: &str = "SELECT id, name, message, image_url, image_alt, created_at
     FROM guestbook_entries ORDER BY created_at DESC, id DESC";
const SELECT_GALLERY: &str = "SELECT id, src, caption, tags, created_at
     FROM gallery_images ORDER BY created_at DESC, id DESC";

impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn list_funds(&self) -> BoxFuture<'_, Result<Vec<Fund>, StoreError>> {
        Box::pin(self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fund_id, name, description, current, image FROM funds ORDER BY rowid",
            )?;
            let funds = stmt
                .query_map([], fund_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(funds)
        }))
    }

    fn get_fund(&self, fund_id: &str) -> BoxFuture<'_, Result<Option<Fund>, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(self.run(move |conn| {
            Ok(conn
                .query_row(SELECT_FUND, params![fund_id], fund_from_row)
                .optional()?)
        }))
    }

    fn apply_pledge(
        &self,
        fund_id: &str,
        pledge: NewPledge,
    ) -> BoxFuture<'_, Result<PledgeOutcome, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(self.run(move |conn| {
            let tx = conn.transaction()?;

            // Increment in SQL so concurrent pledges never lose an update. The
            // bound keeps SQLite from promoting an overflowing total to REAL.
            let updated = tx.execute(
                "UPDATE funds SET current = current + ?1 WHERE fund_id = ?2 AND current <= ?3",
                params![pledge.amount, fund_id, i64::MAX.saturating_sub(pledge.amount)],
            )?;
            if updated == 0 {
                let exists = tx
                    .query_row("SELECT 1 FROM funds WHERE fund_id = ?1", params![fund_id], |_| {
                        Ok(())
                    })
                    .optional()?
                    .is_some();
                if exists {
                    return Err(DomainError::InvalidAmount {
                        reason: "fund total would overflow".to_string(),
                    }
                    .into());
                }
                return Err(StoreError::NotFound {
                    kind: RecordKind::Fund,
                    key: fund_id,
                });
            }

            tx.execute(
                "INSERT INTO pledges (fund_id, amount, name, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fund_id,
                    pledge.amount,
                    pledge.name,
                    pledge.message,
                    pledge.created_at
                ],
            )?;
            let id = tx.last_insert_rowid();
            let fund = tx.query_row(SELECT_FUND, params![fund_id], fund_from_row)?;
            tx.commit()?;

            Ok(PledgeOutcome {
                fund,
                pledge: Pledge {
                    id,
                    fund_id,
                    amount: pledge.amount,
                    name: pledge.name,
                    message: pledge.message,
                    created_at: pledge.created_at,
                },
            })
        }))
    }

    fn list_guestbook(&self) -> BoxFuture<'_, Result<Vec<GuestbookEntry>, StoreError>> {
        Box::pin(self.run(|conn| {
            let mut stmt = conn.prepare(SELECT_GUESTBOOK)?;
            let entries = stmt
                .query_map([], guestbook_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        }))
    }

    fn create_guestbook_entry(
        &self,
        entry: NewGuestbookEntry,
    ) -> BoxFuture<'_, Result<GuestbookEntry, StoreError>> {
        Box::pin(self.run(move |conn| {
            conn.execute(
                "INSERT INTO guestbook_entries (name, message, image_url, image_alt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.name,
                    entry.message,
                    entry.image_url,
                    entry.image_alt,
                    entry.created_at
                ],
            )?;
            Ok(GuestbookEntry {
                id: conn.last_insert_rowid(),
                name: entry.name,
                message: entry.message,
                image_url: entry.image_url,
                image_alt: entry.image_alt,
                created_at: entry.created_at,
            })
        }))
    }

    fn list_gallery(&self) -> BoxFuture<'_, Result<Vec<GalleryImage>, StoreError>> {
        Box::pin(self.run(|conn| {
            let mut stmt = conn.prepare(SELECT_GALLERY)?;
            let images = stmt
                .query_map([], gallery_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(images)
        }))
    }

    fn create_gallery_image(
        &self,
        image: NewGalleryImage,
    ) -> BoxFuture<'_, Result<GalleryImage, StoreError>> {
        Box::pin(self.run(move |conn| {
            let tags = serde_json::to_string(&image.tags)?;
            conn.execute(
                "INSERT INTO gallery_images (src, caption, tags, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![image.src, image.caption, tags, image.created_at],
            )?;
            Ok(GalleryImage {
                id: conn.last_insert_rowid(),
                src: image.src,
                caption: image.caption,
                tags: image.tags,
                created_at: image.created_at,
            })
        }))
    }

    fn list_pledges(&self) -> BoxFuture<'_, Result<Vec<Pledge>, StoreError>> {
        Box::pin(self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, fund_id, amount, name, message, created_at FROM pledges ORDER BY id",
            )?;
            let pledges = stmt
                .query_map([], pledge_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pledges)
        }))
    }
}
