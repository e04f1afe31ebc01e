//! Tablet Metadata Store
//!
//! Durable, atomic storage of tablet metadata. The clone core only talks to
//! the [`TabletMetaStore`] trait; [`SqliteMetaStore`] is the local implementation.

use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use super::meta::TabletMeta;
use super::TabletId;
use crate::error::{Error, Result};

/// Metadata store consumed by the clone core
#[async_trait]
pub trait TabletMetaStore: Send + Sync {
    /// Load a tablet's committed metadata
    async fn get_tablet(&self, tablet_id: TabletId) -> Result<Option<TabletMeta>>;

    /// Register a new tablet. Fails with `TabletAlreadyExists` if present.
    async fn create_tablet(&self, meta: &TabletMeta) -> Result<()>;

    /// Atomically and durably replace a tablet's metadata.
    ///
    /// Fails with `VersionConflict` unless the stored revision equals
    /// `expected_revision`.
    async fn commit(&self, meta: &TabletMeta, expected_revision: u64) -> Result<()>;

    /// All tablets known to this store
    async fn list_tablets(&self) -> Result<Vec<TabletMeta>>;
}

/// Metadata store backed by SQLite
pub struct SqliteMetaStore {
    /// Database connection
    conn: Mutex<Connection>,
}

impl SqliteMetaStore {
    /// Create or open the metadata database
    pub fn new(meta_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&meta_dir)?;

        let db_path = meta_dir.join("tablet_meta.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS tablets (
                tablet_id INTEGER PRIMARY KEY,
                schema_hash INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                max_version INTEGER NOT NULL,
                data_dir TEXT NOT NULL,
                meta_json TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode(json: String) -> Result<TabletMeta> {
        serde_json::from_str(&json)
            .map_err(|e| Error::State(format!("Corrupted tablet metadata: {}", e)))
    }
}

#[async_trait]
impl TabletMetaStore for SqliteMetaStore {
    async fn get_tablet(&self, tablet_id: TabletId) -> Result<Option<TabletMeta>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT meta_json FROM tablets WHERE tablet_id = ?1",
                params![tablet_id as i64],
                |row| row.get(0),
            )
            .optional()?;

        json.map(Self::decode).transpose()
    }

    async fn create_tablet(&self, meta: &TabletMeta) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            r#"
            INSERT INTO tablets (tablet_id, schema_hash, revision, max_version, data_dir, meta_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(tablet_id) DO NOTHING
            "#,
            params![
                meta.tablet_id as i64,
                meta.schema_hash as i64,
                meta.revision as i64,
                meta.max_version() as i64,
                meta.data_dir.to_string_lossy().into_owned(),
                json,
            ],
        )?;

        if inserted == 0 {
            return Err(Error::TabletAlreadyExists(meta.tablet_id));
        }
        Ok(())
    }

    async fn commit(&self, meta: &TabletMeta, expected_revision: u64) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT revision FROM tablets WHERE tablet_id = ?1",
                params![meta.tablet_id as i64],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => return Err(Error::TabletNotFound(meta.tablet_id)),
            Some(revision) if revision as u64 != expected_revision => {
                return Err(Error::VersionConflict {
                    tablet_id: meta.tablet_id,
                    reason: format!(
                        "stored revision {} does not match expected {}",
                        revision, expected_revision
                    ),
                });
            }
            Some(_) => {}
        }

        tx.execute(
            r#"
            UPDATE tablets
            SET schema_hash = ?2, revision = ?3, max_version = ?4, data_dir = ?5,
                meta_json = ?6, updated_at = CURRENT_TIMESTAMP
            WHERE tablet_id = ?1
            "#,
            params![
                meta.tablet_id as i64,
                meta.schema_hash as i64,
                meta.revision as i64,
                meta.max_version() as i64,
                meta.data_dir.to_string_lossy().into_owned(),
                json,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn list_tablets(&self) -> Result<Vec<TabletMeta>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT meta_json FROM tablets ORDER BY tablet_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tablets = Vec::new();
        for row in rows {
            tablets.push(Self::decode(row?)?);
        }
        Ok(tablets)
    }
}
