use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the orchestrator database.
///
/// Wraps `PreviewDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PreviewDb>>,
}

impl DbHandle {
    pub fn new(db: PreviewDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PreviewDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for start-up and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PreviewDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// RFC 3339 with second precision and a `Z` suffix: fixed width, so string
/// comparison in SQL orders the same as time comparison.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

fn now() -> String {
    format_timestamp(Utc::now())
}

pub struct PreviewDb {
    conn: Connection,
}

const GENERATION_COLUMNS: &str = "id, status, workspace_path, archive_url, preview_instance_id, \
     preview_url, preview_expires_at, screenshot_url, linked_app_id, error, created_at, updated_at";

impl PreviewDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS listings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    is_draft INTEGER NOT NULL DEFAULT 1,
                    preview_url TEXT,
                    screenshot_url TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS generations (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'pending',
                    workspace_path TEXT,
                    archive_url TEXT,
                    preview_instance_id TEXT,
                    preview_url TEXT,
                    preview_expires_at TEXT,
                    screenshot_url TEXT,
                    linked_app_id INTEGER REFERENCES listings(id) ON DELETE SET NULL,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS production_deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    generation_id TEXT NOT NULL REFERENCES generations(id) ON DELETE CASCADE,
                    instance_name TEXT,
                    url TEXT,
                    status TEXT NOT NULL DEFAULT 'preview',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_generations_expiry
                    ON generations(preview_expires_at) WHERE preview_instance_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_production_generation
                    ON production_deployments(generation_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Generations ───────────────────────────────────────────────────

    /// Insert a generation record. Used by the upstream generation flow and tests.
    pub fn create_generation(
        &self,
        id: &str,
        archive_url: Option<&str>,
        linked_app_id: Option<i64>,
    ) -> Result<GenerationRecord> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO generations (id, status, archive_url, linked_app_id, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?4)",
                params![id, archive_url, linked_app_id, ts],
            )
            .context("Failed to insert generation")?;
        self.get_generation(id)?
            .context("Generation not found after insert")
    }

    pub fn get_generation(&self, id: &str) -> Result<Option<GenerationRecord>> {
        let sql = format!("SELECT {} FROM generations WHERE id = ?1", GENERATION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], GenerationRow::from_row)
            .optional()
            .context("Failed to query generation")?;
        row.map(GenerationRow::into_record).transpose()
    }

    fn query_generations(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<GenerationRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare generation query")?;
        let rows = stmt
            .query_map(params, GenerationRow::from_row)
            .context("Failed to query generations")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read generation row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    pub fn update_generation_status(
        &self,
        id: &str,
        status: GenerationStatus,
        error: Option<&str>,
    ) -> Result<GenerationRecord> {
        let changed = self
            .conn
            .execute(
                "UPDATE generations SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, now(), id],
            )
            .context("Failed to update generation status")?;
        if changed == 0 {
            anyhow::bail!("Generation {} not found", id);
        }
        self.get_generation(id)?
            .context("Generation not found after status update")
    }

    pub fn set_workspace_path(&self, id: &str, path: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE generations SET workspace_path = ?1, updated_at = ?2 WHERE id = ?3",
                params![path, now(), id],
            )
            .context("Failed to update workspace path")?;
        Ok(())
    }

    pub fn clear_workspace_path(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE generations SET workspace_path = NULL, updated_at = ?1 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to clear workspace path")?;
        Ok(())
    }

    /// Write the preview triple, screenshot and `complete` status in one statement.
    pub fn record_preview(&self, id: &str, preview: &PreviewResult) -> Result<GenerationRecord> {
        let expires = preview.expires_at.map(format_timestamp);
        self.conn
            .execute(
                "UPDATE generations
                 SET preview_instance_id = ?1, preview_url = ?2, preview_expires_at = ?3,
                     screenshot_url = COALESCE(?4, screenshot_url),
                     status = 'complete', error = NULL, updated_at = ?5
                 WHERE id = ?6",
                params![
                    preview.instance_id,
                    preview.url,
                    expires,
                    preview.screenshot_url,
                    now(),
                    id
                ],
            )
            .context("Failed to record preview")?;
        self.get_generation(id)?
            .context("Generation not found after recording preview")
    }

    /// Null the preview triple in one statement. Source location is untouched.
    pub fn clear_preview(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE generations
                 SET preview_instance_id = NULL, preview_url = NULL, preview_expires_at = NULL,
                     updated_at = ?1
                 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to clear preview")?;
        Ok(())
    }

    /// Drop only the expiration, turning a draft preview into a permanent one.
    pub fn clear_preview_expiration(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE generations SET preview_expires_at = NULL, updated_at = ?1 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to clear preview expiration")?;
        Ok(())
    }

    pub fn list_expired_previews(&self, at: DateTime<Utc>) -> Result<Vec<GenerationRecord>> {
        let sql = format!(
            "SELECT {} FROM generations
             WHERE preview_instance_id IS NOT NULL
               AND preview_expires_at IS NOT NULL
             ORDER BY preview_expires_at",
            GENERATION_COLUMNS
        );
        let mut records = self.query_generations(&sql, params![])?;
        records.retain(|r| r.preview_expired(at));
        Ok(records)
    }

    // ── Listings ──────────────────────────────────────────────────────

    pub fn create_listing(&self, name: &str, is_draft: bool) -> Result<Listing> {
        self.conn
            .execute(
                "INSERT INTO listings (name, is_draft, updated_at) VALUES (?1, ?2, ?3)",
                params![name, is_draft, now()],
            )
            .context("Failed to insert listing")?;
        let id = self.conn.last_insert_rowid();
        self.get_listing(id)?.context("Listing not found after insert")
    }

    pub fn get_listing(&self, id: i64) -> Result<Option<Listing>> {
        self.conn
            .query_row(
                "SELECT id, name, is_draft, preview_url, screenshot_url, updated_at
                 FROM listings WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Listing {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        is_draft: row.get(2)?,
                        preview_url: row.get(3)?,
                        screenshot_url: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query listing")
    }

    pub fn update_listing_preview(
        &self,
        id: i64,
        preview_url: &str,
        screenshot_url: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE listings
                 SET preview_url = ?1, screenshot_url = COALESCE(?2, screenshot_url), updated_at = ?3
                 WHERE id = ?4",
                params![preview_url, screenshot_url, now(), id],
            )
            .context("Failed to update listing preview")?;
        Ok(())
    }

    // ── Production deployments ────────────────────────────────────────

    pub fn create_production_deployment(
        &self,
        generation_id: &str,
        instance_name: Option<&str>,
        url: Option<&str>,
        status: ProductionStatus,
    ) -> Result<ProductionDeployment> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO production_deployments
                    (generation_id, instance_name, url, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![generation_id, instance_name, url, status.as_str(), ts],
            )
            .context("Failed to insert production deployment")?;
        let id = self.conn.last_insert_rowid();
        self.get_production_deployment(id)?
            .context("Production deployment not found after insert")
    }

    pub fn get_production_deployment(&self, id: i64) -> Result<Option<ProductionDeployment>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, generation_id, instance_name, url, status, created_at, updated_at
                 FROM production_deployments WHERE id = ?1",
                params![id],
                ProductionRow::from_row,
            )
            .optional()
            .context("Failed to query production deployment")?;
        row.map(ProductionRow::into_deployment).transpose()
    }

    /// Latest production deployment linked to a generation.
    pub fn production_deployment_for(
        &self,
        generation_id: &str,
    ) -> Result<Option<ProductionDeployment>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, generation_id, instance_name, url, status, created_at, updated_at
                 FROM production_deployments WHERE generation_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![generation_id],
                ProductionRow::from_row,
            )
            .optional()
            .context("Failed to query production deployment")?;
        row.map(ProductionRow::into_deployment).transpose()
    }

    /// Mark a deployment stopped and drop its instance reference.
    pub fn stop_production_deployment(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE production_deployments
                 SET status = 'stopped', instance_name = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to stop production deployment")?;
        Ok(())
    }

    pub fn activate_production_deployment(
        &self,
        id: i64,
        instance_name: &str,
        url: Option<&str>,
    ) -> Result<ProductionDeployment> {
        self.conn
            .execute(
                "UPDATE production_deployments
                 SET status = 'active', instance_name = ?1, url = COALESCE(?2, url), updated_at = ?3
                 WHERE id = ?4",
                params![instance_name, url, now(), id],
            )
            .context("Failed to activate production deployment")?;
        self.get_production_deployment(id)?
            .context("Production deployment not found after activation")
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

/// Intermediate row struct for generations.
struct GenerationRow {
    id: String,
    status: String,
    workspace_path: Option<String>,
    archive_url: Option<String>,
    preview_instance_id: Option<String>,
    preview_url: Option<String>,
    preview_expires_at: Option<String>,
    screenshot_url: Option<String>,
    linked_app_id: Option<i64>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl GenerationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            workspace_path: row.get(2)?,
            archive_url: row.get(3)?,
            preview_instance_id: row.get(4)?,
            preview_url: row.get(5)?,
            preview_expires_at: row.get(6)?,
            screenshot_url: row.get(7)?,
            linked_app_id: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<GenerationRecord> {
        let status = GenerationStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse generation status")?;
        let preview_expires_at = self
            .preview_expires_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(GenerationRecord {
            id: self.id,
            status,
            workspace_path: self.workspace_path,
            archive_url: self.archive_url,
            preview_instance_id: self.preview_instance_id,
            preview_url: self.preview_url,
            preview_expires_at,
            screenshot_url: self.screenshot_url,
            linked_app_id: self.linked_app_id,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ProductionRow {
    id: i64,
    generation_id: String,
    instance_name: Option<String>,
    url: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl ProductionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            generation_id: row.get(1)?,
            instance_name: row.get(2)?,
            url: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_deployment(self) -> Result<ProductionDeployment> {
        let status = ProductionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse production status")?;
        Ok(ProductionDeployment {
            id: self.id,
            generation_id: self.generation_id,
            instance_name: self.instance_name,
            url: self.url,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn preview(id: &str, expires_at: Option<DateTime<Utc>>) -> PreviewResult {
        PreviewResult {
            instance_id: format!("preview-{}", id),
            url: format!("https://preview-{}.example.dev", id),
            expires_at,
            screenshot_url: Some(format!("/screenshots/{}.png", id)),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('generations', 'listings', 'production_deployments')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");
        // re-running is a no-op
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_and_get_generation() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        let record = db.create_generation("gen-1", Some("https://blob/gen-1.tar.gz"), None)?;
        assert_eq!(record.id, "gen-1");
        assert_eq!(record.status, GenerationStatus::Pending);
        assert_eq!(record.archive_url.as_deref(), Some("https://blob/gen-1.tar.gz"));
        assert!(!record.has_preview());
        assert!(db.get_generation("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_status_with_error() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        db.create_generation("gen-1", None, None)?;
        let failed =
            db.update_generation_status("gen-1", GenerationStatus::Failed, Some("install failed"))?;
        assert_eq!(failed.status, GenerationStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("install failed"));
        assert!(db
            .update_generation_status("nope", GenerationStatus::Failed, None)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_record_and_clear_preview() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        db.create_generation("gen-1", None, None)?;
        db.set_workspace_path("gen-1", "/ws/gen-1")?;
        let expires = Utc::now() + chrono::Duration::days(7);
        let record = db.record_preview("gen-1", &preview("gen-1", Some(expires)))?;
        assert_eq!(record.status, GenerationStatus::Complete);
        assert_eq!(record.preview_instance_id.as_deref(), Some("preview-gen-1"));
        assert_eq!(
            record.preview_expires_at.map(format_timestamp),
            Some(format_timestamp(expires))
        );

        db.clear_preview("gen-1")?;
        let cleared = db.get_generation("gen-1")?.unwrap();
        assert!(cleared.preview_instance_id.is_none());
        assert!(cleared.preview_url.is_none());
        assert!(cleared.preview_expires_at.is_none());
        // source and screenshot survive
        assert_eq!(cleared.workspace_path.as_deref(), Some("/ws/gen-1"));
        assert!(cleared.screenshot_url.is_some());
        Ok(())
    }

    #[test]
    fn test_list_expired_previews() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        let now = Utc::now();
        for id in ["old", "fresh", "store", "none"] {
            db.create_generation(id, None, None)?;
        }
        db.record_preview("old", &preview("old", Some(now - chrono::Duration::hours(2))))?;
        db.record_preview("fresh", &preview("fresh", Some(now + chrono::Duration::days(3))))?;
        db.record_preview("store", &preview("store", None))?;

        let expired = db.list_expired_previews(now)?;
        let ids: Vec<_> = expired.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
        Ok(())
    }

    #[test]
    fn test_listing_preview_update_keeps_screenshot_when_none() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        let listing = db.create_listing("Todo app", false)?;
        db.update_listing_preview(listing.id, "https://a.dev", Some("/screenshots/a.png"))?;
        db.update_listing_preview(listing.id, "https://b.dev", None)?;
        let listing = db.get_listing(listing.id)?.unwrap();
        assert_eq!(listing.preview_url.as_deref(), Some("https://b.dev"));
        assert_eq!(listing.screenshot_url.as_deref(), Some("/screenshots/a.png"));
        assert!(!listing.is_draft);
        Ok(())
    }

    #[test]
    fn test_production_deployment_lifecycle() -> Result<()> {
        let db = PreviewDb::new_in_memory()?;
        db.create_generation("gen-1", None, None)?;
        assert!(db.production_deployment_for("gen-1")?.is_none());

        let dep = db.create_production_deployment(
            "gen-1",
            Some("preview-gen-1"),
            None,
            ProductionStatus::Preview,
        )?;
        assert_eq!(dep.status, ProductionStatus::Preview);

        let active = db.activate_production_deployment(dep.id, "preview-gen-1", Some("https://x"))?;
        assert_eq!(active.status, ProductionStatus::Active);
        assert_eq!(active.url.as_deref(), Some("https://x"));

        db.stop_production_deployment(dep.id)?;
        let stopped = db.production_deployment_for("gen-1")?.unwrap();
        assert_eq!(stopped.status, ProductionStatus::Stopped);
        assert!(stopped.instance_name.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(PreviewDb::new_in_memory()?);
        handle
            .call(|db| db.create_generation("gen-async", None, None).map(|_| ()))
            .await?;
        let found = handle
            .call(|db| db.get_generation("gen-async"))
            .await?;
        assert!(found.is_some());
        Ok(())
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.891Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2026-03-04T05:06:07Z");
    }
}
