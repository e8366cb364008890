//! SQLite-backed task store
//!
//! Durable keyed table of task records. File manifests and session blobs are
//! child rows that cascade away with their task. Every mutator reports how
//! many rows it touched so callers can tell a no-op from a real write.

use crate::error::DlsyncError;
use chrono::{DateTime, Utc};
use dlsync_types::{FileEntry, JobId, TaskId, TaskKind, TaskRecord, TaskState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Connection pool for task persistence
#[derive(Clone, Debug)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) the store at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, DlsyncError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source_locator TEXT NOT NULL,
                destination TEXT NOT NULL,
                display_name TEXT NOT NULL,
                description TEXT,
                size_bytes INTEGER,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                external_job_id TEXT,
                validation_tag TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS file_manifests (
                task_id TEXT NOT NULL,
                file_index INTEGER NOT NULL,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (task_id, file_index),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS session_blobs (
                task_id TEXT PRIMARY KEY,
                blob BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a new record unless one with the same id exists
    ///
    /// Returns true when the row was created.
    pub async fn insert_if_absent(&self, task: &TaskRecord) -> Result<bool, DlsyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, kind, source_locator, destination, display_name, description,
                size_bytes, downloaded_bytes, state, external_job_id, validation_tag,
                error, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(&task.source_locator)
        .bind(task.destination.to_string_lossy().to_string())
        .bind(&task.display_name)
        .bind(task.description.as_ref())
        .bind(task.size_bytes.map(|s| s as i64))
        .bind(task.downloaded_bytes as i64)
        .bind(task.state.as_str())
        .bind(task.external_job_id.as_ref().map(|j| j.as_str()))
        .bind(task.validation_tag.as_ref())
        .bind(task.error.as_ref())
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Load a task by id, including its manifest
    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, DlsyncError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let files = self.load_manifest(id).await?;
        let has_session = sqlx::query("SELECT 1 FROM session_blobs WHERE task_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        Ok(Some(row_to_task(row, files, has_session)?))
    }

    /// Load every task, newest first
    pub async fn load_all(&self) -> Result<Vec<TaskRecord>, DlsyncError> {
        let task_rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let manifest_rows =
            sqlx::query("SELECT * FROM file_manifests ORDER BY task_id, file_index")
                .fetch_all(&self.pool)
                .await?;

        let mut manifests: HashMap<String, Vec<FileEntry>> = HashMap::new();
        for row in manifest_rows {
            let task_id: String = row.get("task_id");
            manifests.entry(task_id).or_default().push(row_to_file(&row));
        }

        let sessions: HashSet<String> = sqlx::query("SELECT task_id FROM session_blobs")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("task_id"))
            .collect();

        let mut tasks = Vec::with_capacity(task_rows.len());
        for row in task_rows {
            let id: String = row.get("id");
            let files = manifests.remove(&id).unwrap_or_default();
            let has_session = sessions.contains(&id);
            tasks.push(row_to_task(row, files, has_session)?);
        }

        Ok(tasks)
    }

    async fn load_manifest(&self, id: TaskId) -> Result<Vec<FileEntry>, DlsyncError> {
        let rows = sqlx::query("SELECT * FROM file_manifests WHERE task_id = ? ORDER BY file_index")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_file).collect())
    }

    /// Record transferred bytes, never exceeding a known size
    pub async fn update_progress(&self, id: TaskId, downloaded: u64) -> Result<u64, DlsyncError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET downloaded_bytes = CASE
                WHEN size_bytes IS NOT NULL AND ? > size_bytes THEN size_bytes
                ELSE ?
            END
            WHERE id = ?
            "#,
        )
        .bind(downloaded as i64)
        .bind(downloaded as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Move a task to `state` if its current state is a legal predecessor
    ///
    /// Active states require a job id and store it; every other state clears
    /// it. A rejected transition or a missing row both report zero affected
    /// rows.
    pub async fn update_state(
        &self,
        id: TaskId,
        state: TaskState,
        job_id: Option<&JobId>,
        error: Option<&str>,
    ) -> Result<u64, DlsyncError> {
        let predecessors = state.predecessors();
        if predecessors.is_empty() {
            return Ok(0);
        }

        let job_id = match (state.is_active(), job_id) {
            (true, None) => return Ok(0),
            (true, job_id) => job_id,
            (false, _) => None,
        };

        let placeholders = predecessors.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            r#"
            UPDATE tasks
            SET state = ?,
                external_job_id = ?,
                error = ?,
                completed_at = CASE WHEN ? = 'completed' THEN ? ELSE completed_at END,
                downloaded_bytes = CASE
                    WHEN ? = 'completed' AND size_bytes IS NOT NULL THEN size_bytes
                    ELSE downloaded_bytes
                END
            WHERE id = ? AND state IN ({})
            "#,
            placeholders
        );

        let mut statement = sqlx::query(&query)
            .bind(state.as_str())
            .bind(job_id.map(|j| j.as_str()))
            .bind(error)
            .bind(state.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(state.as_str())
            .bind(id.to_string());
        for predecessor in predecessors {
            statement = statement.bind(predecessor.as_str());
        }

        let result = statement.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Force a state without transition checks
    ///
    /// Used only by start-up reconciliation, which demotes records whose job
    /// no longer exists.
    pub async fn demote(&self, id: TaskId, from: TaskState, to: TaskState) -> Result<u64, DlsyncError> {
        let result = sqlx::query(
            "UPDATE tasks SET state = ?, external_job_id = NULL WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_size(&self, id: TaskId, size: u64) -> Result<u64, DlsyncError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET size_bytes = ?, downloaded_bytes = MIN(downloaded_bytes, ?)
            WHERE id = ?
            "#,
        )
        .bind(size as i64)
        .bind(size as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_name(&self, id: TaskId, name: &str) -> Result<u64, DlsyncError> {
        let result = sqlx::query("UPDATE tasks SET display_name = ? WHERE id = ?")
            .bind(name)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_description(
        &self,
        id: TaskId,
        description: Option<&str>,
    ) -> Result<u64, DlsyncError> {
        let result = sqlx::query("UPDATE tasks SET description = ? WHERE id = ?")
            .bind(description)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Replace the job id of a task that is currently active
    pub async fn update_request_id(&self, id: TaskId, job_id: &JobId) -> Result<u64, DlsyncError> {
        let result = sqlx::query(
            "UPDATE tasks SET external_job_id = ? WHERE id = ? AND state IN ('downloading', 'seeding')",
        )
        .bind(job_id.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_validation_tag(
        &self,
        id: TaskId,
        tag: Option<&str>,
    ) -> Result<u64, DlsyncError> {
        let result = sqlx::query("UPDATE tasks SET validation_tag = ? WHERE id = ?")
            .bind(tag)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Replace the file manifest of a task atomically
    pub async fn replace_file_manifest(
        &self,
        id: TaskId,
        files: &[FileEntry],
    ) -> Result<u64, DlsyncError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Ok(0);
        }

        sqlx::query("DELETE FROM file_manifests WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        for file in files {
            sqlx::query(
                r#"
                INSERT INTO file_manifests (task_id, file_index, path, size_bytes, downloaded_bytes)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(file.index as i64)
            .bind(file.path.to_string_lossy().to_string())
            .bind(file.size_bytes as i64)
            .bind(file.downloaded_bytes as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        // The task row counts as touched even for an empty manifest
        Ok(1)
    }

    /// Store the opaque resumption blob of a task
    pub async fn save_session(&self, id: TaskId, blob: &[u8]) -> Result<u64, DlsyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO session_blobs (task_id, blob, updated_at)
            SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?)
            ON CONFLICT(task_id) DO UPDATE SET
                blob = excluded.blob,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.to_string())
        .bind(blob)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn load_session(&self, id: TaskId) -> Result<Option<Vec<u8>>, DlsyncError> {
        let row = sqlx::query("SELECT blob FROM session_blobs WHERE task_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<Vec<u8>, _>("blob")))
    }

    pub async fn delete_session(&self, id: TaskId) -> Result<u64, DlsyncError> {
        let result = sqlx::query("DELETE FROM session_blobs WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Delete a task; manifests and session blobs cascade
    pub async fn delete(&self, id: TaskId) -> Result<u64, DlsyncError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_file(row: &SqliteRow) -> FileEntry {
    FileEntry {
        index: row.get::<i64, _>("file_index") as u32,
        path: PathBuf::from(row.get::<String, _>("path")),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
    }
}

/// Convert a database row to a TaskRecord
fn row_to_task(
    row: SqliteRow,
    files: Vec<FileEntry>,
    has_session: bool,
) -> Result<TaskRecord, DlsyncError> {
    let id = row
        .get::<String, _>("id")
        .parse::<TaskId>()
        .map_err(|e| DlsyncError::Serialization(e.to_string()))?;
    let kind = row
        .get::<String, _>("kind")
        .parse::<TaskKind>()
        .map_err(|e| DlsyncError::Serialization(e.to_string()))?;
    let state = row
        .get::<String, _>("state")
        .parse::<TaskState>()
        .map_err(|e| DlsyncError::Serialization(e.to_string()))?;

    Ok(TaskRecord {
        id,
        kind,
        source_locator: row.get("source_locator"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        display_name: row.get("display_name"),
        description: row.get("description"),
        size_bytes: row.get::<Option<i64>, _>("size_bytes").map(|s| s as u64),
        downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
        state,
        external_job_id: row.get::<Option<String>, _>("external_job_id").map(JobId::from),
        validation_tag: row.get("validation_tag"),
        error: row.get("error"),
        files,
        has_session,
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| DlsyncError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
        (store, dir)
    }

    fn sample_task() -> TaskRecord {
        TaskRecord::new("https://x/y.bin", "/d", TaskKind::Http)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_id() {
        let (store, _dir) = open_store().await;
        let task = sample_task();

        assert!(store.insert_if_absent(&task).await.unwrap());
        assert!(!store.insert_if_absent(&task).await.unwrap());

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.display_name, "y.bin");
        assert_eq!(loaded.state, TaskState::Init);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_update_rejects_skipped_transitions() {
        let (store, _dir) = open_store().await;
        let task = sample_task();
        store.insert_if_absent(&task).await.unwrap();

        // Init cannot jump straight to Completed
        let rows = store
            .update_state(task.id, TaskState::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(rows, 0);

        // Active states need a job to point at
        let rows = store
            .update_state(task.id, TaskState::Downloading, None, None)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().state, TaskState::Init);

        let job = JobId::generate();
        let rows = store
            .update_state(task.id, TaskState::Downloading, Some(&job), None)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Downloading);
        assert_eq!(loaded.external_job_id, Some(job));

        let rows = store
            .update_state(task.id, TaskState::Paused, None, Some("stopped"))
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Paused);
        assert_eq!(loaded.external_job_id, None);
        assert_eq!(loaded.error.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_progress_is_clamped_to_known_size() {
        let (store, _dir) = open_store().await;
        let task = sample_task();
        store.insert_if_absent(&task).await.unwrap();

        store.update_progress(task.id, 500).await.unwrap();
        store.update_size(task.id, 100).await.unwrap();
        assert_eq!(store.get(task.id).await.unwrap().unwrap().downloaded_bytes, 100);

        store.update_progress(task.id, 250).await.unwrap();
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.downloaded_bytes, 100);
        assert_eq!(loaded.size_bytes, Some(100));
    }

    #[tokio::test]
    async fn test_updates_on_missing_row_touch_nothing() {
        let (store, _dir) = open_store().await;
        let ghost = sample_task().id;

        assert_eq!(store.update_progress(ghost, 1).await.unwrap(), 0);
        assert_eq!(store.update_name(ghost, "n").await.unwrap(), 0);
        assert_eq!(store.save_session(ghost, b"blob").await.unwrap(), 0);
        assert_eq!(store.replace_file_manifest(ghost, &[]).await.unwrap(), 0);
        assert_eq!(store.delete(ghost).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_child_rows() {
        let (store, _dir) = open_store().await;
        let task = TaskRecord::new("magnet:?xt=urn:btih:abc&dn=show", "/d", TaskKind::Torrent);
        store.insert_if_absent(&task).await.unwrap();

        let files = vec![
            FileEntry {
                index: 0,
                path: PathBuf::from("show/e01.mkv"),
                size_bytes: 10,
                downloaded_bytes: 0,
            },
            FileEntry {
                index: 1,
                path: PathBuf::from("show/e02.mkv"),
                size_bytes: 20,
                downloaded_bytes: 5,
            },
        ];
        assert_eq!(store.replace_file_manifest(task.id, &files).await.unwrap(), 1);
        assert_eq!(store.save_session(task.id, b"state-v1").await.unwrap(), 1);
        store.save_session(task.id, b"state-v2").await.unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.files, files);
        assert!(loaded.has_session);
        assert_eq!(
            store.load_session(task.id).await.unwrap().as_deref(),
            Some(&b"state-v2"[..])
        );

        assert_eq!(store.delete(task.id).await.unwrap(), 1);
        assert!(store.get(task.id).await.unwrap().is_none());
        assert!(store.load_session(task.id).await.unwrap().is_none());

        let orphans = sqlx::query("SELECT COUNT(*) AS n FROM file_manifests")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get::<i64, _>("n");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_request_id_only_updates_active_tasks() {
        let (store, _dir) = open_store().await;
        let task = sample_task();
        store.insert_if_absent(&task).await.unwrap();

        let job = JobId::generate();
        assert_eq!(store.update_request_id(task.id, &job).await.unwrap(), 0);

        let first = JobId::generate();
        store
            .update_state(task.id, TaskState::Downloading, Some(&first), None)
            .await
            .unwrap();
        assert_eq!(store.update_request_id(task.id, &job).await.unwrap(), 1);
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().external_job_id,
            Some(job)
        );
    }
}
