//! Durable backing store for [`super::store::TaskStore`] (spec §4.6 "durable").
//!
//! Grounded on `trovato-kernel/src/db.rs` for the pool-creation and embedded
//! `sqlx::migrate!` pattern, swapped from Postgres to SQLite — see
//! SPEC_FULL.md §D for why (single-process embedded core, not a shared
//! server). A task row is deleted once its task reaches a terminal status;
//! only Pending/Running survive a crash.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::task::model::{Priority, TaskStatus, TranslationTask};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open (creating if absent) the SQLite database backing the task store and
/// result cache.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to open sqlite database")?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    Ok(())
}

pub async fn check_health(pool: &SqlitePool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Upsert every task in `tasks` (called by the scheduler's periodic
/// flusher, spec §4.6 `persistence_interval_seconds`).
pub async fn save_tasks(pool: &SqlitePool, tasks: &[TranslationTask]) -> Result<()> {
    for task in tasks {
        let metadata_json =
            serde_json::to_string(&task.metadata).context("failed to serialize task metadata")?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, manga_ref, page_index, language, engine_id, priority,
                status, request_time, start_time, end_time, retry_count,
                max_retries, last_error, force_retranslate, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                priority = excluded.priority,
                status = excluded.status,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                metadata = excluded.metadata
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(&task.manga_ref)
        .bind(task.page_index)
        .bind(&task.language)
        .bind(&task.engine_id)
        .bind(priority_to_str(task.priority))
        .bind(status_to_str(task.status))
        .bind(task.request_time.to_rfc3339())
        .bind(task.start_time.map(|t| t.to_rfc3339()))
        .bind(task.end_time.map(|t| t.to_rfc3339()))
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.last_error)
        .bind(task.force_retranslate)
        .bind(metadata_json)
        .execute(pool)
        .await
        .context("failed to upsert task row")?;
    }
    Ok(())
}

/// Remove a task once it reaches a terminal status.
pub async fn delete_task(pool: &SqlitePool, task_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE task_id = ?")
        .bind(task_id.to_string())
        .execute(pool)
        .await
        .context("failed to delete task row")?;
    Ok(())
}

/// Overwrite the durable `tasks` table with exactly `tasks` (the scheduler's
/// periodic flusher snapshot, spec §4.6). A full replace rather than an
/// upsert so a task that has since left the pending/processing set (it
/// completed, failed terminally, or was cancelled) doesn't linger on disk.
pub async fn replace_all(pool: &SqlitePool, tasks: &[TranslationTask]) -> Result<()> {
    sqlx::query("DELETE FROM tasks")
        .execute(pool)
        .await
        .context("failed to clear tasks table before snapshot")?;
    save_tasks(pool, tasks).await
}

/// Load every durable task (used at startup to rebuild the in-memory store).
pub async fn load_tasks(pool: &SqlitePool) -> Result<Vec<TranslationTask>> {
    let rows = sqlx::query("SELECT * FROM tasks")
        .fetch_all(pool)
        .await
        .context("failed to load tasks from sqlite")?;

    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<TranslationTask> {
    let task_id: String = row.try_get("task_id").context("missing task_id")?;
    let priority: String = row.try_get("priority").context("missing priority")?;
    let status: String = row.try_get("status").context("missing status")?;
    let request_time: String = row.try_get("request_time").context("missing request_time")?;
    let start_time: Option<String> = row.try_get("start_time").context("missing start_time")?;
    let end_time: Option<String> = row.try_get("end_time").context("missing end_time")?;
    let metadata: String = row.try_get("metadata").context("missing metadata")?;

    Ok(TranslationTask {
        task_id: Uuid::parse_str(&task_id).context("corrupt task_id in sqlite row")?,
        manga_ref: row.try_get("manga_ref").context("missing manga_ref")?,
        page_index: row.try_get::<i64, _>("page_index").context("missing page_index")? as u32,
        language: row.try_get("language").context("missing language")?,
        engine_id: row.try_get("engine_id").context("missing engine_id")?,
        priority: str_to_priority(&priority)?,
        status: str_to_status(&status)?,
        request_time: parse_rfc3339(&request_time)?,
        start_time: start_time.map(|t| parse_rfc3339(&t)).transpose()?,
        end_time: end_time.map(|t| parse_rfc3339(&t)).transpose()?,
        retry_count: row.try_get::<i64, _>("retry_count").context("missing retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries").context("missing max_retries")? as u32,
        last_error: row.try_get("last_error").context("missing last_error")?,
        force_retranslate: row
            .try_get("force_retranslate")
            .context("missing force_retranslate")?,
        metadata: serde_json::from_str(&metadata).context("corrupt task metadata in sqlite row")?,
        cancelled: Default::default(),
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("corrupt timestamp in sqlite row")?
        .with_timezone(&Utc))
}

fn priority_to_str(priority: Priority) -> &'static str {
    match priority {
        Priority::P0Current => "p0_current",
        Priority::P1Adjacent => "p1_adjacent",
        Priority::P2SameWork => "p2_same_work",
        Priority::P3Other => "p3_other",
    }
}

fn str_to_priority(s: &str) -> Result<Priority> {
    Ok(match s {
        "p0_current" => Priority::P0Current,
        "p1_adjacent" => Priority::P1Adjacent,
        "p2_same_work" => Priority::P2SameWork,
        "p3_other" => Priority::P3Other,
        other => anyhow::bail!("unknown priority {other} in sqlite row"),
    })
}

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn str_to_status(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        other => anyhow::bail!("unknown status {other} in sqlite row"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::model::{Metadata, Priority};

    async fn test_pool() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn sample_task() -> TranslationTask {
        TranslationTask::new(
            "/m/one.zip",
            2,
            "zh",
            "google",
            Priority::P0Current,
            false,
            Utc::now(),
            Metadata::new(),
        )
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let pool = test_pool().await;
        let task = sample_task();
        save_tasks(&pool, std::slice::from_ref(&task)).await.unwrap();

        let loaded = load_tasks(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, task.task_id);
        assert_eq!(loaded[0].manga_ref, task.manga_ref);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = test_pool().await;
        let task = sample_task();
        save_tasks(&pool, std::slice::from_ref(&task)).await.unwrap();
        delete_task(&pool, task.task_id).await.unwrap();
        let loaded = load_tasks(&pool).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn replace_all_drops_rows_missing_from_the_new_snapshot() {
        let pool = test_pool().await;
        let first = sample_task();
        let second = sample_task();
        save_tasks(&pool, &[first.clone(), second]).await.unwrap();
        assert_eq!(load_tasks(&pool).await.unwrap().len(), 2);

        replace_all(&pool, std::slice::from_ref(&first)).await.unwrap();
        let loaded = load_tasks(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, first.task_id);
    }

    #[tokio::test]
    async fn save_upserts_existing_row() {
        let pool = test_pool().await;
        let mut task = sample_task();
        save_tasks(&pool, std::slice::from_ref(&task)).await.unwrap();
        task.retry_count = 2;
        save_tasks(&pool, std::slice::from_ref(&task)).await.unwrap();

        let loaded = load_tasks(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].retry_count, 2);
    }
}
