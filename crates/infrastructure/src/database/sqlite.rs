use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;
use zimfarm_config::DatabaseConfig;
use zimfarm_core::{SchedulerError, SchedulerResult};
use zimfarm_domain::{
    ClaimOutcome, DurationScope, RequestedTask, RequestedTaskFilter, RequestedTaskRepository,
    ScheduleDuration, ScheduleDurationRepository, ScheduleRepository, Task, TaskMutation,
    TaskRepository, Worker, WorkerRepository,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        name TEXT PRIMARY KEY,
        doc TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS requested_tasks (
        id TEXT PRIMARY KEY,
        schedule_name TEXT,
        worker_name TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        doc TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS requested_tasks_schedule_worker
        ON requested_tasks (schedule_name, worker_name)
        WHERE schedule_name IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        terminal INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        doc TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedule_durations (
        schedule_name TEXT NOT NULL,
        scope TEXT NOT NULL,
        doc TEXT NOT NULL,
        PRIMARY KEY (schedule_name, scope)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedules (
        name TEXT PRIMARY KEY,
        most_recent_task TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// 任务文档乐观并发写回的最大尝试次数
const MAX_MODIFY_ATTEMPTS: usize = 100;

/// SQLite任务存储，实体以JSON文档保存，检索所需的列单独存放
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        // 每个内存库连接各自独立，必须只用一个连接
        let in_memory = config.url.contains(":memory:");
        let max_connections = if in_memory { 1 } else { config.max_connections };

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite存储已就绪: {}", config.url);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_doc<T: Serialize>(value: &T) -> SchedulerResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_doc<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<T> {
    let doc: String = row.try_get("doc")?;
    Ok(serde_json::from_str(&doc)?)
}

fn scope_key(scope: &DurationScope) -> String {
    match scope {
        DurationScope::Default => "default".to_string(),
        DurationScope::Worker(name) => format!("worker:{name}"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl WorkerRepository for SqliteStore {
    async fn get_worker(&self, name: &str) -> SchedulerResult<Option<Worker>> {
        let row = sqlx::query("SELECT doc FROM workers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (name, doc) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(&worker.name)
        .bind(to_doc(worker)?)
        .execute(&self.pool)
        .await?;
        debug!("保存Worker: {}", worker.name);
        Ok(())
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let rows = sqlx::query("SELECT doc FROM workers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(from_doc).collect()
    }
}

#[async_trait]
impl RequestedTaskRepository for SqliteStore {
    async fn create_requested_task(&self, task: &RequestedTask) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO requested_tasks (id, schedule_name, worker_name, created_at, doc)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.schedule_name.as_deref())
        .bind(task.worker_name.as_deref().unwrap_or(""))
        .bind(task.created_at.to_rfc3339())
        .bind(to_doc(task)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(SchedulerError::Conflict(format!(
                "schedule {} 已有未领取的请求 (worker: {:?})",
                task.schedule_display_name(),
                task.worker_name
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_requested_task(&self, id: Uuid) -> SchedulerResult<Option<RequestedTask>> {
        let row = sqlx::query("SELECT doc FROM requested_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn list_requested_tasks(
        &self,
        filter: &RequestedTaskFilter,
    ) -> SchedulerResult<Vec<RequestedTask>> {
        let rows = sqlx::query("SELECT doc FROM requested_tasks ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let task: RequestedTask = from_doc(row)?;
            if filter.matches(&task) {
                tasks.push(task);
            }
            if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                break;
            }
        }
        Ok(tasks)
    }

    async fn delete_requested_task(&self, id: Uuid) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM requested_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_requested_task(
        &self,
        id: Uuid,
        worker_name: &str,
    ) -> SchedulerResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // 删除成功的一方即为赢家
        let row = sqlx::query("DELETE FROM requested_tasks WHERE id = ? RETURNING doc")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            debug!("任务 {} 已被领取或不存在", id);
            return Ok(ClaimOutcome::AlreadyClaimed);
        };

        let requested: RequestedTask = from_doc(&row)?;
        let task = Task::from_requested(requested, worker_name);
        sqlx::query("INSERT INTO tasks (id, status, terminal, doc) VALUES (?, ?, ?, ?)")
            .bind(task.id.to_string())
            .bind(task.status.as_str())
            .bind(task.is_terminal())
            .bind(to_doc(&task)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Claimed(Box::new(task)))
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn get_task(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query("SELECT doc FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn modify_task<'a>(&self, id: Uuid, mut mutation: TaskMutation<'a>) -> SchedulerResult<Task> {
        for attempt in 1..=MAX_MODIFY_ATTEMPTS {
            let row = sqlx::query("SELECT version, doc FROM tasks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| SchedulerError::task_not_found(id))?;
            let version: i64 = row.try_get("version")?;
            let mut task: Task = from_doc(&row)?;
            if !mutation(&mut task) {
                return Ok(task);
            }

            // 版本号不变才写回，否则基于最新文档重做
            let result = sqlx::query(
                r#"
                UPDATE tasks SET status = ?, terminal = ?, doc = ?, version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(task.status.as_str())
            .bind(task.is_terminal())
            .bind(to_doc(&task)?)
            .bind(id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(task);
            }
            debug!(task_id = %id, attempt, "任务文档已被并发修改，重试");
        }
        Err(SchedulerError::Conflict(format!("任务 {id} 并发修改过多")))
    }

    async fn list_running_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query("SELECT doc FROM tasks WHERE terminal = 0")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(from_doc).collect()
    }
}

#[async_trait]
impl ScheduleDurationRepository for SqliteStore {
    async fn get_duration(
        &self,
        schedule_name: &str,
        scope: &DurationScope,
    ) -> SchedulerResult<Option<ScheduleDuration>> {
        let row = sqlx::query("SELECT doc FROM schedule_durations WHERE schedule_name = ? AND scope = ?")
            .bind(schedule_name)
            .bind(scope_key(scope))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn upsert_duration(&self, duration: &ScheduleDuration) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_durations (schedule_name, scope, doc) VALUES (?, ?, ?)
            ON CONFLICT(schedule_name, scope) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(&duration.schedule_name)
        .bind(scope_key(&duration.scope))
        .bind(to_doc(duration)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleRepository for SqliteStore {
    async fn link_most_recent_task(
        &self,
        schedule_name: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (name, most_recent_task, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                most_recent_task = excluded.most_recent_task,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(schedule_name)
        .bind(task_id.to_string())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn most_recent_task(&self, schedule_name: &str) -> SchedulerResult<Option<Uuid>> {
        let row = sqlx::query("SELECT most_recent_task FROM schedules WHERE name = ?")
            .bind(schedule_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("most_recent_task")?;
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| SchedulerError::Serialization(format!("无效的任务ID {raw}: {e}")))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }
}
