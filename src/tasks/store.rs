//! Task-thread CRUD storage (SQLite): tasks, logs, dependencies.

use crate::error::{Result, StoreError};
use crate::{now_ms, EpochMillis, TaskEvent};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Blocked,
    Waiting,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Active,
        TaskStatus::Blocked,
        TaskStatus::Waiting,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TaskStatus::Active),
            "blocked" => Some(TaskStatus::Blocked),
            "waiting" => Some(TaskStatus::Waiting),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are the only ones carrying `completed_at`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(TaskPriority::Critical),
            "high" => Some(TaskPriority::High),
            "medium" => Some(TaskPriority::Medium),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogType {
    Created,
    Updated,
    Progress,
    Checkpoint,
    Error,
    Heartbeat,
    Blocked,
    Unblocked,
    Completed,
    Failed,
    Reassigned,
}

impl TaskLogType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskLogType::Created => "created",
            TaskLogType::Updated => "updated",
            TaskLogType::Progress => "progress",
            TaskLogType::Checkpoint => "checkpoint",
            TaskLogType::Error => "error",
            TaskLogType::Heartbeat => "heartbeat",
            TaskLogType::Blocked => "blocked",
            TaskLogType::Unblocked => "unblocked",
            TaskLogType::Completed => "completed",
            TaskLogType::Failed => "failed",
            TaskLogType::Reassigned => "reassigned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(TaskLogType::Created),
            "updated" => Some(TaskLogType::Updated),
            "progress" => Some(TaskLogType::Progress),
            "checkpoint" => Some(TaskLogType::Checkpoint),
            "error" => Some(TaskLogType::Error),
            "heartbeat" => Some(TaskLogType::Heartbeat),
            "blocked" => Some(TaskLogType::Blocked),
            "unblocked" => Some(TaskLogType::Unblocked),
            "completed" => Some(TaskLogType::Completed),
            "failed" => Some(TaskLogType::Failed),
            "reassigned" => Some(TaskLogType::Reassigned),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskLogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub parent_task_id: Option<String>,
    pub objective: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress_summary: String,
    pub artifacts: Vec<String>,
    /// Prerequisite task ids, materialized from the dependency table.
    pub depends_on: Vec<String>,
    pub metadata: Value,
    pub last_heartbeat_at: Option<EpochMillis>,
    pub created_at: EpochMillis,
    pub updated_at: EpochMillis,
    pub completed_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub log_type: TaskLogType,
    pub message: String,
    pub metadata: Option<Value>,
    pub created_at: EpochMillis,
}

#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub agent_id: String,
    pub objective: String,
    pub parent_task_id: Option<String>,
    pub priority: TaskPriority,
    pub dependencies: Vec<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInput {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub progress_summary: Option<String>,
    pub objective: Option<String>,
    pub agent_id: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub agent_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub parent_task_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub before: Option<EpochMillis>,
}

/// Aggregate counts for the dashboard summary view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub active: i64,
    pub blocked: i64,
    pub waiting: i64,
    pub done: i64,
    pub failed: i64,
    pub total: i64,
    pub stale: i64,
}

/// Per-agent counts plus the most recent heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskSummary {
    pub agent_id: String,
    pub active: i64,
    pub blocked: i64,
    pub waiting: i64,
    pub done: i64,
    pub failed: i64,
    pub total: i64,
    pub last_heartbeat_at: Option<EpochMillis>,
}

#[derive(Debug)]
pub struct TaskStore {
    pool: SqlitePool,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { pool, events }
    }

    /// Subscribe to task events. Events are emitted only after the owning
    /// transaction has committed.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Publish an event on the task stream. Used by the watchdog for
    /// `task.stale`, which has no store mutation of its own.
    pub fn emit(&self, event: TaskEvent) {
        self.events.send(event).ok();
    }

    pub async fn create_task(&self, input: CreateTaskInput) -> Result<Task> {
        let now = now_ms();
        let task_id = uuid::Uuid::new_v4().to_string();
        let metadata_json = input.metadata.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open task create transaction")?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, agent_id, parent_task_id, objective, status, priority,
                progress_summary, artifacts, metadata, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'active', ?, '', '[]', ?, ?, ?)
            "#,
        )
        .bind(&task_id)
        .bind(&input.agent_id)
        .bind(&input.parent_task_id)
        .bind(&input.objective)
        .bind(input.priority.as_str())
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert task")?;

        for depends_on in &input.dependencies {
            sqlx::query(
                "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?) \
                 ON CONFLICT (task_id, depends_on_task_id) DO NOTHING",
            )
            .bind(&task_id)
            .bind(depends_on)
            .execute(&mut *tx)
            .await
            .context("failed to insert task dependency")?;
        }

        insert_log(
            &mut tx,
            &task_id,
            &input.agent_id,
            TaskLogType::Created,
            &format!("task created: {}", input.objective),
            None,
            now,
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit task create transaction")?;

        let task = self
            .get_task(&task_id)
            .await?
            .context("task inserted but not found")?;

        self.emit(TaskEvent::Created { task: task.clone() });
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&select_task_sql("WHERE id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch task")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut task = task_from_row(row)?;
        task.depends_on = self.get_dependencies(&task.id).await?;
        Ok(Some(task))
    }

    /// Apply a partial update. Returns `None` for a missing task.
    ///
    /// `updated_at` is clamped monotonic. A transition into `done`/`failed`
    /// pins `completed_at` to the first such transition; leaving a terminal
    /// state clears it. Each update appends exactly one log entry, typed by
    /// the most significant change.
    pub async fn update_task(&self, task_id: &str, patch: UpdateTaskInput) -> Result<Option<Task>> {
        let Some(current) = self.get_task(task_id).await? else {
            return Ok(None);
        };

        let now = now_ms();
        let next_status = patch.status.unwrap_or(current.status);
        let next_priority = patch.priority.unwrap_or(current.priority);
        let next_objective = patch.objective.clone().unwrap_or(current.objective.clone());
        let next_summary = patch
            .progress_summary
            .clone()
            .unwrap_or(current.progress_summary.clone());
        let next_agent = patch.agent_id.clone().unwrap_or(current.agent_id.clone());
        let next_artifacts = patch.artifacts.clone().unwrap_or(current.artifacts.clone());
        let next_metadata = merge_json_object(current.metadata.clone(), patch.metadata.clone());

        let artifacts_json =
            serde_json::to_string(&next_artifacts).context("failed to serialize artifacts")?;

        let entered_terminal = next_status.is_terminal() && !current.status.is_terminal();
        let reassigned = next_agent != current.agent_id;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open task update transaction")?;

        let mut sql = String::from(
            "UPDATE tasks SET agent_id = ?, objective = ?, status = ?, priority = ?, \
             progress_summary = ?, artifacts = ?, metadata = ?, \
             updated_at = MAX(updated_at, ?)",
        );
        if next_status.is_terminal() {
            sql.push_str(", completed_at = COALESCE(completed_at, ?)");
        } else {
            sql.push_str(", completed_at = NULL");
        }
        sql.push_str(" WHERE id = ?");

        let mut stmt = sqlx::query(&sql)
            .bind(&next_agent)
            .bind(&next_objective)
            .bind(next_status.as_str())
            .bind(next_priority.as_str())
            .bind(&next_summary)
            .bind(&artifacts_json)
            .bind(next_metadata.to_string())
            .bind(now);
        if next_status.is_terminal() {
            stmt = stmt.bind(now);
        }
        stmt.bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to update task")?;

        let (log_type, log_message) = if entered_terminal {
            match next_status {
                TaskStatus::Failed => (TaskLogType::Failed, "task failed".to_string()),
                _ => (TaskLogType::Completed, "task completed".to_string()),
            }
        } else if reassigned {
            (
                TaskLogType::Reassigned,
                format!("reassigned {} -> {}", current.agent_id, next_agent),
            )
        } else if next_status == TaskStatus::Blocked && current.status != TaskStatus::Blocked {
            (TaskLogType::Blocked, "task blocked".to_string())
        } else if current.status == TaskStatus::Blocked && next_status != TaskStatus::Blocked {
            (TaskLogType::Unblocked, "task unblocked".to_string())
        } else {
            (TaskLogType::Updated, "task updated".to_string())
        };

        insert_log(&mut tx, task_id, &next_agent, log_type, &log_message, None, now).await?;

        tx.commit()
            .await
            .context("failed to commit task update transaction")?;

        let task = self
            .get_task(task_id)
            .await?
            .context("task updated but not found")?;

        self.emit(TaskEvent::Updated { task: task.clone() });
        if entered_terminal {
            match next_status {
                TaskStatus::Failed => self.emit(TaskEvent::Failed { task: task.clone() }),
                _ => self.emit(TaskEvent::Completed { task: task.clone() }),
            }
        }

        Ok(Some(task))
    }

    /// Record a liveness heartbeat. Appends a `heartbeat` log only when a
    /// message accompanies it.
    pub async fn heartbeat(
        &self,
        task_id: &str,
        agent_id: &str,
        message: Option<&str>,
    ) -> Result<Option<Task>> {
        if self.get_task(task_id).await?.is_none() {
            return Ok(None);
        }

        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open heartbeat transaction")?;

        sqlx::query(
            "UPDATE tasks SET last_heartbeat_at = ?, updated_at = MAX(updated_at, ?) WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to record heartbeat")?;

        if let Some(message) = message {
            insert_log(
                &mut tx,
                task_id,
                agent_id,
                TaskLogType::Heartbeat,
                message,
                None,
                now,
            )
            .await?;
        }

        tx.commit()
            .await
            .context("failed to commit heartbeat transaction")?;

        let task = self
            .get_task(task_id)
            .await?
            .context("task heartbeat but not found")?;

        self.emit(TaskEvent::Heartbeat { task: task.clone() });
        Ok(Some(task))
    }

    pub async fn append_log(
        &self,
        task_id: &str,
        agent_id: &str,
        log_type: TaskLogType,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<TaskLogEntry> {
        if self.get_task(task_id).await?.is_none() {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            }
            .into());
        }

        let now = now_ms();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open log transaction")?;
        let (entry_id, created_at) = insert_log(
            &mut tx,
            task_id,
            agent_id,
            log_type,
            message,
            metadata.clone(),
            now,
        )
        .await?;
        tx.commit()
            .await
            .context("failed to commit log transaction")?;

        let entry = TaskLogEntry {
            id: entry_id,
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            log_type,
            message: message.to_string(),
            metadata,
            created_at,
        };

        self.emit(TaskEvent::Log {
            entry: entry.clone(),
        });
        Ok(entry)
    }

    /// Logs in ascending timestamp order. The internal query is descending
    /// (newest `limit` entries); the boundary reverses it.
    pub async fn get_logs(&self, task_id: &str, query: LogQuery) -> Result<Vec<TaskLogEntry>> {
        let limit = query
            .limit
            .unwrap_or(crate::config::DEFAULT_LOG_LIMIT)
            .max(0);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, task_id, agent_id, log_type, message, metadata, created_at \
             FROM task_logs WHERE task_id = ?",
        );
        if query.before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut stmt = sqlx::query(&sql).bind(task_id);
        if let Some(before) = query.before {
            stmt = stmt.bind(before);
        }
        let rows = stmt
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch task logs")?;

        let mut entries: Vec<TaskLogEntry> =
            rows.into_iter().map(log_from_row).collect::<Result<_>>()?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let mut sql = select_task_sql("WHERE 1 = 1");
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.parent_task_id.is_some() {
            sql.push_str(" AND parent_task_id = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC LIMIT ?");

        let mut stmt = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            stmt = stmt.bind(agent_id);
        }
        if let Some(status) = filter.status {
            stmt = stmt.bind(status.as_str());
        }
        if let Some(parent) = &filter.parent_task_id {
            stmt = stmt.bind(parent);
        }
        let rows = stmt
            .bind(filter.limit.unwrap_or(crate::config::DEFAULT_TASK_LIMIT).max(0))
            .fetch_all(&self.pool)
            .await
            .context("failed to list tasks")?;

        self.materialize(rows).await
    }

    /// Active or blocked tasks whose heartbeat is missing or older than the
    /// threshold, skipping tasks too young to have been expected to report.
    /// Oldest stalls surface first.
    pub async fn get_stale_tasks(&self, threshold_ms: i64) -> Result<Vec<Task>> {
        let cutoff = now_ms() - threshold_ms;
        let rows = sqlx::query(&select_task_sql(
            "WHERE status IN ('active', 'blocked') \
             AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?) \
             AND created_at < ? \
             ORDER BY updated_at ASC, id ASC",
        ))
        .bind(cutoff)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to scan for stale tasks")?;

        self.materialize(rows).await
    }

    pub async fn get_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT depends_on_task_id FROM task_dependencies \
             WHERE task_id = ? ORDER BY depends_on_task_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch task dependencies")?;
        Ok(rows)
    }

    pub async fn get_dependents(&self, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT task_id FROM task_dependencies \
             WHERE depends_on_task_id = ? ORDER BY task_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch task dependents")?;
        Ok(rows)
    }

    /// Add a dependency edge. Idempotent; cycles are stored without
    /// complaint — acyclicity policy lives in the scheduler above the core.
    pub async fn add_dependency(&self, task_id: &str, depends_on_task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?) \
             ON CONFLICT (task_id, depends_on_task_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(&self.pool)
        .await
        .context("failed to add task dependency")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_dependency(&self, task_id: &str, depends_on_task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(&self.pool)
        .await
        .context("failed to remove task dependency")?;

        Ok(result.rows_affected() > 0)
    }

    /// Direct children, oldest first.
    pub async fn get_subtasks(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&select_task_sql(
            "WHERE parent_task_id = ? ORDER BY created_at ASC, id ASC",
        ))
        .bind(parent_task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch subtasks")?;

        self.materialize(rows).await
    }

    pub async fn get_summary(&self) -> Result<TaskSummary> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed to summarize tasks")?;

        let mut summary = TaskSummary {
            active: 0,
            blocked: 0,
            waiting: 0,
            done: 0,
            failed: 0,
            total: 0,
            stale: 0,
        };
        for row in rows {
            let status: String = row.try_get("status").context("failed to read status")?;
            let count: i64 = row.try_get("count").context("failed to read count")?;
            summary.total += count;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Active) => summary.active = count,
                Some(TaskStatus::Blocked) => summary.blocked = count,
                Some(TaskStatus::Waiting) => summary.waiting = count,
                Some(TaskStatus::Done) => summary.done = count,
                Some(TaskStatus::Failed) => summary.failed = count,
                None => {}
            }
        }

        summary.stale = self
            .get_stale_tasks(crate::config::DEFAULT_STALE_THRESHOLD_MS)
            .await?
            .len() as i64;
        Ok(summary)
    }

    pub async fn get_agent_summaries(&self) -> Result<Vec<AgentTaskSummary>> {
        let rows = sqlx::query(
            "SELECT agent_id, status, COUNT(*) AS count, MAX(last_heartbeat_at) AS last_heartbeat \
             FROM tasks GROUP BY agent_id, status ORDER BY agent_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to summarize tasks per agent")?;

        let mut summaries: Vec<AgentTaskSummary> = Vec::new();
        for row in rows {
            let agent_id: String = row.try_get("agent_id").context("failed to read agent_id")?;
            let status: String = row.try_get("status").context("failed to read status")?;
            let count: i64 = row.try_get("count").context("failed to read count")?;
            let last_heartbeat: Option<EpochMillis> = row.try_get("last_heartbeat").ok().flatten();

            let summary = match summaries.iter_mut().find(|s| s.agent_id == agent_id) {
                Some(summary) => summary,
                None => {
                    summaries.push(AgentTaskSummary {
                        agent_id: agent_id.clone(),
                        active: 0,
                        blocked: 0,
                        waiting: 0,
                        done: 0,
                        failed: 0,
                        total: 0,
                        last_heartbeat_at: None,
                    });
                    summaries.last_mut().expect("just pushed")
                }
            };

            summary.total += count;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Active) => summary.active = count,
                Some(TaskStatus::Blocked) => summary.blocked = count,
                Some(TaskStatus::Waiting) => summary.waiting = count,
                Some(TaskStatus::Done) => summary.done = count,
                Some(TaskStatus::Failed) => summary.failed = count,
                None => {}
            }
            summary.last_heartbeat_at = summary.last_heartbeat_at.max(last_heartbeat);
        }

        Ok(summaries)
    }

    async fn materialize(&self, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task = task_from_row(row)?;
            task.depends_on = self.get_dependencies(&task.id).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

fn select_task_sql(suffix: &str) -> String {
    format!(
        "SELECT id, agent_id, parent_task_id, objective, status, priority, progress_summary, \
         artifacts, metadata, last_heartbeat_at, created_at, updated_at, completed_at \
         FROM tasks {suffix}"
    )
}

async fn insert_log(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: &str,
    agent_id: &str,
    log_type: TaskLogType,
    message: &str,
    metadata: Option<Value>,
    at: EpochMillis,
) -> Result<(String, EpochMillis)> {
    // Clamp past the newest entry so append order survives
    // same-millisecond bursts.
    let newest: Option<EpochMillis> =
        sqlx::query_scalar("SELECT MAX(created_at) FROM task_logs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&mut **tx)
            .await
            .context("failed to read newest log timestamp")?;
    let created_at = at.max(newest.map_or(0, |value| value + 1));

    let entry_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO task_logs (id, task_id, agent_id, log_type, message, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry_id)
    .bind(task_id)
    .bind(agent_id)
    .bind(log_type.as_str())
    .bind(message)
    .bind(metadata.as_ref().map(Value::to_string))
    .bind(created_at)
    .execute(&mut **tx)
    .await
    .context("failed to insert task log")?;
    Ok((entry_id, created_at))
}

fn merge_json_object(current: Value, patch: Option<Value>) -> Value {
    let Some(patch) = patch else {
        return current;
    };

    let mut merged = current.as_object().cloned().unwrap_or_default();
    if let Some(patch_object) = patch.as_object() {
        for (key, value) in patch_object {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

fn parse_artifacts(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}

fn parse_metadata(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Task> {
    let status_value: String = row.try_get("status").context("failed to read task status")?;
    let priority_value: String = row
        .try_get("priority")
        .context("failed to read task priority")?;
    let artifacts_value: String = row.try_get("artifacts").unwrap_or_else(|_| "[]".to_string());
    let metadata_value: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());

    let status = TaskStatus::parse(&status_value)
        .with_context(|| format!("invalid task status in database: {status_value}"))?;
    let priority = TaskPriority::parse(&priority_value)
        .with_context(|| format!("invalid task priority in database: {priority_value}"))?;

    Ok(Task {
        id: row.try_get("id").context("failed to read task id")?,
        agent_id: row
            .try_get("agent_id")
            .context("failed to read task agent_id")?,
        parent_task_id: row.try_get("parent_task_id").ok().flatten(),
        objective: row
            .try_get("objective")
            .context("failed to read task objective")?,
        status,
        priority,
        progress_summary: row
            .try_get("progress_summary")
            .context("failed to read task progress_summary")?,
        artifacts: parse_artifacts(&artifacts_value),
        depends_on: Vec::new(),
        metadata: parse_metadata(&metadata_value),
        last_heartbeat_at: row.try_get("last_heartbeat_at").ok().flatten(),
        created_at: row
            .try_get("created_at")
            .context("failed to read task created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read task updated_at")?,
        completed_at: row.try_get("completed_at").ok().flatten(),
    })
}

fn log_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskLogEntry> {
    let type_value: String = row.try_get("log_type").context("failed to read log_type")?;
    let log_type = TaskLogType::parse(&type_value)
        .with_context(|| format!("invalid task log type in database: {type_value}"))?;
    let metadata: Option<String> = row.try_get("metadata").ok().flatten();

    Ok(TaskLogEntry {
        id: row.try_get("id").context("failed to read log id")?,
        task_id: row.try_get("task_id").context("failed to read log task_id")?,
        agent_id: row
            .try_get("agent_id")
            .context("failed to read log agent_id")?,
        log_type,
        message: row.try_get("message").context("failed to read log message")?,
        metadata: metadata.and_then(|value| serde_json::from_str(&value).ok()),
        created_at: row
            .try_get("created_at")
            .context("failed to read log created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_tasks_pool;

    async fn setup_store() -> TaskStore {
        TaskStore::new(memory_tasks_pool().await)
    }

    fn create_input(agent_id: &str, objective: &str) -> CreateTaskInput {
        CreateTaskInput {
            agent_id: agent_id.to_string(),
            objective: objective.to_string(),
            parent_task_id: None,
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }

    /// Backdate a task so stale scans and threshold checks can be exercised
    /// without sleeping.
    async fn backdate(store: &TaskStore, task_id: &str, by_ms: i64) {
        sqlx::query(
            "UPDATE tasks SET created_at = created_at - ?, updated_at = updated_at - ? \
             WHERE id = ?",
        )
        .bind(by_ms)
        .bind(by_ms)
        .bind(task_id)
        .execute(&store.pool)
        .await
        .expect("backdate should succeed");
    }

    #[tokio::test]
    async fn lifecycle_logs_and_events_in_order() {
        let store = setup_store().await;
        let mut events = store.subscribe();

        let task = store
            .create_task(CreateTaskInput {
                priority: TaskPriority::High,
                ..create_input("builder", "ship v1")
            })
            .await
            .expect("task should be created");
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.priority, TaskPriority::High);
        assert!(task.completed_at.is_none());

        store
            .heartbeat(&task.id, "builder", Some("on it"))
            .await
            .expect("heartbeat should succeed")
            .expect("task should exist");
        store
            .heartbeat(&task.id, "builder", Some("still going"))
            .await
            .expect("heartbeat should succeed")
            .expect("task should exist");

        let done = store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Done),
                    progress_summary: Some("shipped".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed")
            .expect("task should exist");
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress_summary, "shipped");
        assert!(done.completed_at.is_some());

        let logs = store
            .get_logs(&task.id, LogQuery::default())
            .await
            .expect("logs should load");
        let types: Vec<TaskLogType> = logs.iter().map(|entry| entry.log_type).collect();
        assert_eq!(
            types,
            [
                TaskLogType::Created,
                TaskLogType::Heartbeat,
                TaskLogType::Heartbeat,
                TaskLogType::Completed,
            ]
        );

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            [
                "task.created",
                "task.heartbeat",
                "task.heartbeat",
                "task.updated",
                "task.completed",
            ]
        );
    }

    #[tokio::test]
    async fn first_terminal_transition_pins_completed_at() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        let first = store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed")
            .expect("task should exist");
        let pinned = first.completed_at.expect("completed_at should be set");

        let mut events = store.subscribe();
        let second = store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed")
            .expect("task should exist");
        assert_eq!(second.completed_at, Some(pinned));

        // Repeating the terminal status is not a transition: updated only.
        let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.kind())
            .collect();
        assert_eq!(kinds, ["task.updated"]);
    }

    #[tokio::test]
    async fn leaving_terminal_clears_completed_at() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed");

        let reopened = store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed")
            .expect("task should exist");
        assert_eq!(reopened.status, TaskStatus::Active);
        assert!(reopened.completed_at.is_none());
    }

    #[tokio::test]
    async fn updated_at_never_moves_backwards() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        let mut previous = task.updated_at;
        for _ in 0..3 {
            let updated = store
                .update_task(
                    &task.id,
                    UpdateTaskInput {
                        progress_summary: Some("progress".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .expect("update should succeed")
                .expect("task should exist");
            assert!(updated.updated_at >= previous);
            previous = updated.updated_at;
        }
    }

    #[tokio::test]
    async fn update_of_missing_task_is_none() {
        let store = setup_store().await;
        let patched = store
            .update_task("no-such-task", UpdateTaskInput::default())
            .await
            .expect("update should succeed");
        assert!(patched.is_none());
    }

    #[tokio::test]
    async fn blocked_and_unblocked_transitions_are_logged() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Blocked),
                    ..Default::default()
                },
            )
            .await
            .expect("block should succeed");
        store
            .update_task(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .expect("unblock should succeed");

        let logs = store
            .get_logs(&task.id, LogQuery::default())
            .await
            .expect("logs should load");
        let types: Vec<TaskLogType> = logs.iter().map(|entry| entry.log_type).collect();
        assert_eq!(
            types,
            [
                TaskLogType::Created,
                TaskLogType::Blocked,
                TaskLogType::Unblocked,
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_updates_latest_timestamp() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        let first = store
            .heartbeat(&task.id, "builder", None)
            .await
            .expect("heartbeat should succeed")
            .expect("task should exist")
            .last_heartbeat_at
            .expect("heartbeat should be recorded");

        let second = store
            .heartbeat(&task.id, "builder", None)
            .await
            .expect("heartbeat should succeed")
            .expect("task should exist")
            .last_heartbeat_at
            .expect("heartbeat should be recorded");
        assert!(second >= first);

        // No message, no heartbeat log rows.
        let logs = store
            .get_logs(&task.id, LogQuery::default())
            .await
            .expect("logs should load");
        assert!(logs
            .iter()
            .all(|entry| entry.log_type != TaskLogType::Heartbeat));
    }

    #[tokio::test]
    async fn dependencies_round_trip_and_cascade() {
        let store = setup_store().await;
        let dep = store
            .create_task(create_input("builder", "groundwork"))
            .await
            .expect("dependency task should be created");
        let task = store
            .create_task(CreateTaskInput {
                dependencies: vec![dep.id.clone()],
                ..create_input("builder", "ship")
            })
            .await
            .expect("task should be created");

        assert_eq!(task.depends_on, vec![dep.id.clone()]);
        assert_eq!(
            store
                .get_dependents(&dep.id)
                .await
                .expect("dependents should load"),
            vec![task.id.clone()]
        );

        assert!(!store
            .add_dependency(&task.id, &dep.id)
            .await
            .expect("re-add should succeed"));
        assert!(store
            .remove_dependency(&task.id, &dep.id)
            .await
            .expect("remove should succeed"));
        assert!(!store
            .remove_dependency(&task.id, &dep.id)
            .await
            .expect("second remove should succeed"));
    }

    #[tokio::test]
    async fn unknown_dependency_fails_the_whole_create() {
        let store = setup_store().await;
        let result = store
            .create_task(CreateTaskInput {
                dependencies: vec!["no-such-task".to_string()],
                ..create_input("builder", "ship")
            })
            .await;
        assert!(result.is_err());

        // The transaction rolled back: no orphan task row.
        let tasks = store
            .list_tasks(TaskFilter::default())
            .await
            .expect("list should succeed");
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn subtasks_list_in_creation_order() {
        let store = setup_store().await;
        let parent = store
            .create_task(create_input("builder", "epic"))
            .await
            .expect("parent should be created");

        for index in 0..3 {
            store
                .create_task(CreateTaskInput {
                    parent_task_id: Some(parent.id.clone()),
                    ..create_input("builder", &format!("part {index}"))
                })
                .await
                .expect("subtask should be created");
        }

        let subtasks = store
            .get_subtasks(&parent.id)
            .await
            .expect("subtasks should load");
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks
            .iter()
            .all(|task| task.parent_task_id.as_deref() == Some(parent.id.as_str())));
    }

    #[tokio::test]
    async fn stale_scan_skips_young_tasks_and_heartbeating_tasks() {
        let store = setup_store().await;
        let threshold = 60_000;

        let young = store
            .create_task(create_input("builder", "fresh"))
            .await
            .expect("task should be created");
        let old_silent = store
            .create_task(create_input("builder", "stalled"))
            .await
            .expect("task should be created");
        let old_beating = store
            .create_task(create_input("builder", "alive"))
            .await
            .expect("task should be created");
        let old_done = store
            .create_task(create_input("builder", "finished"))
            .await
            .expect("task should be created");

        backdate(&store, &old_silent.id, threshold * 2).await;
        backdate(&store, &old_beating.id, threshold * 2).await;
        backdate(&store, &old_done.id, threshold * 2).await;

        store
            .heartbeat(&old_beating.id, "builder", None)
            .await
            .expect("heartbeat should succeed");
        store
            .update_task(
                &old_done.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed");

        let stale = store
            .get_stale_tasks(threshold)
            .await
            .expect("stale scan should succeed");
        let ids: Vec<&str> = stale.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, [old_silent.id.as_str()]);
        assert!(!ids.contains(&young.id.as_str()));
    }

    #[tokio::test]
    async fn logs_paginate_descending_internally_ascending_out() {
        let store = setup_store().await;
        let task = store
            .create_task(create_input("builder", "ship"))
            .await
            .expect("task should be created");

        for index in 0..5 {
            store
                .append_log(
                    &task.id,
                    "builder",
                    TaskLogType::Progress,
                    &format!("step {index}"),
                    None,
                )
                .await
                .expect("log should append");
        }

        let limited = store
            .get_logs(
                &task.id,
                LogQuery {
                    limit: Some(2),
                    before: None,
                },
            )
            .await
            .expect("logs should load");
        assert_eq!(limited.len(), 2);
        // Newest two, oldest of the pair first.
        assert_eq!(limited[0].message, "step 3");
        assert_eq!(limited[1].message, "step 4");
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let store = setup_store().await;
        let a = store
            .create_task(create_input("builder", "one"))
            .await
            .expect("task should be created");
        store
            .create_task(create_input("builder", "two"))
            .await
            .expect("task should be created");
        store
            .create_task(create_input("scout", "three"))
            .await
            .expect("task should be created");

        store
            .update_task(
                &a.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .expect("update should succeed");

        let summary = store.get_summary().await.expect("summary should load");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.done, 1);

        let agents = store
            .get_agent_summaries()
            .await
            .expect("agent summaries should load");
        let builder = agents
            .iter()
            .find(|summary| summary.agent_id == "builder")
            .expect("builder summary");
        assert_eq!(builder.total, 2);
        assert_eq!(builder.done, 1);
        let scout = agents
            .iter()
            .find(|summary| summary.agent_id == "scout")
            .expect("scout summary");
        assert_eq!(scout.active, 1);
    }
}
