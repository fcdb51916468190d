//! SQLite pool construction and idempotent schema creation.
//!
//! Two database files live under `company/` in the state directory:
//! `channels.db` (channels, members, messages) and `tasks.db` (tasks, logs,
//! dependencies). Schema is created on open; concurrent readers are
//! unrestricted and writers are serialized by SQLite.

use crate::error::Result;
use crate::now_ms;
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Name of the channel seeded at first startup.
pub const SEED_CHANNEL_NAME: &str = "investor-relations";

/// Members of the seed channel.
pub const SEED_CHANNEL_MEMBERS: [&str; 2] = ["investor", "main"];

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open SQLite database: {}", path.display()))?;

    Ok(pool)
}

/// Open the channels database, create its schema, and seed the
/// `investor-relations` channel if it does not exist yet.
pub async fn open_channels_db(path: &Path) -> Result<SqlitePool> {
    let pool = open_pool(path).await?;
    init_channels_schema(&pool).await?;
    seed_channels(&pool).await?;
    Ok(pool)
}

/// Open the tasks database and create its schema.
pub async fn open_tasks_db(path: &Path) -> Result<SqlitePool> {
    let pool = open_pool(path).await?;
    init_tasks_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_channels_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            channel_type TEXT NOT NULL DEFAULT 'public',
            description TEXT NOT NULL DEFAULT '',
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create channels table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_members (
            channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            member_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at INTEGER NOT NULL,
            PRIMARY KEY (channel_id, member_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create channel_members table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_messages (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            sender_id TEXT NOT NULL,
            body TEXT NOT NULL,
            thread_id TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create channel_messages table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_channel_time \
         ON channel_messages(channel_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_thread \
         ON channel_messages(thread_id) WHERE thread_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_member ON channel_members(member_id)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn init_tasks_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            parent_task_id TEXT REFERENCES tasks(id),
            objective TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            priority TEXT NOT NULL DEFAULT 'medium',
            progress_summary TEXT NOT NULL DEFAULT '',
            artifacts TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            last_heartbeat_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create tasks table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_logs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            agent_id TEXT NOT NULL,
            log_type TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create task_logs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_dependencies (
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            depends_on_task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            PRIMARY KEY (task_id, depends_on_task_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create task_dependencies table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_parent \
         ON tasks(parent_task_id) WHERE parent_task_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_logs_task_time ON task_logs(task_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_deps_depends_on \
         ON task_dependencies(depends_on_task_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Ensure the `investor-relations` channel exists with its two members.
/// Idempotent; runs on every open.
pub async fn seed_channels(pool: &SqlitePool) -> Result<()> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM channels WHERE name = ?")
        .bind(SEED_CHANNEL_NAME)
        .fetch_optional(pool)
        .await
        .context("failed to look up seed channel")?;

    if existing.is_some() {
        return Ok(());
    }

    let now = now_ms();
    let channel_id = uuid::Uuid::new_v4().to_string();

    let mut tx = pool
        .begin()
        .await
        .context("failed to open seed transaction")?;

    sqlx::query(
        "INSERT INTO channels (id, name, channel_type, description, created_by, created_at) \
         VALUES (?, ?, 'private', 'Investor updates and asks', 'main', ?)",
    )
    .bind(&channel_id)
    .bind(SEED_CHANNEL_NAME)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to insert seed channel")?;

    for member_id in SEED_CHANNEL_MEMBERS {
        let role = if member_id == "main" { "admin" } else { "member" };
        sqlx::query(
            "INSERT INTO channel_members (channel_id, member_id, role, joined_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&channel_id)
        .bind(member_id)
        .bind(role)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert seed channel member")?;
    }

    tx.commit()
        .await
        .context("failed to commit seed transaction")?;

    tracing::info!(channel = SEED_CHANNEL_NAME, "seeded startup channel");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_channels_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("foreign keys should enable");
    init_channels_schema(&pool)
        .await
        .expect("channels schema should be created");
    pool
}

#[cfg(test)]
pub(crate) async fn memory_tasks_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("foreign keys should enable");
    init_tasks_schema(&pool)
        .await
        .expect("tasks schema should be created");
    pool
}
