//! Channel CRUD storage (SQLite): channels, members, messages.

use crate::error::{Result, StoreError};
use crate::{now_ms, ChannelEvent, EpochMillis};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Public,
    Private,
    Dm,
}

impl ChannelType {
    pub const ALL: [ChannelType; 3] = [ChannelType::Public, ChannelType::Private, ChannelType::Dm];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Public => "public",
            ChannelType::Private => "private",
            ChannelType::Dm => "dm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(ChannelType::Public),
            "private" => Some(ChannelType::Private),
            "dm" => Some(ChannelType::Dm),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub description: String,
    pub created_by: String,
    pub created_at: EpochMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub channel_id: String,
    pub member_id: String,
    pub role: MemberRole,
    pub joined_at: EpochMillis,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelWithMembers {
    #[serde(flatten)]
    pub channel: Channel,
    pub members: Vec<ChannelMember>,
}

/// Listing entry: the channel plus the freshest message and a member count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPreview {
    #[serde(flatten)]
    pub channel: Channel,
    pub member_count: i64,
    pub last_message: Option<ChannelMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: EpochMillis,
}

#[derive(Debug, Clone)]
pub struct CreateChannelInput {
    pub name: String,
    pub channel_type: ChannelType,
    pub description: String,
    pub created_by: String,
    /// Defaults to `[created_by]` when empty. The creator is always forced
    /// in as `admin` regardless of what the caller lists.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<i64>,
    /// Exclusive upper bound on `created_at`; defaults to now.
    pub before: Option<EpochMillis>,
    /// When set, only messages in that thread; otherwise root-level only.
    pub thread_id: Option<String>,
}

#[derive(Debug)]
pub struct ChannelStore {
    pool: SqlitePool,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { pool, events }
    }

    /// Subscribe to channel events. Events are emitted only after the owning
    /// transaction has committed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn create_channel(&self, input: CreateChannelInput) -> Result<ChannelWithMembers> {
        let now = now_ms();
        let channel_id = uuid::Uuid::new_v4().to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open channel create transaction")?;

        let insert_result = sqlx::query(
            "INSERT INTO channels (id, name, channel_type, description, created_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&channel_id)
        .bind(&input.name)
        .bind(input.channel_type.as_str())
        .bind(&input.description)
        .bind(&input.created_by)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match insert_result {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_error))
                if db_error.code().as_deref() == Some("2067") =>
            {
                return Err(StoreError::AlreadyExists {
                    entity: "channel",
                    id: input.name.clone(),
                }
                .into());
            }
            Err(error) => {
                return Err(anyhow::anyhow!("failed to insert channel: {error}").into());
            }
        }

        // Creator first as admin, then the rest in caller order, deduped.
        let mut member_rows: Vec<(&str, MemberRole)> =
            vec![(input.created_by.as_str(), MemberRole::Admin)];
        for member_id in &input.members {
            if member_rows.iter().all(|(id, _)| id != member_id) {
                member_rows.push((member_id.as_str(), MemberRole::Member));
            }
        }

        for (member_id, role) in &member_rows {
            sqlx::query(
                "INSERT INTO channel_members (channel_id, member_id, role, joined_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&channel_id)
            .bind(member_id)
            .bind(role.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to insert channel member")?;
        }

        tx.commit()
            .await
            .context("failed to commit channel create transaction")?;

        let channel = self
            .get_channel(&channel_id)
            .await?
            .context("channel inserted but not found")?;

        self.events
            .send(ChannelEvent::Created {
                channel: channel.clone(),
            })
            .ok();

        Ok(channel)
    }

    /// Delete a channel; members and messages cascade. Returns whether a
    /// channel was actually removed.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<bool> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Ok(false);
        };

        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(&channel.id)
            .execute(&self.pool)
            .await
            .context("failed to delete channel")?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.events
                .send(ChannelEvent::Deleted {
                    channel_id: channel.id,
                    name: channel.name,
                })
                .ok();
        }
        Ok(deleted)
    }

    /// Look up a channel by id or name. No side effects.
    pub async fn resolve_channel(&self, name_or_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, channel_type, description, created_by, created_at \
             FROM channels WHERE id = ? OR name = ?",
        )
        .bind(name_or_id)
        .bind(name_or_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve channel")?;

        row.map(channel_from_row).transpose()
    }

    /// A channel with its member list expanded.
    pub async fn get_channel(&self, name_or_id: &str) -> Result<Option<ChannelWithMembers>> {
        let Some(channel) = self.resolve_channel(name_or_id).await? else {
            return Ok(None);
        };

        let members = self.get_members(&channel.id).await?;
        Ok(Some(ChannelWithMembers { channel, members }))
    }

    pub async fn get_members(&self, channel_id: &str) -> Result<Vec<ChannelMember>> {
        let rows = sqlx::query(
            "SELECT channel_id, member_id, role, joined_at FROM channel_members \
             WHERE channel_id = ? ORDER BY joined_at ASC, member_id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list channel members")?;

        rows.into_iter().map(member_from_row).collect()
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelPreview>> {
        let rows = sqlx::query(
            "SELECT id, name, channel_type, description, created_by, created_at \
             FROM channels ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list channels")?;

        let mut previews = Vec::with_capacity(rows.len());
        for row in rows {
            previews.push(self.preview_for(channel_from_row(row)?).await?);
        }
        Ok(previews)
    }

    pub async fn list_channels_for_member(&self, member_id: &str) -> Result<Vec<ChannelPreview>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.channel_type, c.description, c.created_by, c.created_at \
             FROM channels c \
             JOIN channel_members m ON m.channel_id = c.id \
             WHERE m.member_id = ? \
             ORDER BY c.created_at ASC, c.id ASC",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list channels for member")?;

        let mut previews = Vec::with_capacity(rows.len());
        for row in rows {
            previews.push(self.preview_for(channel_from_row(row)?).await?);
        }
        Ok(previews)
    }

    async fn preview_for(&self, channel: Channel) -> Result<ChannelPreview> {
        let member_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM channel_members WHERE channel_id = ?")
                .bind(&channel.id)
                .fetch_one(&self.pool)
                .await
                .context("failed to count channel members")?;

        let last_message = sqlx::query(
            "SELECT id, channel_id, sender_id, body, thread_id, metadata, created_at \
             FROM channel_messages WHERE channel_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(&channel.id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch last channel message")?
        .map(message_from_row)
        .transpose()?;

        Ok(ChannelPreview {
            channel,
            member_count,
            last_message,
        })
    }

    /// Append a message. No membership check happens here — posting policy
    /// is decided upstream of the store.
    pub async fn post_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        body: &str,
        thread_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<ChannelMessage> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(StoreError::NotFound {
                entity: "channel",
                id: channel_id.to_string(),
            }
            .into());
        };

        let message_id = uuid::Uuid::new_v4().to_string();
        let metadata_json = metadata.as_ref().map(Value::to_string);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open message transaction")?;

        // Clamp past the newest message so commit order survives
        // same-millisecond bursts.
        let newest: Option<EpochMillis> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM channel_messages WHERE channel_id = ?",
        )
        .bind(&channel.id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to read newest message timestamp")?;
        let created_at = now_ms().max(newest.map_or(0, |value| value + 1));

        sqlx::query(
            "INSERT INTO channel_messages \
             (id, channel_id, sender_id, body, thread_id, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(&channel.id)
        .bind(sender_id)
        .bind(body)
        .bind(thread_id)
        .bind(&metadata_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert channel message")?;

        tx.commit()
            .await
            .context("failed to commit message transaction")?;

        let message = ChannelMessage {
            id: message_id,
            channel_id: channel.id,
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            thread_id: thread_id.map(str::to_string),
            metadata,
            created_at,
        };

        self.events
            .send(ChannelEvent::Message {
                message: message.clone(),
                channel_name: channel.name,
            })
            .ok();

        Ok(message)
    }

    /// The newest messages strictly older than `before`, returned ascending.
    /// The internal query is descending; the boundary reverses it.
    pub async fn get_messages(
        &self,
        channel_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<ChannelMessage>> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(StoreError::NotFound {
                entity: "channel",
                id: channel_id.to_string(),
            }
            .into());
        };

        let limit = query
            .limit
            .unwrap_or(crate::config::DEFAULT_MESSAGE_LIMIT)
            .max(0);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let before = query.before.unwrap_or_else(now_ms);

        let mut sql = String::from(
            "SELECT id, channel_id, sender_id, body, thread_id, metadata, created_at \
             FROM channel_messages WHERE channel_id = ? AND created_at < ?",
        );
        if query.thread_id.is_some() {
            sql.push_str(" AND thread_id = ?");
        } else {
            sql.push_str(" AND thread_id IS NULL");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut stmt = sqlx::query(&sql).bind(&channel.id).bind(before);
        if let Some(thread_id) = &query.thread_id {
            stmt = stmt.bind(thread_id);
        }
        let rows = stmt
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch channel messages")?;

        let mut messages: Vec<ChannelMessage> = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Add a member. Returns `false` when the membership already existed.
    pub async fn add_member(
        &self,
        channel_id: &str,
        member_id: &str,
        role: MemberRole,
    ) -> Result<bool> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(StoreError::NotFound {
                entity: "channel",
                id: channel_id.to_string(),
            }
            .into());
        };

        let joined_at = now_ms();
        let result = sqlx::query(
            "INSERT INTO channel_members (channel_id, member_id, role, joined_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (channel_id, member_id) DO NOTHING",
        )
        .bind(&channel.id)
        .bind(member_id)
        .bind(role.as_str())
        .bind(joined_at)
        .execute(&self.pool)
        .await
        .context("failed to add channel member")?;

        let added = result.rows_affected() > 0;
        if added {
            self.events
                .send(ChannelEvent::MemberJoined {
                    channel_id: channel.id.clone(),
                    member: ChannelMember {
                        channel_id: channel.id,
                        member_id: member_id.to_string(),
                        role,
                        joined_at,
                    },
                })
                .ok();
        }
        Ok(added)
    }

    /// Remove a member. Returns `false` when there was nothing to remove.
    /// Past messages from the member stay.
    pub async fn remove_member(&self, channel_id: &str, member_id: &str) -> Result<bool> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(StoreError::NotFound {
                entity: "channel",
                id: channel_id.to_string(),
            }
            .into());
        };

        let result =
            sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND member_id = ?")
                .bind(&channel.id)
                .bind(member_id)
                .execute(&self.pool)
                .await
                .context("failed to remove channel member")?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.events
                .send(ChannelEvent::MemberLeft {
                    channel_id: channel.id,
                    member_id: member_id.to_string(),
                })
                .ok();
        }
        Ok(removed)
    }

    /// Most recent post timestamp per sender, for the liveness view.
    pub async fn last_post_by_sender(
        &self,
    ) -> Result<std::collections::HashMap<String, EpochMillis>> {
        let rows = sqlx::query(
            "SELECT sender_id, MAX(created_at) AS last_at FROM channel_messages GROUP BY sender_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to read sender activity")?;

        let mut map = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let sender: String = row.try_get("sender_id").context("failed to read sender_id")?;
            let last_at: EpochMillis = row.try_get("last_at").context("failed to read last_at")?;
            map.insert(sender, last_at);
        }
        Ok(map)
    }
}

fn channel_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Channel> {
    let type_value: String = row
        .try_get("channel_type")
        .context("failed to read channel_type")?;
    let channel_type = ChannelType::parse(&type_value)
        .with_context(|| format!("invalid channel type in database: {type_value}"))?;

    Ok(Channel {
        id: row.try_get("id").context("failed to read channel id")?,
        name: row.try_get("name").context("failed to read channel name")?,
        channel_type,
        description: row
            .try_get("description")
            .context("failed to read channel description")?,
        created_by: row
            .try_get("created_by")
            .context("failed to read channel created_by")?,
        created_at: row
            .try_get("created_at")
            .context("failed to read channel created_at")?,
    })
}

fn member_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ChannelMember> {
    let role_value: String = row.try_get("role").context("failed to read member role")?;
    let role = MemberRole::parse(&role_value)
        .with_context(|| format!("invalid member role in database: {role_value}"))?;

    Ok(ChannelMember {
        channel_id: row
            .try_get("channel_id")
            .context("failed to read member channel_id")?,
        member_id: row
            .try_get("member_id")
            .context("failed to read member_id")?,
        role,
        joined_at: row
            .try_get("joined_at")
            .context("failed to read member joined_at")?,
    })
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ChannelMessage> {
    let metadata: Option<String> = row.try_get("metadata").ok().flatten();

    Ok(ChannelMessage {
        id: row.try_get("id").context("failed to read message id")?,
        channel_id: row
            .try_get("channel_id")
            .context("failed to read message channel_id")?,
        sender_id: row
            .try_get("sender_id")
            .context("failed to read message sender_id")?,
        body: row.try_get("body").context("failed to read message body")?,
        thread_id: row.try_get("thread_id").ok().flatten(),
        metadata: metadata.and_then(|value| serde_json::from_str(&value).ok()),
        created_at: row
            .try_get("created_at")
            .context("failed to read message created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_channels_pool;
    use crate::Error;

    async fn setup_store() -> ChannelStore {
        ChannelStore::new(memory_channels_pool().await)
    }

    fn create_input(name: &str, members: &[&str]) -> CreateChannelInput {
        CreateChannelInput {
            name: name.to_string(),
            channel_type: ChannelType::Public,
            description: String::new(),
            created_by: "main".to_string(),
            members: members.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn create_then_resolve_round_trips() {
        let store = setup_store().await;
        let created = store
            .create_channel(create_input("eng", &["main", "builder"]))
            .await
            .expect("channel should be created");

        let resolved = store
            .resolve_channel("eng")
            .await
            .expect("resolve should succeed")
            .expect("channel should exist");
        assert_eq!(resolved.id, created.channel.id);

        let by_id = store
            .resolve_channel(&created.channel.id)
            .await
            .expect("resolve should succeed")
            .expect("channel should exist");
        assert_eq!(by_id.name, "eng");
    }

    #[tokio::test]
    async fn duplicate_name_is_already_exists() {
        let store = setup_store().await;
        store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("first create should succeed");

        let error = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect_err("second create must fail");
        assert!(matches!(
            error,
            Error::Store(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn creator_is_forced_in_as_admin() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &["builder"]))
            .await
            .expect("channel should be created");

        let creator = channel
            .members
            .iter()
            .find(|member| member.member_id == "main")
            .expect("creator should be a member");
        assert_eq!(creator.role, MemberRole::Admin);

        let builder = channel
            .members
            .iter()
            .find(|member| member.member_id == "builder")
            .expect("listed member should be present");
        assert_eq!(builder.role, MemberRole::Member);
    }

    #[tokio::test]
    async fn post_to_unknown_channel_is_not_found() {
        let store = setup_store().await;
        let error = store
            .post_message("nowhere", "main", "hello", None, None)
            .await
            .expect_err("post must fail");
        assert!(matches!(error, Error::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn messages_come_back_in_commit_order() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");

        for index in 0..5 {
            store
                .post_message(&channel.channel.id, "main", &format!("m{index}"), None, None)
                .await
                .expect("post should succeed");
        }

        let messages = store
            .get_messages(&channel.channel.id, MessageQuery::default())
            .await
            .expect("history should load");
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn thread_filter_excludes_other_threads_and_roots() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");
        let id = &channel.channel.id;

        let root = store
            .post_message(id, "main", "root", None, None)
            .await
            .expect("root post");
        store
            .post_message(id, "main", "in-thread", Some(&root.id), None)
            .await
            .expect("thread post");
        store
            .post_message(id, "main", "other-root", None, None)
            .await
            .expect("second root post");

        let thread = store
            .get_messages(
                id,
                MessageQuery {
                    thread_id: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .expect("thread history");
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].body, "in-thread");

        let roots = store
            .get_messages(id, MessageQuery::default())
            .await
            .expect("root history");
        assert!(roots.iter().all(|m| m.thread_id.is_none()));
        assert_eq!(roots.len(), 2);
    }

    #[tokio::test]
    async fn zero_limit_returns_empty() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");
        store
            .post_message(&channel.channel.id, "main", "hello", None, None)
            .await
            .expect("post should succeed");

        let messages = store
            .get_messages(
                &channel.channel.id,
                MessageQuery {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .expect("history should load");
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn before_cursor_pages_backwards() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");
        let id = &channel.channel.id;

        let mut posted = Vec::new();
        for index in 0..4 {
            posted.push(
                store
                    .post_message(id, "main", &format!("m{index}"), None, None)
                    .await
                    .expect("post should succeed"),
            );
        }

        let older = store
            .get_messages(
                id,
                MessageQuery {
                    limit: Some(2),
                    before: Some(posted[3].created_at),
                    ..Default::default()
                },
            )
            .await
            .expect("history should load");
        let bodies: Vec<&str> = older.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn membership_is_idempotent_both_ways() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");
        let id = &channel.channel.id;

        assert!(store
            .add_member(id, "builder", MemberRole::Member)
            .await
            .expect("add should succeed"));
        assert!(!store
            .add_member(id, "builder", MemberRole::Member)
            .await
            .expect("second add should succeed"));

        assert!(store
            .remove_member(id, "builder")
            .await
            .expect("remove should succeed"));
        assert!(!store
            .remove_member(id, "builder")
            .await
            .expect("second remove should succeed"));
    }

    #[tokio::test]
    async fn delete_cascades_members_and_messages() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &["builder", "ops"]))
            .await
            .expect("channel should be created");
        let id = channel.channel.id.clone();

        for index in 0..3 {
            store
                .post_message(&id, "main", &format!("m{index}"), None, None)
                .await
                .expect("post should succeed");
        }

        assert!(store
            .delete_channel(&id)
            .await
            .expect("delete should succeed"));
        assert!(store
            .get_channel(&id)
            .await
            .expect("lookup should succeed")
            .is_none());
        assert!(!store
            .delete_channel(&id)
            .await
            .expect("second delete should succeed"));

        let members = store.get_members(&id).await.expect("member query");
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn previews_carry_last_message_and_member_count() {
        let store = setup_store().await;
        let channel = store
            .create_channel(create_input("eng", &["builder"]))
            .await
            .expect("channel should be created");
        store
            .post_message(&channel.channel.id, "builder", "first", None, None)
            .await
            .expect("post should succeed");
        store
            .post_message(&channel.channel.id, "main", "latest", None, None)
            .await
            .expect("post should succeed");

        let previews = store.list_channels().await.expect("list should succeed");
        let preview = previews
            .iter()
            .find(|preview| preview.channel.name == "eng")
            .expect("created channel should be listed");
        assert_eq!(preview.member_count, 2);
        assert_eq!(
            preview.last_message.as_ref().map(|m| m.body.as_str()),
            Some("latest")
        );

        let for_builder = store
            .list_channels_for_member("builder")
            .await
            .expect("member listing should succeed");
        assert_eq!(for_builder.len(), 1);
        let for_stranger = store
            .list_channels_for_member("stranger")
            .await
            .expect("member listing should succeed");
        assert!(for_stranger.is_empty());
    }

    #[tokio::test]
    async fn events_fire_after_commit() {
        let store = setup_store().await;
        let mut events = store.subscribe();

        let channel = store
            .create_channel(create_input("eng", &[]))
            .await
            .expect("channel should be created");

        match events.recv().await.expect("created event") {
            ChannelEvent::Created { channel: payload } => {
                assert_eq!(payload.channel.id, channel.channel.id);
            }
            other => panic!("expected channel.created, got {}", other.kind()),
        }

        store
            .post_message(&channel.channel.id, "main", "kick off", None, None)
            .await
            .expect("post should succeed");

        match events.recv().await.expect("message event") {
            ChannelEvent::Message {
                message,
                channel_name,
            } => {
                assert_eq!(channel_name, "eng");
                assert_eq!(message.body, "kick off");
            }
            other => panic!("expected channel.message, got {}", other.kind()),
        }
    }
}
