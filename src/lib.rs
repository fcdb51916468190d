//! Agentco: a persistent multi-agent company core — durable channels, task
//! threads, and the wake-up machinery that keeps autonomous workers moving.

pub mod api;
pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod gateway;
pub mod tasks;
pub mod trigger;
pub mod watchdog;

pub use error::{Error, Result};

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Millisecond-precision Unix timestamp used for every persisted time.
pub type EpochMillis = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> EpochMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Events emitted by the channel store after a mutation commits.
///
/// Variants carry fully-populated value objects so subscribers never have to
/// re-read the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEvent {
    Created {
        channel: channels::ChannelWithMembers,
    },
    Deleted {
        channel_id: String,
        name: String,
    },
    Message {
        message: channels::ChannelMessage,
        channel_name: String,
    },
    MemberJoined {
        channel_id: String,
        member: channels::ChannelMember,
    },
    MemberLeft {
        channel_id: String,
        member_id: String,
    },
}

impl ChannelEvent {
    /// Wire name of the event, as broadcast to dashboards.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelEvent::Created { .. } => "channel.created",
            ChannelEvent::Deleted { .. } => "channel.deleted",
            ChannelEvent::Message { .. } => "channel.message",
            ChannelEvent::MemberJoined { .. } => "channel.member.joined",
            ChannelEvent::MemberLeft { .. } => "channel.member.left",
        }
    }

    /// JSON payload for the websocket frame.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChannelEvent::Created { channel } => json!({ "channel": channel }),
            ChannelEvent::Deleted { channel_id, name } => {
                json!({ "channelId": channel_id, "name": name })
            }
            ChannelEvent::Message {
                message,
                channel_name,
            } => json!({ "message": message, "channelName": channel_name }),
            ChannelEvent::MemberJoined { channel_id, member } => {
                json!({ "channelId": channel_id, "member": member })
            }
            ChannelEvent::MemberLeft {
                channel_id,
                member_id,
            } => json!({ "channelId": channel_id, "memberId": member_id }),
        }
    }
}

/// Events emitted by the task store (and the watchdog) after a mutation
/// commits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Created { task: tasks::Task },
    Updated { task: tasks::Task },
    Log { entry: tasks::TaskLogEntry },
    Heartbeat { task: tasks::Task },
    Stale { task: tasks::Task },
    Completed { task: tasks::Task },
    Failed { task: tasks::Task },
}

impl TaskEvent {
    /// Wire name of the event, as broadcast to dashboards.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Updated { .. } => "task.updated",
            TaskEvent::Log { .. } => "task.log",
            TaskEvent::Heartbeat { .. } => "task.heartbeat",
            TaskEvent::Stale { .. } => "task.stale",
            TaskEvent::Completed { .. } => "task.completed",
            TaskEvent::Failed { .. } => "task.failed",
        }
    }

    /// JSON payload for the websocket frame.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            TaskEvent::Created { task }
            | TaskEvent::Updated { task }
            | TaskEvent::Heartbeat { task }
            | TaskEvent::Stale { task }
            | TaskEvent::Completed { task }
            | TaskEvent::Failed { task } => json!({ "task": task }),
            TaskEvent::Log { entry } => json!({ "entry": entry }),
        }
    }
}

/// Shared dependency bundle for the long-running subsystems (trigger engine,
/// watchdog, RPC surface).
#[derive(Clone)]
pub struct CompanyDeps {
    pub config: Arc<config::CompanyConfig>,
    pub channel_store: Arc<channels::ChannelStore>,
    pub task_store: Arc<tasks::TaskStore>,
    pub gateway: Arc<dyn gateway::Gateway>,
    pub broadcaster: api::ws::Broadcaster,
}
