//! Typed RPC dispatch: `company.channels.*`, `tasks.*`, `company.create`.
//!
//! Every method returns `{ok: true, ...}` or `{ok: false, error: {code,
//! message}}`. Unknown ids and malformed parameters surface as
//! `INVALID_REQUEST` with a message naming the problem; store failures as
//! `UNAVAILABLE`.

use super::state::ApiState;
use crate::bootstrap;
use crate::channels::{ChannelType, CreateChannelInput, MemberRole, MessageQuery};
use crate::tasks::{
    CreateTaskInput, LogQuery, TaskFilter, TaskLogType, TaskPriority, TaskStatus, UpdateTaskInput,
};

use axum::extract::State;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug)]
pub struct RpcError {
    code: &'static str,
    message: String,
}

impl RpcError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }
}

impl From<crate::Error> for RpcError {
    fn from(error: crate::Error) -> Self {
        Self {
            code: error.code().as_str(),
            message: error.to_string(),
        }
    }
}

type RpcResult = std::result::Result<Value, RpcError>;

pub(super) async fn rpc_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RpcRequest>,
) -> Json<Value> {
    match dispatch(&state, &request.method, request.params).await {
        Ok(payload) => {
            let mut body = json!({ "ok": true });
            if let (Some(object), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
                for (key, value) in extra {
                    object.insert(key.clone(), value.clone());
                }
            }
            Json(body)
        }
        Err(error) => {
            tracing::debug!(
                method = %request.method,
                code = error.code,
                message = %error.message,
                "rpc request failed"
            );
            Json(json!({
                "ok": false,
                "error": { "code": error.code, "message": error.message },
            }))
        }
    }
}

/// Route a method name to its typed handler.
pub async fn dispatch(state: &ApiState, method: &str, params: Value) -> RpcResult {
    match method {
        "company.channels.list" => channels_list(state, params).await,
        "company.channels.get" => channels_get(state, params).await,
        "company.channels.create" => channels_create(state, params).await,
        "company.channels.delete" => channels_delete(state, params).await,
        "company.channels.post" => channels_post(state, params).await,
        "company.channels.history" => channels_history(state, params).await,
        "company.channels.members.add" => members_add(state, params).await,
        "company.channels.members.remove" => members_remove(state, params).await,
        "tasks.create" => tasks_create(state, params).await,
        "tasks.get" => tasks_get(state, params).await,
        "tasks.update" => tasks_update(state, params).await,
        "tasks.list" => tasks_list(state, params).await,
        "tasks.logs" => tasks_logs(state, params).await,
        "tasks.log" => tasks_log(state, params).await,
        "tasks.heartbeat" => tasks_heartbeat(state, params).await,
        "tasks.summary" => tasks_summary(state, params).await,
        "company.create" => company_create(state, params).await,
        _ => Err(RpcError::invalid(format!("unknown method: {method}"))),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|error| RpcError::invalid(error.to_string()))
}

fn parse_status(value: &str) -> std::result::Result<TaskStatus, RpcError> {
    TaskStatus::parse(value)
        .ok_or_else(|| RpcError::invalid(format!("invalid value for field `status`: {value}")))
}

fn parse_priority(value: &str) -> std::result::Result<TaskPriority, RpcError> {
    TaskPriority::parse(value)
        .ok_or_else(|| RpcError::invalid(format!("invalid value for field `priority`: {value}")))
}

// --- channels ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelsListParams {
    member_id: Option<String>,
}

async fn channels_list(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelsListParams = parse(params)?;
    let channels = match params.member_id {
        Some(member_id) => {
            state
                .deps
                .channel_store
                .list_channels_for_member(&member_id)
                .await?
        }
        None => state.deps.channel_store.list_channels().await?,
    };
    Ok(json!({ "channels": channels }))
}

#[derive(Deserialize)]
struct ChannelRefParams {
    channel: String,
}

async fn channels_get(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelRefParams = parse(params)?;
    let channel = state
        .deps
        .channel_store
        .get_channel(&params.channel)
        .await?
        .ok_or_else(|| RpcError::invalid(format!("channel not found: {}", params.channel)))?;
    Ok(json!({ "channel": channel }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelsCreateParams {
    name: String,
    #[serde(rename = "type", default)]
    channel_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    created_by: String,
    #[serde(default)]
    members: Vec<String>,
}

async fn channels_create(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelsCreateParams = parse(params)?;
    if params.name.is_empty() {
        return Err(RpcError::invalid("missing value for field `name`"));
    }

    let channel_type = match params.channel_type.as_deref() {
        None => ChannelType::Public,
        Some(value) => ChannelType::parse(value)
            .ok_or_else(|| RpcError::invalid(format!("invalid value for field `type`: {value}")))?,
    };

    let channel = state
        .deps
        .channel_store
        .create_channel(CreateChannelInput {
            name: params.name,
            channel_type,
            description: params.description.unwrap_or_default(),
            created_by: params.created_by,
            members: params.members,
        })
        .await?;
    Ok(json!({ "channel": channel }))
}

async fn channels_delete(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelRefParams = parse(params)?;
    let deleted = state
        .deps
        .channel_store
        .delete_channel(&params.channel)
        .await?;
    Ok(json!({ "deleted": deleted }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelsPostParams {
    channel: String,
    sender_id: String,
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn channels_post(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelsPostParams = parse(params)?;
    let message = state
        .deps
        .channel_store
        .post_message(
            &params.channel,
            &params.sender_id,
            &params.text,
            params.thread_id.as_deref(),
            params.metadata,
        )
        .await?;
    Ok(json!({ "message": message }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelsHistoryParams {
    channel: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<i64>,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn channels_history(state: &ApiState, params: Value) -> RpcResult {
    let params: ChannelsHistoryParams = parse(params)?;
    let messages = state
        .deps
        .channel_store
        .get_messages(
            &params.channel,
            MessageQuery {
                limit: params.limit,
                before: params.before,
                thread_id: params.thread_id,
            },
        )
        .await?;
    Ok(json!({ "messages": messages }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberParams {
    channel: String,
    member_id: String,
    #[serde(default)]
    role: Option<String>,
}

async fn members_add(state: &ApiState, params: Value) -> RpcResult {
    let params: MemberParams = parse(params)?;
    let role = match params.role.as_deref() {
        None => MemberRole::Member,
        Some(value) => MemberRole::parse(value)
            .ok_or_else(|| RpcError::invalid(format!("invalid value for field `role`: {value}")))?,
    };

    let added = state
        .deps
        .channel_store
        .add_member(&params.channel, &params.member_id, role)
        .await?;
    Ok(json!({ "added": added }))
}

async fn members_remove(state: &ApiState, params: Value) -> RpcResult {
    let params: MemberParams = parse(params)?;
    let removed = state
        .deps
        .channel_store
        .remove_member(&params.channel, &params.member_id)
        .await?;
    Ok(json!({ "removed": removed }))
}

// --- tasks ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksCreateParams {
    agent_id: String,
    objective: String,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn tasks_create(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksCreateParams = parse(params)?;
    let priority = match params.priority.as_deref() {
        None => TaskPriority::Medium,
        Some(value) => parse_priority(value)?,
    };

    let task = state
        .deps
        .task_store
        .create_task(CreateTaskInput {
            agent_id: params.agent_id,
            objective: params.objective,
            parent_task_id: params.parent_task_id,
            priority,
            dependencies: params.dependencies,
            metadata: params.metadata.unwrap_or_else(|| json!({})),
        })
        .await?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
struct TaskRefParams {
    id: String,
}

async fn tasks_get(state: &ApiState, params: Value) -> RpcResult {
    let params: TaskRefParams = parse(params)?;
    let task = state
        .deps
        .task_store
        .get_task(&params.id)
        .await?
        .ok_or_else(|| RpcError::invalid(format!("task not found: {}", params.id)))?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksUpdateParams {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    progress_summary: Option<String>,
    #[serde(default)]
    objective: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    artifacts: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn tasks_update(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksUpdateParams = parse(params)?;
    let status = match params.status.as_deref() {
        None => None,
        Some(value) => Some(parse_status(value)?),
    };
    let priority = match params.priority.as_deref() {
        None => None,
        Some(value) => Some(parse_priority(value)?),
    };

    let task = state
        .deps
        .task_store
        .update_task(
            &params.id,
            UpdateTaskInput {
                status,
                priority,
                progress_summary: params.progress_summary,
                objective: params.objective,
                agent_id: params.agent_id,
                artifacts: params.artifacts,
                metadata: params.metadata,
            },
        )
        .await?
        .ok_or_else(|| RpcError::invalid(format!("task not found: {}", params.id)))?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksListParams {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn tasks_list(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksListParams = parse(params)?;
    let status = match params.status.as_deref() {
        None => None,
        Some(value) => Some(parse_status(value)?),
    };

    let tasks = state
        .deps
        .task_store
        .list_tasks(TaskFilter {
            agent_id: params.agent_id,
            status,
            parent_task_id: params.parent_task_id,
            limit: params.limit,
        })
        .await?;
    Ok(json!({ "tasks": tasks }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksLogsParams {
    id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<i64>,
}

async fn tasks_logs(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksLogsParams = parse(params)?;
    if state.deps.task_store.get_task(&params.id).await?.is_none() {
        return Err(RpcError::invalid(format!("task not found: {}", params.id)));
    }

    let logs = state
        .deps
        .task_store
        .get_logs(
            &params.id,
            LogQuery {
                limit: params.limit,
                before: params.before,
            },
        )
        .await?;
    Ok(json!({ "logs": logs }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksLogParams {
    id: String,
    agent_id: String,
    #[serde(rename = "type")]
    log_type: String,
    message: String,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn tasks_log(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksLogParams = parse(params)?;
    let log_type = TaskLogType::parse(&params.log_type).ok_or_else(|| {
        RpcError::invalid(format!("invalid value for field `type`: {}", params.log_type))
    })?;

    let entry = state
        .deps
        .task_store
        .append_log(
            &params.id,
            &params.agent_id,
            log_type,
            &params.message,
            params.metadata,
        )
        .await?;
    Ok(json!({ "entry": entry }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksHeartbeatParams {
    id: String,
    agent_id: String,
    #[serde(default)]
    message: Option<String>,
}

async fn tasks_heartbeat(state: &ApiState, params: Value) -> RpcResult {
    let params: TasksHeartbeatParams = parse(params)?;
    let task = state
        .deps
        .task_store
        .heartbeat(&params.id, &params.agent_id, params.message.as_deref())
        .await?
        .ok_or_else(|| RpcError::invalid(format!("task not found: {}", params.id)))?;
    Ok(json!({ "task": task }))
}

async fn tasks_summary(state: &ApiState, _params: Value) -> RpcResult {
    let summary = state.deps.task_store.get_summary().await?;
    let agents = state.deps.task_store.get_agent_summaries().await?;
    Ok(json!({ "summary": summary, "agents": agents }))
}

// --- bootstrap ---

#[derive(Deserialize)]
struct CompanyCreateParams {
    goal: String,
}

async fn company_create(state: &ApiState, params: Value) -> RpcResult {
    let params: CompanyCreateParams = parse(params)?;
    if params.goal.trim().is_empty() {
        return Err(RpcError::invalid("missing value for field `goal`"));
    }

    let report = bootstrap::create_company(
        &state.deps.config,
        &state.deps.channel_store,
        &params.goal,
    )
    .await?;
    Ok(json!({ "company": report }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ws::Broadcaster;
    use crate::channels::ChannelStore;
    use crate::config::CompanyConfig;
    use crate::db::{memory_channels_pool, memory_tasks_pool};
    use crate::gateway::{AgentCall, CallLog, Gateway};
    use crate::tasks::TaskStore;
    use crate::CompanyDeps;

    struct NullGateway;

    #[async_trait::async_trait]
    impl Gateway for NullGateway {
        async fn agent(&self, _call: AgentCall) -> crate::Result<()> {
            Ok(())
        }
    }

    async fn setup() -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CompanyConfig::load_from_state_dir(dir.path().to_path_buf())
            .expect("config should load");
        let call_log = CallLog::new(config.llm_call_log_file.clone());

        let deps = CompanyDeps {
            config: Arc::new(config),
            channel_store: Arc::new(ChannelStore::new(memory_channels_pool().await)),
            task_store: Arc::new(TaskStore::new(memory_tasks_pool().await)),
            gateway: Arc::new(NullGateway),
            broadcaster: Broadcaster::new(),
        };

        (dir, ApiState::new(deps, call_log))
    }

    async fn call(state: &ApiState, method: &str, params: Value) -> RpcResult {
        dispatch(state, method, params).await
    }

    #[tokio::test]
    async fn channel_create_post_history_round_trip() {
        let (_dir, state) = setup().await;

        let created = call(
            &state,
            "company.channels.create",
            json!({
                "name": "eng",
                "type": "public",
                "createdBy": "main",
                "members": ["main", "builder"],
            }),
        )
        .await
        .expect("create should succeed");
        assert_eq!(created["channel"]["name"], "eng");
        assert_eq!(created["channel"]["members"].as_array().map(Vec::len), Some(2));

        call(
            &state,
            "company.channels.post",
            json!({ "channel": "eng", "senderId": "main", "text": "kick off" }),
        )
        .await
        .expect("post should succeed");

        let history = call(
            &state,
            "company.channels.history",
            json!({ "channel": "eng" }),
        )
        .await
        .expect("history should succeed");
        let messages = history["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["body"], "kick off");
    }

    #[tokio::test]
    async fn duplicate_channel_name_maps_to_already_exists() {
        let (_dir, state) = setup().await;
        let params = json!({ "name": "eng", "createdBy": "main" });
        call(&state, "company.channels.create", params.clone())
            .await
            .expect("first create should succeed");

        let error = call(&state, "company.channels.create", params)
            .await
            .expect_err("second create must fail");
        assert_eq!(error.code, "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn post_to_unknown_channel_is_invalid_request_saying_not_found() {
        let (_dir, state) = setup().await;
        let error = call(
            &state,
            "company.channels.post",
            json!({ "channel": "ghost", "senderId": "main", "text": "hi" }),
        )
        .await
        .expect_err("post must fail");
        assert_eq!(error.code, "INVALID_REQUEST");
        assert!(error.message.contains("not found"));
        assert!(error.message.contains("ghost"));
    }

    #[tokio::test]
    async fn missing_parameter_names_the_field() {
        let (_dir, state) = setup().await;
        let error = call(
            &state,
            "company.channels.create",
            json!({ "createdBy": "main" }),
        )
        .await
        .expect_err("create must fail");
        assert_eq!(error.code, "INVALID_REQUEST");
        assert!(error.message.contains("name"));
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_request() {
        let (_dir, state) = setup().await;
        let error = call(&state, "company.nope", json!({}))
            .await
            .expect_err("dispatch must fail");
        assert_eq!(error.code, "INVALID_REQUEST");
        assert!(error.message.contains("company.nope"));
    }

    #[tokio::test]
    async fn task_lifecycle_over_rpc() {
        let (_dir, state) = setup().await;

        let created = call(
            &state,
            "tasks.create",
            json!({ "agentId": "builder", "objective": "ship v1", "priority": "high" }),
        )
        .await
        .expect("create should succeed");
        let task_id = created["task"]["id"].as_str().expect("task id").to_string();
        assert_eq!(created["task"]["status"], "active");

        call(
            &state,
            "tasks.heartbeat",
            json!({ "id": task_id, "agentId": "builder", "message": "on it" }),
        )
        .await
        .expect("heartbeat should succeed");

        let updated = call(
            &state,
            "tasks.update",
            json!({ "id": task_id, "status": "done", "progressSummary": "shipped" }),
        )
        .await
        .expect("update should succeed");
        assert_eq!(updated["task"]["status"], "done");
        assert!(updated["task"]["completedAt"].is_i64());

        let logs = call(&state, "tasks.logs", json!({ "id": task_id }))
            .await
            .expect("logs should succeed");
        let types: Vec<&str> = logs["logs"]
            .as_array()
            .expect("logs array")
            .iter()
            .map(|entry| entry["logType"].as_str().expect("log type"))
            .collect();
        assert_eq!(types, ["created", "heartbeat", "completed"]);

        let summary = call(&state, "tasks.summary", json!({}))
            .await
            .expect("summary should succeed");
        assert_eq!(summary["summary"]["done"], 1);
    }

    #[tokio::test]
    async fn invalid_status_value_names_the_field() {
        let (_dir, state) = setup().await;
        let error = call(
            &state,
            "tasks.list",
            json!({ "status": "doing-great" }),
        )
        .await
        .expect_err("list must fail");
        assert_eq!(error.code, "INVALID_REQUEST");
        assert!(error.message.contains("status"));
    }

    #[tokio::test]
    async fn bootstrap_over_rpc_writes_the_charter() {
        let (_dir, state) = setup().await;
        call(
            &state,
            "company.create",
            json!({ "goal": "Be profitable by Q4" }),
        )
        .await
        .expect("bootstrap should succeed");

        let charter = std::fs::read_to_string(
            state.deps.config.company_dir().join("CHARTER.md"),
        )
        .expect("charter should exist");
        assert!(charter.contains("Be profitable by Q4"));
    }
}
