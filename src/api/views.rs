//! Read-only JSON views for the dashboard.

use super::state::ApiState;
use crate::tasks::TaskFilter;
use crate::{now_ms, EpochMillis};

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Liveness thresholds for the org chart.
const ACTIVE_WITHIN_MS: i64 = 10 * 60 * 1000;
const IDLE_WITHIN_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Active,
    Idle,
    Stale,
    Offline,
}

fn liveness_for(last_activity_at: Option<EpochMillis>, now: EpochMillis) -> Liveness {
    match last_activity_at {
        None => Liveness::Offline,
        Some(at) if now - at < ACTIVE_WITHIN_MS => Liveness::Active,
        Some(at) if now - at < IDLE_WITHIN_MS => Liveness::Idle,
        Some(_) => Liveness::Stale,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatus {
    id: String,
    name: String,
    emoji: String,
    layer: String,
    role: String,
    liveness: Liveness,
    last_activity_at: Option<EpochMillis>,
    next_activity_at: Option<EpochMillis>,
    active_tasks: i64,
    blocked_tasks: i64,
    done_tasks: i64,
    session_count: usize,
    last_session_age_ms: Option<i64>,
}

#[derive(Default, Serialize)]
struct LivenessTotals {
    active: usize,
    idle: usize,
    stale: usize,
    offline: usize,
}

/// `GET /agents-status.json` — org-wide liveness.
pub(super) async fn agents_status(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Value>, StatusCode> {
    let now = now_ms();
    let config = &state.deps.config;

    let task_summaries = state
        .deps
        .task_store
        .get_agent_summaries()
        .await
        .map_err(internal_error)?;
    let post_activity = state
        .deps
        .channel_store
        .last_post_by_sender()
        .await
        .map_err(internal_error)?;
    let call_records = state.call_log.read_all().await;

    let mut agents = Vec::with_capacity(config.agents.len());
    let mut totals = LivenessTotals::default();

    for profile in &config.agents {
        let summary = task_summaries
            .iter()
            .find(|summary| summary.agent_id == profile.id);

        let session_prefix = format!("agent:{}:", profile.id);
        let mut session_keys = std::collections::HashSet::new();
        let mut last_call_at: Option<EpochMillis> = None;
        for record in &call_records {
            if record.session_key.starts_with(&session_prefix) {
                session_keys.insert(record.session_key.as_str());
                last_call_at = last_call_at.max(Some(record.ts));
            }
        }

        let last_activity_at = [
            summary.and_then(|summary| summary.last_heartbeat_at),
            post_activity.get(&profile.id).copied(),
            last_call_at,
        ]
        .into_iter()
        .flatten()
        .max();

        let liveness = liveness_for(last_activity_at, now);
        match liveness {
            Liveness::Active => totals.active += 1,
            Liveness::Idle => totals.idle += 1,
            Liveness::Stale => totals.stale += 1,
            Liveness::Offline => totals.offline += 1,
        }

        agents.push(AgentStatus {
            id: profile.id.clone(),
            name: profile.name.clone(),
            emoji: profile.emoji.clone(),
            layer: profile.layer.clone(),
            role: profile.role.clone(),
            liveness,
            last_activity_at,
            // Scheduled work belongs to the external cron service.
            next_activity_at: None,
            active_tasks: summary.map_or(0, |summary| summary.active),
            blocked_tasks: summary.map_or(0, |summary| summary.blocked),
            done_tasks: summary.map_or(0, |summary| summary.done),
            session_count: session_keys.len(),
            last_session_age_ms: last_call_at.map(|at| now - at),
        });
    }

    Ok(Json(json!({
        "timestamp": now,
        "defaultAgentId": config.default_agent_id,
        "agents": agents,
        "totals": totals,
        "heartbeat": {
            "staleThresholdMs": config.stale_threshold_ms,
            "checkIntervalMs": config.check_interval_ms,
        },
        "cron": Value::Null,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TasksDataQuery {
    view: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// `GET /tasks-data.json?view=summary|detail|logs|list&...`
pub(super) async fn tasks_data(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TasksDataQuery>,
) -> Result<Json<Value>, StatusCode> {
    let store = &state.deps.task_store;

    match query.view.as_str() {
        "summary" => {
            let summary = store.get_summary().await.map_err(internal_error)?;
            let agents = store.get_agent_summaries().await.map_err(internal_error)?;
            Ok(Json(json!({ "summary": summary, "agents": agents })))
        }
        "list" => {
            let status = match query.status.as_deref() {
                None => None,
                Some(value) => Some(
                    crate::tasks::TaskStatus::parse(value).ok_or(StatusCode::BAD_REQUEST)?,
                ),
            };
            let tasks = store
                .list_tasks(TaskFilter {
                    agent_id: query.agent_id,
                    status,
                    parent_task_id: query.parent_task_id,
                    limit: query.limit,
                })
                .await
                .map_err(internal_error)?;
            Ok(Json(json!({ "tasks": tasks })))
        }
        "detail" => {
            let id = query.id.ok_or(StatusCode::BAD_REQUEST)?;
            let task = store
                .get_task(&id)
                .await
                .map_err(internal_error)?
                .ok_or(StatusCode::NOT_FOUND)?;
            let logs = store
                .get_logs(&id, Default::default())
                .await
                .map_err(internal_error)?;
            let dependents = store.get_dependents(&id).await.map_err(internal_error)?;
            let subtasks = store.get_subtasks(&id).await.map_err(internal_error)?;
            Ok(Json(json!({
                "task": task,
                "logs": logs,
                "dependents": dependents,
                "subtasks": subtasks,
            })))
        }
        "logs" => {
            let id = query.id.ok_or(StatusCode::BAD_REQUEST)?;
            let logs = store
                .get_logs(
                    &id,
                    crate::tasks::LogQuery {
                        limit: query.limit,
                        before: None,
                    },
                )
                .await
                .map_err(internal_error)?;
            Ok(Json(json!({ "logs": logs })))
        }
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// `GET /_ls/<dir>` — file listing for the workspace tree.
pub(super) async fn list_directory(
    State(state): State<Arc<ApiState>>,
    AxumPath(rest): AxumPath<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let root = &state.deps.config.state_dir;
    let dir = resolve_safe_path(root, &rest).ok_or(StatusCode::FORBIDDEN)?;

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(StatusCode::NOT_FOUND);
        }
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(Json(names))
}

/// Resolve a request path against the state root, or `None` when the path is
/// outside the whitelist or escapes the root.
///
/// Whitelisted prefixes: `company` and the workspace family (`workspace/`,
/// `workspaces/`). `..`, NUL bytes, and absolute paths are rejected before
/// the filesystem is touched; symlink escapes are caught by canonicalizing
/// whatever exists.
pub(super) fn resolve_safe_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.contains('\0') {
        return None;
    }

    let relative = Path::new(request_path);
    if relative.is_absolute() {
        return None;
    }
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }

    let first = relative.components().next()?;
    let Component::Normal(first) = first else {
        return None;
    };
    let first = first.to_str()?;
    if first != "company" && !first.starts_with("workspace") {
        return None;
    }

    let joined = root.join(relative);
    if let Ok(canonical) = joined.canonicalize() {
        let canonical_root = root.canonicalize().ok()?;
        if !canonical.starts_with(&canonical_root) {
            return None;
        }
    }
    Some(joined)
}

fn internal_error(error: crate::Error) -> StatusCode {
    tracing::warn!(%error, "dashboard view failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_thresholds() {
        let now = 100 * 60 * 1000;
        assert_eq!(liveness_for(None, now), Liveness::Offline);
        assert_eq!(liveness_for(Some(now - 60_000), now), Liveness::Active);
        assert_eq!(
            liveness_for(Some(now - 15 * 60 * 1000), now),
            Liveness::Idle
        );
        assert_eq!(
            liveness_for(Some(now - 45 * 60 * 1000), now),
            Liveness::Stale
        );
    }

    #[test]
    fn safe_path_rejects_traversal_and_foreign_prefixes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("company/kb")).expect("layout");
        std::fs::create_dir_all(root.join("workspaces/builder")).expect("layout");
        std::fs::create_dir_all(root.join("logs")).expect("layout");

        assert!(resolve_safe_path(root, "company/kb").is_some());
        assert!(resolve_safe_path(root, "workspace").is_some());
        assert!(resolve_safe_path(root, "workspaces/builder").is_some());

        assert!(resolve_safe_path(root, "logs").is_none());
        assert!(resolve_safe_path(root, "../elsewhere").is_none());
        assert!(resolve_safe_path(root, "company/../logs").is_none());
        assert!(resolve_safe_path(root, "/etc").is_none());
        assert!(resolve_safe_path(root, "company/\0evil").is_none());
    }
}
