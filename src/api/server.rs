//! HTTP server setup: router, static file serving, and API route wiring.

use super::state::ApiState;
use super::{rpc, views, ws};

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

/// Start the HTTP server on the given address.
///
/// The caller provides a pre-built `ApiState`; the server task stops when
/// the shutdown flag flips.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/rpc", post(rpc::rpc_handler))
        .route("/ws", get(ws::ws_upgrade))
        .route("/healthz", get(health))
        .route("/agents-status.json", get(views::agents_status))
        .route("/tasks-data.json", get(views::tasks_data))
        .route("/_ls/{*path}", get(views::list_directory))
        .fallback(static_handler)
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Read-only static files out of the state directory. Strictly GET/HEAD;
/// only the dashboard entry points and the company/workspace trees are
/// reachable.
async fn static_handler(State(state): State<Arc<ApiState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let mut path = uri.path().trim_start_matches('/').to_string();
    if path.is_empty() {
        path = "workstream.html".to_string();
    }

    let root = &state.deps.config.state_dir;
    let resolved = if is_root_asset(&path) {
        Some(root.join(&path))
    } else {
        views::resolve_safe_path(root, &path)
    };
    let Some(file_path) = resolved else {
        return StatusCode::FORBIDDEN.into_response();
    };

    match tokio::fs::read(&file_path).await {
        Ok(contents) => {
            let mime = content_type_for(&path);
            ([(header::CONTENT_TYPE, mime)], contents).into_response()
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(error) => {
            tracing::warn!(%error, path = %file_path.display(), "static file read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Top-level dashboard assets served from the state root itself.
fn is_root_asset(path: &str) -> bool {
    !path.contains('/')
        && !path.contains('\0')
        && (path == "workstream.html"
            || path == "reset-ts.js"
            || path == "company-state.json"
            || path.ends_with("-data.js"))
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("css") => "text/css",
        Some("md") | Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_assets_are_exactly_the_dashboard_entry_points() {
        assert!(is_root_asset("workstream.html"));
        assert!(is_root_asset("reset-ts.js"));
        assert!(is_root_asset("company-state.json"));
        assert!(is_root_asset("tasks-data.js"));

        assert!(!is_root_asset("secrets.json"));
        assert!(!is_root_asset("company/../evil-data.js"));
        assert!(!is_root_asset("app.js"));
    }

    #[test]
    fn content_types_cover_the_served_extensions() {
        assert_eq!(content_type_for("workstream.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("reset-ts.js"), "text/javascript");
        assert_eq!(content_type_for("company/CHARTER.md"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("company/channels.db"), "application/octet-stream");
    }
}
