use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gitops_core::api::{ActionResponse, FetchRequest, GateKind, StatusResponse};
use gitops_core::deployment::Deployment;
use tower_http::trace::TraceLayer;

use crate::exec::Executor;
use crate::git::Repository;
use crate::manager::Manager;

struct AppState<R, E> {
    manager: Arc<Manager<R, E>>,
}

impl<R, E> Clone for AppState<R, E> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

/// Control surface routes over `manager`.
pub fn router<R: Repository, E: Executor>(manager: Arc<Manager<R, E>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status::<R, E>))
        .route("/api/history", get(history::<R, E>))
        .route("/api/fetch", post(fetch::<R, E>))
        .route("/api/deployer/suspend", post(suspend::<R, E>))
        .route("/api/deployer/resume", post(resume::<R, E>))
        .route("/api/confirm/{gate}/{id}", post(confirm::<R, E>))
        .route("/api/cancel/{gate}", post(cancel::<R, E>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
) -> Json<StatusResponse> {
    Json(st.manager.status().await)
}

async fn history<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
) -> Json<Vec<Deployment>> {
    Json(st.manager.history().await)
}

async fn fetch<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let message = if req.remotes.is_empty() {
        "fetching all remotes".to_string()
    } else {
        format!("fetching {}", req.remotes.join(", "))
    };
    st.manager.fetch(req.remotes).await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn suspend<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
) -> Json<ActionResponse> {
    st.manager.suspend();
    Json(ActionResponse::ok("deployer suspended"))
}

async fn resume<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
) -> Json<ActionResponse> {
    st.manager.resume();
    Json(ActionResponse::ok("deployer resumed"))
}

async fn confirm<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
    Path((gate, id)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, AppError> {
    let gate = parse_gate(&gate)?;
    st.manager
        .confirm(gate, &id)
        .await
        .map_err(AppError::bad_request)?;
    Ok(Json(ActionResponse::ok(format!("{gate} confirmed for {id}"))))
}

async fn cancel<R: Repository, E: Executor>(
    State(st): State<AppState<R, E>>,
    Path(gate): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let gate = parse_gate(&gate)?;
    st.manager.cancel(gate).await?;
    Ok(Json(ActionResponse::ok(format!("{gate} confirmation cancelled"))))
}

fn parse_gate(s: &str) -> Result<GateKind, AppError> {
    s.parse::<GateKind>()
        .map_err(|e| AppError::bad_request(anyhow!(e)))
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(value: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: value.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        } else {
            tracing::debug!(error = %self.error, "request rejected");
        }
        let body = Json(serde_json::json!({
            "error": self.error.to_string()
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::confirm::ConfirmMode;
    use crate::testing::{components, FakeExecutor, FakeRepo};

    async fn app(
        build: ConfirmMode,
        deploy: ConfirmMode,
    ) -> (Arc<Manager<FakeRepo, FakeExecutor>>, Router) {
        let m = Manager::spawn(components(build, deploy)).await;
        (m.clone(), router(m))
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test(start_paused = true)]
    async fn healthz_and_status() {
        let (_m, app) = app(ConfirmMode::Without, ConfirmMode::Without).await;

        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (code, body) = call(&app, "GET", "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["hostname"], "host");
        assert_eq!(body["build_gate"]["confirmation"]["mode"], "without");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_gate_is_a_bad_request() {
        let (_m, app) = app(ConfirmMode::Manual, ConfirmMode::Manual).await;
        let (code, body) = call(&app, "POST", "/api/confirm/launch/g1").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("unknown gate"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_round_trip() {
        let (m, app) = app(ConfirmMode::Manual, ConfirmMode::Manual).await;
        while m.status().await.build_gate.confirmation.submitted.is_none() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let (code, body) = call(&app, "POST", "/api/confirm/build/not-the-id").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("does not match"));

        let id = m.status().await.builder.generation.unwrap().id;
        let (code, body) = call(&app, "POST", &format!("/api/confirm/build/{id}")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ok"], true);

        while !m.status().await.builder.generation.unwrap().is_built() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let (code, _) = call(&app, "POST", "/api/cancel/deploy").await;
        assert_eq!(code, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_resume_fetch_and_history() {
        let (m, app) = app(ConfirmMode::Manual, ConfirmMode::Manual).await;

        let (code, _) = call(&app, "POST", "/api/deployer/suspend").await;
        assert_eq!(code, StatusCode::OK);
        assert!(m.status().await.deployer.is_suspended);

        let (code, _) = call(&app, "POST", "/api/deployer/resume").await;
        assert_eq!(code, StatusCode::OK);
        assert!(!m.status().await.deployer.is_suspended);

        let (code, body) = call(&app, "POST", "/api/fetch").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "fetching all remotes");

        let (code, body) = call(&app, "GET", "/api/history").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}
