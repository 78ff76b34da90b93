use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::SimError;
use crate::services;
use crate::state::{
    CLAIMED_KEY, CLAIMED_PROJECT_ID, CLAIMED_PROJECT_NAME, CLAIMED_SECRET, SimState, Upload,
};

const DEVICE_TOKEN_TTL_SECS: i64 = 600;

pub fn router(state: SimState) -> Router {
    Router::new()
        .route("/twirp/{service}/{method}", post(twirp))
        .route("/uploads/{agent_id}/{version}", put(upload))
        .route("/agents/{agent_id}/logs/{phase}", get(logs))
        .route("/cli/auth", post(device_auth))
        .route("/cli/claim", post(claim))
        .route("/cli/revoke", delete(revoke))
        .layer(Extension(state))
}

fn bearer(headers: &HeaderMap) -> Result<&str, SimError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.trim().is_empty())
        .ok_or(SimError::Unauthenticated)
}

async fn twirp(
    Extension(state): Extension<SimState>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, SimError> {
    bearer(&headers)?;
    let service = service.strip_prefix("livekit.").unwrap_or(&service);
    let request: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| SimError::InvalidArgument(format!("malformed request: {err}")))?
    };
    let reply = state.with(|inner| services::dispatch(inner, service, &method, &request))?;
    Ok(Json(reply))
}

async fn upload(
    Extension(state): Extension<SimState>,
    Path((agent_id, version)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    state.with(|inner| {
        if inner.faults.upload_failures > 0 {
            inner.faults.upload_failures -= 1;
            debug!(%agent_id, "injecting upload failure");
            return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
        }
        if !body.starts_with(&[0x1f, 0x8b]) {
            return (StatusCode::BAD_REQUEST, "expected a gzip archive").into_response();
        }
        info!(%agent_id, %version, bytes = body.len(), "source uploaded");
        inner.uploads.push(Upload {
            agent_id,
            version,
            bytes: body.len(),
        });
        StatusCode::OK.into_response()
    })
}

async fn logs(
    Extension(state): Extension<SimState>,
    Path((agent_id, phase)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<String, SimError> {
    bearer(&headers)?;
    state.with(|inner| {
        let agent = inner
            .agents
            .get(&agent_id)
            .ok_or_else(|| SimError::NotFound(format!("agent {agent_id}")))?;
        let version = agent.current.clone();
        let frames = match phase.as_str() {
            "build" if inner.faults.fail_build => vec![
                json!({ "type": "log", "level": "info", "message": "Step 1/3 : FROM python:3.11-slim" })
                    .to_string(),
                json!({ "type": "error", "message": "build failed: pip exited with status 1" })
                    .to_string(),
            ],
            "build" => vec![
                json!({ "type": "log", "level": "info", "message": "Step 1/3 : FROM python:3.11-slim" })
                    .to_string(),
                json!({ "type": "log", "level": "info", "message": format!("Step 3/3 : tagging {version}") })
                    .to_string(),
                json!({ "type": "done", "status": "success", "message": "build complete" })
                    .to_string(),
            ],
            "deploy" | "update" => vec![
                json!({ "type": "status", "status": "rolling out", "message": "" }).to_string(),
                "Deploy complete".to_string(),
            ],
            other => return Err(SimError::BadRoute(format!("logs/{other}"))),
        };
        Ok(frames.join("\n") + "\n")
    })
}

async fn device_auth(
    Extension(state): Extension<SimState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let device_name = query.get("device_name").cloned().unwrap_or_default();
    state.with(|inner| {
        let token = format!("dt_{}", inner.next_id("auth"));
        inner.device_tokens.insert(token.clone(), 0);
        let expires = chrono::Utc::now().timestamp() + DEVICE_TOKEN_TTL_SECS;
        Json(json!({
            "token": token,
            "expires": expires.to_string(),
            "identifier": format!("cli-{device_name}"),
            "device_name": device_name,
        }))
    })
}

async fn claim(
    Extension(state): Extension<SimState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let token = query.get("t").cloned().unwrap_or_default();
    state.with(|inner| {
        if inner.faults.deny_claims {
            return StatusCode::NOT_FOUND.into_response();
        }
        let pending = inner.faults.pending_claims;
        let Some(polls) = inner.device_tokens.get_mut(&token) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        *polls += 1;
        if *polls <= pending {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({
            "key": CLAIMED_KEY,
            "secret": CLAIMED_SECRET,
            "project_id": CLAIMED_PROJECT_ID,
            "project_name": CLAIMED_PROJECT_NAME,
            "url": inner.base_url,
        }))
        .into_response()
    })
}

async fn revoke(Extension(state): Extension<SimState>, headers: HeaderMap) -> Response {
    if bearer(&headers).is_err() {
        return SimError::Unauthenticated.into_response();
    }
    state.with(|inner| inner.revocations += 1);
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Faults;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn twirp_request(method: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/twirp/livekit.CloudAgent/{method}"))
            .header("Authorization", "Bearer test")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn twirp_requires_a_bearer() {
        let app = router(SimState::new("http://sim", Faults::default()));
        let request = Request::builder()
            .method("POST")
            .uri("/twirp/livekit.CloudAgent/ListAgents")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn duplicate_agent_names_conflict() {
        let state = SimState::new("http://sim", Faults::default());
        state.seed_agent("greeter", &["v1"]);
        let response = router(state)
            .oneshot(twirp_request("CreateAgent", json!({ "agent_name": "greeter" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn uploads_must_be_gzip() {
        let state = SimState::new("http://sim", Faults::default());
        let request = Request::builder()
            .method("PUT")
            .uri("/uploads/CA_0001/v1")
            .body(Body::from("plain text"))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.uploads().is_empty());
    }

    #[tokio::test]
    async fn claims_stay_pending_for_the_configured_polls() {
        let faults = Faults {
            pending_claims: 1,
            ..Faults::default()
        };
        let state = SimState::new("http://sim", faults);
        let app = router(state);

        let auth = Request::builder()
            .method("POST")
            .uri("/cli/auth?device_name=laptop")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(auth).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let token: Value = serde_json::from_slice(&body).unwrap();
        let t = token["token"].as_str().unwrap().to_string();
        assert!(token["expires"].is_string());

        let poll = |t: &str| {
            Request::builder()
                .method("POST")
                .uri(format!("/cli/claim?t={t}"))
                .body(Body::empty())
                .unwrap()
        };
        let first = app.clone().oneshot(poll(&t)).await.unwrap();
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
        let second = app.oneshot(poll(&t)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let creds: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(creds["key"], CLAIMED_KEY);
        assert_eq!(creds["url"], "http://sim");
    }
}
