//! HTTP surface.
//!
//! `POST /v1/kms` carries every KMS operation: the operation name travels in
//! `X-Keyward-Operation`, the caller's principal ARN in `X-Keyward-Principal`
//! and the request as a JSON body. Authentication happens in front of this
//! server; the principal header is trusted as is.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use keyward_kms::api::{error_body, http_status};
use keyward_kms::{dispatch, Caller, Kms, KmsError};

/// Header naming the operation.
pub const OPERATION_HEADER: &str = "x-keyward-operation";
/// Header carrying the caller's principal ARN.
pub const PRINCIPAL_HEADER: &str = "x-keyward-principal";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub kms: Arc<Kms>,
    /// Requests without a principal run as the account root.
    pub dev: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sys/health", get(health))
        .route("/v1/kms", post(kms_operation))
        .route(
            "/v1/sys/identity-policies",
            post(attach_identity_policy).delete(detach_identity_policy),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn client_error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "__type": code, "message": message }))).into_response()
}

fn error_response(err: &KmsError) -> Response {
    let status =
        StatusCode::from_u16(http_status(err.kind())).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_body(err))).into_response()
}

fn caller(state: &AppState, headers: &HeaderMap) -> Result<Caller, Response> {
    match header(headers, PRINCIPAL_HEADER) {
        Some(principal) => Ok(Caller::new(principal)),
        None if state.dev => Ok(state.kms.root_caller()),
        None => Err(client_error(
            StatusCode::UNAUTHORIZED,
            "MissingAuthenticationTokenException",
            "X-Keyward-Principal header is required",
        )),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "region": state.kms.region(),
    }))
}

async fn kms_operation(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(operation) = header(&headers, OPERATION_HEADER) else {
        return client_error(
            StatusCode::BAD_REQUEST,
            "MissingOperationException",
            "X-Keyward-Operation header is required",
        );
    };
    let caller = match caller(&state, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let body = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return client_error(
                    StatusCode::BAD_REQUEST,
                    "SerializationException",
                    &format!("request body is not JSON: {err}"),
                )
            },
        }
    };

    match dispatch(&state.kms, &caller, operation, body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            tracing::debug!(operation, error = %err, "Operation failed");
            error_response(&err)
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityPolicyRequest {
    principal: String,
    policy_name: String,
    #[serde(default)]
    policy_document: Option<String>,
}

/// Identity policies are account administration: root only.
fn require_root(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let caller = caller(state, headers)?;
    if caller != state.kms.root_caller() {
        return Err(client_error(
            StatusCode::FORBIDDEN,
            "AccessDeniedException",
            "only the account root may administer identity policies",
        ));
    }
    Ok(())
}

async fn attach_identity_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IdentityPolicyRequest>,
) -> Response {
    if let Err(response) = require_root(&state, &headers) {
        return response;
    }
    let Some(document) = request.policy_document.as_deref() else {
        return client_error(
            StatusCode::BAD_REQUEST,
            "ValidationException",
            "PolicyDocument is required",
        );
    };
    match state
        .kms
        .attach_identity_policy(&request.principal, &request.policy_name, document)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn detach_identity_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IdentityPolicyRequest>,
) -> Response {
    if let Err(response) = require_root(&state, &headers) {
        return response;
    }
    match state
        .kms
        .detach_identity_policy(&request.principal, &request.policy_name)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}
