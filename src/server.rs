//! # HTTP adapter
//!
//! Exposes reconciliation as `POST /identify` (also mounted under `/api/v1`),
//! plus a greeting on `/` and a store health probe on `/healthz`.

use crate::error::ReconcileError;
use crate::model::{IdentityView, Observation};
use crate::Unicontact;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";
pub const STORE_UNAVAILABLE_MESSAGE: &str = "store unavailable";

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub unicontact: Unicontact,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(unicontact: Unicontact, request_timeout: Duration) -> Self {
        Self {
            unicontact,
            request_timeout,
        }
    }
}

/// Body of an identify request. Both fields are optional on the wire; at least
/// one must be present and non-blank.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<PhoneInput>,
}

/// Phone numbers arrive as strings or bare JSON numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PhoneInput {
    Text(String),
    Number(serde_json::Number),
}

impl PhoneInput {
    pub fn into_text(self) -> String {
        match self {
            PhoneInput::Text(text) => text,
            PhoneInput::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: IdentityView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/identify", post(identify))
        .route("/api/v1/identify", post(identify))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn root() -> &'static str {
    "unicontact identity service"
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let unicontact = state.unicontact.clone();
    let probe = tokio::task::spawn_blocking(move || {
        unicontact
            .store()
            .ping()
            .map(|_| unicontact.contact_count())
    })
    .await;
    match probe {
        Ok(Ok(contacts)) => (
            StatusCode::OK,
            Json(HealthBody {
                status: "ok".to_string(),
                contacts: Some(contacts),
                message: None,
            }),
        ),
        Ok(Err(err)) => {
            warn!(error = %err, "health probe failed");
            unhealthy(STORE_UNAVAILABLE_MESSAGE.to_string())
        }
        Err(err) => {
            error!(error = %err, "health probe task failed");
            unhealthy(INTERNAL_ERROR_MESSAGE.to_string())
        }
    }
}

fn unhealthy(message: String) -> (StatusCode, Json<HealthBody>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthBody {
            status: "unavailable".to_string(),
            contacts: None,
            message: Some(message),
        }),
    )
}

async fn identify(
    State(state): State<AppState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "rejected identify body");
            return error_body(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let phone_number = request.phone_number.map(PhoneInput::into_text);
    let observation = match Observation::new(request.email.as_deref(), phone_number.as_deref()) {
        Ok(observation) => observation,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let deadline = Instant::now() + state.request_timeout;
    let unicontact = state.unicontact.clone();
    let result =
        tokio::task::spawn_blocking(move || unicontact.reconcile(&observation, Some(deadline)))
            .await;

    match result {
        Ok(Ok(reconciliation)) => (
            StatusCode::OK,
            Json(IdentifyResponse {
                contact: reconciliation.view,
            }),
        )
            .into_response(),
        Ok(Err(err)) => reconcile_error_response(err),
        Err(err) => {
            error!(error = %err, "identify task failed");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            )
        }
    }
}

fn reconcile_error_response(err: ReconcileError) -> Response {
    match err {
        ReconcileError::Validation(err) => error_body(StatusCode::BAD_REQUEST, err.to_string()),
        ReconcileError::DeadlineExceeded => {
            warn!("identify abandoned before commit: deadline exceeded");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            )
        }
        other => {
            error!(error = %other, "identify failed");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            )
        }
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { message })).into_response()
}
