//! Artifact HTTP API (C5): serves artifact bytes and metadata behind a
//! signed-token check, following the same handler/`AppError` shape as the
//! teacher's `http_server.rs`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::{Artifact, ArtifactStore, TokenService};
use crate::error::{ArtifactError, TokenError};

/// Shared state for the artifact HTTP handlers.
#[derive(Clone)]
pub struct ArtifactApiState {
    pub store: Arc<ArtifactStore>,
    pub tokens: Arc<TokenService>,
}

/// Build the router serving `/artifacts/{id}` and `/artifacts/{id}/head`.
#[must_use]
pub fn create_router() -> Router<ArtifactApiState> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/artifacts/{id}", get(download_artifact))
        .route("/artifacts/{id}/head", get(head_artifact))
        .layer(cors)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

async fn download_artifact(
    State(state): State<ArtifactApiState>,
    Path(artifact_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ArtifactApiError> {
    state.tokens.verify_token_for_at(&query.token, &artifact_id, now_unix())?;

    let artifact = state.store.get_metadata(&artifact_id).await?;
    let bytes = state.store.read_bytes(&artifact_id).await?;

    let content_type = artifact.mime.clone();
    let filename = artifact.filename.clone().unwrap_or_else(|| artifact_id.clone());

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response())
}

async fn head_artifact(
    State(state): State<ArtifactApiState>,
    Path(artifact_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<ArtifactMetadataResponse>, ArtifactApiError> {
    state.tokens.verify_token_for_at(&query.token, &artifact_id, now_unix())?;

    let artifact = state.store.get_metadata(&artifact_id).await?;
    Ok(Json(ArtifactMetadataResponse::from(artifact)))
}

#[derive(Debug, serde::Serialize)]
struct ArtifactMetadataResponse {
    id: String,
    sha256: String,
    mime: String,
    filename: Option<String>,
    size: i64,
    created_at: String,
}

impl From<Artifact> for ArtifactMetadataResponse {
    fn from(a: Artifact) -> Self {
        Self {
            id: a.id,
            sha256: a.sha256,
            mime: a.mime,
            filename: a.filename,
            size: a.size,
            created_at: a.created_at.to_rfc3339(),
        }
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Error type for the artifact HTTP handlers, mapping each failure to the
/// status code the original endpoints use.
#[derive(Debug)]
pub enum ArtifactApiError {
    Token(TokenError),
    NotFound,
    BlobMissing,
    Internal(ArtifactError),
}

impl From<TokenError> for ArtifactApiError {
    fn from(err: TokenError) -> Self {
        Self::Token(err)
    }
}

impl From<ArtifactError> for ArtifactApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(_) => Self::NotFound,
            ArtifactError::BlobMissing { .. } => Self::BlobMissing,
            other => Self::Internal(other),
        }
    }
}

impl IntoResponse for ArtifactApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Token(TokenError::MismatchedArtifact) => {
                (StatusCode::FORBIDDEN, "Token does not match artifact".to_owned())
            }
            Self::Token(err) => (StatusCode::UNAUTHORIZED, err.to_string()),
            Self::NotFound => (StatusCode::NOT_FOUND, "Artifact not found".to_owned()),
            Self::BlobMissing => (StatusCode::GONE, "Blob missing (pruned?)".to_owned()),
            Self::Internal(err) => {
                tracing::error!(%err, "artifact store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_owned())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
