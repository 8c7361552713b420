#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! Integration tests for the Artifact HTTP API (C5): drives the real axum
//! router in-process via `tower::ServiceExt::oneshot`, no TCP listener
//! involved, covering the status-code boundary behaviors from SPEC_FULL §8.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use sandboxd::artifacts::api::{create_router, ArtifactApiState};
use sandboxd::artifacts::{ArtifactStore, TokenService};
use sandboxd::config::Secret;
use tower::ServiceExt as _;

async fn new_state(tmp: &std::path::Path) -> ArtifactApiState {
    let store = Arc::new(
        ArtifactStore::open(&tmp.join("artifacts.db"), &tmp.join("blobstore")).await.expect("open store"),
    );
    let tokens = Arc::new(TokenService::new(Secret::Fixed(b"api-test-secret".to_vec()), 600, None, 18080));
    ArtifactApiState { store, tokens }
}

async fn ingest_one(state: &ArtifactApiState, tmp: &std::path::Path, contents: &[u8]) -> String {
    let staging = tmp.join("staging");
    tokio::fs::create_dir_all(&staging).await.expect("mkdir staging");
    let path = staging.join("payload.bin");
    tokio::fs::write(&path, contents).await.expect("write payload");

    let artifacts = state
        .store
        .ingest_files(&[path], "sess-http", None, None, 50 * 1024 * 1024)
        .await
        .expect("ingest");
    artifacts.into_iter().next().expect("one artifact").id.expect("artifact within size cap has an id")
}

#[tokio::test]
async fn download_with_valid_token_returns_200_and_bytes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let id = ingest_one(&state, tmp.path(), b"hello artifact").await;
    let token = state.tokens.create_token(&id);

    let app = create_router().with_state(state);
    let req = Request::builder()
        .uri(format!("/artifacts/{id}?token={token}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"hello artifact");
}

#[tokio::test]
async fn download_with_garbage_token_is_unauthorized() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let id = ingest_one(&state, tmp.path(), b"payload").await;

    let app = create_router().with_state(state);
    let req = Request::builder()
        .uri(format!("/artifacts/{id}?token=not-a-real-token"))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn download_with_mismatched_artifact_is_forbidden() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let id_a = ingest_one(&state, tmp.path(), b"artifact a").await;
    let token_for_a = state.tokens.create_token(&id_a);

    let staging = tmp.path().join("staging2");
    tokio::fs::create_dir_all(&staging).await.unwrap();
    let path_b = staging.join("b.bin");
    tokio::fs::write(&path_b, b"artifact b").await.unwrap();
    let id_b = state.store.ingest_files(&[path_b], "sess-http", None, None, 50 * 1024 * 1024).await.unwrap()[0]
        .id
        .clone()
        .expect("artifact within size cap has an id");

    let app = create_router().with_state(state);
    let req = Request::builder()
        .uri(format!("/artifacts/{id_b}?token={token_for_a}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn download_of_unknown_artifact_is_not_found() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let token = state.tokens.create_token("art_doesnotexist000000000");

    let app = create_router().with_state(state);
    let req = Request::builder()
        .uri("/artifacts/art_doesnotexist000000000?token=".to_owned() + &token)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn download_with_blob_pruned_out_of_band_is_gone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let id = ingest_one(&state, tmp.path(), b"will be pruned").await;
    let token = state.tokens.create_token(&id);

    let metadata = state.store.get_metadata(&id).await.expect("metadata");
    let blob_path = state.store.blob_path_for_sha(&metadata.sha256);
    tokio::fs::remove_file(&blob_path).await.expect("prune blob");

    let app = create_router().with_state(state);
    let req = Request::builder().uri(format!("/artifacts/{id}?token={token}")).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::GONE);
}

#[tokio::test]
async fn head_returns_metadata_without_bytes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = new_state(tmp.path()).await;
    let id = ingest_one(&state, tmp.path(), b"metadata only").await;
    let token = state.tokens.create_token(&id);

    let app = create_router().with_state(state);
    let req = Request::builder().uri(format!("/artifacts/{id}/head?token={token}")).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["id"], id);
    assert_eq!(json["size"], 13);
}
