//! Tests for the update pass against a mock release server: 204 short
//! circuit, download plus checksum verification, and checksum mismatch.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use edgeguard_agent_core::audit::AuditJournal;
use edgeguard_agent_core::updater::{PlatformVerifier, UpdateError, UpdateMetadata, Updater};

const BINARY: &[u8] = b"edgeguard agent binary v2";

fn updater_for(base_url: &str, dir: &std::path::Path) -> Updater {
    let journal =
        Arc::new(AuditJournal::open(&dir.join("audit.log"), "agent-upd").expect("journal"));
    Updater::new(
        reqwest::Client::new(),
        base_url,
        "1.0.0",
        Box::new(PlatformVerifier),
        journal,
    )
}

fn release_metadata(base_url: &str, sha256: String) -> UpdateMetadata {
    UpdateMetadata {
        version: "2.0.0".to_string(),
        release_date: Utc::now(),
        channel: "stable".to_string(),
        download_url: format!("{base_url}/download/agent"),
        sha256,
        signature: "c2lnbmF0dXJl".to_string(),
        mandatory: false,
    }
}

#[tokio::test]
async fn test_no_content_means_up_to_date() {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = Router::new().route(
        "/api/v1/updates/metadata",
        get(|| async { StatusCode::NO_CONTENT }),
    );
    let (base_url, _task) = common::serve(router).await;

    let updater = updater_for(&base_url, dir.path());
    let cancel = CancellationToken::new();
    let result = updater
        .check_for_update("stable", &cancel)
        .await
        .expect("check");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_download_and_verify_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sha256 = hex::encode(Sha256::digest(BINARY));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let base_url = format!("http://{}", listener.local_addr().expect("addr"));
    let metadata = release_metadata(&base_url, sha256);
    let served = metadata.clone();
    let router = Router::new()
        .route(
            "/api/v1/updates/metadata",
            get(move || {
                let metadata = served.clone();
                async move { Json(metadata) }
            }),
        )
        .route("/download/agent", get(|| async { BINARY.to_vec() }));
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock releases");
    });

    let updater = updater_for(&base_url, dir.path());
    let cancel = CancellationToken::new();

    let found = updater
        .check_for_update("stable", &cancel)
        .await
        .expect("check")
        .expect("metadata");
    assert_eq!(found.version, "2.0.0");

    let downloaded = updater
        .download_update(&found, &cancel)
        .await
        .expect("download");
    assert_eq!(std::fs::read(&downloaded).expect("read"), BINARY);

    updater.verify_update(&downloaded, &found).expect("verify");
    std::fs::remove_file(&downloaded).expect("cleanup");
}

#[tokio::test]
async fn test_checksum_mismatch_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = dir.path().join("agent_update");
    std::fs::write(&binary, b"tampered bytes").expect("write");

    let updater = updater_for("http://127.0.0.1:9", dir.path());
    let metadata = release_metadata(
        "http://127.0.0.1:9",
        hex::encode(Sha256::digest(BINARY)),
    );

    assert!(matches!(
        updater.verify_update(&binary, &metadata),
        Err(UpdateError::ChecksumMismatch { .. })
    ));
}
