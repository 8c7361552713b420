//! Shared test utilities for integration tests.

use std::path::PathBuf;
use std::process::Command;

use sandboxd::config::{AddressStrategy, Config, DatasetAccess, Secret, SessionStorage};

/// Check if the Docker daemon is reachable.
#[must_use]
pub fn docker_available() -> bool {
    Command::new("docker").arg("info").output().map(|o| o.status.success()).unwrap_or(false)
}

/// Skip the test if Docker is not available.
#[macro_export]
macro_rules! skip_if_no_docker {
    () => {
        if !common::docker_available() {
            eprintln!("Skipping test: Docker not available");
            return;
        }
    };
}

/// A minimal, fully-populated [`Config`] rooted at `root`, suitable as a base
/// for integration tests that only care about a couple of fields.
#[must_use]
pub fn test_config(root: PathBuf) -> Config {
    Config {
        session_storage: SessionStorage::Tmpfs,
        dataset_access: DatasetAccess::None,
        sessions_root: root.join("sessions"),
        datasets_host_ro: None,
        hybrid_local_path: None,
        blobstore_dir: root.join("blobstore"),
        artifacts_db_path: root.join("artifacts.db"),
        cache_filename: "cache_datasets.json".to_owned(),
        sandbox_image: "sandboxd-repl:latest".to_owned(),
        tmpfs_size_mb: 1024,
        address_strategy: AddressStrategy::Host,
        compose_network: None,
        host_gateway: "host.docker.internal".to_owned(),
        artifacts_secret: Secret::Fixed(b"integration-test-secret".to_vec()),
        artifacts_token_ttl_seconds: 600,
        artifacts_public_base_url: None,
        artifacts_server_port_candidates: vec![18080, 18081, 18082],
        max_artifact_size_mb: 50,
    }
}
