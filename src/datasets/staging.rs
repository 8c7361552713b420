//! Dataset Staging (C7): places dataset bytes where the sandbox expects to
//! find them, branching on `DatasetAccess` and `SessionStorage`. Ported from
//! `dataset_manager/staging.py` and the `load_pending_datasets` driver in
//! `dataset_manager/sync.py`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{Config, DatasetAccess, SessionStorage};
use crate::container::DockerIo;
use crate::datasets::cache::{self, DatasetStatus};
use crate::error::DatasetError;

/// Canonical in-container mount point for datasets (`LOCAL_RO`, `HYBRID`
/// fallback, and `API` staging all converge on this path).
pub const CONTAINER_DATA_DIR: &str = "/data";

const DEFAULT_FILE_MODE: u32 = 0o644;

/// Pluggable dataset byte source, so staging can be tested without a real
/// downloader.
#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    async fn fetch(&self, ds_id: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetcher backed by the placeholder [`crate::datasets::fetcher::fetch_dataset`].
pub struct PlaceholderFetcher;

#[async_trait]
impl DatasetFetcher for PlaceholderFetcher {
    async fn fetch(&self, ds_id: &str) -> anyhow::Result<Vec<u8>> {
        crate::datasets::fetcher::fetch_dataset(ds_id).await
    }
}

/// A dataset's resolved location after staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDataset {
    pub id: String,
    pub path_in_container: String,
}

fn container_path(ds_id: &str) -> String {
    format!("{CONTAINER_DATA_DIR}/{ds_id}.parquet")
}

fn host_bind_data_path(cfg: &Config, session_id: &str, ds_id: &str) -> PathBuf {
    cfg.session_dir(session_id).join("data").join(format!("{ds_id}.parquet"))
}

async fn atomic_write_bytes(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Fetch a dataset and place it where the sandbox expects it, for `API` (and
/// the `API`-fallback branch of `HYBRID`) dataset access.
///
/// # Errors
///
/// Returns [`DatasetError::FetchFailed`] if `fetcher` fails, or
/// [`DatasetError::StageFailed`] if writing the bytes into the container or
/// onto the host fails.
pub async fn stage_dataset_into_sandbox(
    cfg: &Config,
    docker: &DockerIo,
    session_id: &str,
    container_id: &str,
    ds_id: &str,
    fetcher: &dyn DatasetFetcher,
) -> Result<StagedDataset, DatasetError> {
    if !matches!(cfg.dataset_access, DatasetAccess::Api | DatasetAccess::Hybrid) {
        return Err(DatasetError::StageFailed {
            id: ds_id.to_owned(),
            source: anyhow::anyhow!("stage_dataset_into_sandbox requires API or HYBRID dataset access"),
        });
    }

    let data = fetcher
        .fetch(ds_id)
        .await
        .map_err(|source| DatasetError::FetchFailed { id: ds_id.to_owned(), source })?;

    match cfg.session_storage {
        SessionStorage::Tmpfs => {
            docker
                .put_bytes(container_id, &container_path(ds_id), &data, DEFAULT_FILE_MODE)
                .await
                .map_err(|source| DatasetError::StageFailed { id: ds_id.to_owned(), source: source.into() })?;
        }
        SessionStorage::Bind => {
            let dest = host_bind_data_path(cfg, session_id, ds_id);
            atomic_write_bytes(&dest, &data)
                .await
                .map_err(|source| DatasetError::StageFailed { id: ds_id.to_owned(), source: source.into() })?;
        }
    }

    Ok(StagedDataset { id: ds_id.to_owned(), path_in_container: container_path(ds_id) })
}

/// Resolve the in-container path for a dataset assumed already present via a
/// `LOCAL_RO` mount, with no fetch performed.
#[must_use]
pub fn resolve_local_ro_path(ds_id: &str) -> StagedDataset {
    StagedDataset { id: ds_id.to_owned(), path_in_container: container_path(ds_id) }
}

/// Load every `PENDING` dataset in `ds_ids` into the sandbox, flipping each
/// entry's cache status to `LOADED` on success or `FAILED` on error. Mirrors
/// `load_pending_datasets`: `HYBRID` checks the local mount first, falling
/// back to `API`-style staging only when the file isn't there.
///
/// # Errors
///
/// Returns the first [`DatasetError`] encountered; datasets processed before
/// the failure keep whatever cache status they were given.
pub async fn load_pending_datasets(
    cfg: &Config,
    docker: &DockerIo,
    session_id: &str,
    container_id: &str,
    fetcher: &dyn DatasetFetcher,
    ds_ids: &[String],
) -> Result<Vec<StagedDataset>, DatasetError> {
    let mut out = Vec::with_capacity(ds_ids.len());

    for ds_id in ds_ids {
        let result = stage_one(cfg, docker, session_id, container_id, ds_id, fetcher).await;
        match result {
            Ok(staged) => {
                cache::update_entry_status(cfg, session_id, ds_id, DatasetStatus::Loaded)
                    .await
                    .map_err(|source| DatasetError::StageFailed { id: ds_id.clone(), source: source.into() })?;
                out.push(staged);
            }
            Err(err) => {
                let _ = cache::update_entry_status(cfg, session_id, ds_id, DatasetStatus::Failed).await;
                return Err(err);
            }
        }
    }

    Ok(out)
}

async fn stage_one(
    cfg: &Config,
    docker: &DockerIo,
    session_id: &str,
    container_id: &str,
    ds_id: &str,
    fetcher: &dyn DatasetFetcher,
) -> Result<StagedDataset, DatasetError> {
    if cfg.dataset_access == DatasetAccess::Hybrid {
        if let Some(hybrid_root) = &cfg.hybrid_local_path {
            let local_file = hybrid_root.join(format!("{ds_id}.parquet"));
            if tokio::fs::metadata(&local_file).await.is_ok() {
                return Ok(resolve_local_ro_path(ds_id));
            }
        }
    }

    if cfg.dataset_access == DatasetAccess::LocalRo {
        return Ok(resolve_local_ro_path(ds_id));
    }

    stage_dataset_into_sandbox(cfg, docker, session_id, container_id, ds_id, fetcher).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressStrategy, Secret};

    fn test_config(root: PathBuf, storage: SessionStorage, access: DatasetAccess) -> Config {
        Config {
            session_storage: storage,
            dataset_access: access,
            sessions_root: root,
            datasets_host_ro: None,
            hybrid_local_path: None,
            blobstore_dir: PathBuf::from("blobstore"),
            artifacts_db_path: PathBuf::from("artifacts.db"),
            cache_filename: "cache_datasets.json".to_owned(),
            sandbox_image: "sandbox:latest".to_owned(),
            tmpfs_size_mb: 1024,
            address_strategy: AddressStrategy::Container,
            compose_network: None,
            host_gateway: "host.docker.internal".to_owned(),
            artifacts_secret: Secret::Fixed(b"test".to_vec()),
            artifacts_token_ttl_seconds: 600,
            artifacts_public_base_url: None,
            artifacts_server_port_candidates: vec![8000],
            max_artifact_size_mb: 50,
        }
    }

    #[test]
    fn container_path_uses_data_dir_and_parquet_suffix() {
        assert_eq!(container_path("ds-1"), "/data/ds-1.parquet");
    }

    #[tokio::test]
    async fn bind_mode_writes_atomically_to_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path().to_owned(), SessionStorage::Bind, DatasetAccess::Api);
        let docker = DockerIo::new();

        let staged = stage_dataset_into_sandbox(&cfg, &docker, "sess-1", "unused", "ds-1", &PlaceholderFetcher)
            .await
            .expect("stage");

        assert_eq!(staged.path_in_container, "/data/ds-1.parquet");
        let host_path = host_bind_data_path(&cfg, "sess-1", "ds-1");
        let contents = tokio::fs::read(&host_path).await.expect("read staged file");
        assert_eq!(contents, b"PARQUET_BYTES_FOR::ds-1");
    }

    #[tokio::test]
    async fn local_ro_resolves_without_fetching() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path().to_owned(), SessionStorage::Tmpfs, DatasetAccess::LocalRo);
        let docker = DockerIo::new();

        let staged = stage_one(&cfg, &docker, "sess-1", "unused", "ds-1", &PlaceholderFetcher)
            .await
            .expect("stage");
        assert_eq!(staged.path_in_container, "/data/ds-1.parquet");
    }

    #[tokio::test]
    async fn hybrid_prefers_local_file_when_present() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let hybrid_dir = tmp.path().join("heavy_data");
        tokio::fs::create_dir_all(&hybrid_dir).await.expect("mkdir hybrid");
        tokio::fs::write(hybrid_dir.join("ds-1.parquet"), b"local bytes").await.expect("write local");

        let mut cfg = test_config(tmp.path().to_owned(), SessionStorage::Tmpfs, DatasetAccess::Hybrid);
        cfg.hybrid_local_path = Some(hybrid_dir);
        let docker = DockerIo::new();

        let staged = stage_one(&cfg, &docker, "sess-1", "unused", "ds-1", &PlaceholderFetcher)
            .await
            .expect("stage");
        assert_eq!(staged.path_in_container, "/data/ds-1.parquet");
    }
}
