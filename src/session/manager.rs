//! Session Manager (C8): starts, reattaches to, drives, and tears down
//! long-lived sandbox containers, one per conversation. Ported from
//! `sandbox/session_manager.py` and `sandbox/container_utils.py`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::artifacts::{ArtifactStore, IngestedArtifact, TokenService};
use crate::config::{AddressStrategy, Config, DatasetAccess, SessionStorage};
use crate::container::{CreateContainerOpts, DockerIo, Mount, NetworkMode};
use crate::error::{ArtifactError, ContainerIoError, SessionError};
use crate::session::repl::ReplClient;

const REPL_PORT: &str = "9000/tcp";
const CONTAINER_REPL_PORT: u16 = 9000;
const IDLE_TIMEOUT: Duration = Duration::from_secs(45 * 60);
const HEALTH_POLL_ATTEMPTS: u32 = 50;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SESSION_CONTAINER_PREFIX: &str = "sbox-";

/// Bookkeeping for one live session, mirroring `SessionInfo`.
#[derive(Debug, Clone)]
struct SessionInfo {
    container_id: String,
    repl_base_url: String,
    session_dir: Option<PathBuf>,
    session_storage: SessionStorage,
    last_used: std::time::Instant,
}

/// An ingested artifact plus its best-effort download URL, matching the
/// original's artifact descriptor dict. `id`/`url` are `None` and `error` is
/// `Some` when the source file was rejected (e.g. too large) rather than
/// catalogued.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactDescriptor {
    pub id: Option<String>,
    pub filename: Option<String>,
    pub mime: String,
    pub size: i64,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl ArtifactDescriptor {
    fn from_artifact(artifact: IngestedArtifact, tokens: Option<&TokenService>) -> Self {
        let url = match (&artifact.id, tokens) {
            (Some(id), Some(t)) => Some(t.create_download_url(id)),
            _ => None,
        };
        Self {
            id: artifact.id,
            filename: artifact.filename,
            mime: artifact.mime,
            size: artifact.size,
            url,
            error: artifact.error,
        }
    }
}

/// Result of one `exec` call against a session's REPL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecOutcome {
    pub ok: bool,
    pub stdout: String,
    pub error: String,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub session_dir: Option<String>,
}

/// Result of [`SessionManager::export_file`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExportResult {
    pub host_path: String,
    pub download_url: String,
}

/// Manages the lifecycle of sandbox containers and routes code execution and
/// artifact export through them.
pub struct SessionManager {
    cfg: Config,
    docker: DockerIo,
    store: Arc<ArtifactStore>,
    tokens: Option<Arc<TokenService>>,
    infos: DashMap<String, SessionInfo>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(cfg: Config, store: Arc<ArtifactStore>, tokens: Option<Arc<TokenService>>) -> Self {
        Self { cfg, docker: DockerIo::new(), store, tokens, infos: DashMap::new(), locks: DashMap::new() }
    }

    fn lock_for(&self, session_key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(session_key.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Remove sessions idle longer than [`IDLE_TIMEOUT`], best-effort. Called
    /// opportunistically from [`Self::start`]; also exposed for a background
    /// sweeper task run alongside the Artifact HTTP API.
    pub async fn sweep_idle(&self) {
        let stale: Vec<String> = self
            .infos
            .iter()
            .filter(|entry| entry.last_used.elapsed() > IDLE_TIMEOUT)
            .map(|entry| entry.key().clone())
            .collect();

        for sid in stale {
            if let Some((_, info)) = self.infos.remove(&sid) {
                self.docker.force_remove(&info.container_id).await;
            }
            self.locks.remove(&sid);
        }
    }

    /// Start (or reattach to) the sandbox container for `session_key`,
    /// generating an id if none is given. Returns the resolved session key.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ContainerCreateFailed`] if the container
    /// runtime refuses to create/start the container, or
    /// [`SessionError::HealthTimeout`] if the REPL never answers `/health`.
    #[tracing::instrument(skip(self), fields(session_key = session_key.unwrap_or("<anon>")))]
    pub async fn start(&self, session_key: Option<&str>) -> Result<String, SessionError> {
        self.sweep_idle().await;

        if let Some(key) = session_key {
            if self.infos.contains_key(key) {
                tracing::info!(session_key = key, "reusing already-registered session");
                return Ok(key.to_owned());
            }
        }

        let sid = session_key.map(str::to_owned).unwrap_or_else(|| format!("anon-{}", short_uuid()));
        let name = format!("{SESSION_CONTAINER_PREFIX}{sid}");

        let session_dir = match self.cfg.session_storage {
            SessionStorage::Bind => {
                let dir = self.cfg.session_dir(&sid);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| SessionError::ContainerCreateFailed { session: sid.clone(), source: e.into() })?;
                Some(dir)
            }
            SessionStorage::Tmpfs => None,
        };

        if let Some(info) = self.reattach_if_exists(&sid, &name, session_dir.clone()).await? {
            tracing::info!(session_key = %info, "reattached to existing container");
            return Ok(info);
        }

        let sid = self.create_and_register(&sid, &name, session_dir).await?;
        tracing::info!(session_key = %sid, "session started");
        Ok(sid)
    }

    async fn reattach_if_exists(
        &self,
        sid: &str,
        name: &str,
        session_dir: Option<PathBuf>,
    ) -> Result<Option<String>, SessionError> {
        let existing = self
            .docker
            .list_with_prefix(name, false)
            .await
            .unwrap_or_default();
        if !existing.iter().any(|n| n == name) {
            return Ok(None);
        }

        if !self.docker.is_running(name).await.unwrap_or(false) {
            if self.docker.start_container(name).await.is_err() {
                self.docker.force_remove(name).await;
                return Ok(None);
            }
        }

        let repl_base_url = self.resolve_repl_url(sid, name).await;
        self.infos.insert(
            sid.to_owned(),
            SessionInfo {
                container_id: name.to_owned(),
                repl_base_url,
                session_dir,
                session_storage: self.cfg.session_storage,
                last_used: std::time::Instant::now(),
            },
        );
        Ok(Some(sid.to_owned()))
    }

    async fn create_and_register(
        &self,
        sid: &str,
        name: &str,
        session_dir: Option<PathBuf>,
    ) -> Result<String, SessionError> {
        self.docker.force_remove(name).await;

        let mut mounts = Vec::new();
        match self.cfg.session_storage {
            SessionStorage::Tmpfs => {
                mounts.push(Mount::Tmpfs { container_path: "/session".to_owned(), size_mb: self.cfg.tmpfs_size_mb });
            }
            SessionStorage::Bind => {
                let dir = session_dir.clone().ok_or_else(|| SessionError::ContainerCreateFailed {
                    session: sid.to_owned(),
                    source: anyhow::anyhow!("BIND mode requires a session directory"),
                })?;
                mounts.push(Mount::Bind { host_path: dir, container_path: "/session".to_owned(), read_only: false });
            }
        }

        match self.cfg.dataset_access {
            DatasetAccess::LocalRo => {
                if let Some(host_ro) = &self.cfg.datasets_host_ro {
                    mounts.push(Mount::Bind {
                        host_path: host_ro.clone(),
                        container_path: "/data".to_owned(),
                        read_only: true,
                    });
                }
            }
            DatasetAccess::Hybrid => {
                if let Some(hybrid) = &self.cfg.hybrid_local_path {
                    mounts.push(Mount::Bind {
                        host_path: hybrid.clone(),
                        container_path: "/data".to_owned(),
                        read_only: true,
                    });
                }
            }
            DatasetAccess::None | DatasetAccess::Api => {}
        }

        let network = match self.cfg.address_strategy {
            AddressStrategy::Container => {
                NetworkMode::Network(self.cfg.compose_network.clone().unwrap_or_default())
            }
            AddressStrategy::Host => NetworkMode::PublishPort,
        };

        let opts = CreateContainerOpts {
            name: name.to_owned(),
            image: self.cfg.sandbox_image.clone(),
            mounts,
            network,
            repl_port: REPL_PORT.to_owned(),
        };

        let container_id = self
            .docker
            .create_container(&opts)
            .await
            .map_err(|source| SessionError::ContainerCreateFailed { session: sid.to_owned(), source })?;
        self.docker
            .start_container(&container_id)
            .await
            .map_err(|source| SessionError::ContainerCreateFailed { session: sid.to_owned(), source })?;

        let repl_base_url = self.resolve_repl_url(sid, name).await;
        self.infos.insert(
            sid.to_owned(),
            SessionInfo {
                container_id: container_id.clone(),
                repl_base_url: repl_base_url.clone(),
                session_dir,
                session_storage: self.cfg.session_storage,
                last_used: std::time::Instant::now(),
            },
        );

        let healthy =
            ReplClient::new(repl_base_url).wait_healthy(HEALTH_POLL_ATTEMPTS, HEALTH_POLL_INTERVAL).await;
        if !healthy {
            return Err(SessionError::HealthTimeout(sid.to_owned()));
        }

        if let Some(info) = self.infos.get(sid).map(|e| e.clone()) {
            self.write_session_metadata(
                &info,
                json!({
                    "session_id": sid,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                    "container_id": container_id,
                    "session_storage": self.cfg.session_storage.to_string(),
                    "dataset_access": self.cfg.dataset_access.to_string(),
                    "image": self.cfg.sandbox_image,
                    "execution_count": 0,
                    "last_used": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await;
            self.write_session_log(&info, json!({"event": "session_started", "container_id": container_id}))
                .await;
        }

        Ok(sid.to_owned())
    }

    async fn resolve_repl_url(&self, sid: &str, container_name: &str) -> String {
        match self.cfg.address_strategy {
            AddressStrategy::Container => format!("http://{container_name}:{CONTAINER_REPL_PORT}"),
            AddressStrategy::Host => {
                let gateway = detect_host_gateway(&self.cfg.host_gateway).await;
                let port = self.docker.published_port(container_name, REPL_PORT).await.unwrap_or_else(|err| {
                    tracing::warn!(session = sid, error = %err, "failed to resolve published REPL port");
                    0
                });
                format!("http://{gateway}:{port}")
            }
        }
    }

    /// Execute `code` in the session's REPL, then diff, copy out, and ingest
    /// any newly created files under `/session/artifacts`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] if `session_key` was never
    /// started, [`SessionError::NetworkUnreachable`] if the REPL request
    /// fails, or a wrapped [`ArtifactError`] if ingestion fails.
    #[tracing::instrument(skip(self, code, timeout), fields(session_key = session_key))]
    pub async fn exec(&self, session_key: &str, code: &str, timeout: Duration) -> Result<ExecOutcome, SessionError> {
        let lock = self.lock_for(session_key);
        let _guard = lock.lock().await;

        let info = self
            .infos
            .get(session_key)
            .map(|entry| entry.clone())
            .ok_or_else(|| SessionError::UnknownSession(session_key.to_owned()))?;

        if let Some(mut entry) = self.infos.get_mut(session_key) {
            entry.last_used = std::time::Instant::now();
        }

        let before = self.list_artifact_files(&info).await;

        let repl = ReplClient::new(info.repl_base_url.clone());
        let result = repl
            .exec(code, timeout)
            .await
            .map_err(|_| SessionError::NetworkUnreachable(session_key.to_owned()))?;

        self.write_session_log(
            &info,
            json!({
                "event": "code_execution",
                "code": code,
                "success": result.ok,
                "stdout": result.stdout,
                "error": result.error,
                "timeout": timeout.as_secs(),
            }),
        )
        .await;
        let execution_count = self.execution_count(&info).await + 1;
        self.write_session_metadata(
            &info,
            json!({"execution_count": execution_count, "last_used": chrono::Utc::now().to_rfc3339()}),
        )
        .await;

        let after = self.list_artifact_files(&info).await;
        let mut new_rel_paths: Vec<String> = after.difference(&before).cloned().collect();
        new_rel_paths.sort();

        if matches!(info.session_storage, SessionStorage::Tmpfs) && !new_rel_paths.is_empty() {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let (host_files, _staging_guard) = self.materialize_new_files(&info, &new_rel_paths).await?;

        let artifacts: Vec<ArtifactDescriptor> = self
            .store
            .ingest_files(&host_files, session_key, None, None, self.max_artifact_bytes())
            .await
            .map_err(SessionError::Artifact)?
            .into_iter()
            .map(|a| ArtifactDescriptor::from_artifact(a, self.tokens.as_deref()))
            .collect();

        if !artifacts.is_empty() {
            self.write_session_log(
                &info,
                json!({
                    "event": "artifacts_created",
                    "artifact_count": artifacts.len(),
                    "artifacts": artifacts.iter().map(|a| json!({
                        "id": a.id, "filename": a.filename, "content_type": a.mime, "size_bytes": a.size,
                    })).collect::<Vec<_>>(),
                }),
            )
            .await;
        }

        tracing::info!(
            session_key,
            ok = result.ok,
            artifact_count = artifacts.len(),
            "code execution completed"
        );

        Ok(ExecOutcome {
            ok: result.ok,
            stdout: result.stdout,
            error: result.error,
            artifacts,
            session_dir: info.session_dir.map(|d| d.display().to_string()),
        })
    }

    fn max_artifact_bytes(&self) -> u64 {
        self.cfg.max_artifact_size_mb * 1024 * 1024
    }

    async fn list_artifact_files(&self, info: &SessionInfo) -> HashSet<String> {
        match info.session_storage {
            SessionStorage::Tmpfs => self.list_artifact_files_container(&info.container_id).await,
            SessionStorage::Bind => info
                .session_dir
                .as_deref()
                .map(list_artifact_files_host)
                .unwrap_or_default(),
        }
    }

    async fn list_artifact_files_container(&self, container_id: &str) -> HashSet<String> {
        let script = "set -euo pipefail; if [ -d /session/artifacts ]; then \
            find /session/artifacts -type f -printf '%P\\n'; fi";
        let Ok(out) = self.docker.exec(container_id, &["/bin/sh", "-lc", script]).await else {
            return HashSet::new();
        };
        if !out.success() {
            return HashSet::new();
        }
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| format!("artifacts/{}", l.trim()))
            .collect()
    }

    async fn materialize_new_files(
        &self,
        info: &SessionInfo,
        new_rel_paths: &[String],
    ) -> Result<(Vec<PathBuf>, Option<tempfile::TempDir>), SessionError> {
        match info.session_storage {
            SessionStorage::Tmpfs => {
                let staging = tempfile::Builder::new()
                    .prefix("sbox_art_batch_")
                    .tempdir()
                    .map_err(|e| SessionError::ContainerIo(ContainerIoError::RuntimeIo(e)))?;
                let mut out = Vec::with_capacity(new_rel_paths.len());
                for rel in new_rel_paths {
                    let dest = staging.path().join(Path::new(rel).file_name().unwrap_or_default());
                    self.docker
                        .copy_out(&info.container_id, &format!("/session/{rel}"), &dest)
                        .await?;
                    out.push(dest);
                }
                Ok((out, Some(staging)))
            }
            SessionStorage::Bind => {
                let dir = info
                    .session_dir
                    .clone()
                    .ok_or_else(|| SessionError::ContainerCreateFailed {
                        session: "bind".to_owned(),
                        source: anyhow::anyhow!("BIND session missing session_dir"),
                    })?;
                Ok((new_rel_paths.iter().map(|rel| dir.join(rel)).collect(), None))
            }
        }
    }

    /// Append a JSON-lines entry to `<session_dir>/session.log`. BIND mode
    /// only; no-op otherwise. Failures are logged and swallowed — bookkeeping
    /// never fails the surrounding `exec`/`start`/`stop` call.
    async fn write_session_log(&self, info: &SessionInfo, mut entry: Value) {
        let SessionStorage::Bind = info.session_storage else { return };
        let Some(dir) = &info.session_dir else { return };

        if let Value::Object(map) = &mut entry {
            map.entry("timestamp").or_insert_with(|| json!(chrono::Utc::now().to_rfc3339()));
        }
        let line = format!("{entry}\n");
        if let Err(err) = append_line(&dir.join("session.log"), &line).await {
            tracing::warn!(session_dir = %dir.display(), error = %err, "failed to write session.log");
        }
    }

    /// Merge `patch` into `<session_dir>/session_metadata.json`, creating it
    /// if absent. BIND mode only; best-effort.
    async fn write_session_metadata(&self, info: &SessionInfo, patch: Value) {
        let SessionStorage::Bind = info.session_storage else { return };
        let Some(dir) = &info.session_dir else { return };
        let path = dir.join("session_metadata.json");

        let mut merged = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| json!({})),
            Err(_) => json!({}),
        };
        if let (Value::Object(existing), Value::Object(new)) = (&mut merged, &patch) {
            for (k, v) in new {
                existing.insert(k.clone(), v.clone());
            }
        }

        match serde_json::to_vec_pretty(&merged) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to write session_metadata.json");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize session_metadata.json"),
        }
    }

    /// Current `execution_count` from `session_metadata.json`, or 0. BIND
    /// mode only.
    async fn execution_count(&self, info: &SessionInfo) -> u64 {
        let SessionStorage::Bind = info.session_storage else { return 0 };
        let Some(dir) = &info.session_dir else { return 0 };
        let Ok(bytes) = tokio::fs::read(dir.join("session_metadata.json")).await else { return 0 };
        serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.get("execution_count").and_then(Value::as_u64))
            .unwrap_or(0)
    }

    /// Stop and remove the container for `session_key`; idempotent.
    #[tracing::instrument(skip(self), fields(session_key = session_key))]
    pub async fn stop(&self, session_key: &str) {
        if let Some((_, info)) = self.infos.remove(session_key) {
            self.write_session_log(&info, json!({"event": "session_stopped", "container_id": info.container_id}))
                .await;
            let final_count = self.execution_count(&info).await;
            self.write_session_metadata(
                &info,
                json!({"stopped_at": chrono::Utc::now().to_rfc3339(), "final_execution_count": final_count}),
            )
            .await;
            self.docker.force_remove(&info.container_id).await;
            tracing::info!(session_key, container_id = %info.container_id, "session stopped");
        }
        self.locks.remove(session_key);
    }

    /// Force-remove every `sbox-`-prefixed container, regardless of whether
    /// this process's registry knows about it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the container runtime cannot be queried at
    /// all.
    pub async fn cleanup_all_containers(&self) -> anyhow::Result<Vec<String>> {
        let names = self.docker.list_with_prefix(SESSION_CONTAINER_PREFIX, false).await?;
        for name in &names {
            self.docker.force_remove(name).await;
        }
        self.infos.clear();
        self.locks.clear();
        Ok(names)
    }

    /// Export a file from the container's `/data/` directory to the host,
    /// ingesting it into the artifact store for a stable download URL.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`], a [`ContainerIoError`] if
    /// the file is missing or cannot be copied, or an [`ArtifactError`] if
    /// ingestion fails.
    #[tracing::instrument(skip(self), fields(session_key = session_key, container_path = container_path))]
    pub async fn export_file(&self, session_key: &str, container_path: &str) -> Result<ExportResult, SessionError> {
        let info = self
            .infos
            .get(session_key)
            .map(|entry| entry.clone())
            .ok_or_else(|| SessionError::UnknownSession(session_key.to_owned()))?;

        if !container_path.starts_with("/data/") {
            return Err(SessionError::ContainerIo(ContainerIoError::PathIsDirectory(container_path.to_owned())));
        }

        let exports_dir = PathBuf::from("./exports/modified_datasets");
        tokio::fs::create_dir_all(&exports_dir)
            .await
            .map_err(ContainerIoError::RuntimeIo)?;

        let filename = Path::new(container_path).file_name().unwrap_or_default().to_string_lossy().into_owned();
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let host_path = exports_dir.join(format!("{timestamp}_{filename}"));

        self.docker.copy_out(&info.container_id, container_path, &host_path).await?;

        let artifacts = self
            .store
            .ingest_files(std::slice::from_ref(&host_path), session_key, None, None, self.max_artifact_bytes())
            .await
            .map_err(SessionError::Artifact)?;

        let download_url = artifacts
            .into_iter()
            .next()
            .and_then(|a| a.id)
            .and_then(|id| self.tokens.as_deref().map(|t| t.create_download_url(&id)))
            .unwrap_or_else(|| host_path.display().to_string());

        tracing::info!(session_key, %container_path, "file exported");
        Ok(ExportResult { host_path: host_path.display().to_string(), download_url })
    }
}

fn list_artifact_files_host(session_dir: &Path) -> HashSet<String> {
    let artifacts_dir = session_dir.join("artifacts");
    if !artifacts_dir.is_dir() {
        return HashSet::new();
    }
    walk_files(&artifacts_dir)
        .into_iter()
        .filter_map(|p| p.strip_prefix(session_dir).ok().map(|p| p.to_string_lossy().replace('\\', "/")))
        .collect()
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path));
        } else {
            out.push(path);
        }
    }
    out
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt as _;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await
}

async fn detect_host_gateway(configured: &str) -> String {
    if configured != "host.docker.internal" {
        return configured.to_owned();
    }
    if let Ok(version) = tokio::fs::read_to_string("/proc/version").await {
        if version.to_ascii_lowercase().contains("microsoft") {
            return "localhost".to_owned();
        }
    }
    if tokio::fs::metadata("/.dockerenv").await.is_ok() {
        return "host.docker.internal".to_owned();
    }
    if tokio::net::lookup_host(("host.docker.internal", 0_u16)).await.is_ok() {
        "host.docker.internal".to_owned()
    } else {
        "localhost".to_owned()
    }
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn test_config(root: PathBuf) -> Config {
        Config {
            session_storage: SessionStorage::Bind,
            dataset_access: DatasetAccess::None,
            sessions_root: root,
            datasets_host_ro: None,
            hybrid_local_path: None,
            blobstore_dir: PathBuf::from("blobstore"),
            artifacts_db_path: PathBuf::from("artifacts.db"),
            cache_filename: "cache_datasets.json".to_owned(),
            sandbox_image: "sandbox:latest".to_owned(),
            tmpfs_size_mb: 1024,
            address_strategy: AddressStrategy::Container,
            compose_network: Some("sandboxd-network".to_owned()),
            host_gateway: "host.docker.internal".to_owned(),
            artifacts_secret: Secret::Fixed(b"test".to_vec()),
            artifacts_token_ttl_seconds: 600,
            artifacts_public_base_url: None,
            artifacts_server_port_candidates: vec![8000],
            max_artifact_size_mb: 50,
        }
    }

    #[test]
    fn list_artifact_files_host_is_relative_and_posix_style() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let artifacts = tmp.path().join("artifacts").join("run_1");
        std::fs::create_dir_all(&artifacts).expect("mkdir");
        std::fs::write(artifacts.join("plot.png"), b"x").expect("write");

        let found = list_artifact_files_host(tmp.path());
        assert_eq!(found.len(), 1);
        assert!(found.iter().next().unwrap().ends_with("artifacts/run_1/plot.png"));
    }

    #[tokio::test]
    async fn unknown_session_exec_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path().to_owned());
        let store = Arc::new(
            ArtifactStore::open(&tmp.path().join("artifacts.db"), &tmp.path().join("blobstore"))
                .await
                .expect("open store"),
        );
        let manager = SessionManager::new(cfg, store, None);

        let err = manager.exec("never-started", "1+1", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn export_file_requires_data_prefix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path().to_owned());
        let store = Arc::new(
            ArtifactStore::open(&tmp.path().join("artifacts.db"), &tmp.path().join("blobstore"))
                .await
                .expect("open store"),
        );
        let manager = SessionManager::new(cfg, store, None);
        manager.infos.insert(
            "sess-1".to_owned(),
            SessionInfo {
                container_id: "sbox-sess-1".to_owned(),
                repl_base_url: "http://sbox-sess-1:9000".to_owned(),
                session_dir: Some(tmp.path().to_owned()),
                session_storage: SessionStorage::Bind,
                last_used: std::time::Instant::now(),
            },
        );

        let err = manager.export_file("sess-1", "/tmp/outside.parquet").await.unwrap_err();
        assert!(matches!(err, SessionError::ContainerIo(ContainerIoError::PathIsDirectory(_))));
    }

    async fn bind_manager(tmp: &Path) -> (SessionManager, SessionInfo) {
        let cfg = test_config(tmp.to_owned());
        let store = Arc::new(
            ArtifactStore::open(&tmp.join("artifacts.db"), &tmp.join("blobstore")).await.expect("open store"),
        );
        let manager = SessionManager::new(cfg, store, None);
        let info = SessionInfo {
            container_id: "sbox-sess-1".to_owned(),
            repl_base_url: "http://sbox-sess-1:9000".to_owned(),
            session_dir: Some(tmp.to_owned()),
            session_storage: SessionStorage::Bind,
            last_used: std::time::Instant::now(),
        };
        (manager, info)
    }

    #[tokio::test]
    async fn write_session_log_appends_json_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, info) = bind_manager(tmp.path()).await;

        manager.write_session_log(&info, json!({"event": "session_started"})).await;
        manager.write_session_log(&info, json!({"event": "code_execution"})).await;

        let contents = tokio::fs::read_to_string(tmp.path().join("session.log")).await.expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("parse line 1");
        assert_eq!(first["event"], "session_started");
        assert!(first.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn write_session_log_is_noop_for_tmpfs_sessions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, mut info) = bind_manager(tmp.path()).await;
        info.session_storage = SessionStorage::Tmpfs;

        manager.write_session_log(&info, json!({"event": "session_started"})).await;

        assert!(!tmp.path().join("session.log").exists());
    }

    #[tokio::test]
    async fn write_session_metadata_merges_rather_than_overwrites() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, info) = bind_manager(tmp.path()).await;

        manager.write_session_metadata(&info, json!({"container_id": "sbox-sess-1"})).await;
        manager.write_session_metadata(&info, json!({"execution_count": 3})).await;

        let bytes = tokio::fs::read(tmp.path().join("session_metadata.json")).await.expect("read metadata");
        let merged: Value = serde_json::from_slice(&bytes).expect("parse metadata");
        assert_eq!(merged["container_id"], "sbox-sess-1");
        assert_eq!(merged["execution_count"], 3);
    }

    #[tokio::test]
    async fn execution_count_reads_back_what_was_written() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (manager, info) = bind_manager(tmp.path()).await;

        assert_eq!(manager.execution_count(&info).await, 0);

        manager.write_session_metadata(&info, json!({"execution_count": 5})).await;
        assert_eq!(manager.execution_count(&info).await, 5);
    }
}
