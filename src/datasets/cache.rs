//! Dataset Cache (C6): a per-session, durable, deduplicated list of dataset
//! ids and their load status, persisted as JSON with atomic replace. Ported
//! from `dataset_manager/cache.py`.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::DatasetError;

/// Status of one dataset entry in the per-session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Loaded,
    Pending,
    Failed,
}

/// One row of the dataset cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    pub status: DatasetStatus,
    pub timestamp: String,
}

impl DatasetEntry {
    #[must_use]
    pub fn new(id: impl Into<String>, status: DatasetStatus) -> Self {
        Self { id: id.into(), status, timestamp: now_iso() }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Host-side path to the JSON cache file for a session, regardless of
/// `TMPFS`/`BIND` session storage mode.
#[must_use]
pub fn cache_file_path(cfg: &Config, session_id: &str) -> PathBuf {
    cfg.session_dir(session_id).join(&cfg.cache_filename)
}

async fn read_cache_file(cfg: &Config, session_id: &str) -> CacheFile {
    let path = cache_file_path(cfg, session_id);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => CacheFile::default(),
    }
}

async fn write_cache_file(cfg: &Config, session_id: &str, file: &CacheFile) -> Result<PathBuf, DatasetError> {
    let path = cache_file_path(cfg, session_id);
    let parent = path.parent().unwrap_or(&path).to_owned();

    (|| async {
        tokio::fs::create_dir_all(&parent).await?;
        let json = serde_json::to_string_pretty(file).map_err(std::io::Error::other)?;
        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok::<(), std::io::Error>(())
    })()
    .await
    .map_err(|source| DatasetError::StageFailed { id: session_id.to_owned(), source: source.into() })?;

    Ok(path)
}

/// Deduplicated, insertion-ordered entries (first occurrence of an id wins).
///
/// # Errors
///
/// Never fails on a missing or corrupt cache file (treated as empty); this
/// can only return an error surface for API symmetry with the writers.
pub async fn read_entries(cfg: &Config, session_id: &str) -> Vec<DatasetEntry> {
    let file = read_cache_file(cfg, session_id).await;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in file.datasets {
        if seen.insert(entry.id.clone()) {
            out.push(entry);
        }
    }
    out
}

/// Ids currently in `Pending` status, in cache order.
pub async fn read_pending_ids(cfg: &Config, session_id: &str) -> Vec<String> {
    read_entries(cfg, session_id)
        .await
        .into_iter()
        .filter(|e| e.status == DatasetStatus::Pending)
        .map(|e| e.id)
        .collect()
}

/// Overwrite the cache with `entries`, deduplicating by id (first wins).
///
/// # Errors
///
/// Returns [`DatasetError::StageFailed`] if the file cannot be written.
pub async fn write_entries(
    cfg: &Config,
    session_id: &str,
    entries: impl IntoIterator<Item = DatasetEntry>,
) -> Result<PathBuf, DatasetError> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for entry in entries {
        if !entry.id.is_empty() && seen.insert(entry.id.clone()) {
            unique.push(entry);
        }
    }
    write_cache_file(cfg, session_id, &CacheFile { datasets: unique }).await
}

/// Insert a new entry or update an existing one's status and timestamp.
///
/// # Errors
///
/// Returns [`DatasetError::StageFailed`] if the file cannot be written.
pub async fn add_entry(
    cfg: &Config,
    session_id: &str,
    ds_id: &str,
    status: DatasetStatus,
) -> Result<PathBuf, DatasetError> {
    let mut entries = read_entries(cfg, session_id).await;
    if let Some(existing) = entries.iter_mut().find(|e| e.id == ds_id) {
        existing.status = status;
        existing.timestamp = now_iso();
    } else {
        entries.push(DatasetEntry::new(ds_id, status));
    }
    write_entries(cfg, session_id, entries).await
}

/// Update an existing entry's status (or create it as PENDING then set the
/// status, matching [`add_entry`]'s upsert semantics).
///
/// # Errors
///
/// Returns [`DatasetError::StageFailed`] if the file cannot be written.
pub async fn update_entry_status(
    cfg: &Config,
    session_id: &str,
    ds_id: &str,
    status: DatasetStatus,
) -> Result<PathBuf, DatasetError> {
    add_entry(cfg, session_id, ds_id, status).await
}

/// Clear the cache file, writing an empty entry list.
///
/// # Errors
///
/// Returns [`DatasetError::StageFailed`] if the file cannot be written.
pub async fn clear_cache(cfg: &Config, session_id: &str) -> Result<PathBuf, DatasetError> {
    write_entries(cfg, session_id, std::iter::empty()).await
}
