//! Artifact Store (C3): content-addressed blob storage plus a SQLite
//! metadata catalog, following the same bootstrap-then-query shape as the
//! teacher's `SqliteStore` (`run_migrations`/`migrate_to_v*`), scaled down
//! to this store's single fixed schema.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::ArtifactError;

/// A catalog row: the metadata recorded for one piece of content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Artifact {
    /// App-facing id, `art_` followed by 24 hex characters.
    pub id: String,
    /// SHA-256 content hash, hex-encoded.
    pub sha256: String,
    /// Size in bytes.
    pub size: i64,
    /// Sniffed MIME type.
    pub mime: String,
    /// Original filename, if known.
    pub filename: Option<String>,
    /// Catalog insertion time.
    pub created_at: DateTime<Utc>,
}

/// One descriptor returned from [`ArtifactStore::ingest_files`]: either a
/// successfully-catalogued artifact (`id`/`sha256` populated, `error: None`)
/// or a file that exceeded the size cap (`id`/`sha256: None`, `error: Some`),
/// mirroring the original's per-file descriptor dict.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestedArtifact {
    /// App-facing id, `None` if the file was too large to catalog.
    pub id: Option<String>,
    /// SHA-256 content hash, hex-encoded; `None` if too large.
    pub sha256: Option<String>,
    /// Size in bytes.
    pub size: i64,
    /// Sniffed MIME type.
    pub mime: String,
    /// Original filename, if known.
    pub filename: Option<String>,
    /// Catalog insertion time (or rejection time, if too large).
    pub created_at: DateTime<Utc>,
    /// Set when the file was rejected instead of catalogued.
    pub error: Option<String>,
}

impl From<Artifact> for IngestedArtifact {
    fn from(a: Artifact) -> Self {
        Self {
            id: Some(a.id),
            sha256: Some(a.sha256),
            size: a.size,
            mime: a.mime,
            filename: a.filename,
            created_at: a.created_at,
            error: None,
        }
    }
}

/// Bootstrap and query handle for the artifact catalog and blob store.
pub struct ArtifactStore {
    pool: SqlitePool,
    blob_dir: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if missing) the metadata database and blob directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob directory cannot be created or the
    /// database cannot be opened/migrated.
    pub async fn open(db_path: &Path, blob_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(blob_dir).await?;
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL;").execute(&pool).await?;

        Self::migrate_to_v1(&pool).await?;

        Ok(Self { pool, blob_dir: blob_dir.to_owned() })
    }

    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                sha256 TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                mime TEXT NOT NULL,
                filename TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS links (
                artifact_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                run_id TEXT,
                tool_call_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (artifact_id) REFERENCES artifacts(id) ON DELETE CASCADE
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_sha256 ON artifacts(sha256)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_artifact_id ON links(artifact_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_session ON links(session_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Two-level sharded path for a content hash: `blob_dir/ab/cd/abcdef...`.
    #[must_use]
    pub fn blob_path_for_sha(&self, sha256: &str) -> PathBuf {
        blob_path_for_sha(&self.blob_dir, sha256)
    }

    /// Ingest files staged on the host into the catalog, deduplicating by
    /// content hash and linking each resulting artifact to `session_id`.
    ///
    /// Files over `max_bytes` are not catalogued and their source is left in
    /// place for the caller to decide what to do with it, but a descriptor is
    /// still returned for them: `id`/`sha256: None`, `error: Some(..)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] if hashing, copying, or a database operation
    /// fails for a file that was not rejected for size.
    pub async fn ingest_files(
        &self,
        host_files: &[PathBuf],
        session_id: &str,
        run_id: Option<&str>,
        tool_call_id: Option<&str>,
        max_bytes: u64,
    ) -> Result<Vec<IngestedArtifact>, ArtifactError> {
        let mut out = Vec::new();

        for src in host_files {
            let Ok(meta) = tokio::fs::metadata(src).await else { continue };
            if !meta.is_file() {
                continue;
            }
            if meta.len() > max_bytes {
                let too_large = ArtifactError::TooLarge { size: meta.len(), max_bytes };
                tracing::warn!(path = %src.display(), size = meta.len(), max_bytes, "rejecting oversized artifact");
                out.push(IngestedArtifact {
                    id: None,
                    sha256: None,
                    size: meta.len() as i64,
                    mime: mime_guess::from_path(src).first_or_octet_stream().essence_str().to_owned(),
                    filename: src.file_name().map(|n| n.to_string_lossy().into_owned()),
                    created_at: Utc::now(),
                    error: Some(too_large.to_string()),
                });
                continue;
            }

            let sha256 = hash_file(src).await?;
            let mime = mime_guess::from_path(src).first_or_octet_stream().essence_str().to_owned();
            let filename = src.file_name().map(|n| n.to_string_lossy().into_owned());
            let created_at = Utc::now();
            let blob_path = self.blob_path_for_sha(&sha256);

            let artifact_id = self
                .upsert_artifact(&sha256, meta.len() as i64, &mime, filename.as_deref(), created_at, &blob_path, src)
                .await?;

            sqlx::query(
                "INSERT INTO links (artifact_id, session_id, run_id, tool_call_id, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&artifact_id)
            .bind(session_id)
            .bind(run_id)
            .bind(tool_call_id)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

            let _ = tokio::fs::remove_file(src).await;

            out.push(IngestedArtifact {
                id: Some(artifact_id),
                sha256: Some(sha256),
                size: meta.len() as i64,
                mime,
                filename,
                created_at,
                error: None,
            });
        }

        Ok(out)
    }

    async fn upsert_artifact(
        &self,
        sha256: &str,
        size: i64,
        mime: &str,
        filename: Option<&str>,
        created_at: DateTime<Utc>,
        blob_path: &Path,
        src: &Path,
    ) -> Result<String, ArtifactError> {
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM artifacts WHERE sha256 = ?")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(id) = existing {
            if tokio::fs::metadata(blob_path).await.is_err() {
                copy_into_blob(src, blob_path).await?;
            }
            return Ok(id);
        }

        copy_into_blob(src, blob_path).await?;
        let id = generate_artifact_id();
        sqlx::query(
            "INSERT INTO artifacts (id, sha256, size, mime, filename, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(sha256)
        .bind(size)
        .bind(mime)
        .bind(filename)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Look up an artifact's metadata by id.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if no such artifact exists.
    pub async fn get_metadata(&self, artifact_id: &str) -> Result<Artifact, ArtifactError> {
        let row = sqlx::query(
            "SELECT id, sha256, size, mime, filename, created_at FROM artifacts WHERE id = ?",
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_owned()))?;

        row_to_artifact(&row)
    }

    /// Read the full contents of an artifact's blob.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if the catalog has no such id, or
    /// [`ArtifactError::BlobMissing`] if the row exists but the blob file
    /// does not.
    pub async fn read_bytes(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactError> {
        let artifact = self.get_metadata(artifact_id).await?;
        let path = self.blob_path_for_sha(&artifact.sha256);
        tokio::fs::read(&path).await.map_err(|_| ArtifactError::BlobMissing {
            artifact_id: artifact_id.to_owned(),
            sha256: artifact.sha256,
        })
    }

    /// Read an artifact as text, replacing invalid UTF-8 and truncating to
    /// `max_bytes` if given.
    ///
    /// # Errors
    ///
    /// Same as [`Self::read_bytes`].
    pub async fn read_text(&self, artifact_id: &str, max_bytes: Option<usize>) -> Result<String, ArtifactError> {
        let mut bytes = self.read_bytes(artifact_id).await?;
        if let Some(limit) = max_bytes {
            bytes.truncate(limit);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// List every artifact linked to a session, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Db`] on a query failure.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        let rows = sqlx::query(
            r"
            SELECT a.id, a.sha256, a.size, a.mime, a.filename, a.created_at
            FROM artifacts a
            JOIN links l ON l.artifact_id = a.id
            WHERE l.session_id = ?
            ORDER BY a.created_at DESC
            ",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_artifact).collect()
    }
}

fn row_to_artifact(row: &sqlx::sqlite::SqliteRow) -> Result<Artifact, ArtifactError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Artifact {
        id: row.try_get("id")?,
        sha256: row.try_get("sha256")?,
        size: row.try_get("size")?,
        mime: row.try_get("mime")?,
        filename: row.try_get("filename")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn blob_path_for_sha(blob_dir: &Path, sha256: &str) -> PathBuf {
    let (a, b) = (&sha256[..2], &sha256[2..4]);
    blob_dir.join(a).join(b).join(sha256)
}

async fn hash_file(path: &Path) -> Result<String, ArtifactError> {
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn copy_into_blob(src: &Path, dst: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(dst).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dst).await?;
    Ok(())
}

fn generate_artifact_id() -> String {
    format!("art_{}", uuid::Uuid::new_v4().simple())
        .chars()
        .take(28)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_shards_by_hash_prefix() {
        let dir = PathBuf::from("/blobstore");
        let path = blob_path_for_sha(&dir, "abcdef0123456789");
        assert_eq!(path, PathBuf::from("/blobstore/ab/cd/abcdef0123456789"));
    }

    #[test]
    fn generated_ids_have_art_prefix_and_no_dots() {
        let id = generate_artifact_id();
        assert!(id.starts_with("art_"));
        assert!(!id.contains('.'));
    }

    #[tokio::test]
    async fn ingest_deduplicates_identical_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db_path = tmp.path().join("artifacts.db");
        let blob_dir = tmp.path().join("blobstore");
        let store = ArtifactStore::open(&db_path, &blob_dir).await.expect("open store");

        let staging = tmp.path().join("staging");
        tokio::fs::create_dir_all(&staging).await.expect("mkdir staging");
        let file_a = staging.join("a.txt");
        let file_b = staging.join("b.txt");
        tokio::fs::write(&file_a, b"same content").await.expect("write a");
        tokio::fs::write(&file_b, b"same content").await.expect("write b");

        let first = store
            .ingest_files(&[file_a], "session-1", None, None, 1024 * 1024)
            .await
            .expect("ingest a");
        let second = store
            .ingest_files(&[file_b], "session-2", None, None, 1024 * 1024)
            .await
            .expect("ingest b");

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(first[0].error.is_none());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].sha256, second[0].sha256);
    }

    #[tokio::test]
    async fn oversized_files_get_an_error_descriptor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db_path = tmp.path().join("artifacts.db");
        let blob_dir = tmp.path().join("blobstore");
        let store = ArtifactStore::open(&db_path, &blob_dir).await.expect("open store");

        let staging = tmp.path().join("staging");
        tokio::fs::create_dir_all(&staging).await.expect("mkdir staging");
        let big_file = staging.join("big.bin");
        tokio::fs::write(&big_file, vec![0_u8; 100]).await.expect("write big file");

        let result = store
            .ingest_files(&[big_file.clone()], "session-1", None, None, 10)
            .await
            .expect("ingest should not error on oversized file");

        assert_eq!(result.len(), 1);
        let descriptor = &result[0];
        assert!(descriptor.id.is_none());
        assert!(descriptor.sha256.is_none());
        assert_eq!(descriptor.size, 100);
        assert_eq!(descriptor.error.as_deref(), Some("File too large (> 10 bytes)."));
        assert!(tokio::fs::metadata(&big_file).await.is_ok(), "oversized file should be left in place");
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db_path = tmp.path().join("artifacts.db");
        let blob_dir = tmp.path().join("blobstore");
        let store = ArtifactStore::open(&db_path, &blob_dir).await.expect("open store");

        let err = store.get_metadata("art_doesnotexist").await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }
}
