//! Typed error enums for each subsystem, in the style of the session
//! manager's own error types: rich `#[error(...)]` messages, `#[source]` on
//! wrapped causes, and one enum per component rather than a single
//! catch-all.

use std::path::PathBuf;

/// Errors raised while resolving configuration (C1).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `DATASET_ACCESS=LOCAL_RO` was selected without `DATASETS_HOST_RO`.
    #[error("datasets_host_ro is required when dataset_access=LOCAL_RO")]
    MissingDatasetsHostRo,

    /// `DATASET_ACCESS=HYBRID` was selected without `HYBRID_LOCAL_PATH`.
    #[error("hybrid_local_path is required when dataset_access=HYBRID")]
    MissingHybridLocalPath,

    /// An environment variable held a value outside its enumerated set.
    #[error("{variable} must be one of: {allowed} (got {actual:?})")]
    InvalidEnum {
        /// Name of the offending environment variable.
        variable: &'static str,
        /// The legal values, comma-joined, for the error message.
        allowed: String,
        /// The value that was actually supplied.
        actual: String,
    },

    /// An integer-valued environment variable could not be parsed.
    #[error("{variable} must be an integer (got {actual:?})")]
    InvalidInteger {
        /// Name of the offending environment variable.
        variable: &'static str,
        /// The value that was actually supplied.
        actual: String,
    },

    /// Failed to read the caller-supplied key=value config file.
    #[error("failed to read config file {path}")]
    FileRead {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the Session Manager (C8).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `exec`/`stop` was called on a session key never `start`-ed (or already evicted).
    #[error("unknown or expired session_key: {0}")]
    UnknownSession(String),

    /// The in-container REPL never answered `/health` within the poll budget.
    #[error("container for session {0} did not become healthy in time")]
    HealthTimeout(String),

    /// The container runtime refused to create the sandbox container.
    #[error("failed to create container for session {session}")]
    ContainerCreateFailed {
        /// Session key the container was being created for.
        session: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// The REPL's advertised address could not be reached.
    #[error("network unreachable for session {0}")]
    NetworkUnreachable(String),

    /// A container-runtime command exited non-zero or could not be spawned.
    #[error(transparent)]
    ContainerIo(#[from] ContainerIoError),

    /// Ingesting captured artifacts after an `exec` call failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Errors raised by Container I/O (C2).
#[derive(Debug, thiserror::Error)]
pub enum ContainerIoError {
    /// `put_bytes` was asked to write to a path ending in `/`.
    #[error("container_path must be a file path, not a directory: {0}")]
    PathIsDirectory(String),

    /// Could not create the destination's parent directory in the container.
    #[error("failed to create directory {dir:?} in container (exit code {exit_code:?})")]
    MkdirFailed {
        /// Directory that failed to create.
        dir: String,
        /// Process exit code, if the command ran at all.
        exit_code: Option<i32>,
    },

    /// Neither the tar put-archive path nor the base64 fallback succeeded.
    #[error("failed to write {path} into container via put-archive or fallback")]
    PutArchiveFailed {
        /// In-container destination path.
        path: String,
    },

    /// All `copy_out` strategies were exhausted.
    #[error("failed to copy {path} out of container after retries")]
    CopyOutFailed {
        /// In-container source path.
        path: String,
    },

    /// The requested file does not exist inside the container.
    #[error("file not found in container: {0}")]
    FileNotFoundInContainer(String),

    /// The `docker` CLI itself could not be spawned or returned an I/O error.
    #[error("failed to invoke container runtime")]
    RuntimeIo(#[from] std::io::Error),
}

/// Errors raised by Dataset Staging (C7).
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// The caller-supplied fetch function failed.
    #[error("failed to fetch dataset {id}")]
    FetchFailed {
        /// Dataset id that failed to fetch.
        id: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Staging bytes into the container or host path failed.
    #[error("failed to stage dataset {id}")]
    StageFailed {
        /// Dataset id that failed to stage.
        id: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by the Artifact Store (C3).
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// A catalog row exists but its blob file is missing on disk.
    #[error("blob missing for artifact {artifact_id} (sha256={sha256})")]
    BlobMissing {
        /// Artifact id whose blob is missing.
        artifact_id: String,
        /// Content hash that should have resolved to a blob path.
        sha256: String,
    },

    /// No catalog row exists for the requested artifact id.
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The metadata database returned an error.
    #[error("artifact database error")]
    Db(#[from] sqlx::Error),

    /// A filesystem operation on the blob store failed.
    #[error("blob store I/O error")]
    Io(#[from] std::io::Error),

    /// A file exceeded the per-ingest size cap. Reported in the ingest
    /// descriptor's `error` field rather than raised as a `Result::Err`.
    #[error("File too large (> {max_bytes} bytes).")]
    TooLarge {
        /// Size of the offending file, in bytes.
        size: u64,
        /// The configured cap it exceeded.
        max_bytes: u64,
    },
}

/// Errors raised by the Token Service (C4).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum TokenError {
    /// The token was not two dot-separated base64url segments, or the
    /// decoded message was not `id.expiry`.
    #[error("invalid token format")]
    InvalidFormat,

    /// The HMAC recomputed over the message did not match the supplied tag.
    #[error("invalid token signature")]
    InvalidSignature,

    /// `now >= expiry`.
    #[error("token has expired")]
    Expired,

    /// The token's embedded artifact id does not match the one requested.
    #[error("token does not match requested artifact")]
    MismatchedArtifact,
}
