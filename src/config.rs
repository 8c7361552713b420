//! Configuration (C1): resolves a frozen [`Config`] from environment
//! variables, an optional key=value file, and built-in defaults, in that
//! ascending order of precedence, matching the merge pattern used for the
//! teacher's `FeatureFlags`/`ServerConfig` (`src/feature_flags.rs`) but
//! fixed to the key=value file format used by the original's
//! `Config.from_env` (not TOML — the original's env-file loader is a flat
//! `KEY=value` list with `#` comments).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Where `/session` lives inside the sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionStorage {
    /// `/session` is a memory-backed tmpfs mount, destroyed with the container.
    Tmpfs,
    /// `/session` is bind-mounted to `<sessions_root>/<session_id>` on the host.
    Bind,
}

impl SessionStorage {
    const VALUES: [&'static str; 2] = ["TMPFS", "BIND"];

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "TMPFS" => Some(Self::Tmpfs),
            "BIND" => Some(Self::Bind),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tmpfs => "TMPFS",
            Self::Bind => "BIND",
        })
    }
}

/// How datasets are made available inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DatasetAccess {
    /// No dataset directory is mounted or staged.
    None,
    /// A host directory is mounted read-only at `/data`.
    LocalRo,
    /// Datasets are fetched on demand into the in-container dataset directory.
    Api,
    /// A read-only local mount with API fetch as fallback for missing ids.
    Hybrid,
}

impl DatasetAccess {
    const VALUES: [&'static str; 4] = ["NONE", "LOCAL_RO", "API", "HYBRID"];

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "LOCAL_RO" => Some(Self::LocalRo),
            "API" => Some(Self::Api),
            "HYBRID" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "NONE",
            Self::LocalRo => "LOCAL_RO",
            Self::Api => "API",
            Self::Hybrid => "HYBRID",
        })
    }
}

/// How the host reaches the in-container REPL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AddressStrategy {
    /// Attach to a named Docker network and resolve the container by DNS name.
    Container,
    /// Map the container's REPL port to an ephemeral host port.
    Host,
}

impl AddressStrategy {
    const VALUES: [&'static str; 2] = ["container", "host"];

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "container" => Some(Self::Container),
            "host" => Some(Self::Host),
            _ => None,
        }
    }
}

impl fmt::Display for AddressStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::Host => "host",
        })
    }
}

/// Frozen, validated configuration for the whole service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where `/session` lives.
    pub session_storage: SessionStorage,
    /// How datasets are exposed.
    pub dataset_access: DatasetAccess,
    /// Host-side base directory for per-session folders (BIND mode, logs, cache).
    pub sessions_root: PathBuf,
    /// Host dataset directory mounted read-only (`LOCAL_RO` only).
    pub datasets_host_ro: Option<PathBuf>,
    /// Host dataset directory mounted read-only with API fallback (`HYBRID` only).
    pub hybrid_local_path: Option<PathBuf>,
    /// Root of the content-addressed blob store.
    pub blobstore_dir: PathBuf,
    /// Path to the artifact metadata database file.
    pub artifacts_db_path: PathBuf,
    /// Filename (not path) of the per-session dataset cache file.
    pub cache_filename: String,
    /// Docker image used for sandbox containers.
    pub sandbox_image: String,
    /// Soft cap, in MiB, for the `/session` tmpfs mount.
    pub tmpfs_size_mb: u64,
    /// How the host addresses sandbox containers.
    pub address_strategy: AddressStrategy,
    /// Docker network name used by [`AddressStrategy::Container`].
    pub compose_network: Option<String>,
    /// Host gateway hostname used by [`AddressStrategy::Host`].
    pub host_gateway: String,
    /// Secret used to sign artifact download tokens.
    pub artifacts_secret: Secret,
    /// Token time-to-live, in seconds.
    pub artifacts_token_ttl_seconds: u64,
    /// Public base URL used to build download links; `None` derives it from
    /// the bound server port at runtime.
    pub artifacts_public_base_url: Option<String>,
    /// Ordered candidate ports the Artifact HTTP API tries to bind.
    pub artifacts_server_port_candidates: Vec<u16>,
    /// Per-file ingest size cap, in MiB.
    pub max_artifact_size_mb: u64,
}

/// The HMAC secret backing the token service, either pinned by configuration
/// or generated once per process when no explicit secret is configured.
#[derive(Clone)]
pub enum Secret {
    /// Operator-supplied secret (`ARTIFACTS_SECRET`); tokens survive restarts.
    Fixed(Vec<u8>),
    /// Process-lifetime random secret; tokens do not survive restarts.
    Ephemeral(std::sync::Arc<Vec<u8>>),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(_) => write!(f, "Secret::Fixed(<redacted>)"),
            Self::Ephemeral(_) => write!(f, "Secret::Ephemeral(<redacted>)"),
        }
    }
}

impl Secret {
    /// Borrow the raw secret bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Fixed(b) => b,
            Self::Ephemeral(b) => b,
        }
    }

    fn ephemeral() -> Self {
        use rand::RngCore;
        let mut buf = vec![0_u8; 32];
        rand::rng().fill_bytes(&mut buf);
        Self::Ephemeral(std::sync::Arc::new(buf))
    }
}

const DEFAULT_SESSIONS_ROOT: &str = "./sessions";
const DEFAULT_BLOBSTORE_DIR: &str = "./blobstore";
const DEFAULT_ARTIFACTS_DB: &str = "./artifacts.db";
const DEFAULT_CACHE_FILENAME: &str = "cache_datasets.json";
const DEFAULT_SANDBOX_IMAGE: &str = "sandbox:latest";
const DEFAULT_TMPFS_SIZE_MB: u64 = 1024;
const DEFAULT_COMPOSE_NETWORK: &str = "sandboxd-network";
const DEFAULT_HOST_GATEWAY: &str = "host.docker.internal";
const DEFAULT_TOKEN_TTL_SECONDS: u64 = 600;
const DEFAULT_MAX_ARTIFACT_SIZE_MB: u64 = 50;
const DEFAULT_PORT_CANDIDATES: [u16; 5] = [8000, 8001, 8002, 8003, 8004];

impl Config {
    /// `BIND_NONE` / `TMPFS_API` / etc, per the README mode table.
    #[must_use]
    pub fn mode_id(&self) -> &'static str {
        match (self.session_storage, self.dataset_access) {
            (SessionStorage::Bind, DatasetAccess::None) => "BIND_NONE",
            (SessionStorage::Tmpfs, DatasetAccess::None) => "TMPFS_NONE",
            (SessionStorage::Bind, DatasetAccess::LocalRo) => "BIND_LOCAL",
            (SessionStorage::Tmpfs, DatasetAccess::LocalRo) => "TMPFS_LOCAL",
            (SessionStorage::Tmpfs, DatasetAccess::Hybrid) => "TMPFS_HYBRID",
            (SessionStorage::Bind, DatasetAccess::Hybrid) => "BIND_HYBRID",
            (SessionStorage::Tmpfs, DatasetAccess::Api) => "TMPFS_API",
            (SessionStorage::Bind, DatasetAccess::Api) => "BIND_API",
        }
    }

    /// Host-side folder for a session (BIND mode, logs, dataset cache file).
    #[must_use]
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_root.join(session_id)
    }

    /// Load configuration, optionally reading a key=value file first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an enum-valued or integer-valued variable
    /// holds an illegal value, if the file cannot be read, or if a
    /// mode-dependent required path is missing.
    pub fn load(env_file_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file_vars = match env_file_path {
            Some(path) => load_env_file(path)?,
            None => HashMap::new(),
        };

        let session_storage = get_env_enum(
            "SESSION_STORAGE",
            &SessionStorage::VALUES,
            SessionStorage::parse,
            SessionStorage::Tmpfs,
            &file_vars,
        )?;
        let dataset_access = get_env_enum(
            "DATASET_ACCESS",
            &DatasetAccess::VALUES,
            DatasetAccess::parse,
            DatasetAccess::Api,
            &file_vars,
        )?;
        let address_strategy = get_env_enum(
            "SANDBOX_ADDRESS_STRATEGY",
            &AddressStrategy::VALUES,
            AddressStrategy::parse,
            AddressStrategy::Container,
            &file_vars,
        )?;

        let sessions_root = PathBuf::from(get_env_string(
            "SESSIONS_ROOT",
            DEFAULT_SESSIONS_ROOT,
            &file_vars,
        ));
        let mut datasets_host_ro = get_env_opt_string("DATASETS_HOST_RO", &file_vars).map(PathBuf::from);
        let hybrid_local_path =
            get_env_opt_string("HYBRID_LOCAL_PATH", &file_vars).map(PathBuf::from);

        match dataset_access {
            DatasetAccess::LocalRo if datasets_host_ro.is_none() => {
                return Err(ConfigError::MissingDatasetsHostRo);
            }
            DatasetAccess::Hybrid if hybrid_local_path.is_none() => {
                return Err(ConfigError::MissingHybridLocalPath);
            }
            DatasetAccess::None => datasets_host_ro = None,
            _ => {}
        }

        let blobstore_dir =
            PathBuf::from(get_env_string("BLOBSTORE_DIR", DEFAULT_BLOBSTORE_DIR, &file_vars));
        let artifacts_db_path =
            PathBuf::from(get_env_string("ARTIFACTS_DB", DEFAULT_ARTIFACTS_DB, &file_vars));
        let cache_filename = get_env_string("CACHE_FILENAME", DEFAULT_CACHE_FILENAME, &file_vars);
        let sandbox_image = get_env_string("SANDBOX_IMAGE", DEFAULT_SANDBOX_IMAGE, &file_vars);
        let tmpfs_size_mb = get_env_int("TMPFS_SIZE_MB", DEFAULT_TMPFS_SIZE_MB, &file_vars)?;
        let compose_network = get_env_opt_string("COMPOSE_NETWORK", &file_vars)
            .or_else(|| Some(DEFAULT_COMPOSE_NETWORK.to_owned()));
        let host_gateway = get_env_string("HOST_GATEWAY", DEFAULT_HOST_GATEWAY, &file_vars);

        let artifacts_secret = match get_env_opt_string("ARTIFACTS_SECRET", &file_vars) {
            Some(s) => Secret::Fixed(s.into_bytes()),
            None => Secret::ephemeral(),
        };
        let artifacts_token_ttl_seconds = get_env_int(
            "ARTIFACTS_TOKEN_TTL_SECONDS",
            DEFAULT_TOKEN_TTL_SECONDS,
            &file_vars,
        )?;
        let artifacts_public_base_url = get_env_opt_string("ARTIFACTS_PUBLIC_BASE_URL", &file_vars);
        let artifacts_server_port_candidates =
            match get_env_opt_string("ARTIFACTS_SERVER_PORT", &file_vars) {
                Some(raw) => {
                    let port: u16 = raw.trim().parse().map_err(|_| ConfigError::InvalidInteger {
                        variable: "ARTIFACTS_SERVER_PORT",
                        actual: raw,
                    })?;
                    vec![port]
                }
                None => DEFAULT_PORT_CANDIDATES.to_vec(),
            };
        let max_artifact_size_mb = get_env_int(
            "MAX_ARTIFACT_SIZE_MB",
            DEFAULT_MAX_ARTIFACT_SIZE_MB,
            &file_vars,
        )?;

        Ok(Self {
            session_storage,
            dataset_access,
            sessions_root,
            datasets_host_ro,
            hybrid_local_path,
            blobstore_dir,
            artifacts_db_path,
            cache_filename,
            sandbox_image,
            tmpfs_size_mb,
            address_strategy,
            compose_network,
            host_gateway,
            artifacts_secret,
            artifacts_token_ttl_seconds,
            artifacts_public_base_url,
            artifacts_server_port_candidates,
            max_artifact_size_mb,
        })
    }
}

/// Strip `#` comments (including inline) and surrounding whitespace, parse
/// `KEY=VALUE` lines. Mirrors the original's `Config._load_env_file`.
fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_owned(),
        source,
    })?;

    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.split('#').next().unwrap_or("").trim();
        vars.insert(key.trim().to_owned(), value.to_owned());
    }
    Ok(vars)
}

fn lookup(name: &str, file_vars: &HashMap<String, String>) -> Option<String> {
    file_vars
        .get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
}

fn get_env_string(name: &str, default: &str, file_vars: &HashMap<String, String>) -> String {
    lookup(name, file_vars).unwrap_or_else(|| default.to_owned())
}

fn get_env_opt_string(name: &str, file_vars: &HashMap<String, String>) -> Option<String> {
    lookup(name, file_vars).filter(|v| !v.trim().is_empty())
}

fn get_env_int(
    name: &'static str,
    default: u64,
    file_vars: &HashMap<String, String>,
) -> Result<u64, ConfigError> {
    match get_env_opt_string(name, file_vars) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger { variable: name, actual: raw }),
    }
}

fn get_env_enum<T>(
    name: &'static str,
    allowed: &[&str],
    parse: impl Fn(&str) -> Option<T>,
    default: T,
    file_vars: &HashMap<String, String>,
) -> Result<T, ConfigError> {
    match get_env_opt_string(name, file_vars) {
        None => Ok(default),
        Some(raw) => parse(&raw).ok_or_else(|| ConfigError::InvalidEnum {
            variable: name,
            allowed: allowed.join(", "),
            actual: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests rely only on the key=value file path, never on mutating
    // the process environment (which this crate's lint profile forbids and
    // which would race across parallel test threads regardless).

    #[test]
    fn defaults_are_tmpfs_api() {
        let cfg = Config::load(None).expect("defaults must validate");
        assert_eq!(cfg.mode_id(), "TMPFS_API");
        assert!(cfg.datasets_host_ro.is_none());
    }

    #[test]
    fn local_ro_without_path_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("sandbox.env");
        std::fs::write(&file, "DATASET_ACCESS=LOCAL_RO\n").expect("write env file");

        let err = Config::load(Some(&file)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatasetsHostRo));
    }

    #[test]
    fn unknown_enum_value_lists_legal_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("sandbox.env");
        std::fs::write(&file, "SESSION_STORAGE=NOPE\n").expect("write env file");

        let err = Config::load(Some(&file)).unwrap_err();
        match err {
            ConfigError::InvalidEnum { variable, allowed, .. } => {
                assert_eq!(variable, "SESSION_STORAGE");
                assert_eq!(allowed, "TMPFS, BIND");
            }
            other => panic!("expected InvalidEnum, got {other:?}"),
        }
    }

    #[test]
    fn env_file_values_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("sandbox.env");
        std::fs::write(
            &file,
            "SANDBOX_IMAGE=custom:latest # comment\n# full comment\nTMPFS_SIZE_MB=2048\n",
        )
        .expect("write env file");

        let cfg = Config::load(Some(&file)).expect("config should load");
        assert_eq!(cfg.sandbox_image, "custom:latest");
        assert_eq!(cfg.tmpfs_size_mb, 2048);
    }
}
