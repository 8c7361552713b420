use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ContainerIoError;

/// A bind or tmpfs mount to attach when creating a sandbox container.
#[derive(Debug, Clone)]
pub enum Mount {
    /// Host directory bind-mounted at `container_path`.
    Bind {
        /// Absolute host path.
        host_path: PathBuf,
        /// Absolute path inside the container.
        container_path: String,
        /// Mount read-only.
        read_only: bool,
    },
    /// In-memory tmpfs mount, sized in MiB.
    Tmpfs {
        /// Absolute path inside the container.
        container_path: String,
        /// Soft size cap, in MiB.
        size_mb: u64,
    },
}

/// How the host reaches the container's REPL port once created.
#[derive(Debug, Clone)]
pub enum NetworkMode {
    /// Attach to a named bridge network; reached by container DNS name.
    Network(String),
    /// Publish the container's REPL port to an ephemeral host port.
    PublishPort,
}

/// Parameters for creating a sandbox container.
#[derive(Debug, Clone)]
pub struct CreateContainerOpts {
    /// Name to assign the container (also its DNS name on a custom network).
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Mounts to attach.
    pub mounts: Vec<Mount>,
    /// Networking mode.
    pub network: NetworkMode,
    /// In-container TCP port the REPL listens on, e.g. `"9000/tcp"`.
    pub repl_port: String,
}

/// Thin subprocess wrapper around the `docker` CLI.
///
/// Every operation shells out rather than linking a Docker client library,
/// matching how this crate talks to any other external CLI tool: build an
/// argument vector (exposed separately for unit testing), run it, and turn a
/// non-zero exit status into a typed error.
#[derive(Debug, Clone, Default)]
pub struct DockerIo;

/// Result of a `docker exec` invocation.
pub struct ExecOutput {
    /// Process exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl DockerIo {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Build the `docker create` argument vector (exposed for testing).
    #[must_use]
    pub fn build_create_args(opts: &CreateContainerOpts) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            opts.name.clone(),
        ];

        match &opts.network {
            NetworkMode::Network(net) => {
                args.extend(["--network".to_string(), net.clone()]);
            }
            NetworkMode::PublishPort => {
                let container_port = opts.repl_port.trim_end_matches("/tcp");
                args.extend(["-p".to_string(), format!("0:{container_port}")]);
            }
        }

        for mount in &opts.mounts {
            match mount {
                Mount::Bind { host_path, container_path, read_only } => {
                    let ro = if *read_only { ":ro" } else { "" };
                    args.extend([
                        "-v".to_string(),
                        format!("{}:{}{}", host_path.display(), container_path, ro),
                    ]);
                }
                Mount::Tmpfs { container_path, size_mb } => {
                    args.extend([
                        "--tmpfs".to_string(),
                        format!("{}:size={}m", container_path, size_mb),
                    ]);
                }
            }
        }

        args.push(opts.image.clone());
        args
    }

    /// Create (but do not start) a sandbox container.
    ///
    /// # Errors
    ///
    /// Returns an error if the `docker` CLI cannot be spawned or exits non-zero.
    pub async fn create_container(&self, opts: &CreateContainerOpts) -> anyhow::Result<String> {
        let args = Self::build_create_args(opts);
        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Start a previously created container.
    ///
    /// # Errors
    ///
    /// Returns an error if `docker start` exits non-zero.
    pub async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        let output = Command::new("docker").args(["start", id]).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker start failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Report whether a container is currently running.
    ///
    /// # Errors
    ///
    /// Returns an error if `docker ps` cannot be spawned.
    pub async fn is_running(&self, name_or_id: &str) -> anyhow::Result<bool> {
        let output = Command::new("docker")
            .args(["ps", "--format", "{{.Names}}"])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line == name_or_id))
    }

    /// Read the ephemeral host port published for `repl_port` (`"9000/tcp"`).
    ///
    /// # Errors
    ///
    /// Returns an error if `docker port` fails or the output cannot be parsed.
    pub async fn published_port(&self, id: &str, repl_port: &str) -> anyhow::Result<u16> {
        let output = Command::new("docker")
            .args(["port", id, repl_port])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker port failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow::anyhow!("docker port returned no mapping for {repl_port}"))?;
        let port_str = line
            .rsplit(':')
            .next()
            .ok_or_else(|| anyhow::anyhow!("unexpected docker port output: {line}"))?;
        Ok(port_str.trim().parse()?)
    }

    /// Force-stop and remove a container, best-effort.
    pub async fn force_remove(&self, id: &str) {
        let _ = Command::new("docker").args(["stop", "-t", "1", id]).output().await;
        if let Err(err) = Command::new("docker").args(["rm", "-f", id]).output().await {
            tracing::warn!(container = id, error = %err, "failed to remove container");
        }
    }

    /// List running (or all, if `running_only` is false) container names
    /// starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if `docker ps` cannot be spawned.
    pub async fn list_with_prefix(
        &self,
        prefix: &str,
        running_only: bool,
    ) -> anyhow::Result<Vec<String>> {
        let mut args = vec!["ps".to_string(), "--format".to_string(), "{{.Names}}".to_string()];
        if !running_only {
            args.insert(1, "-a".to_string());
        }
        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|name| name.starts_with(prefix))
            .map(str::to_owned)
            .collect())
    }

    /// Run a command inside the container and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the `docker` CLI cannot be spawned.
    pub async fn exec(&self, id: &str, args: &[&str]) -> std::io::Result<ExecOutput> {
        let mut cmd_args = vec!["exec".to_string(), id.to_string()];
        cmd_args.extend(args.iter().map(|s| (*s).to_string()));
        let output = Command::new("docker").args(&cmd_args).output().await?;
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Check whether a file exists inside the container.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerIoError::RuntimeIo`] if `docker` cannot be spawned.
    pub async fn file_exists(&self, id: &str, container_path: &str) -> Result<bool, ContainerIoError> {
        let quoted = shell_quote(container_path);
        let out = self
            .exec(id, &["/bin/sh", "-lc", &format!("test -f {quoted}")])
            .await?;
        Ok(out.success())
    }

    /// Write `data` to `container_path`, overwriting any existing file.
    ///
    /// Tries a tar-archive write via `docker exec ... tar -x` first (one
    /// round trip, preserves mode/mtime); falls back to a base64-chunked
    /// `exec` write if the tar path fails for any reason (e.g. `tar` missing
    /// from a minimal image).
    ///
    /// # Errors
    ///
    /// Returns [`ContainerIoError`] if both strategies fail, or if
    /// `container_path` names a directory.
    pub async fn put_bytes(
        &self,
        id: &str,
        container_path: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), ContainerIoError> {
        if container_path.is_empty() || container_path.ends_with('/') {
            return Err(ContainerIoError::PathIsDirectory(container_path.to_owned()));
        }

        let path = Path::new(container_path);
        let parent = path.parent().map_or_else(|| "/".to_string(), |p| p.display().to_string());
        let file_name = path
            .file_name()
            .map_or_else(|| container_path.to_owned(), |n| n.to_string_lossy().into_owned());

        let mkdir = self
            .exec(id, &["mkdir", "-p", &parent])
            .await?;
        if !mkdir.success() {
            return Err(ContainerIoError::MkdirFailed {
                dir: parent,
                exit_code: mkdir.exit_code,
            });
        }

        if self.put_bytes_via_tar(id, &parent, &file_name, data, mode).await.is_ok() {
            if self.file_exists(id, container_path).await.unwrap_or(false) {
                return Ok(());
            }
        }

        self.put_bytes_via_base64(id, container_path, data).await?;
        if self.file_exists(id, container_path).await? {
            Ok(())
        } else {
            Err(ContainerIoError::PutArchiveFailed { path: container_path.to_owned() })
        }
    }

    async fn put_bytes_via_tar(
        &self,
        id: &str,
        parent_dir: &str,
        file_name: &str,
        data: &[u8],
        mode: u32,
    ) -> anyhow::Result<()> {
        let tar_bytes = build_single_file_tar(file_name, data, mode)?;

        let mut child = Command::new("docker")
            .args(["exec", "-i", id, "tar", "-x", "-C", parent_dir])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin handle"))?;
        stdin.write_all(&tar_bytes).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "tar extraction failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn put_bytes_via_base64(
        &self,
        id: &str,
        container_path: &str,
        data: &[u8],
    ) -> Result<(), ContainerIoError> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);

        let truncate = self
            .exec(id, &["bash", "-c", &format!("echo -n > {}", shell_quote(container_path))])
            .await?;
        if !truncate.success() {
            return Err(ContainerIoError::PutArchiveFailed { path: container_path.to_owned() });
        }

        const CHUNK_SIZE: usize = 10_000;
        for chunk in encoded.as_bytes().chunks(CHUNK_SIZE) {
            // `chunk` is ASCII base64, safe to treat as UTF-8.
            let chunk_str = std::str::from_utf8(chunk).unwrap_or_default();
            let script = format!(
                "echo -n '{}' | base64 -d >> {}",
                chunk_str,
                shell_quote(container_path)
            );
            let out = self.exec(id, &["bash", "-c", &script]).await?;
            if !out.success() {
                return Err(ContainerIoError::PutArchiveFailed { path: container_path.to_owned() });
            }
        }
        Ok(())
    }

    /// Copy a file out of the container to `host_dest`, retrying across three
    /// strategies before giving up: `docker cp` of the file directly,
    /// `docker cp` of its parent directory followed by a local extract, and
    /// an in-container `tar` piped to stdout. Each attempt is separated by a
    /// short backoff to tolerate the file still being flushed to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerIoError::CopyOutFailed`] if every strategy fails
    /// across all retries, or [`ContainerIoError::FileNotFoundInContainer`]
    /// if the source file never existed.
    pub async fn copy_out(
        &self,
        id: &str,
        container_path: &str,
        host_dest: &Path,
    ) -> Result<(), ContainerIoError> {
        if !self.file_exists(id, container_path).await? {
            return Err(ContainerIoError::FileNotFoundInContainer(container_path.to_owned()));
        }

        const ATTEMPTS: u32 = 5;
        const BACKOFF: Duration = Duration::from_millis(50);

        for attempt in 0..ATTEMPTS {
            if self.try_cp_file(id, container_path, host_dest).await.is_ok() {
                return Ok(());
            }
            if self.try_cp_parent_and_extract(id, container_path, host_dest).await.is_ok() {
                return Ok(());
            }
            if self.try_exec_tar_stdout(id, container_path, host_dest).await.is_ok() {
                return Ok(());
            }
            if attempt + 1 < ATTEMPTS {
                tokio::time::sleep(BACKOFF).await;
            }
        }

        Err(ContainerIoError::CopyOutFailed { path: container_path.to_owned() })
    }

    async fn try_cp_file(&self, id: &str, container_path: &str, host_dest: &Path) -> anyhow::Result<()> {
        if let Some(parent) = host_dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = Command::new("docker")
            .args(["cp", &format!("{id}:{container_path}"), &host_dest.display().to_string()])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("docker cp failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    async fn try_cp_parent_and_extract(
        &self,
        id: &str,
        container_path: &str,
        host_dest: &Path,
    ) -> anyhow::Result<()> {
        let path = Path::new(container_path);
        let parent = path.parent().ok_or_else(|| anyhow::anyhow!("no parent"))?;
        let file_name = path.file_name().ok_or_else(|| anyhow::anyhow!("no file name"))?;

        let tmp = tempfile::tempdir()?;
        let output = Command::new("docker")
            .args(["cp", &format!("{id}:{}", parent.display()), &tmp.path().display().to_string()])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("docker cp parent failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let src = tmp
            .path()
            .join(parent.file_name().unwrap_or_default())
            .join(file_name);
        if let Some(dest_parent) = host_dest.parent() {
            tokio::fs::create_dir_all(dest_parent).await?;
        }
        tokio::fs::copy(&src, host_dest).await?;
        Ok(())
    }

    async fn try_exec_tar_stdout(
        &self,
        id: &str,
        container_path: &str,
        host_dest: &Path,
    ) -> anyhow::Result<()> {
        let path = Path::new(container_path);
        let parent = path.parent().ok_or_else(|| anyhow::anyhow!("no parent"))?.display().to_string();
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("no file name"))?
            .to_string_lossy()
            .into_owned();

        let output = Command::new("docker")
            .args(["exec", id, "tar", "-cf", "-", "-C", &parent, &file_name])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("in-container tar failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let mut archive = tar::Archive::new(std::io::Cursor::new(output.stdout));
        let tmp = tempfile::tempdir()?;
        archive.unpack(tmp.path())?;

        if let Some(dest_parent) = host_dest.parent() {
            tokio::fs::create_dir_all(dest_parent).await?;
        }
        tokio::fs::copy(tmp.path().join(&file_name), host_dest).await?;
        Ok(())
    }
}

fn build_single_file_tar(name: &str, data: &[u8], mode: u32) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    let mtime = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(builder.into_inner()?)
}

/// Minimal POSIX shell single-quote escaping, mirroring `shlex.quote`.
fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "_-./".contains(c)) {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_use_tmpfs_mount() {
        let opts = CreateContainerOpts {
            name: "sbox-test".to_string(),
            image: "sandbox:latest".to_string(),
            mounts: vec![Mount::Tmpfs { container_path: "/session".to_string(), size_mb: 512 }],
            network: NetworkMode::Network("sandboxd-network".to_string()),
            repl_port: "9000/tcp".to_string(),
        };
        let args = DockerIo::build_create_args(&opts);
        assert!(args.iter().any(|a| a == "--tmpfs"));
        assert!(args.iter().any(|a| a == "/session:size=512m"));
        assert!(args.iter().any(|a| a == "--network"));
    }

    #[test]
    fn create_args_publish_port_when_host_mode() {
        let opts = CreateContainerOpts {
            name: "sbox-test".to_string(),
            image: "sandbox:latest".to_string(),
            mounts: vec![],
            network: NetworkMode::PublishPort,
            repl_port: "9000/tcp".to_string(),
        };
        let args = DockerIo::build_create_args(&opts);
        assert!(args.iter().any(|a| a == "0:9000"));
    }

    #[test]
    fn bind_mount_adds_ro_suffix() {
        let opts = CreateContainerOpts {
            name: "sbox-test".to_string(),
            image: "sandbox:latest".to_string(),
            mounts: vec![Mount::Bind {
                host_path: PathBuf::from("/host/data"),
                container_path: "/data".to_string(),
                read_only: true,
            }],
            network: NetworkMode::PublishPort,
            repl_port: "9000/tcp".to_string(),
        };
        let args = DockerIo::build_create_args(&opts);
        assert!(args.iter().any(|a| a == "/host/data:/data:ro"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/plain"), "/tmp/plain");
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn single_file_tar_round_trips() {
        let data = b"hello world";
        let bytes = build_single_file_tar("out.txt", data, 0o644).expect("build tar");
        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        let mut entries = archive.entries().expect("entries");
        let mut entry = entries.next().expect("one entry").expect("entry ok");
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "out.txt");
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).expect("read");
        assert_eq!(contents, data);
    }
}
