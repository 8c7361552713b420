use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use sandboxd::artifacts::api::{create_router, ArtifactApiState};
use sandboxd::artifacts::{ArtifactStore, TokenService};
use sandboxd::config::Config;
use sandboxd::session::SessionManager;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(version)]
#[command(about = "Sandboxed code-execution service with signed-URL artifact capture")]
#[command(long_about = "\
sandboxd runs one long-lived Docker container per conversation, executes code
against an in-container REPL, and captures generated files as
content-addressed artifacts served over a signed-URL HTTP API.

The 'serve' subcommand boots the Artifact HTTP API and a background idle
sweeper. Session lifecycle (start/exec/stop) is driven by the embedding host
application through the library API, not over the network.")]
#[command(after_long_help = "\
QUICK START:
    sandboxd serve
    sandboxd config show

ENVIRONMENT VARIABLES:
    RUST_LOG                    Log level filter (default: sandboxd=info)
    SANDBOXD_LOG_FORMAT          Log format: 'text' (default) or 'json'
    SESSION_STORAGE              TMPFS (default) or BIND
    DATASET_ACCESS                NONE, LOCAL_RO, API (default), HYBRID
    DATASETS_HOST_RO              Host dataset directory (required for LOCAL_RO)
    HYBRID_LOCAL_PATH              Host dataset directory (required for HYBRID)
    ARTIFACTS_SECRET               HMAC secret for download tokens (else ephemeral)
    ARTIFACTS_SERVER_PORT           Pin the HTTP API to one port instead of probing a range

Use 'sandboxd <command> --help' for command-specific information.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration overrides from a key=value file before env vars.
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Artifact HTTP API and the idle-session sweeper
    #[command(after_help = "\
EXAMPLES:
    sandboxd serve
    ARTIFACTS_SERVER_PORT=9100 sandboxd serve")]
    Serve,

    /// Inspect resolved configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Sandbox container garbage collection
    #[command(subcommand)]
    Gc(GcCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration and derived paths
    #[command(after_help = "EXAMPLES:\n    sandboxd config show")]
    Show,
}

#[derive(Subcommand)]
enum GcCommands {
    /// Force-remove every sandbox container this host knows about
    ///
    /// A one-shot CLI invocation has no live idle registry to sweep against,
    /// so this removes all `sbox-`-prefixed containers unconditionally
    /// rather than only the ones idle past the timeout.
    #[command(after_help = "EXAMPLES:\n    sandboxd gc sweep-idle")]
    SweepIdle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let is_serve = matches!(cli.command, Commands::Serve);

    if is_serve {
        initialize_serve_logging();
    } else {
        initialize_cli_logging();
    }

    match cli.command {
        Commands::Serve => run_serve(cli.config_file.as_deref()).await?,
        Commands::Config(ConfigCommands::Show) => show_config(cli.config_file.as_deref())?,
        Commands::Gc(GcCommands::SweepIdle) => run_gc_sweep(cli.config_file.as_deref()).await?,
    }

    Ok(())
}

async fn run_serve(config_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let cfg = Config::load(config_file)?;
    tracing::info!(mode = cfg.mode_id(), "resolved configuration");

    let store = Arc::new(ArtifactStore::open(&cfg.artifacts_db_path, &cfg.blobstore_dir).await?);

    let (listener, port) = bind_first_available(&cfg.artifacts_server_port_candidates).await?;
    tracing::info!(port, "artifact API bound");

    let tokens = Arc::new(TokenService::new(
        cfg.artifacts_secret.clone(),
        cfg.artifacts_token_ttl_seconds,
        cfg.artifacts_public_base_url.clone(),
        port,
    ));

    let manager = Arc::new(SessionManager::new(cfg.clone(), store.clone(), Some(tokens.clone())));
    tokio::spawn(run_idle_sweeper(manager));

    let state = ArtifactApiState { store, tokens };
    let app = create_router().with_state(state).layer(TraceLayer::new_for_http());

    tracing::info!("========================================");
    tracing::info!("     sandboxd v{}     ", env!("CARGO_PKG_VERSION"));
    tracing::info!("========================================");
    tracing::info!("serving artifacts on http://127.0.0.1:{port}");

    axum::serve(listener, app).await?;
    Ok(())
}

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

async fn run_idle_sweeper(manager: Arc<SessionManager>) {
    loop {
        tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
        manager.sweep_idle().await;
    }
}

async fn bind_first_available(candidates: &[u16]) -> anyhow::Result<(TcpListener, u16)> {
    for &port in candidates {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => {
                tracing::warn!(port, error = %err, "port unavailable, trying next candidate");
            }
        }
    }
    anyhow::bail!("no candidate port available out of {candidates:?}");
}

fn show_config(config_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let cfg = Config::load(config_file)?;

    println!("sandboxd configuration\n");
    println!("VERSION:");
    println!("    {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("MODE:");
    println!("    {}", cfg.mode_id());
    println!();

    println!("SESSIONS:");
    println!("    session_storage      = {}", cfg.session_storage);
    println!("    sessions_root        = {}", cfg.sessions_root.display());
    println!();

    println!("DATASETS:");
    println!("    dataset_access       = {}", cfg.dataset_access);
    if let Some(path) = &cfg.datasets_host_ro {
        println!("    datasets_host_ro     = {}", path.display());
    }
    if let Some(path) = &cfg.hybrid_local_path {
        println!("    hybrid_local_path    = {}", path.display());
    }
    println!();

    println!("ARTIFACTS:");
    println!("    blobstore_dir        = {}", cfg.blobstore_dir.display());
    println!("    artifacts_db_path    = {}", cfg.artifacts_db_path.display());
    println!("    token_ttl_seconds    = {}", cfg.artifacts_token_ttl_seconds);
    println!("    max_artifact_size_mb = {}", cfg.max_artifact_size_mb);
    println!("    server_port_candidates = {:?}", cfg.artifacts_server_port_candidates);
    println!();

    println!("NETWORKING:");
    println!("    address_strategy     = {}", cfg.address_strategy);
    println!("    compose_network      = {:?}", cfg.compose_network);
    println!("    host_gateway         = {}", cfg.host_gateway);

    Ok(())
}

async fn run_gc_sweep(config_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let cfg = Config::load(config_file)?;
    let store = Arc::new(ArtifactStore::open(&cfg.artifacts_db_path, &cfg.blobstore_dir).await?);
    let manager = SessionManager::new(cfg, store, None);

    let removed = manager.cleanup_all_containers().await?;
    if removed.is_empty() {
        println!("No sandbox containers found");
    } else {
        println!("Removed {} sandbox container(s):", removed.len());
        for name in removed {
            println!("  - {name}");
        }
    }

    Ok(())
}

/// Simple console-only logging for `config`/`gc` commands.
fn initialize_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "sandboxd=warn".into()),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();
}

/// Full logging setup for `serve`: human-readable by default, JSON when
/// `SANDBOXD_LOG_FORMAT=json` is set.
fn initialize_serve_logging() {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "sandboxd=info".into());
    let json_format = std::env::var("SANDBOXD_LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    let filter = tracing_subscriber::EnvFilter::new(rust_log);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if json_format {
        tracing_subscriber::registry().with(layer.json().with_filter(filter)).init();
    } else {
        tracing_subscriber::registry().with(layer.with_filter(filter)).init();
    }
}
