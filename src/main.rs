use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use callgate_core::config::{self, Config, StoreBackend};
use callgate_core::service::handshake;
use callgate_core::service::http::{serve, AppState};
use callgate_core::store::{self, RecordStore};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "callgate",
    about = "Quota-gated AI gateway for chat clients",
    version = callgate_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Config file (defaults to ~/.callgate/config.json plus env)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bind address
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Validate configuration and report missing credentials
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a signed handshake payload for client debugging
    Sign {
        /// Client version name
        #[arg(long)]
        version: String,
        /// Seconds since epoch (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Register a principal in the configured store (stop a file-backed gateway first)
    Register {
        /// Principal id
        #[arg(long)]
        id: String,
        /// Client session to bind (sent as X-LC-Session)
        #[arg(long)]
        session: Option<String>,
        /// Extra role, repeatable (User is always granted)
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Merge a records document into the file store.
    ///
    /// Run it while the gateway is stopped: a serving file store rewrites
    /// the whole document from memory on every charge.
    Seed {
        /// Records JSON (principals, sessions, roles, permissions, versions)
        #[arg(long)]
        records: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Serve { verbose: true, .. });
    let directive = if verbose { "callgate=debug" } else { "callgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap()),
        )
        .init();

    match cli.command {
        Commands::Serve { config, host, port, .. } => cmd_serve(config.as_deref(), host, port).await?,
        Commands::CheckConfig { config } => cmd_check_config(config.as_deref())?,
        Commands::Sign { version, timestamp, config } => cmd_sign(&version, timestamp, config.as_deref())?,
        Commands::Register { id, session, roles, config } => {
            cmd_register(&id, session.as_deref(), &roles, config.as_deref()).await?
        }
        Commands::Seed { records, config } => cmd_seed(&records, config.as_deref()).await?,
    }

    Ok(())
}

// ====== Commands ======

/// Load an explicit config file (env still overrides it), or fall back to
/// the default file and environment.
fn load(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let mut cfg = config::load_config_strict(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config::apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
        None => Ok(config::load_config_from_env()),
    }
}

async fn cmd_serve(config_path: Option<&Path>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut cfg = load(config_path)?;
    if let Some(host) = host {
        cfg.gateway.host = host;
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }

    for warning in cfg.validate()? {
        warn!("{}", warning);
    }

    let records = store::open_store(&cfg.store).await?;
    let addr = format!("{}:{}", cfg.gateway.host, cfg.gateway.port);
    info!(
        "Starting callgate {} ({}) with {:?} store",
        callgate_core::VERSION,
        callgate_core::GIT_HASH,
        cfg.store.backend
    );

    let state = Arc::new(AppState::from_config(cfg, records)?);
    serve(&addr, state).await
}

fn cmd_check_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::get_config_path);
    println!(
        "Config: {} {}",
        path.display(),
        if path.exists() { "✓" } else { "✗ (using env/defaults)" }
    );

    let cfg = load(config_path)?;
    let warnings = cfg.validate()?;
    println!("Store: {:?}", cfg.store.backend);
    println!("Listen: {}:{}", cfg.gateway.host, cfg.gateway.port);
    println!("Session tokens: {:?}", cfg.gateway.session_tokens);

    if warnings.is_empty() {
        println!("All credentials set ✓");
    } else {
        for warning in &warnings {
            println!("  ⚠ {}", warning);
        }
    }
    Ok(())
}

fn cmd_sign(version: &str, timestamp: Option<i64>, config_path: Option<&Path>) -> Result<()> {
    let cfg = load(config_path)?;
    if cfg.handshake.root_key.is_empty() {
        bail!("CLIENT_ROOT_KEY is not set");
    }

    let timestamp = timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp())
        .to_string();
    let signature = handshake::sign(cfg.handshake.root_key.as_bytes(), version, &timestamp)?;

    let payload = serde_json::json!({
        "version": version,
        "timestamp": timestamp,
        "signature": signature,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn cmd_register(id: &str, session: Option<&str>, roles: &[String], config_path: Option<&Path>) -> Result<()> {
    let cfg = load(config_path)?;
    if cfg.store.backend == StoreBackend::Memory {
        bail!("the memory store only lives inside `serve`; set store.seed instead");
    }

    let records = store::open_store(&cfg.store).await?;
    let principal = store::register(records.as_ref(), id, session, roles).await?;
    let roles = records.roles_of(id).await?;
    println!("Registered {} (roles: {})", principal.id, roles.join(", "));
    Ok(())
}

async fn cmd_seed(records_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let cfg = load(config_path)?;
    if cfg.store.backend != StoreBackend::File {
        bail!("seed writes the file store; the memory store reads store.seed at startup");
    }

    let records = store::load_records(records_path)
        .await
        .with_context(|| format!("reading {}", records_path.display()))?;
    let file_store = store::FileStore::open(cfg.store.file_path()).await?;
    file_store.seed(records).await?;
    println!("Seeded {}", file_store.path().display());
    Ok(())
}
