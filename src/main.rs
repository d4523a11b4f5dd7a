//! devicetoken - Per-device rotating token authentication service
//!
//! Serves the token endpoints over HTTP and offers a few account and device
//! administration commands against the same store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devicetoken_auth::{generate_secret, Account, AuthHeaders, Authenticator, UserStorage};
use devicetoken_core::{AccountId, AuthConfig, ClientId, SystemClock};
use devicetoken_server::{create_router, AppState, CookieSessions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the signing secret
const SECRET_ENV: &str = "DEVICETOKEN_SECRET";

/// devicetoken - Signed identities with per-device rotating tokens
#[derive(Parser, Debug)]
#[command(name = "devicetoken")]
#[command(version, about, long_about = None)]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Signing secret (overrides the config file and DEVICETOKEN_SECRET)
    #[arg(long, global = true)]
    secret: Option<String>,

    /// Account store file (default: <config dir>/devicetoken/accounts.json)
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Server port
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Create or update an account
    AddAccount {
        id: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Sign in a client and print its auth headers
    Issue {
        account: String,
        /// Client id (default: "default")
        #[arg(long)]
        client: Option<String>,
    },
    /// List an account's devices
    Devices { account: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = load_config(args.config.as_deref(), args.secret.clone())?;
    let storage = Arc::new(open_storage(args.data.clone()).await?);

    match args.command {
        Command::Serve { port } => serve(config, storage, port).await,
        Command::AddAccount { id, name } => {
            let mut account = Account::new(id);
            if let Some(name) = name {
                account = account.with_name(name);
            }
            let id = account.id.clone();
            storage.save_account(account).await?;
            println!("Saved account {}", id);
            Ok(())
        }
        Command::Issue { account, client } => {
            let config = require_secret(config)?;
            let names = config.headers.clone();
            let auth = Authenticator::new(Arc::new(config), storage, Arc::new(SystemClock))?;
            let issued = auth
                .tokens()
                .account(&AccountId::new(account))
                .issue(&ClientId::or_default(client.as_deref()))
                .await?;
            for (name, value) in AuthHeaders::from_issued(&issued).to_pairs(&names) {
                println!("{}: {}", name, value);
            }
            Ok(())
        }
        Command::Devices { account } => {
            let config = require_secret(config)?;
            let auth = Authenticator::new(Arc::new(config), storage, Arc::new(SystemClock))?;
            let devices = auth.tokens().account(&AccountId::new(account)).devices().await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
            Ok(())
        }
    }
}

async fn serve(config: AuthConfig, storage: Arc<UserStorage>, port: u16) -> Result<()> {
    info!("devicetoken v{}", env!("CARGO_PKG_VERSION"));

    let config = if config.secret.is_empty() {
        warn!(
            "No signing secret configured (set {} or --secret); tokens will not survive a restart",
            SECRET_ENV
        );
        config.with_secret(generate_secret())
    } else {
        config
    };

    let auth = Arc::new(Authenticator::new(Arc::new(config), storage, Arc::new(SystemClock))?);
    let state = Arc::new(AppState::new(auth, Arc::new(CookieSessions::new())));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Config file, then environment, then `--secret`
fn load_config(path: Option<&Path>, secret: Option<String>) -> Result<AuthConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            AuthConfig::from_json(&json)?
        }
        None => AuthConfig::new(),
    };

    if let Some(secret) = secret.or_else(|| std::env::var(SECRET_ENV).ok()) {
        config = config.with_secret(secret);
    }
    Ok(config)
}

fn require_secret(config: AuthConfig) -> Result<AuthConfig> {
    if config.secret.is_empty() {
        bail!("a signing secret is required (set {} or pass --secret)", SECRET_ENV);
    }
    Ok(config)
}

async fn open_storage(path: Option<PathBuf>) -> Result<UserStorage> {
    let storage = match path {
        Some(path) => UserStorage::with_path(path).await?,
        None => UserStorage::new().await?,
    };
    Ok(storage)
}
