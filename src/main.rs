use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use odoo_manager::api::{AppState, SharedState};
use odoo_manager::audit::AuditLog;
use odoo_manager::config::Config;
use odoo_manager::docker::DockerManager;
use odoo_manager::events::EventHub;
use odoo_manager::gitops::{self, GitOps};
use odoo_manager::store::{ProjectStore, StoreHandle};
use odoo_manager::{lifecycle, server};

#[derive(Parser)]
#[command(name = "odoo-manager")]
#[command(version, about = "Local control plane for Odoo projects as Docker container pairs")]
struct Cli {
    /// HTTP listener port (falls back to $PORT, then 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the store, git clones, configs and backups
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::resolve(cli.port, cli.data_dir);
    config.ensure_directories()?;

    let store = ProjectStore::open(&config.db_path())
        .map_err(|e| anyhow::anyhow!("Failed to initialize project store: {}", e))?;
    let store = StoreHandle::new(store);

    // A transient status that survived a restart means its background task
    // died with the previous process.
    match store.call(|db| db.reconcile_stale_statuses()).await {
        Ok(n) if n > 0 => info!("Reconciled {} project(s) stuck in transient status", n),
        Ok(_) => {}
        Err(e) => warn!("failed to reconcile stale statuses: {}", e),
    }

    let (git, git_err) = GitOps::bootstrap(config.clone()).await;
    if let Some(err) = git_err {
        warn!(
            "{:#} - git repo features (custom addons, Enterprise, Design Themes) will not work",
            err
        );
    }

    // Validate the stored PAT once so the Configuration page can show its
    // state immediately.
    let pat = store.get_setting("github_pat").await.unwrap_or_default();
    if pat.is_empty() {
        let _ = store.set_setting("github_pat_valid", "").await;
    } else {
        match gitops::validate_token(&pat).await {
            Ok(()) => {
                info!("GitHub PAT token validated successfully");
                let _ = store.set_setting("github_pat_valid", "true").await;
            }
            Err(e) => {
                warn!("Stored GitHub PAT is invalid: {}", e);
                let _ = store.set_setting("github_pat_valid", "false").await;
            }
        }
    }

    let audit = AuditLog::open(&config.audit_log_path())
        .context("Failed to initialize audit logger")?;

    let docker_manager = match DockerManager::connect() {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!("Failed to create Docker client: {:#}", e);
            None
        }
    };
    let docker_up = match &docker_manager {
        Some(manager) => manager.ping().await,
        None => false,
    };

    let state: SharedState = Arc::new(AppState::new(
        config.clone(),
        store,
        EventHub::new(),
        audit,
        git,
        env!("CARGO_PKG_VERSION").to_string(),
        docker_manager,
        docker_up,
    ));

    tokio::spawn(lifecycle::docker_health_loop(state.clone()));

    server::run(state, config.port).await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
