/**
 * BRT FORWARDER - Point d'entrée du relais
 *
 * RÔLE : Bootstrap : config (YAML + .env + BRT_*), logs, cache persistant,
 * boucle de synchronisation, serveur HTTP, flush final à l'arrêt.
 *
 * COMMANDES :
 * - serve (défaut) : démarre le relais
 * - expire --max-age-days N : maintenance hors ligne du fichier de cache
 */

use anyhow::{Context, Result};
use brt_forwarder::cache::{spawn_persistence_loop, CacheStore};
use brt_forwarder::clock::{Clock, SystemClock};
use brt_forwarder::config::{load_config, ForwarderConfig, LoadedConfig};
use brt_forwarder::health::{HealthTracker, VERSION};
use brt_forwarder::http::{build_router, AppState};
use brt_forwarder::service::ForwarderService;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "brt-forwarder", version, about = "Relais de données capteurs BRT")]
struct Cli {
    /// Fichier de configuration YAML
    #[arg(short, long, env = "BRT_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Démarre le serveur de réception et de relais
    Serve,
    /// Supprime du fichier de cache les entrées plus vieilles que N jours
    Expire {
        #[arg(long)]
        max_age_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let loaded = load_config(&cli.config)
        .await
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_logging(&loaded.config.logging.level);
    report_config(&loaded);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(loaded.config).await,
        Command::Expire { max_age_days } => expire(&loaded.config, max_age_days),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn report_config(loaded: &LoadedConfig) {
    match &loaded.source {
        Some(path) => info!("configuration loaded from {}", path.display()),
        None => info!("running with default configuration"),
    }
    for o in &loaded.overrides {
        info!(
            "env override: {} = {:?} (was {:?})",
            o.key_path, o.new_value, o.old_value
        );
    }
    if !loaded.overrides.is_empty() {
        info!("applied {} environment overrides", loaded.overrides.len());
    }
    for w in &loaded.warnings {
        warn!("{}", w);
    }
}

fn ensure_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).unwrap_or_else(|e| {
            warn!("failed to create cache dir {}: {}", parent.display(), e);
        });
    }
}

async fn serve(cfg: ForwarderConfig) -> Result<()> {
    info!("BRT forwarder v{} starting", VERSION);

    let cache_path = cfg.cache.file_path.clone();
    ensure_parent_dir(&cache_path);
    let cache = Arc::new(CacheStore::load_from_disk(&cache_path));
    let persistence = spawn_persistence_loop(cache.clone(), cache_path, cfg.sync_interval());

    let service = ForwarderService::from_config(&cfg, cache);
    info!(
        "{} forward targets, special metrics {:?}, processing {}",
        service.targets().len(),
        cfg.cache.special_metrics,
        if service.processing_enabled() { "enabled" } else { "disabled" }
    );

    let app_state = AppState {
        service: Arc::new(service),
        health: HealthTracker::new(),
        auth: Arc::new(cfg.receiver.auth.clone()),
        max_body_bytes: cfg.receiver.max_body_bytes,
    };
    let app = build_router(app_state, &cfg.receiver.path);

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{}{}", addr, cfg.receiver.path);

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!("server error: {}", e);
    }

    // flush final quoi qu'il arrive au serveur
    if let Err(e) = persistence.shutdown().await {
        error!("final cache flush failed: {}", e);
    }
    info!("BRT forwarder stopped");
    served.context("HTTP server failed")
}

fn expire(cfg: &ForwarderConfig, max_age_days: u32) -> Result<()> {
    let path = &cfg.cache.file_path;
    let store = CacheStore::load_from_disk(path);
    let removed = store.expire_older_than(max_age_days, SystemClock.now_unix());
    store
        .flush(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("removed {removed} cache entries older than {max_age_days} days");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
