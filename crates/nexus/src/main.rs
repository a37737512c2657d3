//! nexus daemon
//!
//! SSH trust control plane: certificate authority, agent stream server and fleet
//! reconciliation, served by axum with kameo actors behind it.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::ListenerExt;
use clap::Parser;
use color_eyre::Result;
use eyre::WrapErr;
use nexus_ca::{CaPaths, CertificateAuthority, ChallengeMap, TokenStore, ensure_admin_token};
use nexus_core::{
    MemoryStore, ProtocolServer, ReconcilerArgs, Records, RegistryHandle, RemoteConverger,
    SshConverger, Store, Sweeper, spawn_reconciler,
};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod factory;
mod router;
mod scheduler;
mod state;
mod tls;

use crate::config::Config;
use crate::factory::RoutingSessionFactory;
use crate::state::AppState;
use crate::tls::{AcmeOptions, RENEWAL_INTERVAL, TlsListener, TlsManager};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "nexus", version, about = "SSH trust control plane")]
struct Cli {
    /// Configuration file; defaults to the standard search path
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.daemon.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Commit the configured inventory before anything subscribes to change events
async fn seed(records: &Records, config: &Config) -> Result<()> {
    for group in &config.group {
        records.put_group(group.clone()).await?;
    }
    for user in &config.user {
        records.put_user(user.clone()).await?;
    }
    for machine in &config.machine {
        records.put_machine(machine.clone()).await?;
    }
    info!(
        machines = config.machine.len(),
        users = config.user.len(),
        groups = config.group.len(),
        "seeded inventory"
    );
    Ok(())
}

async fn serve_acme(bind: &str, challenges: ChallengeMap, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(
                bind,
                error = %e,
                "ACME responder unavailable, domain endpoints cannot be provisioned"
            );
            return;
        }
    };
    info!(bind, "ACME responder listening");
    tokio::spawn(async move {
        let served = axum::serve(listener, router::acme_router(challenges))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(error = %e, "ACME responder stopped");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).wrap_err_with(|| format!("loading {}", path.display()))?,
        None => Config::load_default()?,
    };
    init_tracing(&config);
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "nexus starting");

    // Key material
    let paths = CaPaths::new(&config.daemon.data_dir);
    if config.daemon.admin_token.as_deref().is_none_or(|t| t.trim().is_empty()) {
        config.daemon.admin_token = Some(ensure_admin_token(&paths)?);
        info!(path = %paths.admin_token().display(), "admin_token unset, using generated token");
    }
    let ca = Arc::new(CertificateAuthority::new(paths.clone()));
    ca.ensure_signing_keys()?;
    let tokens = Arc::new(TokenStore::new(&paths));
    tokens.ensure()?;

    // Records
    let settings = config.effective_settings();
    let endpoint = settings.external_url.clone();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(settings));
    let records = Records::new(store.clone(), EVENT_CAPACITY);
    seed(&records, &config).await?;

    // Actors
    let shutdown = CancellationToken::new();
    let registry = RegistryHandle::spawn();
    let sessions = Arc::new(RoutingSessionFactory::new(paths.user_ca_key()));
    let mut converger = SshConverger::new(
        sessions,
        store.clone(),
        registry.clone(),
        ca.clone(),
        tokens.clone(),
    );
    if let Some(binary) = &config.daemon.agent_binary {
        converger = converger.with_agent_binary(binary);
    }
    let converger: Arc<dyn RemoteConverger> = Arc::new(converger);
    let reconciler = spawn_reconciler(
        ReconcilerArgs {
            store: store.clone(),
            registry: registry.clone(),
            converger: converger.clone(),
        },
        records.subscribe(),
    );
    let sweeper = Arc::new(Sweeper::new(store.clone(), converger, tokens.clone()));
    scheduler::spawn_sweeps(
        sweeper.clone(),
        Duration::from_secs(config.daemon.sweep_interval_secs.max(1)),
        shutdown.child_token(),
    );

    // TLS
    let challenges: ChallengeMap = Arc::new(RwLock::new(HashMap::new()));
    serve_acme(&config.daemon.acme_http_bind, challenges.clone(), shutdown.child_token()).await;
    let tls = Arc::new(
        TlsManager::start(
            paths,
            challenges,
            AcmeOptions {
                email: config.daemon.acme_email.clone(),
                staging: config.daemon.acme_staging,
            },
            endpoint.as_deref(),
        )
        .await?,
    );
    tls.clone()
        .spawn_maintenance(&records, RENEWAL_INTERVAL, shutdown.child_token());

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        config: config.clone(),
        records,
        ca: ca.clone(),
        tokens: tokens.clone(),
        protocol: ProtocolServer::new(store, registry, ca, tokens)
            .with_shutdown(shutdown.child_token()),
        sweeper,
        reconciler,
        tls: tls.clone(),
    });

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    // Listeners
    let admin_listener = TcpListener::bind(&config.daemon.api_bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.daemon.api_bind))?;
    info!(bind = %config.daemon.api_bind, "admin API listening");
    let agent_listener = TcpListener::bind(&config.daemon.agent_bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.daemon.agent_bind))?;
    info!(bind = %config.daemon.agent_bind, "agent endpoint listening (TLS)");
    let agent_listener = TlsListener::new(agent_listener, tls.subscribe())?.tap_io(|_| {});

    let admin_shutdown = shutdown.clone();
    let admin = axum::serve(admin_listener, router::admin_router(state.clone()))
        .with_graceful_shutdown(async move { admin_shutdown.cancelled().await });
    let agent_shutdown = shutdown.clone();
    let agent = axum::serve(
        agent_listener,
        router::agent_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { agent_shutdown.cancelled().await });

    tokio::try_join!(admin.into_future(), agent.into_future())?;
    info!("nexus stopped");
    Ok(())
}
