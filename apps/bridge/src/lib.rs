#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use levias_token::FileTokenSource;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    backend::LifecycleBackend,
    cluster::{ClusterClient, KubeCluster},
    config::Config,
    exec_sessions::ExecSessionTable,
    identity::{
        ClusterKeySetSource, HttpKeySetSource, IdentityVerifier, KeySetSource,
        discover_issuer_insecure,
    },
    readiness::ReadinessWatcher,
    server::{AppState, build_router},
};

pub mod backend;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod exec_sessions;
pub mod identity;
pub mod readiness;
pub mod scope;
pub mod server;
pub mod stream_bridge;
pub mod wait;

const SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Issuer to verify callers against, read from our own credential when not
/// configured.
pub fn resolve_issuer(config: &Config) -> Result<String> {
    if let Some(issuer) = config.issuer.clone() {
        return Ok(issuer);
    }
    let source = FileTokenSource::new(config.service_token_path.clone());
    let token = source
        .token()
        .context("read service credential for issuer discovery")?;
    let issuer = discover_issuer_insecure(&token)
        .context("discover issuer from service credential")?;
    warn!(
        issuer = %issuer,
        token_path = %source.path().display(),
        "issuer discovered from unverified service credential; set LEVIAS_ISSUER to pin it"
    );
    Ok(issuer)
}

pub async fn build_bridge_state(config: &Config, cluster: KubeCluster) -> Result<AppState> {
    let issuer = resolve_issuer(config)?;
    let key_source: Arc<dyn KeySetSource> = match config.jwks_url.as_deref() {
        Some(url) => Arc::new(HttpKeySetSource::new(reqwest::Client::new(), url)),
        None => Arc::new(ClusterKeySetSource::new(cluster.client().clone())),
    };
    let audiences = config.effective_audiences(&issuer);
    info!(issuer = %issuer, audiences = ?audiences, "verifying pod service-account tokens");
    let verifier = IdentityVerifier::new(key_source, issuer, audiences, config.jwks_cache_ttl);

    let cluster: Arc<dyn ClusterClient> = Arc::new(cluster);
    let readiness = ReadinessWatcher::new(
        Arc::clone(&cluster),
        config.readiness_strategy,
        config.poll_interval,
        config.watch_timeout_seconds,
    );
    let sessions = Arc::new(ExecSessionTable::new(config.exec_session_ttl));
    spawn_session_sweeper(Arc::clone(&sessions));
    let backend = LifecycleBackend::new(
        cluster,
        readiness,
        sessions,
        config.readiness_timeout,
        config.placeholder_containers.clone(),
    );
    Ok(AppState::new(
        config.service_name.clone(),
        Arc::new(verifier),
        backend,
    ))
}

fn spawn_session_sweeper(sessions: Arc<ExecSessionTable>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sessions.evict_expired();
        }
    });
}

pub async fn build_app(config: &Config) -> Result<axum::Router> {
    let cluster = KubeCluster::try_default()
        .await
        .context("load cluster configuration")?;
    Ok(build_router(build_bridge_state(config, cluster).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let app = build_app(&config).await?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "engine bridge listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
