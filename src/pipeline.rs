//! Pipeline (spec §4.H): binds the Source Manager, Router, and Sink Manager
//! together, owns startup ordering, and drives graceful shutdown.

use crate::auth::SalesforceAuth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::provisioner::{ProvisionedResource, ResourceProvisioner};
use crate::replay_store::{NullReplayStore, PolicyReplayStore, RedisReplayStore, ReplayStore};
use crate::router::Router;
use crate::sink_manager::SinkManager;
use crate::source_manager::{OrgSource, SourceManager};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Flags the Pipeline needs beyond what's in the config file (§6 CLI
/// options that gate error policy and reconnection budget).
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub ignore_replay_storage_errors: bool,
    pub ignore_sink_errors: bool,
    pub source_connection_timeout: u64,
}

/// Why the pipeline's run loop stopped, so the CLI can choose the right
/// exit code (§6: 0 clean, 130 interrupted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Every source's stream ended (all CometD clients reached a terminal
    /// state without error).
    SourcesExhausted,
    /// SIGINT or SIGTERM was received.
    Interrupted,
}

/// Starts every component in the order spec'd by §4.H ("Startup order:
/// Replay Store → Auth (per org) → Resource Provisioner → Sink Manager
/// (connect+declare) → Router (validate) → Source Manager (start) →
/// Pipeline"), then runs until shutdown and tears everything back down in
/// reverse.
pub async fn run(config: Config, options: RuntimeOptions) -> Result<Shutdown> {
    let replay_store = build_replay_store(&config, &options).await?;

    let http = reqwest::Client::new();
    let provisioner = Arc::new(ResourceProvisioner::new(http.clone()));

    let mut org_sources = Vec::with_capacity(config.orgs.len());
    for (org_name, org_spec) in &config.orgs {
        let auth = SalesforceAuth::new(
            http.clone(),
            org_name.clone(),
            org_spec.login_url.clone(),
            org_spec.consumer_key.clone(),
            org_spec.consumer_secret.clone(),
            org_spec.username.clone(),
            org_spec.password.clone(),
        );
        let resources: Vec<ProvisionedResource> = provisioner
            .provision_org(&auth, &org_spec.resources)
            .await
            .map_err(|e| Error::Configuration(format!("provisioning org '{org_name}': {e}")))?;

        let api_version = org_spec
            .api_version
            .clone()
            .unwrap_or_else(|| crate::provisioner::highest_api_version(&resources));

        org_sources.push(OrgSource { org_name: org_name.clone(), auth, api_version, resources });
    }

    let sink_manager = SinkManager::connect(&config.brokers, options.ignore_sink_errors)
        .await
        .map_err(|e| Error::Configuration(format!("connecting to brokers: {e}")))?;

    let router = Router::new(&config.router, &config.brokers)
        .map_err(|e| Error::configuration(e.to_string()))?;

    let mut source_manager = SourceManager::new(
        replay_store,
        provisioner.clone(),
        http,
        config.replay.key_prefix.clone(),
        options.source_connection_timeout,
        org_sources,
    );
    let mut envelopes = source_manager.start();

    info!("pipeline started, forwarding envelopes");

    let reason;
    loop {
        tokio::select! {
            envelope = envelopes.recv() => {
                match envelope {
                    Some(envelope) => {
                        match router.route(&envelope) {
                            Some(route) => {
                                if let Err(e) = sink_manager.publish(route, &envelope).await {
                                    error!(org = %envelope.org_name, error = %e, "sink publish failed");
                                    source_manager.shutdown().await;
                                    return Err(Error::SinkNetwork(e.to_string()));
                                }
                            }
                            None => {
                                debug!(org = %envelope.org_name, "no rule or default route matched, dropping envelope");
                            }
                        }
                    }
                    None => {
                        if let Some(e) = source_manager.fatal_error() {
                            error!(error = %e, "replay store error propagated, shutting down");
                            source_manager.shutdown().await;
                            return Err(Error::ReplayStore(e));
                        }
                        if source_manager.all_clients_failed() {
                            error!("every org's cometd client reached FAILED, shutting down");
                            source_manager.shutdown().await;
                            return Err(Error::SourceFatal("all sources reached FAILED".into()));
                        }
                        info!("source manager's envelope stream ended, shutting down");
                        reason = Shutdown::SourcesExhausted;
                        break;
                    }
                }
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received, draining and shutting down");
                reason = Shutdown::Interrupted;
                break;
            }
        }
    }

    source_manager.shutdown().await;
    Ok(reason)
}

async fn build_replay_store(config: &Config, options: &RuntimeOptions) -> Result<Arc<dyn ReplayStore>> {
    match &config.replay.address {
        Some(address) => {
            let redis = RedisReplayStore::connect(address, config.replay.key_prefix.clone())
                .await
                .map_err(|e| Error::Configuration(format!("connecting to replay store: {e}")))?;
            Ok(Arc::new(PolicyReplayStore::new(redis, options.ignore_replay_storage_errors)))
        }
        None => Ok(Arc::new(NullReplayStore)),
    }
}

/// Waits for SIGINT or (on unix) SIGTERM, whichever comes first (§4.H, §6
/// exit code 130).
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
