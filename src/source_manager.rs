//! Source Manager (spec §4.E): owns the set of CometD clients and the single
//! outbound envelope stream fed to the Pipeline. Persists replay markers
//! before emitting; coordinates shutdown (unsubscribe, disconnect, then
//! resource teardown).

use crate::auth::SalesforceAuth;
use crate::cometd::{CometdClient, Subscription};
use crate::envelope::Envelope;
use crate::provisioner::{ProvisionedResource, ResourceProvisioner};
use crate::replay_store::ReplayStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Capacity of the fan-in channel, mirroring the teacher's local fanout
/// broadcast capacity (`forwarder::local_fanout::FanoutServer::bind`).
const ENVELOPE_CHANNEL_CAPACITY: usize = 256;

pub struct OrgSource {
    pub org_name: String,
    pub auth: Arc<SalesforceAuth>,
    pub api_version: String,
    pub resources: Vec<ProvisionedResource>,
}

pub struct SourceManager {
    replay_store: Arc<dyn ReplayStore>,
    provisioner: Arc<ResourceProvisioner>,
    http: reqwest::Client,
    key_prefix: String,
    source_connection_timeout: u64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    orgs: Vec<OrgSource>,
    failed_clients: Arc<AtomicUsize>,
    fatal_error: Arc<Mutex<Option<String>>>,
}

impl SourceManager {
    pub fn new(
        replay_store: Arc<dyn ReplayStore>,
        provisioner: Arc<ResourceProvisioner>,
        http: reqwest::Client,
        key_prefix: impl Into<String>,
        source_connection_timeout: u64,
        orgs: Vec<OrgSource>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        SourceManager {
            replay_store,
            provisioner,
            http,
            key_prefix: key_prefix.into(),
            source_connection_timeout,
            shutdown_tx,
            tasks: Vec::new(),
            orgs,
            failed_clients: Arc::new(AtomicUsize::new(0)),
            fatal_error: Arc::new(Mutex::new(None)),
        }
    }

    /// True once every org's CometD client has reached the `Failed` state
    /// (§7: "if all clients reach FAILED, the service exits with code 2").
    /// Only meaningful after the envelope stream has ended.
    pub fn all_clients_failed(&self) -> bool {
        !self.orgs.is_empty() && self.failed_clients.load(Ordering::Acquire) >= self.orgs.len()
    }

    /// A replay-store failure that was not swallowed by
    /// `ignore_replay_storage_errors`, if one has occurred (§7: "otherwise
    /// surfaced as fatal"). Checked by the Pipeline whenever the envelope
    /// stream ends so a propagated store error exits the service rather than
    /// being silently dropped after a log line.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().unwrap().clone()
    }

    /// Starts one task per org's CometD client; each persists its replay
    /// marker synchronously (§4.E step 2) before handing envelopes on to
    /// `tx`. Returns the receiving end for the Pipeline to drain.
    pub fn start(&mut self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(ENVELOPE_CHANNEL_CAPACITY);

        for org in &self.orgs {
            let subscriptions = org
                .resources
                .iter()
                .map(|r| Subscription { channel: r.channel.clone(), replay_all: false })
                .collect::<Vec<_>>();

            let mut client = CometdClient::new(
                self.http.clone(),
                org.auth.clone(),
                self.replay_store.clone(),
                org.org_name.clone(),
                org.api_version.clone(),
                self.key_prefix.clone(),
                self.source_connection_timeout,
            );

            let tx = tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let org_name = org.org_name.clone();
            let replay_store = self.replay_store.clone();
            let failed_clients = self.failed_clients.clone();
            let fatal_error = self.fatal_error.clone();
            let shutdown_tx = self.shutdown_tx.clone();

            let handle = tokio::spawn(async move {
                let (raw_tx, mut raw_rx) = mpsc::channel(ENVELOPE_CHANNEL_CAPACITY);

                let forward_org_name = org_name.clone();
                let forward_task = tokio::spawn(async move {
                    while let Some(envelope) = raw_rx.recv().await {
                        if let Err(e) = persist_and_forward(&replay_store, &tx, envelope).await {
                            error!(org = %forward_org_name, error = %e, "replay store error, shutting down");
                            *fatal_error.lock().unwrap() = Some(e.to_string());
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                });

                let run_result = client.run(subscriptions, raw_tx, shutdown_rx).await;
                let _ = forward_task.await;

                if let Err(e) = run_result {
                    error!(org = %org_name, error = %e, "cometd client terminated");
                    failed_clients.fetch_add(1, Ordering::AcqRel);
                }
            });
            self.tasks.push(handle);
        }

        rx
    }

    /// §4.E shutdown: stop accepting long-polls (signal each client),
    /// await their unsubscribe/disconnect, then run the provisioner's
    /// teardown for every org.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for org in &self.orgs {
            self.provisioner.teardown(&org.auth, &org.resources).await;
        }
        info!("source manager shut down, all resources torn down");
    }
}

/// Persists the replay marker (if present) before emission, per invariant
/// (ii) in §3: the store is advanced on receive, not on downstream ack. A
/// propagated (non-swallowed) store error is returned to the caller instead
/// of being logged-and-dropped, since §7 makes an unswallowed `ReplayStoreError`
/// fatal rather than best-effort.
async fn persist_and_forward(
    replay_store: &Arc<dyn ReplayStore>,
    tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) -> Result<(), crate::replay_store::ReplayStoreError> {
    if let (Some(channel), Some(marker)) = (envelope.channel(), envelope.event_marker()) {
        replay_store.set(&envelope.org_name, channel, marker).await?;
    }
    let _ = tx.send(envelope).await;
    Ok(())
}
