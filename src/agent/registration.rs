//! Host self-registration and periodic status refresh.
//!
//! On startup the agent registers its host (or recovers an existing
//! registration after a restart), publishes capacity into the spec and
//! network/platform details into the status, and then keeps both fresh on
//! a fixed interval. A leftover force-cleanup audit annotation from a
//! controller-side reclamation triggers a best-effort local reset before
//! the host rejoins the pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info, warn};

use super::cmd::CmdRunner;
use super::metrics::MetricsState;
use super::probe;
use crate::crd::types::FORCE_CLEANUP_AUDIT_ANNOTATION;
use crate::crd::{Host, HostSpec};
use crate::{Error, Result};

/// Registers and refreshes this host's object.
pub struct HostRegistrar {
    /// Management-cluster client
    pub client: Client,
    /// This host's name (its Host object name and future Node name)
    pub host_name: String,
    /// Namespace the Host object lives in
    pub namespace: String,
    /// Selection labels applied at registration
    pub labels: BTreeMap<String, String>,
    /// Runner for the post-force-cleanup reset commands
    pub cmd_runner: Arc<dyn CmdRunner>,
}

impl HostRegistrar {
    /// Register the host: create the object if absent (capacity pre-filled),
    /// otherwise refresh capacity and recover from any prior force cleanup.
    pub async fn register(&self) -> Result<Host> {
        info!(host = %self.host_name, "registering host");
        let api: Api<Host> = Api::namespaced(self.client.clone(), &self.namespace);
        let capacity = probe::capacity().await;

        let host = match api.get(&self.host_name).await {
            Ok(existing) => {
                self.recover_from_force_cleanup(&api, &existing).await?;

                let patch = json!({ "spec": { "capacity": capacity } });
                api.patch(
                    &self.host_name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let host = Host {
                    metadata: ObjectMeta {
                        name: Some(self.host_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(self.labels.clone()),
                        ..Default::default()
                    },
                    spec: HostSpec {
                        capacity,
                        ..Default::default()
                    },
                    status: None,
                };
                api.create(&PostParams::default(), &host).await?
            }
            Err(e) => return Err(Error::Kube(e)),
        };

        self.update_status(&api).await?;
        Ok(host)
    }

    /// If the controller force-released this host while the agent was down,
    /// reset the obvious local leftovers and clear the audit annotation.
    async fn recover_from_force_cleanup(&self, api: &Api<Host>, host: &Host) -> Result<()> {
        let audit = host
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FORCE_CLEANUP_AUDIT_ANNOTATION));
        let Some(audit) = audit else {
            return Ok(());
        };

        info!(audit = %audit, "detected prior force cleanup, resetting local state");
        for cmd in [
            "systemctl stop kubelet",
            "systemctl disable kubelet",
            "rm -rf /etc/kubernetes",
            "rm -rf /var/lib/kubelet",
        ] {
            if let Err(e) = self.cmd_runner.run(cmd).await {
                // Best effort: a partially-reset host is still better than
                // one stuck carrying the audit annotation forever.
                warn!(cmd = %cmd, error = %e, "post-force cleanup command failed");
            }
        }

        let patch = json!({
            "metadata": { "annotations": { FORCE_CLEANUP_AUDIT_ANNOTATION: null } }
        });
        api.patch(
            &self.host_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        info!("post-force cleanup completed");
        Ok(())
    }

    /// Publish current network topology and platform details.
    pub async fn update_status(&self, api: &Api<Host>) -> Result<()> {
        let network = probe::network_status().await;
        let details = probe::host_details().await;

        let patch = json!({
            "status": {
                "network": network,
                "hostDetails": details,
            }
        });
        api.patch_status(
            &self.host_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!("host status refreshed");
        Ok(())
    }

    /// Run the periodic refresh loop: re-publish status and bump the
    /// heartbeat gauge every `interval`. Transient failures are logged and
    /// the loop continues.
    pub async fn refresh_loop(&self, interval: Duration, metrics: Arc<MetricsState>) {
        let api: Api<Host> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.update_status(&api).await {
                Ok(()) => metrics.record_heartbeat(),
                Err(e) => warn!(error = %e, "status refresh failed"),
            }
        }
    }
}
