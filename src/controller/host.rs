//! Host controller: the server-side cleanup state machine.
//!
//! Once the machine controller marks a host for cleanup, this controller
//! owns the clock. It stamps when cleanup was first observed, waits for the
//! agent to finish (signalled by `MachineRef` going nil), and force-releases
//! the host when the per-host timeout expires - so a dead agent can never
//! strand a host outside the pool.
//!
//! Force release is made safe against agent races by writing the audit
//! annotation before anything else is cleared; a returning agent sees it on
//! its next heartbeat and performs a local self-clean.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::remote::workload_client;
use crate::crd::types::{
    parse_quantity, CLEANUP_STARTED_ANNOTATION, CLUSTER_NAME_LABEL,
    FORCE_CLEANUP_AUDIT_ANNOTATION, HOST_CLEANUP_ANNOTATION,
};
use crate::crd::Host;
use crate::Error;

/// Environment variable overriding the computed cleanup timeout
pub const HOST_CLEANUP_TIMEOUT_ENV: &str = "HOST_CLEANUP_TIMEOUT";

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MIN_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const MAX_CLEANUP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const REQUEUE_WHILE_WAITING: Duration = Duration::from_secs(10);

/// Context for the host controller
pub struct Context {
    /// Management-cluster client
    pub client: kube::Client,
}

/// Per-host cleanup timeout, scaled by advertised capacity.
///
/// Larger hosts take longer to drain and reset: base 5 minutes, plus 30
/// seconds per CPU beyond 8, plus 60 seconds per 8 GiB of memory beyond
/// 16 GiB, clamped to [2m, 15m]. `HOST_CLEANUP_TIMEOUT` overrides the
/// computation when it parses and sits inside the same clamp.
pub fn cleanup_timeout(capacity: &BTreeMap<String, Quantity>) -> Duration {
    if let Ok(raw) = std::env::var(HOST_CLEANUP_TIMEOUT_ENV) {
        match humantime::parse_duration(&raw) {
            Ok(t) if (MIN_CLEANUP_TIMEOUT..=MAX_CLEANUP_TIMEOUT).contains(&t) => return t,
            Ok(t) => warn!(
                timeout = ?t,
                "{} out of bounds [{:?}, {:?}], using computed timeout",
                HOST_CLEANUP_TIMEOUT_ENV, MIN_CLEANUP_TIMEOUT, MAX_CLEANUP_TIMEOUT
            ),
            Err(e) => warn!(error = %e, "invalid {} value", HOST_CLEANUP_TIMEOUT_ENV),
        }
    }

    computed_cleanup_timeout(capacity)
}

/// The capacity-scaled timeout without the environment override.
pub fn computed_cleanup_timeout(capacity: &BTreeMap<String, Quantity>) -> Duration {
    let mut timeout = DEFAULT_CLEANUP_TIMEOUT;

    if let Some(cpus) = capacity.get("cpu").and_then(|q| parse_quantity(&q.0)) {
        if cpus > 8.0 {
            timeout += Duration::from_secs(30) * (cpus as u32 - 8);
        }
    }

    if let Some(memory) = capacity.get("memory").and_then(|q| parse_quantity(&q.0)) {
        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        if memory > 16.0 * GIB {
            let extra_blocks = ((memory - 16.0 * GIB) / (8.0 * GIB)) as u32;
            timeout += Duration::from_secs(60) * extra_blocks;
        }
    }

    timeout.clamp(MIN_CLEANUP_TIMEOUT, MAX_CLEANUP_TIMEOUT)
}

/// Render the force-release audit entry recorded on the host.
pub fn audit_entry(now: DateTime<Utc>, timeout: Duration, elapsed: Duration) -> String {
    format!(
        "timestamp={},reason=agent_unavailable,timeout={},elapsed={}",
        now.to_rfc3339(),
        humantime::format_duration(timeout),
        humantime::format_duration(Duration::from_secs(elapsed.as_secs())),
    )
}

/// When cleanup was first observed for this host: the started-at annotation
/// if stamped, else the deletion timestamp.
pub fn cleanup_observed_at(host: &Host) -> Option<DateTime<Utc>> {
    let annotations = host.metadata.annotations.as_ref();
    if let Some(stamp) = annotations.and_then(|a| a.get(CLEANUP_STARTED_ANNOTATION)) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    host.metadata
        .deletion_timestamp
        .as_ref()
        .map(|t| t.0)
}

/// Reconcile a host's cleanup state.
#[instrument(skip(host, ctx), fields(host = %host.name_any()))]
pub async fn reconcile(host: Arc<Host>, ctx: Arc<Context>) -> Result<Action, Error> {
    let annotations = host.metadata.annotations.clone().unwrap_or_default();
    if !annotations.contains_key(HOST_CLEANUP_ANNOTATION) {
        // Idle or in use; nothing for this controller to do.
        return Ok(Action::await_change());
    }

    let name = host.name_any();
    let namespace = host.namespace().unwrap_or_default();
    let api: Api<Host> = Api::namespaced(ctx.client.clone(), &namespace);

    // Stamp the first observation so the timeout has a fixed origin.
    if !annotations.contains_key(CLEANUP_STARTED_ANNOTATION) {
        info!("cleanup requested, recording start time");
        let patch = json!({
            "metadata": {
                "annotations": { CLEANUP_STARTED_ANNOTATION: Utc::now().to_rfc3339() }
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(REQUEUE_WHILE_WAITING));
    }

    let machine_ref = host.status.as_ref().and_then(|s| s.machine_ref.clone());
    let timeout = cleanup_timeout(&host.spec.capacity);
    let elapsed = cleanup_observed_at(&host)
        .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
        .unwrap_or_default();

    // Agent finished: MachineRef cleared but the annotation still present
    // (e.g. the agent crashed between the two writes). Finish the release.
    if machine_ref.is_none() {
        info!("agent completed cleanup, releasing host");
        let patch = json!({
            "metadata": {
                "annotations": {
                    HOST_CLEANUP_ANNOTATION: null,
                    CLEANUP_STARTED_ANNOTATION: null,
                }
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::await_change());
    }

    if elapsed <= timeout {
        debug!(?elapsed, ?timeout, "waiting for agent to complete cleanup");
        return Ok(Action::requeue(REQUEUE_WHILE_WAITING));
    }

    // Timeout expired with a live MachineRef: the agent is unavailable.
    warn!(?elapsed, ?timeout, "cleanup timeout exceeded, forcing release");

    // The audit annotation goes first so a returning agent observes the
    // forced release and self-cleans before anything else changes.
    let audit = audit_entry(Utc::now(), timeout, elapsed);
    let patch = json!({
        "metadata": {
            "annotations": { FORCE_CLEANUP_AUDIT_ANNOTATION: audit }
        }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    // Delete the workload Node directly; the agent clearly is not going to.
    if let Some(cluster) = host.labels().get(CLUSTER_NAME_LABEL) {
        match workload_client(&ctx.client, &namespace, cluster).await {
            Ok(remote) => {
                let nodes: Api<Node> = Api::all(remote);
                match nodes.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => info!("deleted workload node"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        debug!("workload node already absent")
                    }
                    Err(e) => warn!(error = %e, "failed to delete workload node"),
                }
            }
            Err(e) => warn!(error = %e, "could not reach workload cluster for node deletion"),
        }
    }

    // Clear the binding and every cleanup annotation; the host returns to
    // the pool.
    let patch = json!({
        "metadata": {
            "annotations": {
                HOST_CLEANUP_ANNOTATION: null,
                CLEANUP_STARTED_ANNOTATION: null,
            },
            "labels": {
                CLUSTER_NAME_LABEL: null,
            }
        }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&json!({
        "status": { "machineRef": null }
    })))
    .await?;

    info!("host force-released");
    Ok(Action::await_change())
}

/// Error policy for the host controller.
pub fn error_policy(host: Arc<Host>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, host = %host.name_any(), "host reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
        map.insert("memory".to_string(), Quantity(memory.to_string()));
        map
    }

    // =========================================================================
    // Timeout computation stories
    // =========================================================================
    //
    // The timeout bounds invariant 4 ("timeout-bounded cleanup"): every host
    // that enters CleanupRequested is released or force-released within
    // timeout + one reconcile period. The formula scales with host size.

    /// A small host gets the 5 minute base timeout.
    #[test]
    fn small_host_gets_base_timeout() {
        assert_eq!(
            computed_cleanup_timeout(&capacity("4", "8Gi")),
            Duration::from_secs(300)
        );
    }

    /// Each CPU past 8 adds 30 seconds: 16 CPUs -> 5m + 8*30s = 9m.
    #[test]
    fn extra_cpus_extend_the_timeout() {
        assert_eq!(
            computed_cleanup_timeout(&capacity("16", "8Gi")),
            Duration::from_secs(300 + 8 * 30)
        );
    }

    /// Each full 8 GiB past 16 GiB adds a minute: 48 GiB -> 5m + 4m = 9m.
    #[test]
    fn extra_memory_extends_the_timeout() {
        assert_eq!(
            computed_cleanup_timeout(&capacity("4", "48Gi")),
            Duration::from_secs(300 + 4 * 60)
        );
    }

    /// The combined timeout is clamped to 15 minutes no matter how large
    /// the host.
    #[test]
    fn timeout_is_clamped_to_maximum() {
        assert_eq!(
            computed_cleanup_timeout(&capacity("128", "1024Gi")),
            Duration::from_secs(15 * 60)
        );
    }

    /// A host with no advertised capacity still gets the base timeout.
    #[test]
    fn missing_capacity_uses_base_timeout() {
        assert_eq!(
            computed_cleanup_timeout(&BTreeMap::new()),
            Duration::from_secs(300)
        );
    }

    // =========================================================================
    // Audit entry stories
    // =========================================================================

    /// The audit entry carries the fixed key=value contract so operators
    /// (and the returning agent) can parse what happened and when.
    #[test]
    fn audit_entry_follows_the_contract() {
        let now = Utc::now();
        let entry = audit_entry(now, Duration::from_secs(300), Duration::from_secs(421));

        assert!(entry.starts_with(&format!("timestamp={}", now.to_rfc3339())));
        assert!(entry.contains("reason=agent_unavailable"));
        assert!(entry.contains("timeout=5m"));
        assert!(entry.contains("elapsed=7m 1s"));
    }
}
