//! Machine controller: the core scheduler and binder.
//!
//! Reconciles PoolMachines against the host pool. The interesting part is
//! claim arbitration: multiple controller replicas may target the same host,
//! so every claim runs under a short-lived lease annotation written with a
//! full update (compare-and-set on the resource version). At most one
//! replica can bind a given host for a given machine; the loser moves on to
//! another host with bounded exponential backoff.
//!
//! Binding is discovered by label query (with a UID scan fallback during
//! deletion) rather than a spec pointer, so Host and PoolMachine never form
//! a cyclic owner reference.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::token::TOKEN_TTL;
use crate::bootstrap::{
    assemble_tls_bootstrap, BootstrapToken, RemoteConfigReader, TlsBootstrapInputs,
    SERVICE_ACCOUNT_CA_PATH,
};
use crate::controller::host::{cleanup_timeout, cleanup_observed_at};
use crate::controller::remote::workload_client;
use crate::crd::types::{
    condition_is_true, generate_provider_id, validate_provider_id, Condition, ConditionStatus,
    JoinMode, MachineAddress, MachineRef, NetworkStatus, SecretRef, ATTACHED_MACHINE_LABEL,
    BOOTSTRAP_SECRET_UNAVAILABLE_REASON, CLUSTER_NAME_LABEL, ENDPOINT_HOST_ANNOTATION,
    HOSTS_UNAVAILABLE_REASON, HOST_CLEANUP_ANNOTATION, HOST_LEASE_ANNOTATION, HOST_LEASE_TTL_SECS,
    HOST_READY_CONDITION, K8S_VERSION_ANNOTATION, BUNDLE_REGISTRY_ANNOTATION, MACHINE_FINALIZER,
    NODE_BOOTSTRAPPED_CONDITION, PAUSED_ANNOTATION, PAUSED_REASON, REMEDIATION_ANNOTATION,
    WAITING_FOR_NODE_REASON,
};
use crate::crd::{Host, PoolMachine};
use crate::retry::claim_backoff;
use crate::{Error, Result};

/// Maximum claim attempts before requeueing the machine
pub const MAX_CLAIM_ATTEMPTS: u32 = 5;

/// Requeue delay while waiting on hosts, nodes, or agent cleanup
pub const REQUEUE_DELAY: Duration = Duration::from_secs(10);

// =============================================================================
// Context
// =============================================================================

/// Shared state for the machine controller.
pub struct Context {
    /// Management-cluster client
    pub client: Client,
    /// Identity written into lease annotations, unique per replica
    pub controller_id: String,
    /// Per-cluster round-robin cursors. In-memory only: selection fairness
    /// is best-effort, not a correctness property.
    round_robin: Mutex<HashMap<String, usize>>,
}

impl Context {
    /// Create a controller context with the given replica identity.
    pub fn new(client: Client, controller_id: impl Into<String>) -> Self {
        Self {
            client,
            controller_id: controller_id.into(),
            round_robin: Mutex::new(HashMap::new()),
        }
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Payload of the claim-arbitration lease annotation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Controller replica holding the lease
    pub holder: String,
    /// When the lease was acquired
    pub acquire_time: DateTime<Utc>,
    /// Machine the holder is binding
    pub machine_name: String,
}

/// Parse a lease annotation value; malformed payloads count as absent.
pub fn parse_lease(raw: &str) -> Option<LeaseInfo> {
    serde_json::from_str(raw).ok()
}

/// A lease is live while `acquire_time + TTL` is in the future. A crashed
/// holder's lease expires on its own; no explicit unlock is required for
/// correctness, only for latency.
pub fn lease_is_live(lease: &LeaseInfo, now: DateTime<Utc>) -> bool {
    lease.acquire_time + chrono::Duration::seconds(HOST_LEASE_TTL_SECS) > now
}

// =============================================================================
// Selection
// =============================================================================

/// Pick a host for a claim: filter to available hosts satisfying the
/// capacity requirements, keep only the top priority tier, then rotate a
/// per-cluster round-robin cursor over the survivors.
///
/// An empty pool returns None without advancing any cursor.
pub fn select_host<'a>(
    hosts: &'a [Host],
    cluster_name: &str,
    requirements: Option<&BTreeMap<String, Quantity>>,
    cursors: &mut HashMap<String, usize>,
) -> Option<&'a Host> {
    let empty = BTreeMap::new();
    let requirements = requirements.unwrap_or(&empty);

    let candidates: Vec<&Host> = hosts
        .iter()
        .filter(|h| h.is_available() && h.matches_requirements(requirements))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let max_priority = candidates.iter().map(|h| h.priority()).max().unwrap_or(0);
    let top_tier: Vec<&Host> = candidates
        .into_iter()
        .filter(|h| h.priority() == max_priority)
        .collect();

    let cursor = cursors.entry(cluster_name.to_string()).or_insert(0);
    let selected = top_tier[*cursor % top_tier.len()];
    *cursor = (*cursor + 1) % top_tier.len();
    Some(selected)
}

/// Render a LabelSelector as the string form the list API accepts.
/// Supports matchLabels and the four matchExpressions operators.
pub fn selector_string(selector: Option<&LabelSelector>) -> String {
    let mut parts = Vec::new();

    if let Some(selector) = selector {
        if let Some(labels) = &selector.match_labels {
            for (k, v) in labels {
                parts.push(format!("{}={}", k, v));
            }
        }
        if let Some(expressions) = &selector.match_expressions {
            for expr in expressions {
                let values = expr.values.as_deref().unwrap_or_default().join(",");
                match expr.operator.as_str() {
                    "In" => parts.push(format!("{} in ({})", expr.key, values)),
                    "NotIn" => parts.push(format!("{} notin ({})", expr.key, values)),
                    "Exists" => parts.push(expr.key.clone()),
                    "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                    other => warn!(operator = other, "unsupported selector operator"),
                }
            }
        }
    }

    // Hosts already claimed into a cluster never match selection.
    parts.push(format!("!{}", CLUSTER_NAME_LABEL));
    parts.join(",")
}

/// Convert agent-reported network status into machine addresses. Every IP
/// (IPv4 and IPv6) becomes an ExternalIP; the CIDR suffix is dropped.
pub fn addresses_from_network(network: &[NetworkStatus]) -> Vec<MachineAddress> {
    network
        .iter()
        .flat_map(|n| n.ip_addrs.iter())
        .map(|addr| MachineAddress {
            type_: "ExternalIP".to_string(),
            address: addr.split('/').next().unwrap_or(addr).to_string(),
        })
        .collect()
}

/// Strip build metadata from a Kubernetes version (`v1.31.2+abc` -> `v1.31.2`).
pub fn strip_build_metadata(version: &str) -> &str {
    version.split('+').next().unwrap_or(version)
}

// =============================================================================
// External collaborators (cluster-manager objects, read dynamically)
// =============================================================================

fn machine_api_resource() -> ApiResource {
    ApiResource {
        group: "cluster.x-k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Machine".to_string(),
        plural: "machines".to_string(),
    }
}

fn cluster_api_resource() -> ApiResource {
    ApiResource {
        group: "cluster.x-k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Cluster".to_string(),
        plural: "clusters".to_string(),
    }
}

/// Fields read from the external Machine/Cluster pair that owns a
/// PoolMachine. Only what the binding writes is extracted; the schemas
/// themselves stay out of scope.
#[derive(Debug, Default)]
pub struct ExternalRefs {
    /// Cluster name from the owner Machine
    pub cluster_name: Option<String>,
    /// Bootstrap data-secret name from the owner Machine
    pub bootstrap_secret_name: Option<String>,
    /// Kubernetes version from the owner Machine
    pub version: Option<String>,
    /// Control-plane endpoint host from the Cluster
    pub endpoint_host: Option<String>,
    /// Whether the Cluster reports its infrastructure ready
    pub infrastructure_ready: bool,
    /// Whether the Cluster is paused
    pub paused: bool,
    /// Bundle registry advertised by the infrastructure cluster
    pub bundle_registry: Option<String>,
}

async fn fetch_external_refs(
    client: &Client,
    namespace: &str,
    machine: &PoolMachine,
) -> Result<Option<ExternalRefs>> {
    let Some(owner) = machine
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|o| o.kind == "Machine")
    else {
        return Ok(None);
    };

    let machines: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &machine_api_resource());
    let owner_machine = match machines.get(&owner.name).await {
        Ok(m) => m,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
        Err(e) => return Err(Error::Kube(e)),
    };

    let mut refs = ExternalRefs::default();
    let spec = owner_machine.data.get("spec").cloned().unwrap_or_default();
    refs.cluster_name = spec
        .get("clusterName")
        .and_then(|v| v.as_str())
        .map(String::from);
    refs.bootstrap_secret_name = spec
        .pointer("/bootstrap/dataSecretName")
        .and_then(|v| v.as_str())
        .map(String::from);
    refs.version = spec
        .get("version")
        .and_then(|v| v.as_str())
        .map(String::from);

    if let Some(cluster_name) = refs.cluster_name.clone() {
        let clusters: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &cluster_api_resource());
        match clusters.get(&cluster_name).await {
            Ok(cluster) => {
                refs.endpoint_host = cluster
                    .data
                    .pointer("/spec/controlPlaneEndpoint/host")
                    .and_then(|v| v.as_str())
                    .filter(|h| !h.is_empty())
                    .map(String::from);
                refs.paused = cluster
                    .data
                    .pointer("/spec/paused")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                refs.infrastructure_ready = cluster
                    .data
                    .pointer("/status/infrastructureReady")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                // Bundle registry lives on the infrastructure cluster object.
                if let Some(infra) = cluster.data.pointer("/spec/infrastructureRef") {
                    refs.bundle_registry = fetch_bundle_registry(client, namespace, infra).await;
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(cluster = %cluster_name, "owning cluster not found");
            }
            Err(e) => return Err(Error::Kube(e)),
        }
    }

    Ok(Some(refs))
}

async fn fetch_bundle_registry(
    client: &Client,
    namespace: &str,
    infra_ref: &serde_json::Value,
) -> Option<String> {
    let api_version = infra_ref.get("apiVersion")?.as_str()?;
    let kind = infra_ref.get("kind")?.as_str()?;
    let name = infra_ref.get("name")?.as_str()?;
    let (group, version) = api_version.split_once('/')?;

    let ar = ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    };
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    let obj = api.get(name).await.ok()?;
    obj.data
        .pointer("/spec/bundleLookupBaseRegistry")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

// =============================================================================
// Reconcile
// =============================================================================

/// Map a Host event to the PoolMachine that claimed it, so binding updates
/// wake the right reconcile.
pub fn host_to_machine(host: Host) -> Option<ObjectRef<PoolMachine>> {
    let machine_ref = host.status.as_ref()?.machine_ref.as_ref()?;
    Some(ObjectRef::new(&machine_ref.name).within(&machine_ref.namespace))
}

/// Reconcile a PoolMachine.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<PoolMachine>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<PoolMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    if machine.metadata.deletion_timestamp.is_some() {
        return reconcile_delete(&machine, &namespace, &api, &ctx).await;
    }

    ensure_finalizer(&api, &machine).await?;
    reconcile_normal(&machine, &namespace, &api, &ctx).await
}

async fn ensure_finalizer(api: &Api<PoolMachine>, machine: &PoolMachine) -> Result<()> {
    let finalizers = machine.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
        return Ok(());
    }
    let mut updated = finalizers;
    updated.push(MACHINE_FINALIZER.to_string());
    let patch = json!({ "metadata": { "finalizers": updated } });
    api.patch(
        &machine.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<PoolMachine>, machine: &PoolMachine) -> Result<()> {
    let finalizers: Vec<String> = machine
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != MACHINE_FINALIZER)
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &machine.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Locate the host bound to this machine: by the attached-machine label,
/// falling back to a UID scan over MachineRefs (labels can go stale).
async fn find_attached_host(
    client: &Client,
    namespace: &str,
    machine: &PoolMachine,
) -> Result<Option<Host>> {
    let hosts: Api<Host> = Api::namespaced(client.clone(), namespace);
    let label = format!(
        "{}={}.{}",
        ATTACHED_MACHINE_LABEL,
        namespace,
        machine.name_any()
    );
    let by_label = hosts.list(&ListParams::default().labels(&label)).await?;
    if let Some(host) = by_label.items.into_iter().next() {
        return Ok(Some(host));
    }

    let machine_uid = machine.uid().unwrap_or_default();
    if machine_uid.is_empty() {
        return Ok(None);
    }
    let all = hosts.list(&ListParams::default()).await?;
    Ok(all.items.into_iter().find(|h| {
        h.status
            .as_ref()
            .and_then(|s| s.machine_ref.as_ref())
            .map(|r| r.uid == machine_uid)
            .unwrap_or(false)
    }))
}

async fn patch_machine_status(
    api: &Api<PoolMachine>,
    name: &str,
    status: serde_json::Value,
) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn set_machine_condition(
    api: &Api<PoolMachine>,
    machine: &PoolMachine,
    condition: Condition,
) -> Result<()> {
    let mut conditions = machine
        .status
        .clone()
        .unwrap_or_default()
        .conditions;
    // Rewriting an unchanged condition would bump the resource version and
    // retrigger this reconcile in a loop.
    if conditions.iter().any(|c| {
        c.type_ == condition.type_ && c.status == condition.status && c.reason == condition.reason
    }) {
        return Ok(());
    }
    crate::crd::types::set_condition(&mut conditions, condition);
    patch_machine_status(api, &machine.name_any(), json!({ "conditions": conditions })).await
}

async fn set_host_paused(
    client: &Client,
    namespace: &str,
    host: &Host,
    paused: bool,
) -> Result<()> {
    let hosts: Api<Host> = Api::namespaced(client.clone(), namespace);
    let value = if paused {
        serde_json::Value::String(String::new())
    } else {
        serde_json::Value::Null
    };
    let patch = json!({ "metadata": { "annotations": { PAUSED_ANNOTATION: value } } });
    hosts
        .patch(&host.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn reconcile_normal(
    machine: &PoolMachine,
    namespace: &str,
    api: &Api<PoolMachine>,
    ctx: &Context,
) -> Result<Action> {
    let name = machine.name_any();

    let external = fetch_external_refs(&ctx.client, namespace, machine).await?;
    let Some(external) = external else {
        info!("waiting for the cluster manager to set the owner Machine");
        return Ok(Action::await_change());
    };

    let attached = find_attached_host(&ctx.client, namespace, machine).await?;

    // Paused clusters park everything: mark the host, mark the condition,
    // and do nothing else until unpaused.
    let machine_paused = machine.annotations().contains_key(PAUSED_ANNOTATION);
    if external.paused || machine_paused {
        info!("machine or owning cluster is paused, skipping reconcile");
        if let Some(host) = &attached {
            set_host_paused(&ctx.client, namespace, host, true).await?;
        }
        set_machine_condition(
            api,
            machine,
            Condition::new(
                HOST_READY_CONDITION,
                ConditionStatus::False,
                PAUSED_REASON,
                "",
            ),
        )
        .await?;
        return Ok(Action::await_change());
    }
    if let Some(host) = &attached {
        set_host_paused(&ctx.client, namespace, host, false).await?;
    }

    // Remediation bypass: the health checker gave up on this machine and
    // the node is already gone, so skip straight to cleanup.
    if machine.annotations().contains_key(REMEDIATION_ANNOTATION) {
        if let Some(host) = &attached {
            if node_absent_or_deleting(ctx, namespace, external.cluster_name.as_deref(), host)
                .await
            {
                info!("machine under remediation with node absent, requesting host cleanup");
                mark_host_for_cleanup(&ctx.client, namespace, host).await?;
                return Ok(Action::requeue(REQUEUE_DELAY));
            }
        }
    }

    if !external.infrastructure_ready {
        info!("cluster infrastructure is not ready yet");
        set_machine_condition(
            api,
            machine,
            Condition::new(
                HOST_READY_CONDITION,
                ConditionStatus::False,
                "WaitingForClusterInfrastructure",
                "",
            ),
        )
        .await?;
        return Ok(Action::await_change());
    }

    // Kubeadm joins need the cluster manager's bootstrap secret before a
    // host is worth claiming; TLS bootstrap mints its own.
    if machine.spec.join_mode != JoinMode::TlsBootstrap
        && external.bootstrap_secret_name.is_none()
    {
        info!("bootstrap data secret not available yet");
        set_machine_condition(
            api,
            machine,
            Condition::new(
                HOST_READY_CONDITION,
                ConditionStatus::False,
                BOOTSTRAP_SECRET_UNAVAILABLE_REASON,
                "",
            ),
        )
        .await?;
        return Ok(Action::await_change());
    }

    let host = match attached {
        Some(host) => host,
        None => {
            info!("attempting host reservation");
            match claim_host(machine, namespace, &external, ctx).await? {
                Some(host) => {
                    info!(host = %host.name_any(), "host attached");
                    host
                }
                None => {
                    set_machine_condition(
                        api,
                        machine,
                        Condition::new(
                            HOST_READY_CONDITION,
                            ConditionStatus::False,
                            HOSTS_UNAVAILABLE_REASON,
                            "no available host matched selection",
                        ),
                    )
                    .await?;
                    return Ok(Action::requeue(REQUEUE_DELAY));
                }
            }
        }
    };

    // Relay the installation secret once.
    if let (Some(installer), None) = (
        machine.spec.installation_secret_ref.as_ref(),
        host.spec.installation_secret.as_ref(),
    ) {
        let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), namespace);
        let patch = json!({ "spec": { "installationSecret": installer } });
        hosts
            .patch(&host.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    // Mirror host details once known.
    let host_info = host.status.as_ref().and_then(|s| s.host_details.clone());
    if machine
        .status
        .as_ref()
        .and_then(|s| s.host_info.as_ref())
        .is_none()
    {
        if let Some(details) = host_info {
            patch_machine_status(api, &name, json!({ "hostInfo": details })).await?;
        }
    }

    update_node_provider_id(machine, namespace, api, ctx, &external, &host).await
}

async fn node_absent_or_deleting(
    ctx: &Context,
    namespace: &str,
    cluster_name: Option<&str>,
    host: &Host,
) -> bool {
    let Some(cluster) = cluster_name else {
        return false;
    };
    let Ok(remote) = workload_client(&ctx.client, namespace, cluster).await else {
        return false;
    };
    let nodes: Api<Node> = Api::all(remote);
    match nodes.get(&host.name_any()).await {
        Ok(node) => node.metadata.deletion_timestamp.is_some(),
        Err(kube::Error::Api(ae)) if ae.code == 404 => true,
        Err(_) => false,
    }
}

/// Once the agent reports the node bootstrapped, stamp the provider ID on
/// the workload Node and mark the machine ready.
async fn update_node_provider_id(
    machine: &PoolMachine,
    namespace: &str,
    api: &Api<PoolMachine>,
    ctx: &Context,
    external: &ExternalRefs,
    host: &Host,
) -> Result<Action> {
    let name = machine.name_any();
    let host_name = host.name_any();

    // Already converged: re-patching would churn the status forever.
    let expected = generate_provider_id(&host_name);
    let already_ready = machine.status.as_ref().map(|s| s.ready).unwrap_or(false);
    if already_ready && machine.spec.provider_id.as_deref() == Some(expected.as_str()) {
        debug!("machine already ready");
        return Ok(Action::await_change());
    }

    let bootstrapped = host
        .status
        .as_ref()
        .map(|s| condition_is_true(&s.conditions, NODE_BOOTSTRAPPED_CONDITION))
        .unwrap_or(false);
    if !bootstrapped {
        debug!("waiting for the agent to bootstrap the node");
        set_machine_condition(
            api,
            machine,
            Condition::new(
                HOST_READY_CONDITION,
                ConditionStatus::False,
                WAITING_FOR_NODE_REASON,
                format!("waiting for node {} to bootstrap", host_name),
            ),
        )
        .await?;
        return Ok(Action::requeue(REQUEUE_DELAY));
    }

    let Some(cluster_name) = external.cluster_name.as_deref() else {
        return Ok(Action::requeue(REQUEUE_DELAY));
    };
    let remote = workload_client(&ctx.client, namespace, cluster_name).await?;
    let nodes: Api<Node> = Api::all(remote);

    let node = match nodes.get(&host_name).await {
        Ok(node) => node,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            // Expected while the kubelet is still registering.
            info!(node = %host_name, "node not found yet, waiting for kubelet registration");
            set_machine_condition(
                api,
                machine,
                Condition::new(
                    HOST_READY_CONDITION,
                    ConditionStatus::False,
                    WAITING_FOR_NODE_REASON,
                    format!("waiting for node {} to register", host_name),
                ),
            )
            .await?;
            return Ok(Action::requeue(REQUEUE_DELAY));
        }
        Err(e) => return Err(Error::Kube(e)),
    };

    let current = node.spec.as_ref().and_then(|s| s.provider_id.clone());
    let provider_id = match current.as_deref() {
        None | Some("") => {
            nodes
                .patch(
                    &host_name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({ "spec": { "providerID": expected } })),
                )
                .await?;
            info!(provider_id = %expected, "patched node provider ID");
            expected
        }
        Some(existing) if validate_provider_id(existing, &host_name) => existing.to_string(),
        Some(existing) => {
            return Err(Error::validation(format!(
                "node {} carries malformed providerID {:?} (expected {})",
                host_name, existing, expected
            )));
        }
    };

    // Provider ID lands on the machine spec; readiness, node ref and
    // addresses land on the status.
    if machine.spec.provider_id.as_deref() != Some(provider_id.as_str()) {
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "providerID": provider_id } })),
        )
        .await?;
    }

    let addresses = addresses_from_network(
        &host.status.as_ref().map(|s| s.network.clone()).unwrap_or_default(),
    );
    let node_ref = ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(host_name.clone()),
        ..Default::default()
    };
    let mut conditions = machine.status.clone().unwrap_or_default().conditions;
    crate::crd::types::set_condition(&mut conditions, Condition::true_(HOST_READY_CONDITION));
    patch_machine_status(
        api,
        &name,
        json!({
            "ready": true,
            "nodeRef": node_ref,
            "addresses": addresses,
            "conditions": conditions,
        }),
    )
    .await?;

    debug!("machine ready");
    Ok(Action::await_change())
}

// =============================================================================
// Claim arbitration
// =============================================================================

async fn mark_host_for_cleanup(client: &Client, namespace: &str, host: &Host) -> Result<()> {
    let hosts: Api<Host> = Api::namespaced(client.clone(), namespace);
    let name = host.name_any();

    // The annotation is the signal; clearing MachineRef immediately lets
    // the agent delete the node while the binding is still fresh.
    let patch = json!({ "metadata": { "annotations": { HOST_CLEANUP_ANNOTATION: "" } } });
    hosts
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    hosts
        .patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "machineRef": null } })),
        )
        .await?;
    Ok(())
}

async fn claim_host(
    machine: &PoolMachine,
    namespace: &str,
    external: &ExternalRefs,
    ctx: &Context,
) -> Result<Option<Host>> {
    let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), namespace);
    let selector = selector_string(machine.spec.selector.as_ref());
    let listed = hosts
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    if listed.is_empty() {
        warn!("no hosts matched selection");
        return Ok(None);
    }

    let cluster_name = external.cluster_name.clone().unwrap_or_default();
    // The lease identity is per (replica, machine): a replica claiming for
    // two machines concurrently must not treat its own other lease as free.
    let holder = format!("{}/{}", ctx.controller_id, machine.name_any());

    for attempt in 0..MAX_CLAIM_ATTEMPTS {
        tokio::time::sleep(claim_backoff(attempt)).await;

        let selected_name = {
            let mut cursors = ctx.round_robin.lock().expect("cursor lock poisoned");
            match select_host(
                &listed,
                &cluster_name,
                machine.spec.capacity_requirements.as_ref(),
                &mut cursors,
            ) {
                Some(host) => host.name_any(),
                None => return Ok(None),
            }
        };

        // Work from the latest version; the listed copy may be stale.
        let mut latest = match hosts.get(&selected_name).await {
            Ok(host) => host,
            Err(e) => {
                warn!(host = %selected_name, error = %e, "failed to re-fetch host");
                continue;
            }
        };

        // Stale-binding recovery: a MachineRef pointing at a deleted
        // machine is healed in place, then the claim proceeds.
        if let Some(machine_ref) = latest.status.as_ref().and_then(|s| s.machine_ref.clone()) {
            let machines: Api<PoolMachine> =
                Api::namespaced(ctx.client.clone(), &machine_ref.namespace);
            match machines.get(&machine_ref.name).await {
                Ok(existing) if existing.metadata.deletion_timestamp.is_none() => {
                    debug!(host = %selected_name, "host already claimed, trying another");
                    continue;
                }
                Ok(_) => {
                    // Claimed by a machine already being deleted; proceed.
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    info!(
                        host = %selected_name,
                        stale_machine = %machine_ref.name,
                        "clearing stale MachineRef from deleted machine"
                    );
                    hosts
                        .patch_status(
                            &selected_name,
                            &PatchParams::default(),
                            &Patch::Merge(&json!({ "status": { "machineRef": null } })),
                        )
                        .await?;
                    latest = match hosts.get(&selected_name).await {
                        Ok(host) => host,
                        Err(e) => {
                            warn!(host = %selected_name, error = %e, "re-fetch after heal failed");
                            continue;
                        }
                    };
                }
                Err(e) => {
                    warn!(host = %selected_name, error = %e, "failed to check claiming machine");
                    continue;
                }
            }
        }

        // Someone else's live lease: skip without contesting.
        if let Some(raw) = latest.annotations().get(HOST_LEASE_ANNOTATION) {
            if let Some(lease) = parse_lease(raw) {
                if lease_is_live(&lease, Utc::now()) && lease.holder != holder {
                    debug!(host = %selected_name, holder = %lease.holder, "host leased, trying another");
                    continue;
                }
            }
        }

        // Acquire the lease with a full update: the resource version makes
        // this a compare-and-set, so exactly one replica wins.
        let lease = LeaseInfo {
            holder: holder.clone(),
            acquire_time: Utc::now(),
            machine_name: machine.name_any(),
        };
        let mut leased = latest.clone();
        leased
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                HOST_LEASE_ANNOTATION.to_string(),
                serde_json::to_string(&lease)
                    .map_err(|e| Error::serialization(e.to_string()))?,
            );
        let leased = match hosts
            .replace(&selected_name, &PostParams::default(), &leased)
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(host = %selected_name, "lost lease race, trying another");
                continue;
            }
            Err(e) => {
                warn!(host = %selected_name, error = %e, "lease update failed");
                continue;
            }
        };

        // Lease held; write the binding.
        match bind_host(machine, namespace, external, ctx, leased).await {
            Ok(bound) => {
                release_lease(&hosts, &bound.name_any()).await;
                return Ok(Some(bound));
            }
            Err(e) => {
                warn!(host = %selected_name, error = %e, "binding failed, releasing lease");
                release_lease(&hosts, &selected_name).await;
                continue;
            }
        }
    }

    warn!("failed to attach a host after {} attempts", MAX_CLAIM_ATTEMPTS);
    Ok(None)
}

async fn release_lease(hosts: &Api<Host>, name: &str) {
    let patch = json!({ "metadata": { "annotations": { HOST_LEASE_ANNOTATION: null } } });
    if let Err(e) = hosts
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        // Not fatal: the lease expires on its own after the TTL.
        warn!(host = %name, error = %e, "failed to release lease");
    }
}

async fn bind_host(
    machine: &PoolMachine,
    namespace: &str,
    external: &ExternalRefs,
    ctx: &Context,
    mut host: Host,
) -> Result<Host> {
    let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), namespace);
    let host_name = host.name_any();
    let machine_name = machine.name_any();
    let cluster_name = external.cluster_name.clone().unwrap_or_default();

    // Bootstrap secret: minted for TLS bootstrap, relayed for kubeadm.
    let bootstrap_secret = match machine.spec.join_mode {
        JoinMode::TlsBootstrap => {
            let secret = create_tls_bootstrap_secret(machine, namespace, external, ctx, &host)
                .await?;
            SecretRef {
                namespace: namespace.to_string(),
                name: secret,
            }
        }
        JoinMode::Kubeadm => SecretRef {
            namespace: namespace.to_string(),
            name: external.bootstrap_secret_name.clone().ok_or_else(|| {
                Error::bootstrap("bootstrap data secret disappeared during claim")
            })?,
        },
    };

    let labels = host.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name);
    labels.insert(
        ATTACHED_MACHINE_LABEL.to_string(),
        format!("{}.{}", namespace, machine_name),
    );

    let annotations = host
        .metadata
        .annotations
        .get_or_insert_with(Default::default);
    if let Some(endpoint) = &external.endpoint_host {
        annotations.insert(ENDPOINT_HOST_ANNOTATION.to_string(), endpoint.clone());
    }
    if let Some(version) = &external.version {
        annotations.insert(
            K8S_VERSION_ANNOTATION.to_string(),
            strip_build_metadata(version).to_string(),
        );
    }
    if let Some(registry) = &external.bundle_registry {
        annotations.insert(BUNDLE_REGISTRY_ANNOTATION.to_string(), registry.clone());
    }

    host.spec.join_mode = machine.spec.join_mode;
    host.spec.download_mode = machine.spec.download_mode;
    host.spec.kubernetes_version = machine
        .spec
        .kubernetes_version
        .clone()
        .or_else(|| external.version.clone());
    // TLS bootstrap defaults to agent-managed kube-proxy.
    host.spec.manage_kube_proxy =
        machine.spec.manage_kube_proxy || machine.spec.join_mode == JoinMode::TlsBootstrap;
    host.spec.bootstrap_secret = Some(bootstrap_secret);

    let replaced = hosts
        .replace(&host_name, &PostParams::default(), &host)
        .await?;

    let machine_ref = MachineRef {
        api_version: PoolMachine::api_version(&()).to_string(),
        kind: PoolMachine::kind(&()).to_string(),
        namespace: namespace.to_string(),
        name: machine_name,
        uid: machine.uid().unwrap_or_default(),
    };
    hosts
        .patch_status(
            &host_name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "machineRef": machine_ref } })),
        )
        .await?;

    hosts.get(&host_name).await.map_err(Error::Kube)
}

async fn create_tls_bootstrap_secret(
    machine: &PoolMachine,
    namespace: &str,
    external: &ExternalRefs,
    ctx: &Context,
    host: &Host,
) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let name = format!("{}-tls-bootstrap", machine.name_any());

    // Referenced credential data, if the user pinned one.
    let credential_kubeconfig = match &machine.spec.bootstrap_credential_ref {
        Some(cred_ref) => {
            let creds: Api<crate::crd::BootstrapCredential> = Api::namespaced(
                ctx.client.clone(),
                cred_ref.namespace.as_deref().unwrap_or(namespace),
            );
            match creds.get(cred_ref.name.as_deref().unwrap_or_default()).await {
                Ok(cred) => cred.status.and_then(|s| s.bootstrap_kubeconfig_data),
                Err(e) => {
                    warn!(error = %e, "referenced bootstrap credential unavailable");
                    None
                }
            }
        }
        None => None,
    };

    // The machine's kubeadm secret can still donate kubelet config and CA.
    let machine_secret_data = match &external.bootstrap_secret_name {
        Some(secret_name) => match secrets.get(secret_name).await {
            Ok(secret) => secret.data,
            Err(_) => None,
        },
        None => None,
    };

    // Always a fresh token for TLS bootstrap: reused published credentials
    // go stale and fail joins.
    let token = BootstrapToken::generate();
    let token_secret = token.into_secret(TOKEN_TTL);
    let token_secrets: Api<Secret> =
        Api::namespaced(ctx.client.clone(), crate::bootstrap::token::TOKEN_NAMESPACE);
    match token_secrets.create(&PostParams::default(), &token_secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    let api_server = match &external.endpoint_host {
        Some(host) => format!("https://{}:6443", host),
        None => host
            .annotations()
            .get(ENDPOINT_HOST_ANNOTATION)
            .map(|h| format!("https://{}:6443", h))
            .unwrap_or_else(|| "https://127.0.0.1:6443".to_string()),
    };
    let local_ca_pem = tokio::fs::read(SERVICE_ACCOUNT_CA_PATH).await.ok();

    let reader = match external.cluster_name.as_deref() {
        Some(cluster) => workload_client(&ctx.client, namespace, cluster)
            .await
            .ok()
            .map(RemoteConfigReader::new),
        None => None,
    };

    let assembly = assemble_tls_bootstrap(
        reader.as_ref().map(|r| r as &dyn crate::bootstrap::ClusterConfigReader),
        TlsBootstrapInputs {
            credential_kubeconfig,
            machine_secret_data: machine_secret_data.as_ref(),
            api_server,
            token: &token,
            local_ca_pem,
            kubernetes_version: external.version.as_deref(),
        },
    )
    .await;

    let owner = OwnerReference {
        api_version: PoolMachine::api_version(&()).to_string(),
        kind: PoolMachine::kind(&()).to_string(),
        name: machine.name_any(),
        uid: machine.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };
    let secret = assembly.into_secret(&name, namespace, owner)?;

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            // Rebind: refresh the payload in place so the token is current.
            let existing = secrets.get(&name).await?;
            let mut replacement = secret;
            replacement.metadata.resource_version = existing.metadata.resource_version;
            secrets
                .replace(&name, &PostParams::default(), &replacement)
                .await?;
        }
        Err(e) => return Err(Error::Kube(e)),
    }

    info!(secret = %name, "created TLS bootstrap secret");
    Ok(name)
}

// =============================================================================
// Deletion
// =============================================================================

async fn reconcile_delete(
    machine: &PoolMachine,
    namespace: &str,
    api: &Api<PoolMachine>,
    ctx: &Context,
) -> Result<Action> {
    let name = machine.name_any();
    info!("deleting machine");

    if let Some(host) = find_attached_host(&ctx.client, namespace, machine).await? {
        let cleanup_requested = host
            .annotations()
            .contains_key(HOST_CLEANUP_ANNOTATION);

        if !cleanup_requested {
            info!(host = %host.name_any(), "releasing host");
            mark_host_for_cleanup(&ctx.client, namespace, &host).await?;
            patch_machine_status(api, &name, json!({ "cleanupStarted": true })).await?;
            return Ok(Action::requeue(REQUEUE_DELAY));
        }

        // Cleanup is underway: wait for the agent, bounded by the host's
        // cleanup timeout (the host controller enforces the same bound).
        if host
            .status
            .as_ref()
            .and_then(|s| s.machine_ref.as_ref())
            .is_some()
        {
            let timeout = cleanup_timeout(&host.spec.capacity);
            let elapsed = cleanup_observed_at(&host)
                .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
                .unwrap_or_default();
            if elapsed <= timeout {
                debug!(?elapsed, ?timeout, "waiting for agent cleanup");
                return Ok(Action::requeue(REQUEUE_DELAY));
            }
            warn!(?elapsed, ?timeout, "cleanup timeout exceeded, finalizing anyway");
        }
    }

    patch_machine_status(
        api,
        &name,
        json!({ "cleanupCompleted": true, "nodeRef": null }),
    )
    .await?;
    remove_finalizer(api, machine).await?;
    info!("machine finalized");
    Ok(Action::await_change())
}

/// Error policy for the machine controller.
pub fn error_policy(machine: Arc<PoolMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, machine = %machine.name_any(), "machine reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{HostSpec, HostStatus};
    use kube::core::ObjectMeta;

    fn host(name: &str, priority: Option<i32>) -> Host {
        Host {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: HostSpec {
                priority,
                ..Default::default()
            },
            status: None,
        }
    }

    fn claimed(mut h: Host) -> Host {
        h.status = Some(HostStatus {
            machine_ref: Some(MachineRef {
                name: "owner".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        h
    }

    // =========================================================================
    // Selection stories
    // =========================================================================
    //
    // Selection feeds the claim loop. Fairness comes from the per-cluster
    // round-robin cursor; correctness comes from the availability and
    // priority filters.

    /// Round-robin rotates through the available hosts of one cluster.
    #[test]
    fn round_robin_rotates_over_the_pool() {
        let hosts = vec![host("h1", None), host("h2", None), host("h3", None)];
        let mut cursors = HashMap::new();

        let picks: Vec<String> = (0..4)
            .map(|_| {
                select_host(&hosts, "cluster-a", None, &mut cursors)
                    .unwrap()
                    .name_any()
            })
            .collect();

        assert_eq!(picks, ["h1", "h2", "h3", "h1"]);
    }

    /// Each cluster gets its own cursor; one cluster's claims do not skew
    /// another's rotation.
    #[test]
    fn cursors_are_per_cluster() {
        let hosts = vec![host("h1", None), host("h2", None)];
        let mut cursors = HashMap::new();

        assert_eq!(
            select_host(&hosts, "a", None, &mut cursors).unwrap().name_any(),
            "h1"
        );
        assert_eq!(
            select_host(&hosts, "b", None, &mut cursors).unwrap().name_any(),
            "h1"
        );
        assert_eq!(
            select_host(&hosts, "a", None, &mut cursors).unwrap().name_any(),
            "h2"
        );
    }

    /// Only the top priority tier is eligible; lower tiers wait until the
    /// higher tier drains.
    #[test]
    fn selection_retains_only_top_priority() {
        let hosts = vec![host("low", Some(0)), host("high", Some(10)), host("mid", Some(5))];
        let mut cursors = HashMap::new();

        for _ in 0..3 {
            assert_eq!(
                select_host(&hosts, "a", None, &mut cursors).unwrap().name_any(),
                "high"
            );
        }
    }

    /// Claimed hosts are invisible to selection.
    #[test]
    fn selection_skips_claimed_hosts() {
        let hosts = vec![claimed(host("h1", None)), host("h2", None)];
        let mut cursors = HashMap::new();

        assert_eq!(
            select_host(&hosts, "a", None, &mut cursors).unwrap().name_any(),
            "h2"
        );
    }

    /// An empty pool yields None and leaves every cursor untouched.
    #[test]
    fn empty_pool_does_not_advance_cursors() {
        let hosts = vec![claimed(host("h1", None))];
        let mut cursors = HashMap::new();

        assert!(select_host(&hosts, "a", None, &mut cursors).is_none());
        assert!(cursors.is_empty());
    }

    /// Capacity requirements filter before priority: a high-priority host
    /// that is too small never wins.
    #[test]
    fn capacity_filter_applies_before_priority() {
        let mut big = host("big", Some(0));
        big.spec
            .capacity
            .insert("cpu".to_string(), Quantity("16".to_string()));
        let small = host("small", Some(10));

        let mut req = BTreeMap::new();
        req.insert("cpu".to_string(), Quantity("8".to_string()));

        let hosts = vec![small, big];
        let mut cursors = HashMap::new();
        assert_eq!(
            select_host(&hosts, "a", Some(&req), &mut cursors)
                .unwrap()
                .name_any(),
            "big"
        );
    }

    // =========================================================================
    // Lease stories
    // =========================================================================
    //
    // Lease safety (invariant 5): between acquisition and release no other
    // replica binds the host. Liveness checks are what keep a crashed
    // replica from parking a host forever.

    /// A freshly acquired lease is live; one older than the TTL is not.
    #[test]
    fn lease_expires_after_ttl() {
        let lease = LeaseInfo {
            holder: "replica-1".to_string(),
            acquire_time: Utc::now(),
            machine_name: "m1".to_string(),
        };
        assert!(lease_is_live(&lease, Utc::now()));

        let expired = LeaseInfo {
            acquire_time: Utc::now() - chrono::Duration::seconds(HOST_LEASE_TTL_SECS + 1),
            ..lease
        };
        assert!(!lease_is_live(&expired, Utc::now()));
    }

    /// The lease payload round-trips through its JSON annotation encoding.
    #[test]
    fn lease_round_trips_through_json() {
        let lease = LeaseInfo {
            holder: "replica-1".to_string(),
            acquire_time: Utc::now(),
            machine_name: "m1".to_string(),
        };
        let raw = serde_json::to_string(&lease).unwrap();
        assert_eq!(parse_lease(&raw), Some(lease));
    }

    /// Garbage lease payloads read as absent, so a corrupted annotation can
    /// never deadlock a host.
    #[test]
    fn malformed_lease_counts_as_absent() {
        assert_eq!(parse_lease("not json"), None);
        assert_eq!(parse_lease("{}"), None);
    }

    // =========================================================================
    // Selector and address helpers
    // =========================================================================

    /// Every selection excludes hosts already labeled into a cluster.
    #[test]
    fn selector_always_excludes_clustered_hosts() {
        assert_eq!(selector_string(None), format!("!{}", CLUSTER_NAME_LABEL));
    }

    /// matchLabels and matchExpressions both render into list-API syntax.
    #[test]
    fn selector_renders_labels_and_expressions() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

        let selector = LabelSelector {
            match_labels: Some([("pool".to_string(), "gpu".to_string())].into_iter().collect()),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "zone".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["a".to_string(), "b".to_string()]),
            }]),
        };

        let rendered = selector_string(Some(&selector));
        assert!(rendered.contains("pool=gpu"));
        assert!(rendered.contains("zone in (a,b)"));
        assert!(rendered.ends_with(&format!("!{}", CLUSTER_NAME_LABEL)));
    }

    /// Host IPs (sans CIDR suffix) become ExternalIP machine addresses.
    #[test]
    fn addresses_drop_cidr_suffixes() {
        let network = vec![NetworkStatus {
            ip_addrs: vec!["192.168.1.5/24".to_string(), "fd00::5/64".to_string()],
            ..Default::default()
        }];

        let addresses = addresses_from_network(&network);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].address, "192.168.1.5");
        assert_eq!(addresses[0].type_, "ExternalIP");
        assert_eq!(addresses[1].address, "fd00::5");
    }

    #[test]
    fn version_build_metadata_is_stripped() {
        assert_eq!(strip_build_metadata("v1.31.2+vmware.1"), "v1.31.2");
        assert_eq!(strip_build_metadata("v1.31.2"), "v1.31.2");
    }

    /// Host events map back to the claiming machine for requeue, and
    /// unclaimed hosts map to nothing.
    #[test]
    fn host_events_map_to_claiming_machine() {
        let h = claimed_with("h1", "m7", "team-a");
        let mapped = host_to_machine(h).expect("claimed host maps");
        assert_eq!(mapped.name, "m7");
        assert_eq!(mapped.namespace.as_deref(), Some("team-a"));

        assert!(host_to_machine(host("h2", None)).is_none());
    }

    fn claimed_with(name: &str, machine: &str, namespace: &str) -> Host {
        let mut h = host(name, None);
        h.status = Some(HostStatus {
            machine_ref: Some(MachineRef {
                name: machine.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        h
    }
}
