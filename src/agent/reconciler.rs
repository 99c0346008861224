//! Agent-side host reconciler.
//!
//! Drives the host through its local state machine: wait for a claim,
//! install components, bootstrap the node (kubeadm or TLS-bootstrap), run,
//! and clean up on release. The agent deliberately holds no finalizer on
//! the Host: if it crashes mid-cleanup, the host controller's timeout
//! force-releases the host rather than leaving it stuck in deletion.
//!
//! Zombie detection runs on every pass: the machine UID persisted at
//! `/run/cluster-api/machine-id` is compared against the server-side
//! binding, catching both force-releases that happened while the agent was
//! down and rebinds to a new machine.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::cloudinit::{
    format_labels, format_taints, FileSpec, FileWriter, ScriptExecutor,
};
use super::cmd::CmdRunner;
use super::probe;
use crate::bootstrap::{
    default_kube_proxy_config, default_kubelet_config, extract_ca_from_kubeconfig,
    extract_token_from_kubeconfig, render_kube_proxy_kubeconfig, DEFAULT_CLUSTER_DNS,
};
use crate::crd::types::{
    condition_is_true, generate_provider_id, Condition, ConditionStatus,
    DownloadMode, JoinMode, ATTACHED_MACHINE_LABEL, BOOTSTRAP_FAILED_REASON,
    BOOTSTRAP_SECRET_UNAVAILABLE_REASON, BUNDLE_REGISTRY_ANNOTATION, CLEANUP_STARTED_ANNOTATION,
    CLUSTER_NAME_LABEL, COMPONENTS_INSTALLED_CONDITION, COMPONENTS_INSTALL_FAILED_REASON,
    ENDPOINT_HOST_ANNOTATION, HOST_CLEANUP_ANNOTATION,
    INSTALLATION_SECRET_UNAVAILABLE_REASON, K8S_VERSION_ANNOTATION, NODE_ABSENT_REASON,
    NODE_BOOTSTRAPPED_CONDITION, WAITING_FOR_CLAIM_REASON,
};
use crate::crd::Host;
use crate::{Error, Result};

/// File persisting the UID of the machine currently bound to this host.
pub const MACHINE_ID_FILE: &str = "/run/cluster-api/machine-id";

/// Sentinel that must be absent for a fresh bootstrap to run.
pub const BOOTSTRAP_SENTINEL_FILE: &str = "/run/cluster-api/bootstrap-success.complete";

/// Command that reverses a kubeadm join.
pub const KUBEADM_RESET_COMMAND: &str = "kubeadm reset --force";

const INSTALL_ATTEMPTS: u32 = 3;
const INSTALL_RETRY_DELAY: Duration = Duration::from_secs(10);
const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Config and state files removed during node reset.
const FILES_TO_REMOVE: [&str; 8] = [
    "/etc/kubernetes/bootstrap-kubeconfig",
    "/etc/kubernetes/kubelet.conf",
    "/etc/kubernetes/pki/ca.crt",
    "/etc/kubernetes/kube-proxy.kubeconfig",
    "/var/lib/kubelet/config.yaml",
    "/var/lib/kube-proxy/kube-proxy-config.yaml",
    "/etc/systemd/system/kubelet.service",
    "/etc/systemd/system/kube-proxy.service",
];

/// Directories removed during node reset.
const DIRS_TO_REMOVE: [&str; 8] = [
    "/var/lib/kubelet",
    "/var/lib/kube-proxy",
    "/var/lib/etcd",
    "/etc/kubernetes",
    "/run/kubernetes",
    "/var/lib/cni",
    "/etc/cni",
    "/opt/cni",
];

/// Directories glob-cleared before a fresh bootstrap.
const STALE_DIR_GLOBS: [&str; 2] = ["/run/kubeadm", "/etc/cni/net.d"];

// =============================================================================
// Context and failure classification
// =============================================================================

/// Shared state for the agent reconciler.
pub struct AgentContext {
    /// Management-cluster client
    pub client: Client,
    /// This host's name
    pub host_name: String,
    /// Namespace of the Host object
    pub namespace: String,
    /// Shell runner for scripts and systemctl
    pub cmd_runner: Arc<dyn CmdRunner>,
    /// File writer for configs and units
    pub file_writer: Arc<dyn FileWriter>,
    /// Bundle download path substituted into scripts
    pub download_path: String,
    /// Skip component installation entirely (pre-provisioned hosts)
    pub skip_installation: bool,
}

/// A cleanup step failure, classified at the point where the step's
/// meaning is known: permanent failures are logged and cleanup proceeds
/// (release must never be blocked); transient ones requeue the reconcile.
#[derive(Debug)]
pub struct CleanupFailure {
    /// What failed
    pub message: String,
    /// Whether retrying can possibly help
    pub permanent: bool,
}

impl CleanupFailure {
    /// A failure retries cannot fix (node already gone, binaries missing).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    /// A failure worth retrying (API hiccup, busy service).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.permanent { "permanent" } else { "transient" };
        write!(f, "{} cleanup failure: {}", kind, self.message)
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile this agent's Host object.
#[instrument(skip(host, ctx), fields(host = %host.name_any()))]
pub async fn reconcile(host: Arc<Host>, ctx: Arc<AgentContext>) -> Result<Action> {
    // Cleanup requested by the machine controller, or the Host object is
    // being deleted outright: either way the node leaves the cluster.
    let cleanup_requested = host.annotations().contains_key(HOST_CLEANUP_ANNOTATION)
        || host.metadata.deletion_timestamp.is_some();
    if cleanup_requested {
        return match host_cleanup(&host, &ctx).await {
            Ok(()) => Ok(Action::await_change()),
            Err(failure) if failure.permanent => {
                warn!(%failure, "cleanup failed permanently, releasing host anyway");
                clear_host_binding(&host, &ctx).await?;
                Ok(Action::await_change())
            }
            Err(failure) => {
                warn!(%failure, "cleanup failed, will retry");
                Ok(Action::requeue(CLEANUP_RETRY_DELAY))
            }
        };
    }

    reconcile_normal(&host, &ctx).await
}

async fn reconcile_normal(host: &Host, ctx: &AgentContext) -> Result<Action> {
    let machine_ref = host.status.as_ref().and_then(|s| s.machine_ref.clone());
    let conditions = host
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let Some(machine_ref) = machine_ref else {
        // Zombie check: no binding but local state says bootstrapped means
        // the controller force-released us while we were not looking.
        if condition_is_true(&conditions, NODE_BOOTSTRAPPED_CONDITION)
            || condition_is_true(&conditions, COMPONENTS_INSTALLED_CONDITION)
        {
            info!("binding cleared while bootstrapped, running self-cleanup");
            return match host_cleanup(host, ctx).await {
                Ok(()) => Ok(Action::await_change()),
                Err(failure) if failure.permanent => {
                    warn!(%failure, "self-cleanup failed permanently, continuing");
                    clear_host_binding(host, ctx).await?;
                    Ok(Action::await_change())
                }
                Err(failure) => {
                    warn!(%failure, "self-cleanup failed, will retry");
                    Ok(Action::requeue(CLEANUP_RETRY_DELAY))
                }
            };
        }

        debug!("waiting for a machine to claim this host");
        set_host_condition(
            host,
            ctx,
            Condition::new(
                NODE_BOOTSTRAPPED_CONDITION,
                ConditionStatus::False,
                WAITING_FOR_CLAIM_REASON,
                "",
            ),
        )
        .await?;
        return Ok(Action::await_change());
    };

    if host.spec.bootstrap_secret.is_none() {
        debug!("bootstrap secret not relayed yet");
        set_host_condition(
            host,
            ctx,
            Condition::new(
                NODE_BOOTSTRAPPED_CONDITION,
                ConditionStatus::False,
                BOOTSTRAP_SECRET_UNAVAILABLE_REASON,
                "",
            ),
        )
        .await?;
        return Ok(Action::await_change());
    }

    // Rebind check: a persisted UID differing from the binding means this
    // host missed a cleanup (agent downtime) and carries another machine's
    // state. Reset locally, then bootstrap fresh for the new machine.
    if let Ok(saved) = tokio::fs::read_to_string(MACHINE_ID_FILE).await {
        let saved = saved.trim();
        if !saved.is_empty() && saved != machine_ref.uid {
            info!(
                old_uid = %saved,
                new_uid = %machine_ref.uid,
                "bound machine changed while agent was away, resetting local state"
            );
            if let Err(failure) = local_reset(host, ctx).await {
                if !failure.permanent {
                    warn!(%failure, "local reset failed, will retry");
                    return Ok(Action::requeue(CLEANUP_RETRY_DELAY));
                }
                warn!(%failure, "local reset failed permanently, continuing");
            }
            set_host_condition(
                host,
                ctx,
                Condition::new(
                    NODE_BOOTSTRAPPED_CONDITION,
                    ConditionStatus::False,
                    NODE_ABSENT_REASON,
                    "",
                ),
            )
            .await?;
            set_host_condition(
                host,
                ctx,
                Condition::new(
                    COMPONENTS_INSTALLED_CONDITION,
                    ConditionStatus::False,
                    NODE_ABSENT_REASON,
                    "",
                ),
            )
            .await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    if condition_is_true(&conditions, NODE_BOOTSTRAPPED_CONDITION) {
        // Running. Handle the manage-kube-proxy flag flipping on late.
        if host.spec.join_mode == JoinMode::TlsBootstrap && host.spec.manage_kube_proxy {
            if let Err(e) = start_kube_proxy_if_needed(host, ctx).await {
                warn!(error = %e, "failed to ensure kube-proxy running");
            }
        }
        return Ok(Action::await_change());
    }

    // Fetch the bootstrap payload up front; everything below needs it.
    let Some(secret_ref) = host.spec.bootstrap_secret.as_ref() else {
        return Ok(Action::await_change());
    };
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &secret_ref.namespace);
    let bootstrap_secret = secrets.get(&secret_ref.name).await.map_err(|e| {
        warn!(secret = %secret_ref.name, error = %e, "bootstrap secret unreadable");
        Error::Kube(e)
    })?;
    let secret_data = bootstrap_secret.data.unwrap_or_default();

    // Install components unless told not to.
    if ctx.skip_installation {
        info!("skipping kubernetes component installation");
    } else if !condition_is_true(&conditions, COMPONENTS_INSTALLED_CONDITION) {
        match &host.spec.installation_secret {
            None => {
                // Offline TLS-bootstrap hosts come with binaries in place.
                if host.spec.join_mode == JoinMode::TlsBootstrap
                    && host.spec.download_mode == DownloadMode::Offline
                {
                    info!("offline TLS-bootstrap host, skipping installation");
                    set_host_condition(
                        host,
                        ctx,
                        Condition::true_(COMPONENTS_INSTALLED_CONDITION),
                    )
                    .await?;
                } else {
                    debug!("installation secret not relayed yet");
                    set_host_condition(
                        host,
                        ctx,
                        Condition::new(
                            COMPONENTS_INSTALLED_CONDITION,
                            ConditionStatus::False,
                            INSTALLATION_SECRET_UNAVAILABLE_REASON,
                            "",
                        ),
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
            }
            Some(installer_ref) => {
                if let Err(e) = install_components(host, ctx, installer_ref).await {
                    set_host_condition(
                        host,
                        ctx,
                        Condition::new(
                            COMPONENTS_INSTALLED_CONDITION,
                            ConditionStatus::False,
                            COMPONENTS_INSTALL_FAILED_REASON,
                            e.to_string(),
                        ),
                    )
                    .await?;
                    return Err(e);
                }
                info!("components installed");
                set_host_condition(host, ctx, Condition::true_(COMPONENTS_INSTALLED_CONDITION))
                    .await?;
            }
        }
    } else {
        debug!("components already installed");
    }

    // Stale kubeadm and CNI state from an earlier life breaks joins.
    clean_stale_dirs().await;

    let result = match host.spec.join_mode {
        JoinMode::Kubeadm => bootstrap_kubeadm(host, ctx, &secret_data).await,
        JoinMode::TlsBootstrap => bootstrap_tls(host, ctx, &secret_data).await,
    };
    if let Err(e) = result {
        error!(error = %e, "node bootstrap failed, resetting");
        if let Err(reset_err) = reset_node(host, ctx).await {
            warn!(error = %reset_err, "post-failure reset incomplete");
        }
        set_host_condition(
            host,
            ctx,
            Condition::new(
                NODE_BOOTSTRAPPED_CONDITION,
                ConditionStatus::False,
                BOOTSTRAP_FAILED_REASON,
                e.to_string(),
            ),
        )
        .await?;
        return Err(e);
    }

    info!("node bootstrapped");

    // Persist the binding UID so restarts and rebinds are detectable.
    if let Err(e) = persist_machine_id(&machine_ref.uid).await {
        warn!(error = %e, "failed to persist machine id");
    }

    set_host_condition(host, ctx, Condition::true_(NODE_BOOTSTRAPPED_CONDITION)).await?;

    // kubeadm join ignores provider-id flags on some versions; patch the
    // node directly through the local kubelet credentials so the
    // autoscaler mapping holds without waiting for the controller.
    if host.spec.join_mode == JoinMode::Kubeadm {
        if let Err(e) = patch_local_node_provider_id(&ctx.host_name).await {
            warn!(error = %e, "failed to patch local node provider id");
        }
    }

    if host.spec.join_mode == JoinMode::TlsBootstrap && host.spec.manage_kube_proxy {
        if let Err(e) = start_kube_proxy_if_needed(host, ctx).await {
            warn!(error = %e, "failed to start kube-proxy");
        }
    }

    Ok(Action::await_change())
}

/// Error policy for the agent reconciler.
pub fn error_policy(host: Arc<Host>, error: &Error, _ctx: Arc<AgentContext>) -> Action {
    error!(error = %error, host = %host.name_any(), "agent reconciliation failed");
    Action::requeue(Duration::from_secs(10))
}

// =============================================================================
// Installation
// =============================================================================

async fn install_components(
    host: &Host,
    ctx: &AgentContext,
    installer_ref: &crate::crd::types::SecretRef,
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &installer_ref.namespace);
    let secret = secrets.get(&installer_ref.name).await?;
    let data = secret.data.unwrap_or_default();

    let text = |key: &str| -> String {
        data.get(key)
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .unwrap_or_default()
    };
    let install_script = text("install");
    let uninstall_script = text("uninstall");
    if install_script.is_empty() {
        return Err(Error::bootstrap(format!(
            "installation secret {} has no install script",
            installer_ref.name
        )));
    }

    // Keep the uninstall script on the host object: the installation
    // secret may be gone by the time cleanup runs.
    if !uninstall_script.is_empty() {
        let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let patch = json!({ "spec": { "uninstallationScript": uninstall_script } });
        hosts
            .patch(&ctx.host_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    preflight_checks().await;

    let rendered = super::cloudinit::render_template(
        &install_script,
        &ctx.host_name,
        &ctx.download_path,
    );

    info!("executing install script");
    let mut last_err = None;
    for attempt in 1..=INSTALL_ATTEMPTS {
        match ctx.cmd_runner.run(&rendered).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "install script failed");
                last_err = Some(e);
                if attempt < INSTALL_ATTEMPTS {
                    tokio::time::sleep(INSTALL_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::command("install script failed")))
}

/// Warn about signs this host already belongs to a cluster. Warnings only:
/// re-installs over a half-torn-down node are legitimate.
async fn preflight_checks() {
    if Path::new("/etc/kubernetes/manifests/kube-apiserver.yaml").exists() {
        warn!("existing control-plane manifest found; host may already be part of a cluster");
    }
}

async fn clean_stale_dirs() {
    for dir in STALE_DIR_GLOBS {
        debug!(dir = %dir, "clearing stale directory contents");
        if let Err(e) = remove_dir_contents(dir).await {
            warn!(dir = %dir, error = %e, "failed to clear directory");
        }
    }
}

/// Remove every entry inside `dir`, leaving the directory itself.
async fn remove_dir_contents(dir: &str) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(e) = result {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Bootstrap: kubeadm path
// =============================================================================

async fn bootstrap_kubeadm(
    host: &Host,
    ctx: &AgentContext,
    secret_data: &std::collections::BTreeMap<String, k8s_openapi::ByteString>,
) -> Result<()> {
    info!("bootstrapping node via kubeadm cloud-init");

    if Path::new(BOOTSTRAP_SENTINEL_FILE).exists() {
        return Err(Error::bootstrap(
            "bootstrap sentinel already present; node was not cleaned up",
        ));
    }

    let doc = secret_data
        .get("value")
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        .ok_or_else(|| Error::bootstrap("bootstrap secret has no value key"))?;

    let executor = ScriptExecutor {
        file_writer: ctx.file_writer.clone(),
        cmd_runner: ctx.cmd_runner.clone(),
        hostname: ctx.host_name.clone(),
        labels: host.spec.node_labels.clone(),
        taints: host.spec.taints.clone(),
        download_path: ctx.download_path.clone(),
    };
    executor.execute(&doc).await
}

/// Patch the local Node's provider ID using the kubelet's own kubeconfig.
async fn patch_local_node_provider_id(host_name: &str) -> Result<()> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    let kubeconfig_path = "/etc/kubernetes/kubelet.conf";
    if !Path::new(kubeconfig_path).exists() {
        return Err(Error::bootstrap(format!(
            "kubelet kubeconfig not found at {}",
            kubeconfig_path
        )));
    }

    let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
        .map_err(|e| Error::serialization(format!("unreadable kubelet kubeconfig: {}", e)))?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::bootstrap(format!("unusable kubelet kubeconfig: {}", e)))?;
    let local_client = Client::try_from(config)?;

    let nodes: Api<Node> = Api::all(local_client);
    let node = nodes.get(host_name).await?;
    let provider_id = generate_provider_id(host_name);
    if node.spec.as_ref().and_then(|s| s.provider_id.as_deref()) == Some(provider_id.as_str()) {
        debug!("node provider id already set");
        return Ok(());
    }

    nodes
        .patch(
            host_name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "providerID": provider_id } })),
        )
        .await?;
    info!(provider_id = %provider_id, "patched local node provider id");
    Ok(())
}

// =============================================================================
// Bootstrap: TLS path
// =============================================================================

/// Conventional locations CA bundles get mirrored to; best-effort writes.
const CA_PATHS: [&str; 4] = [
    "/etc/kubernetes/pki/ca.crt",
    "/etc/kubernetes/ssl/ca.pem",
    "/etc/kubernetes/pki/ca-certificates.crt",
    "/etc/ssl/certs/ca-certificates.crt",
];

/// Build the kubelet arguments for TLS-bootstrap mode.
pub fn kubelet_args(host: &Host, host_name: &str) -> Vec<String> {
    let mut args = vec![
        "--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubeconfig".to_string(),
        "--kubeconfig=/etc/kubernetes/kubelet.conf".to_string(),
        "--cert-dir=/var/lib/kubelet/pki".to_string(),
        "--config=/var/lib/kubelet/config.yaml".to_string(),
        "--rotate-certificates=true".to_string(),
        "--rotate-server-certificates=true".to_string(),
        "--pod-manifest-path=/etc/kubernetes/manifests".to_string(),
        format!("--provider-id={}", generate_provider_id(host_name)),
    ];
    if !host.spec.node_labels.is_empty() {
        args.push(format!("--node-labels={}", format_labels(&host.spec.node_labels)));
    }
    if !host.spec.taints.is_empty() {
        args.push(format!("--register-with-taints={}", format_taints(&host.spec.taints)));
    }
    args
}

/// Render the kubelet systemd unit.
pub fn kubelet_unit(args: &[String]) -> String {
    format!(
        "[Unit]\n\
         Description=kubelet: The Kubernetes Node Agent\n\
         Documentation=https://kubernetes.io/docs/home/\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart=/usr/local/bin/kubelet {}\n\
         Restart=always\n\
         StartLimitInterval=0\n\
         RestartSec=10\n\
         WorkingDirectory=/var/lib/kubelet\n\
         CPUAccounting=true\n\
         MemoryAccounting=true\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        args.join(" ")
    )
}

/// Render the kube-proxy systemd unit.
pub fn kube_proxy_unit() -> String {
    "[Unit]\n\
     Description=kube-proxy: The Kubernetes Network Proxy\n\
     Documentation=https://kubernetes.io/docs/home/\n\
     Wants=network-online.target\n\
     After=network-online.target\n\
     \n\
     [Service]\n\
     ExecStart=/usr/local/bin/kube-proxy --config=/var/lib/kube-proxy/kube-proxy-config.yaml\n\
     Restart=always\n\
     StartLimitInterval=0\n\
     RestartSec=10\n\
     \n\
     [Install]\n\
     WantedBy=multi-user.target\n"
        .to_string()
}

async fn write_file(
    ctx: &AgentContext,
    path: &str,
    content: String,
    permissions: &str,
) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        ctx.file_writer
            .mkdir_if_not_exists(&parent.to_string_lossy())
            .await?;
    }
    ctx.file_writer
        .write_file(&FileSpec {
            path: path.to_string(),
            content,
            permissions: permissions.to_string(),
            ..Default::default()
        })
        .await
}

async fn bootstrap_tls(
    host: &Host,
    ctx: &AgentContext,
    secret_data: &std::collections::BTreeMap<String, k8s_openapi::ByteString>,
) -> Result<()> {
    info!("bootstrapping node via TLS bootstrap");

    let text = |key: &str| -> Option<String> {
        secret_data
            .get(key)
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .filter(|s| !s.is_empty())
    };

    let bootstrap_kubeconfig = text("bootstrap-kubeconfig");
    let mut ca_pem = text("ca.crt");
    let mut bootstrap_token = None;
    if let Some(kubeconfig) = &bootstrap_kubeconfig {
        if ca_pem.is_none() {
            ca_pem = extract_ca_from_kubeconfig(kubeconfig)
                .map(|ca| String::from_utf8_lossy(&ca).into_owned());
        }
        bootstrap_token = extract_token_from_kubeconfig(kubeconfig);
    }

    // CA to every conventional path; individual failures are tolerable.
    if let Some(ca) = &ca_pem {
        for path in CA_PATHS {
            if let Err(e) = write_file(ctx, path, ca.clone(), "0644").await {
                debug!(path = %path, error = %e, "could not write CA copy");
            }
        }
    }

    let kubeconfig = bootstrap_kubeconfig
        .ok_or_else(|| Error::bootstrap("TLS bootstrap secret has no bootstrap-kubeconfig"))?;
    write_file(ctx, "/etc/kubernetes/bootstrap-kubeconfig", kubeconfig, "0600").await?;

    let kubelet_config =
        text("kubelet-config.yaml").unwrap_or_else(|| default_kubelet_config(DEFAULT_CLUSTER_DNS));
    write_file(ctx, "/var/lib/kubelet/config.yaml", kubelet_config, "0644").await?;

    let kube_proxy_config =
        text("kube-proxy-config.yaml").unwrap_or_else(default_kube_proxy_config);
    write_file(
        ctx,
        "/var/lib/kube-proxy/kube-proxy-config.yaml",
        kube_proxy_config,
        "0644",
    )
    .await?;

    let kube_proxy_kubeconfig = match text("kube-proxy.kubeconfig") {
        Some(kubeconfig) => kubeconfig,
        None => {
            // Synthesize from whatever we have: the API server named in the
            // endpoint annotation plus the bootstrap token.
            let api_server = host
                .annotations()
                .get(ENDPOINT_HOST_ANNOTATION)
                .map(|h| format!("https://{}:6443", h))
                .unwrap_or_else(|| "https://127.0.0.1:6443".to_string());
            render_kube_proxy_kubeconfig(
                &api_server,
                ca_pem.as_deref().unwrap_or_default().as_bytes(),
                bootstrap_token.as_deref().unwrap_or_default(),
            )
        }
    };
    write_file(
        ctx,
        "/etc/kubernetes/kube-proxy.kubeconfig",
        kube_proxy_kubeconfig,
        "0600",
    )
    .await?;

    // kubelet needs these before first start.
    for dir in [
        "/etc/kubernetes/manifests",
        "/var/lib/kubelet/pki",
        "/var/lib/kube-proxy",
    ] {
        ctx.file_writer.mkdir_if_not_exists(dir).await?;
    }

    let args = kubelet_args(host, &ctx.host_name);
    write_file(
        ctx,
        "/etc/systemd/system/kubelet.service",
        kubelet_unit(&args),
        "0644",
    )
    .await?;

    ctx.cmd_runner.run("systemctl daemon-reload").await?;
    ctx.cmd_runner.run("systemctl enable --now kubelet").await?;
    info!("kubelet started");

    if host.spec.manage_kube_proxy {
        write_file(
            ctx,
            "/etc/systemd/system/kube-proxy.service",
            kube_proxy_unit(),
            "0644",
        )
        .await?;
        ctx.cmd_runner.run("systemctl daemon-reload").await?;
        ctx.cmd_runner
            .run("systemctl enable --now kube-proxy")
            .await?;
        info!("kube-proxy started");
    }

    Ok(())
}

/// Start kube-proxy if the flag demands it and the service is not already
/// active. Handles manage-kube-proxy flipping on after bootstrap.
async fn start_kube_proxy_if_needed(host: &Host, ctx: &AgentContext) -> Result<()> {
    if !host.spec.manage_kube_proxy {
        return Ok(());
    }
    if ctx
        .cmd_runner
        .run("systemctl is-active --quiet kube-proxy")
        .await
        .is_ok()
    {
        return Ok(());
    }

    info!("kube-proxy not running, starting it");
    if !Path::new("/var/lib/kube-proxy/kube-proxy-config.yaml").exists() {
        write_file(
            ctx,
            "/var/lib/kube-proxy/kube-proxy-config.yaml",
            default_kube_proxy_config(),
            "0644",
        )
        .await?;
    }
    write_file(
        ctx,
        "/etc/systemd/system/kube-proxy.service",
        kube_proxy_unit(),
        "0644",
    )
    .await?;
    ctx.cmd_runner.run("systemctl daemon-reload").await?;
    ctx.cmd_runner
        .run("systemctl enable --now kube-proxy")
        .await?;
    Ok(())
}

async fn persist_machine_id(uid: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(MACHINE_ID_FILE).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(MACHINE_ID_FILE, uid).await
}

// =============================================================================
// Cleanup
// =============================================================================

/// Full cleanup: local reset plus release of the server-side binding.
async fn host_cleanup(host: &Host, ctx: &AgentContext) -> std::result::Result<(), CleanupFailure> {
    info!("cleaning up host");

    let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    if let Err(e) = hosts
        .patch_status(
            &ctx.host_name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "cleanupStarted": true } })),
        )
        .await
    {
        debug!(error = %e, "could not record cleanup start");
    }

    local_reset(host, ctx).await?;

    clear_host_binding(host, ctx)
        .await
        .map_err(|e| CleanupFailure::transient(e.to_string()))?;

    info!("host cleanup complete");
    Ok(())
}

/// Local-only reset: node reset with retries, uninstall script, state
/// files. Leaves the server-side binding untouched.
async fn local_reset(host: &Host, ctx: &AgentContext) -> std::result::Result<(), CleanupFailure> {
    let conditions = host
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    if condition_is_true(&conditions, COMPONENTS_INSTALLED_CONDITION) {
        if let Err(e) = reset_node_with_retry(host, ctx).await {
            // The node being unreachable or already dismantled is exactly
            // what reset produces; never block release on it.
            warn!(error = %e, "node reset failed after retries, continuing cleanup");
        }

        if ctx.skip_installation {
            info!("skipping component uninstallation");
        } else if let Some(script) = &host.spec.uninstallation_script {
            run_uninstall_script(ctx, script).await?;
        } else {
            debug!("no uninstall script recorded, skipping uninstall");
        }
    } else {
        info!("components never installed, skipping reset and uninstall");
        // Even a half-claimed host may have a registered Node object.
        delete_node_object(ctx).await;
    }

    for file in [BOOTSTRAP_SENTINEL_FILE, MACHINE_ID_FILE] {
        match tokio::fs::remove_file(file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %file, error = %e, "failed to remove state file"),
        }
    }

    release_endpoint_ip(host, ctx).await;
    Ok(())
}

async fn run_uninstall_script(
    ctx: &AgentContext,
    script: &str,
) -> std::result::Result<(), CleanupFailure> {
    let rendered =
        super::cloudinit::render_template(script, &ctx.host_name, &ctx.download_path);
    info!("executing uninstall script");

    let mut last_err = None;
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match ctx.cmd_runner.run(&rendered).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "uninstall script failed");
                last_err = Some(e);
                if attempt < CLEANUP_ATTEMPTS {
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                }
            }
        }
    }

    // A script rejected by the command filter will never succeed; retrying
    // on requeue would loop forever.
    match last_err {
        Some(Error::Command(msg)) if msg.contains("forbidden character") => {
            Err(CleanupFailure::permanent(msg))
        }
        Some(e) => Err(CleanupFailure::transient(e.to_string())),
        None => Ok(()),
    }
}

async fn reset_node_with_retry(
    host: &Host,
    ctx: &AgentContext,
) -> std::result::Result<(), CleanupFailure> {
    let mut last_err = None;
    for attempt in 1..=CLEANUP_ATTEMPTS {
        info!(attempt, "resetting node");
        match reset_node(host, ctx).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "node reset failed");
                last_err = Some(e);
                if attempt < CLEANUP_ATTEMPTS {
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(CleanupFailure::permanent(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "node reset failed".to_string()),
    ))
}

/// Whether a kubeadm binary is reachable through PATH.
fn kubeadm_present() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join("kubeadm").is_file())
}

async fn reset_node(host: &Host, ctx: &AgentContext) -> Result<()> {
    if kubeadm_present() {
        info!("running kubeadm reset");
        if let Err(e) = ctx.cmd_runner.run(KUBEADM_RESET_COMMAND).await {
            warn!(error = %e, "kubeadm reset failed, falling back to manual cleanup");
        }
    } else {
        info!("kubeadm not found, performing manual cleanup");
    }

    // Manual teardown covers binary installs and failed kubeadm resets.
    let _ = ctx.cmd_runner.run("systemctl stop kubelet").await;
    let _ = ctx.cmd_runner.run("systemctl stop containerd").await;
    if host.spec.manage_kube_proxy {
        let _ = ctx.cmd_runner.run("systemctl stop kube-proxy").await;
    }

    for file in FILES_TO_REMOVE {
        match tokio::fs::remove_file(file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(file = %file, error = %e, "failed to remove file"),
        }
    }
    let _ = ctx.cmd_runner.run("systemctl daemon-reload").await;

    for dir in DIRS_TO_REMOVE {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(dir = %dir, error = %e, "failed to remove directory"),
        }
    }

    delete_node_object(ctx).await;
    info!("node reset completed");
    Ok(())
}

/// Delete this host's Node object; 404 counts as success.
async fn delete_node_object(ctx: &AgentContext) {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    match nodes.delete(&ctx.host_name, &DeleteParams::default()).await {
        Ok(_) => info!("deleted node object"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("node object already absent")
        }
        Err(e) => warn!(error = %e, "failed to delete node object"),
    }
}

/// Release the virtual endpoint IP if this host held one.
async fn release_endpoint_ip(host: &Host, ctx: &AgentContext) {
    let Some(endpoint) = host.annotations().get(ENDPOINT_HOST_ANNOTATION) else {
        return;
    };
    let Some(iface) = probe::default_interface_name().await else {
        return;
    };
    let cmd = format!("ip addr del {}/32 dev {}", endpoint, iface);
    if let Err(e) = ctx.cmd_runner.run(&cmd).await {
        debug!(error = %e, "endpoint ip not held, nothing to release");
    }
}

/// Clear this host's binding state: labels, bootstrap/installer spec
/// fields, annotations, MachineRef and conditions. The host returns to the
/// available pool once this lands.
async fn clear_host_binding(host: &Host, ctx: &AgentContext) -> Result<()> {
    let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let patch = json!({
        "metadata": {
            "labels": {
                CLUSTER_NAME_LABEL: null,
                ATTACHED_MACHINE_LABEL: null,
            },
            "annotations": {
                HOST_CLEANUP_ANNOTATION: null,
                CLEANUP_STARTED_ANNOTATION: null,
                ENDPOINT_HOST_ANNOTATION: null,
                K8S_VERSION_ANNOTATION: null,
                BUNDLE_REGISTRY_ANNOTATION: null,
            }
        },
        "spec": {
            "bootstrapSecret": null,
            "installationSecret": null,
            "uninstallationScript": null,
        }
    });
    hosts
        .patch(&ctx.host_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    let mut conditions = host
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    crate::crd::types::set_condition(
        &mut conditions,
        Condition::new(
            COMPONENTS_INSTALLED_CONDITION,
            ConditionStatus::False,
            NODE_ABSENT_REASON,
            "",
        ),
    );
    crate::crd::types::set_condition(
        &mut conditions,
        Condition::new(
            NODE_BOOTSTRAPPED_CONDITION,
            ConditionStatus::False,
            NODE_ABSENT_REASON,
            "",
        ),
    );
    hosts
        .patch_status(
            &ctx.host_name,
            &PatchParams::default(),
            &Patch::Merge(&json!({
                "status": { "machineRef": null, "conditions": conditions }
            })),
        )
        .await?;
    Ok(())
}

async fn set_host_condition(host: &Host, ctx: &AgentContext, condition: Condition) -> Result<()> {
    let hosts: Api<Host> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let mut conditions = host
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    // An unchanged condition must not be rewritten: the fresh transition
    // timestamp would bump the resource version and retrigger this very
    // reconcile, forever.
    if conditions.iter().any(|c| {
        c.type_ == condition.type_ && c.status == condition.status && c.reason == condition.reason
    }) {
        return Ok(());
    }
    crate::crd::types::set_condition(&mut conditions, condition);
    hosts
        .patch_status(
            &ctx.host_name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "conditions": conditions } })),
        )
        .await?;
    Ok(())
}
