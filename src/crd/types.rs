//! Shared types and well-known names for the hostpool API group.
//!
//! Everything that more than one resource or controller touches lives here:
//! conditions, the machine back-reference, network/host status structs, the
//! join/download mode discriminants, label/annotation keys, and the
//! provider-ID format.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Well-known labels, annotations and names
// =============================================================================

/// Label carrying the owning cluster name (Cluster API contract)
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label on a Host naming the PoolMachine attached to it (`<namespace>.<name>`)
pub const ATTACHED_MACHINE_LABEL: &str = "hostpool.dev/attached-machine";

/// Annotation signalling that a Host must be cleaned up by its agent
pub const HOST_CLEANUP_ANNOTATION: &str = "hostpool.dev/cleanup";

/// Annotation recording when cleanup was first observed (RFC 3339)
pub const CLEANUP_STARTED_ANNOTATION: &str = "hostpool.dev/cleanup-started-at";

/// Annotation recording a forced release performed by the host controller
pub const FORCE_CLEANUP_AUDIT_ANNOTATION: &str = "hostpool.dev/force-cleanup-audit";

/// Annotation holding the claim-arbitration lease (JSON payload)
pub const HOST_LEASE_ANNOTATION: &str = "hostpool.dev/lease";

/// Annotation carrying the control-plane endpoint host for the bound cluster
pub const ENDPOINT_HOST_ANNOTATION: &str = "hostpool.dev/endpoint-host";

/// Annotation carrying the Kubernetes version the host should install
pub const K8S_VERSION_ANNOTATION: &str = "hostpool.dev/kubernetes-version";

/// Annotation carrying the bundle registry to download from
pub const BUNDLE_REGISTRY_ANNOTATION: &str = "hostpool.dev/bundle-registry";

/// Annotation marking a resource as paused (Cluster API contract)
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation set by an external health checker to request remediation
pub const REMEDIATION_ANNOTATION: &str = "cluster.x-k8s.io/remediation-for";

/// Finalizer placed on PoolMachines so host release precedes deletion
pub const MACHINE_FINALIZER: &str = "poolmachine.hostpool.dev";

/// Name prefix for client CSRs submitted by hosts
pub const CSR_NAME_PREFIX: &str = "hostpool-csr-";

/// Lease time-to-live for claim arbitration
pub const HOST_LEASE_TTL_SECS: i64 = 30;

// =============================================================================
// Condition types and reasons
// =============================================================================

/// Condition type: Kubernetes components are installed on the host
pub const COMPONENTS_INSTALLED_CONDITION: &str = "ComponentsInstalled";

/// Condition type: the host has bootstrapped into a cluster node
pub const NODE_BOOTSTRAPPED_CONDITION: &str = "NodeBootstrapped";

/// Condition type on a PoolMachine: a host is attached and provisioned
pub const HOST_READY_CONDITION: &str = "HostReady";

/// Reason: no machine has claimed this host yet
pub const WAITING_FOR_CLAIM_REASON: &str = "WaitingForMachineRef";

/// Reason: the bootstrap data secret is not available yet
pub const BOOTSTRAP_SECRET_UNAVAILABLE_REASON: &str = "BootstrapSecretUnavailable";

/// Reason: the installation secret is not available yet
pub const INSTALLATION_SECRET_UNAVAILABLE_REASON: &str = "InstallationSecretUnavailable";

/// Reason: the install script failed after its retries
pub const COMPONENTS_INSTALL_FAILED_REASON: &str = "ComponentsInstallFailed";

/// Reason: node bootstrap (cloud-init or TLS) failed
pub const BOOTSTRAP_FAILED_REASON: &str = "NodeBootstrapFailed";

/// Reason: the node has been removed from the cluster
pub const NODE_ABSENT_REASON: &str = "NodeAbsent";

/// Reason: no host in the pool satisfied selection
pub const HOSTS_UNAVAILABLE_REASON: &str = "HostsUnavailable";

/// Reason: the machine or its cluster is paused
pub const PAUSED_REASON: &str = "ClusterOrResourcePaused";

/// Reason: waiting for the kubelet to register the node
pub const WAITING_FOR_NODE_REASON: &str = "WaitingForNodeRef";

// =============================================================================
// Provider ID
// =============================================================================

/// URI scheme prefix for hostpool provider IDs
pub const PROVIDER_ID_PREFIX: &str = "hostpool://";

/// Generate the standardized provider ID for a host.
///
/// The same value is injected at every point that names the node: kubeadm
/// config interception, kubelet arguments, and Node patches from the
/// controller. Any divergence breaks the autoscaler's node-to-machine
/// mapping.
pub fn generate_provider_id(hostname: &str) -> String {
    format!("{}{}", PROVIDER_ID_PREFIX, hostname)
}

/// Validate that an existing provider ID matches the expected format for
/// the given host: `hostpool://<hostname>` with an optional `/<suffix>`.
pub fn validate_provider_id(provider_id: &str, hostname: &str) -> bool {
    let Some(rest) = provider_id.strip_prefix(PROVIDER_ID_PREFIX) else {
        return false;
    };
    match rest.strip_prefix(hostname) {
        Some("") => true,
        Some(suffix) => suffix.starts_with('/') && suffix.len() > 1,
        None => false,
    }
}

// =============================================================================
// Modes
// =============================================================================

/// How a host joins the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JoinMode {
    /// Execute the cloud-init document and `kubeadm join` (default)
    #[default]
    Kubeadm,
    /// Direct kubelet start with a bootstrap kubeconfig and CSR approval
    TlsBootstrap,
}

/// How a host obtains Kubernetes binaries
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DownloadMode {
    /// Download binaries from the network (default)
    #[default]
    Online,
    /// Binaries are pre-installed; skip installation entirely
    Offline,
}

// =============================================================================
// Status structs
// =============================================================================

/// Back-reference from a Host to the PoolMachine that claimed it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    /// API version of the referenced machine
    pub api_version: String,
    /// Kind of the referenced machine
    pub kind: String,
    /// Namespace of the referenced machine
    pub namespace: String,
    /// Name of the referenced machine
    pub name: String,
    /// UID of the referenced machine, used for zombie detection
    pub uid: String,
}

/// Reference to a secret by namespace and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Namespace of the secret
    pub namespace: String,
    /// Name of the secret
    pub name: String,
}

/// Status of one network interface on a host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Whether the interface is up
    #[serde(default)]
    pub connected: bool,
    /// Interface name
    #[serde(default)]
    pub network_interface_name: String,
    /// MAC address
    #[serde(default)]
    pub mac_addr: String,
    /// Addresses (CIDR notation) assigned to the interface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,
    /// Whether the default gateway routes through this interface
    #[serde(default)]
    pub is_default: bool,
}

/// OS and architecture details of a host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostDetails {
    /// Operating system name (e.g. linux)
    #[serde(default)]
    pub os_name: String,
    /// OS distribution pretty-name (e.g. "Ubuntu 22.04")
    #[serde(default)]
    pub os_image: String,
    /// CPU architecture (e.g. x86_64)
    #[serde(default)]
    pub architecture: String,
}

/// Address of a machine, propagated into the cluster-manager's status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type (ExternalIP for pool hosts)
    #[serde(rename = "type")]
    pub type_: String,
    /// The address value
    pub address: String,
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. NodeBootstrapped)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Shorthand for a True condition
    pub fn true_(type_: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, "", "")
    }
}

/// Replace-or-append a condition in a condition list, keyed by type.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    conditions.retain(|c| c.type_ != condition.type_);
    conditions.push(condition);
}

/// Whether the list carries the given condition type with status True.
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

// =============================================================================
// Resource quantities
// =============================================================================

/// Parse a Kubernetes resource quantity into a scalar number of base units.
///
/// Handles the binary suffixes (Ki, Mi, Gi, Ti), the decimal suffixes
/// (k, M, G, T), and milli (m). Quantities the parser cannot read yield
/// `None`; callers treat those capacities as unusable rather than guessing.
pub fn parse_quantity(q: &str) -> Option<f64> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }

    let suffixes: [(&str, f64); 9] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("m", 1e-3),
    ];

    for (suffix, factor) in suffixes {
        if let Some(number) = q.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }

    q.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Provider ID format stories
    // =========================================================================
    //
    // The provider ID is the single value that ties a workload Node back to
    // its Host across three independent writers (cloud-init interception,
    // kubelet args, the controller's Node patch). The format checks here are
    // what keeps those writers agreeing.

    /// The generated ID uses the fixed scheme and the bare hostname.
    #[test]
    fn generated_provider_id_uses_scheme_and_hostname() {
        assert_eq!(generate_provider_id("h1"), "hostpool://h1");
    }

    /// A bare `hostpool://<hostname>` validates, as does one with a
    /// path-like suffix; other hosts and other schemes do not.
    #[test]
    fn provider_id_validation_accepts_exact_and_suffixed_forms() {
        assert!(validate_provider_id("hostpool://h1", "h1"));
        assert!(validate_provider_id("hostpool://h1/abc123", "h1"));
        assert!(!validate_provider_id("hostpool://h2", "h1"));
        assert!(!validate_provider_id("aws://h1", "h1"));
        assert!(!validate_provider_id("hostpool://h1x", "h1"));
        assert!(!validate_provider_id("hostpool://h1/", "h1"));
        assert!(!validate_provider_id("", "h1"));
    }

    // =========================================================================
    // Condition bookkeeping
    // =========================================================================

    /// Setting a condition replaces any prior condition of the same type so
    /// the status never accumulates contradictory entries.
    #[test]
    fn set_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(
                NODE_BOOTSTRAPPED_CONDITION,
                ConditionStatus::False,
                WAITING_FOR_CLAIM_REASON,
                "",
            ),
        );
        set_condition(
            &mut conditions,
            Condition::true_(NODE_BOOTSTRAPPED_CONDITION),
        );

        assert_eq!(conditions.len(), 1);
        assert!(condition_is_true(&conditions, NODE_BOOTSTRAPPED_CONDITION));
    }

    #[test]
    fn condition_is_true_ignores_other_types() {
        let conditions = vec![Condition::true_(COMPONENTS_INSTALLED_CONDITION)];
        assert!(!condition_is_true(&conditions, NODE_BOOTSTRAPPED_CONDITION));
    }

    // =========================================================================
    // Quantity parsing
    // =========================================================================

    /// Capacity comparisons depend on reading the quantities hosts advertise;
    /// the common CPU and memory spellings must all parse.
    #[test]
    fn parses_common_quantity_spellings() {
        assert_eq!(parse_quantity("8"), Some(8.0));
        assert_eq!(parse_quantity("16Gi"), Some(16.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("512Mi"), Some(512.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("2k"), Some(2000.0));
        assert_eq!(parse_quantity(" 4 "), Some(4.0));
    }

    /// Garbage quantities yield None instead of a guessed value.
    #[test]
    fn unparseable_quantities_yield_none() {
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("lots"), None);
        assert_eq!(parse_quantity("Gi"), None);
    }
}
