//! Host Custom Resource Definition
//!
//! A Host represents one registered physical or virtual machine in the pool.
//! It is created by the agent on first run, claimed by the machine
//! controller, and mutated by both sides over disjoint field sets: the
//! controllers own `status.machineRef`, labels and cleanup annotations, the
//! agent owns conditions, network and host-details status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    parse_quantity, Condition, HostDetails, JoinMode, DownloadMode, MachineRef, NetworkStatus,
    SecretRef, HOST_CLEANUP_ANNOTATION,
};

/// Specification of a registered host
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hostpool.dev",
    version = "v1alpha1",
    kind = "Host",
    plural = "hosts",
    shortname = "hst",
    status = "HostStatus",
    namespaced,
    printcolumn = r#"{"name":"Machine","type":"string","jsonPath":".status.machineRef.name"}"#,
    printcolumn = r#"{"name":"Installed","type":"string","jsonPath":".status.conditions[?(@.type==\"ComponentsInstalled\")].status"}"#,
    printcolumn = r#"{"name":"Bootstrapped","type":"string","jsonPath":".status.conditions[?(@.type==\"NodeBootstrapped\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Advertised capacity of the host (cpu, memory, nvidia.com/gpu, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,

    /// Scheduling priority; among available hosts only the top priority tier
    /// is considered for claims. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// How this host joins a cluster
    #[serde(default)]
    pub join_mode: JoinMode,

    /// How this host obtains Kubernetes binaries
    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Kubernetes version to install (TLS-bootstrap mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Reference to the bootstrap data secret, set during binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_secret: Option<SecretRef>,

    /// Reference to the installation secret (install/uninstall scripts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_secret: Option<SecretRef>,

    /// Uninstall script retained for cleanup after the installation secret
    /// may already be gone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstallation_script: Option<String>,

    /// Whether the agent manages kube-proxy as a host service
    #[serde(default)]
    pub manage_kube_proxy: bool,

    /// Labels to apply to the workload Node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,

    /// Taints to register the workload Node with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

/// Observed state of a host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// The machine currently bound to this host, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ref: Option<MachineRef>,

    /// Network topology reported by the agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkStatus>,

    /// OS and architecture details reported by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_details: Option<HostDetails>,

    /// Conditions reported by the agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Set once the agent has begun cleanup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_started: Option<bool>,
}

impl Host {
    /// A host is available iff nothing has claimed it and no cleanup is
    /// pending on it.
    pub fn is_available(&self) -> bool {
        let claimed = self
            .status
            .as_ref()
            .and_then(|s| s.machine_ref.as_ref())
            .is_some();
        let cleanup_pending = self
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(HOST_CLEANUP_ANNOTATION))
            .unwrap_or(false);
        !claimed && !cleanup_pending
    }

    /// Scheduling priority, defaulting to 0 when unset.
    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    /// Whether this host satisfies every requested resource quantity.
    ///
    /// A requirement the host does not advertise, or advertises with an
    /// unparseable quantity, fails the match; a nil requirement set is
    /// checked by the caller and accepts any host.
    pub fn matches_requirements(&self, requirements: &BTreeMap<String, Quantity>) -> bool {
        for (resource, wanted) in requirements {
            let Some(wanted) = parse_quantity(&wanted.0) else {
                return false;
            };
            let available = self
                .spec
                .capacity
                .get(resource)
                .and_then(|q| parse_quantity(&q.0));
            match available {
                Some(available) if available >= wanted => continue,
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn host(name: &str) -> Host {
        Host {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: HostSpec::default(),
            status: None,
        }
    }

    fn quantity(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    // =========================================================================
    // Availability stories
    // =========================================================================
    //
    // Availability is the invariant the whole claim protocol leans on: a host
    // is claimable iff no machine references it and no cleanup is pending.

    /// A freshly registered host with no status is available.
    #[test]
    fn fresh_host_is_available() {
        assert!(host("h1").is_available());
    }

    /// A host with a live MachineRef is not available.
    #[test]
    fn claimed_host_is_not_available() {
        let mut h = host("h1");
        h.status = Some(HostStatus {
            machine_ref: Some(MachineRef {
                name: "m1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(!h.is_available());
    }

    /// A host still carrying the cleanup annotation is not available even
    /// after its MachineRef has been cleared; the agent has not finished.
    #[test]
    fn host_pending_cleanup_is_not_available() {
        let mut h = host("h1");
        h.metadata.annotations = Some(
            [(HOST_CLEANUP_ANNOTATION.to_string(), String::new())]
                .into_iter()
                .collect(),
        );
        assert!(!h.is_available());
    }

    // =========================================================================
    // Capacity matching stories
    // =========================================================================

    /// A host advertising more than the requested capacity matches.
    #[test]
    fn capacity_match_accepts_sufficient_host() {
        let mut h = host("h1");
        h.spec.capacity.insert("cpu".to_string(), quantity("16"));
        h.spec
            .capacity
            .insert("memory".to_string(), quantity("32Gi"));

        let mut req = BTreeMap::new();
        req.insert("cpu".to_string(), quantity("8"));
        req.insert("memory".to_string(), quantity("16Gi"));

        assert!(h.matches_requirements(&req));
    }

    /// A host short on any one resource fails the whole match.
    #[test]
    fn capacity_match_rejects_insufficient_host() {
        let mut h = host("h1");
        h.spec.capacity.insert("cpu".to_string(), quantity("4"));

        let mut req = BTreeMap::new();
        req.insert("cpu".to_string(), quantity("8"));

        assert!(!h.matches_requirements(&req));
    }

    /// A requirement the host does not advertise at all fails the match; a
    /// zero-capacity host satisfies no requirement.
    #[test]
    fn capacity_match_rejects_unadvertised_resources() {
        let h = host("h1");

        let mut req = BTreeMap::new();
        req.insert("nvidia.com/gpu".to_string(), quantity("1"));

        assert!(!h.matches_requirements(&req));
    }

    /// An empty requirement map accepts any host.
    #[test]
    fn empty_requirements_accept_any_host() {
        assert!(host("h1").matches_requirements(&BTreeMap::new()));
    }

    /// Priority defaults to zero when unset.
    #[test]
    fn priority_defaults_to_zero() {
        assert_eq!(host("h1").priority(), 0);
        let mut h = host("h2");
        h.spec.priority = Some(10);
        assert_eq!(h.priority(), 10);
    }
}
