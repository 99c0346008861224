//! PoolMachine Custom Resource Definition
//!
//! A PoolMachine is the infrastructure-side counterpart of the cluster
//! manager's logical Machine. The machine controller binds each PoolMachine
//! to exactly one Host from the pool and reports readiness, the node
//! reference and addresses back through its status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, DownloadMode, HostDetails, JoinMode, MachineAddress, SecretRef,
};

/// Specification of a PoolMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hostpool.dev",
    version = "v1alpha1",
    kind = "PoolMachine",
    plural = "poolmachines",
    shortname = "pm",
    status = "PoolMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PoolMachineSpec {
    /// Label selector narrowing which hosts may be claimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Provider ID, set once a workload Node exists for the claimed host
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,

    /// How the claimed host joins the cluster
    #[serde(default)]
    pub join_mode: JoinMode,

    /// How the claimed host obtains Kubernetes binaries
    #[serde(default)]
    pub download_mode: DownloadMode,

    /// Kubernetes version for the claimed host (TLS-bootstrap mode);
    /// derived from the owning Machine when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Whether the agent should manage kube-proxy on the claimed host.
    /// TLS-bootstrap mode defaults this to true during binding.
    #[serde(default)]
    pub manage_kube_proxy: bool,

    /// Optional reference to a BootstrapCredential supplying the
    /// TLS-bootstrap kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_credential_ref: Option<ObjectReference>,

    /// Optional reference to the installation secret to relay to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_secret_ref: Option<SecretRef>,

    /// Minimum capacity a host must advertise to be claimed; nil accepts
    /// any host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_requirements: Option<BTreeMap<String, Quantity>>,
}

/// Observed state of a PoolMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolMachineStatus {
    /// True once the claimed host has a provisioned workload Node
    #[serde(default)]
    pub ready: bool,

    /// Conditions of the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Reference to the workload Node created for this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Addresses of the claimed host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Platform details mirrored from the claimed host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostDetails>,

    /// Set once host cleanup has been requested during deletion
    #[serde(default)]
    pub cleanup_started: bool,

    /// Set once host cleanup has finished (or been forced)
    #[serde(default)]
    pub cleanup_completed: bool,
}

impl PoolMachineStatus {
    /// Set ready and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Add a condition and return self for chaining, replacing any prior
    /// condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        super::types::set_condition(&mut self.conditions, condition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{ConditionStatus, HOST_READY_CONDITION};

    /// Chained status construction keeps one condition per type, mirroring
    /// how the reconciler rewrites HostReady on every pass.
    #[test]
    fn status_builder_replaces_conditions_by_type() {
        let status = PoolMachineStatus::default()
            .condition(Condition::new(
                HOST_READY_CONDITION,
                ConditionStatus::False,
                "HostsUnavailable",
                "",
            ))
            .condition(Condition::true_(HOST_READY_CONDITION))
            .ready(true);

        assert!(status.ready);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    /// Spec defaults leave join mode at kubeadm with no capacity demands,
    /// the configuration the selection path treats as accept-any-host.
    #[test]
    fn spec_defaults_are_kubeadm_and_unconstrained() {
        let spec = PoolMachineSpec::default();
        assert_eq!(spec.join_mode, JoinMode::Kubeadm);
        assert!(spec.capacity_requirements.is_none());
        assert!(!spec.manage_kube_proxy);
    }
}
