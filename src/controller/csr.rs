//! CSR auto-approver.
//!
//! Node joins driven by this provider produce two kinds of certificate
//! signing requests: client CSRs named `hostpool-csr-*` against the
//! kube-apiserver-client signer, and kubelet-serving CSRs from kubelets
//! rotating server certificates. Both are approved here; every other
//! signer is ignored. Approval is idempotent - requests already carrying an
//! Approved or Denied condition are left alone.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::crd::types::CSR_NAME_PREFIX;
use crate::Error;

/// Signer for client certificates issued to joining hosts
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Signer for kubelet serving certificates
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Context for the CSR approver
pub struct Context {
    /// Management-cluster client
    pub client: kube::Client,
}

/// Whether the CSR already carries a terminal (Approved or Denied)
/// condition.
pub fn has_terminal_condition(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
        .unwrap_or(false)
}

/// Whether this CSR is one we approve: a `hostpool-csr-*` client request
/// or any kubelet-serving request.
pub fn wants_approval(csr: &CertificateSigningRequest) -> bool {
    let name = csr.metadata.name.as_deref().unwrap_or_default();
    match csr.spec.signer_name.as_str() {
        KUBE_APISERVER_CLIENT_SIGNER => name.starts_with(CSR_NAME_PREFIX),
        KUBELET_SERVING_SIGNER => true,
        _ => false,
    }
}

/// Reconcile a certificate signing request.
#[instrument(skip(csr, ctx), fields(csr = %csr.name_any()))]
pub async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if has_terminal_condition(&csr) {
        debug!("request already approved or denied");
        return Ok(Action::await_change());
    }

    if !wants_approval(&csr) {
        debug!(signer = %csr.spec.signer_name, "ignoring request from unknown signer");
        return Ok(Action::await_change());
    }

    let name = csr.name_any();
    info!(signer = %csr.spec.signer_name, "approving certificate signing request");

    let condition = CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some("HostpoolApproved".to_string()),
        message: Some("approved by the hostpool CSR controller".to_string()),
        last_update_time: Some(Time(chrono::Utc::now())),
        last_transition_time: None,
    };

    let api: Api<CertificateSigningRequest> = Api::all(ctx.client.clone());
    let mut updated = (*csr).clone();
    let status = updated.status.get_or_insert_with(Default::default);
    status
        .conditions
        .get_or_insert_with(Vec::new)
        .push(condition);

    api.patch_approval(&name, &PatchParams::default(), &Patch::Merge(&updated))
        .await?;

    info!("certificate signing request approved");
    Ok(Action::await_change())
}

/// Error policy: approval is idempotent, so failed submissions simply
/// requeue without a retry limit.
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(error = %error, csr = %csr.name_any(), "CSR approval failed");
    Action::requeue(Duration::from_secs(5))
}
