//! BootstrapCredential controller.
//!
//! Turns a BootstrapCredential spec (API server + CA bundle) into a usable
//! bootstrap kubeconfig: mints a join token, materializes it as a
//! `bootstrap.kubernetes.io/token` secret, renders the kubeconfig and
//! publishes it into the status.
//!
//! Credentials cloned by higher-level templating often arrive with an empty
//! API server or CA; those are populated by walking the owner references
//! upward (Machine, then its Cluster, then the originally referenced
//! credential) before minting.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::token::{BootstrapToken, TOKEN_NAMESPACE, TOKEN_TTL};
use crate::bootstrap::render_bootstrap_kubeconfig;
use crate::crd::types::{Condition, ConditionStatus};
use crate::crd::BootstrapCredential;
use crate::Error;

/// Context for the credential controller
pub struct Context {
    /// Management-cluster client
    pub client: Client,
}

/// Extract the server URL embedded in a kubeconfig document.
pub fn extract_server_from_kubeconfig(kubeconfig: &str) -> Option<String> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(kubeconfig).ok()?;
    parsed
        .get("clusters")?
        .as_sequence()?
        .first()?
        .get("cluster")?
        .get("server")?
        .as_str()
        .map(String::from)
}

/// Whether the published kubeconfig is still current for the spec. A
/// credential with no published data, or whose embedded server no longer
/// matches the spec, needs regeneration.
pub fn needs_regeneration(credential: &BootstrapCredential) -> bool {
    let Some(published) = credential
        .status
        .as_ref()
        .and_then(|s| s.bootstrap_kubeconfig_data.as_deref())
    else {
        return true;
    };
    extract_server_from_kubeconfig(published).as_deref() != Some(credential.spec.api_server.as_str())
}

/// Reconcile a BootstrapCredential.
#[instrument(skip(credential, ctx), fields(credential = %credential.name_any()))]
pub async fn reconcile(
    credential: Arc<BootstrapCredential>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = credential.name_any();
    let namespace = credential.namespace().unwrap_or_default();
    let api: Api<BootstrapCredential> = Api::namespaced(ctx.client.clone(), &namespace);

    // Fill in fields a templated clone arrived without.
    let mut credential = (*credential).clone();
    if credential.spec.api_server.is_empty()
        || credential.spec.certificate_authority_data.is_empty()
    {
        match populate_from_owners(&ctx.client, &namespace, &credential).await? {
            Some(populated) => {
                api.patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({ "spec": populated.spec })),
                )
                .await?;
                credential = populated;
            }
            None => {
                info!("credential has no owner to populate from yet");
                return Ok(Action::await_change());
            }
        }
    }

    if let Err(e) = credential.spec.validate() {
        warn!(error = %e, "credential spec failed validation");
        let condition = Condition::new(
            "Ready",
            ConditionStatus::False,
            "ValidationFailed",
            e.to_string(),
        );
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": { "conditions": [condition] } })),
        )
        .await?;
        // Not retried until the object changes.
        return Ok(Action::await_change());
    }

    if !needs_regeneration(&credential) {
        debug!("published kubeconfig is current");
        return Ok(Action::await_change());
    }

    // Mint a fresh token and materialize it.
    let token = BootstrapToken::generate();
    let token_secret = token.into_secret(TOKEN_TTL);
    let secrets: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.client.clone(), TOKEN_NAMESPACE);
    match secrets.create(&PostParams::default(), &token_secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    let ca_pem = credential.spec.decoded_ca()?;
    let kubeconfig =
        render_bootstrap_kubeconfig(&credential.spec.api_server, &ca_pem, &token.as_string());

    let condition = Condition::true_("Ready");
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({
            "status": {
                "bootstrapKubeconfigData": kubeconfig,
                "tokenSecretName": token.secret_name(),
                "tokenSecretCreated": true,
                "conditions": [condition],
            }
        })),
    )
    .await?;

    info!(token_secret = %token.secret_name(), "published bootstrap kubeconfig");
    Ok(Action::await_change())
}

/// Walk owner references upward to populate missing spec fields: the owner
/// Machine's Cluster supplies the control-plane endpoint, and the
/// credential the Machine originally referenced supplies CA data.
async fn populate_from_owners(
    client: &Client,
    namespace: &str,
    credential: &BootstrapCredential,
) -> Result<Option<BootstrapCredential>, Error> {
    let Some(owner) = credential
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|o| o.kind == "Machine")
    else {
        return Ok(None);
    };

    let machine_ar = ApiResource {
        group: "cluster.x-k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Machine".to_string(),
        plural: "machines".to_string(),
    };
    let machines: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &machine_ar);
    let machine = match machines.get(&owner.name).await {
        Ok(m) => m,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
        Err(e) => return Err(Error::Kube(e)),
    };

    let mut populated = credential.clone();

    // Control-plane endpoint from the owning cluster.
    if populated.spec.api_server.is_empty() {
        if let Some(cluster_name) = machine
            .data
            .pointer("/spec/clusterName")
            .and_then(|v| v.as_str())
        {
            let cluster_ar = ApiResource {
                group: "cluster.x-k8s.io".to_string(),
                version: "v1beta1".to_string(),
                api_version: "cluster.x-k8s.io/v1beta1".to_string(),
                kind: "Cluster".to_string(),
                plural: "clusters".to_string(),
            };
            let clusters: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), namespace, &cluster_ar);
            if let Ok(cluster) = clusters.get(cluster_name).await {
                let host = cluster
                    .data
                    .pointer("/spec/controlPlaneEndpoint/host")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let port = cluster
                    .data
                    .pointer("/spec/controlPlaneEndpoint/port")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                if !host.is_empty() && port > 0 {
                    populated.spec.api_server = format!("https://{}:{}", host, port);
                    info!(api_server = %populated.spec.api_server, "populated API server from cluster endpoint");
                }
            }
        }
    }

    // CA (and API server, as a fallback) from the credential the Machine's
    // bootstrap config originally referenced.
    let original_name = machine
        .data
        .pointer("/spec/bootstrap/configRef/name")
        .and_then(|v| v.as_str())
        .filter(|n| *n != credential.name_any());
    if let Some(original_name) = original_name {
        let credentials: Api<BootstrapCredential> = Api::namespaced(client.clone(), namespace);
        if let Ok(original) = credentials.get(original_name).await {
            if populated.spec.certificate_authority_data.is_empty()
                && !original.spec.certificate_authority_data.is_empty()
            {
                populated.spec.certificate_authority_data =
                    original.spec.certificate_authority_data;
                info!(original = %original_name, "populated CA data from original credential");
            }
            if populated.spec.api_server.is_empty() && !original.spec.api_server.is_empty() {
                populated.spec.api_server = original.spec.api_server;
            }
        }
    }

    if populated.spec == credential.spec {
        return Ok(None);
    }
    Ok(Some(populated))
}

/// Error policy for the credential controller.
pub fn error_policy(
    credential: Arc<BootstrapCredential>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(error = %error, credential = %credential.name_any(), "credential reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BootstrapCredentialSpec, BootstrapCredentialStatus};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use kube::core::ObjectMeta;

    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn credential(api_server: &str) -> BootstrapCredential {
        BootstrapCredential {
            metadata: ObjectMeta {
                name: Some("cred-1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: BootstrapCredentialSpec {
                api_server: api_server.to_string(),
                certificate_authority_data: BASE64.encode(CA_PEM),
            },
            status: None,
        }
    }

    // =========================================================================
    // Regeneration stories
    // =========================================================================
    //
    // The kubeconfig must be regenerated whenever the API server changes,
    // but NOT on every reconcile - that would churn a new token per event.

    /// A credential with no published data needs generation.
    #[test]
    fn unpublished_credential_needs_regeneration() {
        assert!(needs_regeneration(&credential("https://cp:6443")));
    }

    /// A published kubeconfig whose server matches the spec is current.
    #[test]
    fn matching_published_kubeconfig_is_current() {
        let mut cred = credential("https://cp:6443");
        let kubeconfig = render_bootstrap_kubeconfig(
            "https://cp:6443",
            CA_PEM.as_bytes(),
            "tokenid.tokensecret",
        );
        cred.status = Some(BootstrapCredentialStatus {
            bootstrap_kubeconfig_data: Some(kubeconfig),
            ..Default::default()
        });

        assert!(!needs_regeneration(&cred));
    }

    /// Changing the spec's API server invalidates the published kubeconfig.
    #[test]
    fn api_server_change_forces_regeneration() {
        let mut cred = credential("https://new-endpoint:6443");
        let kubeconfig = render_bootstrap_kubeconfig(
            "https://old-endpoint:6443",
            CA_PEM.as_bytes(),
            "tokenid.tokensecret",
        );
        cred.status = Some(BootstrapCredentialStatus {
            bootstrap_kubeconfig_data: Some(kubeconfig),
            ..Default::default()
        });

        assert!(needs_regeneration(&cred));
    }

    /// The server extractor reads what the renderer wrote.
    #[test]
    fn server_extraction_round_trips() {
        let kubeconfig =
            render_bootstrap_kubeconfig("https://cp:6443", CA_PEM.as_bytes(), "t.s");
        assert_eq!(
            extract_server_from_kubeconfig(&kubeconfig).as_deref(),
            Some("https://cp:6443")
        );
        assert_eq!(extract_server_from_kubeconfig("junk: ["), None);
    }
}
