//! Workload-cluster client construction.
//!
//! The management cluster stores each workload cluster's kubeconfig in the
//! conventional `<cluster-name>-kubeconfig` secret (key `value`). Node
//! patches and config reads go through a client built from that secret.

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::{Error, Result};

/// Build a client for the workload cluster owning `cluster_name`.
pub async fn workload_client(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> Result<Client> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret_name = format!("{}-kubeconfig", cluster_name);
    let secret = secrets.get(&secret_name).await?;

    let data = secret
        .data
        .and_then(|mut d| d.remove("value"))
        .ok_or_else(|| {
            Error::bootstrap(format!(
                "kubeconfig secret {}/{} has no value key",
                namespace, secret_name
            ))
        })?;

    let yaml = String::from_utf8(data.0)
        .map_err(|e| Error::serialization(format!("kubeconfig is not UTF-8: {}", e)))?;
    let kubeconfig = Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::serialization(format!("invalid kubeconfig: {}", e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::bootstrap(format!("unusable kubeconfig: {}", e)))?;

    Client::try_from(config).map_err(Error::Kube)
}
