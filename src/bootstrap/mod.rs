//! Bootstrap credential assembly.
//!
//! This module builds everything a host needs to join a cluster:
//! kubeadm-shaped join tokens ([`token`]), bootstrap kubeconfigs, and the
//! TLS-bootstrap secret bundling `ca.crt`, `bootstrap-kubeconfig`,
//! `kubelet-config.yaml`, `kube-proxy-config.yaml` and
//! `kube-proxy.kubeconfig`.
//!
//! Wherever the target cluster can be asked for its active configuration
//! (the kubelet-config and kube-proxy ConfigMaps, the DNS Service IP) that
//! source wins; the synthesized defaults here are a last resort for
//! clusters that have no such ConfigMaps.

pub mod token;

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info};

pub use token::BootstrapToken;

use crate::{Error, Result};

/// clusterDNS fallback when neither the cluster nor its CIDR can tell us
pub const DEFAULT_CLUSTER_DNS: &str = "10.96.0.10";

/// Path the in-cluster service-account CA is mounted at
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

// =============================================================================
// Kubeconfig rendering and parsing
// =============================================================================

/// Render a bootstrap kubeconfig: exactly one cluster, one token user, one
/// context named `bootstrap`, with the CA embedded as base64 PEM.
pub fn render_bootstrap_kubeconfig(api_server: &str, ca_pem: &[u8], token: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - cluster:\n\
         \x20   certificate-authority-data: {ca}\n\
         \x20   server: {server}\n\
         \x20 name: bootstrap\n\
         contexts:\n\
         - context:\n\
         \x20   cluster: bootstrap\n\
         \x20   user: bootstrap\n\
         \x20 name: bootstrap\n\
         current-context: bootstrap\n\
         users:\n\
         - name: bootstrap\n\
         \x20 user:\n\
         \x20   token: {token}\n",
        ca = BASE64.encode(ca_pem),
        server = api_server,
        token = token,
    )
}

/// Render a kube-proxy kubeconfig reusing the bootstrap token.
pub fn render_kube_proxy_kubeconfig(api_server: &str, ca_pem: &[u8], token: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - cluster:\n\
         \x20   certificate-authority-data: {ca}\n\
         \x20   server: {server}\n\
         \x20 name: default\n\
         contexts:\n\
         - context:\n\
         \x20   cluster: default\n\
         \x20   user: default\n\
         \x20 name: default\n\
         current-context: default\n\
         users:\n\
         - name: default\n\
         \x20 user:\n\
         \x20   token: {token}\n",
        ca = BASE64.encode(ca_pem),
        server = api_server,
        token = token,
    )
}

#[derive(Deserialize)]
struct KubeconfigClusterEntry {
    cluster: KubeconfigCluster,
}

#[derive(Deserialize)]
struct KubeconfigCluster {
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
}

#[derive(Deserialize)]
struct KubeconfigUserEntry {
    user: KubeconfigUser,
}

#[derive(Deserialize)]
struct KubeconfigUser {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct MinimalKubeconfig {
    #[serde(default)]
    clusters: Vec<KubeconfigClusterEntry>,
    #[serde(default)]
    users: Vec<KubeconfigUserEntry>,
}

/// Extract the decoded CA bundle from a kubeconfig document, if any
/// cluster entry carries `certificate-authority-data`.
pub fn extract_ca_from_kubeconfig(kubeconfig: &str) -> Option<Vec<u8>> {
    let parsed: MinimalKubeconfig = serde_yaml::from_str(kubeconfig).ok()?;
    parsed
        .clusters
        .iter()
        .find_map(|c| c.cluster.certificate_authority_data.as_deref())
        .and_then(|data| BASE64.decode(data.trim()).ok())
}

/// Extract the first user token from a kubeconfig document.
pub fn extract_token_from_kubeconfig(kubeconfig: &str) -> Option<String> {
    let parsed: MinimalKubeconfig = serde_yaml::from_str(kubeconfig).ok()?;
    parsed
        .users
        .into_iter()
        .find_map(|u| u.user.token)
        .filter(|t| !t.is_empty())
}

// =============================================================================
// Synthesized defaults
// =============================================================================

/// A minimally viable kubelet configuration: systemd cgroup driver, webhook
/// authn/authz against the cluster CA, certificate rotation on.
pub fn default_kubelet_config(cluster_dns: &str) -> String {
    format!(
        "apiVersion: kubelet.config.k8s.io/v1beta1\n\
         kind: KubeletConfiguration\n\
         authentication:\n\
         \x20 anonymous:\n\
         \x20   enabled: false\n\
         \x20 webhook:\n\
         \x20   cacheTTL: 2m0s\n\
         \x20   enabled: true\n\
         \x20 x509:\n\
         \x20   clientCAFile: /etc/kubernetes/pki/ca.crt\n\
         authorization:\n\
         \x20 mode: Webhook\n\
         \x20 webhook:\n\
         \x20   cacheAuthorizedTTL: 5m0s\n\
         \x20   cacheUnauthorizedTTL: 30s\n\
         cgroupDriver: systemd\n\
         clusterDNS:\n\
         - {cluster_dns}\n\
         clusterDomain: cluster.local\n\
         containerLogMaxFiles: 5\n\
         containerLogMaxSize: 10Mi\n\
         evictionHard:\n\
         \x20 imagefs.available: 15%\n\
         \x20 memory.available: 100Mi\n\
         \x20 nodefs.available: 10%\n\
         \x20 nodefs.inodesFree: 5%\n\
         evictionPressureTransitionPeriod: 5m0s\n\
         healthzBindAddress: 127.0.0.1\n\
         healthzPort: 10248\n\
         imageGCHighThresholdPercent: 85\n\
         imageGCLowThresholdPercent: 80\n\
         nodeStatusUpdateFrequency: 10s\n\
         rotateCertificates: true\n\
         runtimeRequestTimeout: 2m0s\n\
         staticPodPath: /etc/kubernetes/manifests\n\
         streamingConnectionIdleTimeout: 4h0m0s\n\
         syncFrequency: 1m0s\n\
         volumeStatsAggPeriod: 1m0s\n"
    )
}

/// A minimally viable kube-proxy configuration for binary deployments.
pub fn default_kube_proxy_config() -> String {
    "apiVersion: kubeproxy.config.k8s.io/v1alpha1\n\
     kind: KubeProxyConfiguration\n\
     bindAddress: 0.0.0.0\n\
     clientConnection:\n\
     \x20 burst: 10\n\
     \x20 contentType: application/vnd.kubernetes.protobuf\n\
     \x20 kubeconfig: /etc/kubernetes/kube-proxy.kubeconfig\n\
     \x20 qps: 5\n\
     clusterCIDR: \"\"\n\
     configSyncPeriod: 15m0s\n\
     conntrack:\n\
     \x20 maxPerCore: 32768\n\
     \x20 min: 131072\n\
     \x20 tcpCloseWaitTimeout: 1h0m0s\n\
     \x20 tcpEstablishedTimeout: 24h0m0s\n\
     enableProfiling: false\n\
     healthzBindAddress: 0.0.0.0:10256\n\
     iptables:\n\
     \x20 masqueradeAll: false\n\
     \x20 masqueradeBit: 14\n\
     \x20 syncPeriod: 30s\n\
     metricsBindAddress: 127.0.0.1:10249\n\
     mode: \"\"\n\
     oomScoreAdj: -999\n\
     clusterDomain: cluster.local\n"
        .to_string()
}

/// The conventional clusterDNS address for a services CIDR: the 10th IP of
/// the range (e.g. `10.96.0.0/12` -> `10.96.0.10`). Only IPv4 is handled;
/// anything else yields None.
pub fn cluster_dns_from_service_cidr(cidr: &str) -> Option<String> {
    let (base, _prefix) = cidr.split_once('/')?;
    let octets: Vec<u8> = base
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if octets.len() != 4 {
        return None;
    }
    let network = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    let dns = network + 10;
    let [a, b, c, d] = dns.to_be_bytes();
    Some(format!("{}.{}.{}.{}", a, b, c, d))
}

/// Derive the short `major.minor` from a version string like `v1.28.3+x`.
pub fn minor_version(version: &str) -> Option<String> {
    let trimmed = version.trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor_raw = parts.next()?;
    let minor: u32 = minor_raw
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some(format!("{}.{}", major, minor))
}

// =============================================================================
// Workload-cluster configuration source
// =============================================================================

/// Read-only view of the workload cluster used while assembling
/// TLS-bootstrap secrets. Abstracted so assembly is testable without a
/// cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConfigReader: Send + Sync {
    /// Fetch a ConfigMap's data, or None if it does not exist
    async fn config_map(&self, namespace: &str, name: &str)
        -> Result<Option<BTreeMap<String, String>>>;

    /// Fetch a Service's cluster IP, or None if it does not exist
    async fn service_cluster_ip(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// ClusterConfigReader backed by a kube client pointing at the workload
/// cluster.
pub struct RemoteConfigReader {
    client: Client,
}

impl RemoteConfigReader {
    /// Wrap a workload-cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterConfigReader for RemoteConfigReader {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(cm.data),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn service_cluster_ip(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(svc
                .spec
                .and_then(|s| s.cluster_ip)
                .filter(|ip| !ip.is_empty() && ip != "None")),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

/// Determine the clusterDNS address for synthesized kubelet configs:
/// the `kube-system/kube-dns` Service, then `kube-system/coredns`, then the
/// services-CIDR convention, then [`DEFAULT_CLUSTER_DNS`].
pub async fn derive_cluster_dns(
    reader: Option<&dyn ClusterConfigReader>,
    services_cidr: Option<&str>,
) -> String {
    if let Some(reader) = reader {
        for svc in ["kube-dns", "coredns"] {
            match reader.service_cluster_ip("kube-system", svc).await {
                Ok(Some(ip)) => {
                    debug!(service = svc, ip = %ip, "detected clusterDNS from service");
                    return ip;
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(service = svc, error = %e, "clusterDNS probe failed");
                    continue;
                }
            }
        }
    }

    if let Some(ip) = services_cidr.and_then(cluster_dns_from_service_cidr) {
        return ip;
    }

    DEFAULT_CLUSTER_DNS.to_string()
}

// =============================================================================
// TLS-bootstrap secret assembly
// =============================================================================

/// The assembled contents of a TLS-bootstrap secret.
#[derive(Debug, Default)]
pub struct TlsBootstrapAssembly {
    /// Raw PEM CA bundle
    pub ca_pem: Option<Vec<u8>>,
    /// Bootstrap kubeconfig document
    pub bootstrap_kubeconfig: Option<String>,
    /// KubeletConfiguration document
    pub kubelet_config: Option<String>,
    /// KubeProxyConfiguration document
    pub kube_proxy_config: Option<String>,
    /// kube-proxy kubeconfig document
    pub kube_proxy_kubeconfig: Option<String>,
}

impl TlsBootstrapAssembly {
    /// Materialize the assembly as the opaque secret the agent consumes.
    ///
    /// Fails when neither CA data nor a bootstrap kubeconfig could be
    /// sourced - a secret without either cannot bootstrap anything.
    pub fn into_secret(
        self,
        name: &str,
        namespace: &str,
        owner: OwnerReference,
    ) -> Result<Secret> {
        if self.ca_pem.is_none() && self.bootstrap_kubeconfig.is_none() {
            return Err(Error::bootstrap(
                "no CA certificate or bootstrap kubeconfig available for TLS bootstrap",
            ));
        }

        let mut data = BTreeMap::new();
        if let Some(ca) = self.ca_pem {
            data.insert("ca.crt".to_string(), ByteString(ca));
        }
        let mut put = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                data.insert(k.to_string(), ByteString(v.into_bytes()));
            }
        };
        put("bootstrap-kubeconfig", self.bootstrap_kubeconfig);
        put("kubelet-config.yaml", self.kubelet_config);
        put("kube-proxy-config.yaml", self.kube_proxy_config);
        put("kube-proxy.kubeconfig", self.kube_proxy_kubeconfig);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        })
    }
}

/// Inputs for TLS-bootstrap assembly that the machine controller gathers
/// before calling [`assemble_tls_bootstrap`].
pub struct TlsBootstrapInputs<'a> {
    /// Kubeconfig published by an explicitly referenced BootstrapCredential
    pub credential_kubeconfig: Option<String>,
    /// Data of the machine's kubeadm bootstrap secret, when one exists
    pub machine_secret_data: Option<&'a BTreeMap<String, ByteString>>,
    /// API server URL for freshly minted kubeconfigs
    pub api_server: String,
    /// Freshly minted join token (always minted for TLS bootstrap)
    pub token: &'a BootstrapToken,
    /// CA bundle for freshly minted kubeconfigs (service-account CA)
    pub local_ca_pem: Option<Vec<u8>>,
    /// Kubernetes version, for the versioned kubelet-config ConfigMap name
    pub kubernetes_version: Option<&'a str>,
}

/// Assemble the TLS-bootstrap payload from its sources, in priority order:
/// the referenced credential, the workload cluster's live ConfigMaps, the
/// machine's bootstrap secret, and finally synthesized defaults.
///
/// A fresh token is always minted by the caller for TLS bootstrap (never a
/// reused published credential) so joins cannot fail on expired tokens; the
/// referenced-credential path is the one deliberate exception, since the
/// user pinned it.
pub async fn assemble_tls_bootstrap(
    reader: Option<&dyn ClusterConfigReader>,
    inputs: TlsBootstrapInputs<'_>,
) -> TlsBootstrapAssembly {
    let mut out = TlsBootstrapAssembly::default();

    // Bootstrap kubeconfig: explicit credential wins, else mint fresh.
    if let Some(kubeconfig) = inputs.credential_kubeconfig {
        out.ca_pem = extract_ca_from_kubeconfig(&kubeconfig);
        out.bootstrap_kubeconfig = Some(kubeconfig);
        info!("using bootstrap kubeconfig from referenced credential");
    } else {
        // CA: secret-embedded ca.crt beats the local service-account CA.
        let secret_ca = inputs
            .machine_secret_data
            .and_then(|d| d.get("ca.crt"))
            .map(|b| b.0.clone());
        let ca = secret_ca.or(inputs.local_ca_pem);
        if let Some(ca) = ca {
            out.bootstrap_kubeconfig = Some(render_bootstrap_kubeconfig(
                &inputs.api_server,
                &ca,
                &inputs.token.as_string(),
            ));
            out.ca_pem = Some(ca);
            info!("minted fresh bootstrap kubeconfig");
        }
    }

    // kubelet config: versioned ConfigMap, unversioned ConfigMap, machine
    // secret, synthesized default.
    if let Some(reader) = reader {
        let mut names = Vec::new();
        if let Some(short) = inputs.kubernetes_version.and_then(minor_version) {
            names.push(format!("kubelet-config-{}", short));
        }
        names.push("kubelet-config".to_string());
        for name in names {
            match reader.config_map("kube-system", &name).await {
                Ok(Some(data)) => {
                    if let Some(config) = data.get("kubelet") {
                        info!(config_map = %name, "using kubelet config from target cluster");
                        out.kubelet_config = Some(config.clone());
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(config_map = %name, error = %e, "kubelet config fetch failed");
                    continue;
                }
            }
        }

        // kube-proxy config from the live cluster
        match reader.config_map("kube-system", "kube-proxy").await {
            Ok(Some(data)) => {
                if let Some(config) = data.get("config.conf").or_else(|| data.get("config.yaml")) {
                    info!("using kube-proxy config from target cluster");
                    out.kube_proxy_config = Some(config.clone());
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "kube-proxy config fetch failed"),
        }
    }

    if let Some(data) = inputs.machine_secret_data {
        if out.kubelet_config.is_none() {
            if let Some(config) = data.get("kubelet-config.yaml") {
                out.kubelet_config = Some(String::from_utf8_lossy(&config.0).into_owned());
            }
        }
        if let Some(kc) = data.get("kube-proxy.kubeconfig") {
            out.kube_proxy_kubeconfig = Some(String::from_utf8_lossy(&kc.0).into_owned());
        }
    }

    if out.kubelet_config.is_none() {
        let dns = derive_cluster_dns(reader, None).await;
        info!(cluster_dns = %dns, "synthesizing default kubelet config");
        out.kubelet_config = Some(default_kubelet_config(&dns));
    }
    if out.kube_proxy_config.is_none() {
        info!("synthesizing default kube-proxy config");
        out.kube_proxy_config = Some(default_kube_proxy_config());
    }
    if out.kube_proxy_kubeconfig.is_none() {
        let token = out
            .bootstrap_kubeconfig
            .as_deref()
            .and_then(extract_token_from_kubeconfig)
            .unwrap_or_else(|| inputs.token.as_string());
        let ca = out.ca_pem.clone().unwrap_or_default();
        out.kube_proxy_kubeconfig = Some(render_kube_proxy_kubeconfig(
            &inputs.api_server,
            &ca,
            &token,
        ));
    }

    out
}
