//! BootstrapCredential Custom Resource Definition
//!
//! A BootstrapCredential yields, once reconciled, a usable bootstrap
//! kubeconfig: the credential controller mints a short-lived join token,
//! embeds it together with the decoded CA data and API-server URL, and
//! publishes the result into the status.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Specification of a BootstrapCredential
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hostpool.dev",
    version = "v1alpha1",
    kind = "BootstrapCredential",
    plural = "bootstrapcredentials",
    shortname = "bcred",
    status = "BootstrapCredentialStatus",
    namespaced,
    printcolumn = r#"{"name":"APIServer","type":"string","jsonPath":".spec.apiServer"}"#,
    printcolumn = r#"{"name":"SecretCreated","type":"boolean","jsonPath":".status.tokenSecretCreated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapCredentialSpec {
    /// API server URL; must be `https://<host>:<port>`
    #[serde(default)]
    pub api_server: String,

    /// Base64-encoded PEM CA bundle for the API server
    #[serde(default)]
    pub certificate_authority_data: String,
}

/// Observed state of a BootstrapCredential
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapCredentialStatus {
    /// The assembled bootstrap kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_kubeconfig_data: Option<String>,

    /// Name of the bootstrap token secret backing the kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_name: Option<String>,

    /// True once the token secret has been created
    #[serde(default)]
    pub token_secret_created: bool,

    /// Conditions of the credential (validation failures surface here)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<crate::crd::types::Condition>,
}

impl BootstrapCredentialSpec {
    /// Validate the spec: the API server must be a syntactically valid
    /// `https://host:port` and the CA data must base64-decode to at least
    /// one PEM block.
    pub fn validate(&self) -> Result<()> {
        validate_api_server(&self.api_server)?;

        let decoded = BASE64
            .decode(self.certificate_authority_data.trim())
            .map_err(|e| {
                Error::validation(format!("certificateAuthorityData is not base64: {}", e))
            })?;
        let pem = String::from_utf8_lossy(&decoded);
        if !pem.contains("-----BEGIN") {
            return Err(Error::validation(
                "certificateAuthorityData does not decode to a PEM block",
            ));
        }

        Ok(())
    }

    /// Decode the CA bundle to raw PEM bytes.
    pub fn decoded_ca(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.certificate_authority_data.trim())
            .map_err(|e| Error::validation(format!("certificateAuthorityData is not base64: {}", e)))
    }
}

/// Validate an API server URL: https scheme, a host, and a port.
pub fn validate_api_server(api_server: &str) -> Result<()> {
    let Some(rest) = api_server.strip_prefix("https://") else {
        return Err(Error::validation(format!(
            "apiServer {:?} must use the https scheme",
            api_server
        )));
    };

    let authority = rest.split('/').next().unwrap_or_default();
    let Some((host, port)) = authority.rsplit_once(':') else {
        return Err(Error::validation(format!(
            "apiServer {:?} must include a port",
            api_server
        )));
    };

    if host.is_empty() {
        return Err(Error::validation(format!(
            "apiServer {:?} is missing a host",
            api_server
        )));
    }
    if port.parse::<u16>().is_err() {
        return Err(Error::validation(format!(
            "apiServer {:?} has an invalid port {:?}",
            api_server, port
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn spec(api_server: &str, ca_pem: &str) -> BootstrapCredentialSpec {
        BootstrapCredentialSpec {
            api_server: api_server.to_string(),
            certificate_authority_data: BASE64.encode(ca_pem),
        }
    }

    // =========================================================================
    // API server validation stories
    // =========================================================================
    //
    // The URL ends up verbatim inside every bootstrap kubeconfig handed to a
    // joining kubelet, so malformed values must be caught at the credential,
    // not on the host.

    /// A well-formed https URL with host and port validates.
    #[test]
    fn valid_https_host_port_is_accepted() {
        assert!(spec("https://10.0.0.1:6443", SAMPLE_PEM).validate().is_ok());
        assert!(spec("https://cp.example.com:443", SAMPLE_PEM)
            .validate()
            .is_ok());
    }

    /// http, missing ports and missing hosts are each rejected with a
    /// message naming the field.
    #[test]
    fn malformed_api_servers_are_rejected() {
        for bad in [
            "http://10.0.0.1:6443",
            "https://10.0.0.1",
            "https://:6443",
            "https://host:notaport",
            "",
        ] {
            let err = spec(bad, SAMPLE_PEM).validate().unwrap_err();
            assert!(
                err.to_string().contains("apiServer"),
                "error for {:?} should name apiServer, got: {}",
                bad,
                err
            );
        }
    }

    // =========================================================================
    // CA data validation stories
    // =========================================================================

    /// CA data must be base64 and must decode to a PEM block.
    #[test]
    fn ca_data_must_decode_to_pem() {
        let mut s = spec("https://10.0.0.1:6443", SAMPLE_PEM);
        assert!(s.validate().is_ok());

        s.certificate_authority_data = "!!!not-base64!!!".to_string();
        assert!(s.validate().is_err());

        s.certificate_authority_data = BASE64.encode("just some text");
        assert!(s.validate().is_err());
    }

    /// decoded_ca returns the raw PEM bytes that get embedded in configs.
    #[test]
    fn decoded_ca_round_trips() {
        let s = spec("https://10.0.0.1:6443", SAMPLE_PEM);
        assert_eq!(s.decoded_ca().unwrap(), SAMPLE_PEM.as_bytes());
    }
}
