//! Bootstrap join-token generation and materialization.
//!
//! Tokens follow the kubeadm shape `<id>.<secret>` with a 6-character id and
//! a 16-character secret drawn from `[a-z0-9]`. The id is public (it names
//! the secret object); the secret half authenticates the joining node and is
//! never logged.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use rand::Rng;

/// Namespace bootstrap token secrets live in, fixed by the API server's
/// bootstrap authenticator.
pub const TOKEN_NAMESPACE: &str = "kube-system";

/// Secret type recognized by the bootstrap authenticator.
pub const TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";

/// Extra group granted to nodes joining through hostpool tokens.
pub const TOKEN_EXTRA_GROUPS: &str = "system:bootstrappers:hostpool";

/// Time-to-live for minted bootstrap tokens.
pub const TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A bootstrap token in kubeadm format
#[derive(Clone)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a new random bootstrap token
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut random_part = |len: usize| -> String {
            (0..len)
                .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
                .collect()
        };
        Self {
            id: random_part(TOKEN_ID_LEN),
            secret: random_part(TOKEN_SECRET_LEN),
        }
    }

    /// The public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The full `<id>.<secret>` string embedded into kubeconfigs
    pub fn as_string(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    /// Name of the secret object materializing this token
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }

    /// Materialize the token as a secret the API server's bootstrap
    /// authenticator recognizes: opaque keys for id, secret, expiration and
    /// the usage flags, typed `bootstrap.kubernetes.io/token` in
    /// `kube-system`.
    pub fn into_secret(&self, ttl: Duration) -> Secret {
        let expiration = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let mut data = BTreeMap::new();
        let mut put = |k: &str, v: &str| {
            data.insert(k.to_string(), ByteString(v.as_bytes().to_vec()));
        };
        put("token-id", &self.id);
        put("token-secret", &self.secret);
        put("expiration", &expiration.to_rfc3339());
        put("usage-bootstrap-authentication", "true");
        put("usage-bootstrap-signing", "true");
        put("auth-extra-groups", TOKEN_EXTRA_GROUPS);

        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some(TOKEN_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some(TOKEN_SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret half must never reach logs
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Token format stories
    // =========================================================================
    //
    // The API server's bootstrap authenticator only accepts tokens of the
    // exact kubeadm shape; anything else fails node joins silently. These
    // tests pin the format.

    /// Generated tokens have a 6-char id and 16-char secret over [a-z0-9].
    #[test]
    fn generated_tokens_use_kubeadm_shape() {
        let token = BootstrapToken::generate();

        assert_eq!(token.id().len(), 6);
        let full = token.as_string();
        let (id, secret) = full.split_once('.').expect("token must contain a dot");
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(full
            .chars()
            .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    /// Two generated tokens differ (collision probability is negligible).
    #[test]
    fn generated_tokens_are_unique() {
        let a = BootstrapToken::generate();
        let b = BootstrapToken::generate();
        assert_ne!(a.as_string(), b.as_string());
    }

    /// Debug output shows the id for traceability but never the secret.
    #[test]
    fn debug_output_redacts_the_secret_half() {
        let token = BootstrapToken::generate();
        let debug = format!("{:?}", token);

        assert!(debug.contains(token.id()));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&token.as_string()));
    }

    // =========================================================================
    // Secret materialization stories
    // =========================================================================

    /// The materialized secret lands in kube-system with the bootstrap
    /// token type and the authentication/signing usage flags set.
    #[test]
    fn secret_carries_bootstrap_authenticator_contract() {
        let token = BootstrapToken::generate();
        let secret = token.into_secret(TOKEN_TTL);

        assert_eq!(secret.metadata.namespace.as_deref(), Some("kube-system"));
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some(token.secret_name().as_str())
        );
        assert_eq!(secret.type_.as_deref(), Some(TOKEN_SECRET_TYPE));

        let data = secret.data.expect("secret must carry data");
        let text = |k: &str| String::from_utf8(data[k].0.clone()).unwrap();
        assert_eq!(text("token-id"), token.id());
        assert_eq!(text("usage-bootstrap-authentication"), "true");
        assert_eq!(text("usage-bootstrap-signing"), "true");
        assert_eq!(text("auth-extra-groups"), TOKEN_EXTRA_GROUPS);
    }

    /// The expiration stamp sits roughly TTL in the future, RFC 3339 encoded.
    #[test]
    fn secret_expiration_honors_ttl() {
        let token = BootstrapToken::generate();
        let secret = token.into_secret(Duration::from_secs(1800));
        let data = secret.data.unwrap();
        let exp = String::from_utf8(data["expiration"].0.clone()).unwrap();

        let parsed = chrono::DateTime::parse_from_rfc3339(&exp).expect("valid RFC 3339");
        let delta = parsed.with_timezone(&Utc) - Utc::now();
        assert!(delta > chrono::Duration::seconds(1700));
        assert!(delta <= chrono::Duration::seconds(1800));
    }
}
