//! Error types for the hostpool provider

use thiserror::Error;

/// Main error type for hostpool operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for resource specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Bootstrap credential or node-bootstrap error
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Shell command rejected or failed on the host
    #[error("command error: {0}")]
    Command(String),

    /// Host cleanup error
    #[error("cleanup error: {0}")]
    Cleanup(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error on the host
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a command error with the given message
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a cleanup error with the given message
    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Host Lifecycle Operations
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during the
    // host lifecycle. Each error type represents a different failure category
    // with specific handling requirements in the reconcilers.

    /// Story: validation catches malformed specs before any claim happens
    ///
    /// When a user creates a BootstrapCredential with a bad API server URL,
    /// the validation layer rejects it with a message the user can act on.
    #[test]
    fn story_validation_rejects_bad_specs() {
        let err = Error::validation("apiServer must be a https://host:port URL");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("https://host:port"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: bootstrap errors surface credential assembly failures
    ///
    /// When neither the referenced credential nor the workload cluster can
    /// supply CA data, the assembly fails loudly instead of degrading.
    #[test]
    fn story_bootstrap_errors_surface_missing_sources() {
        let err = Error::bootstrap("no CA certificate or bootstrap kubeconfig available");
        assert!(err.to_string().contains("bootstrap error"));
        assert!(err.to_string().contains("no CA certificate"));
    }

    /// Story: command errors carry what the host refused to run
    ///
    /// The shell runner rejects commands with dangerous characters; the
    /// error names the rejection so the script author can see why.
    #[test]
    fn story_command_errors_name_the_rejection() {
        let err = Error::command("command contains forbidden character ';'");
        assert!(err.to_string().contains("command error"));
        assert!(err.to_string().contains("forbidden character"));
    }

    /// Story: errors are categorized for proper handling in reconcilers
    ///
    /// Different error types require different strategies in the
    /// reconciliation loop (requeue, surface to the user, proceed anyway).
    #[test]
    fn story_error_categorization_for_reconciler_handling() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Validation(_) => "await_spec_change", // user must fix the object
                Error::Kube(_) => "requeue",                 // API might recover
                Error::Bootstrap(_) => "requeue",            // sources may appear later
                Error::Command(_) => "surface_condition",    // visible on the Host
                Error::Cleanup(_) => "classify",             // permanent vs transient
                Error::Serialization(_) => "await_spec_change",
                Error::Io(_) => "requeue",
            }
        }

        assert_eq!(
            categorize(&Error::validation("bad spec")),
            "await_spec_change"
        );
        assert_eq!(categorize(&Error::bootstrap("no CA")), "requeue");
        assert_eq!(categorize(&Error::cleanup("reset failed")), "classify");
    }

    /// Story: error helpers accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let host = "host-42";
        let err = Error::cleanup(format!("uninstall failed on {}", host));
        assert!(err.to_string().contains("host-42"));

        let err = Error::command("static message");
        assert!(err.to_string().contains("static message"));
    }
}
