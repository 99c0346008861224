//! Hostpool - Cluster API infrastructure provider for pre-registered hosts
//!
//! Hostpool turns a pool of idle physical or virtual machines into cluster
//! nodes on demand. Users register hosts; the controllers claim them for
//! logical machines, drive Kubernetes installation and node bootstrap on
//! them, and return them to the pool when released.
//!
//! # Architecture
//!
//! Two processes share this crate:
//! - The **controller** runs in the management plane and reconciles
//!   [`crd::PoolMachine`] objects against registered [`crd::Host`]s:
//!   capacity-aware selection, lease-based claim arbitration, cleanup
//!   timeouts with forced reclamation, bootstrap credential minting, and
//!   CSR auto-approval.
//! - The **agent** runs on every candidate host. It registers the host,
//!   watches its own Host object, installs and uninstalls Kubernetes
//!   components, bootstraps the node (kubeadm or TLS-bootstrap), and keeps
//!   OS invariants asserted.
//!
//! Mutual exclusion across controller replicas and the agent is achieved
//! entirely through optimistic-concurrency writes on the object store; no
//! process holds a long-lived local lock.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Host, PoolMachine, BootstrapCredential)
//! - [`controller`] - Server-side reconcilers (machine, host, credential, CSR)
//! - [`bootstrap`] - Join-token minting and bootstrap config synthesis
//! - [`agent`] - Host-side reconciler, registration, drift detection, metrics
//! - [`retry`] - Bounded retry with backoff
//! - [`error`] - Error types for the provider

#![deny(missing_docs)]

pub mod agent;
pub mod bootstrap;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default namespace for Host and PoolMachine objects
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default listen address for the agent metrics endpoint
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8081";

/// Default path binaries and bundles are downloaded to on a host
pub const DEFAULT_DOWNLOAD_PATH: &str = "/var/lib/hostpool/bundles";

/// Default interval between agent host-status refreshes
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Default interval between drift-detector sweeps
pub const DEFAULT_DRIFT_INTERVAL_SECS: u64 = 300;
