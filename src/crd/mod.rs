//! Custom Resource Definitions for the hostpool API group.
//!
//! Three first-class resources:
//! - [`Host`] - one registered machine in the pool
//! - [`PoolMachine`] - the infrastructure-side machine object bound to a host
//! - [`BootstrapCredential`] - a mintable bootstrap kubeconfig

pub mod bootstrap_credential;
pub mod host;
pub mod machine;
pub mod types;

pub use bootstrap_credential::{
    validate_api_server, BootstrapCredential, BootstrapCredentialSpec, BootstrapCredentialStatus,
};
pub use host::{Host, HostSpec, HostStatus};
pub use machine::{PoolMachine, PoolMachineSpec, PoolMachineStatus};
pub use types::*;
