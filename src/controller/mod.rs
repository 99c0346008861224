//! Server-side controllers for the management plane.
//!
//! - [`machine`] - the scheduler/binder reconciling PoolMachines onto Hosts
//! - [`host`] - the cleanup state machine with forced reclamation
//! - [`credential`] - BootstrapCredential minting
//! - [`csr`] - certificate-signing-request auto-approval
//! - [`remote`] - workload-cluster client construction

pub mod credential;
pub mod csr;
pub mod host;
pub mod machine;
pub mod remote;
