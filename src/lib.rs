//! Cloud Network Config Controller
//!
//! Reconciles cluster-scoped `CloudPrivateIPConfig` resources against the
//! cloud API so that the private IP named by a resource ends up assigned to
//! the primary network interface of the VM backing `spec.node`. A second
//! control loop annotates every node with the subnet CIDRs of its primary
//! interface, and a third watches the mounted cloud-credentials secret and
//! restarts the process on rotation.
//!
//! # Modules
//!
//! - [`crd`] - The CloudPrivateIPConfig custom resource and its condition model
//! - [`cloudprovider`] - Cloud API adapters (AWS, Azure, GCP) behind one trait
//! - [`controller`] - The reconcilers (CloudPrivateIPConfig, Node, Secret)
//! - [`webhook`] - Admission validator for `spec.node`
//! - [`leader_election`] - Singleton guarantee via a coordination Lease
//! - [`signals`] - Graceful shutdown on SIGINT/SIGTERM
//! - [`retry`] - Bounded backoff for conflict-prone API writes
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cloudprovider;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod retry;
pub mod signals;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the Lease used for leader election, created in the pod's namespace
pub const LEADER_LOCK_NAME: &str = "cloud-network-config-controller-lock";

/// Directory where the cloud-credentials secret is mounted
pub const CLOUD_PROVIDER_SECRET_LOCATION: &str = "/etc/secret/cloudprovider/";

/// Directory where the webhook's serving certificate is mounted
pub const WEBHOOK_TLS_LOCATION: &str = "/run/secrets/tls";
