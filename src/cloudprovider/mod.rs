//! Cloud provider abstraction
//!
//! The reconcilers drive the cloud through a small capability trait:
//! assign/release a private IP on the primary NIC of the VM backing a node,
//! wait for the cloud to acknowledge an in-flight request, and look up the
//! node's subnet CIDRs. Each cloud gets its own adapter; the fake adapter
//! backs the test suites.

mod aws;
mod azure;
pub mod credentials;
mod fake;
mod gcp;

pub use aws::Aws;
pub use azure::Azure;
pub use fake::FakeCloudProvider;
pub use gcp::Gcp;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;

/// How often an adapter polls the cloud while waiting for a response
pub(crate) const CLOUD_PROVIDER_POLL_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(2);

/// How long an adapter waits for the cloud to acknowledge a request
pub(crate) const CLOUD_PROVIDER_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(120);

/// Errors surfaced by the cloud provider adapters
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloudProviderError {
    /// The requested IP is already assigned to the node's interface. This is
    /// the one error the reconciler interprets semantically: it proves a
    /// previous assignment went through and the sync can converge without a
    /// new cloud mutation.
    #[error("the requested IP is already assigned")]
    AlreadyAssigned,

    /// The cloud API rejected or failed a request
    #[error("cloud API error: {0}")]
    Api(String),

    /// The mounted credentials could not be read or parsed
    #[error("unable to read secret data: {0}")]
    Credentials(String),

    /// The requested provider is not one of aws, azure, gcp
    #[error("unsupported cloud provider: {0}")]
    UnsupportedProvider(String),

    /// The node's provider ID is missing or malformed
    #[error("malformed provider ID: {0}")]
    ProviderId(String),

    /// The cloud did not acknowledge the request within the poll window
    #[error("timed out waiting for cloud response: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for CloudProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// Opaque token returned by assign/release and consumed by
/// [`CloudProvider::wait_for_response`]. Each provider stores whatever it
/// needs to locate the in-flight request; the wait dispatches on the tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudRequest {
    /// AWS: poll the instance until the given address set is visible
    AwsWait {
        /// EC2 instance ID the mutation was issued against
        instance_id: String,
        /// Post-state IP set that must be present on the interface
        ips: Vec<IpAddr>,
    },
    /// Azure: poll the async-operation URL returned by the NIC update
    AzureOperation {
        /// Azure-AsyncOperation URL to poll for completion
        url: String,
    },
    /// GCP: wait on a zone operation
    GcpOperation {
        /// Project the operation belongs to
        project: String,
        /// Zone the operation runs in
        zone: String,
        /// Operation name
        name: String,
    },
    /// The request completed synchronously, nothing to wait for
    Completed,
}

/// The node's subnet CIDRs per address family, as reported for the primary
/// network interface. A family the cloud does not carry is `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeSubnets {
    /// IPv4 subnet of the primary interface
    pub v4: Option<Ipv4Net>,
    /// IPv6 subnet of the primary interface
    pub v6: Option<Ipv6Net>,
}

/// Capability surface the reconcilers depend on.
///
/// All operations address the *first* network interface of the VM backing
/// the node. Implementations must read the current interface state from the
/// cloud before computing a new IP set, so that concurrent assignments to
/// the same node compose.
#[async_trait]
pub trait CloudProvider: Send + Sync + std::fmt::Debug {
    /// Assign the IP to the node's primary interface. Returns
    /// [`CloudProviderError::AlreadyAssigned`] if the IP is already there.
    async fn assign_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError>;

    /// Release the IP from the node's primary interface.
    async fn release_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError>;

    /// Block until the cloud acknowledges the request identified by the
    /// handle, or fail. Idempotent within one handle and callable from any
    /// worker.
    async fn wait_for_response(&self, request: &CloudRequest) -> Result<(), CloudProviderError>;

    /// Retrieve the IPv4/IPv6 subnets of the node's primary interface.
    async fn get_node_subnet(&self, node: &Node) -> Result<NodeSubnets, CloudProviderError>;
}

/// Build the adapter for the named provider, loading its credentials from
/// the mounted secret directory. `region` is required for AWS.
pub async fn new_cloud_provider_client(
    provider: &str,
    region: Option<&str>,
    secret_dir: &Path,
) -> Result<Arc<dyn CloudProvider>, CloudProviderError> {
    match provider.to_lowercase().as_str() {
        "aws" => {
            let region = region.ok_or_else(|| {
                CloudProviderError::Credentials(
                    "the AWS provider requires a cloud region".to_string(),
                )
            })?;
            Ok(Arc::new(Aws::new(region, secret_dir).await?))
        }
        "azure" => Ok(Arc::new(Azure::new(secret_dir).await?)),
        "gcp" => Ok(Arc::new(Gcp::new(secret_dir).await?)),
        other => Err(CloudProviderError::UnsupportedProvider(other.to_string())),
    }
}

/// Read one key of the mounted cloud-credentials secret.
pub(crate) async fn read_secret_data(
    secret_dir: &Path,
    key: &str,
) -> Result<String, CloudProviderError> {
    let path: PathBuf = secret_dir.join(key);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| CloudProviderError::Credentials(format!("{}: {e}", path.display())))
}

/// Fail a REST call on a non-success status, carrying the response body in
/// the error for operator diagnosis.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, CloudProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(CloudProviderError::Api(format!("{status}: {body}")))
}

/// Split a node's provider ID into its `/`-separated segments. Adapters
/// address the trailing segments positionally (AWS: `[-1]` = instance ID,
/// Azure: `[-1]` = VM name, GCP: `[-3..]` = project/zone/name).
pub(crate) fn parse_provider_id(node: &Node) -> Result<Vec<&str>, CloudProviderError> {
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            CloudProviderError::ProviderId(format!(
                "node {} has no provider ID",
                node.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
    Ok(provider_id.split('/').collect())
}

/// The provider ID segment `n` positions from the end.
pub(crate) fn segment_from_end<'a>(
    segments: &[&'a str],
    n: usize,
) -> Result<&'a str, CloudProviderError> {
    segments
        .len()
        .checked_sub(n + 1)
        .and_then(|i| segments.get(i).copied())
        .ok_or_else(|| {
            CloudProviderError::ProviderId(format!(
                "provider ID has only {} segments",
                segments.len()
            ))
        })
}
