//! AWS adapter
//!
//! Talks to the EC2 API with static credentials read from the mounted
//! secret. The node's provider ID carries the instance ID in its last
//! segment (`aws:///us-west-2a/i-008447f243eead273`). Address mutations go
//! against the instance's first network interface; the wait polls the
//! instance with a filter asserting the post-state address set is present.

use std::net::IpAddr;
use std::path::Path;

use aws_sdk_ec2::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, SdkError};
use aws_sdk_ec2::types::{Filter, Instance};
use aws_sdk_ec2::Client;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use super::{
    parse_provider_id, read_secret_data, segment_from_end, CloudProvider, CloudProviderError,
    CloudRequest, NodeSubnets, CLOUD_PROVIDER_POLL_INTERVAL, CLOUD_PROVIDER_TIMEOUT,
};

const INSTANCE_RUNNING_FILTER: &str = "instance-state-name";
const PRIVATE_IPV4_FILTER: &str = "network-interface.addresses.private-ip-address";
const IPV6_FILTER: &str = "network-interface.ipv6-addresses.ipv6-address";

/// AWS implementation of the cloud API wrapper
#[derive(Debug)]
pub struct Aws {
    client: Client,
}

impl Aws {
    /// Build the EC2 client from the mounted credentials and the region
    /// passed on the command line.
    pub async fn new(region: &str, secret_dir: &Path) -> Result<Self, CloudProviderError> {
        let access_key = read_secret_data(secret_dir, "aws_access_key_id").await?;
        let secret_key = read_secret_data(secret_dir, "aws_secret_access_key").await?;
        let credentials = Credentials::new(
            access_key.trim(),
            secret_key.trim(),
            None,
            None,
            "cloud-network-config-controller",
        );
        let config = aws_sdk_ec2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .build();
        Ok(Self {
            client: Client::from_conf(config),
        })
    }

    async fn get_instance(&self, node: &Node) -> Result<Instance, CloudProviderError> {
        let segments = parse_provider_id(node)?;
        let instance_id = segment_from_end(&segments, 0)?;
        let output = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(sdk_error)?;
        let mut instances: Vec<Instance> = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances().iter().cloned())
            .collect();
        match (instances.pop(), instances.is_empty()) {
            (Some(instance), true) => Ok(instance),
            _ => Err(CloudProviderError::Api(format!(
                "found conflicting instance replicas for node {}",
                node.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))),
        }
    }
}

#[async_trait]
impl CloudProvider for Aws {
    async fn assign_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let (instance_id, interface_id, existing) = primary_interface_addresses(&instance, ip)?;

        let (already_assigned, mut keep) = partition_addresses(&existing, ip);
        if already_assigned {
            return Err(CloudProviderError::AlreadyAssigned);
        }
        keep.push(ip.to_string());

        match ip {
            IpAddr::V6(_) => {
                self.client
                    .assign_ipv6_addresses()
                    .network_interface_id(&interface_id)
                    .set_ipv6_addresses(Some(keep.clone()))
                    .send()
                    .await
                    .map_err(sdk_error)?;
            }
            IpAddr::V4(_) => {
                self.client
                    .assign_private_ip_addresses()
                    .network_interface_id(&interface_id)
                    .set_private_ip_addresses(Some(keep.clone()))
                    .send()
                    .await
                    .map_err(sdk_error)?;
            }
        }

        Ok(CloudRequest::AwsWait {
            instance_id,
            ips: parse_addresses(&keep),
        })
    }

    async fn release_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let (instance_id, interface_id, existing) = primary_interface_addresses(&instance, ip)?;

        let (present, keep) = partition_addresses(&existing, ip);
        if present {
            match ip {
                IpAddr::V6(_) => {
                    self.client
                        .unassign_ipv6_addresses()
                        .network_interface_id(&interface_id)
                        .ipv6_addresses(ip.to_string())
                        .send()
                        .await
                        .map_err(sdk_error)?;
                }
                IpAddr::V4(_) => {
                    self.client
                        .unassign_private_ip_addresses()
                        .network_interface_id(&interface_id)
                        .private_ip_addresses(ip.to_string())
                        .send()
                        .await
                        .map_err(sdk_error)?;
                }
            }
        } else {
            debug!(ip = %ip, "IP not present on the interface, nothing to release");
        }

        // The wait only asserts the kept set is present. A direct absence
        // assertion is not available through the instance filters.
        Ok(CloudRequest::AwsWait {
            instance_id,
            ips: parse_addresses(&keep),
        })
    }

    async fn wait_for_response(&self, request: &CloudRequest) -> Result<(), CloudProviderError> {
        let CloudRequest::AwsWait { instance_id, ips } = request else {
            return Err(CloudProviderError::Api(format!(
                "unexpected request handle for the AWS provider: {request:?}"
            )));
        };

        let mut filters = vec![Filter::builder()
            .name(INSTANCE_RUNNING_FILTER)
            .values("running")
            .build()];
        let v4: Vec<String> = ips
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(|ip| ip.to_string())
            .collect();
        let v6: Vec<String> = ips
            .iter()
            .filter(|ip| ip.is_ipv6())
            .map(|ip| ip.to_string())
            .collect();
        if !v4.is_empty() {
            filters.push(
                Filter::builder()
                    .name(PRIVATE_IPV4_FILTER)
                    .set_values(Some(v4))
                    .build(),
            );
        }
        if !v6.is_empty() {
            filters.push(
                Filter::builder()
                    .name(IPV6_FILTER)
                    .set_values(Some(v6))
                    .build(),
            );
        }

        let deadline = tokio::time::Instant::now() + CLOUD_PROVIDER_TIMEOUT;
        loop {
            let output = self
                .client
                .describe_instances()
                .instance_ids(instance_id.clone())
                .set_filters(Some(filters.clone()))
                .send()
                .await
                .map_err(sdk_error)?;
            let matched = output
                .reservations()
                .iter()
                .any(|r| !r.instances().is_empty());
            if matched {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudProviderError::Timeout(format!(
                    "instance {instance_id} did not reach the expected address set"
                )));
            }
            tokio::time::sleep(CLOUD_PROVIDER_POLL_INTERVAL).await;
        }
    }

    async fn get_node_subnet(&self, node: &Node) -> Result<NodeSubnets, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let subnet_id = instance.subnet_id().ok_or_else(|| {
            CloudProviderError::Api("instance carries no subnet ID".to_string())
        })?;
        let output = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(|e| CloudProviderError::Api(format!("cannot list ec2 subnets: {}", DisplayErrorContext(&e))))?;
        let subnets = output.subnets();
        if subnets.len() > 1 {
            return Err(CloudProviderError::Api(format!(
                "multiple subnets found for the subnet ID: {subnet_id}"
            )));
        }
        let subnet = subnets.first().ok_or_else(|| {
            CloudProviderError::Api(format!("no subnet found for the subnet ID: {subnet_id}"))
        })?;

        let mut result = NodeSubnets::default();
        if let Some(cidr) = subnet.cidr_block().filter(|c| !c.is_empty()) {
            result.v4 = Some(cidr.parse().map_err(|e| {
                CloudProviderError::Api(format!("unable to parse IPv4 subnet {cidr}: {e}"))
            })?);
        }
        // Several IPv6 CIDR blocks on one subnet are not meaningful here,
        // take the first.
        if let Some(cidr) = subnet
            .ipv6_cidr_block_association_set()
            .first()
            .and_then(|a| a.ipv6_cidr_block())
            .filter(|c| !c.is_empty())
        {
            result.v6 = Some(cidr.parse().map_err(|e| {
                CloudProviderError::Api(format!("unable to parse IPv6 subnet {cidr}: {e}"))
            })?);
        }
        Ok(result)
    }
}

fn sdk_error<E>(err: SdkError<E>) -> CloudProviderError
where
    E: std::error::Error + 'static,
{
    CloudProviderError::Api(format!("{}", DisplayErrorContext(&err)))
}

/// The instance ID, first interface ID, and that interface's currently
/// assigned addresses of the target family.
fn primary_interface_addresses(
    instance: &Instance,
    ip: IpAddr,
) -> Result<(String, String, Vec<String>), CloudProviderError> {
    let instance_id = instance
        .instance_id()
        .ok_or_else(|| CloudProviderError::Api("instance carries no ID".to_string()))?
        .to_string();
    let interface = instance.network_interfaces().first().ok_or_else(|| {
        CloudProviderError::Api(format!(
            "instance {instance_id} has no network interfaces"
        ))
    })?;
    let interface_id = interface
        .network_interface_id()
        .ok_or_else(|| CloudProviderError::Api("network interface carries no ID".to_string()))?
        .to_string();
    let existing: Vec<String> = match ip {
        IpAddr::V6(_) => interface
            .ipv6_addresses()
            .iter()
            .filter_map(|a| a.ipv6_address().map(str::to_string))
            .collect(),
        IpAddr::V4(_) => interface
            .private_ip_addresses()
            .iter()
            .filter_map(|a| a.private_ip_address().map(str::to_string))
            .collect(),
    };
    Ok((instance_id, interface_id, existing))
}

/// Split the interface's address set around the target: whether the target
/// is present, and the remaining addresses.
fn partition_addresses(existing: &[String], target: IpAddr) -> (bool, Vec<String>) {
    let mut present = false;
    let mut keep = Vec::with_capacity(existing.len());
    for address in existing {
        match address.parse::<IpAddr>() {
            Ok(parsed) if parsed == target => present = true,
            _ => keep.push(address.clone()),
        }
    }
    (present, keep)
}

fn parse_addresses(addresses: &[String]) -> Vec<IpAddr> {
    addresses
        .iter()
        .filter_map(|a| a.parse::<IpAddr>().ok())
        .collect()
}
