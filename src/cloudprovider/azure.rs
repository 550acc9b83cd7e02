//! Azure adapter
//!
//! Talks to the Azure Resource Manager REST API with a client-credentials
//! bearer token built from the mounted secret. The node's provider ID
//! carries the VM name in its last segment; the credentials carry the
//! resource group. Address mutations rewrite the primary NIC's
//! `ipConfigurations` list and are confirmed by polling the
//! `Azure-AsyncOperation` URL the NIC update returns.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{
    check_response, parse_provider_id, read_secret_data, segment_from_end, CloudProvider,
    CloudProviderError, CloudRequest, NodeSubnets, CLOUD_PROVIDER_POLL_INTERVAL,
    CLOUD_PROVIDER_TIMEOUT,
};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const COMPUTE_API_VERSION: &str = "2023-09-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";

/// Azure implementation of the cloud API wrapper
#[derive(Debug)]
pub struct Azure {
    http: reqwest::Client,
    client_id: String,
    tenant_id: String,
    client_secret: String,
    subscription_id: String,
    resource_group: String,
    token: Mutex<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct VirtualMachine {
    properties: VirtualMachineProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachineProperties {
    network_profile: NetworkProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterfaceReference>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterfaceReference {
    id: String,
    #[serde(default)]
    properties: Option<NetworkInterfaceReferenceProperties>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterfaceReferenceProperties {
    #[serde(default)]
    primary: Option<bool>,
}

/// A network interface as returned by the NIC endpoint. Unknown fields are
/// preserved through `extra` so a fetched interface can be PUT back intact.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct NetworkInterface {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    properties: NetworkInterfaceProperties,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NetworkInterfaceProperties {
    #[serde(default, rename = "ipConfigurations")]
    ip_configurations: Vec<InterfaceIpConfiguration>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct InterfaceIpConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    properties: InterfaceIpConfigurationProperties,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InterfaceIpConfigurationProperties {
    // Azure spells these with a capitalized "IP", which camelCase renaming
    // would not produce.
    #[serde(rename = "privateIPAddress", skip_serializing_if = "Option::is_none")]
    private_ip_address: Option<String>,
    #[serde(
        rename = "privateIPAllocationMethod",
        skip_serializing_if = "Option::is_none"
    )]
    private_ip_allocation_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_balancer_backend_address_pools: Option<serde_json::Value>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VirtualNetwork {
    properties: VirtualNetworkProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualNetworkProperties {
    address_space: Option<AddressSpace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressSpace {
    #[serde(default)]
    address_prefixes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AsyncOperation {
    status: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl Azure {
    /// Build the adapter from the mounted credentials.
    pub async fn new(secret_dir: &Path) -> Result<Self, CloudProviderError> {
        Ok(Self {
            http: reqwest::Client::new(),
            client_id: read_secret_data(secret_dir, "azure_client_id").await?,
            tenant_id: read_secret_data(secret_dir, "azure_tenant_id").await?,
            client_secret: read_secret_data(secret_dir, "azure_client_secret").await?,
            subscription_id: read_secret_data(secret_dir, "azure_subscription_id").await?,
            resource_group: read_secret_data(secret_dir, "azure_resourcegroup").await?,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String, CloudProviderError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }
        let url = format!(
            "{LOGIN_ENDPOINT}/{}/oauth2/v2.0/token",
            self.tenant_id.trim()
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.trim()),
                ("client_secret", self.client_secret.trim()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .await?;
        let token: TokenResponse = check_response(response).await?.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, CloudProviderError> {
        let token = self.bearer_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Ok(check_response(response).await?.json().await?)
    }

    async fn get_instance(&self, node: &Node) -> Result<VirtualMachine, CloudProviderError> {
        let segments = parse_provider_id(node)?;
        let vm_name = segment_from_end(&segments, 0)?;
        let url = format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{vm_name}?api-version={COMPUTE_API_VERSION}",
            self.subscription_id.trim(),
            self.resource_group.trim(),
        );
        self.get_json(&url).await
    }

    /// The primary NIC reference of the VM: the one flagged primary, or the
    /// only one when the VM has a single interface.
    fn primary_interface_id(instance: &VirtualMachine) -> Result<&str, CloudProviderError> {
        let interfaces = &instance.properties.network_profile.network_interfaces;
        interfaces
            .iter()
            .find(|i| {
                i.properties
                    .as_ref()
                    .and_then(|p| p.primary)
                    .unwrap_or(false)
            })
            .or_else(|| (interfaces.len() == 1).then(|| &interfaces[0]))
            .map(|i| i.id.as_str())
            .ok_or_else(|| {
                CloudProviderError::Api("VM has no primary network interface".to_string())
            })
    }

    async fn get_network_interface(
        &self,
        nic_id: &str,
    ) -> Result<NetworkInterface, CloudProviderError> {
        let url = format!("{MANAGEMENT_ENDPOINT}{nic_id}?api-version={NETWORK_API_VERSION}");
        self.get_json(&url).await
    }

    /// PUT the rewritten interface and hand back the async-operation URL the
    /// management API returns for the in-flight update.
    async fn update_network_interface(
        &self,
        nic_id: &str,
        interface: &NetworkInterface,
    ) -> Result<CloudRequest, CloudProviderError> {
        let token = self.bearer_token().await?;
        let url = format!("{MANAGEMENT_ENDPOINT}{nic_id}?api-version={NETWORK_API_VERSION}");
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(interface)
            .send()
            .await?;
        let response = check_response(response).await?;
        match response
            .headers()
            .get(ASYNC_OPERATION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(operation_url) => Ok(CloudRequest::AzureOperation {
                url: operation_url.to_string(),
            }),
            None => {
                debug!(nic = nic_id, "NIC update completed synchronously");
                Ok(CloudRequest::Completed)
            }
        }
    }
}

#[async_trait]
impl CloudProvider for Azure {
    async fn assign_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let nic_id = Self::primary_interface_id(&instance)?.to_string();
        let mut interface = self.get_network_interface(&nic_id).await?;

        if holds_address(&interface.properties.ip_configurations, ip) {
            return Err(CloudProviderError::AlreadyAssigned);
        }
        let first = interface
            .properties
            .ip_configurations
            .first()
            .ok_or_else(|| {
                CloudProviderError::Api("NIC carries no IP configurations".to_string())
            })?;
        let name = format!(
            "{}_{}",
            node.metadata.name.as_deref().unwrap_or_default(),
            ip
        );
        let new_configuration = InterfaceIpConfiguration {
            name: Some(name),
            properties: InterfaceIpConfigurationProperties {
                private_ip_address: Some(ip.to_string()),
                private_ip_allocation_method: Some("Static".to_string()),
                primary: Some(false),
                subnet: first.properties.subnet.clone(),
                load_balancer_backend_address_pools: first
                    .properties
                    .load_balancer_backend_address_pools
                    .clone(),
                ..Default::default()
            },
            extra: serde_json::Map::new(),
        };
        interface.properties.ip_configurations.push(new_configuration);
        self.update_network_interface(&nic_id, &interface).await
    }

    async fn release_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let nic_id = Self::primary_interface_id(&instance)?.to_string();
        let mut interface = self.get_network_interface(&nic_id).await?;

        interface.properties.ip_configurations =
            keep_configurations(interface.properties.ip_configurations, ip);
        self.update_network_interface(&nic_id, &interface).await
    }

    async fn wait_for_response(&self, request: &CloudRequest) -> Result<(), CloudProviderError> {
        let url = match request {
            CloudRequest::AzureOperation { url } => url,
            CloudRequest::Completed => return Ok(()),
            other => {
                return Err(CloudProviderError::Api(format!(
                    "unexpected request handle for the Azure provider: {other:?}"
                )))
            }
        };
        let deadline = Instant::now() + CLOUD_PROVIDER_TIMEOUT;
        loop {
            let operation: AsyncOperation = self.get_json(url).await?;
            match operation.status.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    return Err(CloudProviderError::Api(format!(
                        "NIC update {}: {}",
                        operation.status,
                        operation
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no error detail".to_string())
                    )))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(CloudProviderError::Timeout(
                    "NIC update did not complete".to_string(),
                ));
            }
            tokio::time::sleep(CLOUD_PROVIDER_POLL_INTERVAL).await;
        }
    }

    async fn get_node_subnet(&self, node: &Node) -> Result<NodeSubnets, CloudProviderError> {
        let instance = self.get_instance(node).await?;
        let nic_id = Self::primary_interface_id(&instance)?.to_string();
        let interface = self.get_network_interface(&nic_id).await?;

        let subnet_id = interface
            .properties
            .ip_configurations
            .iter()
            .find(|c| c.properties.primary.unwrap_or(false))
            .or_else(|| interface.properties.ip_configurations.first())
            .and_then(|c| c.properties.subnet.as_ref())
            .and_then(|s| s.get("id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                CloudProviderError::Api("primary IP configuration carries no subnet".to_string())
            })?;
        let vnet_name = virtual_network_name(subnet_id).ok_or_else(|| {
            CloudProviderError::Api(format!("cannot derive virtual network from {subnet_id}"))
        })?;

        let url = format!(
            "{MANAGEMENT_ENDPOINT}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{vnet_name}?api-version={NETWORK_API_VERSION}",
            self.subscription_id.trim(),
            self.resource_group.trim(),
        );
        let network: VirtualNetwork = self.get_json(&url).await?;
        let prefixes = network
            .properties
            .address_space
            .map(|s| s.address_prefixes)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CloudProviderError::Api("no subnet address prefixes defined".to_string())
            })?;
        split_address_prefixes(&prefixes)
    }
}

/// Whether any IP configuration already carries the address.
fn holds_address(configurations: &[InterfaceIpConfiguration], ip: IpAddr) -> bool {
    configurations.iter().any(|c| {
        c.properties
            .private_ip_address
            .as_deref()
            .and_then(|a| a.parse::<IpAddr>().ok())
            .is_some_and(|a| a == ip)
    })
}

/// The configuration list without any entry for the released address.
fn keep_configurations(
    configurations: Vec<InterfaceIpConfiguration>,
    ip: IpAddr,
) -> Vec<InterfaceIpConfiguration> {
    configurations
        .into_iter()
        .filter(|c| {
            c.properties
                .private_ip_address
                .as_deref()
                .and_then(|a| a.parse::<IpAddr>().ok())
                .map_or(true, |a| a != ip)
        })
        .collect()
}

/// The virtual network segment of a subnet resource ID, which has the shape
/// `.../virtualNetworks/<vnet>/subnets/<subnet>`.
fn virtual_network_name(subnet_id: &str) -> Option<&str> {
    let segments: Vec<&str> = subnet_id.split('/').collect();
    segments.len().checked_sub(3).map(|i| segments[i])
}

/// Split a VNet's address prefixes into one subnet per address family.
fn split_address_prefixes(prefixes: &[String]) -> Result<NodeSubnets, CloudProviderError> {
    let mut subnets = NodeSubnets::default();
    for prefix in prefixes {
        match prefix.parse::<ipnet::IpNet>() {
            Ok(ipnet::IpNet::V4(net)) => subnets.v4 = Some(net),
            Ok(ipnet::IpNet::V6(net)) => subnets.v6 = Some(net),
            Err(e) => {
                return Err(CloudProviderError::Api(format!(
                    "unable to parse address prefix {prefix}: {e}"
                )))
            }
        }
    }
    Ok(subnets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(name: &str, address: Option<&str>, primary: bool) -> InterfaceIpConfiguration {
        InterfaceIpConfiguration {
            name: Some(name.to_string()),
            properties: InterfaceIpConfigurationProperties {
                private_ip_address: address.map(str::to_string),
                primary: Some(primary),
                ..Default::default()
            },
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn duplicate_address_is_detected() {
        let configs = vec![
            configuration("primary", Some("10.0.0.4"), true),
            configuration("secondary", Some("10.0.0.5"), false),
        ];
        assert!(holds_address(&configs, "10.0.0.5".parse().unwrap()));
        assert!(!holds_address(&configs, "10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn release_keeps_every_other_configuration() {
        let configs = vec![
            configuration("primary", Some("10.0.0.4"), true),
            configuration("secondary", Some("10.0.0.5"), false),
            configuration("unaddressed", None, false),
        ];
        let kept = keep_configurations(configs, "10.0.0.5".parse().unwrap());
        let names: Vec<_> = kept.iter().filter_map(|c| c.name.as_deref()).collect();
        assert_eq!(names, vec!["primary", "unaddressed"]);
    }

    #[test]
    fn virtual_network_segment_is_third_from_the_end() {
        let id = "/subscriptions/d38f1e38/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/worker-vnet/subnets/worker-subnet";
        assert_eq!(virtual_network_name(id), Some("worker-vnet"));
    }

    #[test]
    fn address_prefixes_split_by_family() {
        let prefixes = vec!["10.0.0.0/16".to_string(), "fd00:abcd::/64".to_string()];
        let subnets = split_address_prefixes(&prefixes).unwrap();
        assert_eq!(subnets.v4.unwrap().to_string(), "10.0.0.0/16");
        assert_eq!(subnets.v6.unwrap().to_string(), "fd00:abcd::/64");
    }

    #[test]
    fn malformed_address_prefix_is_an_error() {
        let prefixes = vec!["not-a-cidr".to_string()];
        assert!(split_address_prefixes(&prefixes).is_err());
    }

    #[test]
    fn interface_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "name": "nic0",
            "location": "canadacentral",
            "properties": {
                "macAddress": "00-0D-3A-F0",
                "ipConfigurations": [{
                    "name": "primary",
                    "properties": {
                        "privateIPAddress": "10.0.0.4",
                        "primary": true,
                        "subnet": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/sn"}
                    }
                }]
            }
        });
        let interface: NetworkInterface = serde_json::from_value(raw.clone()).unwrap();
        let round_tripped = serde_json::to_value(&interface).unwrap();
        assert_eq!(round_tripped["location"], raw["location"]);
        assert_eq!(round_tripped["properties"]["macAddress"], "00-0D-3A-F0");
        assert_eq!(
            round_tripped["properties"]["ipConfigurations"][0]["properties"]["privateIPAddress"],
            "10.0.0.4"
        );
    }
}
