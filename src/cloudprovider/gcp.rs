//! GCP adapter
//!
//! Talks to the Compute Engine REST API with a bearer token minted from the
//! mounted service-account key (RS256 JWT exchanged at the token endpoint).
//! The node's provider ID carries `project/zone/instance` in its trailing
//! segments (`gce://openshift-gce-devel-ci/us-east1-b/master-0`). Private
//! IPs are modeled as alias IP ranges on the instance's first interface;
//! mutations are confirmed through the zone-operations wait endpoint.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    check_response, parse_provider_id, read_secret_data, segment_from_end, CloudProvider,
    CloudProviderError, CloudRequest, NodeSubnets, CLOUD_PROVIDER_POLL_INTERVAL,
    CLOUD_PROVIDER_TIMEOUT,
};

const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// GCP implementation of the cloud API wrapper
#[derive(Debug)]
pub struct Gcp {
    http: reqwest::Client,
    key: ServiceAccountKey,
    token: Mutex<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    project_id: String,
    private_key: String,
    client_email: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

/// A network interface as returned by the instances endpoint. Unknown fields
/// (including the fingerprint the update requires) are preserved through
/// `extra` so the fetched interface can be patched back.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnetwork: Option<String>,
    // Always serialized: omitting the field in the update would leave the
    // cloud's alias list untouched, and a release must clear entries.
    #[serde(default)]
    alias_ip_ranges: Vec<AliasIpRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AliasIpRange {
    ip_cidr_range: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subnetwork {
    #[serde(default)]
    ip_cidr_range: Option<String>,
    #[serde(default)]
    ipv6_cidr_range: Option<String>,
}

impl Gcp {
    /// Build the adapter from the mounted `service_account.json`.
    pub async fn new(secret_dir: &Path) -> Result<Self, CloudProviderError> {
        let raw = read_secret_data(secret_dir, "service_account.json").await?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| CloudProviderError::Credentials(format!("service_account.json: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            key,
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
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: COMPUTE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| CloudProviderError::Credentials(format!("service account key: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| CloudProviderError::Credentials(format!("signing token request: {e}")))?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
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

    async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Instance, CloudProviderError> {
        let url = format!("{COMPUTE_ENDPOINT}/projects/{project}/zones/{zone}/instances/{name}");
        self.get_json(&url).await
    }

    async fn update_network_interface(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        interface: &NetworkInterface,
    ) -> Result<Operation, CloudProviderError> {
        let interface_name = interface.name.as_deref().ok_or_else(|| {
            CloudProviderError::Api("network interface carries no name".to_string())
        })?;
        let url = format!(
            "{COMPUTE_ENDPOINT}/projects/{project}/zones/{zone}/instances/{instance}/updateNetworkInterface?networkInterface={interface_name}"
        );
        let token = self.bearer_token().await?;
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(interface)
            .send()
            .await?;
        Ok(check_response(response).await?.json().await?)
    }

    /// The `(project, zone, instance)` triple from the node's provider ID.
    fn instance_path(node: &Node) -> Result<(String, String, String), CloudProviderError> {
        let segments = parse_provider_id(node)?;
        Ok((
            segment_from_end(&segments, 2)?.to_string(),
            segment_from_end(&segments, 1)?.to_string(),
            segment_from_end(&segments, 0)?.to_string(),
        ))
    }
}

#[async_trait]
impl CloudProvider for Gcp {
    async fn assign_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let (project, zone, name) = Self::instance_path(node)?;
        let instance = self.get_instance(&project, &zone, &name).await?;
        let mut interface = instance
            .network_interfaces
            .into_iter()
            .next()
            .ok_or_else(|| {
                CloudProviderError::Api(format!("instance {name} has no network interfaces"))
            })?;

        if alias_conflict(&interface.alias_ip_ranges, ip) {
            return Err(CloudProviderError::AlreadyAssigned);
        }
        interface.alias_ip_ranges.push(AliasIpRange {
            ip_cidr_range: ip.to_string(),
            extra: serde_json::Map::new(),
        });
        let operation = self
            .update_network_interface(&project, &zone, &name, &interface)
            .await?;
        Ok(CloudRequest::GcpOperation {
            project,
            zone,
            name: operation.name,
        })
    }

    async fn release_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        let (project, zone, name) = Self::instance_path(node)?;
        let instance = self.get_instance(&project, &zone, &name).await?;
        let mut interface = instance
            .network_interfaces
            .into_iter()
            .next()
            .ok_or_else(|| {
                CloudProviderError::Api(format!("instance {name} has no network interfaces"))
            })?;

        interface.alias_ip_ranges = keep_aliases(interface.alias_ip_ranges, ip);
        let operation = self
            .update_network_interface(&project, &zone, &name, &interface)
            .await?;
        Ok(CloudRequest::GcpOperation {
            project,
            zone,
            name: operation.name,
        })
    }

    async fn wait_for_response(&self, request: &CloudRequest) -> Result<(), CloudProviderError> {
        let CloudRequest::GcpOperation {
            project,
            zone,
            name,
        } = request
        else {
            return Err(CloudProviderError::Api(format!(
                "unexpected request handle for the GCP provider: {request:?}"
            )));
        };
        let url = format!(
            "{COMPUTE_ENDPOINT}/projects/{project}/zones/{zone}/operations/{name}/wait"
        );
        let deadline = Instant::now() + CLOUD_PROVIDER_TIMEOUT;
        loop {
            let token = self.bearer_token().await?;
            let response = self.http.post(&url).bearer_auth(token).send().await?;
            let operation: Operation = check_response(response).await?.json().await?;
            if operation.status.as_deref() == Some("DONE") {
                return match operation.error {
                    None => Ok(()),
                    Some(error) => Err(CloudProviderError::Api(format!(
                        "operation {name} failed: {error}"
                    ))),
                };
            }
            if Instant::now() >= deadline {
                return Err(CloudProviderError::Timeout(format!(
                    "operation {name} did not complete"
                )));
            }
            tokio::time::sleep(CLOUD_PROVIDER_POLL_INTERVAL).await;
        }
    }

    async fn get_node_subnet(&self, node: &Node) -> Result<NodeSubnets, CloudProviderError> {
        let (project, zone, name) = Self::instance_path(node)?;
        let instance = self.get_instance(&project, &zone, &name).await?;
        let subnetwork_url = instance
            .network_interfaces
            .first()
            .and_then(|i| i.subnetwork.as_deref())
            .ok_or_else(|| {
                CloudProviderError::Api(format!("instance {name} has no subnetwork"))
            })?;
        let (region, subnet) = parse_subnetwork_url(subnetwork_url).ok_or_else(|| {
            CloudProviderError::Api(format!("cannot parse subnetwork URL {subnetwork_url}"))
        })?;

        let url = format!(
            "{COMPUTE_ENDPOINT}/projects/{}/regions/{region}/subnetworks/{subnet}",
            self.key.project_id
        );
        let subnetwork: Subnetwork = self.get_json(&url).await?;

        let mut subnets = NodeSubnets::default();
        if let Some(cidr) = subnetwork.ip_cidr_range.filter(|c| !c.is_empty()) {
            subnets.v4 = cidr.parse().ok();
        }
        if let Some(cidr) = subnetwork.ipv6_cidr_range.filter(|c| !c.is_empty()) {
            subnets.v6 = cidr.parse().ok();
        }
        Ok(subnets)
    }
}

/// Whether the alias list already covers the IP, either as an exact entry or
/// through an enclosing CIDR.
fn alias_conflict(ranges: &[AliasIpRange], ip: IpAddr) -> bool {
    ranges.iter().any(|range| {
        if let Ok(assigned) = range.ip_cidr_range.parse::<IpAddr>() {
            return assigned == ip;
        }
        if let Ok(net) = range.ip_cidr_range.parse::<IpNet>() {
            return net.contains(&ip);
        }
        false
    })
}

/// The alias list without any entry whose address or CIDR base equals the
/// released IP.
fn keep_aliases(ranges: Vec<AliasIpRange>, ip: IpAddr) -> Vec<AliasIpRange> {
    ranges
        .into_iter()
        .filter(|range| {
            if let Ok(assigned) = range.ip_cidr_range.parse::<IpAddr>() {
                return assigned != ip;
            }
            if let Ok(net) = range.ip_cidr_range.parse::<IpNet>() {
                return net.addr() != ip;
            }
            true
        })
        .collect()
}

/// GCP subnetwork URLs end in `.../regions/<region>/subnetworks/<name>`.
fn parse_subnetwork_url(url: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = url.split('/').collect();
    let region = segments.len().checked_sub(3).map(|i| segments[i])?;
    let name = segments.last()?;
    Some((region.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(range: &str) -> AliasIpRange {
        AliasIpRange {
            ip_cidr_range: range.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn exact_alias_is_a_conflict() {
        let ranges = vec![alias("10.0.32.5")];
        assert!(alias_conflict(&ranges, "10.0.32.5".parse().unwrap()));
        assert!(!alias_conflict(&ranges, "10.0.32.6".parse().unwrap()));
    }

    #[test]
    fn enclosing_cidr_is_a_conflict() {
        let ranges = vec![alias("10.0.32.0/28")];
        assert!(alias_conflict(&ranges, "10.0.32.5".parse().unwrap()));
        assert!(!alias_conflict(&ranges, "10.0.33.5".parse().unwrap()));
    }

    #[test]
    fn release_removes_exact_and_base_matches() {
        let ranges = vec![alias("10.0.32.5"), alias("10.0.32.6/32"), alias("10.0.40.0/28")];
        let kept = keep_aliases(ranges, "10.0.32.6".parse().unwrap());
        let kept: Vec<_> = kept.iter().map(|r| r.ip_cidr_range.as_str()).collect();
        assert_eq!(kept, vec!["10.0.32.5", "10.0.40.0/28"]);
    }

    #[test]
    fn subnetwork_url_parses_region_and_name() {
        let url = "https://www.googleapis.com/compute/v1/projects/p/regions/us-east1/subnetworks/worker-subnet";
        assert_eq!(
            parse_subnetwork_url(url),
            Some(("us-east1".to_string(), "worker-subnet".to_string()))
        );

        let relative = "regions/us-east1/subnetworks/worker-subnet";
        assert_eq!(
            parse_subnetwork_url(relative),
            Some(("us-east1".to_string(), "worker-subnet".to_string()))
        );
    }

    #[test]
    fn interface_update_preserves_the_fingerprint() {
        let raw = serde_json::json!({
            "name": "nic0",
            "subnetwork": "regions/us-east1/subnetworks/worker-subnet",
            "fingerprint": "abcd1234",
            "networkIP": "10.0.32.2",
            "aliasIpRanges": [{"ipCidrRange": "10.0.32.5"}]
        });
        let interface: NetworkInterface = serde_json::from_value(raw).unwrap();
        let round_tripped = serde_json::to_value(&interface).unwrap();
        assert_eq!(round_tripped["fingerprint"], "abcd1234");
        assert_eq!(round_tripped["networkIP"], "10.0.32.2");
        assert_eq!(round_tripped["aliasIpRanges"][0]["ipCidrRange"], "10.0.32.5");
    }

    #[test]
    fn empty_alias_list_stays_on_the_wire() {
        let interface = NetworkInterface {
            name: Some("nic0".to_string()),
            subnetwork: None,
            alias_ip_ranges: Vec::new(),
            fingerprint: None,
            extra: serde_json::Map::new(),
        };
        let value = serde_json::to_value(&interface).unwrap();
        // A release down to zero aliases must serialize the empty list, not
        // drop the field.
        assert!(value.get("aliasIpRanges").is_some());
    }
}
