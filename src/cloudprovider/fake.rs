//! Fake cloud provider for tests
//!
//! Mirrors the real adapters' observable behavior: error injection per
//! operation and an in-memory record of which node currently holds which IP,
//! so tests can assert that an IP never resides on two nodes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use super::{CloudProvider, CloudProviderError, CloudRequest, NodeSubnets};

/// Fake [`CloudProvider`] with flag-driven error injection.
#[derive(Debug, Default)]
pub struct FakeCloudProvider {
    mock_error_on_assign: bool,
    mock_error_on_assign_with_existing_ip: bool,
    mock_error_on_release: bool,
    mock_error_on_wait: bool,
    mock_error_on_get_node_subnet: bool,
    subnets: NodeSubnets,
    assignments: Mutex<HashMap<IpAddr, String>>,
}

impl FakeCloudProvider {
    /// Create a fake provider with the given error injection flags.
    pub fn new(
        mock_error_on_assign: bool,
        mock_error_on_assign_with_existing_ip: bool,
        mock_error_on_release: bool,
        mock_error_on_wait: bool,
    ) -> Self {
        Self {
            mock_error_on_assign,
            mock_error_on_assign_with_existing_ip,
            mock_error_on_release,
            mock_error_on_wait,
            ..Default::default()
        }
    }

    /// Report the given subnets from `get_node_subnet`.
    pub fn with_subnets(mut self, subnets: NodeSubnets) -> Self {
        self.subnets = subnets;
        self
    }

    /// Fail `get_node_subnet` calls.
    pub fn with_subnet_error(mut self) -> Self {
        self.mock_error_on_get_node_subnet = true;
        self
    }

    /// Seed the fake cloud with an existing assignment.
    pub fn with_assignment(self, ip: IpAddr, node: &str) -> Self {
        self.assignments
            .lock()
            .unwrap()
            .insert(ip, node.to_string());
        self
    }

    /// Node currently holding the IP, if any.
    pub fn assigned_node(&self, ip: IpAddr) -> Option<String> {
        self.assignments.lock().unwrap().get(&ip).cloned()
    }

    /// Whether the fake cloud holds the IP on any node.
    pub fn holds_ip(&self, ip: IpAddr) -> bool {
        self.assignments.lock().unwrap().contains_key(&ip)
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn assign_private_ip(
        &self,
        ip: IpAddr,
        node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        if self.mock_error_on_assign {
            if self.mock_error_on_assign_with_existing_ip {
                return Err(CloudProviderError::AlreadyAssigned);
            }
            return Err(CloudProviderError::Api("Assign failed".to_string()));
        }
        let node_name = node.metadata.name.clone().unwrap_or_default();
        self.assignments.lock().unwrap().insert(ip, node_name);
        Ok(CloudRequest::Completed)
    }

    async fn release_private_ip(
        &self,
        ip: IpAddr,
        _node: &Node,
    ) -> Result<CloudRequest, CloudProviderError> {
        if self.mock_error_on_release {
            return Err(CloudProviderError::Api("Release failed".to_string()));
        }
        self.assignments.lock().unwrap().remove(&ip);
        Ok(CloudRequest::Completed)
    }

    async fn wait_for_response(&self, _request: &CloudRequest) -> Result<(), CloudProviderError> {
        if self.mock_error_on_wait {
            return Err(CloudProviderError::Api("Waiting failed".to_string()));
        }
        Ok(())
    }

    async fn get_node_subnet(&self, _node: &Node) -> Result<NodeSubnets, CloudProviderError> {
        if self.mock_error_on_get_node_subnet {
            return Err(CloudProviderError::Api("Get node subnet failed".to_string()));
        }
        Ok(self.subnets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn assign_then_release_tracks_residency() {
        let fake = FakeCloudProvider::default();
        let ip: IpAddr = "192.168.172.12".parse().unwrap();

        let request = fake.assign_private_ip(ip, &node("nodeA")).await.unwrap();
        assert_eq!(request, CloudRequest::Completed);
        assert_eq!(fake.assigned_node(ip).as_deref(), Some("nodeA"));

        fake.release_private_ip(ip, &node("nodeA")).await.unwrap();
        assert!(!fake.holds_ip(ip));
    }

    #[tokio::test]
    async fn reassignment_moves_residency_to_one_node() {
        let fake = FakeCloudProvider::default();
        let ip: IpAddr = "fd00::5".parse().unwrap();

        fake.assign_private_ip(ip, &node("nodeA")).await.unwrap();
        fake.assign_private_ip(ip, &node("nodeB")).await.unwrap();

        // A single residency entry: the IP is never on two nodes
        assert_eq!(fake.assigned_node(ip).as_deref(), Some("nodeB"));
    }

    #[tokio::test]
    async fn error_flags_inject_failures() {
        let fake = FakeCloudProvider::new(true, false, false, false);
        let ip: IpAddr = "192.168.172.12".parse().unwrap();
        assert!(fake.assign_private_ip(ip, &node("nodeA")).await.is_err());

        let fake = FakeCloudProvider::new(true, true, false, false);
        assert!(matches!(
            fake.assign_private_ip(ip, &node("nodeA")).await,
            Err(CloudProviderError::AlreadyAssigned)
        ));

        let fake = FakeCloudProvider::new(false, false, false, true);
        assert!(fake
            .wait_for_response(&CloudRequest::Completed)
            .await
            .is_err());
    }
}
