//! Node annotator
//!
//! Stamps each node once with the subnet CIDRs of its primary cloud
//! interface. Downstream networking reads the annotation to derive the
//! node's cloud egress ranges. Subnets don't change for the lifetime of a
//! VM, so a node that already carries the annotation is skipped; this also
//! makes restarts and update events no-ops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::PostParams;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloudprovider::{CloudProvider, NodeSubnets};
use crate::error::{is_not_found, Error};
use crate::retry::{retry_on_conflict, RetryConfig};

/// Controller name for log scoping
pub const CONTROLLER_AGENT_NAME: &str = "node";

/// Annotation key carrying the node's cloud subnet CIDRs
pub const CLOUD_IF_ADDR_ANNOTATION: &str = "cloud.network.openshift.io/cloud-if-addr";

/// Node access behind a trait so tests can swap in an in-memory store
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the latest node by name
    async fn get(&self, name: &str) -> Result<Node, kube::Error>;
    /// Replace the node
    async fn update(&self, node: &Node) -> Result<Node, kube::Error>;
}

/// Production [`NodeClient`] backed by the cluster API
pub struct KubeNodeClient {
    nodes: Api<Node>,
}

impl KubeNodeClient {
    /// Create a client for the cluster-scoped node API
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn get(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes.get(name).await
    }

    async fn update(&self, node: &Node) -> Result<Node, kube::Error> {
        self.nodes
            .replace(&node.name_any(), &PostParams::default(), node)
            .await
    }
}

/// Shared state for the annotator
pub struct Context {
    /// Node access (trait object for testability)
    pub nodes: Arc<dyn NodeClient>,
    /// Cloud adapter answering subnet lookups
    pub cloud: Arc<dyn CloudProvider>,
}

/// Run the annotator until the shutdown token cancels.
pub async fn run(
    client: Client,
    cloud: Arc<dyn CloudProvider>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let ctx = Arc::new(Context {
        nodes: Arc::new(KubeNodeClient::new(client)),
        cloud,
    });

    info!("Starting {CONTROLLER_AGENT_NAME} controller");
    Controller::new(nodes, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(1))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(node = %object.name, "Reconciled node"),
                Err(e) => warn!(error = %e, "Node reconciliation error"),
            }
        })
        .await;
    info!("Shutting down {CONTROLLER_AGENT_NAME} controller");
    Ok(())
}

/// Annotate a node with its cloud subnets, once.
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = node.name_any();

    // One-shot: if the node already carries the annotation there is nothing
    // to do, subnets won't change.
    if node.annotations().contains_key(CLOUD_IF_ADDR_ANNOTATION) {
        return Ok(Action::await_change());
    }

    let subnets = ctx.cloud.get_node_subnet(&node).await.map_err(|e| {
        warn!(node = %name, error = %e, "Error retrieving node subnet");
        Error::from(e)
    })?;
    let annotation = generate_annotation(&subnets)?;

    info!(
        node = %name,
        annotation = %annotation,
        "Setting cloud interface address annotation on node"
    );
    let result = retry_on_conflict(&RetryConfig::conflict(), "node annotation update", || {
        let nodes = Arc::clone(&ctx.nodes);
        let name = name.clone();
        let annotation = annotation.clone();
        async move {
            let mut latest = nodes.get(&name).await?;
            latest
                .annotations_mut()
                .insert(CLOUD_IF_ADDR_ANNOTATION.to_string(), annotation);
            nodes.update(&latest).await
        }
    })
    .await;
    match result {
        Ok(_) => Ok(Action::await_change()),
        Err(e) if is_not_found(&e) => {
            // The node vanished between the lookup and the write; it will
            // be annotated on its next registration.
            debug!(node = %name, "Node no longer exists, skipping annotation");
            Ok(Action::await_change())
        }
        Err(e) => Err(e.into()),
    }
}

/// Requeue with backoff on errors (e.g. a transient cloud lookup failure).
pub fn error_policy(node: Arc<Node>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(node = %node.name_any(), error = %error, "Sync failed, requeuing");
    Action::requeue(Duration::from_secs(15))
}

#[derive(Serialize)]
struct CloudIfAddrAnnotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<String>,
}

fn generate_annotation(subnets: &NodeSubnets) -> Result<String, Error> {
    let annotation = CloudIfAddrAnnotation {
        ipv4: subnets.v4.map(|net| net.to_string()),
        ipv6: subnets.v6.map(|net| net.to_string()),
    };
    serde_json::to_string(&annotation)
        .map_err(|e| Error::serialization(format!("cloud subnet annotation: {e}")))
}
