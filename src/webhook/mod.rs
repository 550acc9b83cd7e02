//! Admission webhook for CloudPrivateIPConfig
//!
//! A small HTTPS endpoint speaking the admission-review protocol. The only
//! check is synchronous and pre-persist: a CloudPrivateIPConfig whose
//! `spec.node` does not reference an existing node is denied, so the
//! reconciler never sees requests it cannot act on.

pub mod cloudprivateipconfig;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{routing::post, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Node lookups behind a trait so tests can deny without a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLookup: Send + Sync {
    /// Fetch a node by name
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;
}

/// Production [`NodeLookup`] backed by the cluster API
pub struct KubeNodeLookup {
    nodes: Api<Node>,
}

impl KubeNodeLookup {
    /// Create a lookup over the cluster-scoped node API
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeLookup for KubeNodeLookup {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes.get(name).await
    }
}

/// Shared state for the webhook handlers
pub struct WebhookState {
    /// Node lookups for `spec.node` validation
    pub nodes: Arc<dyn NodeLookup>,
}

impl WebhookState {
    /// Create the webhook state with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Arc::new(KubeNodeLookup::new(client)),
        }
    }
}

/// Create the webhook router. POST-only; every other method gets 405 from
/// the method router.
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/cloudprivateipconfigs",
            post(cloudprivateipconfig::validate_handler),
        )
        .with_state(state)
}

/// Serve the webhook over TLS until the shutdown token cancels.
pub async fn serve(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    tls_dir: &Path,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let tls = RustlsConfig::from_pem_file(tls_dir.join("tls.crt"), tls_dir.join("tls.key"))
        .await
        .map_err(|e| Error::configuration(format!("cannot load webhook TLS material: {e}")))?;

    let handle = Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });
    }

    info!(%addr, "Admission webhook listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::configuration(format!("webhook server error: {e}")))
}
