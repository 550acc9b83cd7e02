//! CloudPrivateIPConfig reconciler
//!
//! Coordinates two authoritative stores: the cluster API, which holds the
//! declared intent, and the cloud API, which holds the actual interface
//! state. Every sync derives a directional operation from the object alone
//! (release, assign, release-then-assign, or nothing), then follows a strict
//! intent / act / confirm / record sequence:
//!
//! - ASSIGN: issue the cloud request, add the finalizer, persist an interim
//!   `Pending` status with `status.node = spec.node`, block on the cloud's
//!   answer, then record `Success` or `Error`. The interim write is the
//!   crash-recovery beacon: a restarted controller reads it as "assignment
//!   in flight, retry", and the adapter's AlreadyAssigned sentinel makes
//!   that retry converge without duplicating cloud state.
//! - RELEASE: issue the cloud request, persist interim `Pending` keeping the
//!   old node, block, then either strip the finalizer (deletion) or fall
//!   through to ASSIGN against the new node (update).
//!
//! Consumers only treat the object as ready when `spec.node == status.node`
//! and the `Assigned` condition is `True`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::PostParams;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::crd::{
    CloudPrivateIPConfig, CloudPrivateIPConfigStatus, Condition, ConditionStatus,
    CLOUD_RESPONSE_REASON_ERROR, CLOUD_RESPONSE_REASON_PENDING, CLOUD_RESPONSE_REASON_SUCCESS,
};
use crate::error::{is_not_found, Error};
use crate::retry::{retry_on_conflict, RetryConfig};

/// Controller name, used for the event reporter and log scoping
pub const CONTROLLER_AGENT_NAME: &str = "cloud-private-ip-config";

/// Typed access to the objects this reconciler reads and writes. A trait
/// object so the tests can swap in an in-memory store.
#[async_trait]
pub trait CloudNetworkClient: Send + Sync {
    /// Fetch the latest CloudPrivateIPConfig by name
    async fn get(&self, name: &str) -> Result<CloudPrivateIPConfig, kube::Error>;
    /// Replace the object (metadata changes, i.e. the finalizer)
    async fn update(
        &self,
        config: &CloudPrivateIPConfig,
    ) -> Result<CloudPrivateIPConfig, kube::Error>;
    /// Replace the object's status subresource
    async fn update_status(
        &self,
        config: &CloudPrivateIPConfig,
    ) -> Result<CloudPrivateIPConfig, kube::Error>;
    /// Fetch a node by name
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;
}

/// Production [`CloudNetworkClient`] backed by the cluster API
pub struct KubeCloudNetworkClient {
    configs: Api<CloudPrivateIPConfig>,
    nodes: Api<Node>,
}

impl KubeCloudNetworkClient {
    /// Create a client for the cluster-scoped APIs
    pub fn new(client: Client) -> Self {
        Self {
            configs: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl CloudNetworkClient for KubeCloudNetworkClient {
    async fn get(&self, name: &str) -> Result<CloudPrivateIPConfig, kube::Error> {
        self.configs.get(name).await
    }

    async fn update(
        &self,
        config: &CloudPrivateIPConfig,
    ) -> Result<CloudPrivateIPConfig, kube::Error> {
        self.configs
            .replace(&config.name_any(), &PostParams::default(), config)
            .await
    }

    async fn update_status(
        &self,
        config: &CloudPrivateIPConfig,
    ) -> Result<CloudPrivateIPConfig, kube::Error> {
        let data = serde_json::to_vec(config).map_err(kube::Error::SerdeError)?;
        self.configs
            .replace_status(&config.name_any(), &PostParams::default(), data)
            .await
    }

    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes.get(name).await
    }
}

/// Shared state for the reconciler
pub struct Context {
    /// Cluster API access (trait object for testability)
    pub api: Arc<dyn CloudNetworkClient>,
    /// Cloud adapter the sync drives
    pub cloud: Arc<dyn CloudProvider>,
    /// Event recorder for spec-level validation warnings (absent in tests)
    pub recorder: Option<Recorder>,
}

/// Run the reconciler until the shutdown token cancels.
pub async fn run(
    client: Client,
    cloud: Arc<dyn CloudProvider>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let configs: Api<CloudPrivateIPConfig> = Api::all(client.clone());
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: CONTROLLER_AGENT_NAME.to_string(),
            instance: None,
        },
    );
    let ctx = Arc::new(Context {
        api: Arc::new(KubeCloudNetworkClient::new(client)),
        cloud,
        recorder: Some(recorder),
    });

    info!("Starting {CONTROLLER_AGENT_NAME} controller");
    Controller::new(configs, watcher::Config::default())
        // One worker: syncs are serialized per reconciler, and a single key
        // is never processed by two workers at once
        .with_config(ControllerConfig::default().concurrency(1))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "Reconciled CloudPrivateIPConfig"),
                Err(e) => warn!(error = %e, "CloudPrivateIPConfig reconciliation error"),
            }
        })
        .await;
    info!("Shutting down {CONTROLLER_AGENT_NAME} controller");
    Ok(())
}

/// Reconcile one CloudPrivateIPConfig.
pub async fn reconcile(
    object: Arc<CloudPrivateIPConfig>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = object.name_any();
    info!(config = %name, "Processing CloudPrivateIPConfig");

    // The object name is the requested IP literal. The admission schema
    // guarantees this upstream; a spurious object is surfaced as a warning
    // event and dropped since no cloud operation can be derived from it.
    let ip: IpAddr = match name.parse() {
        Ok(ip) => ip,
        Err(_) => {
            warn!(config = %name, "Object name is not an IP address, dropping");
            publish_invalid_object_event(
                &ctx,
                &object,
                format!("CloudPrivateIPConfig: '{name}' is not named by an IP address"),
            )
            .await;
            return Ok(Action::await_change());
        }
    };

    // Re-read the latest copy: the triggering snapshot may be stale, and the
    // object is recursively updated during this sync.
    let mut config = match ctx.api.get(&name).await {
        Ok(config) => config,
        Err(e) if is_not_found(&e) => {
            debug!(config = %name, "No longer exists, the finalizer handled any last cleanup");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let (node_to_add, node_to_del) = compute_op(&config);
    if node_to_add.is_none() && node_to_del.is_none() {
        debug!(config = %name, "Nothing to do for this object");
        return Ok(Action::await_change());
    }

    if let Some(node_name) = node_to_del {
        match sync_release(&ctx, &mut config, ip, &node_name, node_to_add.is_some()).await? {
            ReleaseOutcome::Released => {}
            ReleaseOutcome::Finalized | ReleaseOutcome::NodeGone => {
                return Ok(Action::await_change())
            }
        }
    }
    if let Some(node_name) = node_to_add {
        sync_assign(&ctx, &mut config, ip, &node_name).await?;
    }
    Ok(Action::await_change())
}

/// Requeue with backoff on sync errors.
pub fn error_policy(
    object: Arc<CloudPrivateIPConfig>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(object = %object.name_any(), error = %error, "Sync failed, requeuing");
    Action::requeue(Duration::from_secs(15))
}

/// Decide what needs to be done given the state of the object alone.
/// Returns `(node_to_add, node_to_del)`.
pub fn compute_op(config: &CloudPrivateIPConfig) -> (Option<String>, Option<String>) {
    // Release if the deletion timestamp is set and our finalizer is still
    // listed
    if config.metadata.deletion_timestamp.is_some() && config.has_finalizer() {
        return (None, non_empty(config.status_node()));
    }
    // Move if status and spec disagree
    if config.spec.node != config.status_node() {
        return (non_empty(&config.spec.node), non_empty(config.status_node()));
    }
    // Assign if the status is un-assigned or marked failed/pending
    if config.status_node().is_empty()
        || config.assigned_condition().map(|c| c.status) != Some(ConditionStatus::True)
    {
        return (non_empty(&config.spec.node), None);
    }
    (None, None)
}

fn non_empty(node: &str) -> Option<String> {
    (!node.is_empty()).then(|| node.to_string())
}

enum ReleaseOutcome {
    /// The cloud confirmed the release; an update continues with the assign
    Released,
    /// The object was marked for deletion and its finalizer was removed
    Finalized,
    /// The referenced node no longer exists, the key was dropped
    NodeGone,
}

async fn sync_release(
    ctx: &Context,
    config: &mut CloudPrivateIPConfig,
    ip: IpAddr,
    node_name: &str,
    will_assign: bool,
) -> Result<ReleaseOutcome, Error> {
    let name = config.name_any();
    info!(config = %name, node = node_name, "CloudPrivateIPConfig will be released from node");

    let Some(node) = resolve_node(ctx, node_name).await? else {
        return Ok(ReleaseOutcome::NodeGone);
    };
    let status_node = config.status_node().to_string();

    let request = match ctx.cloud.release_private_ip(ip, &node).await {
        Ok(request) => request,
        Err(e) => {
            let status = next_status(
                &status_node,
                ConditionStatus::False,
                CLOUD_RESPONSE_REASON_ERROR,
                config.observed_generation() + 1,
                format!("Error issuing cloud release request, err: {e}"),
            );
            write_status(ctx, config, status).await?;
            return Err(e.into());
        }
    };

    // Interim write: the release was dispatched and not yet confirmed
    let status = next_status(
        &status_node,
        ConditionStatus::Unknown,
        CLOUD_RESPONSE_REASON_PENDING,
        config.observed_generation() + 1,
        "",
    );
    write_status(ctx, config, status).await?;

    // Long running, blocking call
    let wait_result = ctx.cloud.wait_for_response(&request).await;

    // Real object deletion depends on this controller removing the
    // finalizer, so don't consult the store for it.
    if config.metadata.deletion_timestamp.is_some()
        && config.has_finalizer()
        && wait_result.is_ok()
    {
        info!(config = %name, "Cleaning up IP address and finalizer, deleting it completely");
        update_object(ctx, config, CloudPrivateIPConfig::remove_finalizer).await?;
        return Ok(ReleaseOutcome::Finalized);
    }

    if let Err(e) = wait_result {
        let status = next_status(
            &status_node,
            ConditionStatus::False,
            CLOUD_RESPONSE_REASON_ERROR,
            config.observed_generation() + 1,
            format!("Error processing cloud release request, err: {e}"),
        );
        write_status(ctx, config, status).await?;
        return Err(e.into());
    }

    info!(config = %name, node = node_name, "Released IP address from node");
    if will_assign {
        // Record where this sync stands: the remainder reads as a plain
        // assign in the next term if anything fails from here on.
        let status = next_status(
            "",
            ConditionStatus::Unknown,
            CLOUD_RESPONSE_REASON_PENDING,
            config.observed_generation() + 1,
            "",
        );
        write_status(ctx, config, status).await?;
    }
    Ok(ReleaseOutcome::Released)
}

async fn sync_assign(
    ctx: &Context,
    config: &mut CloudPrivateIPConfig,
    ip: IpAddr,
    node_name: &str,
) -> Result<(), Error> {
    let name = config.name_any();
    info!(config = %name, node = node_name, "CloudPrivateIPConfig will be assigned to node");

    let Some(node) = resolve_node(ctx, node_name).await? else {
        return Ok(());
    };
    let generation = config.observed_generation();
    let spec_node = config.spec.node.clone();

    let request = match ctx.cloud.assign_private_ip(ip, &node).await {
        Err(CloudProviderError::AlreadyAssigned) => {
            // The request went through in a previous term (for example when
            // this controller was killed after dispatching the cloud
            // request); record the convergence without a wait.
            warn!(
                config = %name,
                node = node_name,
                "IP already assigned to node, updating the status to reflect this"
            );
            let status = next_status(
                &spec_node,
                ConditionStatus::True,
                CLOUD_RESPONSE_REASON_SUCCESS,
                generation + 1,
                "",
            );
            write_status(ctx, config, status).await?;
            return Ok(());
        }
        Err(e) => {
            let status = next_status(
                "",
                ConditionStatus::False,
                CLOUD_RESPONSE_REASON_ERROR,
                generation + 1,
                format!("Error issuing cloud assignment request, err: {e}"),
            );
            write_status(ctx, config, status).await?;
            return Err(e.into());
        }
        Ok(request) => request,
    };

    // The finalizer goes on before the interim status write so the object
    // cannot be removed from under us while the cloud processes the
    // request. Two writes are needed: the status is a subresource only this
    // controller may update.
    if !config.has_finalizer() {
        info!(config = %name, "Adding finalizer to CloudPrivateIPConfig");
        update_object(ctx, config, CloudPrivateIPConfig::add_finalizer).await?;
    }

    // Interim write with the intended destination: a crash or retry reads
    // this as an assignment in flight.
    let status = next_status(
        &spec_node,
        ConditionStatus::Unknown,
        CLOUD_RESPONSE_REASON_PENDING,
        generation + 1,
        "",
    );
    write_status(ctx, config, status).await?;

    // Long running, blocking call. A concurrent spec update is fine: the
    // updated object queues for the next sync, which cleans up and moves
    // the IP to whatever node is defined by then.
    if let Err(e) = ctx.cloud.wait_for_response(&request).await {
        let status = next_status(
            &spec_node,
            ConditionStatus::False,
            CLOUD_RESPONSE_REASON_ERROR,
            config.observed_generation() + 1,
            format!("Error processing cloud assignment request, err: {e}"),
        );
        write_status(ctx, config, status).await?;
        return Err(e.into());
    }

    let status = next_status(
        &spec_node,
        ConditionStatus::True,
        CLOUD_RESPONSE_REASON_SUCCESS,
        config.observed_generation() + 1,
        "",
    );
    write_status(ctx, config, status).await?;
    info!(config = %name, node = node_name, "Added IP address to node");
    Ok(())
}

/// Fetch the referenced node; a vanished node drops the key since no cloud
/// operation can make progress without it.
async fn resolve_node(ctx: &Context, node_name: &str) -> Result<Option<Node>, Error> {
    match ctx.api.get_node(node_name).await {
        Ok(node) => Ok(Some(node)),
        Err(e) if is_not_found(&e) => {
            warn!(node = node_name, "Referenced node no longer exists, dropping key");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn next_status(
    node: &str,
    status: ConditionStatus,
    reason: &str,
    observed_generation: i64,
    message: impl Into<String>,
) -> CloudPrivateIPConfigStatus {
    CloudPrivateIPConfigStatus {
        node: node.to_string(),
        conditions: vec![Condition::assigned(
            status,
            reason,
            observed_generation,
            message,
        )],
    }
}

/// Persist a status, retrying conflicts against the latest object, and
/// refresh the in-hand copy from the response.
async fn write_status(
    ctx: &Context,
    config: &mut CloudPrivateIPConfig,
    status: CloudPrivateIPConfigStatus,
) -> Result<(), Error> {
    let name = config.name_any();
    let updated = retry_on_conflict(
        &RetryConfig::conflict(),
        "CloudPrivateIPConfig status update",
        || {
            let api = Arc::clone(&ctx.api);
            let name = name.clone();
            let status = status.clone();
            async move {
                let mut latest = api.get(&name).await?;
                latest.status = Some(status);
                api.update_status(&latest).await
            }
        },
    )
    .await?;
    *config = updated;
    Ok(())
}

/// Persist a metadata mutation (finalizer add/remove) with conflict retry,
/// and refresh the in-hand copy from the response.
async fn update_object(
    ctx: &Context,
    config: &mut CloudPrivateIPConfig,
    mutate: fn(&mut CloudPrivateIPConfig),
) -> Result<(), Error> {
    let name = config.name_any();
    let updated = retry_on_conflict(
        &RetryConfig::conflict(),
        "CloudPrivateIPConfig update",
        || {
            let api = Arc::clone(&ctx.api);
            let name = name.clone();
            async move {
                let mut latest = api.get(&name).await?;
                mutate(&mut latest);
                api.update(&latest).await
            }
        },
    )
    .await?;
    *config = updated;
    Ok(())
}

async fn publish_invalid_object_event(ctx: &Context, config: &CloudPrivateIPConfig, note: String) {
    let Some(recorder) = &ctx.recorder else {
        return;
    };
    let event = Event {
        type_: EventType::Warning,
        reason: "InvalidObject".to_string(),
        note: Some(note),
        action: "Validating".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &config.object_ref(&())).await {
        warn!(error = %e, "Could not publish warning event");
    }
}
