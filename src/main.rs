//! Cloud Network Config Controller entrypoint
//!
//! Two modes: `controller` runs the leader-elected reconcilers against the
//! cloud API, `webhook` serves the admission validator.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud_network_config_controller::cloudprovider::{self, credentials};
use cloud_network_config_controller::controller::{cloudprivateipconfig, node, secret};
use cloud_network_config_controller::leader_election::LeaderElector;
use cloud_network_config_controller::webhook::{self, WebhookState};
use cloud_network_config_controller::{
    signals, Error, Result, CLOUD_PROVIDER_SECRET_LOCATION, LEADER_LOCK_NAME, WEBHOOK_TLS_LOCATION,
};

/// Assigns private IPs to the primary NIC of cloud VMs backing cluster nodes
#[derive(Parser, Debug)]
#[command(name = "cloud-network-config-controller", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcilers (default deployment mode)
    Controller(ControllerArgs),

    /// Run the admission webhook validating CloudPrivateIPConfig objects
    Webhook(WebhookArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// The address of the Kubernetes API server. Overrides any value in the
    /// kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    master: Option<String>,

    /// The cloud provider this component is running on (aws, azure, gcp)
    #[arg(long)]
    cloudprovider: String,

    /// The cloud region the cluster is deployed in, explicitly required for
    /// talking to the AWS API
    #[arg(long)]
    cloudregion: Option<String>,

    /// The cloud provider secret name - used for talking to the cloud API
    #[arg(long)]
    secret_name: String,

    /// The cloud provider secret namespace - used for talking to the cloud API
    #[arg(long)]
    secret_namespace: String,

    /// Leader identity, populated by the downward API
    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    /// Namespace holding the leader-election lock, populated by the downward API
    #[arg(long, env = "POD_NAMESPACE")]
    pod_namespace: String,
}

#[derive(Parser, Debug)]
struct WebhookArgs {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// The address of the Kubernetes API server. Overrides any value in the
    /// kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    master: Option<String>,

    /// Listen address for the admission endpoint
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// Directory holding the tls.crt and tls.key serving material
    #[arg(long, default_value = WEBHOOK_TLS_LOCATION)]
    tls_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Webhook(args) => run_webhook(args).await,
    }
}

/// Run the leader-elected reconcilers until shutdown.
async fn run_controller(args: ControllerArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    signals::setup_signal_handler(shutdown.clone())
        .map_err(|e| Error::configuration(format!("cannot register signal handler: {e}")))?;

    let client = build_client(args.kubeconfig.as_deref(), args.master.as_deref()).await?;

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LOCK_NAME,
        &args.pod_namespace,
        &args.pod_name,
    ));
    let mut guard = tokio::select! {
        guard = elector.clone().acquire() => guard?,
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
    };

    // Only the leader talks to the cloud: build the adapter (which loads the
    // mounted credentials) and spawn the control loops.
    let secret_dir = Path::new(CLOUD_PROVIDER_SECRET_LOCATION);
    let cloud = cloudprovider::new_cloud_provider_client(
        &args.cloudprovider,
        args.cloudregion.as_deref(),
        secret_dir,
    )
    .await?;

    let mut controllers = JoinSet::new();
    {
        let client = client.clone();
        let cloud = cloud.clone();
        let shutdown = shutdown.clone();
        controllers.spawn(async move { cloudprivateipconfig::run(client, cloud, shutdown).await });
    }
    {
        let client = client.clone();
        let cloud = cloud.clone();
        let shutdown = shutdown.clone();
        controllers.spawn(async move { node::run(client, cloud, shutdown).await });
    }
    {
        let client = client.clone();
        let shutdown = shutdown.clone();
        let secret_name = args.secret_name.clone();
        let secret_namespace = args.secret_namespace.clone();
        controllers
            .spawn(async move { secret::run(client, &secret_name, &secret_namespace, shutdown).await });
    }
    {
        let shutdown = shutdown.clone();
        controllers
            .spawn(async move { credentials::watch_for_rotation(secret_dir, shutdown).await });
    }

    // Two shutdown sources besides signals: credential rotation (the secret
    // controller or the directory watcher cancels the token) and losing the
    // leader election. Either way all control loops drain before exit.
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = guard.lost() => {
            info!("Stopped leading, shutting down controllers");
        }
        result = controllers.join_next() => match result {
            Some(Ok(Ok(()))) => info!("A controller finished, shutting down"),
            Some(Ok(Err(e))) => error!(error = %e, "Controller failed, shutting down"),
            Some(Err(e)) => error!(error = %e, "Controller panicked, shutting down"),
            None => {}
        }
    }

    shutdown.cancel();
    while let Some(result) = controllers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Controller exited with error during shutdown"),
            Err(e) => warn!(error = %e, "Controller panicked during shutdown"),
        }
    }
    info!("Finished executing controlled shutdown");
    Ok(())
}

/// Serve the admission webhook until shutdown.
async fn run_webhook(args: WebhookArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    signals::setup_signal_handler(shutdown.clone())
        .map_err(|e| Error::configuration(format!("cannot register signal handler: {e}")))?;

    let client = build_client(args.kubeconfig.as_deref(), args.master.as_deref()).await?;
    let state = Arc::new(WebhookState::new(client));
    webhook::serve(state, args.listen, &args.tls_dir, shutdown).await
}

/// Build the cluster client from the common flags: an explicit kubeconfig
/// when given, the in-cluster/inferred configuration otherwise, with an
/// optional API server override.
async fn build_client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::configuration(format!("error building kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::configuration(format!("error building kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::configuration(format!("error inferring client config: {e}")))?,
    };
    if let Some(master) = master {
        config.cluster_url = master
            .parse::<http::Uri>()
            .map_err(|e| Error::configuration(format!("invalid master URL {master}: {e}")))?;
    }
    Ok(Client::try_from(config)?)
}
