//! Credential-secret rotation controller
//!
//! Watches the single cloud-credentials secret named on the command line.
//! The first observation snapshots the mounted data; any later data change
//! (or the secret's deletion) cancels the process-wide context so every
//! control loop drains and the process restarts under its orchestrator,
//! re-initializing the cloud credentials on the fresh start.

use std::collections::BTreeMap;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;

/// Controller name for log scoping
pub const CONTROLLER_AGENT_NAME: &str = "secret";

/// Watch the named secret until the shutdown token cancels or a rotation is
/// detected (which cancels the token itself).
pub async fn run(
    client: Client,
    secret_name: &str,
    secret_namespace: &str,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client, secret_namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={secret_name}"));
    let mut stream = watcher(secrets, config).default_backoff().boxed();
    let mut observed: Option<BTreeMap<String, ByteString>> = None;

    info!("Starting {CONTROLLER_AGENT_NAME} controller");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down {CONTROLLER_AGENT_NAME} controller");
                return Ok(());
            }
            event = stream.try_next() => {
                let event = event
                    .map_err(|e| Error::configuration(format!("secret watch failed: {e}")))?;
                match event {
                    Some(watcher::Event::InitApply(secret))
                    | Some(watcher::Event::Apply(secret)) => {
                        if observe_secret(&mut observed, &secret) {
                            info!(
                                secret = secret_name,
                                "Re-initializing cloud API credentials, cancelling controller context"
                            );
                            shutdown.cancel();
                            return Ok(());
                        }
                        debug!(secret = secret_name, "Secret data unchanged");
                    }
                    Some(watcher::Event::Delete(_)) => {
                        // Without the secret the process cannot restart with
                        // valid credentials; shut down one final time and let
                        // the orchestrator surface the missing mount.
                        info!(secret = secret_name, "Credentials secret deleted, shutting down");
                        shutdown.cancel();
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Track the secret's data across watch events. Returns true when the data
/// differs from the first observation, i.e. the credentials were rotated.
fn observe_secret(
    observed: &mut Option<BTreeMap<String, ByteString>>,
    secret: &Secret,
) -> bool {
    if secret.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let data = secret.data.clone().unwrap_or_default();
    match observed {
        None => {
            *observed = Some(data);
            false
        }
        Some(previous) if *previous != data => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn secret_with(data: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("cloud-credentials".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn first_observation_snapshots_without_rotating() {
        let mut observed = None;
        let secret = secret_with(&[("aws_access_key_id", b"AKIA")]);
        assert!(!observe_secret(&mut observed, &secret));
        assert!(observed.is_some());
    }

    #[test]
    fn unchanged_data_does_not_rotate() {
        let mut observed = None;
        let secret = secret_with(&[("aws_access_key_id", b"AKIA")]);
        observe_secret(&mut observed, &secret);
        assert!(!observe_secret(&mut observed, &secret));
    }

    #[test]
    fn changed_data_rotates() {
        let mut observed = None;
        observe_secret(&mut observed, &secret_with(&[("aws_access_key_id", b"AKIA")]));
        assert!(observe_secret(
            &mut observed,
            &secret_with(&[("aws_access_key_id", b"AKIB")])
        ));
    }

    #[test]
    fn deletion_marker_rotates() {
        let mut observed = None;
        observe_secret(&mut observed, &secret_with(&[("k", b"v")]));
        let mut deleted = secret_with(&[("k", b"v")]);
        deleted.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(observe_secret(&mut observed, &deleted));
    }
}
