//! Credential-rotation watcher
//!
//! The cloud-credentials secret is mounted as a directory of symlinks (one
//! per key, pointing through a `..data` indirection). When the credential
//! operator rotates the secret the kubelet swaps the symlink targets, so the
//! watcher registers the directory and every directory reachable through the
//! symlink chain (bounded depth) and treats any mutation event as a
//! rotation: the supervisor token is cancelled, all reconcilers drain, and
//! the process restarts under its orchestrator with fresh credentials.

use std::path::{Path, PathBuf};

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;

/// The mounted volume is known to expose a symlink-per-key layout; chains
/// are never deeper than this.
const MAX_SYMLINK_DEPTH: usize = 10;

/// Watch the mounted credentials directory and cancel the supervisor token
/// on the first mutation event. Returns when the token is cancelled.
pub async fn watch_for_rotation(
    secret_dir: &Path,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let paths = resolve_watch_paths(secret_dir, MAX_SYMLINK_DEPTH);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(move |event: notify::Result<Event>| {
        let _ = tx.send(event);
    })
    .map_err(|e| Error::configuration(format!("cannot create credentials watcher: {e}")))?;
    for path in &paths {
        watcher.watch(path, RecursiveMode::NonRecursive).map_err(|e| {
            Error::configuration(format!("cannot watch {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Watching credentials path");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = rx.recv() => match event {
                Some(Ok(event)) if is_mutation_event(&event.kind) => {
                    info!(?event.kind, "Cloud credentials changed, cancelling controller context");
                    shutdown.cancel();
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %e, "Credentials watch error"),
                None => return Ok(()),
            }
        }
    }
}

fn is_mutation_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// The directory itself plus every directory its entries reach through
/// symlinks, following each chain at most `max_depth` hops.
fn resolve_watch_paths(dir: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut paths = vec![dir.to_path_buf()];
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot enumerate credentials directory");
            return paths;
        }
    };

    for entry in entries.flatten() {
        let mut current = entry.path();
        for _ in 0..max_depth {
            let target = match std::fs::read_link(&current) {
                Ok(target) => target,
                Err(_) => break,
            };
            let resolved = if target.is_absolute() {
                target
            } else {
                current.parent().map(|p| p.join(&target)).unwrap_or(target)
            };
            let watch_dir = if resolved.is_dir() {
                resolved.clone()
            } else {
                match resolved.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => break,
                }
            };
            if !paths.contains(&watch_dir) {
                paths.push(watch_dir);
            }
            current = resolved;
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cred-watch-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn mutation_events_are_classified() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert!(is_mutation_event(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_mutation_event(&EventKind::Create(CreateKind::Any)));
        assert!(is_mutation_event(&EventKind::Remove(RemoveKind::Any)));
        assert!(!is_mutation_event(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }

    #[test]
    fn watch_paths_follow_the_symlink_chain() {
        let dir = test_dir("chain");
        let data_dir = dir.join("..2024_01_01");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("aws_access_key_id"), "key").unwrap();
        std::os::unix::fs::symlink(&data_dir, dir.join("..data")).unwrap();
        std::os::unix::fs::symlink(
            dir.join("..data").join("aws_access_key_id"),
            dir.join("aws_access_key_id"),
        )
        .unwrap();

        let paths = resolve_watch_paths(&dir, MAX_SYMLINK_DEPTH);
        assert!(paths.contains(&dir));
        assert!(
            paths.iter().any(|p| p.ends_with("..2024_01_01")),
            "expected the symlink target directory in {paths:?}"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_directory_still_watches_the_root() {
        let missing = std::env::temp_dir().join("cred-watch-does-not-exist");
        let paths = resolve_watch_paths(&missing, MAX_SYMLINK_DEPTH);
        assert_eq!(paths, vec![missing]);
    }

    #[tokio::test]
    async fn watcher_returns_when_the_token_is_cancelled() {
        let dir = test_dir("cancel");
        let token = CancellationToken::new();
        let watcher = watch_for_rotation(&dir, token.clone());
        tokio::pin!(watcher);

        tokio::select! {
            _ = &mut watcher => panic!("watcher returned before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should return after cancellation")
            .unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
