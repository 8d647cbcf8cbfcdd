//! On-disk snapshot of bound credentials.
//!
//! The snapshot is a derived copy; the in-memory table stays authoritative
//! while the process runs. Files are written owner-only (`0600`) through a
//! sibling temp file, unique per write, that is renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::service::PairingService;
use super::token::Credential;
use crate::error::PersistError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Document stored at the configured path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Credential value to credential.
    pub tokens: HashMap<String, Credential>,
    /// Device id to credential value.
    pub device_tokens: HashMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

/// Read a snapshot. A missing file yields `Ok(None)`.
pub fn read_state(path: &Path) -> Result<Option<PersistedState>, PersistError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| PersistError::Decode {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Write a snapshot, creating parent directories as needed.
pub async fn write_state(path: &Path, state: &PersistedState) -> Result<(), PersistError> {
    let data = serde_json::to_vec_pretty(state).map_err(PersistError::Encode)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }

    let tmp = temp_path(path);
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await.map_err(|e| io_error(&tmp, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_error(&tmp, e))?;
    }
    file.write_all(&data).await.map_err(|e| io_error(&tmp, e))?;
    file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(path, e));
    }
    Ok(())
}

/// Save the service state after every event that changes device bindings.
///
/// Runs until `shutdown` flips to `true` or the event channel closes. Save
/// failures are logged and do not stop the task.
pub fn spawn_autosave(
    service: PairingService,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = service.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(event) if event.changes_bindings() => {}
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Autosave lagged behind pairing events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    if let Err(e) = service.save().await {
                        tracing::warn!(error = %e, "Failed to autosave auth state");
                    }
                }
            }
        }
        tracing::debug!("Auth state autosave stopped");
    })
}

/// `.<name>.<pid>.<n>.tmp` next to `path`.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    path.with_file_name(name)
}

fn io_error(path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}
