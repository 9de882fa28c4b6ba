use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::error::{ProviderError, MANAGE_USERS_DISABLED, TRACK_QUOTA_DISABLED};
use crate::store::UserStore;
use crate::users::{now_ms, User, FS_PROVIDER_LOCAL};

/// An in-flight quota scan.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaScan {
    pub username: String,
    /// Epoch milliseconds the scan started at.
    pub start_time: i64,
}

/// Process-wide registry of in-flight scans. At most one scan per username
/// can be registered at any time.
#[derive(Default)]
pub struct ScanTracker {
    scans: Mutex<Vec<QuotaScan>>,
}

impl ScanTracker {
    /// Register a scan; false if one is already running for `username`.
    pub fn add_scan(&self, username: &str) -> bool {
        let mut scans = self.scans.lock().expect("scan tracker mutex poisoned");
        if scans.iter().any(|scan| scan.username == username) {
            return false;
        }
        scans.push(QuotaScan {
            username: username.to_string(),
            start_time: now_ms(),
        });
        true
    }

    pub fn remove_scan(&self, username: &str) {
        let mut scans = self.scans.lock().expect("scan tracker mutex poisoned");
        scans.retain(|scan| scan.username != username);
    }

    pub fn list_scans(&self) -> Vec<QuotaScan> {
        self.scans
            .lock()
            .expect("scan tracker mutex poisoned")
            .clone()
    }
}

/// Apply the quota tracking policy, then forward the update to the store.
/// With `track_quota == 2`, incremental updates for users without quota
/// limits are silently dropped; resets always go through.
pub async fn update_user_quota(
    state: &AppState,
    user: &User,
    files: i32,
    size: i64,
    reset: bool,
) -> Result<(), ProviderError> {
    if state.config.track_quota == 0 {
        return Err(ProviderError::MethodDisabled(TRACK_QUOTA_DISABLED));
    }
    if state.config.track_quota == 2 && !reset && !user.has_quota_restrictions() {
        return Ok(());
    }
    if state.config.manage_users == 0 {
        return Err(ProviderError::MethodDisabled(MANAGE_USERS_DISABLED));
    }
    state
        .store
        .update_quota(&user.username, files, size, reset)
        .await
}

pub async fn get_used_quota(
    state: &AppState,
    username: &str,
) -> Result<(i32, i64), ProviderError> {
    if state.config.track_quota == 0 {
        return Err(ProviderError::MethodDisabled(TRACK_QUOTA_DISABLED));
    }
    state.store.used_quota(username).await
}

/// Filesystem capability the quota scanner needs from a storage backend.
pub trait Filesystem: Send + Sync {
    /// Walk the root and return `(file_count, total_bytes)`.
    fn scan_root(&self) -> std::io::Result<(i32, i64)>;
}

pub struct LocalFilesystem {
    root: PathBuf,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Filesystem for LocalFilesystem {
    fn scan_root(&self) -> std::io::Result<(i32, i64)> {
        let mut files = 0i32;
        let mut bytes = 0i64;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else if metadata.is_file() {
                    files += 1;
                    bytes += metadata.len() as i64;
                }
            }
        }
        Ok((files, bytes))
    }
}

/// Filesystem backend for a user's virtual root. Object-store providers are
/// wired in by the server binary; only local disk is built in here.
pub fn user_filesystem(user: &User) -> Result<Box<dyn Filesystem>, ProviderError> {
    match user.fs_config.provider {
        FS_PROVIDER_LOCAL => Ok(Box::new(LocalFilesystem::new(&user.home_dir))),
        other => Err(ProviderError::validation(format!(
            "no filesystem backend available for provider {other}"
        ))),
    }
}

/// Start a quota scan for `username` unless one is already running. The scan
/// itself runs detached: it walks the user's filesystem and resets the used
/// quota counters to the recomputed totals.
pub async fn start_quota_scan(state: &AppState, username: &str) -> Result<bool, ProviderError> {
    let user = state.store.user_by_name(username).await?;
    if !state.scans.add_scan(&user.username) {
        debug!(username = %user.username, "quota scan already in progress");
        return Ok(false);
    }
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = scan_user_home(&state, &user).await {
            warn!(username = %user.username, error = %err, "quota scan failed");
        }
        state.scans.remove_scan(&user.username);
    });
    Ok(true)
}

async fn scan_user_home(state: &AppState, user: &User) -> Result<(), ProviderError> {
    let fs = user_filesystem(user)?;
    let (files, size) = tokio::task::spawn_blocking(move || fs.scan_root())
        .await
        .map_err(|err| {
            ProviderError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
        })??;
    debug!(
        username = %user.username,
        files,
        size,
        "user home dir scanned"
    );
    update_user_quota(state, user, files, size, true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_scan_per_username() {
        let tracker = ScanTracker::default();
        assert!(tracker.add_scan("dave"));
        assert!(!tracker.add_scan("dave"));
        assert!(tracker.add_scan("erin"));
        assert_eq!(tracker.list_scans().len(), 2);
        tracker.remove_scan("dave");
        assert!(tracker.add_scan("dave"));
    }

    #[test]
    fn concurrent_add_scan_admits_exactly_one() {
        let tracker = std::sync::Arc::new(ScanTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.add_scan("alice"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().expect("join scan thread"))
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn local_filesystem_scan_counts_files_and_bytes() {
        let dir = std::env::temp_dir().join(format!("quota-scan-{}", std::process::id()));
        let nested = dir.join("nested");
        std::fs::create_dir_all(&nested).expect("create dirs");
        std::fs::write(dir.join("a.bin"), vec![0u8; 100]).expect("write");
        std::fs::write(nested.join("b.bin"), vec![0u8; 50]).expect("write");
        let (files, bytes) = LocalFilesystem::new(&dir).scan_root().expect("scan");
        assert_eq!(files, 2);
        assert_eq!(bytes, 150);
        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
