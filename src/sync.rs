//! Last-write-wins sync engine
//!
//! One sync pass compares a local scan against a remote listing, takes
//! the sorted union of relative paths, and classifies every entry:
//! local-only uploads, remote-only downloads, and both-sided entries
//! decided by modification timestamp with a small tolerance window.
//! Conflicts are written to the audit log before the winning transfer
//! starts. Passes are mutually exclusive per engine; a second caller
//! gets `AlreadyRunning` instead of queueing behind a long pass.
//!
//! After every transfer the local file's mtime is stamped to the
//! provider-reported timestamp, so an immediately repeated pass sees
//! both sides within tolerance and does nothing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::conflict_log::{ConflictLog, CONFLICT_LOG_FILENAME};
use crate::providers::{
    join_rel, parent_rel, CloudError, CloudFileMetadata, CloudProvider,
};
use crate::scanner::{LocalFileState, LocalScanner};

/// How long a second `synchronize` call waits for the running pass
/// before giving up with `AlreadyRunning`.
const RUN_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Local directory whose tracked files are synchronized.
    pub sync_root: PathBuf,
    /// Tracked extension without the dot.
    pub tracked_extension: String,
    /// Hidden directory under the sync root holding settings and the
    /// conflict log. Synchronized separately from tracked files.
    pub config_dir_name: String,
    pub settings_filename: String,
    /// Timestamps this close together count as equal. Cloud services
    /// round to whole seconds, local filesystems do not.
    pub timestamp_tolerance_secs: f64,
    pub recursive_scan: bool,
}

impl SyncOptions {
    pub fn new(sync_root: &Path) -> Self {
        Self {
            sync_root: sync_root.to_path_buf(),
            tracked_extension: "md".to_string(),
            config_dir_name: ".purse_config".to_string(),
            settings_filename: "settings.yml".to_string(),
            timestamp_tolerance_secs: 2.0,
            recursive_scan: false,
        }
    }
}

/// Per-pass counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRunSummary {
    /// Local-only files pushed to the cloud.
    pub uploaded: u32,
    /// Remote-only files materialized locally.
    pub downloaded: u32,
    /// Both-sided entries where the local version won.
    pub conflicts_local_won: u32,
    /// Both-sided entries where the cloud version won.
    pub conflicts_cloud_won: u32,
    pub unchanged: u32,
    /// Entries whose transfer failed; the pass continued past them.
    pub failed: u32,
}

impl SyncRunSummary {
    pub fn total_transferred(&self) -> u32 {
        self.uploaded + self.downloaded + self.conflicts_local_won + self.conflicts_cloud_won
    }
}

/// Result of a `synchronize` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncRunSummary),
    /// Another pass held the run lock past the wait window.
    AlreadyRunning,
}

type FileCallback = Arc<dyn Fn(&Path) + Send + Sync>;
type SettingsCallback = Arc<dyn Fn() + Send + Sync>;

/// Last-write-wins synchronizer over one provider and one local root.
pub struct SyncEngine {
    provider: Arc<dyn CloudProvider>,
    options: SyncOptions,
    conflict_log: ConflictLog,
    /// Called after a remote file lands (or is replaced) on disk.
    on_file_materialized: Option<FileCallback>,
    /// Called when the settings file was replaced by the cloud copy.
    on_settings_replaced: Option<SettingsCallback>,
    run_lock: Mutex<()>,
    last_sync_utc: std::sync::Mutex<Option<f64>>,
}

impl SyncEngine {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        options: SyncOptions,
    ) -> Result<Self, CloudError> {
        let log_path = options
            .sync_root
            .join(&options.config_dir_name)
            .join(CONFLICT_LOG_FILENAME);
        let conflict_log = ConflictLog::new(&log_path)?;
        Ok(Self {
            provider,
            options,
            conflict_log,
            on_file_materialized: None,
            on_settings_replaced: None,
            run_lock: Mutex::new(()),
            last_sync_utc: std::sync::Mutex::new(None),
        })
    }

    pub fn on_file_materialized(
        mut self,
        callback: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        self.on_file_materialized = Some(Arc::new(callback));
        self
    }

    pub fn on_settings_replaced(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_settings_replaced = Some(Arc::new(callback));
        self
    }

    pub fn conflict_log_path(&self) -> &Path {
        self.conflict_log.path()
    }

    /// UTC timestamp of the last completed pass on this engine.
    pub fn last_sync_utc(&self) -> Option<f64> {
        *self.last_sync_utc.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run one sync pass, or report that one is already running.
    pub async fn synchronize(&self) -> Result<SyncOutcome, CloudError> {
        let guard = match tokio::time::timeout(RUN_LOCK_WAIT, self.run_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                info!("sync already in progress, skipping this pass");
                return Ok(SyncOutcome::AlreadyRunning);
            }
        };
        let summary = self.run_pass().await?;
        drop(guard);

        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        *self.last_sync_utc.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
        Ok(SyncOutcome::Completed(summary))
    }

    async fn run_pass(&self) -> Result<SyncRunSummary, CloudError> {
        if !self.options.sync_root.is_dir() {
            return Err(CloudError::Configuration(format!(
                "sync root '{}' is not a directory",
                self.options.sync_root.display()
            )));
        }
        self.ensure_authenticated().await?;
        self.provider.ensure_app_root_exists().await?;
        self.provider
            .create_folder(&self.options.config_dir_name)
            .await?;

        let local = LocalScanner::new(&self.options.sync_root, &self.options.tracked_extension)
            .recursive(self.options.recursive_scan)
            .scan();
        let remote = self.remote_tracked_files().await?;

        // Sorted union of both sides gives a deterministic pass order.
        let mut keys: BTreeSet<String> = local.keys().cloned().collect();
        keys.extend(remote.iter().map(|m| m.rel_path.clone()));

        let mut summary = SyncRunSummary::default();
        for key in &keys {
            let local_state = local.get(key);
            let remote_meta = remote.iter().find(|m| &m.rel_path == key);
            // Per-file failures never abort the pass; the next scheduled
            // pass picks the file up again.
            if let Err(e) = self
                .sync_one(key, local_state, remote_meta, &mut summary)
                .await
            {
                error!("sync of '{}' failed: {}", key, e);
                summary.failed += 1;
            }
        }

        if let Err(e) = self.sync_settings(&mut summary).await {
            error!("settings sync failed: {}", e);
            summary.failed += 1;
        }

        info!(
            "sync pass done: {} up, {} down, {} local-won, {} cloud-won, {} unchanged, {} failed",
            summary.uploaded,
            summary.downloaded,
            summary.conflicts_local_won,
            summary.conflicts_cloud_won,
            summary.unchanged,
            summary.failed
        );
        Ok(summary)
    }

    /// Verify usable credentials before any data moves. With only a
    /// refresh token on hand, one silent refresh is attempted up front.
    async fn ensure_authenticated(&self) -> Result<(), CloudError> {
        let state = self.provider.auth_state().await;
        if state.has_access_token {
            return Ok(());
        }
        if state.has_refresh_token {
            if self.provider.refresh_access_token().await?.is_some() {
                return Ok(());
            }
            return Err(CloudError::Auth(
                "stored credentials were rejected; re-authentication required".to_string(),
            ));
        }
        Err(CloudError::Auth(format!(
            "{} is not authenticated",
            self.provider.display_name()
        )))
    }

    /// Remote files participating in the tracked sync set. The remote
    /// listing is always recursive; `recursive_scan` only governs how
    /// deep the local scan goes.
    async fn remote_tracked_files(&self) -> Result<Vec<CloudFileMetadata>, CloudError> {
        let entries = self.provider.list_folder("", true).await?;
        Ok(entries
            .into_iter()
            .filter(|m| {
                !m.is_folder
                    && !m.is_deleted
                    && !is_hidden_rel(&m.rel_path)
                    && has_extension(&m.rel_path, &self.options.tracked_extension)
            })
            .collect())
    }

    async fn sync_one(
        &self,
        rel_path: &str,
        local: Option<&LocalFileState>,
        remote: Option<&CloudFileMetadata>,
        summary: &mut SyncRunSummary,
    ) -> Result<(), CloudError> {
        match (local, remote) {
            (Some(local), None) => {
                debug!("'{}': local only, uploading", rel_path);
                self.upload_local(&local.path, rel_path).await?;
                summary.uploaded += 1;
            }
            (None, Some(remote)) => {
                debug!("'{}': cloud only, downloading", rel_path);
                self.download_remote(remote).await?;
                summary.downloaded += 1;
            }
            (Some(local), Some(remote)) => {
                let delta = local.modified_at_utc - remote.modified_at_utc;
                if delta.abs() <= self.options.timestamp_tolerance_secs {
                    summary.unchanged += 1;
                } else if delta > 0.0 {
                    self.conflict_log.record(&format!(
                        "'{}': local ({}) newer than cloud ({}), uploading local version",
                        rel_path,
                        fmt_ts(local.modified_at_utc),
                        fmt_ts(remote.modified_at_utc)
                    ));
                    self.upload_local(&local.path, rel_path).await?;
                    summary.conflicts_local_won += 1;
                } else {
                    self.conflict_log.record(&format!(
                        "'{}': cloud ({}) newer than local ({}), downloading cloud version",
                        rel_path,
                        fmt_ts(remote.modified_at_utc),
                        fmt_ts(local.modified_at_utc)
                    ));
                    self.download_remote(remote).await?;
                    summary.conflicts_cloud_won += 1;
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn upload_local(&self, local_path: &Path, rel_path: &str) -> Result<(), CloudError> {
        let folder = parent_rel(rel_path);
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        let uploaded = self.provider.upload_file(local_path, &folder, name).await?;
        stamp_mtime(local_path, uploaded.modified_at_utc);
        Ok(())
    }

    async fn download_remote(&self, remote: &CloudFileMetadata) -> Result<PathBuf, CloudError> {
        let target = local_path_for(&self.options.sync_root, &remote.rel_path);
        self.provider
            .download_file_to(&remote.rel_path, &target)
            .await?;
        stamp_mtime(&target, remote.modified_at_utc);
        if let Some(ref callback) = self.on_file_materialized {
            callback(&target);
        }
        Ok(target)
    }

    /// Settings live in the hidden config directory and are excluded
    /// from the tracked scan, so they get their own last-write-wins
    /// comparison here.
    async fn sync_settings(&self, summary: &mut SyncRunSummary) -> Result<(), CloudError> {
        let local_path = self
            .options
            .sync_root
            .join(&self.options.config_dir_name)
            .join(&self.options.settings_filename);
        let remote_rel = join_rel(&self.options.config_dir_name, &self.options.settings_filename);

        let local_mtime = std::fs::metadata(&local_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64());
        let remote_meta = self.provider.get_file_metadata(&remote_rel).await?;

        match (local_mtime, remote_meta) {
            (Some(_), None) => {
                debug!("settings: local only, uploading");
                self.upload_local(&local_path, &remote_rel).await?;
                summary.uploaded += 1;
            }
            (None, Some(remote)) => {
                debug!("settings: cloud only, downloading");
                self.download_settings(&remote, &local_path).await?;
                summary.downloaded += 1;
            }
            (Some(local_mtime), Some(remote)) => {
                let delta = local_mtime - remote.modified_at_utc;
                if delta.abs() <= self.options.timestamp_tolerance_secs {
                    // In sync, nothing to do
                } else if delta > 0.0 {
                    self.conflict_log.record(&format!(
                        "'{}': local ({}) newer than cloud ({}), uploading local version",
                        remote_rel,
                        fmt_ts(local_mtime),
                        fmt_ts(remote.modified_at_utc)
                    ));
                    self.upload_local(&local_path, &remote_rel).await?;
                    summary.uploaded += 1;
                } else {
                    self.conflict_log.record(&format!(
                        "'{}': cloud ({}) newer than local ({}), downloading cloud version",
                        remote_rel,
                        fmt_ts(remote.modified_at_utc),
                        fmt_ts(local_mtime)
                    ));
                    self.download_settings(&remote, &local_path).await?;
                    summary.downloaded += 1;
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn download_settings(
        &self,
        remote: &CloudFileMetadata,
        local_path: &Path,
    ) -> Result<(), CloudError> {
        self.provider
            .download_file_to(&remote.rel_path, local_path)
            .await?;
        stamp_mtime(local_path, remote.modified_at_utc);
        if let Some(ref callback) = self.on_settings_replaced {
            callback();
        }
        Ok(())
    }
}

fn is_hidden_rel(rel: &str) -> bool {
    rel.split('/').any(|segment| segment.starts_with('.'))
}

fn has_extension(rel: &str, extension: &str) -> bool {
    Path::new(rel)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase() == extension.to_lowercase())
        .unwrap_or(false)
}

/// Map a forward-slash relative path onto the local sync root.
fn local_path_for(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Set a file's mtime to the provider-reported timestamp so repeated
/// passes see both sides as unchanged. Failure only costs one redundant
/// comparison next pass.
fn stamp_mtime(path: &Path, modified_at_utc: f64) {
    if modified_at_utc <= 0.0 {
        return;
    }
    let target = UNIX_EPOCH + Duration::from_secs_f64(modified_at_utc);
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(target));
    if let Err(e) = result {
        debug!("could not stamp mtime on '{}': {}", path.display(), e);
    }
}

fn fmt_ts(ts: f64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis((ts * 1000.0) as i64)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("{:.3}", ts))
}
