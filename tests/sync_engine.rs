//! Sync engine behavior against an in-memory provider.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use purse_sync::providers::{join_rel, parent_rel, CloudProvider};
use purse_sync::{
    AuthState, CloudError, CloudFileMetadata, CredentialRecord, ProviderKind, SyncEngine,
    SyncOptions, SyncOutcome, SyncRunSummary,
};

#[derive(Clone)]
struct RemoteFile {
    bytes: Vec<u8>,
    modified_at_utc: f64,
}

/// In-memory cloud backend: a flat map of relative paths to contents.
/// Upload timestamps are rounded to whole seconds the way real services
/// round them.
#[derive(Default)]
struct MockProvider {
    files: Mutex<HashMap<String, RemoteFile>>,
    folders: Mutex<HashSet<String>>,
    uploads: AtomicU32,
    downloads: AtomicU32,
    authenticated: AtomicBool,
    fail_uploads_for: Mutex<HashSet<String>>,
    reject_auth_for: Mutex<HashSet<String>>,
    list_delay_ms: u64,
}

impl MockProvider {
    fn authenticated() -> Self {
        let mock = Self::default();
        mock.authenticated.store(true, Ordering::SeqCst);
        mock
    }

    fn seed_file(&self, rel: &str, bytes: &[u8], modified_at_utc: f64) {
        self.files.lock().unwrap().insert(
            rel.to_string(),
            RemoteFile {
                bytes: bytes.to_vec(),
                modified_at_utc,
            },
        );
    }

    fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn file_bytes(&self, rel: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(rel).map(|f| f.bytes.clone())
    }

    fn metadata_for(&self, rel: &str, file: &RemoteFile) -> CloudFileMetadata {
        CloudFileMetadata {
            id: rel.to_string(),
            name: rel.rsplit('/').next().unwrap_or(rel).to_string(),
            rel_path: rel.to_string(),
            revision: "1".to_string(),
            size_bytes: file.bytes.len() as u64,
            modified_at_utc: file.modified_at_utc,
            is_folder: false,
            is_deleted: false,
        }
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
    }

    async fn authenticate_url(&self, _state: &str) -> Result<(String, String), CloudError> {
        Ok(("http://auth.example/".to_string(), "verifier".to_string()))
    }

    async fn exchange_code_for_token(
        &self,
        _code: &str,
        _verifier: &str,
    ) -> Result<CredentialRecord, CloudError> {
        Err(CloudError::Other("not supported by mock".to_string()))
    }

    async fn refresh_access_token(&self) -> Result<Option<String>, CloudError> {
        Ok(None)
    }

    async fn auth_state(&self) -> AuthState {
        AuthState {
            has_access_token: self.authenticated.load(Ordering::SeqCst),
            has_refresh_token: false,
        }
    }

    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<CloudFileMetadata>, CloudError> {
        if self.list_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.list_delay_ms)).await;
        }
        let files = self.files.lock().unwrap();
        let entries = files
            .iter()
            .filter(|(rel, _)| {
                if recursive {
                    path.is_empty() || rel.starts_with(&format!("{}/", path))
                } else {
                    parent_rel(rel) == path
                }
            })
            .map(|(rel, file)| self.metadata_for(rel, file))
            .collect();
        Ok(entries)
    }

    async fn get_file_metadata(
        &self,
        path: &str,
    ) -> Result<Option<CloudFileMetadata>, CloudError> {
        if path.is_empty() {
            return Ok(Some(CloudFileMetadata {
                id: String::new(),
                name: String::new(),
                rel_path: String::new(),
                revision: String::new(),
                size_bytes: 0,
                modified_at_utc: 0.0,
                is_folder: true,
                is_deleted: false,
            }));
        }
        let files = self.files.lock().unwrap();
        if let Some(file) = files.get(path) {
            return Ok(Some(self.metadata_for(path, file)));
        }
        drop(files);
        if self.folders.lock().unwrap().contains(path) {
            return Ok(Some(CloudFileMetadata {
                id: path.to_string(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                rel_path: path.to_string(),
                revision: String::new(),
                size_bytes: 0,
                modified_at_utc: 0.0,
                is_folder: true,
                is_deleted: false,
            }));
        }
        Ok(None)
    }

    async fn create_folder(&self, path: &str) -> Result<(), CloudError> {
        let mut folders = self.folders.lock().unwrap();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_rel(&current, segment);
            folders.insert(current.clone());
        }
        Ok(())
    }

    async fn ensure_app_root_exists(&self) -> Result<bool, CloudError> {
        Ok(true)
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        target_folder: &str,
        file_name: &str,
    ) -> Result<CloudFileMetadata, CloudError> {
        let rel = join_rel(target_folder, file_name);
        if self.fail_uploads_for.lock().unwrap().contains(&rel) {
            return Err(CloudError::Transient(format!("injected failure for '{}'", rel)));
        }
        if self.reject_auth_for.lock().unwrap().contains(&rel) {
            return Err(CloudError::Auth(format!("token rejected for '{}'", rel)));
        }
        // Whole-second stamp, like a real service
        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as f64;
        let file = RemoteFile {
            bytes,
            modified_at_utc: now,
        };
        let meta = self.metadata_for(&rel, &file);
        self.files.lock().unwrap().insert(rel, file);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(meta)
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CloudError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.file_bytes(path)
            .ok_or_else(|| CloudError::NotFound(path.to_string()))
    }

    async fn delete_file(&self, path: &str) -> Result<(), CloudError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}

fn engine_for(provider: Arc<MockProvider>, root: &Path) -> SyncEngine {
    SyncEngine::new(provider, SyncOptions::new(root)).unwrap()
}

fn completed(outcome: SyncOutcome) -> SyncRunSummary {
    match outcome {
        SyncOutcome::Completed(summary) => summary,
        SyncOutcome::AlreadyRunning => panic!("pass did not run"),
    }
}

fn set_mtime(path: &Path, unix_secs: f64) {
    let target = UNIX_EPOCH + Duration::from_secs_f64(unix_secs);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(target)
        .unwrap();
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as f64
}

#[tokio::test]
async fn test_first_pass_uploads_local_only_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
    std::fs::write(dir.path().join("b.md"), "beta").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(mock.file_names(), vec!["a.md", "b.md"]);
    assert_eq!(mock.file_bytes("a.md").unwrap(), b"alpha");
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "alpha").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    let engine = engine_for(mock.clone(), dir.path());
    completed(engine.synchronize().await.unwrap());

    let second = completed(engine.synchronize().await.unwrap());
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.conflicts_local_won, 0);
    assert_eq!(second.conflicts_cloud_won, 0);
    assert_eq!(second.unchanged, 1);
    assert_eq!(mock.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(mock.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_remote_only_file_is_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("c.md", b"gamma", now_secs() - 3600.0);

    let materialized = Arc::new(AtomicU32::new(0));
    let counter = materialized.clone();
    let engine = SyncEngine::new(mock.clone(), SyncOptions::new(dir.path()))
        .unwrap()
        .on_file_materialized(move |_path| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let summary = completed(engine.synchronize().await.unwrap());
    assert_eq!(summary.downloaded, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("c.md")).unwrap(),
        "gamma"
    );
    assert_eq!(materialized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_newer_local_version_wins_and_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("note.md");
    std::fs::write(&local, "local edit").unwrap();
    set_mtime(&local, now_secs());

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("note.md", b"stale cloud", now_secs() - 100.0);

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.conflicts_local_won, 1);
    assert_eq!(summary.conflicts_cloud_won, 0);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(mock.file_bytes("note.md").unwrap(), b"local edit");

    let log = std::fs::read_to_string(engine.conflict_log_path()).unwrap();
    assert!(log.contains("CONFLICT: 'note.md'"));
    assert!(log.contains("uploading local version"));
}

#[tokio::test]
async fn test_newer_cloud_version_wins_and_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("note.md");
    std::fs::write(&local, "stale local").unwrap();
    set_mtime(&local, now_secs() - 100.0);

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("note.md", b"cloud edit", now_secs());

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.conflicts_cloud_won, 1);
    assert_eq!(summary.conflicts_local_won, 0);
    assert_eq!(std::fs::read_to_string(&local).unwrap(), "cloud edit");

    let log = std::fs::read_to_string(engine.conflict_log_path()).unwrap();
    assert!(log.contains("downloading cloud version"));
}

#[tokio::test]
async fn test_timestamps_within_tolerance_are_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("note.md");
    std::fs::write(&local, "same").unwrap();
    let base = now_secs() - 50.0;
    set_mtime(&local, base + 1.5);

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("note.md", b"same", base);

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.total_transferred(), 0);
    assert_eq!(mock.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(mock.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tolerance_boundary_is_inclusive() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("note.md");
    std::fs::write(&local, "x").unwrap();
    let base = now_secs() - 50.0;

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("note.md", b"x", base);

    // Exactly at the tolerance: no action
    set_mtime(&local, base + 2.0);
    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.total_transferred(), 0);

    // Just past it: last-write-wins kicks in
    set_mtime(&local, base + 2.1);
    let summary = completed(engine.synchronize().await.unwrap());
    assert_eq!(summary.conflicts_local_won, 1);
}

#[tokio::test]
async fn test_untracked_and_hidden_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
    std::fs::write(dir.path().join("b.txt"), "not tracked").unwrap();
    std::fs::write(dir.path().join(".hidden.md"), "hidden").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file("readme.txt", b"not tracked either", now_secs());
    mock.seed_file(".secret.md", b"hidden remote", now_secs());

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.downloaded, 0);
    assert!(!dir.path().join("readme.txt").exists());
    assert!(!dir.path().join(".secret.md").exists());
}

#[tokio::test]
async fn test_unauthenticated_pass_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::default());
    let engine = engine_for(mock, dir.path());

    let err = engine.synchronize().await.unwrap_err();
    assert!(matches!(err, CloudError::Auth(_)));
}

#[tokio::test]
async fn test_failed_transfer_does_not_abort_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("good.md"), "ok").unwrap();
    std::fs::write(dir.path().join("bad.md"), "doomed").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    mock.fail_uploads_for
        .lock()
        .unwrap()
        .insert("bad.md".to_string());

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(mock.file_names(), vec!["good.md"]);
}

#[tokio::test]
async fn test_auth_failure_on_one_file_does_not_abort_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("good.md"), "ok").unwrap();
    std::fs::write(dir.path().join("locked.md"), "rejected").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    mock.reject_auth_for
        .lock()
        .unwrap()
        .insert("locked.md".to_string());

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(mock.file_names(), vec!["good.md"]);
}

#[tokio::test]
async fn test_concurrent_passes_are_mutually_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "alpha").unwrap();

    let mock = Arc::new(MockProvider {
        list_delay_ms: 2500,
        ..MockProvider::default()
    });
    mock.authenticated.store(true, Ordering::SeqCst);

    let engine = Arc::new(engine_for(mock, dir.path()));
    let (first, second) = tokio::join!(engine.synchronize(), engine.synchronize());
    let outcomes = [first.unwrap(), second.unwrap()];

    assert!(outcomes.contains(&SyncOutcome::AlreadyRunning));
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, SyncOutcome::Completed(_))));
}

#[tokio::test]
async fn test_settings_file_is_pushed_when_local_only() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(".purse_config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("settings.yml"), "theme: dark\n").unwrap();

    let mock = Arc::new(MockProvider::authenticated());
    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 1);
    assert_eq!(
        mock.file_bytes(".purse_config/settings.yml").unwrap(),
        b"theme: dark\n"
    );
}

#[tokio::test]
async fn test_newer_cloud_settings_replace_local_and_notify() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(".purse_config");
    std::fs::create_dir_all(&config_dir).unwrap();
    let settings = config_dir.join("settings.yml");
    std::fs::write(&settings, "theme: light\n").unwrap();
    set_mtime(&settings, now_secs() - 100.0);

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file(".purse_config/settings.yml", b"theme: dark\n", now_secs());

    let replaced = Arc::new(AtomicU32::new(0));
    let counter = replaced.clone();
    let engine = SyncEngine::new(mock.clone(), SyncOptions::new(dir.path()))
        .unwrap()
        .on_settings_replaced(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let summary = completed(engine.synchronize().await.unwrap());
    assert_eq!(summary.downloaded, 1);
    assert_eq!(std::fs::read_to_string(&settings).unwrap(), "theme: dark\n");
    assert_eq!(replaced.load(Ordering::SeqCst), 1);

    // The resolution is auditable like any other conflict
    let log = std::fs::read_to_string(engine.conflict_log_path()).unwrap();
    assert!(log.contains("CONFLICT: '.purse_config/settings.yml'"));
    assert!(log.contains("downloading cloud version"));
}

#[tokio::test]
async fn test_newer_local_settings_win_and_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(".purse_config");
    std::fs::create_dir_all(&config_dir).unwrap();
    let settings = config_dir.join("settings.yml");
    std::fs::write(&settings, "theme: light\n").unwrap();
    set_mtime(&settings, now_secs());

    let mock = Arc::new(MockProvider::authenticated());
    mock.seed_file(
        ".purse_config/settings.yml",
        b"theme: dark\n",
        now_secs() - 100.0,
    );

    let engine = engine_for(mock.clone(), dir.path());
    let summary = completed(engine.synchronize().await.unwrap());

    assert_eq!(summary.uploaded, 1);
    assert_eq!(
        mock.file_bytes(".purse_config/settings.yml").unwrap(),
        b"theme: light\n"
    );

    let log = std::fs::read_to_string(engine.conflict_log_path()).unwrap();
    assert!(log.contains("CONFLICT: '.purse_config/settings.yml'"));
    assert!(log.contains("uploading local version"));
}

#[tokio::test]
async fn test_last_sync_timestamp_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::authenticated());
    let engine = engine_for(mock, dir.path());

    assert!(engine.last_sync_utc().is_none());
    completed(engine.synchronize().await.unwrap());
    let recorded = engine.last_sync_utc().unwrap();
    assert!((now_secs() - recorded).abs() < 60.0);
}
