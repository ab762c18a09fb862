//! Whole sync roots driven through the emulated placeholder layer and the
//! in-memory remote: population, recall, local edits, remote changes and
//! shell commands, all through a running `SyncProvider`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cfsync_cloudfilter::{CloudFilter, HandleMode, Hydration, LocalCloudFilter, PlaceholderInfo};
use cfsync_core::fingerprint::truncate_to_filetime;
use cfsync_core::{
    PinState, PopulationPolicy, RemoteConfig, RemoteKind, ShellCommand, SyncProviderContext, SyncRootConfig,
    SyncRootRegistration, SyncSettings,
};
use cfsync_remote::{MemoryRemote, RemoteBackend};
use cfsync_sync::{ProviderStatus, SyncMetrics, SyncProvider, SyncProviderPool};
use tempfile::TempDir;

fn t0() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000)
}

fn settings() -> SyncSettings {
    SyncSettings {
        lock_retry_attempts: 5,
        lock_retry_delay_ms: 20,
        delete_poll_attempts: 5,
        delete_poll_delay_ms: 20,
        remote_poll_interval_ms: 50,
        remote_backoff_max_ms: 200,
        ..Default::default()
    }
}

async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    filter: LocalCloudFilter,
    remote: Arc<MemoryRemote>,
    pool: SyncProviderPool,
    provider: Arc<SyncProvider>,
    metrics: SyncMetrics,
}

impl Harness {
    async fn start(policy: PopulationPolicy, remote: MemoryRemote) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let filter = LocalCloudFilter::open(&tmp.path().join("placeholders.json")).unwrap();
        let cfg = SyncRootConfig {
            account: "alice".into(),
            display_name: "Phone".into(),
            local_path: root.clone(),
            population_policy: policy,
            remote: RemoteConfig {
                kind: RemoteKind::Memory,
                ..Default::default()
            },
        };
        let registration = SyncRootRegistration::from_config(&cfg).unwrap();
        filter.register_sync_root(&registration).await.unwrap();

        let settings = settings();
        let remote = Arc::new(remote);
        let backend = RemoteBackend::new(RemoteKind::Memory, remote.clone(), &settings);
        let shared: Arc<dyn CloudFilter> = Arc::new(filter.clone());
        let metrics = SyncMetrics::default();
        let pool = SyncProviderPool::new(shared, settings, metrics.clone());
        let provider = pool.start(SyncProviderContext::from_config(&cfg), backend);
        assert_eq!(provider.wait_started().await, ProviderStatus::Running);

        Self {
            _tmp: tmp,
            root,
            filter,
            remote,
            pool,
            provider,
            metrics,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn info(&self, rel: &str) -> Option<PlaceholderInfo> {
        self.filter.info(&self.path(rel)).unwrap()
    }

    /// Clear the in-sync flag so a later refresh is observable.
    async fn mark_out_of_sync(&self, rel: &str) {
        let handle = self.filter.open(&self.path(rel), HandleMode::Plain).unwrap();
        self.filter.set_in_sync(&handle, false).await.unwrap();
        assert!(!self.info(rel).unwrap().in_sync);
    }

    async fn stop(self) {
        let id = self.provider.context().id.clone();
        assert!(self.pool.stop(&id).await);
        assert_eq!(self.provider.status(), ProviderStatus::Stopped);
        assert!(!self.pool.is_running(&id));
    }
}

fn sample_remote() -> MemoryRemote {
    let remote = MemoryRemote::new();
    remote.put_file("a.txt", vec![b'a'; 100], t0());
    remote.put_file("dir/b.txt", vec![b'b'; 50], t0());
    remote
}

fn set_mtime(path: &Path, modified: SystemTime) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(modified).unwrap();
}

#[tokio::test]
async fn full_population_recall_and_local_edit() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    // Bulk population: two dehydrated, in-sync placeholders
    for (rel, len) in [("a.txt", 100), ("dir/b.txt", 50)] {
        let info = h.info(rel).unwrap_or_else(|| panic!("{rel} not populated"));
        assert!(info.is_placeholder, "{rel}");
        assert!(info.in_sync, "{rel}");
        assert_eq!(info.hydration, Hydration::None, "{rel}");
        assert_eq!(info.length, len);
        assert_eq!(info.modified, truncate_to_filetime(t0()));
    }
    assert!(h.remote.range_reads().is_empty());

    // Opening a.txt recalls exactly [0, 100)
    let data = h.filter.read_file(&h.path("a.txt")).await.unwrap();
    assert_eq!(data, vec![b'a'; 100]);
    let reads = h.remote.range_reads();
    assert_eq!(reads.len(), 1);
    assert_eq!((reads[0].relative.as_str(), reads[0].offset, reads[0].len), ("a.txt", 0, 100));
    let info = h.info("a.txt").unwrap();
    assert!(info.is_fully_present());
    assert!(info.in_sync);
    assert_eq!(h.info("dir/b.txt").unwrap().hydration, Hydration::None);

    // A local edit goes up with its write time
    let t1 = truncate_to_filetime(SystemTime::now() + Duration::from_secs(3600));
    std::fs::write(h.path("a.txt"), b"edited locally").unwrap();
    set_mtime(&h.path("a.txt"), t1);
    wait_until("the edit to reach the remote", || {
        h.remote.modified("a.txt") == Some(t1)
    })
    .await;
    assert_eq!(h.remote.file_data("a.txt").unwrap().as_ref(), b"edited locally");
    wait_until("a.txt back in sync", || h.info("a.txt").unwrap().in_sync).await;

    h.stop().await;
}

#[tokio::test]
async fn lazy_root_populates_on_listing() {
    let h = Harness::start(PopulationPolicy::Lazy, sample_remote()).await;
    assert!(h.info("a.txt").is_none());

    let names = h.filter.list_directory(&h.root).await.unwrap();
    assert_eq!(names, vec!["a.txt".to_string(), "dir".to_string()]);
    let dir = h.info("dir").unwrap();
    assert!(dir.is_placeholder);
    assert!(!dir.populated);

    let names = h.filter.list_directory(&h.path("dir")).await.unwrap();
    assert_eq!(names, vec!["b.txt".to_string()]);
    assert!(h.info("dir").unwrap().populated);
    assert_eq!(h.info("dir/b.txt").unwrap().length, 50);

    h.stop().await;
}

#[tokio::test]
async fn remote_changes_reach_placeholders() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    let t2 = t0() + Duration::from_secs(60);
    h.remote.put_file("a.txt", vec![b'z'; 120], t2);
    wait_until("a.txt to pick up the remote change", || {
        h.info("a.txt")
            .is_some_and(|i| i.length == 120 && i.modified == truncate_to_filetime(t2))
    })
    .await;
    let info = h.info("a.txt").unwrap();
    assert!(info.in_sync);
    assert_eq!(info.hydration, Hydration::None);

    h.remote.put_file("new.txt", b"fresh".to_vec(), t2);
    wait_until("new.txt placeholder", || h.info("new.txt").is_some()).await;
    assert_eq!(h.filter.read_file(&h.path("new.txt")).await.unwrap(), b"fresh");

    assert!(h.remote.remove("dir/b.txt"));
    wait_until("dir/b.txt removal", || !h.path("dir/b.txt").exists()).await;

    h.stop().await;
}

#[tokio::test]
async fn local_rename_and_delete_are_mirrored() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    h.filter
        .rename(&h.path("a.txt"), &h.path("c.txt"))
        .await
        .unwrap();
    wait_until("remote move", || {
        h.remote.file_data("c.txt").is_some() && h.remote.file_data("a.txt").is_none()
    })
    .await;
    assert!(h.info("c.txt").unwrap().is_placeholder);

    h.filter.delete(&h.path("dir/b.txt")).await.unwrap();
    wait_until("remote delete", || h.remote.file_data("dir/b.txt").is_none()).await;
    assert!(h.remote.paths().contains(&"dir".to_string()));

    h.stop().await;
}

#[tokio::test]
async fn new_local_file_is_uploaded() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    std::fs::create_dir(h.path("notes")).unwrap();
    std::fs::write(h.path("notes/todo.md"), b"- buy milk").unwrap();
    wait_until("upload of notes/todo.md", || {
        h.remote.file_data("notes/todo.md").is_some()
    })
    .await;
    assert_eq!(
        h.remote.file_data("notes/todo.md").unwrap().as_ref(),
        b"- buy milk"
    );
    wait_until("uploaded file in sync", || {
        h.info("notes/todo.md").is_some_and(|i| i.is_placeholder && i.in_sync)
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn shell_sync_projects_remote_entry() {
    let h = Harness::start(PopulationPolicy::Lazy, sample_remote()).await;
    assert!(h.info("a.txt").is_none());

    let shell = h.provider.shell_commands();
    assert!(shell.submit(ShellCommand::sync(h.path("a.txt"))));
    wait_until("a.txt placeholder from shell sync", || {
        h.info("a.txt").is_some_and(|i| i.is_placeholder && i.in_sync)
    })
    .await;
    assert_eq!(h.info("a.txt").unwrap().length, 100);

    h.stop().await;
}

#[tokio::test]
async fn shell_sync_refreshes_partially_present_file() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    let head = h.filter.read_range(&h.path("a.txt"), 0, 10).await.unwrap();
    assert_eq!(head, vec![b'a'; 10]);
    assert_eq!(h.info("a.txt").unwrap().hydration, Hydration::Partial);
    h.mark_out_of_sync("a.txt").await;

    assert!(h.provider.shell_commands().submit(ShellCommand::sync(h.path("a.txt"))));
    wait_until("a.txt back in sync", || h.info("a.txt").unwrap().in_sync).await;
    assert_eq!(h.metrics.failures("shell"), 0);
    let info = h.info("a.txt").unwrap();
    assert_eq!(info.length, 100);
    assert_eq!(info.modified, truncate_to_filetime(t0()));
    assert_eq!(h.filter.read_file(&h.path("a.txt")).await.unwrap(), vec![b'a'; 100]);

    h.stop().await;
}

#[tokio::test]
async fn shell_sync_refreshes_partially_present_directory() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    // dir/b.txt is still dehydrated, so dir is only partially present
    let dir = h.info("dir").unwrap();
    assert!(dir.is_placeholder);
    assert_eq!(dir.hydration, Hydration::Partial);
    h.mark_out_of_sync("dir").await;

    assert!(h.provider.shell_commands().submit(ShellCommand::sync(h.path("dir"))));
    wait_until("dir back in sync", || h.info("dir").unwrap().in_sync).await;
    assert_eq!(h.metrics.failures("shell"), 0);
    assert_eq!(h.info("dir/b.txt").unwrap().hydration, Hydration::None);

    h.stop().await;
}

#[tokio::test]
async fn unpinning_a_hydrated_file_frees_its_content() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;

    h.filter.read_file(&h.path("a.txt")).await.unwrap();
    assert!(h.info("a.txt").unwrap().is_fully_present());

    h.filter
        .user_set_pin_state(&h.path("a.txt"), PinState::Unpinned)
        .unwrap();
    wait_until("a.txt dehydrated after unpin", || {
        h.info("a.txt").unwrap().hydration == Hydration::None
    })
    .await;
    let info = h.info("a.txt").unwrap();
    assert_eq!(info.pin_state(), PinState::Unpinned);
    assert!(info.in_sync);
    assert_eq!(h.metrics.failures("client_watcher"), 0);
    assert_eq!(h.remote.file_data("a.txt").unwrap().as_ref(), &[b'a'; 100][..]);

    h.stop().await;
}

#[tokio::test]
async fn starting_a_running_root_is_a_no_op() {
    let h = Harness::start(PopulationPolicy::Full, sample_remote()).await;
    let id = h.provider.context().id.clone();

    let cfg_context = h.provider.context().clone();
    let backend = RemoteBackend::new(RemoteKind::Memory, h.remote.clone(), &settings());
    let again = h.pool.start(cfg_context, backend);
    assert!(Arc::ptr_eq(&again, &h.provider));
    assert_eq!(h.pool.ids(), vec![id]);

    h.stop().await;
}
