//! SyncRootConnector callbacks invoked directly, to pin down the races the
//! platform can produce: completions that arrive early, moves out of the
//! root, fetches against an unreachable remote.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cfsync_cloudfilter::{
    CancelFetchDataRequest, CloudFilter, ConnectionKey, LocalCloudFilter, SyncCallbacks,
    TransferKey,
};
use cfsync_core::{
    PopulationPolicy, RemoteConfig, RemoteKind, SyncProviderContext, SyncRootConfig,
    SyncRootRegistration, SyncSettings,
};
use cfsync_remote::{MemoryRemote, RemoteBackend};
use cfsync_sync::{SyncMetrics, SyncProvider};
use tempfile::TempDir;

fn t0() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000)
}

struct Fixture {
    tmp: TempDir,
    root: PathBuf,
    filter: LocalCloudFilter,
    remote: Arc<MemoryRemote>,
    metrics: SyncMetrics,
    provider: SyncProvider,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    let filter = LocalCloudFilter::open(&tmp.path().join("placeholders.json")).unwrap();
    let cfg = SyncRootConfig {
        account: "carol".into(),
        display_name: String::new(),
        local_path: root.clone(),
        population_policy: PopulationPolicy::Full,
        remote: RemoteConfig {
            kind: RemoteKind::Memory,
            ..Default::default()
        },
    };
    filter
        .register_sync_root(&SyncRootRegistration::from_config(&cfg).unwrap())
        .await
        .unwrap();

    let settings = SyncSettings {
        delete_poll_attempts: 3,
        delete_poll_delay_ms: 10,
        transfer_chunk_size: 16,
        ..Default::default()
    };
    let remote = Arc::new(MemoryRemote::new());
    remote.put_file("a.txt", vec![b'a'; 40], t0());
    remote.put_file("dir/b.txt", vec![b'b'; 8], t0());
    let backend = RemoteBackend::new(RemoteKind::Memory, remote.clone(), &settings);
    let metrics = SyncMetrics::default();
    let provider = SyncProvider::new(
        SyncProviderContext::from_config(&cfg),
        Arc::new(filter.clone()),
        backend,
        settings,
        metrics.clone(),
    );
    provider.connector().connect().await.unwrap();
    provider.placeholders().create_bulk("").await.unwrap();
    Fixture {
        tmp,
        root,
        filter,
        remote,
        metrics,
        provider,
    }
}

#[tokio::test]
async fn delete_completion_for_present_entry_leaves_remote_alone() {
    let f = fixture().await;
    let path = f.root.join("a.txt");

    // Completion fired, but the file never went away
    f.provider
        .connector()
        .on_delete_completion(path.clone())
        .await;
    assert!(path.exists());
    assert!(f.remote.file_data("a.txt").is_some());
}

#[tokio::test]
async fn delete_completion_waits_for_entry_to_vanish() {
    let f = fixture().await;
    let path = f.root.join("a.txt");

    let removal = {
        let path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            std::fs::remove_file(path).unwrap();
        })
    };
    f.provider
        .connector()
        .on_delete_completion(path.clone())
        .await;
    removal.await.unwrap();
    assert!(f.remote.file_data("a.txt").is_none());
}

#[tokio::test]
async fn delete_completion_removes_remote_directory() {
    let f = fixture().await;
    std::fs::remove_dir_all(f.root.join("dir")).unwrap();
    f.provider
        .connector()
        .on_delete_completion(f.root.join("dir"))
        .await;
    assert_eq!(f.remote.paths(), vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn rename_completion_moves_remote_entry() {
    let f = fixture().await;
    std::fs::rename(f.root.join("dir"), f.root.join("renamed")).unwrap();
    f.provider
        .connector()
        .on_rename_completion(f.root.join("dir"), f.root.join("renamed"))
        .await;
    assert!(f.remote.file_data("renamed/b.txt").is_some());
    assert!(f.remote.file_data("dir/b.txt").is_none());
}

#[tokio::test]
async fn move_out_of_root_deletes_remote_entry() {
    let f = fixture().await;
    let outside = f.tmp.path().join("outside.txt");
    std::fs::rename(f.root.join("a.txt"), &outside).unwrap();
    f.provider
        .connector()
        .on_rename_completion(f.root.join("a.txt"), outside)
        .await;
    assert!(f.remote.file_data("a.txt").is_none());
    assert!(f.remote.file_data("dir/b.txt").is_some());
}

#[tokio::test]
async fn rename_of_unknown_source_is_ignored() {
    let f = fixture().await;
    f.provider
        .connector()
        .on_rename_completion(f.root.join("ghost.txt"), f.root.join("other.txt"))
        .await;
    assert_eq!(f.remote.paths().len(), 3);
    assert_eq!(f.metrics.failures("connector"), 0);
}

#[tokio::test]
async fn recall_streams_in_chunks() {
    let f = fixture().await;
    let data = f.filter.read_file(&f.root.join("a.txt")).await.unwrap();
    assert_eq!(data, vec![b'a'; 40]);

    let offsets: Vec<(u64, u64)> = f
        .remote
        .range_reads()
        .iter()
        .map(|r| (r.offset, r.len))
        .collect();
    assert_eq!(offsets, vec![(0, 16), (16, 16), (32, 8)]);
    assert_eq!(f.filter.progress_reports(), 3);
}

#[tokio::test]
async fn late_cancel_does_not_leak_transfer_state() {
    let f = fixture().await;
    let connector = f.provider.connector();
    f.filter.read_file(&f.root.join("a.txt")).await.unwrap();
    for _ in 0..50 {
        if connector.active_transfers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.active_transfers(), 0);

    // Cancels for transfers that already finished, or never existed
    for id in [1, 2, 999] {
        connector
            .cancel_fetch_data(CancelFetchDataRequest {
                connection: ConnectionKey(1),
                transfer: TransferKey(id),
                path: f.root.join("a.txt"),
            })
            .await;
    }
    assert_eq!(connector.active_transfers(), 0);

    // Later recalls are not mistaken for cancelled ones
    let data = f.filter.read_file(&f.root.join("dir/b.txt")).await.unwrap();
    assert_eq!(data, vec![b'b'; 8]);
}

#[tokio::test]
async fn recall_from_unreachable_remote_fails_cleanly() {
    let f = fixture().await;
    f.remote.set_unreachable(true);
    let err = f.filter.open_file(&f.root.join("a.txt")).await.unwrap_err();
    assert!(err.to_string().contains("fetch data"), "{err}");
    assert_eq!(f.metrics.failures("connector"), 1);

    // The worker survives and serves the next request
    f.remote.set_unreachable(false);
    let data = f.filter.read_file(&f.root.join("a.txt")).await.unwrap();
    assert_eq!(data.len(), 40);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let f = fixture().await;
    assert!(f.provider.connector().is_connected());
    f.provider.connector().disconnect().await.unwrap();
    assert!(!f.provider.connector().is_connected());
    f.provider.connector().disconnect().await.unwrap();
}
