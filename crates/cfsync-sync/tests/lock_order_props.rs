//! Property tests for FileLocker: whatever paths are locked, in whatever
//! order, every slot is handed back and nothing stays tracked.

use std::sync::Arc;

use cfsync_sync::FileLocker;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn path_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a.txt".to_string()),
        Just("b.txt".to_string()),
        Just("dir/c.txt".to_string()),
        Just("dir\\c.txt".to_string()),
        "[a-d]{1,3}(/[a-d]{1,3}){0,2}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn concurrent_lock_many_always_drains(
        batches in prop::collection::vec(prop::collection::vec(path_strategy(), 1..4), 1..12)
    ) {
        let rt = runtime();
        let locker = FileLocker::new();
        rt.block_on(async {
            let mut handles = Vec::new();
            for batch in batches {
                let locker = locker.clone();
                handles.push(tokio::spawn(async move {
                    let keys: Vec<&str> = batch.iter().map(String::as_str).collect();
                    let guards = locker.lock_many(&keys).await;
                    tokio::task::yield_now().await;
                    drop(guards);
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
        });
        prop_assert_eq!(locker.tracked_paths(), 0);
    }

    #[test]
    fn reversed_pairs_never_deadlock(
        left in path_strategy(),
        right in path_strategy(),
        rounds in 1usize..20,
    ) {
        let rt = runtime();
        let locker = FileLocker::new();
        let pair = Arc::new((left, right));
        rt.block_on(async {
            let mut handles = Vec::new();
            for round in 0..rounds {
                let locker = locker.clone();
                let pair = pair.clone();
                handles.push(tokio::spawn(async move {
                    let (a, b) = (pair.0.as_str(), pair.1.as_str());
                    let keys = if round % 2 == 0 { [a, b] } else { [b, a] };
                    let _guards = locker.lock_many(&keys).await;
                    tokio::task::yield_now().await;
                }));
            }
            let all = futures::future::join_all(handles);
            let joined = tokio::time::timeout(std::time::Duration::from_secs(5), all).await;
            assert!(joined.is_ok(), "lock_many deadlocked");
        });
        prop_assert_eq!(locker.tracked_paths(), 0);
    }
}
