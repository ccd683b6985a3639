use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use depfleet_core::models::{DependencyType, InventoryRecord, NodeId};
use depfleet_core::persistence::{InMemoryInventoryStore, InventoryStore};
use depfleet_core::sqlite::SqliteStore;

const PACKAGES: [&str; 4] = ["lodash", "pm2", "yarn", "typescript"];

fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("depfleet-{test_name}-{nanos}.sqlite3"))
}

/// Every package on the node reports the same generation-tagged version.
fn generation_report(node: &NodeId, generation: u32) -> Vec<InventoryRecord> {
    PACKAGES
        .iter()
        .map(|name| InventoryRecord {
            node_id: node.clone(),
            package_name: name.to_string(),
            dependency_type: DependencyType::Node,
            version: format!("1.0.{generation}"),
            observed_at: SystemTime::now(),
        })
        .collect()
}

/// Writers on one key race readers; a reader must only ever see a single
/// generation across all packages of that node.
fn assert_no_torn_reads(store: Arc<dyn InventoryStore>, writers: u32, rounds: u32) {
    let node = NodeId::new("node1");
    store
        .upsert_node_inventory(&node, DependencyType::Node, &generation_report(&node, 0))
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let names: Vec<String> = PACKAGES.iter().map(|name| name.to_string()).collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let done = done.clone();
            let names = names.clone();
            thread::spawn(move || {
                let mut observations = 0usize;
                while !done.load(Ordering::SeqCst) || observations == 0 {
                    let results = store
                        .aggregate_by_name(DependencyType::Node, &names)
                        .expect("aggregate should succeed");
                    assert_eq!(results.len(), PACKAGES.len());

                    let versions: BTreeSet<&String> =
                        results.iter().flat_map(|result| result.versions.iter()).collect();
                    assert_eq!(versions.len(), 1, "torn read: {versions:?}");
                    for result in &results {
                        assert_eq!(result.node_ids.len(), 1);
                    }
                    observations += 1;
                }
                observations
            })
        })
        .collect();

    let writer_threads: Vec<_> = (0..writers)
        .map(|writer| {
            let store = store.clone();
            let node = node.clone();
            thread::spawn(move || {
                for round in 0..rounds {
                    let generation = 1 + writer * rounds + round;
                    store
                        .upsert_node_inventory(
                            &node,
                            DependencyType::Node,
                            &generation_report(&node, generation),
                        )
                        .expect("upsert should succeed");
                }
            })
        })
        .collect();

    for writer in writer_threads {
        writer.join().expect("writer should not panic");
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().expect("reader should not panic") > 0);
    }
}

#[test]
fn in_memory_store_never_exposes_a_mixed_report() {
    assert_no_torn_reads(Arc::new(InMemoryInventoryStore::new()), 8, 200);
}

#[test]
fn sqlite_store_never_exposes_a_mixed_report() {
    let store = SqliteStore::new(temp_db_path("concurrent-upserts"));
    store.migrate_to_latest().unwrap();
    assert_no_torn_reads(Arc::new(store), 4, 20);
}

#[test]
fn independent_keys_do_not_interfere() {
    let store: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
    let threads: Vec<_> = (0..8)
        .map(|index| {
            let store = store.clone();
            thread::spawn(move || {
                let node = NodeId::new(format!("node{index}"));
                for generation in 0..50 {
                    store
                        .upsert_node_inventory(
                            &node,
                            DependencyType::Node,
                            &generation_report(&node, generation),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let results = store
        .aggregate_by_name(DependencyType::Node, &["lodash".to_string()])
        .unwrap();
    assert_eq!(results[0].node_ids.len(), 8);
    assert_eq!(
        results[0].versions,
        BTreeSet::from(["1.0.49".to_string()])
    );
}
