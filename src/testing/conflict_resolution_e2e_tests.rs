//! Conflict Resolution E2E Test Suite
//!
//! Divergent copies are planted directly in the members' stores, then the
//! coordinator's conflict manager pulls every copy over the in-memory network,
//! merges them and pushes the winners back to the owners.
//!
//! | Test ID   | Scenario                        | Verification                          |
//! |-----------|---------------------------------|---------------------------------------|
//! | TC_CR_01  | Version based merge             | Owners converge on the newest copy    |
//! | TC_CR_02  | Member unreachable              | Resolution finishes with the rest     |
//! | TC_CR_03  | Preferred partition always wins | Backup writes are overwritten         |
//! | TC_CR_04  | Merge id behind installed id    | Pushes carry the installed topology   |

#[cfg(test)]
mod tests {
    use crate::config::{PartitionHandlingConfig, StateTransferConfig};
    use crate::conflict::{ConflictManager, MergeInfo, MergePolicy};
    use crate::statetransfer::DataContainer;
    use crate::testing::TestCluster;
    use crate::types::{Address, InternalEntry, UNKNOWN_TOPOLOGY_ID};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    const SETTLE: Duration = Duration::from_secs(10);

    async fn cluster_with(policy: MergePolicy) -> TestCluster {
        let config = StateTransferConfig::default()
            .with_num_segments(16)
            .with_chunk_size(8)
            .with_timeout(Duration::from_secs(5));
        let partition_handling = PartitionHandlingConfig::default().with_merge_policy(policy);

        let mut cluster = TestCluster::new("A", config, partition_handling);
        for name in ["A", "B", "C"] {
            cluster.join(name).unwrap();
        }
        assert!(cluster.wait_for_stable(3, SETTLE).await, "{:?}", cluster);

        for i in 0..30 {
            let key = format!("k-{}", i);
            cluster
                .put(InternalEntry::versioned(key.into_bytes(), b"base".to_vec(), 1))
                .await
                .unwrap();
        }
        cluster
    }

    /// `(primary, backup)` owners of `key` in the installed topology.
    fn owners_of(cluster: &TestCluster, key: &str) -> (Address, Address) {
        let topology = cluster.current_topology().unwrap();
        let segment = cluster.node("A").container.segment_of(key.as_bytes());
        let owners = topology.current_ch().owners_for_segment(segment);
        assert_eq!(owners.len(), 2);
        (owners[0].clone(), owners[1].clone())
    }

    async fn write_on(cluster: &TestCluster, node: &Address, entry: InternalEntry) {
        cluster
            .node(node.as_str())
            .container
            .put(entry)
            .await
            .unwrap();
    }

    async fn version_on(cluster: &TestCluster, node: &Address, key: &str) -> Option<u64> {
        cluster
            .node(node.as_str())
            .container
            .get(key.as_bytes())
            .await
            .and_then(|e| e.metadata.version)
    }

    fn merge_info(cluster: &TestCluster) -> MergeInfo {
        let topology = cluster.current_topology().unwrap();
        MergeInfo {
            topology_id: topology.topology_id(),
            consistent_hash: Arc::clone(topology.current_ch()),
            partitions: BTreeMap::new(),
            members: topology.members().to_vec(),
        }
    }

    // =========================================================================
    // TC_CR_01: Version based merge
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_version_based_merge_converges_owners() {
        let cluster = cluster_with(MergePolicy::VersionBased).await;

        // Backups took newer writes for k-0..k-9, primaries for k-10..k-14.
        for i in 0..10 {
            let key = format!("k-{}", i);
            let (_, backup) = owners_of(&cluster, &key);
            write_on(&cluster, &backup, InternalEntry::versioned(key.into_bytes(), b"backup".to_vec(), 2)).await;
        }
        for i in 10..15 {
            let key = format!("k-{}", i);
            let (primary, _) = owners_of(&cluster, &key);
            write_on(&cluster, &primary, InternalEntry::versioned(key.into_bytes(), b"primary".to_vec(), 3)).await;
        }
        // Keys the primaries never saw.
        for i in 0..5 {
            let key = format!("orphan-{}", i);
            let (_, backup) = owners_of(&cluster, &key);
            write_on(&cluster, &backup, InternalEntry::versioned(key.into_bytes(), b"orphan".to_vec(), 1)).await;
        }

        let conflict_manager = cluster.conflict_manager.clone().unwrap();
        conflict_manager.resolve_conflicts(merge_info(&cluster));
        tokio::time::timeout(SETTLE, conflict_manager.wait_for_completion())
            .await
            .expect("conflict resolution finished");

        assert!(!conflict_manager.is_resolving());
        assert_eq!(conflict_manager.keys_merged(), 20);

        for i in 0..30 {
            let key = format!("k-{}", i);
            let expected = match i {
                0..=9 => Some(2),
                10..=14 => Some(3),
                _ => Some(1),
            };
            let (primary, backup) = owners_of(&cluster, &key);
            assert_eq!(version_on(&cluster, &primary, &key).await, expected, "{} on {}", key, primary);
            assert_eq!(version_on(&cluster, &backup, &key).await, expected, "{} on {}", key, backup);
        }
        for i in 0..5 {
            let key = format!("orphan-{}", i);
            let holders = cluster.holders_of(key.as_bytes()).await;
            assert_eq!(holders.len(), 2, "{} held by {:?}", key, holders);
        }
    }

    // =========================================================================
    // TC_CR_02: Member unreachable
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_unreachable_member_does_not_block_resolution() {
        let cluster = cluster_with(MergePolicy::VersionBased).await;
        let c = Address::new("C");

        // A divergent key none of whose owners is C.
        let key = (0..30)
            .map(|i| format!("k-{}", i))
            .find(|key| {
                let (primary, backup) = owners_of(&cluster, key);
                primary != c && backup != c
            })
            .unwrap();
        let (_, backup) = owners_of(&cluster, &key);
        write_on(&cluster, &backup, InternalEntry::versioned(key.clone().into_bytes(), b"newer".to_vec(), 7)).await;

        cluster.network.crash(&c);

        let conflict_manager = cluster.conflict_manager.clone().unwrap();
        conflict_manager.resolve_conflicts(merge_info(&cluster));
        // Well inside the collection timeout: C is dropped as soon as the
        // request to it fails.
        tokio::time::timeout(Duration::from_secs(3), conflict_manager.wait_for_completion())
            .await
            .expect("resolution did not wait for the unreachable member");

        let (primary, _) = owners_of(&cluster, &key);
        assert_eq!(version_on(&cluster, &primary, &key).await, Some(7));
        assert!(conflict_manager.keys_merged() >= 1);
    }

    // =========================================================================
    // TC_CR_03: Preferred partition always wins
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_preferred_always_overwrites_backups() {
        let cluster = cluster_with(MergePolicy::PreferredAlways).await;

        for i in 0..10 {
            let key = format!("k-{}", i);
            let (_, backup) = owners_of(&cluster, &key);
            write_on(&cluster, &backup, InternalEntry::versioned(key.into_bytes(), b"backup".to_vec(), 9)).await;
        }

        let conflict_manager = cluster.conflict_manager.clone().unwrap();
        conflict_manager.resolve_conflicts(merge_info(&cluster));
        tokio::time::timeout(SETTLE, conflict_manager.wait_for_completion())
            .await
            .expect("conflict resolution finished");

        assert_eq!(conflict_manager.keys_merged(), 10);
        for i in 0..10 {
            let key = format!("k-{}", i);
            for node in cluster.holders_of(key.as_bytes()).await {
                assert_eq!(version_on(&cluster, &node, &key).await, Some(1), "{} on {}", key, node);
            }
        }
    }

    // =========================================================================
    // TC_CR_04: Merge id behind installed id
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_merged_values_pushed_with_installed_topology() {
        let cluster = cluster_with(MergePolicy::VersionBased).await;
        let installed = cluster.current_topology().unwrap().topology_id();

        // A key whose primary is remote, so its winner goes over the network.
        let key = (0..30)
            .map(|i| format!("k-{}", i))
            .find(|key| owners_of(&cluster, key).0.as_str() != "A")
            .unwrap();
        let (primary, backup) = owners_of(&cluster, &key);
        write_on(&cluster, &backup, InternalEntry::versioned(key.clone().into_bytes(), b"newer".to_vec(), 6)).await;

        // Every node sits above the id the resolution was started with.
        let mut info = merge_info(&cluster);
        info.topology_id = UNKNOWN_TOPOLOGY_ID;
        assert!(cluster.nodes().all(|n| n.topology_id() == installed && installed > info.topology_id));

        let conflict_manager = cluster.conflict_manager.clone().unwrap();
        conflict_manager.resolve_conflicts(info);
        tokio::time::timeout(SETTLE, conflict_manager.wait_for_completion())
            .await
            .expect("conflict resolution finished");

        assert_eq!(version_on(&cluster, &primary, &key).await, Some(6), "{} on {}", key, primary);
    }
}
