use crate::statetransfer::DataContainer;
use crate::topology::{CacheTopology, ConsistentHash};
use crate::types::{Address, InternalEntry, SegmentId};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Addresses from names.
pub fn addrs(names: &[&str]) -> Vec<Address> {
    names.iter().map(|n| Address::new(n)).collect()
}

/// A hash where segment `i` is owned by `owners[i]`, in order.
pub fn hash_of(members: &[&str], owners: &[&[&str]]) -> ConsistentHash {
    let num_owners = owners.iter().map(|o| o.len()).max().unwrap_or(1);
    ConsistentHash::new(
        addrs(members),
        owners.iter().map(|o| addrs(o)).collect(),
        num_owners,
        true,
    )
    .expect("valid hash")
}

/// A stable topology over `ch`.
pub fn stable_topology(topology_id: i32, ch: ConsistentHash) -> CacheTopology {
    CacheTopology::builder(topology_id, 1, ch)
        .build()
        .expect("valid topology")
}

/// Write `count` versioned entries whose keys are `prefix-<n>`.
pub async fn fill(container: &dyn DataContainer, prefix: &str, count: usize, version: u64) {
    for i in 0..count {
        let key = format!("{}-{}", prefix, i);
        let value = format!("value-{}-v{}", i, version);
        container
            .put(InternalEntry::versioned(key.into_bytes(), value.into_bytes(), version))
            .await
            .expect("put");
    }
}

/// Write entries until `segment` holds at least `count` of them.
pub async fn fill_segment(container: &dyn DataContainer, segment: SegmentId, count: usize) {
    let mut written = 0;
    let mut i = 0u64;
    while written < count {
        let key = format!("key-{}", i);
        if container.segment_of(key.as_bytes()) == segment {
            container
                .put(InternalEntry::versioned(key.into_bytes(), b"v".to_vec(), 1))
                .await
                .expect("put");
            written += 1;
        }
        i += 1;
    }
}

/// Retry `action` until `predicate` accepts its result or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}

/// Wait for a condition with timeout.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
