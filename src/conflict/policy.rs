//! Merge policies choosing the surviving copy of a key after a split.

use crate::types::InternalEntry;
use std::sync::Arc;

/// User supplied merge logic.
pub trait EntryMergePolicy: Send + Sync + std::fmt::Debug {
    /// Pick the surviving entry. `preferred` is the copy held by the preferred
    /// partition, `others` the copies found elsewhere. `None` removes the key.
    fn merge(
        &self,
        preferred: Option<&InternalEntry>,
        others: &[InternalEntry],
    ) -> Option<InternalEntry>;
}

/// Built-in merge policies.
#[derive(Debug, Clone)]
pub enum MergePolicy {
    /// Always keep the preferred copy, removing the key if it has none.
    PreferredAlways,
    /// Keep the preferred copy, or the first other copy if it has none.
    PreferredNonNull,
    /// Keep the copy with the highest version; the preferred copy wins ties
    /// and unversioned copies lose to versioned ones.
    VersionBased,
    /// Delegate to user logic.
    Custom(Arc<dyn EntryMergePolicy>),
}

impl MergePolicy {
    /// Pick the surviving entry.
    pub fn merge(
        &self,
        preferred: Option<&InternalEntry>,
        others: &[InternalEntry],
    ) -> Option<InternalEntry> {
        match self {
            MergePolicy::PreferredAlways => preferred.cloned(),
            MergePolicy::PreferredNonNull => preferred.or_else(|| others.first()).cloned(),
            MergePolicy::VersionBased => {
                let mut winner = preferred;
                for candidate in others {
                    let better = match winner {
                        None => true,
                        Some(current) => candidate.metadata.version > current.metadata.version,
                    };
                    if better {
                        winner = Some(candidate);
                    }
                }
                winner.cloned()
            }
            MergePolicy::Custom(policy) => policy.merge(preferred, others),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Concat;

    impl EntryMergePolicy for Concat {
        fn merge(
            &self,
            preferred: Option<&InternalEntry>,
            others: &[InternalEntry],
        ) -> Option<InternalEntry> {
            let mut value = Vec::new();
            for entry in preferred.into_iter().chain(others) {
                value.extend_from_slice(entry.value.as_deref().unwrap_or_default());
            }
            Some(InternalEntry::new("k", value))
        }
    }

    fn entry(value: &'static str, version: u64) -> InternalEntry {
        InternalEntry::versioned("k", value, version)
    }

    #[test]
    fn test_preferred_always() {
        let others = vec![entry("b", 2)];
        assert_eq!(
            MergePolicy::PreferredAlways.merge(Some(&entry("a", 1)), &others),
            Some(entry("a", 1))
        );
        assert_eq!(MergePolicy::PreferredAlways.merge(None, &others), None);
    }

    #[test]
    fn test_preferred_non_null() {
        let others = vec![entry("b", 2), entry("c", 3)];
        assert_eq!(
            MergePolicy::PreferredNonNull.merge(Some(&entry("a", 1)), &others),
            Some(entry("a", 1))
        );
        assert_eq!(
            MergePolicy::PreferredNonNull.merge(None, &others),
            Some(entry("b", 2))
        );
        assert_eq!(MergePolicy::PreferredNonNull.merge(None, &[]), None);
    }

    #[test]
    fn test_version_based() {
        let others = vec![entry("b", 5), entry("c", 3)];
        assert_eq!(
            MergePolicy::VersionBased.merge(Some(&entry("a", 4)), &others),
            Some(entry("b", 5))
        );
        assert_eq!(
            MergePolicy::VersionBased.merge(Some(&entry("a", 5)), &others),
            Some(entry("a", 5))
        );

        let unversioned = InternalEntry::new("k", "x");
        assert_eq!(
            MergePolicy::VersionBased.merge(Some(&unversioned), &[entry("b", 1)]),
            Some(entry("b", 1))
        );
    }

    #[test]
    fn test_custom() {
        let policy = MergePolicy::Custom(Arc::new(Concat));
        let merged = policy
            .merge(Some(&entry("a", 1)), &[entry("b", 2)])
            .unwrap();
        assert_eq!(merged.value.as_deref(), Some(&b"ab"[..]));
    }
}
