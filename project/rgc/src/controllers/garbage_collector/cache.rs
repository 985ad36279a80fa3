use std::num::NonZeroUsize;

use common::{ObjectIdentity, OwnerReference, Scope};
use lru::LruCache;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Coordinates under which an object was confirmed absent. An empty `scopes`
/// is the cluster-wide key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ReferenceKey {
    pub resource: String,
    pub name: String,
    pub uid: Uuid,
    pub scopes: Vec<Scope>,
}

impl ReferenceKey {
    pub fn cluster(owner_ref: &OwnerReference) -> Self {
        Self::scoped(owner_ref, &[])
    }

    pub fn scoped(owner_ref: &OwnerReference, scopes: &[Scope]) -> Self {
        Self {
            resource: owner_ref.resource.clone(),
            name: owner_ref.name.clone(),
            uid: owner_ref.uid,
            scopes: scopes.to_vec(),
        }
    }
}

impl From<&ObjectIdentity> for ReferenceKey {
    fn from(identity: &ObjectIdentity) -> Self {
        Self {
            resource: identity.resource.clone(),
            name: identity.name.clone(),
            uid: identity.uid,
            scopes: identity.scopes.clone(),
        }
    }
}

/// Bounded negative cache of owners known not to exist.
///
/// Entries are only added after the store confirmed the absence; a hit lets
/// the collector skip the store lookup entirely.
#[derive(Debug)]
pub struct ReferenceCache {
    absent: RwLock<LruCache<ReferenceKey, ()>>,
}

impl ReferenceCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            absent: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Checks the cluster-wide key first, then the key qualified with
    /// `scopes`.
    pub async fn is_absent(&self, owner_ref: &OwnerReference, scopes: &[Scope]) -> bool {
        let cache = self.absent.read().await;
        cache.contains(&ReferenceKey::cluster(owner_ref))
            || (!scopes.is_empty() && cache.contains(&ReferenceKey::scoped(owner_ref, scopes)))
    }

    pub async fn mark_absent(&self, key: ReferenceKey) {
        self.absent.write().await.put(key, ());
    }

    pub async fn len(&self) -> usize {
        self.absent.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.absent.read().await.is_empty()
    }
}
