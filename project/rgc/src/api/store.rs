use async_trait::async_trait;
use common::{DeletePropagationPolicy, Object, ObjectIdentity, Scope};

/// Errors surfaced by an [`ObjectStore`].
///
/// The collector only distinguishes `NotFound` and `Conflict`; anything else
/// is carried as an opaque error and retried later.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("conflict updating {0}: object has been modified")]
    Conflict(String),

    #[error("store error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// The object store contract consumed by the garbage collector.
///
/// Implementations enforce finalizer and deletion-timestamp semantics on
/// delete: an object with pending finalizers is only stamped with a deletion
/// timestamp, and is physically removed once its finalizer list is empty.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    type Object: Object;

    async fn get(
        &self,
        scopes: &[Scope],
        resource: &str,
        name: &str,
    ) -> Result<Self::Object, StoreError>;

    /// Optimistic-concurrency update; a stale object yields `Conflict`.
    async fn update(
        &self,
        scopes: &[Scope],
        object: Self::Object,
    ) -> Result<Self::Object, StoreError>;

    /// Deletes the object addressed by `identity`, guarded by its UID.
    async fn delete(
        &self,
        identity: &ObjectIdentity,
        policy: DeletePropagationPolicy,
    ) -> Result<(), StoreError>;
}
