use common::{DeletePropagationPolicy, ObjectIdentity, OwnerReference};
use uuid::Uuid;

use crate::api::StoreError;

/// What a single evaluation of a node did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemAction {
    /// The task was stale and dropped without contacting the store.
    Dropped,
    /// The node is virtual and its object exists; nothing is decided until
    /// the watch delivers it.
    AwaitingObservation,
    /// The object is gone; a virtual delete event was handed to the graph.
    VirtualDeleteEnqueued,
    Deleted {
        policy: DeletePropagationPolicy,
        /// Blocking dependents mid foreground cascade whose edge should be
        /// made non-blocking to break an ownership cycle. Not patched yet.
        cycle_break_pending: Vec<ObjectIdentity>,
    },
    /// Every owner is solid.
    Retained,
    /// At least one owner is solid, but some references are dangling or
    /// waiting. Scrubbing them from the object is not implemented yet.
    RetainedWithStaleOwners {
        dangling: Vec<OwnerReference>,
        waiting: Vec<OwnerReference>,
    },
    /// The foreground cascade finished and the delete-dependents finalizer
    /// was removed (or was already gone).
    FinalizerRemoved,
    /// The cascade is still blocked; this many dependents were enqueued.
    DependentsEnqueued(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("node {0} not yet observed via the watch stream")]
    NotObserved(Uuid),

    #[error("gave up removing finalizer from {0} after repeated conflicts")]
    ConflictRetriesExhausted(ObjectIdentity),

    #[error("garbage collector cancelled")]
    Cancelled,
}

impl GcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GcError::Store(e) if e.is_not_found())
    }
}

/// Owner references of an item, split by the state of their targets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnerClassification {
    /// Owner exists and is not in a foreground cascade.
    pub solid: Vec<OwnerReference>,
    /// Owner does not exist.
    pub dangling: Vec<OwnerReference>,
    /// Owner is terminating with the delete-dependents finalizer.
    pub waiting_for_dependents_deletion: Vec<OwnerReference>,
}
