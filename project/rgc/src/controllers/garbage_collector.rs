use std::{future::Future, num::NonZeroUsize, sync::Arc};

use common::{
    DeletePropagationPolicy, Finalizer, Object, ObjectIdentity, OwnerReference, WatchEvent,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinSet};
use tokio_util::sync::CancellationToken;

use self::{
    cache::{ReferenceCache, ReferenceKey},
    graph::{NodeRef, blocking_dependents},
    graph_builder::GraphBuilder,
    queue::WorkQueue,
    types::{GcError, ItemAction, OwnerClassification},
};
use crate::{
    api::{ObjectStore, RetryPolicy, StoreError},
    protocol::config::GcConfig,
};

pub mod cache;
pub mod graph;
pub mod graph_builder;
pub mod queue;
pub mod types;

/// GarbageCollector implements cascading deletion using the owner reference
/// mechanism.
///
/// # Overview
///
/// Every stored object may name one or more owners through its
/// `owner_references`. The collector keeps a dependency graph of those edges
/// in memory, fed only by the store's watch feed, and deletes objects whose
/// owners are all gone. It never scans the store.
///
/// ## Owner references
///
/// Each `OwnerReference` contains:
/// - `uid`: unique identifier of the owner
/// - `name` and `resource`: coordinates of the owner, looked up in the
///   dependent's own scopes
/// - `block_owner_deletion`: whether the dependent blocks a foreground
///   deletion of the owner
///
/// ## Deletion propagation policies
///
/// 1. **Background** (default): the owner is removed immediately and its
///    dependents are collected afterwards, once their owner is found dangling.
///
/// 2. **Foreground**: the owner gets a deletion timestamp and the
///    `delete-dependents` finalizer. It stays visible until every blocking
///    dependent is gone, then the collector removes the finalizer and the
///    store removes the owner.
///
/// 3. **Orphan**: the store detaches the dependents (drops their owner
///    reference) and removes the owner. The dependents survive.
///
/// # How it works
///
/// 1. **Graph building**: the [`GraphBuilder`] applies `Added`, `Modified`
///    and `Deleted` events to the graph. Owners referenced before they are
///    seen get a *virtual* node.
///
/// 2. **Deletion attempts**: nodes that may have become collectable are put on
///    the attempt-to-delete queue. A worker fetches the latest object and
///    classifies its owners into:
///      - **solid**: the owner exists and is not in a foreground cascade
///      - **dangling**: the owner does not exist (cached once confirmed)
///      - **waiting for dependents deletion**: the owner is terminating with
///        the `delete-dependents` finalizer
///
/// 3. **Decision**: any solid owner keeps the object; otherwise it is deleted
///    with a single delete call. The cascade then continues through the watch
///    feed and the queue, never by recursion.
///
/// # Usage
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rgc::api::MemoryStore;
/// use rgc::controllers::GarbageCollector;
/// use rgc::protocol::config::GcConfig;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let events = store.subscribe().await;
/// let gc = Arc::new(GarbageCollector::new(store, &GcConfig::default()));
///
/// let token = gc.cancellation_token();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     token.cancel();
/// });
/// gc.run(events).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Example scenarios
///
/// ## Background cascade
///
/// 1. A folder owns three files, each with an owner reference to the folder
/// 2. The folder is deleted with the Background policy
/// 3. The store removes the folder and emits `Deleted`
/// 4. The graph marks the folder absent and enqueues the three files
/// 5. Each file finds its only owner dangling and is deleted
///
/// ## Foreground cascade
///
/// 1. A folder owns files with `blockOwnerDeletion: true`
/// 2. The folder is deleted with the Foreground policy
/// 3. The folder gets a deletion timestamp and the `delete-dependents` finalizer
/// 4. The files see their owner waiting for dependents deletion and are deleted
/// 5. Once no blocking file is left the finalizer is removed and the folder goes
pub struct GarbageCollector<S: ObjectStore> {
    store: Arc<S>,
    graph_builder: Arc<GraphBuilder>,
    attempt_to_delete: Arc<WorkQueue>,
    absent_owner_cache: Arc<ReferenceCache>,
    retry_policy: RetryPolicy,
    workers: usize,
    token: CancellationToken,
}

impl<S: ObjectStore> GarbageCollector<S> {
    pub fn new(store: Arc<S>, cfg: &GcConfig) -> Self {
        let attempt_to_delete = Arc::new(WorkQueue::new(&cfg.requeue));
        let capacity =
            NonZeroUsize::new(cfg.absent_owner_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let absent_owner_cache = Arc::new(ReferenceCache::new(capacity));

        Self {
            store,
            graph_builder: Arc::new(GraphBuilder::new(
                attempt_to_delete.clone(),
                absent_owner_cache.clone(),
            )),
            attempt_to_delete,
            absent_owner_cache,
            retry_policy: RetryPolicy::from(&cfg.finalizer_retry),
            workers: cfg.workers.max(1),
            token: CancellationToken::new(),
        }
    }

    pub fn graph_builder(&self) -> &Arc<GraphBuilder> {
        &self.graph_builder
    }

    pub fn attempt_to_delete(&self) -> &Arc<WorkQueue> {
        &self.attempt_to_delete
    }

    /// Cancelling this token stops [`GarbageCollector::run`] and aborts
    /// in-flight store calls.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the graph builder loop and the worker pool until cancelled. The
    /// first failing task cancels the others and its error is returned.
    pub async fn run(
        self: &Arc<Self>,
        events: UnboundedReceiver<WatchEvent>,
    ) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        let graph_builder = self.graph_builder.clone();
        let token = self.token.clone();
        tasks.spawn(async move { graph_builder.run(events, token).await });

        for i in 0..self.workers {
            let gc = self.clone();
            tasks.spawn(async move {
                gc.run_attempt_to_delete_worker(i).await;
                Ok(())
            });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(anyhow::Error::from).and_then(|r| r);
            if let Err(e) = outcome {
                log::error!("[GarbageCollector] Task failed, shutting down: {e:#}");
                if result.is_ok() {
                    result = Err(e);
                }
                self.token.cancel();
            }
        }

        self.attempt_to_delete.shutdown();
        log::info!("[GarbageCollector] Stopped");
        result
    }

    async fn run_attempt_to_delete_worker(&self, id: usize) {
        log::debug!("[GarbageCollector] Starting attempt_to_delete worker [#{id}]");
        loop {
            let node = tokio::select! {
                _ = self.token.cancelled() => break,
                node = self.attempt_to_delete.get() => match node {
                    Some(node) => node,
                    None => break,
                },
            };
            self.process_attempt_to_delete(&node).await;
        }
        log::debug!("[GarbageCollector] attempt_to_delete worker [#{id}] stopped");
    }

    async fn process_attempt_to_delete(&self, node: &NodeRef) {
        match self.attempt_to_delete_worker(node).await {
            Ok(action) => {
                log::debug!(
                    "[GarbageCollector] Processed {}: {action:?}",
                    node.read().await.identity()
                );
                self.attempt_to_delete.forget(node);
            }
            Err(GcError::Cancelled) => {}
            Err(e @ GcError::NotObserved(_)) => {
                log::debug!("[GarbageCollector] {e}, requeueing");
                self.attempt_to_delete.add_rate_limited(node.clone());
            }
            Err(e) => {
                log::error!(
                    "[GarbageCollector] Error attempting to delete item {}: {e}",
                    node.read().await.identity()
                );
                self.attempt_to_delete.add_rate_limited(node.clone());
            }
        }
        self.attempt_to_delete.done(node);
    }

    /// Evaluates one queued node. Stale tasks for virtual nodes are dropped
    /// without contacting the store.
    pub async fn attempt_to_delete_worker(&self, node: &NodeRef) -> Result<ItemAction, GcError> {
        let (observed, uid) = {
            let guard = node.read().await;
            (guard.is_observed(), guard.identity().uid)
        };

        if !observed {
            match self.graph_builder.uid_to_node_table.get(&uid).await {
                None => {
                    log::debug!(
                        "[GarbageCollector] Virtual node {uid} no longer in the graph, dropping"
                    );
                    return Ok(ItemAction::Dropped);
                }
                // replaced by an observed node or a fresher virtual one
                Some(current) if !Arc::ptr_eq(&current, node) => {
                    log::debug!(
                        "[GarbageCollector] Virtual node {uid} was superseded, dropping"
                    );
                    return Ok(ItemAction::Dropped);
                }
                Some(_) => {}
            }
        }

        let action = self.attempt_to_delete_item(node).await?;
        if action == ItemAction::AwaitingObservation && !node.read().await.is_observed() {
            return Err(GcError::NotObserved(uid));
        }
        Ok(action)
    }

    /// The deletion decision for a single node. Issues at most one store
    /// mutation.
    pub async fn attempt_to_delete_item(&self, node: &NodeRef) -> Result<ItemAction, GcError> {
        let (identity, observed, being_deleted, deleting_dependents, has_dependents) = {
            let guard = node.read().await;
            (
                guard.identity().clone(),
                guard.is_observed(),
                guard.is_being_deleted(),
                guard.is_deleting_dependents(),
                guard.dependents_length() > 0,
            )
        };
        log::debug!(
            "[GarbageCollector] Attempting to delete item {identity}, virtual: {}",
            !observed
        );

        if being_deleted && !deleting_dependents {
            log::debug!(
                "[GarbageCollector] Item {identity} is being deleted, issuing plain delete"
            );
            self.delete_object(&identity, None).await?;
            return Ok(ItemAction::Deleted {
                policy: DeletePropagationPolicy::default(),
                cycle_break_pending: Vec::new(),
            });
        }

        let latest = match self
            .cancellable(self.store.get(&identity.scopes, &identity.resource, &identity.name))
            .await
        {
            Ok(latest) if latest.identity().uid == identity.uid => latest,
            Ok(latest) => {
                log::debug!(
                    "[GarbageCollector] Item {identity} has UID mismatch (store: {}), sending virtual delete event to GraphBuilder",
                    latest.identity().uid
                );
                self.graph_builder.enqueue_virtual_delete_event(&identity);
                return Ok(ItemAction::VirtualDeleteEnqueued);
            }
            Err(e) if e.is_not_found() => {
                log::debug!(
                    "[GarbageCollector] Item {identity} does not exist in the store, sending virtual delete event to GraphBuilder"
                );
                self.graph_builder.enqueue_virtual_delete_event(&identity);
                return Ok(ItemAction::VirtualDeleteEnqueued);
            }
            Err(e) => return Err(e),
        };

        if !observed {
            log::debug!("[GarbageCollector] Item {identity} exists but has not been observed yet");
            return Ok(ItemAction::AwaitingObservation);
        }

        if deleting_dependents {
            log::debug!("[GarbageCollector] Item {identity} is deleting dependents");
            return self.process_deleting_dependents(node, &identity).await;
        }

        let owner_refs = latest.owner_references().to_vec();
        if owner_refs.is_empty() {
            log::info!("[GarbageCollector] Item {identity} has no owners, deleting");
            self.delete_object(&identity, None).await?;
            return Ok(ItemAction::Deleted {
                policy: DeletePropagationPolicy::default(),
                cycle_break_pending: Vec::new(),
            });
        }

        let OwnerClassification {
            solid,
            dangling,
            waiting_for_dependents_deletion: waiting,
        } = self.classify_references(&identity, &owner_refs).await?;
        log::debug!(
            "[GarbageCollector] Classified owners of {identity}: solid {}, dangling {}, waiting {}",
            solid.len(),
            dangling.len(),
            waiting.len()
        );

        if !solid.is_empty() {
            if dangling.is_empty() && waiting.is_empty() {
                return Ok(ItemAction::Retained);
            }
            log::warn!(
                "[GarbageCollector] Item {identity} has solid owners; stale owner references are left in place (dangling: {}, waiting: {})",
                dangling.len(),
                waiting.len()
            );
            return Ok(ItemAction::RetainedWithStaleOwners { dangling, waiting });
        }

        if !waiting.is_empty() && has_dependents {
            let mut cycle_break_pending = Vec::new();
            for dependent in blocking_dependents(node).await {
                let guard = dependent.read().await;
                if guard.is_deleting_dependents() {
                    cycle_break_pending.push(guard.identity().clone());
                }
            }
            if !cycle_break_pending.is_empty() {
                log::warn!(
                    "[GarbageCollector] Item {identity} has {} blocking dependents in foreground deletion; their edges are not made non-blocking",
                    cycle_break_pending.len()
                );
            }

            log::info!(
                "[GarbageCollector] At least one owner of {identity} is deleting dependents and the item has dependents, deleting in Foreground"
            );
            self.delete_object(&identity, Some(DeletePropagationPolicy::Foreground)).await?;
            return Ok(ItemAction::Deleted {
                policy: DeletePropagationPolicy::Foreground,
                cycle_break_pending,
            });
        }

        let policy = if latest.has_finalizer(Finalizer::OrphanDependents) {
            DeletePropagationPolicy::Orphan
        } else if latest.has_finalizer(Finalizer::DeletingDependents) {
            DeletePropagationPolicy::Foreground
        } else {
            DeletePropagationPolicy::Background
        };

        log::info!("[GarbageCollector] Deleting item {identity} with policy {policy}");
        self.delete_object(&identity, Some(policy)).await?;
        Ok(ItemAction::Deleted {
            policy,
            cycle_break_pending: Vec::new(),
        })
    }

    /// Classify owner references into:
    /// - solid: owner exists and is not waiting for dependents deletion
    /// - dangling: owner does not exist
    /// - waiting for dependents deletion: owner exists, has a deletion
    ///   timestamp and the `delete-dependents` finalizer
    pub async fn classify_references(
        &self,
        item: &ObjectIdentity,
        owner_refs: &[OwnerReference],
    ) -> Result<OwnerClassification, GcError> {
        let mut classification = OwnerClassification::default();

        for owner_ref in owner_refs {
            let (dangling, owner) = self.is_dangling(owner_ref, item).await?;
            match owner {
                _ if dangling => classification.dangling.push(owner_ref.clone()),
                Some(owner)
                    if owner.being_deleted()
                        && owner.has_finalizer(Finalizer::DeletingDependents) =>
                {
                    classification
                        .waiting_for_dependents_deletion
                        .push(owner_ref.clone());
                }
                _ => classification.solid.push(owner_ref.clone()),
            }
        }

        Ok(classification)
    }

    /// Checks whether the owner named by `reference` exists, looking it up in
    /// `item`'s scopes. Returns the owner's latest object when it does.
    pub async fn is_dangling(
        &self,
        reference: &OwnerReference,
        item: &ObjectIdentity,
    ) -> Result<(bool, Option<S::Object>), GcError> {
        if self
            .absent_owner_cache
            .is_absent(reference, &item.scopes)
            .await
        {
            log::debug!(
                "[GarbageCollector] Owner {}/{} ({}) of {item} is known to be absent",
                reference.resource,
                reference.name,
                reference.uid
            );
            return Ok((true, None));
        }

        match self
            .cancellable(self.store.get(&item.scopes, &reference.resource, &reference.name))
            .await
        {
            Ok(owner) if owner.identity().uid == reference.uid => Ok((false, Some(owner))),
            Ok(owner) => {
                log::debug!(
                    "[GarbageCollector] Owner {}/{} of {item} has UID mismatch (store: {}, reference: {})",
                    reference.resource,
                    reference.name,
                    owner.identity().uid,
                    reference.uid
                );
                self.mark_owner_absent(reference, item).await;
                Ok((true, None))
            }
            Err(e) if e.is_not_found() => {
                self.mark_owner_absent(reference, item).await;
                Ok((true, None))
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_owner_absent(&self, reference: &OwnerReference, item: &ObjectIdentity) {
        self.absent_owner_cache
            .mark_absent(ReferenceKey::scoped(reference, &item.scopes))
            .await;
    }

    /// Process a node that is waiting for its blocking dependents to be
    /// deleted.
    pub async fn process_deleting_dependents(
        &self,
        node: &NodeRef,
        identity: &ObjectIdentity,
    ) -> Result<ItemAction, GcError> {
        let blocking = blocking_dependents(node).await;
        if blocking.is_empty() {
            log::info!(
                "[GarbageCollector] No more blocking dependents, removing {} finalizer from {identity}",
                Finalizer::DeletingDependents
            );
            self.remove_finalizer(identity, Finalizer::DeletingDependents).await?;
            return Ok(ItemAction::FinalizerRemoved);
        }

        let mut enqueued = 0;
        for dependent in blocking {
            let (deleting, dependent_identity) = {
                let guard = dependent.read().await;
                (guard.is_deleting_dependents(), guard.identity().clone())
            };
            if deleting {
                continue;
            }
            log::debug!(
                "[GarbageCollector] Dependent {dependent_identity} blocks {identity}, sending attempt to delete"
            );
            self.attempt_to_delete.add(dependent);
            enqueued += 1;
        }
        Ok(ItemAction::DependentsEnqueued(enqueued))
    }

    /// Issues a single delete call. A missing object counts as deleted.
    pub async fn delete_object(
        &self,
        identity: &ObjectIdentity,
        policy: Option<DeletePropagationPolicy>,
    ) -> Result<(), GcError> {
        let policy = policy.unwrap_or_default();
        match self.cancellable(self.store.delete(identity, policy)).await {
            Err(e) if e.is_not_found() => {
                log::debug!("[GarbageCollector] Item {identity} already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn remove_finalizer(
        &self,
        identity: &ObjectIdentity,
        finalizer: Finalizer,
    ) -> Result<(), GcError> {
        let store = self.store.as_ref();
        let op = move || async move {
            let mut latest = store
                .get(&identity.scopes, &identity.resource, &identity.name)
                .await?;
            if latest.identity().uid != identity.uid {
                return Err(StoreError::NotFound(identity.to_string()));
            }
            if !latest.remove_finalizer(finalizer) {
                log::debug!("[GarbageCollector] {identity} no longer carries {finalizer}");
                return Ok(());
            }
            store.update(&identity.scopes, latest).await.map(|_| ())
        };

        match self.cancellable(self.retry_policy.retry_on_conflict(op)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::debug!("[GarbageCollector] {identity} is gone, skipping finalizer removal");
                Ok(())
            }
            Err(GcError::Store(StoreError::Conflict(_))) => {
                Err(GcError::ConflictRetriesExhausted(identity.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn cancellable<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, GcError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(GcError::Cancelled),
            res = call => res.map_err(GcError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryStore, StoreOp};
    use common::{ObjectMeta, Resource, Scope};
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        gc: GarbageCollector<MemoryStore>,
        events: UnboundedReceiver<WatchEvent>,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let events = store.subscribe().await;
            let gc = GarbageCollector::new(store.clone(), &GcConfig::default());
            Self { store, gc, events }
        }

        /// Applies every pending watch and virtual event to the graph.
        async fn sync(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.gc.graph_builder().process_event(event.into()).await;
            }
            self.gc.graph_builder().process_pending_events().await;
        }

        async fn create(&mut self, meta: ObjectMeta) -> ObjectMeta {
            let created = self.store.create(Resource::new(meta)).await.unwrap();
            self.sync().await;
            created.metadata
        }

        async fn delete(&mut self, meta: &ObjectMeta, policy: DeletePropagationPolicy) {
            self.store.delete(&meta.identity(), policy).await.unwrap();
            self.sync().await;
        }

        async fn node(&self, uid: Uuid) -> NodeRef {
            self.gc
                .graph_builder()
                .uid_to_node_table
                .get(&uid)
                .await
                .unwrap()
        }

        async fn ops(&self) -> Vec<StoreOp> {
            self.store.operations().await
        }
    }

    fn meta(name: &str, owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            uid: Uuid::new_v4(),
            name: name.to_string(),
            resource: "files".to_string(),
            scopes: vec![Scope::new("tenants", "acme")],
            owner_references: owners,
            ..Default::default()
        }
    }

    fn owner_ref(owner: &ObjectMeta) -> OwnerReference {
        OwnerReference::new(owner.uid, owner.name.clone(), owner.resource.clone())
    }

    fn deletes(ops: &[StoreOp]) -> Vec<DeletePropagationPolicy> {
        ops.iter()
            .filter_map(|op| match op {
                StoreOp::Delete { policy, .. } => Some(*policy),
                _ => None,
            })
            .collect()
    }

    fn count_gets(ops: &[StoreOp]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, StoreOp::Get { .. }))
            .count()
    }

    fn count_updates(ops: &[StoreOp]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, StoreOp::Update { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_ownerless_item_deleted_in_background() {
        let mut h = Harness::new().await;
        let item = h.create(meta("lonely", vec![])).await;
        h.store.clear_operations().await;

        let node = h.node(item.uid).await;
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert_eq!(
            action,
            ItemAction::Deleted {
                policy: DeletePropagationPolicy::Background,
                cycle_break_pending: vec![],
            }
        );
        assert_eq!(deletes(&h.ops().await), vec![DeletePropagationPolicy::Background]);
        assert!(!h.store.contains(&item.identity()).await);
    }

    #[tokio::test]
    async fn test_solid_owner_keeps_item_and_is_idempotent() {
        let mut h = Harness::new().await;
        let owner = h.create(meta("folder", vec![])).await;
        let child = h.create(meta("child", vec![owner_ref(&owner)])).await;
        h.store.clear_operations().await;

        let node = h.node(child.uid).await;
        let first = h.gc.attempt_to_delete_item(&node).await.unwrap();
        let first_ops = h.ops().await;
        h.store.clear_operations().await;
        let second = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert_eq!(first, ItemAction::Retained);
        assert_eq!(first, second);
        assert_eq!(first_ops, h.ops().await);
        assert!(deletes(&first_ops).is_empty());
        assert!(h.store.contains(&child.identity()).await);
    }

    #[tokio::test]
    async fn test_dependent_of_deleted_owner_is_collected() {
        let mut h = Harness::new().await;
        let owner = h.create(meta("folder", vec![])).await;
        let child = h.create(meta("child", vec![owner_ref(&owner)])).await;

        h.delete(&owner, DeletePropagationPolicy::Background).await;
        h.store.clear_operations().await;

        let node = h.node(child.uid).await;
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert_eq!(
            action,
            ItemAction::Deleted {
                policy: DeletePropagationPolicy::Background,
                cycle_break_pending: vec![],
            }
        );
        assert_eq!(deletes(&h.ops().await), vec![DeletePropagationPolicy::Background]);
        assert!(!h.store.contains(&child.identity()).await);
    }

    #[tokio::test]
    async fn test_is_dangling_caches_absence() {
        let mut h = Harness::new().await;
        let missing = meta("ghost", vec![]);
        let child = h.create(meta("child", vec![owner_ref(&missing)])).await;
        h.store.clear_operations().await;

        let reference = owner_ref(&missing);
        let (dangling, owner) = h.gc.is_dangling(&reference, &child.identity()).await.unwrap();
        assert!(dangling);
        assert!(owner.is_none());
        assert_eq!(count_gets(&h.ops().await), 1);

        let (dangling, _) = h.gc.is_dangling(&reference, &child.identity()).await.unwrap();
        assert!(dangling);
        assert_eq!(count_gets(&h.ops().await), 1);
    }

    #[tokio::test]
    async fn test_uid_mismatch_is_dangling() {
        let mut h = Harness::new().await;
        let owner = h.create(meta("folder", vec![])).await;
        let stale = OwnerReference::new(Uuid::new_v4(), owner.name.clone(), owner.resource.clone());
        let child = h.create(meta("child", vec![stale.clone()])).await;
        h.store.clear_operations().await;

        let (dangling, _) = h.gc.is_dangling(&stale, &child.identity()).await.unwrap();
        assert!(dangling);
        let (dangling, _) = h.gc.is_dangling(&stale, &child.identity()).await.unwrap();
        assert!(dangling);
        assert_eq!(count_gets(&h.ops().await), 1);

        let (dangling, latest) = h
            .gc
            .is_dangling(&owner_ref(&owner), &child.identity())
            .await
            .unwrap();
        assert!(!dangling);
        assert_eq!(latest.unwrap().metadata.uid, owner.uid);
    }

    #[tokio::test]
    async fn test_foreground_completion_removes_finalizer_once() {
        let mut h = Harness::new().await;
        let owner = h.create(meta("folder", vec![])).await;
        let child = h
            .create(meta("child", vec![owner_ref(&owner).blocking()]))
            .await;
        h.delete(&owner, DeletePropagationPolicy::Foreground).await;

        let owner_node = h.node(owner.uid).await;
        assert!(owner_node.read().await.is_deleting_dependents());
        h.store.clear_operations().await;

        let action = h
            .gc
            .process_deleting_dependents(&owner_node, &owner.identity())
            .await
            .unwrap();
        assert_eq!(action, ItemAction::DependentsEnqueued(1));
        assert!(h.ops().await.is_empty());
        assert!(h.store.contains(&owner.identity()).await);

        h.delete(&child, DeletePropagationPolicy::Background).await;
        h.store.clear_operations().await;

        let action = h.gc.attempt_to_delete_item(&owner_node).await.unwrap();
        assert_eq!(action, ItemAction::FinalizerRemoved);
        assert_eq!(count_updates(&h.ops().await), 1);
        assert!(!h.store.contains(&owner.identity()).await);
    }

    #[tokio::test]
    async fn test_virtual_node_pruned_after_not_found() {
        let mut h = Harness::new().await;
        let missing = meta("ghost", vec![]);
        h.create(meta("child", vec![owner_ref(&missing)])).await;

        let virtual_node = h.node(missing.uid).await;
        assert!(!virtual_node.read().await.is_observed());

        let action = h.gc.attempt_to_delete_worker(&virtual_node).await.unwrap();
        assert_eq!(action, ItemAction::VirtualDeleteEnqueued);
        assert_eq!(h.gc.graph_builder().process_pending_events().await, 1);
        assert!(
            !h.gc
                .graph_builder()
                .uid_to_node_table
                .contains_key(&missing.uid)
                .await
        );

        // the stale task is dropped without a store round-trip
        h.store.clear_operations().await;
        let action = h.gc.attempt_to_delete_worker(&virtual_node).await.unwrap();
        assert_eq!(action, ItemAction::Dropped);
        assert!(h.ops().await.is_empty());
    }

    #[tokio::test]
    async fn test_virtual_node_waits_for_observation() {
        let mut h = Harness::new().await;
        let owner = meta("folder", vec![]);
        h.create(meta("child", vec![owner_ref(&owner)])).await;
        let virtual_node = h.node(owner.uid).await;

        // stored, but the watch event has not been applied yet
        h.store.create(Resource::new(owner.clone())).await.unwrap();

        let err = h.gc.attempt_to_delete_worker(&virtual_node).await.unwrap_err();
        assert!(matches!(err, GcError::NotObserved(uid) if uid == owner.uid));
        assert!(deletes(&h.ops().await).is_empty());

        h.sync().await;
        let action = h.gc.attempt_to_delete_worker(&virtual_node).await.unwrap();
        assert_eq!(action, ItemAction::Dropped);
    }

    #[tokio::test]
    async fn test_own_orphan_finalizer_selects_orphan_policy() {
        let mut h = Harness::new().await;
        let missing = meta("ghost", vec![]);
        let mut item = meta("child", vec![owner_ref(&missing)]);
        item.finalizers = vec![Finalizer::OrphanDependents.to_string()];
        let item = h.create(item).await;
        h.store.clear_operations().await;

        let node = h.node(item.uid).await;
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();
        assert_eq!(
            action,
            ItemAction::Deleted {
                policy: DeletePropagationPolicy::Orphan,
                cycle_break_pending: vec![],
            }
        );
        assert_eq!(deletes(&h.ops().await), vec![DeletePropagationPolicy::Orphan]);
    }

    #[tokio::test]
    async fn test_terminating_item_gets_plain_delete() {
        let mut h = Harness::new().await;
        let mut item = meta("held", vec![]);
        item.finalizers = vec!["custom/hold".to_string()];
        let item = h.create(item).await;
        h.delete(&item, DeletePropagationPolicy::Background).await;
        h.store.clear_operations().await;

        let node = h.node(item.uid).await;
        assert!(node.read().await.is_being_deleted());
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert!(matches!(action, ItemAction::Deleted { .. }));
        let ops = h.ops().await;
        assert_eq!(count_gets(&ops), 0);
        assert_eq!(deletes(&ops), vec![DeletePropagationPolicy::Background]);
        assert!(h.store.contains(&item.identity()).await);
    }

    #[tokio::test]
    async fn test_stale_owner_references_are_reported() {
        let mut h = Harness::new().await;
        let owner = h.create(meta("folder", vec![])).await;
        let missing = meta("ghost", vec![]);
        let child = h
            .create(meta("child", vec![owner_ref(&owner), owner_ref(&missing)]))
            .await;
        h.store.clear_operations().await;

        let node = h.node(child.uid).await;
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert_eq!(
            action,
            ItemAction::RetainedWithStaleOwners {
                dangling: vec![owner_ref(&missing)],
                waiting: vec![],
            }
        );
        assert!(deletes(&h.ops().await).is_empty());
    }

    #[tokio::test]
    async fn test_waiting_owner_with_dependents_deletes_in_foreground() {
        let mut h = Harness::new().await;
        let root = h.create(meta("root", vec![])).await;
        let middle = h
            .create(meta("middle", vec![owner_ref(&root).blocking()]))
            .await;
        let leaf = h
            .create(meta("leaf", vec![owner_ref(&middle).blocking()]))
            .await;

        h.delete(&leaf, DeletePropagationPolicy::Foreground).await;
        h.delete(&root, DeletePropagationPolicy::Foreground).await;
        h.store.clear_operations().await;

        let node = h.node(middle.uid).await;
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();

        assert_eq!(
            action,
            ItemAction::Deleted {
                policy: DeletePropagationPolicy::Foreground,
                cycle_break_pending: vec![leaf.identity()],
            }
        );
        assert_eq!(deletes(&h.ops().await), vec![DeletePropagationPolicy::Foreground]);
    }

    #[tokio::test]
    async fn test_own_delete_dependents_finalizer_selects_foreground_policy() {
        let mut h = Harness::new().await;
        let missing = meta("ghost", vec![]);
        let mut item = meta("child", vec![owner_ref(&missing)]);
        item.finalizers = vec![Finalizer::DeletingDependents.to_string()];
        let item = h.create(item).await;
        h.store.clear_operations().await;

        let node = h.node(item.uid).await;
        assert!(!node.read().await.is_being_deleted());
        let action = h.gc.attempt_to_delete_item(&node).await.unwrap();
        assert_eq!(
            action,
            ItemAction::Deleted {
                policy: DeletePropagationPolicy::Foreground,
                cycle_break_pending: vec![],
            }
        );
        assert_eq!(deletes(&h.ops().await), vec![DeletePropagationPolicy::Foreground]);
    }

    #[tokio::test]
    async fn test_task_for_deleted_node_is_dropped() {
        let mut h = Harness::new().await;
        let item = h.create(meta("a", vec![])).await;
        let node = h.node(item.uid).await;
        h.delete(&item, DeletePropagationPolicy::Background).await;
        h.store.clear_operations().await;

        assert!(!node.read().await.is_observed());
        let action = h.gc.attempt_to_delete_worker(&node).await.unwrap();
        assert_eq!(action, ItemAction::Dropped);
        assert!(h.ops().await.is_empty());

        // a node that was terminating when it went away
        let mut held = meta("held", vec![]);
        held.finalizers = vec!["custom/hold".to_string()];
        let held = h.create(held).await;
        h.delete(&held, DeletePropagationPolicy::Background).await;
        let node = h.node(held.uid).await;
        assert!(node.read().await.is_being_deleted());

        let mut latest = h.store.get(&held.scopes, "files", "held").await.unwrap();
        latest.metadata.finalizers.clear();
        h.store.update(&held.scopes, latest).await.unwrap();
        h.sync().await;
        h.store.clear_operations().await;

        let action = h.gc.attempt_to_delete_worker(&node).await.unwrap();
        assert_eq!(action, ItemAction::Dropped);
        assert!(h.ops().await.is_empty());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum UpdateFault {
        Conflict,
        Removed,
        Replaced,
    }

    /// Forwards to a `MemoryStore`, except that every update runs into `fault`.
    struct FaultyStore {
        inner: Arc<MemoryStore>,
        fault: UpdateFault,
    }

    #[async_trait::async_trait]
    impl ObjectStore for FaultyStore {
        type Object = Resource;

        async fn get(
            &self,
            scopes: &[Scope],
            resource: &str,
            name: &str,
        ) -> Result<Resource, StoreError> {
            self.inner.get(scopes, resource, name).await
        }

        async fn update(&self, scopes: &[Scope], object: Resource) -> Result<Resource, StoreError> {
            if self.fault == UpdateFault::Conflict {
                return Err(StoreError::Conflict(object.identity().to_string()));
            }

            // the object goes away between the read and this write
            let mut cleared = object.clone();
            cleared.metadata.finalizers.clear();
            self.inner.update(scopes, cleared).await?;
            if self.fault == UpdateFault::Replaced {
                let reused = ObjectMeta {
                    uid: Uuid::new_v4(),
                    finalizers: Vec::new(),
                    deletion_timestamp: None,
                    ..object.metadata.clone()
                };
                self.inner.create(Resource::new(reused)).await?;
            }
            self.inner.update(scopes, object).await
        }

        async fn delete(
            &self,
            identity: &ObjectIdentity,
            policy: DeletePropagationPolicy,
        ) -> Result<(), StoreError> {
            self.inner.delete(identity, policy).await
        }
    }

    /// A folder in foreground deletion with no dependents left, seen by a
    /// collector whose store fails updates with `fault`.
    async fn finishing_owner(
        fault: UpdateFault,
    ) -> (Arc<MemoryStore>, GarbageCollector<FaultyStore>, NodeRef, ObjectMeta) {
        let inner = Arc::new(MemoryStore::new());
        let mut events = inner.subscribe().await;
        let folder = inner.create(Resource::new(meta("folder", vec![]))).await.unwrap();
        inner
            .delete(&folder.identity(), DeletePropagationPolicy::Foreground)
            .await
            .unwrap();

        let store = Arc::new(FaultyStore {
            inner: inner.clone(),
            fault,
        });
        let gc = GarbageCollector::new(store, &GcConfig::default());
        while let Ok(event) = events.try_recv() {
            gc.graph_builder().process_event(event.into()).await;
        }
        let node = gc
            .graph_builder()
            .uid_to_node_table
            .get(&folder.metadata.uid)
            .await
            .unwrap();
        assert!(node.read().await.is_deleting_dependents());
        inner.clear_operations().await;
        (inner, gc, node, folder.metadata)
    }

    #[tokio::test]
    async fn test_finalizer_removal_gives_up_after_conflicts() {
        let (inner, gc, node, folder) = finishing_owner(UpdateFault::Conflict).await;

        let err = gc.attempt_to_delete_worker(&node).await.unwrap_err();
        assert!(matches!(
            err,
            GcError::ConflictRetriesExhausted(ref id) if *id == folder.identity()
        ));
        // one read of the item, then one per attempt
        let max_steps = GcConfig::default().finalizer_retry.max_steps as usize;
        assert_eq!(count_gets(&inner.operations().await), 1 + max_steps);
        assert!(inner.contains(&folder.identity()).await);

        gc.process_attempt_to_delete(&node).await;
        assert_eq!(gc.attempt_to_delete().num_requeues(&node), 1);
    }

    #[tokio::test]
    async fn test_finalizer_removal_tolerates_removed_object() {
        let (inner, gc, node, folder) = finishing_owner(UpdateFault::Removed).await;

        let action = gc.attempt_to_delete_worker(&node).await.unwrap();
        assert_eq!(action, ItemAction::FinalizerRemoved);
        assert!(!inner.contains(&folder.identity()).await);
    }

    #[tokio::test]
    async fn test_finalizer_removal_tolerates_reused_name() {
        let (inner, gc, node, folder) = finishing_owner(UpdateFault::Replaced).await;

        let action = gc.attempt_to_delete_worker(&node).await.unwrap();
        assert_eq!(action, ItemAction::FinalizerRemoved);
        let reused = inner.get(&folder.scopes, "files", "folder").await.unwrap();
        assert_ne!(reused.metadata.uid, folder.uid);
        assert!(!reused.being_deleted());

        gc.process_attempt_to_delete(&node).await;
        assert_eq!(gc.attempt_to_delete().num_requeues(&node), 0);
    }
}
