use std::sync::Arc;

use common::{Finalizer, Object, ObjectIdentity, ObjectMeta, OwnerReference, WatchEvent};
use tokio::sync::{
    Mutex, RwLock,
    mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;

use super::{
    cache::{ReferenceCache, ReferenceKey},
    graph::{Node, NodeRef, UidToNodeTable},
    queue::WorkQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphChangeEventKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub kind: GraphChangeEventKind,
    pub new: ObjectMeta,
    pub old: Option<ObjectMeta>,
    /// Synthesized by the collector after the store reported the object gone.
    pub is_virtual: bool,
}

impl GraphEvent {
    pub fn new_add(new: ObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Add,
            new,
            old: None,
            is_virtual: false,
        }
    }

    pub fn new_update(old: Option<ObjectMeta>, new: ObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Update,
            new,
            old,
            is_virtual: false,
        }
    }

    pub fn new_delete(meta: ObjectMeta) -> Self {
        Self {
            kind: GraphChangeEventKind::Delete,
            new: meta,
            old: None,
            is_virtual: false,
        }
    }

    pub fn new_virtual_delete(identity: &ObjectIdentity) -> Self {
        Self {
            kind: GraphChangeEventKind::Delete,
            new: ObjectMeta::from_identity(identity),
            old: None,
            is_virtual: true,
        }
    }
}

impl From<WatchEvent> for GraphEvent {
    fn from(event: WatchEvent) -> Self {
        match event {
            WatchEvent::Added(meta) => GraphEvent::new_add(meta),
            WatchEvent::Modified { old, new } => GraphEvent::new_update(old, new),
            WatchEvent::Deleted(meta) => GraphEvent::new_delete(meta),
        }
    }
}

/// Keeps the dependency graph in step with the store from the watch feed and
/// decides which nodes need a deletion attempt.
pub struct GraphBuilder {
    pub uid_to_node_table: Arc<UidToNodeTable>,
    pub absent_owner_cache: Arc<ReferenceCache>,
    attempt_to_delete: Arc<WorkQueue>,
    graph_change_event_tx: UnboundedSender<GraphEvent>,
    graph_change_event_rx: Mutex<UnboundedReceiver<GraphEvent>>,
}

impl GraphBuilder {
    pub fn new(attempt_to_delete: Arc<WorkQueue>, absent_owner_cache: Arc<ReferenceCache>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            uid_to_node_table: Arc::new(UidToNodeTable::default()),
            absent_owner_cache,
            attempt_to_delete,
            graph_change_event_tx: tx,
            graph_change_event_rx: Mutex::new(rx),
        }
    }

    pub fn attempt_to_delete(&self) -> &Arc<WorkQueue> {
        &self.attempt_to_delete
    }

    /// Asks the graph to drop `identity`, which the store no longer has. The
    /// event is applied by the graph loop, never by the caller.
    pub fn enqueue_virtual_delete_event(&self, identity: &ObjectIdentity) {
        if self
            .graph_change_event_tx
            .send(GraphEvent::new_virtual_delete(identity))
            .is_err()
        {
            log::debug!(
                "[GraphBuilder] Graph loop stopped, dropping virtual delete for {identity}"
            );
        }
    }

    /// Consumes the watch feed and synthesized events until `token` is
    /// cancelled. A closed watch feed is an error.
    pub async fn run(
        &self,
        mut watch: UnboundedReceiver<WatchEvent>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut graph_changes = self.graph_change_event_rx.lock().await;
        log::debug!("[GraphBuilder] Starting graph change processing");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = graph_changes.recv() => self.process_event(event).await,
                event = watch.recv() => match event {
                    Some(event) => self.process_event(event.into()).await,
                    None => anyhow::bail!("[GraphBuilder] watch feed closed"),
                },
            }
        }

        log::debug!("[GraphBuilder] Graph change processing stopped");
        Ok(())
    }

    /// Applies synthesized events that are already pending. Returns how many
    /// were processed. Only effective while the graph loop is not running.
    pub async fn process_pending_events(&self) -> usize {
        let Ok(mut graph_changes) = self.graph_change_event_rx.try_lock() else {
            return 0;
        };
        let mut processed = 0;
        while let Ok(event) = graph_changes.try_recv() {
            self.process_event(event).await;
            processed += 1;
        }
        processed
    }

    /// Applies a single graph change.
    pub async fn process_event(&self, event: GraphEvent) {
        let uid = event.new.uid;
        let existing = self.uid_to_node_table.get(&uid).await;

        match event.kind {
            GraphChangeEventKind::Add | GraphChangeEventKind::Update => {
                let existing_observed = match &existing {
                    Some(node) => Some(node.read().await.is_observed()),
                    None => None,
                };
                match (existing, existing_observed) {
                    (Some(node), Some(true)) => {
                        self.update_node(&node, event.old.as_ref(), &event.new)
                            .await;
                    }
                    (Some(virtual_node), _) => {
                        let dependents = self
                            .reconcile_virtual_identity(&virtual_node, &event.new)
                            .await;
                        self.insert_node(&event.new, dependents).await;
                    }
                    (None, _) => {
                        self.insert_node(&event.new, Vec::new()).await;
                    }
                }
            }
            GraphChangeEventKind::Delete => {
                let Some(node) = existing else {
                    log::debug!("[GraphBuilder] Delete event for unknown node with UID: {uid}");
                    return;
                };
                if event.is_virtual && !self.virtual_delete_removes(&node, &event.new).await {
                    return;
                }
                self.remove_node(&node, &event.new).await;
            }
        }
    }

    /// Called when a virtual node is observed for real. Returns its dependents
    /// so the observed node can take them over.
    async fn reconcile_virtual_identity(
        &self,
        virtual_node: &NodeRef,
        meta: &ObjectMeta,
    ) -> Vec<NodeRef> {
        let observed_identity = meta.identity();
        let (virtual_identity, dependents) = {
            let guard = virtual_node.read().await;
            (guard.identity().clone(), guard.dependents().to_vec())
        };

        if observed_identity != virtual_identity {
            // dependents that named this UID under other coordinates must be
            // re-evaluated
            let (_, unmatched) =
                partition_dependents_by_identity(&dependents, &observed_identity).await;
            for dependent in unmatched {
                let dependent_identity = dependent.read().await.identity().clone();
                if dependent_identity.scopes != observed_identity.scopes {
                    log::info!(
                        "[GraphBuilder] Item references an owner in another scope. Item: {dependent_identity}, Owner: {observed_identity}"
                    );
                }
                self.attempt_to_delete.add(dependent);
            }
        }

        log::info!(
            "[GraphBuilder] Replacing virtual item with observed item. Virtual: {virtual_identity}, Observed: {observed_identity}"
        );
        dependents
    }

    async fn insert_node(&self, meta: &ObjectMeta, dependents: Vec<NodeRef>) {
        let being_deleted = meta.being_deleted();
        let deleting_dependents =
            being_deleted && meta.has_finalizer(Finalizer::DeletingDependents);

        let mut node = Node::new(meta.identity(), true);
        node.set_dependents(dependents);
        node.set_owners(meta.owner_references.clone());
        node.set_being_deleted(being_deleted);
        node.set_deleting_dependents(deleting_dependents);
        let node = Arc::new(RwLock::new(node));

        self.uid_to_node_table.insert(meta.uid, node.clone()).await;
        self.add_dependent_to_owners(&node, &meta.owner_references).await;

        if being_deleted || !meta.owner_references.is_empty() {
            self.attempt_to_delete.add(node.clone());
        }
        if deleting_dependents {
            self.enqueue_foreground_cascade(&node).await;
        }
    }

    async fn update_node(&self, node: &NodeRef, old: Option<&ObjectMeta>, meta: &ObjectMeta) {
        let old_owners = node.read().await.owners().to_vec();
        let (added, removed, changed) =
            get_reference_difference(&old_owners, &meta.owner_references);
        let owners_changed = !added.is_empty() || !removed.is_empty() || !changed.is_empty();

        if owners_changed {
            // owners blocked by this dependent may now be able to finish their
            // foreground deletion
            let mut unblocked: Vec<&OwnerReference> = removed
                .iter()
                .filter(|owner| owner.block_owner_deletion)
                .collect();
            unblocked.extend(
                changed
                    .iter()
                    .filter(|(old, new)| old.block_owner_deletion && !new.block_owner_deletion)
                    .map(|(_, new)| new),
            );
            for owner in unblocked {
                self.enqueue_if_deleting_dependents(owner).await;
            }

            node.write().await.set_owners(meta.owner_references.clone());
            self.add_dependent_to_owners(node, &added).await;
            self.remove_dependent_from_owners(node, &removed).await;
        }

        let being_deleted = meta.being_deleted();
        let deleting_dependents =
            being_deleted && meta.has_finalizer(Finalizer::DeletingDependents);
        let (was_being_deleted, was_deleting_dependents) = {
            let mut guard = node.write().await;
            let was = (guard.is_being_deleted(), guard.is_deleting_dependents());
            guard.set_being_deleted(being_deleted);
            guard.set_deleting_dependents(deleting_dependents);
            was
        };
        let finalizers_changed = old.is_some_and(|old| old.finalizers != meta.finalizers);

        // an object left with no owners at all has been detached on purpose
        if (being_deleted && (!was_being_deleted || finalizers_changed))
            || (owners_changed && !meta.owner_references.is_empty())
        {
            self.attempt_to_delete.add(node.clone());
        }
        if deleting_dependents && !was_deleting_dependents {
            self.enqueue_foreground_cascade(node).await;
        }
    }

    /// Decides whether a virtual delete really removes `node`. The node stays
    /// when the store still has the UID under other coordinates.
    async fn virtual_delete_removes(&self, node: &NodeRef, meta: &ObjectMeta) -> bool {
        let deleted_identity = meta.identity();
        let (observed, identity, dependents) = {
            let guard = node.read().await;
            (
                guard.is_observed(),
                guard.identity().clone(),
                guard.dependents().to_vec(),
            )
        };

        if observed {
            if identity == deleted_identity {
                return true;
            }
            // the observed object lives at other coordinates; only the
            // dependents pointing at the absent coordinates are affected
            let (matching, _) =
                partition_dependents_by_identity(&dependents, &deleted_identity).await;
            if !matching.is_empty() {
                self.absent_owner_cache
                    .mark_absent(ReferenceKey::from(&deleted_identity))
                    .await;
                for dependent in matching {
                    self.attempt_to_delete.add(dependent);
                }
            }
            return false;
        }

        let (matching, unmatching) =
            partition_dependents_by_identity(&dependents, &deleted_identity).await;
        if unmatching.is_empty() {
            return true;
        }

        // other dependents still reference the UID under other coordinates
        if !matching.is_empty() {
            self.absent_owner_cache
                .mark_absent(ReferenceKey::from(&deleted_identity))
                .await;
            for dependent in matching {
                self.attempt_to_delete.add(dependent);
            }
        }

        if identity == deleted_identity {
            let alternative = {
                let guard = unmatching[0].read().await;
                guard
                    .owners()
                    .iter()
                    .find(|owner| owner.uid == deleted_identity.uid)
                    .map(|owner| {
                        ObjectIdentity::from_owner_reference(owner, &guard.identity().scopes)
                    })
            };
            if let Some(alternative) = alternative {
                log::debug!(
                    "[GraphBuilder] Virtual item {identity} confirmed absent, re-checking it as {alternative}"
                );
                node.write().await.set_identity(alternative);
                self.attempt_to_delete.add(node.clone());
            }
        }
        false
    }

    async fn remove_node(&self, node: &NodeRef, meta: &ObjectMeta) {
        let (owners, dependents) = {
            let guard = node.read().await;
            (guard.owners().to_vec(), guard.dependents().to_vec())
        };

        node.write().await.mark_absent();
        self.uid_to_node_table.remove(&meta.uid).await;
        self.remove_dependent_from_owners(node, &owners).await;

        if !dependents.is_empty() {
            let identity = node.read().await.identity().clone();
            self.absent_owner_cache
                .mark_absent(ReferenceKey::from(&identity))
                .await;
        }
        for dependent in dependents {
            self.attempt_to_delete.add(dependent);
        }

        // owners waiting on this dependent may be able to finish now
        for owner in owners.iter().filter(|owner| owner.block_owner_deletion) {
            self.enqueue_if_deleting_dependents(owner).await;
        }
    }

    async fn enqueue_if_deleting_dependents(&self, owner: &OwnerReference) {
        if let Some(owner_node) = self.uid_to_node_table.get(&owner.uid).await
            && owner_node.read().await.is_deleting_dependents()
        {
            self.attempt_to_delete.add(owner_node);
        }
    }

    /// A node entering foreground deletion: evaluate it and every dependent.
    async fn enqueue_foreground_cascade(&self, node: &NodeRef) {
        let dependents = node.read().await.dependents().to_vec();
        for dependent in dependents {
            self.attempt_to_delete.add(dependent);
        }
        self.attempt_to_delete.add(node.clone());
    }

    /// Adds `node` to the back-index of each owner, creating virtual owners
    /// for UIDs the graph has not seen yet.
    pub async fn add_dependent_to_owners(&self, node: &NodeRef, owners: &[OwnerReference]) {
        let scopes = node.read().await.identity().scopes.clone();
        for owner in owners {
            let owner_node = match self.uid_to_node_table.get(&owner.uid).await {
                Some(n) => n,
                None => {
                    let identity = ObjectIdentity::from_owner_reference(owner, &scopes);
                    log::debug!("[GraphBuilder] Adding virtual owner {identity}");
                    let virtual_node = Arc::new(RwLock::new(Node::new_virtual(identity)));
                    self.uid_to_node_table
                        .insert(owner.uid, virtual_node.clone())
                        .await;
                    self.attempt_to_delete.add(virtual_node.clone());
                    virtual_node
                }
            };
            owner_node.write().await.add_dependent(node.clone());
        }
    }

    pub async fn remove_dependent_from_owners(&self, node: &NodeRef, owners: &[OwnerReference]) {
        for owner in owners {
            if let Some(owner_node) = self.uid_to_node_table.get(&owner.uid).await {
                owner_node.write().await.remove_dependent(node);
            }
        }
    }
}

/// Get the difference between old and new owner references.
/// Returns a tuple of (added_owners, removed_owners, changed_owners).
pub fn get_reference_difference(
    old_owners: &[OwnerReference],
    new_owners: &[OwnerReference],
) -> (
    Vec<OwnerReference>,
    Vec<OwnerReference>,
    Vec<(OwnerReference, OwnerReference)>,
) {
    let mut added_owners = Vec::new();
    let mut removed_owners = Vec::new();
    let mut changed_owners = Vec::new();

    for new_owner in new_owners {
        match old_owners.iter().find(|o| o.uid == new_owner.uid) {
            None => added_owners.push(new_owner.clone()),
            Some(old_owner) if old_owner != new_owner => {
                changed_owners.push((old_owner.clone(), new_owner.clone()));
            }
            Some(_) => {}
        }
    }

    for old_owner in old_owners {
        if !new_owners.iter().any(|o| o.uid == old_owner.uid) {
            removed_owners.push(old_owner.clone());
        }
    }

    (added_owners, removed_owners, changed_owners)
}

/// Partition dependents into those whose owner reference matches `identity`
/// exactly and the rest.
async fn partition_dependents_by_identity(
    dependents: &[NodeRef],
    identity: &ObjectIdentity,
) -> (Vec<NodeRef>, Vec<NodeRef>) {
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();

    for dependent in dependents {
        let has_matching_owner = dependent
            .read()
            .await
            .owners()
            .iter()
            .any(|owner| identity.matches(owner));
        if has_matching_owner {
            matched.push(dependent.clone());
        } else {
            unmatched.push(dependent.clone());
        }
    }
    (matched, unmatched)
}
