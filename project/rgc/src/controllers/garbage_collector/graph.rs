use std::{collections::HashMap, sync::Arc};

use common::{ObjectIdentity, OwnerReference};
use tokio::sync::RwLock;
use uuid::Uuid;

pub type NodeRef = Arc<RwLock<Node>>;

/// A vertex of the dependency graph.
///
/// Only the graph builder writes nodes; workers read them.
#[derive(Debug, Clone)]
pub struct Node {
    identity: ObjectIdentity,
    dependents: Vec<NodeRef>,
    // owner references from the latest observation
    owners: Vec<OwnerReference>,
    observed: bool,
    deleting_dependents: bool,
    being_deleted: bool,
}

impl Node {
    pub fn new(identity: ObjectIdentity, observed: bool) -> Self {
        Self {
            identity,
            dependents: Vec::new(),
            owners: Vec::new(),
            observed,
            deleting_dependents: false,
            being_deleted: false,
        }
    }

    /// Node created only because a dependent referenced `identity`.
    pub fn new_virtual(identity: ObjectIdentity) -> Self {
        Self::new(identity, false)
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    /// The object is gone from the store.
    pub fn mark_absent(&mut self) {
        self.observed = false;
    }

    pub fn is_being_deleted(&self) -> bool {
        self.being_deleted
    }

    pub fn set_being_deleted(&mut self, being_deleted: bool) {
        self.being_deleted = being_deleted;
    }

    pub fn is_deleting_dependents(&self) -> bool {
        self.deleting_dependents
    }

    pub fn set_deleting_dependents(&mut self, deleting_dependents: bool) {
        self.deleting_dependents = deleting_dependents;
    }

    pub fn add_dependent(&mut self, node: NodeRef) {
        if !self.dependents.iter().any(|n| Arc::ptr_eq(n, &node)) {
            self.dependents.push(node);
        }
    }

    pub fn remove_dependent(&mut self, node: &NodeRef) {
        self.dependents.retain(|n| !Arc::ptr_eq(n, node));
    }

    pub fn dependents(&self) -> &[NodeRef] {
        &self.dependents
    }

    pub fn set_dependents(&mut self, dependents: Vec<NodeRef>) {
        self.dependents = dependents;
    }

    pub fn dependents_length(&self) -> usize {
        self.dependents.len()
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: ObjectIdentity) {
        self.identity = identity;
    }

    pub fn owners(&self) -> &[OwnerReference] {
        &self.owners
    }

    pub fn set_owners(&mut self, owners: Vec<OwnerReference>) {
        self.owners = owners;
    }
}

/// Dependents of `node` whose edge to it is `BlockOwnerDeletion=true`.
///
/// Dependents are read one at a time after the owner's guard is released.
pub async fn blocking_dependents(node: &NodeRef) -> Vec<NodeRef> {
    let (uid, dependents) = {
        let guard = node.read().await;
        (guard.identity().uid, guard.dependents().to_vec())
    };

    let mut result = Vec::new();
    for dependent in dependents {
        let blocks = dependent
            .read()
            .await
            .owners()
            .iter()
            .any(|owner| owner.uid == uid && owner.block_owner_deletion);
        if blocks {
            result.push(dependent);
        }
    }
    result
}

/// The authoritative map from UID to node, shared by the graph builder and
/// the workers.
#[derive(Debug, Default)]
pub struct UidToNodeTable {
    table: RwLock<HashMap<Uuid, NodeRef>>,
}

impl UidToNodeTable {
    pub async fn insert(&self, uid: Uuid, node: NodeRef) {
        self.table.write().await.insert(uid, node);
    }

    pub async fn get(&self, uid: &Uuid) -> Option<NodeRef> {
        self.table.read().await.get(uid).cloned()
    }

    pub async fn remove(&self, uid: &Uuid) -> Option<NodeRef> {
        self.table.write().await.remove(uid)
    }

    pub async fn contains_key(&self, uid: &Uuid) -> bool {
        self.table.read().await.contains_key(uid)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }
}
