use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use common::{
    DeletePropagationPolicy, Finalizer, Object, ObjectIdentity, Resource, Scope, WatchEvent,
};
use tokio::sync::{
    Mutex,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use super::store::{ObjectStore, StoreError};

type ObjectKey = (Vec<Scope>, String, String);

/// A store call, as recorded in the operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Get {
        resource: String,
        name: String,
    },
    Update {
        resource: String,
        name: String,
    },
    Delete {
        resource: String,
        name: String,
        policy: DeletePropagationPolicy,
    },
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectKey, Resource>,
    revision: u64,
    subscribers: Vec<UnboundedSender<WatchEvent>>,
    ops: Vec<StoreOp>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn emit(&mut self, event: WatchEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn modify(&mut self, key: &ObjectKey, mut object: Resource) {
        let old = self.objects.get(key).map(|o| o.metadata.clone());
        object.metadata.resource_version = self.next_revision();

        if object.being_deleted() && object.finalizers().is_empty() {
            // nothing left to wait for
            self.objects.remove(key);
            self.emit(WatchEvent::Deleted(object.metadata));
            return;
        }

        let new = object.metadata.clone();
        self.objects.insert(key.clone(), object);
        self.emit(WatchEvent::Modified { old, new });
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some(object) = self.objects.remove(key) {
            self.emit(WatchEvent::Deleted(object.metadata));
        }
    }

    /// Drops every owner reference to `owner`.
    fn orphan_dependents_of(&mut self, owner: &ObjectIdentity) {
        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(_, o)| o.owner_references().iter().any(|r| r.uid == owner.uid))
            .map(|(k, _)| k.clone())
            .collect();

        for key in dependents {
            if let Some(mut dependent) = self.objects.get(&key).cloned() {
                dependent
                    .metadata
                    .owner_references
                    .retain(|r| r.uid != owner.uid);
                log::debug!(
                    "[MemoryStore] Orphaned {} from owner {}",
                    dependent.identity(),
                    owner
                );
                self.modify(&key, dependent);
            }
        }
    }
}

/// In-process object store with the deletion semantics the garbage collector
/// expects. Every mutation is published to the watch subscribers.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key_of(scopes: &[Scope], resource: &str, name: &str) -> ObjectKey {
    (scopes.to_vec(), resource.to_string(), name.to_string())
}

fn describe(scopes: &[Scope], resource: &str, name: &str) -> String {
    let mut s = String::new();
    for scope in scopes {
        s.push_str(&format!("{scope}/"));
    }
    s.push_str(&format!("{resource}/{name}"));
    s
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a YAML list of resources.
    pub async fn from_manifest(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let resources: Vec<Resource> =
            serde_yaml::from_str(&content).context("Failed to parse manifest")?;

        let store = Self::new();
        for resource in resources {
            store.create(resource).await?;
        }
        Ok(store)
    }

    pub async fn create(&self, mut object: Resource) -> Result<Resource, StoreError> {
        let mut inner = self.inner.lock().await;
        let meta = &object.metadata;
        let key = key_of(&meta.scopes, &meta.resource, &meta.name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Other(anyhow::anyhow!(
                "object {} already exists",
                describe(&meta.scopes, &meta.resource, &meta.name)
            )));
        }

        object.metadata.resource_version = inner.next_revision();
        inner.objects.insert(key, object.clone());
        inner.emit(WatchEvent::Added(object.metadata.clone()));
        Ok(object)
    }

    pub async fn list(&self) -> Vec<Resource> {
        self.inner.lock().await.objects.values().cloned().collect()
    }

    pub async fn contains(&self, identity: &ObjectIdentity) -> bool {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&key_of(&identity.scopes, &identity.resource, &identity.name))
            .is_some_and(|o| o.metadata.uid == identity.uid)
    }

    /// Watch feed: a snapshot of every stored object as `Added`, followed by
    /// live changes.
    pub async fn subscribe(&self) -> UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        for object in inner.objects.values() {
            let _ = tx.send(WatchEvent::Added(object.metadata.clone()));
        }
        inner.subscribers.push(tx);
        rx
    }

    pub async fn operations(&self) -> Vec<StoreOp> {
        self.inner.lock().await.ops.clone()
    }

    pub async fn clear_operations(&self) {
        self.inner.lock().await.ops.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    type Object = Resource;

    async fn get(
        &self,
        scopes: &[Scope],
        resource: &str,
        name: &str,
    ) -> Result<Resource, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ops.push(StoreOp::Get {
            resource: resource.to_string(),
            name: name.to_string(),
        });
        inner
            .objects
            .get(&key_of(scopes, resource, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(scopes, resource, name)))
    }

    async fn update(&self, scopes: &[Scope], object: Resource) -> Result<Resource, StoreError> {
        let mut inner = self.inner.lock().await;
        let meta = &object.metadata;
        inner.ops.push(StoreOp::Update {
            resource: meta.resource.clone(),
            name: meta.name.clone(),
        });

        let key = key_of(scopes, &meta.resource, &meta.name);
        let what = describe(scopes, &meta.resource, &meta.name);
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        if current.metadata.uid != meta.uid
            || current.metadata.resource_version != meta.resource_version
        {
            return Err(StoreError::Conflict(what));
        }

        let written = object.clone();
        inner.modify(&key, object);
        Ok(inner.objects.get(&key).cloned().unwrap_or(written))
    }

    async fn delete(
        &self,
        identity: &ObjectIdentity,
        policy: DeletePropagationPolicy,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ops.push(StoreOp::Delete {
            resource: identity.resource.clone(),
            name: identity.name.clone(),
            policy,
        });

        let key = key_of(&identity.scopes, &identity.resource, &identity.name);
        let what = describe(&identity.scopes, &identity.resource, &identity.name);
        let Some(mut object) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(what));
        };
        if object.metadata.uid != identity.uid {
            // precondition failed: the name was reused by another object
            return Err(StoreError::NotFound(what));
        }
        if object.being_deleted() {
            return Ok(());
        }

        match policy {
            DeletePropagationPolicy::Foreground => {
                object.metadata.deletion_timestamp = Some(Utc::now());
                if !object.has_finalizer(Finalizer::DeletingDependents) {
                    object
                        .metadata
                        .finalizers
                        .push(Finalizer::DeletingDependents.to_string());
                }
                inner.modify(&key, object);
            }
            DeletePropagationPolicy::Orphan | DeletePropagationPolicy::Background => {
                if policy == DeletePropagationPolicy::Orphan {
                    inner.orphan_dependents_of(identity);
                    object.remove_finalizer(Finalizer::OrphanDependents);
                }
                if object.finalizers().is_empty() {
                    inner.remove(&key);
                } else {
                    object.metadata.deletion_timestamp = Some(Utc::now());
                    inner.modify(&key, object);
                }
            }
        }
        Ok(())
    }
}
