use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One level of the hierarchical tenant key space, e.g. `tenant/acme`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub resource: String,
    pub name: String,
}

impl Scope {
    pub fn new(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.name)
    }
}

/// Coordinates of a stored object. Graph equality is by `uid`; the remaining
/// fields address the object in the store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub uid: Uuid,
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

impl ObjectIdentity {
    pub fn new(
        uid: Uuid,
        name: impl Into<String>,
        resource: impl Into<String>,
        scopes: Vec<Scope>,
    ) -> Self {
        Self {
            uid,
            name: name.into(),
            resource: resource.into(),
            scopes,
        }
    }

    /// Identity of the owner named by `owner_ref`, assumed to live in `scopes`.
    pub fn from_owner_reference(owner_ref: &OwnerReference, scopes: &[Scope]) -> Self {
        Self {
            uid: owner_ref.uid,
            name: owner_ref.name.clone(),
            resource: owner_ref.resource.clone(),
            scopes: scopes.to_vec(),
        }
    }

    /// Whether `owner_ref` points at these coordinates (scopes are not part of
    /// an owner reference and are ignored).
    pub fn matches(&self, owner_ref: &OwnerReference) -> bool {
        self.uid == owner_ref.uid
            && self.name == owner_ref.name
            && self.resource == owner_ref.resource
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for scope in &self.scopes {
            write!(f, "{scope}/")?;
        }
        write!(f, "{}/{} ({})", self.resource, self.name, self.uid)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub uid: Uuid,
    pub name: String,
    pub resource: String,
    /// The owner's foreground deletion waits for this dependent to go away.
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    pub fn new(uid: Uuid, name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            uid,
            name: name.into(),
            resource: resource.into(),
            block_owner_deletion: false,
        }
    }

    pub fn blocking(mut self) -> Self {
        self.block_owner_deletion = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finalizer {
    /// The object is in a foreground cascade and waits for blocking dependents.
    DeletingDependents,
    /// The object's dependents are detached instead of deleted.
    OrphanDependents,
}

impl Finalizer {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Finalizer::DeletingDependents => "delete-dependents",
            Finalizer::OrphanDependents => "orphan-dependents",
        }
    }
}

impl fmt::Display for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<Finalizer> for String {
    fn eq(&self, other: &Finalizer) -> bool {
        self == other.as_str()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeletePropagationPolicy {
    #[default]
    Background,
    Foreground,
    Orphan,
}

impl fmt::Display for DeletePropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeletePropagationPolicy::Background => "Background",
            DeletePropagationPolicy::Foreground => "Foreground",
            DeletePropagationPolicy::Orphan => "Orphan",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Metadata carrying only the coordinates of `identity`, used for
    /// synthesized events.
    pub fn from_identity(identity: &ObjectIdentity) -> Self {
        Self {
            uid: identity.uid,
            name: identity.name.clone(),
            resource: identity.resource.clone(),
            scopes: identity.scopes.clone(),
            ..Default::default()
        }
    }
}

/// The narrow surface of a stored object the collector needs.
pub trait Object: Clone + Send + Sync + 'static {
    fn identity(&self) -> ObjectIdentity;
    fn owner_references(&self) -> &[OwnerReference];
    fn finalizers(&self) -> &[String];
    fn deletion_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Drops `finalizer`; returns whether it was present.
    fn remove_finalizer(&mut self, finalizer: Finalizer) -> bool;

    fn has_finalizer(&self, finalizer: Finalizer) -> bool {
        self.finalizers().iter().any(|f| *f == finalizer)
    }

    fn being_deleted(&self) -> bool {
        self.deletion_timestamp().is_some()
    }
}

impl Object for ObjectMeta {
    fn identity(&self) -> ObjectIdentity {
        ObjectIdentity::new(
            self.uid,
            self.name.clone(),
            self.resource.clone(),
            self.scopes.clone(),
        )
    }

    fn owner_references(&self) -> &[OwnerReference] {
        &self.owner_references
    }

    fn finalizers(&self) -> &[String] {
        &self.finalizers
    }

    fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.deletion_timestamp
    }

    fn remove_finalizer(&mut self, finalizer: Finalizer) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| *f != finalizer);
        self.finalizers.len() != before
    }
}

/// A generic stored document: metadata plus an opaque payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Resource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_yaml::Value,
}

impl Resource {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            spec: serde_yaml::Value::Null,
        }
    }
}

impl Object for Resource {
    fn identity(&self) -> ObjectIdentity {
        self.metadata.identity()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references()
    }

    fn finalizers(&self) -> &[String] {
        self.metadata.finalizers()
    }

    fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.metadata.deletion_timestamp()
    }

    fn remove_finalizer(&mut self, finalizer: Finalizer) -> bool {
        self.metadata.remove_finalizer(finalizer)
    }
}

/// A change observed on the store's watch feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ObjectMeta),
    Modified {
        old: Option<ObjectMeta>,
        new: ObjectMeta,
    },
    Deleted(ObjectMeta),
}
