//! In-memory index: owner → objects keyed by object key.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::cache::CacheSpec;
use crate::types::{NodeId, ObjectKey, Version};
use crate::versioned::{ObjectHeader, SignedData};

/// Whether an object is known to exist anywhere besides this node.
///
/// ```text
/// Local ──publish──▶ Announced ──patch ≥ local──▶ Confirmed
///                        ▲                            │
///                        └──────── disconnect ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueState {
    /// Created here, never sent
    Local,
    /// Sent at least once since the last connectivity loss
    Announced,
    /// A peer reported holding this version or newer
    Confirmed,
}

impl UniqueState {
    pub fn is_unique(&self) -> bool {
        !matches!(self, UniqueState::Confirmed)
    }
}

/// One cached, verified object
#[derive(Debug, Clone)]
pub struct CachedObject<D> {
    pub signed: SignedData,
    pub header: ObjectHeader,
    pub unique: UniqueState,
    /// Parsed payload, dropped when the owner goes cold
    pub detail: Option<D>,
}

impl<D> CachedObject<D> {
    pub fn new(signed: SignedData, header: ObjectHeader, unique: UniqueState) -> Self {
        Self {
            signed,
            header,
            unique,
            detail: None,
        }
    }

    pub fn version(&self) -> Version {
        self.header.version
    }
}

type OwnerObjects<D> = BTreeMap<ObjectKey, CachedObject<D>>;

/// Owner map plus the service's secondary index, kept in step on every insert and removal
pub struct CacheIndex<S: CacheSpec> {
    owners: HashMap<NodeId, OwnerObjects<S::Detail>>,
    secondary: S::Index,
}

impl<S: CacheSpec> Default for CacheIndex<S> {
    fn default() -> Self {
        Self {
            owners: HashMap::new(),
            secondary: S::Index::default(),
        }
    }
}

impl<S: CacheSpec> CacheIndex<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owners held
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.owners.values().map(|o| o.len()).sum()
    }

    pub fn contains_owner(&self, owner: NodeId) -> bool {
        self.owners.contains_key(&owner)
    }

    pub fn owners(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.owners.keys().copied()
    }

    pub fn get(&self, owner: NodeId, key: &ObjectKey) -> Option<&CachedObject<S::Detail>> {
        self.owners.get(&owner)?.get(key)
    }

    pub(crate) fn get_mut(
        &mut self,
        owner: NodeId,
        key: &ObjectKey,
    ) -> Option<&mut CachedObject<S::Detail>> {
        self.owners.get_mut(&owner)?.get_mut(key)
    }

    pub fn version(&self, owner: NodeId, key: &ObjectKey) -> Option<Version> {
        self.get(owner, key).map(|o| o.version())
    }

    pub fn objects(&self, owner: NodeId) -> impl Iterator<Item = &CachedObject<S::Detail>> {
        self.owners.get(&owner).into_iter().flat_map(|o| o.values())
    }

    /// Every cached object, grouped by owner
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &CachedObject<S::Detail>)> {
        self.owners
            .iter()
            .flat_map(|(owner, objects)| objects.values().map(move |o| (*owner, o)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CachedObject<S::Detail>> {
        self.owners.values_mut().flat_map(|o| o.values_mut())
    }

    pub fn secondary(&self) -> &S::Index {
        &self.secondary
    }

    /// Insert or replace; returns the replaced object.
    pub(crate) fn insert(
        &mut self,
        object: CachedObject<S::Detail>,
    ) -> Option<CachedObject<S::Detail>> {
        let owner = object.header.owner;
        let key = object.header.key.clone();
        let objects = self.owners.entry(owner).or_default();
        let previous = objects.insert(key.clone(), object);
        if let Some(previous) = &previous {
            S::index_remove(&mut self.secondary, &previous.header);
        }
        if let Some(current) = objects.get(&key) {
            S::index_insert(&mut self.secondary, &current.header);
        }
        previous
    }

    /// Drop every object of `owner`
    pub(crate) fn remove_owner(&mut self, owner: NodeId) -> Vec<CachedObject<S::Detail>> {
        let removed: Vec<_> = self
            .owners
            .remove(&owner)
            .map(|objects| objects.into_values().collect())
            .unwrap_or_default();
        for object in &removed {
            S::index_remove(&mut self.secondary, &object.header);
        }
        removed
    }

    /// Drop parsed payloads of `owner`
    pub(crate) fn unload(&mut self, owner: NodeId) -> usize {
        let mut dropped = 0;
        if let Some(objects) = self.owners.get_mut(&owner) {
            for object in objects.values_mut() {
                if object.detail.take().is_some() {
                    dropped += 1;
                }
            }
        }
        dropped
    }
}
