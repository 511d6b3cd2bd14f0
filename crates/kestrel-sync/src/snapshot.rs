//! Snapshot builder and applier: the boundary between live ECS state and the
//! tick-stamped [`WorldSnapshot`] that travels over the wire and fills the
//! client's snapshot history.
//!
//! Which components are networked is declared once per game in a
//! [`SnapshotSchema`]. Entities are matched by [`NetworkId`] through an
//! [`EntityMap`], never by local [`Entity`] handles, so an entity destroyed
//! and recreated between ticks is still the same networked entity.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bevy_ecs::prelude::*;
use kestrel_net::{EntityState, SessionId, WorldSnapshot};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Stable, externally visible identifier of a networked entity.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session that controls this entity. Removed with the session.
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub SessionId);

// ---------------------------------------------------------------------------
// EntityMap
// ---------------------------------------------------------------------------

/// `NetworkId` → local [`Entity`] table maintained alongside the world.
///
/// Iteration is ordered by id, which is the order entities appear in every
/// snapshot.
#[derive(Debug)]
pub struct EntityMap {
    entities: BTreeMap<NetworkId, Entity>,
    next_id: u64,
}

impl EntityMap {
    /// Creates an empty map. Allocation starts at id 1.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Spawns a new networked entity with a freshly allocated id.
    pub fn spawn(&mut self, world: &mut World, owner: Option<SessionId>) -> (NetworkId, Entity) {
        let id = NetworkId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        let entity = match owner {
            Some(session) => world.spawn((id, Owner(session))).id(),
            None => world.spawn(id).id(),
        };
        self.entities.insert(id, entity);
        (id, entity)
    }

    /// Registers an existing entity under `id`.
    pub fn insert(&mut self, id: NetworkId, entity: Entity) {
        self.next_id = self.next_id.max(id.0 + 1);
        self.entities.insert(id, entity);
    }

    /// Local entity for `id`, if mapped.
    pub fn get(&self, id: NetworkId) -> Option<Entity> {
        self.entities.get(&id).copied()
    }

    /// Local entity for `id`, if mapped and still alive in `world`.
    pub fn live(&self, world: &World, id: NetworkId) -> Option<Entity> {
        self.get(id).filter(|&entity| world.get_entity(entity).is_ok())
    }

    /// Unmaps `id`.
    pub fn remove(&mut self, id: NetworkId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Unmaps and despawns `id`. Returns `true` if an entity was despawned.
    pub fn despawn(&mut self, world: &mut World, id: NetworkId) -> bool {
        self.remove(id)
            .is_some_and(|entity| world.get_entity(entity).is_ok() && world.despawn(entity))
    }

    /// Mapped entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = (NetworkId, Entity)> + '_ {
        self.entities.iter().map(|(&id, &entity)| (id, entity))
    }

    /// Ids of live entities owned by `session`.
    pub fn owned_by(&self, world: &World, session: &SessionId) -> Vec<NetworkId> {
        self.iter()
            .filter(|&(_, entity)| world.get::<Owner>(entity).is_some_and(|o| &o.0 == session))
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of mapped entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns `true` if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityMap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SnapshotSchema
// ---------------------------------------------------------------------------

/// Type-erased accessors for one networked component type.
pub struct ComponentDescriptor {
    /// Rust [`TypeId`] of the component.
    pub type_id: TypeId,
    /// Stable tag used in snapshots.
    pub tag: &'static str,
    /// Serialize the component from `entity`, `None` if absent.
    pub serializer: fn(&World, Entity) -> Option<Vec<u8>>,
    /// Decode and insert (or overwrite) the component on `entity`. Returns
    /// `false` if the bytes do not decode.
    pub deserializer: fn(&mut World, Entity, &[u8]) -> bool,
    /// Remove the component from `entity`.
    pub remover: fn(&mut World, Entity),
}

/// The declared set of networked components for one game.
#[derive(Default)]
pub struct SnapshotSchema {
    descriptors: Vec<ComponentDescriptor>,
}

/// Counters describing what [`SnapshotSchema::apply`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Entities created because no local entity had their id.
    pub spawned: usize,
    /// Existing entities whose networked components were overwritten.
    pub updated: usize,
    /// Networked entities absent from the snapshot that were despawned.
    pub despawned: usize,
    /// Components whose bytes failed to decode and were skipped.
    pub rejected: usize,
}

impl SnapshotSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `T` as networked under `tag`. Order of registration is the
    /// order components appear in each entity's snapshot entry.
    pub fn register<T>(&mut self, tag: &'static str) -> Result<&mut Self, SyncError>
    where
        T: Component + Serialize + DeserializeOwned,
    {
        if self.descriptors.iter().any(|d| d.tag == tag) {
            return Err(SyncError::DuplicateComponentTag(tag));
        }
        if self.descriptors.iter().any(|d| d.type_id == TypeId::of::<T>()) {
            return Err(SyncError::DuplicateComponentType(tag));
        }
        self.descriptors.push(ComponentDescriptor {
            type_id: TypeId::of::<T>(),
            tag,
            serializer: |world, entity| {
                world
                    .get::<T>(entity)
                    .and_then(|c| postcard::to_allocvec(c).ok())
            },
            deserializer: |world, entity, bytes| match postcard::from_bytes::<T>(bytes) {
                Ok(value) => {
                    if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                        entity_mut.insert(value);
                    }
                    true
                }
                Err(_) => false,
            },
            remover: |world, entity| {
                if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                    entity_mut.remove::<T>();
                }
            },
        });
        Ok(self)
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> &[ComponentDescriptor] {
        &self.descriptors
    }

    /// Captures every live mapped entity, ordered by network id.
    pub fn take(&self, world: &World, entities: &EntityMap, tick: u64) -> WorldSnapshot {
        let entities = entities
            .iter()
            .filter(|&(_, entity)| world.get_entity(entity).is_ok())
            .map(|(id, entity)| EntityState {
                network_id: id.0,
                owner: world.get::<Owner>(entity).map(|o| o.0.clone()),
                components: self
                    .descriptors
                    .iter()
                    .filter_map(|d| (d.serializer)(world, entity).map(|b| (d.tag.to_string(), b)))
                    .collect(),
            })
            .collect();
        WorldSnapshot { tick, entities }
    }

    /// Writes `snapshot` onto the live world.
    ///
    /// Each entity is found by network id or created. Only networked state is
    /// touched: registered components are overwritten (or removed when the
    /// snapshot lacks them) and the owner is updated; every other component
    /// survives. Mapped entities missing from the snapshot are despawned.
    pub fn apply(
        &self,
        world: &mut World,
        entities: &mut EntityMap,
        snapshot: &WorldSnapshot,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        let present: BTreeSet<NetworkId> = snapshot
            .entities
            .iter()
            .map(|e| NetworkId(e.network_id))
            .collect();
        let stale: Vec<NetworkId> = entities
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !present.contains(id))
            .collect();
        for id in stale {
            if entities.despawn(world, id) {
                report.despawned += 1;
            }
        }

        for state in &snapshot.entities {
            let id = NetworkId(state.network_id);
            let entity = match entities.live(world, id) {
                Some(entity) => {
                    report.updated += 1;
                    entity
                }
                None => {
                    let entity = world.spawn(id).id();
                    entities.insert(id, entity);
                    report.spawned += 1;
                    entity
                }
            };

            match &state.owner {
                Some(session) => {
                    if world.get::<Owner>(entity).is_none_or(|o| &o.0 != session)
                        && let Ok(mut entity_mut) = world.get_entity_mut(entity)
                    {
                        entity_mut.insert(Owner(session.clone()));
                    }
                }
                None => {
                    if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                        entity_mut.remove::<Owner>();
                    }
                }
            }

            for descriptor in &self.descriptors {
                match state.component(descriptor.tag) {
                    Some(bytes) => {
                        if !(descriptor.deserializer)(world, entity, bytes) {
                            report.rejected += 1;
                            tracing::debug!(
                                "Skipping undecodable {} on {id} at tick {}",
                                descriptor.tag,
                                snapshot.tick
                            );
                        }
                    }
                    None => (descriptor.remover)(world, entity),
                }
            }
        }

        report
    }
}

/// Decodes the component stored under `tag` in an entity entry.
pub fn read_component<T: DeserializeOwned>(state: &EntityState, tag: &str) -> Option<T> {
    state
        .component(tag)
        .and_then(|bytes| postcard::from_bytes(bytes).ok())
}

/// Encodes `value` under `tag` in an entity entry, replacing an existing
/// entry or appending a new one.
pub fn write_component<T: Serialize>(
    state: &mut EntityState,
    tag: &str,
    value: &T,
) -> Result<(), SyncError> {
    let bytes = postcard::to_allocvec(value)?;
    match state.components.iter_mut().find(|(t, _)| t == tag) {
        Some((_, existing)) => *existing = bytes,
        None => state.components.push((tag.to_string(), bytes)),
    }
    Ok(())
}
