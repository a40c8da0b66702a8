//! Entity liveness and state lookup.
//!
//! Every subsystem keeps plain `Entity` handles and never trusts them blindly:
//! before reading an entity it asks an [`ActorView`]. A despawned entity, or one
//! whose [`Health`] is depleted, has no state and is treated as absent.

use std::collections::HashMap;

use bevy_ecs::prelude::*;
use glam::Vec3;

use crate::components::{Faction, Health, Position};
use crate::systems::steering::SteeringAgent;

/// Per-tick state of a living entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub faction: Faction,
}

impl ActorState {
    pub fn at(position: Vec3, faction: Faction) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            faction,
        }
    }
}

/// Read access to living entities.
pub trait ActorView {
    /// State of `entity`, or `None` if it no longer exists or is dead.
    fn actor(&self, entity: Entity) -> Option<ActorState>;

    fn is_alive(&self, entity: Entity) -> bool {
        self.actor(entity).is_some()
    }

    fn position(&self, entity: Entity) -> Option<Vec3> {
        self.actor(entity).map(|a| a.position)
    }

    fn velocity(&self, entity: Entity) -> Option<Vec3> {
        self.actor(entity).map(|a| a.velocity)
    }

    fn faction(&self, entity: Entity) -> Option<Faction> {
        self.actor(entity).map(|a| a.faction)
    }
}

/// Snapshot of every living entity, rebuilt at the start of each fixed update.
///
/// Subsystems and steering read from the snapshot, so every agent in a tick
/// observes the same pre-tick state regardless of iteration order.
#[derive(Resource, Debug, Clone, Default)]
pub struct ActorSnapshot {
    actors: HashMap<Entity, ActorState>,
}

impl ActorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity, state: ActorState) {
        self.actors.insert(entity, state);
    }

    pub fn remove(&mut self, entity: Entity) -> Option<ActorState> {
        self.actors.remove(&entity)
    }

    /// Move a living entity. No-op for unknown entities.
    pub fn set_position(&mut self, entity: Entity, position: Vec3) {
        if let Some(state) = self.actors.get_mut(&entity) {
            state.position = position;
        }
    }

    pub fn clear(&mut self) {
        self.actors.clear();
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Entity, &ActorState)> {
        self.actors.iter()
    }
}

impl ActorView for ActorSnapshot {
    fn actor(&self, entity: Entity) -> Option<ActorState> {
        self.actors.get(&entity).copied()
    }
}

impl ActorView for World {
    fn actor(&self, entity: Entity) -> Option<ActorState> {
        let position = self.get::<Position>(entity)?.0;
        if let Some(health) = self.get::<Health>(entity) {
            if !health.is_alive() {
                return None;
            }
        }
        Some(ActorState {
            position,
            velocity: self
                .get::<SteeringAgent>(entity)
                .map(|s| s.velocity())
                .unwrap_or(Vec3::ZERO),
            faction: self.get::<Faction>(entity).copied().unwrap_or_default(),
        })
    }
}

/// System that rebuilds the actor snapshot from the ECS world.
pub fn actor_snapshot_system(
    mut snapshot: ResMut<ActorSnapshot>,
    query: Query<(
        Entity,
        &Position,
        Option<&Health>,
        Option<&Faction>,
        Option<&SteeringAgent>,
    )>,
) {
    snapshot.clear();

    for (entity, pos, health, faction, steering) in query.iter() {
        if health.is_some_and(|h| !h.is_alive()) {
            continue;
        }
        snapshot.insert(
            entity,
            ActorState {
                position: pos.0,
                velocity: steering.map(|s| s.velocity()).unwrap_or(Vec3::ZERO),
                faction: faction.copied().unwrap_or_default(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_skips_dead_entities() {
        let mut world = World::new();
        world.insert_resource(ActorSnapshot::new());

        let alive = world
            .spawn((Position::flat(10.0, 0.0), Health::new(10.0), Faction::Enemy))
            .id();
        let mut dead_health = Health::new(10.0);
        dead_health.kill();
        let dead = world.spawn((Position::flat(20.0, 0.0), dead_health)).id();

        let mut schedule = Schedule::default();
        schedule.add_systems(actor_snapshot_system);
        schedule.run(&mut world);

        let snapshot = world.resource::<ActorSnapshot>();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.faction(alive), Some(Faction::Enemy));
        assert!(!snapshot.is_alive(dead));
    }

    #[test]
    fn test_world_view_treats_despawned_as_absent() {
        let mut world = World::new();
        let e = world.spawn(Position::flat(1.0, 2.0)).id();
        assert_eq!(world.position(e), Some(Vec3::new(1.0, 2.0, 0.0)));
        assert_eq!(world.faction(e), Some(Faction::Neutral));

        world.despawn(e);
        assert!(!world.is_alive(e));
    }
}
