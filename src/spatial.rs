//! Spatial hashing for efficient neighbor queries.
//!
//! Entities are bucketed by a hashed integer cell coordinate. Insert, remove and
//! relocate are O(1); a radius query only visits the buckets covering the
//! query sphere instead of scanning every entity.

use std::collections::{HashMap, HashSet};

use bevy_ecs::prelude::*;
use glam::{IVec3, Vec3};
use tracing::debug;

use crate::actors::ActorView;

/// Smallest accepted cell size in world units.
pub const MIN_CELL_SIZE: f32 = 10.0;

const PRIME_X: i32 = 73_856_093;
const PRIME_Y: i32 = 19_349_663;
const PRIME_Z: i32 = 83_492_791;

/// Hash grid of entity handles.
///
/// Buckets are keyed by `hash(cell)`; distinct cells may collide into one
/// bucket, which queries tolerate by always checking the true distance.
/// The grid does not own entity lifetime: positions and liveness come from the
/// [`ActorView`] handed to each call.
#[derive(Debug, Clone)]
pub struct SpatialHashGrid {
    cell_size: f32,
    buckets: HashMap<i32, Vec<Entity>>,
    entity_keys: HashMap<Entity, i32>,
}

impl Default for SpatialHashGrid {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl SpatialHashGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: cell_size.max(MIN_CELL_SIZE),
            buckets: HashMap::new(),
            entity_keys: HashMap::new(),
        }
    }

    /// Reset the grid with a new cell size.
    pub fn initialize(&mut self, cell_size: f32) {
        self.cell_size = cell_size.max(MIN_CELL_SIZE);
        self.clear();
        debug!(cell_size = self.cell_size, "spatial hash grid initialized");
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entity_keys.clear();
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Integer cell coordinate containing `location`.
    #[inline]
    pub fn cell_coord(&self, location: Vec3) -> IVec3 {
        (location / self.cell_size).floor().as_ivec3()
    }

    /// Bucket key for a cell coordinate.
    #[inline]
    pub fn coord_to_key(coord: IVec3) -> i32 {
        coord.x.wrapping_mul(PRIME_X) ^ coord.y.wrapping_mul(PRIME_Y) ^ coord.z.wrapping_mul(PRIME_Z)
    }

    #[inline]
    pub fn cell_key(&self, location: Vec3) -> i32 {
        Self::coord_to_key(self.cell_coord(location))
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entity_keys.contains_key(&entity)
    }

    /// Bucket key an entity was last filed under.
    pub fn key_of(&self, entity: Entity) -> Option<i32> {
        self.entity_keys.get(&entity).copied()
    }

    /// Entities filed under the bucket for `coord`.
    pub fn bucket(&self, coord: IVec3) -> &[Entity] {
        self.buckets
            .get(&Self::coord_to_key(coord))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entity_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_keys.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entity_keys.keys().copied()
    }

    /// Register an entity at its current position.
    ///
    /// No-op if it is already registered or not alive.
    pub fn add_actor(&mut self, entity: Entity, actors: &impl ActorView) {
        if self.entity_keys.contains_key(&entity) {
            return;
        }
        let Some(position) = actors.position(entity) else {
            return;
        };

        let key = self.cell_key(position);
        self.buckets.entry(key).or_default().push(entity);
        self.entity_keys.insert(entity, key);
    }

    pub fn remove_actor(&mut self, entity: Entity) {
        let Some(key) = self.entity_keys.remove(&entity) else {
            return;
        };
        self.detach(entity, key);
    }

    /// Re-file an entity if it moved into another cell.
    pub fn update_actor(&mut self, entity: Entity, actors: &impl ActorView) {
        let Some(&old_key) = self.entity_keys.get(&entity) else {
            return;
        };
        let Some(position) = actors.position(entity) else {
            return;
        };

        let new_key = self.cell_key(position);
        if new_key == old_key {
            return;
        }

        self.detach(entity, old_key);
        self.buckets.entry(new_key).or_default().push(entity);
        self.entity_keys.insert(entity, new_key);
    }

    /// Re-file every registered entity that is still alive.
    ///
    /// Dead entities are skipped, not removed; unregistering is the caller's job.
    pub fn update_all(&mut self, actors: &impl ActorView) {
        let registered: Vec<Entity> = self.entity_keys.keys().copied().collect();
        for entity in registered {
            if actors.is_alive(entity) {
                self.update_actor(entity, actors);
            }
        }
    }

    /// All living entities within `radius` of `location`, unordered.
    pub fn query_neighbors(
        &self,
        location: Vec3,
        radius: f32,
        exclude: Option<Entity>,
        actors: &impl ActorView,
    ) -> Vec<Entity> {
        let mut out = Vec::new();
        self.query_neighbors_into(location, radius, exclude, actors, &mut out);
        out
    }

    /// Same as [`Self::query_neighbors`], reusing the caller's buffer.
    pub fn query_neighbors_into(
        &self,
        location: Vec3,
        radius: f32,
        exclude: Option<Entity>,
        actors: &impl ActorView,
        out: &mut Vec<Entity>,
    ) {
        out.clear();
        if radius < 0.0 {
            return;
        }

        let radius_sq = radius * radius;
        let cell_radius = (radius / self.cell_size).ceil() as i32;
        let center = self.cell_coord(location);

        // Colliding coordinates share a bucket; visit each bucket once.
        let mut visited = HashSet::new();

        for x in -cell_radius..=cell_radius {
            for y in -cell_radius..=cell_radius {
                for z in -cell_radius..=cell_radius {
                    let key = Self::coord_to_key(center + IVec3::new(x, y, z));
                    if !visited.insert(key) {
                        continue;
                    }
                    let Some(bucket) = self.buckets.get(&key) else {
                        continue;
                    };
                    for &entity in bucket {
                        if Some(entity) == exclude {
                            continue;
                        }
                        let Some(pos) = actors.position(entity) else {
                            continue;
                        };
                        if pos.distance_squared(location) <= radius_sq {
                            out.push(entity);
                        }
                    }
                }
            }
        }
    }

    /// Closest living entity within `radius`.
    pub fn get_nearest_neighbor(
        &self,
        location: Vec3,
        radius: f32,
        exclude: Option<Entity>,
        actors: &impl ActorView,
    ) -> Option<Entity> {
        let mut nearest = None;
        let mut min_dist_sq = f32::MAX;

        for entity in self.query_neighbors(location, radius, exclude, actors) {
            let Some(pos) = actors.position(entity) else {
                continue;
            };
            let dist_sq = pos.distance_squared(location);
            if dist_sq < min_dist_sq {
                min_dist_sq = dist_sq;
                nearest = Some(entity);
            }
        }

        nearest
    }

    fn detach(&mut self, entity: Entity, key: i32) {
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.retain(|&e| e != entity);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }
}
