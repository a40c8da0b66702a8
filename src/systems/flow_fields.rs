//! Flow field subsystem.
//!
//! Owns one [`FlowField`] per registered leader plus a shared spatial grid of
//! every steerable actor (leaders and soldiers). Fields are regenerated on a
//! fixed interval, never per frame.
//!
//! ## Parallel Feature
//!
//! When compiled with `--features parallel`, leader fields are regenerated with
//! rayon. Fields are independent, so each one is retargeted on its own thread.

use std::collections::{HashMap, HashSet};

use bevy_ecs::prelude::*;
use glam::{IVec2, Vec2, Vec3};
use tracing::{debug, info};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::actors::{ActorSnapshot, ActorView};
use crate::components::Faction;
use crate::config::{SimConfig, MIN_UPDATE_INTERVAL};
use crate::debug::DebugContext;
use crate::flow_field::FlowField;
use crate::spatial::SpatialHashGrid;
use crate::systems::DeltaTime;

/// Shared-grid cell size, matching the default flow field resolution.
const DEFAULT_GRID_CELL_SIZE: f32 = 100.0;

#[derive(Resource, Debug)]
pub struct FlowFieldSubsystem {
    fields: HashMap<Entity, FlowField>,
    soldiers: HashSet<Entity>,
    spatial_grid: SpatialHashGrid,

    /// Cells blocked by the obstacle scanner, applied to every field.
    blocked_cells: HashSet<IVec2>,
    /// Radius obstacles, replayed onto fields created later.
    obstacles: Vec<(Vec3, f32)>,

    origin: Vec2,
    size: Vec2,
    cell_size: f32,
    initialized: bool,

    update_interval: f32,
    time_since_update: f32,
}

impl Default for FlowFieldSubsystem {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl FlowFieldSubsystem {
    pub fn new(update_interval: f32) -> Self {
        Self {
            fields: HashMap::new(),
            soldiers: HashSet::new(),
            spatial_grid: SpatialHashGrid::new(DEFAULT_GRID_CELL_SIZE),
            blocked_cells: HashSet::new(),
            obstacles: Vec::new(),
            origin: Vec2::ZERO,
            size: Vec2::ZERO,
            cell_size: DEFAULT_GRID_CELL_SIZE,
            initialized: false,
            update_interval: update_interval.max(MIN_UPDATE_INTERVAL),
            time_since_update: 0.0,
        }
    }

    /// Build a subsystem from config and initialize its field extent.
    pub fn from_config(config: &SimConfig) -> Self {
        let flow = &config.flow_field;
        let mut subsystem = Self::new(flow.update_interval);
        subsystem.initialize_flow_field(flow.origin, flow.size, flow.cell_size);
        subsystem
    }

    /// Cache field parameters and reset the shared grid.
    ///
    /// Must be called before any leader is registered.
    pub fn initialize_flow_field(&mut self, origin: Vec2, size: Vec2, cell_size: f32) {
        self.origin = origin;
        self.size = size;
        self.cell_size = cell_size;
        self.spatial_grid.initialize(cell_size);
        self.initialized = true;

        info!(?origin, ?size, cell_size, "flow field subsystem initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn field_origin(&self) -> Vec2 {
        self.origin
    }

    pub fn field_cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Cell counts of every field, as [`FlowField::initialize`] computes them.
    pub fn field_dimensions(&self) -> IVec2 {
        FlowField::dimensions_for(self.size, self.cell_size)
    }

    pub fn set_update_interval(&mut self, interval: f32) {
        self.update_interval = interval.max(MIN_UPDATE_INTERVAL);
    }

    pub fn update_interval(&self) -> f32 {
        self.update_interval
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Give `leader` its own flow field targeting its current position.
    ///
    /// Returns false if the subsystem is uninitialized, the leader is already
    /// registered, or it is not alive.
    pub fn register_leader(&mut self, leader: Entity, actors: &impl ActorView) -> bool {
        if !self.initialized || self.fields.contains_key(&leader) {
            return false;
        }
        let Some(position) = actors.position(leader) else {
            return false;
        };

        let mut field = FlowField::new(self.origin, self.size, self.cell_size);
        apply_blocking(&mut field, &self.blocked_cells, &self.obstacles);
        field.set_target(position);

        self.fields.insert(leader, field);
        self.spatial_grid.add_actor(leader, actors);

        info!(?leader, "leader registered");
        true
    }

    pub fn unregister_leader(&mut self, leader: Entity) {
        if self.fields.remove(&leader).is_some() {
            info!(?leader, "leader unregistered");
        }
        self.spatial_grid.remove_actor(leader);
    }

    pub fn register_soldier(&mut self, soldier: Entity, actors: &impl ActorView) -> bool {
        if !self.initialized || !actors.is_alive(soldier) {
            return false;
        }
        self.spatial_grid.add_actor(soldier, actors);
        self.soldiers.insert(soldier)
    }

    pub fn unregister_soldier(&mut self, soldier: Entity) {
        self.soldiers.remove(&soldier);
        self.spatial_grid.remove_actor(soldier);
    }

    pub fn is_leader(&self, entity: Entity) -> bool {
        self.fields.contains_key(&entity)
    }

    pub fn leader_count(&self) -> usize {
        self.fields.len()
    }

    pub fn soldier_count(&self) -> usize {
        self.soldiers.len()
    }

    // ------------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------------

    /// Re-file moved actors in the shared grid.
    pub fn sync_spatial_grid(&mut self, actors: &impl ActorView) {
        self.spatial_grid.update_all(actors);
    }

    /// Advance the update timer, regenerating every field when it elapses.
    ///
    /// Returns true if the fields were regenerated.
    pub fn tick(&mut self, dt: f32, actors: &(impl ActorView + Sync)) -> bool {
        if !self.initialized {
            return false;
        }
        self.time_since_update += dt;
        if self.time_since_update < self.update_interval {
            return false;
        }
        self.time_since_update = 0.0;
        self.update_flow_fields(actors);
        true
    }

    /// Sync the shared grid, then retarget every living leader's field.
    pub fn update_flow_fields(&mut self, actors: &(impl ActorView + Sync)) {
        self.spatial_grid.update_all(actors);

        #[cfg(feature = "parallel")]
        {
            self.fields.par_iter_mut().for_each(|(leader, field)| {
                if let Some(position) = actors.position(*leader) {
                    field.set_target(position);
                }
            });
        }

        #[cfg(not(feature = "parallel"))]
        {
            for (leader, field) in self.fields.iter_mut() {
                // destroyed leaders keep their last field until unregistered
                if let Some(position) = actors.position(*leader) {
                    field.set_target(position);
                }
            }
        }

        debug!(fields = self.fields.len(), "flow fields regenerated");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Smoothed flow direction toward `leader` from `location`.
    ///
    /// Without a field for the leader this is the straight line to it, or zero if
    /// the leader is gone.
    pub fn get_flow_direction_to_leader(
        &self,
        leader: Entity,
        location: Vec3,
        actors: &impl ActorView,
    ) -> Vec3 {
        if let Some(field) = self.fields.get(&leader) {
            return field.get_flow_direction_smooth(location);
        }
        actors
            .position(leader)
            .map(|target| (target - location).normalize_or_zero())
            .unwrap_or(Vec3::ZERO)
    }

    /// Flow direction in the field of the lowest-indexed living leader.
    pub fn get_flow_direction(&self, location: Vec3, actors: &impl ActorView) -> Vec3 {
        self.fields
            .iter()
            .filter(|(leader, _)| actors.is_alive(**leader))
            .min_by_key(|(leader, _)| **leader)
            .map(|(_, field)| field.get_flow_direction_smooth(location))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn get_nearby_enemies(
        &self,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> Vec<Entity> {
        let mut found = self.spatial_grid.query_neighbors(location, radius, None, actors);
        found.retain(|&e| actors.faction(e).is_some_and(|f| faction.is_hostile_to(f)));
        found
    }

    pub fn get_nearest_enemy(
        &self,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> Option<Entity> {
        self.get_nearby_enemies(location, radius, faction, actors)
            .into_iter()
            .filter_map(|e| actors.position(e).map(|p| (e, p.distance_squared(location))))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(e, _)| e)
    }

    pub fn get_nearby_soldiers(
        &self,
        location: Vec3,
        radius: f32,
        actors: &impl ActorView,
    ) -> Vec<Entity> {
        let mut found = self.spatial_grid.query_neighbors(location, radius, None, actors);
        found.retain(|e| self.soldiers.contains(e));
        found
    }

    pub fn get_nearest_neighbor(
        &self,
        location: Vec3,
        radius: f32,
        exclude: Option<Entity>,
        actors: &impl ActorView,
    ) -> Option<Entity> {
        self.spatial_grid
            .get_nearest_neighbor(location, radius, exclude, actors)
    }

    pub fn query_neighbors_into(
        &self,
        location: Vec3,
        radius: f32,
        exclude: Option<Entity>,
        actors: &impl ActorView,
        out: &mut Vec<Entity>,
    ) {
        self.spatial_grid
            .query_neighbors_into(location, radius, exclude, actors, out);
    }

    pub fn flow_field_for_leader(&self, leader: Entity) -> Option<&FlowField> {
        self.fields.get(&leader)
    }

    pub fn flow_fields(&self) -> impl Iterator<Item = (&Entity, &FlowField)> {
        self.fields.iter()
    }

    pub fn spatial_grid(&self) -> &SpatialHashGrid {
        &self.spatial_grid
    }

    // ------------------------------------------------------------------------
    // Obstacles
    // ------------------------------------------------------------------------

    /// Block a disk of cells in every field. Takes effect at the next regeneration.
    pub fn add_obstacle(&mut self, location: Vec3, radius: f32) {
        for field in self.fields.values_mut() {
            field.set_obstacle(location, radius);
        }
        self.obstacles.push((location, radius));
    }

    /// Reopen a disk of cells, except those another obstacle or a blocked
    /// cell still covers.
    pub fn remove_obstacle(&mut self, location: Vec3, radius: f32) {
        self.obstacles
            .retain(|(l, r)| !(l.distance_squared(location) < 1e-6 && (r - radius).abs() < 1e-6));
        for field in self.fields.values_mut() {
            field.clear_obstacle(location, radius);
            apply_blocking(field, &self.blocked_cells, &self.obstacles);
        }
    }

    pub fn mark_cell_as_blocked(&mut self, x: i32, y: i32) {
        for field in self.fields.values_mut() {
            field.set_cell_blocked(x, y, true);
        }
        self.blocked_cells.insert(IVec2::new(x, y));
    }

    /// Reopen every scanner-blocked cell in every field.
    ///
    /// Radius obstacles added through [`Self::add_obstacle`] stay in place.
    pub fn clear_blocked_cells(&mut self) {
        self.blocked_cells.clear();
        for field in self.fields.values_mut() {
            field.clear_all_blocked_cells();
            apply_blocking(field, &self.blocked_cells, &self.obstacles);
        }
    }

    pub fn blocked_cell_count(&self) -> usize {
        self.blocked_cells.len()
    }

    /// Force an immediate regeneration so obstacle changes show up at once.
    pub fn refresh(&mut self, actors: &(impl ActorView + Sync)) {
        self.time_since_update = 0.0;
        self.update_flow_fields(actors);
    }

    pub fn debug_draw(&self, debug: &mut DebugContext) {
        if !debug.enabled {
            return;
        }
        let mut leaders: Vec<&Entity> = self.fields.keys().collect();
        leaders.sort();
        for leader in leaders {
            if let Some(field) = self.fields.get(leader) {
                field.debug_draw(debug);
            }
        }
    }
}

/// Stamp the remembered blocked cells and obstacle disks onto `field`.
fn apply_blocking(field: &mut FlowField, cells: &HashSet<IVec2>, obstacles: &[(Vec3, f32)]) {
    for cell in cells {
        field.set_cell_blocked(cell.x, cell.y, true);
    }
    for &(location, radius) in obstacles {
        field.set_obstacle(location, radius);
    }
}

// ============================================================================
// SYSTEMS
// ============================================================================

/// System that keeps the shared grid in step with actor positions.
pub fn spatial_grid_sync_system(
    mut subsystem: ResMut<FlowFieldSubsystem>,
    snapshot: Res<ActorSnapshot>,
) {
    subsystem.sync_spatial_grid(&*snapshot);
}

/// System that regenerates leader fields on the configured interval.
pub fn flow_field_update_system(
    mut subsystem: ResMut<FlowFieldSubsystem>,
    snapshot: Res<ActorSnapshot>,
    dt: Res<DeltaTime>,
) {
    subsystem.tick(dt.0, &*snapshot);
}
