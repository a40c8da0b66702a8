//! Public API for the navigation core.
//!
//! [`SimWorld`] owns the ECS world, its resources, and the fixed-update
//! schedule. Hosts spawn leaders and soldiers, move leaders, place obstacles,
//! issue perception queries, and read back [`Snapshot`]s.
//!
//! ## Fixed Timestep
//!
//! `step(dt)` accumulates time and runs as many fixed updates as fit, so the
//! outcome does not depend on the host's frame rate.

use bevy_ecs::prelude::*;
use glam::Vec3;
use tracing::info;

use crate::actors::{actor_snapshot_system, ActorSnapshot};
use crate::collision::CircleObstacles;
use crate::components::*;
use crate::config::{ConfigError, SimConfig};
use crate::debug::{DebugContext, DebugShape};
use crate::perception::{
    perception_tick_system, BatchQuery, PerceptionResult, PerceptionStats, PerceptionSubsystem,
    QueryCallback, QueryPriority,
};
use crate::systems::*;
use crate::world::Snapshot;

/// The navigation world container.
pub struct SimWorld {
    world: World,
    schedule: Schedule,
    tick: u64,
    time: f32,
    /// Accumulated time for fixed timestep.
    time_accumulator: f32,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWorld {
    /// Create a world with the default configuration.
    pub fn new() -> Self {
        Self::build(SimConfig::default())
    }

    /// Create a world with a custom configuration.
    pub fn with_config(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SimConfig) -> Self {
        let mut world = World::new();

        world.insert_resource(DeltaTime(config.fixed_timestep));
        world.insert_resource(SimTick(0));
        world.insert_resource(ActorSnapshot::new());
        world.insert_resource(CircleObstacles::new());
        world.insert_resource(DebugContext::new(false));
        world.insert_resource(FlowFieldSubsystem::from_config(&config));
        world.insert_resource(ObstacleScanner::from_config(&config));
        world.insert_resource(PerceptionSubsystem::new(config.perception.clone()));
        world.insert_resource(config);

        // Order matters: see the systems module docs.
        let mut schedule = Schedule::default();
        schedule.add_systems(
            (
                actor_snapshot_system,
                registration_system,
                spatial_grid_sync_system,
                flow_field_update_system,
                obstacle_scan_system,
                perception_tick_system,
                steering_system,
            )
                .chain(),
        );

        info!("navigation world created");

        Self {
            world,
            schedule,
            tick: 0,
            time: 0.0,
            time_accumulator: 0.0,
        }
    }

    /// Step the simulation forward by `dt` seconds.
    pub fn step(&mut self, dt: f32) {
        let fixed_dt = self.config().fixed_timestep;

        self.time_accumulator += dt;
        while self.time_accumulator >= fixed_dt {
            self.fixed_update(fixed_dt);
            self.time_accumulator -= fixed_dt;
        }
    }

    /// Run a single fixed timestep update.
    fn fixed_update(&mut self, dt: f32) {
        self.world.resource_mut::<DeltaTime>().0 = dt;
        self.world.resource_mut::<SimTick>().increment();

        self.schedule.run(&mut self.world);

        self.tick += 1;
        self.time += dt;
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn current_time(&self) -> f32 {
        self.time
    }

    pub fn config(&self) -> &SimConfig {
        self.world.resource::<SimConfig>()
    }

    // ------------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------------

    /// Spawn a leader. It gets its flow field on the next fixed update.
    pub fn spawn_leader(&mut self, faction: Faction, position: Vec3) -> Entity {
        self.world
            .spawn(LeaderBundle::new(faction, Position(position)))
            .id()
    }

    /// Spawn a soldier, optionally following `leader`'s flow field.
    pub fn spawn_soldier(
        &mut self,
        faction: Faction,
        position: Vec3,
        leader: Option<Entity>,
    ) -> Entity {
        let mut steering = SteeringAgent::new(self.config().steering);
        steering.set_follow_target(leader);
        self.world
            .spawn(SoldierBundle {
                steering,
                ..SoldierBundle::new(faction, Position(position))
            })
            .id()
    }

    /// Remove an entity entirely. Subsystems drop it on the next update.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    /// Deplete an entity's health. It stays spawned but counts as dead.
    pub fn kill(&mut self, entity: Entity) -> bool {
        let Some(mut health) = self.world.get_mut::<Health>(entity) else {
            return false;
        };
        health.kill();
        true
    }

    /// Teleport a leader (or any positioned entity).
    ///
    /// Leaders are driven by the host; their fields retarget on the next
    /// regeneration.
    pub fn move_entity(&mut self, entity: Entity, position: Vec3) -> bool {
        let Some(mut pos) = self.world.get_mut::<Position>(entity) else {
            return false;
        };
        pos.0 = position;
        true
    }

    pub fn position(&self, entity: Entity) -> Option<Vec3> {
        self.world.get::<Position>(entity).map(|p| p.0)
    }

    pub fn velocity(&self, entity: Entity) -> Option<Vec3> {
        self.world.get::<SteeringAgent>(entity).map(|s| s.velocity())
    }

    pub fn set_follow_target(&mut self, soldier: Entity, leader: Option<Entity>) -> bool {
        let Some(mut steering) = self.world.get_mut::<SteeringAgent>(soldier) else {
            return false;
        };
        steering.set_follow_target(leader);
        true
    }

    pub fn set_attack_target(&mut self, soldier: Entity, target: Option<Entity>) -> bool {
        let Some(mut steering) = self.world.get_mut::<SteeringAgent>(soldier) else {
            return false;
        };
        steering.set_attack_target(target);
        true
    }

    pub fn set_steering_enabled(&mut self, soldier: Entity, enabled: bool) -> bool {
        let Some(mut steering) = self.world.get_mut::<SteeringAgent>(soldier) else {
            return false;
        };
        steering.set_enabled(enabled);
        true
    }

    // ------------------------------------------------------------------------
    // Obstacles
    // ------------------------------------------------------------------------

    /// Add static geometry. Steering avoids it at once; flow fields pick it up
    /// on the next scan.
    pub fn add_obstacle(&mut self, center: Vec3, radius: f32) {
        self.world.resource_mut::<CircleObstacles>().add(center, radius);
        self.world.resource_mut::<ObstacleScanner>().request_scan();
    }

    /// Remove geometry centred within `tolerance` of `center`.
    pub fn remove_obstacles_near(&mut self, center: Vec3, tolerance: f32) -> usize {
        let removed = self
            .world
            .resource_mut::<CircleObstacles>()
            .remove_near(center, tolerance);
        if removed > 0 {
            self.world.resource_mut::<ObstacleScanner>().request_scan();
        }
        removed
    }

    /// Block a disk of cells in every flow field without adding geometry.
    pub fn add_flow_obstacle(&mut self, location: Vec3, radius: f32) {
        self.world
            .resource_mut::<FlowFieldSubsystem>()
            .add_obstacle(location, radius);
    }

    pub fn remove_flow_obstacle(&mut self, location: Vec3, radius: f32) {
        self.world
            .resource_mut::<FlowFieldSubsystem>()
            .remove_obstacle(location, radius);
    }

    /// Block one cell in every flow field. The next obstacle scan replaces
    /// scanner-owned cells, this one included.
    pub fn mark_cell_as_blocked(&mut self, x: i32, y: i32) {
        self.world
            .resource_mut::<FlowFieldSubsystem>()
            .mark_cell_as_blocked(x, y);
    }

    /// Reopen every blocked cell. Flow obstacles stay in place.
    pub fn clear_blocked_cells(&mut self) {
        self.world
            .resource_mut::<FlowFieldSubsystem>()
            .clear_blocked_cells();
    }

    /// Regenerate every flow field now instead of at the next interval.
    pub fn refresh_flow_fields(&mut self) {
        self.world
            .resource_scope(|world, mut flow: Mut<FlowFieldSubsystem>| flow.refresh(&*world));
    }

    pub fn flow_direction(&self, leader: Entity, location: Vec3) -> Vec3 {
        self.world
            .resource::<FlowFieldSubsystem>()
            .get_flow_direction_to_leader(leader, location, &self.world)
    }

    // ------------------------------------------------------------------------
    // Perception
    // ------------------------------------------------------------------------

    /// Nearest enemy of `querier` around its own position.
    ///
    /// `None` if the querier is dead or despawned.
    pub fn query_nearest_enemy(&mut self, querier: Entity, radius: f32) -> Option<PerceptionResult> {
        self.query_nearest_enemy_with_priority(querier, radius, QueryPriority::High)
    }

    /// Fresh nearest-enemy query that bypasses the cache lookup.
    pub fn query_nearest_enemy_immediate(
        &mut self,
        querier: Entity,
        radius: f32,
    ) -> Option<PerceptionResult> {
        let (location, faction) = self.querier(querier)?;
        self.world
            .resource_scope(|world, mut perception: Mut<PerceptionSubsystem>| {
                perception.query_nearest_enemy_immediate(querier, location, radius, faction, &*world)
            })
    }

    /// Queue a query whose result arrives through `callback`, at the latest on
    /// the perception tick that drains its priority.
    ///
    /// Returns false, without calling back, if the querier is dead or gone.
    pub fn query_nearest_enemy_async(
        &mut self,
        querier: Entity,
        radius: f32,
        priority: QueryPriority,
        callback: QueryCallback,
    ) -> bool {
        let Some((location, faction)) = self.querier(querier) else {
            return false;
        };
        self.world
            .resource_scope(|world, mut perception: Mut<PerceptionSubsystem>| {
                perception.query_nearest_enemy_async(
                    querier, location, radius, faction, priority, callback, &*world,
                )
            })
    }

    pub fn query_nearest_enemy_with_priority(
        &mut self,
        querier: Entity,
        radius: f32,
        priority: QueryPriority,
    ) -> Option<PerceptionResult> {
        let (location, faction) = self.querier(querier)?;

        self.world
            .resource_scope(|world, mut perception: Mut<PerceptionSubsystem>| {
                perception.query_nearest_enemy_with_priority(
                    querier, location, radius, faction, priority, &*world,
                )
            })
    }

    pub fn query_enemies_batch(&mut self, queries: &[BatchQuery]) -> Vec<PerceptionResult> {
        self.world
            .resource_scope(|world, mut perception: Mut<PerceptionSubsystem>| {
                perception.query_enemies_batch(queries, &*world)
            })
    }

    pub fn mark_hotspot(&mut self, center: Vec3, radius: f32) {
        self.world
            .resource_mut::<PerceptionSubsystem>()
            .mark_hotspot(center, radius);
    }

    pub fn perception_stats(&self) -> PerceptionStats {
        self.world.resource::<PerceptionSubsystem>().stats()
    }

    pub fn reset_perception_stats(&mut self) {
        self.world.resource_mut::<PerceptionSubsystem>().reset_stats();
    }

    /// Fraction of perception queries answered from cache.
    pub fn cache_hit_rate(&self) -> f32 {
        self.world.resource::<PerceptionSubsystem>().cache_hit_rate()
    }

    pub fn performance_report(&self) -> String {
        self.world.resource::<PerceptionSubsystem>().performance_report()
    }

    fn querier(&self, querier: Entity) -> Option<(Vec3, Faction)> {
        let location = self.world.get::<Position>(querier)?.0;
        let faction = self
            .world
            .get::<Faction>(querier)
            .copied()
            .unwrap_or_default();
        Some((location, faction))
    }

    // ------------------------------------------------------------------------
    // Debug and snapshots
    // ------------------------------------------------------------------------

    pub fn set_debug_enabled(&mut self, enabled: bool) {
        let mut debug = self.world.resource_mut::<DebugContext>();
        debug.enabled = enabled;
        if !enabled {
            debug.clear();
        }
    }

    /// Shapes for the flow fields and perception grid. Empty while debug
    /// drawing is disabled.
    pub fn debug_shapes(&mut self) -> Vec<DebugShape> {
        self.world
            .resource_scope(|world, mut debug: Mut<DebugContext>| {
                world.resource::<FlowFieldSubsystem>().debug_draw(&mut debug);
                world.resource::<PerceptionSubsystem>().debug_draw(&mut debug);
                debug.drain()
            })
    }

    /// Get a snapshot of the current navigation state.
    pub fn snapshot(&mut self) -> Snapshot {
        Snapshot::from_world(&mut self.world, self.tick, self.time)
    }

    /// Get the snapshot as a JSON string.
    pub fn snapshot_json(&mut self) -> String {
        self.snapshot()
            .to_json()
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}
