//! Cached nearest-enemy perception.
//!
//! The perception subsystem answers "who is the nearest hostile within r of
//! here" for many agents per frame. It keeps its own coarse spatial index of
//! registered actors (independent of the flow field grid) and layers three
//! cache tiers plus priority queues on top of a brute-force executor.
//!
//! ## Query flow
//!
//! Every query first checks the cache tiers (L1, L2, then L3 inside hotspots).
//! On a miss the priority decides what happens:
//!
//! - `Immediate` executes synchronously.
//! - `High` merges with a similar query seen this frame, otherwise executes.
//! - `Normal` and `Low` are queued and drained under per-tick caps; the caller
//!   gets the best stale cache entry now and an optional callback later.
//!
//! A query from a dead querier is rejected with `None` and has no side effects.

mod cache;
mod types;

pub use cache::{CacheTier, PerceptionCache};
pub use types::{
    BatchQuery, Hotspot, PerceptionResult, PerceptionStats, QueryCallback, QueryPriority,
};

use std::collections::{HashMap, VecDeque};

use bevy_ecs::prelude::*;
use glam::{IVec3, Vec3};
use tracing::{debug, info, trace};

use crate::actors::{ActorSnapshot, ActorView};
use crate::components::Faction;
use crate::config::PerceptionConfig;
use crate::debug::{DebugContext, DebugShape};
use crate::systems::DeltaTime;
use types::{FrameQuery, PendingQuery};

/// Most fixed perception ticks run per `tick` call; the rest are dropped.
const MAX_TICKS_PER_UPDATE: u32 = 4;

#[derive(Resource)]
pub struct PerceptionSubsystem {
    config: PerceptionConfig,

    /// Perception clock in seconds, advanced by [`Self::tick`].
    time: f64,
    tick_accumulator: f32,
    last_hotspot_update: Option<f64>,
    last_cache_cleanup: f64,

    cells: HashMap<IVec3, Vec<Entity>>,
    actor_cells: HashMap<Entity, IVec3>,
    actor_factions: HashMap<Entity, Faction>,
    actors_by_faction: HashMap<Faction, Vec<Entity>>,

    cache: PerceptionCache,
    hotspots: Vec<Hotspot>,

    high_queue: VecDeque<PendingQuery>,
    normal_queue: VecDeque<PendingQuery>,
    low_queue: VecDeque<PendingQuery>,
    frame_queries: Vec<FrameQuery>,

    stats: PerceptionStats,
}

impl Default for PerceptionSubsystem {
    fn default() -> Self {
        Self::new(PerceptionConfig::default())
    }
}

impl PerceptionSubsystem {
    pub fn new(config: PerceptionConfig) -> Self {
        Self {
            cache: PerceptionCache::new(&config),
            config,
            time: 0.0,
            tick_accumulator: 0.0,
            last_hotspot_update: None,
            last_cache_cleanup: 0.0,
            cells: HashMap::new(),
            actor_cells: HashMap::new(),
            actor_factions: HashMap::new(),
            actors_by_faction: HashMap::new(),
            hotspots: Vec::new(),
            high_queue: VecDeque::new(),
            normal_queue: VecDeque::new(),
            low_queue: VecDeque::new(),
            frame_queries: Vec::new(),
            stats: PerceptionStats::default(),
        }
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    /// Current perception clock.
    pub fn now(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn cell_of(&self, location: Vec3) -> IVec3 {
        (location / self.config.cell_size).floor().as_ivec3()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Track `actor` as a member of `faction` at its current position.
    pub fn register_actor(
        &mut self,
        actor: Entity,
        faction: Faction,
        actors: &impl ActorView,
    ) -> bool {
        if self.actor_cells.contains_key(&actor) {
            return false;
        }
        let Some(position) = actors.position(actor) else {
            return false;
        };

        let cell = self.cell_of(position);
        self.cells.entry(cell).or_default().push(actor);
        self.actor_cells.insert(actor, cell);
        self.actor_factions.insert(actor, faction);
        self.actors_by_faction.entry(faction).or_default().push(actor);

        trace!(?actor, ?faction, "perception actor registered");
        true
    }

    pub fn unregister_actor(&mut self, actor: Entity) {
        if let Some(cell) = self.actor_cells.remove(&actor) {
            self.detach_from_cell(actor, cell);
        }
        if let Some(faction) = self.actor_factions.remove(&actor) {
            if let Some(list) = self.actors_by_faction.get_mut(&faction) {
                list.retain(|&e| e != actor);
            }
        }
    }

    /// Move a registered actor to the cell of its current position.
    pub fn update_actor_location(&mut self, actor: Entity, actors: &impl ActorView) {
        let Some(&old_cell) = self.actor_cells.get(&actor) else {
            return;
        };
        let Some(position) = actors.position(actor) else {
            return;
        };
        let new_cell = self.cell_of(position);
        if new_cell == old_cell {
            return;
        }
        self.detach_from_cell(actor, old_cell);
        self.cells.entry(new_cell).or_default().push(actor);
        self.actor_cells.insert(actor, new_cell);
    }

    pub fn registered_actor_count(&self) -> usize {
        self.actor_cells.len()
    }

    pub fn is_registered(&self, actor: Entity) -> bool {
        self.actor_cells.contains_key(&actor)
    }

    fn detach_from_cell(&mut self, actor: Entity, cell: IVec3) {
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.retain(|&e| e != actor);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    fn sync_locations(&mut self, actors: &impl ActorView) {
        let registered: Vec<Entity> = self.actor_cells.keys().copied().collect();
        for actor in registered {
            self.update_actor_location(actor, actors);
        }
    }

    fn prune_dead_actors(&mut self, actors: &impl ActorView) -> usize {
        let dead: Vec<Entity> = self
            .actor_cells
            .keys()
            .copied()
            .filter(|&e| !actors.is_alive(e))
            .collect();
        for &actor in &dead {
            self.unregister_actor(actor);
        }
        dead.len()
    }

    // ------------------------------------------------------------------------
    // Hotspots
    // ------------------------------------------------------------------------

    /// Mark a combat-dense region. Its results are prewarmed on the hotspot
    /// interval and cached for the L3 TTL.
    pub fn mark_hotspot(&mut self, center: Vec3, radius: f32) {
        self.hotspots.push(Hotspot { center, radius });
        self.last_hotspot_update = None;
    }

    pub fn clear_hotspots(&mut self) {
        self.hotspots.clear();
    }

    pub fn hotspots(&self) -> &[Hotspot] {
        &self.hotspots
    }

    fn hotspot_cell_for(&self, location: Vec3) -> Option<IVec3> {
        self.hotspots
            .iter()
            .find(|h| h.contains(location))
            .map(|h| self.cell_of(h.center))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Nearest enemy at high priority.
    pub fn query_nearest_enemy(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        self.query_nearest_enemy_with_priority(
            querier,
            location,
            radius,
            faction,
            QueryPriority::High,
            actors,
        )
    }

    /// Same as [`Self::query_nearest_enemy`]; callers read `detected_enemies`.
    pub fn query_enemies_in_radius(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        self.query_nearest_enemy(querier, location, radius, faction, actors)
    }

    /// Fresh execution that skips the cache lookup but still refreshes it.
    pub fn query_nearest_enemy_immediate(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        if !actors.is_alive(querier) {
            return None;
        }
        self.stats.total_queries += 1;
        Some(self.execute_and_cache(querier, location, radius, faction, actors))
    }

    pub fn query_nearest_enemy_with_priority(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        priority: QueryPriority,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        if !actors.is_alive(querier) {
            return None;
        }
        self.stats.total_queries += 1;

        let cell = self.cell_of(location);
        if let Some(result) = self.lookup_cache(cell, faction, radius, location, actors) {
            return Some(result);
        }

        let result = match priority {
            QueryPriority::Immediate => {
                self.execute_and_cache(querier, location, radius, faction, actors)
            }
            QueryPriority::High => {
                if self.find_mergeable(cell, faction, radius) {
                    self.stats.merged_queries += 1;
                    self.best_stale(cell, faction, location, actors)
                } else {
                    self.frame_queries.push(FrameQuery {
                        cell,
                        faction,
                        radius,
                    });
                    self.execute_and_cache(querier, location, radius, faction, actors)
                }
            }
            QueryPriority::Normal | QueryPriority::Low => {
                self.frame_queries.push(FrameQuery {
                    cell,
                    faction,
                    radius,
                });
                self.enqueue(querier, location, radius, faction, priority, None);
                self.best_stale(cell, faction, location, actors)
            }
        };
        Some(result)
    }

    /// Queue a query and deliver its result through `callback`.
    ///
    /// Cache hits and `Immediate` queries call back before returning. Returns
    /// false, without calling back, if the querier is dead.
    #[allow(clippy::too_many_arguments)]
    pub fn query_nearest_enemy_async(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        priority: QueryPriority,
        callback: QueryCallback,
        actors: &impl ActorView,
    ) -> bool {
        if !actors.is_alive(querier) {
            return false;
        }
        self.stats.total_queries += 1;

        let cell = self.cell_of(location);
        if let Some(result) = self.lookup_cache(cell, faction, radius, location, actors) {
            callback(querier, &result);
            return true;
        }

        if priority == QueryPriority::Immediate {
            let result = self.execute_and_cache(querier, location, radius, faction, actors);
            callback(querier, &result);
        } else {
            self.frame_queries.push(FrameQuery {
                cell,
                faction,
                radius,
            });
            self.enqueue(querier, location, radius, faction, priority, Some(callback));
        }
        true
    }

    /// Answer many queries, executing once per cell and faction.
    ///
    /// Queries are grouped by the cell of their location. Within a group, one
    /// execution per faction runs at the group centroid with a radius that
    /// covers every member's own query disk, so members may see enemies slightly
    /// beyond their own radius. Dead queriers get an invalid result in place.
    pub fn query_enemies_batch(
        &mut self,
        queries: &[BatchQuery],
        actors: &impl ActorView,
    ) -> Vec<PerceptionResult> {
        let mut results = vec![PerceptionResult::empty(self.time); queries.len()];

        let mut groups: Vec<(IVec3, Vec<usize>)> = Vec::new();
        for (i, query) in queries.iter().enumerate() {
            if !actors.is_alive(query.querier) {
                continue;
            }
            self.stats.total_queries += 1;
            let cell = self.cell_of(query.location);
            match groups.iter_mut().find(|(c, _)| *c == cell) {
                Some((_, members)) => members.push(i),
                None => groups.push((cell, vec![i])),
            }
        }

        for (cell, members) in groups {
            let centroid = members
                .iter()
                .map(|&i| queries[i].location)
                .sum::<Vec3>()
                / members.len() as f32;

            let mut factions: Vec<Faction> = Vec::new();
            for &i in &members {
                if !factions.contains(&queries[i].faction) {
                    factions.push(queries[i].faction);
                }
            }

            for faction in factions {
                let same_faction = members.iter().copied().filter(|&i| queries[i].faction == faction);
                let radius = same_faction
                    .clone()
                    .map(|i| queries[i].radius + queries[i].location.distance(centroid))
                    .fold(0.0_f32, f32::max);

                let result = self.execute_optimized_query(centroid, radius, faction, None, actors);
                self.cache.store_region(cell, faction, radius, &result, self.time);

                for i in same_faction {
                    results[i] = result.clone();
                }
            }
        }

        results
    }

    /// Brute force over every registered actor of a hostile faction.
    ///
    /// O(n) in registered actors; bypasses the grid and the cache.
    pub fn query_nearest_enemy_by_faction(
        &mut self,
        location: Vec3,
        radius: f32,
        faction: Faction,
        exclude: Option<Entity>,
        actors: &impl ActorView,
    ) -> PerceptionResult {
        self.stats.actual_queries += 1;

        let mut result = PerceptionResult {
            is_valid: true,
            result_time: self.time,
            ..Default::default()
        };
        let radius_sq = radius * radius;
        let mut nearest_sq = f32::MAX;

        for other in Faction::ALL {
            if !faction.is_hostile_to(other) {
                continue;
            }
            let Some(list) = self.actors_by_faction.get(&other) else {
                continue;
            };
            for &actor in list {
                if Some(actor) == exclude {
                    continue;
                }
                let Some(position) = actors.position(actor) else {
                    continue;
                };
                let dist_sq = position.distance_squared(location);
                if dist_sq > radius_sq {
                    continue;
                }
                result.detected_enemies.push(actor);
                if dist_sq < nearest_sq {
                    nearest_sq = dist_sq;
                    result.nearest_enemy = Some(actor);
                    result.distance_to_nearest = dist_sq.sqrt();
                }
            }
        }
        result
    }

    /// Brute force over the actors in the cells overlapping the query box.
    pub fn execute_optimized_query(
        &mut self,
        location: Vec3,
        radius: f32,
        faction: Faction,
        exclude: Option<Entity>,
        actors: &impl ActorView,
    ) -> PerceptionResult {
        self.stats.actual_queries += 1;

        let mut result = PerceptionResult {
            is_valid: true,
            result_time: self.time,
            ..Default::default()
        };
        let radius_sq = radius * radius;
        let mut nearest_sq = f32::MAX;

        for cell in self.covered_cells(location, radius) {
            let Some(bucket) = self.cells.get(&cell) else {
                continue;
            };
            for &actor in bucket {
                if Some(actor) == exclude {
                    continue;
                }
                let Some(other) = self.actor_factions.get(&actor) else {
                    continue;
                };
                if !faction.is_hostile_to(*other) {
                    continue;
                }
                let Some(position) = actors.position(actor) else {
                    continue;
                };
                let dist_sq = position.distance_squared(location);
                if dist_sq > radius_sq {
                    continue;
                }
                result.detected_enemies.push(actor);
                if dist_sq < nearest_sq {
                    nearest_sq = dist_sq;
                    result.nearest_enemy = Some(actor);
                    result.distance_to_nearest = dist_sq.sqrt();
                }
            }
        }
        result
    }

    /// Cells overlapping the axis-aligned box around a query sphere.
    pub fn covered_cells(&self, location: Vec3, radius: f32) -> Vec<IVec3> {
        let radius = radius.max(0.0);
        let min = self.cell_of(location - Vec3::splat(radius));
        let max = self.cell_of(location + Vec3::splat(radius));

        let mut cells = Vec::new();
        for z in min.z..=max.z {
            for y in min.y..=max.y {
                for x in min.x..=max.x {
                    cells.push(IVec3::new(x, y, z));
                }
            }
        }
        cells
    }

    fn lookup_cache(
        &mut self,
        cell: IVec3,
        faction: Faction,
        radius: f32,
        location: Vec3,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        let hotspot_cell = self.hotspot_cell_for(location);
        let (tier, result) =
            self.cache
                .lookup(cell, faction, radius, hotspot_cell, self.time, actors)?;
        match tier {
            CacheTier::L1 => self.stats.l1_hits += 1,
            CacheTier::L2 => self.stats.l2_hits += 1,
            CacheTier::L3 => self.stats.l3_hits += 1,
        }
        Some(result)
    }

    fn best_stale(
        &self,
        cell: IVec3,
        faction: Faction,
        location: Vec3,
        actors: &impl ActorView,
    ) -> PerceptionResult {
        self.cache
            .stale(cell, faction, self.hotspot_cell_for(location), actors)
            .unwrap_or_else(|| PerceptionResult::empty(self.time))
    }

    fn find_mergeable(&self, cell: IVec3, faction: Faction, radius: f32) -> bool {
        self.frame_queries.iter().any(|q| {
            q.cell == cell
                && q.faction == faction
                && (q.radius - radius).abs() <= self.config.merge_distance_threshold
        })
    }

    fn execute_and_cache(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        actors: &impl ActorView,
    ) -> PerceptionResult {
        let result = self.execute_optimized_query(location, radius, faction, Some(querier), actors);
        let cell = self.cell_of(location);
        self.cache.store_region(cell, faction, radius, &result, self.time);
        if let Some(hotspot_cell) = self.hotspot_cell_for(location) {
            self.cache
                .store_hotspot(hotspot_cell, faction, radius, &result, self.time);
        }
        result
    }

    fn enqueue(
        &mut self,
        querier: Entity,
        location: Vec3,
        radius: f32,
        faction: Faction,
        priority: QueryPriority,
        callback: Option<QueryCallback>,
    ) {
        let pending = PendingQuery {
            querier,
            location,
            radius,
            faction,
            callback,
        };
        match priority {
            QueryPriority::Immediate | QueryPriority::High => self.high_queue.push_back(pending),
            QueryPriority::Normal => self.normal_queue.push_back(pending),
            QueryPriority::Low => self.low_queue.push_back(pending),
        }
    }

    pub fn pending_count(&self, priority: QueryPriority) -> usize {
        match priority {
            QueryPriority::Immediate => 0,
            QueryPriority::High => self.high_queue.len(),
            QueryPriority::Normal => self.normal_queue.len(),
            QueryPriority::Low => self.low_queue.len(),
        }
    }

    pub fn total_pending(&self) -> usize {
        self.high_queue.len() + self.normal_queue.len() + self.low_queue.len()
    }

    // ------------------------------------------------------------------------
    // Ticking
    // ------------------------------------------------------------------------

    /// Advance the perception clock and run due fixed ticks.
    ///
    /// Returns the number of [`Self::perform_tick`] calls made.
    pub fn tick(&mut self, dt: f32, actors: &impl ActorView) -> u32 {
        self.time += f64::from(dt);
        self.tick_accumulator += dt;

        let mut ran = 0;
        while self.tick_accumulator >= self.config.tick_interval {
            self.tick_accumulator -= self.config.tick_interval;
            if ran == MAX_TICKS_PER_UPDATE {
                self.tick_accumulator = 0.0;
                break;
            }
            self.perform_tick(actors);
            ran += 1;
        }
        ran
    }

    /// One fixed perception step.
    ///
    /// Drains High before Normal before Low, each under its own cap, then
    /// refreshes hotspots and purges caches when their intervals elapse.
    pub fn perform_tick(&mut self, actors: &impl ActorView) {
        self.sync_locations(actors);

        self.drain_queue(QueryPriority::High, self.config.max_high_queries_per_frame, actors);
        self.drain_queue(
            QueryPriority::Normal,
            self.config.max_normal_queries_per_frame,
            actors,
        );
        self.drain_queue(QueryPriority::Low, self.config.max_low_queries_per_frame, actors);

        let hotspots_due = self
            .last_hotspot_update
            .map_or(true, |t| self.time - t >= f64::from(self.config.hotspot_update_interval));
        if hotspots_due && !self.hotspots.is_empty() {
            self.update_hotspots(actors);
        }

        if self.time - self.last_cache_cleanup >= f64::from(self.config.cache_cleanup_interval) {
            self.cleanup(actors);
        }

        self.frame_queries.clear();
    }

    fn drain_queue(&mut self, priority: QueryPriority, cap: usize, actors: &impl ActorView) {
        let mut processed = 0;
        while processed < cap {
            let next = match priority {
                QueryPriority::Immediate | QueryPriority::High => self.high_queue.pop_front(),
                QueryPriority::Normal => self.normal_queue.pop_front(),
                QueryPriority::Low => self.low_queue.pop_front(),
            };
            let Some(query) = next else {
                break;
            };

            if !actors.is_alive(query.querier) {
                self.stats.dropped_queries += 1;
                continue;
            }

            let cell = self.cell_of(query.location);
            let result = match self.lookup_cache(cell, query.faction, query.radius, query.location, actors) {
                Some(cached) => cached,
                None => self.execute_and_cache(
                    query.querier,
                    query.location,
                    query.radius,
                    query.faction,
                    actors,
                ),
            };

            if let Some(callback) = query.callback {
                callback(query.querier, &result);
            }
            processed += 1;
        }
    }

    fn update_hotspots(&mut self, actors: &impl ActorView) {
        let hotspots = self.hotspots.clone();
        let factions = self.config.hotspot_factions.clone();
        for hotspot in &hotspots {
            let cell = self.cell_of(hotspot.center);
            for &faction in &factions {
                let result =
                    self.execute_optimized_query(hotspot.center, hotspot.radius, faction, None, actors);
                self.cache
                    .store_hotspot(cell, faction, hotspot.radius, &result, self.time);
                self.stats.hotspot_refreshes += 1;
            }
        }
        self.last_hotspot_update = Some(self.time);
    }

    fn cleanup(&mut self, actors: &impl ActorView) {
        let purged = self.cache.purge_expired(self.time);
        let pruned = self.prune_dead_actors(actors);
        self.last_cache_cleanup = self.time;
        debug!(purged, pruned, "perception cache cleanup");
    }

    // ------------------------------------------------------------------------
    // Stats and debugging
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> PerceptionStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PerceptionStats::default();
    }

    pub fn cache_hit_rate(&self) -> f32 {
        self.stats.cache_hit_rate()
    }

    pub fn cache(&self) -> &PerceptionCache {
        &self.cache
    }

    pub fn performance_report(&self) -> String {
        let s = &self.stats;
        format!(
            "perception: {} queries, {} executed, {} merged, cache hits L1 {} / L2 {} / L3 {} ({:.1}%), \
             {} hotspot refreshes, {} dropped, {} actors, {} pending",
            s.total_queries,
            s.actual_queries,
            s.merged_queries,
            s.l1_hits,
            s.l2_hits,
            s.l3_hits,
            s.cache_hit_rate() * 100.0,
            s.hotspot_refreshes,
            s.dropped_queries,
            self.registered_actor_count(),
            self.total_pending(),
        )
    }

    pub fn print_performance_report(&self) {
        info!("{}", self.performance_report());
    }

    /// Occupied cells as boxes and hotspots as spheres.
    pub fn debug_draw(&self, debug: &mut DebugContext) {
        if !debug.enabled {
            return;
        }
        let half = self.config.cell_size * 0.5;
        for cell in self.cells.keys() {
            debug.push(DebugShape::Box {
                center: (cell.as_vec3() + Vec3::splat(0.5)) * self.config.cell_size,
                half_extent: half,
            });
        }
        for hotspot in &self.hotspots {
            debug.push(DebugShape::Sphere {
                center: hotspot.center,
                radius: hotspot.radius,
            });
        }
    }
}

/// System that advances perception with the fixed timestep.
pub fn perception_tick_system(
    mut perception: ResMut<PerceptionSubsystem>,
    snapshot: Res<ActorSnapshot>,
    dt: Res<DeltaTime>,
) {
    perception.tick(dt.0, &*snapshot);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::actors::ActorState;

    fn entity(index: u32) -> Entity {
        Entity::from_raw(index)
    }

    struct Scene {
        actors: ActorSnapshot,
        perception: PerceptionSubsystem,
    }

    impl Scene {
        fn new() -> Self {
            Self {
                actors: ActorSnapshot::new(),
                perception: PerceptionSubsystem::default(),
            }
        }

        fn spawn(&mut self, index: u32, x: f32, y: f32, faction: Faction) -> Entity {
            let e = entity(index);
            self.actors.insert(e, ActorState::at(Vec3::new(x, y, 0.0), faction));
            self.perception.register_actor(e, faction, &self.actors);
            e
        }
    }

    #[test]
    fn test_repeat_query_hits_l1() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let foe = scene.spawn(2, 300.0, 0.0, Faction::Enemy);

        let first = scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1000.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(first.nearest_enemy, Some(foe));
        assert!((first.distance_to_nearest - 300.0).abs() < 1e-3);

        let executed = scene.perception.stats().actual_queries;
        let second = scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1000.0, Faction::Player, &scene.actors)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(scene.perception.stats().actual_queries, executed);
        assert_eq!(scene.perception.stats().l1_hits, 1);
    }

    #[test]
    fn test_l2_answers_after_l1_expires() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        scene.spawn(2, 300.0, 0.0, Faction::Enemy);

        scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1000.0, Faction::Player, &scene.actors);
        scene.perception.tick(0.2, &scene.actors);

        scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 900.0, Faction::Player, &scene.actors);
        assert_eq!(scene.perception.stats().l2_hits, 1);

        // too wide for the cached radius
        scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1300.0, Faction::Player, &scene.actors);
        assert_eq!(scene.perception.stats().actual_queries, 2);
    }

    #[test]
    fn test_dead_querier_is_rejected() {
        let mut scene = Scene::new();
        scene.spawn(2, 100.0, 0.0, Faction::Enemy);
        let ghost = entity(99);

        let result = scene.perception.query_nearest_enemy_with_priority(
            ghost,
            Vec3::ZERO,
            500.0,
            Faction::Player,
            QueryPriority::Normal,
            &scene.actors,
        );
        assert!(result.is_none());
        assert_eq!(scene.perception.stats().total_queries, 0);
        assert_eq!(scene.perception.total_pending(), 0);
    }

    #[test]
    fn test_dead_nearest_enemy_forces_reexecution() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let near = scene.spawn(2, 100.0, 0.0, Faction::Enemy);
        let far = scene.spawn(3, 400.0, 0.0, Faction::Enemy);

        let first = scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1000.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(first.nearest_enemy, Some(near));

        scene.actors.remove(near);
        scene.perception.perform_tick(&scene.actors);

        let second = scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 1000.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(second.nearest_enemy, Some(far));
        assert_eq!(second.detected_enemies, vec![far]);
        assert_eq!(scene.perception.stats().actual_queries, 2);
    }

    #[test]
    fn test_normal_queue_drains_fifo_under_cap() {
        let mut scene = Scene::new();
        scene.spawn(1000, 200.0, 0.0, Faction::Enemy);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..40 {
            let querier = scene.spawn(i, 0.0, 0.0, Faction::Player);
            let order = Arc::clone(&order);
            let accepted = scene.perception.query_nearest_enemy_async(
                querier,
                Vec3::ZERO,
                500.0,
                Faction::Player,
                QueryPriority::Normal,
                Box::new(move |who: Entity, result: &PerceptionResult| {
                    assert!(result.has_enemy());
                    order.lock().unwrap().push(who.index());
                }),
                &scene.actors,
            );
            assert!(accepted);
        }
        assert_eq!(scene.perception.pending_count(QueryPriority::Normal), 40);

        scene.perception.perform_tick(&scene.actors);

        assert_eq!(scene.perception.pending_count(QueryPriority::Normal), 10);
        assert_eq!(*order.lock().unwrap(), (0..30).collect::<Vec<u32>>());

        scene.perception.perform_tick(&scene.actors);
        assert_eq!(scene.perception.total_pending(), 0);
        assert_eq!(order.lock().unwrap().len(), 40);
    }

    #[test]
    fn test_high_drains_before_low() {
        let mut scene = Scene::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let low = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let high = scene.spawn(2, 5000.0, 0.0, Faction::Player);

        for (querier, priority, x) in [(low, QueryPriority::Low, 0.0), (high, QueryPriority::High, 5000.0)] {
            let order = Arc::clone(&order);
            scene.perception.query_nearest_enemy_async(
                querier,
                Vec3::new(x, 0.0, 0.0),
                100.0,
                Faction::Player,
                priority,
                Box::new(move |who: Entity, _: &PerceptionResult| order.lock().unwrap().push(who)),
                &scene.actors,
            );
        }

        scene.perception.perform_tick(&scene.actors);
        assert_eq!(*order.lock().unwrap(), vec![high, low]);
    }

    #[test]
    fn test_dead_queued_querier_is_dropped() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);

        scene.perception.query_nearest_enemy_async(
            me,
            Vec3::ZERO,
            100.0,
            Faction::Player,
            QueryPriority::Low,
            Box::new(move |_: Entity, _: &PerceptionResult| *flag.lock().unwrap() = true),
            &scene.actors,
        );
        scene.actors.remove(me);
        scene.perception.perform_tick(&scene.actors);

        assert!(!*called.lock().unwrap());
        assert_eq!(scene.perception.stats().dropped_queries, 1);
    }

    #[test]
    fn test_high_priority_merges_with_pending_query() {
        let mut scene = Scene::new();
        let a = scene.spawn(1, 10.0, 10.0, Faction::Player);
        let b = scene.spawn(2, 20.0, 20.0, Faction::Player);
        scene.spawn(3, 200.0, 0.0, Faction::Enemy);

        let queued = scene
            .perception
            .query_nearest_enemy_with_priority(
                a,
                Vec3::new(10.0, 10.0, 0.0),
                500.0,
                Faction::Player,
                QueryPriority::Normal,
                &scene.actors,
            )
            .unwrap();
        assert!(!queued.is_valid);

        scene
            .perception
            .query_nearest_enemy_async(
                a,
                Vec3::new(10.0, 10.0, 0.0),
                500.0,
                Faction::Player,
                QueryPriority::Normal,
                Box::new(|_: Entity, _: &PerceptionResult| {}),
                &scene.actors,
            );

        let merged = scene
            .perception
            .query_nearest_enemy(b, Vec3::new(20.0, 20.0, 0.0), 550.0, Faction::Player, &scene.actors)
            .unwrap();
        assert!(!merged.is_valid);
        assert_eq!(scene.perception.stats().merged_queries, 1);
        assert_eq!(scene.perception.stats().actual_queries, 0);

        // a new frame forgets the pending list
        scene.perception.perform_tick(&scene.actors);
        scene.perception.tick(0.2, &scene.actors);
        scene
            .perception
            .query_nearest_enemy(b, Vec3::new(20.0, 20.0, 0.0), 1500.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(scene.perception.stats().merged_queries, 1);
    }

    #[test]
    fn test_batch_executes_once_per_cell_and_faction() {
        let mut scene = Scene::new();
        let mut queries = Vec::new();
        for i in 0..4 {
            let x = 50.0 + i as f32 * 20.0;
            let q = scene.spawn(i, x, 50.0, Faction::Player);
            queries.push(BatchQuery {
                querier: q,
                location: Vec3::new(x, 50.0, 0.0),
                radius: 300.0,
                faction: Faction::Player,
            });
        }
        let enemy_querier = scene.spawn(10, 450.0, 450.0, Faction::Enemy);
        queries.push(BatchQuery {
            querier: enemy_querier,
            location: Vec3::new(450.0, 450.0, 0.0),
            radius: 300.0,
            faction: Faction::Enemy,
        });
        queries.push(BatchQuery {
            querier: entity(77),
            location: Vec3::ZERO,
            radius: 300.0,
            faction: Faction::Player,
        });
        let foe = scene.spawn(20, 150.0, 50.0, Faction::Enemy);

        let results = scene.perception.query_enemies_batch(&queries, &scene.actors);
        assert_eq!(results.len(), 6);
        assert_eq!(scene.perception.stats().actual_queries, 2);
        for result in &results[..4] {
            assert_eq!(result.nearest_enemy, Some(foe));
        }
        assert!(results[4].detected_enemies.len() >= 4);
        assert!(!results[5].is_valid);
    }

    #[test]
    fn test_hotspot_prewarms_l3() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 1200.0, 0.0, Faction::Player);
        let foe = scene.spawn(2, 900.0, 0.0, Faction::Enemy);
        scene.perception.mark_hotspot(Vec3::new(1000.0, 0.0, 0.0), 800.0);

        scene.perception.perform_tick(&scene.actors);
        assert_eq!(scene.perception.stats().hotspot_refreshes, 2);

        let executed = scene.perception.stats().actual_queries;
        let result = scene
            .perception
            .query_nearest_enemy(me, Vec3::new(1200.0, 0.0, 0.0), 400.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(result.nearest_enemy, Some(foe));
        assert_eq!(scene.perception.stats().l3_hits, 1);
        assert_eq!(scene.perception.stats().actual_queries, executed);
    }

    #[test]
    fn test_cleanup_purges_cache_and_dead_actors() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let foe = scene.spawn(2, 100.0, 0.0, Faction::Enemy);
        scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 500.0, Faction::Player, &scene.actors);
        assert!(!scene.perception.cache().is_empty());

        scene.actors.remove(foe);
        scene.perception.tick(1.1, &scene.actors);

        assert!(scene.perception.cache().is_empty());
        assert!(!scene.perception.is_registered(foe));
        assert_eq!(scene.perception.registered_actor_count(), 1);
    }

    #[test]
    fn test_actor_relocation_follows_position() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        let foe = scene.spawn(2, 4000.0, 0.0, Faction::Enemy);

        scene.actors.set_position(foe, Vec3::new(100.0, 0.0, 0.0));
        scene.perception.update_actor_location(foe, &scene.actors);

        let result = scene
            .perception
            .query_nearest_enemy_immediate(me, Vec3::ZERO, 200.0, Faction::Player, &scene.actors)
            .unwrap();
        assert_eq!(result.nearest_enemy, Some(foe));
    }

    #[test]
    fn test_grid_query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut scene = Scene::new();
        for i in 0..300 {
            let faction = Faction::ALL[rng.random_range(0..Faction::ALL.len())];
            let x = rng.random_range(-3000.0..3000.0);
            let y = rng.random_range(-3000.0..3000.0);
            scene.spawn(i, x, y, faction);
        }

        for _ in 0..50 {
            let location = Vec3::new(
                rng.random_range(-3000.0..3000.0),
                rng.random_range(-3000.0..3000.0),
                0.0,
            );
            let radius = rng.random_range(50.0..1500.0);
            let faction = Faction::ALL[rng.random_range(0..Faction::ALL.len())];

            let grid = scene
                .perception
                .execute_optimized_query(location, radius, faction, None, &scene.actors);
            let brute = scene
                .perception
                .query_nearest_enemy_by_faction(location, radius, faction, None, &scene.actors);

            let mut a = grid.detected_enemies.clone();
            let mut b = brute.detected_enemies.clone();
            a.sort();
            b.sort();
            assert_eq!(a, b);
            assert!((grid.distance_to_nearest - brute.distance_to_nearest).abs() < 1e-3);
        }
    }

    #[test]
    fn test_report_and_reset() {
        let mut scene = Scene::new();
        let me = scene.spawn(1, 0.0, 0.0, Faction::Player);
        scene
            .perception
            .query_nearest_enemy(me, Vec3::ZERO, 100.0, Faction::Player, &scene.actors);

        assert!(scene.perception.performance_report().contains("1 queries"));
        scene.perception.reset_stats();
        assert_eq!(scene.perception.stats(), PerceptionStats::default());
    }
}
