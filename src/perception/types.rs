//! Perception value types.

use bevy_ecs::prelude::*;
use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::actors::ActorView;
use crate::components::Faction;

/// Outcome of a nearest-enemy query.
///
/// Results are value snapshots: entity handles inside may die afterwards, so
/// consumers go through [`PerceptionResult::cleaned`] before trusting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionResult {
    pub is_valid: bool,
    pub nearest_enemy: Option<Entity>,
    pub distance_to_nearest: f32,
    pub detected_enemies: Vec<Entity>,
    /// Perception clock time the result was produced at.
    pub result_time: f64,
}

impl Default for PerceptionResult {
    fn default() -> Self {
        Self {
            is_valid: false,
            nearest_enemy: None,
            distance_to_nearest: f32::MAX,
            detected_enemies: Vec::new(),
            result_time: 0.0,
        }
    }
}

impl PerceptionResult {
    /// An invalid placeholder stamped at `time`.
    pub fn empty(time: f64) -> Self {
        Self {
            result_time: time,
            ..Default::default()
        }
    }

    pub fn has_enemy(&self) -> bool {
        self.is_valid && self.nearest_enemy.is_some()
    }

    /// Copy with dead enemies pruned.
    ///
    /// A dead nearest enemy invalidates the whole result, so caches reject it
    /// instead of answering "no enemy" from stale data.
    pub fn cleaned(&self, actors: &impl ActorView) -> Self {
        let mut result = self.clone();
        result.detected_enemies.retain(|&e| actors.is_alive(e));
        if let Some(nearest) = result.nearest_enemy {
            if !actors.is_alive(nearest) {
                result.nearest_enemy = None;
                result.distance_to_nearest = f32::MAX;
                result.is_valid = false;
            }
        }
        result
    }
}

/// Scheduling class of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryPriority {
    /// Execute now, skipping the queues.
    Immediate,
    /// Merge with a similar query this frame, otherwise execute now.
    High,
    /// Queue; answer later.
    #[default]
    Normal,
    /// Queue behind everything else.
    Low,
}

/// One entry of a batched query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchQuery {
    pub querier: Entity,
    pub location: Vec3,
    pub radius: f32,
    pub faction: Faction,
}

/// Delivered when a deferred query finally executes.
pub type QueryCallback = Box<dyn FnOnce(Entity, &PerceptionResult) + Send + Sync>;

pub(crate) struct PendingQuery {
    pub querier: Entity,
    pub location: Vec3,
    pub radius: f32,
    pub faction: Faction,
    pub callback: Option<QueryCallback>,
}

/// A query seen this frame, used for merging.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameQuery {
    pub cell: IVec3,
    pub faction: Faction,
    pub radius: f32,
}

/// A region marked as combat-dense.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub center: Vec3,
    pub radius: f32,
}

impl Hotspot {
    pub fn contains(&self, location: Vec3) -> bool {
        self.center.distance_squared(location) <= self.radius * self.radius
    }
}

/// Query counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerceptionStats {
    pub total_queries: u64,
    /// Brute-force executions, including batch groups.
    pub actual_queries: u64,
    pub merged_queries: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub hotspot_refreshes: u64,
    /// Deferred queries dropped because their querier died.
    pub dropped_queries: u64,
}

impl PerceptionStats {
    pub fn cache_hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }

    /// Fraction of queries answered from any cache tier.
    pub fn cache_hit_rate(&self) -> f32 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.cache_hits() as f32 / self.total_queries as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{ActorSnapshot, ActorState};

    #[test]
    fn test_cleaned_prunes_dead_enemies() {
        let (a, b) = (Entity::from_raw(1), Entity::from_raw(2));
        let mut actors = ActorSnapshot::new();
        actors.insert(a, ActorState::at(Vec3::ZERO, Faction::Enemy));

        let result = PerceptionResult {
            is_valid: true,
            nearest_enemy: Some(a),
            distance_to_nearest: 5.0,
            detected_enemies: vec![a, b],
            result_time: 1.0,
        };
        let cleaned = result.cleaned(&actors);
        assert!(cleaned.has_enemy());
        assert_eq!(cleaned.detected_enemies, vec![a]);

        actors.remove(a);
        let cleaned = result.cleaned(&actors);
        assert!(!cleaned.is_valid);
        assert_eq!(cleaned.nearest_enemy, None);
        assert!(cleaned.detected_enemies.is_empty());
    }

    #[test]
    fn test_hit_rate() {
        let stats = PerceptionStats {
            total_queries: 8,
            l1_hits: 3,
            l3_hits: 1,
            ..Default::default()
        };
        assert!((stats.cache_hit_rate() - 0.5).abs() < 1e-6);
        assert_eq!(PerceptionStats::default().cache_hit_rate(), 0.0);
    }
}
