//! Serializable views of the navigation state.
//!
//! A [`Snapshot`] is what a client renders: every living agent with its role,
//! the obstacle set, and perception counters.

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

use crate::collision::CircleObstacles;
use crate::components::*;
use crate::perception::{PerceptionStats, PerceptionSubsystem};
use crate::systems::{FlowFieldSubsystem, SteeringAgent};

/// State of one agent for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// `Entity::to_bits`, stable for the entity's lifetime.
    pub id: u64,
    pub role: String,
    pub faction: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub yaw: f32,
    /// Leader this agent follows, if any.
    pub follows: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleSnapshot {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

/// Complete navigation state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current simulation tick.
    pub tick: u64,
    /// Elapsed simulation time in seconds.
    pub time: f32,
    pub agents: Vec<AgentSnapshot>,
    pub obstacles: Vec<ObstacleSnapshot>,
    pub leader_count: usize,
    pub soldier_count: usize,
    /// Flow field cells currently blocked by scanned geometry.
    pub blocked_cells: usize,
    pub perception: PerceptionStats,
}

impl Snapshot {
    /// Create a snapshot from the ECS world.
    pub fn from_world(world: &mut World, tick: u64, time: f32) -> Self {
        let mut agents = Vec::new();

        let mut query = world.query::<(
            Entity,
            &Position,
            Option<&Faction>,
            Option<&Heading>,
            Option<&Health>,
            Option<&SteeringAgent>,
            Has<Leader>,
        )>();

        for (entity, pos, faction, heading, health, steering, is_leader) in query.iter(world) {
            if health.is_some_and(|h| !h.is_alive()) {
                continue;
            }

            let faction_str = match faction.copied().unwrap_or_default() {
                Faction::Player => "Player",
                Faction::Enemy => "Enemy",
                Faction::Ally => "Ally",
                Faction::Neutral => "Neutral",
            };
            let role = if is_leader {
                "Leader"
            } else if steering.is_some() {
                "Soldier"
            } else {
                "Actor"
            };
            let velocity = steering.map(|s| s.velocity()).unwrap_or_default();

            agents.push(AgentSnapshot {
                id: entity.to_bits(),
                role: role.to_string(),
                faction: faction_str.to_string(),
                x: pos.0.x,
                y: pos.0.y,
                z: pos.0.z,
                vx: velocity.x,
                vy: velocity.y,
                yaw: heading.map(|h| h.yaw).unwrap_or(0.0),
                follows: steering.and_then(|s| s.follow_target()).map(Entity::to_bits),
            });
        }
        agents.sort_by_key(|a| a.id);

        let obstacles = world
            .get_resource::<CircleObstacles>()
            .map(|o| {
                o.iter()
                    .map(|c| ObstacleSnapshot {
                        x: c.center.x,
                        y: c.center.y,
                        radius: c.radius,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (leader_count, soldier_count, blocked_cells) = world
            .get_resource::<FlowFieldSubsystem>()
            .map(|f| (f.leader_count(), f.soldier_count(), f.blocked_cell_count()))
            .unwrap_or_default();

        let perception = world
            .get_resource::<PerceptionSubsystem>()
            .map(|p| p.stats())
            .unwrap_or_default();

        Self {
            tick,
            time,
            agents,
            obstacles,
            leader_count,
            soldier_count,
            blocked_cells,
            perception,
        }
    }

    /// Serialize snapshot to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize snapshot to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
