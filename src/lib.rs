//! Army Nav - Navigation Core
//!
//! Large-army movement for a fixed-timestep ECS simulation. Leaders own flow
//! fields that soldiers follow with blended steering, and a cached perception
//! layer answers nearest-enemy queries for thousands of agents per frame.
//! Uses `bevy_ecs` for the entity-component-system architecture.

pub mod actors;
pub mod api;
pub mod collision;
pub mod components;
pub mod config;
pub mod debug;
pub mod flow_field;
pub mod perception;
pub mod spatial;
pub mod systems;
pub mod world;

pub use actors::{ActorSnapshot, ActorState, ActorView};
pub use api::SimWorld;
pub use collision::{CircleObstacles, CollisionWorld, RayHit};
pub use components::*;
pub use config::{ConfigError, SimConfig};
pub use debug::{DebugContext, DebugShape};
pub use flow_field::{FlowField, FlowFieldCell};
pub use perception::{
    BatchQuery, PerceptionResult, PerceptionStats, PerceptionSubsystem, QueryCallback,
    QueryPriority,
};
pub use spatial::SpatialHashGrid;
pub use systems::*;
pub use world::Snapshot;
