//! ECS systems for army navigation.
//!
//! ## Schedule order
//!
//! Every fixed update runs these systems in a strict chain:
//!
//! 1. `actor_snapshot_system` rebuilds the [`ActorSnapshot`](crate::actors::ActorSnapshot)
//! 2. `registration_system` registers newly spawned leaders and soldiers
//! 3. `spatial_grid_sync_system` moves agents between grid cells
//! 4. `flow_field_update_system` regenerates leader fields when due
//! 5. `obstacle_scan_system` rescans static geometry when due
//! 6. `perception_tick_system` drains deferred perception queries
//! 7. `steering_system` steers and moves agents
//!
//! Steering reads the snapshot taken in step 1, so the order agents are
//! visited in does not affect the outcome.

pub mod flow_fields;
pub mod obstacle_scan;
pub mod registration;
pub mod steering;

use bevy_ecs::prelude::*;

pub use flow_fields::{flow_field_update_system, spatial_grid_sync_system, FlowFieldSubsystem};
pub use obstacle_scan::{obstacle_scan_system, ObstacleScanner};
pub use registration::registration_system;
pub use steering::{steering_system, SteeringAgent, SteeringInputs};

/// Resource containing the delta time for the current tick.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct DeltaTime(pub f32);

/// Fixed-update counter.
#[derive(Resource, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimTick(pub u64);

impl SimTick {
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}
