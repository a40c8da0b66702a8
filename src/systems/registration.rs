//! Keeps the navigation subsystems' membership in step with the ECS world.
//!
//! Newly spawned leaders get a flow field and a perception slot, new soldiers
//! join the shared grid and perception. Despawned or demoted entities are
//! unregistered. Entities that die in place are left registered; every lookup
//! checks liveness anyway.

use bevy_ecs::prelude::*;
use tracing::debug;

use crate::actors::ActorSnapshot;
use crate::components::{Faction, Leader, Soldier};
use crate::perception::PerceptionSubsystem;
use crate::systems::flow_fields::FlowFieldSubsystem;

pub fn registration_system(
    snapshot: Res<ActorSnapshot>,
    mut flow: ResMut<FlowFieldSubsystem>,
    mut perception: ResMut<PerceptionSubsystem>,
    new_leaders: Query<(Entity, Option<&Faction>), Added<Leader>>,
    new_soldiers: Query<(Entity, Option<&Faction>), Added<Soldier>>,
    mut removed_leaders: RemovedComponents<Leader>,
    mut removed_soldiers: RemovedComponents<Soldier>,
) {
    for leader in removed_leaders.read() {
        flow.unregister_leader(leader);
        perception.unregister_actor(leader);
    }
    for soldier in removed_soldiers.read() {
        flow.unregister_soldier(soldier);
        perception.unregister_actor(soldier);
    }

    for (leader, faction) in new_leaders.iter() {
        let faction = faction.copied().unwrap_or_default();
        if flow.register_leader(leader, &*snapshot) {
            perception.register_actor(leader, faction, &*snapshot);
        } else {
            debug!(?leader, "leader not registered");
        }
    }
    for (soldier, faction) in new_soldiers.iter() {
        let faction = faction.copied().unwrap_or_default();
        if flow.register_soldier(soldier, &*snapshot) {
            perception.register_actor(soldier, faction, &*snapshot);
        }
    }
}
