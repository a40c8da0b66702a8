//! Basic demonstration of the navigation core.
//!
//! Two squads advance toward each other around a rock. Soldiers follow their
//! leader's flow field while perception picks out the nearest enemy.
//!
//! Run with: RUST_LOG=army_nav=debug cargo run --example basic_demo

use army_nav::{Faction, QueryPriority, SimWorld};
use glam::Vec3;
use tracing_subscriber::EnvFilter;

const DT: f32 = 1.0 / 60.0;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("army_nav=info")))
        .init();

    println!("=== Army Nav - Navigation Demo ===\n");

    let mut sim = SimWorld::new();

    let blue = sim.spawn_leader(Faction::Player, Vec3::new(-1_500.0, 0.0, 0.0));
    let red = sim.spawn_leader(Faction::Enemy, Vec3::new(1_500.0, 0.0, 0.0));
    let mut blue_soldiers = Vec::new();
    for i in 0..12 {
        let row = (i / 4) as f32;
        let col = (i % 4) as f32;
        blue_soldiers.push(sim.spawn_soldier(
            Faction::Player,
            Vec3::new(-2_400.0 - row * 80.0, -150.0 + col * 100.0, 0.0),
            Some(blue),
        ));
        sim.spawn_soldier(
            Faction::Enemy,
            Vec3::new(2_400.0 + row * 80.0, -150.0 + col * 100.0, 0.0),
            Some(red),
        );
    }

    sim.add_obstacle(Vec3::new(-2_000.0, 0.0, 0.0), 150.0);
    sim.mark_hotspot(Vec3::ZERO, 1_000.0);

    // Leaders march toward the middle; their fields retarget as they go.
    for tick in 0..600 {
        let t = (tick + 1) as f32 * DT;
        sim.move_entity(blue, Vec3::new(-1_500.0 + t * 120.0, 0.0, 0.0));
        sim.move_entity(red, Vec3::new(1_500.0 - t * 120.0, 0.0, 0.0));
        sim.step(DT);

        if (tick + 1) % 120 == 0 {
            println!("--- Tick {} (t={:.1}s) ---", sim.current_tick(), sim.current_time());
            print_squad(&sim, &blue_soldiers);
        }
    }

    let scout = blue_soldiers[0];
    match sim.query_nearest_enemy_with_priority(scout, 3_000.0, QueryPriority::Immediate) {
        Some(result) if result.has_enemy() => println!(
            "\nScout sees {} enemies, nearest at {:.0} units",
            result.detected_enemies.len(),
            result.distance_to_nearest
        ),
        Some(_) => println!("\nScout sees no enemies"),
        None => println!("\nScout is gone"),
    }

    println!("{}", sim.performance_report());

    println!("\n=== Final State (JSON) ===\n");
    match sim.snapshot().to_json_pretty() {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("snapshot failed: {e}"),
    }
}

fn print_squad(sim: &SimWorld, soldiers: &[bevy_ecs::entity::Entity]) {
    let count = soldiers.len() as f32;
    let center = soldiers
        .iter()
        .filter_map(|&s| sim.position(s))
        .sum::<Vec3>()
        / count;
    let speed = soldiers
        .iter()
        .filter_map(|&s| sim.velocity(s))
        .map(|v| v.length())
        .sum::<f32>()
        / count;
    println!("  Blue squad centre=({:.0}, {:.0}) avg speed={:.0}", center.x, center.y, speed);
}
