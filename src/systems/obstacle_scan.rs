//! Obstacle scanning.
//!
//! Probes static collision geometry at every flow-field cell and feeds the hits
//! into the flow field subsystem as blocked cells. Detected cells are dilated so
//! agents keep a margin around geometry.

use std::collections::HashSet;

use bevy_ecs::prelude::*;
use glam::{IVec2, Vec2};
use tracing::info;

use crate::collision::{CircleObstacles, CollisionWorld};
use crate::config::{ObstacleScanConfig, SimConfig};
use crate::systems::flow_fields::FlowFieldSubsystem;
use crate::systems::DeltaTime;

#[derive(Resource, Debug, Clone)]
pub struct ObstacleScanner {
    config: ObstacleScanConfig,
    /// Seconds between periodic scans; zero scans only once and on request.
    interval: f32,
    time_since_scan: f32,
    has_scanned: bool,
    scan_requested: bool,
}

impl Default for ObstacleScanner {
    fn default() -> Self {
        Self::new(ObstacleScanConfig::default(), 0.5)
    }
}

impl ObstacleScanner {
    pub fn new(config: ObstacleScanConfig, interval: f32) -> Self {
        Self {
            config,
            interval: interval.max(0.0),
            time_since_scan: 0.0,
            has_scanned: false,
            scan_requested: false,
        }
    }

    pub fn from_config(config: &SimConfig) -> Self {
        Self::new(
            config.obstacle_scan.clone(),
            config.flow_field.obstacle_scan_interval,
        )
    }

    /// Schedule a scan on the next tick regardless of the interval.
    pub fn request_scan(&mut self) {
        self.scan_requested = true;
    }

    /// Cells whose test box overlaps geometry, before dilation.
    pub fn detect_cells(
        &self,
        subsystem: &FlowFieldSubsystem,
        collision: &impl CollisionWorld,
    ) -> Vec<IVec2> {
        let dims = subsystem.field_dimensions();
        let origin = subsystem.field_origin();
        let cell_size = subsystem.field_cell_size();
        let half_extent = cell_size * self.config.detection_radius_scale;

        let mut detected = Vec::new();
        for y in 0..dims.y {
            for x in 0..dims.x {
                let center = origin + (Vec2::new(x as f32, y as f32) + Vec2::splat(0.5)) * cell_size;
                if collision.overlaps_box(center.extend(0.0), half_extent, self.config.min_obstacle_size) {
                    detected.push(IVec2::new(x, y));
                }
            }
        }
        detected
    }

    /// Grow `cells` by the configured Chebyshev margin, clipped to the field.
    pub fn expand_cells(&self, cells: &[IVec2], dims: IVec2) -> HashSet<IVec2> {
        let e = self.config.expansion_cells;
        let mut expanded = HashSet::new();
        for cell in cells {
            for dy in -e..=e {
                for dx in -e..=e {
                    let c = *cell + IVec2::new(dx, dy);
                    if c.x >= 0 && c.y >= 0 && c.x < dims.x && c.y < dims.y {
                        expanded.insert(c);
                    }
                }
            }
        }
        expanded
    }

    /// Replace the subsystem's blocked cells with a fresh scan.
    ///
    /// Returns the number of cells blocked.
    pub fn scan(
        &mut self,
        subsystem: &mut FlowFieldSubsystem,
        collision: &impl CollisionWorld,
    ) -> usize {
        self.has_scanned = true;
        self.scan_requested = false;
        self.time_since_scan = 0.0;

        if !subsystem.is_initialized() {
            return 0;
        }

        let detected = self.detect_cells(subsystem, collision);
        let blocked = self.expand_cells(&detected, subsystem.field_dimensions());

        subsystem.clear_blocked_cells();
        for cell in &blocked {
            subsystem.mark_cell_as_blocked(cell.x, cell.y);
        }

        info!(
            detected = detected.len(),
            blocked = blocked.len(),
            "obstacle scan complete"
        );
        blocked.len()
    }

    /// Scan if one is due. The first tick always scans.
    pub fn tick(
        &mut self,
        dt: f32,
        subsystem: &mut FlowFieldSubsystem,
        collision: &impl CollisionWorld,
    ) -> Option<usize> {
        self.time_since_scan += dt;
        let periodic_due = self.interval > 0.0 && self.time_since_scan >= self.interval;
        if self.has_scanned && !self.scan_requested && !periodic_due {
            return None;
        }
        Some(self.scan(subsystem, collision))
    }
}

/// System that rescans [`CircleObstacles`] into the flow fields.
pub fn obstacle_scan_system(
    mut scanner: ResMut<ObstacleScanner>,
    mut subsystem: ResMut<FlowFieldSubsystem>,
    obstacles: Option<Res<CircleObstacles>>,
    dt: Res<DeltaTime>,
) {
    let Some(obstacles) = obstacles else {
        return;
    };
    scanner.tick(dt.0, &mut subsystem, &*obstacles);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{ActorSnapshot, ActorState};
    use crate::components::Faction;
    use glam::Vec3;

    fn setup() -> (FlowFieldSubsystem, ActorSnapshot, Entity) {
        let mut actors = ActorSnapshot::new();
        let leader = Entity::from_raw(1);
        actors.insert(leader, ActorState::at(Vec3::new(950.0, 50.0, 0.0), Faction::Player));

        let mut subsystem = FlowFieldSubsystem::new(0.1);
        subsystem.initialize_flow_field(Vec2::ZERO, Vec2::new(1000.0, 1000.0), 100.0);
        subsystem.register_leader(leader, &actors);
        (subsystem, actors, leader)
    }

    #[test]
    fn test_scan_blocks_and_dilates() {
        let (mut subsystem, _, leader) = setup();
        let mut obstacles = CircleObstacles::new();
        obstacles.add(Vec3::new(550.0, 550.0, 0.0), 20.0);

        let mut scanner = ObstacleScanner::new(
            ObstacleScanConfig {
                detection_radius_scale: 0.4,
                expansion_cells: 1,
                min_obstacle_size: 10.0,
            },
            0.0,
        );

        let detected = scanner.detect_cells(&subsystem, &obstacles);
        assert_eq!(detected, vec![IVec2::new(5, 5)]);

        let blocked = scanner.scan(&mut subsystem, &obstacles);
        assert_eq!(blocked, 9);
        let field = subsystem.flow_field_for_leader(leader).unwrap();
        assert!(field.is_cell_blocked(4, 4));
        assert!(field.is_cell_blocked(6, 6));
        assert!(!field.is_cell_blocked(7, 5));
    }

    #[test]
    fn test_small_obstacles_are_ignored() {
        let (mut subsystem, _, _) = setup();
        let mut obstacles = CircleObstacles::new();
        obstacles.add(Vec3::new(550.0, 550.0, 0.0), 2.0);

        let mut scanner = ObstacleScanner::default();
        assert_eq!(scanner.scan(&mut subsystem, &obstacles), 0);
    }

    #[test]
    fn test_dilation_clips_to_field() {
        let scanner = ObstacleScanner::default();
        let expanded = scanner.expand_cells(&[IVec2::new(0, 0)], IVec2::new(10, 10));
        assert_eq!(expanded.len(), 4);
    }

    #[test]
    fn test_rescan_replaces_previous_cells() {
        let (mut subsystem, _, leader) = setup();
        let mut obstacles = CircleObstacles::new();
        obstacles.add(Vec3::new(250.0, 250.0, 0.0), 20.0);

        let mut scanner = ObstacleScanner::new(ObstacleScanConfig::default(), 0.5);
        assert!(scanner.tick(0.01, &mut subsystem, &obstacles).is_some());
        assert!(subsystem.flow_field_for_leader(leader).unwrap().is_cell_blocked(2, 2));

        obstacles.clear();
        obstacles.add(Vec3::new(750.0, 750.0, 0.0), 20.0);
        assert!(scanner.tick(0.1, &mut subsystem, &obstacles).is_none());
        assert!(scanner.tick(0.45, &mut subsystem, &obstacles).is_some());

        let field = subsystem.flow_field_for_leader(leader).unwrap();
        assert!(!field.is_cell_blocked(2, 2));
        assert!(field.is_cell_blocked(7, 7));
    }
}
