//! Static collision geometry.
//!
//! Steering casts a single forward ray and the obstacle scanner tests boxes at
//! each flow-field cell. Both go through [`CollisionWorld`] so callers can plug in
//! their own geometry; [`CircleObstacles`] is the built-in implementation.

use bevy_ecs::prelude::*;
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Result of a successful raycast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Distance from the ray origin to the hit point.
    pub distance: f32,
    pub point: Vec3,
    /// Surface normal at the hit point.
    pub normal: Vec3,
}

pub trait CollisionWorld: Send + Sync {
    /// First hit along the segment `start..end`, if any.
    fn raycast(&self, start: Vec3, end: Vec3) -> Option<RayHit>;

    /// Whether an obstacle at least `min_size` across overlaps the axis-aligned
    /// square of `half_extent` around `center`.
    fn overlaps_box(&self, center: Vec3, half_extent: f32, min_size: f32) -> bool;
}

/// A static circular obstacle on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircleObstacle {
    pub center: Vec2,
    pub radius: f32,
}

/// Set of circular obstacles.
#[derive(Resource, Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircleObstacles {
    obstacles: Vec<CircleObstacle>,
}

impl CircleObstacles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, center: Vec3, radius: f32) {
        self.obstacles.push(CircleObstacle {
            center: center.truncate(),
            radius: radius.max(0.0),
        });
    }

    /// Remove every obstacle centred within `tolerance` of `center`.
    pub fn remove_near(&mut self, center: Vec3, tolerance: f32) -> usize {
        let before = self.obstacles.len();
        let c = center.truncate();
        self.obstacles
            .retain(|o| o.center.distance_squared(c) > tolerance * tolerance);
        before - self.obstacles.len()
    }

    pub fn clear(&mut self) {
        self.obstacles.clear();
    }

    pub fn len(&self) -> usize {
        self.obstacles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obstacles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CircleObstacle> {
        self.obstacles.iter()
    }
}

impl CollisionWorld for CircleObstacles {
    fn raycast(&self, start: Vec3, end: Vec3) -> Option<RayHit> {
        let origin = start.truncate();
        let segment = end.truncate() - origin;
        let length = segment.length();
        if length <= f32::EPSILON {
            return None;
        }
        let dir = segment / length;

        let mut best: Option<(f32, Vec2)> = None;
        for obstacle in &self.obstacles {
            let to_origin = origin - obstacle.center;
            let b = to_origin.dot(dir);
            let c = to_origin.length_squared() - obstacle.radius * obstacle.radius;

            // origin inside the circle counts as an immediate hit
            let t = if c <= 0.0 {
                0.0
            } else {
                let discriminant = b * b - c;
                if discriminant < 0.0 {
                    continue;
                }
                let t = -b - discriminant.sqrt();
                if t < 0.0 {
                    continue;
                }
                t
            };

            if t <= length && best.map_or(true, |(d, _)| t < d) {
                best = Some((t, obstacle.center));
            }
        }

        best.map(|(distance, center)| {
            let point = origin + dir * distance;
            let normal = (point - center).try_normalize().unwrap_or(-dir);
            RayHit {
                distance,
                point: point.extend(start.z),
                normal: normal.extend(0.0),
            }
        })
    }

    fn overlaps_box(&self, center: Vec3, half_extent: f32, min_size: f32) -> bool {
        let c = center.truncate();
        self.obstacles.iter().any(|o| {
            if o.radius * 2.0 < min_size {
                return false;
            }
            let closest = c + (o.center - c).clamp(Vec2::splat(-half_extent), Vec2::splat(half_extent));
            closest.distance_squared(o.center) <= o.radius * o.radius
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(center: Vec3, radius: f32) -> CircleObstacles {
        let mut obstacles = CircleObstacles::new();
        obstacles.add(center, radius);
        obstacles
    }

    #[test]
    fn test_raycast_hits_near_side() {
        let obstacles = single(Vec3::new(100.0, 0.0, 0.0), 20.0);
        let hit = obstacles
            .raycast(Vec3::ZERO, Vec3::new(150.0, 0.0, 0.0))
            .expect("ray should hit");
        assert!((hit.distance - 80.0).abs() < 1e-3);
        assert!((hit.normal - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-3);
    }

    #[test]
    fn test_raycast_misses_short_and_offset_rays() {
        let obstacles = single(Vec3::new(100.0, 0.0, 0.0), 20.0);
        assert!(obstacles.raycast(Vec3::ZERO, Vec3::new(50.0, 0.0, 0.0)).is_none());
        assert!(obstacles
            .raycast(Vec3::new(0.0, 50.0, 0.0), Vec3::new(200.0, 50.0, 0.0))
            .is_none());
        assert!(obstacles
            .raycast(Vec3::new(200.0, 0.0, 0.0), Vec3::new(300.0, 0.0, 0.0))
            .is_none());
    }

    #[test]
    fn test_box_overlap_respects_min_size() {
        let mut obstacles = single(Vec3::new(60.0, 0.0, 0.0), 15.0);
        assert!(obstacles.overlaps_box(Vec3::ZERO, 50.0, 10.0));
        assert!(!obstacles.overlaps_box(Vec3::ZERO, 40.0, 10.0));
        assert!(!obstacles.overlaps_box(Vec3::ZERO, 50.0, 40.0));

        assert_eq!(obstacles.remove_near(Vec3::new(61.0, 0.0, 0.0), 5.0), 1);
        assert!(obstacles.is_empty());
    }
}
