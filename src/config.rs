//! Simulation configuration.
//!
//! All tunables live in one serde-friendly resource so a client can load them
//! from JSON. [`SimConfig::validate`] is the only place configuration errors are
//! raised; every runtime operation assumes a validated config.

use bevy_ecs::prelude::*;
use glam::Vec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::components::Faction;

/// Smallest accepted flow-field update interval (roughly one 60 Hz frame).
pub const MIN_UPDATE_INTERVAL: f32 = 0.016;

/// Errors raised while building or loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Global simulation configuration resource.
#[derive(Resource, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Fixed timestep in seconds (1/60 = 60 Hz).
    pub fixed_timestep: f32,
    pub flow_field: FlowFieldConfig,
    pub obstacle_scan: ObstacleScanConfig,
    pub perception: PerceptionConfig,
    /// Defaults for newly spawned steering agents.
    pub steering: SteeringConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1.0 / 60.0,
            flow_field: FlowFieldConfig::default(),
            obstacle_scan: ObstacleScanConfig::default(),
            perception: PerceptionConfig::default(),
            steering: SteeringConfig::default(),
        }
    }
}

impl SimConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_timestep > 0.0) {
            return Err(ConfigError::InvalidConfig("fixed_timestep must be positive"));
        }
        self.flow_field.validate()?;
        self.obstacle_scan.validate()?;
        self.perception.validate()?;
        self.steering.validate()
    }
}

/// Extent and cadence of the per-leader flow fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowFieldConfig {
    /// World-space corner of the field.
    pub origin: Vec2,
    /// World-space extent of the field.
    pub size: Vec2,
    pub cell_size: f32,
    /// Seconds between full field regenerations.
    pub update_interval: f32,
    /// Seconds between obstacle scans; zero disables periodic scanning.
    pub obstacle_scan_interval: f32,
}

impl Default for FlowFieldConfig {
    fn default() -> Self {
        Self {
            origin: Vec2::new(-5000.0, -5000.0),
            size: Vec2::new(10000.0, 10000.0),
            cell_size: 100.0,
            update_interval: 0.1,
            obstacle_scan_interval: 0.5,
        }
    }
}

impl FlowFieldConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size > 0.0) {
            return Err(ConfigError::InvalidConfig("flow_field.cell_size must be positive"));
        }
        if !(self.size.x > 0.0 && self.size.y > 0.0) {
            return Err(ConfigError::InvalidConfig("flow_field.size must be positive"));
        }
        if !(self.update_interval > 0.0) {
            return Err(ConfigError::InvalidConfig(
                "flow_field.update_interval must be positive",
            ));
        }
        if self.obstacle_scan_interval < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "flow_field.obstacle_scan_interval must be non-negative",
            ));
        }
        Ok(())
    }
}

/// How static geometry is sampled into blocked flow-field cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstacleScanConfig {
    /// Probe box half-extent as a fraction of the cell size.
    pub detection_radius_scale: f32,
    /// Chebyshev dilation applied to every detected cell.
    pub expansion_cells: i32,
    /// Obstacles smaller than this across are ignored.
    pub min_obstacle_size: f32,
}

impl Default for ObstacleScanConfig {
    fn default() -> Self {
        Self {
            detection_radius_scale: 0.6,
            expansion_cells: 1,
            min_obstacle_size: 10.0,
        }
    }
}

impl ObstacleScanConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.detection_radius_scale > 0.0) {
            return Err(ConfigError::InvalidConfig(
                "obstacle_scan.detection_radius_scale must be positive",
            ));
        }
        if self.expansion_cells < 0 {
            return Err(ConfigError::InvalidConfig(
                "obstacle_scan.expansion_cells must be non-negative",
            ));
        }
        if self.min_obstacle_size < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "obstacle_scan.min_obstacle_size must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Perception cache tiers, queue caps and maintenance cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    pub cell_size: f32,
    pub l1_ttl: f32,
    pub l2_ttl: f32,
    pub l3_ttl: f32,
    /// An L2 entry only answers queries whose radius is at most `radius / ratio`.
    pub l2_min_radius_ratio: f32,
    pub max_high_queries_per_frame: usize,
    pub max_normal_queries_per_frame: usize,
    pub max_low_queries_per_frame: usize,
    /// Largest radius difference for two high-priority queries to merge.
    pub merge_distance_threshold: f32,
    pub tick_interval: f32,
    pub hotspot_update_interval: f32,
    pub cache_cleanup_interval: f32,
    /// Factions prewarmed in every hotspot.
    pub hotspot_factions: Vec<Faction>,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            cell_size: 500.0,
            l1_ttl: 0.15,
            l2_ttl: 0.3,
            l3_ttl: 0.5,
            l2_min_radius_ratio: 0.8,
            max_high_queries_per_frame: 20,
            max_normal_queries_per_frame: 30,
            max_low_queries_per_frame: 10,
            merge_distance_threshold: 100.0,
            tick_interval: 1.0 / 60.0,
            hotspot_update_interval: 0.5,
            cache_cleanup_interval: 1.0,
            hotspot_factions: vec![Faction::Player, Faction::Enemy],
        }
    }
}

impl PerceptionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size > 0.0) {
            return Err(ConfigError::InvalidConfig("perception.cell_size must be positive"));
        }
        if !(self.l1_ttl > 0.0 && self.l2_ttl > 0.0 && self.l3_ttl > 0.0) {
            return Err(ConfigError::InvalidConfig("perception cache TTLs must be positive"));
        }
        if !(self.l2_min_radius_ratio > 0.0 && self.l2_min_radius_ratio <= 1.0) {
            return Err(ConfigError::InvalidConfig(
                "perception.l2_min_radius_ratio must be in (0, 1]",
            ));
        }
        if !(self.tick_interval > 0.0) {
            return Err(ConfigError::InvalidConfig(
                "perception.tick_interval must be positive",
            ));
        }
        if self.merge_distance_threshold < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "perception.merge_distance_threshold must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Per-agent steering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    pub max_speed: f32,
    pub max_steering_force: f32,
    pub mass: f32,
    /// Distance at which `arrive` starts slowing down.
    pub arrival_slowing_distance: f32,

    pub separation_radius: f32,
    pub alignment_radius: f32,
    pub cohesion_radius: f32,
    pub separation_weight: f32,
    pub alignment_weight: f32,
    pub cohesion_weight: f32,

    pub flow_field_weight: f32,
    pub obstacle_avoidance_weight: f32,
    pub obstacle_detection_distance: f32,
    pub attack_seek_weight: f32,

    /// Seconds between neighbour list refreshes.
    pub neighbor_query_interval: f32,
    /// Yaw interpolation speed toward the velocity heading.
    pub yaw_interp_speed: f32,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            max_speed: 400.0,
            max_steering_force: 200.0,
            mass: 1.0,
            arrival_slowing_distance: 200.0,
            separation_radius: 100.0,
            alignment_radius: 150.0,
            cohesion_radius: 200.0,
            separation_weight: 1.5,
            alignment_weight: 1.0,
            cohesion_weight: 1.0,
            flow_field_weight: 2.0,
            obstacle_avoidance_weight: 3.0,
            obstacle_detection_distance: 150.0,
            attack_seek_weight: 2.0,
            neighbor_query_interval: 0.1,
            yaw_interp_speed: 5.0,
        }
    }
}

impl SteeringConfig {
    /// Largest of the three flocking radii.
    pub fn max_neighbor_radius(&self) -> f32 {
        self.separation_radius
            .max(self.alignment_radius)
            .max(self.cohesion_radius)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.mass > 0.0) {
            return Err(ConfigError::InvalidConfig("steering.mass must be positive"));
        }
        if self.max_speed < 0.0 || self.max_steering_force < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "steering speed and force limits must be non-negative",
            ));
        }
        let weights = [
            self.separation_weight,
            self.alignment_weight,
            self.cohesion_weight,
            self.flow_field_weight,
            self.obstacle_avoidance_weight,
            self.attack_seek_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::InvalidConfig("steering weights must be non-negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = SimConfig::from_json_str(r#"{ "flow_field": { "cell_size": 50.0 } }"#)
            .expect("config should parse");
        assert_eq!(config.flow_field.cell_size, 50.0);
        assert_eq!(config.flow_field.update_interval, 0.1);
        assert_eq!(config.perception.max_normal_queries_per_frame, 30);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = SimConfig::default();
        config.steering.mass = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let err = SimConfig::from_json_str(r#"{ "perception": { "l1_ttl": -1.0 } }"#);
        assert!(matches!(err, Err(ConfigError::InvalidConfig(_))));

        let err = SimConfig::from_json_str("not json");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_round_trips_through_json() {
        let json = SimConfig::default().to_json().unwrap();
        let parsed = SimConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.steering, SteeringConfig::default());
    }
}
