//! ECS Components for the army navigation core.
//!
//! Components are pure data containers attached to entities.
//! All navigation logic lives in the subsystems and the systems that drive them.

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::systems::steering::SteeringAgent;

// ============================================================================
// SPATIAL COMPONENTS
// ============================================================================

/// World position (x = east/west, y = north/south, z = height).
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position(pub Vec3);

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self(Vec3::new(x, y, z))
    }

    /// Position on the ground plane.
    pub fn flat(x: f32, y: f32) -> Self {
        Self(Vec3::new(x, y, 0.0))
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        self.0.distance(other.0)
    }
}

/// Facing of an entity around the vertical axis, in radians.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub yaw: f32,
}

impl Heading {
    pub fn forward(&self) -> Vec3 {
        Vec3::new(self.yaw.cos(), self.yaw.sin(), 0.0)
    }
}

// ============================================================================
// IDENTITY COMPONENTS
// ============================================================================

/// Side an entity fights for.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Faction {
    Player,
    Enemy,
    Ally,
    #[default]
    Neutral,
}

impl Faction {
    pub const ALL: [Faction; 4] = [Faction::Player, Faction::Enemy, Faction::Ally, Faction::Neutral];

    /// Whether `self` and `other` fight each other.
    ///
    /// Neutral is hostile to nobody, a faction is never hostile to itself, and the
    /// player/ally camp is hostile to the enemy camp in both directions.
    pub fn is_hostile_to(self, other: Faction) -> bool {
        if self == other || self == Faction::Neutral || other == Faction::Neutral {
            return false;
        }
        match self {
            Faction::Player | Faction::Ally => other == Faction::Enemy,
            Faction::Enemy => matches!(other, Faction::Player | Faction::Ally),
            Faction::Neutral => false,
        }
    }
}

/// Free-function form of [`Faction::is_hostile_to`].
#[inline]
pub fn are_factions_hostile(a: Faction, b: Faction) -> bool {
    a.is_hostile_to(b)
}

/// Marker for an army leader. Each leader owns one flow field.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Leader;

/// Marker for a recruited soldier.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Soldier;

// ============================================================================
// VITALITY
// ============================================================================

/// Health of a unit. A depleted unit is treated as gone by every query.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Health {
    pub current: f32,
    pub max: f32,
}

impl Health {
    pub fn new(max: f32) -> Self {
        Self { current: max, max }
    }

    pub fn fraction(&self) -> f32 {
        if self.max <= 0.0 {
            0.0
        } else {
            (self.current / self.max).clamp(0.0, 1.0)
        }
    }

    pub fn is_alive(&self) -> bool {
        self.current > 0.0
    }

    pub fn damage(&mut self, amount: f32) {
        self.current = (self.current - amount).max(0.0);
    }

    pub fn kill(&mut self) {
        self.current = 0.0;
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new(100.0)
    }
}

// ============================================================================
// BUNDLES
// ============================================================================

/// Bundle for spawning a leader.
#[derive(Bundle, Default)]
pub struct LeaderBundle {
    pub leader: Leader,
    pub faction: Faction,
    pub position: Position,
    pub heading: Heading,
    pub health: Health,
}

impl LeaderBundle {
    pub fn new(faction: Faction, position: Position) -> Self {
        Self {
            faction,
            position,
            ..Default::default()
        }
    }
}

/// Bundle for spawning a steered soldier.
#[derive(Bundle, Default)]
pub struct SoldierBundle {
    pub soldier: Soldier,
    pub faction: Faction,
    pub position: Position,
    pub heading: Heading,
    pub health: Health,
    pub steering: SteeringAgent,
}

impl SoldierBundle {
    pub fn new(faction: Faction, position: Position) -> Self {
        Self {
            faction,
            position,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostility_table() {
        assert!(Faction::Player.is_hostile_to(Faction::Enemy));
        assert!(Faction::Ally.is_hostile_to(Faction::Enemy));
        assert!(Faction::Enemy.is_hostile_to(Faction::Ally));
        assert!(!Faction::Player.is_hostile_to(Faction::Ally));
        assert!(!Faction::Enemy.is_hostile_to(Faction::Neutral));
    }

    #[test]
    fn test_hostility_is_symmetric_and_irreflexive() {
        for a in Faction::ALL {
            assert!(!are_factions_hostile(a, a));
            assert!(!are_factions_hostile(a, Faction::Neutral));
            for b in Faction::ALL {
                assert_eq!(are_factions_hostile(a, b), are_factions_hostile(b, a));
            }
        }
    }

    #[test]
    fn test_health_depletion() {
        let mut health = Health::new(50.0);
        health.damage(20.0);
        assert!(health.is_alive());
        assert!((health.fraction() - 0.6).abs() < 1e-6);
        health.damage(100.0);
        assert!(!health.is_alive());
        assert_eq!(health.current, 0.0);
    }
}
