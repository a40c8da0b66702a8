//! Debug drawing context.
//!
//! A single resource owns the debug toggle and collects shapes pushed by the
//! flow fields and the perception grid. Clients drain the shapes and render them
//! however they like.

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// A primitive queued for debug rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DebugShape {
    Arrow { from: Vec3, to: Vec3 },
    Box { center: Vec3, half_extent: f32 },
    Sphere { center: Vec3, radius: f32 },
}

#[derive(Resource, Debug, Clone, Default)]
pub struct DebugContext {
    /// Drawing is skipped entirely while false.
    pub enabled: bool,
    shapes: Vec<DebugShape>,
}

impl DebugContext {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            shapes: Vec::new(),
        }
    }

    pub fn push(&mut self, shape: DebugShape) {
        if self.enabled {
            self.shapes.push(shape);
        }
    }

    pub fn shapes(&self) -> &[DebugShape] {
        &self.shapes
    }

    /// Take every queued shape, leaving the context empty.
    pub fn drain(&mut self) -> Vec<DebugShape> {
        std::mem::take(&mut self.shapes)
    }

    pub fn clear(&mut self) {
        self.shapes.clear();
    }
}
