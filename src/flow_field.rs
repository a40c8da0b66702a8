//! Flow field pathfinding toward a single target.
//!
//! A flow field guides any number of agents to one target by precomputing, for
//! every grid cell, the direction of the locally cheapest step.
//!
//! ## Algorithm
//!
//! 1. **Cost field**: open cells cost 1, blocked cells cost 255.
//! 2. **Integration field**: wavefront from the target cell over 8 neighbours
//!    (orthogonal edge 10, diagonal edge 14, scaled by the neighbour's cost).
//! 3. **Flow field**: each open cell points at its neighbour with the strictly
//!    lowest integration value, or nowhere if it is a local minimum.
//!
//! The wavefront uses a plain FIFO queue with relaxation instead of a priority
//! queue. A cell may be enqueued more than once, but relaxation only stops when
//! no value can improve, so the final integration values are exact shortest
//! path costs. On uniform grids this is cheaper than a heap.

use std::collections::VecDeque;

use glam::{IVec2, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::debug::{DebugContext, DebugShape};

/// Cost of a walkable cell.
pub const OPEN_COST: u8 = 1;
/// Cost of a blocked cell. Blocked cells are never entered.
pub const BLOCKED_COST: u8 = 255;
/// Integration value of a cell the wavefront never reached.
pub const UNREACHABLE: u16 = u16::MAX;
/// Smallest accepted cell size in world units.
pub const MIN_CELL_SIZE: f32 = 10.0;

const NEIGHBOR_OFFSETS: [IVec2; 8] = [
    IVec2::new(-1, 0),
    IVec2::new(1, 0),
    IVec2::new(0, -1),
    IVec2::new(0, 1),
    IVec2::new(-1, -1),
    IVec2::new(1, -1),
    IVec2::new(-1, 1),
    IVec2::new(1, 1),
];

const NEIGHBOR_COSTS: [u16; 8] = [10, 10, 10, 10, 14, 14, 14, 14];

const DIAGONAL: f32 = std::f32::consts::FRAC_1_SQRT_2;

const NEIGHBOR_DIRS: [Vec2; 8] = [
    Vec2::new(-1.0, 0.0),
    Vec2::new(1.0, 0.0),
    Vec2::new(0.0, -1.0),
    Vec2::new(0.0, 1.0),
    Vec2::new(-DIAGONAL, -DIAGONAL),
    Vec2::new(DIAGONAL, -DIAGONAL),
    Vec2::new(-DIAGONAL, DIAGONAL),
    Vec2::new(DIAGONAL, DIAGONAL),
];

/// One cell of the field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowFieldCell {
    pub cost: u8,
    pub integration: u16,
    pub flow_direction: Vec2,
}

impl Default for FlowFieldCell {
    fn default() -> Self {
        Self {
            cost: OPEN_COST,
            integration: UNREACHABLE,
            flow_direction: Vec2::ZERO,
        }
    }
}

impl FlowFieldCell {
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.cost == BLOCKED_COST
    }

    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.integration != UNREACHABLE
    }
}

/// Flow field for one target over a rectangular area of the ground plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowField {
    world_origin: Vec2,
    world_size: Vec2,
    cell_size: f32,
    grid_width: i32,
    grid_height: i32,
    target_location: Vec2,
    target_grid: IVec2,
    cells: Vec<FlowFieldCell>,
}

impl Default for FlowField {
    fn default() -> Self {
        Self {
            world_origin: Vec2::ZERO,
            world_size: Vec2::ZERO,
            cell_size: 100.0,
            grid_width: 0,
            grid_height: 0,
            target_location: Vec2::ZERO,
            target_grid: IVec2::ZERO,
            cells: Vec::new(),
        }
    }
}

impl FlowField {
    /// Create and initialize a field covering `size` world units from `origin`.
    pub fn new(origin: Vec2, size: Vec2, cell_size: f32) -> Self {
        let mut field = Self::default();
        field.initialize(origin, size, cell_size);
        field
    }

    /// Size the grid and reset every cell.
    pub fn initialize(&mut self, origin: Vec2, size: Vec2, cell_size: f32) {
        self.world_origin = origin;
        self.world_size = size;
        self.cell_size = cell_size.max(MIN_CELL_SIZE);

        let dims = Self::dimensions_for(size, cell_size);
        self.grid_width = dims.x;
        self.grid_height = dims.y;

        self.cells.clear();
        self.cells
            .resize((self.grid_width * self.grid_height) as usize, FlowFieldCell::default());

        debug!(
            width = self.grid_width,
            height = self.grid_height,
            cell_size = self.cell_size,
            "flow field initialized"
        );
    }

    /// Grid width and height for a field of `size` at `cell_size`.
    pub fn dimensions_for(size: Vec2, cell_size: f32) -> IVec2 {
        (size / cell_size.max(MIN_CELL_SIZE))
            .ceil()
            .max(Vec2::ZERO)
            .as_ivec2()
    }

    /// Reset every cell to open, unreachable and motionless.
    pub fn clear(&mut self) {
        self.cells.fill(FlowFieldCell::default());
    }

    pub fn is_valid(&self) -> bool {
        self.grid_width > 0 && self.grid_height > 0
    }

    pub fn grid_width(&self) -> i32 {
        self.grid_width
    }

    pub fn grid_height(&self) -> i32 {
        self.grid_height
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn world_origin(&self) -> Vec2 {
        self.world_origin
    }

    pub fn target_location(&self) -> Vec3 {
        self.target_location.extend(0.0)
    }

    pub fn target_grid(&self) -> IVec2 {
        self.target_grid
    }

    /// Retarget the field and regenerate it completely.
    ///
    /// O(cells); callers throttle how often this runs.
    pub fn set_target(&mut self, target: Vec3) {
        self.target_location = target.truncate();
        self.target_grid = self.world_to_grid(target);

        self.generate_cost_field();
        self.generate_integration_field();
        self.generate_flow_field();
    }

    /// Block every cell whose centre lies within `radius` of `location`.
    ///
    /// Does not regenerate the field; call [`Self::set_target`] afterwards.
    pub fn set_obstacle(&mut self, location: Vec3, radius: f32) {
        self.fill_disk(location, radius, BLOCKED_COST);
    }

    /// Reopen every cell whose centre lies within `radius` of `location`.
    pub fn clear_obstacle(&mut self, location: Vec3, radius: f32) {
        self.fill_disk(location, radius, OPEN_COST);
    }

    /// Flow direction of the cell containing `location`.
    ///
    /// Outside the grid the direction points straight at the target. Blocked
    /// cells yield zero.
    pub fn get_flow_direction(&self, location: Vec3) -> Vec3 {
        let coord = self.world_to_grid(location);

        let Some(cell) = self.cell_at(coord.x, coord.y) else {
            let to_target = self.target_location - location.truncate();
            return to_target.normalize_or_zero().extend(0.0);
        };

        if cell.is_blocked() {
            return Vec3::ZERO;
        }
        cell.flow_direction.extend(0.0)
    }

    /// Bilinearly interpolated flow direction, renormalized.
    ///
    /// Samples the four cell centres surrounding `location`. A corner that falls
    /// outside the grid borrows the direction of the cell containing `location`
    /// so the result is not dragged toward zero along the field border.
    pub fn get_flow_direction_smooth(&self, location: Vec3) -> Vec3 {
        let coord = self.world_to_grid(location);
        let Some(home) = self.cell_at(coord.x, coord.y) else {
            return self.get_flow_direction(location);
        };

        let local = (location.truncate() - self.world_origin) / self.cell_size - Vec2::splat(0.5);
        let base = local.floor().as_ivec2();
        let t = local - base.as_vec2();

        let sample = |x: i32, y: i32| -> Vec2 {
            self.cell_at(x, y)
                .map(|c| c.flow_direction)
                .unwrap_or(home.flow_direction)
        };

        let d00 = sample(base.x, base.y);
        let d10 = sample(base.x + 1, base.y);
        let d01 = sample(base.x, base.y + 1);
        let d11 = sample(base.x + 1, base.y + 1);

        let d0 = d00.lerp(d10, t.x);
        let d1 = d01.lerp(d11, t.x);
        d0.lerp(d1, t.y).normalize_or_zero().extend(0.0)
    }

    /// Whether `location` lies inside the grid on an open cell.
    pub fn is_walkable(&self, location: Vec3) -> bool {
        let coord = self.world_to_grid(location);
        self.cell_at(coord.x, coord.y)
            .is_some_and(|c| !c.is_blocked())
    }

    /// Set a single cell's cost directly.
    ///
    /// Blocking also wipes the cell's integration and flow. The field is not
    /// regenerated.
    pub fn set_cell_blocked(&mut self, x: i32, y: i32, blocked: bool) {
        let Some(cell) = self.cell_at_mut(x, y) else {
            return;
        };
        if blocked {
            cell.cost = BLOCKED_COST;
            cell.integration = UNREACHABLE;
            cell.flow_direction = Vec2::ZERO;
        } else {
            cell.cost = OPEN_COST;
        }
    }

    pub fn clear_all_blocked_cells(&mut self) {
        for cell in self.cells.iter_mut().filter(|c| c.is_blocked()) {
            cell.cost = OPEN_COST;
        }
    }

    /// Out-of-range cells count as blocked.
    pub fn is_cell_blocked(&self, x: i32, y: i32) -> bool {
        self.cell_at(x, y).map_or(true, FlowFieldCell::is_blocked)
    }

    pub fn blocked_cell_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_blocked()).count()
    }

    #[inline]
    pub fn is_valid_grid_coord(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.grid_width && y >= 0 && y < self.grid_height
    }

    pub fn cell_at(&self, x: i32, y: i32) -> Option<&FlowFieldCell> {
        if !self.is_valid_grid_coord(x, y) {
            return None;
        }
        self.cells.get(self.grid_index(x, y))
    }

    fn cell_at_mut(&mut self, x: i32, y: i32) -> Option<&mut FlowFieldCell> {
        if !self.is_valid_grid_coord(x, y) {
            return None;
        }
        let index = self.grid_index(x, y);
        self.cells.get_mut(index)
    }

    #[inline]
    pub fn world_to_grid(&self, location: Vec3) -> IVec2 {
        ((location.truncate() - self.world_origin) / self.cell_size)
            .floor()
            .as_ivec2()
    }

    /// World position of a cell's centre.
    #[inline]
    pub fn grid_to_world(&self, x: i32, y: i32) -> Vec3 {
        (self.world_origin + (IVec2::new(x, y).as_vec2() + Vec2::splat(0.5)) * self.cell_size)
            .extend(0.0)
    }

    #[inline]
    fn grid_index(&self, x: i32, y: i32) -> usize {
        (y * self.grid_width + x) as usize
    }

    fn fill_disk(&mut self, location: Vec3, radius: f32, cost: u8) {
        if !radius.is_finite() || radius < 0.0 || !location.is_finite() {
            return;
        }
        let center = self.world_to_grid(location);
        let cell_radius = (radius / self.cell_size).ceil() as i32;
        let radius_sq = radius * radius;

        // Visit only the part of the bounding square that lies on the grid.
        let min_x = center.x.saturating_sub(cell_radius).max(0);
        let max_x = center.x.saturating_add(cell_radius).min(self.grid_width - 1);
        let min_y = center.y.saturating_sub(cell_radius).max(0);
        let max_y = center.y.saturating_add(cell_radius).min(self.grid_height - 1);

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let cell_world = self.grid_to_world(x, y);
                if cell_world.truncate().distance_squared(location.truncate()) > radius_sq {
                    continue;
                }
                if let Some(cell) = self.cell_at_mut(x, y) {
                    cell.cost = cost;
                }
            }
        }
    }

    fn generate_cost_field(&mut self) {
        // Costs are authored through the obstacle calls only.
    }

    fn generate_integration_field(&mut self) {
        for cell in &mut self.cells {
            cell.integration = UNREACHABLE;
        }

        let target = self.target_grid;
        let Some(target_cell) = self.cell_at_mut(target.x, target.y) else {
            warn!(x = target.x, y = target.y, "flow field target outside grid");
            return;
        };
        target_cell.integration = 0;

        let mut open = VecDeque::new();
        open.push_back(target);

        while let Some(current) = open.pop_front() {
            let Some(current_value) = self.cell_at(current.x, current.y).map(|c| c.integration) else {
                continue;
            };

            for (offset, edge_cost) in NEIGHBOR_OFFSETS.iter().zip(NEIGHBOR_COSTS) {
                let next = current + *offset;
                let Some(neighbor) = self.cell_at_mut(next.x, next.y) else {
                    continue;
                };
                if neighbor.is_blocked() {
                    continue;
                }

                let candidate = current_value.saturating_add(edge_cost * u16::from(neighbor.cost));
                if candidate < neighbor.integration {
                    neighbor.integration = candidate;
                    open.push_back(next);
                }
            }
        }
    }

    fn generate_flow_field(&mut self) {
        for y in 0..self.grid_height {
            for x in 0..self.grid_width {
                let index = self.grid_index(x, y);
                let cell = self.cells[index];
                if cell.is_blocked() {
                    continue;
                }

                let mut min_value = cell.integration;
                let mut best_dir = Vec2::ZERO;

                for (offset, dir) in NEIGHBOR_OFFSETS.iter().zip(NEIGHBOR_DIRS) {
                    let Some(neighbor) = self.cell_at(x + offset.x, y + offset.y) else {
                        continue;
                    };
                    if neighbor.is_blocked() {
                        continue;
                    }
                    if neighbor.integration < min_value {
                        min_value = neighbor.integration;
                        best_dir = dir;
                    }
                }

                self.cells[index].flow_direction = best_dir;
            }
        }
    }

    /// Push arrows, blocked boxes and the target marker into `debug`.
    pub fn debug_draw(&self, debug: &mut DebugContext) {
        if !debug.enabled {
            return;
        }

        for y in 0..self.grid_height {
            for x in 0..self.grid_width {
                let Some(cell) = self.cell_at(x, y) else {
                    continue;
                };
                let center = self.grid_to_world(x, y);

                if cell.is_blocked() {
                    debug.push(DebugShape::Box {
                        center,
                        half_extent: self.cell_size * 0.4,
                    });
                } else if cell.flow_direction != Vec2::ZERO {
                    debug.push(DebugShape::Arrow {
                        from: center,
                        to: center + cell.flow_direction.extend(0.0) * self.cell_size * 0.4,
                    });
                }
            }
        }

        debug.push(DebugShape::Sphere {
            center: self.grid_to_world(self.target_grid.x, self.target_grid.y),
            radius: 30.0,
        });
    }
}
