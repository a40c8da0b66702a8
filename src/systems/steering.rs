//! Per-agent steering.
//!
//! Each soldier blends several Reynolds steering behaviours into one force:
//!
//! - flow field following toward its leader,
//! - forward-ray obstacle avoidance,
//! - separation, alignment and cohesion over cached neighbours,
//! - an optional seek toward an attack target.
//!
//! The force is clamped to the agent's maximum, integrated into velocity, and
//! the velocity moves the entity. Agents read neighbour state from the
//! per-tick [`ActorSnapshot`], so update order within a tick does not matter.

use std::f32::consts::{PI, TAU};

use bevy_ecs::prelude::*;
use glam::Vec3;

use crate::actors::{ActorSnapshot, ActorView};
use crate::collision::{CircleObstacles, CollisionWorld};
use crate::components::{Heading, Position};
use crate::config::SteeringConfig;
use crate::systems::flow_fields::FlowFieldSubsystem;
use crate::systems::DeltaTime;

/// Below this speed an agent is considered stationary and does not move or turn.
const MIN_MOVE_SPEED: f32 = 1.0;

// ============================================================================
// STEERING PRIMITIVES
// ============================================================================

/// Clamp `v` to `max` length without changing its direction.
#[inline]
pub fn truncate(v: Vec3, max: f32) -> Vec3 {
    v.clamp_length_max(max.max(0.0))
}

/// Classic seek: desired velocity toward `target` minus current velocity.
pub fn seek(position: Vec3, velocity: Vec3, target: Vec3, max_speed: f32) -> Vec3 {
    let desired = (target - position).normalize_or_zero() * max_speed;
    desired - velocity
}

pub fn flee(position: Vec3, velocity: Vec3, threat: Vec3, max_speed: f32) -> Vec3 {
    let desired = (position - threat).normalize_or_zero() * max_speed;
    desired - velocity
}

/// Seek that slows down linearly inside `slowing_distance`.
pub fn arrive(
    position: Vec3,
    velocity: Vec3,
    target: Vec3,
    max_speed: f32,
    slowing_distance: f32,
) -> Vec3 {
    let offset = target - position;
    let distance = offset.length();
    if distance <= f32::EPSILON {
        return -velocity;
    }
    let speed = if slowing_distance > 0.0 && distance < slowing_distance {
        max_speed * distance / slowing_distance
    } else {
        max_speed
    };
    offset / distance * speed - velocity
}

/// Rotate `current` toward `target` by fraction `t` along the shortest arc.
fn interp_yaw(current: f32, target: f32, t: f32) -> f32 {
    let delta = (target - current + PI).rem_euclid(TAU) - PI;
    current + delta * t.clamp(0.0, 1.0)
}

// ============================================================================
// COMPONENT
// ============================================================================

/// Everything a steering update reads from the world.
pub struct SteeringInputs<'a, A: ActorView> {
    pub entity: Entity,
    pub position: Vec3,
    /// Facing used when the agent is not moving. `Vec3::ZERO` if unknown.
    pub facing: Vec3,
    pub actors: &'a A,
    pub flow: &'a FlowFieldSubsystem,
    pub collision: Option<&'a dyn CollisionWorld>,
}

/// Steering state of one agent. Velocity is owned here and nowhere else.
#[derive(Component, Debug, Clone)]
pub struct SteeringAgent {
    pub config: SteeringConfig,
    velocity: Vec3,
    steering_force: Vec3,
    follow_target: Option<Entity>,
    attack_target: Option<Entity>,
    enabled: bool,
    cached_neighbors: Vec<Entity>,
    time_since_neighbor_query: f32,
}

impl Default for SteeringAgent {
    fn default() -> Self {
        Self::new(SteeringConfig::default())
    }
}

impl SteeringAgent {
    pub fn new(config: SteeringConfig) -> Self {
        Self {
            config,
            velocity: Vec3::ZERO,
            steering_force: Vec3::ZERO,
            follow_target: None,
            attack_target: None,
            enabled: true,
            cached_neighbors: Vec::new(),
            // refresh on the first update
            time_since_neighbor_query: f32::MAX,
        }
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    /// Force applied on the last update, after clamping.
    pub fn steering_force(&self) -> Vec3 {
        self.steering_force
    }

    /// Leader whose flow field this agent follows.
    pub fn set_follow_target(&mut self, leader: Option<Entity>) {
        self.follow_target = leader;
    }

    pub fn follow_target(&self) -> Option<Entity> {
        self.follow_target
    }

    pub fn set_attack_target(&mut self, target: Option<Entity>) {
        self.attack_target = target;
    }

    pub fn attack_target(&self) -> Option<Entity> {
        self.attack_target
    }

    /// Disabled agents keep their state but stop moving.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.velocity = Vec3::ZERO;
            self.steering_force = Vec3::ZERO;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cached_neighbors(&self) -> &[Entity] {
        &self.cached_neighbors
    }

    /// Requery neighbours within the largest flocking radius.
    pub fn refresh_neighbors<A: ActorView>(&mut self, inputs: &SteeringInputs<'_, A>) {
        inputs.flow.query_neighbors_into(
            inputs.position,
            self.config.max_neighbor_radius(),
            Some(inputs.entity),
            inputs.actors,
            &mut self.cached_neighbors,
        );
        self.time_since_neighbor_query = 0.0;
    }

    // ------------------------------------------------------------------------
    // Behaviours
    // ------------------------------------------------------------------------

    /// Follow the leader's flow field, or arrive at the leader directly where
    /// the field gives no guidance.
    pub fn flow_field_follow<A: ActorView>(&self, inputs: &SteeringInputs<'_, A>) -> Vec3 {
        let Some(leader) = self.follow_target else {
            return Vec3::ZERO;
        };
        let Some(leader_pos) = inputs.actors.position(leader) else {
            return Vec3::ZERO;
        };

        let dir = inputs
            .flow
            .get_flow_direction_to_leader(leader, inputs.position, inputs.actors);
        if dir == Vec3::ZERO {
            return arrive(
                inputs.position,
                self.velocity,
                leader_pos,
                self.config.max_speed,
                self.config.arrival_slowing_distance,
            );
        }
        dir * self.config.max_speed - self.velocity
    }

    /// Sidestep whatever the forward ray hits, harder the closer it is.
    ///
    /// A stationary agent casts its ray along `facing` instead of its velocity.
    pub fn obstacle_avoidance(
        &self,
        position: Vec3,
        facing: Vec3,
        collision: &dyn CollisionWorld,
    ) -> Vec3 {
        let Some(forward) = self
            .velocity
            .try_normalize()
            .or_else(|| facing.try_normalize())
        else {
            return Vec3::ZERO;
        };
        let detection = self.config.obstacle_detection_distance;
        if detection <= 0.0 {
            return Vec3::ZERO;
        }

        let Some(hit) = collision.raycast(position, position + forward * detection) else {
            return Vec3::ZERO;
        };

        let right = forward.cross(Vec3::Z).normalize_or_zero();
        let strafe = if hit.normal.dot(right) >= 0.0 { right } else { -right };
        let strength = (1.0 - hit.distance / detection).clamp(0.0, 1.0);
        strafe * self.config.max_speed * strength
    }

    /// Push away from close neighbours, weighted by inverse distance.
    pub fn separation(&self, position: Vec3, actors: &impl ActorView) -> Vec3 {
        let radius_sq = self.config.separation_radius * self.config.separation_radius;
        let mut push = Vec3::ZERO;

        for &other in &self.cached_neighbors {
            let Some(other_pos) = actors.position(other) else {
                continue;
            };
            let away = position - other_pos;
            let dist_sq = away.length_squared();
            if dist_sq <= f32::EPSILON || dist_sq > radius_sq {
                continue;
            }
            push += away / dist_sq;
        }

        match push.try_normalize() {
            Some(dir) => dir * self.config.max_speed - self.velocity,
            None => Vec3::ZERO,
        }
    }

    /// Match the average heading of nearby neighbours.
    pub fn alignment(&self, position: Vec3, actors: &impl ActorView) -> Vec3 {
        let radius_sq = self.config.alignment_radius * self.config.alignment_radius;
        let mut sum = Vec3::ZERO;
        let mut count = 0;

        for &other in &self.cached_neighbors {
            let Some(state) = actors.actor(other) else {
                continue;
            };
            if state.position.distance_squared(position) > radius_sq {
                continue;
            }
            sum += state.velocity;
            count += 1;
        }

        if count == 0 {
            return Vec3::ZERO;
        }
        match (sum / count as f32).try_normalize() {
            Some(dir) => dir * self.config.max_speed - self.velocity,
            None => Vec3::ZERO,
        }
    }

    /// Seek the centroid of nearby neighbours.
    pub fn cohesion(&self, position: Vec3, actors: &impl ActorView) -> Vec3 {
        let radius_sq = self.config.cohesion_radius * self.config.cohesion_radius;
        let mut center = Vec3::ZERO;
        let mut count = 0;

        for &other in &self.cached_neighbors {
            let Some(other_pos) = actors.position(other) else {
                continue;
            };
            if other_pos.distance_squared(position) > radius_sq {
                continue;
            }
            center += other_pos;
            count += 1;
        }

        if count == 0 {
            return Vec3::ZERO;
        }
        seek(position, self.velocity, center / count as f32, self.config.max_speed)
    }

    /// Weighted sum of every behaviour, clamped to the maximum steering force.
    pub fn calculate_steering_force<A: ActorView>(&self, inputs: &SteeringInputs<'_, A>) -> Vec3 {
        let c = &self.config;
        let position = inputs.position;

        let mut force = self.flow_field_follow(inputs) * c.flow_field_weight;

        if let Some(collision) = inputs.collision {
            force += self.obstacle_avoidance(position, inputs.facing, collision)
                * c.obstacle_avoidance_weight;
        }

        force += self.separation(position, inputs.actors) * c.separation_weight;
        force += self.alignment(position, inputs.actors) * c.alignment_weight;
        force += self.cohesion(position, inputs.actors) * c.cohesion_weight;

        if let Some(target) = self.attack_target.and_then(|t| inputs.actors.position(t)) {
            force += seek(position, self.velocity, target, c.max_speed) * c.attack_seek_weight;
        }

        truncate(force, c.max_steering_force)
    }

    /// Integrate `force` over `dt`, returning the new velocity.
    pub fn apply_force(&mut self, force: Vec3, dt: f32) -> Vec3 {
        let force = truncate(force, self.config.max_steering_force);
        let acceleration = force / self.config.mass;
        self.velocity = truncate(self.velocity + acceleration * dt, self.config.max_speed);
        self.steering_force = force;
        self.velocity
    }

    /// One full update: refresh neighbours if due, steer, integrate.
    ///
    /// Returns the displacement to apply this tick.
    pub fn update<A: ActorView>(&mut self, dt: f32, inputs: &SteeringInputs<'_, A>) -> Vec3 {
        if !self.enabled {
            return Vec3::ZERO;
        }

        self.time_since_neighbor_query += dt;
        if self.time_since_neighbor_query >= self.config.neighbor_query_interval {
            self.refresh_neighbors(inputs);
        }

        let force = self.calculate_steering_force(inputs);
        let velocity = self.apply_force(force, dt);
        if velocity.length() < MIN_MOVE_SPEED {
            return Vec3::ZERO;
        }
        velocity * dt
    }

    /// Turn `yaw` toward the current velocity heading.
    pub fn smoothed_yaw(&self, yaw: f32, dt: f32) -> f32 {
        if self.velocity.length() < MIN_MOVE_SPEED {
            return yaw;
        }
        let target = self.velocity.y.atan2(self.velocity.x);
        interp_yaw(yaw, target, self.config.yaw_interp_speed * dt)
    }
}

// ============================================================================
// SYSTEM
// ============================================================================

/// System that steers and moves every enabled agent.
pub fn steering_system(
    dt: Res<DeltaTime>,
    snapshot: Res<ActorSnapshot>,
    flow: Res<FlowFieldSubsystem>,
    obstacles: Option<Res<CircleObstacles>>,
    mut agents: Query<(Entity, &mut SteeringAgent, &mut Position, Option<&mut Heading>)>,
) {
    let collision = obstacles.as_deref().map(|o| o as &dyn CollisionWorld);

    for (entity, mut agent, mut position, heading) in agents.iter_mut() {
        if !snapshot.is_alive(entity) {
            continue;
        }

        let inputs = SteeringInputs {
            entity,
            position: position.0,
            facing: heading.as_ref().map_or(Vec3::ZERO, |h| h.forward()),
            actors: &*snapshot,
            flow: &*flow,
            collision,
        };
        let displacement = agent.update(dt.0, &inputs);
        if displacement == Vec3::ZERO {
            continue;
        }

        position.0 += displacement;
        if let Some(mut heading) = heading {
            heading.yaw = agent.smoothed_yaw(heading.yaw, dt.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::actors::ActorState;
    use crate::components::{Faction, LeaderBundle, SoldierBundle};

    fn flow_subsystem() -> FlowFieldSubsystem {
        let mut flow = FlowFieldSubsystem::new(0.1);
        flow.initialize_flow_field(Vec2::ZERO, Vec2::new(2000.0, 2000.0), 100.0);
        flow
    }

    #[test]
    fn test_primitives() {
        let force = seek(Vec3::ZERO, Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 5.0);
        assert!((force - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);

        let force = flee(Vec3::ZERO, Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 5.0);
        assert!((force - Vec3::new(-5.0, 0.0, 0.0)).length() < 1e-5);

        let slow = arrive(Vec3::ZERO, Vec3::ZERO, Vec3::new(50.0, 0.0, 0.0), 400.0, 200.0);
        assert!((slow.length() - 100.0).abs() < 1e-3);
        assert_eq!(arrive(Vec3::ZERO, Vec3::X, Vec3::ZERO, 400.0, 200.0), -Vec3::X);

        let clamped = truncate(Vec3::new(30.0, 40.0, 0.0), 10.0);
        assert!((clamped - Vec3::new(6.0, 8.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_yaw_takes_short_way_round() {
        let yaw = interp_yaw(PI - 0.1, -PI + 0.1, 0.5);
        assert!((yaw - PI).abs() < 1e-4);
    }

    #[test]
    fn test_follows_flow_toward_leader() {
        let mut actors = ActorSnapshot::new();
        let (leader, soldier) = (Entity::from_raw(1), Entity::from_raw(2));
        actors.insert(leader, ActorState::at(Vec3::new(1550.0, 550.0, 0.0), Faction::Player));
        actors.insert(soldier, ActorState::at(Vec3::new(250.0, 550.0, 0.0), Faction::Player));

        let mut flow = flow_subsystem();
        flow.register_leader(leader, &actors);

        let mut agent = SteeringAgent::default();
        agent.set_follow_target(Some(leader));
        let inputs = SteeringInputs {
            entity: soldier,
            position: Vec3::new(250.0, 550.0, 0.0),
            facing: Vec3::ZERO,
            actors: &actors,
            flow: &flow,
            collision: None,
        };

        let step = agent.update(0.1, &inputs);
        assert!(step.x > 0.0);
        assert!(step.y.abs() < 1e-3);
    }

    #[test]
    fn test_separation_pushes_apart() {
        let mut actors = ActorSnapshot::new();
        let (me, other) = (Entity::from_raw(1), Entity::from_raw(2));
        actors.insert(me, ActorState::at(Vec3::new(100.0, 100.0, 0.0), Faction::Player));
        actors.insert(other, ActorState::at(Vec3::new(130.0, 100.0, 0.0), Faction::Player));

        let mut flow = flow_subsystem();
        flow.register_soldier(me, &actors);
        flow.register_soldier(other, &actors);

        let mut agent = SteeringAgent::default();
        let inputs = SteeringInputs {
            entity: me,
            position: Vec3::new(100.0, 100.0, 0.0),
            facing: Vec3::ZERO,
            actors: &actors,
            flow: &flow,
            collision: None,
        };
        agent.refresh_neighbors(&inputs);
        assert_eq!(agent.cached_neighbors(), &[other]);

        let push = agent.separation(inputs.position, &actors);
        assert!(push.x < 0.0);
    }

    #[test]
    fn test_avoidance_strafes_around_obstacle() {
        let mut obstacles = CircleObstacles::new();
        // slightly left of the path, so the ray hits its right flank
        obstacles.add(Vec3::new(100.0, 10.0, 0.0), 30.0);

        let mut agent = SteeringAgent::default();
        agent.apply_force(Vec3::new(200.0, 0.0, 0.0), 1.0);

        let force = agent.obstacle_avoidance(Vec3::ZERO, Vec3::ZERO, &obstacles);
        assert!(force.length() > 0.0);
        assert!(force.y < 0.0);
        assert!(force.length() <= agent.config.max_speed + 1e-3);
    }

    #[test]
    fn test_stationary_agent_avoids_along_facing() {
        let mut obstacles = CircleObstacles::new();
        obstacles.add(Vec3::new(100.0, 10.0, 0.0), 30.0);
        let agent = SteeringAgent::default();
        assert_eq!(agent.velocity(), Vec3::ZERO);

        // no facing and no velocity: nothing to cast along
        assert_eq!(agent.obstacle_avoidance(Vec3::ZERO, Vec3::ZERO, &obstacles), Vec3::ZERO);

        let facing = Heading { yaw: 0.0 }.forward();
        let force = agent.obstacle_avoidance(Vec3::ZERO, facing, &obstacles);
        assert!(force.y < 0.0);
        // strafe scales with speed, not the steering force cap
        assert!(force.length() > agent.config.max_steering_force);
        assert!(force.length() <= agent.config.max_speed + 1e-3);
    }

    #[test]
    fn test_disabled_agent_stays_put() {
        let actors = ActorSnapshot::new();
        let flow = flow_subsystem();
        let mut agent = SteeringAgent::default();
        agent.set_attack_target(Some(Entity::from_raw(5)));
        agent.set_enabled(false);

        let inputs = SteeringInputs {
            entity: Entity::from_raw(1),
            position: Vec3::ZERO,
            facing: Vec3::ZERO,
            actors: &actors,
            flow: &flow,
            collision: None,
        };
        assert_eq!(agent.update(0.1, &inputs), Vec3::ZERO);
        assert_eq!(agent.velocity(), Vec3::ZERO);
    }

    #[test]
    fn test_force_never_exceeds_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut obstacles = CircleObstacles::new();
        for _ in 0..20 {
            obstacles.add(
                Vec3::new(rng.random_range(0.0..2000.0), rng.random_range(0.0..2000.0), 0.0),
                rng.random_range(10.0..80.0),
            );
        }

        for round in 0..50 {
            let mut actors = ActorSnapshot::new();
            let mut flow = flow_subsystem();

            let leader = Entity::from_raw(0);
            actors.insert(
                leader,
                ActorState::at(
                    Vec3::new(rng.random_range(0.0..2000.0), rng.random_range(0.0..2000.0), 0.0),
                    Faction::Player,
                ),
            );
            flow.register_leader(leader, &actors);

            let me = Entity::from_raw(1);
            let position = Vec3::new(rng.random_range(0.0..2000.0), rng.random_range(0.0..2000.0), 0.0);
            actors.insert(me, ActorState::at(position, Faction::Player));
            flow.register_soldier(me, &actors);

            for i in 2..30 {
                let offset = Vec3::new(rng.random_range(-250.0..250.0), rng.random_range(-250.0..250.0), 0.0);
                let e = Entity::from_raw(i);
                actors.insert(
                    e,
                    ActorState {
                        position: position + offset,
                        velocity: Vec3::new(rng.random_range(-400.0..400.0), rng.random_range(-400.0..400.0), 0.0),
                        faction: Faction::Player,
                    },
                );
                flow.register_soldier(e, &actors);
            }

            let mut agent = SteeringAgent::default();
            agent.config.max_steering_force = rng.random_range(10.0..500.0);
            agent.set_follow_target(Some(leader));
            agent.set_attack_target(Some(Entity::from_raw(rng.random_range(2..30))));
            agent.apply_force(Vec3::new(rng.random_range(-500.0..500.0), rng.random_range(-500.0..500.0), 0.0), 1.0);

            let inputs = SteeringInputs {
                entity: me,
                position,
                facing: Vec3::X,
                actors: &actors,
                flow: &flow,
                collision: Some(&obstacles),
            };
            agent.update(1.0 / 60.0, &inputs);
            assert!(
                agent.steering_force().length() <= agent.config.max_steering_force * (1.0 + 1e-4),
                "round {round}: {} > {}",
                agent.steering_force().length(),
                agent.config.max_steering_force
            );
            assert!(agent.velocity().length() <= agent.config.max_speed * (1.0 + 1e-4));
        }
    }

    #[test]
    fn test_system_moves_soldier_toward_leader() {
        let mut world = World::new();
        let leader = world
            .spawn(LeaderBundle::new(Faction::Player, Position::flat(1550.0, 1050.0)))
            .id();
        let soldier = world
            .spawn(SoldierBundle::new(Faction::Player, Position::flat(250.0, 1050.0)))
            .id();
        world
            .get_mut::<SteeringAgent>(soldier)
            .unwrap()
            .set_follow_target(Some(leader));

        let mut snapshot = ActorSnapshot::new();
        snapshot.insert(leader, ActorState::at(Vec3::new(1550.0, 1050.0, 0.0), Faction::Player));
        snapshot.insert(soldier, ActorState::at(Vec3::new(250.0, 1050.0, 0.0), Faction::Player));
        let mut flow = flow_subsystem();
        flow.register_leader(leader, &snapshot);
        flow.register_soldier(soldier, &snapshot);

        world.insert_resource(flow);
        world.insert_resource(snapshot);
        world.insert_resource(DeltaTime(1.0 / 60.0));

        let mut schedule = Schedule::default();
        schedule.add_systems((crate::actors::actor_snapshot_system, steering_system).chain());
        for _ in 0..30 {
            schedule.run(&mut world);
        }

        let moved = world.get::<Position>(soldier).unwrap().0;
        assert!(moved.x > 260.0);
        assert!((moved.y - 1050.0).abs() < 5.0);
        let heading = world.get::<Heading>(soldier).unwrap();
        assert!(heading.yaw.abs() < 0.1);
    }
}
