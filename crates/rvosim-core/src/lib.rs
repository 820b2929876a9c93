//! Core types shared across the RVOSim workspace.
//!
//! The simulation advances in phase-barriered stages over a fixed, dense
//! population of agents: neighbor observation (reads the spatial index built
//! from last tick's positions), velocity planning (RVO or HRVO penalty
//! minimization over a sampled velocity disk), integration, and an index
//! rebuild. Each stage is a data-parallel map over the agent index range;
//! results are collected and applied only after the map joins, so no agent
//! ever reads another agent's in-progress output.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use rvosim_index::{NeighborhoodIndex, RadiusHit, UniformGridIndex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use thiserror::Error;

/// Decrement applied to the candidate speed while sampling the velocity disk.
pub const SPEED_SAMPLE_STEP: f32 = 0.1;

/// Stand-in for "no collision along this ray". Large but finite so the
/// penalty sum stays totally ordered under `<`; IEEE infinities would poison
/// the `safety_factor / time_cost` term.
const TIME_SENTINEL: f32 = 100_000.0;

const FULL_TURN: f32 = std::f32::consts::TAU;

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Plane vector used for positions, velocities, and headings. Height above
/// the plane is not modeled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Dot product.
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// 2D cross product as a scalar.
    #[must_use]
    pub fn perp_dot(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    /// Squared Euclidean length.
    #[must_use]
    pub fn length_sq(self) -> f32 {
        self.dot(self)
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    /// Squared distance to `other`.
    #[must_use]
    pub fn distance_sq(self, other: Self) -> f32 {
        (other - self).length_sq()
    }

    /// Unit vector in this direction, or zero when the length vanishes.
    /// Never produces NaN components.
    #[must_use]
    pub fn normalized_or_zero(self) -> Self {
        let length_sq = self.length_sq();
        if length_sq <= f32::EPSILON {
            Self::ZERO
        } else {
            self * (1.0 / length_sq.sqrt())
        }
    }

    /// Rotate counterclockwise by `angle` radians.
    #[must_use]
    pub fn rotated(self, angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}

impl Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Velocity obstacle formulation used by the planner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AvoidanceMethod {
    /// Reciprocal velocity obstacles.
    #[default]
    Rvo,
    /// Hybrid reciprocal velocity obstacles: the obstacle apex is displaced
    /// toward the nearer cone leg to suppress the reciprocal dance.
    Hrvo,
}

/// Placement of initial positions and destinations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SpawnStyle {
    /// Uniformly random start and destination inside the bounds.
    #[default]
    Random,
    /// Two facing columns crossing horizontally, inset by the edge buffer.
    Rows,
    /// Evenly spaced ring around the centroid, destination antipodal.
    Circular,
}

/// Per-agent parameters supplied by collaborators at spawn time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Personality {
    /// Disk radius occupied by the agent. Must be positive.
    pub radius: f32,
    /// Top speed; also the outer radius of the sampled candidate disk.
    pub max_speed: f32,
    /// Carried for collaborators; the integrator applies velocities directly.
    pub acceleration: f32,
    /// Reciprocal-sharing weight in (0, 1]; used as a divisor when building
    /// the relative velocity.
    pub responsibility_factor: f32,
    /// Weight on the time-to-collision penalty term.
    pub safety_factor: f32,
    /// Weight on deviation from the current velocity.
    pub inertia_factor: f32,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            radius: 0.25,
            max_speed: 1.0,
            acceleration: 5.0,
            responsibility_factor: 0.5,
            safety_factor: 1.0,
            inertia_factor: 0.2,
        }
    }
}

impl Personality {
    /// Ensure the parameters are usable by the planner.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.radius <= 0.0 {
            return Err(SimulationError::InvalidConfig("radius must be positive"));
        }
        if self.max_speed < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "max_speed must be non-negative",
            ));
        }
        if self.responsibility_factor <= 0.0 || self.responsibility_factor > 1.0 {
            return Err(SimulationError::InvalidConfig(
                "responsibility_factor must lie in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// A personality bundled with a relative spawn weight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DemographicGroup {
    pub weight: u32,
    pub personality: Personality,
}

/// Weighted personality groups used when generating a population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Demographics {
    pub groups: Vec<DemographicGroup>,
}

impl Default for Demographics {
    fn default() -> Self {
        Self {
            groups: vec![DemographicGroup {
                weight: 1,
                personality: Personality::default(),
            }],
        }
    }
}

impl Demographics {
    /// Ensure at least one group with positive total weight exists and every
    /// personality is valid.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.groups.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "demographics must contain at least one group",
            ));
        }
        if self.groups.iter().map(|g| u64::from(g.weight)).sum::<u64>() == 0 {
            return Err(SimulationError::InvalidConfig(
                "demographic weights must not all be zero",
            ));
        }
        for group in &self.groups {
            group.personality.validate()?;
        }
        Ok(())
    }

    /// Draw a personality by relative weight. Zero-weight groups are never
    /// selected; the first group is the fallback for degenerate tables.
    #[must_use]
    pub fn sample(&self, rng: &mut dyn RngCore) -> Personality {
        let total: u64 = self.groups.iter().map(|g| u64::from(g.weight)).sum();
        if total == 0 {
            return self
                .groups
                .first()
                .map_or_else(Personality::default, |g| g.personality);
        }
        let mut roll = rng.random_range(0..total);
        for group in &self.groups {
            let weight = u64::from(group.weight);
            if roll < weight {
                return group.personality;
            }
            roll -= weight;
        }
        self.groups[self.groups.len() - 1].personality
    }
}

/// Errors raised while constructing or mutating a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An agent index beyond the fixed population size.
    #[error("agent index {index} out of range for population {population}")]
    AgentOutOfRange { index: usize, population: usize },
    /// An agent slot may only be initialized once.
    #[error("agent slot {0} already initialized")]
    SlotAlreadyFilled(usize),
}

/// Static configuration for a simulation run. Immutable once the world is
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    /// Environment extent from the origin, in world units.
    pub bounds: Vec2,
    /// Fixed number of agent slots.
    pub num_agents: usize,
    /// Distance below which an agent counts as arrived.
    pub arrival_buffer: f32,
    /// Placement of start and destination positions.
    pub spawn_style: SpawnStyle,
    /// Inset from the bounds used by the non-random spawn styles.
    pub bound_edge_buffer: f32,
    /// Velocity obstacle formulation.
    pub method: AvoidanceMethod,
    /// Number of candidate directions sampled per agent per tick.
    pub num_candidate_directions: usize,
    /// Cap on recorded neighbors per agent.
    pub max_neighbors: usize,
    /// Neighbor search radius.
    pub visual_radius: f32,
    /// Cell edge length of the uniform grid index.
    pub index_cell_size: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Interval (ticks) between sink notifications. 0 disables the sink.
    pub summary_interval: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bounds: Vec2::new(20.0, 20.0),
            num_agents: 50,
            arrival_buffer: 0.1,
            spawn_style: SpawnStyle::Random,
            bound_edge_buffer: 10.0,
            method: AvoidanceMethod::Rvo,
            num_candidate_directions: 16,
            max_neighbors: 8,
            visual_radius: 5.0,
            index_cell_size: 2.5,
            rng_seed: None,
            history_capacity: 256,
            summary_interval: 0,
        }
    }
}

impl SimulationConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.bounds.x <= 0.0 || self.bounds.y <= 0.0 {
            return Err(SimulationError::InvalidConfig("bounds must be positive"));
        }
        if self.num_agents == 0 {
            return Err(SimulationError::InvalidConfig(
                "num_agents must be non-zero",
            ));
        }
        if self.arrival_buffer <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "arrival_buffer must be positive",
            ));
        }
        if self.num_candidate_directions == 0 {
            return Err(SimulationError::InvalidConfig(
                "num_candidate_directions must be non-zero",
            ));
        }
        if self.max_neighbors == 0 {
            return Err(SimulationError::InvalidConfig(
                "max_neighbors must be non-zero",
            ));
        }
        if self.visual_radius <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "visual_radius must be positive",
            ));
        }
        if self.index_cell_size <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "index_cell_size must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(SimulationError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.spawn_style != SpawnStyle::Random {
            if self.bound_edge_buffer < 0.0 {
                return Err(SimulationError::InvalidConfig(
                    "bound_edge_buffer must be non-negative",
                ));
            }
            let min_extent = self.bounds.x.min(self.bounds.y);
            if self.bound_edge_buffer * 2.0 >= min_extent {
                return Err(SimulationError::InvalidConfig(
                    "bound_edge_buffer leaves no room inside bounds",
                ));
            }
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Collection of per-agent columns for hot-path iteration. One row per agent
/// slot; rows are allocated once and never inserted or removed, inclusion is
/// modeled by the `active` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Vec2>,
    velocities: Vec<Vec2>,
    new_velocities: Vec<Vec2>,
    destinations: Vec<Vec2>,
    headings: Vec<Vec2>,
    radii: Vec<f32>,
    max_speeds: Vec<f32>,
    accelerations: Vec<f32>,
    responsibility_factors: Vec<f32>,
    safety_factors: Vec<f32>,
    inertia_factors: Vec<f32>,
    active: Vec<bool>,
    reached_destination: Vec<bool>,
}

impl AgentColumns {
    /// Create a collection with `len` zeroed, inactive rows.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            positions: vec![Vec2::ZERO; len],
            velocities: vec![Vec2::ZERO; len],
            new_velocities: vec![Vec2::ZERO; len],
            destinations: vec![Vec2::ZERO; len],
            headings: vec![Vec2::ZERO; len],
            radii: vec![0.0; len],
            max_speeds: vec![0.0; len],
            accelerations: vec![0.0; len],
            responsibility_factors: vec![0.0; len],
            safety_factors: vec![0.0; len],
            inertia_factors: vec![0.0; len],
            active: vec![false; len],
            reached_destination: vec![false; len],
        }
    }

    /// Number of agent slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when the store has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    /// Mutable access to the positions slice. Reserved for the integrator
    /// and setup code.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec2] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Vec2] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec2] {
        &mut self.velocities
    }

    /// Immutable access to the planned velocities slice.
    #[must_use]
    pub fn new_velocities(&self) -> &[Vec2] {
        &self.new_velocities
    }

    /// Mutable access to the planned velocities slice. Reserved for the
    /// velocity planner.
    #[must_use]
    pub fn new_velocities_mut(&mut self) -> &mut [Vec2] {
        &mut self.new_velocities
    }

    /// Immutable access to the destinations slice.
    #[must_use]
    pub fn destinations(&self) -> &[Vec2] {
        &self.destinations
    }

    /// Mutable access to the destinations slice.
    #[must_use]
    pub fn destinations_mut(&mut self) -> &mut [Vec2] {
        &mut self.destinations
    }

    /// Immutable access to the published headings (unit vectors).
    #[must_use]
    pub fn headings(&self) -> &[Vec2] {
        &self.headings
    }

    /// Mutable access to headings.
    #[must_use]
    pub fn headings_mut(&mut self) -> &mut [Vec2] {
        &mut self.headings
    }

    /// Immutable access to agent radii.
    #[must_use]
    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    /// Immutable access to top speeds.
    #[must_use]
    pub fn max_speeds(&self) -> &[f32] {
        &self.max_speeds
    }

    /// Immutable access to accelerations.
    #[must_use]
    pub fn accelerations(&self) -> &[f32] {
        &self.accelerations
    }

    /// Immutable access to responsibility factors.
    #[must_use]
    pub fn responsibility_factors(&self) -> &[f32] {
        &self.responsibility_factors
    }

    /// Immutable access to safety factors.
    #[must_use]
    pub fn safety_factors(&self) -> &[f32] {
        &self.safety_factors
    }

    /// Immutable access to inertia factors.
    #[must_use]
    pub fn inertia_factors(&self) -> &[f32] {
        &self.inertia_factors
    }

    /// Immutable access to the active flags.
    #[must_use]
    pub fn active(&self) -> &[bool] {
        &self.active
    }

    /// Immutable access to the arrival flags.
    #[must_use]
    pub fn reached_destination(&self) -> &[bool] {
        &self.reached_destination
    }

    /// Mutable access to the arrival flags.
    #[must_use]
    pub fn reached_destination_mut(&mut self) -> &mut [bool] {
        &mut self.reached_destination
    }
}

/// Combined snapshot of one agent's externally visible state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub index: usize,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: Vec2,
    pub destination: Vec2,
    pub active: bool,
    pub reached_destination: bool,
}

/// Dense, fixed-slot storage for all per-agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStore {
    columns: AgentColumns,
    filled: Vec<bool>,
}

impl AgentStore {
    /// Create a store with `len` uninitialized slots.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            columns: AgentColumns::new(len),
            filled: vec![false; len],
        }
    }

    /// Number of agent slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when the store has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    fn check_index(&self, index: usize) -> Result<(), SimulationError> {
        if index >= self.len() {
            return Err(SimulationError::AgentOutOfRange {
                index,
                population: self.len(),
            });
        }
        Ok(())
    }

    /// Initialize one agent slot. Each slot accepts exactly one insertion
    /// during setup; inclusion is toggled with [`AgentStore::set_active`]
    /// afterwards.
    pub fn add_agent(
        &mut self,
        index: usize,
        position: Vec2,
        destination: Vec2,
        personality: Personality,
    ) -> Result<(), SimulationError> {
        self.check_index(index)?;
        personality.validate()?;
        if self.filled[index] {
            return Err(SimulationError::SlotAlreadyFilled(index));
        }
        self.filled[index] = true;

        let offset = destination - position;
        let heading = if offset.length_sq() == 0.0 {
            Vec2::new(1.0, 0.0)
        } else {
            offset.normalized_or_zero()
        };

        self.columns.positions[index] = position;
        self.columns.velocities[index] = Vec2::ZERO;
        self.columns.new_velocities[index] = Vec2::ZERO;
        self.columns.destinations[index] = destination;
        self.columns.headings[index] = heading;
        self.columns.radii[index] = personality.radius;
        self.columns.max_speeds[index] = personality.max_speed;
        self.columns.accelerations[index] = personality.acceleration;
        self.columns.responsibility_factors[index] = personality.responsibility_factor;
        self.columns.safety_factors[index] = personality.safety_factor;
        self.columns.inertia_factors[index] = personality.inertia_factor;
        self.columns.active[index] = true;
        self.columns.reached_destination[index] = false;
        Ok(())
    }

    /// Toggle an agent's inclusion in neighbor queries and planning.
    pub fn set_active(&mut self, index: usize, active: bool) -> Result<(), SimulationError> {
        self.check_index(index)?;
        self.columns.active[index] = active;
        Ok(())
    }

    /// Re-target an agent, clearing its sticky arrival flag so it resumes
    /// pursuit on the next tick.
    pub fn assign_destination(
        &mut self,
        index: usize,
        destination: Vec2,
    ) -> Result<(), SimulationError> {
        self.check_index(index)?;
        self.columns.destinations[index] = destination;
        self.columns.reached_destination[index] = false;
        Ok(())
    }

    /// Produce a copy of one agent's externally visible state.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> Option<AgentSnapshot> {
        if index >= self.len() {
            return None;
        }
        Some(AgentSnapshot {
            index,
            position: self.columns.positions[index],
            velocity: self.columns.velocities[index],
            heading: self.columns.headings[index],
            destination: self.columns.destinations[index],
            active: self.columns.active[index],
            reached_destination: self.columns.reached_destination[index],
        })
    }
}

/// Per-agent neighbor lists, rebuilt every tick. Flat layout: agent `i`
/// owns `indices[i * max_neighbors ..]` up to `counts[i]` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborTable {
    max_neighbors: usize,
    indices: Vec<u32>,
    counts: Vec<u32>,
    colliding: Vec<bool>,
}

impl NeighborTable {
    fn new(agents: usize, max_neighbors: usize) -> Self {
        Self {
            max_neighbors,
            indices: vec![0; agents * max_neighbors],
            counts: vec![0; agents],
            colliding: vec![false; agents],
        }
    }

    /// The recorded neighbor indices of agent `index`, ascending by distance
    /// at observation time.
    #[must_use]
    pub fn neighbors_of(&self, index: usize) -> &[u32] {
        let start = index * self.max_neighbors;
        &self.indices[start..start + self.counts[index] as usize]
    }

    /// Whether agent `index` overlapped any recorded neighbor this tick.
    #[must_use]
    pub fn is_colliding(&self, index: usize) -> bool {
        self.colliding[index]
    }

    fn record(&mut self, index: usize, scan: &NeighborScan) {
        let start = index * self.max_neighbors;
        self.indices[start..start + scan.neighbors.len()].copy_from_slice(&scan.neighbors);
        self.counts[index] = scan.neighbors.len() as u32;
        self.colliding[index] = scan.colliding;
    }
}

#[derive(Debug, Default)]
struct NeighborScan {
    neighbors: Vec<u32>,
    colliding: bool,
}

#[derive(Debug, Clone, Copy)]
struct IntegrationResult {
    position: Vec2,
    velocity: Vec2,
    heading: Option<Vec2>,
    reached: bool,
}

/// Summary emitted after every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: Tick,
    /// Agents currently included in the simulation.
    pub active_count: usize,
    /// Agents whose sticky arrival flag is set.
    pub arrived_count: usize,
}

/// Aggregate payload forwarded to sinks on the configured interval.
#[derive(Debug, Clone)]
pub struct TickBatch {
    pub summary: TickSummary,
    pub agents: Vec<AgentSnapshot>,
}

/// Per-tick output sink for renderers and recorders.
pub trait SimulationSink: Send {
    fn on_tick(&mut self, batch: &TickBatch);
}

/// No-op sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl SimulationSink for NullSink {
    fn on_tick(&mut self, _batch: &TickBatch) {}
}

/// Shared, phase-immutable inputs for one planning pass. Each worker reads
/// these slices and writes only its own output slot.
struct PlannerPass<'a> {
    method: AvoidanceMethod,
    delta_time: f32,
    num_directions: usize,
    positions: &'a [Vec2],
    velocities: &'a [Vec2],
    destinations: &'a [Vec2],
    radii: &'a [f32],
    max_speeds: &'a [f32],
    responsibility_factors: &'a [f32],
    safety_factors: &'a [f32],
    inertia_factors: &'a [f32],
    active: &'a [bool],
    reached_destination: &'a [bool],
    neighbors: &'a NeighborTable,
}

impl PlannerPass<'_> {
    fn preferred_velocity(&self, index: usize) -> Vec2 {
        (self.destinations[index] - self.positions[index]).normalized_or_zero()
            * self.max_speeds[index]
    }

    /// Relative velocity of the reciprocal formulation: the candidate is
    /// blended with the current velocity by the inverse responsibility share
    /// before subtracting the neighbor's velocity.
    fn reciprocal_velocity(&self, index: usize, neighbor: usize, candidate: Vec2) -> Vec2 {
        let inverse_share = 1.0 / self.responsibility_factors[index];
        candidate * inverse_share + self.velocities[index] * (1.0 - inverse_share)
            - self.velocities[neighbor]
    }

    /// Hybrid formulation: displace the obstacle apex halfway along the
    /// shortest exit from the velocity obstacle before measuring the
    /// relative velocity against it.
    fn hybrid_velocity(
        &self,
        index: usize,
        neighbor: usize,
        candidate: Vec2,
        combined_radius: f32,
    ) -> Vec2 {
        let relative = self.reciprocal_velocity(index, neighbor, candidate);
        let exit = exit_displacement(
            self.positions[index],
            self.positions[neighbor],
            relative,
            combined_radius,
        );
        let apex = self.velocities[neighbor] + exit * 0.5;
        candidate - apex
    }

    /// Penalty of one candidate velocity against the recorded neighbor set.
    fn penalty(&self, index: usize, candidate: Vec2, preferred: Vec2, colliding: bool) -> f32 {
        let distance_cost = (candidate - preferred).length();
        let inertia_cost = self.inertia_factors[index] * (candidate - self.velocities[index]).length();
        let mut time_cost = TIME_SENTINEL;
        for &neighbor in self.neighbors.neighbors_of(index) {
            let neighbor = neighbor as usize;
            let combined_radius = self.radii[index] + self.radii[neighbor];
            let relative = match self.method {
                AvoidanceMethod::Rvo => self.reciprocal_velocity(index, neighbor, candidate),
                AvoidanceMethod::Hrvo => {
                    self.hybrid_velocity(index, neighbor, candidate, combined_radius)
                }
            };
            let time = time_to_collision(
                self.positions[index],
                relative,
                self.positions[neighbor],
                combined_radius,
                colliding,
            );
            // While overlapping, reward the fastest exit and penalize speed
            // so the agent backs out instead of grinding through.
            let cost = if colliding {
                -(time / self.delta_time.max(f32::EPSILON))
                    - candidate.length_sq()
                        / (self.max_speeds[index] * self.max_speeds[index]).max(f32::EPSILON)
            } else {
                time
            };
            if cost < time_cost {
                time_cost = cost;
            }
        }
        self.safety_factors[index] / time_cost + distance_cost + inertia_cost
    }

    /// Argmin of the penalty over the preferred velocity and the sampled
    /// disk. The preferred velocity seeds the running minimum, so the chosen
    /// penalty is never worse than its penalty; ties keep the first minimum
    /// found in iteration order.
    fn choose_velocity(&self, index: usize) -> Vec2 {
        if !self.active[index] || self.reached_destination[index] {
            return Vec2::ZERO;
        }
        let preferred = self.preferred_velocity(index);
        if self.neighbors.neighbors_of(index).is_empty() {
            return preferred;
        }
        let colliding = self.neighbors.is_colliding(index);

        let mut best = preferred;
        let mut min_penalty = self.penalty(index, preferred, preferred, colliding);

        let angle_step = FULL_TURN / self.num_directions as f32;
        for direction in 0..self.num_directions {
            let theta = direction as f32 * angle_step;
            let (sin, cos) = theta.sin_cos();
            let mut speed = self.max_speeds[index];
            while speed > 0.0 {
                let candidate = Vec2::new(speed * sin, speed * cos);
                let penalty = self.penalty(index, candidate, preferred, colliding);
                if penalty < min_penalty {
                    min_penalty = penalty;
                    best = candidate;
                }
                speed -= SPEED_SAMPLE_STEP;
            }
        }
        best
    }
}

/// Time until the relative trajectory `relative` first touches the disk of
/// `combined_radius` around `pb`, seen from `pa`. For an agent already in
/// contact the solver runs backwards along the ray, yielding the exit time.
/// Non-intersecting rays and negligible relative speed report the finite
/// sentinel instead of infinity.
fn time_to_collision(
    pa: Vec2,
    relative: Vec2,
    pb: Vec2,
    combined_radius: f32,
    colliding: bool,
) -> f32 {
    let ba = pb - pa;
    let speed_sq = relative.length_sq();
    let sentinel = if colliding {
        -TIME_SENTINEL
    } else {
        TIME_SENTINEL
    };
    if speed_sq <= f32::EPSILON {
        return sentinel;
    }
    let discriminant =
        combined_radius * combined_radius * speed_sq - relative.perp_dot(ba).powi(2);
    if discriminant <= 0.0 {
        return sentinel;
    }
    let root = discriminant.sqrt();
    let time = if colliding {
        (relative.dot(ba) + root) / speed_sq
    } else {
        (relative.dot(ba) - root) / speed_sq
    };
    if time < 0.0 { sentinel } else { time }
}

/// Shortest displacement that carries `relative` out of the velocity
/// obstacle cone spanned by the two tangents from `pa` to the disk of
/// `combined_radius` around `pb`. The tangent half-angle clamps at a quarter
/// turn when the disks already overlap, keeping the legs finite.
fn exit_displacement(pa: Vec2, pb: Vec2, relative: Vec2, combined_radius: f32) -> Vec2 {
    let ba = pb - pa;
    let dist = ba.length();
    if dist <= f32::EPSILON {
        return Vec2::ZERO;
    }
    let dir = ba * (1.0 / dist);
    let half_angle = (combined_radius / dist).min(1.0).asin();
    let tangent_left = dir.rotated(half_angle);
    let tangent_right = dir.rotated(-half_angle);
    let leg = if relative.dot(tangent_left) < relative.dot(tangent_right) {
        tangent_left
    } else {
        tangent_right
    };
    leg * relative.dot(leg) - relative
}

/// Start/destination pair for one agent under the configured spawn style.
fn spawn_endpoints(config: &SimulationConfig, rng: &mut SmallRng, agent_index: usize) -> (Vec2, Vec2) {
    let centroid = config.bounds * 0.5;
    match config.spawn_style {
        SpawnStyle::Rows => {
            let inner_width = config.bounds.x - config.bound_edge_buffer * 2.0;
            let inner_height = config.bounds.y - config.bound_edge_buffer * 2.0;
            let rows = (config.num_agents / 2).max(1);
            let on_left = agent_index % 2 == 1;
            let y = centroid.y + inner_height / 2.0
                - inner_height / (rows + 1) as f32 * ((agent_index / 2) + 1) as f32;
            let left_x = centroid.x - inner_width / 2.0;
            let right_x = centroid.x + inner_width / 2.0;
            if on_left {
                (Vec2::new(left_x, y), Vec2::new(right_x, y))
            } else {
                (Vec2::new(right_x, y), Vec2::new(left_x, y))
            }
        }
        SpawnStyle::Circular => {
            let spawn_distance =
                config.bounds.x.min(config.bounds.y) / 2.0 - config.bound_edge_buffer;
            let theta = agent_index as f32 * FULL_TURN / config.num_agents as f32;
            let ray = Vec2::new(theta.sin(), theta.cos()) * spawn_distance;
            (centroid + ray, centroid - ray)
        }
        SpawnStyle::Random => {
            let position = Vec2::new(
                rng.random_range(0.0..config.bounds.x),
                rng.random_range(0.0..config.bounds.y),
            );
            let destination = Vec2::new(
                rng.random_range(0.0..config.bounds.x),
                rng.random_range(0.0..config.bounds.y),
            );
            (position, destination)
        }
    }
}

/// The simulation driver. Owns the agent store, the neighbor table, and the
/// spatial index; hands out read-only views during each phase and applies
/// writes only at phase boundaries.
pub struct Simulation {
    config: SimulationConfig,
    tick: Tick,
    rng: SmallRng,
    store: AgentStore,
    neighbors: NeighborTable,
    index: UniformGridIndex,
    index_dirty: bool,
    position_scratch: Vec<(f32, f32)>,
    history: VecDeque<TickSummary>,
    sink: Box<dyn SimulationSink>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.store.len())
            .finish()
    }
}

impl Simulation {
    /// Instantiate an empty-slot simulation from the supplied configuration.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Instantiate a simulation with a per-tick output sink.
    pub fn with_sink(
        config: SimulationConfig,
        sink: Box<dyn SimulationSink>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let index = UniformGridIndex::new(config.index_cell_size, config.bounds.x, config.bounds.y);
        let history_capacity = config.history_capacity;
        Ok(Self {
            store: AgentStore::new(config.num_agents),
            neighbors: NeighborTable::new(config.num_agents, config.max_neighbors),
            tick: Tick::zero(),
            rng,
            index,
            index_dirty: true,
            position_scratch: Vec::with_capacity(config.num_agents),
            history: VecDeque::with_capacity(history_capacity),
            sink,
            config,
        })
    }

    /// Instantiate a simulation and fill every slot via the configured spawn
    /// style, drawing personalities from the demographic table.
    pub fn generate(
        config: SimulationConfig,
        demographics: &Demographics,
    ) -> Result<Self, SimulationError> {
        demographics.validate()?;
        let mut simulation = Self::new(config)?;
        for index in 0..simulation.config.num_agents {
            let (position, destination) =
                spawn_endpoints(&simulation.config, &mut simulation.rng, index);
            let personality = demographics.sample(&mut simulation.rng);
            simulation.add_agent(index, position, destination, personality)?;
        }
        simulation.rebuild_index();
        Ok(simulation)
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the agent store.
    #[must_use]
    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    /// Mutable access to the agent store (setup and external control).
    #[must_use]
    pub fn store_mut(&mut self) -> &mut AgentStore {
        &mut self.store
    }

    /// The neighbor lists recorded by the most recent observation phase.
    #[must_use]
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the output sink.
    pub fn set_sink(&mut self, sink: Box<dyn SimulationSink>) {
        self.sink = sink;
    }

    /// Initialize one agent slot and mark the index stale.
    pub fn add_agent(
        &mut self,
        index: usize,
        position: Vec2,
        destination: Vec2,
        personality: Personality,
    ) -> Result<(), SimulationError> {
        self.store.add_agent(index, position, destination, personality)?;
        self.index_dirty = true;
        Ok(())
    }

    /// Toggle an agent's inclusion in neighbor queries and planning.
    pub fn set_active(&mut self, index: usize, active: bool) -> Result<(), SimulationError> {
        self.store.set_active(index, active)
    }

    /// Re-target an agent, clearing its sticky arrival flag.
    pub fn assign_destination(
        &mut self,
        index: usize,
        destination: Vec2,
    ) -> Result<(), SimulationError> {
        self.store.assign_destination(index, destination)
    }

    /// True when every active agent has reached its destination.
    #[must_use]
    pub fn all_arrived(&self) -> bool {
        let columns = self.store.columns();
        columns
            .active()
            .iter()
            .zip(columns.reached_destination())
            .all(|(&active, &reached)| !active || reached)
    }

    /// Snapshot every agent slot.
    #[must_use]
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        (0..self.store.len())
            .filter_map(|index| self.store.snapshot(index))
            .collect()
    }

    /// Execute one tick: observe neighbors against last tick's index, plan
    /// velocities, integrate, then rebuild the index from the new positions.
    /// `delta_time` is supplied by the caller so the core runs
    /// deterministically outside any real-time loop.
    pub fn step(&mut self, delta_time: f32) -> TickSummary {
        if self.index_dirty {
            self.rebuild_index();
        }
        self.stage_observe();
        self.stage_plan(delta_time);
        self.stage_integrate(delta_time);
        self.rebuild_index();

        self.tick = self.tick.next();
        let summary = self.summarize();
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);

        let interval = self.config.summary_interval;
        if interval > 0 && self.tick.0.is_multiple_of(u64::from(interval)) {
            let batch = TickBatch {
                summary,
                agents: self.snapshots(),
            };
            self.sink.on_tick(&batch);
        }
        summary
    }

    fn summarize(&self) -> TickSummary {
        let columns = self.store.columns();
        let active_count = columns.active().iter().filter(|&&a| a).count();
        let arrived_count = columns
            .reached_destination()
            .iter()
            .filter(|&&r| r)
            .count();
        TickSummary {
            tick: self.tick,
            active_count,
            arrived_count,
        }
    }

    /// Observation phase: each agent scans the index result in ascending
    /// distance order. The first overlapping neighbor resets the accumulated
    /// list and switches acceptance to overlapping neighbors only; the scan
    /// stops once `max_neighbors` entries accumulate. The switch prioritizes
    /// overlap recovery over merely-nearby agents and is order dependent by
    /// design.
    fn stage_observe(&mut self) {
        let agent_count = self.store.len();
        if agent_count == 0 {
            return;
        }
        let columns = self.store.columns();
        let positions = columns.positions();
        let radii = columns.radii();
        let active = columns.active();
        let visual_radius = self.config.visual_radius;
        let max_neighbors = self.config.max_neighbors;
        let index = &self.index;

        let scans: Vec<NeighborScan> = (0..agent_count)
            .into_par_iter()
            .map_init(Vec::<RadiusHit>::new, |hits, i| {
                let mut scan = NeighborScan::default();
                if !active[i] {
                    return scan;
                }
                index.query_radius_sorted((positions[i].x, positions[i].y), visual_radius, hits);
                for &(j, dist_sq) in hits.iter() {
                    if j == i || !active[j] {
                        continue;
                    }
                    let combined = radii[i] + radii[j];
                    if dist_sq.into_inner() < combined * combined {
                        if !scan.colliding {
                            scan.colliding = true;
                            scan.neighbors.clear();
                        }
                        scan.neighbors.push(j as u32);
                    } else if !scan.colliding {
                        scan.neighbors.push(j as u32);
                    }
                    if scan.neighbors.len() == max_neighbors {
                        break;
                    }
                }
                scan
            })
            .collect();

        for (i, scan) in scans.iter().enumerate() {
            self.neighbors.record(i, scan);
        }
    }

    /// Planning phase: one penalty minimization per agent over the neighbor
    /// lists finalized by observation.
    fn stage_plan(&mut self, delta_time: f32) {
        let agent_count = self.store.len();
        if agent_count == 0 {
            return;
        }
        let chosen: Vec<Vec2> = {
            let columns = self.store.columns();
            let pass = PlannerPass {
                method: self.config.method,
                delta_time,
                num_directions: self.config.num_candidate_directions,
                positions: columns.positions(),
                velocities: columns.velocities(),
                destinations: columns.destinations(),
                radii: columns.radii(),
                max_speeds: columns.max_speeds(),
                responsibility_factors: columns.responsibility_factors(),
                safety_factors: columns.safety_factors(),
                inertia_factors: columns.inertia_factors(),
                active: columns.active(),
                reached_destination: columns.reached_destination(),
                neighbors: &self.neighbors,
            };
            (0..agent_count)
                .into_par_iter()
                .map(|i| pass.choose_velocity(i))
                .collect()
        };
        self.store
            .columns_mut()
            .new_velocities_mut()
            .copy_from_slice(&chosen);
    }

    /// Integration phase: apply planned velocities. Arrived and inactive
    /// agents record the planned velocity without displacement; the arrival
    /// test runs against the pre-move position, and the flag only latches on
    /// here (the early-out keeps it set on every later tick).
    fn stage_integrate(&mut self, delta_time: f32) {
        let agent_count = self.store.len();
        if agent_count == 0 {
            return;
        }
        let arrival_buffer = self.config.arrival_buffer;
        let results: Vec<IntegrationResult> = {
            let columns = self.store.columns();
            let positions = columns.positions();
            let destinations = columns.destinations();
            let new_velocities = columns.new_velocities();
            let active = columns.active();
            let reached = columns.reached_destination();

            (0..agent_count)
                .into_par_iter()
                .map(|i| {
                    if !active[i] || reached[i] {
                        return IntegrationResult {
                            position: positions[i],
                            velocity: new_velocities[i],
                            heading: None,
                            reached: reached[i],
                        };
                    }
                    let offset = destinations[i] - positions[i];
                    let at_destination = offset.length() < arrival_buffer;
                    let velocity = new_velocities[i];
                    let position = positions[i] + velocity * delta_time;
                    let heading = (!at_destination && velocity.length_sq() > 0.0)
                        .then(|| velocity.normalized_or_zero());
                    IntegrationResult {
                        position,
                        velocity,
                        heading,
                        reached: at_destination,
                    }
                })
                .collect()
        };

        let columns = self.store.columns_mut();
        {
            let positions = columns.positions_mut();
            for (i, result) in results.iter().enumerate() {
                positions[i] = result.position;
            }
        }
        {
            let velocities = columns.velocities_mut();
            for (i, result) in results.iter().enumerate() {
                velocities[i] = result.velocity;
            }
        }
        {
            let headings = columns.headings_mut();
            for (i, result) in results.iter().enumerate() {
                if let Some(heading) = result.heading {
                    headings[i] = heading;
                }
            }
        }
        {
            let reached = columns.reached_destination_mut();
            for (i, result) in results.iter().enumerate() {
                reached[i] = result.reached;
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.position_scratch.clear();
        self.position_scratch
            .extend(self.store.columns().positions().iter().map(|p| (p.x, p.y)));
        // Cannot fail: cell size and bounds were validated at construction.
        let _ = self.index.rebuild(&self.position_scratch);
        self.index_dirty = false;
    }
}
