//! Read-only state and metrics views
//!
//! Pure data extracted from the live simulation for external consumers
//! (CLI, HTTP, GUI layers). No wire format is mandated here; façades
//! serialize these structures however they like.

use log::info;
use std::time::Duration;

use crate::agent::AgentState;
use crate::intersection::AdmissionPolicy;
use crate::signal::Phase;
use crate::types::{AgentId, IntersectionId, Position, RoadId, VehicleKind};

#[derive(Debug, Clone)]
pub struct RoadSnapshot {
    pub id: RoadId,
    pub occupancy: usize,
    pub capacity: usize,
    pub congestion: f32,
    pub speed_limit: f32,
}

#[derive(Debug, Clone)]
pub struct IntersectionSnapshot {
    pub id: IntersectionId,
    pub policy: AdmissionPolicy,
    pub waiting: usize,
    pub occupied: usize,
}

#[derive(Debug, Clone)]
pub struct SignalSnapshot {
    pub road: RoadId,
    pub phase: Phase,
    pub time_in_phase: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub kind: VehicleKind,
    pub state: AgentState,
    /// Interpolated from progress along the current road, if any
    pub position: Option<Position>,
    pub current_road: Option<RoadId>,
    pub progress: f32,
    pub distance: f32,
    pub wait: Duration,
}

/// A consistent-enough point-in-time view of the whole simulation.
/// Individual resources are sampled independently; the snapshot makes no
/// cross-resource atomicity promise.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub running: bool,
    pub roads: Vec<RoadSnapshot>,
    pub intersections: Vec<IntersectionSnapshot>,
    pub signals: Vec<SignalSnapshot>,
    pub agents: Vec<AgentSnapshot>,
    pub stats: SimulationStats,
}

/// Aggregate counters surfaced by the metrics query
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    pub active_agents: usize,
    pub total_spawned: usize,
    pub completed: usize,
    pub abandoned: usize,
    /// Mean base speed over finished trips
    pub average_speed: f32,
    /// Mean congestion over all roads at sample time
    pub average_congestion: f32,
    pub total_distance: f32,
    pub total_wait: Duration,
}

impl SimulationStats {
    pub fn completion_rate(&self) -> f32 {
        if self.total_spawned == 0 {
            0.0
        } else {
            self.completed as f32 / self.total_spawned as f32 * 100.0
        }
    }

    /// Final-summary block, mirrored by the integration tests
    pub fn log_summary(&self) {
        info!("=== SIMULATION COMPLETE ===");
        info!("Total agents spawned: {}", self.total_spawned);
        info!("Total agents completed: {}", self.completed);
        info!("Total agents abandoned: {}", self.abandoned);
        info!("Active agents: {}", self.active_agents);
        info!("Average speed: {:.2}", self.average_speed);
        info!("Average congestion: {:.2}", self.average_congestion);
        info!("Total distance travelled: {:.1}", self.total_distance);
        info!("Completion rate: {:.1}%", self.completion_rate());
    }
}
