//! Crossflow: a concurrent traffic-flow simulation
//!
//! Roads, intersections and signals are shared resources; every vehicle
//! and every signal timer runs on its own thread and negotiates access
//! through capacity-bounded admission. The library is headless; the
//! `crossflow` binary drives a demo grid city from the command line.

pub mod agent;
pub mod controller;
pub mod intersection;
pub mod road;
pub mod signal;
pub mod snapshot;
pub mod topology;
pub mod types;

pub use agent::{AgentState, AgentTiming, TripReport, VehicleAgent};
pub use controller::{SimConfig, SimulationController};
pub use intersection::{AdmissionPolicy, Intersection, PolicyTiming};
pub use road::Road;
pub use signal::{Phase, SignalTiming};
pub use snapshot::{SimulationStats, Snapshot};
pub use topology::{Route, Topology, TopologyBuilder, TopologyError};
pub use types::{AgentId, IntersectionId, Position, RoadClass, RoadId, VehicleKind};
