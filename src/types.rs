//! Core types for the traffic simulation
//!
//! Identifier newtypes, road geometry, and the plain-data lookup tables
//! for road classes and vehicle kinds.

use rand::Rng;
use std::fmt;

/// A wrapper type for road IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoadId(pub usize);

/// A wrapper type for intersection IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntersectionId(pub usize);

/// A wrapper type for vehicle agent IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub usize);

impl fmt::Display for RoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl fmt::Display for IntersectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{}", self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// A 2D position in the simulation plane
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn lerp(&self, other: &Position, t: f32) -> Position {
        Position {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }
}

/// Functional class of a road, affecting speed limit and how sharply
/// travel time reacts to congestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoadClass {
    Residential,
    Arterial,
    Highway,
}

impl RoadClass {
    /// Speed limit in simulation units per second
    pub fn speed_limit(&self) -> f32 {
        match self {
            RoadClass::Residential => 8.0,
            RoadClass::Arterial => 14.0,
            RoadClass::Highway => 25.0,
        }
    }

    /// How strongly occupancy counts toward the congestion ratio.
    /// Residential streets saturate faster than highways.
    pub fn congestion_sensitivity(&self) -> f32 {
        match self {
            RoadClass::Residential => 1.2,
            RoadClass::Arterial => 1.0,
            RoadClass::Highway => 0.8,
        }
    }
}

/// Kind of vehicle an agent drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleKind {
    Car,
    Truck,
    Motorcycle,
    Bus,
}

impl VehicleKind {
    pub const ALL: [VehicleKind; 4] = [
        VehicleKind::Car,
        VehicleKind::Truck,
        VehicleKind::Motorcycle,
        VehicleKind::Bus,
    ];

    /// Multiplier on base travel speed
    pub fn speed_factor(&self) -> f32 {
        match self {
            VehicleKind::Car => 1.0,
            VehicleKind::Truck => 0.7,
            VehicleKind::Motorcycle => 1.3,
            VehicleKind::Bus => 0.8,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleKind::Car => "Car",
            VehicleKind::Truck => "Truck",
            VehicleKind::Motorcycle => "Motorcycle",
            VehicleKind::Bus => "Bus",
        };
        f.write_str(name)
    }
}
