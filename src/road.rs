//! Road resource: a capacity-bounded directed segment
//!
//! Roads never block. `enter` either admits the agent or fails
//! immediately; all waiting and retry logic lives with the caller.

use log::trace;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::{AgentId, Position, RoadClass, RoadId};

/// A directed road segment shared by concurrent vehicle agents
pub struct Road {
    id: RoadId,
    start: Position,
    end: Position,
    length: f32,
    capacity: usize,
    class: RoadClass,
    /// Static ambient traffic load, added on top of live occupancy
    base_density: f32,
    occupants: Mutex<HashSet<AgentId>>,
    entries: AtomicU64,
    exits: AtomicU64,
}

impl Road {
    pub fn new(
        id: RoadId,
        capacity: usize,
        class: RoadClass,
        start: Position,
        end: Position,
        base_density: f32,
    ) -> Self {
        Self {
            id,
            start,
            end,
            length: start.distance(&end),
            capacity,
            class,
            base_density,
            occupants: Mutex::new(HashSet::new()),
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> RoadId {
        self.id
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn class(&self) -> RoadClass {
        self.class
    }

    pub fn speed_limit(&self) -> f32 {
        self.class.speed_limit()
    }

    /// Try to admit an agent. Succeeds iff the road is below capacity;
    /// fails without side effects otherwise. The capacity check and the
    /// insert happen under one lock so the occupant count can never
    /// exceed capacity.
    pub fn enter(&self, agent: AgentId) -> bool {
        let mut occupants = self.occupants.lock().unwrap();
        if occupants.len() >= self.capacity {
            trace!("{}: road {} full", agent, self.id);
            return false;
        }
        let inserted = occupants.insert(agent);
        debug_assert!(inserted, "agent {agent} entered road {} twice", self.id);
        debug_assert!(occupants.len() <= self.capacity);
        self.entries.fetch_add(1, Ordering::Relaxed);
        trace!("{}: entered road {}", agent, self.id);
        inserted
    }

    /// Remove an agent from the road. Idempotent: removing an agent that
    /// is not present is a no-op, so failure/cancellation unwind paths
    /// can call this unconditionally.
    pub fn exit(&self, agent: AgentId) {
        let mut occupants = self.occupants.lock().unwrap();
        if occupants.remove(&agent) {
            self.exits.fetch_add(1, Ordering::Relaxed);
            trace!("{}: left road {}", agent, self.id);
        }
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.lock().unwrap().len()
    }

    /// Congestion ratio in [0, 1]: live occupancy scaled by the road
    /// class sensitivity, plus the static base density.
    pub fn congestion(&self) -> f32 {
        let occupancy = self.occupant_count() as f32 / self.capacity.max(1) as f32;
        (occupancy * self.class.congestion_sensitivity() + self.base_density).clamp(0.0, 1.0)
    }

    /// Total successful `enter` calls over the road's lifetime
    pub fn total_entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Total effective `exit` calls over the road's lifetime
    pub fn total_exits(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }
}
