//! Vehicle agent: one concurrent task walking a route
//!
//! Each agent independently negotiates signal phases, road capacity and
//! intersection admission for every segment of its route, blocking only
//! on the resource it currently needs. Contention outcomes are expected
//! and drive retry/backoff, never errors. Every suspension point doubles
//! as a cancellation point.

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::signal::Phase;
use crate::topology::{Route, Segment};
use crate::types::{AgentId, RoadId, VehicleKind};

/// Lifecycle state of a vehicle agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Pending,
    OnRoad,
    AtIntersection,
    Completed,
    Abandoned,
}

impl AgentState {
    fn as_u8(self) -> u8 {
        match self {
            AgentState::Pending => 0,
            AgentState::OnRoad => 1,
            AgentState::AtIntersection => 2,
            AgentState::Completed => 3,
            AgentState::Abandoned => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AgentState::Pending,
            1 => AgentState::OnRoad,
            2 => AgentState::AtIntersection,
            3 => AgentState::Completed,
            _ => AgentState::Abandoned,
        }
    }

    /// Completed or abandoned agents are done and can be reaped
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Abandoned)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Pending => "pending",
            AgentState::OnRoad => "on-road",
            AgentState::AtIntersection => "at-intersection",
            AgentState::Completed => "completed",
            AgentState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Observable status of one agent, published through atomics.
///
/// Only the owning agent task writes; snapshots read without locking any
/// agent-owned state.
pub struct AgentStatus {
    id: AgentId,
    kind: VehicleKind,
    state: AtomicU8,
    route_index: AtomicUsize,
    /// Progress fraction on the active road, stored as f32 bits
    progress: AtomicU32,
    wait_ms: AtomicU64,
    /// Cumulative distance, stored as f32 bits
    distance: AtomicU32,
    /// Active road id, usize::MAX when not on a road
    current_road: AtomicUsize,
}

impl AgentStatus {
    fn new(id: AgentId, kind: VehicleKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            state: AtomicU8::new(AgentState::Pending.as_u8()),
            route_index: AtomicUsize::new(0),
            progress: AtomicU32::new(0f32.to_bits()),
            wait_ms: AtomicU64::new(0),
            distance: AtomicU32::new(0f32.to_bits()),
            current_road: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn kind(&self) -> VehicleKind {
        self.kind
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn route_index(&self) -> usize {
        self.route_index.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn total_wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms.load(Ordering::Relaxed))
    }

    pub fn total_distance(&self) -> f32 {
        f32::from_bits(self.distance.load(Ordering::Relaxed))
    }

    pub fn current_road(&self) -> Option<RoadId> {
        match self.current_road.load(Ordering::Relaxed) {
            usize::MAX => None,
            raw => Some(RoadId(raw)),
        }
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_progress(&self, value: f32) {
        // Monotonic within a segment; entering a new segment resets it.
        self.progress.store(value.to_bits(), Ordering::Relaxed);
    }

    fn set_current_road(&self, road: Option<RoadId>) {
        self.current_road
            .store(road.map_or(usize::MAX, |r| r.0), Ordering::Relaxed);
    }

    fn add_wait(&self, waited: Duration) {
        self.wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    fn add_distance(&self, meters: f32) {
        let prev = f32::from_bits(self.distance.load(Ordering::Relaxed));
        self.distance
            .store((prev + meters).to_bits(), Ordering::Relaxed);
    }
}

/// Traversal tuning. Defaults give each segment a 15 s budget and split
/// travel into 30 progress steps.
#[derive(Debug, Clone, Copy)]
pub struct AgentTiming {
    /// Overall budget for one segment attempt, light wait included
    pub segment_deadline: Duration,
    /// Interval between signal phase polls
    pub signal_poll: Duration,
    /// Segment retries before falling back a segment (or abandoning)
    pub max_retries: u32,
    /// Randomized backoff bounds between segment retries. Randomization
    /// is required: identical retry intervals across many agents
    /// re-synchronize contention instead of dissolving it.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Progress steps per road traversal
    pub travel_steps: u32,
}

impl Default for AgentTiming {
    fn default() -> Self {
        Self {
            segment_deadline: Duration::from_millis(15_000),
            signal_poll: Duration::from_millis(100),
            max_retries: 3,
            backoff_min: Duration::from_millis(150),
            backoff_max: Duration::from_millis(600),
            travel_steps: 30,
        }
    }
}

/// Terminal report sent to the controller when an agent's task ends
#[derive(Debug, Clone)]
pub struct TripReport {
    pub agent: AgentId,
    pub kind: VehicleKind,
    pub completed: bool,
    pub distance: f32,
    pub wait: Duration,
    pub speed: f32,
    pub roads_visited: Vec<RoadId>,
}

enum SegmentOutcome {
    Done { distance: f32 },
    Failed,
    Cancelled,
}

/// One simulated vehicle's independent control flow
pub struct VehicleAgent {
    id: AgentId,
    kind: VehicleKind,
    /// Base speed in units/s fraction: kind factor with per-agent variation
    speed: f32,
    route: Route,
    timing: AgentTiming,
    status: Arc<AgentStatus>,
    stop: Arc<AtomicBool>,
    reports: Sender<TripReport>,
}

impl VehicleAgent {
    pub fn new<R: Rng + ?Sized>(
        id: AgentId,
        kind: VehicleKind,
        route: Route,
        timing: AgentTiming,
        stop: Arc<AtomicBool>,
        reports: Sender<TripReport>,
        rng: &mut R,
    ) -> Self {
        let speed = kind.speed_factor() * rng.random_range(0.8..1.2);
        Self {
            id,
            kind,
            speed,
            route,
            timing,
            status: AgentStatus::new(id, kind),
            stop,
            reports,
        }
    }

    pub fn status(&self) -> Arc<AgentStatus> {
        Arc::clone(&self.status)
    }

    /// Drive the whole route. Consumes the agent; meant to be the body
    /// of one spawned task.
    pub fn run(self) {
        let mut rng = rand::rng();
        let mut index = 0usize;
        let mut retries = 0u32;
        let mut roads_visited = Vec::new();
        debug!(
            "{} ({}) starting route of {} segments",
            self.id,
            self.kind,
            self.route.segments.len()
        );

        let final_state = loop {
            if index >= self.route.segments.len() {
                break AgentState::Completed;
            }
            if self.stopped() {
                break AgentState::Abandoned;
            }

            self.status.route_index.store(index, Ordering::Relaxed);
            let segment = &self.route.segments[index];

            match self.attempt_segment(segment, &mut rng) {
                SegmentOutcome::Done { distance } => {
                    self.status.add_distance(distance);
                    roads_visited.push(segment.road.id());
                    index += 1;
                    retries = 0;
                }
                SegmentOutcome::Cancelled => break AgentState::Abandoned,
                SegmentOutcome::Failed => {
                    retries += 1;
                    if retries > self.timing.max_retries {
                        // Exhausted: re-attempt the previous segment, or
                        // give up entirely at the route start.
                        if index > 0 {
                            index -= 1;
                            retries = 0;
                            debug!("{} falling back to segment {}", self.id, index);
                        } else {
                            warn!("{} abandoning route at first segment", self.id);
                            break AgentState::Abandoned;
                        }
                    } else if !self.backoff(&mut rng) {
                        break AgentState::Abandoned;
                    }
                }
            }
        };

        self.status.set_current_road(None);
        self.status.set_state(final_state);

        let report = TripReport {
            agent: self.id,
            kind: self.kind,
            completed: final_state == AgentState::Completed,
            distance: self.status.total_distance(),
            wait: self.status.total_wait(),
            speed: self.speed,
            roads_visited,
        };
        info!(
            "{} {} after {:.1} units, waited {:?}",
            self.id, final_state, report.distance, report.wait
        );
        // The controller may already be gone during shutdown.
        let _ = self.reports.send(report);
    }

    /// One attempt at one route segment: signal gate, road entry,
    /// intersection admission, travel, then release in reverse order of
    /// acquisition.
    fn attempt_segment<R: Rng>(&self, segment: &Segment, rng: &mut R) -> SegmentOutcome {
        let deadline = Instant::now() + self.timing.segment_deadline;

        if let Some(signal) = &segment.signal {
            match self.await_green(signal, deadline) {
                GateOutcome::Proceed => {}
                GateOutcome::Cancelled => return SegmentOutcome::Cancelled,
                GateOutcome::DeadlineExpired => return SegmentOutcome::Failed,
            }
        }

        let road = &segment.road;
        if !road.enter(self.id) {
            return SegmentOutcome::Failed;
        }
        self.status.set_current_road(Some(road.id()));
        self.status.set_progress(0.0);
        self.status.set_state(AgentState::OnRoad);

        if let Some(intersection) = &segment.intersection {
            self.status.set_state(AgentState::AtIntersection);
            let wait_started = Instant::now();
            let admitted = intersection.enter(self.id, deadline, &self.stop);
            self.status.add_wait(wait_started.elapsed());
            if !admitted {
                // Reverse of acquisition order: the road slot goes back
                // before this attempt is reported as failed.
                road.exit(self.id);
                self.status.set_current_road(None);
                return if self.stopped() {
                    SegmentOutcome::Cancelled
                } else {
                    SegmentOutcome::Failed
                };
            }
            self.status.set_state(AgentState::OnRoad);
        }

        let travelled = self.travel(segment, rng);

        if let Some(intersection) = &segment.intersection {
            intersection.exit(self.id);
        }
        road.exit(self.id);
        self.status.set_current_road(None);

        if travelled {
            SegmentOutcome::Done {
                distance: road.length(),
            }
        } else {
            SegmentOutcome::Cancelled
        }
    }

    /// Advance progress 0 -> 1 over a duration derived from road length,
    /// this agent's speed and the road's live congestion. Returns false
    /// when cancelled mid-travel.
    fn travel<R: Rng>(&self, segment: &Segment, rng: &mut R) -> bool {
        let road = &segment.road;
        let congestion = road.congestion();
        // Congestion at most doubles travel time.
        let congestion_factor = (1.0 - 0.5 * congestion).max(0.5);
        let effective_speed = (self.speed * road.speed_limit() * congestion_factor).max(0.1);
        let total = Duration::from_secs_f32(road.length() / effective_speed);
        let steps = self.timing.travel_steps.max(1);
        let step = total / steps;

        for i in 0..steps {
            if self.stopped() {
                return false;
            }
            self.status.set_progress(i as f32 / steps as f32);
            // Small per-step variation keeps movement organic.
            let variation = rng.random_range(0.8..1.2);
            std::thread::sleep(step.mul_f32(variation));
        }
        self.status.set_progress(1.0);
        true
    }

    /// Poll the signal until GREEN, bounded by the segment deadline.
    /// Time spent here counts toward the agent's cumulative wait.
    fn await_green(&self, signal: &crate::signal::SignalState, deadline: Instant) -> GateOutcome {
        let started = Instant::now();
        loop {
            if self.stopped() {
                self.status.add_wait(started.elapsed());
                return GateOutcome::Cancelled;
            }
            if signal.phase() == Phase::Green {
                self.status.add_wait(started.elapsed());
                return GateOutcome::Proceed;
            }
            let now = Instant::now();
            if now >= deadline {
                self.status.add_wait(started.elapsed());
                debug!("{} gave up waiting for green on road {}", self.id, signal.road_id());
                return GateOutcome::DeadlineExpired;
            }
            std::thread::sleep(self.timing.signal_poll.min(deadline - now));
        }
    }

    /// Randomized backoff between segment retries. Returns false when
    /// cancelled during the sleep.
    fn backoff<R: Rng>(&self, rng: &mut R) -> bool {
        let min = self.timing.backoff_min.as_millis() as u64;
        let max = (self.timing.backoff_max.as_millis() as u64).max(min + 1);
        let pause = Duration::from_millis(rng.random_range(min..max));
        let slice = Duration::from_millis(25);
        let until = Instant::now() + pause;
        while Instant::now() < until {
            if self.stopped() {
                return false;
            }
            std::thread::sleep(slice.min(until - Instant::now()));
        }
        true
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

enum GateOutcome {
    Proceed,
    Cancelled,
    DeadlineExpired,
}
