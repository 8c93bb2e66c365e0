//! Signal timer: an independently scheduled light state machine per road
//!
//! Each timer cycles GREEN -> YELLOW -> RED, stretching green (and
//! trimming red) for busier roads. Entry into GREEN is gated by a
//! controller-scoped cap on concurrently-green timers. A small per-cycle
//! probability triggers a transient BLINKING sub-cycle that preempts the
//! normal rotation for a bounded number of pulses.

use log::{debug, trace};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::road::Road;
use crate::types::RoadId;

/// Light phase as seen by agents and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Green,
    Yellow,
    Red,
    Blinking,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Green => "GREEN",
            Phase::Yellow => "YELLOW",
            Phase::Red => "RED",
            Phase::Blinking => "BLINKING",
        };
        f.write_str(name)
    }
}

/// Timer cycle tuning. Defaults mirror a 5s/2s/5s light, with green
/// stretched between 3s and 8s by road occupancy.
#[derive(Debug, Clone, Copy)]
pub struct SignalTiming {
    pub min_green: Duration,
    pub max_green: Duration,
    /// Bounded random extension added on top of the adaptive green
    pub green_jitter: Duration,
    pub yellow: Duration,
    /// Red shrinks from max toward min as the road gets busier
    pub min_red: Duration,
    pub max_red: Duration,
    /// Per-cycle probability of the blinking sub-cycle
    pub blink_chance: f64,
    pub blink_pulses: u32,
    pub blink_pulse: Duration,
    /// Interval between attempts to claim a green slot
    pub slot_poll: Duration,
}

impl Default for SignalTiming {
    fn default() -> Self {
        Self {
            min_green: Duration::from_millis(3000),
            max_green: Duration::from_millis(8000),
            green_jitter: Duration::from_millis(500),
            yellow: Duration::from_millis(2000),
            min_red: Duration::from_millis(2000),
            max_red: Duration::from_millis(5000),
            blink_chance: 0.05,
            blink_pulses: 6,
            blink_pulse: Duration::from_millis(300),
            slot_poll: Duration::from_millis(100),
        }
    }
}

/// Cap on the number of timers that may be GREEN at once.
///
/// Injected into every timer of one controller instance rather than held
/// as a process-wide static, so independent simulations (and parallel
/// tests) never share it.
pub struct GreenSlots {
    active: AtomicUsize,
    max: usize,
}

impl GreenSlots {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Timers currently holding a green slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "green slot released without acquire");
    }
}

struct PhaseCell {
    phase: Phase,
    since: Instant,
}

/// Shared, read-side view of one signal. Reads return the latest
/// committed phase and never wait on the timer task.
pub struct SignalState {
    road: RoadId,
    cell: Mutex<PhaseCell>,
}

impl SignalState {
    pub(crate) fn new(road: RoadId) -> Arc<Self> {
        Arc::new(Self {
            road,
            cell: Mutex::new(PhaseCell {
                phase: Phase::Red,
                since: Instant::now(),
            }),
        })
    }

    pub fn road_id(&self) -> RoadId {
        self.road
    }

    pub fn phase(&self) -> Phase {
        self.cell.lock().unwrap().phase
    }

    pub fn time_in_phase(&self) -> Duration {
        self.cell.lock().unwrap().since.elapsed()
    }

    /// Render brightness in [0, 1]. Steady phases are full brightness;
    /// blinking pulses a square wave at the pulse rate. Consumed only by
    /// visualization layers, never by the traversal protocol.
    pub fn brightness(&self, pulse: Duration) -> f32 {
        let cell = self.cell.lock().unwrap();
        match cell.phase {
            Phase::Blinking => {
                let pulses = cell.since.elapsed().as_millis() / pulse.as_millis().max(1);
                if pulses % 2 == 0 {
                    1.0
                } else {
                    0.2
                }
            }
            _ => 1.0,
        }
    }

    fn set_phase(&self, phase: Phase) {
        let mut cell = self.cell.lock().unwrap();
        cell.phase = phase;
        cell.since = Instant::now();
        trace!("signal for road {} -> {}", self.road, phase);
    }
}

/// The periodic task driving one road's light. Runs until the shared
/// stop flag is raised; never terminates on its own.
pub struct SignalTimer {
    state: Arc<SignalState>,
    road: Arc<Road>,
    slots: Arc<GreenSlots>,
    timing: SignalTiming,
    stop: Arc<AtomicBool>,
}

impl SignalTimer {
    /// Bind a timer task to an existing signal state. The state is
    /// created by the topology so routes can reference it before any
    /// timer task runs.
    pub fn new(
        road: Arc<Road>,
        state: Arc<SignalState>,
        slots: Arc<GreenSlots>,
        timing: SignalTiming,
        stop: Arc<AtomicBool>,
    ) -> Self {
        debug_assert_eq!(road.id(), state.road_id());
        Self {
            state,
            road,
            slots,
            timing,
            stop,
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// The timer loop. Each full cycle: claim a green slot (polled,
    /// bounded waits), adaptive green, fixed yellow, adaptive red, and
    /// an occasional blinking sub-cycle before the next rotation.
    pub fn run(self) {
        let mut rng = rand::rng();
        debug!("signal timer for road {} started", self.road.id());

        while !self.stopped() {
            // A timer that wants green waits for a slot to free up.
            while !self.slots.try_acquire() {
                if !self.sleep_cancellable(self.timing.slot_poll) {
                    debug!("signal timer for road {} stopped", self.road.id());
                    return;
                }
            }

            let occupancy = self.road.congestion();
            let green = self.green_duration(occupancy, &mut rng);
            self.state.set_phase(Phase::Green);
            let finished = self.sleep_cancellable(green);
            if !finished {
                self.slots.release();
                break;
            }

            // Leave GREEN before releasing the slot, so the cap on
            // concurrently green timers holds at every instant.
            self.state.set_phase(Phase::Yellow);
            self.slots.release();
            if !self.sleep_cancellable(self.timing.yellow) {
                break;
            }

            self.state.set_phase(Phase::Red);
            if !self.sleep_cancellable(self.red_duration(occupancy)) {
                break;
            }

            if rng.random_bool(self.timing.blink_chance) && !self.blink_sub_cycle() {
                break;
            }
        }
        debug!("signal timer for road {} stopped", self.road.id());
    }

    /// Green stretches from min toward max proportionally to occupancy,
    /// plus bounded random jitter so identical roads don't phase-lock.
    fn green_duration<R: Rng>(&self, occupancy: f32, rng: &mut R) -> Duration {
        let span = self
            .timing
            .max_green
            .saturating_sub(self.timing.min_green)
            .as_millis() as f32;
        let adaptive = self.timing.min_green + Duration::from_millis((span * occupancy) as u64);
        let jitter_ms = self.timing.green_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (adaptive + jitter).clamp(self.timing.min_green, self.timing.max_green)
    }

    /// Busy roads get shorter reds
    fn red_duration(&self, occupancy: f32) -> Duration {
        let span = self
            .timing
            .max_red
            .saturating_sub(self.timing.min_red)
            .as_millis() as f32;
        self.timing
            .max_red
            .saturating_sub(Duration::from_millis((span * occupancy) as u64))
            .max(self.timing.min_red)
    }

    /// Transient emergency sub-cycle: a bounded number of blink pulses,
    /// then normal cycling resumes. Returns false if cancelled.
    fn blink_sub_cycle(&self) -> bool {
        debug!("signal for road {} entering blink sub-cycle", self.road.id());
        self.state.set_phase(Phase::Blinking);
        for _ in 0..self.timing.blink_pulses {
            if !self.sleep_cancellable(self.timing.blink_pulse) {
                return false;
            }
        }
        self.state.set_phase(Phase::Red);
        true
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Sleep in short slices so the stop flag is observed promptly.
    /// Returns false when cancelled before the full duration elapsed.
    fn sleep_cancellable(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(25);
        let until = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(slice.min(until - now));
        }
    }
}
