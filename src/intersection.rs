//! Intersection resource: mutual exclusion with a pluggable admission policy
//!
//! Admission is a bounded-interval polling loop rather than a single
//! blocking acquire. The periodic wakeup is load-bearing: it is what lets
//! each waiter run the timeout check and the oldest-waiter fairness rule
//! on every poll. Ordering is deliberately not FIFO; the longest-waiting
//! agent only gets a privileged extra acquisition attempt per poll, which
//! makes admission eventually fair without serializing throughput.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::{AgentId, IntersectionId};

/// Rule an intersection uses to grant entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Signal-controlled; the light gate itself happens upstream in the
    /// agent protocol, admission here is plain polling plus fairness
    Signal,
    /// Priority road crossing
    Priority,
    /// Two vehicles may circulate at once; favors throughput over patience
    Roundabout,
    /// Mandatory full stop before contending
    Stop,
    /// First to ask within a short window wins
    Uncontrolled,
}

impl AdmissionPolicy {
    /// Number of agents allowed inside concurrently
    pub fn capacity(&self) -> usize {
        match self {
            AdmissionPolicy::Roundabout => 2,
            _ => 1,
        }
    }

    pub fn timing(&self) -> PolicyTiming {
        match self {
            AdmissionPolicy::Signal | AdmissionPolicy::Priority => PolicyTiming {
                poll_interval: Duration::from_millis(100),
                timeout: Duration::from_millis(5000),
                pre_wait: None,
                fairness: true,
            },
            AdmissionPolicy::Roundabout => PolicyTiming {
                poll_interval: Duration::from_millis(50),
                timeout: Duration::from_millis(2000),
                pre_wait: None,
                fairness: true,
            },
            AdmissionPolicy::Stop => PolicyTiming {
                poll_interval: Duration::from_millis(100),
                timeout: Duration::from_millis(3000),
                pre_wait: Some(Duration::from_millis(600)),
                fairness: true,
            },
            AdmissionPolicy::Uncontrolled => PolicyTiming {
                poll_interval: Duration::from_millis(250),
                timeout: Duration::from_millis(250),
                pre_wait: None,
                fairness: false,
            },
        }
    }
}

impl std::fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdmissionPolicy::Signal => "signal",
            AdmissionPolicy::Priority => "priority",
            AdmissionPolicy::Roundabout => "roundabout",
            AdmissionPolicy::Stop => "stop",
            AdmissionPolicy::Uncontrolled => "uncontrolled",
        };
        f.write_str(name)
    }
}

/// Per-policy admission timing. Policies override the numbers, never the
/// structure of the polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PolicyTiming {
    /// Interval between acquisition attempts
    pub poll_interval: Duration,
    /// Total wait budget before `enter` gives up and returns false
    pub timeout: Duration,
    /// Mandatory pause before contending (Stop policy's full stop)
    pub pre_wait: Option<Duration>,
    /// Whether the oldest-waiter rule applies
    pub fairness: bool,
}

/// A mutual-exclusion intersection shared by concurrent vehicle agents
pub struct Intersection {
    id: IntersectionId,
    policy: AdmissionPolicy,
    timing: PolicyTiming,
    capacity: usize,
    /// Available permits; paired with `freed` for bounded waits
    permits: Mutex<usize>,
    freed: Condvar,
    /// Agents currently contending, keyed to their arrival time
    waiting: Mutex<HashMap<AgentId, Instant>>,
}

impl Intersection {
    pub fn new(id: IntersectionId, policy: AdmissionPolicy) -> Self {
        Self::with_timing(id, policy, policy.timing())
    }

    /// Construct with explicit timing; used by tests that cannot afford
    /// multi-second timeouts.
    pub fn with_timing(id: IntersectionId, policy: AdmissionPolicy, timing: PolicyTiming) -> Self {
        let capacity = policy.capacity();
        Self {
            id,
            policy,
            timing,
            capacity,
            permits: Mutex::new(capacity),
            freed: Condvar::new(),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> IntersectionId {
        self.id
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of agents currently inside
    pub fn occupied_count(&self) -> usize {
        self.capacity - *self.permits.lock().unwrap()
    }

    /// Number of agents currently contending for entry
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    /// Try to enter the intersection, waiting up to the policy's budget
    /// or the caller's `deadline`, whichever comes first.
    ///
    /// Timing out is an expected outcome, not a fault: the caller backs
    /// off and may retry the whole segment later. The stop flag is
    /// observed on every poll, making each wait a cancellation point.
    pub fn enter(&self, agent: AgentId, deadline: Instant, stop: &AtomicBool) -> bool {
        let arrival = Instant::now();
        self.waiting.lock().unwrap().insert(agent, arrival);
        trace!("{}: waiting at intersection {}", agent, self.id);

        if let Some(pre_wait) = self.timing.pre_wait {
            if !self.full_stop(pre_wait, stop) {
                self.waiting.lock().unwrap().remove(&agent);
                return false;
            }
        }

        // The segment budget may already be spent on the signal gate or
        // the mandatory stop; never admit past the deadline.
        if Instant::now() >= deadline {
            self.waiting.lock().unwrap().remove(&agent);
            return false;
        }

        let mut permits = self.permits.lock().unwrap();
        loop {
            if *permits > 0 {
                *permits -= 1;
                // Waiting-set removal happens under the permits lock, so
                // an agent is never observable as waiting and inside at
                // once. Lock order stays permits -> waiting.
                self.waiting.lock().unwrap().remove(&agent);
                drop(permits);
                trace!("{}: entered intersection {}", agent, self.id);
                return true;
            }

            let (guard, _) = self
                .freed
                .wait_timeout(permits, self.timing.poll_interval)
                .unwrap();
            permits = guard;

            if stop.load(Ordering::Relaxed) {
                drop(permits);
                self.waiting.lock().unwrap().remove(&agent);
                return false;
            }

            let now = Instant::now();
            if now >= deadline || now.duration_since(arrival) > self.timing.timeout {
                drop(permits);
                self.waiting.lock().unwrap().remove(&agent);
                debug!("{}: timeout at intersection {}, backing off", agent, self.id);
                return false;
            }

            // Oldest-waiter rule: the longest-waiting agent gets one
            // privileged extra attempt this poll, so newer arrivals on
            // the same interval can never starve it indefinitely.
            if self.timing.fairness && self.oldest_waiter() == Some(agent) && *permits > 0 {
                *permits -= 1;
                self.waiting.lock().unwrap().remove(&agent);
                drop(permits);
                trace!("{}: entered intersection {} (oldest waiter)", agent, self.id);
                return true;
            }
        }
    }

    /// Release one permit. Fails fast in debug builds on a release
    /// without a matching acquire.
    pub fn exit(&self, agent: AgentId) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        debug_assert!(
            *permits <= self.capacity,
            "intersection {} released more permits than acquired",
            self.id
        );
        self.freed.notify_one();
        trace!("{}: exited intersection {}", agent, self.id);
    }

    /// The mandatory pause of the Stop policy, sliced so the stop flag
    /// stays responsive. Returns false if cancelled mid-pause.
    fn full_stop(&self, pre_wait: Duration, stop: &AtomicBool) -> bool {
        let slice = Duration::from_millis(50);
        let until = Instant::now() + pre_wait;
        while Instant::now() < until {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(slice.min(until - Instant::now()));
        }
        !stop.load(Ordering::Relaxed)
    }

    fn oldest_waiter(&self) -> Option<AgentId> {
        self.waiting
            .lock()
            .unwrap()
            .iter()
            .min_by_key(|(_, arrival)| **arrival)
            .map(|(agent, _)| *agent)
    }
}
