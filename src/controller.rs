//! Simulation controller: lifecycle orchestration and metrics
//!
//! Owns the topology, the signal-timer tasks and the agent population.
//! A spawner/reaper loop keeps the population topped up to the cap,
//! drains trip reports, and joins finished agent tasks. Shutdown is
//! cooperative: every task gets a bounded grace period and stragglers
//! are logged and detached rather than blocking the rest of the stop.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::agent::{AgentStatus, AgentTiming, TripReport, VehicleAgent};
use crate::signal::{GreenSlots, SignalTimer, SignalTiming};
use crate::snapshot::{
    AgentSnapshot, IntersectionSnapshot, RoadSnapshot, SignalSnapshot, SimulationStats, Snapshot,
};
use crate::topology::{Topology, TopologyBuilder};
use crate::types::{AgentId, VehicleKind};

/// Controller tuning. Defaults: population cap 15, one spawn attempt
/// every 500 ms.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub population_cap: usize,
    pub spawn_interval: Duration,
    /// Upper bound on randomly generated route length
    pub max_route_segments: usize,
    pub max_concurrent_green: usize,
    /// Per-task wait budget during shutdown before detaching
    pub grace_period: Duration,
    pub agent_timing: AgentTiming,
    pub signal_timing: SignalTiming,
    /// Seed for reproducible spawning decisions
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            population_cap: 15,
            spawn_interval: Duration::from_millis(500),
            max_route_segments: 3,
            max_concurrent_green: 4,
            grace_period: Duration::from_millis(1000),
            agent_timing: AgentTiming::default(),
            signal_timing: SignalTiming::default(),
            seed: None,
        }
    }
}

struct AgentHandle {
    status: Arc<AgentStatus>,
    join: JoinHandle<()>,
}

/// Aggregate trip accounting, fed by drained reports
#[derive(Default)]
struct StatsCore {
    total_spawned: usize,
    completed: usize,
    abandoned: usize,
    finished: usize,
    speed_sum: f32,
    total_distance: f32,
    total_wait: Duration,
}

impl StatsCore {
    fn absorb(&mut self, report: &TripReport) {
        self.finished += 1;
        self.speed_sum += report.speed;
        self.total_distance += report.distance;
        self.total_wait += report.wait;
        if report.completed {
            self.completed += 1;
        } else {
            self.abandoned += 1;
        }
    }
}

/// Orchestrates one simulation instance: topology, timers, population
pub struct SimulationController {
    blueprint: TopologyBuilder,
    config: SimConfig,
    topology: Arc<Topology>,
    stop: Arc<AtomicBool>,
    agents: Arc<Mutex<Vec<AgentHandle>>>,
    stats: Arc<Mutex<StatsCore>>,
    reports: Arc<Mutex<Receiver<TripReport>>>,
    report_tx: Sender<TripReport>,
    next_agent_id: Arc<AtomicUsize>,
    signal_tasks: Vec<JoinHandle<()>>,
    spawner: Option<JoinHandle<()>>,
    running: bool,
}

impl SimulationController {
    /// Build the initial topology from the blueprint. The blueprint is
    /// kept so `reset` can rebuild from scratch.
    pub fn new(blueprint: TopologyBuilder, config: SimConfig) -> Result<Self> {
        let topology = blueprint
            .build()
            .context("failed to build initial topology")?;
        let (report_tx, report_rx) = unbounded();
        Ok(Self {
            blueprint,
            config,
            topology: Arc::new(topology),
            stop: Arc::new(AtomicBool::new(true)),
            agents: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(StatsCore::default())),
            reports: Arc::new(Mutex::new(report_rx)),
            report_tx,
            next_agent_id: Arc::new(AtomicUsize::new(0)),
            signal_tasks: Vec::new(),
            spawner: None,
            running: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Launch signal-timer tasks and the spawner/reaper loop
    pub fn start(&mut self) {
        if self.running {
            warn!("simulation already running");
            return;
        }
        info!(
            "starting simulation: {} roads, {} intersections, population cap {}",
            self.topology.road_count(),
            self.topology.intersection_count(),
            self.config.population_cap
        );

        self.stop = Arc::new(AtomicBool::new(false));
        let slots = GreenSlots::new(self.config.max_concurrent_green);

        for state in self.topology.signals() {
            // Topology validation guarantees every signal's road exists.
            let Some(road) = self.topology.road(state.road_id()).cloned() else {
                continue;
            };
            let timer = SignalTimer::new(
                road,
                Arc::clone(state),
                Arc::clone(&slots),
                self.config.signal_timing,
                Arc::clone(&self.stop),
            );
            self.signal_tasks
                .push(std::thread::spawn(move || timer.run()));
        }

        self.spawner = Some(self.spawn_population_loop());
        self.running = true;
    }

    /// The population-replenishment loop: drain reports, reap finished
    /// agent tasks, and top the population back up to the cap.
    fn spawn_population_loop(&self) -> JoinHandle<()> {
        let topology = Arc::clone(&self.topology);
        let agents = Arc::clone(&self.agents);
        let stats = Arc::clone(&self.stats);
        let reports = Arc::clone(&self.reports);
        let report_tx = self.report_tx.clone();
        let stop = Arc::clone(&self.stop);
        let next_id = Arc::clone(&self.next_agent_id);
        let config = self.config;

        std::thread::spawn(move || {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            debug!("population spawner started");

            while !stop.load(Ordering::Relaxed) {
                drain_reports(&reports, &stats);
                reap_finished(&agents);

                let active = agents.lock().unwrap().len();
                if active < config.population_cap {
                    if let Some(route) = topology.random_route(&mut rng, config.max_route_segments)
                    {
                        let id = AgentId(next_id.fetch_add(1, Ordering::Relaxed));
                        let kind = VehicleKind::random(&mut rng);
                        let agent = VehicleAgent::new(
                            id,
                            kind,
                            route,
                            config.agent_timing,
                            Arc::clone(&stop),
                            report_tx.clone(),
                            &mut rng,
                        );
                        let status = agent.status();
                        let join = std::thread::spawn(move || agent.run());
                        agents.lock().unwrap().push(AgentHandle { status, join });
                        stats.lock().unwrap().total_spawned += 1;
                        debug!("spawned {id} ({kind}), active {}", active + 1);
                    }
                }

                sleep_sliced(config.spawn_interval, &stop);
            }
            debug!("population spawner stopped");
        })
    }

    /// Signal every task to cancel, then wait up to the grace period per
    /// task. Unresponsive tasks are logged and detached; they cannot
    /// block the rest of the shutdown.
    pub fn stop(&mut self) {
        if !self.running {
            warn!("simulation is not running");
            return;
        }
        info!("stopping simulation");
        self.stop.store(true, Ordering::Relaxed);

        if let Some(spawner) = self.spawner.take() {
            bounded_join(spawner, self.config.grace_period, "spawner");
        }
        for handle in self.signal_tasks.drain(..) {
            bounded_join(handle, self.config.grace_period, "signal timer");
        }
        let handles: Vec<AgentHandle> = self.agents.lock().unwrap().drain(..).collect();
        for handle in handles {
            let label = format!("agent {}", handle.status.id());
            bounded_join(handle.join, self.config.grace_period, &label);
        }

        drain_reports(&self.reports, &self.stats);
        self.running = false;
        info!("simulation stopped");
    }

    /// Tear down the current run and rebuild the topology from the
    /// blueprint with a fresh population cap. Nothing carries over: new
    /// resources, zeroed statistics, restarted tasks.
    pub fn reset(&mut self, population: usize) -> Result<()> {
        info!("resetting simulation with population {population}");
        if self.running {
            self.stop();
        }

        let topology = self
            .blueprint
            .build()
            .context("failed to rebuild topology on reset")?;
        self.topology = Arc::new(topology);
        self.config.population_cap = population;
        *self.stats.lock().unwrap() = StatsCore::default();
        self.agents.lock().unwrap().clear();
        self.next_agent_id.store(0, Ordering::Relaxed);

        // Replace the report channel so stale reports from detached
        // tasks of the previous run can't leak into the new one.
        let (tx, rx) = unbounded();
        self.report_tx = tx;
        *self.reports.lock().unwrap() = rx;

        self.start();
        Ok(())
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.join.is_finished())
            .count()
    }

    /// Aggregate metrics: trip accounting plus live congestion
    pub fn stats(&self) -> SimulationStats {
        drain_reports(&self.reports, &self.stats);
        let core = self.stats.lock().unwrap();
        let road_count = self.topology.road_count();
        let average_congestion = if road_count == 0 {
            0.0
        } else {
            self.topology.roads().map(|r| r.congestion()).sum::<f32>() / road_count as f32
        };
        SimulationStats {
            active_agents: self.active_agent_count(),
            total_spawned: core.total_spawned,
            completed: core.completed,
            abandoned: core.abandoned,
            average_speed: if core.finished == 0 {
                0.0
            } else {
                core.speed_sum / core.finished as f32
            },
            average_congestion,
            total_distance: core.total_distance,
            total_wait: core.total_wait,
        }
    }

    /// Read-only point-in-time view for external consumers
    pub fn snapshot(&self) -> Snapshot {
        let roads = self
            .topology
            .roads()
            .map(|road| RoadSnapshot {
                id: road.id(),
                occupancy: road.occupant_count(),
                capacity: road.capacity(),
                congestion: road.congestion(),
                speed_limit: road.speed_limit(),
            })
            .collect();

        let intersections = self
            .topology
            .intersections()
            .map(|ix| IntersectionSnapshot {
                id: ix.id(),
                policy: ix.policy(),
                waiting: ix.waiting_count(),
                occupied: ix.occupied_count(),
            })
            .collect();

        let signals = self
            .topology
            .signals()
            .map(|signal| SignalSnapshot {
                road: signal.road_id(),
                phase: signal.phase(),
                time_in_phase: signal.time_in_phase(),
            })
            .collect();

        let agents = self
            .agents
            .lock()
            .unwrap()
            .iter()
            .map(|handle| {
                let status = &handle.status;
                let current_road = status.current_road();
                let position = current_road
                    .and_then(|id| self.topology.road(id))
                    .map(|road| road.start().lerp(&road.end(), status.progress()));
                AgentSnapshot {
                    id: status.id(),
                    kind: status.kind(),
                    state: status.state(),
                    position,
                    current_road,
                    progress: status.progress(),
                    distance: status.total_distance(),
                    wait: status.total_wait(),
                }
            })
            .collect();

        Snapshot {
            running: self.running,
            roads,
            intersections,
            signals,
            agents,
            stats: self.stats(),
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}

fn drain_reports(reports: &Mutex<Receiver<TripReport>>, stats: &Mutex<StatsCore>) {
    let rx = reports.lock().unwrap();
    let mut core = stats.lock().unwrap();
    while let Ok(report) = rx.try_recv() {
        core.absorb(&report);
    }
}

/// Join finished agent tasks and drop their handles
fn reap_finished(agents: &Mutex<Vec<AgentHandle>>) {
    let mut agents = agents.lock().unwrap();
    let mut kept = Vec::with_capacity(agents.len());
    for handle in agents.drain(..) {
        if handle.join.is_finished() {
            if handle.join.join().is_err() {
                warn!("agent {} panicked", handle.status.id());
            }
        } else {
            kept.push(handle);
        }
    }
    *agents = kept;
}

/// Wait for a task up to `grace`, then detach it. A task that misses
/// its grace period is logged, never waited on.
fn bounded_join(handle: JoinHandle<()>, grace: Duration, label: &str) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            warn!("{label} panicked during shutdown");
        }
    } else {
        warn!("{label} did not stop within grace period, detaching");
    }
}

fn sleep_sliced(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(25);
    let until = Instant::now() + total;
    while Instant::now() < until {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(slice.min(until - Instant::now()));
    }
}
