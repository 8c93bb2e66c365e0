//! End-to-end simulation runs on small topologies
//!
//! Timings are shortened so each scenario finishes in well under a
//! second of wall time while still exercising the real thread protocol.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use crossflow::agent::{AgentTiming, VehicleAgent};
use crossflow::intersection::{AdmissionPolicy, PolicyTiming};
use crossflow::types::{AgentId, IntersectionId, Position, RoadClass, RoadId, VehicleKind};
use crossflow::{SimConfig, SimulationController, TopologyBuilder};

fn fast_agent_timing() -> AgentTiming {
    AgentTiming {
        segment_deadline: Duration::from_millis(500),
        signal_poll: Duration::from_millis(10),
        max_retries: 2,
        backoff_min: Duration::from_millis(5),
        backoff_max: Duration::from_millis(15),
        travel_steps: 5,
    }
}

fn fast_config() -> SimConfig {
    SimConfig {
        population_cap: 5,
        spawn_interval: Duration::from_millis(20),
        max_route_segments: 2,
        grace_period: Duration::from_millis(2000),
        agent_timing: fast_agent_timing(),
        seed: Some(42),
        ..SimConfig::default()
    }
}

/// Two roads joined by one fast intersection
fn corridor() -> TopologyBuilder {
    let mut builder = TopologyBuilder::new();
    builder
        .add_road(
            RoadId(0),
            4,
            RoadClass::Arterial,
            Position::new(0.0, 0.0),
            Position::new(5.0, 0.0),
        )
        .add_road(
            RoadId(1),
            4,
            RoadClass::Arterial,
            Position::new(5.0, 0.0),
            Position::new(10.0, 0.0),
        )
        .add_intersection_with_timing(
            IntersectionId(0),
            AdmissionPolicy::Roundabout,
            PolicyTiming {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_millis(300),
                pre_wait: None,
                fairness: true,
            },
        )
        .connect(RoadId(0), IntersectionId(0));
    builder
}

#[test]
fn test_single_agent_completes_trip() {
    let topology = corridor().build().unwrap();
    let route = topology.build_route(&[RoadId(0), RoadId(1)]).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = unbounded();

    let mut rng = rand::rng();
    let agent = VehicleAgent::new(
        AgentId(0),
        VehicleKind::Car,
        route,
        fast_agent_timing(),
        Arc::clone(&stop),
        tx,
        &mut rng,
    );
    std::thread::spawn(move || agent.run());

    let report = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("agent never reported");
    assert!(report.completed, "trip should complete on an empty corridor");
    assert_eq!(report.roads_visited, vec![RoadId(0), RoadId(1)]);
    assert!(report.distance > 0.0);

    // Every shared resource released.
    for road in topology.roads() {
        assert_eq!(road.occupant_count(), 0);
    }
    for ix in topology.intersections() {
        assert_eq!(ix.occupied_count(), 0);
        assert_eq!(ix.waiting_count(), 0);
    }
}

#[test]
fn test_full_grid_run_and_clean_shutdown() {
    let mut controller =
        SimulationController::new(TopologyBuilder::grid(3, 3), fast_config()).unwrap();
    controller.start();
    std::thread::sleep(Duration::from_millis(600));
    controller.stop();

    let stats = controller.stats();
    assert!(stats.total_spawned > 0, "no agents were spawned");
    assert_eq!(controller.active_agent_count(), 0);
    for road in controller.topology().roads() {
        assert_eq!(
            road.occupant_count(),
            0,
            "road {} still occupied after stop",
            road.id()
        );
    }
    for ix in controller.topology().intersections() {
        assert_eq!(ix.occupied_count(), 0);
        assert_eq!(ix.waiting_count(), 0);
    }
}

#[test]
fn test_population_never_exceeds_cap() {
    let config = SimConfig {
        population_cap: 3,
        ..fast_config()
    };
    let mut controller = SimulationController::new(corridor(), config).unwrap();
    controller.start();

    let until = Instant::now() + Duration::from_millis(500);
    while Instant::now() < until {
        assert!(
            controller.active_agent_count() <= 3,
            "population exceeded the cap"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    controller.stop();
}

#[test]
fn test_reset_produces_isolated_run() {
    let mut controller = SimulationController::new(corridor(), fast_config()).unwrap();
    controller.start();
    std::thread::sleep(Duration::from_millis(400));

    let before = controller.stats();
    assert!(before.total_spawned > 0);

    controller.reset(2).unwrap();
    let after = controller.stats();
    assert_eq!(after.completed, 0, "trip counts leaked across reset");
    assert_eq!(after.abandoned, 0);
    assert!(after.total_spawned <= 2 + 1, "old population leaked across reset");
    assert!(controller.is_running());

    controller.stop();
}

#[test]
fn test_snapshot_reflects_topology() {
    let mut controller =
        SimulationController::new(TopologyBuilder::grid(2, 2), fast_config()).unwrap();
    controller.start();
    std::thread::sleep(Duration::from_millis(200));

    let snapshot = controller.snapshot();
    assert!(snapshot.running);
    assert_eq!(snapshot.intersections.len(), 4);
    assert!(!snapshot.roads.is_empty());
    for road in &snapshot.roads {
        assert!(road.occupancy <= road.capacity);
        assert!((0.0..=1.0).contains(&road.congestion));
    }
    for agent in &snapshot.agents {
        assert!((0.0..=1.0).contains(&agent.progress));
    }

    controller.stop();
    assert!(!controller.snapshot().running);
}

#[test]
fn test_suggest_route_spans_grid() {
    let topology = TopologyBuilder::grid(3, 3).build().unwrap();
    let roads: Vec<RoadId> = topology.roads().map(|r| r.id()).collect();
    let from = *roads.iter().min().unwrap();
    let to = *roads.iter().max().unwrap();

    let path = topology
        .suggest_route(from, to)
        .expect("grid should be fully connected");
    assert_eq!(path.first(), Some(&from));
    assert_eq!(path.last(), Some(&to));

    let route = topology.build_route(&path).unwrap();
    assert_eq!(route.len(), path.len());
}
