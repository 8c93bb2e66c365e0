//! Topology construction and route building
//!
//! A `TopologyBuilder` records road/intersection/signal definitions and
//! validates them once at `build` time; misconfiguration is rejected
//! here, never during traversal. The builder is cheap to clone and
//! rebuildable, which is what `reset` relies on: a reset tears the old
//! topology down and builds a fresh one from the same blueprint.

use log::debug;
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::intersection::{AdmissionPolicy, Intersection, PolicyTiming};
use crate::road::Road;
use crate::signal::SignalState;
use crate::types::{IntersectionId, Position, RoadClass, RoadId};

/// Road endpoints closer than this are considered connected
const ADJACENCY_EPSILON: f32 = 0.5;

/// Rejected topology configuration. Raised at build/route-build time,
/// never at traversal time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("duplicate road id {0}")]
    DuplicateRoad(RoadId),
    #[error("duplicate intersection id {0}")]
    DuplicateIntersection(IntersectionId),
    #[error("unknown road id {0}")]
    UnknownRoad(RoadId),
    #[error("unknown intersection id {0}")]
    UnknownIntersection(IntersectionId),
    #[error("road {0} already has a signal bound")]
    SignalAlreadyBound(RoadId),
    #[error("route must contain at least one road")]
    EmptyRoute,
}

/// One (road, optional intersection, optional signal) unit of a route
#[derive(Clone)]
pub struct Segment {
    pub road: Arc<Road>,
    pub intersection: Option<Arc<Intersection>>,
    pub signal: Option<Arc<SignalState>>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("road", &self.road.id())
            .field("intersection", &self.intersection.as_ref().map(|i| i.id()))
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.road, &other.road)
            && match (&self.intersection, &other.intersection) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
            && match (&self.signal, &other.signal) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// An ordered list of segments an agent traverses
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub segments: Vec<Segment>,
}

impl Route {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone)]
struct RoadDef {
    id: RoadId,
    capacity: usize,
    class: RoadClass,
    start: Position,
    end: Position,
    base_density: f32,
}

#[derive(Debug, Clone)]
struct IntersectionDef {
    id: IntersectionId,
    policy: AdmissionPolicy,
    timing: Option<PolicyTiming>,
}

/// Records topology definitions; validates and materializes on `build`
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    roads: Vec<RoadDef>,
    intersections: Vec<IntersectionDef>,
    /// road -> the intersection guarding its exit
    guards: Vec<(RoadId, IntersectionId)>,
    signals: Vec<RoadId>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_road(
        &mut self,
        id: RoadId,
        capacity: usize,
        class: RoadClass,
        start: Position,
        end: Position,
    ) -> &mut Self {
        self.add_road_with_density(id, capacity, class, start, end, 0.0)
    }

    pub fn add_road_with_density(
        &mut self,
        id: RoadId,
        capacity: usize,
        class: RoadClass,
        start: Position,
        end: Position,
        base_density: f32,
    ) -> &mut Self {
        self.roads.push(RoadDef {
            id,
            capacity,
            class,
            start,
            end,
            base_density,
        });
        self
    }

    pub fn add_intersection(&mut self, id: IntersectionId, policy: AdmissionPolicy) -> &mut Self {
        self.intersections.push(IntersectionDef {
            id,
            policy,
            timing: None,
        });
        self
    }

    /// Like `add_intersection` with explicit admission timing; used by
    /// tests that cannot afford the default multi-second timeouts.
    pub fn add_intersection_with_timing(
        &mut self,
        id: IntersectionId,
        policy: AdmissionPolicy,
        timing: PolicyTiming,
    ) -> &mut Self {
        self.intersections.push(IntersectionDef {
            id,
            policy,
            timing: Some(timing),
        });
        self
    }

    /// Declare that agents leaving `road` must clear `intersection`
    pub fn connect(&mut self, road: RoadId, intersection: IntersectionId) -> &mut Self {
        self.guards.push((road, intersection));
        self
    }

    /// Bind a signal timer to a road (1:1)
    pub fn bind_signal(&mut self, road: RoadId) -> &mut Self {
        self.signals.push(road);
        self
    }

    /// Demo city: a `rows` x `cols` grid of intersections with
    /// bidirectional roads between neighbours. Admission policies cycle
    /// through all five kinds; roads ending at a signalised
    /// intersection get a signal timer bound. The middle horizontal
    /// corridor is a highway, the outer ring residential, the rest
    /// arterial.
    pub fn grid(rows: usize, cols: usize) -> TopologyBuilder {
        const SPACING: f32 = 10.0;
        let point =
            |r: usize, c: usize| Position::new(c as f32 * SPACING, r as f32 * SPACING);
        let ix_id = |r: usize, c: usize| IntersectionId(r * cols + c);

        let mut builder = TopologyBuilder::new();

        let policies = [
            AdmissionPolicy::Signal,
            AdmissionPolicy::Roundabout,
            AdmissionPolicy::Stop,
            AdmissionPolicy::Uncontrolled,
            AdmissionPolicy::Priority,
        ];
        for r in 0..rows {
            for c in 0..cols {
                builder.add_intersection(ix_id(r, c), policies[(r * cols + c) % policies.len()]);
            }
        }

        let mut next_road = 0usize;
        let mut link = |builder: &mut TopologyBuilder, from: (usize, usize), to: (usize, usize)| {
            let on_border = |(r, c): (usize, usize)| {
                r == 0 || c == 0 || r + 1 == rows || c + 1 == cols
            };
            let class = if from.0 == to.0 && from.0 == rows / 2 && rows > 2 {
                RoadClass::Highway
            } else if on_border(from) && on_border(to) {
                RoadClass::Residential
            } else {
                RoadClass::Arterial
            };
            let capacity = match class {
                RoadClass::Residential => 2,
                RoadClass::Arterial => 4,
                RoadClass::Highway => 6,
            };
            let id = RoadId(next_road);
            next_road += 1;
            builder.add_road(id, capacity, class, point(from.0, from.1), point(to.0, to.1));
            builder.connect(id, ix_id(to.0, to.1));
            if policies[(to.0 * cols + to.1) % policies.len()] == AdmissionPolicy::Signal {
                builder.bind_signal(id);
            }
        };

        for r in 0..rows {
            for c in 0..cols {
                if c + 1 < cols {
                    link(&mut builder, (r, c), (r, c + 1));
                    link(&mut builder, (r, c + 1), (r, c));
                }
                if r + 1 < rows {
                    link(&mut builder, (r, c), (r + 1, c));
                    link(&mut builder, (r + 1, c), (r, c));
                }
            }
        }

        builder
    }

    /// Validate the recorded definitions and materialize the topology.
    /// The builder stays usable afterwards, so the same blueprint can
    /// produce any number of fresh topologies.
    pub fn build(&self) -> Result<Topology, TopologyError> {
        let mut roads: HashMap<RoadId, Arc<Road>> = HashMap::new();
        for def in &self.roads {
            if roads.contains_key(&def.id) {
                return Err(TopologyError::DuplicateRoad(def.id));
            }
            roads.insert(
                def.id,
                Arc::new(Road::new(
                    def.id,
                    def.capacity,
                    def.class,
                    def.start,
                    def.end,
                    def.base_density,
                )),
            );
        }

        let mut intersections: HashMap<IntersectionId, Arc<Intersection>> = HashMap::new();
        for def in &self.intersections {
            if intersections.contains_key(&def.id) {
                return Err(TopologyError::DuplicateIntersection(def.id));
            }
            let intersection = match def.timing {
                Some(timing) => Intersection::with_timing(def.id, def.policy, timing),
                None => Intersection::new(def.id, def.policy),
            };
            intersections.insert(def.id, Arc::new(intersection));
        }

        let mut guards: HashMap<RoadId, IntersectionId> = HashMap::new();
        for (road, intersection) in &self.guards {
            if !roads.contains_key(road) {
                return Err(TopologyError::UnknownRoad(*road));
            }
            if !intersections.contains_key(intersection) {
                return Err(TopologyError::UnknownIntersection(*intersection));
            }
            guards.insert(*road, *intersection);
        }

        let mut signals: HashMap<RoadId, Arc<SignalState>> = HashMap::new();
        for road in &self.signals {
            if !roads.contains_key(road) {
                return Err(TopologyError::UnknownRoad(*road));
            }
            if signals.contains_key(road) {
                return Err(TopologyError::SignalAlreadyBound(*road));
            }
            signals.insert(*road, SignalState::new(*road));
        }

        let (graph, road_nodes) = build_adjacency(&roads);
        debug!(
            "topology built: {} roads, {} intersections, {} signals",
            roads.len(),
            intersections.len(),
            signals.len()
        );

        Ok(Topology {
            roads,
            intersections,
            guards,
            signals,
            graph,
            road_nodes,
        })
    }
}

/// Roads are graph nodes; an edge connects road A to road B when A's end
/// sits on B's start. Used only for best-effort route suggestion, not by
/// the concurrency core.
fn build_adjacency(
    roads: &HashMap<RoadId, Arc<Road>>,
) -> (DiGraph<RoadId, f32>, HashMap<RoadId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for id in roads.keys() {
        nodes.insert(*id, graph.add_node(*id));
    }
    for (a_id, a) in roads {
        for (b_id, b) in roads {
            if a_id == b_id {
                continue;
            }
            if a.end().distance(&b.start()) < ADJACENCY_EPSILON {
                graph.add_edge(nodes[a_id], nodes[b_id], b.length());
            }
        }
    }
    (graph, nodes)
}

/// A materialized network of shared road/intersection/signal resources
pub struct Topology {
    roads: HashMap<RoadId, Arc<Road>>,
    intersections: HashMap<IntersectionId, Arc<Intersection>>,
    guards: HashMap<RoadId, IntersectionId>,
    signals: HashMap<RoadId, Arc<SignalState>>,
    graph: DiGraph<RoadId, f32>,
    road_nodes: HashMap<RoadId, NodeIndex>,
}

impl Topology {
    pub fn road(&self, id: RoadId) -> Option<&Arc<Road>> {
        self.roads.get(&id)
    }

    pub fn intersection(&self, id: IntersectionId) -> Option<&Arc<Intersection>> {
        self.intersections.get(&id)
    }

    pub fn signal(&self, road: RoadId) -> Option<&Arc<SignalState>> {
        self.signals.get(&road)
    }

    pub fn roads(&self) -> impl Iterator<Item = &Arc<Road>> {
        self.roads.values()
    }

    pub fn intersections(&self) -> impl Iterator<Item = &Arc<Intersection>> {
        self.intersections.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &Arc<SignalState>> {
        self.signals.values()
    }

    pub fn road_count(&self) -> usize {
        self.roads.len()
    }

    pub fn intersection_count(&self) -> usize {
        self.intersections.len()
    }

    /// Assemble a route from an ordered list of road ids. Unknown ids
    /// are rejected here so traversal never sees a dangling reference.
    pub fn build_route(&self, road_ids: &[RoadId]) -> Result<Route, TopologyError> {
        if road_ids.is_empty() {
            return Err(TopologyError::EmptyRoute);
        }
        let mut segments = Vec::with_capacity(road_ids.len());
        for id in road_ids {
            let road = self
                .roads
                .get(id)
                .ok_or(TopologyError::UnknownRoad(*id))?;
            let intersection = self
                .guards
                .get(id)
                .and_then(|ix| self.intersections.get(ix))
                .cloned();
            let signal = self.signals.get(id).cloned();
            segments.push(Segment {
                road: Arc::clone(road),
                intersection,
                signal,
            });
        }
        Ok(Route { segments })
    }

    /// Best-effort shortest path over the road adjacency graph (A* with
    /// a null heuristic). Owned by the topology layer; not part of the
    /// concurrency contract.
    pub fn suggest_route(&self, from: RoadId, to: RoadId) -> Option<Vec<RoadId>> {
        let start = *self.road_nodes.get(&from)?;
        let goal = *self.road_nodes.get(&to)?;
        let (_, path) = astar(
            &self.graph,
            start,
            |node| node == goal,
            |edge| *edge.weight(),
            |_| 0.0,
        )?;
        Some(path.into_iter().map(|node| self.graph[node]).collect())
    }

    /// Pick a random bounded walk through the adjacency graph, the way
    /// demo traffic gets its routes. Returns None when the topology has
    /// no roads.
    pub fn random_route<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        max_segments: usize,
    ) -> Option<Route> {
        let all: Vec<RoadId> = self.roads.keys().copied().collect();
        if all.is_empty() || max_segments == 0 {
            return None;
        }
        let mut current = all[rng.random_range(0..all.len())];
        let mut ids = vec![current];
        while ids.len() < max_segments {
            let node = self.road_nodes[&current];
            let next: Vec<RoadId> = self
                .graph
                .neighbors(node)
                .map(|n| self.graph[n])
                .collect();
            if next.is_empty() {
                break;
            }
            current = next[rng.random_range(0..next.len())];
            ids.push(current);
        }
        // Infallible: every id came from this topology.
        self.build_route(&ids).ok()
    }
}
