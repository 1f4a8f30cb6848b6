//! Lane adjacency graph and track geometry
//!
//! The four-lane topology is fixed for the process lifetime: lanes 0-1 run
//! forward, lane 2 carries opposite-direction traffic and lane 3 is the
//! service lane. The track itself is a closed loop.

use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;

use super::types::{Heading, Lane, LaneKind};

/// Static lane layout
///
/// Lanes are nodes of an undirected graph and an edge means a vehicle may
/// move directly between the two lanes.
#[derive(Debug, Clone)]
pub struct LaneTopology {
    graph: UnGraph<Lane, ()>,
    lane_to_node: HashMap<Lane, NodeIndex>,
}

impl Default for LaneTopology {
    fn default() -> Self {
        Self::standard()
    }
}

impl LaneTopology {
    /// Lanes side by side, 0 | 1 | 2 | 3
    pub fn standard() -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut lane_to_node = HashMap::new();

        for lane in Lane::all() {
            let node = graph.add_node(lane);
            lane_to_node.insert(lane, node);
        }

        let lanes: Vec<Lane> = Lane::all().collect();
        for pair in lanes.windows(2) {
            graph.add_edge(lane_to_node[&pair[0]], lane_to_node[&pair[1]], ());
        }

        Self {
            graph,
            lane_to_node,
        }
    }

    /// Lanes directly reachable from `lane`, in ascending index order
    pub fn adjacent(&self, lane: Lane) -> Vec<Lane> {
        let Some(node) = self.lane_to_node.get(&lane) else {
            return Vec::new();
        };

        let mut lanes: Vec<Lane> = self
            .graph
            .neighbors(*node)
            .map(|neighbor| self.graph[neighbor])
            .collect();
        lanes.sort();
        lanes
    }

    pub fn are_adjacent(&self, a: Lane, b: Lane) -> bool {
        match (self.lane_to_node.get(&a), self.lane_to_node.get(&b)) {
            (Some(na), Some(nb)) => self.graph.contains_edge(*na, *nb),
            _ => false,
        }
    }

    /// Same lane or one hop away
    pub fn is_same_or_adjacent(&self, a: Lane, b: Lane) -> bool {
        a == b || self.are_adjacent(a, b)
    }

    /// Whether a vehicle travelling with `heading` may regularly drive in `lane`
    pub fn carries(&self, lane: Lane, heading: Heading) -> bool {
        lane.kind() != LaneKind::Service && lane.heading() == heading
    }
}

/// Length of the looped track in meters
pub const DEFAULT_TRACK_LENGTH: f32 = 2000.0;

/// A closed-loop track; positions wrap modulo its length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    length: f32,
}

impl Default for Track {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_LENGTH)
    }
}

impl Track {
    pub fn new(length: f32) -> Self {
        Self {
            length: length.max(1.0),
        }
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    pub fn wrap(&self, position: f32) -> f32 {
        position.rem_euclid(self.length)
    }

    /// Distance travelled from `from` to reach `to` when moving with `heading`
    pub fn gap_ahead(&self, from: f32, to: f32, heading: Heading) -> f32 {
        match heading {
            Heading::Forward => (to - from).rem_euclid(self.length),
            Heading::Reverse => (from - to).rem_euclid(self.length),
        }
    }

    /// How far `to` is ahead of `from` along `heading`, in `(-L/2, L/2]`.
    /// Negative values mean `to` is behind.
    pub fn signed_offset(&self, from: f32, to: f32, heading: Heading) -> f32 {
        let ahead = self.gap_ahead(from, to, heading);
        if ahead > self.length / 2.0 {
            ahead - self.length
        } else {
            ahead
        }
    }

    /// Move `distance` meters along `heading` and wrap
    pub fn advance(&self, position: f32, distance: f32, heading: Heading) -> f32 {
        self.wrap(position + heading.sign() * distance)
    }
}
