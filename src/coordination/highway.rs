//! A simulated highway: many vehicle nodes sharing one in-process broker
//!
//! Used by the headless binary and by tests. `tick` steps every node in turn
//! so runs with a seed are reproducible; `run_threaded` gives each node its
//! own thread the way a real deployment would.

use anyhow::{anyhow, bail, Result};
use log::info;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use super::config::CoordinationConfig;
use super::node::{TickReport, VehicleNode};
use super::transport::{FaultProfile, InMemoryBroker};
use super::types::{HeadlightMode, Heading, Lane, Role, VehicleId, VehicleState, LANE_COUNT};

/// Running totals over every tick stepped by [`Highway::tick`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HighwayStats {
    pub ticks: u64,
    pub messages_received: u64,
    pub messages_malformed: u64,
    pub peers_evicted: u64,
    pub lane_changes_deferred: u64,
    pub transport_errors: u64,
    pub degraded_ticks: u64,
}

impl HighwayStats {
    fn record(&mut self, report: &TickReport) {
        self.messages_received += report.received as u64;
        self.messages_malformed += report.malformed as u64;
        self.peers_evicted += report.evicted.len() as u64;
        self.lane_changes_deferred += u64::from(report.deferred.is_some());
        self.transport_errors += u64::from(report.transport_error.is_some());
        self.degraded_ticks += u64::from(report.degraded);
    }
}

pub struct Highway {
    config: CoordinationConfig,
    broker: InMemoryBroker,
    nodes: Vec<VehicleNode>,

    /// Simulation time
    pub time: f32,

    pub stats: HighwayStats,

    /// Optional seeded RNG for reproducible placement
    rng: Option<StdRng>,
    seed: u64,
}

impl Highway {
    fn new_internal(config: CoordinationConfig, rng: Option<StdRng>, seed: u64) -> Self {
        Self {
            config,
            broker: InMemoryBroker::new(),
            nodes: Vec::new(),
            time: 0.0,
            stats: HighwayStats::default(),
            rng,
            seed,
        }
    }

    pub fn new(config: CoordinationConfig) -> Self {
        Self::new_internal(config, None, 0)
    }

    /// Create a highway with a seeded RNG for reproducible runs
    pub fn new_with_seed(config: CoordinationConfig, seed: u64) -> Self {
        Self::new_internal(config, Some(StdRng::seed_from_u64(seed)), seed)
    }

    /// Swap in a broker injecting `faults`. Only valid before any vehicle is added.
    pub fn with_faults(mut self, faults: FaultProfile) -> Self {
        if self.nodes.is_empty() {
            self.broker = InMemoryBroker::with_faults(faults, self.seed);
        }
        self
    }

    fn random_range(&mut self, range: std::ops::Range<f32>) -> f32 {
        match &mut self.rng {
            Some(rng) => rng.random_range(range),
            None => rand::rng().random_range(range),
        }
    }

    fn choose_random<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        match &mut self.rng {
            Some(rng) => slice.choose(rng),
            None => slice.choose(&mut rand::rng()),
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn nodes(&self) -> &[VehicleNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&VehicleNode> {
        self.nodes.iter().find(|node| node.id().as_str() == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut VehicleNode> {
        self.nodes.iter_mut().find(|node| node.id().as_str() == id)
    }

    /// Add a vehicle node connected to this highway's broker
    pub fn add_vehicle(
        &mut self,
        id: &str,
        lane: Lane,
        position: f32,
        speed: f32,
        role: Role,
    ) -> Result<&mut VehicleNode> {
        if id.is_empty() {
            bail!("Vehicle id must not be empty");
        }
        if self.node(id).is_some() {
            bail!("Vehicle {} already on the highway", id);
        }

        let state = VehicleState::new(VehicleId::new(id), lane, position, speed, role);
        let node = VehicleNode::new(state, self.config.clone(), Box::new(self.broker.connect()));
        self.nodes.push(node);
        self.nodes
            .last_mut()
            .ok_or_else(|| anyhow!("Vehicle {} was not added", id))
    }

    /// Place `count` ordinary vehicles at random positions and speeds
    pub fn spawn_random_traffic(&mut self, count: usize) -> Result<()> {
        // Most traffic cruises in lane 1
        let lanes = [Lane::CRUISE, Lane::CRUISE, Lane::FAST, Lane::OPPOSITE];
        let start = self.nodes.len();

        for n in 0..count {
            let id = format!("V{}", start + n + 1);
            let lane = self.choose_random(&lanes).copied().unwrap_or(Lane::CRUISE);
            let position = self.random_range(0.0..1500.0).floor();
            let speed = self.random_range(20.0..30.0).floor();
            self.add_vehicle(&id, lane, position, speed, Role::Normal)?;
        }

        info!("Spawned {} vehicles", count);
        Ok(())
    }

    /// Step every node once, in insertion order
    pub fn tick(&mut self, delta_secs: f32) {
        for node in &mut self.nodes {
            let report = node.tick(delta_secs);
            self.stats.record(&report);
        }
        self.stats.ticks += 1;
        self.time += delta_secs;
    }

    /// Run every node on its own thread for `ticks` ticks or until `stop` is
    /// raised. Returns the ticks executed per node.
    pub fn run_threaded(&mut self, tick_interval: Duration, ticks: u64, stop: &AtomicBool) -> Result<Vec<u64>> {
        let counts = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .nodes
                .iter_mut()
                .map(|node| scope.spawn(move || node.run(stop, tick_interval, Some(ticks))))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| anyhow!("Vehicle node thread panicked")))
                .collect::<Result<Vec<u64>>>()
        })?;

        let most = counts.iter().copied().max().unwrap_or(0);
        self.stats.ticks += most;
        self.time += most as f32 * tick_interval.as_secs_f32();
        Ok(counts)
    }

    pub fn print_summary(&self) {
        let (published, delivered) = self.broker.stats();

        println!("=== Highway Summary ===");
        println!("Time: {:.2}s", self.time);
        println!("Vehicles: {}", self.nodes.len());
        println!("Messages published: {}, delivered: {}", published, delivered);
        println!();

        println!("--- Vehicles ---");
        for node in &self.nodes {
            let view = node.dashboard();
            let mut notes = Vec::new();
            if view.decision.braking {
                notes.push("braking".to_string());
            }
            if view.drowsy {
                notes.push("drowsy".to_string());
            }
            if view.degraded {
                notes.push("degraded".to_string());
            }
            if let Some(ev) = &view.yielding_to {
                notes.push(format!("yielding to {}", ev));
            }
            if view.headlight == HeadlightMode::Low {
                notes.push("low beam".to_string());
            }

            println!(
                "  {} lane={} pos={:.0}m speed={:.1}m/s peers={} {}",
                view.state.id,
                view.state.lane,
                view.state.position,
                view.state.speed,
                view.peer_count,
                notes.join(", ")
            );

            if let Some(ev) = &view.owned_emergency {
                println!(
                    "  {} lane={} pos={:.0}m speed={:.1}m/s (dispatched by {})",
                    ev.id, ev.lane, ev.position, ev.speed, view.state.id
                );
            }
        }
        println!();
    }

    /// ASCII view of the four lanes, one column per `track_length / width` metres
    pub fn draw_map(&self) {
        let width = 100;
        let track = self.config.track();
        let scale = width as f32 / track.length();

        let mut grid = vec![vec!['-'; width]; LANE_COUNT as usize];
        if let Some(first) = self.nodes.first() {
            for id in first.active_street_lights() {
                let col = ((id.0 as f32 * self.config.streetlight_spacing) * scale) as usize;
                if let Some(cell) = grid[Lane::SERVICE.index() as usize].get_mut(col) {
                    *cell = '*';
                }
            }
        }

        let mut plot = |state: &VehicleState| {
            let col = ((track.wrap(state.position) * scale) as usize).min(width - 1);
            let row = state.lane.index() as usize;
            grid[row][col] = if state.role == Role::Emergency {
                'E'
            } else if state.is_drowsy() {
                'Z'
            } else {
                match state.heading() {
                    Heading::Forward => '>',
                    Heading::Reverse => '<',
                }
            };
        };

        for node in &self.nodes {
            plot(node.state());
            if let Some(ev) = node.owned_emergency() {
                plot(ev);
            }
        }

        println!("\n=== Highway Map ===");
        println!("Legend: >/< = Vehicle, E=Emergency, Z=Drowsy, *=Lit street light");
        println!();
        for (index, row) in grid.iter().enumerate() {
            let line: String = row.iter().collect();
            println!("{} |{}|", index, line);
        }
        println!();
    }
}
