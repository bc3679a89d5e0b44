//! Multi-node deployment simulator
//!
//! Runs N [`RangingNode`]s against an in-memory radio medium so the whole
//! token-rotation protocol can be exercised without hardware. Each node gets
//! its own thread (parallelism exists between simulated nodes, never inside
//! one) and an mpsc inbox standing in for its receiver.
//!
//! The medium is idealized but metrically honest: a shared device-tick
//! clock, RX timestamps synthesized as `tx_ts + tof_ticks(distance)` from a
//! ground-truth geometry, and a zero clock-offset ratio. Distances computed
//! by the protocol therefore reproduce the geometry up to one-tick
//! quantization (~4.7 mm), which is what the scenario tests assert.
//!
//! Loss is injected at the transmitter: a seeded random drop probability
//! for soak-style runs, plus a deterministic "drop the first response from
//! node X" plan for reproducible lossy tests.

use crate::frame::MessageType;
use crate::matrix::ConnectivityMatrix;
use crate::node::{NodeConfig, NodeEvent, NodeStats, RangingNode};
use crate::timing::{DEVICE_TIME_UNIT_S, SPEED_OF_LIGHT_M_S};
use crate::transport::{RadioError, RadioTransport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Clock ticks consumed by arming one immediate transmission.
const TX_ADVANCE_TICKS: u64 = 10_000;

/// Ground-truth node geometry, kept as a symmetric distance table.
#[derive(Debug, Clone)]
pub struct Geometry {
    node_count: usize,
    distances: Vec<f64>,
}

impl Geometry {
    /// Build from an explicit distance table (row-major, meters).
    pub fn from_distances(table: &[Vec<f64>]) -> Self {
        let node_count = table.len();
        let mut distances = vec![0.0; node_count * node_count];
        for (i, row) in table.iter().enumerate() {
            for (j, &d) in row.iter().enumerate() {
                distances[i * node_count + j] = d;
            }
        }
        Self { node_count, distances }
    }

    /// Scatter `node_count` nodes uniformly over a square of `area_m` side
    /// and derive the pairwise distances. Seeded for reproducibility.
    pub fn random(node_count: usize, area_m: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions: Vec<(f64, f64)> = (0..node_count)
            .map(|_| (rng.gen_range(0.0..area_m), rng.gen_range(0.0..area_m)))
            .collect();
        let mut distances = vec![0.0; node_count * node_count];
        for i in 0..node_count {
            for j in 0..node_count {
                let (xi, yi) = positions[i];
                let (xj, yj) = positions[j];
                distances[i * node_count + j] = ((xi - xj).powi(2) + (yi - yj).powi(2)).sqrt();
            }
        }
        Self { node_count, distances }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn distance(&self, i: u8, j: u8) -> f64 {
        self.distances[i as usize * self.node_count + j as usize]
    }

    /// One-way flight time in device ticks, rounded.
    fn tof_ticks(&self, i: u8, j: u8) -> u64 {
        (self.distance(i, j) / SPEED_OF_LIGHT_M_S / DEVICE_TIME_UNIT_S).round() as u64
    }
}

/// Frame-loss injection plan, applied at the transmitter.
#[derive(Debug, Clone, Default)]
pub struct LossPlan {
    /// Independent drop probability per transmitted frame, 0.0..=1.0.
    pub drop_probability: f64,
    /// Seed for the random drop draws.
    pub seed: u64,
    /// Deterministically drop the first RangingResponse sent by this node.
    pub drop_first_response_from: Option<u8>,
}

struct LossState {
    plan: LossPlan,
    rng: StdRng,
    response_dropped: bool,
}

impl LossState {
    fn new(plan: LossPlan) -> Self {
        let rng = StdRng::seed_from_u64(plan.seed);
        Self { plan, rng, response_dropped: false }
    }

    fn should_drop(&mut self, type_code: u8, src: u8) -> bool {
        if let Some(victim) = self.plan.drop_first_response_from {
            if !self.response_dropped
                && type_code == MessageType::RangingResponse as u8
                && src == victim
            {
                self.response_dropped = true;
                return true;
            }
        }
        self.plan.drop_probability > 0.0
            && self.rng.gen_bool(self.plan.drop_probability.clamp(0.0, 1.0))
    }
}

struct AirFrame {
    bytes: Vec<u8>,
    tx_ts: u64,
}

/// In-memory radio: directed mpsc delivery plus synthesized timestamps.
pub struct SimRadio {
    node_id: u8,
    rx: Receiver<AirFrame>,
    peers: HashMap<u8, Sender<AirFrame>>,
    geometry: Arc<Geometry>,
    loss: Arc<Mutex<LossState>>,
    clock: Arc<AtomicU64>,
    last_tx: u64,
    last_rx: u64,
}

impl SimRadio {
    fn deliver(&mut self, bytes: &[u8], tx_ts: u64) -> Result<(), RadioError> {
        if bytes.len() < 3 {
            return Err(RadioError::Tx("frame shorter than header".into()));
        }
        let (type_code, dest) = (bytes[0], bytes[2]);
        if let Ok(mut loss) = self.loss.lock() {
            if loss.should_drop(type_code, self.node_id) {
                return Ok(());
            }
        }
        let Some(sender) = self.peers.get(&dest) else {
            // Addressed to a node that does not exist: nobody hears it.
            return Ok(());
        };
        // A receiver that already shut down is indistinguishable from a
        // peer that is out of range; the frame just vanishes.
        let _ = sender.send(AirFrame { bytes: bytes.to_vec(), tx_ts });
        Ok(())
    }
}

impl RadioTransport for SimRadio {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        let tx_ts = self.clock.fetch_add(TX_ADVANCE_TICKS, Ordering::SeqCst) + TX_ADVANCE_TICKS;
        self.last_tx = tx_ts;
        self.deliver(bytes, tx_ts)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, RadioError> {
        let air = match self.rx.recv_timeout(timeout) {
            Ok(air) => air,
            Err(RecvTimeoutError::Timeout) => return Err(RadioError::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(RadioError::Disconnected),
        };
        if air.bytes.len() >= 3 {
            let src = air.bytes[1];
            self.last_rx = air.tx_ts + self.geometry.tof_ticks(src, self.node_id);
        }
        Ok(air.bytes)
    }

    fn schedule_delayed_tx(&mut self, bytes: &[u8], tx_time: u64) -> Result<(), RadioError> {
        if tx_time <= self.clock.load(Ordering::SeqCst) {
            return Err(RadioError::Schedule);
        }
        self.clock.fetch_max(tx_time, Ordering::SeqCst);
        self.last_tx = tx_time;
        self.deliver(bytes, tx_time)
    }

    fn local_tx_timestamp(&self) -> u64 {
        self.last_tx
    }

    fn local_rx_timestamp(&self) -> u64 {
        self.last_rx
    }

    fn clock_offset_ratio(&self) -> f32 {
        0.0
    }
}

/// Build one connected radio per node of the geometry.
pub fn build_network(geometry: Geometry, loss: LossPlan) -> Vec<SimRadio> {
    let geometry = Arc::new(geometry);
    let loss = Arc::new(Mutex::new(LossState::new(loss)));
    let clock = Arc::new(AtomicU64::new(0));

    let n = geometry.node_count();
    let mut senders = HashMap::with_capacity(n);
    let mut receivers = Vec::with_capacity(n);
    for id in 0..n as u8 {
        let (tx, rx) = mpsc::channel();
        senders.insert(id, tx);
        receivers.push(rx);
    }

    receivers
        .into_iter()
        .enumerate()
        .map(|(id, rx)| SimRadio {
            node_id: id as u8,
            rx,
            peers: senders.clone(),
            geometry: Arc::clone(&geometry),
            loss: Arc::clone(&loss),
            clock: Arc::clone(&clock),
            last_tx: 0,
            last_rx: 0,
        })
        .collect()
}

/// Protocol timing knobs for a simulated run.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Full token rotations to run (each rotation is N hand-off merges).
    pub rotations: usize,
    pub inter_ranging_delay: Duration,
    pub response_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            rotations: 1,
            inter_ranging_delay: Duration::ZERO,
            response_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(25),
        }
    }
}

/// Everything observable after a simulated run.
#[derive(Debug)]
pub struct SimReport {
    /// Final matrix held by each node, indexed by node id.
    pub matrices: Vec<ConnectivityMatrix>,
    /// Final protocol counters per node.
    pub stats: Vec<NodeStats>,
    /// Non-idle events per node, in that node's order.
    pub events: Vec<Vec<NodeEvent>>,
    /// Node ids in the global order they merged a hand-off.
    pub merge_order: Vec<u8>,
    /// False when the run stalled or a node thread died early.
    pub completed: bool,
}

/// Drive a full deployment for `opts.rotations` token rotations.
///
/// Each node retires itself once it has merged and handed off `rotations`
/// times (node 0's bootstrap sweep counts as its first hand-off), which
/// makes a lossless run fully deterministic: exactly `rotations × N`
/// merges happen, in round-robin order, and nobody sweeps past the last
/// one. The global stop flag only cuts runs short when the token is lost
/// to injected loss and the collector times out.
pub fn run(geometry: Geometry, loss: LossPlan, opts: SimOptions) -> SimReport {
    let n = geometry.node_count();
    let target_merges = opts.rotations * n;

    let radios = build_network(geometry, loss);
    let stop = Arc::new(AtomicBool::new(false));
    let (ev_tx, ev_rx) = mpsc::channel::<(u8, NodeEvent)>();

    let mut handles = Vec::with_capacity(n);
    for (id, radio) in radios.into_iter().enumerate() {
        let config = NodeConfig::new(id as u8, n)
            .with_inter_ranging_delay(opts.inter_ranging_delay)
            .with_response_timeout(opts.response_timeout)
            .with_idle_timeout(opts.idle_timeout);
        let mut node = RangingNode::new(config, radio);
        let stop = Arc::clone(&stop);
        let ev_tx = ev_tx.clone();
        let rotations = opts.rotations;
        handles.push(thread::spawn(move || {
            let mut merges = 0usize;
            let mut sends = 0usize;
            while !stop.load(Ordering::Relaxed) && !(merges == rotations && sends == rotations) {
                match node.step() {
                    Ok(NodeEvent::Idle) => {}
                    Ok(event) => {
                        match event {
                            NodeEvent::HandoffReceived { .. } => merges += 1,
                            NodeEvent::HandoffSent { .. } => sends += 1,
                            _ => {}
                        }
                        let _ = ev_tx.send((node.node_id(), event));
                    }
                    Err(e) => {
                        warn!(node = node.node_id(), error = %e, "node stopped");
                        break;
                    }
                }
            }
            node
        }));
    }
    drop(ev_tx);

    let mut events: Vec<Vec<NodeEvent>> = vec![Vec::new(); n];
    let mut merge_order = Vec::new();
    let mut completed = true;
    let mut merges = 0usize;
    while merges < target_merges {
        match ev_rx.recv_timeout(Duration::from_secs(30)) {
            Ok((id, event)) => {
                if matches!(event, NodeEvent::HandoffReceived { .. }) {
                    merges += 1;
                    merge_order.push(id);
                }
                events[id as usize].push(event);
            }
            Err(_) => {
                completed = false;
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);

    let mut matrices = vec![ConnectivityMatrix::new(n); n];
    let mut stats = vec![NodeStats::default(); n];
    for handle in handles {
        match handle.join() {
            Ok(node) => {
                let id = node.node_id() as usize;
                matrices[id] = node.matrix().clone();
                stats[id] = node.stats().clone();
            }
            Err(_) => completed = false,
        }
    }

    // Events raced in after the stop flag was raised.
    for (id, event) in ev_rx.try_iter() {
        if matches!(event, NodeEvent::HandoffReceived { .. }) {
            merge_order.push(id);
        }
        events[id as usize].push(event);
    }

    SimReport { matrices, stats, events, merge_order, completed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_from_table_is_queryable() {
        let g = Geometry::from_distances(&[
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ]);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.distance(0, 1), 1.0);
        // ~213 device ticks per meter of flight.
        assert_eq!(g.tof_ticks(0, 1), 213);
    }

    #[test]
    fn random_geometry_is_reproducible_and_symmetric() {
        let a = Geometry::random(5, 100.0, 7);
        let b = Geometry::random(5, 100.0, 7);
        for i in 0..5u8 {
            for j in 0..5u8 {
                assert_eq!(a.distance(i, j), b.distance(i, j));
                assert_eq!(a.distance(i, j), a.distance(j, i));
            }
        }
    }

    #[test]
    fn loss_state_drops_exactly_one_scripted_response() {
        let mut loss = LossState::new(LossPlan {
            drop_first_response_from: Some(2),
            ..LossPlan::default()
        });
        let resp = MessageType::RangingResponse as u8;
        assert!(!loss.should_drop(resp, 1));
        assert!(loss.should_drop(resp, 2));
        assert!(!loss.should_drop(resp, 2));
        assert!(!loss.should_drop(MessageType::RangingPoll as u8, 2));
    }
}
