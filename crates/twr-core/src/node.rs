//! Ranging node: the Initiator/Responder role state machine
//!
//! A node is always in exactly one of two roles. The Responder loop blocks
//! on reception, answers ranging polls with delayed timestamped replies,
//! and watches for the hand-off frame that promotes it. The Initiator sweep
//! ranges every peer in ascending id order, commits its matrix row, and
//! hands the token to `(id + 1) mod N`.
//!
//! Both roles hang off a single top-level [`RangingNode::step`] that
//! inspects the role field; the roles never call into each other, so there
//! is no recursive coupling between them and the caller always gets control
//! back after one bounded unit of work (one received frame, or one full
//! sweep).
//!
//! Loss never stalls the token: a missing or garbled response only leaves
//! one matrix cell stale, and the sweep always reaches its hand-off.

use crate::frame::{CodecError, Frame, MessageType, Payload};
use crate::matrix::{ConnectivityMatrix, ConnectivityStore};
use crate::timing::{distance_m, uus_to_device_time, TwrTimestamps};
use crate::transport::{RadioError, RadioTransport};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed deployment parameters of one node. All values are decided at
/// deploy time; nothing here is negotiated over the air.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id in `0..node_count`.
    pub node_id: u8,
    /// Deployment size N.
    pub node_count: usize,
    /// Pause between consecutive ranging exchanges of one sweep.
    pub inter_ranging_delay: Duration,
    /// Bounded wait for a ranging response.
    pub response_timeout: Duration,
    /// Bounded wait of one Responder listen before re-arming.
    pub idle_timeout: Duration,
    /// Poll-RX to response-TX turnaround, UWB microseconds.
    pub turnaround_uus: u32,
}

impl NodeConfig {
    pub fn new(node_id: u8, node_count: usize) -> Self {
        assert!(node_count >= 2, "a ranging deployment needs at least two nodes");
        assert!(node_count <= u8::MAX as usize, "node ids are u8, so at most 255 nodes");
        assert!((node_id as usize) < node_count, "node id out of range");
        Self {
            node_id,
            node_count,
            inter_ranging_delay: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(50),
            turnaround_uus: 650,
        }
    }

    pub fn with_inter_ranging_delay(mut self, delay: Duration) -> Self {
        self.inter_ranging_delay = delay;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_turnaround_uus(mut self, uus: u32) -> Self {
        self.turnaround_uus = uus;
        self
    }
}

/// The two mutually exclusive roles of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Initiator,
}

/// Outcome of one [`RangingNode::step`], for harnesses and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Listen window expired without a frame.
    Idle,
    /// A frame was received and discarded (misaddressed, undecodable,
    /// unexpected type, or a reply that could not be scheduled).
    Ignored,
    /// Answered a ranging poll from `peer`.
    PollAnswered { peer: u8 },
    /// Merged a hand-off matrix and became Initiator.
    HandoffReceived { from: u8 },
    /// Completed a sweep and handed the token to `to`; back to Responder.
    HandoffSent { to: u8 },
}

/// Per-node protocol counters, diagnostics only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub polls_answered: u64,
    pub exchanges_completed: u64,
    pub exchanges_timed_out: u64,
    pub sweeps_completed: u64,
    pub handoffs_received: u64,
    pub frames_ignored: u64,
}

/// Errors that terminate the drive loop. Everything the protocol can
/// recover from (timeouts, RX errors, scheduling misses) is absorbed inside
/// [`RangingNode::step`] and never surfaces here.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One ranging node: config, transport, store, role, sequence counter.
/// All state is owned here; there are no process-wide statics.
pub struct RangingNode<T: RadioTransport> {
    config: NodeConfig,
    transport: T,
    store: ConnectivityStore,
    role: Role,
    seq: u8,
    stats: NodeStats,
}

impl<T: RadioTransport> RangingNode<T> {
    /// Create a node around an already-initialized transport.
    ///
    /// Node 0 bootstraps as Initiator; every other node starts in the
    /// Responder loop and is only ever promoted by a hand-off. This fixed
    /// asymmetric bootstrap is deliberate; there is no leader election.
    pub fn new(config: NodeConfig, transport: T) -> Self {
        let role = if config.node_id == 0 { Role::Initiator } else { Role::Responder };
        let store = ConnectivityStore::new(config.node_count);
        Self { config, transport, store, role, seq: 0, stats: NodeStats::default() }
    }

    pub fn node_id(&self) -> u8 {
        self.config.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn matrix(&self) -> &ConnectivityMatrix {
        self.store.matrix()
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Run one unit of protocol work for the current role.
    pub fn step(&mut self) -> Result<NodeEvent, NodeError> {
        match self.role {
            Role::Initiator => self.initiator_sweep(),
            Role::Responder => self.responder_step(),
        }
    }

    // ── Initiator ─────────────────────────────────────────────────────────

    /// Range every peer once, commit the row, hand off the token.
    fn initiator_sweep(&mut self) -> Result<NodeEvent, NodeError> {
        let id = self.config.node_id;
        info!(node = id, "initiator sweep starting");

        for peer in 0..self.config.node_count as u8 {
            if peer == id {
                continue;
            }
            match self.range_peer(peer)? {
                Some(meters) => {
                    debug!(node = id, peer, meters, "distance measured");
                    self.store.record_distance(peer, meters);
                    self.stats.exchanges_completed += 1;
                }
                None => {
                    // Stale cell persists; no retry within this round.
                    warn!(node = id, peer, "ranging exchange lost, keeping previous distance");
                    self.stats.exchanges_timed_out += 1;
                }
            }
            if !self.config.inter_ranging_delay.is_zero() {
                thread::sleep(self.config.inter_ranging_delay);
            }
        }

        self.store.commit_row(id);
        self.stats.sweeps_completed += 1;

        let next = (id + 1) % self.config.node_count as u8;
        let handoff = Frame::handoff(id, next, self.seq, self.store.matrix().clone());
        let bytes = handoff.encode(self.config.node_count)?;
        self.transport.transmit(&bytes)?;
        self.seq = self.seq.wrapping_add(1);

        self.role = Role::Responder;
        info!(node = id, next, "sweep complete, token handed off");
        Ok(NodeEvent::HandoffSent { to: next })
    }

    /// One poll/response exchange. `Ok(None)` means the exchange was lost
    /// (transmit failure, timeout, or RX error) and the peer is skipped for
    /// this round.
    fn range_peer(&mut self, peer: u8) -> Result<Option<f64>, NodeError> {
        let id = self.config.node_id;
        let poll = Frame::poll(id, peer, self.seq);
        let bytes = poll.encode(self.config.node_count)?;
        match self.transport.transmit(&bytes) {
            Ok(()) => {}
            Err(RadioError::Disconnected) => return Err(RadioError::Disconnected.into()),
            Err(e) => {
                warn!(node = id, peer, error = %e, "poll transmit failed");
                return Ok(None);
            }
        }
        self.seq = self.seq.wrapping_add(1);
        let poll_tx = self.transport.local_tx_timestamp();

        let Some((poll_rx_ts, resp_tx_ts)) = self.await_response(peer)? else {
            return Ok(None);
        };

        let ts = TwrTimestamps {
            poll_tx: poll_tx as u32,
            resp_rx: self.transport.local_rx_timestamp() as u32,
            poll_rx: poll_rx_ts,
            resp_tx: resp_tx_ts,
        };
        Ok(Some(distance_m(&ts, self.transport.clock_offset_ratio())))
    }

    /// Wait out the response window for `peer`. Frames of any other
    /// type/source/destination inside the window are discarded and the wait
    /// continues until the deadline.
    fn await_response(&mut self, peer: u8) -> Result<Option<(u32, u32)>, NodeError> {
        let id = self.config.node_id;
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let bytes = match self.transport.receive(deadline - now) {
                Ok(bytes) => bytes,
                Err(RadioError::Timeout) => return Ok(None),
                Err(RadioError::Rx(e)) => {
                    // RX/CRC errors recover exactly like a timeout.
                    debug!(node = id, peer, error = %e, "receive error during ranging wait");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            let frame = match Frame::decode(&bytes, self.config.node_count) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(node = id, error = %e, "undecodable frame during ranging wait");
                    continue;
                }
            };
            if frame.header.msg_type == MessageType::RangingResponse
                && frame.header.src == peer
                && frame.header.dest == id
            {
                if let Payload::Response { poll_rx_ts, resp_tx_ts } = frame.payload {
                    return Ok(Some((poll_rx_ts, resp_tx_ts)));
                }
            }
            debug!(node = id, peer, "unexpected frame during ranging wait, discarded");
        }
    }

    // ── Responder ─────────────────────────────────────────────────────────

    /// One bounded listen: answer a poll, accept a hand-off, or discard.
    fn responder_step(&mut self) -> Result<NodeEvent, NodeError> {
        let id = self.config.node_id;
        let bytes = match self.transport.receive(self.config.idle_timeout) {
            Ok(bytes) => bytes,
            Err(RadioError::Timeout) => return Ok(NodeEvent::Idle),
            Err(RadioError::Rx(e)) => {
                debug!(node = id, error = %e, "receive error, re-arming");
                return Ok(NodeEvent::Idle);
            }
            Err(e) => return Err(e.into()),
        };

        let frame = match Frame::decode(&bytes, self.config.node_count) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(node = id, error = %e, "discarding undecodable frame");
                self.stats.frames_ignored += 1;
                return Ok(NodeEvent::Ignored);
            }
        };
        if frame.header.dest != id {
            self.stats.frames_ignored += 1;
            return Ok(NodeEvent::Ignored);
        }

        match frame.header.msg_type {
            MessageType::RangingPoll => self.answer_poll(frame.header.src),
            MessageType::RoleHandoff => {
                let Payload::Handoff { matrix } = frame.payload else {
                    self.stats.frames_ignored += 1;
                    return Ok(NodeEvent::Ignored);
                };
                self.store.merge_matrix(matrix);
                self.role = Role::Initiator;
                self.stats.handoffs_received += 1;
                info!(node = id, from = frame.header.src, "hand-off merged, promoted to initiator");
                Ok(NodeEvent::HandoffReceived { from: frame.header.src })
            }
            MessageType::RangingResponse => {
                self.stats.frames_ignored += 1;
                Ok(NodeEvent::Ignored)
            }
        }
    }

    /// Reply to a poll at a fixed turnaround after its reception, embedding
    /// the poll-RX timestamp and the planned TX timestamp.
    fn answer_poll(&mut self, peer: u8) -> Result<NodeEvent, NodeError> {
        let id = self.config.node_id;
        let poll_rx = self.transport.local_rx_timestamp();
        let resp_tx_time = poll_rx.wrapping_add(uus_to_device_time(self.config.turnaround_uus));

        let response =
            Frame::response(id, peer, self.seq, poll_rx as u32, resp_tx_time as u32);
        let bytes = response.encode(self.config.node_count)?;
        match self.transport.schedule_delayed_tx(&bytes, resp_tx_time) {
            Ok(()) => {
                self.seq = self.seq.wrapping_add(1);
                self.stats.polls_answered += 1;
                debug!(node = id, peer, "poll answered");
                Ok(NodeEvent::PollAnswered { peer })
            }
            Err(RadioError::Disconnected) => Err(RadioError::Disconnected.into()),
            Err(e) => {
                // The initiator's timeout absorbs the loss.
                warn!(node = id, peer, error = %e, "reply could not be scheduled, exchange abandoned");
                Ok(NodeEvent::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: hands out queued frames, records everything the
    /// node transmits or schedules.
    struct MockRadio {
        inbox: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        scheduled: Vec<(Vec<u8>, u64)>,
        fail_schedule: bool,
        rx_ts: u64,
        tx_ts: u64,
    }

    impl MockRadio {
        fn new() -> Self {
            Self {
                inbox: VecDeque::new(),
                sent: Vec::new(),
                scheduled: Vec::new(),
                fail_schedule: false,
                rx_ts: 123_456,
                tx_ts: 100_000,
            }
        }

        fn queue(&mut self, frame: &Frame, node_count: usize) {
            self.inbox.push_back(frame.encode(node_count).unwrap());
        }
    }

    impl RadioTransport for MockRadio {
        fn transmit(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Vec<u8>, RadioError> {
            self.inbox.pop_front().ok_or(RadioError::Timeout)
        }

        fn schedule_delayed_tx(&mut self, bytes: &[u8], tx_time: u64) -> Result<(), RadioError> {
            if self.fail_schedule {
                return Err(RadioError::Schedule);
            }
            self.scheduled.push((bytes.to_vec(), tx_time));
            Ok(())
        }

        fn local_tx_timestamp(&self) -> u64 {
            self.tx_ts
        }

        fn local_rx_timestamp(&self) -> u64 {
            self.rx_ts
        }

        fn clock_offset_ratio(&self) -> f32 {
            0.0
        }
    }

    fn fast_config(node_id: u8, node_count: usize) -> NodeConfig {
        NodeConfig::new(node_id, node_count)
            .with_inter_ranging_delay(Duration::ZERO)
            .with_response_timeout(Duration::from_millis(5))
            .with_idle_timeout(Duration::from_millis(5))
    }

    #[test]
    fn responder_answers_poll_with_delayed_timestamped_reply() {
        let mut radio = MockRadio::new();
        radio.queue(&Frame::poll(0, 1, 7), 2);
        let mut node = RangingNode::new(fast_config(1, 2), radio);

        let event = node.step().unwrap();
        assert_eq!(event, NodeEvent::PollAnswered { peer: 0 });

        let (bytes, tx_time) = node.transport.scheduled[0].clone();
        let expected_time = 123_456 + uus_to_device_time(650);
        assert_eq!(tx_time, expected_time);

        let reply = Frame::decode(&bytes, 2).unwrap();
        assert_eq!(reply.header.msg_type, MessageType::RangingResponse);
        assert_eq!((reply.header.src, reply.header.dest), (1, 0));
        assert_eq!(
            reply.payload,
            Payload::Response { poll_rx_ts: 123_456, resp_tx_ts: expected_time as u32 }
        );
    }

    #[test]
    fn responder_discards_misaddressed_frames() {
        let mut radio = MockRadio::new();
        radio.queue(&Frame::poll(0, 3, 0), 4);
        let mut node = RangingNode::new(fast_config(1, 4), radio);

        assert_eq!(node.step().unwrap(), NodeEvent::Ignored);
        assert!(node.transport.scheduled.is_empty());
        assert_eq!(node.stats().frames_ignored, 1);
    }

    #[test]
    fn schedule_failure_abandons_the_exchange() {
        let mut radio = MockRadio::new();
        radio.queue(&Frame::poll(0, 1, 0), 2);
        radio.fail_schedule = true;
        let mut node = RangingNode::new(fast_config(1, 2), radio);

        assert_eq!(node.step().unwrap(), NodeEvent::Ignored);
        assert_eq!(node.role(), Role::Responder);
    }

    #[test]
    fn handoff_merges_matrix_and_promotes() {
        let mut matrix = ConnectivityMatrix::new(3);
        matrix.set_row(0, &[0.0, 1.5, 2.0]);

        let mut radio = MockRadio::new();
        radio.queue(&Frame::handoff(0, 1, 3, matrix), 3);
        let mut node = RangingNode::new(fast_config(1, 3), radio);
        assert_eq!(node.role(), Role::Responder);

        let event = node.step().unwrap();
        assert_eq!(event, NodeEvent::HandoffReceived { from: 0 });
        assert_eq!(node.role(), Role::Initiator);
        assert_eq!(node.matrix().get(0, 1), 1.5);
    }

    #[test]
    fn silent_peers_do_not_stall_the_sweep() {
        // Node 0 bootstraps as Initiator; nobody answers its polls.
        let radio = MockRadio::new();
        let mut node = RangingNode::new(fast_config(0, 3), radio);
        assert_eq!(node.role(), Role::Initiator);

        let event = node.step().unwrap();
        assert_eq!(event, NodeEvent::HandoffSent { to: 1 });
        assert_eq!(node.role(), Role::Responder);
        assert_eq!(node.stats().exchanges_timed_out, 2);

        // Two polls then the hand-off, all transmitted despite the losses.
        assert_eq!(node.transport.sent.len(), 3);
        let last = Frame::decode(node.transport.sent.last().unwrap(), 3).unwrap();
        assert_eq!(last.header.msg_type, MessageType::RoleHandoff);
        assert_eq!(last.header.dest, 1);
    }

    #[test]
    fn sequence_number_rolls_over_transmissions() {
        let mut radio = MockRadio::new();
        radio.queue(&Frame::poll(0, 1, 0), 2);
        radio.queue(&Frame::poll(0, 1, 1), 2);
        let mut node = RangingNode::new(fast_config(1, 2), radio);
        node.step().unwrap();
        node.step().unwrap();

        let first = Frame::decode(&node.transport.scheduled[0].0, 2).unwrap();
        let second = Frame::decode(&node.transport.scheduled[1].0, 2).unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
    }

    #[test]
    #[should_panic(expected = "at most 255 nodes")]
    fn config_rejects_deployments_larger_than_id_space() {
        let _ = NodeConfig::new(0, 256);
    }
}
