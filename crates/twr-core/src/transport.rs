//! Radio transport seam
//!
//! The protocol core never touches hardware registers. Everything it needs
//! from a radio is expressed by [`RadioTransport`], implemented by the
//! external device driver on firmware and by [`crate::sim::SimRadio`] in
//! simulation. All waits are blocking-with-timeout; there is no
//! cancellation primitive, so every call resolves as success, timeout, or
//! error and the role state machines map all three deterministically.

use std::time::Duration;
use thiserror::Error;

/// Transport-level failures.
///
/// `Timeout` and `Rx` are routine: the initiator skips the peer, the
/// responder re-arms reception. `Schedule` abandons a single delayed reply.
/// Only `Disconnected` is fatal, and only simulated transports produce it
/// (the radio on a real node does not go away).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("receive timed out")]
    Timeout,
    #[error("receive failed: {0}")]
    Rx(String),
    #[error("transmit failed: {0}")]
    Tx(String),
    #[error("delayed transmit could not be scheduled in time")]
    Schedule,
    #[error("transport disconnected")]
    Disconnected,
}

/// Blocking radio transceiver interface.
///
/// Implementations own the single radio resource of a node; the role state
/// machine guarantees only the active role issues calls, so no interior
/// locking is required.
pub trait RadioTransport {
    /// Transmit a frame immediately.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), RadioError>;

    /// Block until a frame arrives or the timeout expires.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, RadioError>;

    /// Arm a transmission at an absolute device-time instant. Fails with
    /// [`RadioError::Schedule`] when the instant can no longer be met.
    fn schedule_delayed_tx(&mut self, bytes: &[u8], tx_time: u64) -> Result<(), RadioError>;

    /// Timestamp of the most recent transmission, device time units.
    fn local_tx_timestamp(&self) -> u64;

    /// Timestamp of the most recent reception, device time units.
    fn local_rx_timestamp(&self) -> u64;

    /// Remote clock rate relative to ours, from the carrier-frequency
    /// offset of the last reception. Zero means no measurable drift.
    fn clock_offset_ratio(&self) -> f32;
}
