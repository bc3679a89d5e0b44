//! # Token-rotating SS-TWR connectivity-matrix protocol
//!
//! N UWB nodes, identified by ids `0..N`, cooperatively assemble a full
//! N×N inter-node distance matrix. Exactly one node holds the Initiator
//! role at a time: it ranges every peer with a single-sided two-way-ranging
//! exchange, folds the distances into the shared matrix, and hands the role
//! to the next node by transmitting the updated matrix. Every other node
//! answers polls in the Responder role.
//!
//! ## Protocol cycle
//!
//! ```text
//! ┌───────────┐  poll/response × (N-1)   ┌───────────┐
//! │ Initiator │◀────────────────────────▶│ Responders│
//! │ (node k)  │                          │ (≠ k)     │
//! └─────┬─────┘                          └─────▲─────┘
//!       │  commit row k, RoleHandoff(matrix)   │
//!       └────────────▶ node (k+1) mod N ───────┘
//! ```
//!
//! ## Layers
//!
//! - [`timing`]: timestamp arithmetic and time-of-flight math
//! - [`frame`]: fixed-size wire codec (poll, response, hand-off)
//! - [`matrix`]: the distance vector and connectivity-matrix store
//! - [`transport`]: the blocking radio seam implemented by drivers
//! - [`node`]: the Initiator/Responder role state machine
//! - [`sim`]: an in-memory multi-node deployment for tests and demos
//!
//! Radio bring-up, antenna calibration and board support live outside this
//! crate; a node is handed an already-initialized [`transport::RadioTransport`].
//!
//! ## Example
//!
//! ```rust
//! use twr_core::sim::{self, Geometry, LossPlan, SimOptions};
//!
//! // Simulate a 3-node deployment for one full token rotation.
//! let geometry = Geometry::random(3, 50.0, 1);
//! let report = sim::run(geometry, LossPlan::default(), SimOptions::default());
//! assert!(report.completed);
//! println!("{}", report.matrices[0]);
//! ```

pub mod frame;
pub mod matrix;
pub mod node;
pub mod sim;
pub mod timing;
pub mod transport;

pub use frame::{CodecError, Frame, FrameHeader, MessageType, Payload};
pub use matrix::{ConnectivityMatrix, ConnectivityStore};
pub use node::{NodeConfig, NodeError, NodeEvent, NodeStats, RangingNode, Role};
pub use transport::{RadioError, RadioTransport};
