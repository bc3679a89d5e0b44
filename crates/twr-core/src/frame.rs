//! Wire frame codec for the ranging protocol
//!
//! Every frame in a deployment of N nodes has the same fixed size, so the
//! parser never has to guess a layout from the type code alone:
//!
//! ```text
//! ┌──────────────┬───────────────────┬────────────────────┬───────────────┐
//! │ Header (3B)  │ Poll region (12B) │ Resp region (20B)  │ Matrix region │
//! │ type,src,dst │ 802.15.4 preamble │ preamble + 2×u32   │ N²×8B doubles │
//! │              │ func code 0xE0    │ ts @ 10 and 14     │ (row-major)   │
//! └──────────────┴───────────────────┴────────────────────┴───────────────┘
//! ```
//!
//! The poll and response regions reproduce the frame bodies of the
//! underlying UWB MAC convention byte for byte, timestamp offsets included,
//! so a peer running independently written firmware interoperates. The
//! rolling sequence number sits at offset 2 of each preamble region and is
//! diagnostics-only. Exactly one region is meaningful per message type; the
//! others are carried zeroed/templated.

use crate::matrix::ConnectivityMatrix;
use thiserror::Error;

/// Header: 1 byte type code, 1 byte source id, 1 byte destination id.
pub const HEADER_LEN: usize = 3;
/// Fixed 12-byte poll preamble region.
pub const POLL_REGION_LEN: usize = 12;
/// Fixed 20-byte response region.
pub const RESP_REGION_LEN: usize = 20;

const POLL_REGION_OFFSET: usize = HEADER_LEN;
const RESP_REGION_OFFSET: usize = HEADER_LEN + POLL_REGION_LEN;
const MATRIX_REGION_OFFSET: usize = RESP_REGION_OFFSET + RESP_REGION_LEN;

/// Sequence-number offset within each preamble region.
pub const SEQ_IDX: usize = 2;
/// Poll-receive timestamp offset within the response region.
pub const RESP_POLL_RX_TS_IDX: usize = 10;
/// Response-transmit timestamp offset within the response region.
pub const RESP_RESP_TX_TS_IDX: usize = 14;

/// Poll frame body per the UWB MAC convention (function code 0xE0).
const POLL_PREAMBLE: [u8; POLL_REGION_LEN] =
    [0x41, 0x88, 0, 0xCA, 0xDE, 0, 0, 0, 0, 0xE0, 0, 0];
/// Response frame body (function code 0xE1); timestamps land at 10 and 14.
const RESP_PREAMBLE: [u8; RESP_REGION_LEN] = [
    0x41, 0x88, 0, 0xCA, 0xDE, 0, 0, 0, 0, 0xE1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Total on-wire frame length for a deployment of `node_count` nodes.
pub fn frame_len(node_count: usize) -> usize {
    MATRIX_REGION_OFFSET + node_count * node_count * 8
}

/// Codec failures. A frame that fails to decode is discarded by the
/// receiving role without any state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame too short: got {got} bytes, need {need}")]
    FrameTooShort { got: usize, need: usize },
    #[error("frame too long: got {got} bytes, max {max}")]
    FrameTooLong { got: usize, max: usize },
    #[error("unknown message type code {0:#04x}")]
    BadMessageType(u8),
    #[error("hand-off matrix is {got}x{got}, deployment is {want}x{want}")]
    MatrixSizeMismatch { got: usize, want: usize },
}

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Promotes the addressee to Initiator; carries the full matrix.
    RoleHandoff = 0,
    /// Ranging poll, answered with a timestamped response.
    RangingPoll = 1,
    /// Ranging response carrying the responder's two timestamps.
    RangingResponse = 2,
}

impl MessageType {
    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(MessageType::RoleHandoff),
            1 => Ok(MessageType::RangingPoll),
            2 => Ok(MessageType::RangingResponse),
            other => Err(CodecError::BadMessageType(other)),
        }
    }
}

/// Frame metadata: type, sender id, addressee id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub src: u8,
    pub dest: u8,
}

/// Exactly one payload variant is meaningful per message type; modeling the
/// union as a sum type keeps access to the inactive variants
/// unrepresentable even though the wire always carries space for all three.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No payload beyond the fixed poll preamble.
    Poll,
    /// The responder's timestamps, truncated to 32 bits for the wire.
    Response { poll_rx_ts: u32, resp_tx_ts: u32 },
    /// The full connectivity matrix handed to the next initiator.
    Handoff { matrix: ConnectivityMatrix },
}

/// A decoded (or to-be-encoded) protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    /// Rolling 8-bit sequence number, diagnostics/ordering only.
    pub seq: u8,
    pub payload: Payload,
}

impl Frame {
    pub fn poll(src: u8, dest: u8, seq: u8) -> Self {
        Self {
            header: FrameHeader { msg_type: MessageType::RangingPoll, src, dest },
            seq,
            payload: Payload::Poll,
        }
    }

    pub fn response(src: u8, dest: u8, seq: u8, poll_rx_ts: u32, resp_tx_ts: u32) -> Self {
        Self {
            header: FrameHeader { msg_type: MessageType::RangingResponse, src, dest },
            seq,
            payload: Payload::Response { poll_rx_ts, resp_tx_ts },
        }
    }

    pub fn handoff(src: u8, dest: u8, seq: u8, matrix: ConnectivityMatrix) -> Self {
        Self {
            header: FrameHeader { msg_type: MessageType::RoleHandoff, src, dest },
            seq,
            payload: Payload::Handoff { matrix },
        }
    }

    /// Serialize into the fixed-size wire layout for a `node_count`
    /// deployment.
    pub fn encode(&self, node_count: usize) -> Result<Vec<u8>, CodecError> {
        if let Payload::Handoff { matrix } = &self.payload {
            if matrix.node_count() != node_count {
                return Err(CodecError::MatrixSizeMismatch {
                    got: matrix.node_count(),
                    want: node_count,
                });
            }
        }

        let mut buf = vec![0u8; frame_len(node_count)];
        buf[0] = self.header.msg_type as u8;
        buf[1] = self.header.src;
        buf[2] = self.header.dest;

        let poll = &mut buf[POLL_REGION_OFFSET..POLL_REGION_OFFSET + POLL_REGION_LEN];
        poll.copy_from_slice(&POLL_PREAMBLE);
        poll[SEQ_IDX] = self.seq;

        let resp = &mut buf[RESP_REGION_OFFSET..RESP_REGION_OFFSET + RESP_REGION_LEN];
        resp.copy_from_slice(&RESP_PREAMBLE);
        resp[SEQ_IDX] = self.seq;

        match &self.payload {
            Payload::Poll => {}
            Payload::Response { poll_rx_ts, resp_tx_ts } => {
                let resp =
                    &mut buf[RESP_REGION_OFFSET..RESP_REGION_OFFSET + RESP_REGION_LEN];
                resp[RESP_POLL_RX_TS_IDX..RESP_POLL_RX_TS_IDX + 4]
                    .copy_from_slice(&poll_rx_ts.to_le_bytes());
                resp[RESP_RESP_TX_TS_IDX..RESP_RESP_TX_TS_IDX + 4]
                    .copy_from_slice(&resp_tx_ts.to_le_bytes());
            }
            Payload::Handoff { matrix } => {
                let region = &mut buf[MATRIX_REGION_OFFSET..];
                for (chunk, cell) in region.chunks_exact_mut(8).zip(matrix.cells()) {
                    chunk.copy_from_slice(&cell.to_le_bytes());
                }
            }
        }

        Ok(buf)
    }

    /// Parse a received buffer for a `node_count` deployment.
    ///
    /// The buffer must be exactly [`frame_len`]`(node_count)` bytes; anything
    /// shorter cannot contain a valid frame and anything longer exceeds the
    /// deployment's maximum frame size.
    pub fn decode(bytes: &[u8], node_count: usize) -> Result<Self, CodecError> {
        let need = frame_len(node_count);
        if bytes.len() < need {
            return Err(CodecError::FrameTooShort { got: bytes.len(), need });
        }
        if bytes.len() > need {
            return Err(CodecError::FrameTooLong { got: bytes.len(), max: need });
        }

        let msg_type = MessageType::from_code(bytes[0])?;
        let header = FrameHeader { msg_type, src: bytes[1], dest: bytes[2] };
        let seq = bytes[POLL_REGION_OFFSET + SEQ_IDX];

        let payload = match msg_type {
            MessageType::RangingPoll => Payload::Poll,
            MessageType::RangingResponse => {
                let resp = &bytes[RESP_REGION_OFFSET..RESP_REGION_OFFSET + RESP_REGION_LEN];
                let poll_rx_ts = u32::from_le_bytes(
                    resp[RESP_POLL_RX_TS_IDX..RESP_POLL_RX_TS_IDX + 4]
                        .try_into()
                        .unwrap_or_default(),
                );
                let resp_tx_ts = u32::from_le_bytes(
                    resp[RESP_RESP_TX_TS_IDX..RESP_RESP_TX_TS_IDX + 4]
                        .try_into()
                        .unwrap_or_default(),
                );
                Payload::Response { poll_rx_ts, resp_tx_ts }
            }
            MessageType::RoleHandoff => {
                let cells = bytes[MATRIX_REGION_OFFSET..]
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap_or_default()))
                    .collect();
                let matrix = ConnectivityMatrix::from_cells(node_count, cells).ok_or(
                    CodecError::MatrixSizeMismatch { got: 0, want: node_count },
                )?;
                Payload::Handoff { matrix }
            }
        };

        Ok(Frame { header, seq, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_round_trip_and_preamble_bytes() {
        let frame = Frame::poll(2, 3, 0x5A);
        let bytes = frame.encode(4).unwrap();
        assert_eq!(bytes.len(), frame_len(4));
        assert_eq!(&bytes[..3], &[1, 2, 3]);
        // Preamble with the sequence number stamped at region offset 2.
        assert_eq!(
            &bytes[3..15],
            &[0x41, 0x88, 0x5A, 0xCA, 0xDE, 0, 0, 0, 0, 0xE0, 0, 0]
        );
        assert_eq!(Frame::decode(&bytes, 4).unwrap(), frame);
    }

    #[test]
    fn response_timestamps_sit_at_fixed_offsets() {
        let frame = Frame::response(1, 0, 7, 0x1122_3344, 0xAABB_CCDD);
        let bytes = frame.encode(4).unwrap();
        // Response region starts at 15; function code 0xE1 at region offset 9.
        assert_eq!(bytes[15 + 9], 0xE1);
        assert_eq!(&bytes[15 + 10..15 + 14], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&bytes[15 + 14..15 + 18], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(Frame::decode(&bytes, 4).unwrap(), frame);
    }

    #[test]
    fn handoff_round_trips_matrix_cells() {
        let mut matrix = ConnectivityMatrix::new(3);
        matrix.set_row(0, &[0.0, 1.25, 2.5]);
        matrix.set_row(2, &[0.75, 3.0, 0.0]);
        let frame = Frame::handoff(2, 0, 9, matrix);
        let bytes = frame.encode(3).unwrap();
        let decoded = Frame::decode(&bytes, 3).unwrap();
        assert_eq!(decoded, frame);
        match decoded.payload {
            Payload::Handoff { matrix } => {
                assert_eq!(matrix.get(0, 1), 1.25);
                assert_eq!(matrix.get(2, 0), 0.75);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn short_and_long_buffers_are_rejected() {
        let bytes = Frame::poll(0, 1, 0).encode(4).unwrap();
        assert!(matches!(
            Frame::decode(&bytes[..10], 4),
            Err(CodecError::FrameTooShort { .. })
        ));
        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(
            Frame::decode(&long, 4),
            Err(CodecError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut bytes = Frame::poll(0, 1, 0).encode(2).unwrap();
        bytes[0] = 9;
        assert_eq!(Frame::decode(&bytes, 2), Err(CodecError::BadMessageType(9)));
    }

    #[test]
    fn encode_rejects_foreign_matrix_size() {
        let frame = Frame::handoff(0, 1, 0, ConnectivityMatrix::new(3));
        assert!(matches!(
            frame.encode(4),
            Err(CodecError::MatrixSizeMismatch { got: 3, want: 4 })
        ));
    }
}
