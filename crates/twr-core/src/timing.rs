//! Timestamp arithmetic and time-of-flight computation for SS-TWR
//!
//! A single-sided two-way-ranging exchange produces four timestamps:
//!
//! ```text
//! Initiator                    Responder
//!     │── poll ────────────────────▶│
//!  poll_tx                       poll_rx
//!     │                             │ (fixed turnaround)
//!     │◀─────────────────── resp ───│
//!  resp_rx                       resp_tx
//! ```
//!
//! The responder reports `poll_rx` and `resp_tx` inside the response frame,
//! so the initiator can subtract its own processing-free round trip from the
//! responder's turnaround and halve the remainder. Because the two radios run
//! on independent crystals, the responder interval is first scaled by the
//! measured clock-offset ratio.
//!
//! All timestamps are device time units truncated to 32 bits, exactly as
//! they travel on the wire. Differences are taken with wrapping unsigned
//! subtraction and then reinterpreted as signed; this is what makes the math
//! immune to counter wraparound between poll and response.

/// One device time unit in seconds (1 / (128 * 499.2 MHz), ~15.65 ps).
pub const DEVICE_TIME_UNIT_S: f64 = 1.0 / (128.0 * 499.2e6);

/// Speed of light in air, meters per second.
pub const SPEED_OF_LIGHT_M_S: f64 = 299_702_547.0;

/// Device time units per UWB microsecond (512 / 499.2 MHz).
pub const UUS_TO_DEVICE_TIME: u64 = 63_898;

/// Convert a delay in UWB microseconds to device time units.
pub fn uus_to_device_time(uus: u32) -> u64 {
    uus as u64 * UUS_TO_DEVICE_TIME
}

/// The four timestamps of one completed SS-TWR exchange.
///
/// `poll_tx` and `resp_rx` are measured locally by the initiator; `poll_rx`
/// and `resp_tx` are the responder's measurements as embedded in the
/// response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwrTimestamps {
    /// Local poll transmission timestamp
    pub poll_tx: u32,
    /// Local response reception timestamp
    pub resp_rx: u32,
    /// Remote poll reception timestamp
    pub poll_rx: u32,
    /// Remote response transmission timestamp
    pub resp_tx: u32,
}

impl TwrTimestamps {
    /// Local round-trip interval in device time units (signed).
    pub fn rtd_init(&self) -> i32 {
        self.resp_rx.wrapping_sub(self.poll_tx) as i32
    }

    /// Remote turnaround interval in device time units (signed).
    pub fn rtd_resp(&self) -> i32 {
        self.resp_tx.wrapping_sub(self.poll_rx) as i32
    }
}

/// Estimated one-way time of flight in seconds.
///
/// `clock_offset_ratio` is the remote clock rate relative to the local one,
/// as derived from the carrier-frequency-offset register of the receiver.
/// A ratio of zero means both crystals run at the same speed.
///
/// This is pure arithmetic: corrupted timestamps produce a nonsense result
/// rather than an error, and filtering such results is left to the caller.
pub fn time_of_flight_s(ts: &TwrTimestamps, clock_offset_ratio: f32) -> f64 {
    let rtd_init = ts.rtd_init() as f64;
    let rtd_resp = ts.rtd_resp() as f64;
    ((rtd_init - rtd_resp * (1.0 - clock_offset_ratio as f64)) / 2.0) * DEVICE_TIME_UNIT_S
}

/// Estimated inter-node distance in meters.
pub fn distance_m(ts: &TwrTimestamps, clock_offset_ratio: f32) -> f64 {
    time_of_flight_s(ts, clock_offset_ratio) * SPEED_OF_LIGHT_M_S
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_offset_matches_hand_computation() {
        // Round trip of 2000 ticks with a 1200-tick turnaround: tof = 400 ticks.
        let ts = TwrTimestamps {
            poll_tx: 10_000,
            resp_rx: 12_000,
            poll_rx: 50_000,
            resp_tx: 51_200,
        };
        let expected = ((2000.0 - 1200.0) / 2.0) * DEVICE_TIME_UNIT_S * SPEED_OF_LIGHT_M_S;
        let got = distance_m(&ts, 0.0);
        assert!((got - expected).abs() < 1e-9, "got {got}, expected {expected}");
    }

    #[test]
    fn nonzero_offset_scales_remote_interval() {
        let ts = TwrTimestamps {
            poll_tx: 0,
            resp_rx: 2000,
            poll_rx: 0,
            resp_tx: 1200,
        };
        let ratio = 1e-5f32;
        let expected_tof =
            ((2000.0 - 1200.0 * (1.0 - ratio as f64)) / 2.0) * DEVICE_TIME_UNIT_S;
        let got = time_of_flight_s(&ts, ratio);
        assert!((got - expected_tof).abs() < 1e-18);
        // The correction must make the apparent flight time longer here:
        // a faster remote clock over-reports its turnaround.
        assert!(got > time_of_flight_s(&ts, 0.0));
    }

    #[test]
    fn wraparound_between_poll_and_response() {
        // Counter wraps between poll TX and response RX; the signed
        // reinterpretation still yields the true 2000-tick interval.
        let ts = TwrTimestamps {
            poll_tx: u32::MAX - 999,
            resp_rx: 1000,
            poll_rx: 100,
            resp_tx: 1300,
        };
        assert_eq!(ts.rtd_init(), 2000);
        assert_eq!(ts.rtd_resp(), 1200);
    }

    #[test]
    fn known_distance_round_trip() {
        // 10 m of flight is ~2132 device ticks each way.
        let tof_ticks = (10.0 / SPEED_OF_LIGHT_M_S / DEVICE_TIME_UNIT_S).round() as u32;
        let turnaround = uus_to_device_time(240) as u32;
        let ts = TwrTimestamps {
            poll_tx: 5000,
            resp_rx: 5000 + 2 * tof_ticks + turnaround,
            poll_rx: 7000,
            resp_tx: 7000 + turnaround,
        };
        let got = distance_m(&ts, 0.0);
        assert!((got - 10.0).abs() < 0.01, "got {got}");
    }
}
