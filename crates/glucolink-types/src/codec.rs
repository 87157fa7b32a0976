//! Decoders for the sensor's proprietary binary frames.
//!
//! All decoders are total: malformed or short input yields `None`, never a
//! panic. Partial frames are routine over BLE and are dropped by callers
//! with a diagnostic log rather than treated as errors.
//!
//! Frames are little-endian with fixed field offsets. Glucose values use a
//! 12-bit mask over a 16-bit field; the all-ones sentinel `0xFFFF` means
//! "no value". Trend is a signed byte in tenths of mg/dL per minute with
//! `0x7F` meaning "trend unavailable".

use time::{Duration, OffsetDateTime};

use crate::types::{AlgorithmState, GlucoseReading, TrendDirection};

/// Control-channel opcodes, carried in the first byte of each frame.
pub mod opcode {
    /// Authentication challenge response.
    pub const AUTH_RESPONSE: u8 = 0x05;
    /// Live glucose message.
    pub const GLUCOSE: u8 = 0x4E;
    /// End-of-backfill signal.
    pub const BACKFILL_FINISHED: u8 = 0x59;
}

/// Minimum length of a live glucose message.
pub const GLUCOSE_MESSAGE_MIN_LEN: usize = 19;
/// Exact length of a backfill record frame.
pub const BACKFILL_MESSAGE_LEN: usize = 9;
/// Minimum length of an authentication challenge response.
pub const AUTH_RESPONSE_MIN_LEN: usize = 3;

/// Value bits of the 16-bit glucose field.
const GLUCOSE_VALUE_MASK: u16 = 0x0FFF;
/// All-ones sentinel meaning "no glucose value".
const GLUCOSE_SENTINEL: u16 = 0xFFFF;
/// Trend byte sentinel meaning "trend unavailable".
const TREND_SENTINEL: u8 = 0x7F;
/// Display-only flag bit in the trailing status byte of a live message.
const DISPLAY_ONLY_BIT: u8 = 0x10;
/// Display-only flag nibble in a backfill glucose field.
const BACKFILL_DISPLAY_ONLY_MASK: u16 = 0xF000;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decode a trend byte: signed tenths of mg/dL per minute, `0x7F` = none.
fn decode_trend(raw: u8) -> Option<f32> {
    if raw == TREND_SENTINEL {
        None
    } else {
        Some(f32::from(raw as i8) / 10.0)
    }
}

/// A decoded live glucose message from the control channel.
///
/// Timestamps are relative to the sensor's activation instant; resolve them
/// with [`GlucoseMessage::to_reading`] once an activation date is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseMessage {
    /// Seconds since sensor activation.
    pub timestamp: u32,
    /// Monotonic message sequence number.
    pub sequence: u16,
    /// Seconds elapsed since the measurement was taken.
    pub age: u16,
    /// Glucose in mg/dL, absent when the sensor sent the sentinel.
    pub glucose: Option<u16>,
    /// Whether the value is flagged display-only.
    pub is_display_only: bool,
    /// Firmware algorithm status.
    pub algorithm_state: AlgorithmState,
    /// Trend rate in mg/dL per minute.
    pub trend: Option<f32>,
    /// Predicted glucose in mg/dL, if the firmware computed one.
    pub predicted: Option<u16>,
}

impl GlucoseMessage {
    /// Decode a live glucose frame.
    ///
    /// Requires at least [`GLUCOSE_MESSAGE_MIN_LEN`] bytes, the glucose
    /// opcode at offset 0 and a fixed zero at offset 1. Returns `None` on
    /// any mismatch.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < GLUCOSE_MESSAGE_MIN_LEN {
            return None;
        }
        if data[0] != opcode::GLUCOSE || data[1] != 0x00 {
            return None;
        }

        let raw_glucose = u16_at(data, 12);
        let (glucose, is_display_only) = if raw_glucose == GLUCOSE_SENTINEL {
            (None, false)
        } else {
            (
                Some(raw_glucose & GLUCOSE_VALUE_MASK),
                data[18] & DISPLAY_ONLY_BIT != 0,
            )
        };

        let raw_predicted = u16_at(data, 16);
        let predicted =
            (raw_predicted != GLUCOSE_SENTINEL).then_some(raw_predicted & GLUCOSE_VALUE_MASK);

        Some(Self {
            timestamp: u32_at(data, 2),
            sequence: u16_at(data, 6),
            age: u16_at(data, 10),
            glucose,
            is_display_only,
            algorithm_state: AlgorithmState::from_raw(data[14]),
            trend: decode_trend(data[15]),
            predicted,
        })
    }

    /// Derive a reading with an absolute timestamp.
    ///
    /// Returns `None` unless the algorithm state reports reliable glucose
    /// and a value is present.
    #[must_use]
    pub fn to_reading(&self, activation: OffsetDateTime) -> Option<GlucoseReading> {
        reading_from_parts(
            self.glucose,
            self.algorithm_state,
            self.trend,
            self.is_display_only,
            self.timestamp,
            activation,
        )
    }
}

/// A decoded historical (backfill) record.
///
/// Unlike live messages, the timestamp is the record's own offset from
/// activation, not age-adjusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackfillMessage {
    /// Seconds since sensor activation.
    pub timestamp: u32,
    /// Glucose in mg/dL, absent when the sensor sent the sentinel.
    pub glucose: Option<u16>,
    /// Whether the value is flagged display-only.
    pub is_display_only: bool,
    /// Firmware algorithm status at record time.
    pub algorithm_state: AlgorithmState,
    /// Trend rate in mg/dL per minute.
    pub trend: Option<f32>,
}

impl BackfillMessage {
    /// Decode a backfill frame. The frame length is exact; anything else
    /// returns `None`.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != BACKFILL_MESSAGE_LEN {
            return None;
        }

        let raw_glucose = u16_at(data, 4);
        let (glucose, is_display_only) = if raw_glucose == GLUCOSE_SENTINEL {
            (None, false)
        } else {
            (
                Some(raw_glucose & GLUCOSE_VALUE_MASK),
                raw_glucose & BACKFILL_DISPLAY_ONLY_MASK != 0,
            )
        };

        Some(Self {
            timestamp: u32_at(data, 0),
            glucose,
            is_display_only,
            algorithm_state: AlgorithmState::from_raw(data[6]),
            trend: decode_trend(data[8]),
        })
    }

    /// Derive a reading with an absolute timestamp; same rules as
    /// [`GlucoseMessage::to_reading`].
    #[must_use]
    pub fn to_reading(&self, activation: OffsetDateTime) -> Option<GlucoseReading> {
        reading_from_parts(
            self.glucose,
            self.algorithm_state,
            self.trend,
            self.is_display_only,
            self.timestamp,
            activation,
        )
    }
}

/// A decoded authentication challenge response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    /// Whether the sensor accepted the link as authenticated.
    pub authenticated: bool,
    /// Whether the underlying transport is bonded.
    pub bonded: bool,
}

impl AuthResponse {
    /// Decode an auth-challenge response; requires the auth opcode at
    /// offset 0 and two boolean bytes.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < AUTH_RESPONSE_MIN_LEN || data[0] != opcode::AUTH_RESPONSE {
            return None;
        }
        Some(Self {
            authenticated: data[1] == 1,
            bonded: data[2] == 1,
        })
    }
}

fn reading_from_parts(
    glucose: Option<u16>,
    state: AlgorithmState,
    trend: Option<f32>,
    is_display_only: bool,
    timestamp: u32,
    activation: OffsetDateTime,
) -> Option<GlucoseReading> {
    if !state.has_reliable_glucose() {
        return None;
    }
    let value = glucose?;
    Some(GlucoseReading {
        value,
        trend,
        direction: TrendDirection::from_rate(trend),
        timestamp: activation + Duration::seconds(i64::from(timestamp)),
        is_display_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glucose_frame() -> Vec<u8> {
        // opcode, zero, timestamp 2005, sequence 9, two reserved bytes,
        // age 5, glucose 0x61, state ok, trend unavailable, predicted
        // sentinel, trailing status byte without the display-only bit.
        vec![
            0x4E, 0x00, 0xD5, 0x07, 0x00, 0x00, 0x09, 0x00, 0x00, 0x01, 0x05, 0x00, 0x61, 0x00,
            0x06, 0x7F, 0xFF, 0xFF, 0x0E,
        ]
    }

    #[test]
    fn test_decode_glucose_message() {
        let msg = GlucoseMessage::decode(&glucose_frame()).unwrap();
        assert_eq!(msg.timestamp, 2005);
        assert_eq!(msg.sequence, 9);
        assert_eq!(msg.age, 5);
        assert_eq!(msg.glucose, Some(0x061));
        assert!(!msg.is_display_only);
        assert_eq!(msg.algorithm_state, AlgorithmState::Ok);
        assert_eq!(msg.trend, None);
        assert_eq!(msg.predicted, None);
    }

    #[test]
    fn test_glucose_message_yields_reading_when_reliable() {
        let msg = GlucoseMessage::decode(&glucose_frame()).unwrap();
        let activation = OffsetDateTime::UNIX_EPOCH;
        let reading = msg.to_reading(activation).unwrap();
        assert_eq!(reading.value, 97);
        assert_eq!(reading.direction, TrendDirection::NotComputable);
        assert_eq!(
            reading.timestamp,
            activation + Duration::seconds(2005)
        );
    }

    #[test]
    fn test_glucose_message_trend_and_display_flag() {
        let mut frame = glucose_frame();
        frame[15] = 0x01; // 0.1 mg/dL/min
        frame[18] = 0x1E; // display-only bit set
        let msg = GlucoseMessage::decode(&frame).unwrap();
        assert_eq!(msg.trend, Some(0.1));
        assert!(msg.is_display_only);
    }

    #[test]
    fn test_glucose_message_value_is_masked() {
        let mut frame = glucose_frame();
        // High nibble flags set but not the sentinel pattern.
        frame[12] = 0x61;
        frame[13] = 0x30;
        let msg = GlucoseMessage::decode(&frame).unwrap();
        assert_eq!(msg.glucose, Some(0x061));
    }

    #[test]
    fn test_glucose_sentinel_means_no_value() {
        let mut frame = glucose_frame();
        frame[12] = 0xFF;
        frame[13] = 0xFF;
        frame[18] = 0x1E; // flag byte must be ignored under the sentinel
        let msg = GlucoseMessage::decode(&frame).unwrap();
        assert_eq!(msg.glucose, None);
        assert!(!msg.is_display_only);
        assert_eq!(msg.to_reading(OffsetDateTime::UNIX_EPOCH), None);
    }

    #[test]
    fn test_glucose_message_rejects_wrong_marker() {
        let mut frame = glucose_frame();
        frame[1] = 0x01;
        assert_eq!(GlucoseMessage::decode(&frame), None);

        let mut frame = glucose_frame();
        frame[0] = 0x4F;
        assert_eq!(GlucoseMessage::decode(&frame), None);
    }

    #[test]
    fn test_decoders_total_over_short_input() {
        assert_eq!(GlucoseMessage::decode(&[0x4E, 0x00]), None);
        assert_eq!(GlucoseMessage::decode(&[]), None);
        assert_eq!(BackfillMessage::decode(&[0u8; 10]), None);
        assert_eq!(BackfillMessage::decode(&[0u8; 8]), None);
        assert_eq!(AuthResponse::decode(&[0x05]), None);
        assert_eq!(AuthResponse::decode(&[]), None);
    }

    #[test]
    fn test_decode_backfill_message() {
        // timestamp 300, glucose 120, state ok, trend -0.2
        let frame = [0x2C, 0x01, 0x00, 0x00, 0x78, 0x00, 0x06, 0x00, 0xFE];
        let msg = BackfillMessage::decode(&frame).unwrap();
        assert_eq!(msg.timestamp, 300);
        assert_eq!(msg.glucose, Some(120));
        assert!(!msg.is_display_only);
        assert_eq!(msg.algorithm_state, AlgorithmState::Ok);
        assert_eq!(msg.trend, Some(-0.2));

        let reading = msg.to_reading(OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(reading.direction, TrendDirection::Flat);
    }

    #[test]
    fn test_backfill_sentinel_and_flags() {
        let sentinel = [0x2C, 0x01, 0x00, 0x00, 0xFF, 0xFF, 0x06, 0x00, 0x00];
        let msg = BackfillMessage::decode(&sentinel).unwrap();
        assert_eq!(msg.glucose, None);
        assert!(!msg.is_display_only);
        assert_eq!(msg.to_reading(OffsetDateTime::UNIX_EPOCH), None);

        // Display-only nibble set alongside a real value.
        let flagged = [0x2C, 0x01, 0x00, 0x00, 0x78, 0x10, 0x06, 0x00, 0x00];
        let msg = BackfillMessage::decode(&flagged).unwrap();
        assert_eq!(msg.glucose, Some(0x078));
        assert!(msg.is_display_only);
    }

    #[test]
    fn test_backfill_unreliable_state_yields_no_reading() {
        // Warming up: value present but not trustworthy.
        let frame = [0x2C, 0x01, 0x00, 0x00, 0x78, 0x00, 0x02, 0x00, 0x00];
        let msg = BackfillMessage::decode(&frame).unwrap();
        assert_eq!(msg.glucose, Some(120));
        assert_eq!(msg.to_reading(OffsetDateTime::UNIX_EPOCH), None);
    }

    #[test]
    fn test_trend_bucketing_from_raw_bytes() {
        // -2 tenths → -0.2 → flat
        assert_eq!(decode_trend(0xFE), Some(-0.2));
        assert_eq!(
            TrendDirection::from_rate(decode_trend(0xFE)),
            TrendDirection::Flat
        );
        // -30 tenths → -3.0 → double down
        assert_eq!(decode_trend(0xE2), Some(-3.0));
        assert_eq!(
            TrendDirection::from_rate(decode_trend(0xE2)),
            TrendDirection::DoubleDown
        );
        // sentinel → no trend → not computable
        assert_eq!(decode_trend(0x7F), None);
        assert_eq!(
            TrendDirection::from_rate(None),
            TrendDirection::NotComputable
        );
    }

    #[test]
    fn test_decode_auth_response() {
        assert_eq!(
            AuthResponse::decode(&[0x05, 0x01, 0x01]),
            Some(AuthResponse {
                authenticated: true,
                bonded: true
            })
        );
        assert_eq!(
            AuthResponse::decode(&[0x05, 0x01, 0x00, 0xAA]),
            Some(AuthResponse {
                authenticated: true,
                bonded: false
            })
        );
        // Wrong opcode is not an auth response.
        assert_eq!(AuthResponse::decode(&[0x06, 0x01, 0x01]), None);
    }
}
