//! Core types for glucose sensor data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use time::OffsetDateTime;

/// Sensor-firmware-reported algorithm status.
///
/// The firmware may report status codes that this library does not know
/// about; those are carried through as [`AlgorithmState::Unknown`] with the
/// raw byte preserved, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AlgorithmState {
    /// Sensor session started but the estimate is not yet trustworthy.
    WarmingUp,
    /// Glucose estimate is reliable.
    Ok,
    /// Sensor session has reached its nominal end.
    Expired,
    /// Sensor hardware or algorithm failure.
    SensorFailed,
    /// Past nominal expiry but still producing usable glucose.
    GracePeriod,
    /// Undocumented status code, raw byte preserved.
    Unknown(u8),
}

impl AlgorithmState {
    const WARMING_UP: u8 = 0x02;
    const OK: u8 = 0x06;
    const EXPIRED: u8 = 0x12;
    const SENSOR_FAILED: u8 = 0x13;
    const GRACE_PERIOD: u8 = 0x18;

    /// Decode a raw status byte. Unknown codes round-trip via
    /// [`AlgorithmState::Unknown`].
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            Self::WARMING_UP => AlgorithmState::WarmingUp,
            Self::OK => AlgorithmState::Ok,
            Self::EXPIRED => AlgorithmState::Expired,
            Self::SENSOR_FAILED => AlgorithmState::SensorFailed,
            Self::GRACE_PERIOD => AlgorithmState::GracePeriod,
            other => AlgorithmState::Unknown(other),
        }
    }

    /// The raw status byte this state was decoded from.
    #[must_use]
    pub fn raw(&self) -> u8 {
        match self {
            AlgorithmState::WarmingUp => Self::WARMING_UP,
            AlgorithmState::Ok => Self::OK,
            AlgorithmState::Expired => Self::EXPIRED,
            AlgorithmState::SensorFailed => Self::SENSOR_FAILED,
            AlgorithmState::GracePeriod => Self::GRACE_PERIOD,
            AlgorithmState::Unknown(raw) => *raw,
        }
    }

    /// Whether the glucose estimate carried alongside this state can be
    /// trusted. Grace-period sensors still report valid glucose.
    #[must_use]
    pub fn has_reliable_glucose(&self) -> bool {
        matches!(self, AlgorithmState::Ok | AlgorithmState::GracePeriod)
    }

    /// The lifecycle state this status maps to.
    ///
    /// Unknown codes map to [`SensorLifecycleState::WarmingUp`]: the
    /// estimate is not trusted, but the session is not treated as failed.
    #[must_use]
    pub fn lifecycle(&self) -> SensorLifecycleState {
        match self {
            AlgorithmState::WarmingUp | AlgorithmState::Unknown(_) => {
                SensorLifecycleState::WarmingUp
            }
            AlgorithmState::Ok => SensorLifecycleState::Ok,
            AlgorithmState::Expired => SensorLifecycleState::Expired,
            AlgorithmState::SensorFailed => SensorLifecycleState::SensorFailed,
            AlgorithmState::GracePeriod => SensorLifecycleState::GracePeriod,
        }
    }
}

impl fmt::Display for AlgorithmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmState::WarmingUp => write!(f, "warming up"),
            AlgorithmState::Ok => write!(f, "ok"),
            AlgorithmState::Expired => write!(f, "expired"),
            AlgorithmState::SensorFailed => write!(f, "sensor failed"),
            AlgorithmState::GracePeriod => write!(f, "grace period"),
            AlgorithmState::Unknown(raw) => write!(f, "unknown (0x{:02X})", raw),
        }
    }
}

/// High-level sensor lifecycle, derived from the latest decoded message.
///
/// [`SensorLifecycleState::Searching`] is the only state not derived from an
/// algorithm status byte; it applies while no sensor message has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SensorLifecycleState {
    /// No sensor identified yet.
    Searching,
    /// Sensor warming up, readings not yet reliable.
    WarmingUp,
    /// Sensor delivering reliable readings.
    Ok,
    /// Sensor reported a failure.
    SensorFailed,
    /// Sensor past nominal expiry, still usable.
    GracePeriod,
    /// Sensor session over.
    Expired,
}

impl fmt::Display for SensorLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorLifecycleState::Searching => write!(f, "searching"),
            SensorLifecycleState::WarmingUp => write!(f, "warming up"),
            SensorLifecycleState::Ok => write!(f, "ok"),
            SensorLifecycleState::SensorFailed => write!(f, "sensor failed"),
            SensorLifecycleState::GracePeriod => write!(f, "grace period"),
            SensorLifecycleState::Expired => write!(f, "expired"),
        }
    }
}

/// Rate at which a trend is considered a double (steep) movement, in
/// mg/dL per minute.
const TREND_DOUBLE: f32 = 3.0;
/// Rate for a single (moderate) movement.
const TREND_SINGLE: f32 = 2.0;
/// Rate for a forty-five degree (slow) movement.
const TREND_FORTY_FIVE: f32 = 1.0;

/// Direction bucket for a glucose trend rate.
///
/// Ordered from steepest rise to steepest fall; `Flat` covers the half-open
/// interval `[-1.0, 1.0)` mg/dL per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TrendDirection {
    /// Rising at 3.0 mg/dL/min or faster.
    DoubleUp,
    /// Rising at 2.0 to 3.0 mg/dL/min.
    SingleUp,
    /// Rising at 1.0 to 2.0 mg/dL/min.
    FortyFiveUp,
    /// Holding steady.
    Flat,
    /// Falling at 1.0 to 2.0 mg/dL/min.
    FortyFiveDown,
    /// Falling at 2.0 to 3.0 mg/dL/min.
    SingleDown,
    /// Falling at 3.0 mg/dL/min or faster.
    DoubleDown,
    /// The sensor did not report a trend.
    NotComputable,
}

impl TrendDirection {
    /// Bucket a trend rate (mg/dL per minute) into a direction.
    #[must_use]
    pub fn from_rate(rate: Option<f32>) -> Self {
        let Some(rate) = rate else {
            return TrendDirection::NotComputable;
        };
        if rate >= TREND_DOUBLE {
            TrendDirection::DoubleUp
        } else if rate >= TREND_SINGLE {
            TrendDirection::SingleUp
        } else if rate >= TREND_FORTY_FIVE {
            TrendDirection::FortyFiveUp
        } else if rate >= -TREND_FORTY_FIVE {
            TrendDirection::Flat
        } else if rate > -TREND_SINGLE {
            TrendDirection::FortyFiveDown
        } else if rate > -TREND_DOUBLE {
            TrendDirection::SingleDown
        } else {
            TrendDirection::DoubleDown
        }
    }

    /// Arrow glyph for display surfaces.
    #[must_use]
    pub fn arrow(&self) -> &'static str {
        match self {
            TrendDirection::DoubleUp => "⇈",
            TrendDirection::SingleUp => "↑",
            TrendDirection::FortyFiveUp => "↗",
            TrendDirection::Flat => "→",
            TrendDirection::FortyFiveDown => "↘",
            TrendDirection::SingleDown => "↓",
            TrendDirection::DoubleDown => "⇊",
            TrendDirection::NotComputable => "?",
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::DoubleUp => write!(f, "double up"),
            TrendDirection::SingleUp => write!(f, "single up"),
            TrendDirection::FortyFiveUp => write!(f, "forty-five up"),
            TrendDirection::Flat => write!(f, "flat"),
            TrendDirection::FortyFiveDown => write!(f, "forty-five down"),
            TrendDirection::SingleDown => write!(f, "single down"),
            TrendDirection::DoubleDown => write!(f, "double down"),
            TrendDirection::NotComputable => write!(f, "not computable"),
        }
    }
}

/// A glucose reading with an absolute timestamp.
///
/// Readings are derived from decoded sensor messages only when the message's
/// algorithm state reports reliable glucose; see
/// [`GlucoseMessage::to_reading`](crate::codec::GlucoseMessage::to_reading).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlucoseReading {
    /// Glucose concentration in mg/dL.
    pub value: u16,
    /// Trend rate in mg/dL per minute, if the sensor reported one.
    pub trend: Option<f32>,
    /// Direction bucket for the trend rate.
    pub direction: TrendDirection,
    /// Wall-clock instant the measurement was taken.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Whether the sensor flagged this value as display-only (not suitable
    /// for treatment decisions).
    pub is_display_only: bool,
}

impl fmt::Display for GlucoseReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mg/dL {}", self.value, self.direction.arrow())
    }
}
