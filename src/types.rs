use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One parsed ambient-sensor broadcast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity (%)
    pub humidity: f64,
    /// hPa
    pub pressure: f64,
    pub capture_time: Instant,
}

impl SensorSample {
    pub fn new(temperature: f64, humidity: f64, pressure: f64) -> Self {
        SensorSample {
            temperature,
            humidity,
            pressure,
            capture_time: Instant::now(),
        }
    }
}

/// A resolved GPS position with quality indicators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub epoch_time: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub satellites_in_use: u8,
    pub hdop: f64,
}

impl GpsFix {
    /// Substitute logged when the retry budget runs out: no satellites,
    /// worst-case HDOP, null island.
    pub fn fallback() -> Self {
        GpsFix {
            epoch_time: 0,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            satellites_in_use: 0,
            hdop: 99.99,
        }
    }

    pub fn track_point(&self) -> TrackPoint {
        TrackPoint {
            epoch_time: self.epoch_time,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Output of the GPS collaborator: either a full fix or an explicit "no fix".
/// A partially populated record is never produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpsReading {
    Valid(GpsFix),
    NoFix,
}

impl GpsReading {
    pub fn fix(self) -> Option<GpsFix> {
        match self {
            GpsReading::Valid(fix) => Some(fix),
            GpsReading::NoFix => None,
        }
    }
}

/// Timestamped position stored in the rolling track windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub epoch_time: u32,
    pub latitude: f64,
    pub longitude: f64,
}

/// Summary of a numeric sample buffer. Population standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub stdev: f64,
}
