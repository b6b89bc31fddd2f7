//! Compact uplink payload records.
//!
//! Two type-tagged records, concatenated into one application payload.
//! All multi-byte fields are big-endian.
//!
//! Environmental record (tag 0x02, 26 bytes):
//! ```text
//! tag | count | hum max,min,mean,stdev (u16, /0.0025)
//!             | pres max,min,mean (u16, *0.5) | pres stdev (u16, /0.005)
//!             | temp max,min,mean,stdev (i16, /0.005)
//! ```
//!
//! GPS record (tag 0x01):
//! ```text
//! tag | 0x00                                   (no positions)
//! tag | epoch of first position (u32) | count | (lat i32, lon i32) * count
//! ```
//! Coordinates are decimal degrees * 10^6, truncated toward zero.
//!
//! Scaled statistics use round-half-to-even and saturate at the field range.
//! Count fields are one byte: more than 255 entries is an error, never truncated.

use crate::types::{Statistics, TrackPoint};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

pub const GPS_RECORD_TAG: u8 = 0x01;
pub const ENVIRONMENTAL_RECORD_TAG: u8 = 0x02;

/// Largest value representable by a one-byte count field
pub const MAX_RECORD_ENTRIES: usize = u8::MAX as usize;

pub const ENVIRONMENTAL_RECORD_LEN: usize = 2 + 12 * 2;

/// Tag, first epoch and count
pub const GPS_RECORD_PREFIX_LEN: usize = 1 + 4 + 1;
pub const GPS_POSITION_LEN: usize = 8;

/// Most positions an uplink payload of at most `payload_budget` bytes can
/// carry next to the environmental record.
pub fn max_positions_for(payload_budget: usize) -> usize {
    let room = payload_budget.saturating_sub(ENVIRONMENTAL_RECORD_LEN + GPS_RECORD_PREFIX_LEN);
    (room / GPS_POSITION_LEN).min(MAX_RECORD_ENTRIES)
}

const HUMIDITY_RESOLUTION: f64 = 0.0025;
const PRESSURE_FACTOR: f64 = 0.5;
const STDEV_RESOLUTION: f64 = 0.005;
const TEMPERATURE_RESOLUTION: f64 = 0.005;
const COORDINATE_FACTOR: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{field} count {count} exceeds the one-byte limit of {MAX_RECORD_ENTRIES}")]
    CountOverflow { field: &'static str, count: usize },
    #[error("payload truncated inside record 0x{tag:02X}")]
    Truncated { tag: u8 },
    #[error("unknown record tag 0x{0:02X}")]
    UnknownRecord(u8),
}

/// Statistics for one reporting window of sensor broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentalReport {
    pub sample_count: usize,
    pub temperature: Statistics,
    pub humidity: Statistics,
    pub pressure: Statistics,
}

/// Representative positions for one reporting window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GpsReport {
    /// Epoch seconds of the first position; `None` when no positions were sent
    pub first_epoch: Option<u32>,
    /// (latitude, longitude) in decimal degrees
    pub positions: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Gps(GpsReport),
    Environmental(EnvironmentalReport),
}

fn scale_u16(value: f64) -> u16 {
    value.round_ties_even().clamp(0.0, u16::MAX as f64) as u16
}

fn scale_i16(value: f64) -> i16 {
    value.round_ties_even().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn scale_coordinate(degrees: f64) -> i32 {
    (degrees * COORDINATE_FACTOR).trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn check_count(field: &'static str, count: usize) -> Result<u8, PayloadError> {
    u8::try_from(count).map_err(|_| PayloadError::CountOverflow { field, count })
}

pub fn encode_environmental_record(report: &EnvironmentalReport) -> Result<Vec<u8>, PayloadError> {
    let count = check_count("sample", report.sample_count)?;

    let mut buf = Vec::with_capacity(ENVIRONMENTAL_RECORD_LEN);
    buf.push(ENVIRONMENTAL_RECORD_TAG);
    buf.push(count);

    let h = &report.humidity;
    for v in [h.max, h.min, h.mean, h.stdev] {
        buf.extend_from_slice(&scale_u16(v / HUMIDITY_RESOLUTION).to_be_bytes());
    }

    let p = &report.pressure;
    for v in [p.max, p.min, p.mean] {
        buf.extend_from_slice(&scale_u16(v * PRESSURE_FACTOR).to_be_bytes());
    }
    buf.extend_from_slice(&scale_u16(p.stdev / STDEV_RESOLUTION).to_be_bytes());

    let t = &report.temperature;
    for v in [t.max, t.min, t.mean, t.stdev] {
        buf.extend_from_slice(&scale_i16(v / TEMPERATURE_RESOLUTION).to_be_bytes());
    }

    Ok(buf)
}

pub fn encode_gps_record(positions: &[TrackPoint]) -> Result<Vec<u8>, PayloadError> {
    let first = match positions.first() {
        Some(p) => p,
        None => return Ok(vec![GPS_RECORD_TAG, 0x00]),
    };
    let count = check_count("position", positions.len())?;

    let mut buf = Vec::with_capacity(GPS_RECORD_PREFIX_LEN + positions.len() * GPS_POSITION_LEN);
    buf.push(GPS_RECORD_TAG);
    buf.extend_from_slice(&first.epoch_time.to_be_bytes());
    buf.push(count);
    for p in positions {
        buf.extend_from_slice(&scale_coordinate(p.latitude).to_be_bytes());
        buf.extend_from_slice(&scale_coordinate(p.longitude).to_be_bytes());
    }
    Ok(buf)
}

/// Environmental record followed by the GPS record.
pub fn encode_uplink_payload(report: &EnvironmentalReport, positions: &[TrackPoint]) -> Result<Vec<u8>, PayloadError> {
    let mut payload = encode_environmental_record(report)?;
    payload.extend(encode_gps_record(positions)?);
    Ok(payload)
}

fn read_stats<F>(cur: &mut Cursor<&[u8]>, tag: u8, mut next: F) -> Result<Statistics, PayloadError>
where
    F: FnMut(&mut Cursor<&[u8]>, usize) -> std::io::Result<f64>,
{
    let mut vals = [0.0; 4];
    for (i, v) in vals.iter_mut().enumerate() {
        *v = next(cur, i).map_err(|_| PayloadError::Truncated { tag })?;
    }
    Ok(Statistics { max: vals[0], min: vals[1], mean: vals[2], stdev: vals[3] })
}

fn decode_environmental(cur: &mut Cursor<&[u8]>) -> Result<EnvironmentalReport, PayloadError> {
    let tag = ENVIRONMENTAL_RECORD_TAG;
    let sample_count = cur.read_u8().map_err(|_| PayloadError::Truncated { tag })? as usize;

    let humidity = read_stats(cur, tag, |c, _| Ok(c.read_u16::<BigEndian>()? as f64 * HUMIDITY_RESOLUTION))?;
    let pressure = read_stats(cur, tag, |c, i| {
        let raw = c.read_u16::<BigEndian>()? as f64;
        Ok(if i == 3 { raw * STDEV_RESOLUTION } else { raw / PRESSURE_FACTOR })
    })?;
    let temperature = read_stats(cur, tag, |c, _| Ok(c.read_i16::<BigEndian>()? as f64 * TEMPERATURE_RESOLUTION))?;

    Ok(EnvironmentalReport { sample_count, temperature, humidity, pressure })
}

fn decode_gps(cur: &mut Cursor<&[u8]>) -> Result<GpsReport, PayloadError> {
    let truncated = |_: std::io::Error| PayloadError::Truncated { tag: GPS_RECORD_TAG };

    // A zero byte right after the tag is the "no positions" marker
    let pos = cur.position() as usize;
    let marker = *cur.get_ref().get(pos).ok_or(PayloadError::Truncated { tag: GPS_RECORD_TAG })?;
    if marker == 0x00 {
        cur.set_position(pos as u64 + 1);
        return Ok(GpsReport::default());
    }

    let first_epoch = cur.read_u32::<BigEndian>().map_err(truncated)?;
    let count = cur.read_u8().map_err(truncated)? as usize;
    let mut positions = Vec::with_capacity(count);
    for _ in 0..count {
        let lat = cur.read_i32::<BigEndian>().map_err(truncated)?;
        let lon = cur.read_i32::<BigEndian>().map_err(truncated)?;
        positions.push((lat as f64 / COORDINATE_FACTOR, lon as f64 / COORDINATE_FACTOR));
    }
    Ok(GpsReport { first_epoch: Some(first_epoch), positions })
}

/// Parse a concatenation of records back into their reports.
pub fn decode_payload(bytes: &[u8]) -> Result<Vec<Record>, PayloadError> {
    let mut cur = Cursor::new(bytes);
    let mut records = Vec::new();
    let mut tag = [0u8; 1];

    while cur.read(&mut tag).map(|n| n == 1).unwrap_or(false) {
        match tag[0] {
            GPS_RECORD_TAG => records.push(Record::Gps(decode_gps(&mut cur)?)),
            ENVIRONMENTAL_RECORD_TAG => records.push(Record::Environmental(decode_environmental(&mut cur)?)),
            other => return Err(PayloadError::UnknownRecord(other)),
        }
    }
    Ok(records)
}
