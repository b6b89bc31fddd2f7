//! Great-circle distance and hemisphere-suffixed coordinate strings.

use anyhow::{Result, anyhow};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two (lat, lon) pairs given in degrees.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (lat1.to_radians(), lon1.to_radians(), lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

fn parse_hemisphere(value: &str, negative: char, positive: char) -> Result<f64> {
    let (coord, hemi) = value
        .split_once('°')
        .ok_or_else(|| anyhow!("Missing degree sign in coordinate '{}'", value))?;
    let magnitude: f64 = coord.trim().parse()
        .map_err(|e| anyhow!("Bad coordinate '{}': {}", value, e))?;
    let hemi = hemi.trim().to_ascii_uppercase();
    match hemi.chars().next() {
        Some(c) if c == negative => Ok(-magnitude),
        Some(c) if c == positive => Ok(magnitude),
        _ => Err(anyhow!("Unknown hemisphere in coordinate '{}'", value)),
    }
}

/// `"40.446° N"` -> `40.446`, `"33.1° S"` -> `-33.1`
pub fn parse_latitude(value: &str) -> Result<f64> {
    parse_hemisphere(value, 'S', 'N')
}

/// `"3.462° W"` -> `-3.462`
pub fn parse_longitude(value: &str) -> Result<f64> {
    parse_hemisphere(value, 'W', 'E')
}

pub fn format_latitude(lat: f64) -> String {
    format!("{:.4}° {}", lat.abs(), if lat < 0.0 { 'S' } else { 'N' })
}

pub fn format_longitude(lon: f64) -> String {
    format!("{:.4}° {}", lon.abs(), if lon < 0.0 { 'W' } else { 'E' })
}
