//! Speed-Adaptive GPS Outlier Filter
//!
//! GPS receivers occasionally report positions that jump hundreds of meters
//! away from the true track (multipath, cold starts, low satellite count).
//! These jumps show up as unusually long hops between consecutive fixes.
//!
//! ## Algorithm
//! 1. Compute haversine distances between adjacent fixes
//! 2. Take a percentile of those distances (linear interpolation between ranks)
//! 3. Keep the first fix, then keep each fix whose hop from its *original*
//!    predecessor is within the percentile
//!
//! The percentile itself depends on how fast the node is moving, estimated
//! from the rolling track window:
//! - pedestrian (< 1.4 m/s): 85th, strict
//! - vehicle (< 27 m/s): 95th
//! - high speed: 99th, lenient

use crate::geo::haversine;
use crate::types::TrackPoint;
use log::{debug, info};

/// Mean speed below which the node is treated as walking (m/s)
pub const PEDESTRIAN_SPEED_MPS: f64 = 1.4;
/// Mean speed below which the node is treated as a road vehicle (m/s)
pub const VEHICLE_SPEED_MPS: f64 = 27.0;

pub const PERCENTILE_PEDESTRIAN: u8 = 85;
pub const PERCENTILE_VEHICLE: u8 = 95;
pub const PERCENTILE_HIGH_SPEED: u8 = 99;
/// Used when the window holds fewer than two points
pub const PERCENTILE_DEFAULT: u8 = PERCENTILE_VEHICLE;

/// Default rolling track span (seconds)
pub const DEFAULT_TRACK_SPAN_SECS: u32 = 180;

/// Percentile of `data` with linear interpolation between order statistics.
/// Returns `None` for empty input.
pub fn percentile(data: &[f64], pct: f64) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);

    let k = (sorted.len() - 1) as f64 * (pct / 100.0);
    let f = k.floor();
    let c = k.ceil();
    let (fi, ci) = (f as usize, c as usize);
    if fi == ci {
        return Some(sorted[fi]);
    }
    Some(sorted[fi] + (sorted[ci] - sorted[fi]) * (k - f))
}

fn hop_distances(points: &[TrackPoint]) -> Vec<f64> {
    points
        .windows(2)
        .map(|w| haversine(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude))
        .collect()
}

/// Mean ground speed over adjacent pairs. Pairs with a non-positive time
/// step are left out of the sample.
pub fn mean_speed(points: &[TrackPoint]) -> f64 {
    let speeds: Vec<f64> = points
        .windows(2)
        .filter_map(|w| {
            let dt = w[1].epoch_time as f64 - w[0].epoch_time as f64;
            if dt > 0.0 {
                Some(haversine(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude) / dt)
            } else {
                None
            }
        })
        .collect();

    if speeds.is_empty() {
        0.0
    } else {
        speeds.iter().sum::<f64>() / speeds.len() as f64
    }
}

/// Pick the outlier percentile from the mean speed over `points`.
pub fn select_threshold_percentile(points: &[TrackPoint]) -> u8 {
    if points.len() < 2 {
        debug!("[Filter] Not enough points to estimate speed, using default percentile");
        return PERCENTILE_DEFAULT;
    }

    let speed = mean_speed(points);
    let pct = if speed < PEDESTRIAN_SPEED_MPS {
        PERCENTILE_PEDESTRIAN
    } else if speed < VEHICLE_SPEED_MPS {
        PERCENTILE_VEHICLE
    } else {
        PERCENTILE_HIGH_SPEED
    };
    debug!("[Filter] Mean speed {:.2} m/s -> p{}", speed, pct);
    pct
}

/// Drop fixes whose hop from the original predecessor exceeds the given
/// percentile of all hops. The first fix always survives.
pub fn filter_outliers_by_distance(points: &[TrackPoint], pct: u8) -> Vec<TrackPoint> {
    if points.len() < 2 {
        return points.to_vec();
    }

    let distances = hop_distances(points);
    let threshold = match percentile(&distances, pct as f64) {
        Some(t) => t,
        None => return points.to_vec(),
    };

    let mut filtered = Vec::with_capacity(points.len());
    filtered.push(points[0]);
    for (point, distance) in points[1..].iter().zip(&distances) {
        if *distance <= threshold {
            filtered.push(*point);
        } else {
            debug!(
                "[Filter] Rejected fix t={} hop={:.1}m threshold={:.1}m",
                point.epoch_time, distance, threshold
            );
        }
    }
    filtered
}

/// Rolling chronological window of accepted track points.
#[derive(Debug, Clone)]
pub struct TrackWindow {
    points: Vec<TrackPoint>,
    span_secs: u32,
}

impl Default for TrackWindow {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_SPAN_SECS)
    }
}

impl TrackWindow {
    pub fn new(span_secs: u32) -> Self {
        TrackWindow {
            points: Vec::new(),
            span_secs,
        }
    }

    pub fn extend(&mut self, points: &[TrackPoint]) {
        self.points.extend_from_slice(points);
    }

    /// Drop entries older than `now_epoch - span`.
    pub fn evict(&mut self, now_epoch: f64) {
        let cutoff = now_epoch - self.span_secs as f64;
        self.points.retain(|p| p.epoch_time as f64 >= cutoff);
    }

    pub fn threshold_percentile(&self) -> u8 {
        select_threshold_percentile(&self.points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }
}

/// Two-level GPS aggregation: raw fixes collected since the last filter
/// cycle, the rolling window of accepted points, and the representative
/// positions awaiting uplink.
#[derive(Debug, Clone, Default)]
pub struct TrackAggregator {
    recent: Vec<TrackPoint>,
    window: TrackWindow,
    representatives: Vec<TrackPoint>,
}

impl TrackAggregator {
    pub fn new(span_secs: u32) -> Self {
        TrackAggregator {
            recent: Vec::new(),
            window: TrackWindow::new(span_secs),
            representatives: Vec::new(),
        }
    }

    pub fn record(&mut self, point: TrackPoint) {
        self.recent.push(point);
    }

    /// Run one filter cycle over the fixes recorded since the previous one.
    ///
    /// Eviction of the rolling window is skipped while `now_epoch` is unknown.
    /// Returns the representative position chosen for this interval, if any.
    pub fn run_cycle(&mut self, now_epoch: Option<f64>) -> Option<TrackPoint> {
        let pct = self.window.threshold_percentile();

        let filtered = if self.recent.is_empty() {
            debug!("[Filter] No fixes since last cycle");
            Vec::new()
        } else {
            filter_outliers_by_distance(&self.recent, pct)
        };

        let representative = filtered.last().copied();
        if let Some(rep) = representative {
            self.window.extend(&filtered);
            self.representatives.push(rep);
            info!(
                "[Filter] p{} kept {}/{} fixes, representative t={}",
                pct, filtered.len(), self.recent.len(), rep.epoch_time
            );
        }

        if let Some(now) = now_epoch {
            self.window.evict(now);
        }

        self.recent.clear();
        representative
    }

    pub fn pending_fixes(&self) -> usize {
        self.recent.len()
    }

    pub fn window(&self) -> &TrackWindow {
        &self.window
    }

    pub fn representatives(&self) -> &[TrackPoint] {
        &self.representatives
    }

    /// Hand the representative positions to the caller and start a new report.
    pub fn take_representatives(&mut self) -> Vec<TrackPoint> {
        std::mem::take(&mut self.representatives)
    }
}
