//! Telemetry Controller - cooperative poll loop for the field node
//!
//! One tick runs, in order, whichever of these are due:
//! 1. **Sensor scan**: open a broadcast scan window (samples land in the queue via callback)
//! 2. **GPS sample**: poll the receiver; without a fix, poll again on each following
//!    tick until the attempt budget runs out
//! 3. **Outlier filter**: filter the last interval's fixes, pick a representative position
//! 4. **Send**: drain samples, compute statistics, encode, frame and transmit
//!
//! Every failure is logged and the loop carries on with the next tick.
//! A failed transmission is not retried; the next report carries fresh data.

use anyhow::{Result, anyhow};
use log::{debug, info, warn, error};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use crate::config::SystemConfig;
use crate::geo::{format_latitude, format_longitude};
use crate::gps_filter::TrackAggregator;
use crate::payload::{EnvironmentalReport, encode_uplink_payload};
use crate::sample_queue::SampleQueue;
use crate::stats::calculate_statistics;
use crate::status::NodeStatus;
use crate::traits::{GpsSource, KeyValueStore, Radio, SensorFeed};
use crate::types::{GpsFix, GpsReading, SensorSample};
use crate::uplink::{SendReport, UplinkSender};

pub struct TelemetryController<G, F, R, K>
where
    G: GpsSource,
    F: SensorFeed,
    R: Radio,
    K: KeyValueStore,
{
    gps: G,
    feed: F,
    uplink: UplinkSender<R, K>,
    config: SystemConfig,

    samples: SampleQueue,
    track: TrackAggregator,

    // Cadence timers
    last_scan: Instant,
    last_gps_sample: Instant,
    last_filter: Instant,
    last_send: Instant,

    // Failed polls in the current GPS sample, 0 when none is pending
    gps_attempts: u32,

    // First valid fix: (epoch seconds, local instant it was seen)
    epoch_reference: Option<(u32, Instant)>,
    last_fix: Option<GpsFix>,

    status_shared: Arc<RwLock<NodeStatus>>,
}

impl<G, F, R, K> TelemetryController<G, F, R, K>
where
    G: GpsSource,
    F: SensorFeed,
    R: Radio,
    K: KeyValueStore,
{
    pub fn new(
        gps: G,
        mut feed: F,
        uplink: UplinkSender<R, K>,
        status_shared: Arc<RwLock<NodeStatus>>,
        config: SystemConfig,
        start: Instant,
    ) -> Self {
        let samples = SampleQueue::new(config.limits.sample_queue_capacity);
        let producer = samples.clone();
        feed.on_sample(Box::new(move |sample: SensorSample| {
            producer.push(sample);
        }));

        let s = &config.schedule;
        info!("=== Telemetry Controller Initialization ===");
        info!("Scan every {}s, GPS every {}s, filter every {}s, send every {}s",
              s.sensor_scan_secs, s.gps_sample_secs, s.outlier_filter_secs, s.send_secs);
        info!("Track window {}s, sample queue capacity {}",
              s.track_window_secs, config.limits.sample_queue_capacity);
        info!("Frame counter: {}", uplink.frame_counter());
        info!("=== Ready ===");

        let track = TrackAggregator::new(s.track_window_secs);

        TelemetryController {
            gps,
            feed,
            uplink,
            config,
            samples,
            track,
            last_scan: start,
            last_gps_sample: start,
            last_filter: start,
            last_send: start,
            gps_attempts: 0,
            epoch_reference: None,
            last_fix: None,
            status_shared,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn get_status_shared(&self) -> Arc<RwLock<NodeStatus>> {
        self.status_shared.clone()
    }

    /// Producer handle for sample sources that bypass the feed callback.
    pub fn sample_queue(&self) -> SampleQueue {
        self.samples.clone()
    }

    pub fn track(&self) -> &TrackAggregator {
        &self.track
    }

    pub fn uplink(&self) -> &UplinkSender<R, K> {
        &self.uplink
    }

    /// Current epoch time derived from the first valid fix, if one has been seen.
    pub fn epoch_now(&self, now: Instant) -> Option<f64> {
        self.epoch_reference
            .map(|(epoch, seen)| epoch as f64 + now.saturating_duration_since(seen).as_secs_f64())
    }

    /// Run whatever is due at `now`.
    ///
    /// Returns Ok(Some(report)) when a frame went out, Ok(None) when nothing
    /// was sent, and Err when a send was attempted and failed.
    pub fn process_tick(&mut self, now: Instant) -> Result<Option<SendReport>> {
        let s = &self.config.schedule;
        let scan_due = elapsed(self.last_scan, now) >= Duration::from_secs(s.sensor_scan_secs);
        let gps_due = elapsed(self.last_gps_sample, now) >= Duration::from_secs(s.gps_sample_secs);
        let filter_due = elapsed(self.last_filter, now) >= Duration::from_secs(s.outlier_filter_secs);
        let send_due = elapsed(self.last_send, now) >= Duration::from_secs(s.send_secs);

        if scan_due {
            self.run_scan();
            self.last_scan = now;
        }

        if gps_due {
            self.last_gps_sample = now;
        }
        if gps_due || self.gps_attempts > 0 {
            self.sample_gps(now);
        }

        if filter_due {
            let epoch_now = self.epoch_now(now);
            if epoch_now.is_none() {
                debug!("[Filter] No GPS time reference yet, window eviction skipped");
            }
            self.track.run_cycle(epoch_now);
            self.last_filter = now;
        }

        let result = if send_due {
            self.last_send = now;
            self.send_report().map(Some)
        } else {
            Ok(None)
        };

        self.update_shared_status(now);
        result
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.feed.stop() {
            warn!("[Sensors] Failed to stop feed: {}", e);
        }
        info!("[Controller] Stopped with {} samples and {} positions unsent",
              self.samples.len(), self.track.representatives().len());
    }

    // ========================================================================
    // SAMPLING
    // ========================================================================

    fn run_scan(&mut self) {
        debug!("[Sensors] Scanning...");
        if let Err(e) = self.feed.scan() {
            warn!("[Sensors] Scan failed: {}", e);
        }
    }

    /// One poll per tick. The cadence timer is not touched here, so retries
    /// land on the ticks right after the scheduled sample.
    fn sample_gps(&mut self, now: Instant) {
        let budget = self.config.schedule.gps_max_attempts;
        self.gps_attempts += 1;
        let attempt = self.gps_attempts;

        let reading = match self.gps.read_pending() {
            Ok(()) => self.gps.current_fix(),
            Err(e) => {
                warn!("[GPS] Read failed on attempt {}/{}: {}", attempt, budget, e);
                GpsReading::NoFix
            }
        };

        match reading {
            GpsReading::Valid(fix) => {
                self.gps_attempts = 0;
                self.accept_fix(fix, now);
            }
            GpsReading::NoFix if attempt >= budget => {
                self.gps_attempts = 0;
                let fallback = GpsFix::fallback();
                warn!(
                    "[GPS] No valid fix after {} attempts, reporting defaults: {} {} sats={} hdop={:.2}",
                    budget,
                    format_latitude(fallback.latitude),
                    format_longitude(fallback.longitude),
                    fallback.satellites_in_use,
                    fallback.hdop
                );
                self.last_fix = Some(fallback);
            }
            GpsReading::NoFix => debug!("[GPS] No fix on attempt {}/{}, retrying next tick", attempt, budget),
        }
    }

    fn accept_fix(&mut self, fix: GpsFix, now: Instant) {
        info!(
            "[GPS] Fix t={} {} {} alt={:.1}m sats={} hdop={:.2}",
            fix.epoch_time,
            format_latitude(fix.latitude),
            format_longitude(fix.longitude),
            fix.altitude,
            fix.satellites_in_use,
            fix.hdop
        );
        if self.epoch_reference.is_none() {
            info!("[GPS] Time reference set to epoch {}", fix.epoch_time);
            self.epoch_reference = Some((fix.epoch_time, now));
        }
        self.track.record(fix.track_point());
        self.last_fix = Some(fix);
    }

    // ========================================================================
    // REPORTING
    // ========================================================================

    fn send_report(&mut self) -> Result<SendReport> {
        // Snapshot-and-clear: both buffers belong to this report whatever the outcome.
        let samples = self.samples.drain();
        let positions = self.track.take_representatives();

        let temperature: Vec<f64> = samples.iter().map(|s| s.temperature).collect();
        let humidity: Vec<f64> = samples.iter().map(|s| s.humidity).collect();
        let pressure: Vec<f64> = samples.iter().map(|s| s.pressure).collect();

        let report = EnvironmentalReport {
            sample_count: samples.len(),
            temperature: calculate_statistics(&temperature),
            humidity: calculate_statistics(&humidity),
            pressure: calculate_statistics(&pressure),
        };
        info!(
            "[Uplink] Report: {} samples, T {:.2}/{:.2}/{:.2}C, {} positions",
            report.sample_count, report.temperature.min, report.temperature.mean,
            report.temperature.max, positions.len()
        );

        let payload = encode_uplink_payload(&report, &positions).map_err(|e| {
            error!("[Uplink] Encoding failed, report discarded: {}", e);
            self.record_send(Err(e.to_string()), None);
            anyhow!(e)
        })?;
        debug!("[Uplink] Payload {:02X?}", payload);

        match self.uplink.send(&payload) {
            Ok(sent) => {
                info!("[Uplink] Sent fcnt={} on {} kHz", sent.frame_counter, sent.channel_khz);
                self.record_send(Ok(()), Some(sent.channel_khz));
                Ok(sent)
            }
            Err(e) => {
                error!("[Uplink] Send failed, report discarded: {}", e);
                self.record_send(Err(e.to_string()), None);
                Err(e.into())
            }
        }
    }

    fn record_send(&self, outcome: std::result::Result<(), String>, channel_khz: Option<u32>) {
        if let Ok(mut status) = self.status_shared.write() {
            status.last_send_ts = Some(unix_now());
            status.last_send_ok = Some(outcome.is_ok());
            status.last_send_error = outcome.err();
            status.last_channel_khz = channel_khz;
        }
    }

    fn update_shared_status(&self, now: Instant) {
        let send_period = Duration::from_secs(self.config.schedule.send_secs);
        let to_next = send_period.saturating_sub(elapsed(self.last_send, now));

        if let Ok(mut status) = self.status_shared.write() {
            status.frame_counter = self.uplink.frame_counter();
            status.pending_samples = self.samples.len();
            status.dropped_samples = self.samples.dropped();
            status.pending_positions = self.track.representatives().len();
            status.track_window_len = self.track.window().len();
            status.last_fix = self.last_fix;
            status.secs_to_next_send = to_next.as_secs();
            status.updated_ts = unix_now();
        }
    }
}

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::FrameCounterStore;
    use crate::lorawan::{FrameBuilder, HEADER_LEN, MIC_LEN};
    use crate::payload::{Record, decode_payload};
    use crate::traits::{MockGpsSource, MockKeyValueStore, MockRadio, MockSensorFeed, SampleHandler};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Mutex;

    type Handler = Arc<Mutex<Option<SampleHandler>>>;
    type Frames = Arc<Mutex<Vec<Vec<u8>>>>;

    fn fix(t: u32, lat: f64) -> GpsFix {
        GpsFix { epoch_time: t, latitude: lat, longitude: -3.7, altitude: 650.0, satellites_in_use: 8, hdop: 0.9 }
    }

    fn test_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.schedule.sensor_scan_secs = 30;
        config.schedule.gps_sample_secs = 20;
        config.schedule.outlier_filter_secs = 60;
        config.schedule.send_secs = 120;
        config.schedule.gps_max_attempts = 3;
        config
    }

    fn feed_capturing(handler: Handler) -> MockSensorFeed {
        let mut feed = MockSensorFeed::new();
        feed.expect_on_sample().times(1).returning(move |h| {
            *handler.lock().unwrap() = Some(h);
        });
        feed.expect_scan().returning(|| Ok(()));
        feed.expect_stop().returning(|| Ok(()));
        feed
    }

    fn radio_capturing(frames: Frames) -> MockRadio {
        let mut radio = MockRadio::new();
        radio.expect_configure().returning(|_| Ok(()));
        radio.expect_transmit().returning(move |f| {
            frames.lock().unwrap().push(f.to_vec());
            Ok(())
        });
        radio
    }

    fn memory_store() -> MockKeyValueStore {
        let mut kv = MockKeyValueStore::new();
        kv.expect_read().returning(|_| Ok(None));
        kv.expect_write().returning(|_, _| Ok(()));
        kv
    }

    fn controller(
        gps: MockGpsSource,
        feed: MockSensorFeed,
        radio: MockRadio,
        start: Instant,
    ) -> TelemetryController<MockGpsSource, MockSensorFeed, MockRadio, MockKeyValueStore> {
        let config = test_config();
        let builder = FrameBuilder::new(config.session.keys().unwrap(), config.session.fport);
        let uplink = UplinkSender::with_rng(builder, radio, FrameCounterStore::new(memory_store()), StdRng::seed_from_u64(7));
        let status = Arc::new(RwLock::new(NodeStatus::default()));
        TelemetryController::new(gps, feed, uplink, status, config, start)
    }

    fn decode_frame(bytes: &[u8], fcnt: u32) -> Vec<Record> {
        let keys = test_config().session.keys().unwrap();
        let plain = FrameBuilder::new(keys, 1).open(bytes, fcnt).unwrap();
        decode_payload(&plain).unwrap()
    }

    #[test]
    fn test_nothing_due_at_start() {
        let _ = env_logger::builder().is_test(true).try_init();
        let start = Instant::now();
        let mut feed = MockSensorFeed::new();
        feed.expect_on_sample().times(1).returning(|_| ());
        feed.expect_scan().times(0);
        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().times(0);

        let mut ctrl = controller(gps, feed, MockRadio::new(), start);

        assert!(ctrl.process_tick(start + Duration::from_secs(5)).unwrap().is_none());
        let status = ctrl.get_status_shared();
        assert_eq!(status.read().unwrap().secs_to_next_send, 115);
    }

    #[test]
    fn test_gps_retry_budget_then_defaults() {
        let start = Instant::now();
        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().times(3).returning(|| Ok(()));
        gps.expect_current_fix().times(3).returning(|| GpsReading::NoFix);

        let handler: Handler = Arc::new(Mutex::new(None));
        let mut ctrl = controller(gps, feed_capturing(handler), MockRadio::new(), start);
        let status = ctrl.get_status_shared();

        // One poll per tick: 20, 21, 22
        for sec in 20..=21 {
            ctrl.process_tick(start + Duration::from_secs(sec)).unwrap();
            assert!(status.read().unwrap().last_fix.is_none());
        }
        ctrl.process_tick(start + Duration::from_secs(22)).unwrap();
        assert_eq!(ctrl.track().pending_fixes(), 0);
        assert!(ctrl.epoch_now(start).is_none());

        let last_fix = status.read().unwrap().last_fix.unwrap();
        assert_eq!(last_fix.satellites_in_use, 0);
        assert!((last_fix.hdop - 99.99).abs() < 1e-9);

        // Budget spent: nothing more until the next sample is due
        for sec in 23..=39 {
            ctrl.process_tick(start + Duration::from_secs(sec)).unwrap();
        }
    }

    #[test]
    fn test_fix_on_tick_after_failure() {
        let start = Instant::now();
        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().times(3).returning(|| Ok(()));
        let mut polls = 0;
        gps.expect_current_fix().times(3).returning(move || {
            polls += 1;
            if polls == 1 { GpsReading::NoFix } else { GpsReading::Valid(fix(1_736_000_000 + polls, 40.4)) }
        });

        let handler: Handler = Arc::new(Mutex::new(None));
        let mut ctrl = controller(gps, feed_capturing(handler), MockRadio::new(), start);

        ctrl.process_tick(start + Duration::from_secs(20)).unwrap();
        assert_eq!(ctrl.track().pending_fixes(), 0);

        ctrl.process_tick(start + Duration::from_secs(21)).unwrap();
        assert_eq!(ctrl.track().pending_fixes(), 1);

        // Cadence stays anchored at 20 s: next poll at 40
        for sec in 22..=40 {
            ctrl.process_tick(start + Duration::from_secs(sec)).unwrap();
        }
        assert_eq!(ctrl.track().pending_fixes(), 2);
    }

    #[test]
    fn test_gps_read_error_is_retried() {
        let start = Instant::now();
        let mut gps = MockGpsSource::new();
        let mut calls = 0;
        gps.expect_read_pending().times(2).returning(move || {
            calls += 1;
            if calls == 1 { Err(anyhow!("uart overrun")) } else { Ok(()) }
        });
        gps.expect_current_fix().times(1).returning(|| GpsReading::Valid(fix(1_736_000_000, 40.4)));

        let handler: Handler = Arc::new(Mutex::new(None));
        let mut ctrl = controller(gps, feed_capturing(handler), MockRadio::new(), start);

        ctrl.process_tick(start + Duration::from_secs(20)).unwrap();
        assert_eq!(ctrl.track().pending_fixes(), 0);
        ctrl.process_tick(start + Duration::from_secs(21)).unwrap();
        assert_eq!(ctrl.track().pending_fixes(), 1);
        let epoch = ctrl.epoch_now(start + Duration::from_secs(31)).unwrap();
        assert!((epoch - 1_736_000_010.0).abs() < 1e-6);
    }

    #[test]
    fn test_full_report_cycle() {
        let _ = env_logger::builder().is_test(true).try_init();
        let start = Instant::now();

        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().returning(|| Ok(()));
        // Parked receiver: every hop is zero, so no fix is ever an outlier
        let mut t = 1_736_000_000u32;
        gps.expect_current_fix().returning(move || {
            t += 20;
            GpsReading::Valid(fix(t, 40.4))
        });

        let handler: Handler = Arc::new(Mutex::new(None));
        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let mut ctrl = controller(gps, feed_capturing(handler.clone()), radio_capturing(frames.clone()), start);

        let mut sent = Vec::new();
        for sec in 1..=120u64 {
            // Broadcasts arrive through the registered callback
            if sec == 10 || sec == 50 || sec == 90 {
                let temp = match sec { 10 => 20.0, 50 => 21.0, _ => 19.5 };
                let mut guard = handler.lock().unwrap();
                let h = guard.as_mut().unwrap();
                h(SensorSample::new(temp, 45.0, 1010.0));
            }
            if let Some(report) = ctrl.process_tick(start + Duration::from_secs(sec)).unwrap() {
                sent.push(report);
            }
        }

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_counter, 0);
        assert_eq!(ctrl.uplink().frame_counter(), 1);
        assert!(ctrl.sample_queue().is_empty());
        assert!(ctrl.track().representatives().is_empty());

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        // Environmental record (26) + GPS record with two positions (6 + 16)
        assert_eq!(frames[0].len(), HEADER_LEN + 26 + 22 + MIC_LEN);

        let records = decode_frame(&frames[0], 0);
        match &records[0] {
            Record::Environmental(env) => {
                assert_eq!(env.sample_count, 3);
                assert!((env.temperature.max - 21.0).abs() < 1e-9);
                assert!((env.temperature.min - 19.5).abs() < 1e-9);
                assert!((env.temperature.mean - 20.165).abs() < 1e-9);
                assert!((env.humidity.mean - 45.0).abs() < 1e-9);
                assert!((env.pressure.mean - 1010.0).abs() < 1e-9);
            }
            other => panic!("unexpected record {:?}", other),
        }
        match &records[1] {
            Record::Gps(gps) => {
                assert_eq!(gps.positions.len(), 2);
                // Representatives are the last fix of each minute: t0+60 and t0+120
                assert_eq!(gps.first_epoch, Some(1_736_000_060));
            }
            other => panic!("unexpected record {:?}", other),
        }

        let status = ctrl.get_status_shared();
        let status = status.read().unwrap();
        assert_eq!(status.frame_counter, 1);
        assert_eq!(status.last_send_ok, Some(true));
        assert!(status.last_channel_khz.is_some());
    }

    #[test]
    fn test_transmit_failure_is_not_fatal() {
        let start = Instant::now();
        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().returning(|| Ok(()));
        gps.expect_current_fix().returning(|| GpsReading::NoFix);

        let mut radio = MockRadio::new();
        radio.expect_configure().returning(|_| Ok(()));
        radio.expect_transmit().times(2).returning(|_| Err(anyhow!("no ack from modem")));

        let handler: Handler = Arc::new(Mutex::new(None));
        let mut ctrl = controller(gps, feed_capturing(handler.clone()), radio, start);
        ctrl.sample_queue().push(SensorSample::new(5.0, 80.0, 990.0));

        let first = ctrl.process_tick(start + Duration::from_secs(120));
        assert!(first.is_err());
        // The report was consumed; no backoff, the next cycle sends fresh data
        assert!(ctrl.sample_queue().is_empty());
        assert!(ctrl.process_tick(start + Duration::from_secs(150)).unwrap().is_none());
        assert!(ctrl.process_tick(start + Duration::from_secs(240)).is_err());

        let status = ctrl.get_status_shared();
        let status = status.read().unwrap();
        assert_eq!(status.last_send_ok, Some(false));
        assert!(status.last_send_error.as_deref().unwrap_or("").contains("no ack"));
        assert_eq!(status.frame_counter, 2);
    }

    #[test]
    fn test_empty_report_still_sends() {
        let start = Instant::now();
        let mut gps = MockGpsSource::new();
        gps.expect_read_pending().returning(|| Ok(()));
        gps.expect_current_fix().returning(|| GpsReading::NoFix);

        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(Mutex::new(None));
        let mut ctrl = controller(gps, feed_capturing(handler), radio_capturing(frames.clone()), start);

        ctrl.process_tick(start + Duration::from_secs(120)).unwrap();
        let frames = frames.lock().unwrap();
        let records = decode_frame(&frames[0], 0);
        assert!(matches!(&records[0], Record::Environmental(env) if env.sample_count == 0));
        assert_eq!(records[1], Record::Gps(Default::default()));
    }
}
