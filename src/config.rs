use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use crate::lorawan::{MAX_APP_PAYLOAD_LEN, SessionKeys};
use crate::payload::{MAX_RECORD_ENTRIES, max_positions_for};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub schedule: ScheduleConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_ms: u64,
    pub sensor_scan_secs: u64,
    pub gps_sample_secs: u64,
    pub outlier_filter_secs: u64,
    pub send_secs: u64,
    pub track_window_secs: u32,
    pub gps_max_attempts: u32,   // polls per sampling tick before giving up
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hex, most significant byte first
    pub device_address: String,
    pub network_key: String,
    pub app_key: String,
    pub fport: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub sample_queue_capacity: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            tick_ms: 1000,
            sensor_scan_secs: 30,
            gps_sample_secs: 20,
            outlier_filter_secs: 60,
            send_secs: 900, // 15 min
            track_window_secs: 180,
            gps_max_attempts: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            device_address: "27FDF5B6".to_string(),
            network_key: "2885C8CCAFE89CF74F7850F1FE7BF282".to_string(),
            app_key: "53EAE4ADC5530D18A41C37DC85682C32".to_string(),
            fport: 1,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            state_dir: "/var/lib/telemetry-node".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            sample_queue_capacity: MAX_RECORD_ENTRIES,
        }
    }
}

fn parse_hex<const N: usize>(name: &str, value: &str) -> Result<[u8; N]> {
    let value = value.trim();
    if value.len() != N * 2 {
        bail!("{} must be {} hex digits, got {}", name, N * 2, value.len());
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        let digits = value
            .get(i * 2..i * 2 + 2)
            .ok_or_else(|| anyhow!("{} is not ASCII hex", name))?;
        *byte = u8::from_str_radix(digits, 16)
            .map_err(|e| anyhow!("{} has invalid hex '{}': {}", name, digits, e))?;
    }
    Ok(out)
}

impl SessionConfig {
    pub fn keys(&self) -> Result<SessionKeys> {
        Ok(SessionKeys {
            device_address: parse_hex::<4>("device_address", &self.device_address)?,
            network_key: parse_hex::<16>("network_key", &self.network_key)?,
            app_key: parse_hex::<16>("app_key", &self.app_key)?,
        })
    }
}

impl ScheduleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Worst-case representative positions accumulated between two sends.
    /// Loop jitter can fit one filter cycle more than the exact ratio.
    pub fn positions_per_report(&self) -> u64 {
        self.send_secs / self.outlier_filter_secs.max(1) + 1
    }
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.schedule;
        if s.tick_ms == 0 || s.sensor_scan_secs == 0 || s.gps_sample_secs == 0
            || s.outlier_filter_secs == 0 || s.send_secs == 0
        {
            bail!("schedule intervals must be non-zero");
        }
        if s.gps_max_attempts == 0 {
            bail!("gps_max_attempts must be at least 1");
        }
        let position_limit = max_positions_for(MAX_APP_PAYLOAD_LEN) as u64;
        if s.positions_per_report() > position_limit {
            bail!(
                "send_secs / outlier_filter_secs allows {} positions per report, one frame holds {}",
                s.positions_per_report(), position_limit
            );
        }
        let cap = self.limits.sample_queue_capacity;
        if cap == 0 || cap > MAX_RECORD_ENTRIES {
            bail!("sample_queue_capacity must be within 1..={}, got {}", MAX_RECORD_ENTRIES, cap);
        }
        if self.session.fport == 0 || self.session.fport > 223 {
            bail!("fport {} is outside the application range 1..=223", self.session.fport);
        }
        self.session.keys()?;
        Ok(())
    }
}
