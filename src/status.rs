use serde::{Deserialize, Serialize};
use crate::types::GpsFix;

/// Node status snapshot shared between the controller and the operator
/// interface (status file / periodic log line).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NodeStatus {
    /// Counter value the next uplink will use
    pub frame_counter: u32,

    /// Sensor samples waiting for the next report
    pub pending_samples: usize,

    /// Broadcasts dropped because the sample queue was full
    pub dropped_samples: u64,

    /// Representative positions waiting for the next report
    pub pending_positions: usize,

    /// Accepted points currently in the rolling track window
    pub track_window_len: usize,

    pub last_fix: Option<GpsFix>,

    /// Unix timestamp of the last send attempt
    pub last_send_ts: Option<u64>,
    pub last_send_ok: Option<bool>,
    pub last_send_error: Option<String>,
    pub last_channel_khz: Option<u32>,

    pub secs_to_next_send: u64,

    /// Unix timestamp of last status update
    pub updated_ts: u64,
}
