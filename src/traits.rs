use anyhow::Result;
use crate::types::{GpsReading, SensorSample};

/// Callback invoked by a sensor feed once per parsed broadcast.
pub type SampleHandler = Box<dyn FnMut(SensorSample) + Send>;

#[cfg_attr(test, mockall::automock)]
pub trait GpsSource {
    /// Drain and parse whatever bytes the receiver has buffered.
    fn read_pending(&mut self) -> Result<()>;

    /// Latest fix, or `NoFix` when the receiver has no valid solution.
    fn current_fix(&self) -> GpsReading;
}

#[cfg_attr(test, mockall::automock)]
pub trait SensorFeed {
    /// Register the handler that receives every parsed broadcast.
    fn on_sample(&mut self, handler: SampleHandler);

    /// Open one scan window. Samples arrive through the registered handler.
    fn scan(&mut self) -> Result<()>;

    /// Stop scanning. Default impl does nothing.
    fn stop(&mut self) -> Result<()> { Ok(()) }
}

#[cfg_attr(test, mockall::automock)]
pub trait Radio {
    /// Tune the transmitter. Blocks until the radio has accepted the setting.
    fn configure(&mut self, channel_khz: u32) -> Result<()>;

    /// Send one PHY payload. Blocks until the transmission completes or fails.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore {
    /// Returns Ok(None) when nothing has been stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()>;
}
