//! Uplink send path: counter bookkeeping around the frame builder and radio.
//!
//! Order per send:
//! 1. pick a channel
//! 2. build the frame under the current counter (failure leaves the counter untouched)
//! 3. advance and persist the counter
//! 4. configure the radio and transmit
//!
//! Persisting before transmitting means a frame that reached the air is never
//! followed by a reboot that reuses its counter, as long as the write succeeded.
//! A failed write is logged and the send still goes ahead; after a reboot the
//! node may then repeat a counter value the network server has already seen.

use anyhow::Result;
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use crate::counter::FrameCounterStore;
use crate::lorawan::{FrameBuilder, FrameError, select_channel};
use crate::traits::{KeyValueStore, Radio};

/// Outcome of a successful transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub frame_counter: u32,
    pub channel_khz: u32,
    pub frame_len: usize,
    pub counter_persisted: bool,
}

pub struct UplinkSender<R: Radio, K: KeyValueStore> {
    builder: FrameBuilder,
    radio: R,
    counter_store: FrameCounterStore<K>,
    frame_counter: u32,
    rng: StdRng,
}

impl<R: Radio, K: KeyValueStore> UplinkSender<R, K> {
    pub fn new(builder: FrameBuilder, radio: R, counter_store: FrameCounterStore<K>) -> Self {
        Self::with_rng(builder, radio, counter_store, StdRng::from_os_rng())
    }

    pub fn with_rng(builder: FrameBuilder, radio: R, counter_store: FrameCounterStore<K>, rng: StdRng) -> Self {
        let frame_counter = counter_store.load();
        info!("[Uplink] Session ready, frame counter {}", frame_counter);
        UplinkSender {
            builder,
            radio,
            counter_store,
            frame_counter,
            rng,
        }
    }

    /// Counter value the next frame will be built with.
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<SendReport, FrameError> {
        let fc = self.frame_counter;
        let next = fc.checked_add(1).ok_or(FrameError::CounterExhausted)?;
        let channel_khz = select_channel(&mut self.rng);

        let frame = self.builder.build(payload, fc, channel_khz)?;
        let bytes = frame.to_bytes();
        debug!("[Uplink] PHYPayload {:02X?}", bytes);

        // The keystream for `fc` now exists; never hand it out again.
        self.frame_counter = next;
        let counter_persisted = match self.counter_store.save(next) {
            Ok(()) => true,
            Err(_) => {
                warn!("[Uplink] Sending fcnt={} with unpersisted counter; a reboot may replay it", fc);
                false
            }
        };

        info!("[Uplink] Sending {} bytes on {} kHz (fcnt={})", bytes.len(), channel_khz, fc);
        self.radio.configure(channel_khz).map_err(|e| {
            error!("[Uplink] Radio configure failed: {}", e);
            FrameError::Configure { channel_khz, source: e.into() }
        })?;
        self.radio.transmit(&bytes).map_err(|e| {
            error!("[Uplink] Transmit failed: {}", e);
            FrameError::Transmit(e.into())
        })?;

        Ok(SendReport {
            frame_counter: fc,
            channel_khz,
            frame_len: bytes.len(),
            counter_persisted,
        })
    }

    /// Operator action: restart the session count at zero.
    pub fn reset_counter(&mut self) -> Result<()> {
        self.counter_store.reset()?;
        self.frame_counter = 0;
        Ok(())
    }
}
