//! LoRaWAN 1.0 ABP uplink framing
//!
//! Builds unconfirmed data-up PHY payloads:
//! ```text
//! MHDR(0x40) | DevAddr (LSB first) | FCtrl(0x00) | FCnt (16-bit LE) | FPort | FRMPayload | MIC
//! ```
//! FRMPayload is XORed with an AES-128 keystream over the A_i blocks (AppSKey);
//! the MIC is the first 4 bytes of AES-CMAC (NwkSKey) over B0 | message.
//! Both blocks carry the device address and the full 32-bit frame counter, so
//! a counter value must never be reused for two different plaintexts.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use cmac::{Cmac, Mac};
use log::debug;
use rand::Rng;
use thiserror::Error;

/// MHDR for unconfirmed data up
pub const MHDR_UNCONFIRMED_UP: u8 = 0x40;
/// FCtrl: no ADR, no ACK, no FOpts
pub const FCTRL_UPLINK: u8 = 0x00;
pub const DEFAULT_FPORT: u8 = 1;

pub const HEADER_LEN: usize = 9;
pub const MIC_LEN: usize = 4;

/// B0 carries the MIC'd message length in one byte
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize;
/// Largest application payload that still gets a MIC
pub const MAX_APP_PAYLOAD_LEN: usize = MAX_MESSAGE_LEN - HEADER_LEN;

/// Direction byte in the A_i/B0 blocks
const DIR_UPLINK: u8 = 0x00;

/// TTN EU868 uplink channels (kHz)
pub const EU868_UPLINK_CHANNELS_KHZ: [u32; 8] = [
    868_100, 868_300, 868_500,
    867_100, 867_300, 867_500,
    867_700, 867_900,
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("frame counter exhausted, session keys must be re-provisioned")]
    CounterExhausted,
    #[error("radio configure failed on {channel_khz} kHz: {source}")]
    Configure {
        channel_khz: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("transmit failed: {0}")]
    Transmit(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// ABP session material, provisioned out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Device address, most significant byte first
    pub device_address: [u8; 4],
    pub network_key: [u8; 16],
    pub app_key: [u8; 16],
}

/// One built uplink. Only the counter outlives transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkFrame {
    pub channel_khz: u32,
    pub device_address: [u8; 4],
    pub frame_counter: u32,
    pub fport: u8,
    pub encrypted_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl UplinkFrame {
    fn header(device_address: [u8; 4], frame_counter: u32, fport: u8) -> [u8; HEADER_LEN] {
        let fcnt = (frame_counter as u16).to_le_bytes();
        [
            MHDR_UNCONFIRMED_UP,
            device_address[3],
            device_address[2],
            device_address[1],
            device_address[0],
            FCTRL_UPLINK,
            fcnt[0],
            fcnt[1],
            fport,
        ]
    }

    /// Complete PHY payload as handed to the radio.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.encrypted_payload.len() + MIC_LEN);
        buf.extend_from_slice(&Self::header(self.device_address, self.frame_counter, self.fport));
        buf.extend_from_slice(&self.encrypted_payload);
        buf.extend_from_slice(&self.mic);
        buf
    }
}

/// Header fields and body of a received PHY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub device_address: [u8; 4],
    /// Low 16 bits of the frame counter as carried on air
    pub fcnt16: u16,
    pub fport: u8,
    pub encrypted_payload: Vec<u8>,
    pub mic: [u8; 4],
}

pub fn parse_frame(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
    if bytes.len() < HEADER_LEN + MIC_LEN {
        return Err(FrameError::Malformed("shorter than header + MIC"));
    }
    if bytes[0] != MHDR_UNCONFIRMED_UP {
        return Err(FrameError::Malformed("not an unconfirmed data-up frame"));
    }
    let body_end = bytes.len() - MIC_LEN;
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&bytes[body_end..]);
    Ok(ParsedFrame {
        device_address: [bytes[4], bytes[3], bytes[2], bytes[1]],
        fcnt16: u16::from_le_bytes([bytes[6], bytes[7]]),
        fport: bytes[8],
        encrypted_payload: bytes[HEADER_LEN..body_end].to_vec(),
        mic,
    })
}

/// A_i / B0 block layout shared by encryption and MIC derivation.
fn session_block(first: u8, device_address: [u8; 4], frame_counter: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = first;
    block[5] = DIR_UPLINK;
    block[6..10].copy_from_slice(&[device_address[3], device_address[2], device_address[1], device_address[0]]);
    block[10..14].copy_from_slice(&frame_counter.to_le_bytes());
    block[15] = last;
    block
}

/// XOR `payload` with the counter-mode keystream. Applying it twice restores
/// the plaintext.
pub fn encrypt_payload(app_key: &[u8; 16], device_address: [u8; 4], frame_counter: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > 16 * u8::MAX as usize {
        return Err(FrameError::Crypto(format!("payload of {} bytes exceeds keystream", payload.len())));
    }
    let cipher = Aes128::new(GenericArray::from_slice(&app_key[..]));

    let mut out = Vec::with_capacity(payload.len());
    for (i, chunk) in payload.chunks(16).enumerate() {
        let a = session_block(0x01, device_address, frame_counter, (i + 1) as u8);
        let mut s = GenericArray::clone_from_slice(&a[..]);
        cipher.encrypt_block(&mut s);
        out.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }
    Ok(out)
}

/// First 4 bytes of AES-CMAC(NwkSKey, B0 | msg).
pub fn compute_mic(network_key: &[u8; 16], device_address: [u8; 4], frame_counter: u32, msg: &[u8]) -> Result<[u8; 4], FrameError> {
    let len = u8::try_from(msg.len())
        .map_err(|_| FrameError::Crypto(format!("message of {} bytes too long for B0", msg.len())))?;
    let b0 = session_block(0x49, device_address, frame_counter, len);

    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&network_key[..])
        .map_err(|e| FrameError::Crypto(e.to_string()))?;
    mac.update(&b0);
    mac.update(msg);
    let tag = mac.finalize().into_bytes();

    let mut mic = [0u8; 4];
    mic.copy_from_slice(&tag[..MIC_LEN]);
    Ok(mic)
}

/// Flat, unweighted pick from the EU868 uplink plan.
pub fn select_channel<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    EU868_UPLINK_CHANNELS_KHZ[rng.random_range(0..EU868_UPLINK_CHANNELS_KHZ.len())]
}

pub struct FrameBuilder {
    keys: SessionKeys,
    fport: u8,
}

impl FrameBuilder {
    pub fn new(keys: SessionKeys, fport: u8) -> Self {
        FrameBuilder { keys, fport }
    }

    /// Encrypt `payload` under `frame_counter` and seal it with the MIC.
    /// Nothing is persisted or transmitted here.
    pub fn build(&self, payload: &[u8], frame_counter: u32, channel_khz: u32) -> Result<UplinkFrame, FrameError> {
        let addr = self.keys.device_address;
        let encrypted_payload = encrypt_payload(&self.keys.app_key, addr, frame_counter, payload)?;

        let mut msg = Vec::with_capacity(HEADER_LEN + encrypted_payload.len());
        msg.extend_from_slice(&UplinkFrame::header(addr, frame_counter, self.fport));
        msg.extend_from_slice(&encrypted_payload);
        let mic = compute_mic(&self.keys.network_key, addr, frame_counter, &msg)?;

        debug!(
            "[Uplink] Built frame fcnt={} ch={}kHz len={} mic={:02X?}",
            frame_counter, channel_khz, msg.len() + MIC_LEN, mic
        );

        Ok(UplinkFrame {
            channel_khz,
            device_address: addr,
            frame_counter,
            fport: self.fport,
            encrypted_payload,
            mic,
        })
    }

    /// Check the MIC of a received frame against the full 32-bit counter and
    /// return the decrypted application payload.
    pub fn open(&self, bytes: &[u8], frame_counter: u32) -> Result<Vec<u8>, FrameError> {
        let parsed = parse_frame(bytes)?;
        if parsed.device_address != self.keys.device_address {
            return Err(FrameError::Malformed("device address mismatch"));
        }
        if parsed.fcnt16 != frame_counter as u16 {
            return Err(FrameError::Malformed("frame counter mismatch"));
        }
        let msg = &bytes[..bytes.len() - MIC_LEN];
        let mic = compute_mic(&self.keys.network_key, parsed.device_address, frame_counter, msg)?;
        if mic != parsed.mic {
            return Err(FrameError::Malformed("MIC mismatch"));
        }
        encrypt_payload(&self.keys.app_key, parsed.device_address, frame_counter, &parsed.encrypted_payload)
    }
}
