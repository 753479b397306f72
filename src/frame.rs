use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_PAYLOAD_SIZE: usize = 8;

/// One CAN-like message as it travels between the bridge and the engine.
///
/// The JSON field names match the frame layout used by existing bus tooling:
/// `{"ArbitrationID": 1, "DLC": 2, "Data": [0, 0, 0, 0, 0, 0, 0, 0]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFrame")]
pub struct BusFrame {
    #[serde(rename = "ArbitrationID")]
    identifier: u32,
    #[serde(rename = "DLC")]
    length: u8,
    #[serde(rename = "Data")]
    payload: [u8; MAX_PAYLOAD_SIZE],
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "ArbitrationID")]
    identifier: u32,
    #[serde(rename = "DLC")]
    length: u8,
    #[serde(rename = "Data")]
    payload: [u8; MAX_PAYLOAD_SIZE],
}

impl TryFrom<RawFrame> for BusFrame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        if raw.length as usize > MAX_PAYLOAD_SIZE {
            return Err(FrameError::InvalidLength { dlc: raw.length });
        }
        Ok(Self {
            identifier: raw.identifier,
            length: raw.length,
            payload: raw.payload,
        })
    }
}

impl BusFrame {
    /// Builds a frame around `payload`, zero-padding the unused tail.
    pub fn new(identifier: u32, payload: &[u8]) -> Result<Self, FrameError> {
        let len = payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLong { len });
        }

        let mut data = [0u8; MAX_PAYLOAD_SIZE];
        data[..len].copy_from_slice(payload);

        Ok(Self {
            identifier,
            length: len as u8,
            payload: data,
        })
    }

    /// A frame with no payload, e.g. a ping.
    pub fn empty(identifier: u32) -> Self {
        Self {
            identifier,
            length: 0,
            payload: [0; MAX_PAYLOAD_SIZE],
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The meaningful bytes, i.e. the first `DLC` bytes of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len()]
    }

    /// The full 8-byte buffer including padding.
    pub fn raw_payload(&self) -> &[u8; MAX_PAYLOAD_SIZE] {
        &self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte frame limit")]
    PayloadTooLong { len: usize },
    #[error("frame length {dlc} exceeds the {MAX_PAYLOAD_SIZE}-byte frame limit")]
    InvalidLength { dlc: u8 },
}
