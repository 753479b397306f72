//! Typed packets carried in a [`BusFrame`] payload.
//!
//! Every packet encodes to at most eight bytes. The bridge never looks inside
//! a payload; only the engine gives the bytes meaning.

use crate::frame::{BusFrame, FrameError, MAX_PAYLOAD_SIZE};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const POWER_ID: u32 = 0x00;
pub const STAGE_ID: u32 = 0x01;
pub const SENSOR_DATA_ID: u32 = 0x03;
pub const PING_ID: u32 = 0x04;
pub const PONG_ID: u32 = 0x05;
pub const BLINK_ID: u32 = 0x06;

pub const SOLENOID_COUNT: usize = 64;

pub type Payload = Vec<u8, MAX_PAYLOAD_SIZE>;

pub trait Packet: Sized {
    const IDENTIFIER: u32;
    const NAME: &'static str;

    fn encode(&self) -> Result<Payload, PacketError>;
    fn decode(data: &[u8]) -> Result<Self, PacketError>;

    /// Wraps the encoded packet in a frame carrying this packet's identifier.
    fn to_frame(&self) -> Result<BusFrame, PacketError> {
        Ok(BusFrame::new(Self::IDENTIFIER, &self.encode()?)?)
    }

    fn from_frame(frame: &BusFrame) -> Result<Self, PacketError> {
        Self::decode(frame.data())
    }
}

fn require(packet: &'static str, data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() < expected {
        return Err(PacketError::Truncated {
            packet,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn payload_from(bytes: &[u8]) -> Result<Payload, PacketError> {
    Payload::from_slice(bytes).map_err(|()| FrameError::PayloadTooLong { len: bytes.len() }.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Controller,
    SensorBoard,
    SolenoidDriver,
    Igniter,
}

impl NodeType {
    pub fn as_byte(self) -> u8 {
        match self {
            NodeType::Controller => 0,
            NodeType::SensorBoard => 1,
            NodeType::SolenoidDriver => 2,
            NodeType::Igniter => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeType::Controller => "controller",
            NodeType::SensorBoard => "sensor-board",
            NodeType::SolenoidDriver => "solenoid-driver",
            NodeType::Igniter => "igniter",
        }
    }
}

impl TryFrom<u8> for NodeType {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(NodeType::Controller),
            1 => Ok(NodeType::SensorBoard),
            2 => Ok(NodeType::SolenoidDriver),
            3 => Ok(NodeType::Igniter),
            other => Err(PacketError::UnknownNodeType(other)),
        }
    }
}

impl core::str::FromStr for NodeType {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(NodeType::Controller),
            "sensor-board" | "sensor" => Ok(NodeType::SensorBoard),
            "solenoid-driver" | "solenoid" => Ok(NodeType::SolenoidDriver),
            "igniter" => Ok(NodeType::Igniter),
            other => other
                .parse::<u8>()
                .map_err(|_| PacketError::UnknownNodeName(other.to_string()))
                .and_then(NodeType::try_from),
        }
    }
}

impl core::fmt::Display for NodeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit 0 carries `system_powered`, bit 1 carries `siren`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerPacket {
    pub system_powered: bool,
    pub siren: bool,
}

impl Packet for PowerPacket {
    const IDENTIFIER: u32 = POWER_ID;
    const NAME: &'static str = "power";

    fn encode(&self) -> Result<Payload, PacketError> {
        let flags = u8::from(self.system_powered) | (u8::from(self.siren) << 1);
        payload_from(&[flags])
    }

    fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require(Self::NAME, data, 1)?;
        Ok(Self {
            system_powered: data[0] & 0b01 != 0,
            siren: data[0] & 0b10 != 0,
        })
    }
}

/// Solenoid `i` lives in bit `i % 8` of byte `i / 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePacket {
    pub solenoid_state: [bool; SOLENOID_COUNT],
}

impl StagePacket {
    pub fn with_open(open: &[usize]) -> Self {
        let mut solenoid_state = [false; SOLENOID_COUNT];
        for &index in open.iter().filter(|&&i| i < SOLENOID_COUNT) {
            solenoid_state[index] = true;
        }
        Self { solenoid_state }
    }
}

impl Default for StagePacket {
    fn default() -> Self {
        Self {
            solenoid_state: [false; SOLENOID_COUNT],
        }
    }
}

impl Packet for StagePacket {
    const IDENTIFIER: u32 = STAGE_ID;
    const NAME: &'static str = "stage";

    fn encode(&self) -> Result<Payload, PacketError> {
        let mut bytes = [0u8; SOLENOID_COUNT / 8];
        for (index, &open) in self.solenoid_state.iter().enumerate() {
            if open {
                bytes[index / 8] |= 1 << (index % 8);
            }
        }
        payload_from(&bytes)
    }

    fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require(Self::NAME, data, SOLENOID_COUNT / 8)?;
        let mut solenoid_state = [false; SOLENOID_COUNT];
        for (index, open) in solenoid_state.iter_mut().enumerate() {
            *open = data[index / 8] & (1 << (index % 8)) != 0;
        }
        Ok(Self { solenoid_state })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDataPacket {
    pub sensor_id: u8,
    pub sensor_data: u32,
}

impl Packet for SensorDataPacket {
    const IDENTIFIER: u32 = SENSOR_DATA_ID;
    const NAME: &'static str = "sensor-data";

    fn encode(&self) -> Result<Payload, PacketError> {
        let value = self.sensor_data.to_le_bytes();
        payload_from(&[self.sensor_id, value[0], value[1], value[2], value[3]])
    }

    fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require(Self::NAME, data, 5)?;
        Ok(Self {
            sensor_id: data[0],
            sensor_data: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPacket {
    pub node_id: u8,
    pub node_type: NodeType,
}

impl Packet for PongPacket {
    const IDENTIFIER: u32 = PONG_ID;
    const NAME: &'static str = "pong";

    fn encode(&self) -> Result<Payload, PacketError> {
        payload_from(&[self.node_id, self.node_type.as_byte()])
    }

    fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require(Self::NAME, data, 2)?;
        Ok(Self {
            node_id: data[0],
            node_type: NodeType::try_from(data[1])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkPacket {
    pub node_id: u8,
}

impl Packet for BlinkPacket {
    const IDENTIFIER: u32 = BLINK_ID;
    const NAME: &'static str = "blink";

    fn encode(&self) -> Result<Payload, PacketError> {
        payload_from(&[self.node_id])
    }

    fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require(Self::NAME, data, 1)?;
        Ok(Self { node_id: data[0] })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("{packet} packet needs {expected} bytes, got {actual}")]
    Truncated {
        packet: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unknown node type {0}")]
    UnknownNodeType(u8),
    #[error("unknown node type name '{0}'")]
    UnknownNodeName(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
