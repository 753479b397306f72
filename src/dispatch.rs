//! Identifier-keyed routing of inbound frames into the engine.

use crate::engine::SimEngine;
use crate::frame::BusFrame;
use crate::packets::{
    BlinkPacket, Packet, PacketError, PowerPacket, StagePacket, BLINK_ID, PING_ID, POWER_ID,
    STAGE_ID,
};
use std::collections::HashMap;
use tracing::trace;

pub type Handler = fn(&SimEngine, &BusFrame) -> Result<(), PacketError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    /// No handler is registered for the identifier. The frame is dropped.
    Unrecognized,
}

#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<u32, Handler>,
}

impl DispatchTable {
    /// A table with no handlers; every frame is unrecognized.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The command set understood by the simulated cluster.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(POWER_ID, handle_power);
        table.register(STAGE_ID, handle_stage);
        table.register(PING_ID, handle_ping);
        table.register(BLINK_ID, handle_blink);
        table
    }

    /// Installs `handler` for `identifier`, returning the handler it replaced.
    pub fn register(&mut self, identifier: u32, handler: Handler) -> Option<Handler> {
        self.handlers.insert(identifier, handler)
    }

    pub fn handles(&self, identifier: u32) -> bool {
        self.handlers.contains_key(&identifier)
    }

    pub fn dispatch(&self, engine: &SimEngine, frame: &BusFrame) -> Result<Dispatched, PacketError> {
        match self.handlers.get(&frame.identifier()) {
            Some(handler) => {
                handler(engine, frame)?;
                Ok(Dispatched::Handled)
            }
            None => {
                trace!(identifier = frame.identifier(), "ignoring unrecognized identifier");
                Ok(Dispatched::Unrecognized)
            }
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl core::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut identifiers: Vec<_> = self.handlers.keys().copied().collect();
        identifiers.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("identifiers", &identifiers)
            .finish()
    }
}

fn handle_power(engine: &SimEngine, frame: &BusFrame) -> Result<(), PacketError> {
    let packet = PowerPacket::from_frame(frame)?;
    engine.handle_power(packet.system_powered, packet.siren);
    Ok(())
}

fn handle_stage(engine: &SimEngine, frame: &BusFrame) -> Result<(), PacketError> {
    let packet = StagePacket::from_frame(frame)?;
    engine.handle_stage(packet.solenoid_state);
    Ok(())
}

fn handle_ping(engine: &SimEngine, _frame: &BusFrame) -> Result<(), PacketError> {
    engine.ping();
    Ok(())
}

fn handle_blink(engine: &SimEngine, frame: &BusFrame) -> Result<(), PacketError> {
    let packet = BlinkPacket::from_frame(frame)?;
    engine.handle_blink(packet.node_id);
    Ok(())
}
