//! The simulated bus engine: sensor and node registries, command state with
//! timeout-driven decay, and the periodic tick that emits telemetry.

use crate::bridge::FrameSender;
use crate::packets::{NodeType, SOLENOID_COUNT};
use crate::telemetry::{sensor_reading, wall_fraction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: u8,
    pub base_value: u32,
    pub base_range: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u8,
    pub node_type: NodeType,
    pub last_blink_time: Option<SystemTime>,
}

/// Read-only view of the engine for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub power: bool,
    pub siren: bool,
    pub solenoid_state: Vec<bool>,
    pub sensors: Vec<Sensor>,
    pub nodes: Vec<Node>,
    pub tick_count: u64,
    pub frames_queued: u64,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub readings_sent: usize,
    pub readings_skipped: usize,
    pub power_expired: bool,
    pub stage_expired: bool,
}

#[derive(Debug)]
struct EngineState {
    sensors: BTreeMap<u8, Sensor>,
    nodes: BTreeMap<u8, Node>,
    power: bool,
    siren: bool,
    solenoid_state: [bool; SOLENOID_COUNT],
    last_power_command: Option<Instant>,
    last_stage_command: Option<Instant>,
    tick_count: u64,
    frames_queued: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            sensors: BTreeMap::new(),
            nodes: BTreeMap::new(),
            power: false,
            siren: false,
            solenoid_state: [false; SOLENOID_COUNT],
            last_power_command: None,
            last_stage_command: None,
            tick_count: 0,
            frames_queued: 0,
        }
    }
}

// A command that was never received counts as expired.
fn is_expired(last_command: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    match last_command {
        Some(at) => now.saturating_duration_since(at) > timeout,
        None => true,
    }
}

fn entity_id(id: i64) -> Result<u8, EngineError> {
    u8::try_from(id).map_err(|_| EngineError::IdOutOfRange(id))
}

pub struct SimEngine {
    state: Mutex<EngineState>,
    outbound: FrameSender,
    command_timeout: Duration,
}

impl SimEngine {
    pub fn new(outbound: FrameSender, command_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(EngineState::new()),
            outbound,
            command_timeout,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Registration, called by the operator front-end

    pub fn register_sensor(&self, id: i64, base_value: u32, base_range: u32) -> Result<(), EngineError> {
        let id = entity_id(id)?;
        let sensor = Sensor { id, base_value, base_range };
        if self.lock().sensors.insert(id, sensor).is_some() {
            debug!(sensor_id = id, "sensor re-registered");
        } else {
            info!(sensor_id = id, base_value, base_range, "sensor registered");
        }
        Ok(())
    }

    pub fn deregister_sensor(&self, id: i64) -> Result<(), EngineError> {
        let id = entity_id(id)?;
        if self.lock().sensors.remove(&id).is_some() {
            info!(sensor_id = id, "sensor deregistered");
        }
        Ok(())
    }

    pub fn register_node(&self, id: i64, node_type: NodeType) -> Result<(), EngineError> {
        let id = entity_id(id)?;
        let node = Node {
            id,
            node_type,
            last_blink_time: None,
        };
        if self.lock().nodes.insert(id, node).is_some() {
            debug!(node_id = id, %node_type, "node re-registered");
        } else {
            info!(node_id = id, %node_type, "node registered");
        }
        Ok(())
    }

    pub fn deregister_node(&self, id: i64) -> Result<(), EngineError> {
        let id = entity_id(id)?;
        if self.lock().nodes.remove(&id).is_some() {
            info!(node_id = id, "node deregistered");
        }
        Ok(())
    }

    // Command handlers, called through the bridge's dispatch table

    pub fn handle_power(&self, powered: bool, siren: bool) {
        self.handle_power_at(powered, siren, Instant::now());
    }

    pub fn handle_power_at(&self, powered: bool, siren: bool, now: Instant) {
        let mut state = self.lock();
        state.power = powered;
        state.siren = siren;
        state.last_power_command = Some(now);
        trace!(powered, siren, "power command");
    }

    pub fn handle_stage(&self, solenoid_state: [bool; SOLENOID_COUNT]) {
        self.handle_stage_at(solenoid_state, Instant::now());
    }

    pub fn handle_stage_at(&self, solenoid_state: [bool; SOLENOID_COUNT], now: Instant) {
        let mut state = self.lock();
        state.solenoid_state = solenoid_state;
        state.last_stage_command = Some(now);
        trace!(open = solenoid_state.iter().filter(|&&open| open).count(), "stage command");
    }

    /// Records a blink for a registered node. Returns `false` for unknown nodes.
    pub fn handle_blink(&self, node_id: u8) -> bool {
        match self.lock().nodes.get_mut(&node_id) {
            Some(node) => {
                node.last_blink_time = Some(SystemTime::now());
                debug!(node_id, "node blinked");
                true
            }
            None => {
                debug!(node_id, "blink for unregistered node ignored");
                false
            }
        }
    }

    /// Queues a pong for every registered node, returning how many were queued.
    pub fn ping(&self) -> usize {
        let nodes: Vec<(u8, NodeType)> = self
            .lock()
            .nodes
            .values()
            .map(|node| (node.id, node.node_type))
            .collect();

        let mut queued = 0;
        for (node_id, node_type) in nodes {
            match self.outbound.send_pong(node_id, node_type) {
                Ok(()) => queued += 1,
                Err(e) => debug!(node_id, error = %e, "pong not sent"),
            }
        }

        self.lock().frames_queued += queued as u64;
        queued
    }

    // Periodic behavior

    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now(), SystemTime::now())
    }

    /// Runs one tick as if the monotonic clock read `now` and the wall clock
    /// read `wall`.
    pub fn tick_at(&self, now: Instant, wall: SystemTime) -> TickReport {
        let fraction = wall_fraction(wall);
        let mut report = TickReport::default();

        let readings: Vec<(u8, u32)> = {
            let mut state = self.lock();
            state.tick_count += 1;

            let readings: Vec<(u8, u32)> = state
                .sensors
                .values()
                .filter_map(|sensor| sensor_reading(sensor, fraction).map(|value| (sensor.id, value)))
                .collect();
            report.readings_skipped = state.sensors.len() - readings.len();

            if is_expired(state.last_power_command, now, self.command_timeout) {
                state.power = false;
                state.siren = false;
                report.power_expired = true;
            }

            if is_expired(state.last_stage_command, now, self.command_timeout) {
                state.solenoid_state = [false; SOLENOID_COUNT];
                report.stage_expired = true;
            }

            readings
        };

        for (sensor_id, value) in readings {
            match self.outbound.send_sensor_value(sensor_id, value) {
                Ok(()) => report.readings_sent += 1,
                Err(e) => debug!(sensor_id, error = %e, "sensor reading dropped"),
            }
        }

        if report.readings_sent > 0 {
            self.lock().frames_queued += report.readings_sent as u64;
        }

        report
    }

    /// Ticks every `period` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "engine tick loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let report = self.tick();
                    trace!(?report, "tick");
                }
            }
        }

        info!("engine tick loop stopped");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            power: state.power,
            siren: state.siren,
            solenoid_state: state.solenoid_state.to_vec(),
            sensors: state.sensors.values().copied().collect(),
            nodes: state.nodes.values().cloned().collect(),
            tick_count: state.tick_count,
            frames_queued: state.frames_queued,
        }
    }
}

impl core::fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimEngine")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("id {0} does not fit in 0..=255")]
    IdOutOfRange(i64),
}
