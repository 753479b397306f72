//! # CAN Cluster Simulator
//!
//! Simulates a cluster of hardware nodes on a CAN-like bus and exposes the bus
//! to one TCP client at a time.
//!
//! ## Features
//!
//! - **Bus bridge**: streamed JSON frames over TCP, dispatched by identifier
//! - **Simulated engine**: virtual sensors and nodes, power/stage command state
//! - **Command decay**: power, siren and solenoids reset when commands stop arriving
//! - **Telemetry**: periodic synthetic sensor readings and ping/pong liveness
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cansim::{CanSimulator, SimConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let simulator = CanSimulator::start(SimConfig::default()).await?;
//! simulator.engine().register_sensor(1, 13, 2)?;
//!
//! // Clients connecting to port 8881 now receive sensor frames every 20 ms
//! simulator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] - The bus frame record and its JSON form
//! - [`packets`] - Typed packets carried in frame payloads
//! - [`dispatch`] - Identifier to handler table for inbound frames
//! - [`engine`] - Simulation state, command handlers and the periodic tick
//! - [`bridge`] - TCP accept/read/write loops and the outbound queue
//! - [`simulator`] - Wiring and lifecycle of the running system

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod packets;
pub mod simulator;
pub mod telemetry;

// Re-export main public types for convenience
pub use bridge::{BusBridge, FrameSender};
pub use config::SimConfig;
pub use engine::{EngineSnapshot, SimEngine};
pub use frame::BusFrame;
pub use packets::NodeType;
pub use simulator::CanSimulator;
