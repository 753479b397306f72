use crate::bridge::{outbound_channel, BridgeError, BusBridge};
use crate::config::{ConfigError, SimConfig};
use crate::engine::{EngineError, SimEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A running simulator: the engine, its bridge and their background tasks.
pub struct CanSimulator {
    engine: Arc<SimEngine>,
    bridge: Arc<BusBridge>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CanSimulator {
    /// Validates `config`, registers its sensors and nodes, binds the bridge
    /// and spawns the accept loop, the outbound writer and the tick loop.
    pub async fn start(config: SimConfig) -> Result<Self, SimulatorError> {
        config.validate()?;

        let (outbound, outbound_rx) = outbound_channel(config.outbound_queue_size);
        let engine = Arc::new(SimEngine::new(outbound, config.command_timeout));

        for sensor in &config.sensors {
            engine.register_sensor(sensor.id, sensor.base_value, sensor.base_range)?;
        }
        for node in &config.nodes {
            engine.register_node(node.id, node.node_type)?;
        }

        let bridge = BusBridge::bind(&config.socket_addr(), Arc::clone(&engine)).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(Arc::clone(&bridge).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&bridge).run_outbound(outbound_rx, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&engine).run(config.tick_period, shutdown_rx)),
        ];

        info!(
            addr = %bridge.local_addr(),
            sensors = config.sensors.len(),
            nodes = config.nodes.len(),
            "simulator started"
        );

        Ok(Self {
            engine,
            bridge,
            shutdown,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<SimEngine> {
        &self.engine
    }

    pub fn bridge(&self) -> &Arc<BusBridge> {
        &self.bridge
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bridge.local_addr()
    }

    /// Signals every task to stop and waits for the background tasks to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("simulator stopped");
    }
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("registration failed: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
