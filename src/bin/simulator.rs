use cansim::config::{
    NodeSpec, SensorSpec, SimConfig, COMMAND_TIMEOUT_MS, DEFAULT_HOST, DEFAULT_PORT,
    TICK_PERIOD_MS,
};
use cansim::CanSimulator;
use clap::{App, Arg, ArgMatches};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port_default = DEFAULT_PORT.to_string();
    let tick_default = TICK_PERIOD_MS.to_string();
    let timeout_default = COMMAND_TIMEOUT_MS.to_string();

    let matches = App::new("cansim-simulator")
        .version("0.1.0")
        .about("Simulated CAN node cluster with a TCP bus bridge")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to listen on")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for the bus client")
                .takes_value(true)
                .default_value(&port_default)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be 0-65535".into())),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Engine tick period in milliseconds")
                .takes_value(true)
                .default_value(&tick_default)
                .validator(is_millis),
        )
        .arg(
            Arg::with_name("timeout-ms")
                .long("timeout-ms")
                .value_name("MS")
                .help("Power/stage command timeout in milliseconds")
                .takes_value(true)
                .default_value(&timeout_default)
                .validator(is_millis),
        )
        .arg(
            Arg::with_name("sensor")
                .long("sensor")
                .value_name("ID:BASE_VALUE:BASE_RANGE")
                .help("Register a virtual sensor (repeatable)")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .validator(|v| v.parse::<SensorSpec>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .arg(
            Arg::with_name("node")
                .long("node")
                .value_name("ID:TYPE")
                .help("Register a virtual node; TYPE is controller, sensor-board, solenoid-driver or igniter (repeatable)")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .validator(|v| v.parse::<NodeSpec>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .get_matches();

    let config = build_config(&matches)?;

    info!("Starting CAN cluster simulator on {}", config.socket_addr());
    let simulator = match CanSimulator::start(config).await {
        Ok(simulator) => simulator,
        Err(e) => {
            error!("Simulator failed to start: {}", e);
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    simulator.shutdown().await;

    Ok(())
}

fn is_millis(value: String) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(()),
        _ => Err("Value must be a positive number of milliseconds".into()),
    }
}

fn build_config(matches: &ArgMatches<'_>) -> Result<SimConfig, Box<dyn std::error::Error>> {
    let mut config = SimConfig::default();

    if let Some(host) = matches.value_of("host") {
        config.bind_host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse()?;
    }
    if let Some(tick) = matches.value_of("tick-ms") {
        config.tick_period = Duration::from_millis(tick.parse()?);
    }
    if let Some(timeout) = matches.value_of("timeout-ms") {
        config.command_timeout = Duration::from_millis(timeout.parse()?);
    }
    if let Some(sensors) = matches.values_of("sensor") {
        config.sensors = sensors.map(str::parse::<SensorSpec>).collect::<Result<Vec<_>, _>>()?;
    }
    if let Some(nodes) = matches.values_of("node") {
        config.nodes = nodes.map(str::parse::<NodeSpec>).collect::<Result<Vec<_>, _>>()?;
    }

    config.validate()?;
    Ok(config)
}
