use cansim::frame::BusFrame;
use cansim::packets::{
    BlinkPacket, Packet, PongPacket, PowerPacket, SensorDataPacket, StagePacket, PING_ID, PONG_ID,
    SENSOR_DATA_ID, SOLENOID_COUNT,
};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8881";
// Refresh faster than the simulator's command timeout
const HOLD_REFRESH_MS: u64 = 20;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("cansim")
        .version("0.1.0")
        .about("🔌 Operator client for the CAN cluster simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("power")
                .about("⚡ Send a power command")
                .arg(
                    Arg::with_name("state")
                        .help("System power state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                )
                .arg(Arg::with_name("siren").long("siren").help("Sound the siren"))
                .arg(hold_arg()),
        )
        .subcommand(
            SubCommand::with_name("stage")
                .about("🚀 Send a stage command")
                .arg(
                    Arg::with_name("open")
                        .long("open")
                        .value_name("SOLENOIDS")
                        .help("Comma separated solenoid indices to open, e.g. 0,5,9")
                        .takes_value(true)
                        .validator(|v| parse_solenoids(&v).map(|_| ())),
                )
                .arg(hold_arg()),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("🏓 Ping every node on the bus")
                .arg(
                    Arg::with_name("wait")
                        .long("wait")
                        .value_name("MS")
                        .help("How long to collect pong replies")
                        .takes_value(true)
                        .default_value("500")
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Wait must be a number".into())),
                ),
        )
        .subcommand(
            SubCommand::with_name("blink")
                .about("💡 Ask a node to blink")
                .arg(
                    Arg::with_name("node")
                        .help("Node id (0-255)")
                        .required(true)
                        .validator(|v| v.parse::<u8>().map(|_| ()).map_err(|_| "Node id must be 0-255".into())),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("📡 Print every frame sent by the simulator"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string();
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table").to_string();

    match matches.subcommand() {
        ("power", Some(sub_matches)) => handle_power(sub_matches, &host, port).await?,
        ("stage", Some(sub_matches)) => handle_stage(sub_matches, &host, port).await?,
        ("ping", Some(sub_matches)) => handle_ping(sub_matches, &host, port, &format).await?,
        ("blink", Some(sub_matches)) => handle_blink(sub_matches, &host, port).await?,
        ("monitor", _) => handle_monitor(&host, port, &format).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    Ok(())
}

fn hold_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("hold")
        .long("hold")
        .value_name("SECS")
        .help("Keep re-sending the command for this many seconds")
        .takes_value(true)
        .validator(|v| match v.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => Ok(()),
            _ => Err("Hold must be a non-negative number of seconds".into()),
        })
}

fn hold_duration(matches: &ArgMatches<'_>) -> CliResult<Duration> {
    match matches.value_of("hold") {
        Some(secs) => Ok(Duration::from_secs_f64(secs.parse()?)),
        None => Ok(Duration::ZERO),
    }
}

fn parse_solenoids(list: &str) -> Result<Vec<usize>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|index| !index.is_empty())
        .map(|index| match index.parse::<usize>() {
            Ok(i) if i < SOLENOID_COUNT => Ok(i),
            _ => Err(format!("Solenoid index must be 0-{}, got '{}'", SOLENOID_COUNT - 1, index)),
        })
        .collect()
}

async fn handle_power(matches: &ArgMatches<'_>, host: &str, port: u16) -> CliResult<()> {
    let packet = PowerPacket {
        system_powered: matches.value_of("state") == Some("on"),
        siren: matches.is_present("siren"),
    };
    let hold = hold_duration(matches)?;

    let (_reader, mut writer) = connect(host, port).await?;
    let sent = send_held(&mut writer, &packet.to_frame()?, hold).await?;

    println!(
        "{} Power {} siren {} ({} frame{})",
        "✅".green(),
        on_off(packet.system_powered),
        on_off(packet.siren),
        sent,
        if sent == 1 { "" } else { "s" }
    );
    Ok(())
}

async fn handle_stage(matches: &ArgMatches<'_>, host: &str, port: u16) -> CliResult<()> {
    let open = match matches.value_of("open") {
        Some(list) => parse_solenoids(list)?,
        None => Vec::new(),
    };
    let packet = StagePacket::with_open(&open);
    let hold = hold_duration(matches)?;

    let (_reader, mut writer) = connect(host, port).await?;
    let sent = send_held(&mut writer, &packet.to_frame()?, hold).await?;

    let open_list = if open.is_empty() {
        "none".dimmed().to_string()
    } else {
        open.iter().map(ToString::to_string).collect::<Vec<_>>().join(",").bright_white().to_string()
    };
    println!("{} Stage sent, open solenoids: {} ({} frames)", "✅".green(), open_list, sent);
    Ok(())
}

async fn handle_ping(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult<()> {
    let wait = Duration::from_millis(matches.value_of("wait").unwrap_or("500").parse()?);

    let (reader, mut writer) = connect(host, port).await?;
    write_frame(&mut writer, &BusFrame::empty(PING_ID)).await?;

    let mut lines = BufReader::new(reader).lines();
    let deadline = Instant::now() + wait;
    let mut pongs = Vec::new();

    while let Ok(line) = time::timeout_at(deadline, lines.next_line()).await {
        let Some(line) = line? else { break };
        let Ok(frame) = serde_json::from_str::<BusFrame>(line.trim()) else { continue };
        if frame.identifier() != PONG_ID {
            continue;
        }
        if format == "json" {
            println!("{}", line.trim());
        }
        if let Ok(pong) = PongPacket::from_frame(&frame) {
            pongs.push(pong);
        }
    }

    match format {
        "json" => {}
        "compact" => println!("{}", format!("{} PONG", pongs.len()).bright_green()),
        _ => {
            if pongs.is_empty() {
                println!("{} {}", "❌".red(), "No nodes answered".bright_red());
            } else {
                println!("{} {}", "🏓".bright_blue(), "Nodes on the bus".bright_blue().bold());
                for pong in &pongs {
                    println!("  {} {:>3}  {}", "node".bright_white(), pong.node_id, pong.node_type.to_string().bright_green());
                }
            }
        }
    }
    Ok(())
}

async fn handle_blink(matches: &ArgMatches<'_>, host: &str, port: u16) -> CliResult<()> {
    let node_id: u8 = matches.value_of("node").unwrap_or("0").parse()?;
    let (_reader, mut writer) = connect(host, port).await?;
    write_frame(&mut writer, &BlinkPacket { node_id }.to_frame()?).await?;
    println!("{} Blink sent to node {}", "💡".yellow(), node_id);
    Ok(())
}

async fn handle_monitor(host: &str, port: u16, format: &str) -> CliResult<()> {
    let (reader, _writer) = connect(host, port).await?;
    println!("{}", "📡 Monitoring bus frames (Press Ctrl+C to stop)...".bright_blue().bold());

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if format == "json" {
            println!("{}", line);
            continue;
        }

        match serde_json::from_str::<BusFrame>(line) {
            Ok(frame) => print_frame(&frame, format),
            Err(e) => println!("{} {}", "malformed frame:".red(), e),
        }
    }

    println!("{}", "Connection closed by simulator".yellow());
    Ok(())
}

fn print_frame(frame: &BusFrame, format: &str) {
    let described = match frame.identifier() {
        SENSOR_DATA_ID => SensorDataPacket::from_frame(frame)
            .map(|p| format!("sensor {:>3} = {}", p.sensor_id, p.sensor_data.to_string().bright_green())),
        PONG_ID => PongPacket::from_frame(frame)
            .map(|p| format!("pong   {:>3} ({})", p.node_id, p.node_type.to_string().bright_cyan())),
        other => Ok(format!("id 0x{:02x} data {:?}", other, frame.data())),
    };

    match (described, format) {
        (Ok(text), "compact") => println!("{}", text),
        (Ok(text), _) => println!("│ 0x{:02x} │ {}", frame.identifier(), text),
        (Err(e), _) => println!("{} 0x{:02x}: {}", "undecodable".red(), frame.identifier(), e),
    }
}

fn on_off(state: bool) -> ColoredString {
    if state {
        "ON".bright_green()
    } else {
        "OFF".bright_red()
    }
}

async fn connect(host: &str, port: u16) -> CliResult<(OwnedReadHalf, OwnedWriteHalf)> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream.into_split()),
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Simulator is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin cansim-simulator".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &BusFrame) -> CliResult<()> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.extend_from_slice(b"\r\n");
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Sends `frame` once, then keeps refreshing it until `hold` has elapsed.
async fn send_held(writer: &mut OwnedWriteHalf, frame: &BusFrame, hold: Duration) -> CliResult<usize> {
    let deadline = Instant::now() + hold;
    let mut interval = time::interval(Duration::from_millis(HOLD_REFRESH_MS));
    let mut sent = 0;

    loop {
        interval.tick().await;
        write_frame(writer, frame).await?;
        sent += 1;
        if Instant::now() >= deadline {
            break;
        }
    }

    writer.flush().await?;
    Ok(sent)
}
