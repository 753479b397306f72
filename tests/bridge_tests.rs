use cansim::config::SimConfig;
use cansim::frame::BusFrame;
use cansim::packets::*;
use cansim::CanSimulator;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

const WAIT: Duration = Duration::from_secs(2);

struct TestClient {
    local_addr: SocketAddr,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(simulator: &CanSimulator) -> Self {
        let stream = TcpStream::connect(simulator.local_addr()).await.unwrap();
        let local_addr = stream.local_addr().unwrap();
        let (reader, writer) = stream.into_split();
        let client = Self {
            local_addr,
            lines: BufReader::new(reader).lines(),
            writer,
        };

        let bridge = simulator.bridge();
        assert!(
            wait_until(|| bridge.current_peer() == Some(local_addr)).await,
            "bridge never picked up the client"
        );
        client
    }

    async fn send(&mut self, frame: &BusFrame) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push_str("\r\n");
        self.send_raw(&line).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    /// Next frame with `identifier`, skipping anything else on the line.
    async fn next_frame(&mut self, identifier: u32, within: Duration) -> Option<BusFrame> {
        let deadline = Instant::now() + within;
        loop {
            let line = match time::timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                _ => return None,
            };
            let frame: BusFrame = serde_json::from_str(line.trim()).unwrap();
            if frame.identifier() == identifier {
                return Some(frame);
            }
        }
    }

    /// True once the server has closed this connection.
    async fn closed_by_server(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            match time::timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Ok(Ok(Some(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

fn test_config() -> SimConfig {
    SimConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        ..SimConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_power_command_applies_then_decays() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;
    let engine = simulator.engine();

    let power = PowerPacket { system_powered: true, siren: true };
    client.send(&power.to_frame().unwrap()).await;

    assert!(wait_until(|| {
        let snapshot = engine.snapshot();
        snapshot.power && snapshot.siren
    })
    .await);

    // No refresh: the next tick past the timeout resets both
    time::sleep(Duration::from_millis(100)).await;
    let snapshot = engine.snapshot();
    assert!(!snapshot.power);
    assert!(!snapshot.siren);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refreshed_power_stays_on() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;
    let frame = PowerPacket { system_powered: true, siren: false }.to_frame().unwrap();

    client.send(&frame).await;
    let engine = simulator.engine();
    assert!(wait_until(|| engine.snapshot().power).await);

    for _ in 0..10 {
        client.send(&frame).await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(engine.snapshot().power);
    }

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sensor_telemetry_reaches_client() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    // sin(x) stays positive for x in [13, 15), so every tick emits a reading
    simulator.engine().register_sensor(1, 13, 2).unwrap();
    let mut client = TestClient::connect(&simulator).await;

    let frame = client.next_frame(SENSOR_DATA_ID, WAIT).await.expect("no sensor frame");
    let packet = SensorDataPacket::from_frame(&frame).unwrap();
    assert_eq!(packet.sensor_id, 1);
    assert!(packet.sensor_data <= 1);
    assert_eq!(frame.len(), 5);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_answered_with_pongs() {
    let mut config = test_config();
    config.nodes = vec!["2:igniter".parse().unwrap(), "8:controller".parse().unwrap()];
    let simulator = CanSimulator::start(config).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    client.send(&BusFrame::empty(PING_ID)).await;

    let first = client.next_frame(PONG_ID, WAIT).await.expect("missing first pong");
    let second = client.next_frame(PONG_ID, WAIT).await.expect("missing second pong");
    assert_eq!(
        PongPacket::from_frame(&first).unwrap(),
        PongPacket { node_id: 2, node_type: NodeType::Igniter }
    );
    assert_eq!(
        PongPacket::from_frame(&second).unwrap(),
        PongPacket { node_id: 8, node_type: NodeType::Controller }
    );

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_without_client_sends_nothing() {
    let mut config = test_config();
    config.nodes = vec!["1:controller".parse().unwrap(), "2:sensor-board".parse().unwrap()];
    let simulator = CanSimulator::start(config).await.unwrap();

    assert!(!simulator.bridge().has_client());
    assert_eq!(simulator.engine().ping(), 2);
    simulator
        .bridge()
        .send(&BusFrame::empty(PONG_ID))
        .await
        .unwrap();

    // The queued pongs were written nowhere; a later client sees none of them
    time::sleep(Duration::from_millis(50)).await;
    let mut client = TestClient::connect(&simulator).await;
    assert!(client.next_frame(PONG_ID, Duration::from_millis(200)).await.is_none());

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blink_for_unknown_node_is_ignored() {
    let mut config = test_config();
    config.nodes = vec!["4:solenoid-driver".parse().unwrap()];
    let simulator = CanSimulator::start(config).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;
    let engine = simulator.engine();

    client.send(&BlinkPacket { node_id: 200 }.to_frame().unwrap()).await;

    // Connection still serves commands afterwards
    client.send(&BlinkPacket { node_id: 4 }.to_frame().unwrap()).await;
    assert!(wait_until(|| engine.snapshot().nodes[0].last_blink_time.is_some()).await);
    assert_eq!(engine.snapshot().nodes.len(), 1);
    assert_eq!(simulator.bridge().current_peer(), Some(client.local_addr));

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_identifiers_leave_state_alone() {
    let mut config = test_config();
    config.nodes = vec!["4:igniter".parse().unwrap()];
    let simulator = CanSimulator::start(config).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;
    let engine = simulator.engine();

    for identifier in [0x02, SENSOR_DATA_ID, PONG_ID, 0x1ff] {
        client.send(&BusFrame::new(identifier, &[0xff; 8]).unwrap()).await;
    }
    client.send(&BlinkPacket { node_id: 4 }.to_frame().unwrap()).await;

    // The blink is processed after the unknown frames
    assert!(wait_until(|| engine.snapshot().nodes[0].last_blink_time.is_some()).await);
    let snapshot = engine.snapshot();
    assert!(!snapshot.power);
    assert!(snapshot.solenoid_state.iter().all(|&open| !open));

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_on_one_line_dispatch_in_order() {
    let mut config = test_config();
    config.command_timeout = Duration::from_secs(5);
    let simulator = CanSimulator::start(config).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;
    let engine = simulator.engine();

    let first = serde_json::to_string(&StagePacket::with_open(&[1]).to_frame().unwrap()).unwrap();
    let second = serde_json::to_string(&StagePacket::with_open(&[2]).to_frame().unwrap()).unwrap();
    client.send_raw(&format!("\r\n{} {}\n", first, second)).await;

    assert!(wait_until(|| engine.snapshot().solenoid_state[2]).await);
    assert!(!engine.snapshot().solenoid_state[1]);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_client_replaces_previous() {
    let mut config = test_config();
    config.nodes = vec!["6:igniter".parse().unwrap()];
    let simulator = CanSimulator::start(config).await.unwrap();

    let mut first = TestClient::connect(&simulator).await;
    let mut second = TestClient::connect(&simulator).await;
    assert_eq!(simulator.bridge().current_peer(), Some(second.local_addr));

    // The old connection still dispatches; the reply goes to the new one
    first.send(&BusFrame::empty(PING_ID)).await;
    let pong = second.next_frame(PONG_ID, WAIT).await.expect("pong not delivered to current client");
    assert_eq!(PongPacket::from_frame(&pong).unwrap().node_id, 6);
    assert!(first.next_frame(PONG_ID, Duration::from_millis(200)).await.is_none());

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_input_only_drops_that_client() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();

    let mut bad = TestClient::connect(&simulator).await;
    bad.send_raw("this is not a frame\n").await;
    assert!(bad.closed_by_server(WAIT).await);
    assert!(wait_until(|| !simulator.bridge().has_client()).await);

    let mut oversized = TestClient::connect(&simulator).await;
    oversized
        .send_raw(r#"{"ArbitrationID":0,"DLC":9,"Data":[1,0,0,0,0,0,0,0]}"#)
        .await;
    oversized.send_raw("\n").await;
    assert!(oversized.closed_by_server(WAIT).await);

    let mut good = TestClient::connect(&simulator).await;
    good.send(&PowerPacket { system_powered: true, siren: false }.to_frame().unwrap()).await;
    let engine = simulator.engine();
    assert!(wait_until(|| engine.snapshot().power).await);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_incomplete_frame_drops_client() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    // An object that never closes cannot be buffered forever
    client.send_raw(&format!("{{\"{}", "x".repeat(4096))).await;
    assert!(client.closed_by_server(WAIT).await);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_whitespace_between_frames_is_ignored() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    client.send_raw(&" \r\n".repeat(2048)).await;
    client.send(&PowerPacket { system_powered: true, siren: false }.to_frame().unwrap()).await;

    let engine = simulator.engine();
    assert!(wait_until(|| engine.snapshot().power).await);
    assert_eq!(simulator.bridge().current_peer(), Some(client.local_addr));

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pretty_printed_frame_is_dispatched() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    client
        .send_raw("{\r\n  \"ArbitrationID\": 0,\r\n  \"DLC\": 1,\r\n  \"Data\": [3,0,0,0,0,0,0,0]\r\n}\r\n")
        .await;

    let engine = simulator.engine();
    assert!(wait_until(|| {
        let snapshot = engine.snapshot();
        snapshot.power && snapshot.siren
    })
    .await);
    assert_eq!(simulator.bridge().current_peer(), Some(client.local_addr));

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_split_across_writes_is_dispatched() {
    let mut config = test_config();
    config.command_timeout = Duration::from_secs(5);
    let simulator = CanSimulator::start(config).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    let json = serde_json::to_string(&StagePacket::with_open(&[7]).to_frame().unwrap()).unwrap();
    let (head, tail) = json.split_at(json.len() / 2);
    client.send_raw(head).await;
    client.writer.flush().await.unwrap();
    time::sleep(Duration::from_millis(50)).await;

    let engine = simulator.engine();
    assert!(!engine.snapshot().solenoid_state[7]);
    client.send_raw(&format!("{}\r\n", tail)).await;
    assert!(wait_until(|| engine.snapshot().solenoid_state[7]).await);

    simulator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_current_client() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let mut client = TestClient::connect(&simulator).await;

    simulator.shutdown().await;
    assert!(client.closed_by_server(WAIT).await);
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let simulator = CanSimulator::start(test_config()).await.unwrap();
    let taken = simulator.local_addr();

    let config = SimConfig {
        bind_host: taken.ip().to_string(),
        port: taken.port(),
        ..SimConfig::default()
    };
    assert!(CanSimulator::start(config).await.is_err());

    simulator.shutdown().await;
}
