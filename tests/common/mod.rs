//! Shared harness: an in-process server on an ephemeral port plus a scripted
//! fake robot speaking the binary protocol over a real socket.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use vacbus::connection;
use vacbus::framing::FrameReader;
use vacbus::protocol::{
    Packet, PacketCodec, SUB_COMMAND, SUB_REPORT, TYPE_COMMAND, TYPE_COMMAND_ACK, TYPE_IDENTIFY,
    TYPE_LOGIN_OK, TYPE_STATUS,
};
use vacbus::DeviceRegistry;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<DeviceRegistry>,
    pub shutdown: watch::Sender<bool>,
    _config_dir: tempfile::TempDir,
}

pub async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config_dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(DeviceRegistry::new(config_dir.path()));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let accept_registry = registry.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(connection::serve(
                stream,
                accept_registry.clone(),
                shutdown_rx.clone(),
            ));
        }
    });

    TestServer {
        addr,
        registry,
        shutdown,
        _config_dir: config_dir,
    }
}

/// Poll a condition until it holds or the harness gives up.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached before the polling window elapsed");
}

pub struct FakeRobot {
    pub device_id: String,
    stream: TcpStream,
    frames: FrameReader<PacketCodec>,
    pending: VecDeque<Packet>,
    sequence: u32,
}

impl FakeRobot {
    pub async fn connect(server: &TestServer, device_id: &str) -> Self {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        Self {
            device_id: device_id.to_string(),
            stream,
            frames: FrameReader::new(PacketCodec),
            pending: VecDeque::new(),
            sequence: 1,
        }
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.sequence += 1;
        self.sequence
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.stream.write_all(&packet.encode()).await.unwrap();
    }

    /// Send the identify payload and wait for the login-succeeded reply; once
    /// it arrives the registry attachment is visible.
    pub async fn identify(&mut self, server: &TestServer) {
        let sequence = self.next_sequence();
        let body = json!({
            "version": "1.0",
            "control": {"targetId": "0", "targetType": "6", "broadcast": "0"},
            "value": {
                "token": "tok-tok",
                "deviceId": self.device_id,
                "appKey": "app-key",
                "deviceType": "1",
                "authCode": "auth-1",
                "deviceIp": "192.168.18.14",
                "devicePort": "8888",
            }
        });
        self.send(&Packet::new(
            TYPE_IDENTIFY,
            SUB_REPORT,
            sequence,
            0x00,
            body.to_string(),
        ))
        .await;

        loop {
            let packet = self.read_packet().await;
            if packet.header.packet_type == TYPE_LOGIN_OK {
                assert_eq!(packet.header.sequence, sequence);
                break;
            }
        }
        let device_id = self.device_id.clone();
        let registry = server.registry.clone();
        wait_until(move || {
            registry
                .get(&device_id)
                .map(|device| device.is_connected())
                .unwrap_or(false)
        })
        .await;
    }

    pub async fn send_status(&mut self, work_state: &str, battery: &str) {
        let sequence = self.next_sequence();
        let body = json!({
            "version": "1.0",
            "control": {"targetId": "0", "targetType": "6", "broadcast": "0"},
            "value": {
                "noteCmd": "102",
                "workState": work_state,
                "battery": battery,
                "fan": "1",
                "waterTank": "40",
            }
        });
        self.send(&Packet::new(
            TYPE_STATUS,
            SUB_REPORT,
            sequence,
            0x00,
            body.to_string(),
        ))
        .await;
    }

    /// Acknowledge a command, echoing its sequence id, with a telemetry body
    /// reporting the given work state.
    pub async fn ack(&mut self, sequence: u32, work_state: &str) {
        let body = json!({
            "version": "1.0",
            "value": {"noteCmd": "102", "workState": work_state}
        });
        self.send(&Packet::new(
            TYPE_COMMAND_ACK,
            SUB_REPORT,
            sequence,
            0x00,
            body.to_string(),
        ))
        .await;
    }

    /// Next complete packet from the server, whatever its kind.
    pub async fn read_packet(&mut self) -> Packet {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return packet;
            }
            let mut chunk = vec![0u8; 16 * 1024];
            let received = timeout(READ_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a packet")
                .expect("socket read failed");
            assert_ne!(received, 0, "server closed the connection unexpectedly");
            self.pending
                .extend(self.frames.push(&chunk[..received]).unwrap());
        }
    }

    /// Read until the next outbound command envelope, skipping acks and other
    /// replies. Returns (sequence, transitCmd, value object).
    pub async fn expect_command(&mut self) -> (u32, String, Value) {
        loop {
            let packet = self.read_packet().await;
            if packet.header.packet_type != TYPE_COMMAND
                || packet.header.sub_type != SUB_COMMAND
            {
                continue;
            }
            let body: Value = serde_json::from_slice(&packet.payload).unwrap();
            let code = body["value"]["transitCmd"].as_str().unwrap().to_string();
            return (packet.header.sequence, code, body["value"].clone());
        }
    }

    /// Assert that no command envelope shows up within the window.
    pub async fn expect_no_command(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            // Drain buffered packets first.
            while let Some(packet) = self.pending.pop_front() {
                assert_ne!(
                    (packet.header.packet_type, packet.header.sub_type),
                    (TYPE_COMMAND, SUB_COMMAND),
                    "unexpected command envelope"
                );
            }
            let mut chunk = vec![0u8; 16 * 1024];
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Err(_) => return,
                Ok(read) => {
                    let received = read.expect("socket read failed");
                    assert_ne!(received, 0, "server closed the connection unexpectedly");
                    self.pending
                        .extend(self.frames.push(&chunk[..received]).unwrap());
                }
            }
        }
    }

    /// True when the server has closed this socket.
    pub async fn closed_by_server(&mut self) -> bool {
        let mut chunk = vec![0u8; 1024];
        loop {
            match timeout(READ_TIMEOUT, self.stream.read(&mut chunk)).await {
                Err(_) => return false,
                Ok(Ok(0)) => return true,
                Ok(Ok(received)) => {
                    self.pending
                        .extend(self.frames.push(&chunk[..received]).unwrap());
                }
                Ok(Err(_)) => return true,
            }
        }
    }
}

/// Convenience params builder for registry commands.
pub fn params(pairs: &[(&str, &str)]) -> std::collections::HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
