use clap::{App, Arg};
use colored::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::interval;

use vacbus::framing::FrameReader;
use vacbus::protocol::{
    Packet, PacketCodec, DEVICE_PORT, FLAGS_PING, SUB_COMMAND, SUB_PING, SUB_REPORT, TYPE_COMMAND,
    TYPE_COMMAND_ACK, TYPE_IDENTIFY, TYPE_MAP, TYPE_PING, TYPE_STATUS,
};

const SAMPLE_MAP: &str = "AAAAAAAAZABk0vwAaoDXAGpA1wBqgNcAqNL8AA==";
const SAMPLE_TRACK: &str = "AQAEADIxMzExMTEy";

const STATUS_PERIOD_S: u32 = 5;
const HEARTBEAT_PERIOD_S: u32 = 15;
const MAP_PERIOD_S: u32 = 2;

/// Emulated robot state, mirroring the firmware's reported fields.
struct Robot {
    device_id: String,
    sequence: u32,
    work_state: u8,
    battery: u8,
    voice: u8,
    direction: u8,
    fan: String,
    water_tank: String,
    /// Seconds until a commanded return "arrives" at the dock.
    home_countdown: u32,
    /// Simulate a dock with bad contacts: keep slipping out of charged.
    charge_fault: bool,
}

impl Robot {
    fn new(device_id: String, charge_fault: bool) -> Self {
        Self {
            device_id,
            sequence: 1,
            work_state: 6,
            battery: 100,
            voice: 2,
            direction: 0,
            fan: "1".to_string(),
            water_tank: "40".to_string(),
            home_countdown: 0,
            charge_fault,
        }
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence += 1;
        self.sequence
    }

    fn status_body(&self) -> String {
        json!({
            "version": "1.0",
            "control": {"targetId": "0", "targetType": "6", "broadcast": "0"},
            "value": {
                "noteCmd": "102",
                "workState": self.work_state.to_string(),
                "workMode": "0",
                "fan": self.fan,
                "direction": self.direction.to_string(),
                "brush": "2",
                "battery": self.battery.to_string(),
                "voice": self.voice.to_string(),
                "error": "0",
                "standbyMode": "1",
                "waterTank": self.water_tank,
                "clearComponent": "0",
                "waterMark": "0",
                "version": "3.9.1714(513)",
                "attract": "0",
                "deviceIp": "192.168.18.14",
                "devicePort": "8888",
                "cleanGoon": "2",
            }
        })
        .to_string()
    }

    fn map_body(&self) -> String {
        json!({
            "version": "1.0",
            "control": {"targetId": "0", "targetType": "6", "broadcast": "0"},
            "value": {
                "noteCmd": "101",
                "clearArea": "0",
                "clearTime": "10",
                "clearSign": "2020-06-24-01-31-41-2",
                "clearModule": "11",
                "isFinish": "1",
                "chargerPos": "50,50",
                "map": SAMPLE_MAP,
                "track": SAMPLE_TRACK,
            }
        })
        .to_string()
    }

    fn identify_body(&self) -> String {
        json!({
            "version": "1.0",
            "control": {"targetId": "0", "targetType": "6", "broadcast": "0"},
            "value": {
                "token": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "deviceId": self.device_id,
                "appKey": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx",
                "deviceType": "1",
                "authCode": "zzzzz",
                "deviceIp": "192.168.18.14",
                "devicePort": "8888",
            }
        })
        .to_string()
    }

    /// One 5-second battery step; returns true when a status should be sent.
    fn battery_step(&mut self) -> bool {
        match self.work_state {
            5 => {
                // Charging.
                self.battery = (self.battery + 1).min(100);
                if self.battery >= 100 {
                    self.work_state = 6;
                }
            }
            6 => {
                if self.charge_fault {
                    // Bad dock contacts: the charge keeps bleeding away until
                    // the firmware flips back to charging.
                    self.battery = self.battery.saturating_sub(2);
                    if self.battery <= 80 {
                        self.work_state = 5;
                    }
                }
            }
            _ => {
                self.battery = self.battery.saturating_sub(1).max(10);
            }
        }
        true
    }
}

async fn send(
    writer: &mut OwnedWriteHalf,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    writer.write_all(&packet.encode()).await?;
    Ok(())
}

fn transit_command(packet: &Packet) -> Option<(String, Value)> {
    if packet.header.packet_type != TYPE_COMMAND || packet.header.sub_type != SUB_COMMAND {
        return None;
    }
    let body: Value = serde_json::from_slice(&packet.payload).ok()?;
    let code = body["value"]["transitCmd"].as_str()?.to_string();
    Some((code, body))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vacbus-emulator")
        .version("0.1.0")
        .author("Home Automation Systems Team")
        .about("Protocol-faithful robot emulator for exercising vacbusd without hardware")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Server host")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Device protocol port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device-id")
                .short("d")
                .long("device-id")
                .value_name("ID")
                .help("Device identifier to present")
                .takes_value(true)
                .default_value("emulated-conga-0001"),
        )
        .arg(
            Arg::with_name("charge-fault")
                .long("charge-fault")
                .help("Simulate a dock with bad contacts (battery guard trigger)"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or("127.0.0.1");
    let port = matches
        .value_of("port")
        .map(|v| v.parse::<u16>())
        .transpose()?
        .unwrap_or(DEVICE_PORT);
    let device_id = matches.value_of("device-id").unwrap_or("emulated-conga-0001");

    let mut robot = Robot::new(device_id.to_string(), matches.is_present("charge-fault"));

    println!("{}", "vacbus robot emulator".bold());
    println!("Connecting to {}:{} as {}", host, port, device_id.cyan());

    let stream = TcpStream::connect((host, port)).await?;
    let (mut read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(PacketCodec);

    let sequence = robot.next_sequence();
    let identify = Packet::new(TYPE_IDENTIFY, SUB_REPORT, sequence, 0x00, robot.identify_body());
    send(&mut write_half, &identify).await?;
    println!("{}", "identification sent".green());

    let mut chunk = vec![0u8; 64 * 1024];
    let mut ticker = interval(Duration::from_secs(1));
    let mut seconds: u32 = 0;

    loop {
        tokio::select! {
            read = read_half.read(&mut chunk) => {
                let received = read?;
                if received == 0 {
                    println!("{}", "server closed the connection".red());
                    return Ok(());
                }
                for packet in frames.push(&chunk[..received])? {
                    handle_packet(&mut robot, &mut write_half, &packet).await?;
                }
            }

            _ = ticker.tick() => {
                seconds = seconds.wrapping_add(1);
                tick(&mut robot, &mut write_half, seconds).await?;
            }
        }
    }
}

async fn tick(
    robot: &mut Robot,
    writer: &mut OwnedWriteHalf,
    seconds: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if robot.home_countdown > 0 {
        robot.home_countdown -= 1;
        if robot.home_countdown == 0 {
            robot.work_state = 5;
            robot.battery = robot.battery.min(80);
            println!("{}", "arrived at the dock".green());
            let sequence = robot.next_sequence();
            let status = Packet::new(TYPE_STATUS, SUB_REPORT, sequence, 0x00, robot.status_body());
            send(writer, &status).await?;
        }
    }

    if seconds % STATUS_PERIOD_S == 0 && robot.battery_step() {
        let sequence = robot.next_sequence();
        let status = Packet::new(TYPE_STATUS, SUB_REPORT, sequence, 0x00, robot.status_body());
        send(writer, &status).await?;
        println!(
            "status: workState={} battery={}%",
            robot.work_state.to_string().yellow(),
            robot.battery
        );
    }

    if seconds % HEARTBEAT_PERIOD_S == 0 {
        let sequence = robot.next_sequence();
        send(writer, &Packet::bare(TYPE_PING, SUB_PING, sequence, FLAGS_PING)).await?;
    }

    if robot.work_state == 1 && seconds % MAP_PERIOD_S == 0 {
        let sequence = robot.next_sequence();
        let map = Packet::new(TYPE_MAP, SUB_REPORT, sequence, 0x00, robot.map_body());
        send(writer, &map).await?;
    }

    Ok(())
}

async fn handle_packet(
    robot: &mut Robot,
    writer: &mut OwnedWriteHalf,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some((code, body)) = transit_command(packet) else {
        // Pong, login reply, status acks: nothing to do.
        return Ok(());
    };

    let mut needs_ack = true;
    match code.as_str() {
        "100" => {
            println!("{}", "command: clean".bold().green());
            robot.work_state = 1;
        }
        "102" => {
            println!("{}", "command: stop".bold());
            robot.work_state = 2;
        }
        "104" => {
            println!("{}", "command: return to base".bold().green());
            robot.work_state = 4;
            robot.home_countdown = 3;
        }
        "123" => {
            println!("command: sound on");
            robot.voice = 2;
        }
        "125" => {
            println!("command: sound off");
            robot.voice = 1;
        }
        "110" => {
            if let Some(fan) = body["value"]["fan"].as_str() {
                println!("command: fan={}", fan.cyan());
                robot.fan = fan.to_string();
            }
        }
        "145" => {
            if let Some(water) = body["value"]["waterTank"].as_str() {
                println!("command: waterTank={}", water.cyan());
                robot.water_tank = water.to_string();
            }
        }
        "106" => {
            if let Some(mode) = body["value"]["mode"].as_str() {
                println!("command: mode={}", mode.cyan());
            }
        }
        "131" => {
            println!("command: send map");
            let sequence = robot.next_sequence();
            let map = Packet::new(TYPE_MAP, SUB_REPORT, sequence, 0x00, robot.map_body());
            send(writer, &map).await?;
        }
        "108" => {
            if let Some(direction) = body["value"]["direction"].as_str() {
                println!("command: direction={}", direction.cyan());
                robot.direction = direction.parse().unwrap_or(0).min(4);
            }
        }
        "98" => {
            println!("command: ask status");
            needs_ack = false;
            let sequence = robot.next_sequence();
            let status = Packet::new(TYPE_STATUS, SUB_REPORT, sequence, 0x00, robot.status_body());
            send(writer, &status).await?;
        }
        "400" => {
            println!("command: notify connection");
            needs_ack = false;
        }
        other => {
            println!("{} {}", "unknown command".red(), other);
        }
    }

    if needs_ack {
        let ack = Packet::new(
            TYPE_COMMAND_ACK,
            SUB_REPORT,
            packet.header.sequence,
            0x00,
            robot.status_body(),
        );
        send(writer, &ack).await?;
    }
    Ok(())
}
