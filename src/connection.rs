//! Device-protocol connection engine.
//!
//! One `serve` task per accepted socket. The reader drains complete packets
//! from the receive buffer and dispatches them; a queue task serializes
//! outbound commands (one ack-requiring command on the wire at a time); a
//! drive task turns the stream of manual-direction requests into drive
//! packets with an idle auto-stop. Every suspension point also watches the
//! connection's cancel flag, so closing the socket unblocks everything at
//! once and no task leaks.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::commands::{CommandError, Direction, QueueEntry, TransitCommand};
use crate::framing::FrameReader;
use crate::protocol::{self, Identify, Packet, PacketCodec, PacketKind, Session};
use crate::registry::{Device, DeviceRegistry};

/// Manual driving auto-stops this long after the last direction request, so a
/// robot never keeps moving after its client goes silent.
pub const DRIVE_IDLE_TIMEOUT: Duration = Duration::from_millis(2200);

const READ_CHUNK: usize = 64 * 1024;
const DRIVE_CHANNEL_DEPTH: usize = 16;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation signal checked at every suspension point of a connection.
#[derive(Clone)]
struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn trip(&self) {
        let _ = self.tx.send(true);
    }

    fn is_tripped(&self) -> bool {
        *self.tx.borrow()
    }

    async fn tripped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    /// Sequence id of the single ack-requiring command on the wire, if any.
    outstanding: Option<u32>,
}

struct ConnShared {
    id: u64,
    cancel: CancelFlag,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    queue: Mutex<QueueState>,
    queue_wake: Notify,
    ack_wake: Notify,
    /// Latest reported work-state code; waiters re-check on every report.
    work_state: watch::Sender<String>,
    drive_tx: mpsc::Sender<Direction>,
    session: Mutex<Option<Session>>,
    identified: AtomicBool,
    next_sequence: AtomicU32,
    drive_tag: AtomicU32,
}

impl ConnShared {
    fn next_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send(&self, packet: &Packet) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet.encode()).await
    }
}

/// Cheap handle held by the `Device`; enqueues commands and closes the
/// connection it belongs to.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnShared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn close(&self) {
        self.shared.cancel.trip();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_tripped()
    }

    /// Accept a validated entry. Drive requests go to the drive loop;
    /// everything else joins the FIFO.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<(), CommandError> {
        if !self.shared.identified.load(Ordering::Acquire) {
            return Err(CommandError::NotIdentified);
        }
        if self.shared.cancel.is_tripped() {
            return Err(CommandError::NotConnected);
        }
        match entry {
            QueueEntry::Drive { direction } => {
                if self.shared.drive_tx.try_send(direction).is_err() {
                    debug!(conn = self.shared.id, "drive channel full, request dropped");
                }
                Ok(())
            }
            other => {
                self.shared.queue.lock().pending.push_back(other);
                self.shared.queue_wake.notify_one();
                Ok(())
            }
        }
    }
}

/// Drive one accepted device socket until it closes, the peer vanishes, or
/// `shutdown` flips. Spawned by the server, and directly usable from tests.
pub async fn serve(
    stream: TcpStream,
    registry: Arc<DeviceRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!(%err, "rejecting socket without a peer address");
            return;
        }
    };
    let (read_half, write_half) = stream.into_split();
    let (drive_tx, drive_rx) = mpsc::channel(DRIVE_CHANNEL_DEPTH);

    let shared = Arc::new(ConnShared {
        id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        cancel: CancelFlag::new(),
        writer: tokio::sync::Mutex::new(write_half),
        queue: Mutex::new(QueueState::default()),
        queue_wake: Notify::new(),
        ack_wake: Notify::new(),
        work_state: watch::channel(String::new()).0,
        drive_tx,
        session: Mutex::new(None),
        identified: AtomicBool::new(false),
        next_sequence: AtomicU32::new(1),
        drive_tag: AtomicU32::new(0),
    });
    info!(conn = shared.id, %peer, "robot connected");

    let queue_task = tokio::spawn(queue_loop(shared.clone()));
    let drive_task = tokio::spawn(drive_loop(shared.clone(), drive_rx));

    let mut conn = DeviceConnection {
        registry,
        shared: shared.clone(),
        reader: read_half,
        frames: FrameReader::new(PacketCodec),
        device: None,
    };

    tokio::select! {
        reason = conn.read_loop() => {
            info!(conn = shared.id, %peer, %reason, "connection closing");
        }
        _ = shutdown.changed() => {
            info!(conn = shared.id, %peer, "connection closing: server shutdown");
        }
    }

    // Unblock every suspended wait, then detach so stale telemetry is never
    // served for a disconnected robot.
    shared.cancel.trip();
    if let Some(device) = conn.device.take() {
        device.detach(shared.id);
    }
    let _ = queue_task.await;
    let _ = drive_task.await;
    if let Ok(mut writer) = shared.writer.try_lock() {
        let _ = writer.shutdown().await;
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    ReadFailed,
    WriteFailed,
    ProtocolViolation,
    Cancelled,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

struct DeviceConnection {
    registry: Arc<DeviceRegistry>,
    shared: Arc<ConnShared>,
    reader: OwnedReadHalf,
    frames: FrameReader<PacketCodec>,
    device: Option<Arc<Device>>,
}

impl DeviceConnection {
    async fn read_loop(&mut self) -> CloseReason {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let cancel = self.shared.cancel.clone();
            let read = tokio::select! {
                _ = cancel.tripped() => return CloseReason::Cancelled,
                read = self.reader.read(&mut chunk) => read,
            };
            let received = match read {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(err) => {
                    warn!(conn = self.shared.id, %err, "socket read failed");
                    return CloseReason::ReadFailed;
                }
            };
            let packets = match self.frames.push(&chunk[..received]) {
                Ok(packets) => packets,
                Err(err) => {
                    warn!(conn = self.shared.id, %err, "framing error");
                    return CloseReason::ProtocolViolation;
                }
            };
            for packet in packets {
                if let Err(reason) = self.handle_packet(packet).await {
                    return reason;
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), CloseReason> {
        let sequence = packet.header.sequence;
        match packet.kind() {
            PacketKind::Ping => {
                debug!(conn = self.shared.id, "heartbeat");
                self.reply(&protocol::pong(sequence)).await
            }

            PacketKind::Identify => self.handle_identify(&packet).await,

            PacketKind::Status => {
                self.reply(&protocol::ok_ack(sequence)).await?;
                self.handle_report(&packet, true);
                Ok(())
            }

            PacketKind::CommandAck => {
                self.handle_ack(&packet);
                Ok(())
            }

            PacketKind::Map => {
                debug!(conn = self.shared.id, "map telemetry");
                self.handle_report(&packet, false);
                Ok(())
            }

            PacketKind::Error => {
                match packet.payload_json() {
                    Ok(body) => warn!(conn = self.shared.id, %body, "robot reported an error"),
                    Err(_) => warn!(conn = self.shared.id, "robot reported an unparsable error"),
                }
                // The pending queue is deliberately left untouched.
                self.reply(&protocol::ok_ack(sequence)).await
            }

            PacketKind::Unknown => {
                let header = format!(
                    "type={:#010x} sub={:#010x} flags={:#06x}",
                    packet.header.packet_type, packet.header.sub_type, packet.header.flags
                );
                info!(
                    conn = self.shared.id,
                    header = %header,
                    payload_len = packet.payload.len(),
                    "unrecognized packet"
                );
                Ok(())
            }
        }
    }

    async fn reply(&self, packet: &Packet) -> Result<(), CloseReason> {
        self.shared.send(packet).await.map_err(|err| {
            warn!(conn = self.shared.id, %err, "socket write failed");
            CloseReason::WriteFailed
        })
    }

    async fn handle_identify(&mut self, packet: &Packet) -> Result<(), CloseReason> {
        if self.shared.identified.load(Ordering::Acquire) {
            warn!(conn = self.shared.id, "repeated identification ignored");
            return Ok(());
        }
        let identify = match Identify::parse(&packet.payload) {
            Ok(identify) => identify,
            Err(err) => {
                warn!(conn = self.shared.id, %err, "malformed identify payload");
                return Ok(());
            }
        };

        *self.shared.session.lock() = Some(identify.session());
        self.shared.identified.store(true, Ordering::Release);

        let device = self.registry.get_or_create(&identify.device_id);
        device.attach(ConnectionHandle {
            shared: self.shared.clone(),
        });
        self.device = Some(device);

        info!(
            conn = self.shared.id,
            device = %identify.device_id,
            ip = %identify.device_ip,
            "robot identified"
        );
        let now = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        self.reply(&protocol::login_ok(packet.header.sequence, &now)).await
    }

    /// Status and map payloads: update the work-state watch, merge telemetry
    /// into the device, and (for status only) run the battery guard.
    fn handle_report(&mut self, packet: &Packet, status: bool) {
        let body = match packet.payload_json() {
            Ok(body) => body,
            Err(err) => {
                warn!(conn = self.shared.id, %err, "malformed report payload dropped");
                return;
            }
        };
        let Some(value) = body.get("value").and_then(|v| v.as_object()) else {
            debug!(conn = self.shared.id, "report without a value object");
            return;
        };

        if let Some(state) = value.get("workState").and_then(|v| v.as_str()) {
            // Every report re-wakes wait-for-state entries, changed or not.
            self.shared.work_state.send_replace(state.to_string());
        }

        if let Some(device) = &self.device {
            if status {
                if device.apply_status(value) {
                    device.start_recovery();
                }
            } else {
                device.merge_telemetry(value);
            }
        }
    }

    fn handle_ack(&mut self, packet: &Packet) {
        let sequence = packet.header.sequence;
        let matched = {
            let mut queue = self.shared.queue.lock();
            match queue.outstanding {
                Some(expected) if expected == sequence => {
                    queue.outstanding = None;
                    true
                }
                Some(expected) => {
                    warn!(
                        conn = self.shared.id,
                        expected, got = sequence, "ack sequence mismatch ignored"
                    );
                    false
                }
                None => {
                    debug!(conn = self.shared.id, sequence, "ack with nothing outstanding");
                    false
                }
            }
        };
        if !matched {
            return;
        }

        debug!(conn = self.shared.id, sequence, "command acknowledged");
        if let Ok(body) = packet.payload_json() {
            if let Some(value) = body.get("value").and_then(|v| v.as_object()) {
                if let Some(state) = value.get("workState").and_then(|v| v.as_str()) {
                    self.shared.work_state.send_replace(state.to_string());
                }
                if let Some(device) = &self.device {
                    device.merge_telemetry(value);
                }
            }
        }
        self.shared.ack_wake.notify_one();
    }
}

/// Sends queued commands in FIFO order; only one ack-requiring command is
/// ever on the wire, and wait entries suspend progress without blocking
/// anything outside this connection.
async fn queue_loop(shared: Arc<ConnShared>) {
    loop {
        let entry = loop {
            if shared.cancel.is_tripped() {
                return;
            }
            if let Some(entry) = shared.queue.lock().pending.pop_front() {
                break entry;
            }
            tokio::select! {
                _ = shared.queue_wake.notified() => {}
                _ = shared.cancel.tripped() => return,
            }
        };

        match entry {
            QueueEntry::Wait { seconds } => {
                debug!(conn = shared.id, seconds, "queue waiting");
                tokio::select! {
                    _ = sleep(Duration::from_secs(seconds)) => {}
                    _ = shared.cancel.tripped() => return,
                }
            }

            QueueEntry::WaitForState { target } => {
                debug!(conn = shared.id, ?target, "queue waiting for state");
                let mut states = shared.work_state.subscribe();
                loop {
                    let current = states.borrow().clone();
                    if target.matches(&current) {
                        break;
                    }
                    tokio::select! {
                        changed = states.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = shared.cancel.tripped() => return,
                    }
                }
            }

            QueueEntry::Transit(cmd) => {
                if send_transit(&shared, &cmd).await.is_err() {
                    shared.cancel.trip();
                    return;
                }
                if cmd.needs_ack {
                    loop {
                        if shared.queue.lock().outstanding.is_none() {
                            break;
                        }
                        tokio::select! {
                            _ = shared.ack_wake.notified() => {}
                            _ = shared.cancel.tripped() => return,
                        }
                    }
                }
            }

            // Normally routed straight to the drive loop at enqueue time.
            QueueEntry::Drive { direction } => {
                let _ = shared.drive_tx.try_send(direction);
            }
        }
    }
}

async fn send_transit(shared: &ConnShared, cmd: &TransitCommand) -> io::Result<()> {
    let session = shared.session.lock().clone();
    let Some(session) = session else {
        // Unreachable once identified; entries only exist past that point.
        debug!(conn = shared.id, command = cmd.name, "dropping command without session");
        return Ok(());
    };
    let sequence = shared.next_sequence();
    if cmd.needs_ack {
        shared.queue.lock().outstanding = Some(sequence);
    }
    debug!(conn = shared.id, command = cmd.name, sequence, "sending command");
    shared.send(&protocol::command(sequence, &session, cmd)).await
}

/// Reacts to the continuous stream of direction requests. Re-sends only when
/// the requested direction changes; a change while moving sends an explicit
/// stop first; silence stops the robot.
async fn drive_loop(shared: Arc<ConnShared>, mut requests: mpsc::Receiver<Direction>) {
    let mut current = Direction::Stop;
    loop {
        let request = if current == Direction::Stop {
            tokio::select! {
                _ = shared.cancel.tripped() => return,
                request = requests.recv() => match request {
                    Some(direction) => direction,
                    None => return,
                },
            }
        } else {
            tokio::select! {
                _ = shared.cancel.tripped() => return,
                request = requests.recv() => match request {
                    Some(direction) => direction,
                    None => return,
                },
                _ = sleep(DRIVE_IDLE_TIMEOUT) => {
                    debug!(conn = shared.id, "manual drive idle, stopping");
                    if send_drive(&shared, Direction::Stop).await.is_err() {
                        shared.cancel.trip();
                        return;
                    }
                    current = Direction::Stop;
                    continue;
                }
            }
        };

        if request == current {
            continue;
        }
        if current != Direction::Stop {
            if send_drive(&shared, Direction::Stop).await.is_err() {
                shared.cancel.trip();
                return;
            }
        }
        if request != Direction::Stop {
            if send_drive(&shared, request).await.is_err() {
                shared.cancel.trip();
                return;
            }
        }
        current = request;
    }
}

/// Drive packets bypass the ack slot; their acknowledgements arrive with
/// unmatched sequence ids and are ignored by design of the correlation rule.
async fn send_drive(shared: &ConnShared, direction: Direction) -> io::Result<()> {
    let session = shared.session.lock().clone();
    let Some(session) = session else {
        return Ok(());
    };
    let tag = shared.drive_tag.fetch_add(1, Ordering::Relaxed) + 1;
    let cmd = TransitCommand {
        name: "manual",
        code: 108,
        prefix: Some(("direction", direction.code().to_string())),
        suffix: Some(("tag", tag.to_string())),
        needs_ack: false,
    };
    let sequence = shared.next_sequence();
    debug!(conn = shared.id, direction = direction.code(), "sending drive command");
    shared.send(&protocol::command(sequence, &session, &cmd)).await
}
