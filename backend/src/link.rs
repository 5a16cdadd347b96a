use crate::codec::{DecodedMessage, MavlinkCodec, MessageCodec};
use crate::config::LinkConfig;
use crate::db::now_ms;
use crate::error::{CodecError, LinkError};
use crate::mission::event::MISSION_PREFIX;
use crate::mission::{InboundMessage, OutboundMessage};
use gcs_shared::{OutgoingMessage, TelemetryMessage};
use mavlink::error::MessageReadError;
use mavlink::peek_reader::PeekReader;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

pub const LINK_READ_TIMEOUT: Duration = Duration::from_millis(50);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const READ_BUF_SIZE: usize = 2048;

const MAV_TYPE_GCS: u8 = 6;
const MAV_AUTOPILOT_INVALID: u8 = 8;
const MAV_STATE_ACTIVE: u8 = 4;

// ======================================================================
//  Link Device Trait
// ======================================================================
pub trait LinkDevice: Send {
    /// Returns 0 when nothing arrived within the read timeout.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ======================================================================
//  Serial
// ======================================================================
pub struct SerialLink {
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, LinkError> {
        let inner = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(LINK_READ_TIMEOUT)
            .open()?;
        Ok(Self { inner })
    }
}

impl LinkDevice for SerialLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.inner.write_all(bytes)?;
        self.inner.flush()?;
        Ok(())
    }
}

// ======================================================================
//  UDP
// ======================================================================
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    /// Listens on `port` and sends to `host:port` until a vehicle talks to us.
    pub fn open(host: &str, port: u16) -> Result<Self, LinkError> {
        let peer = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(LinkError::Disconnected)?;
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(LINK_READ_TIMEOUT))?;
        Ok(Self { socket, peer })
    }

}

impl LinkDevice for UdpLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => {
                if addr != self.peer {
                    tracing::info!("UDP peer is now {addr}");
                    self.peer = addr;
                }
                Ok(n)
            }
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.socket.send_to(bytes, self.peer)?;
        Ok(())
    }
}

// ======================================================================
//  TCP
// ======================================================================
pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn open(host: &str, port: u16) -> Result<Self, LinkError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(LINK_READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl LinkDevice for TcpLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.stream.read(buf) {
            Ok(0) => Err(LinkError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }
}

// ======================================================================
//  Dummy Link (fallback when hardware missing)
// ======================================================================
#[cfg(feature = "testing")]
#[derive(Debug, Default)]
pub struct DummyLink {
    name: String,
}

#[cfg(feature = "testing")]
impl DummyLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[cfg(feature = "testing")]
impl LinkDevice for DummyLink {
    fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, LinkError> {
        // Nothing ever arrives
        std::thread::sleep(LINK_READ_TIMEOUT);
        Ok(0)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        tracing::debug!(
            "{}: dropping {} bytes of outgoing MAVLink (no vehicle connected)",
            self.name,
            bytes.len()
        );
        Ok(())
    }
}

pub fn open_link(config: &LinkConfig) -> Result<Box<dyn LinkDevice>, LinkError> {
    let device: Box<dyn LinkDevice> = match config {
        LinkConfig::Udp { host, port } => Box::new(UdpLink::open(host, *port)?),
        LinkConfig::Tcp { host, port } => Box::new(TcpLink::open(host, *port)?),
        LinkConfig::Serial { path, baud } => Box::new(SerialLink::open(path, *baud)?),
    };
    Ok(device)
}

/// `Read` over a link device for the MAVLink stream parser.
///
/// Only whole requests are handed out. A quiet link reports `TimedOut` and
/// keeps the bytes that did arrive, so a frame spread over several reads is
/// never cut.
struct DeviceReader {
    device: Box<dyn LinkDevice>,
    pending: VecDeque<u8>,
    scratch: Vec<u8>,
}

impl DeviceReader {
    fn new(device: Box<dyn LinkDevice>) -> Self {
        Self {
            device,
            pending: VecDeque::new(),
            scratch: vec![0; READ_BUF_SIZE],
        }
    }
}

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.len() < buf.len() {
            match self.device.recv(&mut self.scratch) {
                Ok(0) => return Err(io::ErrorKind::TimedOut.into()),
                Ok(n) => self.pending.extend(&self.scratch[..n]),
                Err(LinkError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        let len = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }
}

// ======================================================================
//  Link worker
// ======================================================================

/// Blocking side of a vehicle link: owns the device, the codec and the
/// heartbeat. Every decoded frame is relayed as telemetry; mission traffic
/// also goes to the mission task.
pub struct LinkWorker {
    pub label: String,
    pub codec: MavlinkCodec,
    pub system_id: u8,
    pub component_id: u8,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub outbound_rx: mpsc::Receiver<OutboundMessage>,
    /// Operator-composed messages
    pub message_rx: mpsc::Receiver<OutgoingMessage>,
    pub telemetry_tx: broadcast::Sender<TelemetryMessage>,
    pub shutdown_rx: broadcast::Receiver<()>,
}

enum PumpExit {
    /// Device failed; reopen after the backoff.
    Reconnect,
    /// Shutdown signalled or the mission task went away.
    Stop,
}

impl LinkWorker {
    /// Runs until shutdown, reopening the device through `open` after failures.
    pub fn run<F>(mut self, mut open: F)
    where
        F: FnMut() -> Result<Box<dyn LinkDevice>, LinkError>,
    {
        loop {
            if self.shutdown_requested() {
                break;
            }

            let device = match open() {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!("{}: open failed: {e}", self.label);
                    if self.wait_or_shutdown(RECONNECT_BACKOFF) {
                        break;
                    }
                    continue;
                }
            };
            tracing::info!("{}: link online", self.label);

            match self.pump(device) {
                PumpExit::Stop => break,
                PumpExit::Reconnect => {
                    if self.wait_or_shutdown(RECONNECT_BACKOFF) {
                        break;
                    }
                }
            }
        }
        tracing::info!("{}: link worker stopped", self.label);
    }

    fn pump(&mut self, device: Box<dyn LinkDevice>) -> PumpExit {
        let mut reader = PeekReader::new(DeviceReader::new(device));
        let mut last_heartbeat: Option<Instant> = None;

        loop {
            if self.shutdown_requested() {
                return PumpExit::Stop;
            }

            let device = reader.reader_mut().device.as_mut();
            if let Some(exit) = self.flush_outgoing(device) {
                return exit;
            }

            if last_heartbeat.is_none_or(|t| t.elapsed() >= HEARTBEAT_INTERVAL) {
                last_heartbeat = Some(Instant::now());
                if let Err(e) = self.send_heartbeat(device) {
                    tracing::warn!("{}: heartbeat failed: {e}", self.label);
                    return PumpExit::Reconnect;
                }
            }

            match self.codec.read_message(&mut reader) {
                Ok(msg) => {
                    if !self.forward(msg) {
                        return PumpExit::Stop;
                    }
                }
                Err(MessageReadError::Io(e)) if is_timeout(&e) => {}
                Err(MessageReadError::Io(e)) => {
                    tracing::warn!("{}: receive failed: {e}", self.label);
                    return PumpExit::Reconnect;
                }
                Err(e) => {
                    tracing::debug!("{}: dropping frame: {}", self.label, CodecError::from(e));
                }
            }
        }
    }

    /// Writes queued mission and operator messages.
    fn flush_outgoing(&mut self, device: &mut dyn LinkDevice) -> Option<PumpExit> {
        loop {
            match self.outbound_rx.try_recv() {
                Ok(out) => {
                    if let Some(exit) = self.send_or_exit(device, out.name(), &out.fields()) {
                        return Some(exit);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return Some(PumpExit::Stop),
            }
        }

        while let Ok(msg) = self.message_rx.try_recv() {
            if let Some(exit) = self.send_or_exit(device, &msg.name, &msg.fields) {
                return Some(exit);
            }
        }
        None
    }

    fn send_or_exit(
        &mut self,
        device: &mut dyn LinkDevice,
        name: &str,
        fields: &Map<String, Value>,
    ) -> Option<PumpExit> {
        tracing::debug!("{}: -> {name}", self.label);
        match self.write(device, name, fields) {
            Ok(()) => None,
            Err(LinkError::Codec(e)) => {
                tracing::warn!("{}: not sending {name}: {e}", self.label);
                None
            }
            Err(e) => {
                tracing::warn!("{}: send failed: {e}", self.label);
                Some(PumpExit::Reconnect)
            }
        }
    }

    /// False once the mission task is gone.
    fn forward(&mut self, decoded: DecodedMessage) -> bool {
        // nobody listening is fine
        let _ = self.telemetry_tx.send(TelemetryMessage {
            timestamp_ms: now_ms(),
            link: self.label.clone(),
            name: decoded.name.clone(),
            system_id: decoded.system_id,
            component_id: decoded.component_id,
            fields: decoded.fields.clone(),
        });

        if !decoded.name.starts_with(MISSION_PREFIX) {
            return true;
        }

        let msg = InboundMessage {
            link: self.label.clone(),
            name: decoded.name,
            fields: decoded.fields,
            system_id: decoded.system_id,
            component_id: decoded.component_id,
        };
        match self.inbound_tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!("{}: mission queue full, dropping {}", self.label, msg.name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn write(
        &mut self,
        device: &mut dyn LinkDevice,
        name: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), LinkError> {
        let bytes = self
            .codec
            .encode(name, fields, self.system_id, self.component_id)?;
        device.send(&bytes)
    }

    fn send_heartbeat(&mut self, device: &mut dyn LinkDevice) -> Result<(), LinkError> {
        let fields = json!({
            "type": MAV_TYPE_GCS,
            "autopilot": MAV_AUTOPILOT_INVALID,
            "base_mode": 0,
            "custom_mode": 0,
            "system_status": MAV_STATE_ACTIVE,
            "mavlink_version": 3,
        });
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.write(device, "HEARTBEAT", &fields)
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => false,
            Ok(_)
            | Err(broadcast::error::TryRecvError::Lagged(_))
            | Err(broadcast::error::TryRecvError::Closed) => true,
        }
    }

    /// Sleeps in short steps; true if shutdown arrived meanwhile.
    fn wait_or_shutdown(&mut self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(LINK_READ_TIMEOUT);
        }
        self.shutdown_requested()
    }
}

/// Spawns the blocking link worker for `config`.
pub fn spawn_link_task(config: LinkConfig, worker: LinkWorker) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        worker.run(move || match open_link(&config) {
            Ok(device) => Ok(device),
            #[cfg(feature = "testing")]
            Err(e) => {
                tracing::warn!("{} missing, using DummyLink: {e}", config.describe());
                Ok(Box::new(DummyLink::new(&config.describe())) as Box<dyn LinkDevice>)
            }
            #[cfg(not(feature = "testing"))]
            Err(e) => Err(e),
        })
    })
}
