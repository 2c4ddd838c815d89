//! Peer session management
//!
//! One [`Session`] owns the duplex channel to the peer chassis, the
//! MAC/Neighbor store, the local topology model, and the timers. The
//! nested protocol state machine that drives it lives in [`crate::fsm`].

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IccpConfig;
use crate::error::{IccpError, Result};
use crate::mac_store::MacStore;
use crate::supervisor::{MessageLog, TimerSupervisor};
use crate::system::SystemBridge;
use crate::tlv::{self, AggregateConfig, IccpMessage, PeerLinkInfo, PortChannelInfo, SystemConfig};
use crate::topology::Topology;

/// Largest frame we ever build: a full MAC batch plus headers fits
/// comfortably.
pub const MAX_FRAME: usize = 4096;

/// Externally assigned role; breaks the symmetry of who pushes first
/// during the bulk handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Active,
    Standby,
}

/// Connection-nested protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Init,
    Stage1,
    Stage2,
    Exchange,
    Error,
}

impl ProtoState {
    pub fn name(self) -> &'static str {
        match self {
            ProtoState::Init => "Init",
            ProtoState::Stage1 => "Stage1",
            ProtoState::Stage2 => "Stage2",
            ProtoState::Exchange => "Exchange",
            ProtoState::Error => "Error",
        }
    }
}

impl std::fmt::Display for ProtoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How much state a teardown clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Queues and FSM only; the MAC index survives for reconnect.
    Reconnect,
    /// Everything, including the MAC index.
    Full,
}

/// Non-blocking, message-framed duplex channel to the peer.
///
/// A send that cannot complete synchronously is a send failure
/// ([`IccpError::SendBlocked`]), not a suspension; the caller retries
/// on a later tick.
pub trait IccpTransport: Send {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
    /// Returns one complete inbound frame if available.
    fn recv_frame(&mut self) -> Result<Option<Vec<u8>>>;
    fn is_connected(&self) -> bool;
    /// Pushes out bytes the transport accepted but could not yet write.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory transport pair; each side's sends become the other side's
/// receives. Used by tests and by back-to-back simulations.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    connected: Arc<Mutex<bool>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        let connected = Arc::new(Mutex::new(true));
        (
            Self { tx: a.clone(), rx: b.clone(), connected: connected.clone() },
            Self { tx: b, rx: a, connected },
        )
    }

    /// Simulates losing the peer socket on both sides.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl IccpTransport for MemoryTransport {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(IccpError::Transport("peer socket closed".into()));
        }
        self.tx.lock().unwrap().push_back(frame.to_vec());
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.is_connected() {
            return Err(IccpError::Transport("peer socket closed".into()));
        }
        Ok(self.rx.lock().unwrap().pop_front())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

/// TCP transport over a non-blocking stream, reassembling frames from
/// the byte stream via the header length field.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    read_buf: Vec<u8>,
    /// Tail of a frame the socket only partially accepted. Must drain
    /// before any new frame goes out or the stream framing shears.
    write_buf: Vec<u8>,
    connected: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: Vec::with_capacity(2 * MAX_FRAME),
            write_buf: Vec::new(),
            connected: true,
        })
    }

    fn drain_write_buf(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    self.connected = false;
                    return Err(IccpError::Transport("peer closed the connection".into()));
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.connected = false;
                    return Err(IccpError::Transport(e.to_string()));
                }
            }
        }
        Ok(())
    }
}

impl IccpTransport for TcpTransport {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.drain_write_buf()?;
        // Refusing before the first byte keeps whole-frame retry safe.
        if !self.write_buf.is_empty() {
            return Err(IccpError::SendBlocked);
        }
        match self.stream.write(frame) {
            Ok(n) if n == frame.len() => Ok(()),
            // Short write: the accepted prefix is already on the wire,
            // so the frame is committed. Hold the tail and finish it
            // ahead of the next frame.
            Ok(n) => {
                self.write_buf.extend_from_slice(&frame[n..]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(IccpError::SendBlocked),
            Err(e) => {
                self.connected = false;
                Err(IccpError::Transport(e.to_string()))
            }
        }
    }

    fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; MAX_FRAME];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.connected = false;
                    return Err(IccpError::Transport("peer closed the connection".into()));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.connected = false;
                    return Err(IccpError::Transport(e.to_string()));
                }
            }
        }
        match tlv::frame_len(&self.read_buf) {
            Some(len) if self.read_buf.len() >= len => {
                let frame = self.read_buf.drain(..len).collect();
                Ok(Some(frame))
            }
            _ => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn flush(&mut self) -> Result<()> {
        self.drain_write_buf()
    }
}

/// Counters kept per session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub resync_requests: u64,
    pub malformed_frames: u64,
    pub resets: u64,
}

/// The peer view accumulated from received configuration TLVs.
#[derive(Debug, Default)]
pub struct PeerView {
    pub sys: Option<SystemConfig>,
    pub aggregates: HashMap<u16, AggregateConfig>,
    pub aggregate_up: HashMap<u16, bool>,
    pub port_channels: HashMap<u16, PortChannelInfo>,
    pub peer_link: Option<PeerLinkInfo>,
}

/// One peer relationship.
pub struct Session {
    pub config: IccpConfig,
    pub role: Role,
    pub node_id: u8,
    pub state: ProtoState,
    /// Cleared only by receipt of the distinguished end-of-sync marker.
    pub waiting_for_sync_data: bool,
    /// The peer asked for a push before we were ready to serve it.
    pub(crate) peer_sync_requested: bool,
    pub(crate) sys_config_dirty: bool,
    pub(crate) need_resync: bool,
    pub(crate) node_id_collision: bool,
    /// Aggregates reported up to the peer and awaiting its explicit
    /// interface-up acknowledgment.
    pub(crate) pending_if_up: HashMap<u16, String>,
    pub store: MacStore,
    pub topology: Topology,
    pub peer: PeerView,
    pub timers: TimerSupervisor,
    pub msg_log: MessageLog,
    pub stats: SessionStats,
    pub(crate) system: Box<dyn SystemBridge>,
    transport: Box<dyn IccpTransport>,
    next_msg_id: u32,
    pub(crate) next_req_id: u16,
    backlog: VecDeque<Vec<u8>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("node_id", &self.node_id)
            .field("state", &self.state)
            .field("waiting_for_sync_data", &self.waiting_for_sync_data)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Derives the node identifier from the configured local address plus
/// a random low-order component; never zero.
pub fn derive_node_id(config: &IccpConfig) -> u8 {
    let base = config.local_addr.octets()[3];
    let id = base ^ (rand::random::<u8>() & 0x0f);
    if id == 0 { 1 } else { id }
}

impl Session {
    pub fn new(
        config: IccpConfig,
        transport: Box<dyn IccpTransport>,
        system: Box<dyn SystemBridge>,
    ) -> Self {
        let node_id = derive_node_id(&config);
        info!(role = ?config.role, node_id, "session created");
        Self {
            role: config.role,
            node_id,
            state: ProtoState::Init,
            waiting_for_sync_data: false,
            peer_sync_requested: false,
            sys_config_dirty: true,
            need_resync: false,
            node_id_collision: false,
            pending_if_up: HashMap::new(),
            store: MacStore::new(config.peer_link.clone()),
            topology: Topology::new(),
            peer: PeerView::default(),
            timers: TimerSupervisor::new(config.keepalive(), config.warm_reboot_grace()),
            msg_log: MessageLog::new(),
            stats: SessionStats::default(),
            system,
            transport,
            next_msg_id: 1,
            next_req_id: 1,
            backlog: VecDeque::new(),
            config,
        }
    }

    /// The session's own system-config TLV.
    pub fn local_sys_config(&self) -> SystemConfig {
        let o = self.config.local_addr.octets();
        SystemConfig {
            node_id: self.node_id,
            sys_mac: crate::types::MacAddress::new([0x02, 0x00, o[0], o[1], o[2], o[3]]),
            priority: self.config.priority,
        }
    }

    /// Records the identifier in the message log and sends, stashing
    /// the frame for a later tick when the transport pushes back.
    pub(crate) fn send(&mut self, msg: &IccpMessage) -> Result<()> {
        let mut buf = [0u8; MAX_FRAME];
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        let n = tlv::encode(&mut buf, msg_id, msg)?;
        self.msg_log.record(msg_id, msg.kind());
        self.stats.msgs_sent += 1;
        let frame = &buf[..n];
        if !self.backlog.is_empty() {
            // Preserve ordering behind frames already waiting.
            self.backlog.push_back(frame.to_vec());
            return Ok(());
        }
        match self.transport.send_frame(frame) {
            Ok(()) => Ok(()),
            Err(IccpError::SendBlocked) => {
                self.backlog.push_back(frame.to_vec());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Retries frames a previous tick could not push out.
    pub(crate) fn flush_backlog(&mut self) -> Result<()> {
        self.transport.flush()?;
        while let Some(frame) = self.backlog.front() {
            match self.transport.send_frame(frame) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(IccpError::SendBlocked) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.transport.recv_frame()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Full local re-initialization on teardown; the nested state
    /// resets to Init. Transitions are atomic with respect to the
    /// single-threaded model, so no partial state survives.
    pub fn reset(&mut self, kind: ResetKind) {
        warn!(?kind, state = %self.state, "session reset");
        self.stats.resets += 1;
        self.state = ProtoState::Init;
        self.waiting_for_sync_data = false;
        self.peer_sync_requested = false;
        self.sys_config_dirty = true;
        self.need_resync = false;
        self.node_id_collision = false;
        self.pending_if_up.clear();
        self.peer = PeerView::default();
        self.backlog.clear();
        self.msg_log.clear();
        self.timers.reset();
        self.store.reset(kind == ResetKind::Full);
    }

    /// Replaces a torn-down transport after reconnection.
    pub fn reconnect(&mut self, transport: Box<dyn IccpTransport>) {
        self.transport = transport;
        self.timers.disarm_grace();
        self.reset(ResetKind::Reconnect);
    }

    /// Marks the local system configuration changed; the next Exchange
    /// tick re-announces it.
    pub fn announce_system_config(&mut self) {
        self.sys_config_dirty = true;
    }

    /// Deterministic collision step: decrement, wrapping past zero.
    pub(crate) fn decrement_node_id(&mut self) {
        self.node_id = if self.node_id <= 1 { u8::MAX } else { self.node_id - 1 };
        debug!(node_id = self.node_id, "node id decremented after collision");
    }

    pub(crate) fn take_req_id(&mut self) -> u16 {
        let id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1);
        id
    }

    pub(crate) fn now_grace_active(&mut self, now: Instant) -> bool {
        self.timers.grace_active(now)
    }
}
