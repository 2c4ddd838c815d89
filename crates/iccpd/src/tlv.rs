//! ICCP TLV wire codec
//!
//! Every message is a fixed header followed by exactly one TLV. This
//! module is the single place performing byte-order conversion: all
//! multi-byte fields are big-endian, and every layout is written and
//! read field by field, never through native struct layout.
//!
//! Header (9 octets):
//!   flags u8       - bit 0x80 is the control bit, rest reserved zero
//!   msg_type u16   - mirrors the TLV type code of the body
//!   len u16        - octets following the length field
//!   msg_id u32     - monotonically increasing per session
//!
//! Parameter prefix (4 octets):
//!   type u16       - top two bits are the U/F flag bits, low 14 bits
//!                    the TLV type code
//!   len u16        - octets of type-specific body following the prefix

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IccpError, Result};
use crate::types::{MacAddress, MAC_STR_LEN, MAX_IFNAME_LEN};

/// Header length: flags + type + len + msg_id.
pub const HDR_LEN: usize = 9;
/// Parameter prefix length: flagged type + TLV length.
pub const PARAM_LEN: usize = 4;
/// Octets of the header that precede the length field.
const HDR_PRE_LEN: usize = 5;

/// Control bit in the header flags octet.
pub const CTRL_BIT: u8 = 0x80;
/// U bit of the parameter prefix.
pub const PARAM_U_BIT: u16 = 0x8000;
/// F bit of the parameter prefix.
pub const PARAM_F_BIT: u16 = 0x4000;
const PARAM_TYPE_MASK: u16 = 0x3fff;

/// Upper bound on MAC entries batched into one MAC-info message.
pub const MAX_MAC_BATCH: usize = 30;
/// Upper bound on ARP/ND entries batched into one neighbor message.
pub const MAX_NEIGH_BATCH: usize = 40;

const MAC_ENTRY_LEN: usize = 1 + MAC_STR_LEN + 2 + MAX_IFNAME_LEN; // 41
const ARP_ENTRY_LEN: usize = 1 + MAX_IFNAME_LEN + 4 + 6; // 31
const ND_ENTRY_LEN: usize = 1 + MAX_IFNAME_LEN + 16 + 6; // 43

/// TLV type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvKind {
    SystemConfig,
    AggregateConfig,
    AggregateState,
    /// Reserved, unused in this version.
    PortConfig,
    /// Reserved, unused in this version.
    PortPriority,
    /// Reserved, unused in this version.
    PortState,
    SyncRequest,
    SyncData,
    Heartbeat,
    PortChannelInfo,
    PeerLinkInfo,
    MacInfo,
    ArpInfo,
    NeighborInfo,
    WarmReboot,
    Nak,
    IfUpAck,
}

impl TlvKind {
    pub fn code(self) -> u16 {
        match self {
            TlvKind::SystemConfig => 0x1001,
            TlvKind::AggregateConfig => 0x1002,
            TlvKind::AggregateState => 0x1003,
            TlvKind::PortConfig => 0x1004,
            TlvKind::PortPriority => 0x1005,
            TlvKind::PortState => 0x1006,
            TlvKind::SyncRequest => 0x1007,
            TlvKind::SyncData => 0x1008,
            TlvKind::Heartbeat => 0x1009,
            TlvKind::PortChannelInfo => 0x100a,
            TlvKind::PeerLinkInfo => 0x100b,
            TlvKind::MacInfo => 0x100c,
            TlvKind::ArpInfo => 0x100d,
            TlvKind::NeighborInfo => 0x100e,
            TlvKind::WarmReboot => 0x100f,
            TlvKind::Nak => 0x1010,
            TlvKind::IfUpAck => 0x1011,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x1001 => TlvKind::SystemConfig,
            0x1002 => TlvKind::AggregateConfig,
            0x1003 => TlvKind::AggregateState,
            0x1004 => TlvKind::PortConfig,
            0x1005 => TlvKind::PortPriority,
            0x1006 => TlvKind::PortState,
            0x1007 => TlvKind::SyncRequest,
            0x1008 => TlvKind::SyncData,
            0x1009 => TlvKind::Heartbeat,
            0x100a => TlvKind::PortChannelInfo,
            0x100b => TlvKind::PeerLinkInfo,
            0x100c => TlvKind::MacInfo,
            0x100d => TlvKind::ArpInfo,
            0x100e => TlvKind::NeighborInfo,
            0x100f => TlvKind::WarmReboot,
            0x1010 => TlvKind::Nak,
            0x1011 => TlvKind::IfUpAck,
            _ => return None,
        })
    }
}

/// Per-entry operation carried in MAC/ARP/ND sync batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Add,
    Del,
    Ack,
}

impl SyncOp {
    fn code(self) -> u8 {
        match self {
            SyncOp::Add => 0,
            SyncOp::Del => 1,
            SyncOp::Ack => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SyncOp::Add,
            1 => SyncOp::Del,
            2 => SyncOp::Ack,
            _ => return None,
        })
    }
}

/// System configuration announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub node_id: u8,
    pub sys_mac: MacAddress,
    pub priority: u16,
}

/// Port-channel (aggregate) configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateConfig {
    pub agg_id: u16,
    pub flags: u8,
    pub mac: MacAddress,
    pub name: String,
}

/// Port-channel operational state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateState {
    pub agg_id: u16,
    pub up: bool,
}

/// Explicit request for the peer to push its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub req_id: u16,
    /// Requested kind; 0 requests everything.
    pub kind: u16,
}

/// Bulk-sync framing marker; `end` set terminates a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncData {
    pub end: bool,
}

/// Port-channel membership detail, including VLAN/L3 attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortChannelInfo {
    pub agg_id: u16,
    pub po_id: u16,
    pub ifname: String,
    pub l3_mode: bool,
    pub ipv4: Ipv4Addr,
    pub vlans: Vec<u16>,
}

/// Designated peer-link identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    pub ifname: String,
    pub link_kind: u8,
}

/// One replicated MAC table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacSyncEntry {
    pub op: SyncOp,
    pub mac: MacAddress,
    pub vlan: u16,
    pub ifname: String,
}

/// One replicated ARP or IPv6-neighbor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSyncEntry {
    pub op: SyncOp,
    pub ifname: String,
    pub ip: IpAddr,
    pub lladdr: MacAddress,
}

/// Negative acknowledgment referencing the rejected message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nak {
    pub rejected_msg_id: u32,
}

/// Peer acknowledgment that a reported interface-up was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfUpAck {
    pub if_type: u8,
    pub if_id: u16,
    pub isolation_lifted: bool,
}

/// A decoded ICCP message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IccpMessage {
    SystemConfig(SystemConfig),
    AggregateConfig(AggregateConfig),
    AggregateState(AggregateState),
    SyncRequest(SyncRequest),
    SyncData(SyncData),
    Heartbeat { node_id: u8 },
    PortChannelInfo(PortChannelInfo),
    PeerLinkInfo(PeerLinkInfo),
    MacInfo(Vec<MacSyncEntry>),
    ArpInfo(Vec<NeighborSyncEntry>),
    NeighborInfo(Vec<NeighborSyncEntry>),
    WarmReboot { flag: u8 },
    Nak(Nak),
    IfUpAck(IfUpAck),
    /// A structurally valid TLV of a reserved type; the session replies
    /// with a negative acknowledgment.
    Reserved(TlvKind),
}

impl IccpMessage {
    pub fn kind(&self) -> TlvKind {
        match self {
            IccpMessage::SystemConfig(_) => TlvKind::SystemConfig,
            IccpMessage::AggregateConfig(_) => TlvKind::AggregateConfig,
            IccpMessage::AggregateState(_) => TlvKind::AggregateState,
            IccpMessage::SyncRequest(_) => TlvKind::SyncRequest,
            IccpMessage::SyncData(_) => TlvKind::SyncData,
            IccpMessage::Heartbeat { .. } => TlvKind::Heartbeat,
            IccpMessage::PortChannelInfo(_) => TlvKind::PortChannelInfo,
            IccpMessage::PeerLinkInfo(_) => TlvKind::PeerLinkInfo,
            IccpMessage::MacInfo(_) => TlvKind::MacInfo,
            IccpMessage::ArpInfo(_) => TlvKind::ArpInfo,
            IccpMessage::NeighborInfo(_) => TlvKind::NeighborInfo,
            IccpMessage::WarmReboot { .. } => TlvKind::WarmReboot,
            IccpMessage::Nak(_) => TlvKind::Nak,
            IccpMessage::IfUpAck(_) => TlvKind::IfUpAck,
            IccpMessage::Reserved(kind) => *kind,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            IccpMessage::SystemConfig(_) => 1 + 6 + 2,
            IccpMessage::AggregateConfig(_) => 2 + 1 + 6 + MAX_IFNAME_LEN,
            IccpMessage::AggregateState(_) => 2 + 1,
            IccpMessage::SyncRequest(_) => 2 + 2,
            IccpMessage::SyncData(_) => 2,
            IccpMessage::Heartbeat { .. } => 1,
            IccpMessage::PortChannelInfo(p) => 2 + 2 + MAX_IFNAME_LEN + 1 + 4 + 2 + 2 * p.vlans.len(),
            IccpMessage::PeerLinkInfo(_) => MAX_IFNAME_LEN + 1,
            IccpMessage::MacInfo(entries) => 2 + MAC_ENTRY_LEN * entries.len(),
            IccpMessage::ArpInfo(entries) => 2 + ARP_ENTRY_LEN * entries.len(),
            IccpMessage::NeighborInfo(entries) => 2 + ND_ENTRY_LEN * entries.len(),
            IccpMessage::WarmReboot { .. } => 1,
            IccpMessage::Nak(_) => 4,
            IccpMessage::IfUpAck(_) => 1 + 2 + 1,
            IccpMessage::Reserved(_) => 0,
        }
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub control: bool,
    pub msg_type: u16,
    pub msg_id: u32,
}

/// Returns the full frame length once enough of the header has been
/// buffered, or `None` if more bytes are needed to tell.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HDR_PRE_LEN {
        return None;
    }
    let len = BigEndian::read_u16(&buf[3..5]) as usize;
    Some(HDR_PRE_LEN + len)
}

/// Encodes `msg` into `buf`, returning the total frame length.
pub fn encode(buf: &mut [u8], msg_id: u32, msg: &IccpMessage) -> Result<usize> {
    let body_len = msg.body_len();
    let total = HDR_LEN + PARAM_LEN + body_len;
    if total > buf.len() {
        return Err(IccpError::BufferTooSmall {
            needed: total,
            capacity: buf.len(),
        });
    }
    let kind = msg.kind();

    // Header: length counts everything after the length field.
    buf[0] = CTRL_BIT;
    BigEndian::write_u16(&mut buf[1..3], kind.code());
    BigEndian::write_u16(&mut buf[3..5], (4 + PARAM_LEN + body_len) as u16);
    BigEndian::write_u32(&mut buf[5..9], msg_id);

    // Parameter prefix. The U bit is always set; F is unused.
    BigEndian::write_u16(&mut buf[9..11], PARAM_U_BIT | (kind.code() & PARAM_TYPE_MASK));
    BigEndian::write_u16(&mut buf[11..13], body_len as u16);

    let body = &mut buf[HDR_LEN + PARAM_LEN..total];
    match msg {
        IccpMessage::SystemConfig(c) => {
            body[0] = c.node_id;
            body[1..7].copy_from_slice(c.sys_mac.as_bytes());
            BigEndian::write_u16(&mut body[7..9], c.priority);
        }
        IccpMessage::AggregateConfig(c) => {
            BigEndian::write_u16(&mut body[0..2], c.agg_id);
            body[2] = c.flags;
            body[3..9].copy_from_slice(c.mac.as_bytes());
            write_name(&mut body[9..9 + MAX_IFNAME_LEN], &c.name);
        }
        IccpMessage::AggregateState(s) => {
            BigEndian::write_u16(&mut body[0..2], s.agg_id);
            body[2] = s.up as u8;
        }
        IccpMessage::SyncRequest(r) => {
            BigEndian::write_u16(&mut body[0..2], r.req_id);
            BigEndian::write_u16(&mut body[2..4], r.kind);
        }
        IccpMessage::SyncData(d) => {
            BigEndian::write_u16(&mut body[0..2], d.end as u16);
        }
        IccpMessage::Heartbeat { node_id } => {
            body[0] = *node_id;
        }
        IccpMessage::PortChannelInfo(p) => {
            BigEndian::write_u16(&mut body[0..2], p.agg_id);
            BigEndian::write_u16(&mut body[2..4], p.po_id);
            write_name(&mut body[4..4 + MAX_IFNAME_LEN], &p.ifname);
            let off = 4 + MAX_IFNAME_LEN;
            body[off] = p.l3_mode as u8;
            body[off + 1..off + 5].copy_from_slice(&p.ipv4.octets());
            BigEndian::write_u16(&mut body[off + 5..off + 7], p.vlans.len() as u16);
            let mut voff = off + 7;
            for vlan in &p.vlans {
                BigEndian::write_u16(&mut body[voff..voff + 2], *vlan);
                voff += 2;
            }
        }
        IccpMessage::PeerLinkInfo(p) => {
            write_name(&mut body[0..MAX_IFNAME_LEN], &p.ifname);
            body[MAX_IFNAME_LEN] = p.link_kind;
        }
        IccpMessage::MacInfo(entries) => {
            if entries.len() > MAX_MAC_BATCH {
                return Err(IccpError::MalformedTlv(format!(
                    "MAC batch of {} exceeds {}",
                    entries.len(),
                    MAX_MAC_BATCH
                )));
            }
            BigEndian::write_u16(&mut body[0..2], entries.len() as u16);
            for (i, e) in entries.iter().enumerate() {
                let b = &mut body[2 + i * MAC_ENTRY_LEN..2 + (i + 1) * MAC_ENTRY_LEN];
                b[0] = e.op.code();
                write_mac_str(&mut b[1..1 + MAC_STR_LEN], &e.mac);
                BigEndian::write_u16(&mut b[1 + MAC_STR_LEN..3 + MAC_STR_LEN], e.vlan);
                write_name(&mut b[3 + MAC_STR_LEN..3 + MAC_STR_LEN + MAX_IFNAME_LEN], &e.ifname);
            }
        }
        IccpMessage::ArpInfo(entries) => {
            encode_neigh_entries(body, entries, false)?;
        }
        IccpMessage::NeighborInfo(entries) => {
            encode_neigh_entries(body, entries, true)?;
        }
        IccpMessage::WarmReboot { flag } => {
            body[0] = *flag;
        }
        IccpMessage::Nak(n) => {
            BigEndian::write_u32(&mut body[0..4], n.rejected_msg_id);
        }
        IccpMessage::IfUpAck(a) => {
            body[0] = a.if_type;
            BigEndian::write_u16(&mut body[1..3], a.if_id);
            body[3] = a.isolation_lifted as u8;
        }
        IccpMessage::Reserved(_) => {}
    }
    Ok(total)
}

fn encode_neigh_entries(body: &mut [u8], entries: &[NeighborSyncEntry], v6: bool) -> Result<()> {
    if entries.len() > MAX_NEIGH_BATCH {
        return Err(IccpError::MalformedTlv(format!(
            "neighbor batch of {} exceeds {}",
            entries.len(),
            MAX_NEIGH_BATCH
        )));
    }
    let entry_len = if v6 { ND_ENTRY_LEN } else { ARP_ENTRY_LEN };
    BigEndian::write_u16(&mut body[0..2], entries.len() as u16);
    for (i, e) in entries.iter().enumerate() {
        let b = &mut body[2 + i * entry_len..2 + (i + 1) * entry_len];
        b[0] = e.op.code();
        write_name(&mut b[1..1 + MAX_IFNAME_LEN], &e.ifname);
        let aoff = 1 + MAX_IFNAME_LEN;
        match (&e.ip, v6) {
            (IpAddr::V4(addr), false) => {
                b[aoff..aoff + 4].copy_from_slice(&addr.octets());
                b[aoff + 4..aoff + 10].copy_from_slice(e.lladdr.as_bytes());
            }
            (IpAddr::V6(addr), true) => {
                b[aoff..aoff + 16].copy_from_slice(&addr.octets());
                b[aoff + 16..aoff + 22].copy_from_slice(e.lladdr.as_bytes());
            }
            _ => {
                return Err(IccpError::MalformedTlv(
                    "address family does not match TLV type".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Decodes one complete frame.
pub fn decode(buf: &[u8]) -> Result<(MsgHeader, IccpMessage)> {
    if buf.len() < HDR_LEN + PARAM_LEN {
        return Err(IccpError::MalformedTlv(format!(
            "frame of {} octets shorter than header", buf.len()
        )));
    }
    let control = buf[0] & CTRL_BIT != 0;
    let msg_type = BigEndian::read_u16(&buf[1..3]);
    let len = BigEndian::read_u16(&buf[3..5]) as usize;
    let msg_id = BigEndian::read_u32(&buf[5..9]);
    if HDR_PRE_LEN + len > buf.len() || len < 4 + PARAM_LEN {
        return Err(IccpError::MalformedTlv(format!(
            "header length {} inconsistent with frame of {} octets",
            len,
            buf.len()
        )));
    }

    let param_type = BigEndian::read_u16(&buf[9..11]) & PARAM_TYPE_MASK;
    let body_len = BigEndian::read_u16(&buf[11..13]) as usize;
    if HDR_LEN + PARAM_LEN + body_len > buf.len() || 4 + PARAM_LEN + body_len > len {
        return Err(IccpError::MalformedTlv(format!(
            "TLV length {} reads past buffer end", body_len
        )));
    }
    let kind = TlvKind::from_code(param_type)
        .ok_or_else(|| IccpError::MalformedTlv(format!("unknown TLV type {:#06x}", param_type)))?;
    let body = &buf[HDR_LEN + PARAM_LEN..HDR_LEN + PARAM_LEN + body_len];
    let header = MsgHeader { control, msg_type, msg_id };

    let need = |n: usize| -> Result<()> {
        if body.len() < n {
            Err(IccpError::MalformedTlv(format!(
                "{:?} body of {} octets, need {}", kind, body.len(), n
            )))
        } else {
            Ok(())
        }
    };

    let msg = match kind {
        TlvKind::SystemConfig => {
            need(9)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&body[1..7]);
            IccpMessage::SystemConfig(SystemConfig {
                node_id: body[0],
                sys_mac: MacAddress::new(mac),
                priority: BigEndian::read_u16(&body[7..9]),
            })
        }
        TlvKind::AggregateConfig => {
            need(9 + MAX_IFNAME_LEN)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&body[3..9]);
            IccpMessage::AggregateConfig(AggregateConfig {
                agg_id: BigEndian::read_u16(&body[0..2]),
                flags: body[2],
                mac: MacAddress::new(mac),
                name: read_name(&body[9..9 + MAX_IFNAME_LEN])?,
            })
        }
        TlvKind::AggregateState => {
            need(3)?;
            IccpMessage::AggregateState(AggregateState {
                agg_id: BigEndian::read_u16(&body[0..2]),
                up: body[2] != 0,
            })
        }
        TlvKind::SyncRequest => {
            need(4)?;
            IccpMessage::SyncRequest(SyncRequest {
                req_id: BigEndian::read_u16(&body[0..2]),
                kind: BigEndian::read_u16(&body[2..4]),
            })
        }
        TlvKind::SyncData => {
            need(2)?;
            IccpMessage::SyncData(SyncData {
                end: BigEndian::read_u16(&body[0..2]) & 1 != 0,
            })
        }
        TlvKind::Heartbeat => {
            need(1)?;
            IccpMessage::Heartbeat { node_id: body[0] }
        }
        TlvKind::PortChannelInfo => {
            need(4 + MAX_IFNAME_LEN + 7)?;
            let agg_id = BigEndian::read_u16(&body[0..2]);
            let po_id = BigEndian::read_u16(&body[2..4]);
            let ifname = read_name(&body[4..4 + MAX_IFNAME_LEN])?;
            let off = 4 + MAX_IFNAME_LEN;
            let l3_mode = body[off] != 0;
            let ipv4 = Ipv4Addr::new(body[off + 1], body[off + 2], body[off + 3], body[off + 4]);
            let count = BigEndian::read_u16(&body[off + 5..off + 7]) as usize;
            need(off + 7 + 2 * count)?;
            let mut vlans = Vec::with_capacity(count);
            for i in 0..count {
                vlans.push(BigEndian::read_u16(&body[off + 7 + 2 * i..off + 9 + 2 * i]));
            }
            IccpMessage::PortChannelInfo(PortChannelInfo {
                agg_id,
                po_id,
                ifname,
                l3_mode,
                ipv4,
                vlans,
            })
        }
        TlvKind::PeerLinkInfo => {
            need(MAX_IFNAME_LEN + 1)?;
            IccpMessage::PeerLinkInfo(PeerLinkInfo {
                ifname: read_name(&body[0..MAX_IFNAME_LEN])?,
                link_kind: body[MAX_IFNAME_LEN],
            })
        }
        TlvKind::MacInfo => {
            need(2)?;
            let count = BigEndian::read_u16(&body[0..2]) as usize;
            if count > MAX_MAC_BATCH {
                return Err(IccpError::MalformedTlv(format!(
                    "MAC batch of {} exceeds {}", count, MAX_MAC_BATCH
                )));
            }
            need(2 + count * MAC_ENTRY_LEN)?;
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let b = &body[2 + i * MAC_ENTRY_LEN..2 + (i + 1) * MAC_ENTRY_LEN];
                entries.push(MacSyncEntry {
                    op: decode_op(b[0])?,
                    mac: read_mac_str(&b[1..1 + MAC_STR_LEN])?,
                    vlan: BigEndian::read_u16(&b[1 + MAC_STR_LEN..3 + MAC_STR_LEN]),
                    ifname: read_name(&b[3 + MAC_STR_LEN..3 + MAC_STR_LEN + MAX_IFNAME_LEN])?,
                });
            }
            IccpMessage::MacInfo(entries)
        }
        TlvKind::ArpInfo => IccpMessage::ArpInfo(decode_neigh_entries(body, false)?),
        TlvKind::NeighborInfo => IccpMessage::NeighborInfo(decode_neigh_entries(body, true)?),
        TlvKind::WarmReboot => {
            need(1)?;
            IccpMessage::WarmReboot { flag: body[0] }
        }
        TlvKind::Nak => {
            need(4)?;
            IccpMessage::Nak(Nak {
                rejected_msg_id: BigEndian::read_u32(&body[0..4]),
            })
        }
        TlvKind::IfUpAck => {
            need(4)?;
            IccpMessage::IfUpAck(IfUpAck {
                if_type: body[0],
                if_id: BigEndian::read_u16(&body[1..3]),
                isolation_lifted: body[3] != 0,
            })
        }
        TlvKind::PortConfig | TlvKind::PortPriority | TlvKind::PortState => {
            IccpMessage::Reserved(kind)
        }
    };
    Ok((header, msg))
}

fn decode_neigh_entries(body: &[u8], v6: bool) -> Result<Vec<NeighborSyncEntry>> {
    let entry_len = if v6 { ND_ENTRY_LEN } else { ARP_ENTRY_LEN };
    if body.len() < 2 {
        return Err(IccpError::MalformedTlv("neighbor TLV missing count".into()));
    }
    let count = BigEndian::read_u16(&body[0..2]) as usize;
    if count > MAX_NEIGH_BATCH {
        return Err(IccpError::MalformedTlv(format!(
            "neighbor batch of {} exceeds {}", count, MAX_NEIGH_BATCH
        )));
    }
    if body.len() < 2 + count * entry_len {
        return Err(IccpError::MalformedTlv(format!(
            "neighbor batch of {} reads past buffer end", count
        )));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let b = &body[2 + i * entry_len..2 + (i + 1) * entry_len];
        let op = decode_op(b[0])?;
        let ifname = read_name(&b[1..1 + MAX_IFNAME_LEN])?;
        let aoff = 1 + MAX_IFNAME_LEN;
        let (ip, lladdr_off) = if v6 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[aoff..aoff + 16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), aoff + 16)
        } else {
            let ip = Ipv4Addr::new(b[aoff], b[aoff + 1], b[aoff + 2], b[aoff + 3]);
            (IpAddr::V4(ip), aoff + 4)
        };
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&b[lladdr_off..lladdr_off + 6]);
        entries.push(NeighborSyncEntry {
            op,
            ifname,
            ip,
            lladdr: MacAddress::new(mac),
        });
    }
    Ok(entries)
}

fn decode_op(code: u8) -> Result<SyncOp> {
    SyncOp::from_code(code)
        .ok_or_else(|| IccpError::MalformedTlv(format!("unknown sync op {}", code)))
}

fn write_name(field: &mut [u8], name: &str) {
    field.fill(0);
    let bytes = name.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

fn read_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| IccpError::MalformedTlv("interface name is not valid UTF-8".into()))
}

fn write_mac_str(field: &mut [u8], mac: &MacAddress) {
    field.fill(0);
    let s = mac.to_string();
    field[..s.len()].copy_from_slice(s.as_bytes());
}

fn read_mac_str(field: &[u8]) -> Result<MacAddress> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let s = std::str::from_utf8(&field[..end])
        .map_err(|_| IccpError::MalformedTlv("MAC field is not valid UTF-8".into()))?;
    s.parse()
        .map_err(|e: String| IccpError::MalformedTlv(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn roundtrip(msg: IccpMessage) {
        let mut buf = [0u8; 4096];
        let n = encode(&mut buf, 42, &msg).unwrap();
        assert_eq!(frame_len(&buf), Some(n));
        let (hdr, decoded) = decode(&buf[..n]).unwrap();
        assert_eq!(hdr.msg_id, 42);
        assert_eq!(hdr.msg_type, msg.kind().code());
        assert!(hdr.control);
        assert_eq!(decoded, msg);
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_roundtrip_system_config() {
        roundtrip(IccpMessage::SystemConfig(SystemConfig {
            node_id: 7,
            sys_mac: mac("02:42:ac:11:00:02"),
            priority: 32768,
        }));
    }

    #[test]
    fn test_roundtrip_aggregate_config_state() {
        roundtrip(IccpMessage::AggregateConfig(AggregateConfig {
            agg_id: 1,
            flags: 0x01,
            mac: mac("02:42:ac:11:00:03"),
            name: "PortChannel1".into(),
        }));
        roundtrip(IccpMessage::AggregateState(AggregateState { agg_id: 1, up: true }));
        roundtrip(IccpMessage::AggregateState(AggregateState { agg_id: 9, up: false }));
    }

    #[test]
    fn test_roundtrip_sync_markers() {
        roundtrip(IccpMessage::SyncRequest(SyncRequest { req_id: 3, kind: 0 }));
        roundtrip(IccpMessage::SyncData(SyncData { end: true }));
        roundtrip(IccpMessage::SyncData(SyncData { end: false }));
    }

    #[test]
    fn test_roundtrip_port_channel_info() {
        roundtrip(IccpMessage::PortChannelInfo(PortChannelInfo {
            agg_id: 1,
            po_id: 100,
            ifname: "PortChannel1".into(),
            l3_mode: false,
            ipv4: Ipv4Addr::UNSPECIFIED,
            vlans: vec![10, 20, 30],
        }));
        // Routed port-channel: no VLANs, carries an address.
        roundtrip(IccpMessage::PortChannelInfo(PortChannelInfo {
            agg_id: 2,
            po_id: 200,
            ifname: "PortChannel2".into(),
            l3_mode: true,
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            vlans: vec![],
        }));
    }

    #[test]
    fn test_roundtrip_peer_link_info() {
        roundtrip(IccpMessage::PeerLinkInfo(PeerLinkInfo {
            ifname: "PortChannel100".into(),
            link_kind: 1,
        }));
    }

    #[test]
    fn test_roundtrip_mac_info_max_batch() {
        let entries: Vec<MacSyncEntry> = (0..MAX_MAC_BATCH)
            .map(|i| MacSyncEntry {
                op: if i % 2 == 0 { SyncOp::Add } else { SyncOp::Del },
                mac: MacAddress::new([0x02, 0, 0, 0, 0, i as u8]),
                vlan: 10 + i as u16,
                ifname: format!("Ethernet{}", i),
            })
            .collect();
        roundtrip(IccpMessage::MacInfo(entries));
    }

    #[test]
    fn test_roundtrip_arp_info_max_batch() {
        let entries: Vec<NeighborSyncEntry> = (0..MAX_NEIGH_BATCH)
            .map(|i| NeighborSyncEntry {
                op: SyncOp::Add,
                ifname: "Vlan10".into(),
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, i as u8)),
                lladdr: MacAddress::new([0x02, 0, 0, 0, 1, i as u8]),
            })
            .collect();
        roundtrip(IccpMessage::ArpInfo(entries));
    }

    #[test]
    fn test_roundtrip_neighbor_info() {
        let entries = vec![NeighborSyncEntry {
            op: SyncOp::Del,
            ifname: "Vlan20".into(),
            ip: "fe80::1".parse().unwrap(),
            lladdr: mac("02:42:ac:11:00:07"),
        }];
        roundtrip(IccpMessage::NeighborInfo(entries));
    }

    #[test]
    fn test_roundtrip_control_messages() {
        roundtrip(IccpMessage::Heartbeat { node_id: 3 });
        roundtrip(IccpMessage::WarmReboot { flag: 1 });
        roundtrip(IccpMessage::Nak(Nak { rejected_msg_id: 0xdead_beef }));
        roundtrip(IccpMessage::IfUpAck(IfUpAck {
            if_type: 1,
            if_id: 100,
            isolation_lifted: true,
        }));
    }

    #[test]
    fn test_batch_limit_enforced_on_encode() {
        let entries: Vec<MacSyncEntry> = (0..MAX_MAC_BATCH + 1)
            .map(|i| MacSyncEntry {
                op: SyncOp::Add,
                mac: MacAddress::new([0, 0, 0, 0, 0, i as u8]),
                vlan: 1,
                ifname: "Ethernet0".into(),
            })
            .collect();
        let mut buf = [0u8; 4096];
        assert!(matches!(
            encode(&mut buf, 1, &IccpMessage::MacInfo(entries)),
            Err(IccpError::MalformedTlv(_))
        ));
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = [0u8; 8];
        let err = encode(&mut buf, 1, &IccpMessage::Heartbeat { node_id: 1 }).unwrap_err();
        assert!(matches!(err, IccpError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = [0u8; 256];
        let n = encode(
            &mut buf,
            5,
            &IccpMessage::PeerLinkInfo(PeerLinkInfo {
                ifname: "PortChannel100".into(),
                link_kind: 0,
            }),
        )
        .unwrap();
        // Declared lengths now read past the shortened buffer.
        assert!(matches!(
            decode(&buf[..n - 4]),
            Err(IccpError::MalformedTlv(_))
        ));
    }

    #[test]
    fn test_overstated_tlv_length_rejected() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 6, &IccpMessage::Heartbeat { node_id: 2 }).unwrap();
        // Corrupt the parameter length to claim more body than exists.
        BigEndian::write_u16(&mut buf[11..13], 200);
        assert!(matches!(decode(&buf[..n]), Err(IccpError::MalformedTlv(_))));
    }

    #[test]
    fn test_unknown_tlv_type_rejected() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 7, &IccpMessage::Heartbeat { node_id: 2 }).unwrap();
        BigEndian::write_u16(&mut buf[9..11], PARAM_U_BIT | 0x3f00);
        assert!(matches!(decode(&buf[..n]), Err(IccpError::MalformedTlv(_))));
    }

    #[test]
    fn test_reserved_types_decode_as_reserved() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 8, &IccpMessage::Reserved(TlvKind::PortConfig)).unwrap();
        let (_, msg) = decode(&buf[..n]).unwrap();
        assert_eq!(msg, IccpMessage::Reserved(TlvKind::PortConfig));
    }

    #[test]
    fn test_frame_len_needs_five_octets() {
        assert_eq!(frame_len(&[0x80, 0x10]), None);
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 9, &IccpMessage::Heartbeat { node_id: 1 }).unwrap();
        assert_eq!(frame_len(&buf[..5]), Some(n));
    }
}
