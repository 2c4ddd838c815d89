//! iccpd - Inter-Chassis Control Protocol daemon for SONiC MLAG
//!
//! Synchronizes MLAG state between two chassis over a session-oriented
//! TLV protocol: a symmetry-broken two-stage bulk handshake followed by
//! steady-state replication of MAC, ARP and IPv6-neighbor tables, with
//! warm-reboot grace windows and NAK-driven retransmission.
//!
//! The engine is single-threaded and tick-driven: one scheduler loop
//! services the peer session, draining the inbound queue, advancing the
//! nested protocol state machine, and flushing outbound deltas. The
//! kernel event collector feeds it over a single-producer channel; the
//! hardware forwarding path is reached through the [`system`] traits.

pub mod config;
pub mod error;
pub mod fsm;
pub mod mac_store;
pub mod session;
pub mod supervisor;
pub mod system;
pub mod tlv;
pub mod topology;
pub mod types;

pub use config::IccpConfig;
pub use error::{IccpError, Result};
pub use mac_store::{AgeOrigin, AgeOutcome, MacEntry, MacEntryType, MacStore, NeighborKey};
pub use session::{
    IccpTransport, MemoryTransport, ProtoState, ResetKind, Role, Session, TcpTransport,
};
pub use supervisor::{MessageLog, NakAction, TimerSupervisor};
pub use system::{BridgeRecord, NeighborEvent, RecordingBridge, SystemBridge};
pub use tlv::{IccpMessage, SyncOp, TlvKind};
pub use topology::{IfKind, LocalInterface, Topology};
pub use types::{MacAddress, MacKey};
