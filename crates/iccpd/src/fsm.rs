//! Nested protocol state machine
//!
//! Drives a [`Session`] through `Init -> Stage1 -> Stage2 -> Exchange`
//! and services the steady-state Exchange tick. The handshake is
//! symmetry-broken by role: the active side pushes its full state in
//! Stage1 while the standby pulls, and the roles invert for Stage2 so
//! both sides have pushed and pulled exactly once.

use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, info, warn};

use crate::error::{IccpError, Result};
use crate::mac_store::{AgeOrigin, AgeOutcome, MacEntry, MacEntryType, NeighborKey};
use crate::session::{ProtoState, ResetKind, Role, Session};
use crate::supervisor::{resolve_nak, NakAction};
use crate::system::NeighborEvent;
use crate::tlv::{
    self, AggregateConfig, AggregateState, IccpMessage, IfUpAck, MacSyncEntry, MsgHeader, Nak,
    NeighborSyncEntry, PeerLinkInfo, PortChannelInfo, SyncData, SyncOp, SyncRequest,
    MAX_MAC_BATCH, MAX_NEIGH_BATCH,
};
use crate::topology::IfKind;
use crate::types::MacKey;

impl Session {
    /// One scheduler tick: drain inbound, advance the nested state
    /// machine, flush outbound deltas, service timers. Every failure
    /// degrades to a NAK, a forced resync, or a session reset; nothing
    /// here terminates the process.
    pub fn tick(&mut self, now: Instant) {
        if self.state == ProtoState::Error {
            return;
        }
        if let Err(e) = self.flush_backlog() {
            self.on_fault(e, now);
            return;
        }

        if let Err(e) = self.drain_inbound(now).and_then(|_| self.run_state()) {
            self.on_fault(e, now);
            return;
        }

        // Deferred MAC deletions for interfaces down past the grace.
        let expired = self
            .topology
            .expired_down_interfaces(self.config.if_down_grace(), now);
        for name in expired {
            let freed = self.store.clear_pending_for_interface(&name);
            for key in freed {
                if let Err(e) = self.system.unprogram_fdb(key) {
                    warn!(%key, error = %e, "failed to unprogram aged entry");
                }
            }
            self.topology.ack_down_expiry(&name);
        }

        if matches!(
            self.state,
            ProtoState::Stage1 | ProtoState::Stage2 | ProtoState::Exchange
        ) && self.timers.heartbeat_due(now)
        {
            let node_id = self.node_id;
            if let Err(e) = self.send(&IccpMessage::Heartbeat { node_id }) {
                self.on_fault(e, now);
                return;
            }
            self.timers.heartbeat_sent(now);
        }
    }

    fn on_fault(&mut self, err: IccpError, now: Instant) {
        match err {
            IccpError::Transport(_) | IccpError::Io(_) => {
                warn!(error = %err, "transport fault; arming grace and resetting");
                self.timers.arm_grace(now);
                self.reset(ResetKind::Reconnect);
            }
            other => {
                error!(error = %other, "unrecoverable protocol violation");
                self.state = ProtoState::Error;
            }
        }
    }

    /// In the Exchange state exactly one dequeued message is processed
    /// per tick; handshake stages drain everything available.
    fn drain_inbound(&mut self, now: Instant) -> Result<()> {
        let budget = if self.state == ProtoState::Exchange { 1 } else { usize::MAX };
        let mut processed = 0;
        while processed < budget {
            let Some(frame) = self.recv()? else {
                break;
            };
            self.stats.msgs_received += 1;
            processed += 1;
            match tlv::decode(&frame) {
                Ok((hdr, msg)) => self.handle_message(hdr, msg, now)?,
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    warn!(error = %e, "malformed frame");
                    // The header may still carry a usable identifier to
                    // reference in the negative acknowledgment.
                    if frame.len() >= 9 {
                        let msg_id = BigEndian::read_u32(&frame[5..9]);
                        self.send_nak(msg_id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn run_state(&mut self) -> Result<()> {
        match self.state {
            ProtoState::Init => self.run_init(),
            ProtoState::Stage1 | ProtoState::Stage2 => self.run_stage(),
            ProtoState::Exchange => self.run_exchange(),
            ProtoState::Error => Ok(()),
        }
    }

    /// Init emits a resynchronization of previously known ARP/neighbor
    /// data and moves straight to Stage1. Entries crossing the ISL are
    /// installed explicitly, so kernel learning on the peer-link stays
    /// off for the session's lifetime.
    fn run_init(&mut self) -> Result<()> {
        if let Some(pl) = self.topology.peer_link().map(str::to_string) {
            self.system.set_peer_link_learning(&pl, false)?;
        }
        self.store.requeue_all_neighbors();
        self.flush_neighbor_queues()?;
        self.state = ProtoState::Stage1;
        debug!(role = ?self.role, "entering Stage1");
        if !self.is_stage_pusher() {
            self.send_sync_request()?;
        }
        // A pusher serves a request that raced ahead of us on the next
        // run_stage pass this same tick.
        self.run_stage()
    }

    fn is_stage_pusher(&self) -> bool {
        match self.state {
            ProtoState::Stage1 => self.role == Role::Active,
            ProtoState::Stage2 => self.role == Role::Standby,
            _ => false,
        }
    }

    fn run_stage(&mut self) -> Result<()> {
        if self.is_stage_pusher() && self.peer_sync_requested {
            self.peer_sync_requested = false;
            self.push_bulk()?;
            match self.state {
                ProtoState::Stage1 => {
                    self.state = ProtoState::Stage2;
                    debug!("bulk pushed; entering Stage2 as puller");
                    self.send_sync_request()?;
                }
                ProtoState::Stage2 => {
                    self.state = ProtoState::Exchange;
                    info!("handshake complete; entering Exchange");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The steady-state Exchange pass, steps (b) through (f); step (a)
    /// ran in [`Session::drain_inbound`].
    fn run_exchange(&mut self) -> Result<()> {
        if self.sys_config_dirty {
            self.sys_config_dirty = false;
            let sc = self.local_sys_config();
            self.send(&IccpMessage::SystemConfig(sc))?;
        }

        for ev in self.topology.drain_purge_events() {
            info!(ifname = %ev.ifname, "peer-link isolation lifted");
            self.system.set_traffic_distribution(&ev.ifname, true)?;
        }

        for name in self.topology.take_config_dirty() {
            self.announce_interface_config(&name)?;
        }
        for name in self.topology.take_state_dirty() {
            self.announce_interface_state(&name)?;
        }

        self.flush_mac_queue()?;
        self.flush_neighbor_queues()?;

        if self.node_id_collision {
            self.node_id_collision = false;
            self.decrement_node_id();
            let sc = self.local_sys_config();
            self.send(&IccpMessage::SystemConfig(sc))?;
            self.send_sync_request()?;
        }
        if self.need_resync {
            self.need_resync = false;
            self.send_sync_request()?;
        }
        Ok(())
    }

    fn handle_message(&mut self, hdr: MsgHeader, msg: IccpMessage, now: Instant) -> Result<()> {
        self.timers.peer_activity(now);
        match msg {
            IccpMessage::Heartbeat { .. } => {}
            IccpMessage::WarmReboot { .. } => {
                info!("peer announced warm reboot");
                self.timers.arm_grace(now);
            }
            IccpMessage::Nak(Nak { rejected_msg_id }) => {
                self.stats.naks_received += 1;
                match resolve_nak(&mut self.msg_log, rejected_msg_id) {
                    NakAction::DecrementNodeId => self.node_id_collision = true,
                    NakAction::ForceResync => self.need_resync = true,
                }
            }
            IccpMessage::SystemConfig(sc) => {
                // Only the active side rejects a same-value node id, so
                // exactly one side decrements per collision round.
                if sc.node_id == self.node_id && self.role == Role::Active {
                    warn!(node_id = sc.node_id, "peer announced our node id");
                    self.send_nak(hdr.msg_id)?;
                }
                self.peer.sys = Some(sc);
            }
            IccpMessage::AggregateConfig(c) => {
                self.peer.aggregates.insert(c.agg_id, c);
            }
            IccpMessage::AggregateState(st) => {
                if !self.peer.aggregates.contains_key(&st.agg_id) {
                    // Transient unready condition; drop the TLV.
                    warn!(agg_id = st.agg_id, "state for unknown aggregate dropped");
                    return Ok(());
                }
                self.peer.aggregate_up.insert(st.agg_id, st.up);
                if st.up {
                    self.send(&IccpMessage::IfUpAck(IfUpAck {
                        if_type: 1,
                        if_id: st.agg_id,
                        isolation_lifted: true,
                    }))?;
                }
            }
            IccpMessage::PortChannelInfo(p) => {
                self.peer.port_channels.insert(p.agg_id, p);
            }
            IccpMessage::PeerLinkInfo(p) => {
                self.peer.peer_link = Some(p);
            }
            IccpMessage::SyncRequest(SyncRequest { req_id, .. }) => {
                debug!(req_id, "peer requested synchronization");
                if self.state == ProtoState::Exchange {
                    self.push_bulk()?;
                    self.store.requeue_all_macs();
                } else {
                    self.peer_sync_requested = true;
                }
            }
            IccpMessage::SyncData(SyncData { end }) => {
                if end && self.waiting_for_sync_data {
                    self.waiting_for_sync_data = false;
                    match self.state {
                        ProtoState::Stage1 => {
                            self.state = ProtoState::Stage2;
                            debug!("bulk received; entering Stage2 as pusher");
                        }
                        ProtoState::Stage2 => {
                            self.state = ProtoState::Exchange;
                            info!("handshake complete; entering Exchange");
                        }
                        _ => {}
                    }
                }
            }
            IccpMessage::MacInfo(entries) => self.apply_peer_macs(entries)?,
            IccpMessage::ArpInfo(entries) | IccpMessage::NeighborInfo(entries) => {
                self.apply_peer_neighbors(entries);
            }
            IccpMessage::IfUpAck(ack) => {
                if let Some(name) = self.pending_if_up.remove(&ack.if_id) {
                    self.topology.queue_purge(name);
                } else {
                    debug!(if_id = ack.if_id, "interface-up ack with no pending report");
                }
            }
            IccpMessage::Reserved(kind) => {
                warn!(?kind, state = %self.state, "reserved TLV rejected");
                self.send_nak(hdr.msg_id)?;
            }
        }
        Ok(())
    }

    fn apply_peer_macs(&mut self, entries: Vec<MacSyncEntry>) -> Result<()> {
        let peer_link = self.config.peer_link.clone();
        for e in entries {
            let key = MacKey::new(e.vlan, e.mac);
            match e.op {
                SyncOp::Add => {
                    self.store
                        .upsert_from_peer(key, &e.ifname, MacEntryType::Dynamic);
                    self.system.program_fdb(key, &peer_link)?;
                }
                SyncOp::Del => match self.store.mark_aged(&key, AgeOrigin::Peer, false) {
                    AgeOutcome::ReadyForDelete => {
                        self.system.unprogram_fdb(key)?;
                        self.store.commit_delete(&key);
                    }
                    AgeOutcome::Kept | AgeOutcome::Unknown => {}
                },
                SyncOp::Ack => {}
            }
        }
        Ok(())
    }

    fn apply_peer_neighbors(&mut self, entries: Vec<NeighborSyncEntry>) {
        for e in entries {
            let key = NeighborKey { ip: e.ip, ifname: e.ifname };
            self.store.upsert_neighbor_from_peer(key, e.lladdr, e.op);
        }
    }

    /// Pushes the full local state, terminated by the end-of-sync
    /// marker: system config, per-aggregate config/state/membership,
    /// peer-link identity, then the ARP and neighbor tables.
    fn push_bulk(&mut self) -> Result<()> {
        let sc = self.local_sys_config();
        self.send(&IccpMessage::SystemConfig(sc.clone()))?;

        let aggregates: Vec<PortChannelInfo> = self
            .topology
            .interfaces()
            .filter(|i| i.kind != IfKind::Physical)
            .map(|i| PortChannelInfo {
                agg_id: i.po_id.unwrap_or(i.id),
                po_id: i.po_id.unwrap_or(i.id),
                ifname: i.name.clone(),
                l3_mode: i.l3_mode,
                ipv4: i.ipv4.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
                vlans: i.vlans.iter().copied().collect(),
            })
            .collect();
        let states: Vec<(u16, bool)> = self
            .topology
            .interfaces()
            .filter(|i| i.kind != IfKind::Physical)
            .map(|i| (i.po_id.unwrap_or(i.id), i.oper_up))
            .collect();
        for info in aggregates {
            self.send(&IccpMessage::AggregateConfig(AggregateConfig {
                agg_id: info.agg_id,
                flags: 0,
                mac: sc.sys_mac,
                name: info.ifname.clone(),
            }))?;
            self.send(&IccpMessage::PortChannelInfo(info))?;
        }
        for (agg_id, up) in states {
            self.send(&IccpMessage::AggregateState(AggregateState { agg_id, up }))?;
        }
        if let Some(pl) = self.topology.peer_link().map(str::to_string) {
            self.send(&IccpMessage::PeerLinkInfo(PeerLinkInfo { ifname: pl, link_kind: 1 }))?;
        }

        self.store.requeue_all_neighbors();
        self.flush_neighbor_queues()?;
        self.send(&IccpMessage::SyncData(SyncData { end: true }))
    }

    fn announce_interface_config(&mut self, name: &str) -> Result<()> {
        let Some(intf) = self.topology.interface(name) else {
            return Ok(());
        };
        if intf.kind == IfKind::Physical {
            return Ok(());
        }
        let info = PortChannelInfo {
            agg_id: intf.po_id.unwrap_or(intf.id),
            po_id: intf.po_id.unwrap_or(intf.id),
            ifname: intf.name.clone(),
            l3_mode: intf.l3_mode,
            ipv4: intf.ipv4.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
            vlans: intf.vlans.iter().copied().collect(),
        };
        let sc = self.local_sys_config();
        self.send(&IccpMessage::AggregateConfig(AggregateConfig {
            agg_id: info.agg_id,
            flags: 0,
            mac: sc.sys_mac,
            name: info.ifname.clone(),
        }))?;
        self.send(&IccpMessage::PortChannelInfo(info))
    }

    fn announce_interface_state(&mut self, name: &str) -> Result<()> {
        let Some(intf) = self.topology.interface(name) else {
            return Ok(());
        };
        if intf.kind == IfKind::Physical {
            return Ok(());
        }
        let agg_id = intf.po_id.unwrap_or(intf.id);
        let up = intf.oper_up;
        let ifname = intf.name.clone();
        self.send(&IccpMessage::AggregateState(AggregateState { agg_id, up }))?;
        if up {
            // Traffic distribution stays off until the peer's explicit
            // interface-up acknowledgment; both chassis black-hole
            // traffic otherwise.
            self.pending_if_up.insert(agg_id, ifname);
        }
        Ok(())
    }

    fn flush_mac_queue(&mut self) -> Result<()> {
        loop {
            let batch = self.store.drain_outbound(MAX_MAC_BATCH);
            if batch.is_empty() {
                return Ok(());
            }
            self.send(&IccpMessage::MacInfo(batch))?;
        }
    }

    fn flush_neighbor_queues(&mut self) -> Result<()> {
        loop {
            let batch = self.store.drain_neighbors(false, MAX_NEIGH_BATCH);
            if batch.is_empty() {
                break;
            }
            self.send(&IccpMessage::ArpInfo(batch))?;
        }
        loop {
            let batch = self.store.drain_neighbors(true, MAX_NEIGH_BATCH);
            if batch.is_empty() {
                break;
            }
            self.send(&IccpMessage::NeighborInfo(batch))?;
        }
        Ok(())
    }

    fn send_sync_request(&mut self) -> Result<()> {
        let req_id = self.take_req_id();
        self.stats.resync_requests += 1;
        self.waiting_for_sync_data = true;
        self.send(&IccpMessage::SyncRequest(SyncRequest { req_id, kind: 0 }))
    }

    fn send_nak(&mut self, rejected_msg_id: u32) -> Result<()> {
        self.stats.naks_sent += 1;
        self.send(&IccpMessage::Nak(Nak { rejected_msg_id }))
    }

    // Local event surface, fed by the kernel event collector and the
    // hardware learn path.

    /// A MAC was learned (or moved) by the local forwarding chip.
    pub fn on_local_mac_learn(
        &mut self,
        vlan: u16,
        mac: crate::types::MacAddress,
        ifname: &str,
        is_static: bool,
    ) {
        let entry_type = if is_static { MacEntryType::Static } else { MacEntryType::Dynamic };
        let key = MacKey::new(vlan, mac);
        self.store.upsert(MacEntry::new(key, ifname, entry_type));
    }

    /// A MAC aged out on the local forwarding chip. While the
    /// warm-reboot grace window is armed, age events for peer-learned
    /// entries are suppressed.
    pub fn on_local_mac_aged(&mut self, key: MacKey, now: Instant) {
        let suppress = self.now_grace_active(now);
        match self.store.mark_aged(&key, AgeOrigin::Local, suppress) {
            AgeOutcome::ReadyForDelete => {
                if let Err(e) = self.system.unprogram_fdb(key) {
                    warn!(%key, error = %e, "failed to unprogram aged entry");
                }
                self.store.commit_delete(&key);
            }
            AgeOutcome::Kept => {}
            AgeOutcome::Unknown => debug!(%key, "age event for unknown entry"),
        }
    }

    /// A kernel neighbor-table event (ARP or IPv6 ND).
    pub fn on_neighbor_event(&mut self, ev: NeighborEvent) {
        let Some(ifname) = self.system.if_index_to_name(ev.ifindex) else {
            warn!(ifindex = ev.ifindex, "neighbor event for unknown ifindex");
            return;
        };
        let op = if ev.is_delete { SyncOp::Del } else { SyncOp::Add };
        self.store
            .upsert_neighbor(NeighborKey { ip: ev.ip, ifname }, ev.lladdr, op);
    }

    /// An interface changed operational state. Going down disables
    /// traffic distribution immediately; coming up waits for the
    /// peer's interface-up acknowledgment.
    pub fn on_interface_oper_state(&mut self, name: &str, up: bool, now: Instant) {
        if self.topology.set_oper_state(name, up, now) && !up {
            // Entries on the downed interface wait out the flap grace
            // instead of flooding the peer with deletes.
            self.store.defer_delete_for_interface(name);
            if let Err(e) = self.system.set_traffic_distribution(name, false) {
                warn!(name, error = %e, "failed to disable traffic distribution");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use pretty_assertions::{assert_eq, assert_ne};

    use crate::config::IccpConfig;
    use crate::session::{IccpTransport, MemoryTransport};
    use crate::system::RecordingBridge;
    use crate::topology::LocalInterface;
    use crate::types::MacAddress;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn add_topology(session: &mut Session) {
        let mut po = LocalInterface::new("PortChannel1", 1, IfKind::PortChannel);
        po.po_id = Some(1);
        po.vlans.insert(10);
        session.topology.add_interface(po);
        let mut isl = LocalInterface::new("PortChannel100", 100, IfKind::PeerLink);
        isl.po_id = Some(100);
        session.topology.add_interface(isl);
        // Pre-handshake churn should not count as dirty announcements.
        session.topology.take_config_dirty();
    }

    fn pair() -> (Session, RecordingBridge, Session, RecordingBridge) {
        let (ta, tb) = MemoryTransport::pair();
        let cfg_a = IccpConfig { role: Role::Active, ..IccpConfig::default() };
        let cfg_b = IccpConfig {
            role: Role::Standby,
            local_addr: Ipv4Addr::new(10, 0, 0, 2),
            peer_addr: Ipv4Addr::new(10, 0, 0, 1),
            ..IccpConfig::default()
        };
        let bridge_a = RecordingBridge::new().with_interface(3, "Vlan10");
        let bridge_b = RecordingBridge::new().with_interface(3, "Vlan10");
        let mut a = Session::new(cfg_a, Box::new(ta), Box::new(bridge_a.clone()));
        let mut b = Session::new(cfg_b, Box::new(tb), Box::new(bridge_b.clone()));
        a.node_id = 40;
        b.node_id = 41;
        add_topology(&mut a);
        add_topology(&mut b);
        (a, bridge_a, b, bridge_b)
    }

    fn run(a: &mut Session, b: &mut Session, ticks: u32, mut now: Instant) -> Instant {
        for _ in 0..ticks {
            a.tick(now);
            b.tick(now);
            now += Duration::from_millis(100);
        }
        now
    }

    fn handshake(a: &mut Session, b: &mut Session) -> Instant {
        let now = run(a, b, 6, Instant::now());
        assert_eq!(a.state, ProtoState::Exchange);
        assert_eq!(b.state, ProtoState::Exchange);
        now
    }

    #[test]
    fn test_handshake_symmetry() {
        let (mut a, _, mut b, _) = pair();
        handshake(&mut a, &mut b);
        // Each side issued exactly one synchronization request and
        // received exactly one full bulk push.
        assert_eq!(a.stats.resync_requests, 1);
        assert_eq!(b.stats.resync_requests, 1);
        assert!(!a.waiting_for_sync_data);
        assert!(!b.waiting_for_sync_data);
        assert!(a.peer.sys.is_some());
        assert!(b.peer.sys.is_some());
        assert_eq!(b.peer.port_channels.get(&1).unwrap().vlans, vec![10]);
        assert_eq!(
            a.peer.peer_link.as_ref().unwrap().ifname,
            "PortChannel100"
        );
    }

    #[test]
    fn test_stage_does_not_advance_while_waiting() {
        let (mut a, _, mut b, _) = pair();
        let now = Instant::now();
        a.tick(now);
        // Active pushed nothing yet; it waits for the standby request.
        assert_eq!(a.state, ProtoState::Stage1);
        b.tick(now);
        assert_eq!(b.state, ProtoState::Stage1);
        assert!(b.waiting_for_sync_data);
    }

    #[test]
    fn test_node_id_collision_converges() {
        let (mut a, _, mut b, _) = pair();
        let now = handshake(&mut a, &mut b);
        a.node_id = 50;
        b.node_id = 50;
        a.announce_system_config();
        b.announce_system_config();
        run(&mut a, &mut b, 10, now);
        assert_ne!(a.node_id, b.node_id);
        // Only the standby decrements; the active side keeps its id.
        assert_eq!(a.node_id, 50);
        assert_eq!(b.node_id, 49);
        assert_eq!(a.peer.sys.as_ref().unwrap().node_id, 49);
    }

    #[test]
    fn test_mac_replication_scenario() {
        let (mut a, _, mut b, bridge_b) = pair();
        let now = handshake(&mut a, &mut b);
        a.on_local_mac_learn(10, mac("aa:bb:cc:dd:ee:ff"), "PortChannel1", false);
        run(&mut a, &mut b, 5, now);

        let key = MacKey::new(10, mac("aa:bb:cc:dd:ee:ff"));
        let entry = b.store.get(&key).expect("entry replicated to standby");
        assert_eq!(entry.origin_ifname, "PortChannel1");
        assert_eq!(entry.ifname, "PortChannel100");
        bridge_b.with_record(|r| {
            assert_eq!(r.programmed, vec![(key, "PortChannel100".to_string())]);
        });
    }

    #[test]
    fn test_peer_delete_unprograms_fdb() {
        let (mut a, _, mut b, bridge_b) = pair();
        let mut now = handshake(&mut a, &mut b);
        a.on_local_mac_learn(10, mac("aa:bb:cc:dd:ee:01"), "PortChannel1", false);
        now = run(&mut a, &mut b, 5, now);
        let key = MacKey::new(10, mac("aa:bb:cc:dd:ee:01"));
        assert!(b.store.get(&key).is_some());

        a.on_local_mac_aged(key, now);
        run(&mut a, &mut b, 5, now);
        assert!(b.store.get(&key).is_none());
        bridge_b.with_record(|r| assert_eq!(r.unprogrammed, vec![key]));
    }

    #[test]
    fn test_if_up_ack_lifts_isolation() {
        let (mut a, bridge_a, mut b, _) = pair();
        let now = handshake(&mut a, &mut b);
        a.on_interface_oper_state("PortChannel1", true, now);
        run(&mut a, &mut b, 5, now);
        // Distribution re-enabled only after the peer's explicit ack.
        bridge_a.with_record(|r| {
            assert!(r
                .distribution
                .contains(&("PortChannel1".to_string(), true)));
        });
        assert!(a.pending_if_up.is_empty());
        assert_eq!(b.peer.aggregate_up.get(&1), Some(&true));
    }

    #[test]
    fn test_state_for_unknown_aggregate_dropped() {
        let (mut a, _, mut b, _) = pair();
        let now = handshake(&mut a, &mut b);
        b.send(&IccpMessage::AggregateState(AggregateState { agg_id: 77, up: true }))
            .unwrap();
        run(&mut a, &mut b, 3, now);
        assert!(!a.peer.aggregate_up.contains_key(&77));
        // Dropped, not NAK'd: transient unready condition.
        assert_eq!(a.stats.naks_sent, 0);
    }

    #[test]
    fn test_reserved_tlv_naks_and_forces_resync() {
        let (mut a, _, mut b, _) = pair();
        let now = handshake(&mut a, &mut b);
        let resyncs_before = b.stats.resync_requests;
        b.send(&IccpMessage::Reserved(crate::tlv::TlvKind::PortConfig))
            .unwrap();
        run(&mut a, &mut b, 4, now);
        assert_eq!(a.stats.naks_sent, 1);
        assert_eq!(b.stats.naks_received, 1);
        // The NAK'd kind was not system-config, so the standby falls
        // back to a general resynchronization request.
        assert_eq!(b.stats.resync_requests, resyncs_before + 1);
    }

    #[test]
    fn test_warm_reboot_suppresses_peer_learned_aging() {
        let (mut a, _, mut b, _) = pair();
        let mut now = handshake(&mut a, &mut b);
        a.on_local_mac_learn(10, mac("aa:bb:cc:dd:ee:02"), "PortChannel1", false);
        now = run(&mut a, &mut b, 5, now);
        let key = MacKey::new(10, mac("aa:bb:cc:dd:ee:02"));
        assert!(b.store.get(&key).is_some());

        // Peer announces an imminent warm reboot.
        a.send(&IccpMessage::WarmReboot { flag: 1 }).unwrap();
        now = run(&mut a, &mut b, 2, now);

        // Aging the peer-learned entry inside the grace window must not
        // produce an outbound delete.
        b.on_local_mac_aged(key, now);
        assert_eq!(b.store.pending_mac_count(), 0);

        // After expiry the same event does.
        now += Duration::from_secs(91);
        b.on_local_mac_aged(key, now);
        assert_eq!(b.store.pending_mac_count(), 1);
    }

    #[test]
    fn test_socket_loss_arms_grace_and_resets() {
        let (ta, tb) = MemoryTransport::pair();
        let cfg = IccpConfig::default();
        let mut a = Session::new(cfg, Box::new(ta), Box::new(RecordingBridge::new()));
        let mut now = Instant::now();
        tb.disconnect();
        a.state = ProtoState::Exchange;
        a.tick(now);
        assert_eq!(a.state, ProtoState::Init);
        assert_eq!(a.stats.resets, 1);
        now += Duration::from_secs(1);
        assert!(a.timers.grace_active(now));
    }

    #[test]
    fn test_malformed_frame_gets_nak_not_teardown() {
        let (t_session, mut t_test) = MemoryTransport::pair();
        let cfg = IccpConfig::default();
        let mut s = Session::new(cfg, Box::new(t_session), Box::new(RecordingBridge::new()));
        let now = Instant::now();
        s.tick(now); // Init -> Stage1

        // Valid header, impossible TLV length.
        let mut frame = [0u8; 16];
        let n = crate::tlv::encode(&mut frame, 9, &IccpMessage::Heartbeat { node_id: 1 }).unwrap();
        BigEndian::write_u16(&mut frame[11..13], 500);
        t_test.send_frame(&frame[..n]).unwrap();

        s.tick(now + Duration::from_millis(100));
        assert_eq!(s.stats.malformed_frames, 1);
        assert_eq!(s.stats.naks_sent, 1);
        assert_ne!(s.state, ProtoState::Error);
        // The NAK references the offending message id.
        let reply = std::iter::from_fn(|| t_test.recv_frame().unwrap())
            .map(|f| crate::tlv::decode(&f).unwrap().1)
            .find_map(|m| match m {
                IccpMessage::Nak(n) => Some(n.rejected_msg_id),
                _ => None,
            });
        assert_eq!(reply, Some(9));
    }

    #[test]
    fn test_heartbeat_once_per_interval() {
        let (mut a, _, mut b, _) = pair();
        let now = handshake(&mut a, &mut b);
        let sent_before = a.stats.msgs_sent;
        // Ten ticks inside one keepalive interval.
        let mut t = now;
        for _ in 0..10 {
            a.tick(t);
            b.tick(t);
            t += Duration::from_millis(50);
        }
        // At most one heartbeat per 1 s keepalive over 500 ms.
        assert!(a.stats.msgs_sent - sent_before <= 1);
    }

    #[test]
    fn test_deferred_deletes_run_after_down_grace() {
        let (mut a, bridge_a, mut b, _) = pair();
        let mut now = handshake(&mut a, &mut b);
        a.on_interface_oper_state("PortChannel1", true, now);
        a.on_local_mac_learn(10, mac("aa:bb:cc:dd:ee:03"), "PortChannel1", false);
        now = run(&mut a, &mut b, 3, now);
        let key = MacKey::new(10, mac("aa:bb:cc:dd:ee:03"));
        a.on_interface_oper_state("PortChannel1", false, now);
        // The down transition itself defers the interface's entries.
        assert!(a.store.get(&key).unwrap().pending_local_del);

        // Inside the down grace: nothing freed, and chip aging does not
        // turn into an immediate delete toward the peer.
        now = run(&mut a, &mut b, 2, now);
        a.on_local_mac_aged(key, now);
        assert_eq!(a.store.pending_mac_count(), 0);
        assert!(a.store.get(&key).is_some());

        // Past the grace: deferred deletion runs and unprograms.
        now += Duration::from_secs(31);
        run(&mut a, &mut b, 2, now);
        assert!(a.store.get(&key).is_none());
        bridge_a.with_record(|r| assert_eq!(r.unprogrammed, vec![key]));
    }
}
