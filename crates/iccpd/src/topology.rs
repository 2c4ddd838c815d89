//! Local topology model
//!
//! In-memory view of local interfaces, port-channels, VLAN membership
//! and the designated peer-link. The session engine serializes this
//! model into configuration/state TLVs; dirty flags mark what needs
//! re-announcement to the peer.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

/// Interface kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfKind {
    Physical,
    PortChannel,
    PeerLink,
}

/// One local interface.
#[derive(Debug, Clone)]
pub struct LocalInterface {
    pub name: String,
    pub id: u16,
    pub kind: IfKind,
    /// Port-channel id for aggregates and their members.
    pub po_id: Option<u16>,
    pub oper_up: bool,
    /// Routed (L3) port-channel.
    pub l3_mode: bool,
    pub ipv4: Option<Ipv4Addr>,
    /// Attached VLAN set; back-reference side of VLAN membership.
    pub vlans: BTreeSet<u16>,
    /// Configuration changed since last announcement.
    pub config_dirty: bool,
    /// Operational state changed since last announcement.
    pub state_dirty: bool,
    /// Set when the interface went administratively down; drives the
    /// deferred MAC deletion grace.
    pub down_since: Option<Instant>,
}

impl LocalInterface {
    pub fn new(name: impl Into<String>, id: u16, kind: IfKind) -> Self {
        Self {
            name: name.into(),
            id,
            kind,
            po_id: None,
            oper_up: false,
            l3_mode: false,
            ipv4: None,
            vlans: BTreeSet::new(),
            config_dirty: true,
            state_dirty: false,
            down_since: None,
        }
    }
}

/// An interface whose peer-link isolation should be lifted, queued
/// until the Exchange tick flushes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeEvent {
    pub ifname: String,
}

/// The local topology model.
#[derive(Debug, Default)]
pub struct Topology {
    interfaces: HashMap<String, LocalInterface>,
    peer_link: Option<String>,
    purge_queue: VecDeque<PurgeEvent>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface(&self, name: &str) -> Option<&LocalInterface> {
        self.interfaces.get(name)
    }

    pub fn interface_mut(&mut self, name: &str) -> Option<&mut LocalInterface> {
        self.interfaces.get_mut(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &LocalInterface> {
        self.interfaces.values()
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn peer_link(&self) -> Option<&str> {
        self.peer_link.as_deref()
    }

    /// Adds or replaces an interface; a replaced interface keeps
    /// nothing from its previous incarnation.
    pub fn add_interface(&mut self, intf: LocalInterface) {
        if intf.kind == IfKind::PeerLink {
            self.peer_link = Some(intf.name.clone());
        }
        self.interfaces.insert(intf.name.clone(), intf);
    }

    pub fn remove_interface(&mut self, name: &str) -> Option<LocalInterface> {
        if self.peer_link.as_deref() == Some(name) {
            self.peer_link = None;
        }
        self.interfaces.remove(name)
    }

    /// Finds a port-channel by its aggregate id.
    pub fn port_channel_by_id(&self, po_id: u16) -> Option<&LocalInterface> {
        self.interfaces
            .values()
            .find(|i| i.kind != IfKind::Physical && i.po_id == Some(po_id))
    }

    /// Records an operational state change, stamping the down timestamp
    /// used for the deferred deletion grace.
    pub fn set_oper_state(&mut self, name: &str, up: bool, now: Instant) -> bool {
        let Some(intf) = self.interfaces.get_mut(name) else {
            return false;
        };
        if intf.oper_up == up {
            return false;
        }
        intf.oper_up = up;
        intf.state_dirty = true;
        intf.down_since = if up { None } else { Some(now) };
        debug!(name, up, "interface state change");
        true
    }

    pub fn add_vlan_member(&mut self, name: &str, vlan: u16) {
        if let Some(intf) = self.interfaces.get_mut(name) {
            if intf.vlans.insert(vlan) {
                intf.config_dirty = true;
            }
        }
    }

    pub fn remove_vlan_member(&mut self, name: &str, vlan: u16) {
        if let Some(intf) = self.interfaces.get_mut(name) {
            if intf.vlans.remove(&vlan) {
                intf.config_dirty = true;
            }
        }
    }

    pub fn set_l3_mode(&mut self, name: &str, ipv4: Option<Ipv4Addr>) {
        if let Some(intf) = self.interfaces.get_mut(name) {
            intf.l3_mode = ipv4.is_some();
            intf.ipv4 = ipv4;
            intf.config_dirty = true;
        }
    }

    /// Drains the names of interfaces with dirty configuration,
    /// clearing the flag.
    pub fn take_config_dirty(&mut self) -> Vec<String> {
        let mut names: Vec<String> = self
            .interfaces
            .values_mut()
            .filter(|i| i.config_dirty)
            .map(|i| {
                i.config_dirty = false;
                i.name.clone()
            })
            .collect();
        names.sort();
        names
    }

    /// Drains the names of interfaces with dirty operational state.
    pub fn take_state_dirty(&mut self) -> Vec<String> {
        let mut names: Vec<String> = self
            .interfaces
            .values_mut()
            .filter(|i| i.state_dirty)
            .map(|i| {
                i.state_dirty = false;
                i.name.clone()
            })
            .collect();
        names.sort();
        names
    }

    /// Interfaces that have been down for longer than `grace`; their
    /// deferred MAC deletions are due.
    pub fn expired_down_interfaces(&self, grace: Duration, now: Instant) -> Vec<String> {
        self.interfaces
            .values()
            .filter(|i| {
                i.down_since
                    .map(|t| now.duration_since(t) >= grace)
                    .unwrap_or(false)
            })
            .map(|i| i.name.clone())
            .collect()
    }

    /// Clears the down timestamp once the deferred deletions ran, so
    /// the grace fires once per down transition.
    pub fn ack_down_expiry(&mut self, name: &str) {
        if let Some(intf) = self.interfaces.get_mut(name) {
            intf.down_since = None;
        }
    }

    pub fn queue_purge(&mut self, ifname: impl Into<String>) {
        let ev = PurgeEvent { ifname: ifname.into() };
        if !self.purge_queue.contains(&ev) {
            self.purge_queue.push_back(ev);
        }
    }

    pub fn drain_purge_events(&mut self) -> Vec<PurgeEvent> {
        self.purge_queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> Topology {
        let mut t = Topology::new();
        let mut po = LocalInterface::new("PortChannel1", 1, IfKind::PortChannel);
        po.po_id = Some(1);
        t.add_interface(po);
        let mut isl = LocalInterface::new("PortChannel100", 100, IfKind::PeerLink);
        isl.po_id = Some(100);
        t.add_interface(isl);
        t
    }

    #[test]
    fn test_peer_link_designation() {
        let t = topo();
        assert_eq!(t.peer_link(), Some("PortChannel100"));
    }

    #[test]
    fn test_port_channel_lookup() {
        let t = topo();
        assert_eq!(t.port_channel_by_id(1).unwrap().name, "PortChannel1");
        assert!(t.port_channel_by_id(7).is_none());
    }

    #[test]
    fn test_state_change_stamps_down_timer() {
        let mut t = topo();
        let now = Instant::now();
        assert!(t.set_oper_state("PortChannel1", true, now));
        assert!(!t.set_oper_state("PortChannel1", true, now));
        assert!(t.set_oper_state("PortChannel1", false, now));
        assert!(t.interface("PortChannel1").unwrap().down_since.is_some());

        let expired = t.expired_down_interfaces(Duration::from_secs(0), now);
        assert_eq!(expired, vec!["PortChannel1".to_string()]);
        t.ack_down_expiry("PortChannel1");
        assert!(t
            .expired_down_interfaces(Duration::from_secs(0), now)
            .is_empty());
    }

    #[test]
    fn test_vlan_membership_marks_dirty() {
        let mut t = topo();
        t.take_config_dirty();
        t.add_vlan_member("PortChannel1", 10);
        t.add_vlan_member("PortChannel1", 10);
        assert_eq!(t.take_config_dirty(), vec!["PortChannel1".to_string()]);
        assert!(t.take_config_dirty().is_empty());
        t.remove_vlan_member("PortChannel1", 10);
        assert_eq!(t.take_config_dirty(), vec!["PortChannel1".to_string()]);
    }

    #[test]
    fn test_purge_queue_dedup() {
        let mut t = topo();
        t.queue_purge("PortChannel1");
        t.queue_purge("PortChannel1");
        assert_eq!(t.drain_purge_events().len(), 1);
        assert!(t.drain_purge_events().is_empty());
    }
}
