//! MAC/Neighbor store
//!
//! Ordered index of learned MAC entries keyed by (VLAN, address), plus
//! pending-operation queues for MAC, ARP and IPv6-neighbor updates. The
//! store is the single owner of every entry; the pending queues hold
//! keys only, and the `queued` flag keeps an entry in at most one queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::tlv::{MacSyncEntry, NeighborSyncEntry, SyncOp};
use crate::types::{MacAddress, MacKey};

/// Whether an entry was provisioned statically or learned dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEntryType {
    Dynamic,
    Static,
}

/// Which side reported an aging event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeOrigin {
    /// Local forwarding chip aged the entry out.
    Local,
    /// Peer notified us that its copy aged out.
    Peer,
}

/// Result of an aging notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AgeOutcome {
    /// Entry retained; the other side still holds a valid copy.
    Kept,
    /// Both sides have released the entry; caller must unprogram the
    /// forwarding table and commit the deletion.
    ReadyForDelete,
    /// No such entry.
    Unknown,
}

/// One learned MAC table entry.
#[derive(Debug, Clone)]
pub struct MacEntry {
    pub key: MacKey,
    /// Interface the entry currently forwards out of.
    pub ifname: String,
    /// Physical port the address was learned on before any peer-link
    /// remap; this is what crosses the wire.
    pub origin_ifname: String,
    pub entry_type: MacEntryType,
    pub op: SyncOp,
    /// Aged out by the local chip.
    pub age_local: bool,
    /// Aged out by the peer. Both bits set is a transient state that
    /// resolves to deletion.
    pub age_peer: bool,
    /// Deletion deferred until the owning interface has been down for
    /// the full local down-timer grace.
    pub pending_local_del: bool,
    /// Present in the pending sync queue.
    queued: bool,
}

impl MacEntry {
    pub fn new(key: MacKey, ifname: impl Into<String>, entry_type: MacEntryType) -> Self {
        let ifname = ifname.into();
        Self {
            key,
            origin_ifname: ifname.clone(),
            ifname,
            entry_type,
            op: SyncOp::Add,
            age_local: false,
            age_peer: false,
            pending_local_del: false,
            queued: false,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin_ifname = origin.into();
        self
    }
}

/// Key of the neighbor index: address plus owning interface, no VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeighborKey {
    pub ip: IpAddr,
    pub ifname: String,
}

/// One ARP or IPv6-neighbor entry; the two families share a shape
/// and differ only in the address.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub key: NeighborKey,
    pub lladdr: MacAddress,
    pub op: SyncOp,
    queued: bool,
}

/// The MAC/Neighbor store.
#[derive(Debug)]
pub struct MacStore {
    /// Total order over (VLAN, address), no duplicate keys.
    index: BTreeMap<MacKey, MacEntry>,
    pending_macs: VecDeque<MacKey>,
    neighbors: HashMap<NeighborKey, NeighborEntry>,
    pending_arp: VecDeque<NeighborKey>,
    pending_nd: VecDeque<NeighborKey>,
    /// Name of the designated peer-link; entries pointing here were
    /// learned from the peer.
    peer_link: String,
}

impl MacStore {
    pub fn new(peer_link: impl Into<String>) -> Self {
        Self {
            index: BTreeMap::new(),
            pending_macs: VecDeque::new(),
            neighbors: HashMap::new(),
            pending_arp: VecDeque::new(),
            pending_nd: VecDeque::new(),
            peer_link: peer_link.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &MacKey) -> Option<&MacEntry> {
        self.index.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MacEntry> {
        self.index.values()
    }

    pub fn neighbor(&self, key: &NeighborKey) -> Option<&NeighborEntry> {
        self.neighbors.get(key)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.neighbors.values()
    }

    pub fn pending_mac_count(&self) -> usize {
        self.pending_macs.len()
    }

    /// True if the key currently sits in the pending sync queue.
    pub fn is_queued(&self, key: &MacKey) -> bool {
        self.index.get(key).map(|e| e.queued).unwrap_or(false)
    }

    /// Inserts or updates a locally learned entry and queues it for
    /// peer transmission.
    ///
    /// An entry that still carries the "aged out locally" marker while
    /// sitting on the peer-link is intentionally withheld: the peer
    /// will resupply it, and pushing our stale view would race the
    /// resupply.
    pub fn upsert(&mut self, mut entry: MacEntry) {
        if let Some(existing) = self.index.get_mut(&entry.key) {
            if existing.age_local && entry.ifname == self.peer_link {
                existing.ifname = entry.ifname;
                existing.origin_ifname = entry.origin_ifname;
                existing.entry_type = entry.entry_type;
                debug!(key = %existing.key, "withholding aged-out entry on peer-link from sync");
                return;
            }
            existing.ifname = entry.ifname;
            existing.origin_ifname = entry.origin_ifname;
            existing.entry_type = entry.entry_type;
            existing.age_local = false;
            existing.age_peer = false;
            existing.pending_local_del = false;
            existing.op = SyncOp::Add;
            if !existing.queued {
                existing.queued = true;
                self.pending_macs.push_back(existing.key);
            }
            return;
        }
        entry.age_local = false;
        entry.age_peer = false;
        entry.op = SyncOp::Add;
        entry.queued = true;
        self.pending_macs.push_back(entry.key);
        self.index.insert(entry.key, entry);
    }

    /// Installs an entry learned from the peer. Peer-sourced updates
    /// clear age markers but are never echoed back.
    pub fn upsert_from_peer(&mut self, key: MacKey, origin_ifname: &str, entry_type: MacEntryType) {
        let entry = self
            .index
            .entry(key)
            .or_insert_with(|| MacEntry::new(key, self.peer_link.clone(), entry_type));
        entry.ifname = self.peer_link.clone();
        entry.origin_ifname = origin_ifname.to_string();
        entry.entry_type = entry_type;
        entry.age_local = false;
        entry.age_peer = false;
        entry.pending_local_del = false;
    }

    /// Records an aging event.
    ///
    /// `suppress_peer_learned` is set while a warm-reboot grace window
    /// is armed: local age events for peer-learned entries are then
    /// absorbed without generating an outbound delete.
    pub fn mark_aged(
        &mut self,
        key: &MacKey,
        origin: AgeOrigin,
        suppress_peer_learned: bool,
    ) -> AgeOutcome {
        let peer_link = self.peer_link.clone();
        let Some(entry) = self.index.get_mut(key) else {
            return AgeOutcome::Unknown;
        };
        match origin {
            AgeOrigin::Local => {
                entry.age_local = true;
                if entry.age_peer {
                    return AgeOutcome::ReadyForDelete;
                }
                let peer_learned = entry.ifname == peer_link;
                if peer_learned && suppress_peer_learned {
                    // Peer is warm-rebooting; a delete now would be a
                    // false removal. Drop any queued add as well.
                    if entry.queued {
                        entry.queued = false;
                        self.pending_macs.retain(|k| k != key);
                    }
                    return AgeOutcome::Kept;
                }
                if entry.pending_local_del {
                    // The interface is riding out its down grace; the
                    // deferred deletion already owns this entry.
                    if entry.queued {
                        entry.queued = false;
                        self.pending_macs.retain(|k| k != key);
                    }
                    return AgeOutcome::Kept;
                }
                entry.op = SyncOp::Del;
                if !entry.queued {
                    entry.queued = true;
                    self.pending_macs.push_back(*key);
                }
                AgeOutcome::Kept
            }
            AgeOrigin::Peer => {
                entry.age_peer = true;
                if entry.age_local || entry.ifname == peer_link {
                    // Nobody holds a live copy any more.
                    return AgeOutcome::ReadyForDelete;
                }
                // We still forward out of a local port; keep the entry
                // so the peer can relearn it from our next sync.
                AgeOutcome::Kept
            }
        }
    }

    /// Marks every entry owned by the interface for deletion once the
    /// interface has been down for the full local grace period.
    pub fn defer_delete_for_interface(&mut self, ifname: &str) {
        for entry in self.index.values_mut() {
            if entry.ifname == ifname {
                entry.pending_local_del = true;
            }
        }
    }

    /// Finalizes a release both sides have agreed on. Dynamic entries
    /// are freed; static entries retain their record and only clear the
    /// pending-delete flag.
    pub fn commit_delete(&mut self, key: &MacKey) {
        let Some(entry) = self.index.get_mut(key) else {
            return;
        };
        match entry.entry_type {
            MacEntryType::Static => {
                entry.pending_local_del = false;
                entry.age_local = false;
                entry.age_peer = false;
                if entry.queued {
                    entry.queued = false;
                    self.pending_macs.retain(|k| k != key);
                }
            }
            MacEntryType::Dynamic => {
                if entry.queued {
                    self.pending_macs.retain(|k| k != key);
                }
                self.index.remove(key);
            }
        }
    }

    /// Performs the deferred local-only deletions accumulated while an
    /// interface sat administratively down, returning the freed keys so
    /// the caller can unprogram the forwarding table.
    pub fn clear_pending_for_interface(&mut self, ifname: &str) -> Vec<MacKey> {
        let keys: Vec<MacKey> = self
            .index
            .values()
            .filter(|e| e.pending_local_del && e.ifname == ifname)
            .map(|e| e.key)
            .collect();
        for key in &keys {
            let Some(entry) = self.index.get_mut(key) else {
                continue;
            };
            let entry_type = entry.entry_type;
            if entry.queued {
                entry.queued = false;
                self.pending_macs.retain(|k| k != key);
            }
            match entry_type {
                MacEntryType::Dynamic => {
                    self.index.remove(key);
                }
                MacEntryType::Static => {
                    if let Some(e) = self.index.get_mut(key) {
                        e.pending_local_del = false;
                    }
                }
            }
        }
        if !keys.is_empty() {
            debug!(ifname, count = keys.len(), "flushed deferred MAC deletions");
        }
        keys
    }

    /// Produces up to `max_batch` queued MAC entries as wire entries and
    /// removes them from the pending queue. Records marked for deletion
    /// are freed here once dequeued (dynamic) or retained with cleared
    /// flags (static).
    pub fn drain_outbound(&mut self, max_batch: usize) -> Vec<MacSyncEntry> {
        let mut out = Vec::new();
        while out.len() < max_batch {
            let Some(key) = self.pending_macs.pop_front() else {
                break;
            };
            let Some(entry) = self.index.get_mut(&key) else {
                warn!(%key, "pending queue referenced a freed entry");
                continue;
            };
            entry.queued = false;
            debug_assert!(
                !(entry.age_local && entry.op == SyncOp::Add),
                "aged-out entry must not be re-synchronized"
            );
            out.push(MacSyncEntry {
                op: entry.op,
                mac: key.mac,
                vlan: key.vlan,
                ifname: entry.origin_ifname.clone(),
            });
            let (op, entry_type) = (entry.op, entry.entry_type);
            if op == SyncOp::Del {
                match entry_type {
                    MacEntryType::Dynamic => {
                        self.index.remove(&key);
                    }
                    MacEntryType::Static => {
                        if let Some(e) = self.index.get_mut(&key) {
                            e.pending_local_del = false;
                        }
                    }
                }
            }
        }
        out
    }

    /// Inserts or updates a neighbor (ARP/ND) entry and queues it.
    pub fn upsert_neighbor(&mut self, key: NeighborKey, lladdr: MacAddress, op: SyncOp) {
        let queue = if key.ip.is_ipv4() {
            &mut self.pending_arp
        } else {
            &mut self.pending_nd
        };
        match self.neighbors.get_mut(&key) {
            Some(existing) => {
                existing.lladdr = lladdr;
                existing.op = op;
                if !existing.queued {
                    existing.queued = true;
                    queue.push_back(key);
                }
            }
            None => {
                queue.push_back(key.clone());
                self.neighbors.insert(
                    key.clone(),
                    NeighborEntry {
                        key,
                        lladdr,
                        op,
                        queued: true,
                    },
                );
            }
        }
    }

    /// Installs a neighbor entry received from the peer; not echoed.
    pub fn upsert_neighbor_from_peer(&mut self, key: NeighborKey, lladdr: MacAddress, op: SyncOp) {
        match op {
            SyncOp::Del => {
                self.neighbors.remove(&key);
            }
            _ => {
                let entry = self.neighbors.entry(key.clone()).or_insert(NeighborEntry {
                    key,
                    lladdr,
                    op: SyncOp::Add,
                    queued: false,
                });
                entry.lladdr = lladdr;
            }
        }
    }

    /// Re-queues every known neighbor entry for a full push; used when a
    /// session re-enters Init and on explicit sync requests.
    pub fn requeue_all_neighbors(&mut self) {
        let keys: Vec<NeighborKey> = self.neighbors.keys().cloned().collect();
        for key in keys {
            let Some(entry) = self.neighbors.get_mut(&key) else {
                continue;
            };
            if !entry.queued {
                entry.queued = true;
                if key.ip.is_ipv4() {
                    self.pending_arp.push_back(key);
                } else {
                    self.pending_nd.push_back(key);
                }
            }
        }
    }

    /// Re-queues every locally owned MAC entry that is eligible for
    /// sync (aged-out-locally entries stay withheld until cleared).
    pub fn requeue_all_macs(&mut self) {
        let keys: Vec<MacKey> = self
            .index
            .values()
            .filter(|e| !e.age_local && e.ifname != self.peer_link)
            .map(|e| e.key)
            .collect();
        for key in keys {
            let Some(entry) = self.index.get_mut(&key) else {
                continue;
            };
            if !entry.queued {
                entry.queued = true;
                entry.op = SyncOp::Add;
                self.pending_macs.push_back(key);
            }
        }
    }

    /// Drains up to `max_batch` queued IPv4 (ARP) or IPv6 (ND)
    /// neighbor entries.
    pub fn drain_neighbors(&mut self, v6: bool, max_batch: usize) -> Vec<NeighborSyncEntry> {
        let queue = if v6 {
            &mut self.pending_nd
        } else {
            &mut self.pending_arp
        };
        let mut out = Vec::new();
        while out.len() < max_batch {
            let Some(key) = queue.pop_front() else {
                break;
            };
            let Some(entry) = self.neighbors.get_mut(&key) else {
                continue;
            };
            entry.queued = false;
            out.push(NeighborSyncEntry {
                op: entry.op,
                ifname: key.ifname.clone(),
                ip: key.ip,
                lladdr: entry.lladdr,
            });
            if entry.op == SyncOp::Del {
                self.neighbors.remove(&key);
            }
        }
        out
    }

    /// Clears queues; with `drop_index` the MAC index itself is emptied
    /// (full reset) rather than preserved (reconnect-preserving reset).
    pub fn reset(&mut self, drop_index: bool) {
        self.pending_macs.clear();
        self.pending_arp.clear();
        self.pending_nd.clear();
        if drop_index {
            self.index.clear();
            self.neighbors.clear();
        } else {
            for entry in self.index.values_mut() {
                entry.queued = false;
            }
            for entry in self.neighbors.values_mut() {
                entry.queued = false;
            }
        }
    }

}
