//! External collaborator interfaces
//!
//! The surrounding system (kernel neighbor/bridge event source,
//! hardware forwarding-table programming, interface state reporting)
//! is consumed through these traits; register offsets, netlink framing
//! and bus protocols live on the other side of this seam.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::types::{MacAddress, MacKey};

/// A neighbor-table event delivered by the kernel event collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    pub ifindex: u32,
    pub ip: IpAddr,
    pub lladdr: MacAddress,
    pub is_delete: bool,
}

/// Services the engine consumes from and produces into the rest of
/// the switch.
pub trait SystemBridge: Send {
    /// Resolves a kernel interface index to its name.
    fn if_index_to_name(&self, ifindex: u32) -> Option<String>;

    /// Programs a forwarding-table entry.
    fn program_fdb(&mut self, key: MacKey, ifname: &str) -> Result<()>;

    /// Removes a forwarding-table entry.
    fn unprogram_fdb(&mut self, key: MacKey) -> Result<()>;

    /// Enables or disables traffic distribution on an aggregate's
    /// member ports.
    fn set_traffic_distribution(&mut self, ifname: &str, enable: bool) -> Result<()>;

    /// Toggles MAC learning on the peer-link.
    fn set_peer_link_learning(&mut self, ifname: &str, enable: bool) -> Result<()>;
}

/// Shared call record of a [`RecordingBridge`]; clones observe the
/// same history, so a test can keep a handle after the bridge is boxed
/// into a session.
#[derive(Debug, Default)]
pub struct BridgeRecord {
    pub programmed: Vec<(MacKey, String)>,
    pub unprogrammed: Vec<MacKey>,
    pub distribution: Vec<(String, bool)>,
    pub learning: Vec<(String, bool)>,
}

/// Recording implementation used by tests and by the daemon until the
/// hardware bindings are wired in.
#[derive(Debug, Clone, Default)]
pub struct RecordingBridge {
    if_names: Arc<Mutex<Vec<(u32, String)>>>,
    record: Arc<Mutex<BridgeRecord>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interface(self, ifindex: u32, name: impl Into<String>) -> Self {
        self.if_names.lock().unwrap().push((ifindex, name.into()));
        self
    }

    /// Runs `f` against the recorded call history.
    pub fn with_record<R>(&self, f: impl FnOnce(&BridgeRecord) -> R) -> R {
        f(&self.record.lock().unwrap())
    }
}

impl SystemBridge for RecordingBridge {
    fn if_index_to_name(&self, ifindex: u32) -> Option<String> {
        self.if_names
            .lock()
            .unwrap()
            .iter()
            .find(|(idx, _)| *idx == ifindex)
            .map(|(_, name)| name.clone())
    }

    fn program_fdb(&mut self, key: MacKey, ifname: &str) -> Result<()> {
        self.record
            .lock()
            .unwrap()
            .programmed
            .push((key, ifname.to_string()));
        Ok(())
    }

    fn unprogram_fdb(&mut self, key: MacKey) -> Result<()> {
        self.record.lock().unwrap().unprogrammed.push(key);
        Ok(())
    }

    fn set_traffic_distribution(&mut self, ifname: &str, enable: bool) -> Result<()> {
        self.record
            .lock()
            .unwrap()
            .distribution
            .push((ifname.to_string(), enable));
        Ok(())
    }

    fn set_peer_link_learning(&mut self, ifname: &str, enable: bool) -> Result<()> {
        self.record
            .lock()
            .unwrap()
            .learning
            .push((ifname.to_string(), enable));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_bridge_resolution() {
        let bridge = RecordingBridge::new().with_interface(3, "Ethernet0");
        assert_eq!(bridge.if_index_to_name(3), Some("Ethernet0".to_string()));
        assert_eq!(bridge.if_index_to_name(4), None);
    }

    #[test]
    fn test_recording_bridge_captures_programming() {
        let mut bridge = RecordingBridge::new();
        let observer = bridge.clone();
        let key = MacKey::new(10, MacAddress::new([2, 0, 0, 0, 0, 1]));
        bridge.program_fdb(key, "PortChannel1").unwrap();
        bridge.unprogram_fdb(key).unwrap();
        observer.with_record(|r| {
            assert_eq!(r.programmed.len(), 1);
            assert_eq!(r.unprogrammed, vec![key]);
        });
    }
}
