//! End-to-end tests driving two sessions over an in-memory transport
//! pair through the staged handshake and into steady-state exchange.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use pretty_assertions::{assert_eq, assert_ne};

use sonic_iccpd::session::{MemoryTransport, ProtoState, Role, Session};
use sonic_iccpd::system::RecordingBridge;
use sonic_iccpd::topology::{IfKind, LocalInterface};
use sonic_iccpd::{IccpConfig, MacKey};

const TICK: Duration = Duration::from_millis(100);

fn config(role: Role, last_octet: u8) -> IccpConfig {
    IccpConfig {
        role,
        local_addr: Ipv4Addr::new(10, 0, 0, last_octet),
        peer_addr: Ipv4Addr::new(10, 0, 0, 3 - last_octet),
        ..IccpConfig::default()
    }
}

fn populate(session: &mut Session) {
    let mut po = LocalInterface::new("PortChannel1", 1, IfKind::PortChannel);
    po.po_id = Some(1);
    po.vlans.insert(10);
    session.topology.add_interface(po);
    let mut isl = LocalInterface::new("PortChannel100", 100, IfKind::PeerLink);
    isl.po_id = Some(100);
    session.topology.add_interface(isl);
}

fn chassis_pair() -> (Session, Session, RecordingBridge) {
    let (ta, tb) = MemoryTransport::pair();
    let bridge_b = RecordingBridge::new();
    let mut a = Session::new(config(Role::Active, 1), Box::new(ta), Box::new(RecordingBridge::new()));
    let mut b = Session::new(config(Role::Standby, 2), Box::new(tb), Box::new(bridge_b.clone()));
    // Pinned ids keep the collision-resolution path out of these tests.
    a.node_id = 11;
    b.node_id = 22;
    populate(&mut a);
    populate(&mut b);
    (a, b, bridge_b)
}

fn run(a: &mut Session, b: &mut Session, ticks: u32, mut now: Instant) -> Instant {
    for _ in 0..ticks {
        a.tick(now);
        b.tick(now);
        now += TICK;
    }
    now
}

#[test]
fn test_both_chassis_reach_exchange() {
    let (mut a, mut b, _) = chassis_pair();
    run(&mut a, &mut b, 8, Instant::now());

    assert_eq!(a.state, ProtoState::Exchange);
    assert_eq!(b.state, ProtoState::Exchange);
    assert!(!a.waiting_for_sync_data);
    assert!(!b.waiting_for_sync_data);
    // Each side learned the other's identity and aggregate layout.
    assert!(a.peer.sys.is_some());
    assert!(b.peer.sys.is_some());
    assert!(a.peer.aggregates.contains_key(&1));
    assert!(b.peer.aggregates.contains_key(&1));
    assert_ne!(a.node_id, b.node_id);
}

#[test]
fn test_learned_mac_appears_on_standby_via_peer_link() {
    let (mut a, mut b, bridge_b) = chassis_pair();
    let now = run(&mut a, &mut b, 8, Instant::now());

    a.on_local_mac_learn(10, "aa:bb:cc:dd:ee:ff".parse().unwrap(), "PortChannel1", false);
    run(&mut a, &mut b, 6, now);

    let key = MacKey::new(10, "aa:bb:cc:dd:ee:ff".parse().unwrap());
    let entry = b.store.get(&key).expect("replicated entry");
    // The wire carries the origin port; the receiving chassis installs
    // the entry against its own peer-link.
    assert_eq!(entry.origin_ifname, "PortChannel1");
    assert_eq!(entry.ifname, "PortChannel100");
    bridge_b.with_record(|r| {
        assert_eq!(r.programmed, vec![(key, "PortChannel100".to_string())]);
        // Session setup turned kernel learning off on the ISL; the
        // entry above was installed explicitly.
        assert_eq!(r.learning, vec![("PortChannel100".to_string(), false)]);
    });
}

#[test]
fn test_local_age_propagates_as_delete() {
    let (mut a, mut b, bridge_b) = chassis_pair();
    let mut now = run(&mut a, &mut b, 8, Instant::now());

    a.on_local_mac_learn(10, "aa:bb:cc:dd:ee:01".parse().unwrap(), "PortChannel1", false);
    now = run(&mut a, &mut b, 6, now);
    let key = MacKey::new(10, "aa:bb:cc:dd:ee:01".parse().unwrap());
    assert!(b.store.get(&key).is_some());

    a.on_local_mac_aged(key, now);
    run(&mut a, &mut b, 6, now);
    assert!(a.store.get(&key).is_none());
    assert!(b.store.get(&key).is_none());
    bridge_b.with_record(|r| assert_eq!(r.unprogrammed, vec![key]));
}

#[test]
fn test_standby_survives_active_restart() {
    let (mut a, mut b, _) = chassis_pair();
    let mut now = run(&mut a, &mut b, 8, Instant::now());
    a.on_local_mac_learn(10, "aa:bb:cc:dd:ee:02".parse().unwrap(), "PortChannel1", false);
    now = run(&mut a, &mut b, 6, now);
    let key = MacKey::new(10, "aa:bb:cc:dd:ee:02".parse().unwrap());
    assert!(b.store.get(&key).is_some());

    // The active chassis goes away. The standby arms the warm-reboot
    // grace window and keeps forwarding with the replicated table.
    drop(a);
    b.timers.arm_grace(now);
    now += Duration::from_secs(1);
    assert!(b.timers.grace_active(now));

    // A fresh transport pair models the restarted peer; reconnection
    // cancels the window and re-runs the handshake without losing the
    // standby's index.
    let (ta, tb) = MemoryTransport::pair();
    let mut a2 = Session::new(config(Role::Active, 1), Box::new(ta), Box::new(RecordingBridge::new()));
    a2.node_id = 11;
    populate(&mut a2);
    b.reconnect(Box::new(tb));
    assert_eq!(b.state, ProtoState::Init);
    assert!(!b.timers.grace_active(now));
    run(&mut a2, &mut b, 8, now);
    assert_eq!(a2.state, ProtoState::Exchange);
    assert_eq!(b.state, ProtoState::Exchange);
    assert!(b.store.get(&key).is_some());
}
