//! VN2VN address claiming among several ENodes on one segment.

use crate::*;
use fip_ctlr::{CtlrState, ElsSend, FipError, VnState};
use std::collections::HashSet;

const UP: CtlrState = CtlrState::Vn2Vn(VnState::Up);

fn vn2vn() -> FipConfig {
    config(FipMode::Vn2Vn)
}

fn peer_ids(node: &Node) -> HashSet<String> {
    node.ctlr
        .snapshot()
        .peers
        .into_iter()
        .filter(|p| p.alive)
        .map(|p| p.fc_id)
        .collect()
}

#[test]
fn simultaneous_probe_larger_port_name_keeps_address() {
    let mut cfg = vn2vn();
    cfg.vn2vn.probe_wait_ms = 0;
    let mut seg = Segment::new();
    let low = seg.add_node(cfg.clone(), 0x2000_0000_0000_0101);
    let high = seg.add_node(cfg, 0x2000_0000_0001_0101);
    seg.link_up_all();
    seg.advance(Duration::from_secs(2));

    let (a, b) = (&seg.nodes[low], &seg.nodes[high]);
    assert_eq!(a.ctlr.state(), UP);
    assert_eq!(b.ctlr.state(), UP);
    assert_eq!(b.ctlr.port_id(), 0x0101);
    assert_ne!(a.ctlr.port_id(), 0x0101);
    assert!(a.ctlr.stats().vn_restarts >= 2);
    assert_eq!(b.ctlr.stats().vn_restarts, 1);

    assert!(a.upcalls.contains(&Upcall::Login(b.ctlr.port_id())));
    assert!(b.upcalls.contains(&Upcall::Login(a.ctlr.port_id())));
    assert!(a.upcalls.contains(&Upcall::DiscoveryStart));
}

#[test]
fn claimed_mac_derives_from_address() {
    let mut seg = Segment::new();
    seg.add_node(vn2vn(), 0x2000_0000_0000_0042);
    seg.link_up_all();
    seg.advance(Duration::from_secs(2));

    let node = &seg.nodes[0];
    assert_eq!(node.ctlr.state(), UP);
    assert_eq!(node.ctlr.port_id(), 0x0042);
    let mac = MacAddr::from_fc_map(fip_core::wire::VN_FC_MAP, 0x0042);
    assert_eq!(node.ctlr.data_mac(), mac);
    assert!(node.upcalls.contains(&Upcall::UpdateMac(mac)));

    let kinds: Vec<FrameKind> = node.sent.iter().map(|f| f.kind).collect();
    assert_eq!(
        &kinds[..4],
        &[
            FrameKind::ProbeRequest,
            FrameKind::ProbeRequest,
            FrameKind::ClaimNotify,
            FrameKind::Beacon,
        ]
    );
    assert!(node.sent.iter().all(|f| f.eth.dst == MacAddr::ALL_VN2VN));
}

#[test]
fn many_nodes_end_with_distinct_addresses() {
    const N: u64 = 6;
    let mut seg = Segment::new();
    for i in 0..N {
        // Same low 16 bits everywhere: every node starts on the same candidate.
        seg.add_node(vn2vn(), 0x2000_0000_0000_0101 | ((i + 1) << 32));
    }
    seg.link_up_all();
    seg.advance(Duration::from_secs(10));

    let mut ids = HashSet::new();
    for node in &seg.nodes {
        assert_eq!(node.ctlr.state(), UP, "node {} not up", node.mac);
        assert!(ids.insert(node.ctlr.port_id()), "duplicate address {:06x}", node.ctlr.port_id());
    }
    assert!(ids.contains(&0x0101));

    for node in &seg.nodes {
        let known = peer_ids(node);
        for other in seg.nodes.iter().filter(|o| o.mac != node.mac) {
            let id = format!("{:06x}", other.ctlr.port_id());
            assert!(known.contains(&id), "{} does not know {id}", node.mac);
        }
    }
}

#[test]
fn silent_peer_is_logged_off() {
    let mut seg = Segment::new();
    seg.add_node(vn2vn(), 0x2000_0000_0000_0011);
    seg.add_node(vn2vn(), 0x2000_0000_0000_0022);
    seg.link_up_all();
    seg.advance(Duration::from_secs(2));
    assert!(seg.nodes[0].upcalls.contains(&Upcall::Login(0x0022)));

    seg.nodes[1].ctlr.destroy();
    seg.advance(Duration::from_secs(25));

    let node = &seg.nodes[0];
    assert_eq!(node.ctlr.state(), UP);
    assert!(node.upcalls.contains(&Upcall::Logoff(0x0022)));
    assert!(peer_ids(node).is_empty());
}

#[test]
fn els_routed_to_claimed_peer() {
    let mut seg = Segment::new();
    seg.add_node(vn2vn(), 0x2000_0000_0000_0011);
    seg.add_node(vn2vn(), 0x2000_0000_0000_0022);
    seg.link_up_all();
    seg.advance(Duration::from_secs(2));

    let plogi = ElsFrame::build(R_CTL_ELS_REQ, 0x0022, 0x0011, 7, &[cmd::PLOGI, 0, 0, 0]);
    let dest = MacAddr::from_fc_map(fip_core::wire::VN_FC_MAP, 0x0022);
    assert_eq!(seg.els_send(0, plogi), Ok(ElsSend::PassThrough { dest }));

    // No fabric to log in to.
    assert_eq!(seg.els_send(0, flogi(1)), Err(FipError::Unselectable));
}

#[test]
fn point_to_point_uses_its_own_group() {
    let mut cfg = vn2vn();
    cfg.vn2vn.point_to_point = true;
    let mut seg = Segment::new();
    seg.add_node(cfg.clone(), 0x2000_0000_0000_0011);
    seg.add_node(cfg, 0x2000_0000_0000_0022);
    seg.link_up_all();
    seg.advance(Duration::from_secs(2));

    for node in &seg.nodes {
        assert_eq!(node.ctlr.state(), UP);
        let group: Vec<_> = node.sent.iter().filter(|f| f.eth.dst.is_multicast()).collect();
        assert!(!group.is_empty());
        assert!(group.iter().all(|f| f.eth.dst == MacAddr::ALL_P2P));
        assert!(group.iter().all(|f| f.has_flag(flags::REC_OR_P2P)));
    }
    assert!(seg.nodes[0].upcalls.contains(&Upcall::Login(0x0022)));
    // Point-to-point FLOGI is allowed through.
    assert!(matches!(
        seg.els_send(0, flogi(1)),
        Ok(ElsSend::PassThrough { .. })
    ));
}
