//! Fabric login through simulated Forwarders.

use crate::*;
use fip_core::els::{cmd, ElsFrame, R_CTL_ELS_REP};
use fip_ctlr::{CtlrState, ElsSend, FabricState, FipError};

const WWPN: u64 = 0x2000_0000_c9ab_0001;

fn enabled() -> CtlrState {
    CtlrState::Fabric(FabricState::Enabled)
}

/// One node logged in through `fcf`. Returns the assigned FC id.
fn login(seg: &mut Segment, fcf: usize) -> u32 {
    assert_eq!(seg.els_send(0, flogi(0x0100)), Ok(ElsSend::InProgress));
    seg.advance(Duration::from_millis(2100));
    let (mac, port_id) = *seg.fcfs[fcf].logins.last().expect("no FLOGI reached the FCF");
    assert_eq!(mac, seg.nodes[0].mac);
    port_id
}

#[test]
fn single_fcf_login_and_keep_alive() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 128));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();

    assert_eq!(seg.nodes[0].ctlr.state(), enabled());
    assert_eq!(seg.fcfs[fcf].solicitations, 1);

    let port_id = login(&mut seg, fcf);
    let node = &seg.nodes[0];
    let granted = MacAddr::from_fc_map(FC_MAP_DEFAULT, port_id);
    assert_eq!(node.ctlr.port_id(), port_id);
    assert_eq!(node.ctlr.data_mac(), granted);
    assert_eq!(node.ctlr.dest_mac(), seg.fcfs[fcf].mac);
    assert!(node.upcalls.contains(&Upcall::UpdateMac(granted)));
    assert!(node.upcalls.contains(&Upcall::DeliverEls(cmd::LS_ACC)));
    assert!(node.ctlr.snapshot().logged_in);

    seg.advance(Duration::from_secs(20));
    assert!(seg.fcfs[fcf].keep_alives >= 2);
    let snap = seg.nodes[0].ctlr.snapshot();
    assert!(snap.logged_in);
    assert_eq!(snap.fcfs.len(), 1);
    assert!(snap.fcfs[0].selected);
}

#[test]
fn flogi_goes_to_lowest_priority_value() {
    let mut seg = Segment::new();
    seg.add_fcf(SimFcf::new(1, 20));
    let best = seg.add_fcf(SimFcf::new(2, 5));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();

    login(&mut seg, best);
    assert!(seg.fcfs[0].logins.is_empty());
    assert_eq!(seg.nodes[0].ctlr.dest_mac(), seg.fcfs[best].mac);

    let snap = seg.nodes[0].ctlr.snapshot();
    assert_eq!(snap.fcfs.len(), 2);
    assert_eq!(snap.fcfs.iter().filter(|f| f.selected).count(), 1);
}

fn selected_priority(seg: &Segment) -> Option<u8> {
    let snap = seg.nodes[0].ctlr.snapshot();
    snap.fcfs.iter().find(|f| f.selected).map(|f| f.priority)
}

#[test]
fn better_forwarder_before_login_takes_the_flogi() {
    let mut seg = Segment::new();
    let first = seg.add_fcf(SimFcf::new(1, 20));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    seg.advance(Duration::from_millis(2100));
    assert_eq!(selected_priority(&seg), Some(20));

    let best = seg.add_fcf(SimFcf::new(2, 5));
    seg.announce(best);
    // Unicast solicitation answered, then a fresh selection window.
    assert_eq!(seg.fcfs[best].solicitations, 1);
    seg.advance(Duration::from_millis(2100));
    assert_eq!(selected_priority(&seg), Some(5));

    login(&mut seg, best);
    assert!(seg.fcfs[first].logins.is_empty());
    assert_eq!(seg.nodes[0].ctlr.dest_mac(), seg.fcfs[best].mac);
}

#[test]
fn logged_in_node_stays_on_its_forwarder() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 20));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    login(&mut seg, fcf);

    let better = seg.add_fcf(SimFcf::new(2, 5));
    seg.announce(better);
    seg.advance(Duration::from_secs(5));

    let node = &seg.nodes[0];
    assert!(node.ctlr.snapshot().logged_in);
    assert_eq!(node.ctlr.dest_mac(), seg.fcfs[fcf].mac);
    assert_eq!(node.ctlr.snapshot().fcfs.len(), 2);
    assert_eq!(selected_priority(&seg), Some(20));
    assert!(seg.fcfs[better].logins.is_empty());
}

#[test]
fn silent_standby_forwarder_ages_out() {
    let mut seg = Segment::new();
    let active = seg.add_fcf(SimFcf::new(1, 5));
    let standby = seg.add_fcf(SimFcf::new(2, 20));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    login(&mut seg, active);
    assert_eq!(seg.nodes[0].ctlr.snapshot().fcfs.len(), 2);

    seg.fcfs[standby].silent = true;
    seg.advance(Duration::from_secs(20));

    let node = &seg.nodes[0];
    let snap = node.ctlr.snapshot();
    assert_eq!(snap.fcfs.len(), 1);
    assert!(snap.fcfs[0].selected);
    assert!(snap.logged_in);
    assert_eq!(node.ctlr.stats().fcf_lost, 0);
}

#[test]
fn unanswered_forwarder_ages_out() {
    let mut seg = Segment::new();
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();

    // Heard once, never answers the unicast solicitation.
    let ghost = SimFcf::new(7, 1);
    seg.inject(ghost.advertisement(MacAddr::ALL_ENODES, false));
    assert_eq!(seg.nodes[0].ctlr.snapshot().fcfs.len(), 1);
    assert!(seg.nodes[0]
        .sent
        .iter()
        .any(|f| f.kind == FrameKind::Solicitation && f.eth.dst == ghost.mac));

    seg.advance(Duration::from_secs(17));
    assert!(seg.nodes[0].ctlr.snapshot().fcfs.is_empty());
    assert_eq!(seg.els_send(0, flogi(1)), Err(FipError::Unselectable));
}

#[test]
fn clear_virtual_links_forces_new_login() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 128));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    let first = login(&mut seg, fcf);
    seg.nodes[0].upcalls.clear();

    let cvl = seg.fcfs[fcf].clear_link(seg.nodes[0].mac, first, WWPN);
    seg.inject(cvl);

    let node = &seg.nodes[0];
    assert!(!node.ctlr.snapshot().logged_in);
    assert_eq!(node.ctlr.stats().cvl_received, 1);
    let calls = node.upcalls.all();
    let down = calls.iter().position(|c| *c == Upcall::LinkDown);
    let up = calls.iter().position(|c| *c == Upcall::LinkUp);
    assert!(down.is_some() && up > down, "expected link cycle, got {calls:?}");
    // Re-solicited right away.
    assert_eq!(seg.fcfs[fcf].solicitations, 2);

    let second = login(&mut seg, fcf);
    assert_ne!(first, second);
    assert_eq!(seg.nodes[0].ctlr.port_id(), second);
    assert_eq!(seg.fcfs[fcf].logins.len(), 2);
}

#[test]
fn clear_virtual_links_from_other_fcf_ignored() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 128));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    let port_id = login(&mut seg, fcf);

    let stranger = SimFcf::new(9, 1);
    let cvl = stranger.clear_link(seg.nodes[0].mac, port_id, WWPN);
    seg.inject(cvl);

    let node = &seg.nodes[0];
    assert!(node.ctlr.snapshot().logged_in);
    assert_eq!(node.ctlr.stats().cvl_received, 0);
    assert_eq!(node.ctlr.stats().rx_dropped, 1);
}

#[test]
fn silent_fcf_is_dropped_and_link_reset() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 128));
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    login(&mut seg, fcf);
    seg.nodes[0].upcalls.clear();

    seg.fcfs[fcf].silent = true;
    seg.advance(Duration::from_secs(20));

    let node = &seg.nodes[0];
    let snap = node.ctlr.snapshot();
    assert!(!snap.logged_in);
    assert!(snap.fcfs.is_empty());
    assert_eq!(node.ctlr.stats().fcf_lost, 1);
    assert!(node.ctlr.stats().missed_fka >= 1);
    assert!(node.upcalls.contains(&Upcall::LinkDown));
    assert_eq!(node.ctlr.state(), enabled());
}

#[test]
fn flogi_without_forwarder_is_refused() {
    let mut seg = Segment::new();
    seg.add_node(config(FipMode::Fabric), WWPN);
    seg.link_up_all();
    assert_eq!(seg.els_send(0, flogi(1)), Err(FipError::Unselectable));
    assert_eq!(seg.nodes[0].ctlr.stats().els_dropped, 1);
}

// ── Auto mode ─────────────────────────────────────────────────────────────────

#[test]
fn auto_mode_falls_back_to_non_fip() {
    let mut seg = Segment::new();
    seg.add_node(config(FipMode::Auto), WWPN);
    seg.link_up_all();
    assert_eq!(seg.nodes[0].ctlr.state(), CtlrState::Fabric(FabricState::Auto));

    assert_eq!(seg.els_send(0, flogi(1)), Err(FipError::Unselectable));
    assert_eq!(seg.els_send(0, flogi(2)), Err(FipError::Unselectable));
    let dest = MacAddr::from_fc_map(FC_MAP_DEFAULT, 0xFFFFFE);
    assert_eq!(seg.els_send(0, flogi(3)), Ok(ElsSend::PassThrough { dest }));

    let switch = MacAddr([0x00, 0x0d, 0xec, 0xbb, 0x00, 0x01]);
    let acc = ElsFrame::build(R_CTL_ELS_REP, 0x0a0b0c, 0xFFFFFE, 3, &[cmd::LS_ACC, 0, 0, 0]);
    let now = seg.now;
    let node = &mut seg.nodes[0];
    node.ctlr.recv_flogi(now, &acc, switch);

    assert_eq!(node.ctlr.state(), CtlrState::Fabric(FabricState::NonFip));
    assert_eq!(node.ctlr.port_id(), 0x0a0b0c);
    assert_eq!(node.ctlr.dest_mac(), switch);
    let data = MacAddr::from_fc_map(FC_MAP_DEFAULT, 0x0a0b0c);
    assert_eq!(node.ctlr.data_mac(), data);
    assert!(node.upcalls.contains(&Upcall::UpdateMac(data)));
    assert!(!node.ctlr.view().is_fip_active());
}

#[test]
fn auto_mode_switches_to_fip_when_a_forwarder_answers() {
    let mut seg = Segment::new();
    let fcf = seg.add_fcf(SimFcf::new(1, 128));
    seg.add_node(config(FipMode::Auto), WWPN);
    seg.link_up_all();

    assert_eq!(seg.nodes[0].ctlr.state(), enabled());
    assert!(seg.nodes[0].ctlr.view().is_fip_active());
    login(&mut seg, fcf);
    assert!(seg.nodes[0].ctlr.snapshot().logged_in);
}
