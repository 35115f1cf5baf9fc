//! Fakes shared by the unit tests.

use crate::port::{FcPort, RemotePort, Transport, VirtualPort};
use crate::Controller;
use bytes::Bytes;
use fip_core::config::{FipConfig, FipMode};
use fip_core::desc::{Descriptor, ElsKind};
use fip_core::els::{cmd, ElsFrame, R_CTL_ELS_REP, R_CTL_ELS_REQ};
use fip_core::frame::FipFrame;
use fip_core::wire::{flags, FrameKind, MacAddr, FC_MAP_DEFAULT};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    LinkUp,
    LinkDown,
    UpdateMac(MacAddr),
    DeliverEls(u8),
    Login(u32),
    Logoff(u32),
    DiscoveryStart,
    DiscoveryStop,
    ResetVport(u64),
}

#[derive(Clone, Default)]
pub struct PortLog(Arc<Mutex<Vec<PortCall>>>);

impl PortLog {
    pub fn calls(&self) -> Vec<PortCall> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn push(&self, c: PortCall) {
        self.0.lock().unwrap().push(c);
    }
}

pub struct RecordingPort {
    pub wwpn: u64,
    pub mac: MacAddr,
    pub vports: Vec<VirtualPort>,
    pub log: PortLog,
}

impl FcPort for RecordingPort {
    fn wwpn(&self) -> u64 {
        self.wwpn
    }
    fn wwnn(&self) -> u64 {
        self.wwpn & !(0xfu64 << 56)
    }
    fn source_mac(&self) -> MacAddr {
        self.mac
    }
    fn link_up(&mut self) {
        self.log.push(PortCall::LinkUp);
    }
    fn link_down(&mut self) {
        self.log.push(PortCall::LinkDown);
    }
    fn update_mac(&mut self, mac: MacAddr) {
        self.log.push(PortCall::UpdateMac(mac));
    }
    fn deliver_els(&mut self, els: ElsFrame) {
        self.log.push(PortCall::DeliverEls(els.command()));
    }
    fn rport_login(&mut self, peer: &RemotePort) {
        self.log.push(PortCall::Login(peer.fc_id));
    }
    fn rport_logoff(&mut self, fc_id: u32) {
        self.log.push(PortCall::Logoff(fc_id));
    }
    fn discovery_start(&mut self) {
        self.log.push(PortCall::DiscoveryStart);
    }
    fn discovery_stop(&mut self) {
        self.log.push(PortCall::DiscoveryStop);
    }
    fn virtual_ports(&self) -> Vec<VirtualPort> {
        self.vports.clone()
    }
    fn reset_virtual_port(&mut self, wwpn: u64) {
        self.log.push(PortCall::ResetVport(wwpn));
    }
}

#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<Bytes>>>);

impl Capture {
    /// Decode and clear everything sent so far.
    pub fn take(&self) -> Vec<FipFrame> {
        let frames = std::mem::take(&mut *self.0.lock().unwrap());
        frames
            .iter()
            .map(|b| FipFrame::decode(b).expect("controller sent an undecodable frame"))
            .collect()
    }
}

impl Transport for Capture {
    fn send(&self, frame: Bytes) {
        self.0.lock().unwrap().push(frame);
    }
}

pub const ENODE_MAC: MacAddr = MacAddr([0x00, 0x1b, 0x21, 0x00, 0x00, 0x01]);
pub const WWPN: u64 = 0x2001_001b_2100_0001;

pub struct Rig {
    pub ctlr: Controller,
    pub port: PortLog,
    pub wire: Capture,
}

pub fn rig(mode: FipMode) -> Rig {
    rig_with(mode, WWPN, ENODE_MAC, Vec::new())
}

pub fn rig_with(mode: FipMode, wwpn: u64, mac: MacAddr, vports: Vec<VirtualPort>) -> Rig {
    let mut config = FipConfig::default();
    config.controller.mode = mode;
    config.controller.priority_tag = None;
    rig_config(config, wwpn, mac, vports)
}

pub fn rig_config(config: FipConfig, wwpn: u64, mac: MacAddr, vports: Vec<VirtualPort>) -> Rig {
    let log = PortLog::default();
    let wire = Capture::default();
    let port = RecordingPort {
        wwpn,
        mac,
        vports,
        log: log.clone(),
    };
    let ctlr = Controller::new(config, Box::new(port), Arc::new(wire.clone()));
    Rig {
        ctlr,
        port: log,
        wire,
    }
}

pub fn fcf_mac(n: u8) -> MacAddr {
    MacAddr([0x00, 0x0d, 0xec, 0xaa, 0x00, n])
}

pub fn switch_name(n: u8) -> u64 {
    0x2000_000d_ecaa_0000 | n as u64
}

pub const FABRIC_NAME: u64 = 0x1000_000d_ecaa_0000;

pub fn advertisement(n: u8, priority: u8, solicited: bool) -> Bytes {
    let mut f = flags::AVAIL | flags::FPMA;
    if solicited {
        f |= flags::SOL;
    }
    let dst = if solicited { ENODE_MAC } else { MacAddr::ALL_ENODES };
    FipFrame::new(FrameKind::Advertisement, dst, fcf_mac(n), f)
        .with(Descriptor::Priority(priority))
        .with(Descriptor::Mac(fcf_mac(n)))
        .with(Descriptor::NameId(switch_name(n)))
        .with(Descriptor::Fabric {
            vfid: 0,
            fc_map: FC_MAP_DEFAULT,
            fabric_name: FABRIC_NAME,
        })
        .with(Descriptor::Fka {
            period_ms: 8000,
            no_keepalive: false,
        })
        .encode()
        .unwrap()
}

pub fn flogi(ox_id: u16) -> ElsFrame {
    ElsFrame::build(R_CTL_ELS_REQ, 0xFFFFFE, 0, ox_id, &[cmd::FLOGI, 0, 0, 0])
}

pub fn flogi_acc(ox_id: u16, port_id: u32) -> ElsFrame {
    ElsFrame::build(R_CTL_ELS_REP, port_id, 0xFFFFFE, ox_id, &[cmd::LS_ACC, 0, 0, 0])
}

pub fn fip_flogi_acc(n: u8, ox_id: u16, port_id: u32) -> Bytes {
    FipFrame::new(FrameKind::LsReply, ENODE_MAC, fcf_mac(n), flags::FPMA)
        .with(Descriptor::Els {
            kind: ElsKind::Flogi,
            frame: flogi_acc(ox_id, port_id),
        })
        .with(Descriptor::Mac(MacAddr::from_fc_map(FC_MAP_DEFAULT, port_id)))
        .encode()
        .unwrap()
}

pub fn clear_links(n: u8, vn_ids: &[(MacAddr, u32, u64)]) -> Bytes {
    let mut frame = FipFrame::new(FrameKind::ClearVirtualLinks, ENODE_MAC, fcf_mac(n), 0)
        .with(Descriptor::Mac(fcf_mac(n)))
        .with(Descriptor::NameId(switch_name(n)));
    for &(mac, fc_id, wwpn) in vn_ids {
        frame = frame.with(Descriptor::VnPortId { mac, fc_id, wwpn });
    }
    frame.encode().unwrap()
}

/// A VN2VN frame from a peer with the given identity.
pub fn vn_frame(kind: FrameKind, dst: MacAddr, peer_mac: MacAddr, fc_id: u32, wwpn: u64) -> Bytes {
    let mut frame = FipFrame::new(kind, dst, peer_mac, flags::FPMA)
        .with(Descriptor::Mac(peer_mac))
        .with(Descriptor::NameId(wwpn - 1))
        .with(Descriptor::VnPortId {
            mac: MacAddr::from_fc_map(fip_core::wire::VN_FC_MAP, fc_id),
            fc_id,
            wwpn,
        });
    if matches!(kind, FrameKind::ClaimNotify | FrameKind::ClaimReply) {
        frame = frame
            .with(Descriptor::fcp_features())
            .with(Descriptor::MaxSize(2158));
    }
    frame.encode().unwrap()
}
