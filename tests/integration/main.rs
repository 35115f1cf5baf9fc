//! FIP integration test harness.
//!
//! Runs several controllers on a simulated Ethernet segment with a virtual
//! clock. Every frame a controller sends is offered to every other station
//! on the segment; each controller does its own destination filtering.
//! Simulated Forwarders answer solicitations and logins the way a switch
//! would.
//!
//!   cargo test --test integration
//!
//! Nothing here touches a real interface, so the tests need no privileges.

mod fabric;
mod vn2vn;

use bytes::Bytes;
use fip_core::config::{FipConfig, FipMode};
use fip_core::desc::{Descriptor, ElsKind};
use fip_core::els::{cmd, ElsFrame, R_CTL_ELS_REP, R_CTL_ELS_REQ};
use fip_core::frame::FipFrame;
use fip_core::wire::{flags, FrameKind, MacAddr, FC_MAP_DEFAULT};
use fip_ctlr::{Controller, FcPort, RemotePort, Transport};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── Stations ──────────────────────────────────────────────────────────────────

/// What the FC stack above a controller was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upcall {
    LinkUp,
    LinkDown,
    UpdateMac(MacAddr),
    DeliverEls(u8),
    Login(u32),
    Logoff(u32),
    DiscoveryStart,
    DiscoveryStop,
}

#[derive(Clone, Default)]
pub struct Upcalls(Arc<Mutex<Vec<Upcall>>>);

impl Upcalls {
    pub fn all(&self) -> Vec<Upcall> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn contains(&self, call: &Upcall) -> bool {
        self.0.lock().unwrap().contains(call)
    }

    fn push(&self, call: Upcall) {
        self.0.lock().unwrap().push(call);
    }
}

struct StackPort {
    wwpn: u64,
    mac: MacAddr,
    upcalls: Upcalls,
}

impl FcPort for StackPort {
    fn wwpn(&self) -> u64 {
        self.wwpn
    }
    fn wwnn(&self) -> u64 {
        self.wwpn ^ (0x1u64 << 60)
    }
    fn source_mac(&self) -> MacAddr {
        self.mac
    }
    fn link_up(&mut self) {
        self.upcalls.push(Upcall::LinkUp);
    }
    fn link_down(&mut self) {
        self.upcalls.push(Upcall::LinkDown);
    }
    fn update_mac(&mut self, mac: MacAddr) {
        self.upcalls.push(Upcall::UpdateMac(mac));
    }
    fn deliver_els(&mut self, els: ElsFrame) {
        self.upcalls.push(Upcall::DeliverEls(els.command()));
    }
    fn rport_login(&mut self, peer: &RemotePort) {
        self.upcalls.push(Upcall::Login(peer.fc_id));
    }
    fn rport_logoff(&mut self, fc_id: u32) {
        self.upcalls.push(Upcall::Logoff(fc_id));
    }
    fn discovery_start(&mut self) {
        self.upcalls.push(Upcall::DiscoveryStart);
    }
    fn discovery_stop(&mut self) {
        self.upcalls.push(Upcall::DiscoveryStop);
    }
}

/// A station's transmit queue.
#[derive(Clone, Default)]
struct Tap(Arc<Mutex<Vec<Bytes>>>);

impl Tap {
    fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Transport for Tap {
    fn send(&self, frame: Bytes) {
        self.0.lock().unwrap().push(frame);
    }
}

pub struct Node {
    pub ctlr: Controller,
    pub mac: MacAddr,
    pub upcalls: Upcalls,
    tap: Tap,
    /// Frames this node put on the wire, decoded.
    pub sent: Vec<FipFrame>,
}

pub fn node_mac(n: u8) -> MacAddr {
    MacAddr([0x00, 0x1b, 0x21, 0x00, 0x10, n])
}

// ── Simulated Forwarder ───────────────────────────────────────────────────────

pub const FABRIC_NAME: u64 = 0x1000_000d_ecaa_0000;

pub struct SimFcf {
    pub mac: MacAddr,
    pub switch_name: u64,
    pub priority: u8,
    pub fka_ms: u32,
    /// Stops answering and advertising.
    pub silent: bool,
    next_port: u32,
    /// (ENode MAC, assigned FC id) for every accepted FLOGI.
    pub logins: Vec<(MacAddr, u32)>,
    pub keep_alives: u32,
    pub solicitations: u32,
    next_adv: Option<Instant>,
}

impl SimFcf {
    pub fn new(n: u8, priority: u8) -> Self {
        Self {
            mac: MacAddr([0x00, 0x0d, 0xec, 0xaa, 0x00, n]),
            switch_name: 0x2000_000d_ecaa_0000 | n as u64,
            priority,
            fka_ms: 8000,
            silent: false,
            next_port: 0x01_0000 | ((n as u32) << 8),
            logins: Vec::new(),
            keep_alives: 0,
            solicitations: 0,
            next_adv: None,
        }
    }

    pub fn advertisement(&self, dst: MacAddr, solicited: bool) -> Bytes {
        let mut f = flags::AVAIL | flags::FPMA;
        if solicited {
            f |= flags::SOL;
        }
        FipFrame::new(FrameKind::Advertisement, dst, self.mac, f)
            .with(Descriptor::Priority(self.priority))
            .with(Descriptor::Mac(self.mac))
            .with(Descriptor::NameId(self.switch_name))
            .with(Descriptor::Fabric {
                vfid: 0,
                fc_map: FC_MAP_DEFAULT,
                fabric_name: FABRIC_NAME,
            })
            .with(Descriptor::Fka {
                period_ms: self.fka_ms,
                no_keepalive: false,
            })
            .encode()
            .unwrap()
    }

    /// Clear Virtual Links naming one logged-in port.
    pub fn clear_link(&self, enode: MacAddr, fc_id: u32, wwpn: u64) -> Bytes {
        FipFrame::new(FrameKind::ClearVirtualLinks, enode, self.mac, 0)
            .with(Descriptor::Mac(self.mac))
            .with(Descriptor::NameId(self.switch_name))
            .with(Descriptor::VnPortId {
                mac: MacAddr::from_fc_map(FC_MAP_DEFAULT, fc_id),
                fc_id,
                wwpn,
            })
            .encode()
            .unwrap()
    }

    fn react(&mut self, frame: &FipFrame) -> Vec<Bytes> {
        if self.silent {
            return Vec::new();
        }
        match frame.kind {
            FrameKind::Solicitation
                if frame.eth.dst == MacAddr::ALL_FCFS || frame.eth.dst == self.mac =>
            {
                self.solicitations += 1;
                let enode = frame.mac().unwrap_or(frame.eth.src);
                vec![self.advertisement(enode, true)]
            }
            FrameKind::LsRequest if frame.eth.dst == self.mac => {
                let Some((ElsKind::Flogi, els)) = frame.els() else {
                    return Vec::new();
                };
                let port_id = self.next_port;
                self.next_port += 1;
                self.logins.push((frame.eth.src, port_id));
                let acc = ElsFrame::build(
                    R_CTL_ELS_REP,
                    port_id,
                    0xFFFFFE,
                    els.ox_id(),
                    &[cmd::LS_ACC, 0, 0, 0],
                );
                let reply = FipFrame::new(FrameKind::LsReply, frame.eth.src, self.mac, flags::FPMA)
                    .with(Descriptor::Els {
                        kind: ElsKind::Flogi,
                        frame: acc,
                    })
                    .with(Descriptor::Mac(MacAddr::from_fc_map(FC_MAP_DEFAULT, port_id)));
                vec![reply.encode().unwrap()]
            }
            FrameKind::KeepAlive if frame.eth.dst == self.mac => {
                self.keep_alives += 1;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.fka_ms))
    }
}

// ── Segment ───────────────────────────────────────────────────────────────────

/// One broadcast domain with a virtual clock.
pub struct Segment {
    pub now: Instant,
    pub nodes: Vec<Node>,
    pub fcfs: Vec<SimFcf>,
    /// Frames injected by the test or sent by a Forwarder, not yet delivered.
    pending: Vec<Bytes>,
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

impl Segment {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            nodes: Vec::new(),
            fcfs: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Add a controller. Returns its index.
    pub fn add_node(&mut self, config: FipConfig, wwpn: u64) -> usize {
        let n = self.nodes.len();
        let mac = node_mac(n as u8 + 1);
        let upcalls = Upcalls::default();
        let tap = Tap::default();
        let port = StackPort {
            wwpn,
            mac,
            upcalls: upcalls.clone(),
        };
        let ctlr = Controller::new(config, Box::new(port), Arc::new(tap.clone()));
        self.nodes.push(Node {
            ctlr,
            mac,
            upcalls,
            tap,
            sent: Vec::new(),
        });
        n
    }

    pub fn add_fcf(&mut self, fcf: SimFcf) -> usize {
        let mut fcf = fcf;
        fcf.next_adv = Some(self.now + fcf.period());
        self.fcfs.push(fcf);
        self.fcfs.len() - 1
    }

    pub fn link_up_all(&mut self) {
        let now = self.now;
        for node in &mut self.nodes {
            node.ctlr.link_up(now);
        }
        self.pump();
    }

    /// Put a frame on the wire as if some other station sent it.
    pub fn inject(&mut self, frame: Bytes) {
        self.pending.push(frame);
        self.pump();
    }

    /// Have a Forwarder advertise now instead of waiting for its period.
    pub fn announce(&mut self, fcf: usize) {
        let adv = self.fcfs[fcf].advertisement(MacAddr::ALL_ENODES, false);
        self.inject(adv);
    }

    /// Deliver frames until the segment is quiet.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let mut wire: Vec<(Option<usize>, Bytes)> =
                self.pending.drain(..).map(|b| (None, b)).collect();
            for (i, node) in self.nodes.iter_mut().enumerate() {
                for bytes in node.tap.drain() {
                    let frame = FipFrame::decode(&bytes).expect("controller sent a bad frame");
                    node.sent.push(frame);
                    wire.push((Some(i), bytes));
                }
            }
            if wire.is_empty() {
                return;
            }
            let now = self.now;
            for (from, bytes) in wire {
                for (i, node) in self.nodes.iter_mut().enumerate() {
                    if from != Some(i) {
                        node.ctlr.recv(now, &bytes);
                    }
                }
                if from.is_some() {
                    let frame = FipFrame::decode(&bytes).expect("controller sent a bad frame");
                    for fcf in &mut self.fcfs {
                        self.pending.extend(fcf.react(&frame));
                    }
                }
            }
        }
        panic!("segment never went quiet");
    }

    fn next_event(&self) -> Option<Instant> {
        let nodes = self.nodes.iter().filter_map(|n| n.ctlr.next_deadline());
        let fcfs = self
            .fcfs
            .iter()
            .filter(|f| !f.silent)
            .filter_map(|f| f.next_adv);
        nodes.chain(fcfs).min()
    }

    /// Run every timer due up to `until`, then leave the clock there.
    pub fn advance_to(&mut self, until: Instant) {
        self.pump();
        while let Some(t) = self.next_event().filter(|t| *t <= until) {
            self.now = self.now.max(t);
            let now = self.now;
            for node in &mut self.nodes {
                if node.ctlr.next_deadline().is_some_and(|d| d <= now) {
                    node.ctlr.on_timer(now);
                }
            }
            for fcf in &mut self.fcfs {
                if fcf.silent {
                    continue;
                }
                if fcf.next_adv.is_some_and(|d| d <= now) {
                    self.pending.push(fcf.advertisement(MacAddr::ALL_ENODES, false));
                    fcf.next_adv = Some(now + fcf.period());
                }
            }
            self.pump();
        }
        self.now = self.now.max(until);
    }

    pub fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        self.advance_to(until);
    }

    /// Hand an ELS from the node's FC stack to its controller.
    pub fn els_send(
        &mut self,
        node: usize,
        els: ElsFrame,
    ) -> Result<fip_ctlr::ElsSend, fip_ctlr::FipError> {
        let now = self.now;
        let out = self.nodes[node].ctlr.els_send(now, els);
        self.pump();
        out
    }
}

// ── Frame helpers ─────────────────────────────────────────────────────────────

pub fn flogi(ox_id: u16) -> ElsFrame {
    ElsFrame::build(R_CTL_ELS_REQ, 0xFFFFFE, 0, ox_id, &[cmd::FLOGI, 0, 0, 0])
}

pub fn config(mode: FipMode) -> FipConfig {
    let mut config = FipConfig::default();
    config.controller.mode = mode;
    config
}
