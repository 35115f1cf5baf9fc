//! The FIP controller context.
//!
//! One [`Controller`] exists per Ethernet interface. It is sans-IO: every
//! entry point takes the current time, frames leave through [`Transport`],
//! and the caller drives a single deadline timer through
//! [`Controller::on_timer`]. Fabric discovery lives in `fabric.rs` and
//! VN2VN address claiming in `vn2vn.rs`; both extend this type.

use crate::error::FipError;
use crate::fcf::{FcfRegistry, FcfSummary};
use crate::flogi::FlogiSlot;
use crate::peer::{PeerSummary, PeerTable};
use crate::port::{FcPort, RportEvent, Transport};
use crate::state::{handler_for, transition, CtlrState, Event, Handler, StateView};
use fip_core::config::{FipConfig, FipMode};
use fip_core::els::{cmd, ElsFrame, XID_UNKNOWN};
use fip_core::frame::FipFrame;
use fip_core::wire::{wwn_string, MacAddr, VlanTag, FIP_VERSION};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// What the caller should do with an ELS after [`Controller::els_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElsSend {
    /// The controller took the frame and will send it encapsulated in FIP.
    InProgress,
    /// Send it as plain FCoE to `dest`.
    PassThrough { dest: MacAddr },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub rx_frames: u64,
    pub rx_malformed: u64,
    pub rx_dropped: u64,
    pub tx_frames: u64,
    pub els_dropped: u64,
    pub missed_fka: u64,
    pub fcf_lost: u64,
    pub cvl_received: u64,
    pub vn_restarts: u64,
}

/// Point-in-time copy of the controller for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: &'static str,
    pub mode: FipMode,
    pub wwpn: String,
    pub wwnn: String,
    pub ctl_mac: String,
    pub data_mac: String,
    pub port_id: String,
    pub dest_mac: String,
    pub logged_in: bool,
    pub flogi_pending: bool,
    pub fcfs: Vec<FcfSummary>,
    pub peers: Vec<PeerSummary>,
    pub stats: Stats,
}

pub struct Controller {
    pub(crate) config: FipConfig,
    pub(crate) mode: FipMode,
    pub(crate) port: Box<dyn FcPort>,
    transport: Arc<dyn Transport>,
    pub(crate) state: CtlrState,
    view: StateView,

    pub(crate) wwpn: u64,
    pub(crate) wwnn: u64,
    /// ENode MAC: source of every FIP frame.
    pub(crate) ctl_mac: MacAddr,
    /// Granted or claimed data-path MAC.
    pub(crate) data_mac: MacAddr,
    /// Fabric-assigned or self-claimed FC address.
    pub(crate) port_id: u32,
    /// Where pass-through FCoE goes. Zero until learned.
    pub(crate) dest_mac: MacAddr,
    pub(crate) logged_in: bool,

    pub(crate) fcfs: FcfRegistry,
    pub(crate) peers: PeerTable,
    pub(crate) flogi: FlogiSlot,
    pub(crate) flogi_oxid: u16,
    pub(crate) flogi_count: u32,

    /// Last multicast solicitation (fabric) or claim (VN2VN).
    pub(crate) sol_time: Option<Instant>,
    pub(crate) sel_time: Option<Instant>,
    pub(crate) ctlr_ka_time: Option<Instant>,
    /// Next per-port keep-alive (fabric) or beacon (VN2VN).
    pub(crate) port_ka_time: Option<Instant>,
    pub(crate) probe_tries: u32,
    pub(crate) rng: ChaCha20Rng,

    timer: Option<Instant>,
    pub(crate) stats: Stats,
}

impl Controller {
    pub fn new(config: FipConfig, port: Box<dyn FcPort>, transport: Arc<dyn Transport>) -> Self {
        let wwpn = match config.controller.wwpn {
            0 => port.wwpn(),
            w => w,
        };
        let wwnn = match config.controller.wwnn {
            0 => port.wwnn(),
            w => w,
        };
        let ctl_mac = port.source_mac();
        let mode = config.controller.mode;
        let fcfs = FcfRegistry::new(
            config.fabric.fcf_limit,
            config.fabric.default_fka(),
            std::time::Duration::from_millis(config.fabric.min_fka_ms),
        );
        let peers = PeerTable::new(config.vn2vn.peer_limit);
        info!(
            mode = ?mode,
            wwpn = %wwn_string(wwpn),
            mac = %ctl_mac,
            "FIP controller initialized"
        );
        Self {
            config,
            mode,
            port,
            transport,
            state: CtlrState::LinkWait,
            view: StateView::new(CtlrState::LinkWait),
            wwpn,
            wwnn,
            ctl_mac,
            data_mac: MacAddr::ZERO,
            port_id: 0,
            dest_mac: MacAddr::ZERO,
            logged_in: false,
            fcfs,
            peers,
            flogi: FlogiSlot::default(),
            flogi_oxid: XID_UNKNOWN,
            flogi_count: 0,
            sol_time: None,
            sel_time: None,
            ctlr_ka_time: None,
            port_ka_time: None,
            probe_tries: 0,
            rng: ChaCha20Rng::seed_from_u64(wwpn),
            timer: None,
            stats: Stats::default(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> CtlrState {
        self.state
    }

    pub fn mode(&self) -> FipMode {
        self.mode
    }

    /// Lock-free view of the state for other tasks.
    pub fn view(&self) -> StateView {
        self.view.clone()
    }

    pub fn flogi_slot(&self) -> FlogiSlot {
        self.flogi.clone()
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    pub fn data_mac(&self) -> MacAddr {
        self.data_mac
    }

    pub fn dest_mac(&self) -> MacAddr {
        self.dest_mac
    }

    pub fn wwpn(&self) -> u64 {
        self.wwpn
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// When [`Controller::on_timer`] should next run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.name(),
            mode: self.mode,
            wwpn: wwn_string(self.wwpn),
            wwnn: wwn_string(self.wwnn),
            ctl_mac: self.ctl_mac.to_string(),
            data_mac: self.data_mac.to_string(),
            port_id: format!("{:06x}", self.port_id),
            dest_mac: self.dest_mac.to_string(),
            logged_in: self.logged_in,
            flogi_pending: self.flogi.is_pending(),
            fcfs: self.fcfs.summaries(),
            peers: self.peers.summaries(),
            stats: self.stats.clone(),
        }
    }

    // ── Link events ──────────────────────────────────────────────────────────

    pub fn link_up(&mut self, now: Instant) {
        match self.state {
            CtlrState::LinkWait => {
                self.apply(Event::LinkUp(self.mode));
                info!(state = %self.state, "link up");
                match self.mode {
                    FipMode::Vn2Vn => {
                        self.port.link_up();
                        self.vn_start(now);
                    }
                    FipMode::Auto | FipMode::Fabric | FipMode::NonFip => {
                        self.port.link_up();
                        self.solicit(now, None);
                    }
                }
            }
            CtlrState::Fabric(_) => {
                self.port.link_up();
                self.solicit(now, None);
            }
            CtlrState::Disabled | CtlrState::Vn2Vn(_) => {}
        }
    }

    /// Returns whether the link was up before.
    pub fn link_down(&mut self, _now: Instant) -> bool {
        let was_up = !matches!(self.state, CtlrState::LinkWait | CtlrState::Disabled);
        self.reset();
        self.apply(Event::LinkDown);
        if was_up {
            info!("link down");
            self.port.link_down();
        }
        was_up
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Process one received FIP frame.
    pub fn recv(&mut self, now: Instant, bytes: &[u8]) {
        self.stats.rx_frames += 1;
        let frame = match FipFrame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                self.stats.rx_malformed += 1;
                debug!(error = %e, "malformed FIP frame dropped");
                return;
            }
        };
        if let Err(e) = self.dispatch(now, &frame) {
            self.stats.rx_dropped += 1;
            debug!(kind = ?frame.kind, src = %frame.eth.src, error = %e, "FIP frame dropped");
        }
    }

    fn dispatch(&mut self, now: Instant, frame: &FipFrame) -> Result<(), FipError> {
        if frame.version != FIP_VERSION {
            return Err(FipError::ProtocolViolation("unsupported FIP version"));
        }
        if frame.eth.src == self.ctl_mac {
            return Err(FipError::ProtocolViolation("own frame looped back"));
        }
        let dst = frame.eth.dst;
        if dst != self.ctl_mac
            && dst != MacAddr::ALL_ENODES
            && dst != MacAddr::ALL_VN2VN
            && dst != MacAddr::ALL_P2P
        {
            return Err(FipError::ProtocolViolation("not addressed to this ENode"));
        }
        if self.state == CtlrState::Fabric(crate::state::FabricState::Auto) {
            self.dest_mac = MacAddr::ZERO;
            self.apply(Event::FipSeen);
            info!("FIP frame seen, using FIP mode");
        }
        trace!(kind = ?frame.kind, src = %frame.eth.src, "rx");
        match handler_for(self.state, frame.kind) {
            Handler::Advertisement => self.recv_advertisement(now, frame),
            Handler::LinkServiceReply => self.recv_ls_reply(now, frame),
            Handler::ClearVirtualLinks => self.recv_clear_links(now, frame),
            h @ (Handler::ProbeRequest
            | Handler::ProbeReply
            | Handler::ClaimNotify
            | Handler::ClaimReply
            | Handler::Beacon) => self.vn_recv(now, h, frame),
            Handler::Drop => {
                trace!(kind = ?frame.kind, state = %self.state, "frame not handled in this state");
                Ok(())
            }
        }
    }

    // ── ELS from the FC stack ────────────────────────────────────────────────

    /// Offer an outgoing ELS. `Err` means the frame is dropped.
    pub fn els_send(&mut self, now: Instant, els: ElsFrame) -> Result<ElsSend, FipError> {
        let out = match self.state {
            CtlrState::Fabric(_) => self.fabric_els_send(now, els),
            CtlrState::Vn2Vn(_) => self.vn_els_send(&els),
            CtlrState::LinkWait | CtlrState::Disabled => Err(FipError::InvalidState(self.state.name())),
        };
        if let Err(e) = &out {
            self.stats.els_dropped += 1;
            debug!(error = %e, "outgoing ELS dropped");
        }
        out
    }

    /// Observe an ELS received as plain FCoE (not inside FIP).
    pub fn recv_flogi(&mut self, _now: Instant, els: &ElsFrame, src: MacAddr) {
        let fallback = matches!(
            self.state,
            CtlrState::Fabric(crate::state::FabricState::Auto | crate::state::FabricState::NonFip)
        );
        if els.is_reply() && els.command() == cmd::LS_ACC {
            if els.ox_id() != self.flogi_oxid || self.flogi_oxid == XID_UNKNOWN {
                return;
            }
            self.flogi_oxid = XID_UNKNOWN;
            if !fallback {
                return;
            }
            if !src.is_valid_unicast() {
                warn!(src = %src, "non-FIP FLOGI accept from invalid MAC");
                return;
            }
            self.apply(Event::NonFipLogin);
            self.dest_mac = src;
            self.port_id = els.d_id();
            self.data_mac = MacAddr::from_fc_map(fip_core::wire::FC_MAP_DEFAULT, self.port_id);
            self.logged_in = true;
            self.port.update_mac(self.data_mac);
            info!(dest = %src, port_id = %format!("{:06x}", self.port_id), "non-FIP login accepted");
        } else if els.is_request() && els.command() == cmd::FLOGI && fallback {
            if !src.is_valid_unicast() {
                return;
            }
            // A peer logging in to us: point-to-point without FIP.
            self.apply(Event::NonFipLogin);
            self.dest_mac = src;
            info!(peer = %src, "received non-FIP FLOGI, point-to-point mode");
        }
    }

    // ── Timer ────────────────────────────────────────────────────────────────

    /// Run housekeeping. Returns the next deadline.
    pub fn on_timer(&mut self, now: Instant) -> Option<Instant> {
        self.timer = None;
        match self.state {
            CtlrState::Fabric(_) => self.fabric_timeout(now),
            CtlrState::Vn2Vn(_) => self.vn_timeout(now),
            CtlrState::LinkWait | CtlrState::Disabled => {}
        }
        self.timer
    }

    /// Make sure the timer fires no later than `at`.
    pub(crate) fn schedule(&mut self, at: Instant) {
        self.timer = crate::fcf::earliest(self.timer, at);
    }

    /// Replace the deadline outright.
    pub(crate) fn rearm(&mut self, at: Instant) {
        self.timer = Some(at);
    }

    // ── Remote ports ─────────────────────────────────────────────────────────

    pub fn rport_event(&mut self, fc_id: u32, event: RportEvent) {
        let limit = self.config.vn2vn.login_limit;
        let Some(peer) = self.peers.get_mut(fc_id) else {
            return;
        };
        match event {
            RportEvent::Ready => {
                peer.login_failures = 0;
                debug!(fc_id = %format!("{fc_id:06x}"), "peer ready");
            }
            RportEvent::Failed => {
                peer.login_failures += 1;
                if peer.login_failures > limit {
                    warn!(
                        fc_id = %format!("{fc_id:06x}"),
                        failures = peer.login_failures,
                        "peer login failed too often, logging off"
                    );
                    peer.last_heard = None;
                    self.port.rport_logoff(fc_id);
                }
            }
            RportEvent::Logoff | RportEvent::Stopped => {
                if peer.last_heard.is_none() {
                    self.peers.remove(fc_id);
                    debug!(fc_id = %format!("{fc_id:06x}"), "peer removed");
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Drop all protocol state without changing the controller state.
    pub(crate) fn reset(&mut self) {
        self.fcfs.clear();
        for fc_id in self.peers.drain() {
            self.port.rport_logoff(fc_id);
        }
        if self.logged_in || matches!(self.state, CtlrState::Vn2Vn(_)) {
            self.port.discovery_stop();
        }
        self.flogi.clear();
        self.flogi_oxid = XID_UNKNOWN;
        self.flogi_count = 0;
        self.logged_in = false;
        self.dest_mac = MacAddr::ZERO;
        self.data_mac = MacAddr::ZERO;
        if !matches!(self.mode, FipMode::Vn2Vn) {
            self.port_id = 0;
        }
        self.sol_time = None;
        self.sel_time = None;
        self.ctlr_ka_time = None;
        self.port_ka_time = None;
        self.timer = None;
    }

    /// Stop for good. The caller stops delivering frames and timer ticks.
    pub fn destroy(&mut self) {
        self.reset();
        self.apply(Event::Disable);
        info!("FIP controller destroyed");
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    pub(crate) fn apply(&mut self, event: Event) {
        let next = transition(self.state, event);
        if next != self.state {
            debug!(from = %self.state, to = %next, "state change");
            self.state = next;
            self.view.publish(next);
        }
    }

    pub(crate) fn send(&mut self, frame: FipFrame) {
        let tag = self
            .config
            .controller
            .priority_tag
            .map(|priority| VlanTag { priority, vid: 0 });
        let frame = frame.with_vlan(tag);
        match frame.encode() {
            Ok(bytes) => {
                trace!(kind = ?frame.kind, dst = %frame.eth.dst, "tx");
                self.stats.tx_frames += 1;
                self.transport.send(bytes);
            }
            Err(e) => warn!(kind = ?frame.kind, error = %e, "frame not sent"),
        }
    }
}
