//! VN2VN: self-assigned FC addresses among peer ENodes, with no Forwarder.
//!
//! A port picks a candidate address, probes twice, claims it, and once the
//! announcement window passes without objection it is Up and beacons
//! periodically. Conflicts restart the sequence with a random address; the
//! larger port name wins a tie.

use crate::controller::{Controller, ElsSend};
use crate::error::FipError;
use crate::peer::{Announcement, Upsert};
use crate::state::{CtlrState, Event, Handler, VnState};
use fip_core::desc::Descriptor;
use fip_core::frame::FipFrame;
use fip_core::wire::{flags, wwn_string, FrameKind, MacAddr, FC_FID_FLOGI, VN_FC_MAP};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl Controller {
    fn vn_state(&self) -> Option<VnState> {
        match self.state {
            CtlrState::Vn2Vn(s) => Some(s),
            _ => None,
        }
    }

    fn vn_group(&self) -> MacAddr {
        if self.config.vn2vn.point_to_point {
            MacAddr::ALL_P2P
        } else {
            MacAddr::ALL_VN2VN
        }
    }

    pub(crate) fn vn_start(&mut self, now: Instant) {
        self.probe_tries = 0;
        self.vn_restart(now);
    }

    /// Pick a new candidate address and go back to Start.
    pub(crate) fn vn_restart(&mut self, now: Instant) {
        self.port.discovery_stop();
        let mut id = self.port_id;
        if self.probe_tries > 0 {
            id = self.rng.gen::<u32>() & 0xffff;
        } else if id == 0 {
            id = (self.wwpn & 0xffff) as u32;
        }
        if id == 0 || id == 0xffff {
            id = 1;
        }
        self.port_id = id;

        let cfg = &self.config.vn2vn;
        let wait = if self.probe_tries < cfg.rate_limit_count {
            self.probe_tries += 1;
            let probe_wait = cfg.probe_wait_ms;
            if probe_wait == 0 {
                0
            } else {
                self.rng.gen_range(0..probe_wait)
            }
        } else {
            cfg.rate_limit_interval_ms
        };
        self.stats.vn_restarts += 1;
        self.apply(Event::VnRestart);
        self.rearm(now + Duration::from_millis(wait));
        debug!(
            port_id = %format!("{id:06x}"),
            tries = self.probe_tries,
            wait_ms = wait,
            "VN2VN address claim (re)started"
        );
    }

    fn vn_mac(&self) -> MacAddr {
        MacAddr::from_fc_map(VN_FC_MAP, self.port_id)
    }

    fn vn_send(&mut self, kind: FrameKind, dst: MacAddr) {
        let mut flags = flags::FPMA;
        if self.config.vn2vn.point_to_point {
            flags |= flags::REC_OR_P2P;
        }
        let mut frame = FipFrame::new(kind, dst, self.ctl_mac, flags)
            .with(Descriptor::Mac(self.ctl_mac))
            .with(Descriptor::NameId(self.wwnn))
            .with(Descriptor::VnPortId {
                mac: self.vn_mac(),
                fc_id: self.port_id,
                wwpn: self.wwpn,
            });
        if matches!(kind, FrameKind::ClaimNotify | FrameKind::ClaimReply) {
            frame = frame
                .with(Descriptor::fcp_features())
                .with(Descriptor::MaxSize(self.config.controller.max_frame_size));
        }
        self.send(frame);
    }

    fn vn_send_claim(&mut self, now: Instant) {
        self.vn_send(FrameKind::ClaimNotify, self.vn_group());
        self.sol_time = Some(now);
    }

    // ── Timer ────────────────────────────────────────────────────────────────

    pub(crate) fn vn_timeout(&mut self, now: Instant) {
        let Some(vn) = self.vn_state() else {
            return;
        };
        let cfg = self.config.vn2vn.clone();
        match vn {
            VnState::Start => {
                self.apply(Event::VnAdvance);
                self.vn_send(FrameKind::ProbeRequest, self.vn_group());
                self.schedule(now + cfg.probe_wait());
            }
            VnState::Probe1 => {
                self.apply(Event::VnAdvance);
                self.vn_send(FrameKind::ProbeRequest, self.vn_group());
                self.schedule(now + cfg.announce_wait());
            }
            VnState::Probe2 => {
                self.apply(Event::VnAdvance);
                self.data_mac = self.vn_mac();
                self.port.update_mac(self.data_mac);
                self.vn_send_claim(now);
                self.schedule(now + cfg.announce_wait());
            }
            VnState::Claim => {
                let claimed = self.sol_time.unwrap_or(now);
                let window_end = claimed + cfg.announce_wait();
                if now < window_end {
                    self.schedule(window_end);
                    return;
                }
                self.apply(Event::VnAdvance);
                info!(
                    port_id = %format!("{:06x}", self.port_id),
                    mac = %self.data_mac,
                    "VN2VN address claimed"
                );
                self.vn_send(FrameKind::Beacon, self.vn_group());
                let next = now + cfg.announce_wait();
                self.port_ka_time = Some(next);
                self.schedule(next);
                self.port.discovery_start();
            }
            VnState::Up => {
                if let Some(t) = self.vn_age(now) {
                    self.schedule(t);
                }
                let due = self.port_ka_time.unwrap_or(now);
                let next = if now >= due {
                    self.vn_send(FrameKind::Beacon, self.vn_group());
                    let fuzz = match cfg.beacon_fuzz_ms {
                        0 => 0,
                        f => self.rng.gen_range(0..f),
                    };
                    now + cfg.beacon_interval() + Duration::from_millis(fuzz)
                } else {
                    due
                };
                self.port_ka_time = Some(next);
                self.schedule(next);
            }
        }
    }

    /// Log off peers whose beacons stopped. Returns the next expiry.
    fn vn_age(&mut self, now: Instant) -> Option<Instant> {
        let (expired, next) = self.peers.age(now, self.config.vn2vn.peer_deadline());
        for fc_id in expired {
            info!(fc_id = %format!("{fc_id:06x}"), "peer beacon expired, logging off");
            self.port.rport_logoff(fc_id);
        }
        next
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    pub(crate) fn vn_recv(
        &mut self,
        now: Instant,
        handler: Handler,
        frame: &FipFrame,
    ) -> Result<(), FipError> {
        let ann = Announcement::from_frame(frame)?;
        if ann.wwpn == self.wwpn {
            return Err(FipError::ProtocolViolation("frame carries our own port name"));
        }
        let Some(vn) = self.vn_state() else {
            return Ok(());
        };
        match handler {
            Handler::ProbeRequest => self.vn_probe_request(now, vn, &ann),
            Handler::ProbeReply => self.vn_probe_reply(now, vn, &ann),
            Handler::ClaimNotify => self.vn_claim_notify(now, vn, &ann),
            Handler::ClaimReply => self.vn_claim_reply(now, vn, &ann),
            Handler::Beacon => self.vn_beacon(now, vn, &ann),
            _ => Ok(()),
        }
    }

    fn vn_probe_request(
        &mut self,
        now: Instant,
        vn: VnState,
        ann: &Announcement,
    ) -> Result<(), FipError> {
        if ann.fc_id != self.port_id {
            return Ok(());
        }
        match vn {
            VnState::Claim | VnState::Up => {
                self.vn_send(FrameKind::ProbeReply, ann.enode_mac);
                Ok(())
            }
            VnState::Probe1 | VnState::Probe2 if self.wwpn > ann.wwpn => {
                self.vn_send(FrameKind::ProbeReply, ann.enode_mac);
                Ok(())
            }
            VnState::Probe1 | VnState::Probe2 | VnState::Start => {
                let id = self.port_id;
                self.vn_restart(now);
                Err(FipError::AddressCollision(id))
            }
        }
    }

    fn vn_probe_reply(
        &mut self,
        now: Instant,
        vn: VnState,
        ann: &Announcement,
    ) -> Result<(), FipError> {
        if ann.fc_id != self.port_id {
            return Ok(());
        }
        match vn {
            VnState::Up => {
                self.vn_send_claim(now);
                Ok(())
            }
            VnState::Start | VnState::Probe1 | VnState::Probe2 | VnState::Claim => {
                let id = self.port_id;
                self.vn_restart(now);
                Err(FipError::AddressCollision(id))
            }
        }
    }

    fn vn_claim_notify(
        &mut self,
        now: Instant,
        vn: VnState,
        ann: &Announcement,
    ) -> Result<(), FipError> {
        let ours = ann.fc_id == self.port_id;
        match vn {
            VnState::Start | VnState::Probe1 | VnState::Probe2 => {
                if ours {
                    let id = self.port_id;
                    self.vn_restart(now);
                    return Err(FipError::AddressCollision(id));
                }
                Ok(())
            }
            VnState::Claim | VnState::Up if ours => {
                if ann.wwpn > self.wwpn {
                    let id = self.port_id;
                    self.vn_restart(now);
                    return Err(FipError::AddressCollision(id));
                }
                self.vn_send_claim(now);
                Ok(())
            }
            VnState::Claim | VnState::Up => {
                self.vn_add(now, ann)?;
                self.vn_send(FrameKind::ClaimReply, ann.enode_mac);
                self.vn_login(ann);
                Ok(())
            }
        }
    }

    fn vn_claim_reply(
        &mut self,
        now: Instant,
        vn: VnState,
        ann: &Announcement,
    ) -> Result<(), FipError> {
        if !matches!(vn, VnState::Claim | VnState::Up) {
            return Ok(());
        }
        if ann.fc_id == self.port_id {
            if ann.wwpn > self.wwpn {
                let id = self.port_id;
                self.vn_restart(now);
                return Err(FipError::AddressCollision(id));
            }
            return Ok(());
        }
        self.vn_add(now, ann)?;
        self.vn_login(ann);
        Ok(())
    }

    fn vn_beacon(&mut self, now: Instant, vn: VnState, ann: &Announcement) -> Result<(), FipError> {
        if ann.fc_id == self.port_id && vn == VnState::Up {
            // Someone else is using our address.
            if ann.wwpn > self.wwpn {
                let id = self.port_id;
                self.vn_restart(now);
                return Err(FipError::AddressCollision(id));
            }
            self.vn_send_claim(now);
            return Ok(());
        }
        if let Some(peer) = self.peers.get_mut(ann.fc_id) {
            if peer.remote.wwpn == ann.wwpn && peer.remote.wwnn == ann.wwnn {
                let was_expired = peer.last_heard.is_none();
                peer.last_heard = Some(now);
                if was_expired && vn == VnState::Up {
                    info!(fc_id = %format!("{:06x}", ann.fc_id), "peer beacon resumed");
                    self.vn_login(ann);
                }
                return Ok(());
            }
        }
        if vn != VnState::Up {
            return Ok(());
        }
        // Unknown peer: announce ourselves so it learns about us.
        let window = self.config.vn2vn.announce_wait();
        if self.sol_time.map_or(true, |t| now > t + window) {
            self.vn_send_claim(now);
        }
        Ok(())
    }

    fn vn_add(&mut self, now: Instant, ann: &Announcement) -> Result<(), FipError> {
        match self.peers.upsert(ann, now)? {
            Upsert::New => {
                debug!(
                    fc_id = %format!("{:06x}", ann.fc_id),
                    wwpn = %wwn_string(ann.wwpn),
                    "new VN2VN peer"
                );
            }
            Upsert::Refreshed => {}
            Upsert::Replaced { old_wwpn } => {
                warn!(
                    fc_id = %format!("{:06x}", ann.fc_id),
                    old = %wwn_string(old_wwpn),
                    new = %wwn_string(ann.wwpn),
                    "peer address taken over"
                );
                self.port.rport_logoff(ann.fc_id);
            }
        }
        Ok(())
    }

    fn vn_login(&mut self, ann: &Announcement) {
        if let Some(peer) = self.peers.get(ann.fc_id) {
            let remote = peer.remote;
            self.port.rport_login(&remote);
        }
    }

    // ── Outgoing ELS ─────────────────────────────────────────────────────────

    pub(crate) fn vn_els_send(&mut self, els: &fip_core::els::ElsFrame) -> Result<ElsSend, FipError> {
        if self.state != CtlrState::Vn2Vn(VnState::Up) {
            return Err(FipError::InvalidState(self.state.name()));
        }
        let d_id = els.d_id();
        if d_id == FC_FID_FLOGI && !self.config.vn2vn.point_to_point {
            return Err(FipError::Unselectable);
        }
        let dest = self
            .peers
            .get(d_id)
            .map(|p| p.remote.vn_mac)
            .unwrap_or_else(|| MacAddr::from_fc_map(VN_FC_MAP, d_id));
        Ok(ElsSend::PassThrough { dest })
    }
}
