//! Fabric-attached operation: discovery, FCF selection, FIP login, keep-alive,
//! and Clear Virtual Links.

use crate::controller::{Controller, ElsSend};
use crate::error::FipError;
use crate::fcf::{Advertisement, FcfIndex, Observed};
use crate::port::VirtualPort;
use crate::state::{CtlrState, FabricState};
use fip_core::desc::{Descriptor, ElsKind, MAX_ELS_LEN};
use fip_core::els::{cmd, ElsFrame, XID_UNKNOWN};
use fip_core::frame::FipFrame;
use fip_core::wire::{flags, FrameKind, MacAddr, WireError, FC_FID_FLOGI, FC_MAP_DEFAULT};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Controller {
    fn addressing_flags(&self) -> u16 {
        if self.config.controller.spma {
            flags::FPMA | flags::SPMA
        } else {
            flags::FPMA
        }
    }

    /// Send a Discovery Solicitation, multicast unless `fcf` is given.
    pub(crate) fn solicit(&mut self, now: Instant, fcf: Option<MacAddr>) {
        let dst = fcf.unwrap_or(MacAddr::ALL_FCFS);
        let frame = FipFrame::new(
            FrameKind::Solicitation,
            dst,
            self.ctl_mac,
            self.addressing_flags(),
        )
        .with(Descriptor::Mac(self.ctl_mac))
        .with(Descriptor::NameId(self.wwnn))
        .with(Descriptor::MaxSize(self.config.controller.max_frame_size));
        self.send(frame);
        if fcf.is_none() {
            self.sol_time = Some(now);
        }
        debug!(dst = %dst, "solicitation sent");
    }

    // ── Advertisements ───────────────────────────────────────────────────────

    pub(crate) fn recv_advertisement(
        &mut self,
        now: Instant,
        frame: &FipFrame,
    ) -> Result<(), FipError> {
        let adv = Advertisement::from_frame(frame)?;
        let first = self.fcfs.is_empty();
        let observed = self.fcfs.observe(&adv, now)?;
        let Some(fcf) = self.fcfs.get(observed.index()) else {
            return Ok(());
        };
        let (usable, mtu_verified, period) = (fcf.is_usable(), fcf.mtu_verified, fcf.fka_period);
        // Every record ages out, selected or not.
        self.schedule(now + period * 2);

        if let Observed::New(_) = observed {
            let tov = self.config.fabric.solicit_tov();
            if first && self.sol_time.map_or(true, |t| now >= t + tov) {
                // Gather as many advertisements as possible before selecting.
                self.solicit(now, None);
            } else if !mtu_verified {
                self.solicit(now, Some(adv.fcf_mac));
            }
        }

        // Before FLOGI goes out, a newly usable FCF may still beat the current pick.
        let unselected = self.fcfs.selected_index().is_none();
        let may_improve = matches!(observed, Observed::New(_) | Observed::NowUsable(_))
            && !self.logged_in
            && !self.fcfs.selected().is_some_and(|f| f.flogi_sent);
        if usable && self.sel_time.is_none() && (unselected || may_improve) {
            let at = now + self.config.fabric.start_delay();
            self.sel_time = Some(at);
            self.schedule(at);
            debug!(mac = %adv.fcf_mac, "usable FCF, selection pending");
        }
        Ok(())
    }

    /// Run FCF selection and arm the keep-alive deadlines for a new pick.
    pub(crate) fn select_fcf(&mut self, now: Instant) -> Option<FcfIndex> {
        let prev = self.fcfs.selected_index();
        let sel = self.fcfs.select();
        self.sel_time = None;
        if sel == prev {
            return sel;
        }
        if prev.is_some() {
            if let Some(fcf) = sel.and_then(|i| self.fcfs.get(i)) {
                info!(mac = %fcf.fcf_mac, priority = fcf.priority, "FCF reselected");
            }
        }
        if let Some(fcf) = sel.and_then(|i| self.fcfs.get(i)) {
            let (period, no_ka) = (fcf.fka_period, fcf.no_keepalive);
            self.ctlr_ka_time = (!no_ka).then(|| now + period);
            self.port_ka_time = Some(now + self.config.fabric.vn_ka_period());
            if let Some(t) = self.ctlr_ka_time {
                self.schedule(t);
            }
        }
        sel
    }

    // ── Link service ─────────────────────────────────────────────────────────

    pub(crate) fn recv_ls_reply(&mut self, now: Instant, frame: &FipFrame) -> Result<(), FipError> {
        let (kind, els) = frame
            .els()
            .ok_or(FipError::ProtocolViolation("link service reply without ELS"))?;
        let sel_mac = self.fcfs.selected().map(|f| f.fcf_mac);
        if sel_mac != Some(frame.eth.src) {
            return Err(FipError::ProtocolViolation(
                "link service reply not from the selected FCF",
            ));
        }
        let els = els.clone();
        if els.command() == cmd::LS_ACC && matches!(kind, ElsKind::Flogi | ElsKind::Fdisc) {
            let granted = frame
                .mac()
                .filter(|m| m.is_valid_unicast())
                .ok_or(FipError::ProtocolViolation("login accept without a usable MAC"))?;
            if kind == ElsKind::Flogi && els.ox_id() == self.flogi_oxid {
                self.announce(now, granted, els.d_id());
            }
        } else if els.command() == cmd::LS_RJT && kind == ElsKind::Flogi {
            warn!(fcf = %frame.eth.src, "FLOGI rejected");
        }
        self.port.deliver_els(els);
        Ok(())
    }

    /// Commit a FIP fabric login.
    fn announce(&mut self, now: Instant, granted: MacAddr, port_id: u32) {
        self.flogi_oxid = XID_UNKNOWN;
        self.flogi.clear();
        let Some(fcf) = self.fcfs.selected() else {
            return;
        };
        let (fcf_mac, period, no_ka) = (fcf.fcf_mac, fcf.fka_period, fcf.no_keepalive);
        self.dest_mac = fcf_mac;
        self.port_id = port_id;
        self.data_mac = granted;
        self.logged_in = true;
        self.port.update_mac(granted);
        self.ctlr_ka_time = (!no_ka).then(|| now + period);
        let port_ka = now + self.config.fabric.vn_ka_period();
        self.port_ka_time = Some(port_ka);
        if let Some(t) = self.ctlr_ka_time {
            self.schedule(t);
        }
        self.schedule(port_ka);
        info!(
            fcf = %fcf_mac,
            mac = %granted,
            port_id = %format!("{port_id:06x}"),
            "fabric login accepted"
        );
    }

    // ── Clear Virtual Links ──────────────────────────────────────────────────

    pub(crate) fn recv_clear_links(
        &mut self,
        now: Instant,
        frame: &FipFrame,
    ) -> Result<(), FipError> {
        let sel = self
            .fcfs
            .selected()
            .ok_or(FipError::ProtocolViolation("clear virtual links with no FCF selected"))?;
        let (fcf_mac, switch_name) = (sel.fcf_mac, sel.switch_name);
        if frame.eth.src != fcf_mac
            || frame.mac() != Some(fcf_mac)
            || frame.name_id() != Some(switch_name)
        {
            return Err(FipError::ProtocolViolation(
                "clear virtual links not from the selected FCF",
            ));
        }
        self.stats.cvl_received += 1;

        let vports = self.port.virtual_ports();
        let mut reset_self = false;
        let mut reset_vports = Vec::new();
        let mut any = false;
        for (_, fc_id, wwpn) in frame.vn_ids() {
            any = true;
            if fc_id == self.port_id && wwpn == self.wwpn {
                reset_self = true;
            } else if let Some(vp) = vports.iter().find(|v| v.fc_id == fc_id && v.wwpn == wwpn) {
                reset_vports.push(vp.wwpn);
            }
        }
        if !any {
            reset_self = true;
        }

        if reset_self {
            warn!(fcf = %fcf_mac, "clear virtual links, resetting port");
            self.reset();
            self.port.link_down();
            self.port.link_up();
        } else {
            for wwpn in reset_vports {
                warn!(fcf = %fcf_mac, wwpn = %fip_core::wire::wwn_string(wwpn), "clear virtual link for virtual port");
                self.port.reset_virtual_port(wwpn);
            }
        }
        self.solicit(now, None);
        Ok(())
    }

    // ── Outgoing ELS ─────────────────────────────────────────────────────────

    fn nonfip_dest(&self, d_id: u32) -> MacAddr {
        if self.dest_mac.is_zero() {
            MacAddr::from_fc_map(FC_MAP_DEFAULT, d_id)
        } else {
            self.dest_mac
        }
    }

    pub(crate) fn fabric_els_send(&mut self, now: Instant, els: ElsFrame) -> Result<ElsSend, FipError> {
        let op = els.command();
        match self.state {
            CtlrState::Fabric(FabricState::NonFip) => {
                if op == cmd::FLOGI {
                    self.flogi_oxid = els.ox_id();
                }
                return Ok(ElsSend::PassThrough {
                    dest: self.nonfip_dest(els.d_id()),
                });
            }
            CtlrState::Fabric(FabricState::Auto) => {
                if op != cmd::FLOGI {
                    return Err(FipError::InvalidState(self.state.name()));
                }
                let old = std::mem::replace(&mut self.flogi_oxid, els.ox_id());
                if old == XID_UNKNOWN {
                    self.flogi_count = 0;
                }
                self.flogi_count += 1;
                if self.flogi_count < self.config.fabric.flogi_fallback {
                    debug!(attempt = self.flogi_count, "FLOGI held back, waiting for FIP");
                    return Err(FipError::Unselectable);
                }
                info!("no FIP response, sending FLOGI without FIP");
                return Ok(ElsSend::PassThrough {
                    dest: MacAddr::from_fc_map(FC_MAP_DEFAULT, FC_FID_FLOGI),
                });
            }
            _ => {}
        }

        match op {
            cmd::FLOGI => {
                fits_descriptor(ElsKind::Flogi, &els)?;
                if self.fcfs.selected_index().is_none() && !self.fcfs.has_usable() {
                    return Err(FipError::Unselectable);
                }
                self.flogi_oxid = els.ox_id();
                if self.flogi.replace(els).is_some() {
                    debug!("pending FLOGI replaced");
                }
                self.flogi_send(now);
                Ok(ElsSend::InProgress)
            }
            cmd::FDISC if els.s_id() == 0 => {
                let frame = self.encapsulate(ElsKind::Fdisc, els)?;
                self.send(frame);
                Ok(ElsSend::InProgress)
            }
            cmd::LOGO if els.d_id() == FC_FID_FLOGI => {
                let frame = self.encapsulate(ElsKind::Logo, els)?;
                self.send(frame);
                self.logged_in = false;
                self.ctlr_ka_time = None;
                self.port_ka_time = None;
                Ok(ElsSend::InProgress)
            }
            _ => Ok(ElsSend::PassThrough {
                dest: self.dest_mac,
            }),
        }
    }

    fn encapsulate(&self, kind: ElsKind, els: ElsFrame) -> Result<FipFrame, FipError> {
        fits_descriptor(kind, &els)?;
        let fcf = self.fcfs.selected().ok_or(FipError::Unselectable)?;
        let requested = if self.config.controller.spma {
            self.ctl_mac
        } else {
            MacAddr::ZERO
        };
        Ok(FipFrame::new(
            FrameKind::LsRequest,
            fcf.fcf_mac,
            self.ctl_mac,
            self.addressing_flags(),
        )
        .with(Descriptor::Els { kind, frame: els })
        .with(Descriptor::Mac(requested)))
    }

    /// Transmit the parked FLOGI to the selected FCF, reselecting first if
    /// that FCF already saw one.
    pub(crate) fn flogi_send(&mut self, now: Instant) {
        if !self.flogi.needs_send() {
            return;
        }
        let Some(mut idx) = self.fcfs.selected_index() else {
            debug!("FLOGI pending until an FCF is selected");
            return;
        };
        if self.fcfs.get(idx).map_or(true, |f| f.flogi_sent) {
            match self.select_fcf(now) {
                Some(i) => idx = i,
                None => return,
            }
        }
        let Some(els) = self.flogi.take_for_send() else {
            return;
        };
        match self.encapsulate(ElsKind::Flogi, els) {
            Ok(frame) => {
                if let Some(fcf) = self.fcfs.get_mut(idx) {
                    fcf.flogi_sent = true;
                }
                info!(fcf = %frame.eth.dst, "FLOGI sent");
                self.send(frame);
            }
            Err(e) => debug!(error = %e, "FLOGI not sent"),
        }
    }

    // ── Keep-alive ───────────────────────────────────────────────────────────

    fn send_keep_alive(&mut self, vport: Option<&VirtualPort>) {
        let Some(fcf) = self.fcfs.selected() else {
            return;
        };
        let dst = fcf.fcf_mac;
        let src = vport.map_or(self.ctl_mac, |v| v.mac);
        let mut frame = FipFrame::new(FrameKind::KeepAlive, dst, src, flags::FPMA)
            .with(Descriptor::Mac(self.ctl_mac));
        if let Some(vp) = vport {
            frame = frame.with(Descriptor::VnPortId {
                mac: vp.mac,
                fc_id: vp.fc_id,
                wwpn: vp.wwpn,
            });
        }
        self.send(frame);
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    pub(crate) fn fabric_timeout(&mut self, now: Instant) {
        let aged = self.fcfs.age(now);
        self.stats.missed_fka += u64::from(aged.missed_keepalives);
        if let Some(t) = aged.next_deadline {
            self.schedule(t);
        }
        if aged.lost_selected {
            self.stats.fcf_lost += 1;
            warn!("selected FCF lost, resetting");
            self.reset();
            self.port.link_down();
            self.port.link_up();
            self.solicit(now, None);
            return;
        }

        if let Some(t) = self.sel_time {
            if now >= t {
                self.select_fcf(now);
            } else {
                self.schedule(t);
            }
        }

        if self.flogi.needs_send() {
            self.flogi_send(now);
        }

        if !self.logged_in {
            return;
        }
        let fka = self.fcfs.selected().map(|f| (f.fka_period, f.no_keepalive));
        if let (Some(t), Some((period, false))) = (self.ctlr_ka_time, fka) {
            let next = if now >= t {
                self.send_keep_alive(None);
                now + period
            } else {
                t
            };
            self.ctlr_ka_time = Some(next);
            self.schedule(next);
        }
        if let Some(t) = self.port_ka_time {
            let next = if now >= t {
                for vp in self.port.virtual_ports() {
                    self.send_keep_alive(Some(&vp));
                }
                now + self.config.fabric.vn_ka_period()
            } else {
                t
            };
            self.port_ka_time = Some(next);
            self.schedule(next);
        }
    }
}

/// Refuse an ELS too long for a single FIP descriptor.
fn fits_descriptor(kind: ElsKind, els: &ElsFrame) -> Result<(), WireError> {
    let len = els.as_bytes().len();
    if len > MAX_ELS_LEN {
        return Err(WireError::DescriptorTooLong {
            dtype: kind.dtype(),
            bytes: len + 4,
        });
    }
    Ok(())
}
