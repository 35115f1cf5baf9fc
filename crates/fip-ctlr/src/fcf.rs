//! Forwarder (FCF) registry.
//!
//! Records are keyed by (switch name, fabric name, FC-MAP, FCF MAC) and live
//! in a bounded arena. The registry also owns the current selection so the
//! "at most one selected" rule is enforced in one place.

use crate::arena::{Arena, Index};
use crate::error::FipError;
use fip_core::frame::FipFrame;
use fip_core::wire::{flags, wwn_string, MacAddr};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub type FcfIndex = Index;

/// Fields of a Discovery Advertisement the registry cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub switch_name: u64,
    pub fabric_name: u64,
    pub fc_map: u32,
    pub vfid: u16,
    pub fcf_mac: MacAddr,
    pub priority: u8,
    pub flags: u16,
    pub fka_period_ms: u32,
    pub no_keepalive: bool,
}

impl Advertisement {
    /// Pull the advertisement fields out of a decoded frame. The decoder has
    /// already enforced the mandatory descriptors; this adds the semantic
    /// checks.
    pub fn from_frame(frame: &FipFrame) -> Result<Self, FipError> {
        let fcf_mac = frame
            .mac()
            .ok_or(FipError::ProtocolViolation("advertisement without MAC"))?;
        if !fcf_mac.is_valid_unicast() {
            return Err(FipError::ProtocolViolation("invalid FCF MAC"));
        }
        let switch_name = frame
            .name_id()
            .ok_or(FipError::ProtocolViolation("advertisement without switch name"))?;
        let (vfid, fc_map, fabric_name) = frame
            .fabric()
            .ok_or(FipError::ProtocolViolation("advertisement without fabric"))?;
        let (fka_period_ms, no_keepalive) = frame.fka().unwrap_or((0, false));
        Ok(Self {
            switch_name,
            fabric_name,
            fc_map,
            vfid,
            fcf_mac,
            priority: frame.priority().unwrap_or(u8::MAX),
            flags: frame.flags,
            fka_period_ms,
            no_keepalive,
        })
    }
}

/// One Forwarder seen on the segment.
#[derive(Debug, Clone)]
pub struct FcfRecord {
    pub switch_name: u64,
    pub fabric_name: u64,
    pub fc_map: u32,
    pub vfid: u16,
    pub fcf_mac: MacAddr,
    pub priority: u8,
    /// Header flags of the latest advertisement.
    pub flags: u16,
    /// Answered one of our solicitations, so our max frame size is known to
    /// fit. Sticky once set.
    pub mtu_verified: bool,
    pub fka_period: Duration,
    /// D bit: the FCF wants no keep-alives from us.
    pub no_keepalive: bool,
    pub last_seen: Instant,
    /// A FLOGI went out to this FCF.
    pub flogi_sent: bool,
    /// Missed-advertisement warning already counted for this interval.
    missed_flagged: bool,
}

impl FcfRecord {
    fn matches(&self, adv: &Advertisement) -> bool {
        self.switch_name == adv.switch_name
            && self.fabric_name == adv.fabric_name
            && self.fc_map == adv.fc_map
            && self.fcf_mac == adv.fcf_mac
    }

    pub fn is_available(&self) -> bool {
        self.flags & flags::AVAIL != 0
    }

    /// Usable for login: MTU verified and accepting logins.
    pub fn is_usable(&self) -> bool {
        self.mtu_verified && self.is_available()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    New(FcfIndex),
    Refreshed(FcfIndex),
    /// Known FCF that just turned usable (solicited reply or AVAIL set).
    NowUsable(FcfIndex),
}

impl Observed {
    pub fn index(&self) -> FcfIndex {
        match self {
            Observed::New(i) | Observed::Refreshed(i) | Observed::NowUsable(i) => *i,
        }
    }
}

/// Result of an aging pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgeOutcome {
    pub next_deadline: Option<Instant>,
    pub removed: usize,
    pub missed_keepalives: u32,
    /// The selected FCF was among the removed.
    pub lost_selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcfSummary {
    pub switch_name: String,
    pub fabric_name: String,
    pub fcf_mac: String,
    pub fc_map: String,
    pub priority: u8,
    pub usable: bool,
    pub flogi_sent: bool,
    pub selected: bool,
}

pub struct FcfRegistry {
    arena: Arena<FcfRecord>,
    selected: Option<FcfIndex>,
    default_fka: Duration,
    min_fka: Duration,
}

impl FcfRegistry {
    pub fn new(limit: usize, default_fka: Duration, min_fka: Duration) -> Self {
        Self {
            arena: Arena::with_capacity(limit),
            selected: None,
            default_fka,
            min_fka,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, idx: FcfIndex) -> Option<&FcfRecord> {
        self.arena.get(idx)
    }

    pub fn get_mut(&mut self, idx: FcfIndex) -> Option<&mut FcfRecord> {
        self.arena.get_mut(idx)
    }

    pub fn selected_index(&self) -> Option<FcfIndex> {
        self.selected
    }

    pub fn selected(&self) -> Option<&FcfRecord> {
        self.selected.and_then(|i| self.arena.get(i))
    }

    pub fn selected_mut(&mut self) -> Option<&mut FcfRecord> {
        let idx = self.selected?;
        self.arena.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FcfIndex, &FcfRecord)> {
        self.arena.iter()
    }

    pub fn has_usable(&self) -> bool {
        self.arena.iter().any(|(_, f)| f.is_usable())
    }

    fn period(&self, adv: &Advertisement) -> Duration {
        let advertised = Duration::from_millis(adv.fka_period_ms as u64);
        if advertised >= self.min_fka {
            advertised
        } else {
            self.default_fka
        }
    }

    /// Insert or refresh the FCF an advertisement describes.
    pub fn observe(&mut self, adv: &Advertisement, now: Instant) -> Result<Observed, FipError> {
        let solicited = adv.flags & flags::SOL != 0;
        let period = self.period(adv);

        let existing = self.arena.iter().find(|(_, f)| f.matches(adv)).map(|(i, _)| i);
        if let Some(idx) = existing {
            let Some(rec) = self.arena.get_mut(idx) else {
                return Err(FipError::InvalidState("registry index vanished"));
            };
            let was_usable = rec.is_usable();
            rec.flags = adv.flags;
            rec.priority = adv.priority;
            rec.mtu_verified |= solicited;
            rec.fka_period = period;
            rec.no_keepalive = adv.no_keepalive;
            rec.last_seen = now;
            rec.missed_flagged = false;
            if !was_usable && rec.is_usable() {
                debug!(mac = %adv.fcf_mac, "FCF now usable");
                return Ok(Observed::NowUsable(idx));
            }
            return Ok(Observed::Refreshed(idx));
        }

        // Every FCF must belong to the same fabric as the first one seen.
        if let Some((_, first)) = self.arena.iter().next() {
            if first.fabric_name != adv.fabric_name
                || first.vfid != adv.vfid
                || first.fc_map != adv.fc_map
            {
                warn!(
                    mac = %adv.fcf_mac,
                    fabric = %wwn_string(adv.fabric_name),
                    "advertisement conflicts with known fabric"
                );
                return Err(FipError::ProtocolViolation("FCF on a different fabric"));
            }
        }

        let record = FcfRecord {
            switch_name: adv.switch_name,
            fabric_name: adv.fabric_name,
            fc_map: adv.fc_map,
            vfid: adv.vfid,
            fcf_mac: adv.fcf_mac,
            priority: adv.priority,
            flags: adv.flags,
            mtu_verified: solicited,
            fka_period: period,
            no_keepalive: adv.no_keepalive,
            last_seen: now,
            flogi_sent: false,
            missed_flagged: false,
        };
        match self.arena.insert(record) {
            Ok(idx) => {
                info!(
                    mac = %adv.fcf_mac,
                    switch = %wwn_string(adv.switch_name),
                    priority = adv.priority,
                    "new FCF"
                );
                Ok(Observed::New(idx))
            }
            Err(_) => {
                debug!(mac = %adv.fcf_mac, "FCF table full, advertisement dropped");
                Err(FipError::ResourceExhausted("FCF"))
            }
        }
    }

    /// Count missed advertisements and drop FCFs silent for two periods.
    pub fn age(&mut self, now: Instant) -> AgeOutcome {
        let mut out = AgeOutcome::default();
        let mut expired = Vec::new();

        for (idx, fcf) in self.arena.iter_mut() {
            let is_selected = self.selected == Some(idx);
            let warn_at = fcf.last_seen + fcf.fka_period * 3 / 2;
            let drop_at = fcf.last_seen + fcf.fka_period * 2;

            if now >= drop_at {
                expired.push(idx);
                continue;
            }
            if is_selected {
                if now >= warn_at {
                    if !fcf.missed_flagged {
                        fcf.missed_flagged = true;
                        out.missed_keepalives += 1;
                        warn!(mac = %fcf.fcf_mac, "missing discovery advertisement");
                    }
                } else {
                    out.next_deadline = earliest(out.next_deadline, warn_at);
                }
            }
            out.next_deadline = earliest(out.next_deadline, drop_at);
        }

        for idx in expired {
            if let Some(fcf) = self.arena.remove(idx) {
                out.removed += 1;
                if self.selected == Some(idx) {
                    self.selected = None;
                    out.lost_selected = true;
                    warn!(mac = %fcf.fcf_mac, "selected FCF timed out");
                } else {
                    debug!(mac = %fcf.fcf_mac, "FCF timed out");
                }
            }
        }
        out
    }

    /// Pick the usable FCF with the lowest priority value, skipping any that
    /// already saw a FLOGI. A tie keeps the current selection. When every
    /// usable FCF has seen a FLOGI, the marks are cleared and the pick is
    /// retried once.
    pub fn select(&mut self) -> Option<FcfIndex> {
        let mut pick = self.best_candidate();
        if pick.is_none() && self.arena.iter().any(|(_, f)| f.is_usable() && f.flogi_sent) {
            debug!("all usable FCFs tried, clearing FLOGI marks");
            for (_, f) in self.arena.iter_mut() {
                f.flogi_sent = false;
            }
            pick = self.best_candidate();
        }
        if pick != self.selected {
            if let Some(fcf) = pick.and_then(|i| self.arena.get(i)) {
                info!(
                    mac = %fcf.fcf_mac,
                    switch = %wwn_string(fcf.switch_name),
                    priority = fcf.priority,
                    "FCF selected"
                );
            }
        }
        self.selected = pick;
        pick
    }

    fn best_candidate(&self) -> Option<FcfIndex> {
        let current = self.selected.and_then(|i| self.arena.get(i).map(|f| (i, f)));
        let mut best: Option<(FcfIndex, u8)> = current
            .filter(|(_, f)| f.is_usable() && !f.flogi_sent)
            .map(|(i, f)| (i, f.priority));
        for (idx, fcf) in self.arena.iter() {
            if !fcf.is_usable() || fcf.flogi_sent {
                continue;
            }
            match best {
                Some((_, p)) if fcf.priority >= p => {}
                _ => best = Some((idx, fcf.priority)),
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Forget every FCF.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.selected = None;
    }

    pub fn summaries(&self) -> Vec<FcfSummary> {
        self.arena
            .iter()
            .map(|(idx, f)| FcfSummary {
                switch_name: wwn_string(f.switch_name),
                fabric_name: wwn_string(f.fabric_name),
                fcf_mac: f.fcf_mac.to_string(),
                fc_map: format!("{:06x}", f.fc_map),
                priority: f.priority,
                usable: f.is_usable(),
                flogi_sent: f.flogi_sent,
                selected: self.selected == Some(idx),
            })
            .collect()
    }
}

pub(crate) fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(c) if c <= candidate => c,
        _ => candidate,
    })
}
