//! VN2VN peer table.

use crate::arena::{Arena, Index};
use crate::error::FipError;
use crate::port::RemotePort;
use fip_core::frame::FipFrame;
use fip_core::wire::{wwn_string, MacAddr};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity a peer announces in probes, claims, and beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub enode_mac: MacAddr,
    pub wwnn: u64,
    pub vn_mac: MacAddr,
    pub fc_id: u32,
    pub wwpn: u64,
    pub max_frame_size: Option<u16>,
}

impl Announcement {
    pub fn from_frame(frame: &FipFrame) -> Result<Self, FipError> {
        let enode_mac = frame
            .mac()
            .ok_or(FipError::ProtocolViolation("VN2VN frame without MAC"))?;
        if !enode_mac.is_valid_unicast() {
            return Err(FipError::ProtocolViolation("invalid ENode MAC"));
        }
        let wwnn = frame
            .name_id()
            .ok_or(FipError::ProtocolViolation("VN2VN frame without node name"))?;
        let (vn_mac, fc_id, wwpn) = frame
            .vn_ids()
            .next()
            .ok_or(FipError::ProtocolViolation("VN2VN frame without VN_Port ID"))?;
        if !vn_mac.is_valid_unicast() {
            return Err(FipError::ProtocolViolation("invalid VN_Port MAC"));
        }
        Ok(Self {
            enode_mac,
            wwnn,
            vn_mac,
            fc_id,
            wwpn,
            max_frame_size: frame.max_size(),
        })
    }

    pub fn remote_port(&self) -> RemotePort {
        RemotePort {
            fc_id: self.fc_id,
            wwpn: self.wwpn,
            wwnn: self.wwnn,
            enode_mac: self.enode_mac,
            vn_mac: self.vn_mac,
            max_frame_size: self.max_frame_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub remote: RemotePort,
    /// Last beacon or claim. `None` once the peer has been aged out.
    pub last_heard: Option<Instant>,
    pub login_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    New,
    Refreshed,
    /// Same FC id, different port name. The old identity must be logged off.
    Replaced { old_wwpn: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub fc_id: String,
    pub wwpn: String,
    pub vn_mac: String,
    pub alive: bool,
    pub login_failures: u32,
}

pub struct PeerTable {
    arena: Arena<PeerRecord>,
    by_fc_id: HashMap<u32, Index>,
}

impl PeerTable {
    pub fn new(limit: usize) -> Self {
        Self {
            arena: Arena::with_capacity(limit),
            by_fc_id: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, fc_id: u32) -> Option<&PeerRecord> {
        self.arena.get(*self.by_fc_id.get(&fc_id)?)
    }

    pub fn get_mut(&mut self, fc_id: u32) -> Option<&mut PeerRecord> {
        self.arena.get_mut(*self.by_fc_id.get(&fc_id)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.arena.iter().map(|(_, p)| p)
    }

    /// Record a peer heard from at `now`.
    pub fn upsert(&mut self, ann: &Announcement, now: Instant) -> Result<Upsert, FipError> {
        if let Some(peer) = self.get_mut(ann.fc_id) {
            let old_wwpn = peer.remote.wwpn;
            peer.remote = ann.remote_port();
            peer.last_heard = Some(now);
            if old_wwpn != ann.wwpn {
                peer.login_failures = 0;
                return Ok(Upsert::Replaced { old_wwpn });
            }
            return Ok(Upsert::Refreshed);
        }
        let record = PeerRecord {
            remote: ann.remote_port(),
            last_heard: Some(now),
            login_failures: 0,
        };
        let idx = self
            .arena
            .insert(record)
            .map_err(|_| FipError::ResourceExhausted("peer"))?;
        self.by_fc_id.insert(ann.fc_id, idx);
        Ok(Upsert::New)
    }

    pub fn remove(&mut self, fc_id: u32) -> Option<PeerRecord> {
        let idx = self.by_fc_id.remove(&fc_id)?;
        self.arena.remove(idx)
    }

    /// Mark peers silent past `deadline` as expired and return their ids,
    /// plus the next time one would expire.
    pub fn age(&mut self, now: Instant, deadline: Duration) -> (Vec<u32>, Option<Instant>) {
        let mut expired = Vec::new();
        let mut next: Option<Instant> = None;
        for (_, peer) in self.arena.iter_mut() {
            let Some(last) = peer.last_heard else {
                continue;
            };
            let due = last + deadline;
            if now >= due {
                peer.last_heard = None;
                expired.push(peer.remote.fc_id);
            } else {
                next = crate::fcf::earliest(next, due);
            }
        }
        (expired, next)
    }

    /// Drop every peer, returning their ids.
    pub fn drain(&mut self) -> Vec<u32> {
        let ids: Vec<u32> = self.by_fc_id.keys().copied().collect();
        self.arena.clear();
        self.by_fc_id.clear();
        ids
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.iter()
            .map(|p| PeerSummary {
                fc_id: format!("{:06x}", p.remote.fc_id),
                wwpn: wwn_string(p.remote.wwpn),
                vn_mac: p.remote.vn_mac.to_string(),
                alive: p.last_heard.is_some(),
                login_failures: p.login_failures,
            })
            .collect()
    }
}
