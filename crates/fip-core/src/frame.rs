//! Whole FIP frames: Ethernet header, FIP header, ordered descriptors.
//!
//! `decode` validates everything a receiver can check without protocol
//! state: lengths, duplicate critical descriptors, unknown critical types,
//! and the mandatory descriptor set for the frame's operation. The
//! controller applies the stateful checks (version, addressing, identity).

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{AsBytes, FromBytes};

use crate::desc::{self, dtype, Descriptor, ElsKind, DUPLICATE_CHECK_LIMIT};
use crate::els::ElsFrame;
use crate::wire::{
    EthHeader, FipHeader, FrameKind, MacAddr, VlanTag, WireError, ETH_HEADER_LEN,
    FIP_ETHERTYPE, FIP_HEADER_LEN, FIP_VERSION, VLAN_TPID,
};

/// A decoded (or to-be-encoded) FIP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FipFrame {
    pub eth: EthHeader,
    /// Protocol version from the header's high nibble.
    pub version: u8,
    pub kind: FrameKind,
    pub flags: u16,
    pub descriptors: Vec<Descriptor>,
}

impl FipFrame {
    /// Start a frame with the current protocol version and no descriptors.
    pub fn new(kind: FrameKind, dst: MacAddr, src: MacAddr, flags: u16) -> Self {
        Self {
            eth: EthHeader {
                dst,
                src,
                vlan: None,
            },
            version: FIP_VERSION,
            kind,
            flags,
            descriptors: Vec::new(),
        }
    }

    pub fn with(mut self, d: Descriptor) -> Self {
        self.descriptors.push(d);
        self
    }

    pub fn with_vlan(mut self, vlan: Option<VlanTag>) -> Self {
        self.eth.vlan = vlan;
        self
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < ETH_HEADER_LEN + FIP_HEADER_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let dst = mac(&buf[0..6]);
        let src = mac(&buf[6..12]);
        let mut off = 12;
        let mut ethertype = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let mut vlan = None;
        if ethertype == VLAN_TPID {
            if buf.len() < ETH_HEADER_LEN + 4 + FIP_HEADER_LEN {
                return Err(WireError::Truncated(buf.len()));
            }
            vlan = Some(VlanTag::from_tci(u16::from_be_bytes([buf[14], buf[15]])));
            off += 4;
            ethertype = u16::from_be_bytes([buf[off], buf[off + 1]]);
        }
        if ethertype != FIP_ETHERTYPE {
            return Err(WireError::NotFip(ethertype));
        }
        off += 2;

        let hdr = FipHeader::read_from_prefix(&buf[off..])
            .ok_or(WireError::Truncated(buf.len()))?;
        off += FIP_HEADER_LEN;

        let kind = FrameKind::from_wire(hdr.op.get(), hdr.subcode)?;
        let declared = usize::from(hdr.desc_len.get()) * 4;
        let available = buf.len() - off;
        if declared > available {
            return Err(WireError::LengthOverrun {
                declared,
                available,
            });
        }

        let mut seen: u32 = 0;
        let mut descriptors = Vec::new();
        for raw in desc::walk(&buf[off..off + declared]) {
            let raw = raw?;
            if raw.dtype < DUPLICATE_CHECK_LIMIT && !repeat_allowed(kind, raw.dtype) {
                let bit = 1u32 << raw.dtype;
                if seen & bit != 0 {
                    return Err(WireError::DuplicateDescriptor(raw.dtype));
                }
                seen |= bit;
            }
            if let Some(d) = Descriptor::parse(&raw)? {
                descriptors.push(d);
            }
        }

        let frame = FipFrame {
            eth: EthHeader { dst, src, vlan },
            version: hdr.protocol_version(),
            kind,
            flags: hdr.flags.get(),
            descriptors,
        };
        frame.check_mandatory()?;
        Ok(frame)
    }

    fn check_mandatory(&self) -> Result<(), WireError> {
        for &t in required_descriptors(self.kind) {
            if !self.descriptors.iter().any(|d| d.dtype() == t) {
                return Err(WireError::MissingDescriptor {
                    kind: self.kind,
                    dtype: t,
                });
            }
        }
        if matches!(self.kind, FrameKind::LsRequest | FrameKind::LsReply) {
            let count = self
                .descriptors
                .iter()
                .filter(|d| matches!(d, Descriptor::Els { .. }))
                .count();
            if count != 1 {
                return Err(WireError::ElsCount(self.kind));
            }
        }
        Ok(())
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    /// Serialize with a recomputed descriptor-list length.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut list = BytesMut::new();
        for d in &self.descriptors {
            d.encode(&mut list)?;
        }
        let words =
            u16::try_from(list.len() / 4).map_err(|_| WireError::ListTooLong(list.len()))?;

        let mut buf = BytesMut::with_capacity(ETH_HEADER_LEN + 4 + FIP_HEADER_LEN + list.len());
        buf.put_slice(&self.eth.dst.0);
        buf.put_slice(&self.eth.src.0);
        if let Some(tag) = self.eth.vlan {
            buf.put_u16(VLAN_TPID);
            buf.put_u16(tag.tci());
        }
        buf.put_u16(FIP_ETHERTYPE);
        let mut hdr = FipHeader::new(self.kind, self.flags, words);
        hdr.version = self.version << 4;
        buf.put_slice(hdr.as_bytes());
        buf.put_slice(&list);
        Ok(buf.freeze())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// First MAC descriptor.
    pub fn mac(&self) -> Option<MacAddr> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Mac(m) => Some(*m),
            _ => None,
        })
    }

    pub fn name_id(&self) -> Option<u64> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::NameId(n) => Some(*n),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u8> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Priority(p) => Some(*p),
            _ => None,
        })
    }

    /// `(vfid, fc_map, fabric_name)`.
    pub fn fabric(&self) -> Option<(u16, u32, u64)> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Fabric {
                vfid,
                fc_map,
                fabric_name,
            } => Some((*vfid, *fc_map, *fabric_name)),
            _ => None,
        })
    }

    /// `(period_ms, no_keepalive)`.
    pub fn fka(&self) -> Option<(u32, bool)> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Fka {
                period_ms,
                no_keepalive,
            } => Some((*period_ms, *no_keepalive)),
            _ => None,
        })
    }

    pub fn max_size(&self) -> Option<u16> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::MaxSize(s) => Some(*s),
            _ => None,
        })
    }

    /// All VN_Port-ID descriptors as `(mac, fc_id, wwpn)`.
    pub fn vn_ids(&self) -> impl Iterator<Item = (MacAddr, u32, u64)> + '_ {
        self.descriptors.iter().filter_map(|d| match d {
            Descriptor::VnPortId { mac, fc_id, wwpn } => Some((*mac, *fc_id, *wwpn)),
            _ => None,
        })
    }

    pub fn els(&self) -> Option<(ElsKind, &ElsFrame)> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Els { kind, frame } => Some((*kind, frame)),
            _ => None,
        })
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Descriptor types that must be present for each frame kind.
pub fn required_descriptors(kind: FrameKind) -> &'static [u8] {
    match kind {
        FrameKind::Solicitation => &[dtype::MAC, dtype::NAME_ID, dtype::MAX_SIZE],
        FrameKind::Advertisement => &[
            dtype::PRIORITY,
            dtype::MAC,
            dtype::NAME_ID,
            dtype::FABRIC,
            dtype::FKA,
        ],
        FrameKind::LsRequest | FrameKind::LsReply => &[],
        FrameKind::KeepAlive => &[dtype::MAC],
        FrameKind::ClearVirtualLinks => &[dtype::MAC, dtype::NAME_ID],
        FrameKind::VlanRequest => &[dtype::MAC],
        FrameKind::VlanNotification => &[dtype::MAC],
        FrameKind::ProbeRequest | FrameKind::ProbeReply | FrameKind::Beacon => {
            &[dtype::MAC, dtype::NAME_ID, dtype::VN_ID]
        }
        FrameKind::ClaimNotify | FrameKind::ClaimReply => &[
            dtype::MAC,
            dtype::NAME_ID,
            dtype::VN_ID,
            dtype::FC4_FEATURES,
            dtype::MAX_SIZE,
        ],
    }
}

/// Critical types that may legitimately repeat for a given kind.
fn repeat_allowed(kind: FrameKind, t: u8) -> bool {
    matches!(
        (kind, t),
        (FrameKind::ClearVirtualLinks, dtype::VN_ID)
            | (FrameKind::VlanNotification, dtype::VLAN)
            | (FrameKind::KeepAlive, dtype::VN_ID)
    )
}

fn mac(b: &[u8]) -> MacAddr {
    let mut m = [0u8; 6];
    m.copy_from_slice(b);
    MacAddr(m)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
