//! FIP descriptors — the TLV records that follow the fixed header.
//!
//! Each descriptor is `type(1) len(1) payload`, where `len` counts 4-byte
//! words including the two-byte sub-header. Types below
//! [`NON_CRITICAL_THRESHOLD`] are critical: an unknown critical type aborts
//! the decode. Non-critical (vendor) types are skipped.

use bytes::{BufMut, Bytes, BytesMut};

use crate::els::ElsFrame;
use crate::wire::{MacAddr, WireError};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Descriptor type codes.
pub mod dtype {
    pub const PRIORITY: u8 = 1;
    pub const MAC: u8 = 2;
    pub const FC_MAP: u8 = 3;
    pub const NAME_ID: u8 = 4;
    pub const FABRIC: u8 = 5;
    pub const MAX_SIZE: u8 = 6;
    pub const FLOGI: u8 = 7;
    pub const FDISC: u8 = 8;
    pub const LOGO: u8 = 9;
    pub const ELP: u8 = 10;
    pub const VN_ID: u8 = 11;
    pub const FKA: u8 = 12;
    pub const VENDOR: u8 = 13;
    pub const VLAN: u8 = 14;
    pub const FC4_FEATURES: u8 = 15;
}

/// Types at or above this value may be skipped when unknown.
pub const NON_CRITICAL_THRESHOLD: u8 = 128;

/// Types below this value may appear at most once per frame.
pub const DUPLICATE_CHECK_LIMIT: u8 = 32;

/// Smallest legal descriptor: the sub-header plus two bytes.
pub const MIN_DESC_WORDS: u8 = 1;

/// Longest descriptor the one-byte word count can describe.
pub const MAX_DESC_LEN: usize = u8::MAX as usize * 4;

/// Longest ELS that fits in one descriptor after its 4-byte preamble.
pub const MAX_ELS_LEN: usize = MAX_DESC_LEN - 4;

/// Which encapsulated ELS a link service descriptor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElsKind {
    Flogi,
    Fdisc,
    Logo,
    Elp,
}

impl ElsKind {
    pub fn dtype(&self) -> u8 {
        match self {
            ElsKind::Flogi => dtype::FLOGI,
            ElsKind::Fdisc => dtype::FDISC,
            ElsKind::Logo => dtype::LOGO,
            ElsKind::Elp => dtype::ELP,
        }
    }
}

/// A decoded descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// FCF priority. Lower is preferred.
    Priority(u8),
    Mac(MacAddr),
    FcMap(u32),
    /// Switch name (advertisements) or node name (ENodes/VN2VN).
    NameId(u64),
    Fabric {
        vfid: u16,
        fc_map: u32,
        fabric_name: u64,
    },
    /// Maximum FCoE frame size.
    MaxSize(u16),
    /// Encapsulated ELS.
    Els { kind: ElsKind, frame: ElsFrame },
    VnPortId {
        mac: MacAddr,
        fc_id: u32,
        wwpn: u64,
    },
    /// Keep-alive period; `no_keepalive` is the D bit.
    Fka { period_ms: u32, no_keepalive: bool },
    VendorId([u8; 8]),
    Vlan(u16),
    Fc4Features { types: [u8; 32], features: [u8; 4] },
}

impl Descriptor {
    pub fn dtype(&self) -> u8 {
        match self {
            Descriptor::Priority(_) => dtype::PRIORITY,
            Descriptor::Mac(_) => dtype::MAC,
            Descriptor::FcMap(_) => dtype::FC_MAP,
            Descriptor::NameId(_) => dtype::NAME_ID,
            Descriptor::Fabric { .. } => dtype::FABRIC,
            Descriptor::MaxSize(_) => dtype::MAX_SIZE,
            Descriptor::Els { kind, .. } => kind.dtype(),
            Descriptor::VnPortId { .. } => dtype::VN_ID,
            Descriptor::Fka { .. } => dtype::FKA,
            Descriptor::VendorId(_) => dtype::VENDOR,
            Descriptor::Vlan(_) => dtype::VLAN,
            Descriptor::Fc4Features { .. } => dtype::FC4_FEATURES,
        }
    }

    /// FC-4 features announcing FCP initiator+target support.
    pub fn fcp_features() -> Self {
        let mut types = [0u8; 32];
        // FC-4 type 0x08 (FCP) is bit 8 of the first big-endian word.
        types[2] = 0x01;
        Descriptor::Fc4Features {
            types,
            features: [0, 0, 0, 0x03],
        }
    }

    /// Parse the payload of a raw descriptor. `Ok(None)` means the type is
    /// non-critical and unknown, so the caller skips it.
    pub fn parse(raw: &RawDescriptor<'_>) -> Result<Option<Descriptor>, WireError> {
        let b = raw.body;
        let expect = |words: u8| -> Result<(), WireError> {
            if raw.words == words {
                Ok(())
            } else {
                Err(WireError::BadDescriptorLength {
                    dtype: raw.dtype,
                    words: raw.words,
                })
            }
        };

        let desc = match raw.dtype {
            dtype::PRIORITY => {
                expect(1)?;
                Descriptor::Priority(b[1])
            }
            dtype::MAC => {
                expect(2)?;
                Descriptor::Mac(mac_at(b, 0))
            }
            dtype::FC_MAP => {
                expect(2)?;
                Descriptor::FcMap(u24(&b[3..6]))
            }
            dtype::NAME_ID => {
                expect(3)?;
                Descriptor::NameId(u64_at(b, 2))
            }
            dtype::FABRIC => {
                expect(4)?;
                Descriptor::Fabric {
                    vfid: u16::from_be_bytes([b[0], b[1]]),
                    fc_map: u24(&b[3..6]),
                    fabric_name: u64_at(b, 6),
                }
            }
            dtype::MAX_SIZE => {
                expect(1)?;
                Descriptor::MaxSize(u16::from_be_bytes([b[0], b[1]]))
            }
            dtype::FLOGI | dtype::FDISC | dtype::LOGO | dtype::ELP => {
                let kind = match raw.dtype {
                    dtype::FLOGI => ElsKind::Flogi,
                    dtype::FDISC => ElsKind::Fdisc,
                    dtype::LOGO => ElsKind::Logo,
                    _ => ElsKind::Elp,
                };
                let frame = ElsFrame::from_bytes(Bytes::copy_from_slice(&b[2..])).ok_or(
                    WireError::BadDescriptorLength {
                        dtype: raw.dtype,
                        words: raw.words,
                    },
                )?;
                Descriptor::Els { kind, frame }
            }
            dtype::VN_ID => {
                expect(5)?;
                Descriptor::VnPortId {
                    mac: mac_at(b, 0),
                    fc_id: u24(&b[7..10]),
                    wwpn: u64_at(b, 10),
                }
            }
            dtype::FKA => {
                expect(2)?;
                Descriptor::Fka {
                    no_keepalive: b[1] & 0x01 != 0,
                    period_ms: u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
                }
            }
            dtype::VENDOR => {
                expect(3)?;
                let mut id = [0u8; 8];
                id.copy_from_slice(&b[2..10]);
                Descriptor::VendorId(id)
            }
            dtype::VLAN => {
                expect(1)?;
                Descriptor::Vlan(u16::from_be_bytes([b[0], b[1]]) & 0x0fff)
            }
            dtype::FC4_FEATURES => {
                expect(10)?;
                let mut types = [0u8; 32];
                types.copy_from_slice(&b[2..34]);
                let mut features = [0u8; 4];
                features.copy_from_slice(&b[34..38]);
                Descriptor::Fc4Features { types, features }
            }
            other if other >= NON_CRITICAL_THRESHOLD => return Ok(None),
            other => return Err(WireError::UnknownCritical(other)),
        };
        Ok(Some(desc))
    }

    /// Append this descriptor, zero-padded to a word boundary. On error
    /// `buf` is left as it was.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let start = buf.len();
        buf.put_u8(self.dtype());
        buf.put_u8(0); // length, patched below
        match self {
            Descriptor::Priority(p) => {
                buf.put_u8(0);
                buf.put_u8(*p);
            }
            Descriptor::Mac(mac) => buf.put_slice(&mac.0),
            Descriptor::FcMap(map) => {
                buf.put_slice(&[0, 0, 0]);
                put_u24(buf, *map);
            }
            Descriptor::NameId(wwn) => {
                buf.put_u16(0);
                buf.put_u64(*wwn);
            }
            Descriptor::Fabric {
                vfid,
                fc_map,
                fabric_name,
            } => {
                buf.put_u16(*vfid);
                buf.put_u8(0);
                put_u24(buf, *fc_map);
                buf.put_u64(*fabric_name);
            }
            Descriptor::MaxSize(size) => buf.put_u16(*size),
            Descriptor::Els { frame, .. } => {
                buf.put_u16(0);
                buf.put_slice(frame.as_bytes());
            }
            Descriptor::VnPortId { mac, fc_id, wwpn } => {
                buf.put_slice(&mac.0);
                buf.put_u8(0);
                put_u24(buf, *fc_id);
                buf.put_u64(*wwpn);
            }
            Descriptor::Fka {
                period_ms,
                no_keepalive,
            } => {
                buf.put_u8(0);
                buf.put_u8(u8::from(*no_keepalive));
                buf.put_u32(*period_ms);
            }
            Descriptor::VendorId(id) => {
                buf.put_u16(0);
                buf.put_slice(id);
            }
            Descriptor::Vlan(vid) => buf.put_u16(*vid & 0x0fff),
            Descriptor::Fc4Features { types, features } => {
                buf.put_u16(0);
                buf.put_slice(types);
                buf.put_slice(features);
            }
        }
        while (buf.len() - start) % 4 != 0 {
            buf.put_u8(0);
        }
        let bytes = buf.len() - start;
        if bytes > MAX_DESC_LEN {
            buf.truncate(start);
            return Err(WireError::DescriptorTooLong {
                dtype: self.dtype(),
                bytes,
            });
        }
        buf[start + 1] = (bytes / 4) as u8;
        Ok(())
    }
}

// ── Walk ──────────────────────────────────────────────────────────────────────

/// One undecoded descriptor borrowed from the frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor<'a> {
    pub dtype: u8,
    /// Length in words, including the sub-header.
    pub words: u8,
    /// Bytes after the two-byte sub-header.
    pub body: &'a [u8],
}

/// Lazy walk over a descriptor list.
///
/// Bounded by the slice it is built over (the declared list length), so it
/// always terminates. Cloning restarts it from the current position; build a
/// new one with [`walk`] to restart from the beginning. After the first
/// error it yields nothing more.
#[derive(Debug, Clone)]
pub struct DescriptorIter<'a> {
    rest: &'a [u8],
    failed: bool,
}

/// Walk the descriptors in `list`.
pub fn walk(list: &[u8]) -> DescriptorIter<'_> {
    DescriptorIter {
        rest: list,
        failed: false,
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<RawDescriptor<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 4 {
            self.failed = true;
            return Some(Err(WireError::Truncated(self.rest.len())));
        }
        let dtype = self.rest[0];
        let words = self.rest[1];
        let len = usize::from(words) * 4;
        if words < MIN_DESC_WORDS || len > self.rest.len() {
            self.failed = true;
            return Some(Err(WireError::BadDescriptorLength { dtype, words }));
        }
        let raw = RawDescriptor {
            dtype,
            words,
            body: &self.rest[2..len],
        };
        self.rest = &self.rest[len..];
        Some(Ok(raw))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn mac_at(b: &[u8], off: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&b[off..off + 6]);
    MacAddr(mac)
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(w)
}

fn u24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_slice(&v.to_be_bytes()[1..]);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
