//! FIP wire format — Ethernet framing, the fixed FIP header, addresses.
//!
//! The FIP header is the FC-BB-5 layout: version nibble, operation code,
//! sub-code, descriptor list length (in 4-byte words) and flags. Every
//! multi-byte field is big-endian. The fixed part is a zerocopy struct;
//! descriptors are variable and live in `desc.rs`.

use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Ethertypes & versions ─────────────────────────────────────────────────────

/// Ethertype of FIP control frames.
pub const FIP_ETHERTYPE: u16 = 0x8914;

/// Ethertype of FCoE data frames (used for non-FIP pass-through).
pub const FCOE_ETHERTYPE: u16 = 0x8906;

/// 802.1Q tag protocol identifier.
pub const VLAN_TPID: u16 = 0x8100;

/// FIP protocol version carried in the high nibble of the version byte.
pub const FIP_VERSION: u8 = 1;

/// Default FC-MAP for fabric-provided MAC addresses.
pub const FC_MAP_DEFAULT: u32 = 0x0E_FC_00;

/// FC-MAP used to build VN2VN node MACs.
pub const VN_FC_MAP: u32 = 0x0E_FD_00;

/// Well-known address of the fabric login server.
pub const FC_FID_FLOGI: u32 = 0xFF_FF_FE;

/// Fixed FIP header size in bytes.
pub const FIP_HEADER_LEN: usize = 10;

/// Untagged Ethernet header size in bytes.
pub const ETH_HEADER_LEN: usize = 14;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Bits of the FIP header `flags` field.
pub mod flags {
    /// Fabric-provided MAC addressing.
    pub const FPMA: u16 = 0x8000;
    /// Server-provided MAC addressing.
    pub const SPMA: u16 = 0x4000;
    /// Recorded (fabric) or point-to-point (VN2VN).
    pub const REC_OR_P2P: u16 = 0x0008;
    /// FCF is available for logins.
    pub const AVAIL: u16 = 0x0004;
    /// Advertisement is a reply to a solicitation.
    pub const SOL: u16 = 0x0002;
    /// FCF is an F_Port.
    pub const FPORT: u16 = 0x0001;
}

// ── MAC addresses ─────────────────────────────────────────────────────────────

/// A 48-bit Ethernet address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// All FCoE nodes.
    pub const ALL_FCOE: MacAddr = MacAddr([0x01, 0x10, 0x18, 0x01, 0x00, 0x00]);
    /// All ENodes: destination of advertisements and CVLs.
    pub const ALL_ENODES: MacAddr = MacAddr([0x01, 0x10, 0x18, 0x01, 0x00, 0x01]);
    /// All Forwarders: destination of multicast solicitations.
    pub const ALL_FCFS: MacAddr = MacAddr([0x01, 0x10, 0x18, 0x01, 0x00, 0x02]);
    /// All VN2VN nodes.
    pub const ALL_VN2VN: MacAddr = MacAddr([0x01, 0x10, 0x18, 0x01, 0x00, 0x04]);
    /// All point-to-point VN2VN nodes.
    pub const ALL_P2P: MacAddr = MacAddr([0x01, 0x10, 0x18, 0x01, 0x00, 0x05]);

    /// Build a MAC from a 24-bit FC-MAP prefix and a 24-bit FC address.
    pub fn from_fc_map(fc_map: u32, fc_id: u32) -> Self {
        let m = fc_map.to_be_bytes();
        let f = fc_id.to_be_bytes();
        MacAddr([m[1], m[2], m[3], f[1], f[2], f[3]])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Non-zero unicast address.
    pub fn is_valid_unicast(&self) -> bool {
        !self.is_zero() && !self.is_multicast()
    }

    /// Low 24 bits: the FC address for an FPMA/VN2VN MAC.
    pub fn fc_id(&self) -> u32 {
        u32::from_be_bytes([0, self.0[3], self.0[4], self.0[5]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(b: [u8; 6]) -> Self {
        MacAddr(b)
    }
}

/// Format a world-wide name the way the FC world prints them.
pub fn wwn_string(wwn: u64) -> String {
    hex::encode(wwn.to_be_bytes())
}

// ── Ethernet header ───────────────────────────────────────────────────────────

/// 802.1Q tag fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VlanTag {
    /// 3-bit priority code point.
    pub priority: u8,
    /// 12-bit VLAN id. 0 = priority-tagged only.
    pub vid: u16,
}

impl VlanTag {
    pub fn tci(&self) -> u16 {
        (u16::from(self.priority & 0x7) << 13) | (self.vid & 0x0fff)
    }

    pub fn from_tci(tci: u16) -> Self {
        Self {
            priority: (tci >> 13) as u8,
            vid: tci & 0x0fff,
        }
    }
}

/// Destination, source, and optional priority tag of a FIP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vlan: Option<VlanTag>,
}

// ── FIP header ────────────────────────────────────────────────────────────────

/// Fixed FIP encapsulation header.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FipHeader {
    /// Version in the high nibble, low nibble reserved.
    pub version: u8,
    pub reserved0: u8,
    /// Operation code.
    pub op: U16,
    pub reserved1: u8,
    /// Operation-specific sub-code.
    pub subcode: u8,
    /// Descriptor list length in 4-byte words.
    pub desc_len: U16,
    /// See [`flags`].
    pub flags: U16,
}

assert_eq_size!(FipHeader, [u8; FIP_HEADER_LEN]);

impl FipHeader {
    pub fn new(kind: FrameKind, flags: u16, desc_words: u16) -> Self {
        Self {
            version: FIP_VERSION << 4,
            reserved0: 0,
            op: U16::new(kind.op()),
            reserved1: 0,
            subcode: kind.subcode(),
            desc_len: U16::new(desc_words),
            flags: U16::new(flags),
        }
    }

    /// Protocol version (high nibble of the version byte).
    pub fn protocol_version(&self) -> u8 {
        self.version >> 4
    }
}

// ── Operations ────────────────────────────────────────────────────────────────

/// FIP operation codes.
pub mod op {
    pub const DISCOVERY: u16 = 1;
    pub const LINK_SERVICE: u16 = 2;
    pub const CONTROL: u16 = 3;
    pub const VLAN: u16 = 4;
    pub const VN2VN: u16 = 5;
}

/// Every (operation, sub-code) pair the controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Solicitation,
    Advertisement,
    LsRequest,
    LsReply,
    KeepAlive,
    ClearVirtualLinks,
    VlanRequest,
    VlanNotification,
    ProbeRequest,
    ProbeReply,
    ClaimNotify,
    ClaimReply,
    Beacon,
}

impl FrameKind {
    pub const ALL: [FrameKind; 13] = [
        FrameKind::Solicitation,
        FrameKind::Advertisement,
        FrameKind::LsRequest,
        FrameKind::LsReply,
        FrameKind::KeepAlive,
        FrameKind::ClearVirtualLinks,
        FrameKind::VlanRequest,
        FrameKind::VlanNotification,
        FrameKind::ProbeRequest,
        FrameKind::ProbeReply,
        FrameKind::ClaimNotify,
        FrameKind::ClaimReply,
        FrameKind::Beacon,
    ];

    pub fn from_wire(op_code: u16, subcode: u8) -> Result<Self, WireError> {
        let kind = match (op_code, subcode) {
            (op::DISCOVERY, 1) => FrameKind::Solicitation,
            (op::DISCOVERY, 2) => FrameKind::Advertisement,
            (op::LINK_SERVICE, 1) => FrameKind::LsRequest,
            (op::LINK_SERVICE, 2) => FrameKind::LsReply,
            (op::CONTROL, 1) => FrameKind::KeepAlive,
            (op::CONTROL, 2) => FrameKind::ClearVirtualLinks,
            (op::VLAN, 1) => FrameKind::VlanRequest,
            (op::VLAN, 2) => FrameKind::VlanNotification,
            (op::VN2VN, 1) => FrameKind::ProbeRequest,
            (op::VN2VN, 2) => FrameKind::ProbeReply,
            (op::VN2VN, 3) => FrameKind::ClaimNotify,
            (op::VN2VN, 4) => FrameKind::ClaimReply,
            (op::VN2VN, 5) => FrameKind::Beacon,
            (op_code, subcode) => return Err(WireError::UnknownOperation { op_code, subcode }),
        };
        Ok(kind)
    }

    pub fn op(&self) -> u16 {
        match self {
            FrameKind::Solicitation | FrameKind::Advertisement => op::DISCOVERY,
            FrameKind::LsRequest | FrameKind::LsReply => op::LINK_SERVICE,
            FrameKind::KeepAlive | FrameKind::ClearVirtualLinks => op::CONTROL,
            FrameKind::VlanRequest | FrameKind::VlanNotification => op::VLAN,
            FrameKind::ProbeRequest
            | FrameKind::ProbeReply
            | FrameKind::ClaimNotify
            | FrameKind::ClaimReply
            | FrameKind::Beacon => op::VN2VN,
        }
    }

    pub fn subcode(&self) -> u8 {
        match self {
            FrameKind::Solicitation
            | FrameKind::LsRequest
            | FrameKind::KeepAlive
            | FrameKind::VlanRequest
            | FrameKind::ProbeRequest => 1,
            FrameKind::Advertisement
            | FrameKind::LsReply
            | FrameKind::ClearVirtualLinks
            | FrameKind::VlanNotification
            | FrameKind::ProbeReply => 2,
            FrameKind::ClaimNotify => 3,
            FrameKind::ClaimReply => 4,
            FrameKind::Beacon => 5,
        }
    }

    pub fn is_vn2vn(&self) -> bool {
        self.op() == op::VN2VN
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a buffer is not a well-formed FIP frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("not a FIP frame: ethertype 0x{0:04x}")]
    NotFip(u16),

    #[error("descriptor list of {declared} bytes overruns {available} available")]
    LengthOverrun { declared: usize, available: usize },

    #[error("descriptor type {dtype} has bad length {words} words")]
    BadDescriptorLength { dtype: u8, words: u8 },

    #[error("duplicate critical descriptor type {0}")]
    DuplicateDescriptor(u8),

    #[error("unknown critical descriptor type {0}")]
    UnknownCritical(u8),

    #[error("{kind:?} frame missing descriptor type {dtype}")]
    MissingDescriptor { kind: FrameKind, dtype: u8 },

    #[error("{0:?} frame must carry exactly one encapsulated ELS")]
    ElsCount(FrameKind),

    #[error("unknown operation 0x{op_code:04x} sub-code {subcode}")]
    UnknownOperation { op_code: u16, subcode: u8 },

    #[error("descriptor type {dtype} needs {bytes} bytes, more than one descriptor holds")]
    DescriptorTooLong { dtype: u8, bytes: usize },

    #[error("descriptor list of {0} bytes does not fit the header length field")]
    ListTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
