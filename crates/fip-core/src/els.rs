//! Fibre Channel extended link service (ELS) frames.
//!
//! FIP carries FLOGI/FDISC/LOGO requests and replies inside its link
//! service descriptors. The controller only inspects the 24-byte FC header
//! and the ELS command byte; everything past that belongs to the FC stack.

use bytes::{BufMut, Bytes, BytesMut};

/// FC frame header size.
pub const FC_HEADER_LEN: usize = 24;

/// R_CTL of an ELS request.
pub const R_CTL_ELS_REQ: u8 = 0x22;
/// R_CTL of an ELS reply.
pub const R_CTL_ELS_REP: u8 = 0x23;
/// FC-4 TYPE of extended link services.
pub const FC_TYPE_ELS: u8 = 0x01;

/// Unknown exchange id.
pub const XID_UNKNOWN: u16 = 0xffff;

/// ELS command codes the controller cares about.
pub mod cmd {
    pub const LS_RJT: u8 = 0x01;
    pub const LS_ACC: u8 = 0x02;
    pub const PLOGI: u8 = 0x03;
    pub const FLOGI: u8 = 0x04;
    pub const LOGO: u8 = 0x05;
    pub const FDISC: u8 = 0x51;
}

/// An FC frame (header + payload) carrying an ELS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElsFrame {
    bytes: Bytes,
}

impl ElsFrame {
    /// Wrap raw FC bytes. Returns `None` if shorter than header + command.
    pub fn from_bytes(bytes: Bytes) -> Option<Self> {
        if bytes.len() < FC_HEADER_LEN + 4 {
            return None;
        }
        Some(Self { bytes })
    }

    /// Build an ELS frame. `payload` starts with the command byte.
    pub fn build(r_ctl: u8, d_id: u32, s_id: u32, ox_id: u16, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(FC_HEADER_LEN + payload.len().max(4));
        buf.put_u8(r_ctl);
        buf.put_slice(&d_id.to_be_bytes()[1..]);
        buf.put_u8(0); // cs_ctl
        buf.put_slice(&s_id.to_be_bytes()[1..]);
        buf.put_u8(FC_TYPE_ELS);
        buf.put_slice(&[0x29, 0x00, 0x00]); // f_ctl: first/last/transfer seq
        buf.put_u8(0); // seq_id
        buf.put_u8(0); // df_ctl
        buf.put_u16(0); // seq_cnt
        buf.put_u16(ox_id);
        buf.put_u16(XID_UNKNOWN);
        buf.put_u32(0); // parameter
        buf.put_slice(payload);
        while buf.len() < FC_HEADER_LEN + 4 || buf.len() % 4 != 0 {
            buf.put_u8(0);
        }
        Self { bytes: buf.freeze() }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn r_ctl(&self) -> u8 {
        self.bytes[0]
    }

    pub fn d_id(&self) -> u32 {
        u24(&self.bytes[1..4])
    }

    pub fn s_id(&self) -> u32 {
        u24(&self.bytes[5..8])
    }

    pub fn ox_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[16], self.bytes[17]])
    }

    /// ELS command byte (first payload byte).
    pub fn command(&self) -> u8 {
        self.bytes[FC_HEADER_LEN]
    }

    pub fn is_request(&self) -> bool {
        self.r_ctl() == R_CTL_ELS_REQ
    }

    pub fn is_reply(&self) -> bool {
        self.r_ctl() == R_CTL_ELS_REP
    }
}

fn u24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}
