//! Seams between the controller and the rest of the host.
//!
//! The controller never owns a socket or an FC stack. It talks to the wire
//! through [`Transport`] and to the local port through [`FcPort`]; both are
//! called with the controller lock held and must not call back into it.

use bytes::Bytes;
use fip_core::els::ElsFrame;
use fip_core::wire::MacAddr;

/// Sends fully-encoded Ethernet frames.
pub trait Transport: Send + Sync {
    fn send(&self, frame: Bytes);
}

/// A remote port discovered over VN2VN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePort {
    pub fc_id: u32,
    pub wwpn: u64,
    pub wwnn: u64,
    pub enode_mac: MacAddr,
    pub vn_mac: MacAddr,
    pub max_frame_size: Option<u16>,
}

/// A virtual port (NPIV) instantiated on top of the physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPort {
    pub wwpn: u64,
    pub fc_id: u32,
    pub mac: MacAddr,
}

/// Remote-port login outcome reported by the FC stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RportEvent {
    Ready,
    Failed,
    Logoff,
    Stopped,
}

/// The local FC port the controller acts for.
pub trait FcPort: Send {
    fn wwpn(&self) -> u64;
    fn wwnn(&self) -> u64;
    /// Burned-in MAC of the Ethernet interface. Used as the ENode address.
    fn source_mac(&self) -> MacAddr;

    fn link_up(&mut self);
    fn link_down(&mut self);

    /// Install the fabric-granted (or self-claimed) data-path MAC.
    fn update_mac(&mut self, mac: MacAddr);

    /// Hand a de-encapsulated ELS reply to the FC stack.
    fn deliver_els(&mut self, els: ElsFrame);

    fn rport_login(&mut self, peer: &RemotePort);
    fn rport_logoff(&mut self, fc_id: u32);

    fn discovery_start(&mut self);
    fn discovery_stop(&mut self);

    fn virtual_ports(&self) -> Vec<VirtualPort> {
        Vec::new()
    }

    /// Tear down one virtual port after a Clear Virtual Links.
    fn reset_virtual_port(&mut self, _wwpn: u64) {}
}
