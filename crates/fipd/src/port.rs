//! Stand-in FC port for running the controller on its own.
//!
//! There is no FC stack behind fipd, so every callback is logged. Port and
//! node names are derived from the interface MAC (NAA 2 and NAA 1).

use fip_core::els::ElsFrame;
use fip_core::wire::{wwn_string, MacAddr};
use fip_ctlr::{FcPort, RemotePort};

pub struct LoggingPort {
    mac: MacAddr,
    data_mac: Option<MacAddr>,
}

impl LoggingPort {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            data_mac: None,
        }
    }

    fn mac48(&self) -> u64 {
        self.mac.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl FcPort for LoggingPort {
    fn wwpn(&self) -> u64 {
        0x2000_0000_0000_0000 | self.mac48()
    }

    fn wwnn(&self) -> u64 {
        0x1000_0000_0000_0000 | self.mac48()
    }

    fn source_mac(&self) -> MacAddr {
        self.mac
    }

    fn link_up(&mut self) {
        tracing::info!("FC port link up");
    }

    fn link_down(&mut self) {
        tracing::info!("FC port link down");
    }

    fn update_mac(&mut self, mac: MacAddr) {
        tracing::info!(mac = %mac, previous = ?self.data_mac, "data MAC updated");
        self.data_mac = Some(mac);
    }

    fn deliver_els(&mut self, els: ElsFrame) {
        tracing::info!(
            command = els.command(),
            d_id = %format!("{:06x}", els.d_id()),
            ox_id = els.ox_id(),
            "ELS delivered"
        );
    }

    fn rport_login(&mut self, peer: &RemotePort) {
        tracing::info!(
            fc_id = %format!("{:06x}", peer.fc_id),
            wwpn = %wwn_string(peer.wwpn),
            mac = %peer.vn_mac,
            "remote port login"
        );
    }

    fn rport_logoff(&mut self, fc_id: u32) {
        tracing::info!(fc_id = %format!("{fc_id:06x}"), "remote port logoff");
    }

    fn discovery_start(&mut self) {
        tracing::debug!("discovery start");
    }

    fn discovery_stop(&mut self) {
        tracing::debug!("discovery stop");
    }
}
