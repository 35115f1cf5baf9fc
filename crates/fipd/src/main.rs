//! fipd — FCoE Initialization Protocol daemon.
//!
//! Runs one FIP controller on a network interface: discovers Forwarders and
//! logs in through them, or claims a VN2VN address among peers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use fip_core::config::{FipConfig, FipMode};
use fip_core::els::{cmd, ElsFrame, R_CTL_ELS_REQ};
use fip_core::wire::FC_FID_FLOGI;
use fip_ctlr::{CtlrState, ElsSend, FabricState, FipError, FipHandle};

mod packet;
mod port;

use packet::PacketSocket;
use port::LoggingPort;

/// FLOGI payload length (command word plus service parameters).
const FLOGI_PAYLOAD_LEN: usize = 116;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FipConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FipConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FipConfig::default()
    });

    let interface = if config.network.interface.is_empty() {
        std::env::args().nth(1).unwrap_or_else(|| "eth0".to_string())
    } else {
        config.network.interface.clone()
    };
    tracing::info!(interface = %interface, mode = ?config.controller.mode, "fipd starting");

    let interface_index = packet::if_index(&interface)?;
    let mac = packet::interface_mac(&interface)?;
    let socket = Arc::new(
        PacketSocket::open(interface_index).context("failed to open FIP packet socket")?,
    );
    tracing::info!(mac = %mac, interface_index, "FIP socket ready");

    let port = LoggingPort::new(mac);
    let ctlr = fip_ctlr::Controller::new(config.clone(), Box::new(port), socket.clone());
    let handle = Arc::new(fip_ctlr::spawn(ctlr));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let rx_task = {
        let socket = socket.clone();
        let handle = handle.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    res = socket.recv(&mut buf) => match res {
                        Ok(n) => {
                            tracing::trace!(frame = %hex::encode(&buf[..n.min(64)]), "rx");
                            if handle.recv(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "packet recv failed"),
                    },
                }
            }
        })
    };

    handle.link_up().await;

    let login_task = if config.controller.mode == FipMode::Vn2Vn {
        None
    } else {
        Some(tokio::spawn(login_loop(handle.clone(), config.clone())))
    };

    let snapshot_printer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let snap = handle.snapshot().await;
                match serde_json::to_string(&snap) {
                    Ok(json) => tracing::info!(snapshot = %json, "controller snapshot"),
                    Err(e) => tracing::warn!(error = %e, "snapshot serialization failed"),
                }
            }
        })
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;

    snapshot_printer.abort();
    if let Some(task) = login_task {
        task.abort();
    }
    let _ = rx_task.await;
    handle.destroy().await;
    tracing::info!("fipd stopped");
    Ok(())
}

/// Stand in for the FC stack's fabric login: issue a FLOGI whenever an FCF
/// is selected and nothing is logged in or pending.
async fn login_loop(handle: Arc<FipHandle>, config: FipConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    let mut ox_id: u16 = 0;
    loop {
        interval.tick().await;
        let state = handle.state();
        if !matches!(state, CtlrState::Fabric(_)) || handle.flogi_pending() {
            continue;
        }
        let snap = handle.snapshot().await;
        if snap.logged_in {
            continue;
        }
        if state == CtlrState::Fabric(FabricState::Enabled) && !snap.fcfs.iter().any(|f| f.selected) {
            continue;
        }
        ox_id = ox_id.wrapping_add(1);
        let els = flogi(ox_id, &config, &snap.wwpn, &snap.wwnn);
        match handle.els_send(els).await {
            Ok(ElsSend::InProgress) => tracing::debug!(ox_id, "FLOGI handed to FIP"),
            Ok(ElsSend::PassThrough { dest }) => {
                tracing::info!(ox_id, dest = %dest, "FLOGI needs a non-FIP FCoE path, not sent")
            }
            Err(FipError::Unselectable) => tracing::debug!(ox_id, "FLOGI held back"),
            Err(e) => tracing::warn!(ox_id, error = %e, "FLOGI rejected"),
        }
    }
}

fn flogi(ox_id: u16, config: &FipConfig, wwpn: &str, wwnn: &str) -> ElsFrame {
    let mut payload = vec![0u8; FLOGI_PAYLOAD_LEN];
    payload[0] = cmd::FLOGI;
    // Common service parameters: FC-PH version and receive data field size.
    payload[4] = 0x20;
    payload[5] = 0x20;
    let rx_size = config.controller.max_frame_size.min(2112);
    payload[10..12].copy_from_slice(&rx_size.to_be_bytes());
    if let Some(w) = fip_core::config::parse_wwn(wwpn) {
        payload[20..28].copy_from_slice(&w.to_be_bytes());
    }
    if let Some(w) = fip_core::config::parse_wwn(wwnn) {
        payload[28..36].copy_from_slice(&w.to_be_bytes());
    }
    ElsFrame::build(R_CTL_ELS_REQ, FC_FID_FLOGI, 0, ox_id, &payload)
}
