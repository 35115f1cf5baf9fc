//! Tokio driver for a [`Controller`].
//!
//! One task owns the deadline timer and drains the receive FIFO. Everything
//! else goes through [`FipHandle`], which takes the controller lock for the
//! duration of one operation and then pokes the task so it re-reads the
//! deadline.

use crate::controller::{Controller, ElsSend, Snapshot};
use crate::error::FipError;
use crate::flogi::FlogiSlot;
use crate::port::RportEvent;
use crate::state::{CtlrState, StateView};
use bytes::Bytes;
use fip_core::els::ElsFrame;
use fip_core::wire::MacAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running controller task.
pub struct FipHandle {
    ctlr: Arc<Mutex<Controller>>,
    rx_queue: mpsc::UnboundedSender<Bytes>,
    kick: Arc<Notify>,
    shutdown: broadcast::Sender<()>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    view: StateView,
    flogi: FlogiSlot,
}

/// Start the driver task for `ctlr`.
pub fn spawn(ctlr: Controller) -> FipHandle {
    let view = ctlr.view();
    let flogi = ctlr.flogi_slot();
    let ctlr = Arc::new(Mutex::new(ctlr));
    let (tx, rx) = mpsc::unbounded_channel();
    let kick = Arc::new(Notify::new());
    let (shutdown, shutdown_rx) = broadcast::channel(1);

    let task = tokio::spawn(run(ctlr.clone(), rx, kick.clone(), shutdown_rx));

    FipHandle {
        ctlr,
        rx_queue: tx,
        kick,
        shutdown,
        task: std::sync::Mutex::new(Some(task)),
        view,
        flogi,
    }
}

async fn run(
    ctlr: Arc<Mutex<Controller>>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    kick: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let deadline = ctlr.lock().await.next_deadline();
        let sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("FIP driver shutting down");
                return;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                let mut c = ctlr.lock().await;
                c.recv(Instant::now(), &frame);
                while let Ok(frame) = rx.try_recv() {
                    c.recv(Instant::now(), &frame);
                }
            }
            _ = sleep => {
                ctlr.lock().await.on_timer(Instant::now());
            }
            _ = kick.notified() => {}
        }
    }
}

impl FipHandle {
    /// Queue a received frame. Frames are processed in arrival order.
    pub fn recv(&self, frame: Bytes) -> Result<(), FipError> {
        self.rx_queue.send(frame).map_err(|_| FipError::Closed)
    }

    pub async fn link_up(&self) {
        self.ctlr.lock().await.link_up(Instant::now());
        self.kick.notify_one();
    }

    pub async fn link_down(&self) -> bool {
        let was_up = self.ctlr.lock().await.link_down(Instant::now());
        self.kick.notify_one();
        was_up
    }

    pub async fn els_send(&self, els: ElsFrame) -> Result<ElsSend, FipError> {
        let out = self.ctlr.lock().await.els_send(Instant::now(), els);
        self.kick.notify_one();
        out
    }

    pub async fn recv_flogi(&self, els: &ElsFrame, src: MacAddr) {
        self.ctlr.lock().await.recv_flogi(Instant::now(), els, src);
        self.kick.notify_one();
    }

    pub async fn rport_event(&self, fc_id: u32, event: RportEvent) {
        self.ctlr.lock().await.rport_event(fc_id, event);
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.ctlr.lock().await.snapshot()
    }

    /// Current state without taking the controller lock.
    pub fn state(&self) -> CtlrState {
        self.view.state()
    }

    pub fn is_fip_active(&self) -> bool {
        self.view.is_fip_active()
    }

    pub fn flogi_pending(&self) -> bool {
        self.flogi.is_pending()
    }

    /// Stop the task, discard queued frames, and disable the controller.
    pub async fn destroy(&self) {
        let _ = self.shutdown.send(());
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.ctlr.lock().await.destroy();
        info!("FIP driver stopped");
    }
}
