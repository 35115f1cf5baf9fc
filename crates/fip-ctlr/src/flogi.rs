//! The single pending-FLOGI slot.
//!
//! The FC stack may hand over a FLOGI before an FCF is selected. It is parked
//! here and flushed once selection completes. The slot has its own lock so the
//! submitting path never waits on the controller.

use fip_core::els::ElsFrame;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Pending {
    frame: Option<ElsFrame>,
    /// Not yet transmitted since it was parked.
    send: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlogiSlot {
    inner: Arc<Mutex<Pending>>,
}

impl FlogiSlot {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park `frame`, replacing any older request.
    pub fn replace(&self, frame: ElsFrame) -> Option<ElsFrame> {
        let mut p = self.lock();
        p.send = true;
        p.frame.replace(frame)
    }

    /// A copy of the parked FLOGI if it still needs to go out.
    pub fn take_for_send(&self) -> Option<ElsFrame> {
        let mut p = self.lock();
        if !p.send {
            return None;
        }
        p.send = false;
        p.frame.clone()
    }

    /// Drop the parked FLOGI.
    pub fn clear(&self) -> Option<ElsFrame> {
        let mut p = self.lock();
        p.send = false;
        p.frame.take()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().frame.is_some()
    }

    pub fn needs_send(&self) -> bool {
        self.lock().send
    }
}
