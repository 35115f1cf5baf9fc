//! Controller states, the transition function, and the receive dispatch
//! table.
//!
//! Both tables are pure: the controller computes the next state with
//! [`transition`] and picks a frame handler with [`handler_for`], then does
//! the side effects itself.

use fip_core::config::FipMode;
use fip_core::wire::FrameKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FabricState {
    /// Waiting to learn whether the segment speaks FIP.
    Auto,
    /// Pre-FIP operation with FC-MAP or learned addressing.
    NonFip,
    /// FIP discovery and login through a Forwarder.
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VnState {
    Start,
    Probe1,
    Probe2,
    Claim,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CtlrState {
    Disabled,
    LinkWait,
    Fabric(FabricState),
    Vn2Vn(VnState),
}

impl CtlrState {
    pub const ALL: [CtlrState; 10] = [
        CtlrState::Disabled,
        CtlrState::LinkWait,
        CtlrState::Fabric(FabricState::Auto),
        CtlrState::Fabric(FabricState::NonFip),
        CtlrState::Fabric(FabricState::Enabled),
        CtlrState::Vn2Vn(VnState::Start),
        CtlrState::Vn2Vn(VnState::Probe1),
        CtlrState::Vn2Vn(VnState::Probe2),
        CtlrState::Vn2Vn(VnState::Claim),
        CtlrState::Vn2Vn(VnState::Up),
    ];

    /// Dense code for the lock-free published copy.
    pub fn code(&self) -> u8 {
        match self {
            CtlrState::Disabled => 0,
            CtlrState::LinkWait => 1,
            CtlrState::Fabric(FabricState::Auto) => 2,
            CtlrState::Fabric(FabricState::NonFip) => 3,
            CtlrState::Fabric(FabricState::Enabled) => 4,
            CtlrState::Vn2Vn(VnState::Start) => 5,
            CtlrState::Vn2Vn(VnState::Probe1) => 6,
            CtlrState::Vn2Vn(VnState::Probe2) => 7,
            CtlrState::Vn2Vn(VnState::Claim) => 8,
            CtlrState::Vn2Vn(VnState::Up) => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CtlrState::Disabled => "DISABLED",
            CtlrState::LinkWait => "LINK_WAIT",
            CtlrState::Fabric(FabricState::Auto) => "AUTO",
            CtlrState::Fabric(FabricState::NonFip) => "NON_FIP",
            CtlrState::Fabric(FabricState::Enabled) => "ENABLED",
            CtlrState::Vn2Vn(VnState::Start) => "VNMP_START",
            CtlrState::Vn2Vn(VnState::Probe1) => "VNMP_PROBE1",
            CtlrState::Vn2Vn(VnState::Probe2) => "VNMP_PROBE2",
            CtlrState::Vn2Vn(VnState::Claim) => "VNMP_CLAIM",
            CtlrState::Vn2Vn(VnState::Up) => "VNMP_UP",
        }
    }

    /// True when FIP (rather than pre-FIP FCoE) is in use.
    pub fn is_fip_active(&self) -> bool {
        matches!(
            self,
            CtlrState::Fabric(FabricState::Enabled) | CtlrState::Vn2Vn(_)
        )
    }

    /// Initial state after the link comes up in `mode`.
    pub fn for_mode(mode: FipMode) -> Self {
        match mode {
            FipMode::Auto => CtlrState::Fabric(FabricState::Auto),
            FipMode::Fabric => CtlrState::Fabric(FabricState::Enabled),
            FipMode::NonFip => CtlrState::Fabric(FabricState::NonFip),
            FipMode::Vn2Vn => CtlrState::Vn2Vn(VnState::Start),
        }
    }
}

impl std::fmt::Display for CtlrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Transitions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    LinkUp(FipMode),
    LinkDown,
    /// A FIP frame with the right version arrived.
    FipSeen,
    /// A non-FIP FLOGI completed or a peer sent one to us.
    NonFipLogin,
    /// Address conflict or (re)start of VN2VN claiming.
    VnRestart,
    /// The VN2VN timer fired and the current step is complete.
    VnAdvance,
    Disable,
}

/// Next state for `event` in `state`. Events that do not apply leave the
/// state unchanged.
pub fn transition(state: CtlrState, event: Event) -> CtlrState {
    use CtlrState::*;
    match (state, event) {
        (_, Event::Disable) => Disabled,
        (Disabled, _) => Disabled,
        (_, Event::LinkDown) => LinkWait,
        (LinkWait, Event::LinkUp(mode)) => CtlrState::for_mode(mode),
        (Fabric(FabricState::Auto), Event::FipSeen) => Fabric(FabricState::Enabled),
        (Fabric(FabricState::Auto | FabricState::NonFip), Event::NonFipLogin) => {
            Fabric(FabricState::NonFip)
        }
        (Vn2Vn(_), Event::VnRestart) => Vn2Vn(VnState::Start),
        (Vn2Vn(vn), Event::VnAdvance) => Vn2Vn(match vn {
            VnState::Start => VnState::Probe1,
            VnState::Probe1 => VnState::Probe2,
            VnState::Probe2 => VnState::Claim,
            VnState::Claim | VnState::Up => VnState::Up,
        }),
        (s, _) => s,
    }
}

// ── Receive dispatch ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Advertisement,
    LinkServiceReply,
    ClearVirtualLinks,
    ProbeRequest,
    ProbeReply,
    ClaimNotify,
    ClaimReply,
    Beacon,
    Drop,
}

/// The one handler for `kind` received in `state`.
pub fn handler_for(state: CtlrState, kind: FrameKind) -> Handler {
    match state {
        CtlrState::Fabric(FabricState::Auto | FabricState::Enabled) => match kind {
            FrameKind::Advertisement => Handler::Advertisement,
            FrameKind::LsReply => Handler::LinkServiceReply,
            FrameKind::ClearVirtualLinks => Handler::ClearVirtualLinks,
            _ => Handler::Drop,
        },
        CtlrState::Vn2Vn(_) => match kind {
            FrameKind::ProbeRequest => Handler::ProbeRequest,
            FrameKind::ProbeReply => Handler::ProbeReply,
            FrameKind::ClaimNotify => Handler::ClaimNotify,
            FrameKind::ClaimReply => Handler::ClaimReply,
            FrameKind::Beacon => Handler::Beacon,
            _ => Handler::Drop,
        },
        CtlrState::Disabled | CtlrState::LinkWait | CtlrState::Fabric(FabricState::NonFip) => {
            Handler::Drop
        }
    }
}

// ── Published state ──────────────────────────────────────────────────────────

/// Read-only view of the controller state, readable without the lock.
#[derive(Debug, Clone)]
pub struct StateView {
    code: Arc<AtomicU8>,
}

impl StateView {
    pub(crate) fn new(initial: CtlrState) -> Self {
        Self {
            code: Arc::new(AtomicU8::new(initial.code())),
        }
    }

    pub(crate) fn publish(&self, state: CtlrState) {
        self.code.store(state.code(), Ordering::Release);
    }

    pub fn state(&self) -> CtlrState {
        CtlrState::from_code(self.code.load(Ordering::Acquire)).unwrap_or(CtlrState::Disabled)
    }

    pub fn is_fip_active(&self) -> bool {
        self.state().is_fip_active()
    }
}
