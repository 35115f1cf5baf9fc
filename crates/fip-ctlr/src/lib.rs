//! FCoE Initialization Protocol controller.
//!
//! Discovers Forwarders and logs in through them (fabric mode), or claims a
//! self-assigned address among peers (VN2VN). [`Controller`] is the
//! synchronous state machine; [`driver::spawn`] runs one on a tokio task.

pub mod arena;
pub mod controller;
pub mod driver;
pub mod error;
mod fabric;
pub mod fcf;
pub mod flogi;
pub mod peer;
pub mod port;
pub mod state;
mod vn2vn;

#[cfg(test)]
mod testutil;

pub use controller::{Controller, ElsSend, Snapshot, Stats};
pub use driver::{spawn, FipHandle};
pub use error::FipError;
pub use port::{FcPort, RemotePort, RportEvent, Transport, VirtualPort};
pub use state::{CtlrState, FabricState, StateView, VnState};
