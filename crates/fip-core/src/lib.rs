//! fip-core — FIP wire format, descriptors, frame codec, and configuration.
//! The controller crate and the daemon both depend on this one.

pub mod config;
pub mod desc;
pub mod els;
pub mod frame;
pub mod wire;

pub use config::{FipConfig, FipMode};
pub use desc::{Descriptor, ElsKind};
pub use els::ElsFrame;
pub use frame::FipFrame;
pub use wire::{FrameKind, MacAddr, WireError};
