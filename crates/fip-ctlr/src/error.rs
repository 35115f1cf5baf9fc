//! Controller error taxonomy.

use fip_core::WireError;

/// Errors surfaced by controller operations.
///
/// Malformed and protocol-violating frames never leave the controller; they
/// are logged and counted. An ELS-send caller sees `Unselectable`,
/// `InvalidState`, or `Malformed` for an ELS too long to encapsulate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FipError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("no usable forwarder")]
    Unselectable,

    #[error("address 0x{0:06x} claimed by a peer with a larger port name")]
    AddressCollision(u32),

    #[error("{0} table full")]
    ResourceExhausted(&'static str),

    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),

    #[error("controller shut down")]
    Closed,
}
