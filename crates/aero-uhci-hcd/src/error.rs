use thiserror::Error;

use crate::request::RequestStatus;

pub type Result<T> = std::result::Result<T, UsbError>;

/// Errors surfaced by the UHCI scheduling core.
///
/// Transfer-level failures are reported through [`UsbError::Transfer`] with the request status
/// bitmask, so callers can tell a stalled endpoint apart from a CRC/timeout condition without
/// re-reading the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("out of DMA memory (size={size} align={align})")]
    OutOfMemory { size: usize, align: usize },

    #[error("resource claim failed: {0}")]
    ResourceClaim(String),

    #[error("pipe is not open")]
    NotOpen,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown endpoint transfer type {0:#x}")]
    UnknownTransferType(u8),

    #[error("timeout waiting for request completion")]
    Timeout,

    #[error("USB transfer error (status={0:?})")]
    Transfer(RequestStatus),

    #[error("host controller did not leave reset")]
    ControllerHalted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
