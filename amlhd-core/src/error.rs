//! Error types shared by the decoder sessions and the playback controller.

use thiserror::Error;

use crate::codec::StreamKind;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{kind} decoder configuration failed: {reason}")]
    Configuration { kind: StreamKind, reason: String },
    #[error("Decoder sink stalled after {consumed} bytes")]
    WriteStall { consumed: usize },
    #[error("PID {pid} is not signaled in the program map")]
    RoutingMismatch { pid: u16 },
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
