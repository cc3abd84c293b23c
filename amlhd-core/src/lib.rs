//! # amlhd core
//!
//! Output device core for Amlogic set-top boxes: takes MPEG transport
//! packets from a host media player and drives the hardware audio and
//! video decoders, including trickplay pacing and still pictures.

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod pts;
pub mod trickplay;

// ============================================================================
// Transport Stream
// ============================================================================
pub mod codec;
pub mod psi;
pub mod ts;

// ============================================================================
// Decoders
// ============================================================================
pub mod router;
pub mod session;
pub mod sink;

// ============================================================================
// Controller
// ============================================================================
pub mod config;
pub mod device;
pub mod error;

pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use codec::{AudioCodec, CodecIdentity, CodecTables, StreamKind, VideoCodec};
pub use config::DeviceConfig;
pub use device::{AmlDevice, ControllerState, PlayMode, SharedDevice};
pub use error::{DeviceError, Result};
pub use psi::{ProgramMap, PsiScanner};
pub use pts::Pts;
pub use session::{DecoderSession, SessionConfig, SessionState, SyncMode, TrickMode};
pub use sink::{ConfigSink, DecoderSink, DeviceNodeSink, SysFs, SysfsKey};
pub use trickplay::{Direction, Speed, TrickPlayScheduler};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
