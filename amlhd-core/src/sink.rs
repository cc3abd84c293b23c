// SINKS - where decoder sessions and the controller push their output
//
// • DecoderSink: one hardware decoder channel (open/reconfigure/write/...)
// • ConfigSink: fire-and-forget system configuration writes
//
// DeviceNodeSink and SysFs are the Linux implementations: a non-blocking
// device node per stream and plain writes to sysfs attributes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::config::SysfsPaths;
use crate::pts::Pts;
use crate::session::SessionConfig;

// ============================================================================
// Traits
// ============================================================================

/// One hardware decoder channel.
pub trait DecoderSink: Send {
    fn open(&mut self, config: &SessionConfig) -> io::Result<()>;

    /// Resets an open channel for a new codec without closing it.
    fn reconfigure(&mut self, config: &SessionConfig) -> io::Result<()>;

    /// Writes as much of `buf` as the decoder accepts right now.
    /// `Ok(0)` or `WouldBlock` mean the input buffer is full.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Checks a timestamp in for the unit whose first bytes were just written.
    fn register_pts(&mut self, pts: Pts);

    fn pause(&mut self) -> io::Result<()>;
    fn resume(&mut self) -> io::Result<()>;
    fn close(&mut self);

    /// Current presentation clock of this channel.
    fn presentation_clock(&self) -> Option<Pts>;

    /// Descriptor to poll for writability, if there is one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// System configuration endpoints the controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysfsKey {
    TsyncEnable,
    TsyncMode,
    PcrScr,
    StbSource,
    BlackoutPolicy,
    DisableVideo,
    AvThreshold,
}

/// Best-effort configuration writes. Failures are logged, never returned.
pub trait ConfigSink: Send {
    fn write_str(&mut self, key: SysfsKey, value: &str);

    fn write_int(&mut self, key: SysfsKey, value: i64) {
        self.write_str(key, &value.to_string());
    }
}

// ============================================================================
// SysFs
// ============================================================================

pub struct SysFs {
    paths: SysfsPaths,
}

impl SysFs {
    pub fn new(paths: SysfsPaths) -> Self {
        Self { paths }
    }

    fn path(&self, key: SysfsKey) -> &Path {
        match key {
            SysfsKey::TsyncEnable => &self.paths.tsync_enable,
            SysfsKey::TsyncMode => &self.paths.tsync_mode,
            SysfsKey::PcrScr => &self.paths.pcr_scr,
            SysfsKey::StbSource => &self.paths.stb_source,
            SysfsKey::BlackoutPolicy => &self.paths.blackout_policy,
            SysfsKey::DisableVideo => &self.paths.disable_video,
            SysfsKey::AvThreshold => &self.paths.av_threshold,
        }
    }
}

impl ConfigSink for SysFs {
    fn write_str(&mut self, key: SysfsKey, value: &str) {
        let path = self.path(key);
        // sysfs attributes exist already; never create them
        let result = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut f| f.write_all(value.as_bytes()));
        match result {
            Ok(()) => tracing::trace!("{} <- {}", path.display(), value),
            Err(e) => tracing::warn!("failed to write {} to {}: {}", value, path.display(), e),
        }
    }
}

/// Parses a sysfs clock value, hex (`0x...`) or decimal.
pub fn parse_clock(text: &str) -> Option<Pts> {
    let text = text.trim();
    let ticks = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => text.parse::<i64>().ok()?,
    };
    Some(Pts::new(ticks))
}

// ============================================================================
// DeviceNodeSink
// ============================================================================

/// Decoder channel behind a character device (or any writable path).
pub struct DeviceNodeSink {
    node: PathBuf,
    clock_path: Option<PathBuf>,
    file: Option<File>,
    config: Option<SessionConfig>,
    paused: bool,
    last_pts: Option<Pts>,
}

impl DeviceNodeSink {
    pub fn new(node: impl Into<PathBuf>, clock_path: Option<PathBuf>) -> Self {
        Self {
            node: node.into(),
            clock_path,
            file: None,
            config: None,
            paused: false,
            last_pts: None,
        }
    }

    pub fn node(&self) -> &Path {
        &self.node
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn last_registered_pts(&self) -> Option<Pts> {
        self.last_pts
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device node not open"))
    }
}

impl DecoderSink for DeviceNodeSink {
    fn open(&mut self, config: &SessionConfig) -> io::Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.node)?;
        tracing::debug!("opened {} for {:?}", self.node.display(), config.codec);
        self.file = Some(file);
        self.config = Some(*config);
        self.paused = false;
        self.last_pts = None;
        Ok(())
    }

    fn reconfigure(&mut self, config: &SessionConfig) -> io::Result<()> {
        self.file()?;
        tracing::debug!(
            "reset {} {:?} -> {:?}",
            self.node.display(),
            self.config.map(|c| c.codec),
            config.codec
        );
        self.config = Some(*config);
        self.paused = false;
        self.last_pts = None;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn register_pts(&mut self, pts: Pts) {
        tracing::trace!("{} checkin {}", self.node.display(), pts);
        self.last_pts = Some(pts);
    }

    fn pause(&mut self) -> io::Result<()> {
        self.file()?;
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.file()?;
        self.paused = false;
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!("closed {}", self.node.display());
        }
        self.config = None;
        self.paused = false;
    }

    fn presentation_clock(&self) -> Option<Pts> {
        let path = self.clock_path.as_ref()?;
        match fs::read_to_string(path) {
            Ok(text) => parse_clock(&text),
            Err(e) => {
                tracing::debug!("clock {} unreadable: {}", path.display(), e);
                None
            }
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }
}

// ============================================================================
// Test doubles
// ============================================================================
