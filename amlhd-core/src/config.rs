//! Device configuration
//!
//! Every field has a default matching a stock Amlogic kernel, so a config
//! file only needs to name what differs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::{CodecIdentity, CodecTables, VideoCodec};
use crate::error::{DeviceError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysfsPaths {
    pub tsync_enable: PathBuf,
    pub tsync_mode: PathBuf,
    pub pcr_scr: PathBuf,
    pub stb_source: PathBuf,
    pub blackout_policy: PathBuf,
    pub disable_video: PathBuf,
    pub av_threshold: PathBuf,
    pub video_clock: PathBuf,
    pub audio_clock: PathBuf,
}

impl Default for SysfsPaths {
    fn default() -> Self {
        Self {
            tsync_enable: "/sys/class/tsync/enable".into(),
            tsync_mode: "/sys/class/tsync/mode".into(),
            pcr_scr: "/sys/class/tsync/pts_pcrscr".into(),
            stb_source: "/sys/class/tsdemux/stb_source".into(),
            blackout_policy: "/sys/class/video/blackout_policy".into(),
            disable_video: "/sys/class/video/disable_video".into(),
            av_threshold: "/sys/class/tsync/av_threshold_min".into(),
            video_clock: "/sys/class/tsync/pts_video".into(),
            audio_clock: "/sys/class/tsync/pts_audio".into(),
        }
    }
}

/// Device nodes the elementary streams are written to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePaths {
    pub video: PathBuf,
    pub audio: PathBuf,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            video: "/dev/amstream_vbuf".into(),
            audio: "/dev/amstream_abuf".into(),
        }
    }
}

/// How often a still picture is fed to the decoder before it shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StillPictureConfig {
    pub h264_repeat: u32,
    pub default_repeat: u32,
}

impl Default for StillPictureConfig {
    fn default() -> Self {
        Self {
            h264_repeat: 12,
            default_repeat: 4,
        }
    }
}

impl StillPictureConfig {
    pub fn repeat_for(&self, codec: CodecIdentity) -> u32 {
        match codec {
            CodecIdentity::Video(VideoCodec::H264) => self.h264_repeat,
            _ => self.default_repeat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub sysfs: SysfsPaths,
    pub nodes: NodePaths,
    pub codec_tables: CodecTables,
    pub still_picture: StillPictureConfig,
    /// PTS ticks of drift tolerated before the hardware resyncs.
    pub av_sync_threshold: i64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sysfs: SysfsPaths::default(),
            nodes: NodePaths::default(),
            codec_tables: CodecTables::default(),
            still_picture: StillPictureConfig::default(),
            av_sync_threshold: 9_000,
        }
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DeviceError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioCodec;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg = DeviceConfig::from_json(
            r#"{ "nodes": { "video": "/tmp/v.es" }, "still_picture": { "h264_repeat": 20 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.nodes.video, PathBuf::from("/tmp/v.es"));
        assert_eq!(cfg.nodes.audio, NodePaths::default().audio);
        assert_eq!(cfg.still_picture.h264_repeat, 20);
        assert_eq!(cfg.still_picture.default_repeat, 4);
        assert_eq!(cfg.codec_tables, CodecTables::default());
        assert_eq!(cfg.av_sync_threshold, 9_000);
    }

    #[test]
    fn test_load_replaces_tables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "codec_tables": {{ "video": [[66, "H264"]], "audio": [[3, "Aac"]] }} }}"#
        )
        .unwrap();
        let cfg = DeviceConfig::load(file.path()).unwrap();
        assert_eq!(cfg.codec_tables.video_codec(0x42), VideoCodec::H264);
        assert_eq!(cfg.codec_tables.video_codec(0x1B), VideoCodec::Unknown);
        assert_eq!(cfg.codec_tables.audio_codec(3), AudioCodec::Aac);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(matches!(
            DeviceConfig::from_json("{ \"av_sync_threshold\": \"x\" }"),
            Err(DeviceError::Config(_))
        ));
        assert!(matches!(
            DeviceConfig::load(Path::new("/nonexistent/amlhd.json")),
            Err(DeviceError::Io(_))
        ));
    }

    #[test]
    fn test_still_picture_repeat() {
        let sp = StillPictureConfig::default();
        assert_eq!(sp.repeat_for(CodecIdentity::Video(VideoCodec::H264)), 12);
        assert_eq!(sp.repeat_for(CodecIdentity::Video(VideoCodec::Mpeg12)), 4);
    }
}
