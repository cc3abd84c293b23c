//! Codec identities and the stream-type lookup tables
//!
//! Stream-type codes come from the PMT (ISO 13818-1 table 2-34) or, for
//! the secondary audio list, from the descriptor tag that announced the
//! stream. Everything the hardware needs to know about an identity lives
//! in [`Capability`].

use serde::{Deserialize, Serialize};
use std::fmt;

// PMT stream types
pub const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_AAC: u8 = 0x0F;
pub const STREAM_TYPE_AAC_LATM: u8 = 0x11;
pub const STREAM_TYPE_H264: u8 = 0x1B;

// Descriptor tags used as stream types in the secondary audio list
pub const AC3_DESCRIPTOR_TAG: u8 = 0x6A;
pub const ENHANCED_AC3_DESCRIPTOR_TAG: u8 = 0x7A;

// PES stream ids
pub const PRIVATE_STREAM_1: u8 = 0xBD;
pub const AUDIO_STREAM_FIRST: u8 = 0xC0;
pub const AUDIO_STREAM_LAST: u8 = 0xDF;
pub const VIDEO_STREAM_FIRST: u8 = 0xE0;
pub const VIDEO_STREAM_LAST: u8 = 0xEF;

const AC3_SYNC: [u8; 2] = [0x0B, 0x77];
const DTS_SYNC: [u8; 4] = [0x7F, 0xFE, 0x80, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Mpeg12,
    H264,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Mpeg,
    Aac,
    Ac3,
    Eac3,
    Dts,
    Unknown,
}

/// Codec a decoder session is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecIdentity {
    Video(VideoCodec),
    Audio(AudioCodec),
}

/// Per-identity hardware parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// `vformat_t` / `aformat_t` value understood by the decoder, -1 if unknown.
    pub hw_format: i32,
    /// Whether timestamps reach the decoder out of band rather than in the stream.
    pub external_pts: bool,
}

impl CodecIdentity {
    pub fn kind(self) -> StreamKind {
        match self {
            CodecIdentity::Video(_) => StreamKind::Video,
            CodecIdentity::Audio(_) => StreamKind::Audio,
        }
    }

    pub fn capability(self) -> Capability {
        let (hw_format, external_pts) = match self {
            CodecIdentity::Video(VideoCodec::Mpeg12) => (0, true),
            CodecIdentity::Video(VideoCodec::H264) => (2, true),
            CodecIdentity::Video(VideoCodec::Unknown) => (-1, false),
            CodecIdentity::Audio(AudioCodec::Mpeg) => (0, false),
            CodecIdentity::Audio(AudioCodec::Aac) => (2, false),
            CodecIdentity::Audio(AudioCodec::Ac3) => (3, false),
            CodecIdentity::Audio(AudioCodec::Dts) => (6, false),
            CodecIdentity::Audio(AudioCodec::Eac3) => (21, false),
            CodecIdentity::Audio(AudioCodec::Unknown) => (-1, false),
        };
        Capability {
            hw_format,
            external_pts,
        }
    }
}

/// Stream-type to codec mapping. Replaceable as a whole through the
/// device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecTables {
    pub video: Vec<(u8, VideoCodec)>,
    pub audio: Vec<(u8, AudioCodec)>,
}

impl Default for CodecTables {
    fn default() -> Self {
        Self {
            video: vec![
                (STREAM_TYPE_MPEG1_VIDEO, VideoCodec::Mpeg12),
                (STREAM_TYPE_MPEG2_VIDEO, VideoCodec::Mpeg12),
                (STREAM_TYPE_H264, VideoCodec::H264),
            ],
            audio: vec![
                (STREAM_TYPE_MPEG1_AUDIO, AudioCodec::Mpeg),
                (STREAM_TYPE_MPEG2_AUDIO, AudioCodec::Mpeg),
                (STREAM_TYPE_AAC, AudioCodec::Aac),
                (STREAM_TYPE_AAC_LATM, AudioCodec::Aac),
                (AC3_DESCRIPTOR_TAG, AudioCodec::Ac3),
                (ENHANCED_AC3_DESCRIPTOR_TAG, AudioCodec::Eac3),
            ],
        }
    }
}

impl CodecTables {
    pub fn video_codec(&self, stream_type: u8) -> VideoCodec {
        self.video
            .iter()
            .find(|(t, _)| *t == stream_type)
            .map(|(_, c)| *c)
            .unwrap_or(VideoCodec::Unknown)
    }

    pub fn audio_codec(&self, stream_type: u8) -> AudioCodec {
        self.audio
            .iter()
            .find(|(t, _)| *t == stream_type)
            .map(|(_, c)| *c)
            .unwrap_or(AudioCodec::Unknown)
    }
}

/// Guesses the audio codec from a PES stream id and the first payload bytes.
pub fn sniff_audio(stream_id: u8, payload: &[u8]) -> AudioCodec {
    if (AUDIO_STREAM_FIRST..=AUDIO_STREAM_LAST).contains(&stream_id) {
        return AudioCodec::Mpeg;
    }
    if stream_id != PRIVATE_STREAM_1 {
        return AudioCodec::Unknown;
    }

    if payload.starts_with(&DTS_SYNC) {
        return AudioCodec::Dts;
    }
    if payload.starts_with(&AC3_SYNC) {
        return ac3_flavor(payload);
    }

    // DVD-style private stream: substream id followed by a 3 byte header
    match payload.first() {
        Some(0x80..=0x87) => AudioCodec::Ac3,
        Some(0x88..=0x8F) => AudioCodec::Dts,
        _ => AudioCodec::Unknown,
    }
}

/// AC-3 and E-AC-3 share a sync word; bsid above 10 marks E-AC-3.
fn ac3_flavor(frame: &[u8]) -> AudioCodec {
    match frame.get(5) {
        Some(b) if (b >> 3) > 10 => AudioCodec::Eac3,
        _ => AudioCodec::Ac3,
    }
}

/// Guesses the video codec of an elementary stream from its start codes.
pub fn sniff_video(es: &[u8]) -> VideoCodec {
    for w in es.windows(4) {
        if w[..3] != [0x00, 0x00, 0x01] {
            continue;
        }
        match w[3] {
            // sequence header, GOP header
            0xB3 | 0xB8 => return VideoCodec::Mpeg12,
            // forbidden_zero_bit clear, NAL type SPS or AUD
            b if b & 0x80 == 0 && matches!(b & 0x1F, 7 | 9) => return VideoCodec::H264,
            _ => {}
        }
    }
    VideoCodec::Unknown
}

/// True for PES stream ids carrying video.
pub fn is_video_stream_id(stream_id: u8) -> bool {
    (VIDEO_STREAM_FIRST..=VIDEO_STREAM_LAST).contains(&stream_id)
}
