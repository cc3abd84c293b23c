//! Stream routing
//!
//! Tracks which PID currently feeds each decoder session and decides when
//! an incoming packet means the session has to be (re)configured.

use crate::codec::{sniff_audio, AudioCodec, CodecIdentity, CodecTables};
use crate::psi::ProgramMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Packet belongs to the active stream.
    Unchanged,
    /// A new stream took over; configure the session for this codec.
    Configure(CodecIdentity),
    /// PID is not signaled for this stream class. The payload still goes
    /// to whatever session is active.
    Mismatch,
}

pub struct StreamRouter {
    tables: CodecTables,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    audio_stream_id: Option<u8>,
}

impl StreamRouter {
    pub fn new(tables: CodecTables) -> Self {
        Self {
            tables,
            video_pid: None,
            audio_pid: None,
            audio_stream_id: None,
        }
    }

    pub fn tables(&self) -> &CodecTables {
        &self.tables
    }

    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    pub fn audio_pid(&self) -> Option<u16> {
        self.audio_pid
    }

    pub fn reset(&mut self) {
        self.video_pid = None;
        self.audio_pid = None;
        self.audio_stream_id = None;
    }

    /// Forgets the active video PID so the next packet reconfigures.
    pub fn reset_video(&mut self) {
        self.video_pid = None;
    }

    /// Forgets the active audio PID so the next packet reconfigures.
    pub fn reset_audio(&mut self) {
        self.audio_pid = None;
        self.audio_stream_id = None;
    }

    pub fn route_video(&mut self, pid: u16, map: &ProgramMap) -> RouteDecision {
        if self.video_pid == Some(pid) {
            return RouteDecision::Unchanged;
        }

        match map.video {
            Some(entry) if entry.pid == pid => {
                let codec = self.tables.video_codec(entry.stream_type);
                tracing::info!(
                    "video PID {:?} -> {} (stream type 0x{:02x}, {:?})",
                    self.video_pid,
                    pid,
                    entry.stream_type,
                    codec
                );
                self.video_pid = Some(pid);
                RouteDecision::Configure(CodecIdentity::Video(codec))
            }
            _ => {
                tracing::debug!("video PID {} not signaled", pid);
                RouteDecision::Mismatch
            }
        }
    }

    /// Routes an audio packet. `stream_id` is the PES stream id the host
    /// reported for it, `es` the first elementary stream bytes when the
    /// packet starts a PES unit (used when signaling is missing).
    pub fn route_audio(
        &mut self,
        pid: u16,
        stream_id: u8,
        es: Option<&[u8]>,
        map: &ProgramMap,
    ) -> RouteDecision {
        if self.audio_pid == Some(pid) && self.audio_stream_id == Some(stream_id) {
            return RouteDecision::Unchanged;
        }

        let codec = match map.audio_stream_type(pid) {
            Some(stream_type) => Some(match self.tables.audio_codec(stream_type) {
                AudioCodec::Unknown => es
                    .map(|es| sniff_audio(stream_id, es))
                    .unwrap_or(AudioCodec::Unknown),
                codec => codec,
            }),
            None => es
                .map(|es| sniff_audio(stream_id, es))
                .filter(|c| *c != AudioCodec::Unknown),
        };

        match codec {
            Some(codec) => {
                tracing::info!(
                    "audio PID {:?} -> {} (stream id 0x{:02x}, {:?})",
                    self.audio_pid,
                    pid,
                    stream_id,
                    codec
                );
                self.audio_pid = Some(pid);
                self.audio_stream_id = Some(stream_id);
                RouteDecision::Configure(CodecIdentity::Audio(codec))
            }
            None => {
                tracing::debug!("audio PID {} not signaled", pid);
                RouteDecision::Mismatch
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{VideoCodec, AC3_DESCRIPTOR_TAG};
    use crate::psi::EsEntry;

    fn map() -> ProgramMap {
        ProgramMap {
            video: Some(EsEntry { pid: 102, stream_type: 0x1B }),
            audio: vec![EsEntry { pid: 201, stream_type: 0x04 }],
            secondary_audio: vec![
                EsEntry { pid: 201, stream_type: AC3_DESCRIPTOR_TAG },
                EsEntry { pid: 202, stream_type: AC3_DESCRIPTOR_TAG },
            ],
        }
    }

    #[test]
    fn test_video_pid_switch() {
        let mut router = StreamRouter::new(CodecTables::default());
        let map = map();
        assert_eq!(router.route_video(101, &map), RouteDecision::Mismatch);
        assert_eq!(
            router.route_video(102, &map),
            RouteDecision::Configure(CodecIdentity::Video(VideoCodec::H264))
        );
        assert_eq!(router.route_video(102, &map), RouteDecision::Unchanged);
        assert_eq!(router.route_video(103, &map), RouteDecision::Mismatch);
        assert_eq!(router.video_pid(), Some(102));
        assert_eq!(router.route_video(102, &map), RouteDecision::Unchanged);
    }

    #[test]
    fn test_audio_primary_list_first() {
        let mut router = StreamRouter::new(CodecTables::default());
        let map = map();
        assert_eq!(
            router.route_audio(201, 0xC0, None, &map),
            RouteDecision::Configure(CodecIdentity::Audio(AudioCodec::Mpeg))
        );
        assert_eq!(
            router.route_audio(202, 0xBD, None, &map),
            RouteDecision::Configure(CodecIdentity::Audio(AudioCodec::Ac3))
        );
        assert_eq!(router.route_audio(202, 0xBD, None, &map), RouteDecision::Unchanged);
    }

    #[test]
    fn test_audio_stream_id_change_reconfigures() {
        let mut router = StreamRouter::new(CodecTables::default());
        let map = map();
        router.route_audio(201, 0xC0, None, &map);
        assert!(matches!(
            router.route_audio(201, 0xC1, None, &map),
            RouteDecision::Configure(_)
        ));
        assert_eq!(router.route_audio(201, 0xC1, None, &map), RouteDecision::Unchanged);
    }

    #[test]
    fn test_unsignaled_audio_sniffed() {
        let mut router = StreamRouter::new(CodecTables::default());
        let empty = ProgramMap::default();
        assert_eq!(router.route_audio(300, 0xBD, None, &empty), RouteDecision::Mismatch);
        assert_eq!(router.audio_pid(), None);
        assert_eq!(
            router.route_audio(300, 0xBD, Some(&[0x7F, 0xFE, 0x80, 0x01][..]), &empty),
            RouteDecision::Configure(CodecIdentity::Audio(AudioCodec::Dts))
        );
        assert_eq!(router.audio_pid(), Some(300));
    }

    #[test]
    fn test_reset_clears_active_pids() {
        let mut router = StreamRouter::new(CodecTables::default());
        let map = map();
        router.route_video(102, &map);
        router.route_audio(201, 0xC0, None, &map);
        router.reset();
        assert_eq!(router.video_pid(), None);
        assert_eq!(router.audio_pid(), None);
        assert!(matches!(router.route_video(102, &map), RouteDecision::Configure(_)));
    }
}
