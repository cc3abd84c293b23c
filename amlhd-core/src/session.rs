//! Decoder sessions
//!
//! A session owns one hardware decoder channel (audio or video) and its
//! lifecycle: `Closed -> Configuring -> Open <-> Paused -> Closed`.
//! Configuration is an immutable [`SessionConfig`] built fresh for every
//! transition.

use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::RawFd;

use crate::codec::{Capability, CodecIdentity, StreamKind};
use crate::error::{DeviceError, Result};
use crate::pts::Pts;
use crate::sink::DecoderSink;

/// Where the decoder takes its presentation timing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Timestamps are checked in and the hardware syncs to the audio clock.
    AudioMaster,
    /// The decoder paces itself; no timestamps are checked in.
    FreeRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrickMode {
    Off,
    /// Decode and show index frames only.
    IFrameOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionConfig {
    pub codec: CodecIdentity,
    pub sync: SyncMode,
    pub trick: TrickMode,
}

impl SessionConfig {
    pub fn new(codec: CodecIdentity, sync: SyncMode) -> Self {
        Self {
            codec,
            sync,
            trick: TrickMode::Off,
        }
    }

    pub fn capability(&self) -> Capability {
        self.codec.capability()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Configuring,
    Open,
    Paused,
}

pub struct DecoderSession<S: DecoderSink> {
    kind: StreamKind,
    sink: S,
    state: SessionState,
    config: Option<SessionConfig>,
}

impl<S: DecoderSink> DecoderSession<S> {
    pub fn new(kind: StreamKind, sink: S) -> Self {
        Self {
            kind,
            sink,
            state: SessionState::Closed,
            config: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// True while the session accepts writes.
    pub fn has_stream(&self) -> bool {
        matches!(self.state, SessionState::Open | SessionState::Paused)
    }

    /// Opens the channel, or resets it in place when it is already open.
    /// On failure the session ends up closed.
    pub fn configure(&mut self, config: SessionConfig) -> Result<()> {
        if config.codec.kind() != self.kind {
            return Err(DeviceError::Configuration {
                kind: self.kind,
                reason: format!("{:?} on a {} session", config.codec, self.kind),
            });
        }

        let in_place = self.has_stream();
        let was_paused = self.state == SessionState::Paused;
        self.state = SessionState::Configuring;

        let result = if in_place {
            self.sink.reconfigure(&config)
        } else {
            self.sink.open(&config)
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    "{} session {} {:?} (hw format {}, {:?}, {:?})",
                    self.kind,
                    if in_place { "reset to" } else { "opened for" },
                    config.codec,
                    config.capability().hw_format,
                    config.sync,
                    config.trick
                );
                self.state = SessionState::Open;
                self.config = Some(config);
                // a reset must not unfreeze the decoder
                if was_paused {
                    self.pause();
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("failed to configure {} decoder for {:?}: {}", self.kind, config.codec, e);
                if in_place {
                    self.sink.close();
                }
                self.state = SessionState::Closed;
                self.config = None;
                Err(DeviceError::Configuration {
                    kind: self.kind,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Writes `data` to the decoder and checks `pts` in once the first
    /// bytes are accepted, when the session syncs to timestamps.
    ///
    /// A closed session consumes nothing. When the decoder stops taking
    /// data the error carries how much was written; the caller retries
    /// the rest later.
    pub fn write(&mut self, data: &[u8], pts: Option<Pts>) -> Result<usize> {
        let config = match (self.has_stream(), self.config) {
            (true, Some(config)) => config,
            _ => return Ok(0),
        };

        let mut checkin = match config.sync {
            SyncMode::AudioMaster => pts,
            SyncMode::FreeRun => None,
        };

        let mut consumed = 0;
        while consumed < data.len() {
            match self.sink.write(&data[consumed..]) {
                Ok(n) if n > 0 => {
                    consumed += n;
                    if let Some(pts) = checkin.take() {
                        self.sink.register_pts(pts);
                    }
                }
                Ok(_) => return Err(self.stall(consumed, None)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.stall(consumed, Some(e))),
            }
        }

        Ok(consumed)
    }

    fn stall(&self, consumed: usize, err: Option<io::Error>) -> DeviceError {
        match err {
            Some(e) if e.kind() != io::ErrorKind::WouldBlock => {
                tracing::error!("failed to write {} data after {} bytes: {}", self.kind, consumed, e)
            }
            _ => tracing::debug!("{} decoder busy after {} bytes", self.kind, consumed),
        }
        DeviceError::WriteStall { consumed }
    }

    pub fn pause(&mut self) {
        if self.state != SessionState::Open {
            return;
        }
        match self.sink.pause() {
            Ok(()) => self.state = SessionState::Paused,
            Err(e) => tracing::error!("failed to pause {} decoder: {}", self.kind, e),
        }
    }

    pub fn resume(&mut self) {
        if self.state != SessionState::Paused {
            return;
        }
        match self.sink.resume() {
            Ok(()) => self.state = SessionState::Open,
            Err(e) => tracing::error!("failed to resume {} decoder: {}", self.kind, e),
        }
    }

    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.sink.close();
        tracing::debug!("{} session closed", self.kind);
        self.state = SessionState::Closed;
        self.config = None;
    }

    pub fn presentation_clock(&self) -> Option<Pts> {
        if self.has_stream() {
            self.sink.presentation_clock()
        } else {
            None
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.sink.raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioCodec, VideoCodec};
    use crate::sink::testing::{RecordingSink, SinkCall};

    fn video(codec: VideoCodec) -> SessionConfig {
        SessionConfig::new(CodecIdentity::Video(codec), SyncMode::AudioMaster)
    }

    fn session() -> (DecoderSession<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        (DecoderSession::new(StreamKind::Video, sink.clone()), sink)
    }

    #[test]
    fn test_closed_session_writes_nothing() {
        let (mut s, sink) = session();
        assert_eq!(s.write(b"data", Some(Pts::new(1))).unwrap(), 0);
        assert!(sink.calls().is_empty());
        assert!(!s.has_stream());
    }

    #[test]
    fn test_configure_opens_then_resets_in_place() {
        let (mut s, sink) = session();
        s.configure(video(VideoCodec::Mpeg12)).unwrap();
        assert_eq!(s.state(), SessionState::Open);
        s.configure(video(VideoCodec::H264)).unwrap();
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Open(video(VideoCodec::Mpeg12)),
                SinkCall::Reconfigure(video(VideoCodec::H264)),
            ]
        );
        assert_eq!(s.config(), Some(&video(VideoCodec::H264)));
    }

    #[test]
    fn test_failed_configure_leaves_session_closed() {
        let (mut s, sink) = session();
        sink.log.lock().fail_open = true;
        let err = s.configure(video(VideoCodec::H264)).unwrap_err();
        assert!(matches!(err, DeviceError::Configuration { kind: StreamKind::Video, .. }));
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.write(b"x", None).unwrap(), 0);

        sink.log.lock().fail_open = false;
        s.configure(video(VideoCodec::H264)).unwrap();
        sink.log.lock().fail_reconfigure = true;
        assert!(s.configure(video(VideoCodec::Mpeg12)).is_err());
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(sink.count(|c| *c == SinkCall::Close), 1);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let (mut s, sink) = session();
        let audio = SessionConfig::new(CodecIdentity::Audio(AudioCodec::Aac), SyncMode::AudioMaster);
        assert!(s.configure(audio).is_err());
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_write_registers_pts_and_loops() {
        let (mut s, sink) = session();
        s.configure(video(VideoCodec::H264)).unwrap();
        sink.log.lock().write_limits.extend([2, 2]);
        assert_eq!(s.write(b"abcdef", Some(Pts::new(900))).unwrap(), 6);
        assert_eq!(
            sink.calls()[1..].to_vec(),
            vec![
                SinkCall::Write(b"ab".to_vec()),
                SinkCall::Pts(Pts::new(900)),
                SinkCall::Write(b"cd".to_vec()),
                SinkCall::Write(b"ef".to_vec()),
            ]
        );
    }

    #[test]
    fn test_free_run_skips_pts() {
        let (mut s, sink) = session();
        s.configure(SessionConfig::new(CodecIdentity::Video(VideoCodec::H264), SyncMode::FreeRun))
            .unwrap();
        s.write(b"ab", Some(Pts::new(1))).unwrap();
        assert_eq!(sink.count(|c| matches!(c, SinkCall::Pts(_))), 0);
    }

    #[test]
    fn test_stall_reports_progress() {
        let (mut s, sink) = session();
        s.configure(video(VideoCodec::H264)).unwrap();
        sink.log.lock().write_limits.extend([3, 0]);
        match s.write(b"abcdef", None) {
            Err(DeviceError::WriteStall { consumed }) => assert_eq!(consumed, 3),
            other => panic!("expected stall, got {:?}", other),
        }
        assert_eq!(sink.written(), b"abc");
    }

    #[test]
    fn test_blocked_write_checks_in_nothing() {
        let (mut s, sink) = session();
        s.configure(video(VideoCodec::H264)).unwrap();
        sink.log.lock().write_limits.extend([0, 0]);
        for _ in 0..2 {
            assert!(matches!(
                s.write(b"abc", Some(Pts::new(900))),
                Err(DeviceError::WriteStall { consumed: 0 })
            ));
        }
        assert_eq!(sink.count(|c| matches!(c, SinkCall::Pts(_))), 0);

        s.write(b"abc", Some(Pts::new(900))).unwrap();
        assert_eq!(sink.count(|c| matches!(c, SinkCall::Pts(_))), 1);
    }

    #[test]
    fn test_reset_keeps_paused_session_paused() {
        let (mut s, sink) = session();
        s.configure(video(VideoCodec::H264)).unwrap();
        s.pause();
        s.configure(video(VideoCodec::Mpeg12)).unwrap();
        assert_eq!(s.state(), SessionState::Paused);
        assert_eq!(
            sink.calls()[1..].to_vec(),
            vec![
                SinkCall::Pause,
                SinkCall::Reconfigure(video(VideoCodec::Mpeg12)),
                SinkCall::Pause,
            ]
        );
        s.resume();
        assert_eq!(s.state(), SessionState::Open);
    }

    #[test]
    fn test_pause_resume_close() {
        let (mut s, sink) = session();
        s.pause();
        s.resume();
        assert!(sink.calls().is_empty());

        s.configure(video(VideoCodec::H264)).unwrap();
        s.resume();
        s.pause();
        assert_eq!(s.state(), SessionState::Paused);
        s.pause();
        s.resume();
        assert_eq!(s.state(), SessionState::Open);
        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(
            sink.calls()[1..].to_vec(),
            vec![SinkCall::Pause, SinkCall::Resume, SinkCall::Close]
        );
    }

    #[test]
    fn test_clock_only_when_open() {
        let (mut s, sink) = session();
        sink.log.lock().clock = Some(Pts::new(4500));
        assert_eq!(s.presentation_clock(), None);
        s.configure(video(VideoCodec::H264)).unwrap();
        assert_eq!(s.presentation_clock(), Some(Pts::new(4500)));
    }
}
