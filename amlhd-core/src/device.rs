//! Playback controller
//!
//! `AmlDevice` is what a host media player talks to. It takes transport
//! packets one at a time, routes them to the audio or video decoder
//! session, gates them through the trickplay scheduler and keeps the
//! sessions and the system sync configuration in step with the
//! requested play mode.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{MonotonicClock, SystemClock};
use crate::codec::{self, CodecIdentity, StreamKind, VideoCodec};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::psi::ProgramMap;
use crate::pts::Pts;
use crate::router::{RouteDecision, StreamRouter};
use crate::session::{DecoderSession, SessionConfig, SyncMode, TrickMode};
use crate::sink::{ConfigSink, DecoderSink, DeviceNodeSink, SysFs, SysfsKey};
use crate::trickplay::TrickPlayScheduler;
use crate::ts;

// Lowest PES stream id; smaller values after a start code are ES start codes
const PES_STREAM_ID_MIN: u8 = 0xBC;

/// What the host player intends to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayMode {
    None,
    AudioVideo,
    AudioOnly,
    AudioOnlyBlack,
    VideoOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// No play mode, nothing open.
    Idle,
    /// Play mode set, waiting for the first routable packet.
    Configured,
    Playing,
    Frozen,
}

/// Controller behind a lock, for hosts that deliver from several threads.
pub type SharedDevice<S, C = SystemClock> = Arc<Mutex<AmlDevice<S, C>>>;

/// One transport packet taken apart.
struct Unit<'a> {
    pid: u16,
    pts: Option<Pts>,
    /// Elementary stream bytes, PES header removed.
    es: &'a [u8],
    /// True when a PES unit starts in this packet.
    start: bool,
}

impl<'a> Unit<'a> {
    fn parse(packet: &'a [u8]) -> Option<Self> {
        let pid = ts::pid(packet)?;
        let payload = ts::payload(packet).unwrap_or(&[]);
        let start = ts::payload_unit_start(packet) && ts::is_pes(payload);

        if !start {
            return Some(Self {
                pid,
                pts: None,
                es: payload,
                start,
            });
        }

        let offset = ts::pes_payload_offset(payload).unwrap_or(payload.len());
        Some(Self {
            pid,
            pts: ts::pes_pts(payload),
            es: &payload[offset..],
            start,
        })
    }
}

pub struct AmlDevice<S: DecoderSink, C: MonotonicClock = SystemClock> {
    config: DeviceConfig,
    video: DecoderSession<S>,
    audio: DecoderSession<S>,
    router: StreamRouter,
    scheduler: TrickPlayScheduler<C>,
    sysfs: Box<dyn ConfigSink>,
    program_map: ProgramMap,
    play_mode: PlayMode,
    trick_active: bool,
    frozen: bool,
    video_backlog: Vec<u8>,
    audio_backlog: Vec<u8>,
}

impl AmlDevice<DeviceNodeSink, SystemClock> {
    /// Device on the configured device nodes and sysfs attributes.
    pub fn from_config(config: DeviceConfig) -> Self {
        let video = DeviceNodeSink::new(
            config.nodes.video.clone(),
            Some(config.sysfs.video_clock.clone()),
        );
        let audio = DeviceNodeSink::new(
            config.nodes.audio.clone(),
            Some(config.sysfs.audio_clock.clone()),
        );
        let sysfs = Box::new(SysFs::new(config.sysfs.clone()));
        Self::new(config, video, audio, SystemClock::new(), sysfs)
    }
}

impl<S: DecoderSink, C: MonotonicClock> AmlDevice<S, C> {
    pub fn new(
        config: DeviceConfig,
        video_sink: S,
        audio_sink: S,
        clock: C,
        sysfs: Box<dyn ConfigSink>,
    ) -> Self {
        let router = StreamRouter::new(config.codec_tables.clone());
        Self {
            config,
            video: DecoderSession::new(StreamKind::Video, video_sink),
            audio: DecoderSession::new(StreamKind::Audio, audio_sink),
            router,
            scheduler: TrickPlayScheduler::new(clock),
            sysfs,
            program_map: ProgramMap::default(),
            play_mode: PlayMode::None,
            trick_active: false,
            frozen: false,
            video_backlog: Vec::new(),
            audio_backlog: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedDevice<S, C> {
        Arc::new(Mutex::new(self))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        let streaming = self.video.has_stream() || self.audio.has_stream();
        match (streaming, self.frozen, self.play_mode) {
            (true, true, _) => ControllerState::Frozen,
            (true, false, _) => ControllerState::Playing,
            (false, _, PlayMode::None) => ControllerState::Idle,
            (false, _, _) => ControllerState::Configured,
        }
    }

    pub fn play_mode(&self) -> PlayMode {
        self.play_mode
    }

    pub fn is_trick_active(&self) -> bool {
        self.trick_active
    }

    pub fn video_session(&self) -> &DecoderSession<S> {
        &self.video
    }

    pub fn audio_session(&self) -> &DecoderSession<S> {
        &self.audio
    }

    pub fn active_video_pid(&self) -> Option<u16> {
        self.router.video_pid()
    }

    pub fn active_audio_pid(&self) -> Option<u16> {
        self.router.audio_pid()
    }

    pub fn scheduler(&self) -> &TrickPlayScheduler<C> {
        &self.scheduler
    }

    /// Replaces the signaled program map the router checks PIDs against.
    pub fn set_program_map(&mut self, map: ProgramMap) {
        self.program_map = map;
    }

    // ------------------------------------------------------------------
    // Mode control
    // ------------------------------------------------------------------

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        tracing::info!("play mode {:?} -> {:?}", self.play_mode, mode);

        match mode {
            PlayMode::None => {
                self.clear();
                self.trick_active = false;
                self.sysfs.write_int(SysfsKey::BlackoutPolicy, 1);
            }
            PlayMode::AudioVideo
            | PlayMode::AudioOnly
            | PlayMode::AudioOnlyBlack
            | PlayMode::VideoOnly => {
                self.sysfs.write_int(SysfsKey::BlackoutPolicy, 0);
                let blank = mode == PlayMode::AudioOnlyBlack;
                self.sysfs.write_int(SysfsKey::DisableVideo, blank as i64);
            }
        }

        self.play_mode = mode;
    }

    /// Tears down both sessions and forgets routing and pacing state.
    pub fn clear(&mut self) {
        tracing::debug!("clear");
        self.video.close();
        self.audio.close();
        self.video_backlog.clear();
        self.audio_backlog.clear();
        self.router.reset();
        self.scheduler.reset();
        self.frozen = false;
        self.sysfs.write_int(SysfsKey::TsyncEnable, 0);
    }

    pub fn freeze(&mut self) {
        tracing::debug!("freeze");
        self.video.pause();
        self.audio.pause();
        self.frozen = self.video.has_stream() || self.audio.has_stream();
    }

    /// Back to normal play: resumes frozen sessions and leaves trick mode.
    pub fn resume_play(&mut self) {
        tracing::debug!("play");
        self.video.resume();
        self.audio.resume();
        self.frozen = false;

        if self.trick_active {
            self.trick_active = false;
            self.scheduler.reset();
            self.resync_sessions();
        }
    }

    pub fn trick_speed(&mut self, code: i32, forward: bool) {
        tracing::debug!("trick speed {} {}", code, if forward { "forward" } else { "backward" });
        let entering = !self.trick_active;
        self.trick_active = true;
        self.scheduler.set_speed(code, forward);
        if entering {
            self.resync_sessions();
        }
    }

    /// Presentation clock. In trick mode the last admitted timestamp stands
    /// in for the hardware clock; otherwise audio is preferred over video.
    pub fn get_clock(&self) -> Option<Pts> {
        if self.trick_active {
            return self.scheduler.get_pts();
        }
        if self.audio.has_stream() {
            self.audio.presentation_clock()
        } else {
            self.video.presentation_clock()
        }
    }

    fn sync_mode(&self) -> SyncMode {
        if self.trick_active {
            SyncMode::FreeRun
        } else {
            SyncMode::AudioMaster
        }
    }

    /// Reconfigures open sessions after the sync mode changed.
    fn resync_sessions(&mut self) {
        let sync = self.sync_mode();
        for kind in [StreamKind::Video, StreamKind::Audio] {
            let session = self.session_mut(kind);
            if let Some(current) = session.config().copied() {
                let config = SessionConfig {
                    sync,
                    trick: TrickMode::Off,
                    ..current
                };
                if config != current {
                    // failure is logged by the session; it degrades to closed
                    let _ = session.configure(config);
                }
            }
        }
        self.update_hw_sync();
    }

    fn session_mut(&mut self, kind: StreamKind) -> &mut DecoderSession<S> {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    /// Hardware A/V sync runs only with both streams up in normal play.
    fn update_hw_sync(&mut self) {
        let both = self.video.has_stream() && self.audio.has_stream();
        if both && !self.trick_active {
            self.sysfs.write_int(SysfsKey::AvThreshold, self.config.av_sync_threshold);
            // 1: audio master
            self.sysfs.write_int(SysfsKey::TsyncMode, 1);
            self.sysfs.write_int(SysfsKey::TsyncEnable, 1);
        } else {
            self.sysfs.write_int(SysfsKey::TsyncEnable, 0);
        }
    }

    fn configure_session(&mut self, codec: CodecIdentity) -> Result<()> {
        let config = SessionConfig::new(codec, self.sync_mode());
        let result = self.open_session(config);
        self.update_hw_sync();
        result
    }

    /// Applies `config` to its session, selecting the stream source first
    /// when the session is coming up from closed.
    fn open_session(&mut self, config: SessionConfig) -> Result<()> {
        let kind = config.codec.kind();
        if !self.session_mut(kind).has_stream() {
            // 2: memory input
            self.sysfs.write_int(SysfsKey::StbSource, 2);
            self.sysfs.write_str(SysfsKey::PcrScr, "0x0");
        }
        match kind {
            StreamKind::Video => self.video_backlog.clear(),
            StreamKind::Audio => self.audio_backlog.clear(),
        }
        let frozen = self.frozen;
        let session = self.session_mut(kind);
        session.configure(config)?;
        if frozen {
            session.pause();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Packet delivery
    // ------------------------------------------------------------------

    /// Delivers one video transport packet.
    ///
    /// Returns the number of bytes consumed: the packet length, or zero if
    /// the packet has to be offered again later (held back by trick pacing
    /// or by a full decoder).
    pub fn play_video(&mut self, packet: &[u8]) -> Result<usize> {
        if !Self::drain(&mut self.video, &mut self.video_backlog) {
            return Ok(0);
        }

        let unit = match Unit::parse(packet) {
            Some(unit) => unit,
            None => {
                tracing::debug!("dropping malformed video packet ({} bytes)", packet.len());
                return Ok(packet.len());
            }
        };

        match self.router.route_video(unit.pid, &self.program_map) {
            RouteDecision::Configure(codec) => {
                if let Err(e) = self.configure_session(codec) {
                    tracing::warn!("video disabled until the next PID change: {}", e);
                }
            }
            RouteDecision::Mismatch => {
                tracing::trace!("{}", DeviceError::RoutingMismatch { pid: unit.pid });
            }
            RouteDecision::Unchanged => {}
        }

        self.deliver(StreamKind::Video, &unit, packet.len())
    }

    /// Delivers one audio transport packet. `stream_id` is the PES stream
    /// id the host associates with the track; a change forces the audio
    /// session to be reconfigured even on the same PID.
    pub fn play_audio(&mut self, packet: &[u8], stream_id: u8) -> Result<usize> {
        if !Self::drain(&mut self.audio, &mut self.audio_backlog) {
            return Ok(0);
        }

        let unit = match Unit::parse(packet) {
            Some(unit) => unit,
            None => {
                tracing::debug!("dropping malformed audio packet ({} bytes)", packet.len());
                return Ok(packet.len());
            }
        };

        let sniff = unit.start.then_some(unit.es);
        match self.router.route_audio(unit.pid, stream_id, sniff, &self.program_map) {
            RouteDecision::Configure(codec) => {
                if let Err(e) = self.configure_session(codec) {
                    tracing::warn!("audio disabled until the next PID change: {}", e);
                }
            }
            RouteDecision::Mismatch => {
                tracing::trace!("{}", DeviceError::RoutingMismatch { pid: unit.pid });
            }
            RouteDecision::Unchanged => {}
        }

        self.deliver(StreamKind::Audio, &unit, packet.len())
    }

    fn deliver(&mut self, kind: StreamKind, unit: &Unit<'_>, len: usize) -> Result<usize> {
        if !self.scheduler.admits(unit.pts) {
            return Ok(0);
        }

        let (session, backlog) = match kind {
            StreamKind::Video => (&mut self.video, &mut self.video_backlog),
            StreamKind::Audio => (&mut self.audio, &mut self.audio_backlog),
        };

        // pacing only moves on once the packet is taken
        match session.write(unit.es, unit.pts) {
            Ok(_) => {}
            Err(DeviceError::WriteStall { consumed: 0 }) => return Ok(0),
            Err(DeviceError::WriteStall { consumed }) => {
                // The packet is taken; its tail goes out before the next one.
                backlog.extend_from_slice(&unit.es[consumed..]);
            }
            Err(e) => return Err(e),
        }
        self.scheduler.admit(unit.pts);
        Ok(len)
    }

    /// Pushes out a stalled tail. True when nothing is left.
    fn drain(session: &mut DecoderSession<S>, backlog: &mut Vec<u8>) -> bool {
        if backlog.is_empty() {
            return true;
        }
        match session.write(backlog, None) {
            Err(DeviceError::WriteStall { consumed }) => {
                backlog.drain(..consumed);
                false
            }
            _ => {
                backlog.clear();
                true
            }
        }
    }

    /// Tries to write out everything still pending.
    pub fn flush(&mut self) -> bool {
        let video = Self::drain(&mut self.video, &mut self.video_backlog);
        let audio = Self::drain(&mut self.audio, &mut self.audio_backlog);
        video && audio
    }

    /// Waits until an open session can take more data. Sessions without a
    /// pollable descriptor count as ready.
    pub fn poll(&self, timeout: Duration) -> bool {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2);
        for session in [&self.video, &self.audio] {
            if !session.has_stream() {
                continue;
            }
            match session.raw_fd() {
                Some(fd) => fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                }),
                None => return true,
            }
        }
        if fds.is_empty() {
            return true;
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `fds` is a live, correctly sized array of pollfd structs.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            tracing::warn!("poll failed: {}", std::io::Error::last_os_error());
            return false;
        }
        ready > 0
    }

    // ------------------------------------------------------------------
    // Still picture
    // ------------------------------------------------------------------

    /// Shows a single frame. `data` is a run of PES packets, transport
    /// packets, or a bare video elementary stream.
    ///
    /// A decoder that stops taking data fails with `WriteStall`, carrying
    /// the bytes written over all repeats.
    pub fn still_picture(&mut self, data: &[u8]) -> Result<()> {
        let reassembled;
        let data = if data.first() == Some(&ts::TS_SYNC_BYTE) && data.len() % ts::TS_PACKET_SIZE == 0
        {
            reassembled = data
                .chunks_exact(ts::TS_PACKET_SIZE)
                .filter_map(ts::payload)
                .flatten()
                .copied()
                .collect::<Vec<u8>>();
            &reassembled[..]
        } else {
            data
        };

        let units: Vec<&[u8]> = if ts::pes_stream_id(data).is_some_and(|id| id >= PES_STREAM_ID_MIN) {
            ts::split_pes(data)
                .into_iter()
                .filter(|unit| ts::pes_stream_id(unit).is_some_and(codec::is_video_stream_id))
                .filter_map(|unit| ts::pes_payload_offset(unit).map(move |offset| &unit[offset..]))
                .collect()
        } else {
            vec![data]
        };

        let codec = self.still_codec(&units);
        let config = SessionConfig {
            codec: CodecIdentity::Video(codec),
            sync: SyncMode::FreeRun,
            trick: TrickMode::IFrameOnly,
        };

        self.video_backlog.clear();
        if self.video.config() != Some(&config) {
            self.open_session(config)?;
        }
        self.sysfs.write_int(SysfsKey::TsyncEnable, 0);
        // normal play has to configure again
        self.router.reset_video();

        let repeat = self.config.still_picture.repeat_for(config.codec);
        tracing::debug!("still picture {:?}, {} units x{}", codec, units.len(), repeat);

        let mut written = 0;
        for _ in 0..repeat {
            for unit in &units {
                match self.video.write(unit, None) {
                    Ok(n) => written += n,
                    Err(DeviceError::WriteStall { consumed }) => {
                        return Err(DeviceError::WriteStall {
                            consumed: written + consumed,
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn still_codec(&self, units: &[&[u8]]) -> VideoCodec {
        if let Some(CodecIdentity::Video(codec)) = self.video.config().map(|c| c.codec) {
            if codec != VideoCodec::Unknown {
                return codec;
            }
        }
        if let Some(stream_type) = self.program_map.video_stream_type() {
            let codec = self.router.tables().video_codec(stream_type);
            if codec != VideoCodec::Unknown {
                return codec;
            }
        }
        units
            .iter()
            .map(|es| codec::sniff_video(es))
            .find(|c| *c != VideoCodec::Unknown)
            .unwrap_or(VideoCodec::Mpeg12)
    }
}
