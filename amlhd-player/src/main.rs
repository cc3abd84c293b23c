//! AMLHD Player - feeds a recorded transport stream through the device core
//!
//! Reads a `.ts` file packet by packet, hands the signaled video and audio
//! PIDs to the controller the way a host media player would, and reports
//! the presentation clock while it runs.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amlhd_core::ts::{self, TS_PACKET_SIZE};
use amlhd_core::{AmlDevice, DeviceConfig, DeviceNodeSink, PlayMode, ProgramMap, PsiScanner, SharedDevice};

type Device = SharedDevice<DeviceNodeSink>;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const RETRY_DELAY: Duration = Duration::from_millis(5);
// longest a packet may be refused; the slowest trick level holds ~0.5 s per frame
const DELIVER_TIMEOUT: Duration = Duration::from_secs(10);
const CLOCK_REPORT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_AUDIO_STREAM_ID: u8 = 0xC0;

struct PlayerOptions {
    input: Option<PathBuf>,
    config: Option<PathBuf>,
    video_out: Option<PathBuf>,
    audio_out: Option<PathBuf>,
    speed: Option<i32>,
    reverse: bool,
    still: Option<PathBuf>,
}

#[derive(Default)]
struct PlayStats {
    packets: u64,
    video_packets: u64,
    audio_packets: u64,
    retries: u64,
    program_maps: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amlhd=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    tracing::info!("AMLHD Player v{} (core {})", env!("CARGO_PKG_VERSION"), amlhd_core::VERSION);

    let mut config = match &options.config {
        Some(path) => DeviceConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {:?}: {}", path, e))?,
        None => DeviceConfig::default(),
    };
    if let Some(path) = &options.video_out {
        config.nodes.video = path.clone();
    }
    if let Some(path) = &options.audio_out {
        config.nodes.audio = path.clone();
    }

    let device = AmlDevice::from_config(config).into_shared();
    device.lock().set_play_mode(PlayMode::AudioVideo);

    if let Some(still) = &options.still {
        let data = std::fs::read(still)
            .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", still, e))?;
        device.lock().still_picture(&data)?;
        tracing::info!("Still picture shown from {:?} ({} bytes)", still, data.len());
        if options.input.is_none() {
            return Ok(());
        }
    }

    let input = options.input.clone().ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input")
    })?;

    if let Some(code) = options.speed {
        device.lock().trick_speed(code, !options.reverse);
    }

    let running = Arc::new(AtomicBool::new(true));
    let reporter = spawn_clock_reporter(device.clone(), running.clone());

    let result = play_file(&device, &input);

    running.store(false, Ordering::Relaxed);
    if reporter.join().is_err() {
        tracing::warn!("Clock reporter panicked");
    }

    let stats = result?;
    tracing::info!(
        "Playback complete: packets={}, video={}, audio={}, retries={}, program_maps={}",
        stats.packets,
        stats.video_packets,
        stats.audio_packets,
        stats.retries,
        stats.program_maps
    );

    device.lock().set_play_mode(PlayMode::None);
    Ok(())
}

// ============================================================================
// Playback
// ============================================================================

fn play_file(device: &Device, input: &Path) -> Result<PlayStats> {
    let data = std::fs::read(input).map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", input, e))?;
    if data.len() % TS_PACKET_SIZE != 0 {
        tracing::warn!(
            "{:?} is not a whole number of transport packets; ignoring {} trailing bytes",
            input,
            data.len() % TS_PACKET_SIZE
        );
    }

    let started = Instant::now();
    let mut stats = PlayStats::default();
    let mut scanner = PsiScanner::new();
    let mut stream_ids: HashMap<u16, u8> = HashMap::new();

    for packet in data.chunks_exact(TS_PACKET_SIZE) {
        stats.packets += 1;
        if packet[0] != ts::TS_SYNC_BYTE {
            tracing::debug!("Lost sync at packet {}", stats.packets);
            continue;
        }

        if let Some(map) = scanner.push(packet) {
            stats.program_maps += 1;
            device.lock().set_program_map(map.clone());
        }

        let pid = match ts::pid(packet) {
            Some(pid) => pid,
            None => continue,
        };
        let map = scanner.program_map();

        if map.video_pid() == Some(pid) {
            stats.video_packets += 1;
            stats.retries += deliver(|| device.lock().play_video(packet), || wait(device), DELIVER_TIMEOUT)?;
        } else if selected_audio_pid(map) == Some(pid) {
            if ts::payload_unit_start(packet) {
                if let Some(id) = ts::payload(packet).and_then(ts::pes_stream_id) {
                    stream_ids.insert(pid, id);
                }
            }
            let stream_id = stream_ids.get(&pid).copied().unwrap_or(DEFAULT_AUDIO_STREAM_ID);
            stats.audio_packets += 1;
            stats.retries += deliver(
                || device.lock().play_audio(packet, stream_id),
                || wait(device),
                DELIVER_TIMEOUT,
            )?;
        }
    }

    let flush_started = Instant::now();
    while !device.lock().flush() {
        if flush_started.elapsed() > DELIVER_TIMEOUT {
            return Err(anyhow::anyhow!("Decoder did not drain within {:?}", DELIVER_TIMEOUT));
        }
        wait(device);
    }

    tracing::info!("Fed {:?} in {} ms", input, started.elapsed().as_millis());
    Ok(stats)
}

/// Offers one packet until the controller takes it; returns the retry count.
fn deliver<P, W>(mut play: P, mut wait: W, timeout: Duration) -> Result<u64>
where
    P: FnMut() -> amlhd_core::Result<usize>,
    W: FnMut(),
{
    let started = Instant::now();
    let mut retries = 0;
    loop {
        if play()? > 0 {
            return Ok(retries);
        }
        if started.elapsed() > timeout {
            return Err(anyhow::anyhow!(
                "Packet refused for {:?} after {} retries",
                timeout,
                retries
            ));
        }
        retries += 1;
        wait();
    }
}

fn wait(device: &Device) {
    device.lock().poll(POLL_TIMEOUT);
    std::thread::sleep(RETRY_DELAY);
}

fn selected_audio_pid(map: &ProgramMap) -> Option<u16> {
    map.audio
        .first()
        .or_else(|| map.secondary_audio.first())
        .map(|entry| entry.pid)
}

fn spawn_clock_reporter(
    device: Device,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_report = Instant::now();
        while running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
            if last_report.elapsed() < CLOCK_REPORT_INTERVAL {
                continue;
            }
            last_report = Instant::now();

            let dev = device.lock();
            match dev.get_clock() {
                Some(pts) => tracing::info!("clock {} ({:?})", pts, dev.state()),
                None => tracing::info!("clock unavailable ({:?})", dev.state()),
            }
        }
    })
}

// ============================================================================
// Arguments
// ============================================================================

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut options = PlayerOptions {
        input: None,
        config: None,
        video_out: None,
        audio_out: None,
        speed: None,
        reverse: false,
        still: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
        };
        match args[i].as_str() {
            "--input" | "-i" => {
                options.input = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--video-out" => {
                options.video_out = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--audio-out" => {
                options.audio_out = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--speed" | "-s" => {
                let raw = value()?;
                let code = raw
                    .parse::<i32>()
                    .map_err(|e| anyhow::anyhow!("Invalid speed code {}: {}", raw, e))?;
                // pause never admits the next frame; a paused file would never finish
                if code == 0 {
                    return Err(anyhow::anyhow!("Speed code 0 pauses playback and is not supported here"));
                }
                options.speed = Some(code);
                i += 2;
            }
            "--reverse" => {
                options.reverse = true;
                i += 1;
            }
            "--still" => {
                options.still = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    if options.input.is_none() && options.still.is_none() {
        print_usage();
        return Err(anyhow::anyhow!("Missing required --input or --still"));
    }

    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  amlhd-play --input <file.ts> [--config <file.json>] [--video-out <path>] \
         [--audio-out <path>] [--speed <code>] [--reverse] [--still <file>]\n\n\
         Speed codes: 8/4/2 slow forward, 63/48/24 slow reverse, 6/3/1 fast\n"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("amlhd-play")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args_speed() {
        let options = parse_args(&args(&["-i", "in.ts", "--speed", "4", "--reverse"])).unwrap();
        assert_eq!(options.speed, Some(4));
        assert!(options.reverse);
        assert_eq!(options.input, Some(PathBuf::from("in.ts")));

        assert!(parse_args(&args(&["-i", "in.ts", "--speed", "0"])).is_err());
        assert!(parse_args(&args(&["-i", "in.ts", "--speed", "fast"])).is_err());
        assert!(parse_args(&args(&["--speed", "4"])).is_err());
    }

    #[test]
    fn test_deliver_retries_until_taken() {
        let mut offers = 0;
        let mut waits = 0;
        let retries = deliver(
            || {
                offers += 1;
                Ok(if offers < 3 { 0 } else { 188 })
            },
            || waits += 1,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(retries, 2);
        assert_eq!(waits, 2);
    }

    #[test]
    fn test_deliver_gives_up_on_refused_packet() {
        let result = deliver(|| Ok(0), || std::thread::sleep(Duration::from_millis(1)), Duration::from_millis(20));
        assert!(result.is_err());
    }
}
