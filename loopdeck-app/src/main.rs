//! loopdeck - headless multi-track loop player
//!
//! Reads one command per line from stdin and plays through the default
//! output device.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loopdeck_audio::{Engine, FftSize, Renderer, SystemClock, TrackState};
use loopdeck_library::{Config, TrackLoader};

mod commands;

use commands::{parse_command, Command, HELP};

/// How often the control loop drains completion events
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Command-line arguments for loopdeck
#[derive(Parser, Debug)]
#[command(name = "loopdeck")]
#[command(about = "Multi-track loop region player")]
#[command(version)]
struct Args {
    /// Files to load onto tracks 0, 1, 2, ...
    files: Vec<PathBuf>,

    /// Number of tracks
    #[arg(short, long)]
    tracks: Option<usize>,

    /// Phase vocoder FFT size (1024, 2048 or 4096)
    #[arg(long)]
    fft_size: Option<usize>,

    /// Start every loaded track immediately
    #[arg(short, long)]
    play: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loopdeck=info,loopdeck_audio=info,loopdeck_library=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();

    let mut config = Config::load();
    if let Some(tracks) = args.tracks {
        config.engine.track_count = tracks.max(1);
    }
    if let Some(size) = args.fft_size {
        config.engine.fft_size = FftSize::from_usize(size)
            .ok_or_else(|| anyhow!("unsupported FFT size {size}"))?;
    }
    config.engine.track_count = config.engine.track_count.max(args.files.len());

    // The audio thread owns the device; it reports the rate, then takes the renderer
    let (rate_tx, rate_rx) = bounded::<Result<u32>>(1);
    let (renderer_tx, renderer_rx) = bounded::<Renderer>(1);
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_audio = shutdown.clone();
    let audio_handle = thread::spawn(move || {
        if let Err(e) = run_audio_thread(rate_tx.clone(), renderer_rx, shutdown_audio) {
            tracing::error!("audio thread: {e:#}");
            // Only reaches the control thread if the rate was never sent
            let _ = rate_tx.try_send(Err(e));
        }
    });

    let sample_rate = rate_rx
        .recv()
        .context("Audio thread exited before reporting")??;
    info!(sample_rate, "audio output ready");

    let (mut engine, renderer) = Engine::new(
        config.engine.clone(),
        Arc::new(SystemClock::new()),
        sample_rate,
    );
    renderer_tx
        .send(renderer)
        .map_err(|_| anyhow!("Audio thread is gone"))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let effects = engine.effects().clone();
    runtime.spawn(async move {
        effects.ensure_loaded().await;
    });

    let loader = TrackLoader::with_sample_rate(sample_rate);
    for (track, path) in args.files.iter().enumerate() {
        if let Err(e) = load_file(&mut engine, &loader, &mut config, track, path) {
            warn!("{e:#}");
        }
    }
    if args.play {
        engine.toggle_all();
    }

    let result = run_control_loop(&mut engine, &loader, &mut config);

    shutdown.store(true, Ordering::SeqCst);
    let _ = audio_handle.join();
    if let Err(e) = config.save() {
        warn!("could not save config: {e}");
    }

    result
}

fn run_audio_thread(
    rate_tx: Sender<Result<u32>>,
    renderer_rx: Receiver<Renderer>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No audio output device found"))?;
    let config = device
        .default_output_config()
        .context("Failed to get audio config")?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    rate_tx
        .send(Ok(sample_rate))
        .map_err(|_| anyhow!("Control thread is gone"))?;

    let mut renderer = match renderer_rx.recv() {
        Ok(r) => r,
        // Control thread gave up before creating the engine
        Err(_) => return Ok(()),
    };

    // Pre-allocated stereo buffer for devices that are not stereo
    let mut stereo_buffer = vec![0.0f32; 16384];

    let stream = device
        .build_output_stream(
            &config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if channels == 2 {
                    renderer.process(data);
                    return;
                }
                let frames = data.len() / channels.max(1);
                if stereo_buffer.len() < frames * 2 {
                    stereo_buffer.resize(frames * 2, 0.0);
                }
                let stereo = &mut stereo_buffer[..frames * 2];
                renderer.process(stereo);
                for (out, frame) in data.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
                    if channels == 1 {
                        out[0] = (frame[0] + frame[1]) * 0.5;
                    } else {
                        out.fill(0.0);
                        out[0] = frame[0];
                        out[1] = frame[1];
                    }
                }
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .context("Failed to create audio stream")?;

    stream.play().context("Failed to start audio")?;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (line_tx, line_rx) = bounded(64);
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    line_rx
}

fn run_control_loop(engine: &mut Engine, loader: &TrackLoader, config: &mut Config) -> Result<()> {
    let lines = spawn_stdin_reader();
    println!("{} tracks ready. Type 'help' for commands.", engine.track_count());

    loop {
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => match parse_command(&line) {
                Some(Command::Quit) => break,
                Some(cmd) => {
                    if let Err(e) = apply(engine, loader, config, cmd) {
                        println!("error: {e:#}");
                    }
                }
                None => println!("unknown command: {}", line.trim()),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if engine.poll_events() > 0 {
            tracing::debug!("track reached segment end");
        }
    }

    if engine.transport().any_playing {
        engine.toggle_all();
    }
    Ok(())
}

fn apply(engine: &mut Engine, loader: &TrackLoader, config: &mut Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Load(track, path) => load_file(engine, loader, config, track, &path)?,
        Command::Play(track) => engine.start(track)?,
        Command::Stop(track) => {
            engine.stop(track)?;
        }
        Command::Loop(track, on) => engine.set_looping(track, on)?,
        Command::Tempo(track, tempo) => engine.set_tempo(track, tempo)?,
        Command::Pitch(track, semitones) => engine.set_pitch(track, semitones)?,
        Command::Gain(track, gain) => engine.set_gain(track, gain)?,
        Command::Master(level) => engine.set_master_gain(level)?,
        Command::Segment(track, start, end) => engine.set_segment(track, start, end)?,
        Command::Drag { track, x, width, to } => {
            let marker = engine.begin_drag(track, x, width)?;
            engine.update_drag(track, to, width)?;
            engine.end_drag(track)?;
            println!("dragged {marker:?} marker");
        }
        Command::Toggle => {
            let state = engine.toggle_all();
            println!("transport: {}", if state.any_playing { "playing" } else { "stopped" });
        }
        Command::Status => print_status(engine),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn load_file(
    engine: &mut Engine,
    loader: &TrackLoader,
    config: &mut Config,
    track: usize,
    path: &Path,
) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let hint = path.extension().and_then(|e| e.to_str());
    engine
        .load_encoded(track, bytes, hint, loader)
        .with_context(|| format!("Failed to load {} onto track {track}", path.display()))?;

    config.last_folder = path.parent().map(Path::to_path_buf);
    info!(track, path = %path.display(), "loaded");
    Ok(())
}

fn print_status(engine: &Engine) {
    let transport = engine.transport();
    println!(
        "master {:.2}  effect {:?}  [{}]",
        engine.master_gain(),
        engine.effects().status(),
        transport.label()
    );
    for snap in engine.snapshots() {
        if !snap.has_buffer {
            println!("  {}: empty", snap.id);
            continue;
        }
        let state = match snap.state {
            TrackState::Idle => "idle",
            TrackState::Playing => "playing",
            TrackState::Paused => "paused",
        };
        println!(
            "  {}: {:<7} {:>7.3}s in [{:.3}, {:.3}] of {:.3}s{}  tempo {:.2} pitch {:+.1} gain {:.2}{}",
            snap.id,
            state,
            snap.playhead,
            snap.segment.start,
            snap.segment.end,
            snap.duration,
            if snap.looping { " loop" } else { "" },
            snap.tempo,
            snap.pitch,
            snap.gain,
            if snap.bypass_active { " (bypass)" } else { "" },
        );
    }
}
