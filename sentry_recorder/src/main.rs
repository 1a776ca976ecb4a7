use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use sentry_vision::core_modules::frame::{FrameSource, ImageSequenceSource};
use sentry_vision::{Sentry, SentryConfig, SourceFactory, source_factory};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Motion-triggered recorder: watches a camera (or a video file, or a directory of frames),
/// records clips while something moves and prints status changes as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay still images from this directory instead of opening a camera.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Replay a video file instead of opening a camera.
    #[cfg(feature = "opencv")]
    #[arg(long, conflicts_with = "input")]
    video: Option<PathBuf>,

    /// Camera device index (overrides the configuration).
    #[arg(short, long)]
    device: Option<u32>,

    /// Directory clips are written to (overrides the configuration).
    #[arg(long)]
    recordings: Option<PathBuf>,

    /// Event log file (overrides the configuration).
    #[arg(long)]
    log: Option<PathBuf>,

    /// Keep the latest display frame (annotated image and mask) in this JPEG file.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Record mp4 clips through OpenCV instead of Motion-JPEG.
    #[cfg(feature = "opencv")]
    #[arg(long)]
    mp4: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SentryConfig> {
    let mut config = match &args.config {
        Some(path) => SentryConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SentryConfig::default(),
    };
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(dir) = &args.recordings {
        config.recording.directory = dir.clone();
    }
    if let Some(path) = &args.log {
        config.event_log.path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn frame_source_factory(args: &Args) -> anyhow::Result<SourceFactory> {
    if let Some(dir) = args.input.clone() {
        return Ok(source_factory(move |camera| {
            Ok(Box::new(ImageSequenceSource::open(&dir, camera.fps)?) as Box<dyn FrameSource>)
        }));
    }

    #[cfg(feature = "opencv")]
    if let Some(path) = args.video.clone() {
        return Ok(source_factory(move |_| {
            use sentry_vision::opencv_backend::CameraSource;
            Ok(Box::new(CameraSource::open_file(&path)?) as Box<dyn FrameSource>)
        }));
    }

    #[cfg(feature = "opencv")]
    return Ok(source_factory(|camera| {
        use sentry_vision::opencv_backend::CameraSource;
        Ok(Box::new(CameraSource::open(camera)?) as Box<dyn FrameSource>)
    }));

    #[cfg(not(feature = "opencv"))]
    anyhow::bail!("no frame source: pass --input <dir>, or build with the `opencv` feature for camera and video capture");
}

async fn wait_for_worker(sentry: &Sentry) {
    while sentry.is_running().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentry_recorder=info,sentry_vision=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let factory = frame_source_factory(&args)?;

    #[allow(unused_mut)]
    let mut sentry = Sentry::new(config, factory)?;
    #[cfg(feature = "opencv")]
    if args.mp4 {
        sentry = sentry.with_backend(std::sync::Arc::new(sentry_vision::opencv_backend::Mp4Backend));
    }

    // Status changes go to stdout, one JSON object per line.
    let mut status = sentry.status_handle();
    let status_task = tokio::spawn(async move {
        while let Some(snapshot) = status.changed().await {
            match serde_json::to_string(&snapshot) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "failed to serialize status"),
            }
        }
    });

    let frames = sentry.stream().await.context("starting the detector")?;
    info!(directory = %sentry.config().recording.directory.display(), "recorder running, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    match &args.preview {
        Some(preview) => {
            tokio::pin!(frames);
            loop {
                tokio::select! {
                    packet = frames.next() => match packet {
                        Some(packet) => {
                            if let Err(e) = tokio::fs::write(preview, &packet.data[..]).await {
                                warn!(path = %preview.display(), error = %e, "failed to write preview");
                            }
                        }
                        None => break,
                    },
                    _ = &mut ctrl_c => {
                        info!("interrupt received");
                        break;
                    }
                }
            }
        }
        None => {
            // Without viewers the worker skips display rendering.
            drop(frames);
            tokio::select! {
                _ = wait_for_worker(&sentry) => {}
                _ = &mut ctrl_c => info!("interrupt received"),
            }
        }
    }

    if let Some(exit) = sentry.release_camera().await {
        info!(frames = exit.frames, reason = ?exit.reason, "detector stopped");
    }
    status_task.abort();

    for name in sentry.list_recordings()? {
        println!("recording: {name}");
    }
    Ok(())
}
