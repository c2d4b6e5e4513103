use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emolens_core::{
    resolve, CameraFacing, DeviceOrientation, EmotionClassifier, FaceExtractor, FerPlusClassifier,
    FixedDeviceOrientation, OrientationCode, OrientationPolicy, ScrfdExtractor,
};
use emolens_hw::Camera;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod sensor_proxy;
mod visualizer;

use config::{Config, OrientationMode};
use visualizer::{RenderMode, Visualizer};

#[derive(Parser)]
#[command(name = "emolens", version, about = "Live facial emotion recognition")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify faces from the camera until interrupted (default)
    Run {
        /// V4L2 device path (e.g. /dev/video0)
        #[arg(short, long)]
        device: Option<String>,
        /// Which way the camera points: front or back
        #[arg(short, long)]
        facing: Option<CameraFacing>,
        /// Orientation mode: sensor, device:<orientation> or code:<code>
        #[arg(short, long)]
        orientation: Option<OrientationMode>,
        /// Print one JSON object per update instead of bars
        #[arg(long)]
        json: bool,
    },
    /// Classify the faces in a still image
    Classify {
        /// Image file (any format the image crate decodes)
        image: PathBuf,
        /// Orientation code of the image, by name or EXIF number
        #[arg(short, long, default_value = "up")]
        orientation: OrientationCode,
    },
    /// List V4L2 capture devices
    Devices,
    /// Print the orientation code for a device orientation and camera facing
    Orientation {
        /// upright, upside-down, rotated-left, rotated-right, face-up, face-down
        device_orientation: DeviceOrientation,
        #[arg(short, long, default_value = "front")]
        facing: CameraFacing,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the visualizer.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        device: None,
        facing: None,
        orientation: None,
        json: false,
    }) {
        Commands::Run {
            device,
            facing,
            orientation,
            json,
        } => {
            let mut config = Config::load()?;
            if let Some(device) = device {
                config.camera_device = device;
            }
            if let Some(facing) = facing {
                config.camera_facing = facing;
            }
            if let Some(orientation) = orientation {
                config.orientation = orientation;
            }
            let mode = if json { RenderMode::Json } else { RenderMode::Bars };
            run(config, mode).await?;
        }
        Commands::Classify { image, orientation } => {
            let config = Config::load()?;
            classify(&config, &image, orientation)?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Orientation {
            device_orientation,
            facing,
        } => {
            println!("{}", resolve(device_orientation, facing));
        }
    }

    Ok(())
}

fn orientation_policy(config: &Config) -> Result<OrientationPolicy> {
    let facing = config.camera_facing;
    Ok(match config.orientation {
        OrientationMode::Code(code) => OrientationPolicy::Fixed(code),
        OrientationMode::Device(device) => OrientationPolicy::Resolve {
            source: Box::new(FixedDeviceOrientation(device)),
            facing,
        },
        OrientationMode::Sensor => {
            let sensor = sensor_proxy::SensorProxyOrientation::connect()
                .context("failed to read device orientation from iio-sensor-proxy")?;
            OrientationPolicy::Resolve {
                source: Box::new(sensor),
                facing,
            }
        }
    })
}

async fn run(config: Config, mode: RenderMode) -> Result<()> {
    tracing::info!(
        device = %config.camera_device,
        facing = ?config.camera_facing,
        orientation = %config.orientation,
        "emolens starting"
    );

    let policy = orientation_policy(&config)?;
    let extractor = ScrfdExtractor::load(&config.detector_model_path(), config.extractor_settings())
        .context("failed to load face detector")?;
    let classifier = FerPlusClassifier::load(&config.classifier_model_path())
        .context("failed to load emotion classifier")?;
    let camera = Camera::open(&config.camera_device, config.capture_width, config.capture_height)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let mut pipeline = engine::spawn_pipeline(
        Box::new(camera),
        policy,
        Box::new(extractor),
        Box::new(classifier),
        config.pipeline_settings(),
    )?;

    let mut vis = Visualizer::new(mode);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            update = pipeline.next_update() => match update {
                Some(update) => {
                    tracing::trace!(
                        frame = update.frame_index,
                        latency_ms = update.captured_at.elapsed().as_millis() as u64,
                        "update"
                    );
                    if vis.apply(update) {
                        draw(&vis)?;
                    }
                }
                None => {
                    tracing::warn!("pipeline ended");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    let stats = tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    tracing::info!(
        frames = stats.frames,
        skipped = stats.skipped,
        inferences = stats.inferences,
        "emolens stopped"
    );
    Ok(())
}

fn draw(vis: &Visualizer) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if vis.mode() == RenderMode::Bars {
        // Clear and home, so the chart redraws in place.
        out.write_all(b"\x1b[2J\x1b[H")?;
    }
    out.write_all(vis.render().as_bytes())?;
    out.flush()?;
    Ok(())
}

fn classify(config: &Config, path: &Path, orientation: OrientationCode) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_luma8();

    let mut extractor = ScrfdExtractor::load(&config.detector_model_path(), config.extractor_settings())
        .context("failed to load face detector")?;
    let mut classifier = FerPlusClassifier::load(&config.classifier_model_path())
        .context("failed to load emotion classifier")?;

    let faces = extractor.extract(image.as_raw(), image.width(), image.height())?;
    if faces.is_empty() {
        println!("no faces found in {}", path.display());
        return Ok(());
    }

    for (i, face) in faces.iter().enumerate() {
        let b = &face.bbox;
        println!(
            "face {} at ({:.0}, {:.0}) {:.0}x{:.0}, detector confidence {:.2}, orientation {}",
            i + 1,
            b.x,
            b.y,
            b.width,
            b.height,
            b.confidence,
            orientation
        );
        match classifier.classify(face, orientation)? {
            Some(scores) => print!("{}", visualizer::render_bars(&scores)),
            None => println!("no result"),
        }
    }
    Ok(())
}
