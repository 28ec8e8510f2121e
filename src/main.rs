use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mbot_vslam::camera::{CaptureSource, CsiCamera, OpenCvCapture};
use mbot_vslam::driver::{ExitStatus, Session, SessionConfig, install_interrupt_handler};
use mbot_vslam::system::{Sensor, SlamSystem};

/// Monocular SLAM on a live camera stream.
#[derive(Debug, Parser)]
#[command(name = "mono_mbot", version)]
#[command(group(ArgGroup::new("source").args(["device", "video", "pipeline"])))]
struct Cli {
    /// ORB vocabulary (DBoW2 text format)
    vocabulary: PathBuf,

    /// Settings file (ORB-SLAM3 YAML)
    settings: PathBuf,

    /// Save f_<name>.txt and kf_<name>.txt trajectories on exit
    trajectory_file_name: Option<String>,

    #[arg(long, default_value_t = 0)]
    sensor_id: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 10)]
    framerate: u32,

    #[arg(long, default_value_t = 0)]
    flip_method: u32,

    /// Read from a V4L2/USB camera index instead of the CSI camera
    #[arg(long)]
    device: Option<i32>,

    /// Read from a video file instead of the CSI camera
    #[arg(long)]
    video: Option<PathBuf>,

    /// Custom GStreamer pipeline ending in an appsink
    #[arg(long)]
    pipeline: Option<String>,

    /// Stream to a Rerun viewer
    #[arg(long)]
    viewer: bool,

    /// Register resize and track times and report them on shutdown
    #[arg(long)]
    register_times: bool,
}

impl Cli {
    fn capture_source(&self) -> CaptureSource {
        if let Some(idx) = self.device {
            CaptureSource::Device(idx)
        } else if let Some(path) = &self.video {
            CaptureSource::File(path.clone())
        } else if let Some(p) = &self.pipeline {
            CaptureSource::Pipeline(p.clone())
        } else {
            CaptureSource::Csi(CsiCamera {
                sensor_id: self.sensor_id,
                width: self.width,
                height: self.height,
                framerate: self.framerate,
                flip_method: self.flip_method,
            })
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let code = match Cli::try_parse() {
        Ok(cli) => run(&cli).code(),
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() { 1 } else { 0 }
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> ExitStatus {
    let running = match install_interrupt_handler() {
        Ok(flag) => flag,
        Err(e) => {
            error!("{e:#}");
            return ExitStatus::Failure;
        }
    };

    let mut slam = match SlamSystem::new(&cli.vocabulary, &cli.settings, Sensor::Monocular, cli.viewer) {
        Ok(slam) => slam,
        Err(e) => {
            error!("Failed to start SLAM system: {e:#}");
            return ExitStatus::Failure;
        }
    };

    let mut capture = match OpenCvCapture::open(&cli.capture_source()) {
        Ok(capture) => capture,
        Err(e) => {
            error!("Error opening the video capture: {e:#}");
            return ExitStatus::CameraOpenFailure;
        }
    };

    let session = Session::new(SessionConfig {
        register_times: cli.register_times,
    });
    let result = session.run(&mut capture, &mut slam, &running);
    let mut status = ExitStatus::from(&result);

    if let (Ok(_), Some(name)) = (&result, &cli.trajectory_file_name) {
        let frames = format!("f_{name}.txt");
        let keyframes = format!("kf_{name}.txt");
        let saved = slam
            .save_trajectory_euroc(&frames)
            .and_then(|_| slam.save_keyframe_trajectory_euroc(&keyframes));
        match saved {
            Ok(()) => info!("Trajectories saved to {frames} and {keyframes}"),
            Err(e) => {
                error!("Failed to save trajectories: {e:#}");
                status = ExitStatus::Failure;
            }
        }
    }

    status
}
