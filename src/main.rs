//! session-recorder - record the default microphone from the terminal
//!
//! Subcommands:
//! - `session-recorder record <seconds>` - record, optionally pausing midway
//! - `session-recorder config` - print the effective settings

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use session_recorder::audio::CpalDevices;
use session_recorder::settings::{default_settings_path, load_settings, try_load_settings};
use session_recorder::visualizer::Drawing;
use session_recorder::{
    DeviceEffectRunner, RenderError, RenderTarget, Session, SessionConfig, Status,
    VisualizerFrame, VisualizerMode,
};

#[derive(Parser)]
#[command(name = "session-recorder")]
#[command(about = "Pausable microphone capture with a live level meter")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record for a number of seconds
    Record {
        /// Total recording time, pauses excluded
        seconds: f64,

        /// Pause after this many seconds of recording
        #[arg(long)]
        pause_after: Option<f64>,

        /// How long to stay paused
        #[arg(long, default_value = "2")]
        pause_for: f64,

        /// Where to write the artifact
        #[arg(short, long, default_value = "recording.wav")]
        out: PathBuf,

        /// Meter style
        #[arg(long, value_enum)]
        visualizer: Option<Meter>,

        /// File whose bytes are placed before the captured audio
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Do not draw the meter
        #[arg(long)]
        quiet: bool,
    },

    /// Print the effective settings as JSON
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Meter {
    Bars,
    Line,
}

impl From<Meter> for VisualizerMode {
    fn from(meter: Meter) -> Self {
        match meter {
            Meter::Bars => VisualizerMode::Bars,
            Meter::Line => VisualizerMode::Line,
        }
    }
}

/// One-line level meter on stderr.
struct TerminalMeter {
    width: u32,
}

impl RenderTarget for TerminalMeter {
    fn size(&self) -> Option<(u32, u32)> {
        Some((self.width, 256))
    }

    fn draw(&mut self, frame: &VisualizerFrame) -> Result<(), RenderError> {
        let level = match &frame.drawing {
            Drawing::ScrollingBars { bars, .. } => bars
                .iter()
                .map(|b| b.height / 128.0)
                .fold(0.0_f32, f32::max),
            Drawing::LineTrace { points } => {
                let centre = frame.height as f32 / 2.0;
                points
                    .iter()
                    .map(|(_, y)| (y - centre).abs() / centre)
                    .fold(0.0_f32, f32::max)
            }
        };
        let cells = self.width as usize;
        let filled = ((level.clamp(0.0, 1.0) * cells as f32) as usize).min(cells);
        let mut stderr = std::io::stderr().lock();
        write!(
            stderr,
            "\r[{}{}]",
            "#".repeat(filled),
            " ".repeat(cells - filled)
        )
        .and_then(|_| stderr.flush())
        .map_err(|e| RenderError::Backend(e.to_string()))
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SessionConfig, String> {
    match path {
        Some(path) => try_load_settings(&path).map_err(|e| e.to_string()),
        None => Ok(default_settings_path()
            .map(|p| load_settings(&p))
            .unwrap_or_default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let cli = Cli::parse();
    let mut config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Config => match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Failed to serialize settings: {}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Record {
            seconds,
            pause_after,
            pause_for,
            out,
            visualizer,
            seed,
            quiet,
        } => {
            if let Some(meter) = visualizer {
                config.visualizer.mode = meter.into();
            }
            let plan = Plan {
                seconds,
                pause_after,
                pause_for,
            };
            match record(config, plan, out, seed, quiet).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    log::error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

struct Plan {
    seconds: f64,
    pause_after: Option<f64>,
    pause_for: f64,
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

async fn record(
    config: SessionConfig,
    plan: Plan,
    out: PathBuf,
    seed: Option<PathBuf>,
    quiet: bool,
) -> Result<(), String> {
    let runner = DeviceEffectRunner::new(Arc::new(CpalDevices::new()));
    let mut builder = Session::builder(config, runner)
        .on_start(|| log::info!("Recording"))
        .on_stop(|reference, artifact| {
            log::info!("Recorded {} bytes as {}", artifact.len(), reference)
        });
    if let Some(path) = seed {
        let bytes = std::fs::read(&path).map_err(|e| format!("{:?}: {}", path, e))?;
        builder = builder.seed_fragment(bytes);
    }
    if !quiet {
        builder = builder.render_target(Arc::new(Mutex::new(TerminalMeter { width: 40 })));
    }
    let session = builder.spawn();

    let result = drive(&session, &plan).await;
    if !quiet {
        eprintln!();
    }

    let outcome = match result {
        Ok(()) => match session.artifact() {
            Some(artifact) => std::fs::write(&out, &artifact.data)
                .map(|_| log::info!("Wrote {} ({})", out.display(), artifact.media_type))
                .map_err(|e| format!("{:?}: {}", out, e)),
            None => Err("No artifact was produced".to_string()),
        },
        Err(e) => Err(e),
    };

    session.teardown().await;
    outcome
}

async fn drive(session: &Session, plan: &Plan) -> Result<(), String> {
    let failed = |s: &session_recorder::SessionSnapshot| !s.error.is_none();

    session.start().map_err(|e| e.to_string())?;
    let snapshot = session
        .wait_for(|s| s.status == Status::Recording || failed(s))
        .await
        .map_err(|e| e.to_string())?;
    if failed(&snapshot) {
        return Err(format!("Could not start recording: {}", snapshot.error));
    }

    match plan.pause_after.filter(|p| *p < plan.seconds) {
        Some(pause_after) => {
            tokio::time::sleep(secs(pause_after)).await;
            session.pause().map_err(|e| e.to_string())?;
            log::info!("Paused for {:.1}s", plan.pause_for);
            tokio::time::sleep(secs(plan.pause_for)).await;
            session.resume().map_err(|e| e.to_string())?;
            tokio::time::sleep(secs(plan.seconds - pause_after)).await;
        }
        None => tokio::time::sleep(secs(plan.seconds)).await,
    }

    session.stop().map_err(|e| e.to_string())?;
    let snapshot = session
        .wait_for(|s| s.status == Status::Stopped || failed(s))
        .await
        .map_err(|e| e.to_string())?;
    if failed(&snapshot) {
        return Err(format!("Recording failed: {}", snapshot.error));
    }
    log::info!("Recorded {:.1}s", snapshot.elapsed().as_secs_f64());
    Ok(())
}
