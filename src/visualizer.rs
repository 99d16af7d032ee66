//! Streaming visualizer
//!
//! A self-scheduling tick loop that pulls the latest analyser window, maps it
//! to a render model and hands it to a `RenderTarget`. It reads the live
//! signal only; dropped or skipped frames never affect the recording.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::Analyser;
use crate::settings::{VisualizerMode, VisualizerSettings};

/// One filled rectangle in canvas pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub x: i64,
    pub y: f32,
    pub width: u32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Drawing {
    /// Shift the existing picture `shift` pixels left, clear the exposed
    /// strip, then fill `bars`.
    ScrollingBars { shift: u32, bars: Vec<Bar> },
    /// Clear the canvas and stroke a polyline through `points`.
    LineTrace { points: Vec<(f32, f32)> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualizerFrame {
    pub tick: u64,
    pub width: u32,
    pub height: u32,
    pub drawing: Drawing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Nothing to draw on right now (canvas not mounted, terminal gone).
    MissingSurface,
    Backend(String),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::MissingSurface => write!(f, "No render surface"),
            RenderError::Backend(e) => write!(f, "Render failed: {}", e),
        }
    }
}

impl std::error::Error for RenderError {}

/// Where frames go.
pub trait RenderTarget: Send {
    /// Current surface size, or `None` when there is no surface.
    fn size(&self) -> Option<(u32, u32)>;

    fn draw(&mut self, frame: &VisualizerFrame) -> Result<(), RenderError>;
}

pub type SharedTarget = Arc<Mutex<dyn RenderTarget>>;

/// Bars scrolling right to left, one frequency bin per bar.
#[derive(Debug, Clone)]
pub struct ScrollingBars {
    bar_width: u32,
    bar_spacing: u32,
    scroll_speed: u32,
    x_offset: i64,
}

impl ScrollingBars {
    pub fn new(bar_width: u32, bar_spacing: u32, scroll_speed: u32) -> Self {
        Self {
            bar_width: bar_width.max(1),
            bar_spacing,
            scroll_speed,
            x_offset: 0,
        }
    }

    pub fn frame(&mut self, data: &[u8], width: u32, height: u32) -> Drawing {
        let pitch = (self.bar_width + self.bar_spacing) as i64;
        let total = width as i64 / pitch;
        let base = self.x_offset.div_euclid(pitch);

        let bars = if data.is_empty() {
            Vec::new()
        } else {
            (0..total)
                .map(|i| {
                    let index = (i + base).rem_euclid(data.len() as i64) as usize;
                    let bar_height = data[index] as f32 / 2.0;
                    Bar {
                        x: width as i64 - i * pitch - self.bar_width as i64,
                        y: height as f32 / 2.0 - bar_height / 2.0,
                        width: self.bar_width,
                        height: bar_height,
                    }
                })
                .collect()
        };

        self.x_offset -= self.scroll_speed as i64;
        if self.x_offset <= -(self.bar_width as i64) {
            self.x_offset = 0;
        }

        Drawing::ScrollingBars {
            shift: self.scroll_speed,
            bars,
        }
    }
}

/// Time-domain samples as a polyline across the canvas.
pub fn line_trace(data: &[u8], width: u32, height: u32) -> Drawing {
    if data.is_empty() {
        return Drawing::LineTrace { points: Vec::new() };
    }
    let slice_width = width as f32 / data.len() as f32;
    let mut points: Vec<(f32, f32)> = data
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let y = (v as f32 / 128.0) * height as f32 / 2.0;
            (i as f32 * slice_width, y)
        })
        .collect();
    points.push((width as f32, height as f32 / 2.0));
    Drawing::LineTrace { points }
}

enum Model {
    Bars(ScrollingBars),
    Line,
}

impl Model {
    fn new(settings: &VisualizerSettings) -> Self {
        match settings.mode {
            VisualizerMode::Bars => Model::Bars(ScrollingBars::new(
                settings.bar_width,
                settings.bar_spacing,
                settings.scroll_speed,
            )),
            VisualizerMode::Line => Model::Line,
        }
    }

    fn render(&mut self, analyser: &Analyser, width: u32, height: u32) -> Drawing {
        match self {
            Model::Bars(bars) => {
                let mut data = vec![0u8; analyser.frequency_bin_count()];
                analyser.byte_frequency_data(&mut data);
                bars.frame(&data, width, height)
            }
            Model::Line => {
                let mut data = vec![0u8; analyser.fft_size()];
                analyser.byte_time_domain_data(&mut data);
                line_trace(&data, width, height)
            }
        }
    }
}

pub struct Visualizer;

impl Visualizer {
    /// Start the draw loop. Must be called within a tokio runtime.
    pub fn start(
        analyser: Analyser,
        target: SharedTarget,
        settings: &VisualizerSettings,
    ) -> VisualizerHandle {
        let active = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_draw_loop(DrawLoop {
            analyser,
            target: target.clone(),
            model: Model::new(settings),
            frame_interval: settings.frame_interval(),
            active: active.clone(),
            ticks: ticks.clone(),
            cancel: cancel.clone(),
        }));

        log::debug!("Visualizer started ({:?})", settings.mode);
        VisualizerHandle {
            active,
            ticks,
            cancel,
            target,
            task: Some(task),
        }
    }
}

/// Controls a running draw loop. Dropping it stops the loop.
pub struct VisualizerHandle {
    active: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
    target: SharedTarget,
    task: Option<JoinHandle<()>>,
}

impl VisualizerHandle {
    /// Stop the loop. Idempotent; no frame is drawn after this returns.
    pub fn stop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        // Wait out a draw that may be in flight
        drop(self.target.lock().unwrap_or_else(PoisonError::into_inner));
        self.task.take();
        log::debug!(
            "Visualizer stopped after {} ticks",
            self.ticks.load(Ordering::SeqCst)
        );
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ticks processed so far, drawn or skipped.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Drop for VisualizerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DrawLoop {
    analyser: Analyser,
    target: SharedTarget,
    model: Model,
    frame_interval: Duration,
    active: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
}

async fn run_draw_loop(mut state: DrawLoop) {
    let mut tick = interval(state.frame_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            _ = tick.tick() => {
                let mut target = state.target.lock().unwrap_or_else(PoisonError::into_inner);
                if !state.active.load(Ordering::SeqCst) {
                    break;
                }
                let n = state.ticks.fetch_add(1, Ordering::SeqCst) + 1;

                let Some((width, height)) = target.size() else {
                    log::trace!("Visualizer: no surface, skipping frame {}", n);
                    continue;
                };
                let frame = VisualizerFrame {
                    tick: n,
                    width,
                    height,
                    drawing: state.model.render(&state.analyser, width, height),
                };
                if let Err(e) = target.draw(&frame) {
                    log::debug!("Visualizer: frame {} skipped: {}", n, e);
                }
            }
        }
    }
}
