//! Recording engine legs
//!
//! A leg is one recording-engine instance bound to a live stream. Every start
//! and every resume of a take constructs a new leg; a paused leg is never
//! resumed. Each leg runs as its own tokio task and is the only sender of its
//! notifications, so its chunks always reach the session before its stop.
//!
//! Ordering across legs of the same take is kept by handing the new leg the
//! previous leg's join handle: the new leg does not emit anything until the
//! previous one has flushed and exited.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::encoder::{self, Encoder};
use super::stream::{LiveStream, SampleReceiver};
use crate::error::CaptureError;
use crate::state_machine::Event;

/// Parameters for one engine leg.
#[derive(Debug, Clone)]
pub struct LegOptions {
    pub take: Uuid,
    pub leg: u32,
    pub flush_interval: Duration,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegCommand {
    /// Flush pending data and stop encoding until disposed or stopped.
    Pause,
    /// Flush pending data, report `EngineStopped` and exit.
    Stop,
    /// Exit without reporting.
    Dispose,
}

/// Handle on a running leg.
pub struct EngineLeg {
    take: Uuid,
    leg: u32,
    commands: mpsc::UnboundedSender<LegCommand>,
    task: JoinHandle<()>,
}

impl EngineLeg {
    /// Construct a leg bound to `stream` and start it.
    ///
    /// Subscription to the stream's feed happens immediately, so samples
    /// captured while waiting on `after` are still recorded.
    pub fn start(
        stream: &LiveStream,
        options: LegOptions,
        after: Option<JoinHandle<()>>,
        events: mpsc::Sender<Event>,
    ) -> Result<Self, CaptureError> {
        let registry = encoder::ensure_registered()?;
        let encoder = registry.lookup(&options.mime_type).ok_or_else(|| {
            CaptureError::NoRecorderAvailable(format!(
                "no encoder for {:?} (available: {})",
                options.mime_type,
                registry.mime_types().join(", ")
            ))
        })?;

        if !stream.has_live_audio() {
            return Err(CaptureError::NoRecorderAvailable(
                "stream has no live audio track".to_string(),
            ));
        }

        let mut pending = BytesMut::new();
        if options.leg == 0 {
            pending.extend_from_slice(&encoder.header(stream.format())?);
        }

        let samples = stream.feed().subscribe();
        let (commands, command_rx) = mpsc::unbounded_channel();

        log::info!(
            "Engine leg {} starting for take {} ({}, flush every {:?})",
            options.leg,
            options.take,
            encoder.mime_type(),
            options.flush_interval
        );

        let task = tokio::spawn(run_leg(LegTask {
            take: options.take,
            leg: options.leg,
            flush_interval: options.flush_interval,
            encoder,
            pending,
            samples,
            commands: command_rx,
            events,
            after,
        }));

        Ok(Self {
            take: options.take,
            leg: options.leg,
            commands,
            task,
        })
    }

    pub fn take(&self) -> Uuid {
        self.take
    }

    pub fn leg(&self) -> u32 {
        self.leg
    }

    pub fn pause(&self) {
        self.send(LegCommand::Pause);
    }

    pub fn stop(&self) {
        self.send(LegCommand::Stop);
    }

    /// Ask the leg to exit. Commands already queued (a pause) are handled
    /// first. Returns the task handle so a successor can wait on it.
    pub fn dispose(self) -> JoinHandle<()> {
        self.send(LegCommand::Dispose);
        self.task
    }

    fn send(&self, command: LegCommand) {
        if self.commands.send(command).is_err() {
            log::debug!(
                "Engine leg {} of take {} already exited, dropping {:?}",
                self.leg,
                self.take,
                command
            );
        }
    }
}

struct LegTask {
    take: Uuid,
    leg: u32,
    flush_interval: Duration,
    encoder: Arc<dyn Encoder>,
    pending: BytesMut,
    samples: SampleReceiver,
    commands: mpsc::UnboundedReceiver<LegCommand>,
    events: mpsc::Sender<Event>,
    after: Option<JoinHandle<()>>,
}

impl LegTask {
    /// Encode whatever the feed has already delivered.
    fn drain_samples(&mut self) {
        while let Ok(packet) = self.samples.try_recv() {
            self.encoder.encode(&packet, &mut self.pending);
        }
    }

    /// Emit pending bytes as one chunk. Returns false once the session is gone.
    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let data = self.pending.split().freeze();
        log::trace!(
            "Engine leg {} of take {}: chunk of {} bytes",
            self.leg,
            self.take,
            data.len()
        );
        self.events
            .send(Event::DataAvailable {
                take: self.take,
                leg: self.leg,
                data,
            })
            .await
            .is_ok()
    }
}

async fn run_leg(mut task: LegTask) {
    if let Some(previous) = task.after.take() {
        if let Err(e) = previous.await {
            log::warn!("Previous engine leg ended abnormally: {}", e);
        }
    }

    let (take, leg) = (task.take, task.leg);
    if task
        .events
        .send(Event::EngineStarted { take, leg })
        .await
        .is_err()
    {
        return;
    }

    let mut ticker = tokio::time::interval(task.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut paused = false;
    let mut feed_closed = false;

    loop {
        tokio::select! {
            biased;

            command = task.commands.recv() => match command {
                Some(LegCommand::Pause) => {
                    if paused {
                        continue;
                    }
                    task.drain_samples();
                    paused = true;
                    if !task.flush().await {
                        return;
                    }
                    log::debug!("Engine leg {} of take {} paused", leg, take);
                }
                Some(LegCommand::Stop) => {
                    if !paused {
                        task.drain_samples();
                    }
                    if !task.flush().await {
                        return;
                    }
                    log::info!("Engine leg {} of take {} stopped", leg, take);
                    let _ = task.events.send(Event::EngineStopped { take, leg }).await;
                    return;
                }
                Some(LegCommand::Dispose) | None => {
                    log::debug!("Engine leg {} of take {} disposed", leg, take);
                    return;
                }
            },

            packet = task.samples.recv(), if !feed_closed => match packet {
                // Samples captured while paused are dropped
                Some(packet) if !paused => task.encoder.encode(&packet, &mut task.pending),
                Some(_) => {}
                None => {
                    log::debug!("Engine leg {} of take {}: signal feed closed", leg, take);
                    feed_closed = true;
                }
            },

            _ = ticker.tick(), if !paused => {
                if !task.flush().await {
                    return;
                }
            }
        }
    }
}
