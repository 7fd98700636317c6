use anyhow::{anyhow, Context, Result};
use image::Rgb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::RunSignal;
use crate::frame::{blank_grid, Frame, FrameEncoder, FrameQueue, BACKGROUND};
use crate::sources::SharedSource;

pub const DEFAULT_FPS: u32 = 60;
pub const DEFAULT_BLANK_FRAMES: usize = 2;

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub target_fps: u32,
    /// Background-colour frames emitted at the start of every run.
    pub blank_frames: usize,
    pub background: Rgb<u8>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_FPS,
            blank_frames: DEFAULT_BLANK_FRAMES,
            background: BACKGROUND,
        }
    }
}

impl GeneratorConfig {
    fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

/// Observable state of the generation loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// No worker is running.
    Idle,
    Running,
    /// The worker stopped after a production error; switching sources recovers.
    Faulted(String),
}

/// Counters and state shared with the worker.
struct LoopShared {
    state: Mutex<LoopState>,
    next_sequence: AtomicU64,
    produced: AtomicU64,
}

impl LoopShared {
    fn set_state(&self, state: LoopState) {
        match self.state.lock() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

struct ActiveSource {
    name: String,
    source: SharedSource,
}

struct Worker {
    signal: RunSignal,
    handle: JoinHandle<()>,
}

/// Fixed-rate generation loop over a single active source.
///
/// Lifecycle calls on sources happen only on the caller's thread and only while
/// the worker is joined, so a source is never activated, deactivated and
/// produced from at the same time.
pub struct FrameGenerator {
    config: GeneratorConfig,
    queue: FrameQueue,
    encoder: Arc<dyn FrameEncoder>,
    shared: Arc<LoopShared>,
    active: Option<ActiveSource>,
    worker: Option<Worker>,
}

impl FrameGenerator {
    pub fn new(config: GeneratorConfig, queue: FrameQueue, encoder: Arc<dyn FrameEncoder>) -> Self {
        Self {
            config,
            queue,
            encoder,
            shared: Arc::new(LoopShared {
                state: Mutex::new(LoopState::Idle),
                next_sequence: AtomicU64::new(0),
                produced: AtomicU64::new(0),
            }),
            active: None,
            worker: None,
        }
    }

    /// Activate `source` and start producing from it.
    pub fn start(&mut self, name: &str, source: SharedSource) -> Result<()> {
        if self.active.is_some() {
            return Err(anyhow!("generation loop already started"));
        }
        activate(name, &source)?;
        self.active = Some(ActiveSource {
            name: name.to_string(),
            source,
        });
        self.spawn_worker()
    }

    /// Replace the active source.
    ///
    /// Stops and joins the worker, deactivates the outgoing source, activates the
    /// incoming one and restarts the worker. When activation fails the incoming
    /// source is deactivated and the outgoing one restored; the activation error
    /// is returned either way.
    pub fn swap(&mut self, name: &str, source: SharedSource) -> Result<()> {
        let Some(previous) = self.active.take() else {
            return self.start(name, source);
        };
        log::info!("swap: {} -> {}", previous.name, name);
        if let Err(e) = self.stop_worker() {
            self.shared.set_state(LoopState::Idle);
            deactivate(&previous.name, &previous.source)?;
            return Err(e);
        }
        if let Err(e) = deactivate(&previous.name, &previous.source) {
            log::warn!("swap: deactivate {} failed: {:#}", previous.name, e);
        }

        match activate(name, &source) {
            Ok(()) => {
                self.active = Some(ActiveSource {
                    name: name.to_string(),
                    source,
                });
                self.spawn_worker()
            }
            Err(activate_err) => {
                log::error!("swap: activate {} failed: {:#}", name, activate_err);
                if let Err(e) = deactivate(name, &source) {
                    log::warn!("swap: cleanup of {} failed: {:#}", name, e);
                }
                match activate(&previous.name, &previous.source) {
                    Ok(()) => {
                        log::info!("swap: restored {}", previous.name);
                        self.active = Some(previous);
                        self.spawn_worker()?;
                        Err(activate_err.context(format!("activate source '{}'", name)))
                    }
                    Err(rollback_err) => {
                        self.shared.set_state(LoopState::Idle);
                        Err(anyhow!(
                            "activate source '{}' failed: {:#}; restoring '{}' also failed: {:#}",
                            name,
                            activate_err,
                            previous.name,
                            rollback_err
                        ))
                    }
                }
            }
        }
    }

    /// Stop the worker and deactivate the active source.
    pub fn stop(&mut self) -> Result<()> {
        let joined = self.stop_worker();
        let released = match self.active.take() {
            Some(active) => deactivate(&active.name, &active.source),
            None => Ok(()),
        };
        self.shared.set_state(LoopState::Idle);
        joined.and(released)
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.name.as_str())
    }

    pub fn state(&self) -> LoopState {
        self.shared
            .state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Frames pushed onto the queue since construction, blanks included.
    pub fn frames_produced(&self) -> u64 {
        self.shared.produced.load(Ordering::Relaxed)
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let Some(active) = &self.active else {
            return Err(anyhow!("no active source to run"));
        };
        let signal = RunSignal::running();
        let run = WorkerRun {
            name: active.name.clone(),
            source: Arc::clone(&active.source),
            queue: self.queue.clone(),
            encoder: Arc::clone(&self.encoder),
            shared: Arc::clone(&self.shared),
            signal: signal.clone(),
            interval: self.config.interval(),
            blank_frames: self.config.blank_frames,
            background: self.config.background,
        };
        self.shared.set_state(LoopState::Running);
        let handle = std::thread::Builder::new()
            .name("frame generator".to_string())
            .spawn(move || run.run())
            .context("spawn frame generator thread")?;
        log::debug!("generator: worker started for {}", active.name);
        self.worker = Some(Worker { signal, handle });
        Ok(())
    }

    fn stop_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.signal.stop();
        worker
            .handle
            .join()
            .map_err(|_| anyhow!("frame generator thread panicked"))?;
        log::debug!("generator: worker stopped");
        Ok(())
    }
}

impl Drop for FrameGenerator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("generator: stop on drop failed: {:#}", e);
        }
    }
}

fn activate(name: &str, source: &SharedSource) -> Result<()> {
    source
        .lock()
        .map_err(|_| anyhow!("source '{}' lock poisoned", name))?
        .activate()
        .with_context(|| format!("activate source '{}'", name))?;
    log::info!("source {}: activated", name);
    Ok(())
}

fn deactivate(name: &str, source: &SharedSource) -> Result<()> {
    source
        .lock()
        .map_err(|_| anyhow!("source '{}' lock poisoned", name))?
        .deactivate()
        .with_context(|| format!("deactivate source '{}'", name))?;
    log::info!("source {}: deactivated", name);
    Ok(())
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct WorkerRun {
    name: String,
    source: SharedSource,
    queue: FrameQueue,
    encoder: Arc<dyn FrameEncoder>,
    shared: Arc<LoopShared>,
    signal: RunSignal,
    interval: Duration,
    blank_frames: usize,
    background: Rgb<u8>,
}

impl WorkerRun {
    fn run(self) {
        if let Err(e) = self.produce_loop() {
            log::error!("source {} faulted: {:#}", self.name, e);
            self.shared
                .set_state(LoopState::Faulted(format!("{}: {:#}", self.name, e)));
        }
    }

    fn produce_loop(&self) -> Result<()> {
        let dimensions = self
            .source
            .lock()
            .map_err(|_| anyhow!("source lock poisoned"))?
            .dimensions();
        let blank = self
            .encoder
            .encode(&blank_grid(dimensions, self.background))
            .context("encode blank frame")?;
        let mut pending_blanks = self.blank_frames;

        while self.signal.is_running() {
            let started = Instant::now();
            let payload = if pending_blanks > 0 {
                pending_blanks -= 1;
                blank.clone()
            } else {
                let grid = self
                    .source
                    .lock()
                    .map_err(|_| anyhow!("source lock poisoned"))?
                    .produce_frame()
                    .context("produce frame")?;
                self.encoder.encode(&grid).context("encode frame")?
            };

            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed);
            self.queue.push(Frame::new(sequence, payload))?;
            self.shared.produced.fetch_add(1, Ordering::Relaxed);

            let elapsed = started.elapsed();
            if elapsed < self.interval && !self.signal.wait_timeout(self.interval - elapsed) {
                break;
            }
        }
        Ok(())
    }
}
