//! Composition root for the frame pipeline.
//!
//! The `Controller` owns the source registry, the generation loop and the
//! publisher, and is the single entry point for source switches.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::frame::{FrameEncoder, FrameQueue};
use crate::pipeline::{FrameGenerator, GeneratorConfig, LoopState, Publisher};
use crate::sources::registry::UnknownSource;
use crate::sources::SourceRegistry;
use crate::transport::FrameTransport;

/// Result of an accepted switch request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The loop now runs the requested source.
    Switched,
    /// The requested source was already active; nothing changed.
    AlreadyActive,
}

/// Point-in-time view of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub current_source: Option<String>,
    pub loop_state: String,
    pub frames_produced: u64,
    pub frames_published: u64,
    pub frames_failed: u64,
    pub frames_dropped: u64,
}

pub struct Controller {
    registry: SourceRegistry,
    generator: FrameGenerator,
    publisher: Publisher,
    queue: FrameQueue,
    started: bool,
}

impl Controller {
    /// Wire a generation loop and a publisher around a fresh hand-off queue.
    pub fn new(
        registry: SourceRegistry,
        generator_config: GeneratorConfig,
        encoder: Arc<dyn FrameEncoder>,
        topic: &str,
        queue_capacity: usize,
    ) -> Self {
        let queue = FrameQueue::new(queue_capacity);
        Self {
            registry,
            generator: FrameGenerator::new(generator_config, queue.clone(), encoder),
            publisher: Publisher::new(topic, queue.clone()),
            queue,
            started: false,
        }
    }

    /// Start publishing on `transport` and generating from `default_source`.
    pub fn start(&mut self, default_source: &str, transport: Box<dyn FrameTransport>) -> Result<()> {
        let source = self.registry.resolve(default_source)?;
        self.publisher.start(transport)?;
        if let Err(e) = self.generator.start(default_source, source) {
            if let Err(stop_err) = self.publisher.stop() {
                log::warn!("controller: publisher stop after failed start: {:#}", stop_err);
            }
            return Err(e);
        }
        self.started = true;
        log::info!("controller: started with source {}", default_source);
        Ok(())
    }

    /// Make `name` the active source.
    ///
    /// Unknown names fail with [`UnknownSource`] and change nothing. Naming the
    /// already-active source is accepted without any lifecycle call, unless the
    /// loop is faulted, in which case the source is restarted. After a failed
    /// rollback left the loop without a source, any switch starts it again.
    pub fn switch_source(&mut self, name: &str) -> Result<SwitchOutcome> {
        let source = match self.registry.resolve(name) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("controller: {}", e);
                return Err(e);
            }
        };
        if !self.started {
            return Err(anyhow!("controller is not running"));
        }
        if self.generator.active_name() == Some(name)
            && !matches!(self.generator.state(), LoopState::Faulted(_))
        {
            log::debug!("controller: {} already active", name);
            return Ok(SwitchOutcome::AlreadyActive);
        }
        self.generator.swap(name, source)?;
        log::info!("controller: switched to {}", name);
        Ok(SwitchOutcome::Switched)
    }

    pub fn current_source(&self) -> Option<&str> {
        self.generator.active_name()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn status(&self) -> ControllerStatus {
        let publisher = self.publisher.stats();
        ControllerStatus {
            current_source: self.current_source().map(str::to_string),
            loop_state: match self.generator.state() {
                LoopState::Idle => "idle".to_string(),
                LoopState::Running => "running".to_string(),
                LoopState::Faulted(reason) => format!("faulted: {}", reason),
            },
            frames_produced: self.generator.frames_produced(),
            frames_published: publisher.sent,
            frames_failed: publisher.failed,
            frames_dropped: self.queue.dropped(),
        }
    }

    /// Stop the loop (deactivating its source), then the publisher.
    pub fn stop(&mut self) -> Result<()> {
        self.started = false;
        let generator = self.generator.stop();
        let publisher = self.publisher.stop();
        log::info!("controller: stopped");
        generator.and(publisher)
    }
}

/// True when `err` is an unknown-source rejection.
pub fn is_unknown_source(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UnknownSource>().is_some()
}
