use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::RunSignal;
use crate::frame::FrameQueue;
use crate::transport::{encode_message, FrameTransport};

/// How long the worker waits on an empty queue before rechecking its signal.
const POP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub sent: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
}

struct Worker {
    signal: RunSignal,
    handle: JoinHandle<()>,
}

/// Drains the hand-off queue and republishes each frame under a fixed topic.
pub struct Publisher {
    topic: String,
    queue: FrameQueue,
    counters: Arc<Counters>,
    worker: Option<Worker>,
}

impl Publisher {
    pub fn new(topic: impl Into<String>, queue: FrameQueue) -> Self {
        Self {
            topic: topic.into(),
            queue,
            counters: Arc::new(Counters::default()),
            worker: None,
        }
    }

    pub fn start(&mut self, mut transport: Box<dyn FrameTransport>) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("publisher already started"));
        }
        let signal = RunSignal::running();
        let worker_signal = signal.clone();
        let topic = self.topic.clone();
        let queue = self.queue.clone();
        let counters = Arc::clone(&self.counters);

        let handle = std::thread::Builder::new()
            .name("frame publisher".to_string())
            .spawn(move || {
                while worker_signal.is_running() {
                    let frame = match queue.pop_timeout(POP_TIMEOUT) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            log::error!("publisher: queue failed: {:#}", e);
                            break;
                        }
                    };
                    if !worker_signal.is_running() {
                        log::debug!("publisher: discarding frame {} on stop", frame.sequence());
                        break;
                    }
                    let message = encode_message(&topic, frame.payload());
                    match transport.send(&message) {
                        Ok(()) => {
                            counters.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("publisher: send of frame {} failed: {:#}", frame.sequence(), e);
                        }
                    }
                }
                if let Err(e) = transport.close() {
                    log::warn!("publisher: close transport failed: {:#}", e);
                }
            })
            .context("spawn frame publisher thread")?;

        log::info!("publisher: started on topic {}", self.topic);
        self.worker = Some(Worker { signal, handle });
        Ok(())
    }

    /// Stop sending, drop any in-flight frame and close the transport.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.signal.stop();
        worker
            .handle
            .join()
            .map_err(|_| anyhow!("frame publisher thread panicked"))?;
        log::info!("publisher: stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("publisher: stop on drop failed: {:#}", e);
        }
    }
}
