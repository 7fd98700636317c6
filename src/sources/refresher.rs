use anyhow::{anyhow, Context, Result};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::RunSignal;

/// Private background thread owned by an active source.
///
/// Runs `tick` immediately and then once per `period` until stopped. Stopping
/// wakes the thread out of its sleep and joins it.
pub(crate) struct Refresher {
    label: String,
    signal: RunSignal,
    handle: Option<JoinHandle<()>>,
}

impl Refresher {
    pub(crate) fn spawn<F>(label: &str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut(&RunSignal) + Send + 'static,
    {
        let signal = RunSignal::running();
        let worker_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                while worker_signal.is_running() {
                    tick(&worker_signal);
                    if !worker_signal.wait_timeout(period) {
                        break;
                    }
                }
            })
            .with_context(|| format!("spawn {} thread", label))?;
        log::debug!("{} thread started", label);
        Ok(Self {
            label: label.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    /// Stop and join. Safe to call more than once.
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("{} thread panicked", self.label))?;
            log::debug!("{} thread stopped", self.label);
        }
        Ok(())
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{}", e);
        }
    }
}
