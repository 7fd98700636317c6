//! Frame sources.
//!
//! This module provides the interchangeable content generators:
//! - Digital and analog clocks
//! - Frame counter
//! - Moving square and colour-bar test patterns
//! - Scrolling text ticker (background feed refresher)
//! - Live flight-data overlay (background feed refresher)
//! - Camera feed (background capture thread)
//!
//! All sources honour the same lifecycle contract (`FrameSource`):
//! - Frame dimensions are fixed at construction
//! - `activate`/`deactivate` are paired and safe to repeat
//! - `produce_frame` never blocks on network or device I/O; sources that depend
//!   on slow I/O serve the latest cached content from a private, lock-guarded cache
//!
//! Sources MUST NOT:
//! - Hold exclusive resources while inactive
//! - Share mutable state with other source instances

pub mod camera;
pub mod clock;
pub mod count;
pub mod flight;
pub mod pattern;
mod refresher;
pub mod registry;
pub mod render;
pub mod ticker;

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};

use crate::config::SenderConfig;
use crate::frame::{Dimensions, PixelGrid};

pub use camera::{CameraConfig, CameraSource};
pub use clock::{AnalogClockSource, ClockSource};
pub use count::CountSource;
pub use flight::{FlightConfig, FlightDataSource};
pub use pattern::{MovingSquareSource, TestPatternSource};
pub use registry::SourceRegistry;
pub use ticker::{ScrollingTextSource, TickerConfig};

/// Shared handle to a registered source.
///
/// The lock is only contended during lifecycle calls, which the generation loop
/// serializes against its own worker.
pub type SharedSource = Arc<Mutex<dyn FrameSource>>;

/// Lifecycle contract for frame generators.
pub trait FrameSource: Send {
    /// Registry name.
    fn name(&self) -> &str;

    /// Frame dimensions, fixed at construction.
    fn dimensions(&self) -> Dimensions;

    /// Acquire exclusive resources. Calling this on an active source must not
    /// leak the resources of the earlier activation.
    fn activate(&mut self) -> Result<()>;

    /// Produce the next frame. Only valid while active.
    fn produce_frame(&mut self) -> Result<PixelGrid>;

    /// Release everything `activate` acquired. A no-op when inactive.
    fn deactivate(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;
}

/// Build the registry of all configured sources.
pub fn build_registry(config: &SenderConfig) -> Result<SourceRegistry> {
    let dimensions = config.frames.dimensions;
    let mut registry = SourceRegistry::new();

    registry.register(CountSource::new(dimensions))?;
    registry.register(ClockSource::new(dimensions, config.clock.utc_offset_minutes)?)?;
    registry.register(AnalogClockSource::new(
        dimensions,
        config.clock.utc_offset_minutes,
    )?)?;
    registry.register(CameraSource::new(config.camera.clone(), dimensions))?;
    registry.register(MovingSquareSource::new(dimensions))?;
    registry.register(TestPatternSource::new(dimensions))?;
    registry.register(
        ScrollingTextSource::from_config(&config.ticker, dimensions)
            .context("configure scrolling text source")?,
    )?;
    match config.flight.source_config() {
        Some(flight) => {
            registry.register(
                FlightDataSource::from_config(&flight, dimensions)
                    .context("configure flight data source")?,
            )?;
        }
        None => log::info!(
            "flight data source not registered (FLIGHT_BOX / FLIGHT_HOME not configured)"
        ),
    }

    Ok(registry)
}
