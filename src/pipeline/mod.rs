//! Frame production and distribution.
//!
//! - `FrameGenerator` drives the single active source at a fixed rate and owns
//!   the hot-swap protocol
//! - `Publisher` drains the hand-off queue onto a `FrameTransport`
//!
//! Both run one worker thread each and stop cooperatively through a
//! `RunSignal` followed by a join.

mod generator;
mod publisher;
mod signal;

pub use generator::{FrameGenerator, GeneratorConfig, LoopState, DEFAULT_BLANK_FRAMES, DEFAULT_FPS};
pub use publisher::{Publisher, PublisherStats};
pub use signal::RunSignal;
