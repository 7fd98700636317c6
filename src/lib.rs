//! Image Sender
//!
//! Produces fixed-size bitmap frames from one of several interchangeable
//! sources and streams them at a fixed rate to a downstream subscriber. An MQTT
//! control channel switches the active source while the stream keeps running.
//!
//! # Architecture
//!
//! Data flow: source -> generation loop -> hand-off queue -> publisher -> transport.
//! Control flow: MQTT command -> controller -> loop swap -> source lifecycle.
//!
//! # Module Structure
//!
//! - `frame`: pixel grids, encoded frames, the bounded hand-off queue
//! - `sources`: the `FrameSource` contract, its implementations and the registry
//! - `pipeline`: the fixed-rate generation loop (hot-swap) and the publisher
//! - `transport`: frame transport (ZeroMQ PUB or TCP) and MQTT endpoint/TLS handling
//! - `controller`: composition of registry, loop and publisher
//! - `control`: MQTT command/status bridge
//! - `config`: layered file + environment configuration

pub mod config;
pub mod control;
pub mod controller;
pub mod frame;
pub mod pipeline;
pub mod sources;
pub mod transport;

pub use config::{ConfigError, SenderConfig};
pub use controller::{Controller, ControllerStatus, SwitchOutcome};
pub use frame::{Dimensions, Frame, FrameEncoder, FrameQueue, PixelGrid, PngEncoder};
pub use pipeline::{FrameGenerator, GeneratorConfig, LoopState, Publisher, RunSignal};
pub use sources::registry::UnknownSource;
pub use sources::{build_registry, FrameSource, SharedSource, SourceRegistry};
pub use transport::{
    bind_frame_transport, FrameTransport, FrameTransportKind, TcpFrameTransport, ZmqFrameTransport,
};
