//! image_sender - fixed-rate frame generator with MQTT source switching.
//!
//! This daemon:
//! 1. Loads configuration (optional file, then environment)
//! 2. Builds the registry of frame sources
//! 3. Publishes frames on the frame socket at the configured rate
//! 4. Switches sources on `ChangeMode` commands from MQTT
//! 5. Publishes `offline` and releases the active source on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use image_sender::config::SenderConfig;
use image_sender::control::ControlBridge;
use image_sender::{bind_frame_transport, build_registry, Controller, GeneratorConfig, PngEncoder};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream generated frames and switch sources over MQTT"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "IMAGE_SENDER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the source activated at startup.
    #[arg(long, value_name = "NAME")]
    source: Option<String>,

    /// Print the registered source names and exit.
    #[arg(long)]
    list_sources: bool,

    /// Refuse MQTT brokers that are not on this host.
    #[arg(long, env = "MQTT_LOOPBACK_ONLY")]
    loopback_mqtt_only: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = SenderConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.default_source = source;
    }

    let registry = build_registry(&config)?;
    if args.list_sources {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }
    log::info!("registered sources: {}", registry.names().join(", "));

    let transport = bind_frame_transport(config.frames.transport, &config.frames.bind_addr)?;
    let mut controller = Controller::new(
        registry,
        GeneratorConfig {
            target_fps: config.frames.fps,
            ..GeneratorConfig::default()
        },
        Arc::new(PngEncoder),
        &config.frames.topic,
        config.frames.queue_capacity,
    );
    controller
        .start(&config.default_source, transport)
        .with_context(|| format!("start with source '{}'", config.default_source))?;
    let controller = Arc::new(Mutex::new(controller));

    let bridge = match ControlBridge::connect(
        &config.mqtt,
        args.loopback_mqtt_only,
        Arc::clone(&controller),
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            stop_controller(&controller);
            return Err(e);
        }
    };
    log::info!("listening for commands on {}", bridge.topics().command);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("image_sender running (Ctrl-C to stop)");
    loop {
        match rx.recv_timeout(STATUS_LOG_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Ok(controller) = controller.lock() {
                    let status = controller.status();
                    log::info!(
                        "status: source={} state={} produced={} published={} failed={} dropped={}",
                        status.current_source.as_deref().unwrap_or("-"),
                        status.loop_state,
                        status.frames_produced,
                        status.frames_published,
                        status.frames_failed,
                        status.frames_dropped
                    );
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping...");
    stop_controller(&controller);
    bridge.shutdown()?;
    log::info!("image_sender stopped");
    Ok(())
}

fn stop_controller(controller: &Mutex<Controller>) {
    match controller.lock() {
        Ok(mut controller) => {
            if let Err(e) = controller.stop() {
                log::error!("controller stop failed: {:#}", e);
            }
        }
        Err(_) => log::error!("controller lock poisoned during shutdown"),
    }
}
