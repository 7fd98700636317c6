use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::frame::{Dimensions, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::DEFAULT_FPS;
use crate::sources::flight::{BoundingBox, Location, DEFAULT_FEED_URL};
use crate::sources::{CameraConfig, FlightConfig, TickerConfig};
use crate::transport::{FrameTransportKind, DEFAULT_FRAME_ADDR};

pub const CONFIG_PATH_ENV: &str = "IMAGE_SENDER_CONFIG";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "image-sender";
const DEFAULT_FRAME_TOPIC: &str = "/frames";
const DEFAULT_SOURCE: &str = "Clock";
const MAX_UTC_OFFSET_MINUTES: i32 = 24 * 60;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigError(message.into()))
}

// ----------------------------------------------------------------------------
// File layout
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SenderConfigFile {
    default_source: Option<String>,
    mqtt: Option<MqttConfigFile>,
    frames: Option<FramesConfigFile>,
    clock: Option<ClockConfigFile>,
    ticker: Option<TickerConfigFile>,
    flight: Option<FlightConfigFile>,
    camera: Option<CameraConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FramesConfigFile {
    transport: Option<FrameTransportKind>,
    bind_addr: Option<String>,
    topic: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClockConfigFile {
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TickerConfigFile {
    feed_url: Option<String>,
    scroll_speed: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FlightConfigFile {
    feed_url: Option<String>,
    token: Option<String>,
    /// `[x1, y1, x2, y2]` as longitude/latitude corners.
    bounds: Option<[f64; 4]>,
    /// `[longitude, latitude]`.
    home: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    target_fps: Option<u32>,
}

// ----------------------------------------------------------------------------
// Resolved settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    /// Base topic; `/cmnd`, `/stat` and `/availability` hang off it.
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub transport: FrameTransportKind,
    pub bind_addr: String,
    pub topic: String,
    pub fps: u32,
    pub dimensions: Dimensions,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClockSettings {
    /// Fixed UTC offset; local time when unset.
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct FlightSettings {
    pub feed_url: String,
    pub token: Option<String>,
    pub bounds: Option<BoundingBox>,
    pub home: Option<Location>,
}

impl FlightSettings {
    /// Source configuration, available once both the box and home are set.
    pub fn source_config(&self) -> Option<FlightConfig> {
        Some(FlightConfig {
            feed_url: self.feed_url.clone(),
            token: self.token.clone(),
            bounds: self.bounds?,
            home: self.home?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub default_source: String,
    pub mqtt: MqttSettings,
    pub frames: FrameSettings,
    pub clock: ClockSettings,
    pub ticker: TickerConfig,
    pub flight: FlightSettings,
    pub camera: CameraConfig,
}

impl SenderConfig {
    /// Load from the file named by `IMAGE_SENDER_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SenderConfigFile) -> Self {
        let mqtt = file.mqtt.unwrap_or_default();
        let frames = file.frames.unwrap_or_default();
        let ticker = file.ticker.unwrap_or_default();
        let flight = file.flight.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let camera_defaults = CameraConfig::default();
        let ticker_defaults = TickerConfig::default();
        let default_dimensions = Dimensions::default();

        Self {
            default_source: file
                .default_source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            mqtt: MqttSettings {
                broker: mqtt.broker.unwrap_or_default(),
                port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
                topic: mqtt.topic.unwrap_or_default(),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
            },
            frames: FrameSettings {
                transport: frames.transport.unwrap_or_default(),
                bind_addr: frames
                    .bind_addr
                    .unwrap_or_else(|| DEFAULT_FRAME_ADDR.to_string()),
                topic: frames
                    .topic
                    .unwrap_or_else(|| DEFAULT_FRAME_TOPIC.to_string()),
                fps: frames.fps.unwrap_or(DEFAULT_FPS),
                dimensions: Dimensions::new(
                    frames.width.unwrap_or(default_dimensions.width),
                    frames.height.unwrap_or(default_dimensions.height),
                ),
                queue_capacity: frames.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            },
            clock: ClockSettings {
                utc_offset_minutes: file.clock.and_then(|clock| clock.utc_offset_minutes),
            },
            ticker: TickerConfig {
                feed_url: ticker.feed_url,
                scroll_speed: ticker.scroll_speed.unwrap_or(ticker_defaults.scroll_speed),
            },
            flight: FlightSettings {
                feed_url: flight
                    .feed_url
                    .unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
                token: flight.token,
                bounds: flight.bounds.map(|[x1, y1, x2, y2]| BoundingBox { x1, y1, x2, y2 }),
                home: flight.home.map(|[longitude, latitude]| Location {
                    longitude,
                    latitude,
                }),
            },
            camera: CameraConfig {
                device: camera.device.unwrap_or(camera_defaults.device),
                capture_width: camera.capture_width.unwrap_or(camera_defaults.capture_width),
                capture_height: camera
                    .capture_height
                    .unwrap_or(camera_defaults.capture_height),
                target_fps: camera.target_fps.unwrap_or(camera_defaults.target_fps),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(broker) = env_string("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = env_parse("MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(topic) = env_string("MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(client_id) = env_string("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = env_string("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_string("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(use_tls) = env_string("MQTT_USE_TLS") {
            self.mqtt.use_tls = parse_bool("MQTT_USE_TLS", &use_tls)?;
        }
        if let Some(path) = env_string("MQTT_TLS_CA_PATH") {
            self.mqtt.tls_ca_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("MQTT_TLS_CLIENT_CERT_PATH") {
            self.mqtt.tls_client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("MQTT_TLS_CLIENT_KEY_PATH") {
            self.mqtt.tls_client_key_path = Some(PathBuf::from(path));
        }

        if let Some(source) = env_string("DEFAULT_SOURCE") {
            self.default_source = source;
        }

        if let Some(transport) = env_parse("FRAME_TRANSPORT")? {
            self.frames.transport = transport;
        }
        if let Some(addr) = env_string("FRAME_BIND_ADDR") {
            self.frames.bind_addr = addr;
        }
        if let Some(topic) = env_string("FRAME_TOPIC") {
            self.frames.topic = topic;
        }
        if let Some(fps) = env_parse("FRAME_FPS")? {
            self.frames.fps = fps;
        }
        if let Some(width) = env_parse("FRAME_WIDTH")? {
            self.frames.dimensions.width = width;
        }
        if let Some(height) = env_parse("FRAME_HEIGHT")? {
            self.frames.dimensions.height = height;
        }
        if let Some(capacity) = env_parse("FRAME_QUEUE_CAPACITY")? {
            self.frames.queue_capacity = capacity;
        }

        if let Some(offset) = env_parse("CLOCK_UTC_OFFSET_MINUTES")? {
            self.clock.utc_offset_minutes = Some(offset);
        }

        if let Some(url) = env_string("TICKER_FEED_URL") {
            self.ticker.feed_url = Some(url);
        }
        if let Some(speed) = env_parse("TICKER_SCROLL_SPEED")? {
            self.ticker.scroll_speed = speed;
        }

        if let Some(url) = env_string("FLIGHT_FEED_URL") {
            self.flight.feed_url = url;
        }
        if let Some(token) = env_string("FLIGHT_FEED_TOKEN") {
            self.flight.token = Some(token);
        }
        if let Some(raw) = env_string("FLIGHT_BOX") {
            let [x1, y1, x2, y2] = parse_coordinates::<4>("FLIGHT_BOX", &raw)?;
            self.flight.bounds = Some(BoundingBox { x1, y1, x2, y2 });
        }
        if let Some(raw) = env_string("FLIGHT_HOME") {
            let [longitude, latitude] = parse_coordinates::<2>("FLIGHT_HOME", &raw)?;
            self.flight.home = Some(Location {
                longitude,
                latitude,
            });
        }

        if let Some(device) = env_string("CAMERA_DEVICE") {
            self.camera.device = device;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.mqtt.broker = self.mqtt.broker.trim().to_string();
        if self.mqtt.broker.is_empty() {
            return Err(config_error("MQTT broker is required (MQTT_BROKER)"));
        }
        self.mqtt.topic = self.mqtt.topic.trim().trim_end_matches('/').to_string();
        if self.mqtt.topic.is_empty() {
            return Err(config_error("MQTT topic is required (MQTT_TOPIC)"));
        }
        if self.mqtt.topic.contains(['+', '#']) {
            return Err(config_error(format!(
                "MQTT topic must not contain wildcards: {}",
                self.mqtt.topic
            )));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(config_error("MQTT client id must not be empty"));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            return Err(config_error("MQTT password provided without username"));
        }

        if self.frames.fps == 0 {
            return Err(config_error("frame rate must be greater than zero"));
        }
        if self.frames.dimensions.width == 0 || self.frames.dimensions.height == 0 {
            return Err(config_error(format!(
                "frame dimensions must be greater than zero, got {}x{}",
                self.frames.dimensions.width, self.frames.dimensions.height
            )));
        }
        if self.frames.queue_capacity == 0 {
            return Err(config_error("frame queue capacity must be greater than zero"));
        }
        if self.frames.topic.is_empty() {
            return Err(config_error("frame topic must not be empty"));
        }
        if self.frames.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(config_error(format!(
                "invalid frame bind address: {}",
                self.frames.bind_addr
            )));
        }

        self.default_source = self.default_source.trim().to_string();
        if self.default_source.is_empty() {
            return Err(config_error("default source must not be empty"));
        }

        if let Some(offset) = self.clock.utc_offset_minutes {
            if offset.abs() >= MAX_UTC_OFFSET_MINUTES {
                return Err(config_error(format!(
                    "clock UTC offset out of range: {} minutes",
                    offset
                )));
            }
        }
        if !(self.ticker.scroll_speed.is_finite() && self.ticker.scroll_speed > 0.0) {
            return Err(config_error("ticker scroll speed must be greater than zero"));
        }
        match (&self.flight.bounds, &self.flight.home) {
            (Some(_), Some(_)) | (None, None) => {}
            (Some(_), None) => {
                return Err(config_error("flight bounding box provided without home (FLIGHT_HOME)"))
            }
            (None, Some(_)) => {
                return Err(config_error("flight home provided without bounding box (FLIGHT_BOX)"))
            }
        }
        if self.camera.target_fps == 0 {
            return Err(config_error("camera frame rate must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SenderConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        config_error(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| config_error(format!("invalid config file {}: {}", path.display(), e)))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| config_error(format!("{} has an invalid value: {}", name, value))),
        None => Ok(None),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!("{} must be a boolean, got {}", name, value))),
    }
}

/// Parse exactly `N` comma-separated floating point values.
fn parse_coordinates<const N: usize>(name: &str, value: &str) -> Result<[f64; N]> {
    let parts = split_csv(value);
    if parts.len() != N {
        return Err(config_error(format!(
            "{} expects {} comma-separated numbers, got '{}'",
            name, N, value
        )));
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| config_error(format!("{} has an invalid number: {}", name, part)))?;
    }
    Ok(out)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

/// True when `err` came from configuration loading or validation.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConfigError>().is_some()
}
