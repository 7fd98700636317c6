//! MQTT control bridge.
//!
//! Topics under the configured base:
//! - `<base>/cmnd`: inbound commands
//! - `<base>/stat`: current mode after each accepted switch
//! - `<base>/availability`: `online`/`offline`, retained, `offline` as last will

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::command::{handle_command, StatusUpdate};
use crate::config::MqttSettings;
use crate::controller::Controller;
use crate::pipeline::RunSignal;
use crate::transport::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlTopics {
    pub command: String,
    pub status: String,
    pub availability: String,
}

impl ControlTopics {
    pub fn new(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            command: format!("{}/cmnd", base),
            status: format!("{}/stat", base),
            availability: format!("{}/availability", base),
        }
    }
}

/// Connected control channel with its connection thread.
pub struct ControlBridge {
    client: Client,
    topics: ControlTopics,
    signal: RunSignal,
    handle: Option<JoinHandle<()>>,
}

impl ControlBridge {
    /// Connect to the broker and start dispatching commands to `controller`.
    pub fn connect(
        settings: &MqttSettings,
        loopback_only: bool,
        controller: Arc<Mutex<Controller>>,
    ) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.port, settings.use_tls)?;
        check_broker(&endpoint, &settings.broker, loopback_only)?;
        let tls = TlsMaterials::load(
            settings.tls_ca_path.as_deref(),
            settings.tls_client_cert_path.as_deref(),
            settings.tls_client_key_path.as_deref(),
        )?;
        let topics = ControlTopics::new(&settings.topic);
        let (client, connection) = connect_mqtt(&endpoint, &tls, settings, &topics.availability)?;

        let signal = RunSignal::running();
        let worker = ConnectionWorker {
            client: client.clone(),
            topics: topics.clone(),
            signal: signal.clone(),
            controller,
        };
        let handle = std::thread::Builder::new()
            .name("mqtt control".to_string())
            .spawn(move || worker.run(connection))
            .context("spawn MQTT control thread")?;

        Ok(Self {
            client,
            topics,
            signal,
            handle: Some(handle),
        })
    }

    pub fn topics(&self) -> &ControlTopics {
        &self.topics
    }

    pub fn publish_status(&self, status: &StatusUpdate) -> Result<()> {
        mqtt_publish_qos1(&self.client, &self.topics.status, &status.to_json()?, false)
    }

    /// Publish `offline`, disconnect and join the connection thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.signal.stop();
        if let Err(e) = mqtt_publish_qos1(
            &self.client,
            &self.topics.availability,
            PAYLOAD_OFFLINE.as_bytes(),
            true,
        ) {
            log::warn!("failed to publish offline availability: {:#}", e);
        }
        let disconnected = self
            .client
            .disconnect()
            .map_err(|e| anyhow!("MQTT disconnect failed: {}", e));
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("MQTT control thread panicked"))?;
        }
        log::info!("MQTT control bridge stopped");
        disconnected
    }
}

struct ConnectionWorker {
    client: Client,
    topics: ControlTopics,
    signal: RunSignal,
    controller: Arc<Mutex<Controller>>,
}

impl ConnectionWorker {
    fn run(self, mut connection: Connection) {
        let mut announced = false;
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    log::info!("MQTT connected; subscribing to {}", self.topics.command);
                    if let Err(e) = self.on_connected(&mut announced) {
                        log::warn!("MQTT session setup failed: {:#}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if publish.topic.as_ref() != self.topics.command.as_bytes() {
                        continue;
                    }
                    self.dispatch(&publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.signal.is_running() {
                        break;
                    }
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    if !self.signal.wait_timeout(RECONNECT_BACKOFF) {
                        break;
                    }
                }
            }
        }
        log::debug!("MQTT connection thread exiting");
    }

    fn on_connected(&self, announced: &mut bool) -> Result<()> {
        self.client
            .try_subscribe(self.topics.command.clone(), QoS::AtLeastOnce)
            .map_err(|e| anyhow!("subscribe {}: {}", self.topics.command, e))?;
        self.try_publish(&self.topics.availability, PAYLOAD_ONLINE.as_bytes(), true)?;
        if !*announced {
            let current = self
                .controller
                .lock()
                .map_err(|_| anyhow!("controller lock poisoned"))?
                .current_source()
                .map(str::to_string);
            if let Some(current_mode) = current {
                self.try_publish(
                    &self.topics.status,
                    &StatusUpdate { current_mode }.to_json()?,
                    false,
                )?;
            }
            *announced = true;
        }
        Ok(())
    }

    fn dispatch(&self, payload: &[u8]) {
        let status = match self.controller.lock() {
            Ok(mut controller) => handle_command(&mut controller, payload),
            Err(_) => {
                log::error!("controller lock poisoned; dropping control message");
                return;
            }
        };
        if let Some(status) = status {
            let published = status
                .to_json()
                .and_then(|json| self.try_publish(&self.topics.status, &json, false));
            if let Err(e) = published {
                log::warn!("failed to publish status: {:#}", e);
            }
        }
    }

    /// Non-blocking publish; the connection thread must never wait on its own request queue.
    fn try_publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| anyhow!("publish {}: {}", topic, e))
    }
}

/// Remote brokers are accepted unless `loopback_only` is set.
fn check_broker(endpoint: &MqttEndpoint, configured: &str, loopback_only: bool) -> Result<()> {
    if loopback_only {
        return validate_loopback_addr(endpoint, configured);
    }
    if !endpoint.is_loopback() && !endpoint.use_tls {
        log::warn!(
            "MQTT broker {} is remote and unencrypted; keep it on a trusted network",
            endpoint.host
        );
    }
    Ok(())
}

fn connect_mqtt(
    endpoint: &MqttEndpoint,
    tls: &TlsMaterials,
    settings: &MqttSettings,
    will_topic: &str,
) -> Result<(Client, Connection)> {
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_start(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    let will = LastWill::new(
        will_topic,
        PAYLOAD_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
        None,
    );
    options.set_last_will(will);
    options.set_transport(tls.build_transport(endpoint)?);

    let (client, connection) = Client::new(options, 10);
    log::info!(
        "Connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

fn mqtt_publish_qos1(client: &Client, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
    client.publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())?;
    Ok(())
}
