//! Transports.
//!
//! - `FrameTransport`: outbound pub/sub session for encoded frames, with a
//!   ZeroMQ PUB implementation and a length-prefixed TCP fallback
//! - MQTT broker address parsing and TLS selection for the control channel

mod broker;
mod tcp;
mod zmq;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub use broker::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
pub use tcp::{TcpFrameTransport, DEFAULT_FRAME_ADDR};
pub use zmq::ZmqFrameTransport;

/// Best-effort publish session for encoded frames.
pub trait FrameTransport: Send {
    /// Publish one message. Delivery to slow or absent subscribers is not guaranteed.
    fn send(&mut self, message: &[u8]) -> Result<()>;

    /// Close the session. Further sends are an error.
    fn close(&mut self) -> Result<()>;
}

/// Wire protocol of the frame stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTransportKind {
    /// ZeroMQ PUB socket, one single-frame message per frame.
    #[default]
    Zmq,
    /// Plain TCP with a `u32` length prefix per message.
    Tcp,
}

impl FromStr for FrameTransportKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "zmq" => Ok(Self::Zmq),
            "tcp" => Ok(Self::Tcp),
            other => Err(anyhow!("unknown frame transport '{}'", other)),
        }
    }
}

impl fmt::Display for FrameTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zmq => "zmq",
            Self::Tcp => "tcp",
        })
    }
}

/// Bind the configured frame transport on `addr`.
pub fn bind_frame_transport(
    kind: FrameTransportKind,
    addr: &str,
) -> Result<Box<dyn FrameTransport>> {
    Ok(match kind {
        FrameTransportKind::Zmq => Box::new(ZmqFrameTransport::bind(addr)?),
        FrameTransportKind::Tcp => Box::new(TcpFrameTransport::bind(addr)?),
    })
}

/// A published message: the ASCII topic immediately followed by the payload.
pub fn encode_message(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(topic.len() + payload.len());
    message.extend_from_slice(topic.as_bytes());
    message.extend_from_slice(payload);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_topic_then_payload() {
        assert_eq!(encode_message("/frames", b"\x89PNG"), b"/frames\x89PNG".to_vec());
        assert_eq!(encode_message("", b"x"), b"x".to_vec());
    }

    #[test]
    fn transport_kind_parses_case_insensitively() {
        assert_eq!("ZMQ".parse::<FrameTransportKind>().ok(), Some(FrameTransportKind::Zmq));
        assert_eq!("tcp".parse::<FrameTransportKind>().ok(), Some(FrameTransportKind::Tcp));
        assert!("udp".parse::<FrameTransportKind>().is_err());
        assert_eq!(FrameTransportKind::default().to_string(), "zmq");
    }
}
