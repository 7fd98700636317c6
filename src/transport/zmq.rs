use anyhow::{anyhow, Context, Result};
use tokio::runtime::Runtime;
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use super::FrameTransport;

/// ZeroMQ PUB socket.
///
/// Each published message is a single frame, so `SUB` peers filter on the
/// topic prefix. Messages for slow or absent subscribers are dropped by the
/// socket.
pub struct ZmqFrameTransport {
    runtime: Runtime,
    socket: Option<PubSocket>,
    endpoint: String,
}

impl ZmqFrameTransport {
    /// Bind a PUB socket on `addr` (`host:port`, or a full `tcp://` endpoint).
    pub fn bind(addr: &str) -> Result<Self> {
        let requested = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("tcp://{}", addr)
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("zmq frame io")
            .enable_all()
            .build()
            .context("start zmq runtime")?;
        let mut socket = PubSocket::new();
        let endpoint = runtime
            .block_on(socket.bind(&requested))
            .with_context(|| format!("bind frame socket {}", requested))?
            .to_string();
        log::info!("frame transport publishing on {}", endpoint);
        Ok(Self {
            runtime,
            socket: Some(socket),
            endpoint,
        })
    }

    /// Resolved endpoint, with the actual port when binding to port 0.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FrameTransport for ZmqFrameTransport {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow!("frame transport is closed"))?;
        self.runtime
            .block_on(socket.send(ZmqMessage::from(message.to_vec())))
            .context("zmq publish")
    }

    fn close(&mut self) -> Result<()> {
        if let Some(socket) = self.socket.take() {
            for err in self.runtime.block_on(socket.close()) {
                log::debug!("zmq close on {}: {}", self.endpoint, err);
            }
            log::info!("frame transport on {} closed", self.endpoint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use zeromq::{SocketRecv, SubSocket};

    #[test]
    fn sub_socket_receives_single_frame_messages() -> Result<()> {
        let mut transport = ZmqFrameTransport::bind("127.0.0.1:0")?;
        assert!(transport.endpoint().starts_with("tcp://127.0.0.1:"));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let mut subscriber = SubSocket::new();
        runtime.block_on(async {
            subscriber.connect(transport.endpoint()).await?;
            subscriber.subscribe("/frames").await
        })?;

        // Publish until the subscription has propagated.
        let mut received = None;
        for _ in 0..100 {
            transport.send(b"/other-ignored")?;
            transport.send(b"/frames\x89PNG")?;
            let next = runtime.block_on(async {
                tokio::time::timeout(Duration::from_millis(50), subscriber.recv()).await
            });
            if let Ok(message) = next {
                received = Some(message?);
                break;
            }
        }
        let received = received.ok_or_else(|| anyhow!("no frame received"))?;
        assert_eq!(received.len(), 1);
        assert_eq!(received.get(0).map(|b| b.to_vec()), Some(b"/frames\x89PNG".to_vec()));

        transport.close()?;
        transport.close()?;
        assert!(transport.send(b"/frames").is_err());
        Ok(())
    }

    #[test]
    fn send_without_subscribers_succeeds() -> Result<()> {
        let mut transport = ZmqFrameTransport::bind("127.0.0.1:0")?;
        transport.send(b"/frames nobody listening")?;
        transport.close()
    }
}
