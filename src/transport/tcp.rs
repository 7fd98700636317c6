use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use super::FrameTransport;

pub const DEFAULT_FRAME_ADDR: &str = "0.0.0.0:5555";
const WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Pub/sub over plain TCP.
///
/// Subscribers connect to the bound port and receive every message published
/// after they connect, each prefixed with its length as a big-endian `u32`.
/// A subscriber whose write fails or times out is dropped.
pub struct TcpFrameTransport {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    subscribers: Vec<(SocketAddr, TcpStream)>,
}

impl TcpFrameTransport {
    pub fn bind(addr: &str) -> Result<Self> {
        let configured: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid frame bind address '{}'", addr))?;
        let listener =
            TcpListener::bind(configured).with_context(|| format!("bind frame port {}", addr))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("frame transport listening on {}", local_addr);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            subscribers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn accept_pending(&mut self) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Err(anyhow!("frame transport is closed"));
        };
        admit_pending(|| listener.accept(), &mut self.subscribers);
        Ok(())
    }
}

/// Admit every queued connection. Accept errors only end this round, so the
/// current message still reaches existing subscribers.
fn admit_pending(
    mut accept: impl FnMut() -> io::Result<(TcpStream, SocketAddr)>,
    subscribers: &mut Vec<(SocketAddr, TcpStream)>,
) {
    loop {
        match accept() {
            Ok((stream, peer)) => match configure_subscriber(&stream) {
                Ok(()) => {
                    log::info!("frame subscriber connected: {}", peer);
                    subscribers.push((peer, stream));
                }
                Err(err) => log::warn!("frame subscriber {} rejected: {}", peer, err),
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                log::warn!("accept frame subscriber: {}", err);
                return;
            }
        }
    }
}

fn configure_subscriber(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)
}

impl FrameTransport for TcpFrameTransport {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.accept_pending()?;
        let len = u32::try_from(message.len())
            .map_err(|_| anyhow!("frame message too large: {} bytes", message.len()))?;
        let prefix = len.to_be_bytes();
        self.subscribers.retain_mut(|(peer, stream)| {
            match stream
                .write_all(&prefix)
                .and_then(|_| stream.write_all(message))
            {
                Ok(()) => true,
                Err(err) => {
                    log::info!("frame subscriber {} dropped: {}", peer, err);
                    false
                }
            }
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.listener.take().is_some() {
            for (peer, stream) in self.subscribers.drain(..) {
                if let Err(err) = stream.shutdown(std::net::Shutdown::Both) {
                    log::debug!("shutdown of frame subscriber {} failed: {}", peer, err);
                }
            }
            log::info!("frame transport on {} closed", self.local_addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len)?;
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body)?;
        Ok(body)
    }

    #[test]
    fn send_without_subscribers_succeeds() -> Result<()> {
        let mut transport = TcpFrameTransport::bind("127.0.0.1:0")?;
        transport.send(b"/frames-nobody-listening")?;
        assert_eq!(transport.subscriber_count(), 0);
        transport.close()?;
        assert!(transport.send(b"late").is_err());
        Ok(())
    }

    #[test]
    fn subscriber_receives_length_prefixed_messages() -> Result<()> {
        let mut transport = TcpFrameTransport::bind("127.0.0.1:0")?;
        let mut client = TcpStream::connect(transport.local_addr())?;
        client.set_read_timeout(Some(Duration::from_secs(2)))?;

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.subscriber_count() == 0 && Instant::now() < deadline {
            transport.send(b"warmup")?;
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(transport.subscriber_count(), 1);

        transport.send(b"/framesABC")?;
        let mut last = read_message(&mut client)?;
        while last != b"/framesABC" {
            last = read_message(&mut client)?;
        }
        transport.close()?;
        Ok(())
    }

    #[test]
    fn accept_error_keeps_existing_subscribers() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let mut client = TcpStream::connect(listener.local_addr()?)?;
        client.set_read_timeout(Some(Duration::from_secs(2)))?;
        let accepted = listener.accept()?;

        let mut results = vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Ok(accepted),
        ];
        let mut subscribers = Vec::new();
        let next = || {
            results
                .pop()
                .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
        };
        admit_pending(next, &mut subscribers);
        assert_eq!(subscribers.len(), 1);
        assert!(results.is_empty());

        listener.set_nonblocking(true)?;
        let mut transport = TcpFrameTransport {
            listener: Some(listener),
            local_addr: "127.0.0.1:0".parse()?,
            subscribers,
        };
        transport.send(b"/framesXYZ")?;
        assert_eq!(read_message(&mut client)?, b"/framesXYZ");
        transport.close()
    }

    #[test]
    fn invalid_bind_address_is_rejected() {
        assert!(TcpFrameTransport::bind("not-an-address").is_err());
    }
}
