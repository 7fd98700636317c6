//! Broker address handling for the control channel.
//!
//! An address is `host`, `host:port` or `[ipv6]:port`, optionally prefixed with
//! a scheme. `mqtts://` and `ssl://` force TLS; `mqtt://` and `tcp://` leave it
//! to the configured flag. Client certificates require an explicit CA.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::Path;

/// Resolved broker address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Parse `addr`, using `default_port` when it names no port.
    pub fn parse(addr: &str, default_port: u16, use_tls: bool) -> Result<Self> {
        let trimmed = addr.trim();
        let (tls_scheme, rest) = match trimmed.split_once("://") {
            None => (false, trimmed),
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => bail!("broker scheme '{}' is not supported", scheme),
        };
        if rest.is_empty() {
            bail!("broker address '{}' names no host", addr);
        }
        let (host, port) = host_and_port(rest, default_port)
            .with_context(|| format!("bad broker address '{}'", addr))?;
        Ok(Self {
            host,
            port,
            use_tls: use_tls || tls_scheme,
        })
    }

    pub fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

fn host_and_port(rest: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = match rest.strip_prefix('[') {
        Some(bracketed) => {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow!("unterminated '['"))?;
            if tail.is_empty() {
                (host, None)
            } else {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| anyhow!("expected ':' after ']'"))?;
                (host, Some(port))
            }
        }
        None => match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        },
    };
    let port = match port {
        Some(port) => port.parse::<u16>().context("port is not a number")?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Parse a broker address. See [`MqttEndpoint::parse`].
pub fn parse_mqtt_endpoint(addr: &str, default_port: u16, use_tls: bool) -> Result<MqttEndpoint> {
    MqttEndpoint::parse(addr, default_port, use_tls)
}

/// Fails unless the broker is on this host. Used with `--loopback-mqtt-only`.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, configured: &str) -> Result<()> {
    if endpoint.is_loopback() {
        return Ok(());
    }
    Err(anyhow!(
        "broker '{}' is not on loopback and --loopback-mqtt-only is set",
        configured
    ))
}

/// PEM material read from disk for the TLS transport.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// Certificate and key, always loaded as a pair.
    pub client_identity: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self> {
        let client_identity = match (client_cert, client_key) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((
                read_pem("client certificate", cert)?,
                read_pem("client key", key)?,
            )),
            (Some(_), None) => bail!("a TLS client certificate needs a client key"),
            (None, Some(_)) => bail!("a TLS client key needs a client certificate"),
        };
        Ok(Self {
            ca: ca.map(|path| read_pem("CA certificate", path)).transpose()?,
            client_identity,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_identity.is_some()
    }

    /// Pick the rumqttc transport for `endpoint`.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        match (endpoint.use_tls, &self.ca) {
            (false, _) if self.is_configured() => Err(anyhow!(
                "TLS files are configured but TLS is off; set MQTT_USE_TLS=true or use mqtts://"
            )),
            (false, _) => Ok(Transport::tcp()),
            (true, None) if self.client_identity.is_some() => Err(anyhow!(
                "TLS client certificates need MQTT_TLS_CA_PATH as well"
            )),
            (true, None) => Ok(Transport::tls_with_default_config()),
            (true, Some(ca)) => Ok(Transport::tls(ca.clone(), self.client_identity.clone(), None)),
        }
    }
}

fn read_pem(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read TLS {} from {}", what, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn host_and_port_forms() -> Result<()> {
        let ep = MqttEndpoint::parse("10.0.0.2:1999", 1883, false)?;
        assert_eq!((ep.host.as_str(), ep.port, ep.use_tls), ("10.0.0.2", 1999, false));

        let ep = MqttEndpoint::parse("broker.local", 1884, false)?;
        assert_eq!((ep.host.as_str(), ep.port), ("broker.local", 1884));

        let ep = MqttEndpoint::parse("[::1]", 1999, true)?;
        assert_eq!((ep.host.as_str(), ep.port, ep.use_tls), ("::1", 1999, true));

        let ep = MqttEndpoint::parse("[fe80::2]:8883", 1883, false)?;
        assert_eq!((ep.host.as_str(), ep.port), ("fe80::2", 8883));
        Ok(())
    }

    #[test]
    fn scheme_selects_tls() -> Result<()> {
        assert!(MqttEndpoint::parse("ssl://display.lan:8883", 1883, false)?.use_tls);
        assert!(!MqttEndpoint::parse("tcp://display.lan", 1883, false)?.use_tls);
        assert!(MqttEndpoint::parse("mqtt://display.lan", 1883, true)?.use_tls);
        Ok(())
    }

    #[test]
    fn malformed_addresses_fail() {
        for addr in ["ws://broker:80", "mqtt://", "[::1", "[::1]1883", "broker:port"] {
            assert!(MqttEndpoint::parse(addr, 1883, false).is_err(), "{}", addr);
        }
    }

    #[test]
    fn loopback_check() -> Result<()> {
        for addr in ["localhost", "127.0.0.1:1883", "[::1]:1883"] {
            let ep = parse_mqtt_endpoint(addr, 1883, false)?;
            assert!(validate_loopback_addr(&ep, addr).is_ok(), "{}", addr);
        }
        let ep = parse_mqtt_endpoint("192.168.1.10", 1883, false)?;
        let err = validate_loopback_addr(&ep, "192.168.1.10").unwrap_err();
        assert!(err.to_string().contains("--loopback-mqtt-only"));
        Ok(())
    }

    #[test]
    fn client_identity_is_all_or_nothing() -> Result<()> {
        let mut cert = tempfile::NamedTempFile::new()?;
        cert.write_all(b"-----BEGIN CERTIFICATE-----")?;

        let err = TlsMaterials::load(None, Some(cert.path()), None).unwrap_err();
        assert!(err.to_string().contains("client key"));

        let materials = TlsMaterials::load(None, Some(cert.path()), Some(cert.path()))?;
        assert!(materials.client_identity.is_some());
        let tls = MqttEndpoint::parse("mqtts://localhost", 8883, false)?;
        assert!(materials.build_transport(&tls).is_err());
        Ok(())
    }

    #[test]
    fn files_without_tls_are_rejected() -> Result<()> {
        let plain = MqttEndpoint::parse("localhost", 1883, false)?;
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_identity: None,
        };
        assert!(materials.build_transport(&plain).is_err());
        assert!(TlsMaterials::default().build_transport(&plain).is_ok());
        Ok(())
    }
}
