//! Stream transports: Unix socket, TCP and TLS over TCP

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{OvsdbError, Result};

/// Read side of a connected transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of a connected transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One `scheme:address` candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(String),
    Tcp(String),
    Ssl(String),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, address) = s
            .split_once(':')
            .ok_or_else(|| OvsdbError::InvalidEndpoint(s.to_string()))?;
        if address.is_empty() {
            return Err(OvsdbError::InvalidEndpoint(s.to_string()));
        }
        match scheme {
            "unix" => Ok(Endpoint::Unix(address.to_string())),
            "tcp" | "ssl" => {
                if address.rsplit_once(':').map_or(true, |(host, port)| {
                    host.is_empty() || port.parse::<u16>().is_err()
                }) {
                    return Err(OvsdbError::InvalidEndpoint(s.to_string()));
                }
                Ok(if scheme == "tcp" {
                    Endpoint::Tcp(address.to_string())
                } else {
                    Endpoint::Ssl(address.to_string())
                })
            }
            _ => Err(OvsdbError::InvalidEndpoint(s.to_string())),
        }
    }

    /// Parse a comma-separated list, skipping empty entries
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let endpoints = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Endpoint::parse)
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(OvsdbError::InvalidEndpoint(list.to_string()));
        }
        Ok(endpoints)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Ssl(addr) => write!(f, "ssl:{}", addr),
        }
    }
}

fn split<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Strip IPv6 brackets from the host part of `host:port`
fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(h, _)| h);
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn connect_one(
    endpoint: &Endpoint,
    tls: Option<&Arc<rustls::ClientConfig>>,
) -> Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Unix(path) => Ok(split(UnixStream::connect(path).await?)),
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(split(stream))
        }
        Endpoint::Ssl(addr) => {
            let tls = tls.ok_or_else(|| {
                OvsdbError::Tls("ssl endpoint requires a TLS configuration".to_string())
            })?;
            let server_name = rustls::pki_types::ServerName::try_from(host_of(addr).to_string())
                .map_err(|e| OvsdbError::Tls(format!("invalid server name in '{}': {}", addr, e)))?;
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let stream = TlsConnector::from(Arc::clone(tls))
                .connect(server_name, stream)
                .await
                .map_err(|e| OvsdbError::Tls(format!("handshake with {} failed: {}", addr, e)))?;
            Ok(split(stream))
        }
    }
}

/// Try each endpoint in order and return the first that connects
pub async fn connect_any(
    endpoints: &[Endpoint],
    tls: Option<&Arc<rustls::ClientConfig>>,
    timeout: Duration,
) -> Result<(Endpoint, BoxedReader, BoxedWriter)> {
    let mut failures = Vec::new();
    for endpoint in endpoints {
        debug!("Connecting to OVSDB at {}", endpoint);
        match tokio::time::timeout(timeout, connect_one(endpoint, tls)).await {
            Ok(Ok((reader, writer))) => return Ok((endpoint.clone(), reader, writer)),
            Ok(Err(e)) => {
                warn!("OVSDB endpoint {} failed: {}", endpoint, e);
                failures.push(format!("{}: {}", endpoint, e));
            }
            Err(_) => {
                warn!("OVSDB endpoint {} timed out", endpoint);
                failures.push(format!("{}: timed out after {:?}", endpoint, timeout));
            }
        }
    }
    Err(OvsdbError::ConnectFailed(failures))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("unix:/var/run/openvswitch/db.sock").unwrap(),
            Endpoint::Unix("/var/run/openvswitch/db.sock".to_string())
        );
        assert_eq!(
            Endpoint::parse("tcp:127.0.0.1:6640").unwrap(),
            Endpoint::Tcp("127.0.0.1:6640".to_string())
        );
        assert_eq!(
            Endpoint::parse("ssl:[::1]:6640").unwrap(),
            Endpoint::Ssl("[::1]:6640".to_string())
        );
        assert!(Endpoint::parse("udp:1.2.3.4:5").is_err());
        assert!(Endpoint::parse("tcp:localhost").is_err());
        assert!(Endpoint::parse("unix:").is_err());
        assert!(Endpoint::parse("/var/run/db.sock").is_err());
    }

    #[test]
    fn test_parse_list() {
        let list = Endpoint::parse_list("unix:/a.sock, tcp:10.0.0.1:6640").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "tcp:10.0.0.1:6640");
        assert!(Endpoint::parse_list(" , ").is_err());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("ovsdb.example.com:6640"), "ovsdb.example.com");
        assert_eq!(host_of("[::1]:6640"), "::1");
    }

    #[tokio::test]
    async fn test_connect_any_aggregates_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.sock");
        let endpoints = vec![
            Endpoint::Unix(missing.display().to_string()),
            Endpoint::Ssl("127.0.0.1:1".to_string()),
        ];
        let err = connect_any(&endpoints, None, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        match err {
            OvsdbError::ConnectFailed(attempts) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("unix:"));
                assert!(attempts[1].contains("TLS"));
            }
            other => panic!("unexpected error {}", other),
        }
    }
}
