//! Endpoint addressing and TCP connect
//!
//! This module owns the `(host, port, scheme)` triple that identifies a
//! remote TLS peer and the blocking connect used beneath every session.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A remote peer: host, port and scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    scheme: Scheme,
}

impl Endpoint {
    /// Create an endpoint. The host is stored lowercased.
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Endpoint {
            host: host.into().to_ascii_lowercase(),
            port,
            scheme,
        }
    }

    /// HTTPS endpoint shorthand
    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Scheme::Https)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host parsed as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    /// Value for the `Host` request header
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Split a URL into its endpoint and request target
    ///
    /// Accepts `scheme://host[:port][/path[?query]]`. Userinfo and fragments
    /// are rejected.
    pub fn parse_url(url: &str) -> Result<(Endpoint, String), Error> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::InvalidUrl(url.to_string())),
        };

        if rest.contains('#') {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        let (authority, target) = match rest.find(|c| c == '/' || c == '?') {
            Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        if authority.is_empty() || authority.contains('@') {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let port = port.unwrap_or_else(|| scheme.default_port());

        Ok((Endpoint::new(host, port, scheme), target))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        let end = rest.find(']')?;
        let host = &authority[..end + 2];
        let tail = &rest[end + 1..];
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((authority, None)),
    }
}

/// Connect to an endpoint with a per-address timeout
///
/// Every resolved address is tried in order; the last connect error is
/// returned when none succeeds. The stream has `TCP_NODELAY` set.
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, Error> {
    let host = endpoint.host().trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (host, endpoint.port())
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(endpoint.host().to_string()))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match connect_addr(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(source) => {
                tracing::debug!(%addr, error = %source, "connect attempt failed");
                last_err = Some(Error::Connect { addr, source });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Resolve(endpoint.host().to_string())))
}

fn connect_addr(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_url() {
        let (ep, target) = Endpoint::parse_url("https://Example.com:8443/a/b?x=1").unwrap();
        assert_eq!(ep.host(), "example.com");
        assert_eq!(ep.port(), 8443);
        assert_eq!(ep.scheme(), Scheme::Https);
        assert_eq!(target, "/a/b?x=1");

        let (ep, target) = Endpoint::parse_url("https://localhost").unwrap();
        assert_eq!(ep.port(), 443);
        assert_eq!(target, "/");

        let (ep, target) = Endpoint::parse_url("http://h?q").unwrap();
        assert_eq!(ep.port(), 80);
        assert_eq!(target, "/?q");
    }

    #[test]
    fn test_parse_url_ipv6() {
        let (ep, _) = Endpoint::parse_url("https://[::1]:9000/").unwrap();
        assert_eq!(ep.host(), "[::1]");
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.ip(), Some("::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_url_rejects() {
        assert!(Endpoint::parse_url("localhost:80").is_err());
        assert!(Endpoint::parse_url("ftp://host/").is_err());
        assert!(Endpoint::parse_url("https://user@host/").is_err());
        assert!(Endpoint::parse_url("https://host:notaport/").is_err());
        assert!(Endpoint::parse_url("https:///path").is_err());
    }

    #[test]
    fn test_authority() {
        assert_eq!(Endpoint::https("a.test", 443).authority(), "a.test");
        assert_eq!(Endpoint::https("a.test", 8443).authority(), "a.test:8443");
    }

    #[test]
    fn test_connect_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect(&Endpoint::https("127.0.0.1", port), Duration::from_secs(1)).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = connect(&Endpoint::https("127.0.0.1", port), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }
}
