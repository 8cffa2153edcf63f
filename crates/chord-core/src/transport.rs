//! [`TransportLocation`] — a discriminated address carrying the logical
//! server-name used for TLS SNI and certificate CN matching.

use crate::error::ChordError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `"Unix"` | `"Tcp4"` transport kind literal, as accepted on the CLI
/// (`--listen-transport`) and in URL schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Unix,
    Tcp4,
}

impl TransportKind {
    pub fn parse(literal: &str) -> Result<Self, ChordError> {
        match literal {
            "Unix" => Ok(TransportKind::Unix),
            "Tcp4" => Ok(TransportKind::Tcp4),
            other => {
                Err(ChordError::invalid_configuration(format!("unknown transport kind: {other}")))
            }
        }
    }
}

/// A UNIX path or TCP4 host[+port] address, paired with the logical
/// server-name used for TLS SNI and certificate CN matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLocation {
    server_name: String,
    kind: TransportKindData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum TransportKindData {
    Unix { path: PathBuf },
    Tcp4 { address: String, port: Option<u16> },
}

impl TransportLocation {
    pub fn for_unix(server_name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ChordError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(ChordError::invalid_configuration("unix path must not be empty"));
        }
        if !path.is_absolute() {
            return Err(ChordError::invalid_configuration(format!(
                "unix path must be absolute: {}",
                path.display()
            )));
        }
        let server_name = server_name.into();
        if server_name.is_empty() {
            return Err(ChordError::invalid_configuration("server-name must not be empty"));
        }
        Ok(Self { server_name, kind: TransportKindData::Unix { path } })
    }

    pub fn for_tcp4(
        server_name: impl Into<String>,
        address: impl Into<String>,
        port: Option<u16>,
    ) -> Result<Self, ChordError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ChordError::invalid_configuration("tcp4 address must not be empty"));
        }
        let server_name = server_name.into();
        if server_name.is_empty() {
            return Err(ChordError::invalid_configuration("server-name must not be empty"));
        }
        Ok(Self { server_name, kind: TransportKindData::Tcp4 { address, port } })
    }

    pub fn from_url(url: &str) -> Result<Self, ChordError> {
        Self::from_string(url)
    }

    /// Parse `unix://<server-name>/absolute/path` or
    /// `tcp4://<server-name>@host[:port]`.
    pub fn from_string(s: &str) -> Result<Self, ChordError> {
        if let Some(rest) = s.strip_prefix("unix://") {
            let (server_name, path) = rest.split_once('/').ok_or_else(|| {
                ChordError::invalid_configuration(format!("malformed unix url: {s}"))
            })?;
            return Self::for_unix(server_name, PathBuf::from(format!("/{path}")));
        }
        if let Some(rest) = s.strip_prefix("tcp4://") {
            let (server_name, hostport) = rest.split_once('@').ok_or_else(|| {
                ChordError::invalid_configuration(format!("malformed tcp4 url: {s}"))
            })?;
            let (address, port) = match hostport.rsplit_once(':') {
                Some((host, port_str)) => {
                    let port = port_str.parse::<u16>().map_err(|_| {
                        ChordError::invalid_configuration(format!(
                            "non-numeric tcp4 port: {port_str}"
                        ))
                    })?;
                    (host.to_string(), Some(port))
                }
                None => (hostport.to_string(), None),
            };
            return Self::for_tcp4(server_name, address, port);
        }
        Err(ChordError::invalid_configuration(format!("unknown url scheme: {s}")))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn kind(&self) -> TransportKind {
        match &self.kind {
            TransportKindData::Unix { .. } => TransportKind::Unix,
            TransportKindData::Tcp4 { .. } => TransportKind::Tcp4,
        }
    }

    pub fn unix_path(&self) -> Option<&Path> {
        match &self.kind {
            TransportKindData::Unix { path } => Some(path),
            TransportKindData::Tcp4 { .. } => None,
        }
    }

    pub fn tcp4_address(&self) -> Option<&str> {
        match &self.kind {
            TransportKindData::Tcp4 { address, .. } => Some(address),
            TransportKindData::Unix { .. } => None,
        }
    }

    pub fn tcp4_port(&self) -> Option<u16> {
        match &self.kind {
            TransportKindData::Tcp4 { port, .. } => *port,
            TransportKindData::Unix { .. } => None,
        }
    }

    pub fn to_url(&self) -> String {
        match &self.kind {
            TransportKindData::Unix { path } => {
                format!("unix://{}{}", self.server_name, path.display())
            }
            TransportKindData::Tcp4 { address, port: Some(port) } => {
                format!("tcp4://{}@{address}:{port}", self.server_name)
            }
            TransportKindData::Tcp4 { address, port: None } => {
                format!("tcp4://{}@{address}", self.server_name)
            }
        }
    }

    /// A form acceptable to the RPC client library: `host:port` for TCP4,
    /// the raw path for Unix (callers decide how to dial).
    pub fn to_target(&self) -> String {
        match &self.kind {
            TransportKindData::Unix { path } => path.display().to_string(),
            TransportKindData::Tcp4 { address, port } => match port {
                Some(port) => format!("{address}:{port}"),
                None => address.clone(),
            },
        }
    }
}

impl std::fmt::Display for TransportLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_roundtrips_through_url() {
        let loc = TransportLocation::for_unix("agent.chord", "/tmp/chord/agent.sock").unwrap();
        let url = loc.to_url();
        let parsed = TransportLocation::from_string(&url).unwrap();
        assert_eq!(loc, parsed);
    }

    #[test]
    fn tcp4_roundtrips_through_url() {
        let loc = TransportLocation::for_tcp4("agent.chord", "127.0.0.1", Some(9090)).unwrap();
        let parsed = TransportLocation::from_string(&loc.to_url()).unwrap();
        assert_eq!(loc, parsed);
    }

    #[test]
    fn empty_unix_path_is_invalid_configuration() {
        let err = TransportLocation::for_unix("agent.chord", "").unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn relative_unix_path_is_invalid_configuration() {
        let err = TransportLocation::for_unix("agent.chord", "relative/path").unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn non_numeric_tcp4_port_is_invalid_configuration() {
        let err = TransportLocation::from_string("tcp4://agent.chord@host:notaport").unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn unknown_scheme_is_invalid_configuration() {
        let err = TransportLocation::from_string("http://example.com").unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn transport_kind_parses_literals() {
        assert_eq!(TransportKind::parse("Unix").unwrap(), TransportKind::Unix);
        assert_eq!(TransportKind::parse("Tcp4").unwrap(), TransportKind::Tcp4);
        assert!(TransportKind::parse("Quic").is_err());
    }
}
