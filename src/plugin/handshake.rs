//! Parent/child handshake
//!
//! The parent passes the protocol version and a magic cookie through the
//! child's environment. The cookie value is the executable's base file
//! name, so a binary started under another name refuses to serve. The child
//! answers with a single stdout line:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL
//! 1|1|tcp|127.0.0.1:41234|jsonrpc
//! ```

use crate::error::TransportError;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const APP_PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "STUCCO_DRIVER_PLUGIN";
pub const PROTOCOL_VERSIONS_KEY: &str = "PLUGIN_PROTOCOL_VERSIONS";
pub const WIRE_PROTOCOL: &str = "jsonrpc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: &'static str,
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    pub fn for_executable(path: &Path) -> Self {
        let value = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            protocol_version: APP_PROTOCOL_VERSION,
            magic_cookie_key: MAGIC_COOKIE_KEY,
            magic_cookie_value: value,
        }
    }

    /// Environment entries the parent adds to the child.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (
                self.magic_cookie_key.to_string(),
                self.magic_cookie_value.clone(),
            ),
            (
                PROTOCOL_VERSIONS_KEY.to_string(),
                self.protocol_version.to_string(),
            ),
        ]
    }

    /// Child side: checks that the parent started this binary as the
    /// plugin it expects.
    pub fn verify_env(&self) -> Result<(), TransportError> {
        let cookie = std::env::var(self.magic_cookie_key).unwrap_or_default();
        if cookie != self.magic_cookie_value {
            return Err(TransportError::Handshake(format!(
                "{} is a plugin and is not meant to be executed directly",
                self.magic_cookie_value
            )));
        }

        let versions = std::env::var(PROTOCOL_VERSIONS_KEY).unwrap_or_default();
        let supported = versions
            .split(',')
            .filter_map(|v| v.trim().parse::<u32>().ok())
            .any(|v| v == self.protocol_version);
        if !supported {
            return Err(TransportError::Handshake(format!(
                "parent requested protocol versions {versions:?}, plugin speaks {}",
                self.protocol_version
            )));
        }
        Ok(())
    }

    /// Parent side: validates the child's announcement line.
    pub fn parse_announcement(&self, line: &str) -> Result<Announcement, TransportError> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 5 {
            return Err(TransportError::Handshake(format!(
                "unrecognized handshake line: {:?}",
                line.trim()
            )));
        }

        let core: u32 = parts[0]
            .parse()
            .map_err(|_| TransportError::Handshake(format!("bad core version {:?}", parts[0])))?;
        if core != CORE_PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "incompatible core protocol version {core}, expected {CORE_PROTOCOL_VERSION}"
            )));
        }

        let app: u32 = parts[1]
            .parse()
            .map_err(|_| TransportError::Handshake(format!("bad app version {:?}", parts[1])))?;
        if app != self.protocol_version {
            return Err(TransportError::Handshake(format!(
                "incompatible plugin protocol version {app}, expected {}",
                self.protocol_version
            )));
        }

        let network = match parts[2] {
            "tcp" => Network::Tcp,
            "unix" => Network::Unix,
            other => {
                return Err(TransportError::Handshake(format!(
                    "unsupported network {other:?}"
                )))
            }
        };

        if parts[4] != WIRE_PROTOCOL {
            return Err(TransportError::Handshake(format!(
                "plugin speaks {:?}, expected {WIRE_PROTOCOL:?}",
                parts[4]
            )));
        }

        Ok(Announcement {
            network,
            address: parts[3].to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

/// Where the child listens for the RPC connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub network: Network,
    pub address: String,
}

impl Announcement {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            address: addr.to_string(),
        }
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let network = match self.network {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        };
        write!(
            f,
            "{CORE_PROTOCOL_VERSION}|{APP_PROTOCOL_VERSION}|{network}|{}|{WIRE_PROTOCOL}",
            self.address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> HandshakeConfig {
        HandshakeConfig::for_executable(Path::new("/usr/local/bin/stucco-js"))
    }

    #[test]
    fn test_cookie_is_base_name() {
        let hs = handshake();
        assert_eq!(hs.magic_cookie_value, "stucco-js");
        assert!(hs
            .env()
            .contains(&(MAGIC_COOKIE_KEY.to_string(), "stucco-js".to_string())));
    }

    #[test]
    fn test_parse_announcement() {
        let a = handshake()
            .parse_announcement("1|1|tcp|127.0.0.1:4000|jsonrpc\n")
            .unwrap();
        assert_eq!(a.network, Network::Tcp);
        assert_eq!(a.address, "127.0.0.1:4000");
        assert_eq!(a.to_string(), "1|1|tcp|127.0.0.1:4000|jsonrpc");
    }

    #[test]
    fn test_parse_announcement_rejects_mismatches() {
        let hs = handshake();
        assert!(hs.parse_announcement("hello world").is_err());
        assert!(hs.parse_announcement("2|1|tcp|127.0.0.1:1|jsonrpc").is_err());
        assert!(hs.parse_announcement("1|7|tcp|127.0.0.1:1|jsonrpc").is_err());
        assert!(hs.parse_announcement("1|1|pipe|x|jsonrpc").is_err());
        assert!(hs.parse_announcement("1|1|tcp|127.0.0.1:1|grpc").is_err());
    }
}
