//! `local:remote` port pairs and the `--map` override syntax.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortMapError {
    #[error("invalid port map '{0}', expected 'local:remote'")]
    Malformed(String),

    #[error("failed to parse port in '{0}'")]
    BadPort(String),
}

/// A local port bound on the developer's machine paired with the remote port
/// it proxies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }

    /// A pair forwarding the same port on both sides.
    pub fn same(port: u16) -> Self {
        Self {
            local: port,
            remote: port,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl FromStr for PortPair {
    type Err = PortMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |raw: &str| {
            raw.parse::<u16>()
                .map_err(|_| PortMapError::BadPort(s.to_string()))
        };

        match s.split_once(':') {
            None => Ok(Self::same(parse(s)?)),
            Some((local, remote)) => {
                if local.is_empty() || remote.is_empty() {
                    return Err(PortMapError::Malformed(s.to_string()));
                }
                Ok(Self {
                    local: parse(local)?,
                    remote: parse(remote)?,
                })
            }
        }
    }
}

/// Parses a repeated `--map local:remote` flag. Bare `port` entries map the
/// same port on both sides.
pub fn parse_port_map(specs: &[String]) -> Result<Vec<PortPair>, PortMapError> {
    specs.iter().map(|spec| spec.parse()).collect()
}
