//! The localizer IPC protocol.
//!
//! The daemon listens on a UNIX socket and speaks length-delimited frames,
//! each carrying one JSON-encoded [`Request`] or [`Response`]. Most calls are
//! unary; `expose`/`stop-expose` stream [`Response::Console`] lines and end
//! with a terminal `Ok` or `Error`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod client;
pub mod codec;

pub use client::Client;
pub use codec::Connection;

/// Where the daemon listens. World-writable so unprivileged CLIs can talk to
/// the root-owned daemon.
pub const SOCKET_PATH: &str = "/var/run/localizer.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Expose a local process inside the cluster under a service's identity.
    ExposeService {
        namespace: String,
        service: String,
        #[serde(default)]
        port_map: Vec<String>,
    },
    /// Tear down a previously created exposure.
    StopExpose { namespace: String, service: String },
    /// Snapshot the current port-forward connections.
    List,
    /// Liveness check.
    Ping,
    /// Whether the daemon has gone quiet after its initial reconcile drain.
    Stable,
    /// Gracefully shut the daemon down.
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// One streamed log line.
    Console { level: ConsoleLevel, message: String },
    List { services: Vec<ServiceStatus> },
    Pong,
    Stable { stable: bool },
    /// Terminal success for a unary or streaming call.
    Ok,
    /// Terminal failure; `message` is surfaced to the user verbatim.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsoleLevel {
    Info,
    Warn,
    Error,
}

/// One entry of the `List` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub namespace: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub status_reason: String,
    /// The pod currently backing the forward, if any.
    #[serde(default)]
    pub endpoint: String,
    /// The dedicated loopback address, empty while waiting for endpoints.
    #[serde(default)]
    pub ip: String,
    /// `local:remote` pairs.
    #[serde(default)]
    pub ports: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_is_stable() {
        let req = Request::ExposeService {
            namespace: "demo".to_string(),
            service: "api".to_string(),
            port_map: vec!["80:8080".to_string()],
        };
        let wire = serde_json::to_string(&req).unwrap();
        assert_eq!(
            wire,
            r#"{"type":"expose_service","namespace":"demo","service":"api","port_map":["80:8080"]}"#
        );
        assert_eq!(serde_json::from_str::<Request>(&wire).unwrap(), req);
    }

    #[test]
    fn console_levels_are_uppercase_on_the_wire() {
        let res = Response::Console {
            level: ConsoleLevel::Warn,
            message: "careful".to_string(),
        };
        let wire = serde_json::to_string(&res).unwrap();
        assert!(wire.contains(r#""level":"WARN""#));
    }
}
