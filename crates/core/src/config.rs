//! Configuration for listeners, connections and parsers.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! document only names what it changes:
//!
//! ```
//! use micro_core::config::{AcceptErrorPolicy, CoreConfig};
//!
//! let config = CoreConfig::from_json(r#"{ "listen": { "port": 8080, "accept_errors": "report" } }"#).unwrap();
//! assert_eq!(config.listen().port(), 8080);
//! assert_eq!(config.listen().backlog(), 511);
//! assert_eq!(config.listen().accept_errors(), AcceptErrorPolicy::Report);
//! ```

use std::io::Read;

use bytes::BytesMut;
use serde::Deserialize;

use crate::codec::{DEFAULT_MAX_HEAD_BYTES, MalformedPolicy, RequestParser};

const DEFAULT_BACKLOG: u32 = 511;
const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// What a listener does when accepting a peer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptErrorPolicy {
    /// Drop the failed accept, logging it at debug level
    #[default]
    Drop,
    /// Deliver it to `ListenerHandler::on_accept_error`
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    address: String,
    port: u16,
    backlog: u32,
    reuse_port: bool,
    accept_errors: AcceptErrorPolicy,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 0,
            backlog: DEFAULT_BACKLOG,
            reuse_port: true,
            accept_errors: AcceptErrorPolicy::Drop,
        }
    }
}

impl ListenConfig {
    pub fn with_address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_accept_errors(mut self, policy: AcceptErrorPolicy) -> Self {
        self.accept_errors = policy;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    pub fn accept_errors(&self) -> AcceptErrorPolicy {
        self.accept_errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    no_delay: bool,
    /// Keep-alive probe delay, `None` leaves keep-alive untouched
    keep_alive_secs: Option<u32>,
    read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { no_delay: false, keep_alive_secs: None, read_buffer_size: DEFAULT_READ_BUFFER_SIZE }
    }
}

impl ConnectionConfig {
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_keep_alive_secs(mut self, secs: Option<u32>) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn keep_alive_secs(&self) -> Option<u32> {
        self.keep_alive_secs
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    /// A fresh read target of `read_buffer_size` bytes.
    pub fn read_buffer(&self) -> BytesMut {
        BytesMut::with_capacity(self.read_buffer_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    policy: MalformedPolicy,
    max_head_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self { policy: MalformedPolicy::default(), max_head_bytes: DEFAULT_MAX_HEAD_BYTES }
    }
}

impl ParserConfig {
    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_head_bytes(mut self, max_head_bytes: usize) -> Self {
        self.max_head_bytes = max_head_bytes;
        self
    }

    pub fn policy(&self) -> MalformedPolicy {
        self.policy
    }

    pub fn max_head_bytes(&self) -> usize {
        self.max_head_bytes
    }

    pub fn build(&self) -> RequestParser {
        RequestParser::with_limits(self.policy, self.max_head_bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    listen: ListenConfig,
    connection: ConnectionConfig,
    parser: ParserConfig,
}

impl CoreConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn from_reader<R: Read>(reader: R) -> serde_json::Result<Self> {
        serde_json::from_reader(reader)
    }

    pub fn with_listen(mut self, listen: ListenConfig) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn listen(&self) -> &ListenConfig {
        &self.listen
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn parser(&self) -> &ParserConfig {
        &self.parser
    }
}
