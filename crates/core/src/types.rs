//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ErrorKind;

/// The two venues the engine reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// USDT-quoted global venue
    Global,
    /// Fiat-quoted local venue
    Local,
}

impl ExchangeKind {
    pub const ALL: [ExchangeKind; 2] = [ExchangeKind::Global, ExchangeKind::Local];

    pub fn name(&self) -> &'static str {
        match self {
            ExchangeKind::Global => "global",
            ExchangeKind::Local => "local",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a quote came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Streamed over the exchange's push feed
    Push,
    /// Pulled from the exchange's REST ticker endpoint
    Poll,
    /// Generated by the degraded source after the feed gave up
    Synthetic,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Push => "push",
            SourceKind::Poll => "poll",
            SourceKind::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Feed connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Observable state of a feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<ErrorKind>,
    /// Set once the feed has given up and is serving polled or synthetic data
    pub degraded: bool,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            degraded: false,
        }
    }
}

/// Current UTC time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
