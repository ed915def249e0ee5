//! Wire codec seam between the generic feed manager and an exchange's
//! push protocol

use kimp_core::{ExchangeKind, InstrumentQuote, PriceFeedResult};

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Ticker updates, already stamped `SourceKind::Push`
    Tickers(Vec<InstrumentQuote>),
    /// Reply to our heartbeat
    Heartbeat,
    /// Subscription acks and other control traffic
    Control,
    /// Error reported by the exchange in-band
    Error(String),
}

impl Inbound {
    /// Everything except `Error` proves the session is alive at the application level
    pub fn is_liveness(&self) -> bool {
        !matches!(self, Inbound::Error(_))
    }
}

/// Exchange-specific framing for the push feed
pub trait WireCodec: Send + Sync + 'static {
    fn exchange(&self) -> ExchangeKind;

    /// Text frames to send right after the handshake
    fn subscribe_frames(&self, instruments: &[String]) -> PriceFeedResult<Vec<String>>;

    /// Application-level ping, if the protocol has one
    fn heartbeat_frame(&self) -> Option<String>;

    /// Decode a text or binary payload. Errors mean the frame was malformed.
    fn decode(&self, payload: &[u8], received_at_ms: i64) -> PriceFeedResult<Inbound>;
}
