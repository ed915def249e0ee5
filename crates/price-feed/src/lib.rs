//! Price ingestion for the kimchi-premium engine
//!
//! Features:
//! - WebSocket feeds for the global and local exchange with reconnect and degraded fallback
//! - Batched REST ticker and candle polling with TTL caches
//! - USD/local exchange rate provider with sanity-band validation
//! - Concurrent last-write-wins price store with change notifications
//! - Scheduling supervisor for the periodic REST work

pub mod cache;
pub mod candles;
pub mod codec;
pub mod connection;
pub mod exchanges;
pub mod feeds;
pub mod fx;
pub mod http;
pub mod poller;
pub mod store;
pub mod supervisor;
pub mod synthetic;

pub use cache::TtlCache;
pub use candles::{CandlePoller, CandleSource, SPARKLINE_POINTS};
pub use codec::{Inbound, WireCodec};
pub use connection::{ConnectionTracker, FailureAction, ReconnectPolicy};
pub use exchanges::{
    GlobalCandleClient, GlobalCodec, GlobalRestClient, LocalCandleClient, LocalCodec,
    LocalRestClient,
};
pub use feeds::{FeedConfig, FeedConnectionManager, FeedStats};
pub use fx::{extract_rate, ExchangeRateProvider, JsonRateSource, RateSource};
pub use http::build_client;
pub use poller::{BatchOrigin, TickerBatch, TickerPoller, TickerSource};
pub use store::{MergeOutcome, PriceStore, PriceStoreSnapshot, PriceStoreStats, RejectReason, StoreEvent};
pub use supervisor::{
    SchedulingSupervisor, SchedulingSupervisorBuilder, SupervisorConfig, SupervisorStats, TaskStats,
};
pub use synthetic::SyntheticSource;
