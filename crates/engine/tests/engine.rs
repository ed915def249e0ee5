//! Facade behaviour without live upstreams

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_stream::StreamExt;

use kimp_core::{
    now_ms, ConnectionStatus, CoreError, EngineConfig, ExchangeKind, InstrumentQuote, RateBand,
    SourceKind, UnavailableReason,
};
use kimp_engine::{EngineError, PriceEngine};
use kimp_price_feed::StoreEvent;

fn config(instruments: &[&str]) -> EngineConfig {
    EngineConfig {
        instruments: instruments.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Every upstream points at a closed local port
fn offline_config(instruments: &[&str]) -> EngineConfig {
    let mut config = config(instruments);
    config.feeds.global_ws_url = "ws://127.0.0.1:1".to_string();
    config.feeds.local_ws_url = "ws://127.0.0.1:1".to_string();
    config.endpoints.global_rest_url = "http://127.0.0.1:1".to_string();
    config.endpoints.local_rest_url = "http://127.0.0.1:1".to_string();
    config.endpoints.fx_urls = vec!["http://127.0.0.1:1/latest".to_string()];
    config
}

fn quote(id: &str, price: f64) -> InstrumentQuote {
    InstrumentQuote::new(id, price, now_ms(), SourceKind::Push)
}

fn assert_invalid(result: Result<PriceEngine, EngineError>, needle: &str) {
    match result {
        Err(EngineError::Invalid(CoreError::InvalidConfig(msg))) => {
            assert!(msg.contains(needle), "unexpected message: {}", msg)
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("config accepted"),
    }
}

#[tokio::test]
async fn test_from_config_rejects_static_errors() {
    assert_invalid(PriceEngine::from_config(config(&[])), "instrument list is empty");

    let mut inverted = config(&["BTCUSDT"]);
    inverted.rate_band = RateBand::new(2000.0, 1000.0);
    assert_invalid(PriceEngine::from_config(inverted), "rate band");

    let mut seed = config(&["BTCUSDT"]);
    seed.default_exchange_rate = 900.0;
    assert_invalid(PriceEngine::from_config(seed), "default exchange rate");

    let mut zero = config(&["BTCUSDT"]);
    zero.polling.fx_interval_ms = 0;
    assert_invalid(PriceEngine::from_config(zero), "fx_interval_ms");
}

#[tokio::test]
async fn test_premium_through_facade() {
    let engine = PriceEngine::from_config(config(&["BTCUSDT", "BNBUSDT"])).unwrap();
    let store = engine.store();

    assert_eq!(
        engine.get_premium("BTCUSDT").reason_unavailable,
        Some(UnavailableReason::MissingQuote)
    );

    store.merge_quote(ExchangeKind::Global, "BTCUSDT", quote("BTCUSDT", 50_000.0));
    store.merge_quote(ExchangeKind::Local, "KRW-BTC", quote("KRW-BTC", 68_500_000.0));
    store.merge_quote(ExchangeKind::Global, "BNBUSDT", quote("BNBUSDT", 600.0));

    let btc = engine.get_premium("BTCUSDT");
    assert!(btc.is_available());
    assert!((btc.premium_percent.unwrap() - 1.48).abs() < 0.01);

    let bnb = engine.get_premium("BNBUSDT");
    assert!(!bnb.is_available());
    assert_eq!(bnb.reason_unavailable, Some(UnavailableReason::NotCrossListed));

    let all = engine.premiums();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].instrument_id, "BTCUSDT");

    let summary = engine.premium_summary();
    assert_eq!(summary.available_count, 1);
    assert_eq!(summary.not_cross_listed_count, 1);
}

#[tokio::test]
async fn test_get_quote_resolves_global_id_on_local_side() {
    let engine = PriceEngine::from_config(config(&["ETHUSDT"])).unwrap();
    engine
        .store()
        .merge_quote(ExchangeKind::Local, "KRW-ETH", quote("KRW-ETH", 4_200_000.0));

    let by_local = engine.get_quote(ExchangeKind::Local, "KRW-ETH").unwrap();
    let by_global = engine.get_quote(ExchangeKind::Local, "ETHUSDT").unwrap();
    assert_eq!(by_local, by_global);
    assert!(engine.get_quote(ExchangeKind::Global, "ETHUSDT").is_none());
    assert!(engine.get_quote(ExchangeKind::Global, "NOPEUSDT").is_none());
}

#[tokio::test]
async fn test_connection_status_before_start() {
    let engine = PriceEngine::from_config(config(&["BTCUSDT"])).unwrap();
    for exchange in ExchangeKind::ALL {
        let state = engine.get_connection_status(exchange);
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(!state.degraded);
    }
    assert!(!engine.is_running());
    assert_eq!(engine.exchange_rate(), 1350.0);
}

#[tokio::test]
async fn test_subscription_receives_accepted_writes_only() {
    let engine = PriceEngine::from_config(config(&["BTCUSDT"])).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let subscription = engine.subscribe_to_prices(move |event| sink.lock().push(event));
    assert!(subscription.is_active());

    let store = engine.store();
    store.merge_quote(ExchangeKind::Global, "BTCUSDT", quote("BTCUSDT", 50_000.0));
    store.merge_quote(ExchangeKind::Global, "BTCUSDT", quote("BTCUSDT", -1.0));
    store.merge_exchange_rate(5_000.0);
    store.merge_exchange_rate(1_380.0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    {
        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StoreEvent::Quote { instrument_id, price, .. } if instrument_id == "BTCUSDT" && *price == 50_000.0
        ));
        assert_eq!(events[1], StoreEvent::ExchangeRate { rate: 1_380.0 });
    }

    subscription.unsubscribe();
    store.merge_quote(ExchangeKind::Global, "BTCUSDT", quote("BTCUSDT", 51_000.0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_subscription_without_runtime_is_inactive() {
    let engine = PriceEngine::from_config(config(&["BTCUSDT"])).unwrap();
    let subscription = engine.subscribe_to_prices(|_| {});
    assert!(!subscription.is_active());
}

#[test]
fn test_subscription_outside_runtime_uses_engine_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let engine = runtime
        .block_on(async { PriceEngine::from_config(config(&["BTCUSDT"])) })
        .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let subscription = engine.subscribe_to_prices(move |event| {
        let _ = tx.send(event);
    });
    assert!(subscription.is_active());

    engine
        .store()
        .merge_quote(ExchangeKind::Global, "BTCUSDT", quote("BTCUSDT", 50_000.0));
    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, StoreEvent::Quote { exchange: ExchangeKind::Global, .. }));

    drop(subscription);
    runtime.shutdown_timeout(Duration::from_secs(1));
}

#[tokio::test]
async fn test_price_stream_yields_events() {
    let engine = PriceEngine::from_config(config(&["XRPUSDT"])).unwrap();
    let mut stream = Box::pin(engine.price_stream());

    engine
        .store()
        .merge_quote(ExchangeKind::Local, "KRW-XRP", quote("KRW-XRP", 700.0));

    let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        StoreEvent::Quote { exchange: ExchangeKind::Local, source: SourceKind::Push, .. }
    ));
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let engine = PriceEngine::from_config(offline_config(&["BTCUSDT", "BNBUSDT"])).unwrap();

    engine.start().unwrap();
    engine.start().unwrap();
    assert!(engine.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.stop().await;
    assert!(!engine.is_running());
    for exchange in ExchangeKind::ALL {
        assert_eq!(engine.get_connection_status(exchange).status, ConnectionStatus::Disconnected);
    }

    let accepted = engine.store().stats().accepted_count;
    engine.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.store().stats().accepted_count, accepted);
}

#[tokio::test]
async fn test_global_only_instruments_skip_local_feed() {
    let engine = PriceEngine::from_config(offline_config(&["BNBUSDT", "TONUSDT"])).unwrap();
    engine.start().unwrap();

    assert!(engine.mapper().cross_listed().next().is_none());
    assert_eq!(
        engine.get_connection_status(ExchangeKind::Local).status,
        ConnectionStatus::Disconnected
    );

    engine.stop().await;
}
