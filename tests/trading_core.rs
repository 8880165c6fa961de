use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scalpbot::api::{ExchangeClient, PaperExchange};
use scalpbot::config::{BotConfig, MarginFraction, RawConfig, RawSymbol, StrategyParams};
use scalpbot::engine::{BotContext, ControlLoop};
use scalpbot::execution::{lock_ledger, ExecutionGateway, LedgerSettings, PositionLedger, RetryPolicy};
use scalpbot::reconcile::Reconciler;
use scalpbot::risk::{Admission, RejectReason, RiskManager};
use scalpbot::status::EventLog;
use scalpbot::strategy::check_exit;
use scalpbot::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn config(symbols: &[&str]) -> BotConfig {
    BotConfig::from_raw(RawConfig {
        symbols: symbols
            .iter()
            .map(|s| RawSymbol::Name(s.to_string()))
            .collect(),
        dry_run: true,
        total_margin: Some(1000.0),
        cycle_interval_secs: 0.05,
        max_hold_secs: 0,
        strategy: StrategyParams {
            rsi_period: 3,
            sma_short: 2,
            sma_long: 4,
            ..StrategyParams::default()
        },
        ..RawConfig::default()
    })
    .unwrap()
}

fn settings(total_margin: f64, ceiling: f64) -> LedgerSettings {
    LedgerSettings {
        total_margin,
        margin_ceiling: ceiling,
        take_profit_pct: 0.8,
        stop_loss_pct: 2.0,
        trading_fee_pct: 0.0,
        closed_history: 50,
        count_adopted_margin: true,
    }
}

fn fill(size: f64, price: f64) -> FillResult {
    FillResult {
        order_id: "1".to_string(),
        filled_size: size,
        avg_price: price,
        status: FillStatus::Filled,
    }
}

fn entry_signal(symbol: &str, kind: SignalKind, price: f64) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        kind,
        snapshot: IndicatorSnapshot {
            symbol: symbol.to_string(),
            price,
            rsi: 31.0,
            sma_short: 101.0,
            sma_long: 100.0,
            timestamp: Utc::now(),
        },
    }
}

fn symbol_config(symbol: &str) -> SymbolConfig {
    SymbolConfig {
        symbol: symbol.to_string(),
        leverage: 10,
        step_size: 0.001,
        min_qty: 0.001,
        min_notional: 5.0,
    }
}

struct Harness {
    exchange: Arc<PaperExchange>,
    ledger: scalpbot::execution::SharedLedger,
    events: EventLog,
    risk: RiskManager,
    gateway: ExecutionGateway,
    reconciler: Reconciler,
}

fn harness(exchange: PaperExchange, symbols: &[&str]) -> Harness {
    let exchange = Arc::new(exchange);
    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let ledger = PositionLedger::new(settings(1000.0, 0.75)).into_shared();
    let events = EventLog::new(100);
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(1),
        jitter_factor: 0.0,
    };

    Harness {
        gateway: ExecutionGateway::new(client.clone(), ledger.clone(), events.clone(), policy),
        reconciler: Reconciler::new(
            client,
            ledger.clone(),
            events.clone(),
            symbols.iter().map(|s| s.to_string()).collect(),
            10,
            Duration::from_secs(1),
        ),
        risk: RiskManager::new(MarginFraction::Pct20, 10, 3),
        exchange,
        ledger,
        events,
    }
}

impl Harness {
    fn admit(&self, symbol: &str, kind: SignalKind, price: f64) -> Admission {
        let mut ledger = lock_ledger(&self.ledger);
        self.risk
            .admit(
                &mut ledger,
                &entry_signal(symbol, kind, price),
                &symbol_config(symbol),
                Utc::now(),
            )
            .unwrap()
    }

    async fn open(&self, symbol: &str, kind: SignalKind, price: f64) -> Position {
        self.exchange.set_price(symbol, price);
        let Admission::Approved(intent) = self.admit(symbol, kind, price) else {
            panic!("entry for {} should be approved", symbol);
        };
        self.gateway.open(&intent).await.unwrap()
    }
}

#[tokio::test]
async fn test_crossover_entry_then_take_profit_through_control_loop() {
    let exchange = Arc::new(PaperExchange::new(1000.0));
    // Falling closes leave RSI(3) at 0
    exchange.push_candles("BTCUSDT", &[101.0, 101.0, 101.0, 101.0, 100.0, 99.0, 98.0]);

    let ctx = BotContext::new(config(&["BTCUSDT"]), exchange.clone(), 1000.0);
    let mut control = ControlLoop::new(ctx);

    control.run_cycle().await;
    assert!(!lock_ledger(&control.context().ledger).has_active("BTCUSDT"));

    // Jump to 110: RSI crosses 30 upward with SMA(2) 104 over SMA(4) 101.75
    exchange.push_candles("BTCUSDT", &[110.0]);
    let report = control.run_cycle().await;
    assert_eq!(report.errors, 0);

    let position = lock_ledger(&control.context().ledger)
        .get("BTCUSDT")
        .cloned()
        .expect("long opened");
    assert_eq!(position.side, Side::Long);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.entry_price, 110.0);
    assert_eq!(position.size, 18.181);
    assert!((position.take_profit - 110.88).abs() < 1e-9);
    assert!((position.stop_loss - 107.8).abs() < 1e-9);
    assert!(exchange.position("BTCUSDT").is_some());

    exchange.push_candles("BTCUSDT", &[111.0]);
    control.run_cycle().await;

    let ledger = lock_ledger(&control.context().ledger);
    assert!(!ledger.has_active("BTCUSDT"));
    let closed = ledger.closed_positions().back().unwrap();
    assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
    assert!(closed.realized_pnl.unwrap() > 0.0);
    assert_eq!(ledger.committed_margin(), 0.0);
    drop(ledger);

    assert!(exchange.position("BTCUSDT").is_none());
    let orders = exchange.orders();
    assert_eq!(orders.len(), 2);
    assert!(orders[1].reduce_only);
}

#[test]
fn test_margin_ceiling_rejects_second_entry() {
    // 1000 total, 30% ceiling, 30% per trade at 10x
    let mut ledger = PositionLedger::new(settings(1000.0, 0.30));
    let risk = RiskManager::new(MarginFraction::Pct30, 10, 3);

    let first = risk
        .admit(
            &mut ledger,
            &entry_signal("BTCUSDT", SignalKind::LongEntry, 100.0),
            &symbol_config("BTCUSDT"),
            Utc::now(),
        )
        .unwrap();
    let Admission::Approved(intent) = first else {
        panic!("first entry should be approved");
    };
    assert_eq!(intent.size, 30.0);

    let second = risk
        .admit(
            &mut ledger,
            &entry_signal("ETHUSDT", SignalKind::LongEntry, 100.0),
            &symbol_config("ETHUSDT"),
            Utc::now(),
        )
        .unwrap();
    assert!(matches!(
        second,
        Admission::Rejected(RejectReason::MarginExceeded)
    ));
    assert_eq!(ledger.budget().committed, 300.0);
}

#[tokio::test]
async fn test_protective_levels_trigger_exits() {
    let h = harness(PaperExchange::new(1000.0), &["BTCUSDT"]);
    let position = h.open("BTCUSDT", SignalKind::LongEntry, 100.0).await;

    assert!((position.take_profit - 100.8).abs() < 1e-9);
    assert!((position.stop_loss - 98.0).abs() < 1e-9);

    let now = Utc::now();
    assert_eq!(
        check_exit(&position, 100.9, now, None),
        Some(ExitReason::TakeProfit)
    );
    assert_eq!(
        check_exit(&position, 98.0, now, None),
        Some(ExitReason::StopLoss)
    );
    assert_eq!(check_exit(&position, 99.5, now, None), None);

    h.exchange.set_price("BTCUSDT", 98.0);
    let trade = h
        .gateway
        .close("BTCUSDT", ExitReason::StopLoss, 98.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trade.reason, ExitReason::StopLoss);
    assert!(trade.pnl < 0.0);
}

#[tokio::test]
async fn test_concurrent_exits_submit_one_order() {
    let h = harness(
        PaperExchange::new(1000.0).with_order_latency(Duration::from_millis(50)),
        &["ETHUSDT"],
    );
    h.open("ETHUSDT", SignalKind::ShortEntry, 2000.0).await;

    let (first, second) = tokio::join!(
        h.gateway.close("ETHUSDT", ExitReason::TakeProfit, 1980.0),
        h.gateway.close("ETHUSDT", ExitReason::StopLoss, 1980.0),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(first.is_some() != second.is_some());
    // Entry plus exactly one exit
    assert_eq!(h.exchange.orders().len(), 2);
    assert_eq!(lock_ledger(&h.ledger).active_count(), 0);
}

#[tokio::test]
async fn test_rejected_entry_releases_margin() {
    let h = harness(PaperExchange::new(1000.0), &["SOLUSDT"]);
    h.exchange.set_price("SOLUSDT", 150.0);
    h.exchange
        .fail_next_order(BotError::rejection(-2019, "Margin is insufficient"));

    let Admission::Approved(intent) = h.admit("SOLUSDT", SignalKind::LongEntry, 150.0) else {
        panic!("entry should be approved");
    };
    assert!(lock_ledger(&h.ledger).committed_margin() > 0.0);

    let err = h.gateway.open(&intent).await.unwrap_err();
    assert!(matches!(err, BotError::ExchangeRejection { code: -2019, .. }));

    let ledger = lock_ledger(&h.ledger);
    assert_eq!(ledger.committed_margin(), 0.0);
    assert!(!ledger.has_active("SOLUSDT"));
    drop(ledger);

    // Rejections are not retried and need no cancel
    assert_eq!(h.exchange.order_attempts(), 1);
    assert!(h.exchange.cancels().is_empty());
    assert!(h
        .events
        .recent()
        .iter()
        .any(|e| e.message.contains("reservation released")));
}

#[tokio::test]
async fn test_transport_failure_is_retried_once_then_fills() {
    let h = harness(PaperExchange::new(1000.0), &["BTCUSDT"]);
    h.exchange
        .fail_next_order(BotError::Transport("connection reset".into()));

    let position = h.open("BTCUSDT", SignalKind::LongEntry, 100.0).await;

    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(h.exchange.order_attempts(), 2);
    assert_eq!(h.exchange.orders().len(), 1);
}

#[tokio::test]
async fn test_reconciliation_adopts_and_is_idempotent() {
    let h = harness(PaperExchange::new(1000.0), &["BTCUSDT", "ETHUSDT"]);
    h.exchange.open_external("ETHUSDT", -2.0, 50.0);
    let prices = HashMap::new();

    let report = assert_ok!(h.reconciler.reconcile(&prices).await);
    assert_eq!(report.corrections.len(), 1);

    let adopted = lock_ledger(&h.ledger).get("ETHUSDT").cloned().unwrap();
    assert!(adopted.external);
    assert_eq!(adopted.side, Side::Short);
    assert_eq!(adopted.size, 2.0);
    assert_eq!(adopted.margin, 10.0);
    assert!((adopted.take_profit - 49.6).abs() < 1e-9);
    assert!((adopted.stop_loss - 51.0).abs() < 1e-9);

    let again = assert_ok!(h.reconciler.reconcile(&prices).await);
    assert!(again.is_clean());
    assert_eq!(lock_ledger(&h.ledger).active_count(), 1);

    // Closed by hand on the exchange
    h.exchange.close_external("ETHUSDT");
    let prices = HashMap::from([("ETHUSDT".to_string(), 49.0)]);
    let report = assert_ok!(h.reconciler.reconcile(&prices).await);
    assert_eq!(report.corrections.len(), 1);

    let ledger = lock_ledger(&h.ledger);
    assert!(!ledger.has_active("ETHUSDT"));
    let closed = ledger.closed_positions().back().unwrap();
    assert_eq!(closed.exit_reason, Some(ExitReason::External));
    assert_eq!(closed.exit_price, Some(49.0));
}

#[tokio::test]
async fn test_adopted_position_blocks_new_entry_on_symbol() {
    let h = harness(PaperExchange::new(1000.0), &["BTCUSDT"]);
    h.exchange.open_external("BTCUSDT", 0.5, 100.0);
    assert_ok!(h.reconciler.reconcile(&HashMap::new()).await);

    let admission = h.admit("BTCUSDT", SignalKind::LongEntry, 100.0);
    assert!(matches!(
        admission,
        Admission::Rejected(RejectReason::SymbolAlreadyOpen)
    ));
}

#[test]
fn test_margin_ceiling_holds_under_random_activity() {
    let symbols = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT"];
    let fractions = [
        MarginFraction::Pct10,
        MarginFraction::Pct20,
        MarginFraction::Pct30,
        MarginFraction::Pct40,
        MarginFraction::Pct50,
    ];
    let mut rng = StdRng::seed_from_u64(7);
    let mut ledger = PositionLedger::new(settings(1000.0, 0.75));

    for _ in 0..500 {
        let symbol = symbols[rng.gen_range(0..symbols.len())];
        let price = rng.gen_range(1.0..5000.0);

        match rng.gen_range(0..4) {
            0 | 1 => {
                let risk = RiskManager::new(fractions[rng.gen_range(0..fractions.len())], 10, 3);
                let kind = if rng.gen_bool(0.5) {
                    SignalKind::LongEntry
                } else {
                    SignalKind::ShortEntry
                };
                let admission = risk
                    .admit(
                        &mut ledger,
                        &entry_signal(symbol, kind, price),
                        &symbol_config(symbol),
                        Utc::now(),
                    )
                    .unwrap();
                if let Admission::Approved(intent) = admission {
                    match rng.gen_range(0..10) {
                        0 => {
                            ledger.release(symbol, intent.position_id);
                        }
                        // Left PENDING until the expiry branch picks it up
                        1 | 2 => {}
                        _ => {
                            let ratio = rng.gen_range(0.1..=1.0);
                            ledger
                                .confirm_open(
                                    symbol,
                                    intent.position_id,
                                    &fill(intent.size * ratio, price),
                                )
                                .unwrap();
                        }
                    }
                }
            }
            2 => {
                if let Some(position) = ledger.begin_close(symbol, ExitReason::Manual) {
                    ledger
                        .confirm_closed(symbol, position.id, price, Utc::now())
                        .unwrap();
                }
            }
            _ => {
                let expired = ledger.expire_pending(Utc::now(), Duration::ZERO);
                assert!(expired.iter().all(|p| p.status == PositionStatus::Pending));
            }
        }

        let budget = ledger.budget();
        assert!(budget.committed <= budget.ceiling + 1e-6);
        assert!(ledger.active_count() <= 3);
        for position in ledger.active_positions() {
            assert!(position.take_profit > 0.0 && position.stop_loss > 0.0);
        }
    }
}

#[tokio::test]
async fn test_start_status_stop_lifecycle() {
    let exchange = Arc::new(PaperExchange::new(1000.0));
    exchange.push_candles("BTCUSDT", &[100.0; 10]);
    exchange.open_external("BTCUSDT", 1.0, 100.0);

    let handle = assert_ok!(Bot::start(config(&["BTCUSDT"]), exchange.clone()).await);

    // Startup reconciliation adopts the existing position
    let status = handle.status();
    assert!(status.running);
    assert_eq!(status.budget.active_positions, 1);
    assert!(status.symbols[0].position.as_ref().unwrap().external);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(handle.status().cycles >= 1);

    let last = handle.stop().await;
    assert!(!last.running);
    assert_eq!(last.budget.active_positions, 0);
    assert_eq!(last.performance.total_trades, 1);
    assert!(exchange.position("BTCUSDT").is_none());
}
