//! Disbursement dispatcher tests.
//!
//! A scripted transport stands in for the chat platform so each test
//! decides exactly what every send returns.

use giftpay_core::config::{DispatchConfig, LedgerConfig};
use giftpay_core::transport::{DisbursementTransport, TransportError, TransportReceipt};
use giftpay_core::{Dispatcher, NewObligation, ObligationStatus, PayoutLedger};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Replays scripted results in order, then succeeds with `tx-N`.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    sends: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedTransport {
    fn with_script(script: Vec<Result<(), TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    fn sends_per_player(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for player in self.sends.lock().unwrap().iter() {
            *counts.entry(player.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl DisbursementTransport for ScriptedTransport {
    async fn send(&self, player_id: &str, _amount: u64) -> Result<TransportReceipt, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = {
            let mut sends = self.sends.lock().unwrap();
            sends.push(player_id.to_string());
            sends.len()
        };
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Err(e)) => Err(e),
            _ => Ok(TransportReceipt { reference: format!("tx-{n}") }),
        }
    }
}

fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        poll_interval_ms: 10,
        batch_limit: 10,
        parallelism: 4,
        workers: 2,
        rate_per_second: 1_000,
        burst: 100,
        send_timeout_ms: 1_000,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
    }
}

fn build(transport: ScriptedTransport) -> (Arc<PayoutLedger>, Arc<ScriptedTransport>, Dispatcher<ScriptedTransport>) {
    build_with(LedgerConfig::default(), dispatch_config(), transport)
}

fn build_with(
    ledger_config: LedgerConfig,
    config: DispatchConfig,
    transport: ScriptedTransport,
) -> (Arc<PayoutLedger>, Arc<ScriptedTransport>, Dispatcher<ScriptedTransport>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ledger = Arc::new(PayoutLedger::in_memory(ledger_config).expect("ledger"));
    let transport = Arc::new(transport);
    let dispatcher = Dispatcher::new(Arc::clone(&ledger), Arc::clone(&transport), config)
        .expect("dispatcher");
    (ledger, transport, dispatcher)
}

fn delayed(ms: u64) -> ScriptedTransport {
    ScriptedTransport {
        delay: Duration::from_millis(ms),
        ..ScriptedTransport::default()
    }
}

/// Run passes until nothing is left to dispatch or the deadline passes.
async fn drain(dispatcher: Dispatcher<ScriptedTransport>, ledger: Arc<PayoutLedger>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while ledger.has_outstanding().unwrap() && Instant::now() < deadline {
        if dispatcher.run_once().await.unwrap().claimed == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

fn unavailable() -> Result<(), TransportError> {
    Err(TransportError::Unavailable("platform returned 502".into()))
}

/// A jackpot win paid on the first try.
#[tokio::test]
async fn pays_pending_obligation() {
    let (ledger, transport, dispatcher) = build(ScriptedTransport::default());
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.paid, 1);

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Paid);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.transport_reference.as_deref(), Some("tx-1"));
    assert_eq!(transport.send_count(), 1);

    let idle = dispatcher.run_once().await.unwrap();
    assert_eq!(idle.claimed, 0);
    assert_eq!(transport.send_count(), 1);
}

/// Three transient failures with a budget of three end in manual review.
#[tokio::test]
async fn transient_failures_exhaust_into_manual_review() {
    let (ledger, transport, dispatcher) =
        build(ScriptedTransport::with_script(vec![unavailable(), unavailable(), unavailable()]));
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    let first = dispatcher.run_once().await.unwrap();
    assert_eq!(first.retrying, 1);
    assert_eq!(ledger.get(&ob.obligation_id).unwrap().status, ObligationStatus::Failed);

    dispatcher.run_once().await.unwrap();
    let last = dispatcher.run_once().await.unwrap();
    assert_eq!(last.escalated, 1);

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::ManualReview);
    assert_eq!(row.attempts, 3);
    assert!(row.last_error.as_deref().unwrap().contains("502"));
    assert_eq!(transport.send_count(), 3);

    assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let (ledger, _, dispatcher) = build(ScriptedTransport::with_script(vec![unavailable()]));
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    dispatcher.run_once().await.unwrap();
    dispatcher.run_once().await.unwrap();

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Paid);
    assert_eq!(row.attempts, 2);
    assert_eq!(row.transport_reference.as_deref(), Some("tx-2"));
}

#[tokio::test]
async fn permanent_failure_goes_straight_to_manual_review() {
    let (ledger, transport, dispatcher) = build(ScriptedTransport::with_script(vec![Err(
        TransportError::RecipientBlocked { player_id: "42".into() },
    )]));
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.escalated, 1);

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::ManualReview);
    assert_eq!(row.attempts, 1);
    assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);
    assert_eq!(transport.send_count(), 1);
}

/// A send that outlives the timeout counts as a transient failure.
#[tokio::test]
async fn slow_send_times_out_as_transient() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ledger = Arc::new(PayoutLedger::in_memory(LedgerConfig::default()).unwrap());
    let transport = Arc::new(ScriptedTransport {
        delay: Duration::from_millis(500),
        ..ScriptedTransport::default()
    });
    let config = DispatchConfig {
        send_timeout_ms: 20,
        ..dispatch_config()
    };
    let dispatcher = Dispatcher::new(Arc::clone(&ledger), transport, config).unwrap();
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.retrying, 1);

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Failed);
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.as_deref().unwrap().contains("timed out"));
}

/// Backoff keeps a failed row out of the next pass.
#[tokio::test]
async fn backoff_defers_retry() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ledger = Arc::new(PayoutLedger::in_memory(LedgerConfig::default()).unwrap());
    let transport = Arc::new(ScriptedTransport::with_script(vec![unavailable()]));
    let config = DispatchConfig {
        base_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        ..dispatch_config()
    };
    let dispatcher = Dispatcher::new(Arc::clone(&ledger), Arc::clone(&transport), config).unwrap();
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    dispatcher.run_once().await.unwrap();
    assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);

    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Failed);
    assert!(row.next_attempt_at.unwrap() > row.created_at);
    assert_eq!(transport.send_count(), 1);
}

/// Workers started before any win pick up new obligations and stop on
/// the shutdown signal.
#[tokio::test]
async fn workers_drain_and_stop_on_shutdown() {
    let (ledger, transport, dispatcher) = build(ScriptedTransport::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = dispatcher.spawn_workers(2, shutdown_rx);

    for i in 0..6 {
        ledger.enqueue(NewObligation::new(format!("p{i}"), 10, "lemon-lemon-lemon")).unwrap();
    }

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.has_outstanding().unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "obligations were not drained");

    shutdown_tx.send(true).unwrap();
    let mut paid = 0;
    for worker in workers {
        paid += tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .unwrap()
            .paid;
    }
    assert_eq!(paid, 6);
    assert_eq!(ledger.list_by_status(ObligationStatus::Paid).unwrap().len(), 6);
    assert_eq!(transport.send_count(), 6);
}

/// Two workers racing over the same rows never pay one twice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_pay_each_obligation_once() {
    let transport = ScriptedTransport {
        delay: Duration::from_millis(5),
        ..ScriptedTransport::default()
    };
    let (ledger, transport, dispatcher) = build(transport);
    for i in 0..20 {
        ledger.enqueue(NewObligation::new(format!("p{i}"), 10, "x")).unwrap();
    }

    let a = dispatcher.worker(1);
    let b = dispatcher.worker(2);
    let (ra, rb) = tokio::join!(
        async move {
            let mut total = 0;
            for _ in 0..5 {
                total += a.run_once().await.unwrap().paid;
            }
            total
        },
        async move {
            let mut total = 0;
            for _ in 0..5 {
                total += b.run_once().await.unwrap().paid;
            }
            total
        }
    );

    assert_eq!(ra + rb, 20);
    let per_player = transport.sends_per_player();
    assert_eq!(per_player.len(), 20);
    assert!(per_player.values().all(|&n| n == 1), "{per_player:?}");
}

#[test]
fn zero_parallelism_is_rejected() {
    let ledger = Arc::new(PayoutLedger::in_memory(LedgerConfig::default()).unwrap());
    let config = DispatchConfig {
        parallelism: 0,
        ..dispatch_config()
    };
    assert!(Dispatcher::new(ledger, Arc::new(ScriptedTransport::default()), config).is_err());
}

#[test]
fn stale_window_must_outlast_send_timeout() {
    let ledger = Arc::new(
        PayoutLedger::in_memory(LedgerConfig { max_attempts: 3, claim_stale_after_ms: 1_000 })
            .unwrap(),
    );
    let config = DispatchConfig {
        send_timeout_ms: 1_000,
        ..dispatch_config()
    };
    assert!(Dispatcher::new(ledger, Arc::new(ScriptedTransport::default()), config).is_err());
}

/// A pass never claims more rows than it has send slots for.
#[tokio::test]
async fn pass_claims_at_most_parallelism_rows() {
    let config = DispatchConfig {
        parallelism: 2,
        ..dispatch_config()
    };
    let (ledger, _, dispatcher) = build_with(LedgerConfig::default(), config, ScriptedTransport::default());
    for i in 0..5 {
        ledger.enqueue(NewObligation::new(format!("p{i}"), 10, "x")).unwrap();
    }
    assert_eq!(dispatcher.claim_limit(), 2);
    let pass = dispatcher.run_once().await.unwrap();
    assert_eq!(pass.claimed, 2);
    assert_eq!(pass.paid, 2);
    assert_eq!(ledger.list_by_status(ObligationStatus::Pending).unwrap().len(), 3);
}

/// With a short stale window and one send slot per worker, a second
/// worker starting mid-run must not reclaim and resend rows the first
/// worker still owns.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_stale_window_never_pays_twice() {
    let ledger_config = LedgerConfig {
        max_attempts: 3,
        claim_stale_after_ms: 100,
    };
    let config = DispatchConfig {
        batch_limit: 10,
        parallelism: 1,
        send_timeout_ms: 50,
        ..dispatch_config()
    };
    let (ledger, transport, dispatcher) = build_with(ledger_config, config, delayed(40));
    for i in 0..10 {
        ledger.enqueue(NewObligation::new(format!("p{i}"), 10, "x")).unwrap();
    }

    let first = tokio::spawn(drain(dispatcher.worker(1), Arc::clone(&ledger)));
    let second = {
        let worker = dispatcher.worker(2);
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drain(worker, ledger).await;
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    let per_player = transport.sends_per_player();
    assert!(per_player.values().all(|&n| n == 1), "duplicate gifts: {per_player:?}");
    let paid = ledger.list_by_status(ObligationStatus::Paid).unwrap().len();
    assert_eq!(paid, transport.send_count());
}

/// A claim that waited on the rate limiter past its safe send window is
/// released unsent instead of racing a reclaim.
#[tokio::test]
async fn claim_aged_by_rate_limit_is_released_unsent() {
    let ledger_config = LedgerConfig {
        max_attempts: 3,
        claim_stale_after_ms: 1_000,
    };
    let config = DispatchConfig {
        rate_per_second: 1,
        burst: 1,
        send_timeout_ms: 500,
        ..dispatch_config()
    };
    let (ledger, transport, dispatcher) =
        build_with(ledger_config, config, ScriptedTransport::default());
    let ob = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();

    // Spend the only token so the send waits about a second.
    let _ = dispatcher.limiter().check();
    let pass = dispatcher.run_once().await.unwrap();

    assert_eq!(pass.released, 1);
    assert_eq!(pass.paid, 0);
    assert_eq!(transport.send_count(), 0);
    let row = ledger.get(&ob.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Pending);
    assert_eq!(row.attempts, 0);
}

/// Shutdown stops new claims but lets the send in flight finish.
#[tokio::test]
async fn shutdown_lets_inflight_send_finish() {
    let (ledger, transport, dispatcher) = build(delayed(300));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = dispatcher.spawn_workers(1, shutdown_rx);

    let inflight = ledger.enqueue(NewObligation::new("42", 100, "777")).unwrap();
    let claimed = tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.list_by_status(ObligationStatus::Processing).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(claimed.is_ok(), "obligation was never claimed");

    shutdown_tx.send(true).unwrap();
    let late = ledger.enqueue(NewObligation::new("43", 20, "grape-grape-grape")).unwrap();

    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .unwrap();
    }

    let row = ledger.get(&inflight.obligation_id).unwrap();
    assert_eq!(row.status, ObligationStatus::Paid);
    assert_eq!(ledger.get(&late.obligation_id).unwrap().status, ObligationStatus::Pending);
    assert_eq!(transport.send_count(), 1);
}

/// One limiter paces sends across workers: six sends at 5/s with a
/// burst of one take at least a second.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_is_shared_across_workers() {
    let config = DispatchConfig {
        rate_per_second: 5,
        burst: 1,
        ..dispatch_config()
    };
    let (ledger, transport, dispatcher) = build_with(LedgerConfig::default(), config, ScriptedTransport::default());
    for i in 0..6 {
        ledger.enqueue(NewObligation::new(format!("p{i}"), 10, "x")).unwrap();
    }

    let a = dispatcher.worker(1);
    let b = dispatcher.worker(2);
    assert!(Arc::ptr_eq(a.limiter(), b.limiter()));

    let started = Instant::now();
    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let elapsed = started.elapsed();

    assert_eq!(ra.unwrap().paid + rb.unwrap().paid, 6);
    assert_eq!(transport.send_count(), 6);
    assert!(elapsed >= Duration::from_millis(900), "six sends took only {elapsed:?}");
}
