//! payout-runner: headless driver for the payout engine.
//!
//! Usage:
//!   payout-runner --seed 12345 --rounds 500 --db payouts.db
//!   payout-runner --db payouts.db --ipc-mode      (operator console on stdin)

use anyhow::Result;
use chrono::Utc;
use giftpay_core::{
    config::EngineConfig,
    dispatcher::{DispatchSummary, Dispatcher},
    ledger::{ManualResolution, ObligationStatus, PayoutLedger},
    outcome::{OutcomeResolver, OutcomeTable},
    rng::SimulatedOutcomeSource,
    settlement::RoundSettlement,
    statistics::StatisticsAggregator,
    store::PayoutStore,
    transport::{SimulatedTransport, SimulatedTransportConfig},
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Get {
        obligation_id: String,
    },
    ListStatus {
        status: ObligationStatus,
    },
    ListPlayer {
        player_id: String,
    },
    Events {
        obligation_id: String,
    },
    ResolveManual {
        obligation_id: String,
        resolution: ManualResolution,
        note: String,
    },
    Summary,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let rounds = parse_arg(&args, "--rounds", 500u64);
    let players = parse_arg(&args, "--players", 20usize);
    let failure_rate = parse_arg(&args, "--failure-rate", 0.1f64);
    let drain_secs = parse_arg(&args, "--drain-secs", 120u64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");

    let config = EngineConfig::load(data_dir)?;

    if !ipc_mode {
        println!("payout-runner");
        println!("  seed:      {seed}");
        println!("  rounds:    {rounds}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    // For :memory: use SQLite shared-memory URI so the ledger and the
    // statistics connection share the same in-memory database.
    let db_effective: String = if db == ":memory:" {
        format!("file:payouts_{}?mode=memory&cache=shared", Utc::now().timestamp())
    } else {
        db.to_string()
    };
    let store = PayoutStore::open(&db_effective)?;
    store.migrate()?;
    let mut stats_store = store.reopen()?;

    let table = Arc::new(OutcomeTable::from_config(&config.outcomes)?);
    let stats = Arc::new(StatisticsAggregator::with_counts(
        Arc::clone(&table),
        config.statistics.clone(),
        &stats_store.load_outcome_counts()?,
    ));
    let ledger = Arc::new(PayoutLedger::new(store, config.ledger.clone()));

    if ipc_mode {
        return run_ipc_loop(&ledger);
    }

    let transport = Arc::new(SimulatedTransport::new(SimulatedTransportConfig {
        seed,
        transient_failure_rate: failure_rate,
        ..SimulatedTransportConfig::default()
    }));
    let dispatcher = Dispatcher::new(
        Arc::clone(&ledger),
        Arc::clone(&transport),
        config.dispatch.clone(),
    )?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = dispatcher.spawn_workers(config.dispatch.workers, shutdown_rx);

    let settlement = RoundSettlement::new(
        OutcomeResolver::new(Arc::clone(&table), stats.clone()),
        Arc::clone(&ledger),
    );
    let run_id = format!("run-{seed}-{}", Utc::now().timestamp());
    let mut source = SimulatedOutcomeSource::new(
        seed,
        run_id.clone(),
        table.code_range(),
        table.stake_cost(),
        players,
    );
    let mut wins = 0u64;
    let mut staked = 0u64;
    let mut won = 0u64;
    for _ in 0..rounds {
        let settled = settlement.settle(&source.next_round())?;
        staked += settled.outcome.stake_amount;
        if settled.outcome.is_win {
            wins += 1;
            won += settled.outcome.payout;
        }
    }

    let deadline = Instant::now() + Duration::from_secs(drain_secs);
    while ledger.has_outstanding()? && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    // Receivers may already be gone if every worker exited.
    let _ = shutdown_tx.send(true);
    let mut totals = DispatchSummary::default();
    for worker in workers {
        totals.absorb(&worker.await?);
    }

    stats_store.save_outcome_counts(&stats.snapshot(), Utc::now())?;

    println!("=== RUN SUMMARY ===");
    println!("  run_id:           {run_id}");
    println!("  rounds:           {rounds}");
    println!("  wins:             {wins}");
    println!("  staked / won:     {staked} / {won}");
    println!("  theoretical RTP:  {}", fmt_rtp(stats.theoretical_rtp()));
    println!(
        "  empirical RTP:    {} ({} rounds observed)",
        fmt_rtp(stats.empirical_rtp()),
        stats.total_observed()
    );
    println!();
    println!("=== DISPATCH ===");
    println!("  claimed:          {}", totals.claimed);
    println!("  paid:             {}", totals.paid);
    println!("  retried:          {}", totals.retrying);
    println!("  escalated:        {}", totals.escalated);
    println!("  reclaimed:        {}", totals.reclaimed);
    println!("  released:         {}", totals.released);
    println!("  conflicts:        {}", totals.conflicts);
    println!("  gifts sent:       {}", transport.sent_count());
    println!("  account balance:  {}", transport.balance());
    println!();
    println!("=== LEDGER ===");
    for (status, count) in ledger.summary()? {
        println!("  {:<16}  {count}", status.as_str());
    }
    Ok(())
}

fn run_ipc_loop(ledger: &PayoutLedger) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        let reply = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Get { obligation_id } => {
                ledger.get(&obligation_id).map(|row| serde_json::json!(row))
            }
            IpcCommand::ListStatus { status } => {
                ledger.list_by_status(status).map(|rows| serde_json::json!(rows))
            }
            IpcCommand::ListPlayer { player_id } => {
                ledger.list_by_player(&player_id).map(|rows| serde_json::json!(rows))
            }
            IpcCommand::Events { obligation_id } => {
                ledger.events_for(&obligation_id).map(|rows| serde_json::json!(rows))
            }
            IpcCommand::ResolveManual { obligation_id, resolution, note } => ledger
                .resolve_manual(&obligation_id, resolution, &note)
                .map(|row| serde_json::json!(row)),
            IpcCommand::Summary => ledger.summary().map(|counts| {
                let by_name: serde_json::Map<String, serde_json::Value> = counts
                    .into_iter()
                    .map(|(status, n)| (status.as_str().to_string(), n.into()))
                    .collect();
                serde_json::Value::Object(by_name)
            }),
        };

        let out = reply.unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }));
        writeln!(stdout, "{}", out)?;
        stdout.flush()?;
    }
    Ok(())
}

fn fmt_rtp(rtp: Option<f64>) -> String {
    rtp.map_or_else(|| "unavailable".to_string(), |v| format!("{v:.2}%"))
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
