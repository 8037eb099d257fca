use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use trialwatch::{
    Clock, DispatchGate, EventLedger, FileLedgerStore, InMemoryLedgerStore, LedgerBook,
    LedgerStore, ManualClock, RecordStore, RecordingSink, SideEffectDispatcher, SubscriptionTier,
    TrialConfig, UserId, UserTrialRecord, derive,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "trial-tool")]
#[command(about = "Developer tooling for trial entitlement and the event ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the derived entitlement state of a record at a given instant
    Evaluate {
        #[arg(long, value_parser = parse_timestamp)]
        trial_start: Option<DateTime<Utc>>,
        /// Defaults to trial start plus the configured trial length
        #[arg(long, value_parser = parse_timestamp)]
        expires_at: Option<DateTime<Utc>>,
        /// Defaults to the current time
        #[arg(long, value_parser = parse_timestamp)]
        now: Option<DateTime<Utc>>,
        #[arg(long, default_value = "free")]
        tier: String,
        #[arg(long)]
        trial_used: bool,
        #[arg(long)]
        grace_used: bool,
    },
    /// Walk a fresh trial through time and print every side effect fired
    Simulate {
        #[arg(long, default_value_t = 10)]
        days: i64,
        #[arg(long, default_value_t = 24)]
        step_hours: i64,
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        user: Option<String>,
        /// Keep the ledger in this directory instead of in memory
        #[arg(long)]
        ledger_dir: Option<PathBuf>,
    },
    /// Inspect or remove a file-backed ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    Show {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
    },
    Clear {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TrialConfig::from_env().context("Invalid TRIAL_* configuration")?;

    match cli.command {
        Command::Evaluate {
            trial_start,
            expires_at,
            now,
            tier,
            trial_used,
            grace_used,
        } => {
            let record = UserTrialRecord {
                trial_start,
                trial_expires_at: expires_at
                    .or_else(|| trial_start.map(|start| start + config.trial_length())),
                trial_used,
                trial_grace_used: grace_used,
                subscription_tier: SubscriptionTier::parse(&tier),
            };
            evaluate(&config, &record, now.unwrap_or_else(Utc::now))
        }
        Command::Simulate {
            days,
            step_hours,
            start,
            user,
            ledger_dir,
        } => {
            let user_id = UserId::new(user.unwrap_or_else(|| Uuid::new_v4().to_string()));
            let store: Arc<dyn LedgerStore> = match ledger_dir {
                Some(dir) => Arc::new(FileLedgerStore::new(dir)),
                None => Arc::new(InMemoryLedgerStore::new()),
            };
            simulate(
                config,
                user_id,
                start.unwrap_or_else(Utc::now),
                days,
                step_hours,
                store,
            )
            .await
        }
        Command::Ledger { action } => match action {
            LedgerAction::Show { dir, user } => {
                let book = LedgerBook::new(Arc::new(FileLedgerStore::new(dir)), config);
                let ledger = book.load(&UserId::new(user)).await?;
                print_ledger(&ledger)
            }
            LedgerAction::Clear { dir, user } => {
                let book = LedgerBook::new(Arc::new(FileLedgerStore::new(dir)), config);
                book.clear(&UserId::new(user.clone())).await?;
                println!("Cleared ledger for user '{}'", user);
                Ok(())
            }
        },
    }
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {}", err))
}

fn evaluate(config: &TrialConfig, record: &UserTrialRecord, now: DateTime<Utc>) -> Result<()> {
    let state = derive(record, now, config);
    let output = json!({
        "now": now,
        "record": record,
        "state": state,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn simulate(
    config: TrialConfig,
    user_id: UserId,
    start: DateTime<Utc>,
    days: i64,
    step_hours: i64,
    ledger_store: Arc<dyn LedgerStore>,
) -> Result<()> {
    let end = simulation_end(start, days)?;
    let step = Duration::try_hours(step_hours)
        .filter(|step| *step > Duration::zero())
        .ok_or_else(|| anyhow!("--step-hours must be positive and in range"))?;

    let records = trialwatch::InMemoryRecordStore::new();
    records
        .put_record(
            &user_id,
            &UserTrialRecord::with_window(start, start + config.trial_length()),
        )
        .await?;

    let sink = RecordingSink::new();
    let dispatcher = SideEffectDispatcher::new(
        config,
        ledger_store,
        Arc::new(records.clone()),
        Arc::new(sink.clone()),
        Arc::new(sink.clone()),
    );
    let gate = DispatchGate::open();
    let clock = ManualClock::new(start);

    println!("Simulating trial for user '{}' starting {}", user_id, start);
    while clock.now() <= end {
        let now = clock.now();
        let record = records
            .get(&user_id)
            .await?
            .ok_or_else(|| anyhow!("record for '{}' disappeared", user_id))?;
        let outcome = dispatcher
            .run_cycle(&user_id, &record, now, &gate)
            .await
            .ok_or_else(|| anyhow!("dispatch gate closed"))?;

        println!(
            "{}  phase={:?} remaining={} access={} fired=[{}]",
            now.format("%Y-%m-%d %H:%M"),
            outcome.state.phase,
            outcome.state.trial_days_remaining,
            outcome.state.has_premium_access,
            sink.take()
                .iter()
                .map(|call| call.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if clock.now().checked_add_signed(step).is_none() {
            break;
        }
        clock.advance(step);
    }

    print_ledger(&dispatcher.ledger(&user_id).await)
}

fn simulation_end(start: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|span| start.checked_add_signed(span))
        .ok_or_else(|| anyhow!("--days {} is out of range", days))
}

fn print_ledger(ledger: &EventLedger) -> Result<()> {
    let output = json!({
        "trial_start_timestamp": ledger.trial_start_timestamp(),
        "flags": ledger.set_flags(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
