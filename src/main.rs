use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use base_reconciler::{
    open_database, result_status_counts, reset_result_table, setup_database, EngineConfig,
    ReconciliationMatcher, ReversalMatcher, RunOutcome,
};

const USAGE: &str = "Usage:
  base-reconciler init <db>
  base-reconciler reversal <db> <reversal_config_id>
  base-reconciler reconcile <db> <config_id> <job_id> [--reset]
  base-reconciler summary <db> <job_id>";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = EngineConfig::from_env();

    match args.first().map(String::as_str) {
        Some("init") => run_init(&args, &config),
        Some("reversal") => run_reversal(&args, &config),
        Some("reconcile") => run_reconcile(&args, &config),
        Some("summary") => run_summary(&args, &config),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn open(path: &str, config: &EngineConfig) -> Result<Connection> {
    let conn = open_database(Path::new(path), config)
        .with_context(|| format!("failed to open database {}", path))?;
    setup_database(&conn).context("failed to create catalogue tables")?;
    Ok(conn)
}

fn arg_i64(args: &[String], index: usize, name: &str) -> Result<i64> {
    let raw = match args.get(index) {
        Some(raw) => raw,
        None => bail!("missing <{}>\n{}", name, USAGE),
    };
    raw.parse::<i64>()
        .with_context(|| format!("<{}> must be an integer, got '{}'", name, raw))
}

fn arg_db(args: &[String]) -> Result<&str> {
    match args.get(1) {
        Some(db) => Ok(db.as_str()),
        None => bail!("missing <db>\n{}", USAGE),
    }
}

fn run_init(args: &[String], config: &EngineConfig) -> Result<()> {
    let db = arg_db(args)?;
    open(db, config)?;
    println!("✓ Catalogue ready in {}", db);
    Ok(())
}

fn run_reversal(args: &[String], config: &EngineConfig) -> Result<()> {
    let mut conn = open(arg_db(args)?, config)?;
    let config_id = arg_i64(args, 2, "reversal_config_id")?;

    let outcome = ReversalMatcher::new(config.clone())
        .run(&mut conn, config_id)
        .with_context(|| format!("reversal {} failed", config_id))?;

    match outcome {
        RunOutcome::Completed(report) => println!("✅ {}", report.summary()),
        RunOutcome::Skipped { reason } => println!("⚠️  Reversal {} skipped: {}", config_id, reason),
    }
    Ok(())
}

fn run_reconcile(args: &[String], config: &EngineConfig) -> Result<()> {
    let mut conn = open(arg_db(args)?, config)?;
    let config_id = arg_i64(args, 2, "config_id")?;
    let job_id = arg_i64(args, 3, "job_id")?;

    if args.iter().any(|a| a == "--reset") {
        reset_result_table(&conn, job_id)?;
        info!(job_id, "result table reset");
    }

    let outcome = ReconciliationMatcher::new(config.clone())
        .run(&mut conn, config_id, job_id)
        .with_context(|| format!("reconciliation {} (job {}) failed", config_id, job_id))?;

    match outcome {
        RunOutcome::Completed(report) => {
            println!("✅ {}", report.summary());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        RunOutcome::Skipped { reason } => {
            println!("⚠️  Reconciliation {} skipped: {}", config_id, reason)
        }
    }
    Ok(())
}

fn run_summary(args: &[String], config: &EngineConfig) -> Result<()> {
    let conn = open(arg_db(args)?, config)?;
    let job_id = arg_i64(args, 2, "job_id")?;

    let counts = result_status_counts(&conn, job_id)
        .with_context(|| format!("no results for job {}", job_id))?;

    println!("📊 Job {}", job_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (status, count) in &counts {
        println!("{:<30} {:>10}", status, count);
    }
    println!("{:<30} {:>10}", "TOTAL", counts.values().sum::<i64>());
    Ok(())
}
