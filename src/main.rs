use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mail_outbox::config::{Settings, spool_dir_from_env};
use mail_outbox::dispatch::{Dispatcher, LEDGER_FILE_NAME};
use mail_outbox::ledger::{Ledger, LedgerTotals};
use mail_outbox::lock::ExclusionLock;
use mail_outbox::outbox::Outbox;
use mail_outbox::spool::Spool;
use mail_outbox::transport::PickupDirTransport;
use mail_outbox::types::{ProgramId, Stage};

/// Durable outbox: spool work locally, deliver it in batches.
#[derive(Parser)]
#[command(name = "mail-outbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Spool directory (overrides MAIL_OUTBOX_SPOOL_DIR).
    #[arg(long, global = true)]
    spool_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain the spool until it has been idle, then exit.
    Run,
    /// Record one program execution and wait for it to be dispatched.
    Enqueue {
        /// Program the execution belongs to.
        #[arg(long)]
        program: String,
    },
    /// Show stage counts, ledger totals and the lock holder.
    Status,
    /// Remove completed remote calls older than the grace period.
    Prune {
        #[arg(long, default_value_t = 7 * 24 * 3600)]
        grace_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mail_outbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let spool_dir = cli.spool_dir.unwrap_or_else(spool_dir_from_env);

    match cli.command {
        Command::Run => run(spool_dir).await,
        Command::Enqueue { program } => enqueue(spool_dir, ProgramId::new(program)).await,
        Command::Status => status(spool_dir),
        Command::Prune { grace_secs } => prune(spool_dir, Duration::from_secs(grace_secs)),
    }
}

fn load_settings(spool_dir: PathBuf) -> Result<Settings> {
    let mut settings = Settings::from_env().context("Failed to load settings")?;
    settings.spool_dir = spool_dir;
    Ok(settings)
}

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, stopping");
        cancel.cancel();
    });
}

async fn run(spool_dir: PathBuf) -> Result<()> {
    let settings = load_settings(spool_dir)?;
    let spool = Spool::open(&settings.spool_dir)
        .with_context(|| format!("Failed to open spool {}", settings.spool_dir.display()))?;
    let transport = PickupDirTransport::from_settings(&settings.transport);
    let dispatcher = Dispatcher::new(spool, transport, settings.dispatcher);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = dispatcher.run(cancel).await.context("Dispatcher failed")?;
    println!(
        "exit: {}, batches sent: {}, entries sent: {}, recovered: {}, rejected: {}, send failures: {}",
        summary.exit,
        summary.batches_sent,
        summary.entries_sent,
        summary.entries_recovered,
        summary.entries_rejected,
        summary.send_failures,
    );
    if summary.left_pending {
        println!("entries remain pending; the transport was still failing");
    }
    Ok(())
}

async fn enqueue(spool_dir: PathBuf, program: ProgramId) -> Result<()> {
    let settings = load_settings(spool_dir)?;
    let outbox = Outbox::from_settings(&settings).context("Failed to open outbox")?;

    let id = outbox
        .create_execution(&program)
        .await
        .context("Failed to spool execution")?;
    println!("{id}");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    while outbox.is_dispatcher_running().await {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
    outbox.shutdown().await;

    if let Some(summary) = outbox.last_run() {
        info!(exit = %summary.exit, entries_sent = summary.entries_sent, "Dispatcher finished");
    }
    Ok(())
}

fn status(spool_dir: PathBuf) -> Result<()> {
    let spool = Spool::open(&spool_dir)
        .with_context(|| format!("Failed to open spool {}", spool_dir.display()))?;

    println!("spool: {}", spool_dir.display());
    for stage in Stage::ALL {
        let count = spool
            .count(stage)
            .with_context(|| format!("Failed to count {stage}"))?;
        println!("  {stage:<18} {count}");
    }

    let records = Ledger::scan(spool_dir.join(LEDGER_FILE_NAME)).context("Failed to read ledger")?;
    let mut totals = LedgerTotals::default();
    for record in &records {
        totals.add(record.outcome);
    }
    println!("ledger: {} sent, {} failed", totals.sent, totals.failed);

    if ExclusionLock::is_held(&spool_dir).context("Failed to probe lock")? {
        match ExclusionLock::read_holder(&spool_dir).context("Failed to read lock holder")? {
            Some(holder) => println!(
                "dispatcher: running (pid {}, since {})",
                holder.pid, holder.acquired_at
            ),
            None => println!("dispatcher: running"),
        }
    } else {
        println!("dispatcher: not running");
    }
    Ok(())
}

fn prune(spool_dir: PathBuf, grace: Duration) -> Result<()> {
    let spool = Spool::open(&spool_dir)
        .with_context(|| format!("Failed to open spool {}", spool_dir.display()))?;
    let removed = spool.prune_done(grace).context("Failed to prune")?;
    println!("pruned {removed} completed remote calls");
    Ok(())
}
