use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use estisync::{Config, HttpTransport, MutationId, SqliteStore, SyncContext, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "estisync")]
#[command(about = "Inspect and drain the offline mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/estisync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queue counts
  Status,
  /// List mutations that need attention
  Failed,
  /// Send every pending mutation now
  Flush,
  /// Give a failed mutation a fresh set of attempts, then flush
  Retry { id: MutationId },
  /// Drop a queued mutation without sending it
  Discard { id: MutationId },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config)?;

  let store = Arc::new(SqliteStore::open(config.database_path.as_deref())?);
  let transport = Arc::new(HttpTransport::new(&config)?);
  let online = match transport.ping().await {
    Ok(()) => true,
    Err(e) => {
      warn!(error = %e, "Backend unreachable, starting offline");
      false
    }
  };

  // Only commands that send may start a replay.
  let sends = matches!(args.command, Command::Flush | Command::Retry { .. });
  let ctx = SyncContext::builder(transport)
    .config(config.sync.clone())
    .store(store)
    .online(online && sends)
    .build()?;

  if let Some(e) = ctx.queue_recovered_from() {
    println!("warning: {}; the queue was reset", e);
  }

  match args.command {
    Command::Status => print_status(&ctx, online),
    Command::Failed => print_failed(&ctx),
    Command::Flush => flush(&ctx).await?,
    Command::Retry { id } => {
      ctx.retry_failed(id).map_err(|e| eyre!("Failed to retry {}: {}", id, e))?;
      flush(&ctx).await?;
    }
    Command::Discard { id } => {
      ctx.discard(id).map_err(|e| eyre!("Failed to discard {}: {}", id, e))?;
      println!("discarded {}", id);
    }
  }

  ctx.shutdown();
  Ok(())
}

fn init_logging(config: &Config) -> Result<WorkerGuard> {
  let directory = match &config.log.directory {
    Some(dir) => dir.clone(),
    None => log_directory(config.database_path.as_deref())?,
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "estisync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false)
    .with_writer(writer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn log_directory(database_path: Option<&Path>) -> Result<PathBuf> {
  let db = match database_path {
    Some(p) => p.to_path_buf(),
    None => SqliteStore::default_path()?,
  };
  Ok(
    db.parent()
      .map(|p| p.join("logs"))
      .unwrap_or_else(|| PathBuf::from("logs")),
  )
}

fn print_status(ctx: &SyncContext, online: bool) {
  let failed = ctx.failed_mutations().len();
  println!("connectivity: {}", if online { "online" } else { "offline" });
  println!("pending:      {}", ctx.pending_count());
  println!("failed:       {}", failed);
}

fn print_failed(ctx: &SyncContext) {
  let failed = ctx.failed_mutations();
  if failed.is_empty() {
    println!("no failed mutations");
    return;
  }

  for entry in failed {
    let reason = entry
      .last_error
      .as_ref()
      .map(|e| e.to_string())
      .unwrap_or_default();
    println!(
      "{}  {:<20} {:<8} attempts={}  {}",
      entry.mutation.id,
      entry.mutation.collection,
      format!("{:?}", entry.mutation.operation).to_lowercase(),
      entry.attempts,
      reason
    );
  }
}

async fn flush(ctx: &SyncContext) -> Result<()> {
  if !ctx.is_online() {
    return Err(eyre!(
      "Backend unreachable; {} mutations stay queued",
      ctx.pending_count()
    ));
  }

  let report = ctx.flush().await;
  info!(?report, "Manual flush finished");
  println!(
    "committed {}, failed {}, deferred {}",
    report.committed, report.failed, report.deferred
  );
  Ok(())
}
