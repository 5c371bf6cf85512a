use chainsync::{Config, HttpExecutor, OfflineStore, RetryScheduler};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chainsync")]
#[command(about = "Offline-first chain cache and durable write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chainsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show sync status, connectivity and pending writes
  Status,
  /// Check that the reachability endpoint answers
  Probe,
  /// Inspect or edit the chain cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Inspect or edit the write queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Run one drain pass against the configured executor
  Drain,
  /// Run the retry scheduler until interrupted
  Run,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Cache a JSON payload under a key
  Put { key: String, payload: String },
  Get { key: String },
  List,
  Rm { key: String },
  Clear,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue an action with JSON arguments
  Add { action: String, args: Vec<String> },
  List,
  Rm { id: String },
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_stderr)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let store = Arc::new(OfflineStore::open(&config)?);

  match args.command {
    Command::Status => {
      store.refresh_connectivity().await;
      print_json(&store.snapshot())?;
    }
    Command::Probe => {
      let reachable = store.refresh_connectivity().await;
      println!("{}", if reachable { "reachable" } else { "unreachable" });
    }
    Command::Cache(cmd) => run_cache_command(&store, cmd)?,
    Command::Queue(cmd) => run_queue_command(&store, cmd)?,
    Command::Drain => {
      let executor = http_executor(&config)?;
      store.refresh_connectivity().await;
      let report = store.process_queue(&executor).await;
      println!(
        "attempted={} succeeded={} retried={} dropped={}{}",
        report.attempted,
        report.succeeded,
        report.retried,
        report.dropped,
        report
          .skipped
          .map(|r| format!(" skipped={:?}", r))
          .unwrap_or_default()
      );
      print_json(&store.snapshot())?;
    }
    Command::Run => run_scheduler(store, &config).await?,
  }

  Ok(())
}

fn run_cache_command(store: &OfflineStore, cmd: CacheCommand) -> Result<()> {
  match cmd {
    CacheCommand::Put { key, payload } => {
      store.cache_chain(&key, parse_json(&payload)?);
    }
    CacheCommand::Get { key } => match store.get_cached_chain(&key) {
      Some(entry) => print_json(&entry)?,
      None => return Err(eyre!("No cached chain for key {}", key)),
    },
    CacheCommand::List => {
      let mut entries = store.get_all_cached_chains();
      entries.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
      for entry in entries {
        println!("{}\t{}", entry.cached_at.to_rfc3339(), entry.key);
      }
    }
    CacheCommand::Rm { key } => store.remove_cached_chain(&key),
    CacheCommand::Clear => store.clear_cache(),
  }
  Ok(())
}

fn run_queue_command(store: &OfflineStore, cmd: QueueCommand) -> Result<()> {
  match cmd {
    QueueCommand::Add { action, args } => {
      let args = args
        .iter()
        .map(|a| parse_json(a))
        .collect::<Result<Vec<Value>>>()?;
      println!("{}", store.enqueue_write(&action, args));
    }
    QueueCommand::List => print_json(&store.queued_writes())?,
    QueueCommand::Rm { id } => {
      if !store.remove_from_queue(&id) {
        return Err(eyre!("No queued write with id {}", id));
      }
    }
    QueueCommand::Clear => store.clear_queue(),
  }
  Ok(())
}

async fn run_scheduler(store: Arc<OfflineStore>, config: &Config) -> Result<()> {
  let executor = Arc::new(http_executor(config)?);
  store.refresh_connectivity().await;

  let scheduler =
    RetryScheduler::new(store.clone(), config.queue.retry_interval()).with_reachability_probe(true);
  scheduler.start(executor.clone());

  // Don't make a reconnected backlog wait a full period
  scheduler.tick(executor.as_ref()).await;

  let mut status = store.subscribe();
  let initial = status.borrow_and_update().clone();
  print_json(&initial)?;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let snapshot = status.borrow_and_update().clone();
        print_json(&snapshot)?;
      }
    }
  }

  eprintln!("Stopping, waiting for the current drain pass to finish...");
  scheduler.stop().await;
  Ok(())
}

fn http_executor(config: &Config) -> Result<HttpExecutor> {
  HttpExecutor::new(config.executor.endpoint()?, Config::get_api_token())
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

/// Log to a daily file under the data directory, or to stderr.
fn init_logging(log_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chainsync=info"));

  if log_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("chainsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "chainsync.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
