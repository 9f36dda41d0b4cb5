use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use steadfast::config::{data_dir, Config};
use steadfast::outbox::{
  discard_record, recover_records, retry_record, OfflineMutationRecord, OutboxStore,
  SqliteOutboxStore, SyncStatus,
};
use steadfast::query::{Direction, FilterOp, QueryDescriptor};
use steadfast::DataClient;

#[derive(Parser, Debug)]
#[command(name = "steadfast")]
#[command(about = "Resilient queries and offline writes against a REST backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/steadfast/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect and manage writes queued while offline
  Outbox {
    #[command(subcommand)]
    action: OutboxCommand,
  },
  /// Replay queued writes once
  Sync,
  /// Run a query and print the rows as JSON
  Query {
    collection: String,
    /// Comma-separated fields to select
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,
    /// field=op:value, may be repeated
    #[arg(long = "filter")]
    filters: Vec<String>,
    /// field[:asc|desc]
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long, default_value_t = 0)]
    offset: u64,
  },
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
  /// List queued records
  List {
    /// Only records that ran out of sync attempts
    #[arg(long)]
    failed: bool,
  },
  /// Print one record
  Show { id: String },
  /// Requeue a failed record
  Retry { id: String },
  /// Delete a record without syncing it
  Discard { id: String },
  /// Reset records a crashed sync left in progress
  ///
  /// Only run this while nothing else is syncing the same outbox.
  Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_stderr)?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Outbox { action } => run_outbox(&config, action),
    Command::Sync => {
      let client = DataClient::new(&config)?;
      let report = client.sync().await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Query {
      collection,
      select,
      filters,
      order,
      limit,
      offset,
    } => {
      let mut query = QueryDescriptor::new(collection).select(select);
      for filter in &filters {
        let (field, op, value) = parse_filter(filter)?;
        query = query.filter(field, op, value);
      }
      if let Some(order) = &order {
        let (field, direction) = parse_order(order)?;
        query = query.order_by(field, direction);
      }
      if let Some(limit) = limit {
        query = query.page(offset, limit);
      }

      let client = DataClient::new(&config)?;
      let rows = client.query(&query).await?;
      println!("{}", serde_json::to_string_pretty(&rows)?);
      Ok(())
    }
  }
}

fn run_outbox(config: &Config, action: OutboxCommand) -> Result<()> {
  match action {
    OutboxCommand::List { failed } => {
      let store = SqliteOutboxStore::open(&config.outbox.store_path()?)?;
      let records: Vec<OfflineMutationRecord> = store
        .list()?
        .into_iter()
        .filter(|r| !failed || r.sync_status == SyncStatus::Failed)
        .collect();
      print_table(&records);
      Ok(())
    }
    OutboxCommand::Show { id } => {
      let store = SqliteOutboxStore::open(&config.outbox.store_path()?)?;
      let record = store
        .get(&id)?
        .ok_or_else(|| eyre!("No outbox record with id {}", id))?;
      println!("{}", serde_json::to_string_pretty(&record)?);
      Ok(())
    }
    OutboxCommand::Retry { id } => {
      let store = SqliteOutboxStore::open(&config.outbox.store_path()?)?;
      let record = retry_record(&store, &id)?;
      println!("{} requeued ({})", record.provisional_id, record.sync_status);
      Ok(())
    }
    OutboxCommand::Discard { id } => {
      let store = SqliteOutboxStore::open(&config.outbox.store_path()?)?;
      discard_record(&store, &id)?;
      println!("{} discarded", id);
      Ok(())
    }
    OutboxCommand::Recover => {
      let store = SqliteOutboxStore::open(&config.outbox.store_path()?)?;
      let reset = recover_records(&store)?;
      println!("{} interrupted records requeued", reset);
      Ok(())
    }
  }
}

fn print_table(records: &[OfflineMutationRecord]) {
  if records.is_empty() {
    println!("outbox is empty");
    return;
  }

  println!(
    "{:<44} {:<16} {:<7} {:<9} {:>8}  {:<20} LAST ERROR",
    "ID", "TYPE", "ACTION", "STATUS", "ATTEMPTS", "CREATED"
  );
  for r in records {
    println!(
      "{:<44} {:<16} {:<7} {:<9} {:>8}  {:<20} {}",
      r.provisional_id,
      r.entity_type,
      r.action.as_str(),
      r.sync_status.as_str(),
      r.attempts,
      r.created_at.format("%Y-%m-%d %H:%M:%S"),
      r.last_error.as_deref().unwrap_or("-")
    );
  }
}

/// Parse `field=op:value`.
fn parse_filter(s: &str) -> Result<(String, FilterOp, String)> {
  let (field, rest) = s
    .split_once('=')
    .ok_or_else(|| eyre!("Filter '{}' is not field=op:value", s))?;
  let (op, value) = rest
    .split_once(':')
    .ok_or_else(|| eyre!("Filter '{}' is not field=op:value", s))?;
  Ok((field.to_string(), op.parse()?, value.to_string()))
}

/// Parse `field` or `field:asc` / `field:desc`.
fn parse_order(s: &str) -> Result<(String, Direction)> {
  match s.split_once(':') {
    None => Ok((s.to_string(), Direction::Asc)),
    Some((field, "asc")) => Ok((field.to_string(), Direction::Asc)),
    Some((field, "desc")) => Ok((field.to_string(), Direction::Desc)),
    Some((_, other)) => Err(eyre!("Unknown order direction '{}'", other)),
  }
}

/// Install the global subscriber. The returned guard flushes the log file on drop.
fn init_logging(log_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env("STEADFAST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if log_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  let log_dir = data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "steadfast.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .init();
  Ok(Some(guard))
}
