use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdbatch_contracts::batch::BatchSpec;
use sdbatch_contracts::config::{default_config_path, ConfigStore};
use sdbatch_contracts::events::{
    now_utc_iso, EventPayload, EventWriter, BATCH_COMPILED, BATCH_FINISHED,
};
use sdbatch_contracts::models::StaticCatalog;
use sdbatch_contracts::runs::summary::{write_summary, BatchSummary};
use sdbatch_engine::{
    batch_digest, compile_batch, CompiledQuery, DispatchReport, Dispatcher, DryrunTransport,
    HttpTransport, Transport, ValidationError,
};
use serde_json::{json, Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const LOG_ENV: &str = "SDBATCH_LOG";
const INVALID_BATCH_EXIT: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "sdbatch",
    version,
    about = "Compile batch specs into Stable Diffusion web API queries and queue them"
)]
struct Cli {
    /// Config file; defaults to $SDBATCH_CONFIG, then ~/.sdbatch.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a batch spec and send every query to the backend.
    Queue(QueueArgs),
    /// Compile a batch spec without sending anything.
    Validate(ValidateArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Parser)]
struct QueueArgs {
    spec: PathBuf,
    #[arg(long)]
    endpoint: Option<String>,
    /// Catalog snapshot JSON used instead of querying the backend.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Directory for events.jsonl, receipts and summary.json.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Print the compiled queries and skip the backend.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct ValidateArgs {
    spec: PathBuf,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sdbatch error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let store = ConfigStore::open(config_path);
    match cli.command {
        Command::Queue(args) => run_queue(args, &store),
        Command::Validate(args) => run_validate(args, &store),
        Command::Config(args) => run_config(args, store),
    }
}

fn run_validate(args: ValidateArgs, store: &ConfigStore) -> Result<i32> {
    let spec = BatchSpec::from_path(&args.spec)?;
    let endpoint = resolve_endpoint(args.endpoint.as_deref(), store);
    let catalog = load_catalog(args.catalog.as_deref(), &endpoint, store)?;
    match compile(&spec, &catalog, store) {
        Ok(queries) => {
            println!("{} queries", queries.len());
            Ok(0)
        }
        Err(err) => Ok(report_invalid(&err)),
    }
}

fn run_queue(args: QueueArgs, store: &ConfigStore) -> Result<i32> {
    let started_at = now_utc_iso();
    let batch_id = format!("batch-{}", Uuid::new_v4().simple());
    let spec = BatchSpec::from_path(&args.spec)?;
    let endpoint = resolve_endpoint(args.endpoint.as_deref(), store);
    let catalog = load_catalog(args.catalog.as_deref(), &endpoint, store)?;
    let queries = match compile(&spec, &catalog, store) {
        Ok(queries) => queries,
        Err(err) => return Ok(report_invalid(&err)),
    };
    let digest = batch_digest(&queries);
    info!(batch_id = %batch_id, queries = queries.len(), digest = %digest, "batch ready");

    let events = args
        .out
        .as_ref()
        .map(|out| EventWriter::new(out.join("events.jsonl"), batch_id.clone()));
    if let Some(events) = &events {
        let mut payload = EventPayload::new();
        payload.insert("spec".to_string(), json!(args.spec.to_string_lossy()));
        payload.insert("queries".to_string(), json!(queries.len()));
        payload.insert("digest".to_string(), json!(digest));
        payload.insert("dry_run".to_string(), json!(args.dry_run));
        events.emit(BATCH_COMPILED, payload)?;
    }

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&dry_run_listing(&queries))?);
    }

    let transport: Box<dyn Transport> = if args.dry_run {
        Box::new(DryrunTransport)
    } else {
        Box::new(HttpTransport::new(&endpoint, request_timeout(store))?)
    };
    let mut dispatcher = Dispatcher::new(transport.as_ref());
    if let Some(out) = &args.out {
        dispatcher = dispatcher.with_receipts(out.join("receipts"));
    }
    if let Some(events) = events.clone() {
        dispatcher = dispatcher.with_events(events);
    }
    let report = dispatcher.run(&queries)?;

    if let (Some(out), Some(events)) = (&args.out, &events) {
        events.emit(BATCH_FINISHED, report_payload(&report))?;
        let summary = BatchSummary {
            batch_id,
            started_at,
            finished_at: now_utc_iso(),
            total_queries: report.total as u64,
            dispatched: report.dispatched as u64,
            failed: report.failed as u64,
            digest,
        };
        let mut extra = Map::new();
        extra.insert("endpoint".to_string(), json!(endpoint));
        extra.insert("transport".to_string(), json!(transport.name()));
        write_summary(&out.join("summary.json"), &summary, Some(&extra))?;
    }

    if report.failed > 0 {
        eprintln!("sdbatch: {} of {} queries failed", report.failed, report.total);
        return Ok(1);
    }
    Ok(0)
}

fn run_config(args: ConfigArgs, mut store: ConfigStore) -> Result<i32> {
    match args.action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(store.config())?);
        }
        ConfigAction::Set { key, value } => {
            store.set(&key, &value)?;
            let stored = store.get(&key).unwrap_or(Value::Null);
            println!("{key} = {stored}");
        }
    }
    Ok(0)
}

fn compile(
    spec: &BatchSpec,
    catalog: &StaticCatalog,
    store: &ConfigStore,
) -> Result<Vec<CompiledQuery>, ValidationError> {
    let options = store.config().compiler_options();
    compile_batch(spec, catalog, &options, &mut rand::thread_rng())
}

fn report_invalid(err: &ValidationError) -> i32 {
    eprintln!("sdbatch: invalid batch: {err}");
    INVALID_BATCH_EXIT
}

fn resolve_endpoint(explicit: Option<&str>, store: &ConfigStore) -> String {
    explicit
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| store.config().effective_endpoint())
}

fn request_timeout(store: &ConfigStore) -> Duration {
    Duration::from_secs(store.config().request_timeout_secs.max(1))
}

fn load_catalog(
    path: Option<&Path>,
    endpoint: &str,
    store: &ConfigStore,
) -> Result<StaticCatalog> {
    match path {
        Some(path) => StaticCatalog::load(path),
        None => HttpTransport::new(endpoint, request_timeout(store))?
            .fetch_catalog()
            .with_context(|| format!("failed to read model catalog from {endpoint}")),
    }
}

fn dry_run_listing(queries: &[CompiledQuery]) -> Vec<Value> {
    queries
        .iter()
        .map(|query| {
            json!({
                "endpoint": query.kind.endpoint(),
                "payload": serde_json::to_value(query).unwrap_or(Value::Null),
            })
        })
        .collect()
}

fn report_payload(report: &DispatchReport) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert("total".to_string(), json!(report.total));
    payload.insert("dispatched".to_string(), json!(report.dispatched));
    payload.insert("failed".to_string(), json!(report.failed));
    payload
}
