//! # collate: COLLATE CLI
//!
//! - `collate query <dsl>`: Run a query on the hub.
//! - `collate parents`: List the hub source's parents.
//! - `collate status`: Report hub status.
//! - `collate local --dir <path> <dsl>`: Query a directory of JSON files
//!   without a hub.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tabled::{builder::Builder, settings::Style};

use collate_core::{FieldSpec, JsonRecord, QueryEngine, QueryResult, Schema};
use collate_io::{Aggregator, AggregatorConfig, JsonDirSource};

/// COLLATE: merge records from many parents and query them in one place.
#[derive(Parser)]
#[command(name = "collate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query on the hub.
    Query {
        query: String,

        /// Re-aggregate before evaluating.
        #[arg(long)]
        refresh: bool,

        /// Print raw JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the parents the hub's source serves.
    Parents,

    /// Report hub status.
    Status,

    /// Query a directory of `<parent>.json` files locally.
    Local {
        /// Directory holding one JSON file per parent.
        #[arg(long)]
        dir: PathBuf,

        /// TOML file with a [schema] table (fields are inferred otherwise).
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON pointer to the record array inside each file.
        #[arg(long)]
        pointer: Option<String>,

        /// Maximum files read at once.
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        query: String,

        #[arg(long)]
        json: bool,
    },
}

// =============================================================================
// Local config
// =============================================================================

#[derive(Deserialize, Default)]
struct LocalConfig {
    #[serde(default)]
    schema: SchemaSection,
}

#[derive(Deserialize, Default)]
struct SchemaSection {
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

fn load_fields(path: &Path) -> anyhow::Result<Vec<FieldSpec>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: LocalConfig =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config.schema.fields)
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(async_main(cli.command))
}

async fn async_main(cmd: Commands) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("COLLATE_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

    match cmd {
        Commands::Query {
            query,
            refresh,
            json,
        } => {
            let url = format!("{}/api/query", base_url);
            let payload = serde_json::json!({ "query": query, "refresh": refresh });
            let resp = client.post(&url).json(&payload).send().await?;
            let body = read_body(resp).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
            let result: QueryResult<serde_json::Value> = serde_json::from_value(body)?;
            let records: Vec<JsonRecord> = result.items.iter().cloned().map(JsonRecord).collect();
            let columns = columns_of(&records);
            let rows = records
                .iter()
                .map(|r| {
                    columns
                        .iter()
                        .map(|c| cell(r.lookup(c)))
                        .collect::<Vec<_>>()
                })
                .collect();
            print_result(&columns, rows, &result);
        }

        Commands::Parents => {
            let url = format!("{}/api/parents", base_url);
            let body = read_body(client.get(&url).send().await?).await?;
            let parents: Vec<String> = serde_json::from_value(body)?;
            for p in parents {
                println!("{}", p);
            }
        }

        Commands::Status => {
            let url = format!("{}/api/status", base_url);
            let body = read_body(client.get(&url).send().await?).await?;
            let mut builder = Builder::default();
            if let Some(map) = body.as_object() {
                for (k, v) in map {
                    builder.push_record([k.clone(), cell(Some(v))]);
                }
            }
            let mut table = builder.build();
            table.with(Style::rounded());
            println!("{}", table);
        }

        Commands::Local {
            dir,
            config,
            pointer,
            concurrency,
            query,
            json,
        } => {
            let spec = collate_core::parse(&query)?;

            let mut source = JsonDirSource::new(&dir);
            if let Some(p) = &pointer {
                source = source.with_pointer(p);
            }
            let aggregator = Aggregator::new(
                source,
                AggregatorConfig {
                    concurrency,
                    fetch_timeout_ms: None,
                },
            );
            let aggregation = aggregator
                .aggregate_all()
                .await
                .with_context(|| format!("reading {}", dir.display()))?;

            let fields = match &config {
                Some(path) => load_fields(path)?,
                None => Schema::infer_specs(&aggregation.records),
            };
            let schema = Schema::from_specs(&fields)?;
            let engine = QueryEngine::new(schema);
            let page = engine.execute(&aggregation.records, &spec)?;
            let result = QueryResult::from_page(page, aggregation.failures, 1);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            let columns: Vec<String> = engine
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().to_string())
                .collect();
            let rows = result
                .items
                .iter()
                .map(|r| {
                    engine
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.read(r).map(|v| truncate(&v.to_string())).unwrap_or_default())
                        .collect::<Vec<_>>()
                })
                .collect();
            print_result(&columns, rows, &result);
        }
    }
    Ok(())
}

/// Decode a hub response, turning error statuses into errors.
async fn read_body(resp: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding hub response")?;
    if !status.is_success() {
        let msg = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        bail!("hub returned {}: {}", status, msg);
    }
    Ok(body)
}

// =============================================================================
// Rendering
// =============================================================================

const MAX_CELL: usize = 40;

/// Top-level keys across `records`, in first-seen order.
fn columns_of(records: &[JsonRecord]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for r in records {
        if let Some(map) = r.0.as_object() {
            for k in map.keys() {
                if !columns.contains(k) {
                    columns.push(k.clone());
                }
            }
        }
    }
    columns
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => truncate(s),
        Some(other) => truncate(&other.to_string()),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_CELL {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CELL - 1).collect();
    out.push('…');
    out
}

fn print_result<R>(columns: &[String], rows: Vec<Vec<String>>, result: &QueryResult<R>) {
    for f in &result.failures {
        eprintln!("warning: parent {} skipped: {}", f.parent_key, f.cause);
    }
    if rows.is_empty() {
        println!("No matches ({} total).", result.total_matched);
        return;
    }

    let shown = rows.len();
    let mut builder = Builder::default();
    builder.push_record(columns.iter().cloned());
    for row in rows {
        builder.push_record(row);
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{}", table);
    println!(
        "{} of {} matches{}",
        shown,
        result.total_matched,
        if result.has_more { " (more available)" } else { "" }
    );
}
