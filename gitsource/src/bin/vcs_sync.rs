use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gitsource::models::VcsEvent;
use gitsource::VcsConverter;
use graphsink::config::SinkConfig;
use graphsink::GraphSink;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(
    name = "vcs-sync",
    about = "Mirror a captured VCS event stream into the graph backend",
    after_help = "Example:\n  cargo run -p gitsource --bin vcs_sync -- \\\n    --input fixtures/events.ndjson --origin gitlab --reset"
)]
struct Args {
    /// NDJSON file with one VCS event per line.
    #[arg(long)]
    input: PathBuf,

    /// GraphQL endpoint; falls back to the GRAPH_ENDPOINT environment variable.
    #[arg(long)]
    endpoint: Option<String>,

    /// Admin secret; falls back to GRAPH_ADMIN_SECRET.
    #[arg(long)]
    admin_secret: Option<String>,

    /// Origin label stamped on every mirrored row.
    #[arg(long, default_value = "git")]
    origin: String,

    /// Events handed to the sink per processing call.
    #[arg(long, default_value_t = 200)]
    batch_size: usize,

    /// Delete rows of this origin that the stream did not refresh.
    #[arg(long)]
    reset: bool,

    /// During a reset, keep stale rows other rows still point at.
    #[arg(long)]
    preserve_referenced: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let endpoint = args
        .endpoint
        .or_else(|| std::env::var("GRAPH_ENDPOINT").ok())
        .context("endpoint must be provided via --endpoint or GRAPH_ENDPOINT")?;
    let mut config = SinkConfig::new(endpoint);
    config.admin_secret = args
        .admin_secret
        .or_else(|| std::env::var("GRAPH_ADMIN_SECRET").ok());

    let schema = gitsource::vcs_schema()?;
    let models: Vec<String> = schema.dependency_order().to_vec();

    let mut sink = GraphSink::new(config, schema)?;
    sink.register_converter(Arc::new(VcsConverter));
    sink.health_check()
        .await
        .context("graph backend is unreachable")?;

    let file = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("failed to open {:?}", args.input))?;
    let mut lines = BufReader::new(file).lines();

    let mut batch: Vec<Value> = Vec::with_capacity(args.batch_size);
    let mut buffered = 0usize;
    let mut queued = 0usize;
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event = VcsEvent::parse(&line)
            .with_context(|| format!("line {} is not a valid VCS event", line_number))?;
        batch.push(serde_json::to_value(&event)?);
        if batch.len() >= args.batch_size {
            let summary = sink.process("vcs", &batch, Some(&args.origin)).await?;
            buffered += summary.records_buffered;
            queued += summary.writes_queued;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        let summary = sink.process("vcs", &batch, Some(&args.origin)).await?;
        buffered += summary.records_buffered;
        queued += summary.writes_queued;
    }
    sink.flush().await?;
    log::info!(
        "mirrored {} record(s) and {} write(s) from {:?}",
        buffered,
        queued,
        args.input
    );

    if args.reset {
        let summary = sink
            .reset(&args.origin, &models, args.preserve_referenced)
            .await?;
        log::info!("reset removed {} stale row(s)", summary.total());
    }
    Ok(())
}
