// mulewatch/src/main.rs
//
// mulewatch — real-time fraud scoring for retail payment networks
//
// Three operational modes:
//   serve   — workers + analyzer + HTTP/WS API over the in-process stream
//   tail    — follow a JSONL transaction feed file (staging)
//   replay  — replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   mulewatch --mode serve
//   mulewatch --mode tail --path /var/log/gateway/transactions.jsonl
//   mulewatch --mode replay --path captured.jsonl --speed 10.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mulewatch::config::Config;
use mulewatch::events::TxRecord;
use mulewatch::stream::TxStream;
use mulewatch::worker::Pipeline;
use mulewatch::{api, metrics::EngineMetrics};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "mulewatch",
    about   = "Real-time fraud scoring and mule-account detection",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "serve")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/mulewatch_feed.jsonl",
          help = "JSONL transaction feed (tail/replay modes)")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Serve,   // API + workers over the in-process stream
    Tail,    // follow a live JSONL feed file
    Replay,  // replay a static JSONL capture at scaled speed
}

// ── Event sources ─────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, stream: Arc<TxStream>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() { continue; }
                match serde_json::from_str::<TxRecord>(line) {
                    Ok(rec) => { stream.append(rec); }
                    Err(e)  => warn!("feed parse error: {e}"),
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
}

async fn replay_jsonl(path: PathBuf, stream: Arc<TxStream>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut records: Vec<TxRecord> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() { continue; }
        match serde_json::from_str::<TxRecord>(line) {
            Ok(rec) => records.push(rec),
            Err(e)  => warn!("feed parse error: {e}"),
        }
    }
    if records.is_empty() {
        warn!("replay file {} held no parsable records", path.display());
        return Ok(());
    }
    records.sort_by_key(|r| r.timestamp);

    info!("replaying {} records at {speed:.1}x", records.len());
    let base_ts   = records[0].timestamp;
    let base_wall = std::time::Instant::now();
    for mut rec in records {
        let offset = (rec.timestamp - base_ts).num_milliseconds() as f64 / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset.max(0.0));
        let now = std::time::Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        rec.timestamp = Utc::now();
        stream.append(rec);
    }
    info!("replay complete");
    Ok(())
}

// ── Housekeeping ──────────────────────────────────────────────────────────────

async fn stats_loop(pipeline: Arc<Pipeline>) {
    let metrics: Arc<EngineMetrics> = Arc::clone(&pipeline.metrics);
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let m = metrics.snapshot();
        let uptime = pipeline.uptime_secs();
        info!(
            uptime_secs = uptime as u64,
            records = m.records_processed,
            rps = m.records_processed as f64 / uptime.max(1.0),
            accounts = pipeline.store.n_accounts(),
            snapshot_seq = m.snapshot_seq,
            pending = pipeline.stream.pending_count(&pipeline.cfg.consumer_group),
            "stats"
        );
    }
}

async fn prune_loop(pipeline: Arc<Pipeline>) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        pipeline.resolver.prune(Utc::now());
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("mulewatch=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    info!(workers = cfg.workers, bind = %cfg.bind_addr,
          asn_db = cfg.asn_db_path.as_deref().unwrap_or("(none)"),
          "mulewatch starting");

    let pipeline = Pipeline::new(cfg);

    tokio::spawn(Arc::clone(&pipeline.analyzer).run());
    pipeline.spawn_workers();
    tokio::spawn(stats_loop(Arc::clone(&pipeline)));
    tokio::spawn(prune_loop(Arc::clone(&pipeline)));

    match cli.mode {
        Mode::Serve => {
            info!("mode: serve");
        }
        Mode::Tail => {
            info!("mode: tail {}", cli.path.display());
            let stream = Arc::clone(&pipeline.stream);
            tokio::spawn(async move {
                if let Err(e) = tail_jsonl(cli.path, stream, true).await {
                    warn!("tail source stopped: {e}");
                }
            });
        }
        Mode::Replay => {
            info!("mode: replay {} at {:.1}x", cli.path.display(), cli.speed);
            let stream = Arc::clone(&pipeline.stream);
            let speed  = cli.speed;
            tokio::spawn(async move {
                if let Err(e) = replay_jsonl(cli.path, stream, speed).await {
                    warn!("replay source stopped: {e}");
                }
            });
        }
    }

    api::serve(pipeline).await
}
