// crates/streamkeeper-cli/src/main.rs
//
// Process entry point: argument parsing, tracing init, signal wiring, and
// handing off to streamkeeper_engine::run_session (spec §6, §4.5). Grounded
// on the teacher's sibling CLI (ampactor-sonido/crates/sonido-cli/src/
// main.rs) for the clap/tracing-subscriber/anyhow shape — single binary
// instead of a subcommand dispatcher, since this process does exactly one
// thing.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;

use streamkeeper_core::{Config, SharedEventSink, WriterEventSink};

/// Accepts either a structured config document or the legacy positional
/// form (spec §6): a primary URL and an optional fallback path.
#[derive(Parser)]
#[command(name = "streamkeeper")]
#[command(author, version, about = "Realtime audio/video failover compositor", long_about = None)]
struct Cli {
    /// Path to a JSON configuration document.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where diagnostic (tracing) output goes. Never stderr — stderr is
    /// reserved for the structured event protocol (spec §6).
    #[arg(long, default_value = "streamkeeper.log")]
    log_file: PathBuf,

    /// Legacy form: primary source URL (ignored if --config is given).
    primary_url: Option<String>,

    /// Legacy form: local fallback file (ignored if --config is given).
    fallback_path: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let cli = Cli::parse();

    // stderr carries only the event protocol's JSON lines (spec §6); mixing
    // in tracing's plain-text output would break a downstream line-oriented
    // JSON parser, so diagnostics go to a log file instead.
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(Mutex::new(log_file))
        .init();

    let cfg = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)?;
            Config::from_json_str(&raw)?
        }
        None => {
            let primary_url = cli
                .primary_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("primary_url is required (or pass --config <path>)"))?;
            Config::from_legacy_args(primary_url, cli.fallback_path.clone())?
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))?;
    }

    // stdout carries the encoded container; stderr carries the event
    // channel (spec §6). SIGPIPE is SIG_IGN under the Rust runtime by
    // default, so a downstream consumer closing the sink surfaces as an
    // ordinary write error rather than killing the process — satisfying
    // "a broken-pipe condition on the output sink is ignored" without
    // extra signal handling here.
    let events = SharedEventSink::new(Box::new(WriterEventSink::new(
        cfg.stream_id.clone(),
        io::stderr(),
    )));

    streamkeeper_engine::run_session(cfg, "pipe:1", events, cancel)?;

    Ok(())
}
