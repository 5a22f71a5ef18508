//! tcgate-replay
//!
//! Feeds captured frames through the dataplane and prints one JSON decision
//! per frame followed by a stats summary.
//!
//! # Usage
//!
//! ```bash
//! tcgate-replay --config dataplane.json frames.txt
//! cat frames.txt | tcgate-replay --config dataplane.json --engine
//! ```
//!
//! Input lines are `<attach-point> <hex-frame> [ingress-ifindex]`; blank lines
//! and lines starting with `#` are skipped.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::Parser;
use serde::Serialize;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tcgate_common::{AttachPoint, SkbMeta};
use tcgate_dataplane::{DataplaneConfig, Decision, Engine, PacketJob};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tcgate-replay")]
#[command(version)]
#[command(about = "Replay captured frames through the tcgate dataplane", long_about = None)]
struct Cli {
    /// Dataplane configuration (JSON)
    #[arg(long, short, env = "TCGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Frame file, `-` for stdin
    #[arg(default_value = "-")]
    input: String,

    /// Ingress ifindex for lines that do not carry one
    #[arg(long, default_value_t = 1)]
    ifindex: u32,

    /// Process frames on the worker pool instead of inline
    #[arg(long)]
    engine: bool,
}

/// One input line
#[derive(Debug, PartialEq, Eq)]
struct ReplayFrame {
    attach: AttachPoint,
    frame: Vec<u8>,
    ifindex: Option<u32>,
}

/// One output line
#[derive(Serialize)]
struct Record {
    line: u64,
    attach: AttachPoint,
    #[serde(flatten)]
    decision: Decision,
    mark: u32,
    frame: String,
}

fn parse_line(line: &str) -> Result<Option<ReplayFrame>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let attach: AttachPoint = fields
        .next()
        .context("missing attach point")?
        .parse()
        .context("bad attach point")?;
    let frame = hex::decode(fields.next().context("missing frame")?).context("bad frame hex")?;
    let ifindex = fields
        .next()
        .map(|f| f.parse::<u32>().context("bad ifindex"))
        .transpose()?;
    if fields.next().is_some() {
        bail!("trailing fields");
    }

    Ok(Some(ReplayFrame {
        attach,
        frame,
        ifindex,
    }))
}

fn read_frames(input: &str) -> Result<Vec<(u64, ReplayFrame)>> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("opening {}", input))?;
        Box::new(BufReader::new(file))
    };

    let mut frames = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx as u64 + 1;
        let line = line.with_context(|| format!("reading {}", input))?;
        if let Some(frame) = parse_line(&line).with_context(|| format!("line {}", line_no))? {
            frames.push((line_no, frame));
        }
    }
    Ok(frames)
}

fn emit(out: &mut impl Write, line: u64, attach: AttachPoint, frame: &[u8], meta: SkbMeta, decision: Decision) -> Result<()> {
    let record = Record {
        line,
        attach,
        decision,
        mark: meta.mark,
        frame: hex::encode(frame),
    };
    writeln!(out, "{}", serde_json::to_string(&record)?)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::info!("tcgate-replay v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => DataplaneConfig::load(path)?,
        None => {
            tracing::warn!("no config given, using defaults (everything denied)");
            DataplaneConfig::default()
        }
    };
    let dataplane = Arc::new(config.build_dataplane()?);
    let frames = read_frames(&cli.input)?;
    tracing::info!(frames = frames.len(), engine = cli.engine, "replaying");

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if cli.engine {
        let mut engine = Engine::new(config.engine_config(), dataplane.clone());
        engine.start()?;
        let mut attach_by_line = std::collections::HashMap::new();
        for (line, f) in frames {
            attach_by_line.insert(line, f.attach);
            engine.submit(PacketJob {
                id: line,
                frame: BytesMut::from(&f.frame[..]),
                meta: SkbMeta::new(f.ifindex.unwrap_or(cli.ifindex)),
                attach: f.attach,
            })?;
        }
        // stop drains every worker queue before joining
        engine.stop();

        let mut results: Vec<_> = engine.results().try_iter().collect();
        results.sort_by_key(|r| r.id);
        for r in results {
            let attach = attach_by_line
                .get(&r.id)
                .copied()
                .context("result for unknown line")?;
            emit(&mut out, r.id, attach, &r.frame, r.meta, r.decision)?;
        }
    } else {
        for (line, mut f) in frames {
            let mut meta = SkbMeta::new(f.ifindex.unwrap_or(cli.ifindex));
            let decision = dataplane.process(&mut f.frame, &mut meta, f.attach);
            emit(&mut out, line, f.attach, &f.frame, meta, decision)?;
        }
    }

    let stats = dataplane.stats().snapshot();
    writeln!(out, "{}", serde_json::json!({ "stats": stats }))?;
    out.flush()?;
    Ok(())
}
