//! patternctl: operator CLI for the pattern engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine as _;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use pattern_engine::storage::ColdTier;
use pattern_engine::{
    decode_header, resolve_store_path, spawn_background, EngineConfig, Feedback, Observation,
    Pattern, PatternEngine, PatternQuery, HEADER_SIZE,
};

#[derive(Parser)]
#[command(
    name = "patternctl",
    about = "Inspect, decode and exercise learned-pattern stores",
    version
)]
struct Cli {
    /// JSON engine configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the records in a durable store.
    Inspect {
        /// Store file. Falls back to PATTERN_ENGINE_STORE, ./.patterns/cold.json,
        /// then ~/.pattern-engine/cold.json.
        #[arg(short, long)]
        store: Option<String>,

        /// Print full records as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Decode a base64-encoded 64-byte pattern header.
    Decode {
        /// Base64 (standard alphabet) header bytes.
        header: String,
    },

    /// Drive an engine end to end and print its analytics.
    Simulate {
        /// Number of observation keys, each a potential pattern source.
        #[arg(long, default_value_t = 8)]
        patterns: usize,

        /// Observations fed per key.
        #[arg(long, default_value_t = 50)]
        observations: usize,

        /// Evolution cycles to run.
        #[arg(long, default_value_t = 3)]
        generations: usize,

        /// Durable store to write into. In-memory when omitted.
        #[arg(short, long)]
        store: Option<String>,

        /// RNG seed for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration as JSON.
    Config,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   patternctl completions bash > ~/.local/share/bash-completion/completions/patternctl
    ///   patternctl completions zsh > ~/.zfunc/_patternctl
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let base = match path {
        Some(p) => EngineConfig::load(p)
            .with_context(|| format!("loading config {}", p.display()))?,
        None => EngineConfig::default(),
    };
    Ok(base.apply_env())
}

fn inspect(store: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let path = resolve_store_path(store);
    if !path.exists() {
        anyhow::bail!("no durable store at {}", path.display());
    }
    let patterns = ColdTier::load(&path)?;
    if as_json {
        let records: Vec<_> = patterns.values().collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{} ({} patterns)", path.display(), patterns.len());
    println!(
        "{:>8}  {:<13} {:>4} {:>4} {:>4} {:>6}  tags",
        "id", "type", "conf", "cplx", "ver", "sr"
    );
    for p in patterns.values() {
        let h = &p.header;
        println!(
            "{:>8}  {:<13} {:>4} {:>4} {:>4} {:>6.2}  {}",
            h.id,
            h.pattern_type.as_str(),
            h.confidence,
            h.complexity,
            h.version,
            h.success_rate,
            p.body.metadata.tags.join(",")
        );
    }
    Ok(())
}

fn decode(encoded: &str) -> anyhow::Result<()> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("header is not valid base64")?;
    if bytes.len() < HEADER_SIZE {
        anyhow::bail!("header is {} bytes, need {HEADER_SIZE}", bytes.len());
    }
    let header = decode_header(&bytes)
        .ok_or_else(|| anyhow::anyhow!("not a pattern header (bad magic or unknown type)"))?;
    println!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

struct SimulateArgs {
    patterns: usize,
    observations: usize,
    generations: usize,
    store: Option<String>,
    seed: Option<u64>,
}

async fn simulate(mut config: EngineConfig, args: SimulateArgs) -> anyhow::Result<()> {
    config.storage.cold_path = args.store.map(PathBuf::from);
    if let Some(seed) = args.seed {
        config.evolution.seed = Some(seed);
        config.security.forest_seed = Some(seed);
    }
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let tick = config.subscription_tick();
    let engine = Arc::new(PatternEngine::open(config)?);

    // Count confident patterns as the subscription loop sees them.
    let deliveries = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&deliveries);
    engine.subscribe(
        PatternQuery::new().min_confidence(70),
        Arc::new(move |_p: &Pattern| {
            counter.fetch_add(1, Ordering::Relaxed);
        }),
    );
    let cancel = CancellationToken::new();
    let (evolution_loop, subscription_loop) = spawn_background(&engine, &cancel);

    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let actions = ["fetch", "parse", "store", "notify"];
    let mut published = Vec::new();
    for k in 0..args.patterns {
        let key = format!("workload-{k}");
        let bias: f64 = rng.gen_range(0.4..1.0);
        for i in 0..args.observations {
            let offset = (args.observations - i) as u64;
            let obs = Observation::new(rng.gen_bool(bias))
                .at(now.saturating_sub(offset))
                .latency(rng.gen_range(1.0..50.0))
                .cost(rng.gen_range(0.1..2.0))
                .action(actions[i % actions.len()]);
            engine.observe(&key, obs);
        }
        let report = engine.detect_and_publish(&key)?;
        tracing::info!(
            "{key}: bias={bias:.2} published={} rejected={}",
            report.published.len(),
            report.rejected.len()
        );
        published.extend(report.published);
    }

    let mut outcomes = Vec::new();
    for _ in 0..args.generations {
        for &id in &published {
            let success = rng.gen_bool(0.75);
            engine.record_feedback(
                Feedback::new(id, success, rng.gen_range(0.0..0.5))
                    .latency(rng.gen_range(1.0..50.0))
                    .cost(rng.gen_range(0.0..1.0)),
            );
        }
        match engine.evolve() {
            Ok(g) => tracing::info!("generation {}: {} evolved", g.number, g.evolved.len()),
            Err(e) => tracing::warn!("evolution skipped: {e}"),
        }
    }

    let context: HashMap<String, serde_json::Value> = HashMap::new();
    for &id in &published {
        outcomes.push(engine.apply_pattern(id, &context)?);
    }

    tokio::time::sleep(tick * 2).await;
    cancel.cancel();
    let background_generations = evolution_loop.await?;
    subscription_loop.await?;

    let applied = outcomes.iter().filter(|o| o.applied).count();
    let report = engine.snapshot_analytics();
    let out = json!({
        "published": published.len(),
        "applied": applied,
        "generations": engine.generation(),
        "background_generations": background_generations,
        "subscription_deliveries": deliveries.load(Ordering::Relaxed),
        "analytics": report,
        "storage": engine.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    match cli.command {
        Commands::Inspect { store, json } => inspect(store.as_deref(), json)?,

        Commands::Decode { header } => decode(&header)?,

        Commands::Simulate {
            patterns,
            observations,
            generations,
            store,
            seed,
        } => {
            let config = load_config(cli.config.as_ref())?;
            simulate(
                config,
                SimulateArgs {
                    patterns,
                    observations,
                    generations,
                    store,
                    seed,
                },
            )
            .await?;
        }

        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "patternctl", &mut std::io::stdout());
        }
    }

    Ok(())
}
