//! slotctl - operator surface for the slot selection policy.
//!
//! Exit codes: 0 success, 1 validation error, 2 runtime error.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slotmux::{
    AuditError, Candidate, ConfigError, ConfigStore, CycleError, JsonlAuditLog, PolicyRecord,
    PolicySnapshot, SelectionError, SlotPipeline,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// slotctl - inspect, validate and reload the selection policy
#[derive(Parser, Debug)]
#[command(name = "slotctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the active policy file
    #[arg(long, default_value = "config/business_logic.yaml")]
    policy: PathBuf,

    /// Directory for policy history and audit logs
    #[arg(long, default_value = ".slotmux")]
    state_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the active policy
    Show,

    /// Validate a policy file without changing anything
    Validate {
        /// Policy file to check
        path: PathBuf,
    },

    /// Validate a policy file and atomically make it the active policy
    Reload {
        /// New policy file (defaults to re-reading the active one)
        path: Option<PathBuf>,
    },

    /// Run one selection cycle on synthetic candidates and print the decision
    TestSelection {
        /// Number of synthetic candidates
        #[arg(long, default_value = "20")]
        plans: usize,

        /// Selection only: no audit record, no curator token spent
        #[arg(long)]
        dry_run: bool,

        /// Window id
        #[arg(long, default_value = "main")]
        window: String,

        /// Slot time (RFC 3339); defaults to now
        #[arg(long, value_parser = parse_rfc3339)]
        slot_time: Option<DateTime<Utc>>,
    },
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp {s:?}: {e}"))
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(e) => e.exit_code(),
            CliError::Selection(_) | CliError::Cycle(CycleError::Selection(_)) => 1,
            _ => 2,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = match &cli.command {
        Commands::Show => show(&cli.policy),
        Commands::Validate { path } => validate(path),
        Commands::Reload { path } => reload(&cli.policy, path.as_deref(), &cli.state_dir),
        Commands::TestSelection {
            plans,
            dry_run,
            window,
            slot_time,
        } => {
            test_selection(
                &cli.policy,
                &cli.state_dir,
                *plans,
                *dry_run,
                window,
                slot_time.unwrap_or_else(Utc::now),
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            for v in violations_of(&e) {
                eprintln!("  - {v}");
            }
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn violations_of(e: &CliError) -> &[slotmux::Violation] {
    match e {
        CliError::Config(c) => c.violations(),
        _ => &[],
    }
}

fn show(policy: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(policy, Utc::now())?;
    let snap = store.snapshot();
    let mut out = std::io::stdout().lock();
    writeln!(out, "# source: {}", policy.display())?;
    writeln!(out, "# revision: {}", snap.revision())?;
    writeln!(out, "# version: {}", snap.version())?;
    writeln!(out, "# content_hash: {}", snap.content_hash())?;
    write!(out, "{}", snap.document().to_yaml()?)?;
    Ok(())
}

fn validate(path: &Path) -> Result<(), CliError> {
    let doc = ConfigStore::validate_file(path)?;
    println!(
        "ok: {} is valid (version {}, env {:?})",
        path.display(),
        doc.policy_version,
        doc.env
    );
    Ok(())
}

fn reload(active: &Path, source: Option<&Path>, state_dir: &Path) -> Result<(), CliError> {
    let now = Utc::now();
    let source = source.unwrap_or(active);
    ConfigStore::validate_file(source)?;

    let history_path = state_dir.join("policy_history.jsonl");
    let last = last_revision(&history_path)?;
    // The active file holds the last published revision.
    let store = match ConfigStore::open_at(active, last, now) {
        Ok(store) => {
            store.reload(source, now)?;
            store
        }
        Err(e) => {
            tracing::warn!(active = %active.display(), error = %e, "active policy unreadable");
            ConfigStore::recover(source, last + 1, now)?
        }
    };
    let snap = store.snapshot();
    store.persist_active(active)?;

    std::fs::create_dir_all(state_dir)?;
    let mut history = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&history_path)?;
    if let Some(record) = store.history().last() {
        writeln!(history, "{}", serde_json::to_string(record)?)?;
    }

    println!(
        "reloaded: revision {} version {} content_hash {} from {}",
        snap.revision(),
        snap.version(),
        snap.content_hash(),
        source.display()
    );
    Ok(())
}

/// Revision of the last line of the history file, `0` when there is none yet.
fn last_revision(path: &Path) -> Result<u64, CliError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    match text.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => Ok(serde_json::from_str::<PolicyRecord>(line)?.revision),
        None => Ok(0),
    }
}

/// Deterministic synthetic candidates for a policy.
fn synthetic_candidates(policy: &PolicySnapshot, n: usize) -> Vec<Candidate> {
    const KINDS: [&str; 4] = ["music", "talk", "news", "interstitial"];
    const GENRES: [&str; 5] = ["jazz", "rock", "ambient", "folk", "electronic"];
    let moods = &policy.document().knobs.music_mood_focus;
    let mut rng = StdRng::seed_from_u64(policy.global_seed());
    (0..n)
        .map(|i| {
            let mut tags = vec![GENRES[rng.gen_range(0..GENRES.len())].to_string()];
            if !moods.is_empty() {
                tags.push(moods[rng.gen_range(0..moods.len())].clone());
            }
            Candidate::new(format!("plan-{i:03}"), rng.gen_range(0.0..1.0))
                .with_kind(KINDS[rng.gen_range(0..KINDS.len())])
                .with_tags(tags)
                .with_duration(rng.gen_range(30..600))
        })
        .collect()
}

async fn test_selection(
    policy: &Path,
    state_dir: &Path,
    plans: usize,
    dry_run: bool,
    window: &str,
    slot_time: DateTime<Utc>,
) -> Result<(), CliError> {
    let now = Utc::now();
    let store = Arc::new(ConfigStore::open(policy, now)?);
    let candidates = synthetic_candidates(&store.snapshot(), plans);
    let pipeline = SlotPipeline::new(Arc::clone(&store), now);

    let decision = if dry_run {
        pipeline.preview(&candidates, slot_time, window)?
    } else {
        let log = JsonlAuditLog::open(state_dir.join("audit.jsonl"))?;
        let pipeline = pipeline.with_audit(Arc::new(log));
        pipeline
            .run(&candidates, slot_time, window, serde_json::Value::Null, now)
            .await?
    };
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
