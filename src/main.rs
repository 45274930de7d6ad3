//! # Virtual parent CLI (`vparent`)
//!
//! Links child metadata records to their virtual parent, creating the parent
//! on first sight and widening its envelope afterwards.
//!
//! ## Usage
//!
//! ```bash
//! vparent --config ./config/vparent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vparent link <child>...` | Link children to their parents |
//! | `vparent check <child>` | Show identity and validation report of one child |
//! | `vparent check --group <group>` | List every child of a group that would not link cleanly |
//! | `vparent orphans` | List children that could not be linked |
//! | `vparent extents reset <group>` | Reset every parent rectangle of a group |
//! | `vparent extents rebuild <group>` | Recompute every parent rectangle of a group |
//!
//! ## Examples
//!
//! ```bash
//! # Link one product as it arrives
//! vparent link S1A_EW_GRDM_1SDH_20231016T071258_20231016T071502_050787_061EE6_78D6.SAFE.zip
//!
//! # Link a day's worth of products, four parents at a time
//! vparent link --jobs 4 $(cat todays_products.txt)
//!
//! # Recompute all S1A envelopes after a polygon change
//! vparent extents rebuild S1A --progress human
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mmd_parent::audit;
use mmd_parent::config::{self, Config};
use mmd_parent::envelope::Envelopes;
use mmd_parent::link::{link_all, LinkError, LinkOutcome, LinkSummary, Linker};
use mmd_parent::progress::ProgressMode;

/// Maintains virtual parent MMD records for groups of child products.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vparent.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vparent",
    about = "Create and update virtual parent metadata records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vparent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link children to their parents.
    ///
    /// Each child name may be a product name (`*.SAFE.zip`), a record
    /// filename, or a path; only the part before the first `.` matters.
    /// Children that cannot be linked are added to the orphan registry.
    Link {
        #[arg(required = true)]
        children: Vec<String>,

        /// Number of parents processed in parallel.
        #[arg(long, default_value_t = 1)]
        jobs: usize,

        /// Print one JSON object per child instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show the derived identity and validation report of a child, or
    /// audit every child of a group.
    Check {
        #[arg(required_unless_present = "group")]
        child: Option<String>,

        /// Audit all child records below this group (platform directory).
        #[arg(long, conflicts_with = "child")]
        group: Option<String>,
    },

    /// List the orphan registry.
    Orphans,

    /// Envelope maintenance for a parent group (platform directory).
    Extents {
        #[command(subcommand)]
        action: ExtentsAction,
    },
}

#[derive(Subcommand)]
enum ExtentsAction {
    /// Write the unset sentinel into every parent rectangle of the group.
    Reset { group: String },

    /// Reset and recompute every parent rectangle of the group in one pass.
    Rebuild {
        group: String,

        /// Progress on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

fn init_tracing(cfg: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mmd_parent={0},vparent={0}", cfg.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Link {
            children,
            jobs,
            json,
        } => {
            run_link(&cfg, children, jobs, json).await?;
        }
        Commands::Check { child, group } => {
            let linker = Linker::from_config(&cfg);
            match (child, group) {
                (_, Some(group)) => {
                    let files = Envelopes::new(&linker, &cfg.records.child_globs)?
                        .child_files(&group)
                        .with_context(|| format!("listing children of {}", group))?;
                    let summary = audit::audit_files(&linker, &files);
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                (Some(child), None) => {
                    println!("{}", serde_json::to_string_pretty(&linker.check(&child))?);
                }
                (None, None) => anyhow::bail!("either a child or --group is required"),
            }
        }
        Commands::Orphans => {
            let linker = Linker::from_config(&cfg);
            for entry in linker.registry().entries()? {
                println!("{}", entry);
            }
        }
        Commands::Extents { action } => {
            let linker = Linker::from_config(&cfg);
            let envelopes = Envelopes::new(&linker, &cfg.records.child_globs)?;
            match action {
                ExtentsAction::Reset { group } => {
                    let n = envelopes
                        .reset(&group)
                        .with_context(|| format!("resetting envelopes of {}", group))?;
                    println!("Reset {} parent envelopes in {}.", n, group);
                }
                ExtentsAction::Rebuild { group, progress } => {
                    let reporter = progress
                        .unwrap_or_else(ProgressMode::default_for_tty)
                        .reporter();
                    let stats = envelopes
                        .rebuild(&group, reporter.as_ref())
                        .with_context(|| format!("rebuilding envelopes of {}", group))?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
        }
    }

    Ok(())
}

async fn run_link(cfg: &Config, children: Vec<String>, jobs: usize, json: bool) -> anyhow::Result<()> {
    let linker = Arc::new(Linker::from_config(cfg));
    let results = link_all(linker, children, jobs).await;

    for (child, result) in &results {
        if json {
            println!("{}", serde_json::to_string(&describe(child, result))?);
        } else {
            match result {
                Ok(outcome) => println!(
                    "{:<10} {} {}",
                    outcome.label(),
                    child,
                    outcome.parent_key().unwrap_or("-")
                ),
                Err(err) => println!("{:<10} {} {}", "failed", child, err),
            }
        }
    }

    let summary = LinkSummary::tally(results.iter().map(|(_, r)| r));
    if !json {
        println!(
            "\n{} created, {} widened, {} unchanged, {} skipped, {} orphaned, {} failed",
            summary.created,
            summary.widened,
            summary.unchanged,
            summary.skipped,
            summary.orphaned,
            summary.failed
        );
    }
    if summary.failed > 0 {
        anyhow::bail!("{} children failed to link", summary.failed);
    }
    Ok(())
}

fn describe(child: &str, result: &Result<LinkOutcome, LinkError>) -> serde_json::Value {
    match result {
        Ok(outcome) => {
            let detail = match outcome {
                LinkOutcome::Orphaned { reason } => Some(reason.to_string()),
                LinkOutcome::Linked {
                    envelope: mmd_parent::reconcile::EnvelopeChange::Skipped(reason),
                    ..
                } => Some(reason.to_string()),
                _ => None,
            };
            serde_json::json!({
                "child": child,
                "outcome": outcome.label(),
                "parent": outcome.parent_key(),
                "detail": detail,
            })
        }
        Err(err) => serde_json::json!({
            "child": child,
            "outcome": "failed",
            "error": err.to_string(),
        }),
    }
}
