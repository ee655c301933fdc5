use clap::{Parser, Subcommand};
use confluence::capture_merger::MergeOutcome;
use confluence::config::{RunManifest, RunPlan};
use confluence::{pipeline, MergeError};
use dotenv::dotenv;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "confluence")]
#[command(about = "Merge redundant stream captures into one deduplicated timeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge capture shards into per-capture timelines
    Merge {
        /// Run manifest (JSON)
        manifest: PathBuf,
        /// Only merge this capture
        #[arg(long)]
        capture: Option<String>,
        /// Archive root, overrides CONFLUENCE_ARCHIVE_DIR and the manifest
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Union merged capture timelines into the global timeline
    Union {
        manifest: PathBuf,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Report completeness from existing artifacts
    Report {
        manifest: PathBuf,
        /// Write the report here instead of the archive default
        #[arg(long)]
        json: Option<PathBuf>,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Merge, union and report
    Run {
        manifest: PathBuf,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
}

fn load_plan(manifest: &Path, archive_dir: Option<&Path>) -> Result<RunPlan, MergeError> {
    let manifest = RunManifest::load(manifest)?;
    let plan = RunPlan::resolve(&manifest, archive_dir)?;
    println!(
        "[confluence] {} captures ({}) under {}",
        plan.captures.len(),
        plan.captures.iter().map(|c| c.name.as_str()).join(", "),
        plan.archive_dir.display()
    );
    Ok(plan)
}

fn print_merge(outcome: &MergeOutcome) {
    let s = &outcome.stats;
    println!(
        "[confluence] merged {}: {} posts, {} drops, {} duplicates, {} shards ({} skipped), {} malformed lines -> {}",
        outcome.capture,
        s.posts_written,
        s.drops_written,
        s.duplicate_posts,
        s.shards_read,
        s.shards_skipped,
        s.malformed_lines,
        outcome.artifact.display()
    );
}

fn run(cli: Cli) -> Result<(), MergeError> {
    match cli.command {
        Commands::Merge { manifest, capture, archive_dir } => {
            let plan = load_plan(&manifest, archive_dir.as_deref())?;
            match capture {
                Some(name) => print_merge(&pipeline::merge_one(&plan, &name)?),
                None => pipeline::merge_all(&plan)?.iter().for_each(print_merge),
            }
        }
        Commands::Union { manifest, archive_dir } => {
            let plan = load_plan(&manifest, archive_dir.as_deref())?;
            let outcome = pipeline::union(&plan)?;
            println!(
                "[confluence] global timeline: {} unique posts, {} cross-capture duplicates -> {}",
                outcome.unique_count,
                outcome.duplicate_posts,
                outcome.artifact.display()
            );
        }
        Commands::Report { manifest, json, archive_dir } => {
            let plan = load_plan(&manifest, archive_dir.as_deref())?;
            let report = pipeline::build_report(&plan)?;
            report.print();
            let path = json.unwrap_or_else(|| plan.report_path.clone());
            report.write_json(&path)?;
            println!("[confluence] report written to {}", path.display());
        }
        Commands::Run { manifest, archive_dir } => {
            let plan = load_plan(&manifest, archive_dir.as_deref())?;
            let report = pipeline::run_all(&plan)?;
            report.print();
            println!("[confluence] report written to {}", plan.report_path.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    confluence::init_tracing("confluence");

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[confluence] {}", e);
            ExitCode::FAILURE
        }
    }
}
