use clap::{Parser, Subcommand};
use confluence::config::DEFAULT_DROP_OFFSET_MS;
use confluence::snowflake::{self, Snowflake};
use confluence::MergeError;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "snowflake_util")]
#[command(about = "Inspect and build snowflake-style identifiers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode one or more identifiers
    Decode {
        ids: Vec<u64>,
    },
    /// Encode an identifier from its fields
    Encode {
        timestamp_ms: i64,
        datacenter_id: u8,
        worker_id: u8,
        sequence: u16,
    },
    /// Synthetic key for a drop event
    Synthetic {
        arrival_ms: i64,
        capture_index: usize,
        #[arg(long, default_value_t = DEFAULT_DROP_OFFSET_MS)]
        offset_ms: i64,
    },
}

fn describe(id: u64) -> String {
    let s = Snowflake::decode(id);
    format!(
        "{} ts={} dc={} worker={} seq={}{}",
        id,
        s.timestamp_ms,
        s.datacenter_id,
        s.worker_id,
        s.sequence,
        if s.is_synthetic() { " (synthetic)" } else { "" }
    )
}

fn run(cli: Cli) -> Result<(), MergeError> {
    match cli.command {
        Commands::Decode { ids } => {
            for id in ids {
                println!("{}", describe(id));
            }
        }
        Commands::Encode { timestamp_ms, datacenter_id, worker_id, sequence } => {
            let id = snowflake::encode(timestamp_ms, datacenter_id, worker_id, sequence)?;
            println!("{}", describe(id));
        }
        Commands::Synthetic { arrival_ms, capture_index, offset_ms } => {
            let id = snowflake::synthetic_key(arrival_ms, capture_index, offset_ms)?;
            println!("{}", describe(id));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[snowflake_util] {}", e);
            ExitCode::FAILURE
        }
    }
}
