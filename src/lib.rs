pub mod buckets;
pub mod capture_merger;
pub mod config;
pub mod error;
pub mod estimator;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod run_store;
pub mod shard;
pub mod snowflake;
pub mod unioner;

pub use error::*;

use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(service = service_name, "tracing initialized");
    }
}
