use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::coverage::CoverageLimits;
use crate::ors::{DEFAULT_ORS_BASE_URL, OrsSettings};

#[derive(Parser, Debug)]
#[command(name = "health-map-backend")]
#[command(about = "Hospital coverage backend (isochrone aggregation with geometric fallback)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the coverage HTTP API.
    Serve(ServeArgs),
    /// Compute coverage for a locations document and print the FeatureCollection.
    Coverage(CoverageArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct UpstreamArgs {
    /// OpenRouteService API key, sent in the Authorization header.
    #[arg(long, env = "ORS_API_KEY", hide_env_values = true)]
    pub ors_api_key: Option<String>,

    #[arg(long, env = "ORS_BASE_URL", default_value = DEFAULT_ORS_BASE_URL)]
    pub ors_base_url: String,

    /// Per-request timeout for isochrone calls.
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout_secs: u64,
}

impl UpstreamArgs {
    pub fn settings(&self) -> OrsSettings {
        OrsSettings {
            api_key: self.ors_api_key.clone(),
            base_url: self.ors_base_url.clone(),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct LimitArgs {
    /// Inputs longer than this are downsampled with a fixed stride.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_locations: u32,

    /// Locations sent per isochrone request.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,

    /// Wait before the single retry of a rate-limited batch.
    #[arg(long, default_value_t = 1000)]
    pub rate_limit_backoff_ms: u64,
}

impl LimitArgs {
    pub fn limits(&self) -> CoverageLimits {
        CoverageLimits {
            max_locations: self.max_locations as usize,
            batch_size: self.batch_size as usize,
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,

    /// Start even without an API key; coverage requests then answer 500.
    #[arg(long)]
    pub allow_unconfigured: bool,

    #[command(flatten)]
    pub upstream: UpstreamArgs,

    #[command(flatten)]
    pub limits: LimitArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CoverageArgs {
    /// JSON document of the form {"locations": [[lon, lat], ...]}. Reads stdin when omitted.
    #[arg(long)]
    pub input: Option<std::path::PathBuf>,

    /// Write the FeatureCollection here instead of stdout.
    #[arg(long)]
    pub output: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
    pub minutes: u32,

    #[arg(long, default_value = "driving-car")]
    pub profile: String,

    #[arg(long, default_value_t = 30.0)]
    pub generalize: f64,

    /// Skip the routing service and emit the geometric approximation.
    #[arg(long)]
    pub offline: bool,

    /// Pretty-print the output.
    #[arg(long)]
    pub pretty: bool,

    #[command(flatten)]
    pub upstream: UpstreamArgs,

    #[command(flatten)]
    pub limits: LimitArgs,
}
