use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "energy-accumulator",
    version,
    about = "Integrates power sensors into persisted kWh, daily and monthly totals"
)]
pub struct Args {
    /// Options document; overrides ENERGY_OPTIONS_PATH.
    #[arg(long)]
    pub options: Option<PathBuf>,
    /// HTTP bind address; overrides ENERGY_HTTP_BIND.
    #[arg(long)]
    pub bind: Option<String>,
    /// Accumulator storage document; overrides ENERGY_STORAGE_PATH.
    #[arg(long)]
    pub storage: Option<PathBuf>,
}
