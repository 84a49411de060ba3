use clap::{Args, Parser};
use tracing_subscriber::filter::LevelFilter;

use crate::format::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "nvidia-gpu-exporter")]
#[command(about = "Prometheus exporter for NVIDIA GPU device and process telemetry", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub web: WebArgs,

    /// Minimum log level; RUST_LOG takes precedence when set
    #[arg(long = "log.level", env = "GPU_EXPORTER_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,

    /// Scrape once, print the result and exit without serving
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Output format of --once
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct WebArgs {
    /// Address to listen on
    #[arg(long = "web.listen-address", env = "GPU_EXPORTER_LISTEN_ADDRESS", default_value = ":9432")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", env = "GPU_EXPORTER_TELEMETRY_PATH", default_value = "/metrics")]
    pub telemetry_path: String,

    /// Maximum number of parallel scrape requests. Use 0 to disable
    #[arg(long = "web.max-requests", env = "GPU_EXPORTER_MAX_REQUESTS", default_value_t = 40)]
    pub max_requests: usize,
}

impl WebArgs {
    /// `:port` binds every interface.
    pub fn socket_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }
}
