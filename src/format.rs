use clap::ValueEnum;

/// Output of a one-shot scrape.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Prometheus text exposition format
    Text,
    /// Pretty-printed JSON snapshot
    Json,
}
