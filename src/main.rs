mod collectors;
mod config;
mod driver;
mod exporter;
mod format;
mod host;
mod logging;
mod metrics;
mod server;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::collectors::ScrapeOrchestrator;
use crate::config::Cli;
use crate::driver::GpuDriver;
use crate::driver::nvml::NvmlDriver;
use crate::format::OutputFormat;
use crate::host::{HostAccounting, SysinfoHost};
use crate::metrics::Snapshot;

/// Delay between the baseline and the reported scrape of `--once`, so CPU
/// percentages have an interval to be computed over.
const WARMUP: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    exit_code(run(cli))
}

/// Reports a fatal error once, through the log, and maps it to a failing status.
fn exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let driver: Arc<dyn GpuDriver> = Arc::new(NvmlDriver::new());
    let host: Arc<dyn HostAccounting> = Arc::new(SysinfoHost::new());
    let hostname = host::resolve_hostname();
    info!(%hostname, version = env!("CARGO_PKG_VERSION"), "starting nvidia gpu exporter");

    let registry = collectors::default_registry(driver, host, hostname);
    let orchestrator = ScrapeOrchestrator::new(&registry).context("couldn't create collector")?;

    if cli.once {
        return scrape_once(&orchestrator, cli.format);
    }

    let registry = exporter::registry(orchestrator).context("couldn't register nvidia gpu collector")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("couldn't start async runtime")?;
    runtime.block_on(server::serve(&cli.web, registry))
}

fn scrape_once(orchestrator: &ScrapeOrchestrator, format: OutputFormat) -> anyhow::Result<()> {
    orchestrator.collect();
    std::thread::sleep(WARMUP);
    let samples = orchestrator.collect();

    let output = match format {
        OutputFormat::Text => exporter::encode_families(&exporter::families(&samples)),
        OutputFormat::Json => {
            let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            let mut json = serde_json::to_vec_pretty(&Snapshot::new(timestamp, &samples))?;
            json.push(b'\n');
            json
        }
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&output).context("couldn't write scrape to stdout")?;
    stdout.flush()?;
    Ok(())
}
