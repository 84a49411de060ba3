use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{Collector, CollectorError};
use crate::driver::{self, GpuDriver};
use crate::host::{HostAccounting, ProcessStat, UNKNOWN_LABEL};
use crate::metrics::{MetricDesc, Pid, Sample};

pub const NAME: &str = "gpu_process";

const SUBSYSTEM: &str = "process";
const MAX_COMMAND_LABEL_LENGTH: usize = 200;
const LABELS: [&str; 6] = ["hostname", "gpu_id", "pid", "process_name", "uid", "command"];

#[derive(Debug, Clone, Copy)]
struct ProcessSample {
    cpu_seconds: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SystemCpuSample {
    total_seconds: f64,
    initialized: bool,
}

/// Everything carried from one scrape cycle to the next.
#[derive(Debug, Default)]
struct CorrelatorState {
    cpu_samples: HashMap<Pid, ProcessSample>,
    system_sample: SystemCpuSample,
}

impl CorrelatorState {
    fn reset(&mut self) {
        self.cpu_samples.clear();
        self.system_sample = SystemCpuSample::default();
    }

    /// Stores `total` and returns the positive delta against the previous sample.
    fn update_system_sample(&mut self, total: f64) -> Option<f64> {
        let previous = self.system_sample;
        self.system_sample = SystemCpuSample {
            total_seconds: total,
            initialized: true,
        };
        if !previous.initialized {
            return None;
        }
        let delta = (total - previous.total_seconds).max(0.0);
        (delta > 0.0).then_some(delta)
    }

    fn process_cpu_percent(
        &mut self,
        pid: Pid,
        cpu_seconds: f64,
        system_delta: Option<f64>,
        logical_cpus: usize,
    ) -> f64 {
        let previous = self.cpu_samples.insert(pid, ProcessSample { cpu_seconds });
        let (Some(previous), Some(system_delta)) = (previous, system_delta) else {
            return 0.0;
        };
        let process_delta = cpu_seconds - previous.cpu_seconds;
        if process_delta <= 0.0 {
            return 0.0;
        }
        process_delta / system_delta * logical_cpus as f64 * 100.0
    }

    fn forget(&mut self, pid: Pid) {
        self.cpu_samples.remove(&pid);
    }

    fn prune(&mut self, active: &HashSet<Pid>) {
        self.cpu_samples.retain(|pid, _| active.contains(pid));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessMetadata {
    name: String,
    uid: String,
    command: String,
}

impl ProcessMetadata {
    fn derive(stat: &ProcessStat, gpu_name: &str) -> Self {
        let uid = stat.uid.map(|uid| uid.to_string()).unwrap_or_default();
        let name = stat.name.as_str();
        let command = first_non_empty(&[stat.command.as_str(), name, gpu_name, UNKNOWN_LABEL]);
        Self {
            name: first_non_empty(&[name, gpu_name, UNKNOWN_LABEL]),
            uid: first_non_empty(&[uid.as_str(), UNKNOWN_LABEL]),
            command: truncate_chars(&command, MAX_COMMAND_LABEL_LENGTH),
        }
    }
}

/// Per-pid values shared by every device entry of that pid in one cycle.
struct ProcessReading {
    metadata: ProcessMetadata,
    cpu_percent: f64,
    memory_percent: f64,
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn truncate_chars(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

fn sanitize_bytes(value: Option<u64>) -> f64 {
    match value {
        Some(bytes) if bytes > 0 => bytes as f64,
        _ => 0.0,
    }
}

/// Joins GPU process listings with host accounting to report per-process
/// GPU memory, CPU and memory usage.
///
/// CPU usage is derived from the growth of the process and system CPU-time
/// counters between two scrapes, so the state lives across scrapes. The whole
/// cycle runs under one lock because scrapes may overlap.
pub struct GpuProcessCollector {
    process_gpu_memory: Arc<MetricDesc>,
    process_cpu: Arc<MetricDesc>,
    process_memory: Arc<MetricDesc>,
    driver: Arc<dyn GpuDriver>,
    host: Arc<dyn HostAccounting>,
    hostname: String,
    state: Mutex<CorrelatorState>,
}

impl GpuProcessCollector {
    pub fn new(driver: Arc<dyn GpuDriver>, host: Arc<dyn HostAccounting>, hostname: String) -> Self {
        Self {
            process_gpu_memory: MetricDesc::new(
                SUBSYSTEM,
                "gpu_memory",
                "GPU process memory usage in bytes.",
                &LABELS,
            ),
            process_cpu: MetricDesc::new(SUBSYSTEM, "cpu", "Process CPU usage percentage.", &LABELS),
            process_memory: MetricDesc::new(
                SUBSYSTEM,
                "memory",
                "Process memory usage percentage.",
                &LABELS,
            ),
            driver,
            host,
            hostname,
            state: Mutex::new(CorrelatorState::default()),
        }
    }

    fn observe(
        &self,
        state: &mut CorrelatorState,
        pid: Pid,
        system_delta: Option<f64>,
        logical_cpus: usize,
    ) -> Option<ProcessReading> {
        let stat = match self.host.process_stat(pid) {
            Ok(stat) => stat,
            Err(err) => {
                debug!(pid, %err, "failed to collect host process info");
                // the next reading would span two intervals
                state.forget(pid);
                return None;
            }
        };
        let gpu_name = self.driver.process_name(pid).unwrap_or_default();
        let cpu_percent = state.process_cpu_percent(pid, stat.cpu_seconds, system_delta, logical_cpus);

        Some(ProcessReading {
            metadata: ProcessMetadata::derive(&stat, &gpu_name),
            cpu_percent: non_negative(cpu_percent),
            memory_percent: non_negative(stat.memory_percent),
        })
    }

    #[cfg(test)]
    fn tracked_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.state.lock().cpu_samples.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    #[cfg(test)]
    fn has_system_sample(&self) -> bool {
        self.state.lock().system_sample.initialized
    }
}

impl Collector for GpuProcessCollector {
    fn update(&self, out: &mut Vec<Sample>) -> Result<(), CollectorError> {
        let mut state = self.state.lock();

        let usages = match driver::active_processes(self.driver.as_ref()) {
            Ok(usages) => usages,
            Err(err) if err.is_unavailable() => {
                debug!(%err, "gpu process listing unavailable");
                state.reset();
                return Err(CollectorError::NoData);
            }
            Err(err) => return Err(err.into()),
        };
        if usages.is_empty() {
            debug!("no gpu processes reported");
            state.reset();
            return Ok(());
        }

        let total_seconds = self.host.total_cpu_seconds()?;
        let system_delta = state.update_system_sample(total_seconds);
        let logical_cpus = self.host.logical_cpus();

        let mut readings: HashMap<Pid, Option<ProcessReading>> = HashMap::new();
        for usage in &usages {
            let reading = readings
                .entry(usage.pid)
                .or_insert_with(|| self.observe(&mut state, usage.pid, system_delta, logical_cpus));
            let Some(reading) = reading else {
                continue;
            };

            let gpu_id = usage.gpu.to_string();
            let pid = usage.pid.to_string();
            let labels = [
                self.hostname.as_str(),
                gpu_id.as_str(),
                pid.as_str(),
                reading.metadata.name.as_str(),
                reading.metadata.uid.as_str(),
                reading.metadata.command.as_str(),
            ];

            out.push(Sample::new(
                &self.process_gpu_memory,
                sanitize_bytes(usage.used_memory),
                &labels,
            ));
            out.push(Sample::new(&self.process_cpu, reading.cpu_percent, &labels));
            out.push(Sample::new(&self.process_memory, reading.memory_percent, &labels));
        }

        let active: HashSet<Pid> = usages.iter().map(|u| u.pid).collect();
        state.prune(&active);

        Ok(())
    }
}
