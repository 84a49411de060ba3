use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

use crate::metrics::Pid;

pub const UNKNOWN_LABEL: &str = "unknown";

/// Clock ticks per second used by /proc/stat.
const USER_HZ: f64 = 100.0;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{0} unavailable")]
    Unavailable(&'static str),
}

/// What the host knows about one process at the time of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStat {
    pub name: String,
    pub command: String,
    /// Real user id, when the credential could be read.
    pub uid: Option<u32>,
    pub memory_percent: f64,
    /// Cumulative user + system CPU-seconds.
    pub cpu_seconds: f64,
}

pub trait HostAccounting: Send + Sync {
    fn process_stat(&self, pid: Pid) -> Result<ProcessStat, HostError>;

    /// Cumulative system-wide CPU-seconds across every accounting category.
    fn total_cpu_seconds(&self) -> Result<f64, HostError>;

    /// Number of CPUs covered by [`HostAccounting::total_cpu_seconds`].
    fn logical_cpus(&self) -> usize;

    /// Node CPU utilization since the previous call, in percent.
    fn node_cpu_percent(&self) -> Result<f64, HostError>;

    /// Node memory in use, in percent of total.
    fn node_memory_percent(&self) -> Result<f64, HostError>;
}

/// Host accounting backed by `sysinfo` and `/proc/stat`.
pub struct SysinfoHost {
    system: Mutex<System>,
    proc_stat: PathBuf,
}

impl SysinfoHost {
    pub fn new() -> Self {
        Self::with_proc_stat("/proc/stat")
    }

    pub fn with_proc_stat(path: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            proc_stat: path.into(),
        }
    }
}

impl Default for SysinfoHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAccounting for SysinfoHost {
    fn process_stat(&self, pid: Pid) -> Result<ProcessStat, HostError> {
        let sys_pid = sysinfo::Pid::from_u32(pid);
        let mut system = self.system.lock();

        // Also include cached PIDs so exited processes get dropped.
        let mut pids: Vec<sysinfo::Pid> = system.processes().keys().copied().collect();
        if !pids.contains(&sys_pid) {
            pids.push(sys_pid);
        }
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, process_refresh_kind());
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        let total_memory = system.total_memory();

        let process = system.process(sys_pid).ok_or(HostError::ProcessNotFound(pid))?;

        let command = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        let memory_percent = if total_memory > 0 {
            process.memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProcessStat {
            name: process.name().to_string_lossy().into_owned(),
            command,
            uid: process.user_id().map(|uid| **uid),
            memory_percent,
            cpu_seconds: process.accumulated_cpu_time() as f64 / 1000.0,
        })
    }

    fn total_cpu_seconds(&self) -> Result<f64, HostError> {
        read_total_cpu_seconds(&self.proc_stat)
    }

    fn logical_cpus(&self) -> usize {
        match read_cpu_stat(&self.proc_stat) {
            Ok(stat) if stat.cpus > 0 => stat.cpus,
            _ => {
                let mut system = self.system.lock();
                system.refresh_cpu_list(CpuRefreshKind::nothing());
                system.cpus().len().max(1)
            }
        }
    }

    fn node_cpu_percent(&self) -> Result<f64, HostError> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        if system.cpus().is_empty() {
            return Err(HostError::Unavailable("cpu usage"));
        }
        Ok(f64::from(system.global_cpu_usage()))
    }

    fn node_memory_percent(&self) -> Result<f64, HostError> {
        let mut system = self.system.lock();
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        memory_percent(system.used_memory(), system.total_memory())
    }
}

#[cfg(test)]
impl SysinfoHost {
    fn cached_pids(&self) -> Vec<Pid> {
        self.system.lock().processes().keys().map(|pid| pid.as_u32()).collect()
    }
}

fn process_refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_cpu()
        .with_memory()
        .with_cmd(UpdateKind::Always)
        .with_user(UpdateKind::Always)
}

fn memory_percent(used: u64, total: u64) -> Result<f64, HostError> {
    if total == 0 {
        return Err(HostError::Unavailable("memory usage"));
    }
    Ok(used as f64 / total as f64 * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuStat {
    total_seconds: f64,
    /// Per-CPU `cpuN` lines next to the aggregate one.
    cpus: usize,
}

fn read_total_cpu_seconds(path: &Path) -> Result<f64, HostError> {
    read_cpu_stat(path).map(|stat| stat.total_seconds)
}

fn read_cpu_stat(path: &Path) -> Result<CpuStat, HostError> {
    let display = path.display().to_string();
    let stat = fs::read_to_string(path).map_err(|source| HostError::Io {
        path: display.clone(),
        source,
    })?;

    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| HostError::Parse {
            path: display.clone(),
            reason: "no aggregate cpu line".to_string(),
        })?;

    let total_seconds = parse_cpu_line(line).ok_or(HostError::Parse {
        path: display,
        reason: format!("bad cpu line {line:?}"),
    })?;

    let cpus = stat
        .lines()
        .filter_map(|line| line.strip_prefix("cpu"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .count();

    Ok(CpuStat { total_seconds, cpus })
}

// user nice system idle iowait irq softirq steal guest guest_nice, in ticks.
// Older kernels report fewer columns.
fn parse_cpu_line(line: &str) -> Option<f64> {
    let mut ticks = 0u64;
    let mut columns = 0;
    for part in line.split_whitespace().skip(1).take(10) {
        ticks = ticks.checked_add(part.parse::<u64>().ok()?)?;
        columns += 1;
    }
    if columns < 4 {
        return None;
    }
    Some(ticks as f64 / USER_HZ)
}

/// Host label for every series: `NODE_NAME`, then the OS hostname, then "unknown".
pub fn resolve_hostname() -> String {
    hostname_from(std::env::var("NODE_NAME").ok(), System::host_name())
}

fn hostname_from(node_name: Option<String>, os_hostname: Option<String>) -> String {
    [node_name, os_hostname]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
}
