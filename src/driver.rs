//! GPU driver seam.
//!
//! Collectors only talk to the driver through [`GpuDriver`], so the NVML
//! binding in [`nvml`] can be swapped for a fake in tests. The field-group and
//! watch handles are wrapped in [`FieldGroup`] and [`FieldWatch`], which
//! release the driver-side handle when dropped.

pub mod nvml;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::metrics::{GPUIndex, Pid};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The query exists but this device, context or caller cannot use it.
    #[error("{op}: not supported ({reason})")]
    Unsupported { op: String, reason: String },

    /// The driver or library is missing or not initialized.
    #[error("{op}: gpu driver unavailable ({reason})")]
    Unavailable { op: String, reason: String },

    #[error("{op}: {reason}")]
    Fault { op: String, reason: String },
}

impl DriverError {
    pub fn fault(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fault {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// True for anything that means "no data from this driver right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unsupported { .. } | Self::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Compute,
    Graphics,
}

impl ContextKind {
    pub const ALL: [ContextKind; 2] = [ContextKind::Compute, ContextKind::Graphics];
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::Compute => f.write_str("compute"),
            ContextKind::Graphics => f.write_str("graphics"),
        }
    }
}

/// Per-device telemetry fields. Memory fields are reported in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    FbFree,
    FbUsed,
    FbTotal,
    GpuTemp,
    GpuUtil,
    MemCopyUtil,
}

/// Latest value of one field; `None` when the driver marks it blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldValue {
    pub field: FieldId,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: Pid,
    /// `None` when the driver cannot attribute memory to the process.
    pub used_memory: Option<u64>,
}

pub trait GpuDriver: Send + Sync {
    fn device_count(&self) -> Result<u32, DriverError>;

    fn device_name(&self, gpu: GPUIndex) -> Result<String, DriverError>;

    fn running_processes(
        &self,
        gpu: GPUIndex,
        kind: ContextKind,
    ) -> Result<Vec<RunningProcess>, DriverError>;

    /// Process name as seen by the driver, used as a label fallback.
    fn process_name(&self, pid: Pid) -> Option<String>;

    fn create_field_group(&self, name: &str, fields: &[FieldId]) -> Result<FieldGroupId, DriverError>;

    fn destroy_field_group(&self, group: FieldGroupId) -> Result<(), DriverError>;

    fn watch_fields(
        &self,
        gpu: GPUIndex,
        group: FieldGroupId,
        name: &str,
    ) -> Result<WatchId, DriverError>;

    fn destroy_watch(&self, watch: WatchId) -> Result<(), DriverError>;

    fn latest_values(&self, gpu: GPUIndex, fields: &[FieldId]) -> Result<Vec<FieldValue>, DriverError>;
}

/// Field group that is destroyed on drop.
pub struct FieldGroup<'a> {
    driver: &'a dyn GpuDriver,
    id: FieldGroupId,
}

impl<'a> FieldGroup<'a> {
    pub fn create(driver: &'a dyn GpuDriver, name: &str, fields: &[FieldId]) -> Result<Self, DriverError> {
        let id = driver.create_field_group(name, fields)?;
        Ok(Self { driver, id })
    }

    pub fn id(&self) -> FieldGroupId {
        self.id
    }
}

impl Drop for FieldGroup<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.destroy_field_group(self.id) {
            debug!(group = self.id.0, %err, "failed to destroy field group");
        }
    }
}

/// Watch on a field group for one device, destroyed on drop.
///
/// Declare it after the [`FieldGroup`] it watches so it is released first.
pub struct FieldWatch<'a> {
    driver: &'a dyn GpuDriver,
    id: WatchId,
    gpu: GPUIndex,
}

impl<'a> FieldWatch<'a> {
    pub fn start(
        driver: &'a dyn GpuDriver,
        gpu: GPUIndex,
        group: &FieldGroup<'_>,
        name: &str,
    ) -> Result<Self, DriverError> {
        let id = driver.watch_fields(gpu, group.id(), name)?;
        Ok(Self { driver, id, gpu })
    }
}

impl Drop for FieldWatch<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.destroy_watch(self.id) {
            debug!(gpu_id = self.gpu, watch = self.id.0, %err, "failed to destroy field watch");
        }
    }
}

/// One process holding a context on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcessUsage {
    pub gpu: GPUIndex,
    pub pid: Pid,
    pub used_memory: Option<u64>,
}

/// Lists every process with a compute or graphics context on any device.
///
/// A pid appears at most once per device; when it holds both context kinds the
/// larger memory reading wins. A context kind the device cannot report is
/// treated as empty, any other failure aborts the listing.
pub fn active_processes(driver: &dyn GpuDriver) -> Result<Vec<GpuProcessUsage>, DriverError> {
    let count = driver.device_count()?;
    let mut usages = Vec::new();

    for gpu in 0..count {
        let mut by_pid: BTreeMap<Pid, Option<u64>> = BTreeMap::new();

        for kind in ContextKind::ALL {
            let processes = match driver.running_processes(gpu, kind) {
                Ok(processes) => processes,
                Err(err) if err.is_unsupported() => {
                    debug!(gpu_index = gpu, %kind, %err, "gpu process info unavailable");
                    continue;
                }
                Err(err) => return Err(err),
            };

            for process in processes {
                if process.pid == 0 {
                    continue;
                }
                by_pid
                    .entry(process.pid)
                    .and_modify(|memory| *memory = (*memory).max(process.used_memory))
                    .or_insert(process.used_memory);
            }
        }

        usages.extend(by_pid.into_iter().map(|(pid, used_memory)| GpuProcessUsage {
            gpu,
            pid,
            used_memory,
        }));
    }

    Ok(usages)
}
