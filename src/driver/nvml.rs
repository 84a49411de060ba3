use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::{Device, Nvml};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ContextKind, DriverError, FieldGroupId, FieldId, FieldValue, GpuDriver, RunningProcess, WatchId};
use crate::metrics::{GPUIndex, Pid};

const PROCESS_NAME_LENGTH: usize = 64;

fn classify(op: &str, err: NvmlError) -> DriverError {
    let op = op.to_string();
    let reason = err.to_string();
    match err {
        NvmlError::NotSupported | NvmlError::NoPermission | NvmlError::NotFound => {
            DriverError::Unsupported { op, reason }
        }
        NvmlError::Uninitialized
        | NvmlError::LibraryNotFound
        | NvmlError::DriverNotLoaded
        | NvmlError::LibloadingError(_)
        | NvmlError::Unknown => DriverError::Unavailable { op, reason },
        _ => DriverError::Fault { op, reason },
    }
}

/// NVML-backed driver.
///
/// The library is loaded on first use and loading is retried on every call
/// until it succeeds, so the exporter starts on hosts without a driver and
/// reports "no data" instead. NVML has no server-side field groups; groups and
/// watches are tracked here so the protocol stays checked.
pub struct NvmlDriver {
    nvml: OnceCell<Nvml>,
    groups: Mutex<HashMap<FieldGroupId, Vec<FieldId>>>,
    watches: Mutex<HashMap<WatchId, (GPUIndex, FieldGroupId)>>,
    next_handle: AtomicU64,
}

impl NvmlDriver {
    pub fn new() -> Self {
        Self {
            nvml: OnceCell::new(),
            groups: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn nvml(&self) -> Result<&Nvml, DriverError> {
        self.nvml.get_or_try_init(|| {
            let nvml = Nvml::init().map_err(|e| classify("nvml init", e))?;
            info!("NVML initialized");
            Ok(nvml)
        })
    }

    fn device(&self, gpu: GPUIndex) -> Result<Device<'_>, DriverError> {
        self.nvml()?
            .device_by_index(gpu)
            .map_err(|e| classify(&format!("nvml device handle (index={gpu})"), e))
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NvmlDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn running(processes: Vec<ProcessInfo>) -> Vec<RunningProcess> {
    processes
        .into_iter()
        .map(|info| RunningProcess {
            pid: info.pid,
            used_memory: match info.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => Some(bytes),
                UsedGpuMemory::Unavailable => None,
            },
        })
        .collect()
}

impl GpuDriver for NvmlDriver {
    fn device_count(&self) -> Result<u32, DriverError> {
        self.nvml()?
            .device_count()
            .map_err(|e| classify("nvml device count", e))
    }

    fn device_name(&self, gpu: GPUIndex) -> Result<String, DriverError> {
        self.device(gpu)?
            .name()
            .map_err(|e| classify(&format!("nvml device name (index={gpu})"), e))
    }

    fn running_processes(
        &self,
        gpu: GPUIndex,
        kind: ContextKind,
    ) -> Result<Vec<RunningProcess>, DriverError> {
        let device = self.device(gpu)?;
        let processes = match kind {
            ContextKind::Compute => device.running_compute_processes(),
            ContextKind::Graphics => device.running_graphics_processes(),
        };
        processes
            .map(running)
            .map_err(|e| classify(&format!("nvml {kind} running processes (gpu={gpu})"), e))
    }

    fn process_name(&self, pid: Pid) -> Option<String> {
        self.nvml()
            .ok()?
            .sys_process_name(pid, PROCESS_NAME_LENGTH)
            .ok()
    }

    fn create_field_group(&self, name: &str, fields: &[FieldId]) -> Result<FieldGroupId, DriverError> {
        let id = FieldGroupId(self.handle());
        self.groups.lock().insert(id, fields.to_vec());
        debug!(group = id.0, name, "created field group");
        Ok(id)
    }

    fn destroy_field_group(&self, group: FieldGroupId) -> Result<(), DriverError> {
        if self.watches.lock().values().any(|(_, g)| *g == group) {
            return Err(DriverError::fault("destroy field group", "group is still watched"));
        }
        match self.groups.lock().remove(&group) {
            Some(_) => Ok(()),
            None => Err(DriverError::fault("destroy field group", format!("unknown group {}", group.0))),
        }
    }

    fn watch_fields(
        &self,
        gpu: GPUIndex,
        group: FieldGroupId,
        name: &str,
    ) -> Result<WatchId, DriverError> {
        if !self.groups.lock().contains_key(&group) {
            return Err(DriverError::fault("watch fields", format!("unknown group {}", group.0)));
        }
        // Fail early on a bad index instead of at read time.
        self.device(gpu)?;
        let id = WatchId(self.handle());
        self.watches.lock().insert(id, (gpu, group));
        debug!(gpu_id = gpu, watch = id.0, name, "watching fields");
        Ok(id)
    }

    fn destroy_watch(&self, watch: WatchId) -> Result<(), DriverError> {
        match self.watches.lock().remove(&watch) {
            Some(_) => Ok(()),
            None => Err(DriverError::fault("destroy watch", format!("unknown watch {}", watch.0))),
        }
    }

    fn latest_values(&self, gpu: GPUIndex, fields: &[FieldId]) -> Result<Vec<FieldValue>, DriverError> {
        let device = self.device(gpu)?;
        let memory = device.memory_info().ok();
        let utilization = device.utilization_rates().ok();

        let values = fields
            .iter()
            .map(|&field| {
                let value = match field {
                    FieldId::FbFree => memory.as_ref().and_then(|m| i64::try_from(m.free).ok()),
                    FieldId::FbUsed => memory.as_ref().and_then(|m| i64::try_from(m.used).ok()),
                    FieldId::FbTotal => memory.as_ref().and_then(|m| i64::try_from(m.total).ok()),
                    FieldId::GpuTemp => device.temperature(TemperatureSensor::Gpu).ok().map(i64::from),
                    FieldId::GpuUtil => utilization.as_ref().map(|u| i64::from(u.gpu)),
                    FieldId::MemCopyUtil => utilization.as_ref().map(|u| i64::from(u.memory)),
                };
                FieldValue { field, value }
            })
            .collect();

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn availability_errors_are_not_faults() {
        assert!(classify("nvml init", NvmlError::LibraryNotFound).is_unavailable());
        assert!(classify("nvml init", NvmlError::DriverNotLoaded).is_unavailable());
        assert!(classify("processes", NvmlError::NoPermission).is_unsupported());
        assert!(!classify("processes", NvmlError::GpuLost).is_unavailable());
    }

    #[test]
    fn field_group_protocol_is_enforced() {
        let driver = NvmlDriver::new();
        let group = driver.create_field_group("fields", &[FieldId::GpuTemp]).unwrap();
        let watch = WatchId(999);

        assert_eq!(
            driver.watch_fields(0, FieldGroupId(12345), "watch").unwrap_err(),
            DriverError::fault("watch fields", "unknown group 12345")
        );
        assert!(driver.destroy_watch(watch).is_err());
        driver.destroy_field_group(group).unwrap();
        assert!(driver.destroy_field_group(group).is_err());
    }
}
