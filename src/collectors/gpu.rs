use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::{Collector, CollectorError};
use crate::driver::{FieldGroup, FieldId, FieldValue, FieldWatch, GpuDriver};
use crate::host::HostAccounting;
use crate::metrics::{GPUIndex, MetricDesc, Sample};

pub const NAME: &str = "gpu_metrics";

const SUBSYSTEM: &str = "metrics";
const LABELS: [&str; 3] = ["hostname", "gpu_id", "gpu_name"];
const NODE_LABELS: [&str; 1] = ["hostname"];

const FIELDS: [FieldId; 6] = [
    FieldId::FbFree,
    FieldId::FbUsed,
    FieldId::FbTotal,
    FieldId::GpuTemp,
    FieldId::GpuUtil,
    FieldId::MemCopyUtil,
];

fn describe(field: FieldId) -> Arc<MetricDesc> {
    let (name, help) = match field {
        FieldId::FbFree => ("free_memory", "GPU free memory in bytes."),
        FieldId::FbUsed => ("used_memory", "GPU used memory in bytes."),
        FieldId::FbTotal => ("total_memory", "GPU total memory in bytes."),
        FieldId::GpuTemp => ("temperature", "GPU temperature in Celsius."),
        FieldId::GpuUtil => ("gpu_utilization", "GPU utilization percentage."),
        FieldId::MemCopyUtil => ("memory_copy_utilization", "GPU memory copy utilization percentage."),
    };
    MetricDesc::new(SUBSYSTEM, name, help, &LABELS)
}

fn display_name(gpu: GPUIndex, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        format!("gpu-{gpu}")
    } else {
        name.to_string()
    }
}

/// Per-device memory, temperature and utilization gauges, plus node CPU and
/// memory utilization.
pub struct GpuMetricsCollector {
    series: Vec<(FieldId, Arc<MetricDesc>)>,
    node_cpu: Arc<MetricDesc>,
    node_memory: Arc<MetricDesc>,
    driver: Arc<dyn GpuDriver>,
    host: Arc<dyn HostAccounting>,
    hostname: String,
    sequence: AtomicU64,
}

impl GpuMetricsCollector {
    pub fn new(driver: Arc<dyn GpuDriver>, host: Arc<dyn HostAccounting>, hostname: String) -> Self {
        Self {
            series: FIELDS.iter().map(|&field| (field, describe(field))).collect(),
            node_cpu: MetricDesc::new(
                SUBSYSTEM,
                "cpu_utilization",
                "Node total CPU utilization percentage.",
                &NODE_LABELS,
            ),
            node_memory: MetricDesc::new(
                SUBSYSTEM,
                "memory_utilization",
                "Node total memory utilization percentage.",
                &NODE_LABELS,
            ),
            driver,
            host,
            hostname,
            sequence: AtomicU64::new(0),
        }
    }

    /// Node readings are best effort; a failed read only drops that gauge.
    fn emit_node(&self, out: &mut Vec<Sample>) {
        let labels = [self.hostname.as_str()];
        match self.host.node_cpu_percent() {
            Ok(percent) => out.push(Sample::new(&self.node_cpu, percent, &labels)),
            Err(err) => debug!(%err, "failed to read node cpu utilization"),
        }
        match self.host.node_memory_percent() {
            Ok(percent) => out.push(Sample::new(&self.node_memory, percent, &labels)),
            Err(err) => debug!(%err, "failed to read node memory utilization"),
        }
    }

    fn emit(&self, out: &mut Vec<Sample>, gpu: GPUIndex, name: &str, values: Vec<FieldValue>) {
        let values: BTreeMap<FieldId, i64> = values
            .into_iter()
            .filter_map(|v| v.value.map(|value| (v.field, value)))
            .collect();

        let gpu_id = gpu.to_string();
        let labels = [self.hostname.as_str(), gpu_id.as_str(), name];
        for (field, desc) in &self.series {
            if let Some(&value) = values.get(field) {
                out.push(Sample::new(desc, value as f64, &labels));
            }
        }
    }
}

impl Collector for GpuMetricsCollector {
    /// One field group per cycle, one watch per device. Failing to set up
    /// either aborts the cycle; a failed read only skips that device.
    fn update(&self, out: &mut Vec<Sample>) -> Result<(), CollectorError> {
        let driver = self.driver.as_ref();
        let count = match driver.device_count() {
            Ok(count) => count,
            Err(err) if err.is_unavailable() => {
                debug!(%err, "gpu device listing unavailable");
                return Err(CollectorError::NoData);
            }
            Err(err) => return Err(err.into()),
        };
        if count == 0 {
            warn!("driver did not report any GPUs on this node");
            return Ok(());
        }

        let cycle = self.sequence.fetch_add(1, Ordering::Relaxed);
        let group = FieldGroup::create(driver, &format!("gpu-metrics-fields-{cycle}"), &FIELDS)?;

        for gpu in 0..count {
            let name = match driver.device_name(gpu) {
                Ok(name) => display_name(gpu, &name),
                Err(err) => {
                    warn!(gpu_id = gpu, %err, "failed to query device info");
                    continue;
                }
            };

            let _watch = FieldWatch::start(driver, gpu, &group, &format!("gpu-metrics-watch-{gpu}-{cycle}"))?;
            match driver.latest_values(gpu, &FIELDS) {
                Ok(values) => self.emit(out, gpu, &name, values),
                Err(err) => warn!(gpu_id = gpu, %err, "failed to collect field values"),
            }
        }

        self.emit_node(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::driver::DriverError;
    use crate::driver::fake::{FakeDevice, FakeDriver};
    use crate::host::fake::FakeHost;

    const GIB: i64 = 1 << 30;

    fn all_fields() -> Vec<(FieldId, Option<i64>)> {
        vec![
            (FieldId::FbFree, Some(30 * GIB)),
            (FieldId::FbUsed, Some(10 * GIB)),
            (FieldId::FbTotal, Some(40 * GIB)),
            (FieldId::GpuTemp, Some(64)),
            (FieldId::GpuUtil, Some(97)),
            (FieldId::MemCopyUtil, Some(41)),
        ]
    }

    fn collect_with(driver: Arc<FakeDriver>, host: Arc<FakeHost>) -> Result<Vec<Sample>, CollectorError> {
        let collector = GpuMetricsCollector::new(driver, host, "node-1".to_string());
        let mut out = Vec::new();
        collector.update(&mut out).map(|()| out)
    }

    fn collect(driver: Arc<FakeDriver>) -> Result<Vec<Sample>, CollectorError> {
        collect_with(driver, Arc::new(FakeHost::default()))
    }

    fn names(samples: &[Sample]) -> Vec<&str> {
        samples.iter().map(Sample::name).collect()
    }

    #[test]
    fn emits_every_field() {
        let driver = Arc::new(FakeDriver::with_devices(vec![
            FakeDevice::named("NVIDIA A100-SXM4-40GB").with_fields(&all_fields()),
        ]));

        let samples = collect(driver.clone()).unwrap();

        assert_eq!(
            names(&samples),
            vec![
                "gpu_metrics_free_memory",
                "gpu_metrics_used_memory",
                "gpu_metrics_total_memory",
                "gpu_metrics_temperature",
                "gpu_metrics_gpu_utilization",
                "gpu_metrics_memory_copy_utilization",
            ]
        );
        assert_eq!(samples[2].value, 40.0 * GIB as f64);
        assert_eq!(samples[0].label_values, vec!["node-1", "0", "NVIDIA A100-SXM4-40GB"]);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn node_utilization_follows_devices() {
        let driver = Arc::new(FakeDriver::with_devices(vec![
            FakeDevice::named("A100").with_fields(&all_fields()),
        ]));
        let host = Arc::new(FakeHost::default());
        host.set_node(Some(37.5), Some(62.0));

        let samples = collect_with(driver, host).unwrap();
        let node: Vec<_> = samples[6..]
            .iter()
            .map(|s| (s.name(), s.label_values.clone(), s.value))
            .collect();

        assert_eq!(
            node,
            vec![
                ("gpu_metrics_cpu_utilization", vec!["node-1".to_string()], 37.5),
                ("gpu_metrics_memory_utilization", vec!["node-1".to_string()], 62.0),
            ]
        );
    }

    #[test]
    fn failed_node_read_drops_only_that_gauge() {
        let driver = Arc::new(FakeDriver::with_devices(vec![
            FakeDevice::named("A100").with_fields(&all_fields()),
        ]));
        let host = Arc::new(FakeHost::default());
        host.set_node(None, Some(62.0));

        let samples = collect_with(driver, host).unwrap();

        assert_eq!(samples.len(), 7);
        assert!(!names(&samples).contains(&"gpu_metrics_cpu_utilization"));
        assert!(names(&samples).contains(&"gpu_metrics_memory_utilization"));
    }

    #[test]
    fn blank_field_is_omitted() {
        let mut fields = all_fields();
        fields[3].1 = None;
        let driver = Arc::new(FakeDriver::with_devices(vec![
            FakeDevice::named("T4").with_fields(&fields),
        ]));

        let samples = collect(driver).unwrap();

        assert_eq!(samples.len(), 5);
        assert!(!names(&samples).contains(&"gpu_metrics_temperature"));
        assert!(names(&samples).contains(&"gpu_metrics_gpu_utilization"));
    }

    #[test]
    fn read_failure_still_releases_handles() {
        let mut broken = FakeDevice::named("T4");
        broken.fields = Err(DriverError::fault("get latest values", "timeout"));
        let driver = Arc::new(FakeDriver::with_devices(vec![
            broken,
            FakeDevice::named("T4").with_fields(&all_fields()),
        ]));

        let samples = collect(driver.clone()).unwrap();

        assert_eq!(samples.len(), 6);
        assert!(samples.iter().all(|s| s.label("gpu_id") == Some("1")));
        assert_eq!(driver.groups_created(), 1);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn watch_failure_aborts_and_releases_group() {
        let driver = Arc::new(FakeDriver::with_devices(vec![
            FakeDevice::named("T4").with_fields(&all_fields()),
        ]));
        driver.fail_watch(DriverError::fault("watch fields", "insufficient resources"));

        let err = collect(driver.clone()).unwrap_err();

        assert!(!err.is_no_data());
        assert_eq!(driver.groups_created(), 1);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn unnamed_device_gets_index_name() {
        let mut device = FakeDevice::named("  ").with_fields(&all_fields());
        device.name = Ok(String::new());
        let driver = Arc::new(FakeDriver::with_devices(vec![device]));

        let samples = collect(driver).unwrap();

        assert_eq!(samples[0].label("gpu_name"), Some("gpu-0"));
    }

    #[test]
    fn device_info_failure_skips_device() {
        let mut broken = FakeDevice::named("T4").with_fields(&all_fields());
        broken.name = Err(DriverError::fault("device name", "GPU is lost"));
        let driver = Arc::new(FakeDriver::with_devices(vec![
            broken,
            FakeDevice::named("L4").with_fields(&all_fields()),
        ]));

        let samples = collect(driver).unwrap();

        assert!(samples.iter().all(|s| s.label("gpu_name") == Some("L4")));
    }

    #[test]
    fn missing_driver_is_no_data() {
        let driver = Arc::new(FakeDriver::default());
        driver.fail_device_count(DriverError::Unavailable {
            op: "nvml init".into(),
            reason: "a libloading error occurred".into(),
        });

        assert!(collect(driver).unwrap_err().is_no_data());
    }

    #[test]
    fn no_devices_is_success() {
        let samples = collect(Arc::new(FakeDriver::default())).unwrap();
        assert!(samples.is_empty());
    }
}
