pub mod gpu;
pub mod process;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, error, info_span};

use crate::driver::{DriverError, GpuDriver};
use crate::host::{HostAccounting, HostError};
use crate::metrics::{MetricDesc, Sample};

const SCRAPE_SUBSYSTEM: &str = "scrape";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("collector returned no data")]
    NoData,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("failed to create collector {name}: {reason}")]
    Create { name: String, reason: String },
}

impl CollectorError {
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

/// One telemetry source. Instances live for the whole process and may be
/// updated by overlapping scrapes.
pub trait Collector: Send + Sync {
    /// Runs one cycle, pushing this cycle's samples to `out`.
    fn update(&self, out: &mut Vec<Sample>) -> Result<(), CollectorError>;
}

type Factory = Box<dyn Fn() -> Result<Arc<dyn Collector>, CollectorError> + Send + Sync>;

struct Registration {
    factory: Factory,
    instance: OnceCell<Arc<dyn Collector>>,
}

/// Named collector factories. Each collector is built at most once, on the
/// first orchestrator that asks for it, and shared afterwards.
#[derive(Default)]
pub struct CollectorRegistry {
    entries: BTreeMap<String, Registration>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Collector>, CollectorError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            Registration {
                factory: Box::new(factory),
                instance: OnceCell::new(),
            },
        );
    }

    #[cfg(test)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn instantiate(&self) -> Result<Vec<(String, Arc<dyn Collector>)>, CollectorError> {
        self.entries
            .iter()
            .map(|(name, registration)| {
                let collector = registration
                    .instance
                    .get_or_try_init(|| (registration.factory)())
                    .map_err(|err| CollectorError::Create {
                        name: name.clone(),
                        reason: err.to_string(),
                    })?;
                Ok((name.clone(), Arc::clone(collector)))
            })
            .collect()
    }
}

/// The device and process collectors, wired to the given driver and host.
pub fn default_registry(
    driver: Arc<dyn GpuDriver>,
    host: Arc<dyn HostAccounting>,
    hostname: String,
) -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();

    let (gpu_driver, gpu_host, gpu_hostname) = (Arc::clone(&driver), Arc::clone(&host), hostname.clone());
    registry.register(gpu::NAME, move || {
        Ok(Arc::new(gpu::GpuMetricsCollector::new(
            Arc::clone(&gpu_driver),
            Arc::clone(&gpu_host),
            gpu_hostname.clone(),
        )) as Arc<dyn Collector>)
    });

    registry.register(process::NAME, move || {
        Ok(Arc::new(process::GpuProcessCollector::new(
            Arc::clone(&driver),
            Arc::clone(&host),
            hostname.clone(),
        )) as Arc<dyn Collector>)
    });

    registry
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub collector: String,
    pub duration: Duration,
    pub success: bool,
}

/// Runs every registered collector once per scrape and reports how each went.
pub struct ScrapeOrchestrator {
    collectors: Vec<(String, Arc<dyn Collector>)>,
    duration_desc: Arc<MetricDesc>,
    success_desc: Arc<MetricDesc>,
}

impl ScrapeOrchestrator {
    pub fn new(registry: &CollectorRegistry) -> Result<Self, CollectorError> {
        Ok(Self {
            collectors: registry.instantiate()?,
            duration_desc: MetricDesc::new(
                SCRAPE_SUBSYSTEM,
                "controller_duration_seconds",
                "nvidia_gpu_exporter: Duration of a collector scrape.",
                &["collector"],
            ),
            success_desc: MetricDesc::new(
                SCRAPE_SUBSYSTEM,
                "controller_success",
                "nvidia_gpu_exporter: Whether a collector succeeded.",
                &["collector"],
            ),
        })
    }

    /// The scrape meta-series, whatever the number of collectors.
    pub fn describe(&self) -> [Arc<MetricDesc>; 2] {
        [Arc::clone(&self.duration_desc), Arc::clone(&self.success_desc)]
    }

    /// Runs one scrape: every collector on its own thread, then two meta
    /// samples per collector whatever the outcome.
    pub fn collect(&self) -> Vec<Sample> {
        let runs: Vec<(Vec<Sample>, ScrapeOutcome)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .collectors
                .iter()
                .map(|(name, collector)| {
                    let handle = scope.spawn(move || execute(name, collector.as_ref()));
                    (name, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        error!(name = %name, "collector panicked");
                        (Vec::new(), ScrapeOutcome {
                            collector: name.clone(),
                            duration: Duration::ZERO,
                            success: false,
                        })
                    })
                })
                .collect()
        });

        let mut samples = Vec::new();
        for (collected, outcome) in runs {
            samples.extend(collected);
            samples.push(Sample::new(
                &self.duration_desc,
                outcome.duration.as_secs_f64(),
                &[outcome.collector.as_str()],
            ));
            samples.push(Sample::new(
                &self.success_desc,
                if outcome.success { 1.0 } else { 0.0 },
                &[outcome.collector.as_str()],
            ));
        }
        samples
    }
}

fn execute(name: &str, collector: &dyn Collector) -> (Vec<Sample>, ScrapeOutcome) {
    let _span = info_span!("collector", name).entered();
    let mut samples = Vec::new();

    let begin = Instant::now();
    let result = collector.update(&mut samples);
    let duration = begin.elapsed();

    let success = match result {
        Ok(()) => {
            debug!(duration_seconds = duration.as_secs_f64(), "collector succeeded");
            true
        }
        Err(err) if err.is_no_data() => {
            debug!(duration_seconds = duration.as_secs_f64(), %err, "collector returned no data");
            false
        }
        Err(err) => {
            error!(duration_seconds = duration.as_secs_f64(), %err, "collector failed");
            false
        }
    };

    (samples, ScrapeOutcome {
        collector: name.to_string(),
        duration,
        success,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    struct Fixed {
        result: fn() -> Result<(), CollectorError>,
        value: f64,
    }

    impl Collector for Fixed {
        fn update(&self, out: &mut Vec<Sample>) -> Result<(), CollectorError> {
            let desc = MetricDesc::new("test", "value", "Test value.", &["source"]);
            out.push(Sample::new(&desc, self.value, &["fixed"]));
            (self.result)()
        }
    }

    struct Panics;

    impl Collector for Panics {
        fn update(&self, _out: &mut Vec<Sample>) -> Result<(), CollectorError> {
            panic!("driver crashed");
        }
    }

    fn fixed(value: f64, result: fn() -> Result<(), CollectorError>) -> Arc<dyn Collector> {
        Arc::new(Fixed { result, value })
    }

    fn success_of(samples: &[Sample], collector: &str) -> Option<f64> {
        samples
            .iter()
            .find(|s| s.name() == "gpu_scrape_controller_success" && s.label("collector") == Some(collector))
            .map(|s| s.value)
    }

    #[test]
    fn failures_stay_isolated() {
        let mut registry = CollectorRegistry::new();
        registry.register("ok", || Ok(fixed(1.0, || Ok(()))));
        registry.register("empty", || Ok(fixed(2.0, || Err(CollectorError::NoData))));
        registry.register("broken", || {
            Ok(fixed(3.0, || Err(DriverError::fault("nvml device count", "GPU is lost").into())))
        });
        registry.register("panics", || Ok(Arc::new(Panics) as Arc<dyn Collector>));

        let orchestrator = ScrapeOrchestrator::new(&registry).unwrap();
        let samples = orchestrator.collect();

        assert_eq!(success_of(&samples, "ok"), Some(1.0));
        assert_eq!(success_of(&samples, "empty"), Some(0.0));
        assert_eq!(success_of(&samples, "broken"), Some(0.0));
        assert_eq!(success_of(&samples, "panics"), Some(0.0));

        let durations = samples
            .iter()
            .filter(|s| s.name() == "gpu_scrape_controller_duration_seconds")
            .count();
        assert_eq!(durations, 4);

        // samples pushed before a failure are still kept
        let values: Vec<f64> = samples
            .iter()
            .filter(|s| s.name() == "gpu_test_value")
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn collectors_are_built_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = CollectorRegistry::new();
        let counter = Arc::clone(&built);
        registry.register("ok", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(fixed(1.0, || Ok(())))
        });

        let first = ScrapeOrchestrator::new(&registry).unwrap();
        let second = ScrapeOrchestrator::new(&registry).unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.collectors[0].1, &second.collectors[0].1));
    }

    #[test]
    fn factory_failure_aborts_construction() {
        let mut registry = CollectorRegistry::new();
        registry.register("ok", || Ok(fixed(1.0, || Ok(()))));
        registry.register("bad", || {
            Err(DriverError::Unavailable {
                op: "nvml init".into(),
                reason: "no permission".into(),
            }
            .into())
        });

        let err = ScrapeOrchestrator::new(&registry).err().unwrap();

        assert!(matches!(&err, CollectorError::Create { name, .. } if name == "bad"));
        assert_eq!(
            err.to_string(),
            "failed to create collector bad: nvml init: gpu driver unavailable (no permission)"
        );
    }

    #[test]
    fn describe_is_independent_of_collectors() {
        let empty = ScrapeOrchestrator::new(&CollectorRegistry::new()).unwrap();
        let mut registry = CollectorRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(name, || Ok(fixed(1.0, || Ok(()))));
        }
        let full = ScrapeOrchestrator::new(&registry).unwrap();

        let names = |o: &ScrapeOrchestrator| o.describe().map(|d| d.name.clone());
        assert_eq!(names(&empty), names(&full));
        assert_eq!(
            names(&full),
            ["gpu_scrape_controller_duration_seconds", "gpu_scrape_controller_success"].map(String::from)
        );
        assert!(empty.collect().is_empty());
    }

    #[test]
    fn default_registry_names() {
        let registry = default_registry(
            Arc::new(crate::driver::fake::FakeDriver::default()),
            Arc::new(crate::host::SysinfoHost::new()),
            "node-1".into(),
        );

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["gpu_metrics", "gpu_process"]);
    }
}
