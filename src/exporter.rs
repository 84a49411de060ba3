//! Bridge from collector samples to the `prometheus` crate.

use std::collections::{BTreeMap, HashMap};

use prometheus::core::{Collector as PrometheusCollector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::collectors::ScrapeOrchestrator;
use crate::metrics::{MetricDesc, Sample};

/// Exposes the orchestrator as an unchecked collector: only the scrape
/// meta-series are declared up front, collector series are whatever a scrape
/// produced.
pub struct Exporter {
    orchestrator: ScrapeOrchestrator,
    descs: Vec<Desc>,
}

impl Exporter {
    pub fn new(orchestrator: ScrapeOrchestrator) -> prometheus::Result<Self> {
        let descs = orchestrator
            .describe()
            .iter()
            .map(|desc| {
                Desc::new(
                    desc.name.clone(),
                    desc.help.clone(),
                    desc.labels.iter().map(|l| l.to_string()).collect(),
                    HashMap::new(),
                )
            })
            .collect::<prometheus::Result<Vec<_>>>()?;
        Ok(Self { orchestrator, descs })
    }
}

impl PrometheusCollector for Exporter {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        families(&self.orchestrator.collect())
    }
}

/// Groups samples into one gauge family per metric name.
pub fn families(samples: &[Sample]) -> Vec<MetricFamily> {
    let mut grouped: BTreeMap<&str, (&MetricDesc, Vec<&Sample>)> = BTreeMap::new();
    for sample in samples {
        grouped
            .entry(sample.name())
            .or_insert_with(|| (sample.desc.as_ref(), Vec::new()))
            .1
            .push(sample);
    }

    let mut families = Vec::with_capacity(grouped.len());
    for (name, (desc, members)) in grouped {
        let gauges = match GaugeVec::new(Opts::new(name, desc.help.as_str()), &desc.labels) {
            Ok(gauges) => gauges,
            Err(err) => {
                warn!(metric = name, %err, "dropping invalid metric family");
                continue;
            }
        };
        for sample in members {
            let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
            match gauges.get_metric_with_label_values(&values) {
                Ok(gauge) => gauge.set(sample.value),
                Err(err) => warn!(metric = name, %err, "dropping sample"),
            }
        }
        families.extend(gauges.collect());
    }
    families
}

/// Registry serving the orchestrator's scrapes.
pub fn registry(orchestrator: ScrapeOrchestrator) -> prometheus::Result<Registry> {
    let registry = Registry::new();
    registry.register(Box::new(Exporter::new(orchestrator)?))?;
    Ok(registry)
}

/// Gathers and encodes in the text format.
pub fn encode_text(registry: &Registry) -> Vec<u8> {
    encode_families(&registry.gather())
}

/// Text format, skipping families that fail to encode instead of failing the
/// whole scrape.
pub fn encode_families(families: &[MetricFamily]) -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    for family in families {
        if let Err(err) = encoder.encode(std::slice::from_ref(family), &mut buffer) {
            warn!(metric = family.get_name(), %err, "failed to encode metric family");
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::collectors::{Collector, CollectorError, CollectorRegistry};

    struct Temperature;

    impl Collector for Temperature {
        fn update(&self, out: &mut Vec<Sample>) -> Result<(), CollectorError> {
            let desc = MetricDesc::new("metrics", "temperature", "GPU temperature in Celsius.", &["gpu_id"]);
            out.push(Sample::new(&desc, 61.0, &["0"]));
            out.push(Sample::new(&desc, 58.0, &["1"]));
            Ok(())
        }
    }

    fn orchestrator() -> ScrapeOrchestrator {
        let mut registry = CollectorRegistry::new();
        registry.register("gpu_metrics", || Ok(Arc::new(Temperature) as Arc<dyn Collector>));
        ScrapeOrchestrator::new(&registry).unwrap()
    }

    #[test]
    fn declares_only_meta_descriptors() {
        let exporter = Exporter::new(orchestrator()).unwrap();
        let names: Vec<_> = exporter.desc().iter().map(|d| d.fq_name.clone()).collect();

        assert_eq!(
            names,
            vec!["gpu_scrape_controller_duration_seconds", "gpu_scrape_controller_success"]
        );
    }

    #[test]
    fn groups_samples_by_name() {
        let desc = MetricDesc::new("metrics", "temperature", "GPU temperature in Celsius.", &["gpu_id"]);
        let samples = vec![Sample::new(&desc, 61.0, &["0"]), Sample::new(&desc, 58.0, &["1"])];

        let families = families(&samples);

        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "gpu_metrics_temperature");
        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn text_exposition_has_meta_and_collector_series() {
        let registry = registry(orchestrator()).unwrap();

        let text = String::from_utf8(encode_text(&registry)).unwrap();

        assert!(text.contains("# TYPE gpu_metrics_temperature gauge"));
        assert!(text.contains("gpu_metrics_temperature{gpu_id=\"1\"} 58"));
        assert!(text.contains("gpu_scrape_controller_success{collector=\"gpu_metrics\"} 1"));
        assert!(text.contains("gpu_scrape_controller_duration_seconds{collector=\"gpu_metrics\"}"));
    }

    #[test]
    fn encodes_plain_samples() {
        let samples = orchestrator().collect();

        let text = String::from_utf8(encode_families(&families(&samples))).unwrap();

        assert!(text.contains("gpu_metrics_temperature{gpu_id=\"0\"} 61"));
        assert!(text.contains("# HELP gpu_metrics_temperature GPU temperature in Celsius."));
    }
}
