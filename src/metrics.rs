use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Pid = u32;
pub type GPUIndex = u32;

pub const NAMESPACE: &str = "gpu";

/// Name, help text and label names shared by every sample of one gauge family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub labels: Vec<&'static str>,
}

impl MetricDesc {
    pub fn new(subsystem: &str, name: &str, help: &str, labels: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{NAMESPACE}_{subsystem}_{name}"),
            help: help.to_string(),
            labels: labels.to_vec(),
        })
    }
}

/// One gauge value emitted by a collector during a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: Arc<MetricDesc>,
    pub label_values: Vec<String>,
    pub value: f64,
}

impl Sample {
    pub fn new<S: AsRef<str>>(desc: &Arc<MetricDesc>, value: f64, label_values: &[S]) -> Self {
        debug_assert_eq!(desc.labels.len(), label_values.len(), "label arity for {}", desc.name);
        Self {
            desc: Arc::clone(desc),
            label_values: label_values.iter().map(|v| v.as_ref().to_string()).collect(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .labels
            .iter()
            .position(|l| *l == name)
            .and_then(|i| self.label_values.get(i))
            .map(String::as_str)
    }

    fn to_record(&self) -> SampleRecord {
        SampleRecord {
            name: self.desc.name.clone(),
            labels: self
                .desc
                .labels
                .iter()
                .map(|l| l.to_string())
                .zip(self.label_values.iter().cloned())
                .collect(),
            value: self.value,
        }
    }
}

#[derive(Serialize)]
pub struct Snapshot {
    pub timestamp: i64,
    pub samples: Vec<SampleRecord>,
}

#[derive(Serialize)]
pub struct SampleRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Snapshot {
    pub fn new(timestamp: i64, samples: &[Sample]) -> Self {
        Self {
            timestamp,
            samples: samples.iter().map(Sample::to_record).collect(),
        }
    }
}
