use md5::{Digest, Md5};
use osqmon_common::error::{OsqmonError, Result};
use osqmon_metrics::{MetricDescriptor, MetricType, fq_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter => MetricType::Counter,
            Self::Gauge => MetricType::Gauge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Counter,
    Gauge,
    CounterVec,
    GaugeVec,
}

impl DefinitionKind {
    pub fn metric_kind(&self) -> MetricKind {
        match self {
            Self::Counter | Self::CounterVec => MetricKind::Counter,
            Self::Gauge | Self::GaugeVec => MetricKind::Gauge,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Self::CounterVec | Self::GaugeVec)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::CounterVec => "countervec",
            Self::GaugeVec => "gaugevec",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    id: String,
    kind: DefinitionKind,
    name: String,
    help: String,
    query: String,
    value_column: String,
    labels: Vec<String>,
}

impl MetricDefinition {
    pub fn new(
        kind: DefinitionKind,
        name: impl Into<String>,
        help: impl Into<String>,
        query: impl Into<String>,
        value_column: impl Into<String>,
        labels: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        let query = query.into();
        let value_column = value_column.into();

        if !is_valid_metric_name(&name) {
            return Err(OsqmonError::InvalidConfig(format!(
                "invalid metric name {name:?}"
            )));
        }
        if query.trim().is_empty() {
            return Err(OsqmonError::InvalidConfig(format!(
                "metric {name} has an empty query"
            )));
        }
        if value_column.is_empty() {
            return Err(OsqmonError::InvalidConfig(format!(
                "metric {name} has no value column"
            )));
        }
        match (kind.is_vector(), labels.is_empty()) {
            (true, true) => {
                return Err(OsqmonError::InvalidConfig(format!(
                    "{} {name} needs at least one label column",
                    kind.as_str()
                )));
            }
            (false, false) => {
                return Err(OsqmonError::InvalidConfig(format!(
                    "{} {name} must not declare label columns",
                    kind.as_str()
                )));
            }
            _ => {}
        }
        for (index, label) in labels.iter().enumerate() {
            if !is_valid_label_name(label) {
                return Err(OsqmonError::InvalidConfig(format!(
                    "metric {name} has invalid label column {label:?}"
                )));
            }
            if labels[..index].contains(label) {
                return Err(OsqmonError::InvalidConfig(format!(
                    "metric {name} declares label column {label:?} twice"
                )));
            }
        }

        Ok(Self {
            id: query_id(&query),
            kind,
            name,
            help: help.into(),
            query,
            value_column,
            labels,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DefinitionKind {
        self.kind
    }

    pub fn metric_kind(&self) -> MetricKind {
        self.kind.metric_kind()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fq_name(&self) -> String {
        fq_name(&self.name)
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn value_column(&self) -> &str {
        &self.value_column
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_scalar(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn descriptor(&self) -> MetricDescriptor {
        MetricDescriptor::new(
            self.fq_name(),
            self.help.clone(),
            self.metric_kind().metric_type(),
            &self.labels,
        )
    }
}

pub fn query_id(query: &str) -> String {
    hex::encode(Md5::digest(query.as_bytes()))
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
