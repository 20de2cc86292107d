use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use osqmon_collector::{DefinitionKind, MetricDefinition};
use osqmon_common::{
    duration::parse_duration,
    error::{OsqmonError, Result},
};
use serde::Deserialize;
use tracing::info;

const DEFAULT_OSQUERY_BINARY: &str = "osqueryi";
const DEFAULT_SOCKET_PATH: &str = "/var/osquery/osquery.em";
const DEFAULT_RUNTIME_TIMEOUT: &str = "10s";
const DEFAULT_SOCKET_TIMEOUT: &str = "5s";
const DEFAULT_THROTTLE_INTERVAL: &str = "0s";

// Names the exporter publishes itself; a configured metric may not shadow them.
const RESERVED_NAMES: &[&str] = &[
    "query_duration",
    "query_success",
    "resultsets",
    "scrapes_total",
    "scrape_duration_seconds",
    "uptime_seconds",
    "process_resident_memory_bytes",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default = "default_throttle_interval")]
    pub throttle_interval: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_osquery_binary", rename = "osquery")]
    pub binary: String,
    #[serde(default = "default_runtime_timeout")]
    pub timeout: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_osquery_binary(),
            timeout: default_runtime_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_socket_path")]
    pub path: PathBuf,
    #[serde(default = "default_socket_timeout")]
    pub timeout: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_socket_path(),
            timeout: default_socket_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub counters: Vec<MetricConfig>,
    #[serde(default)]
    pub countervecs: Vec<MetricVecConfig>,
    #[serde(default)]
    pub gauges: Vec<MetricConfig>,
    #[serde(default)]
    pub gaugevecs: Vec<MetricVecConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub help: String,
    pub query: String,
    #[serde(rename = "valueidentifier")]
    pub value_identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricVecConfig {
    #[serde(flatten)]
    pub metric: MetricConfig,
    #[serde(default, rename = "labelidentifier")]
    pub label_identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerSettings {
    Process { binary: String, timeout: Duration },
    Socket { path: PathBuf, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub runner: RunnerSettings,
    pub throttle_interval: Duration,
    pub definitions: Vec<MetricDefinition>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            OsqmonError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        let config = Self::from_yaml(&raw).map_err(|err| match err {
            OsqmonError::InvalidConfig(message) => {
                OsqmonError::InvalidConfig(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|err| OsqmonError::InvalidConfig(err.to_string()))
    }

    pub fn runner_settings(&self) -> Result<RunnerSettings> {
        // Without a runtime block the socket runner may take over; otherwise the
        // runtime runner stays the default.
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None if self.socket.enabled => RuntimeConfig {
                enabled: false,
                ..RuntimeConfig::default()
            },
            None => RuntimeConfig::default(),
        };

        if runtime.enabled {
            return Ok(RunnerSettings::Process {
                binary: runtime.binary,
                timeout: parse_timeout("runtime.timeout", &runtime.timeout)?,
            });
        }
        if self.socket.enabled {
            return Ok(RunnerSettings::Socket {
                path: self.socket.path.clone(),
                timeout: parse_timeout("socket.timeout", &self.socket.timeout)?,
            });
        }

        Err(OsqmonError::InvalidConfig(
            "neither the 'runtime' nor 'socket' modes are enabled".to_string(),
        ))
    }

    pub fn definitions(&self) -> Result<Vec<MetricDefinition>> {
        let metrics = &self.metrics;
        let scalars = |kind: DefinitionKind, entries: &[MetricConfig]| {
            entries
                .iter()
                .map(|entry| definition(kind, entry, Vec::new()))
                .collect::<Result<Vec<_>>>()
        };
        let vectors = |kind: DefinitionKind, entries: &[MetricVecConfig]| {
            entries
                .iter()
                .map(|entry| definition(kind, &entry.metric, entry.label_identifiers.clone()))
                .collect::<Result<Vec<_>>>()
        };

        let mut definitions = scalars(DefinitionKind::Counter, &metrics.counters)?;
        definitions.extend(vectors(DefinitionKind::CounterVec, &metrics.countervecs)?);
        definitions.extend(scalars(DefinitionKind::Gauge, &metrics.gauges)?);
        definitions.extend(vectors(DefinitionKind::GaugeVec, &metrics.gaugevecs)?);

        let mut names = HashSet::new();
        for definition in &definitions {
            if RESERVED_NAMES.contains(&definition.name()) {
                return Err(OsqmonError::InvalidConfig(format!(
                    "metric name {} is reserved by the exporter",
                    definition.name()
                )));
            }
            if !names.insert(definition.name()) {
                return Err(OsqmonError::InvalidConfig(format!(
                    "metric name {} is defined more than once",
                    definition.name()
                )));
            }
        }

        Ok(definitions)
    }

    pub fn settings(&self) -> Result<ExporterSettings> {
        Ok(ExporterSettings {
            runner: self.runner_settings()?,
            throttle_interval: parse_duration(&self.throttle_interval)?,
            definitions: self.definitions()?,
        })
    }
}

fn definition(
    kind: DefinitionKind,
    entry: &MetricConfig,
    labels: Vec<String>,
) -> Result<MetricDefinition> {
    MetricDefinition::new(
        kind,
        entry.name.clone(),
        entry.help.clone(),
        entry.query.clone(),
        entry.value_identifier.clone(),
        labels,
    )
}

fn parse_timeout(field: &str, value: &str) -> Result<Duration> {
    let timeout = parse_duration(value)?;
    if timeout.is_zero() {
        return Err(OsqmonError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(timeout)
}

// Accepts the ":9232" shorthand for all interfaces.
pub fn listen_address(value: &str) -> String {
    match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => value.to_string(),
    }
}

pub fn validate_telemetry_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path == "/" || path == "/-/healthy" {
        return Err(OsqmonError::InvalidArgument(format!(
            "telemetry path {path:?} must be an absolute path other than / and /-/healthy"
        )));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_osquery_binary() -> String {
    DEFAULT_OSQUERY_BINARY.to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_runtime_timeout() -> String {
    DEFAULT_RUNTIME_TIMEOUT.to_string()
}

fn default_socket_timeout() -> String {
    DEFAULT_SOCKET_TIMEOUT.to_string()
}

fn default_throttle_interval() -> String {
    DEFAULT_THROTTLE_INTERVAL.to_string()
}
