use osqmon_metrics::{CollectedMetric, MetricSample, MetricValue};

use crate::{
    definition::{MetricDefinition, MetricKind},
    error::MapError,
    model::ResultSet,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub definition_id: String,
    pub value: f64,
    // Positional, in the definition's declared label order.
    pub labels: Vec<String>,
}

pub fn map_rows(
    definition: &MetricDefinition,
    result: &ResultSet,
) -> Result<Vec<Sample>, MapError> {
    if definition.is_scalar() && result.len() > 1 {
        return Err(MapError::TooManyRows { rows: result.len() });
    }

    let mut samples = Vec::with_capacity(result.len());
    for (index, row) in result.rows().iter().enumerate() {
        let raw = row
            .get(definition.value_column())
            .ok_or_else(|| MapError::MissingValueColumn {
                row: index,
                column: definition.value_column().to_string(),
            })?;
        let value = raw.trim().parse::<f64>().map_err(|_| MapError::NotNumeric {
            row: index,
            column: definition.value_column().to_string(),
            value: raw.clone(),
        })?;

        let labels = definition
            .labels()
            .iter()
            .map(|column| {
                row.get(column)
                    .cloned()
                    .ok_or_else(|| MapError::MissingLabelColumn {
                        row: index,
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        samples.push(Sample {
            definition_id: definition.id().to_string(),
            value,
            labels,
        });
    }

    Ok(samples)
}

pub fn to_collected(definition: &MetricDefinition, samples: Vec<Sample>) -> CollectedMetric {
    let samples = samples
        .into_iter()
        .map(|sample| MetricSample {
            labels: definition
                .labels()
                .iter()
                .cloned()
                .zip(sample.labels)
                .collect(),
            value: match definition.metric_kind() {
                MetricKind::Counter => MetricValue::Counter(sample.value),
                MetricKind::Gauge => MetricValue::Gauge(sample.value),
            },
        })
        .collect();

    CollectedMetric {
        descriptor: definition.descriptor(),
        samples,
    }
}
