//! Run-to-field alignment.
//!
//! Per-run series arrive ragged: runs stop at different steps, some never log a
//! field, and some log structured values (media, histograms) under it. The
//! aligner turns a [`RunDict`] into one rectangular `runs × max_steps` array per
//! field, padding short rows at the end with the configured [`PaddingMethod`].

use crate::value::{HistoryValue, RunDict};
use ndarray::{Array1, Array2};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignError {
    #[error("unknown padding method {0}")]
    UnknownPaddingMethod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingMethod {
    /// Fill with NaN.
    Nan,
    /// Repeat the final logged value.
    Last,
}

impl PaddingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaddingMethod::Nan => "nan",
            PaddingMethod::Last => "last",
        }
    }
}

impl FromStr for PaddingMethod {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nan" => Ok(PaddingMethod::Nan),
            "last" => Ok(PaddingMethod::Last),
            other => Err(AlignError::UnknownPaddingMethod(other.to_string())),
        }
    }
}

impl fmt::Display for PaddingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDataType {
    Csv,
    Raw,
}

impl OutputDataType {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        match config.get("output_data_type").and_then(|v| v.as_str()) {
            Some("csv") => OutputDataType::Csv,
            _ => OutputDataType::Raw,
        }
    }
}

/// Aligned values with `run {i}` row labels and `step {i}` column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledTable {
    pub row_labels: Vec<String>,
    pub column_labels: Vec<String>,
    pub values: Array2<f64>,
}

impl LabeledTable {
    pub fn from_array(values: Array2<f64>) -> Self {
        let (rows, cols) = values.dim();
        Self {
            row_labels: (0..rows).map(|i| format!("run {}", i)).collect(),
            column_labels: (0..cols).map(|i| format!("step {}", i)).collect(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    Array(Array2<f64>),
    Table(LabeledTable),
}

impl FieldData {
    pub fn values(&self) -> &Array2<f64> {
        match self {
            FieldData::Array(values) => values,
            FieldData::Table(table) => &table.values,
        }
    }

    /// `(runs, max_steps)`
    pub fn shape(&self) -> (usize, usize) {
        self.values().dim()
    }
}

/// Extends `series` to `max_steps` by appending filler values at the end.
pub fn pad_run(series: &[f64], max_steps: usize, method: PaddingMethod) -> Array1<f64> {
    let steps = series.len();
    let mut padded = series.to_vec();
    if steps < max_steps {
        let pad_value = match method {
            PaddingMethod::Nan => f64::NAN,
            PaddingMethod::Last => series.last().copied().unwrap_or(f64::NAN),
        };
        padded.resize(max_steps, pad_value);
    }
    Array1::from_vec(padded)
}

fn qualifies(series: &[HistoryValue]) -> bool {
    series.first().map_or(false, |first| !first.is_structured())
}

/// Collects every field logged by any run into a rectangular array.
///
/// A run contributes a row for a field only when it logged that field, the
/// series is non-empty, and its first sample is a scalar. Structured samples
/// later in a qualifying series become NaN.
pub fn run_dict_to_field_dict(
    run_dict: &RunDict,
    config: &Map<String, Value>,
    padding_method: &str,
) -> Result<BTreeMap<String, FieldData>, AlignError> {
    let method: PaddingMethod = padding_method.parse()?;
    let output_type = OutputDataType::from_config(config);
    let mut output = BTreeMap::new();

    for field in run_dict.field_names() {
        let non_empty_runs: Vec<(usize, &[HistoryValue])> = run_dict
            .indices()
            .filter_map(|index| run_dict.series(index, field).map(|series| (index, series)))
            .filter(|(_, series)| qualifies(series))
            .collect();
        let max_steps = non_empty_runs
            .iter()
            .map(|(_, s)| s.len())
            .max()
            .unwrap_or(0);
        info!(
            "number of runs that include field {}: {}",
            field,
            non_empty_runs.len()
        );

        let mut array = Array2::<f64>::zeros((non_empty_runs.len(), max_steps));
        for (k, (run_index, series)) in non_empty_runs.iter().enumerate() {
            let values: Vec<f64> = series
                .iter()
                .map(|v| v.as_scalar().unwrap_or(f64::NAN))
                .collect();
            if values.len() == max_steps {
                array.row_mut(k).assign(&Array1::from_vec(values));
            } else {
                warn!(
                    "run {} has {} steps less than longest run for field {}, padding with {}",
                    run_index,
                    max_steps - values.len(),
                    field,
                    method
                );
                array.row_mut(k).assign(&pad_run(&values, max_steps, method));
            }
        }

        let data = match output_type {
            OutputDataType::Csv => FieldData::Table(LabeledTable::from_array(array)),
            OutputDataType::Raw => FieldData::Array(array),
        };
        output.insert(field.to_string(), data);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalars(values: &[f64]) -> Vec<HistoryValue> {
        values.iter().map(|v| HistoryValue::Scalar(*v)).collect()
    }

    /// Run `i` of the result holds the fields in `runs[i]`.
    fn run_dict(runs: Vec<Vec<(&str, Vec<HistoryValue>)>>) -> RunDict {
        let mut out = RunDict::new();
        for (index, fields) in runs.into_iter().enumerate() {
            let fields = fields
                .into_iter()
                .map(|(name, series)| (name.to_string(), series))
                .collect();
            out.insert_run(index, fields);
        }
        out
    }

    fn loss_runs() -> RunDict {
        run_dict(vec![
            vec![("loss", scalars(&[1.0, 2.0, 3.0]))],
            vec![("loss", scalars(&[1.0, 2.0]))],
        ])
    }

    fn no_config() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn nan_padding_appends_nan_after_short_run() {
        let out = run_dict_to_field_dict(&loss_runs(), &no_config(), "nan").expect("align");
        let loss = out.get("loss").expect("loss field").values();
        assert_eq!(loss.dim(), (2, 3));
        assert_eq!(loss.row(0).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(loss[[1, 0]], 1.0);
        assert_eq!(loss[[1, 1]], 2.0);
        assert!(loss[[1, 2]].is_nan());
    }

    #[test]
    fn last_padding_repeats_final_value() {
        let out = run_dict_to_field_dict(&loss_runs(), &no_config(), "last").expect("align");
        let loss = out.get("loss").expect("loss field").values();
        assert_eq!(loss.row(1).to_vec(), vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn unknown_padding_method_is_rejected() {
        let err = run_dict_to_field_dict(&loss_runs(), &no_config(), "median")
            .expect_err("median is not a padding method");
        assert_eq!(err, AlignError::UnknownPaddingMethod("median".to_string()));
        assert!("zero".parse::<PaddingMethod>().is_err());
    }

    #[test]
    fn pad_run_preserves_order_and_count() {
        let padded = pad_run(&[4.0, 5.0], 5, PaddingMethod::Nan);
        assert_eq!(padded.len(), 5);
        assert_eq!(padded[0], 4.0);
        assert_eq!(padded[1], 5.0);
        assert!(padded.iter().skip(2).all(|v| v.is_nan()));

        let padded = pad_run(&[4.0, 5.0], 4, PaddingMethod::Last);
        assert_eq!(padded.to_vec(), vec![4.0, 5.0, 5.0, 5.0]);

        let untouched = pad_run(&[4.0, 5.0], 2, PaddingMethod::Last);
        assert_eq!(untouched.to_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn structured_series_is_excluded_from_field() {
        let runs = run_dict(vec![
            vec![("loss", scalars(&[1.0, 2.0, 3.0]))],
            vec![("loss", scalars(&[1.0, 2.0]))],
            vec![(
                "loss",
                vec![
                    HistoryValue::Structured(json!({"_type": "histogram"})),
                    HistoryValue::Scalar(1.0),
                ],
            )],
        ]);
        let out = run_dict_to_field_dict(&runs, &no_config(), "nan").expect("align");
        assert_eq!(out["loss"].shape(), (2, 3));
    }

    #[test]
    fn structured_sample_inside_scalar_series_becomes_nan() {
        let runs = run_dict(vec![
            vec![(
                "loss",
                vec![
                    HistoryValue::Scalar(1.0),
                    HistoryValue::Structured(json!({"_type": "table"})),
                    HistoryValue::Scalar(3.0),
                ],
            )],
            vec![("loss", scalars(&[4.0]))],
        ]);
        let out = run_dict_to_field_dict(&runs, &no_config(), "last").expect("align");
        let loss = out["loss"].values();
        assert_eq!(loss.dim(), (2, 3));
        assert_eq!(loss[[0, 0]], 1.0);
        assert!(loss[[0, 1]].is_nan());
        assert_eq!(loss[[0, 2]], 3.0);
        assert_eq!(loss.row(1).to_vec(), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn field_without_qualifying_runs_is_empty() {
        let runs = run_dict(vec![
            vec![
                ("loss", scalars(&[1.0, 2.0, 3.0])),
                ("media", vec![HistoryValue::Structured(json!({"path": "a.png"}))]),
            ],
            vec![("loss", scalars(&[1.0, 2.0])), ("media", Vec::new())],
        ]);
        let out = run_dict_to_field_dict(&runs, &no_config(), "nan").expect("align");
        assert_eq!(out["media"].shape(), (0, 0));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn every_field_of_any_run_is_aligned_without_ragged_rows() {
        let runs = run_dict(vec![
            vec![("loss", scalars(&[1.0, 2.0, 3.0]))],
            vec![
                ("loss", scalars(&[1.0, 2.0])),
                ("acc", scalars(&[0.1, 0.2, 0.3, 0.4])),
            ],
            vec![("acc", scalars(&[0.5]))],
        ]);
        let out = run_dict_to_field_dict(&runs, &no_config(), "last").expect("align");
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["acc", "loss"]);
        let acc = out["acc"].values();
        assert_eq!(acc.dim(), (2, 4));
        assert_eq!(acc.row(1).to_vec(), vec![0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn csv_output_labels_runs_and_steps() {
        let config = json!({"output_data_type": "csv"});
        let config = config.as_object().expect("object").clone();
        let out = run_dict_to_field_dict(&loss_runs(), &config, "nan").expect("align");
        match &out["loss"] {
            FieldData::Table(table) => {
                assert_eq!(table.row_labels, vec!["run 0", "run 1"]);
                assert_eq!(table.column_labels, vec!["step 0", "step 1", "step 2"]);
                assert_eq!(table.values.dim(), (2, 3));
            }
            other => panic!("expected table, got {:?}", other),
        }

        let config = json!({"output_data_type": "npy"});
        let out = run_dict_to_field_dict(
            &loss_runs(),
            config.as_object().expect("object"),
            "nan",
        )
        .expect("align");
        assert!(matches!(out["loss"], FieldData::Array(_)));
    }
}
