use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One logged sample as it arrives from the tracking service.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryValue {
    Scalar(f64),
    /// Media, histograms, tables and anything else that is not a plain number.
    Structured(Value),
}

impl HistoryValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(HistoryValue::Scalar)
                .unwrap_or_else(|| HistoryValue::Structured(value.clone())),
            Value::Bool(b) => HistoryValue::Scalar(if *b { 1.0 } else { 0.0 }),
            Value::Null => HistoryValue::Scalar(f64::NAN),
            Value::String(s) => match s.as_str() {
                "NaN" => HistoryValue::Scalar(f64::NAN),
                "Infinity" => HistoryValue::Scalar(f64::INFINITY),
                "-Infinity" => HistoryValue::Scalar(f64::NEG_INFINITY),
                other => other
                    .trim()
                    .parse::<f64>()
                    .map(HistoryValue::Scalar)
                    .unwrap_or_else(|_| HistoryValue::Structured(value.clone())),
            },
            Value::Array(_) | Value::Object(_) => HistoryValue::Structured(value.clone()),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            HistoryValue::Scalar(v) => Some(*v),
            HistoryValue::Structured(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, HistoryValue::Structured(_))
    }
}

/// A single history row: field name to the value logged at that step.
pub type HistoryRecord = BTreeMap<String, HistoryValue>;

pub fn record_from_json(row: &serde_json::Map<String, Value>) -> HistoryRecord {
    row.iter()
        .map(|(k, v)| (k.clone(), HistoryValue::from_json(v)))
        .collect()
}

/// Ragged per-run series, keyed by run index then field name.
#[derive(Debug, Clone, Default)]
pub struct RunDict {
    runs: BTreeMap<usize, BTreeMap<String, Vec<HistoryValue>>>,
}

impl RunDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&mut self, index: usize, fields: BTreeMap<String, Vec<HistoryValue>>) {
        self.runs.insert(index, fields);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Union of field names over every run.
    pub fn field_names(&self) -> BTreeSet<&str> {
        self.runs
            .values()
            .flat_map(|fields| fields.keys().map(String::as_str))
            .collect()
    }

    pub fn series(&self, index: usize, field: &str) -> Option<&[HistoryValue]> {
        self.runs
            .get(&index)
            .and_then(|fields| fields.get(field))
            .map(Vec::as_slice)
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.runs.keys().copied()
    }
}
