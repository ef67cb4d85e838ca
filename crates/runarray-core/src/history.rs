use crate::value::{HistoryRecord, HistoryValue};
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Hard ceiling on sampled history requests.
pub const MAX_SAMPLES: usize = 12000;

/// Bookkeeping columns the tracking service logs on every row.
pub const RESERVED_FIELDS: [&str; 3] = ["_step", "_runtime", "_timestamp"];

/// A recorded run whose history can be read.
pub trait TrackedRun {
    fn name(&self) -> &str;

    /// Down-sampled history. `keys: None` returns rows with every logged field.
    fn sampled_history(&self, keys: Option<&[String]>, samples: usize)
        -> Result<Vec<HistoryRecord>>;

    /// Every logged row, unsampled.
    fn scan_history(&self) -> Result<Vec<HistoryRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    All,
    Named(Vec<String>),
}

impl FieldSelection {
    pub fn from_value(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(FieldSelection::All),
            Some(Value::String(s)) if s == "all" => Ok(FieldSelection::All),
            Some(Value::String(s)) => Ok(FieldSelection::Named(vec![s.clone()])),
            Some(Value::Array(items)) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        anyhow!("config_error: fields entries must be strings, got {}", item)
                    })?;
                    names.push(name.to_string());
                }
                if names.len() == 1 && names[0] == "all" {
                    Ok(FieldSelection::All)
                } else {
                    Ok(FieldSelection::Named(names))
                }
            }
            Some(other) => Err(anyhow!(
                "config_error: fields must be 'all' or a list of names, got {}",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistorySamples {
    /// Key absent: sample up to [`MAX_SAMPLES`].
    Default,
    Full,
    Limited(usize),
    Invalid(Value),
}

impl HistorySamples {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        match config.get("history_samples") {
            None => HistorySamples::Default,
            Some(Value::String(s)) if s == "all" => HistorySamples::Full,
            Some(value @ Value::Number(n)) => match n.as_u64() {
                Some(count) => HistorySamples::Limited((count as usize).min(MAX_SAMPLES)),
                None => HistorySamples::Invalid(value.clone()),
            },
            Some(other) => HistorySamples::Invalid(other.clone()),
        }
    }
}

/// Field names present in the first history row, minus bookkeeping columns.
pub fn discover_fields<R: TrackedRun + ?Sized>(run: &R) -> Result<Vec<String>> {
    let sample = run.sampled_history(None, 1)?;
    match sample.first() {
        Some(record) => Ok(record
            .keys()
            .filter(|k| !RESERVED_FIELDS.contains(&k.as_str()))
            .cloned()
            .collect()),
        None => {
            warn!("run {} contains no fields at all", run.name());
            Ok(Vec::new())
        }
    }
}

/// Pulls the requested fields out of a run's history.
///
/// A field's series ends at the first row that does not carry it; whatever was
/// collected before that row is kept.
pub fn extract_data<R: TrackedRun + ?Sized>(
    run: &R,
    fields: &FieldSelection,
    samples: &HistorySamples,
) -> Result<BTreeMap<String, Vec<HistoryValue>>> {
    let fields = match fields {
        FieldSelection::All => discover_fields(run)?,
        FieldSelection::Named(names) => names.clone(),
    };
    if fields.is_empty() {
        debug!("run {}: no fields requested", run.name());
        return Ok(BTreeMap::new());
    }

    let history = match samples {
        HistorySamples::Full => run.scan_history()?,
        HistorySamples::Limited(limit) => run.sampled_history(Some(&fields), *limit)?,
        HistorySamples::Default => run.sampled_history(Some(&fields), MAX_SAMPLES)?,
        HistorySamples::Invalid(value) => {
            error!(
                "history_samples must be 'all' or an integer, got {}; skipping history of run {}",
                value,
                run.name()
            );
            Vec::new()
        }
    };

    let mut data = BTreeMap::new();
    for key in &fields {
        let mut series = Vec::new();
        for record in &history {
            match record.get(key) {
                Some(value) => series.push(value.clone()),
                None => {
                    warn!("run {} does not have a field called {}", run.name(), key);
                    break;
                }
            }
        }
        data.insert(key.clone(), series);
    }
    Ok(data)
}
