use crate::align::{OutputDataType, PaddingMethod};
use crate::client::RunInfo;
use crate::history::{FieldSelection, HistorySamples};
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "https://api.wandb.ai";
pub const DEFAULT_API_KEY_ENV: &str = "WANDB_API_KEY";

pub const CONFIG_TEMPLATE: &str = "\
# One entry per experiment; the key names the output directory.
my_experiment:
  entity: ''                  # REQUIRED: team or user owning the project
  project: ''                 # REQUIRED
  groups: all                 # or a list of run groups
  job_types: all              # or a list of job types
  runs: all                   # or a list of run names
  config: {}                  # e.g. {seed: [1, 2], lr: all}
  fields: all                 # or a list of logged metric names
  history_samples: all        # 'all' or an integer (capped at 12000)
  padding_method: nan         # nan | last
  output_data_type: npy       # npy | csv
  output_path: output
";

/// Built-in experiment settings that every configured experiment is layered on.
pub fn default_experiment_config() -> Map<String, Value> {
    match json!({
        "fields": "all",
        "padding_method": "nan",
        "output_data_type": "npy",
        "output_path": "output",
        "base_url": DEFAULT_BASE_URL,
        "api_key_env": DEFAULT_API_KEY_ENV,
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Overlays `update` onto a copy of `base`.
///
/// Mapping values merge key by key; any other value replaces the base entry.
pub fn deep_update(base: &Map<String, Value>, update: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in update {
        match value {
            Value::Object(update_branch) => {
                let empty = Map::new();
                let base_branch = match base.get(key) {
                    Some(Value::Object(branch)) => branch,
                    _ => &empty,
                };
                merged.insert(
                    key.clone(),
                    Value::Object(deep_update(base_branch, update_branch)),
                );
            }
            other => {
                merged.insert(key.clone(), other.clone());
            }
        }
    }
    merged
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Whether a run parameter passes the filter stored under `filter_param`.
///
/// An absent filter or the wildcard `"all"` matches everything.
pub fn filter_match(config: &Map<String, Value>, filter_param: &str, run_param: &Value) -> bool {
    match config.get(filter_param) {
        None => true,
        Some(Value::String(s)) if s == "all" => true,
        Some(Value::Array(allowed)) => allowed.iter().any(|v| values_equal(v, run_param)),
        Some(other) => values_equal(other, run_param),
    }
}

/// Parses `key=value` bindings; dotted keys address nested mappings.
pub fn parse_set_bindings(values: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() || key.split('.').any(|part| part.trim().is_empty()) {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        let nested = key
            .rsplit('.')
            .fold(parsed, |inner, part| {
                let mut level = Map::new();
                level.insert(part.trim().to_string(), inner);
                Value::Object(level)
            });
        if let Value::Object(binding) = nested {
            out = deep_update(&out, &binding);
        }
    }
    Ok(out)
}

pub fn load_config_file(path: &Path) -> Result<Map<String, Value>> {
    let raw_yaml = fs::read_to_string(path)
        .map_err(|e| anyhow!("config_error: cannot read {}: {}", path.display(), e))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    match serde_json::to_value(yaml_value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(anyhow!(
            "config_error: {} must map experiment names to settings, got {}",
            path.display(),
            other
        )),
    }
}

/// One fully layered experiment.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub name: String,
    pub entity: String,
    pub project: String,
    pub fields: FieldSelection,
    pub history_samples: HistorySamples,
    pub output_data_type: OutputDataType,
    pub padding_method: PaddingMethod,
    pub output_path: PathBuf,
    pub base_url: String,
    pub api_key_env: String,
    /// Merged settings, including filter keys.
    pub raw: Map<String, Value>,
}

fn required_str(raw: &Map<String, Value>, experiment: &str, key: &str) -> Result<String> {
    match raw.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(anyhow!(
            "config_error: experiment {} is missing required string '{}'",
            experiment,
            key
        )),
    }
}

fn optional_str(raw: &Map<String, Value>, key: &str, fallback: &str) -> String {
    raw.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_string()
}

impl ExperimentConfig {
    pub fn resolve(
        name: &str,
        settings: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Result<Self> {
        let raw = deep_update(
            &deep_update(&default_experiment_config(), settings),
            overrides,
        );
        let entity = required_str(&raw, name, "entity")?;
        let project = required_str(&raw, name, "project")?;
        let fields = FieldSelection::from_value(raw.get("fields"))?;
        let padding_raw = optional_str(&raw, "padding_method", "nan");
        let padding_method: PaddingMethod = padding_raw
            .parse()
            .map_err(|e| anyhow!("config_error: experiment {}: {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            entity,
            project,
            fields,
            history_samples: HistorySamples::from_config(&raw),
            output_data_type: OutputDataType::from_config(&raw),
            padding_method,
            output_path: PathBuf::from(optional_str(&raw, "output_path", "output")),
            base_url: optional_str(&raw, "base_url", DEFAULT_BASE_URL),
            api_key_env: optional_str(&raw, "api_key_env", DEFAULT_API_KEY_ENV),
            raw,
        })
    }

    /// Whether the run passes every group, job type, name and config filter.
    pub fn matches(&self, run: &RunInfo) -> bool {
        let group = run.group.clone().map(Value::String).unwrap_or(Value::Null);
        let job_type = run.job_type.clone().map(Value::String).unwrap_or(Value::Null);
        let by_name = filter_match(&self.raw, "runs", &Value::String(run.display_name.clone()))
            || filter_match(&self.raw, "runs", &Value::String(run.name.clone()));
        if !(filter_match(&self.raw, "groups", &group)
            && filter_match(&self.raw, "job_types", &job_type)
            && by_name)
        {
            return false;
        }
        match self.raw.get("config") {
            Some(Value::Object(params)) => params.keys().all(|param| {
                let run_value = run.config.get(param).unwrap_or(&Value::Null);
                filter_match(params, param, run_value)
            }),
            _ => true,
        }
    }
}

/// Loads the named experiments (all of them when `selected` is empty).
pub fn load_experiments(
    path: &Path,
    selected: &[String],
    overrides: &Map<String, Value>,
) -> Result<Vec<ExperimentConfig>> {
    let file = load_config_file(path)?;
    let names: Vec<String> = if selected.is_empty() {
        file.keys().cloned().collect()
    } else {
        selected.to_vec()
    };
    if names.is_empty() {
        return Err(anyhow!(
            "config_error: {} defines no experiments",
            path.display()
        ));
    }
    let mut experiments = Vec::with_capacity(names.len());
    for name in names {
        let settings = match file.get(&name) {
            Some(Value::Object(settings)) => settings,
            Some(other) => {
                return Err(anyhow!(
                    "config_error: experiment {} must be a mapping, got {}",
                    name,
                    other
                ))
            }
            None => {
                return Err(anyhow!(
                    "config_error: experiment {} not found in {}",
                    name,
                    path.display()
                ))
            }
        };
        experiments.push(ExperimentConfig::resolve(&name, settings, overrides)?);
    }
    Ok(experiments)
}
