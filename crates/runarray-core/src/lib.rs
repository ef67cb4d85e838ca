pub mod align;
pub mod client;
pub mod config;
pub mod history;
pub mod output;
pub mod value;

pub use align::{
    pad_run, run_dict_to_field_dict, AlignError, FieldData, LabeledTable, OutputDataType,
    PaddingMethod,
};
pub use client::{RemoteRun, RunInfo, TrackingClient};
pub use config::{
    deep_update, filter_match, load_experiments, parse_set_bindings, ExperimentConfig,
    CONFIG_TEMPLATE,
};
pub use history::{extract_data, FieldSelection, HistorySamples, TrackedRun, MAX_SAMPLES};
pub use value::{HistoryRecord, HistoryValue, RunDict};

use anyhow::Result;
use chrono::Utc;
use output::{atomic_write_json_pretty, ensure_dir, file_safe_name, unique_file_stem, write_field};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct FieldSummary {
    pub name: String,
    pub runs: usize,
    pub steps: usize,
    pub path: PathBuf,
}

pub struct ExtractionSummary {
    pub experiment: String,
    pub output_dir: PathBuf,
    pub runs: Vec<String>,
    pub fields: Vec<FieldSummary>,
}

fn format_name(output_type: OutputDataType) -> &'static str {
    match output_type {
        OutputDataType::Csv => "csv",
        OutputDataType::Raw => "npy",
    }
}

/// Runs of the experiment's project that pass its filters.
pub fn matched_runs(client: &TrackingClient, exp: &ExperimentConfig) -> Result<Vec<RunInfo>> {
    let listed = client.list_runs(&exp.entity, &exp.project)?;
    let total = listed.len();
    let matched: Vec<RunInfo> = listed.into_iter().filter(|run| exp.matches(run)).collect();
    info!(
        "experiment {}: {} of {} runs in {}/{} match filters",
        exp.name,
        matched.len(),
        total,
        exp.entity,
        exp.project
    );
    Ok(matched)
}

pub fn collect_run_dict<R: TrackedRun>(runs: &[R], exp: &ExperimentConfig) -> Result<RunDict> {
    let mut run_dict = RunDict::new();
    for (index, run) in runs.iter().enumerate() {
        info!("[{}/{}] extracting run {}", index + 1, runs.len(), run.name());
        run_dict.insert_run(index, extract_data(run, &exp.fields, &exp.history_samples)?);
    }
    Ok(run_dict)
}

/// Aligns the collected runs and writes one file per field plus a manifest.
pub fn export_run_dict(
    exp: &ExperimentConfig,
    run_dict: &RunDict,
    run_names: Vec<String>,
) -> Result<ExtractionSummary> {
    let aligned = run_dict_to_field_dict(run_dict, &exp.raw, exp.padding_method.as_str())?;
    let output_dir = exp.output_path.join(file_safe_name(&exp.name));
    ensure_dir(&output_dir)?;
    if run_dict.is_empty() {
        warn!("experiment {}: no runs collected", exp.name);
    } else if aligned.is_empty() {
        warn!("experiment {}: no fields to export", exp.name);
    }

    let mut fields = Vec::with_capacity(aligned.len());
    let mut used_stems = BTreeSet::new();
    for (name, data) in &aligned {
        let stem = unique_file_stem(name, &mut used_stems);
        if stem != file_safe_name(name) {
            warn!(
                "field {} shares a file name with another field, writing it as {}",
                name, stem
            );
        }
        let path = write_field(&output_dir, &stem, data)?;
        let (runs, steps) = data.shape();
        fields.push(FieldSummary {
            name: name.clone(),
            runs,
            steps,
            path,
        });
    }

    let manifest = json!({
        "schema_version": "runarray_export_v1",
        "experiment": exp.name,
        "entity": exp.entity,
        "project": exp.project,
        "exported_at": Utc::now().to_rfc3339(),
        "padding_method": exp.padding_method.as_str(),
        "output_data_type": format_name(exp.output_data_type),
        "runs": run_names,
        "fields": fields.iter().map(|f| json!({
            "name": f.name,
            "file": f.path.file_name().map(|n| n.to_string_lossy().to_string()),
            "runs": f.runs,
            "steps": f.steps,
        })).collect::<Vec<_>>(),
    });
    atomic_write_json_pretty(&output_dir.join("export_manifest.json"), &manifest)?;

    Ok(ExtractionSummary {
        experiment: exp.name.clone(),
        output_dir,
        runs: run_names,
        fields,
    })
}

/// Fetches, aligns and writes one experiment end to end.
pub fn extract_experiment(exp: &ExperimentConfig) -> Result<ExtractionSummary> {
    let client = TrackingClient::from_env(&exp.base_url, &exp.api_key_env)?;
    let runs: Vec<RemoteRun> = matched_runs(&client, exp)?
        .into_iter()
        .map(|info| client.run(&exp.entity, &exp.project, info))
        .collect();
    if runs.is_empty() {
        warn!("experiment {}: no runs matched", exp.name);
    }
    let run_dict = collect_run_dict(&runs, exp)?;
    let names = runs.iter().map(|run| run.name().to_string()).collect();
    export_run_dict(exp, &run_dict, names)
}
