use anyhow::Result;
use clap::{Parser, Subcommand};
use runarray_core::{ExperimentConfig, ExtractionSummary, RunInfo, TrackingClient};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "runarray",
    version,
    about = "Export experiment-tracking histories as aligned arrays"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, align and write every field of the configured experiments.
    Extract {
        config: PathBuf,
        #[arg(long = "experiment")]
        experiments: Vec<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the runs each experiment's filters select.
    Runs {
        config: PathBuf,
        #[arg(long = "experiment")]
        experiments: Vec<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write a template configuration file.
    Init {
        #[arg(long, default_value = "runarray.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runarray=info,runarray_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(
                    error_code(&err.to_string()),
                    err.to_string(),
                    json!({}),
                ));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load(
    config: &Path,
    experiments: &[String],
    set_values: &[String],
) -> Result<Vec<ExperimentConfig>> {
    let overrides: Map<String, Value> = runarray_core::parse_set_bindings(set_values)?;
    runarray_core::load_experiments(config, experiments, &overrides)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Extract {
            config,
            experiments,
            set_values,
            json,
        } => {
            let experiments = load(&config, &experiments, &set_values)?;
            let mut summaries = Vec::with_capacity(experiments.len());
            for exp in &experiments {
                summaries.push(runarray_core::extract_experiment(exp)?);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "extract",
                    "experiments": summaries.iter().map(summary_to_json).collect::<Vec<_>>(),
                })));
            }
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Runs {
            config,
            experiments,
            set_values,
            json,
        } => {
            let experiments = load(&config, &experiments, &set_values)?;
            let mut listed = Vec::with_capacity(experiments.len());
            for exp in &experiments {
                let client = TrackingClient::from_env(&exp.base_url, &exp.api_key_env)?;
                let runs = runarray_core::matched_runs(&client, exp)?;
                listed.push((exp.name.clone(), runs));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "runs",
                    "experiments": listed.iter().map(|(name, runs)| json!({
                        "experiment": name,
                        "runs": runs.iter().map(run_info_to_json).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                })));
            }
            for (name, runs) in &listed {
                println!("experiment: {}", name);
                println!("matched_runs: {}", runs.len());
                for run in runs {
                    println!(
                        "  {} ({}) group={} job_type={} state={}",
                        run.display_name,
                        run.name,
                        run.group.as_deref().unwrap_or("none"),
                        run.job_type.as_deref().unwrap_or("none"),
                        run.state
                    );
                }
            }
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&path, runarray_core::CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!(
                "next: fill in entity and project, then run: runarray extract {}",
                path.display()
            );
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

/// Library errors carry a `code:` prefix; anything else is a generic failure.
fn error_code(message: &str) -> &'static str {
    if message.starts_with("config_error") {
        "config_error"
    } else if message.starts_with("api_error") {
        "api_error"
    } else if message.starts_with("http_error") {
        "http_error"
    } else if message.starts_with("unknown padding method") {
        "unknown_padding_method"
    } else {
        "command_failed"
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Extract { json, .. } | Commands::Runs { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn run_info_to_json(run: &RunInfo) -> Value {
    json!({
        "id": run.id,
        "name": run.name,
        "display_name": run.display_name,
        "group": run.group,
        "job_type": run.job_type,
        "state": run.state,
        "last_history_step": run.last_history_step,
    })
}

fn summary_to_json(summary: &ExtractionSummary) -> Value {
    json!({
        "experiment": summary.experiment,
        "output_dir": summary.output_dir.display().to_string(),
        "runs": summary.runs,
        "fields": summary.fields.iter().map(|f| json!({
            "name": f.name,
            "runs": f.runs,
            "steps": f.steps,
            "path": f.path.display().to_string(),
        })).collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &ExtractionSummary) {
    println!("experiment: {}", summary.experiment);
    println!("output_dir: {}", summary.output_dir.display());
    println!("runs: {}", summary.runs.len());
    for field in &summary.fields {
        println!(
            "  {}: {} runs x {} steps -> {}",
            field.name,
            field.runs,
            field.steps,
            field.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_message_prefix() {
        assert_eq!(error_code("config_error: missing project"), "config_error");
        assert_eq!(error_code("api_error: permission denied"), "api_error");
        assert_eq!(error_code("http_error: refused"), "http_error");
        assert_eq!(error_code("disk full"), "command_failed");
    }

    #[test]
    fn cli_parses_repeated_experiments_and_bindings() {
        let cli = Cli::try_parse_from([
            "runarray",
            "extract",
            "cfg.yaml",
            "--experiment",
            "a",
            "--experiment",
            "b",
            "--set",
            "history_samples=5",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Extract {
                config,
                experiments,
                set_values,
                json,
            } => {
                assert_eq!(config, PathBuf::from("cfg.yaml"));
                assert_eq!(experiments, vec!["a", "b"]);
                assert_eq!(set_values, vec!["history_samples=5"]);
                assert!(json);
            }
            _ => panic!("expected extract"),
        }
    }
}
