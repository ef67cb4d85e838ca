//! Blocking GraphQL client for a W&B-compatible tracking service.

use crate::history::TrackedRun;
use crate::value::{record_from_json, HistoryRecord};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const RUNS_PER_PAGE: u64 = 50;
const SCAN_PAGE_STEPS: i64 = 1000;

const RUNS_QUERY: &str = r#"
query Runs($project: String!, $entity: String!, $cursor: String, $perPage: Int!) {
  project(name: $project, entityName: $entity) {
    runs(after: $cursor, first: $perPage, order: "+created_at") {
      edges {
        node { id name displayName group jobType state config lastHistoryStep }
        cursor
      }
      pageInfo { endCursor hasNextPage }
    }
  }
}"#;

const HISTORY_QUERY: &str = r#"
query RunHistory($project: String!, $entity: String!, $name: String!, $samples: Int!) {
  project(name: $project, entityName: $entity) {
    run(name: $name) { history(samples: $samples) }
  }
}"#;

const SAMPLED_HISTORY_QUERY: &str = r#"
query RunSampledHistory($project: String!, $entity: String!, $name: String!, $specs: [JSONString!]!) {
  project(name: $project, entityName: $entity) {
    run(name: $name) { sampledHistory(specs: $specs) }
  }
}"#;

const HISTORY_PAGE_QUERY: &str = r#"
query HistoryPage($project: String!, $entity: String!, $name: String!, $minStep: Int64!, $maxStep: Int64!, $pageSize: Int!) {
  project(name: $project, entityName: $entity) {
    run(name: $name) { history(minStep: $minStep, maxStep: $maxStep, samples: $pageSize) }
  }
}"#;

#[derive(Clone)]
pub struct TrackingClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
}

/// Run metadata as listed by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub id: String,
    /// Stable run key used in history queries.
    pub name: String,
    pub display_name: String,
    pub group: Option<String>,
    pub job_type: Option<String>,
    pub state: String,
    pub config: Map<String, Value>,
    /// -1 when nothing has been logged.
    pub last_history_step: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunNode {
    id: String,
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    job_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    config: Option<String>,
    #[serde(default)]
    last_history_step: Option<i64>,
}

/// Run configs are stored as `{"param": {"value": x, "desc": ...}}`; keeps `x`.
fn unwrap_run_config(raw: Option<&str>) -> Result<Map<String, Value>> {
    let raw = match raw {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(Map::new()),
    };
    let parsed: Value = serde_json::from_str(raw)?;
    let mut out = Map::new();
    if let Value::Object(entries) = parsed {
        for (key, value) in entries {
            if key.starts_with('_') {
                continue;
            }
            let value = match value {
                Value::Object(mut wrapped) if wrapped.contains_key("value") => {
                    wrapped.remove("value").unwrap_or(Value::Null)
                }
                other => other,
            };
            out.insert(key, value);
        }
    }
    Ok(out)
}

impl RunInfo {
    fn from_node(node: RunNode) -> Result<Self> {
        let config = unwrap_run_config(node.config.as_deref())?;
        Ok(Self {
            display_name: node.display_name.unwrap_or_else(|| node.name.clone()),
            id: node.id,
            name: node.name,
            group: node.group,
            job_type: node.job_type,
            state: node.state.unwrap_or_else(|| "unknown".to_string()),
            config,
            last_history_step: node.last_history_step.unwrap_or(-1),
        })
    }
}

fn parse_history_rows(rows: Option<&Value>) -> Result<Vec<HistoryRecord>> {
    let rows = match rows {
        Some(Value::Array(rows)) => rows,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => return Err(anyhow!("api_error: history is not a list: {}", other)),
    };
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let decoded;
        let row = match row {
            Value::String(encoded) => {
                decoded = serde_json::from_str::<Value>(encoded)?;
                &decoded
            }
            other => other,
        };
        match row.as_object() {
            Some(fields) => records.push(record_from_json(fields)),
            None => return Err(anyhow!("api_error: history row is not an object: {}", row)),
        }
    }
    Ok(records)
}

impl TrackingClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("runarray/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/graphql", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Reads the API key from `api_key_env`; anonymous access if it is unset.
    pub fn from_env(base_url: &str, api_key_env: &str) -> Result<Self> {
        let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("{} is not set; querying {} anonymously", api_key_env, base_url);
        }
        Self::new(base_url, api_key)
    }

    fn query(&self, query: &str, variables: Value) -> Result<Value> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(key) = &self.api_key {
            request = request.basic_auth("api", Some(key));
        }
        let response = request
            .send()
            .map_err(|e| anyhow!("http_error: {}: {}", self.endpoint, e))?;
        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| anyhow!("http_error: {} returned unreadable body ({}): {}", self.endpoint, status, e))?;
        if let Some(errors) = body.get("errors").and_then(|v| v.as_array()) {
            if !errors.is_empty() {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| e.to_string())
                    })
                    .collect();
                return Err(anyhow!("api_error: {}", messages.join("; ")));
            }
        }
        if !status.is_success() {
            return Err(anyhow!("http_error: {} returned {}", self.endpoint, status));
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| anyhow!("api_error: response carries no data"))
    }

    pub fn list_runs(&self, entity: &str, project: &str) -> Result<Vec<RunInfo>> {
        let mut runs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data = self.query(
                RUNS_QUERY,
                json!({
                    "entity": entity,
                    "project": project,
                    "cursor": cursor,
                    "perPage": RUNS_PER_PAGE,
                }),
            )?;
            let page = data
                .pointer("/project/runs")
                .filter(|v| !v.is_null())
                .ok_or_else(|| anyhow!("api_error: project {}/{} not found", entity, project))?;
            let edges = page
                .get("edges")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for edge in edges {
                let node = edge
                    .get("node")
                    .cloned()
                    .ok_or_else(|| anyhow!("api_error: run edge without node"))?;
                let node: RunNode = serde_json::from_value(node)?;
                runs.push(RunInfo::from_node(node)?);
            }
            let has_next = page
                .pointer("/pageInfo/hasNextPage")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            cursor = page
                .pointer("/pageInfo/endCursor")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if !has_next || cursor.is_none() {
                break;
            }
        }
        debug!("listed {} runs in {}/{}", runs.len(), entity, project);
        Ok(runs)
    }

    pub fn run(&self, entity: &str, project: &str, info: RunInfo) -> RemoteRun {
        RemoteRun {
            client: self.clone(),
            entity: entity.to_string(),
            project: project.to_string(),
            info,
        }
    }
}

/// A listed run bound to the client that can read its history.
pub struct RemoteRun {
    client: TrackingClient,
    entity: String,
    project: String,
    info: RunInfo,
}

impl RemoteRun {
    fn run_variables(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("entity".to_string(), json!(self.entity));
        vars.insert("project".to_string(), json!(self.project));
        vars.insert("name".to_string(), json!(self.info.name));
        vars
    }
}

impl TrackedRun for RemoteRun {
    fn name(&self) -> &str {
        &self.info.display_name
    }

    fn sampled_history(
        &self,
        keys: Option<&[String]>,
        samples: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let mut vars = self.run_variables();
        match keys {
            None => {
                vars.insert("samples".to_string(), json!(samples));
                let data = self.client.query(HISTORY_QUERY, Value::Object(vars))?;
                parse_history_rows(data.pointer("/project/run/history"))
            }
            Some(keys) => {
                let mut spec_keys = vec!["_step".to_string()];
                spec_keys.extend(keys.iter().filter(|k| *k != "_step").cloned());
                let spec = json!({ "keys": spec_keys, "samples": samples }).to_string();
                vars.insert("specs".to_string(), json!([spec]));
                let data = self.client.query(SAMPLED_HISTORY_QUERY, Value::Object(vars))?;
                parse_history_rows(data.pointer("/project/run/sampledHistory/0"))
            }
        }
    }

    fn scan_history(&self) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        let mut min_step = 0;
        while min_step <= self.info.last_history_step {
            let max_step = min_step + SCAN_PAGE_STEPS;
            let mut vars = self.run_variables();
            vars.insert("minStep".to_string(), json!(min_step));
            vars.insert("maxStep".to_string(), json!(max_step));
            vars.insert("pageSize".to_string(), json!(SCAN_PAGE_STEPS));
            let data = self.client.query(HISTORY_PAGE_QUERY, Value::Object(vars))?;
            records.extend(parse_history_rows(data.pointer("/project/run/history"))?);
            min_step = max_step;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HistoryValue;
    use std::io::Read;
    use std::thread;

    struct Seen {
        body: Value,
        authorized: bool,
    }

    /// Answers one request per canned payload, in order.
    fn serve(payloads: Vec<Value>) -> (String, thread::JoinHandle<Vec<Seen>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
        let port = server.server_addr().to_ip().expect("tcp listener").port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for payload in payloads {
                let mut request = server.recv().expect("request");
                let mut body = String::new();
                request
                    .as_reader()
                    .read_to_string(&mut body)
                    .expect("read body");
                let authorized = request
                    .headers()
                    .iter()
                    .any(|h| h.field.equiv("Authorization"));
                seen.push(Seen {
                    body: serde_json::from_str(&body).expect("json body"),
                    authorized,
                });
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("header");
                request
                    .respond(tiny_http::Response::from_string(payload.to_string()).with_header(header))
                    .expect("respond");
            }
            seen
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    fn info(last_history_step: i64) -> RunInfo {
        RunInfo {
            id: "UnVuOjE=".to_string(),
            name: "abc123".to_string(),
            display_name: "bright-sun-1".to_string(),
            group: None,
            job_type: None,
            state: "finished".to_string(),
            config: Map::new(),
            last_history_step,
        }
    }

    #[test]
    fn list_runs_follows_cursor_and_unwraps_config() {
        let page = |name: &str, next: bool, config: &str| {
            json!({"data": {"project": {"runs": {
                "edges": [{"node": {
                    "id": format!("id-{}", name),
                    "name": name,
                    "displayName": format!("display-{}", name),
                    "group": "sweep",
                    "jobType": "train",
                    "state": "finished",
                    "config": config,
                    "lastHistoryStep": 99
                }, "cursor": "c1"}],
                "pageInfo": {"endCursor": "c1", "hasNextPage": next}
            }}}})
        };
        let (url, handle) = serve(vec![
            page("a", true, r#"{"seed": {"value": 1, "desc": null}, "_wandb": {"value": {}}}"#),
            page("b", false, ""),
        ]);
        let client = TrackingClient::new(&url, Some("secret".to_string())).expect("client");
        let runs = client.list_runs("lab", "mnist").expect("list runs");
        let seen = handle.join().expect("server thread");

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].display_name, "display-a");
        assert_eq!(runs[0].group.as_deref(), Some("sweep"));
        assert_eq!(Value::Object(runs[0].config.clone()), json!({"seed": 1}));
        assert!(runs[1].config.is_empty());
        assert_eq!(seen[0].body["variables"]["cursor"], Value::Null);
        assert_eq!(seen[1].body["variables"]["cursor"], json!("c1"));
        assert!(seen.iter().all(|s| s.authorized));
    }

    #[test]
    fn keyed_sampled_history_requests_step_and_keys() {
        let (url, handle) = serve(vec![json!({"data": {"project": {"run": {
            "sampledHistory": [[{"_step": 0, "loss": 1.0}, {"_step": 1, "loss": "NaN"}]]
        }}}})]);
        let client = TrackingClient::new(&url, None).expect("client");
        let run = client.run("lab", "mnist", info(1));
        let rows = run
            .sampled_history(Some(&["loss".to_string()]), 5)
            .expect("history");
        let seen = handle.join().expect("server thread");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["loss"], HistoryValue::Scalar(1.0));
        assert!(rows[1]["loss"].as_scalar().expect("scalar").is_nan());
        let spec: Value = serde_json::from_str(
            seen[0].body["variables"]["specs"][0]
                .as_str()
                .expect("spec string"),
        )
        .expect("spec json");
        assert_eq!(spec, json!({"keys": ["_step", "loss"], "samples": 5}));
        assert!(!seen[0].authorized);
    }

    #[test]
    fn unkeyed_history_decodes_json_string_rows() {
        let (url, handle) = serve(vec![json!({"data": {"project": {"run": {
            "history": ["{\"_step\": 0, \"acc\": 0.5, \"image\": {\"_type\": \"image-file\"}}"]
        }}}})]);
        let client = TrackingClient::new(&url, None).expect("client");
        let rows = client
            .run("lab", "mnist", info(0))
            .sampled_history(None, 1)
            .expect("history");
        handle.join().expect("server thread");
        assert_eq!(rows[0]["acc"], HistoryValue::Scalar(0.5));
        assert!(rows[0]["image"].is_structured());
    }

    #[test]
    fn scan_history_pages_through_steps() {
        let page = |step: i64| {
            json!({"data": {"project": {"run": {"history": [{"_step": step, "loss": 1.0}]}}}})
        };
        let (url, handle) = serve(vec![page(0), page(1000)]);
        let client = TrackingClient::new(&url, None).expect("client");
        let rows = client
            .run("lab", "mnist", info(1500))
            .scan_history()
            .expect("scan");
        let seen = handle.join().expect("server thread");
        assert_eq!(rows.len(), 2);
        assert_eq!(seen[0].body["variables"]["minStep"], json!(0));
        assert_eq!(seen[0].body["variables"]["maxStep"], json!(1000));
        assert_eq!(seen[1].body["variables"]["minStep"], json!(1000));
    }

    #[test]
    fn scan_history_of_empty_run_makes_no_requests() {
        let client = TrackingClient::new("http://127.0.0.1:9", None).expect("client");
        let rows = client
            .run("lab", "mnist", info(-1))
            .scan_history()
            .expect("scan");
        assert!(rows.is_empty());
    }

    #[test]
    fn graphql_errors_surface_as_api_errors() {
        let (url, handle) = serve(vec![json!({
            "errors": [{"message": "permission denied"}],
            "data": null
        })]);
        let client = TrackingClient::new(&url, None).expect("client");
        let err = client.list_runs("lab", "secret").expect_err("should fail");
        handle.join().expect("server thread");
        assert!(
            err.to_string().contains("api_error: permission denied"),
            "unexpected error: {}",
            err
        );
    }
}
