//! Submission API: the HTTP surface fronting the Build Store and
//! Executor Pool.
//!
//! Routing is split in two deliberately: [`handle`] is a pure function
//! from method/path/query/body to a status code and a JSON value, with
//! no socket in sight, so the whole surface is testable without binding
//! a port; [`serve`] is the thin `tiny_http::Server` loop that feeds it,
//! promoted from this lineage's test-only HTTP harness to production
//! use.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tiny_http::{Method, Response, Server};

use foundry_descriptor::DescriptorError;
use foundry_events::{EventKind, EventLog, ServiceEvent};
use foundry_pool::{ExecutorPool, PoolError};
use foundry_source::SourceLoader;
use foundry_store::{BuildStore, StoreError};
use foundry_types::{Build, BuildSpec, Executor, PackageRow, SubmissionMode};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("request body of {0} bytes exceeds the {1} byte limit")]
    TooLarge(u64, u64),
    #[error("method {0} not allowed on {1}")]
    MethodNotAllowed(String, String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) | ApiError::Parse(_) | ApiError::Dependency(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::TooLarge(..) => 413,
            ApiError::MethodNotAllowed(..) => 405,
            ApiError::Internal(_) => 500,
        }
    }

    fn body(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DependencyCycle(names) => {
                ApiError::Dependency(format!("dependency error: cycle among {names:?}"))
            }
            StoreError::UnknownBuild(id) => ApiError::NotFound(format!("unknown build id: {id}")),
            StoreError::DuplicateBuild(id) => {
                ApiError::Internal(format!("generated build id collided: {id}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::UnknownExecutor(addr) => {
                ApiError::NotFound(format!("unknown executor address: {addr}"))
            }
            PoolError::DuplicateExecutor(addr) => {
                ApiError::Conflict(format!("executor address already registered: {addr}"))
            }
            PoolError::LastExecutor => {
                ApiError::Validation("cannot remove the last executor in the pool".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DescriptorError> for ApiError {
    fn from(err: DescriptorError) -> Self {
        ApiError::Parse(err.to_string())
    }
}

/// The collaborators a handler needs, bundled behind `Arc` so the server
/// loop can hand out one clone per connection thread.
pub struct ServiceState {
    pub store: Arc<dyn BuildStore>,
    pub pool: Arc<ExecutorPool>,
    pub source_loader: Arc<dyn SourceLoader>,
    pub events: Arc<EventLog>,
    pub max_body_bytes: u64,
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn split_path_and_query(url: &str) -> (&str, BTreeMap<String, String>) {
    match url.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (url, BTreeMap::new()),
    }
}

/// Materialise the list of `(config_blob, overlay source files)` a build
/// submission describes, per §4.7 step 1: exactly one of `config_yaml`,
/// `configs`, or `git_source` is expected.
fn materialize_configs(
    spec: &BuildSpec,
    source_loader: &dyn SourceLoader,
) -> Result<Vec<String>, ApiError> {
    if let Some(single) = &spec.config_yaml {
        return Ok(vec![single.clone()]);
    }
    if let Some(many) = &spec.configs {
        if many.is_empty() {
            return Err(ApiError::Validation(
                "configs must not be an empty array".to_string(),
            ));
        }
        return Ok(many.clone());
    }
    if let Some(source) = &spec.git_source {
        let files = source_loader
            .load(source)
            .map_err(|e| ApiError::Validation(format!("failed to load git_source: {e}")))?;
        if files.is_empty() {
            return Err(ApiError::Validation(
                "git_source matched no configuration files".to_string(),
            ));
        }
        return Ok(files.into_values().collect());
    }
    Err(ApiError::Validation(
        "submission must set one of config_yaml, configs, or git_source".to_string(),
    ))
}

/// Overlay `pipelines` (applied to every package) and `source_files`
/// (applied per package name) onto a package's base config blob, as two
/// additional top-level keys merged into the parsed document. The Config
/// Inspector only ever reads `package.name`/`package.build_deps` and
/// ignores the rest, so the overlay keys never perturb dependency
/// extraction; re-serialising through `serde_yaml::Value` (rather than
/// string-pasting) keeps the result valid YAML regardless of what the
/// overlay content contains.
fn overlay_config_blob(base: &str, package_name: &str, spec: &BuildSpec) -> String {
    if spec.pipelines.is_none() && spec.source_files.is_none() {
        return base.to_string();
    }

    let Ok(serde_yaml::Value::Mapping(mut doc)) = serde_yaml::from_str(base) else {
        return base.to_string();
    };

    if let Some(pipelines) = &spec.pipelines
        && !pipelines.is_empty()
    {
        doc.insert(
            serde_yaml::Value::String("pipelines".to_string()),
            serde_yaml::to_value(pipelines).unwrap_or(serde_yaml::Value::Null),
        );
    }

    if let Some(per_package) = &spec.source_files
        && let Some(files) = per_package.get(package_name)
        && !files.is_empty()
    {
        doc.insert(
            serde_yaml::Value::String("source_files".to_string()),
            serde_yaml::to_value(files).unwrap_or(serde_yaml::Value::Null),
        );
    }

    serde_yaml::to_string(&serde_yaml::Value::Mapping(doc)).unwrap_or_else(|_| base.to_string())
}

fn generate_build_id() -> String {
    format!("bld-{:016x}", rand::random::<u64>())
}

fn handle_submit_build(state: &ServiceState, body: &[u8]) -> Result<(u16, Value), ApiError> {
    if body.len() as u64 > state.max_body_bytes {
        return Err(ApiError::TooLarge(body.len() as u64, state.max_body_bytes));
    }
    if body.is_empty() {
        return Err(ApiError::Validation("request body must not be empty".to_string()));
    }

    let spec: BuildSpec = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed submission body: {e}")))?;
    if spec.arch.trim().is_empty() {
        return Err(ApiError::Validation("arch is required".to_string()));
    }

    let blobs = materialize_configs(&spec, state.source_loader.as_ref())?;

    let mut rows = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let descriptor = foundry_descriptor::inspect(&blob)?;
        let overlaid = overlay_config_blob(&blob, &descriptor.name, &spec);
        rows.push(PackageRow::new(descriptor.name, descriptor.build_deps, overlaid));
    }

    if spec.mode == SubmissionMode::Flat {
        for row in &mut rows {
            row.deps.clear();
        }
    }

    let package_count = rows.len();
    let packages: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();
    let build_id = generate_build_id();

    state.store.create_build(build_id.clone(), spec, rows)?;

    let _ = state.events.append(&ServiceEvent::new(
        build_id.clone(),
        EventKind::BuildSubmitted { package_count },
    ));

    Ok((
        201,
        json!({ "id": build_id, "packages": packages }),
    ))
}

fn build_to_json(build: &Build) -> Value {
    serde_json::to_value(build).unwrap_or(Value::Null)
}

fn handle_get_build(state: &ServiceState, id: &str) -> Result<(u16, Value), ApiError> {
    let build = state
        .store
        .get_build(id)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown build id: {id}")))?;
    Ok((200, build_to_json(&build)))
}

fn handle_list_builds(state: &ServiceState) -> Result<(u16, Value), ApiError> {
    let builds = state.store.list_builds()?;
    let values: Vec<Value> = builds.iter().map(build_to_json).collect();
    Ok((200, json!(values)))
}

fn handle_list_backends(state: &ServiceState, query: &BTreeMap<String, String>) -> (u16, Value) {
    let statuses = state.pool.status_snapshot();
    let filtered: Vec<_> = match query.get("arch") {
        Some(arch) => statuses.into_iter().filter(|s| &s.arch == arch).collect(),
        None => statuses,
    };
    (200, json!(filtered))
}

fn handle_backend_status(state: &ServiceState) -> (u16, Value) {
    (200, json!(state.pool.status_snapshot()))
}

fn handle_add_backend(state: &ServiceState, body: &[u8]) -> Result<(u16, Value), ApiError> {
    let executor: Executor = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed executor body: {e}")))?;
    if executor.address.trim().is_empty() {
        return Err(ApiError::Validation("executor address is required".to_string()));
    }
    let address = executor.address.clone();
    state.pool.add_executor(executor)?;
    let _ = state.events.append(&ServiceEvent::new(
        "",
        EventKind::ExecutorAdded { address: address.clone() },
    ));
    Ok((201, json!({ "address": address })))
}

fn handle_remove_backend(
    state: &ServiceState,
    query: &BTreeMap<String, String>,
) -> Result<(u16, Value), ApiError> {
    let address = query
        .get("address")
        .ok_or_else(|| ApiError::Validation("address query parameter is required".to_string()))?;
    state.pool.remove_executor(address)?;
    let _ = state.events.append(&ServiceEvent::new(
        "",
        EventKind::ExecutorRemoved { address: address.clone() },
    ));
    Ok((200, json!({ "address": address })))
}

/// Dispatch a single request. Pure and synchronous: no socket I/O
/// happens here, so handlers are exercised directly in tests.
pub fn handle(state: &ServiceState, method: &Method, url: &str, body: &[u8]) -> (u16, Value) {
    let (path, query) = split_path_and_query(url);

    let result = match (method, path) {
        (Method::Get, "/healthz") => Ok((200, json!({ "status": "ok" }))),
        (Method::Post, "/api/v1/builds") => handle_submit_build(state, body),
        (Method::Get, "/api/v1/builds") => handle_list_builds(state),
        (Method::Get, p) if p.starts_with("/api/v1/builds/") => {
            let id = &p["/api/v1/builds/".len()..];
            handle_get_build(state, id)
        }
        (Method::Get, "/api/v1/backends") => Ok(handle_list_backends(state, &query)),
        (Method::Post, "/api/v1/backends") => handle_add_backend(state, body),
        (Method::Delete, "/api/v1/backends") => handle_remove_backend(state, &query),
        (Method::Get, "/api/v1/backends/status") => Ok(handle_backend_status(state)),
        (method, path) => Err(ApiError::MethodNotAllowed(
            format!("{method:?}"),
            path.to_string(),
        )),
    };

    match result {
        Ok((status, value)) => (status, value),
        Err(err) => (err.status_code(), err.body()),
    }
}

fn write_json_response(request: tiny_http::Request, status: u16, value: impl Serialize) {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    let header =
        tiny_http::Header::from_bytes("Content-Type", "application/json").expect("header");
    let response = Response::from_string(body)
        .with_status_code(tiny_http::StatusCode(status))
        .with_header(header);
    let _ = request.respond(response);
}

/// Run the blocking request-accept loop until `server` is closed (e.g.
/// via `Server::unblock`, called by the service binary's shutdown path).
pub fn serve(server: &Server, state: Arc<ServiceState>) {
    for mut request in server.incoming_requests() {
        let max = state.max_body_bytes;
        let mut body = Vec::new();
        let read_result = request
            .as_reader()
            .take(max + 1)
            .read_to_end(&mut body);

        if read_result.is_err() {
            write_json_response(request, 400, json!({ "error": "failed to read request body" }));
            continue;
        }

        let method = request.method().clone();
        let url = request.url().to_string();
        let (status, value) = handle(&state, &method, &url, &body);
        write_json_response(request, status, value);
    }
}
