//! Execution Adapter: converts a claimed row into a blocking HTTP call
//! against a remote executor and translates its response into a
//! [`foundry_store::RowOutcome`].
//!
//! This crate owns no retries and no circuit-breaking of its own — it
//! reports exactly what happened for one invocation, and the Scheduler
//! (via the Pool's `complete`) decides what to do about it. The only
//! thing it bounds on its own is wall-clock time: a hung executor cannot
//! wedge the calling worker thread past `invoke_timeout`.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use foundry_store::RowOutcome;
use foundry_types::{BuildSpec, Executor, PackageRow};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Why an invocation ended in failure, per the error taxonomy's
/// `Execution`/`Transport` split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The executor reached our request and reported a build failure.
    Execution,
    /// The executor was unreachable, or the protocol exchange itself
    /// failed (timeout, connection reset, malformed response).
    Transport,
}

/// The completion signal the adapter produces for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub outcome: RowOutcome,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
}

impl InvokeResult {
    fn success() -> Self {
        Self {
            outcome: RowOutcome::Success,
            reason: None,
            error: None,
        }
    }

    fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            outcome: RowOutcome::Failure,
            reason: Some(reason),
            error: Some(message.into()),
        }
    }
}

/// The JSON body POSTed to `{executor.address}/v1/invoke`. Pipeline and
/// source overlays are already folded into `config_blob` at submission
/// time (see `PackageRow::config_blob`), so the adapter itself stays
/// ignorant of them.
#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    package: &'a str,
    config_blob: &'a str,
    arch: &'a str,
    with_test: bool,
    debug: bool,
}

/// Given `(executor, row, spec)`, produce a completion signal.
pub trait ExecutionAdapter: Send + Sync {
    fn invoke(&self, executor: &Executor, row: &PackageRow, spec: &BuildSpec) -> InvokeResult;
}

/// The only adapter this service ships: a blocking HTTP client posting
/// to each executor's `/v1/invoke` endpoint.
pub struct HttpExecutionAdapter {
    client: reqwest::blocking::Client,
}

impl HttpExecutionAdapter {
    pub fn new(invoke_timeout: Duration) -> Result<Self, ExecError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(invoke_timeout)
            .build()
            .map_err(|e| ExecError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ExecutionAdapter for HttpExecutionAdapter {
    fn invoke(&self, executor: &Executor, row: &PackageRow, spec: &BuildSpec) -> InvokeResult {
        let url = format!("{}/v1/invoke", executor.address.trim_end_matches('/'));
        let body = InvokeRequest {
            package: &row.name,
            config_blob: &row.config_blob,
            arch: &spec.arch,
            with_test: spec.with_test,
            debug: spec.debug,
        };

        let response = match self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
        {
            Ok(response) => response,
            Err(e) => return InvokeResult::failure(FailureReason::Transport, e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return InvokeResult::success();
        }

        let text = response.text().unwrap_or_default();
        InvokeResult::failure(
            FailureReason::Execution,
            format!("executor returned {status}: {text}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    use tiny_http::{Response, Server, StatusCode};

    use foundry_types::SubmissionMode;

    use super::*;

    fn with_server<F>(handler: F) -> (String, thread::JoinHandle<()>)
    where
        F: FnOnce(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            handler(req);
        });
        (addr, handle)
    }

    fn test_executor(address: String) -> Executor {
        Executor {
            address,
            arch: "x86_64".to_string(),
            labels: Default::default(),
            capacity: 1,
        }
    }

    fn test_row() -> PackageRow {
        PackageRow::new(
            "demo".to_string(),
            vec![],
            "package:\n  name: demo\n".to_string(),
        )
    }

    fn test_spec() -> BuildSpec {
        BuildSpec {
            arch: "x86_64".to_string(),
            with_test: true,
            mode: SubmissionMode::Flat,
            ..Default::default()
        }
    }

    #[test]
    fn success_on_2xx() {
        let (address, handle) = with_server(|req| {
            assert_eq!(req.url(), "/v1/invoke");
            req.respond(Response::empty(StatusCode(200))).expect("respond");
        });

        let adapter = HttpExecutionAdapter::new(Duration::from_secs(5)).expect("adapter");
        let result = adapter.invoke(&test_executor(address), &test_row(), &test_spec());

        assert_eq!(result.outcome, RowOutcome::Success);
        assert!(result.reason.is_none());
        handle.join().expect("join");
    }

    #[test]
    fn sends_expected_body_fields() {
        let (address, handle) = with_server(|mut req| {
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("read body");
            let value: serde_json::Value = serde_json::from_str(&body).expect("json");
            assert_eq!(value["package"], "demo");
            assert_eq!(value["arch"], "x86_64");
            assert_eq!(value["with_test"], true);
            req.respond(Response::empty(StatusCode(200))).expect("respond");
        });

        let adapter = HttpExecutionAdapter::new(Duration::from_secs(5)).expect("adapter");
        adapter.invoke(&test_executor(address), &test_row(), &test_spec());
        handle.join().expect("join");
    }

    #[test]
    fn non_2xx_is_execution_failure() {
        let (address, handle) = with_server(|req| {
            req.respond(Response::from_string("build failed: missing dep").with_status_code(StatusCode(500)))
                .expect("respond");
        });

        let adapter = HttpExecutionAdapter::new(Duration::from_secs(5)).expect("adapter");
        let result = adapter.invoke(&test_executor(address), &test_row(), &test_spec());

        assert_eq!(result.outcome, RowOutcome::Failure);
        assert_eq!(result.reason, Some(FailureReason::Execution));
        assert!(result.error.unwrap().contains("build failed"));
        handle.join().expect("join");
    }

    #[test]
    fn unreachable_executor_is_transport_failure() {
        // Nothing is listening on this port.
        let adapter = HttpExecutionAdapter::new(Duration::from_millis(500)).expect("adapter");
        let result = adapter.invoke(
            &test_executor("http://127.0.0.1:1".to_string()),
            &test_row(),
            &test_spec(),
        );

        assert_eq!(result.outcome, RowOutcome::Failure);
        assert_eq!(result.reason, Some(FailureReason::Transport));
        assert!(result.error.is_some());
    }

    #[test]
    fn trims_trailing_slash_on_executor_address() {
        let (address, handle) = with_server(|req| {
            assert_eq!(req.url(), "/v1/invoke");
            req.respond(Response::empty(StatusCode(200))).expect("respond");
        });
        let address_with_slash = format!("{address}/");

        let adapter = HttpExecutionAdapter::new(Duration::from_secs(5)).expect("adapter");
        let result = adapter.invoke(&test_executor(address_with_slash), &test_row(), &test_spec());

        assert_eq!(result.outcome, RowOutcome::Success);
        handle.join().expect("join");
    }
}
