//! Core data model for the foundry build orchestrator.
//!
//! This crate defines the shapes shared by every other collaborator in the
//! workspace: [`Executor`] identity and runtime status, the [`Build`] /
//! [`PackageRow`] state machine, and the submission-time [`BuildSpec`]. No
//! component outside this crate owns these types; the Pool and the Store
//! each own the *mutable* state behind their own slice of it (see
//! `foundry-pool` and `foundry-store`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and static configuration of a remote build executor.
///
/// The address is the executor's identity; two executors with the same
/// address are the same executor. Runtime state (in-flight count, circuit
/// status, failure history) is owned by the Pool and reported separately
/// via [`ExecutorStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    /// Opaque endpoint address, e.g. `http://builder-7.internal:9000`.
    pub address: String,
    /// The single architecture this executor builds for, e.g. `x86_64`.
    pub arch: String,
    /// Arbitrary label set used by `backend_selector` matching.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Maximum concurrent in-flight invocations. Falls back to the pool
    /// default when not specified at add-time.
    pub capacity: u32,
}

/// Point-in-time runtime status of an executor, as reported by
/// `GET /api/v1/backends/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub address: String,
    pub arch: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: u32,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_open: bool,
}

/// Whether a submission's packages are ordered by declared dependencies
/// or dispatched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Dependencies are ignored; every row is immediately dispatchable.
    #[default]
    Flat,
    /// Rows are ordered and gated by their declared build-time dependencies.
    Dag,
}

/// An opaque description of where to clone package configurations from.
/// The core never fetches this itself (see `foundry-source`'s
/// `SourceLoader` trait) — it is an external collaborator's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Glob pattern (relative to `path`) matching configuration files.
    pub pattern: String,
    /// Subdirectory of the checkout to search, relative to the repo root.
    #[serde(default)]
    pub path: String,
}

/// The full submission payload accepted by `POST /api/v1/builds`.
///
/// Exactly one of `config_yaml`, `configs`, or `git_source` is expected to
/// be populated by a well-formed request; the API layer is responsible for
/// materialising a single `configs` list out of whichever was given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_source: Option<GitSource>,
    /// Relative path -> pipeline blob, overlaid on every package in the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelines: Option<BTreeMap<String, String>>,
    /// Package name -> (relative path -> content), overlaid per package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files: Option<BTreeMap<String, BTreeMap<String, String>>>,
    pub arch: String,
    #[serde(default)]
    pub backend_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub with_test: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub mode: SubmissionMode,
}

/// Status of a single [`PackageRow`] within a [`Build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Not yet ready; waiting on in-build dependencies.
    Pending,
    /// Explicitly marked as gated by a dependency that cannot succeed.
    /// Not produced directly by this implementation's cascade (which goes
    /// straight to `Skipped`), kept in the model because the spec's row
    /// vocabulary names it as a distinct observable state.
    Blocked,
    /// All in-build dependencies have succeeded; eligible for `claim_next_ready`.
    Ready,
    /// Claimed by the scheduler and assigned to an executor.
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RowStatus {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RowStatus::Succeeded | RowStatus::Failed | RowStatus::Skipped
        )
    }
}

/// The state record for one package within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRow {
    pub name: String,
    pub status: RowStatus,
    /// Declared build-time dependency names (may reference packages not
    /// present in this Build; those are pre-satisfied).
    pub deps: Vec<String>,
    /// The opaque configuration blob for this package, as materialised at
    /// submission time (including any pipeline/source-file overlays).
    pub config_blob: String,
    pub assigned_executor: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PackageRow {
    pub fn new(name: String, deps: Vec<String>, config_blob: String) -> Self {
        Self {
            name,
            status: RowStatus::Pending,
            deps,
            config_blob,
            assigned_executor: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Aggregate status of a [`Build`], derived from its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Derive the aggregate status of a build from its rows, per §3: `failed`
/// if any row is `failed` and the remaining rows have settled; `succeeded`
/// once every row is `succeeded` or `skipped`; `running` if any row is
/// `running`; `pending` otherwise.
pub fn derive_build_status(rows: &[PackageRow]) -> BuildStatus {
    let any_failed = rows.iter().any(|r| r.status == RowStatus::Failed);
    let all_settled = rows.iter().all(|r| r.status.is_terminal());
    if any_failed && all_settled {
        return BuildStatus::Failed;
    }
    if rows
        .iter()
        .all(|r| matches!(r.status, RowStatus::Succeeded | RowStatus::Skipped))
    {
        return BuildStatus::Succeeded;
    }
    if rows.iter().any(|r| r.status == RowStatus::Running) {
        return BuildStatus::Running;
    }
    BuildStatus::Pending
}

/// A unit of submission that produces zero or more packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub spec: BuildSpec,
    /// Rows in stable topological order (`dag` mode) or submission order
    /// (`flat` mode).
    pub rows: Vec<PackageRow>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn status(&self) -> BuildStatus {
        derive_build_status(&self.rows)
    }

    pub fn package_names(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, status: RowStatus) -> PackageRow {
        let mut r = PackageRow::new(name.to_string(), vec![], String::new());
        r.status = status;
        r
    }

    #[test]
    fn empty_build_is_succeeded() {
        assert_eq!(derive_build_status(&[]), BuildStatus::Succeeded);
    }

    #[test]
    fn pending_when_nothing_started() {
        let rows = vec![row("a", RowStatus::Pending)];
        assert_eq!(derive_build_status(&rows), BuildStatus::Pending);
    }

    #[test]
    fn running_when_any_row_running() {
        let rows = vec![row("a", RowStatus::Succeeded), row("b", RowStatus::Running)];
        assert_eq!(derive_build_status(&rows), BuildStatus::Running);
    }

    #[test]
    fn failed_once_settled_with_a_failure() {
        let rows = vec![row("a", RowStatus::Failed), row("b", RowStatus::Skipped)];
        assert_eq!(derive_build_status(&rows), BuildStatus::Failed);
    }

    #[test]
    fn not_yet_failed_while_siblings_still_running() {
        let rows = vec![row("a", RowStatus::Failed), row("b", RowStatus::Running)];
        assert_eq!(derive_build_status(&rows), BuildStatus::Running);
    }

    #[test]
    fn succeeded_allows_mix_of_succeeded_and_skipped() {
        let rows = vec![row("a", RowStatus::Succeeded), row("b", RowStatus::Skipped)];
        assert_eq!(derive_build_status(&rows), BuildStatus::Succeeded);
    }

    #[test]
    fn executor_roundtrips_through_json() {
        let exec = Executor {
            address: "http://builder-1:9000".to_string(),
            arch: "x86_64".to_string(),
            labels: BTreeMap::from([("zone".to_string(), "us".to_string())]),
            capacity: 4,
        };
        let json = serde_json::to_string(&exec).expect("serialize");
        let back: Executor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(exec, back);
    }
}
