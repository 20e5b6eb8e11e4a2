//! Build Store: the single authoritative record of every build and its
//! package rows.
//!
//! This crate defines the [`BuildStore`] trait the Scheduler and
//! Submission API program against, plus [`InMemoryStore`], the only
//! implementation this service ships (persistence across restarts is out
//! of scope, per the orchestrator's Non-goals). All row-state
//! transitions here are atomic with respect to each other: claiming a row
//! and completing a row always observe a consistent snapshot of the
//! build, and a failed row's dependents are cascaded to `skipped` in the
//! same transition that records the failure.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};

use chrono::Utc;
use thiserror::Error;

use foundry_graph::DependencyGraph;
use foundry_types::{Build, BuildSpec, PackageRow, RowStatus, SubmissionMode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown build id: {0}")]
    UnknownBuild(String),
    #[error("unknown package `{package}` in build {build_id}")]
    UnknownPackage { build_id: String, package: String },
    #[error("package `{package}` in build {build_id} is not in the running state")]
    NotRunning { build_id: String, package: String },
    #[error("build id `{0}` already exists")]
    DuplicateBuild(String),
    #[error("dependency cycle detected among packages: {0:?}")]
    DependencyCycle(Vec<String>),
}

/// Outcome reported back for a row the Scheduler dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Success,
    Failure,
}

/// A row claimed for dispatch, identifying both the build and the row.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub build_id: String,
    pub row: PackageRow,
}

/// The operations the Scheduler and Submission API need from build
/// storage.
pub trait BuildStore: Send + Sync {
    fn create_build(&self, id: String, spec: BuildSpec, rows: Vec<PackageRow>) -> Result<(), StoreError>;
    fn get_build(&self, id: &str) -> Result<Option<Build>, StoreError>;
    fn list_builds(&self) -> Result<Vec<Build>, StoreError>;

    /// Atomically claim the next dispatchable row across all builds, in
    /// build-submission then row order. Returns `None` if nothing is
    /// ready right now.
    fn claim_next_ready(&self) -> Result<Option<ClaimedRow>, StoreError>;

    /// Record which executor a `running` row was dispatched to. Called by
    /// the Scheduler once the Pool has granted a lease, so the row's
    /// `assigned_executor` is visible to observers for the rest of the
    /// row's lifetime (running and, afterward, its terminal state).
    fn assign_executor(&self, build_id: &str, package: &str, executor_address: &str) -> Result<(), StoreError>;

    /// Record the outcome of a running row: marks it succeeded or failed,
    /// and on failure cascades `skipped` to every row (transitively)
    /// depending on it, repeating until no further row changes state.
    /// Returns the names of every row this call cascaded to `skipped`, so
    /// the caller can log each one.
    fn complete_row(
        &self,
        build_id: &str,
        package: &str,
        outcome: RowOutcome,
        error: Option<String>,
    ) -> Result<Vec<String>, StoreError>;

    /// Return a claimed row to `ready` without recording any outcome.
    /// Used when the Scheduler claims a row but the Pool has no
    /// available executor for it (a `Capacity` error): the row was never
    /// dispatched, so it is not a failure, just a claim that didn't stick.
    fn release_claim(&self, build_id: &str, package: &str) -> Result<(), StoreError>;

    /// Block the caller until a mutation has happened since
    /// `last_seen_generation`, or the timeout elapses. Returns the
    /// generation observed on return, so callers can pass it back in on
    /// the next wait.
    fn wait_for_change(&self, last_seen_generation: u64, timeout: std::time::Duration) -> u64;

    fn generation(&self) -> u64;
}

struct BuildEntry {
    build: Build,
    /// Row dependency graph, built once at submission time (rows never
    /// gain or lose dependencies after that).
    graph: DependencyGraph,
}

struct Inner {
    builds: BTreeMap<String, BuildEntry>,
    /// Insertion order, for deterministic scan order in `claim_next_ready`.
    order: VecDeque<String>,
    generation: u64,
}

/// The sole in-process implementation of [`BuildStore`].
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                builds: BTreeMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn bump_generation(inner: &mut Inner) {
        inner.generation += 1;
    }

    /// Recompute `pending -> ready` transitions for rows whose in-build
    /// dependencies have all settled successfully.
    fn refresh_ready(entry: &mut BuildEntry) {
        for idx in 0..entry.build.rows.len() {
            if entry.build.rows[idx].status != RowStatus::Pending {
                continue;
            }
            let all_satisfied = entry.build.rows[idx].deps.iter().all(|dep_name| {
                entry
                    .build
                    .rows
                    .iter()
                    .find(|r| &r.name == dep_name)
                    .map(|r| r.status == RowStatus::Succeeded)
                    .unwrap_or(true)
            });
            if all_satisfied {
                entry.build.rows[idx].status = RowStatus::Ready;
            }
        }
    }

    /// Cascade a failure to every transitive dependent, to a fixpoint.
    /// Returns the names skipped by this call, in the order they were
    /// skipped.
    fn cascade_skip(entry: &mut BuildEntry, failed_name: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut to_skip: VecDeque<String> = entry
            .build
            .rows
            .iter()
            .filter(|r| r.deps.iter().any(|d| d == failed_name))
            .map(|r| r.name.clone())
            .collect();

        loop {
            let Some(name) = to_skip.pop_front() else {
                break;
            };
            let row = entry.build.rows.iter_mut().find(|r| r.name == name);
            let Some(row) = row else { continue };
            if row.status.is_terminal() {
                continue;
            }
            row.status = RowStatus::Skipped;
            row.error = Some(format!("skipped: dependency `{failed_name}` failed"));
            row.finished_at = Some(Utc::now());
            skipped.push(name.clone());

            for dependent_name in entry
                .build
                .rows
                .iter()
                .filter(|r| r.deps.iter().any(|d| d == &name))
                .map(|r| r.name.clone())
            {
                to_skip.push_back(dependent_name);
            }
        }
        skipped
    }
}

impl BuildStore for InMemoryStore {
    fn create_build(&self, id: String, spec: BuildSpec, mut rows: Vec<PackageRow>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.builds.contains_key(&id) {
            return Err(StoreError::DuplicateBuild(id));
        }

        let graph_nodes: Vec<(String, Vec<String>)> = rows
            .iter()
            .map(|r| (r.name.clone(), r.deps.clone()))
            .collect();
        let graph = DependencyGraph::build(&graph_nodes);

        if spec.mode == SubmissionMode::Dag {
            let order = match graph.topo_sort_names() {
                Ok(order) => order,
                Err(foundry_graph::GraphError::Cycle(names)) => {
                    return Err(StoreError::DependencyCycle(names));
                }
            };
            let mut by_name: BTreeMap<String, PackageRow> =
                rows.into_iter().map(|r| (r.name.clone(), r)).collect();
            rows = order
                .into_iter()
                .filter_map(|name| by_name.remove(&name))
                .collect();
        }

        for row in &mut rows {
            if row.deps.is_empty() {
                row.status = RowStatus::Ready;
            }
        }

        let build = Build {
            id: id.clone(),
            spec,
            rows,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let mut entry = BuildEntry { build, graph };
        Self::refresh_ready(&mut entry);

        inner.builds.insert(id.clone(), entry);
        inner.order.push_back(id);
        Self::bump_generation(&mut inner);
        self.changed.notify_all();
        Ok(())
    }

    fn get_build(&self, id: &str) -> Result<Option<Build>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.builds.get(id).map(|e| e.build.clone()))
    }

    fn list_builds(&self) -> Result<Vec<Build>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.builds.get(id).map(|e| e.build.clone()))
            .collect())
    }

    fn claim_next_ready(&self) -> Result<Option<ClaimedRow>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.order.clone();
        for build_id in order {
            let Some(entry) = inner.builds.get_mut(&build_id) else {
                continue;
            };
            if let Some(row) = entry
                .build
                .rows
                .iter_mut()
                .find(|r| r.status == RowStatus::Ready)
            {
                row.status = RowStatus::Running;
                row.started_at = Some(Utc::now());
                if entry.build.started_at.is_none() {
                    entry.build.started_at = Some(Utc::now());
                }
                let claimed = ClaimedRow {
                    build_id: build_id.clone(),
                    row: row.clone(),
                };
                Self::bump_generation(&mut inner);
                self.changed.notify_all();
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    fn assign_executor(&self, build_id: &str, package: &str, executor_address: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .builds
            .get_mut(build_id)
            .ok_or_else(|| StoreError::UnknownBuild(build_id.to_string()))?;

        let row = entry
            .build
            .rows
            .iter_mut()
            .find(|r| r.name == package)
            .ok_or_else(|| StoreError::UnknownPackage {
                build_id: build_id.to_string(),
                package: package.to_string(),
            })?;

        if row.status != RowStatus::Running {
            return Err(StoreError::NotRunning {
                build_id: build_id.to_string(),
                package: package.to_string(),
            });
        }

        row.assigned_executor = Some(executor_address.to_string());
        Self::bump_generation(&mut inner);
        self.changed.notify_all();
        Ok(())
    }

    fn complete_row(
        &self,
        build_id: &str,
        package: &str,
        outcome: RowOutcome,
        error: Option<String>,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .builds
            .get_mut(build_id)
            .ok_or_else(|| StoreError::UnknownBuild(build_id.to_string()))?;

        {
            let row = entry
                .build
                .rows
                .iter_mut()
                .find(|r| r.name == package)
                .ok_or_else(|| StoreError::UnknownPackage {
                    build_id: build_id.to_string(),
                    package: package.to_string(),
                })?;

            if row.status != RowStatus::Running {
                return Err(StoreError::NotRunning {
                    build_id: build_id.to_string(),
                    package: package.to_string(),
                });
            }

            row.finished_at = Some(Utc::now());
            match outcome {
                RowOutcome::Success => row.status = RowStatus::Succeeded,
                RowOutcome::Failure => {
                    row.status = RowStatus::Failed;
                    row.error = error;
                }
            }
        }

        let skipped = if outcome == RowOutcome::Failure {
            Self::cascade_skip(entry, package)
        } else {
            Vec::new()
        };
        Self::refresh_ready(entry);

        if entry.build.finished_at.is_none()
            && entry.build.rows.iter().all(|r| r.status.is_terminal())
        {
            entry.build.finished_at = Some(Utc::now());
        }

        Self::bump_generation(&mut inner);
        self.changed.notify_all();
        Ok(skipped)
    }

    fn release_claim(&self, build_id: &str, package: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .builds
            .get_mut(build_id)
            .ok_or_else(|| StoreError::UnknownBuild(build_id.to_string()))?;

        let row = entry
            .build
            .rows
            .iter_mut()
            .find(|r| r.name == package)
            .ok_or_else(|| StoreError::UnknownPackage {
                build_id: build_id.to_string(),
                package: package.to_string(),
            })?;

        if row.status != RowStatus::Running {
            return Err(StoreError::NotRunning {
                build_id: build_id.to_string(),
                package: package.to_string(),
            });
        }

        row.status = RowStatus::Ready;
        row.started_at = None;

        Self::bump_generation(&mut inner);
        self.changed.notify_all();
        Ok(())
    }

    fn wait_for_change(&self, last_seen_generation: u64, timeout: std::time::Duration) -> u64 {
        let inner = self.inner.lock().unwrap();
        if inner.generation != last_seen_generation {
            return inner.generation;
        }
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| {
                inner.generation == last_seen_generation
            })
            .unwrap();
        inner.generation
    }

    fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_types::PackageRow as Row;

    fn spec() -> BuildSpec {
        BuildSpec {
            arch: "x86_64".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn independent_rows_start_ready() {
        let store = InMemoryStore::new();
        let rows = vec![Row::new("a".to_string(), vec![], "cfg".to_string())];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(build.rows[0].status, RowStatus::Ready);
    }

    #[test]
    fn dependent_row_stays_pending_until_dependency_succeeds() {
        let store = InMemoryStore::new();
        let rows = vec![
            Row::new("a".to_string(), vec![], "cfg".to_string()),
            Row::new("b".to_string(), vec!["a".to_string()], "cfg".to_string()),
        ];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(build.rows[1].status, RowStatus::Pending);

        let claimed = store.claim_next_ready().unwrap().unwrap();
        assert_eq!(claimed.row.name, "a");
        store
            .complete_row("b1", "a", RowOutcome::Success, None)
            .unwrap();

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(build.rows[1].status, RowStatus::Ready);
    }

    #[test]
    fn failure_cascades_skip_to_fixpoint() {
        let store = InMemoryStore::new();
        let rows = vec![
            Row::new("a".to_string(), vec![], "cfg".to_string()),
            Row::new("b".to_string(), vec!["a".to_string()], "cfg".to_string()),
            Row::new("c".to_string(), vec!["b".to_string()], "cfg".to_string()),
            Row::new("d".to_string(), vec![], "cfg".to_string()),
        ];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        store.claim_next_ready().unwrap();
        let skipped = store
            .complete_row("b1", "a", RowOutcome::Failure, Some("boom".to_string()))
            .unwrap();
        assert_eq!(skipped, vec!["b".to_string(), "c".to_string()]);

        let build = store.get_build("b1").unwrap().unwrap();
        let status = |name: &str| {
            build
                .rows
                .iter()
                .find(|r| r.name == name)
                .unwrap()
                .status
        };
        assert_eq!(status("a"), RowStatus::Failed);
        assert_eq!(status("b"), RowStatus::Skipped);
        assert_eq!(status("c"), RowStatus::Skipped);
        assert_eq!(status("d"), RowStatus::Ready);
    }

    #[test]
    fn claim_next_ready_is_fifo_across_builds() {
        let store = InMemoryStore::new();
        store
            .create_build(
                "first".to_string(),
                spec(),
                vec![Row::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();
        store
            .create_build(
                "second".to_string(),
                spec(),
                vec![Row::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();

        let claimed = store.claim_next_ready().unwrap().unwrap();
        assert_eq!(claimed.build_id, "first");
    }

    #[test]
    fn completing_a_non_running_row_errors() {
        let store = InMemoryStore::new();
        store
            .create_build(
                "b1".to_string(),
                spec(),
                vec![Row::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();

        let err = store
            .complete_row("b1", "a", RowOutcome::Success, None)
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::NotRunning {
                build_id: "b1".to_string(),
                package: "a".to_string()
            }
        );
    }

    #[test]
    fn duplicate_build_id_errors() {
        let store = InMemoryStore::new();
        store.create_build("b1".to_string(), spec(), vec![]).unwrap();
        let err = store.create_build("b1".to_string(), spec(), vec![]).unwrap_err();
        assert_eq!(err, StoreError::DuplicateBuild("b1".to_string()));
    }

    #[test]
    fn wait_for_change_returns_immediately_when_generation_moved() {
        let store = InMemoryStore::new();
        let gen0 = store.generation();
        store.create_build("b1".to_string(), spec(), vec![]).unwrap();
        let gen1 = store.wait_for_change(gen0, std::time::Duration::from_millis(10));
        assert!(gen1 > gen0);
    }

    #[test]
    fn empty_build_finishes_immediately() {
        let store = InMemoryStore::new();
        store.create_build("b1".to_string(), spec(), vec![]).unwrap();
        let build = store.get_build("b1").unwrap().unwrap();
        assert!(build.finished_at.is_none());
    }

    #[test]
    fn release_claim_returns_row_to_ready() {
        let store = InMemoryStore::new();
        let rows = vec![Row::new("a".to_string(), vec![], "cfg".to_string())];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        let claimed = store.claim_next_ready().unwrap().unwrap();
        assert_eq!(claimed.row.name, "a");

        store.release_claim("b1", "a").unwrap();
        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(build.rows[0].status, RowStatus::Ready);
        assert!(build.rows[0].started_at.is_none());

        let reclaimed = store.claim_next_ready().unwrap().unwrap();
        assert_eq!(reclaimed.row.name, "a");
    }

    #[test]
    fn release_claim_errors_when_not_running() {
        let store = InMemoryStore::new();
        let rows = vec![Row::new("a".to_string(), vec![], "cfg".to_string())];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        let err = store.release_claim("b1", "a").unwrap_err();
        assert_eq!(
            err,
            StoreError::NotRunning {
                build_id: "b1".to_string(),
                package: "a".to_string()
            }
        );
    }

    #[test]
    fn assign_executor_records_address_on_running_row_and_survives_completion() {
        let store = InMemoryStore::new();
        let rows = vec![Row::new("a".to_string(), vec![], "cfg".to_string())];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        store.claim_next_ready().unwrap();
        store.assign_executor("b1", "a", "http://exec-1").unwrap();

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(
            build.rows[0].assigned_executor,
            Some("http://exec-1".to_string())
        );

        store
            .complete_row("b1", "a", RowOutcome::Success, None)
            .unwrap();
        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(
            build.rows[0].assigned_executor,
            Some("http://exec-1".to_string())
        );
    }

    #[test]
    fn assign_executor_errors_when_row_not_running() {
        let store = InMemoryStore::new();
        let rows = vec![Row::new("a".to_string(), vec![], "cfg".to_string())];
        store.create_build("b1".to_string(), spec(), rows).unwrap();

        let err = store.assign_executor("b1", "a", "http://exec-1").unwrap_err();
        assert_eq!(
            err,
            StoreError::NotRunning {
                build_id: "b1".to_string(),
                package: "a".to_string()
            }
        );
    }

    proptest::proptest! {
        /// A chain `pkg0 <- pkg1 <- ... <- pkgN` (each depending on the one
        /// before) where `fail_at` is driven to completion: every row
        /// after the failure point must end up `skipped`, and none of them
        /// may ever have reached `running`.
        #[test]
        fn failing_a_row_skips_every_downstream_row_and_never_runs_them(
            chain_len in 2usize..10,
            fail_at in 0usize..9,
        ) {
            let fail_at = fail_at % chain_len;
            let store = InMemoryStore::new();
            let rows: Vec<Row> = (0..chain_len)
                .map(|i| {
                    let deps = if i == 0 {
                        vec![]
                    } else {
                        vec![format!("pkg{}", i - 1)]
                    };
                    Row::new(format!("pkg{i}"), deps, "cfg".to_string())
                })
                .collect();
            store.create_build("b1".to_string(), spec(), rows).unwrap();

            for i in 0..=fail_at {
                let claimed = store.claim_next_ready().unwrap();
                let claimed = claimed.expect("every row up to the failure point becomes ready");
                prop_assert_eq!(claimed.row.name, format!("pkg{i}"));
                let outcome = if i == fail_at {
                    RowOutcome::Failure
                } else {
                    RowOutcome::Success
                };
                store
                    .complete_row("b1", &format!("pkg{i}"), outcome, None)
                    .unwrap();
            }

            let build = store.get_build("b1").unwrap().unwrap();
            for i in 0..chain_len {
                let status = build.rows.iter().find(|r| r.name == format!("pkg{i}")).unwrap().status;
                if i < fail_at {
                    prop_assert_eq!(status, RowStatus::Succeeded);
                } else if i == fail_at {
                    prop_assert_eq!(status, RowStatus::Failed);
                } else {
                    prop_assert_eq!(status, RowStatus::Skipped);
                }
            }

            // A skipped row was never dispatched: claiming again must
            // never surface one of the downstream rows.
            prop_assert!(store.claim_next_ready().unwrap().is_none());
        }
    }
}
