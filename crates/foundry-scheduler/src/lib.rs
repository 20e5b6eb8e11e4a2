//! The Scheduler: the loop that turns `ready` rows into dispatched
//! invocations.
//!
//! It wakes on a condvar (`BuildStore::wait_for_change`) rather than
//! polling on a fixed sleep, with `SchedulerConfig.tick_interval` as a
//! bounded fallback purely so a circuit-breaker recovery or a missed
//! notification still gets noticed. Each claimed row is dispatched on its
//! own OS thread, capped at `max_concurrent` in flight at once via a
//! small `Mutex`+`Condvar` slot counter — the same primitive shape
//! `foundry-store` uses for its own change notification, generalized
//! here to bound concurrency instead of signalling a generation change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use foundry_config::SchedulerConfig;
use foundry_events::{EventKind, EventLog, ServiceEvent};
use foundry_exec::ExecutionAdapter;
use foundry_pool::{CircuitTransition, ExecutorPool, Outcome, PoolError};
use foundry_store::{BuildStore, RowOutcome};

/// Bounds the number of rows dispatched concurrently, independent of how
/// many executors exist. Acquiring blocks (with periodic cancellation
/// checks) rather than failing, since a full scheduler should simply
/// wait for a slot rather than error.
struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
    max: u32,
}

impl Semaphore {
    fn new(max: u32) -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
            max: max.max(1),
        }
    }

    /// Blocks until a slot is free or `cancel` flips, re-checking
    /// cancellation at least once per `poll_interval`. Returns `false`
    /// only when cancelled without acquiring a slot.
    fn acquire_or_cancelled(&self, cancel: &AtomicBool, poll_interval: std::time::Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        loop {
            if cancel.load(Ordering::Acquire) {
                return false;
            }
            if *count < self.max {
                *count += 1;
                return true;
            }
            let (guard, _timed_out) = self.cond.wait_timeout(count, poll_interval).unwrap();
            count = guard;
        }
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        self.cond.notify_one();
    }

    /// Blocks until every held slot has been released.
    fn wait_until_empty(&self) {
        let count = self.count.lock().unwrap();
        let _count = self.cond.wait_while(count, |c| *c > 0).unwrap();
    }
}

/// Wires the Build Store, Executor Pool, Execution Adapter, and event
/// log together into the claim-dispatch-complete loop.
pub struct Scheduler {
    store: Arc<dyn BuildStore>,
    pool: Arc<ExecutorPool>,
    adapter: Arc<dyn ExecutionAdapter>,
    events: Arc<EventLog>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BuildStore>,
        pool: Arc<ExecutorPool>,
        adapter: Arc<dyn ExecutionAdapter>,
        events: Arc<EventLog>,
        config: SchedulerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            store,
            pool,
            adapter,
            events,
            config,
            slots,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A shared flag the service binary's signal handler can flip to
    /// request the loop stop claiming new work. Existing in-flight
    /// dispatches still run to completion.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Blocks until every in-flight dispatch has released its slot. Call
    /// this after `run()` returns during shutdown to let detached worker
    /// threads finish instead of racing process exit.
    pub fn drain(&self) {
        self.slots.wait_until_empty();
    }

    /// Runs the claim/dispatch loop until `cancel_handle()` is set. Call
    /// this from its own thread; it blocks for the caller's lifetime.
    pub fn run(&self) {
        let mut generation = self.store.generation();

        while !self.cancel.load(Ordering::Acquire) {
            if !self.slots.acquire_or_cancelled(&self.cancel, self.config.tick_interval) {
                break;
            }

            match self.store.claim_next_ready() {
                Ok(Some(claimed)) => {
                    self.dispatch(claimed);
                }
                Ok(None) => {
                    self.slots.release();
                    generation = self.store.wait_for_change(generation, self.config.tick_interval);
                }
                Err(_) => {
                    self.slots.release();
                    generation = self.store.wait_for_change(generation, self.config.tick_interval);
                }
            }
        }
    }

    /// Claims a slot having already been granted one by the caller,
    /// spawns a worker thread that selects an executor, invokes it, and
    /// reports the outcome back to both the Pool and the Store, then
    /// releases the slot.
    fn dispatch(&self, claimed: foundry_store::ClaimedRow) {
        let build_id = claimed.build_id;
        let row = claimed.row;

        let Ok(Some(build)) = self.store.get_build(&build_id) else {
            // The build vanished between claim and dispatch; nothing
            // sane to do but drop the slot back.
            self.slots.release();
            return;
        };

        let store = Arc::clone(&self.store);
        let pool = Arc::clone(&self.pool);
        let adapter = Arc::clone(&self.adapter);
        let events = Arc::clone(&self.events);
        let slots = Arc::clone(&self.slots);
        let claim_backoff = self.config.claim_backoff.clone();

        thread::spawn(move || {
            let spec = build.spec;
            match pool.select_and_acquire(&spec.arch, &spec.backend_selector) {
                Ok(lease) => {
                    let address = lease.address.clone();
                    let executor = pool
                        .executor_by_address(&address)
                        .expect("leased executor must still be registered");

                    store.assign_executor(&build_id, &row.name, &address).ok();

                    events
                        .append(&ServiceEvent::new(
                            build_id.clone(),
                            EventKind::RowDispatched {
                                package: row.name.clone(),
                                executor: address.clone(),
                            },
                        ))
                        .ok();

                    let result = adapter.invoke(&executor, &row, &spec);

                    let pool_outcome = match result.outcome {
                        RowOutcome::Success => Outcome::Success,
                        RowOutcome::Failure => Outcome::Failure,
                    };
                    if let Ok(transition) = pool.complete(lease, pool_outcome) {
                        let circuit_event = match transition {
                            CircuitTransition::Opened => {
                                Some(EventKind::ExecutorCircuitOpened { address: address.clone() })
                            }
                            CircuitTransition::Closed => {
                                Some(EventKind::ExecutorCircuitClosed { address: address.clone() })
                            }
                            CircuitTransition::None => None,
                        };
                        if let Some(kind) = circuit_event {
                            events.append(&ServiceEvent::new("", kind)).ok();
                        }
                    }

                    let event_kind = match result.outcome {
                        RowOutcome::Success => EventKind::RowSucceeded {
                            package: row.name.clone(),
                            executor: address.clone(),
                        },
                        RowOutcome::Failure => EventKind::RowFailed {
                            package: row.name.clone(),
                            executor: address.clone(),
                            error: result.error.clone().unwrap_or_default(),
                        },
                    };
                    events
                        .append(&ServiceEvent::new(build_id.clone(), event_kind))
                        .ok();

                    if let Ok(skipped) =
                        store.complete_row(&build_id, &row.name, result.outcome, result.error)
                    {
                        for package in skipped {
                            events
                                .append(&ServiceEvent::new(
                                    build_id.clone(),
                                    EventKind::RowSkipped {
                                        package,
                                        reason: format!("dependency `{}` failed", row.name),
                                    },
                                ))
                                .ok();
                        }
                    }
                }
                Err(PoolError::Exhausted) | Err(PoolError::NoMatch { .. }) => {
                    // No executor available right now: give the row back
                    // rather than recording a failure. `claim_backoff`
                    // paces re-claims so a build with no matching
                    // executor doesn't spin the claim/release cycle.
                    thread::sleep(foundry_retry::calculate_delay(&claim_backoff, 0));
                    store.release_claim(&build_id, &row.name).ok();
                }
                Err(PoolError::UnknownExecutor(_)) => unreachable!(
                    "select_and_acquire never returns UnknownExecutor"
                ),
            }
            slots.release();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use foundry_config::SchedulerConfig;
    use foundry_exec::{ExecutionAdapter, InvokeResult};
    use foundry_retry::{BackoffConfig, BackoffStrategy};
    use foundry_pool::{CircuitConfig, ExecutorPool};
    use foundry_store::{BuildStore, InMemoryStore};
    use foundry_types::{BuildSpec, Executor, PackageRow};

    use super::*;

    struct ScriptedAdapter {
        calls: StdMutex<Vec<String>>,
        fail_packages: Vec<String>,
    }

    impl ScriptedAdapter {
        fn new(fail_packages: Vec<String>) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_packages,
            }
        }
    }

    impl ExecutionAdapter for ScriptedAdapter {
        fn invoke(&self, _executor: &Executor, row: &PackageRow, _spec: &BuildSpec) -> InvokeResult {
            self.calls.lock().unwrap().push(row.name.clone());
            if self.fail_packages.contains(&row.name) {
                InvokeResult {
                    outcome: RowOutcome::Failure,
                    reason: Some(foundry_exec::FailureReason::Execution),
                    error: Some("scripted failure".to_string()),
                }
            } else {
                InvokeResult {
                    outcome: RowOutcome::Success,
                    reason: None,
                    error: None,
                }
            }
        }
    }

    fn pool_with_one_executor() -> Arc<ExecutorPool> {
        let pool = ExecutorPool::new(
            CircuitConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
            },
            4,
        );
        pool.add_executor(Executor {
            address: "http://exec-1".to_string(),
            arch: "x86_64".to_string(),
            labels: BTreeMap::new(),
            capacity: 4,
        })
        .unwrap();
        Arc::new(pool)
    }

    fn events_log() -> Arc<EventLog> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(EventLog::new(foundry_events::events_path(dir.path())))
    }

    fn spec() -> BuildSpec {
        BuildSpec {
            arch: "x86_64".to_string(),
            ..Default::default()
        }
    }

    fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) {
        let start = std::time::Instant::now();
        while !f() {
            if start.elapsed() > timeout {
                panic!("condition not met within timeout");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn dispatches_ready_row_to_success() {
        let store: Arc<dyn BuildStore> = Arc::new(InMemoryStore::new());
        store
            .create_build(
                "b1".to_string(),
                spec(),
                vec![PackageRow::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();

        let scheduler = Scheduler::new(
            Arc::clone(&store),
            pool_with_one_executor(),
            Arc::new(ScriptedAdapter::new(vec![])),
            events_log(),
            SchedulerConfig {
                max_concurrent: 2,
                tick_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let cancel = scheduler.cancel_handle();
        let handle = thread::spawn(move || scheduler.run());

        wait_until(
            || {
                store
                    .get_build("b1")
                    .unwrap()
                    .unwrap()
                    .rows
                    .iter()
                    .all(|r| r.status == foundry_types::RowStatus::Succeeded)
            },
            Duration::from_secs(2),
        );

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(
            build.rows[0].assigned_executor,
            Some("http://exec-1".to_string())
        );

        cancel.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn dispatches_failing_row_and_cascades() {
        let store: Arc<dyn BuildStore> = Arc::new(InMemoryStore::new());
        store
            .create_build(
                "b1".to_string(),
                spec(),
                vec![
                    PackageRow::new("a".to_string(), vec![], "cfg".to_string()),
                    PackageRow::new("b".to_string(), vec!["a".to_string()], "cfg".to_string()),
                ],
            )
            .unwrap();

        let events_log_ref = events_log();
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            pool_with_one_executor(),
            Arc::new(ScriptedAdapter::new(vec!["a".to_string()])),
            Arc::clone(&events_log_ref),
            SchedulerConfig {
                max_concurrent: 2,
                tick_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let cancel = scheduler.cancel_handle();
        let handle = thread::spawn(move || scheduler.run());

        wait_until(
            || {
                let build = store.get_build("b1").unwrap().unwrap();
                build.rows.iter().find(|r| r.name == "b").unwrap().status
                    == foundry_types::RowStatus::Skipped
            },
            Duration::from_secs(2),
        );

        let build = store.get_build("b1").unwrap().unwrap();
        assert_eq!(
            build.rows.iter().find(|r| r.name == "a").unwrap().status,
            foundry_types::RowStatus::Failed
        );

        let events = events_log_ref.events_for_build("b1").unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::RowSkipped { package, .. } if package == "b"
        )));

        cancel.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn repeated_failures_emit_executor_circuit_opened() {
        let store: Arc<dyn BuildStore> = Arc::new(InMemoryStore::new());
        store
            .create_build(
                "b1".to_string(),
                spec(),
                vec![
                    PackageRow::new("a".to_string(), vec![], "cfg".to_string()),
                    PackageRow::new("b".to_string(), vec![], "cfg".to_string()),
                    PackageRow::new("c".to_string(), vec![], "cfg".to_string()),
                ],
            )
            .unwrap();

        let pool = ExecutorPool::new(
            CircuitConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
            },
            4,
        );
        pool.add_executor(Executor {
            address: "http://exec-1".to_string(),
            arch: "x86_64".to_string(),
            labels: BTreeMap::new(),
            capacity: 4,
        })
        .unwrap();
        let pool = Arc::new(pool);

        let events = events_log();

        let scheduler = Scheduler::new(
            Arc::clone(&store),
            pool,
            Arc::new(ScriptedAdapter::new(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
            ])),
            Arc::clone(&events),
            SchedulerConfig {
                max_concurrent: 1,
                tick_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let cancel = scheduler.cancel_handle();
        let handle = thread::spawn(move || scheduler.run());

        wait_until(
            || {
                events
                    .events_for_build("")
                    .unwrap()
                    .iter()
                    .any(|e| matches!(e.kind, EventKind::ExecutorCircuitOpened { .. }))
            },
            Duration::from_secs(2),
        );

        cancel.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn no_matching_executor_releases_claim_instead_of_failing() {
        let store: Arc<dyn BuildStore> = Arc::new(InMemoryStore::new());
        store
            .create_build(
                "b1".to_string(),
                BuildSpec {
                    arch: "arm64".to_string(),
                    ..Default::default()
                },
                vec![PackageRow::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();

        // Pool only has an x86_64 executor; the arm64 row can never be
        // dispatched, and must keep cycling back to `ready` rather than
        // ever being marked failed.
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            pool_with_one_executor(),
            Arc::new(ScriptedAdapter::new(vec![])),
            events_log(),
            SchedulerConfig {
                max_concurrent: 2,
                tick_interval: Duration::from_millis(20),
                claim_backoff: BackoffConfig {
                    strategy: BackoffStrategy::Immediate,
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                    jitter: 0.0,
                },
            },
        );

        let cancel = scheduler.cancel_handle();
        let handle = thread::spawn(move || scheduler.run());

        thread::sleep(Duration::from_millis(200));
        cancel.store(true, Ordering::Release);
        handle.join().unwrap();

        wait_until(
            || {
                let status = store.get_build("b1").unwrap().unwrap().rows[0].status;
                status == foundry_types::RowStatus::Ready
            },
            Duration::from_secs(2),
        );
    }

    #[test]
    fn drain_blocks_until_dispatch_releases_its_slot() {
        let store: Arc<dyn BuildStore> = Arc::new(InMemoryStore::new());
        store
            .create_build(
                "b1".to_string(),
                spec(),
                vec![PackageRow::new("a".to_string(), vec![], "cfg".to_string())],
            )
            .unwrap();

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            pool_with_one_executor(),
            Arc::new(ScriptedAdapter::new(vec![])),
            events_log(),
            SchedulerConfig {
                max_concurrent: 2,
                tick_interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));

        let cancel = scheduler.cancel_handle();
        let run_handle = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.run())
        };

        wait_until(
            || {
                store
                    .get_build("b1")
                    .unwrap()
                    .unwrap()
                    .rows
                    .iter()
                    .all(|r| r.status == foundry_types::RowStatus::Succeeded)
            },
            Duration::from_secs(2),
        );

        cancel.store(true, Ordering::Release);
        run_handle.join().unwrap();

        // The dispatch's worker thread may still be mid-flight even
        // though the row already shows `succeeded` (the store write
        // happens before the slot is released); `drain` must not return
        // until that slot is actually free.
        scheduler.drain();
    }
}
