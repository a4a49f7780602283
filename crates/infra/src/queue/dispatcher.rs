//! Dispatcher loop: poll, claim, execute, release.
//!
//! One dispatcher runs per worker process and executes one item at a time.
//! Workers share nothing but the store; a lost claim race is normal and only
//! logged at debug level. The loop itself never fails because an item did.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use workforge_core::checkpoint::{advance, resolve_step};
use workforge_core::{
    decide, ExecutionResult, FailureKind, HandlerError, TaskType, Transition, TransitionPolicy,
    WorkItem, WorkItemStatus, WorkerId,
};

use super::lease::{Claim, ClaimResult, LeaseManager, ReleaseOutcome};
use super::registry::{HandlerRegistry, RegisteredHandler, Registration};
use super::store::{StoreError, WorkItemStore};
use super::trigger::SchedulingTrigger;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Written to `lock_owner` on every claim
    pub worker_id: WorkerId,
    pub lease_duration: Duration,
    /// Delay after an empty poll; doubles while idle
    pub poll_interval: Duration,
    /// Cap for the idle backoff
    pub max_idle: Duration,
    /// Candidates fetched per poll
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            worker_id: WorkerId::generate(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            max_idle: Duration::from_secs(30),
            batch_size: 16,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// How often a running handler's lease is renewed.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }

    fn next_idle_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_idle).max(self.poll_interval)
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub polls: u64,
    /// Executions that ended in a release attempt.
    pub processed: u64,
    pub completed: u64,
    /// Step advanced or held; the item stays live.
    pub stepped: u64,
    pub retried: u64,
    /// Fatal and poison outcomes.
    pub failed: u64,
    /// Claim races lost to another worker.
    pub contention: u64,
    pub reclaimed: u64,
    pub leases_lost: u64,
}

/// Handle to a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Ask the loop to stop after the current item and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats).clone()
    }
}

pub struct Dispatcher {
    leases: LeaseManager,
    registry: Arc<HandlerRegistry>,
    trigger: SchedulingTrigger,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone(), config.worker_id.clone(), config.lease_duration),
            trigger: SchedulingTrigger::new(store),
            registry,
            config,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats).clone()
    }

    /// One poll cycle starting at `now`: arm recurring items, then claim and
    /// execute every candidate this worker wins. Returns how many items it
    /// executed.
    ///
    /// Items in a batch run one after another, so claim, renewal and
    /// transition times are `now` plus the time spent in this poll so far.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.bump(|s| s.polls += 1);
        let clock = PollClock::start(now);

        if let Err(e) = self.trigger.arm_due(now, self.config.batch_size).await {
            error!(dispatcher = %self.config.name, error = %e, "arming recurring work items failed");
        }

        let candidates = self
            .leases
            .store()
            .find_candidates(now, self.config.lease_duration, self.config.batch_size)
            .await?;

        let mut executed = 0;
        for candidate in candidates {
            let claim = match self.leases.try_claim(candidate.id, clock.now()).await {
                Ok(ClaimResult::Claimed(claim)) => claim,
                Ok(ClaimResult::NotAvailable) => {
                    self.bump(|s| s.contention += 1);
                    continue;
                }
                Err(e) => {
                    error!(work_item_id = %candidate.id, error = %e, "claim failed");
                    continue;
                }
            };

            let id = claim.id();
            if let Err(e) = self.process(claim, &clock).await {
                // The lease expires on its own and the item is reclaimed.
                error!(
                    dispatcher = %self.config.name,
                    work_item_id = %id,
                    error = %e,
                    "processing work item failed"
                );
            }
            executed += 1;
        }

        Ok(executed)
    }

    /// Run until `cancel` turns true (or its sender is dropped).
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(
            dispatcher = %self.config.name,
            worker_id = %self.config.worker_id,
            lease_secs = self.config.lease_duration.as_secs(),
            "dispatcher started"
        );

        let mut idle = self.config.poll_interval;
        loop {
            if *cancel.borrow() {
                break;
            }

            let delay = match self.poll_once(Utc::now()).await {
                Ok(0) => {
                    let delay = idle;
                    idle = self.config.next_idle_delay(idle);
                    delay
                }
                Ok(_) => {
                    idle = self.config.poll_interval;
                    continue;
                }
                Err(e) => {
                    error!(dispatcher = %self.config.name, error = %e, "poll failed");
                    let delay = idle;
                    idle = self.config.next_idle_delay(idle);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(dispatcher = %self.config.name, "dispatcher stopped");
    }

    /// Run on a Tokio task.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown, cancel) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(async move { self.run(cancel).await });
        DispatcherHandle {
            shutdown,
            join,
            stats,
        }
    }

    async fn process(&self, claim: Claim, clock: &PollClock) -> Result<(), StoreError> {
        let item = claim.item.clone();
        if claim.is_reclaim() {
            self.bump(|s| s.reclaimed += 1);
        }

        // Reclaimed too many times: the crashes already spent the budget.
        if claim.is_reclaim() && item.attempts >= item.max_attempts {
            let transition =
                Transition::exhausted(&item, "attempt budget exhausted by expired leases", clock.now());
            return self.finish(claim, transition, false).await;
        }

        let registration = match self.registry.resolve(&item.work_type) {
            Ok(registration) => registration.clone(),
            Err(e) => {
                let transition = decide(
                    &item,
                    &TransitionPolicy::default(),
                    ExecutionResult::fatal(e.to_string()),
                    item.payload.clone(),
                    clock.now(),
                );
                return self.finish(claim, transition, false).await;
            }
        };

        if !self.leases.mark_running(&claim, clock.now()).await? {
            warn!(work_item_id = %item.id, "lease lost before handler start");
            self.bump(|s| s.leases_lost += 1);
            return Ok(());
        }

        let (result, payload) = self.execute_with_renewal(&claim, &registration, clock).await;
        let finished = clock.now();

        let run_completed = result == ExecutionResult::Completed;
        let policy = TransitionPolicy::for_type(&registration.task_type);
        let transition = decide(&item, &policy, result, payload, finished);
        self.finish(claim, transition, run_completed).await
    }

    /// Run the handler on its own task, renewing the lease every third of its
    /// duration. A panicking handler is a fatal failure of that item only.
    async fn execute_with_renewal(
        &self,
        claim: &Claim,
        registration: &Registration,
        clock: &PollClock,
    ) -> (ExecutionResult, serde_json::Value) {
        let mut execution = tokio::spawn({
            let registration = registration.clone();
            let item = claim.item.clone();
            async move { execute(&registration, &item).await }
        });

        let every = self.config.renew_interval();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        loop {
            tokio::select! {
                joined = &mut execution => {
                    return match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            let reason = if e.is_panic() {
                                format!("handler panicked: {}", panic_message(e.into_panic()))
                            } else {
                                "handler task was cancelled".to_string()
                            };
                            (ExecutionResult::fatal(reason), claim.item.payload.clone())
                        }
                    };
                }
                _ = renew.tick() => {
                    if let Err(e) = self.leases.renew(claim, clock.now()).await {
                        warn!(work_item_id = %claim.id(), error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }

    /// Log the outcome and release. `run_completed` is set when the handler
    /// finished the whole item, including recurring items that were re-armed.
    async fn finish(
        &self,
        claim: Claim,
        transition: Transition,
        run_completed: bool,
    ) -> Result<(), StoreError> {
        let item = &claim.item;
        match (transition.status, transition.failure_class) {
            _ if run_completed && !transition.is_terminal() => info!(
                work_item_id = %item.id,
                work_type = %item.work_type,
                next_execution_at = ?transition.next_execution_at,
                "recurring work item completed and re-armed"
            ),
            (WorkItemStatus::Completed, _) => info!(
                work_item_id = %item.id,
                work_type = %item.work_type,
                "work item completed"
            ),
            (WorkItemStatus::Failed, class) => error!(
                work_item_id = %item.id,
                work_type = %item.work_type,
                step = ?transition.step,
                attempts = transition.attempts,
                failure_class = class.map(|c| c.as_str()).unwrap_or("fatal"),
                error = transition.last_error.as_deref().unwrap_or_default(),
                "work item failed"
            ),
            (WorkItemStatus::RetryWait, _) => warn!(
                work_item_id = %item.id,
                work_type = %item.work_type,
                step = ?transition.step,
                attempts = transition.attempts,
                max_attempts = item.max_attempts,
                next_execution_at = ?transition.next_execution_at,
                error = transition.last_error.as_deref().unwrap_or_default(),
                "work item will retry"
            ),
            (status, _) => debug!(
                work_item_id = %item.id,
                work_type = %item.work_type,
                step = ?transition.step,
                status = %status,
                next_execution_at = ?transition.next_execution_at,
                "work item released"
            ),
        }

        let status = transition.status;
        let outcome = self.leases.release(claim, &transition).await?;

        self.bump(|s| {
            s.processed += 1;
            match outcome {
                ReleaseOutcome::LeaseLost => s.leases_lost += 1,
                ReleaseOutcome::Released => match status {
                    WorkItemStatus::Failed => s.failed += 1,
                    WorkItemStatus::RetryWait => s.retried += 1,
                    _ if run_completed => s.completed += 1,
                    _ => s.stepped += 1,
                },
            }
        });
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut DispatcherStats)) {
        f(&mut lock_stats(&self.stats));
    }
}

/// Invoke the registered handler once and map its outcome.
///
/// Returns the result for the policy and the payload to persist: the
/// handler's mutated payload on success, the unchanged one on failure.
async fn execute(registration: &Registration, item: &WorkItem) -> (ExecutionResult, serde_json::Value) {
    let task_type = &registration.task_type;
    match &registration.handler {
        RegisteredHandler::Single(handler) => match handler.execute(item).await {
            Ok(()) => (ExecutionResult::Completed, item.payload.clone()),
            Err(e) => (classify(task_type, &e), item.payload.clone()),
        },
        RegisteredHandler::Multistep(handler) => {
            let step = match resolve_step(task_type, item.step.as_deref()) {
                Ok(step) => step,
                Err(e) => return (ExecutionResult::fatal(e.to_string()), item.payload.clone()),
            };

            let mut payload = item.payload.clone();
            match handler.execute_step(item, &step, &mut payload).await {
                Ok(result) => (advance(task_type, &step, result), payload),
                Err(e) => (classify(task_type, &e), item.payload.clone()),
            }
        }
    }
}

fn classify(task_type: &TaskType, err: &HandlerError) -> ExecutionResult {
    match task_type.failure_classification.classify(err) {
        FailureKind::Retryable => ExecutionResult::retryable(err.to_string()),
        FailureKind::Fatal => ExecutionResult::fatal(err.to_string()),
    }
}

/// Wall-clock time of a poll: the caller's `now` advanced by a monotonic
/// clock, so explicit test times and real time both work.
struct PollClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl PollClock {
    fn start(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.base + elapsed
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock_stats(stats: &Mutex<DispatcherStats>) -> std::sync::MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryWorkItemStore;
    use chrono::TimeZone;
    use workforge_core::{FailureClass, FailureClassification, RetryPolicy};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn config(name: &str) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name(name)
            .with_worker_id(WorkerId::new(name).unwrap())
            .with_lease_duration(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn unknown_type_fails_fatally_on_first_attempt() {
        let store = InMemoryWorkItemStore::arc();
        let item = WorkItem::new(&TaskType::new("ghost").with_max_attempts(5), serde_json::json!({}))
            .scheduled_at(t0());
        let id = store.insert(item).await.unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(HandlerRegistry::new()), config("w1"));
        assert_eq!(dispatcher.poll_once(t0()).await.unwrap(), 1);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Failed);
        assert_eq!(stored.failure_class, Some(FailureClass::Fatal));
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("ghost"));
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn unclassified_errors_fail_closed() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("import")
            .with_max_attempts(4)
            .with_failure_classification(FailureClassification::default().retryable_on(["timeout"]));
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, |_item| async {
                Err(HandlerError::new("parse_error", "bad header"))
            })
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry), config("w1"));
        dispatcher.poll_once(t0()).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Failed);
        assert_eq!(stored.failure_class, Some(FailureClass::Fatal));
    }

    #[tokio::test]
    async fn classified_retryable_error_backs_off() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("import")
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(30)))
            .with_failure_classification(FailureClassification::default().retryable_on(["timeout"]));
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, |_item| async { Err(HandlerError::new("timeout", "slow upstream")) })
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry), config("w1"));
        dispatcher.poll_once(t0()).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::RetryWait);
        assert_eq!(stored.attempts, 1);
        assert!(stored.next_execution_at.unwrap() >= t0() + chrono::Duration::seconds(30));
        assert!(stored.lock_owner.is_none());

        // Not due yet: nothing to do.
        assert_eq!(dispatcher.poll_once(t0() + chrono::Duration::seconds(10)).await.unwrap(), 0);
        assert_eq!(dispatcher.stats().retried, 1);
    }

    #[tokio::test]
    async fn reclaim_with_spent_budget_is_poisoned_without_running() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("flaky").with_max_attempts(1);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();
        // A worker that claimed it and crashed.
        store
            .try_claim(id, &WorkerId::new("crashed").unwrap(), Duration::from_secs(60), t0())
            .await
            .unwrap();

        let calls = Arc::new(Mutex::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry
            .register_fn(task_type, move |_item| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            })
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry), config("w2"));
        dispatcher.poll_once(t0() + chrono::Duration::seconds(61)).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Failed);
        assert_eq!(stored.failure_class, Some(FailureClass::Poison));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(dispatcher.stats().reclaimed, 1);
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_and_shuts_down() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("ping");
        for _ in 0..3 {
            store.insert(WorkItem::new(&task_type, serde_json::json!({}))).await.unwrap();
        }

        let mut registry = HandlerRegistry::new();
        registry.register_fn(task_type, |_item| async { Ok(()) }).unwrap();

        let handle = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            config("w1").with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        for _ in 0..100 {
            if handle.stats().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().completed, 3);
        handle.shutdown().await;

        assert_eq!(store.stats().await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn panicking_handler_fails_its_item_and_the_batch_continues() {
        let store = InMemoryWorkItemStore::arc();
        let broken = TaskType::new("broken").with_priority(10).with_max_attempts(3);
        let healthy = TaskType::new("healthy");
        let broken_id = store
            .insert(WorkItem::new(&broken, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();
        let healthy_id = store
            .insert(WorkItem::new(&healthy, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(broken, |item| async move {
                let steps: Vec<u32> = Vec::new();
                let _first: u32 = steps[item.attempts as usize];
                Ok(())
            })
            .unwrap();
        registry.register_fn(healthy, |_item| async { Ok(()) }).unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry), config("w1"));
        assert_eq!(dispatcher.poll_once(t0()).await.unwrap(), 2);

        let broken = store.get(broken_id).await.unwrap().unwrap();
        assert_eq!(broken.status, WorkItemStatus::Failed);
        assert_eq!(broken.failure_class, Some(FailureClass::Fatal));
        assert!(broken.last_error.unwrap().contains("handler panicked"));
        assert!(broken.lock_owner.is_none());

        let healthy = store.get(healthy_id).await.unwrap().unwrap();
        assert_eq!(healthy.status, WorkItemStatus::Completed);
    }

    #[tokio::test]
    async fn later_items_in_a_batch_are_leased_when_they_start() {
        let lease = Duration::from_millis(200);
        let store = InMemoryWorkItemStore::arc();
        let slow = TaskType::new("slow").with_priority(10);
        let second = TaskType::new("second");
        let due = Utc::now() - chrono::Duration::seconds(1);
        store.insert(WorkItem::new(&slow, serde_json::json!({})).scheduled_at(due)).await.unwrap();
        let second_id = store
            .insert(WorkItem::new(&second, serde_json::json!({})).scheduled_at(due))
            .await
            .unwrap();

        let stolen = Arc::new(Mutex::new(None));
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(slow, |_item| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            })
            .unwrap();
        let (thief_store, seen) = (store.clone(), stolen.clone());
        registry
            .register_fn(second, move |item| {
                let (store, seen) = (thief_store.clone(), seen.clone());
                async move {
                    let other = WorkerId::new("w2").unwrap();
                    let claimed = store.try_claim(item.id, &other, lease, Utc::now()).await.unwrap();
                    *seen.lock().unwrap() = Some(claimed.is_some());
                    Ok(())
                }
            })
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            config("w1").with_lease_duration(lease),
        );
        assert_eq!(dispatcher.poll_once(Utc::now()).await.unwrap(), 2);

        assert_eq!(*stolen.lock().unwrap(), Some(false));
        let second = store.get(second_id).await.unwrap().unwrap();
        assert_eq!(second.status, WorkItemStatus::Completed);
        assert_eq!(dispatcher.stats().leases_lost, 0);
    }

    #[tokio::test]
    async fn long_running_handler_keeps_its_lease_renewed() {
        let lease = Duration::from_millis(150);
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("export");
        let id = store
            .insert(
                WorkItem::new(&task_type, serde_json::json!({}))
                    .scheduled_at(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        // (competing claim succeeded, lock_acquired_at while running)
        let observed = Arc::new(Mutex::new(None));
        let (handler_store, seen) = (store.clone(), observed.clone());
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, move |item| {
                let (store, seen) = (handler_store.clone(), seen.clone());
                async move {
                    tokio::time::sleep(lease * 3).await;
                    let other = WorkerId::new("w2").unwrap();
                    let stolen = store.try_claim(item.id, &other, lease, Utc::now()).await.unwrap();
                    let current = store.get(item.id).await.unwrap().unwrap();
                    *seen.lock().unwrap() = Some((stolen.is_some(), current.lock_acquired_at));
                    Ok(())
                }
            })
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            config("w1").with_lease_duration(lease),
        );
        let started = Utc::now();
        assert_eq!(dispatcher.poll_once(started).await.unwrap(), 1);

        let (stolen, renewed_at) = observed.lock().unwrap().take().unwrap();
        assert!(!stolen);
        assert!(renewed_at.unwrap() > started + chrono::Duration::milliseconds(100));

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(dispatcher.stats().leases_lost, 0);
    }

    #[test]
    fn idle_backoff_is_capped() {
        let config = DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(100))
            .with_max_idle(Duration::from_millis(350));
        let mut delay = config.poll_interval;
        let mut seen = Vec::new();
        for _ in 0..4 {
            delay = config.next_idle_delay(delay);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![200, 350, 350, 350]);
    }
}
