//! Integration tests for the full dispatch pipeline.
//!
//! Tests: Store → LeaseManager → HandlerRegistry → Handler → Policy → Release
//!
//! Verifies:
//! - Multistep items checkpoint step and payload across leases and workers
//! - Attempt budgets, fatal failures and poison escalation
//! - Mutual exclusion under concurrent claims
//! - Recurring re-arming and disable-while-in-flight

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use workforge_core::{
        FailureClass, HandlerError, RetryPolicy, Schedule, StepDescriptor, StepResult, TaskType,
        WorkItem, WorkItemId, WorkItemStatus, WorkerId,
    };

    use crate::queue::{
        ClaimResult, Dispatcher, DispatcherConfig, HandlerRegistry, InMemoryWorkItemStore,
        LeaseManager, StepHandler, WorkItemStore,
    };

    const LEASE: Duration = Duration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 14, 8, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::minutes(n)
    }

    fn dispatcher(
        store: &Arc<InMemoryWorkItemStore>,
        registry: HandlerRegistry,
        worker: &str,
    ) -> Dispatcher {
        Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            DispatcherConfig::default()
                .with_name(worker)
                .with_worker_id(WorkerId::new(worker).unwrap())
                .with_lease_duration(LEASE),
        )
    }

    /// Poll once a minute until the item is terminal (or `max_polls` is hit).
    async fn drive(dispatcher: &Dispatcher, store: &InMemoryWorkItemStore, id: WorkItemId, max_polls: i64) -> WorkItem {
        for n in 0..max_polls {
            dispatcher.poll_once(minutes(n)).await.unwrap();
            let item = store.get(id).await.unwrap().unwrap();
            if item.status.is_terminal() {
                return item;
            }
        }
        store.get(id).await.unwrap().unwrap()
    }

    /// Records every step it runs into the payload and a shared log.
    /// Fails `fail_step` retryably `failures` times before letting it pass.
    struct ProvisionHandler {
        visits: Arc<Mutex<Vec<String>>>,
        fail_step: Option<&'static str>,
        failures: Mutex<u32>,
    }

    impl ProvisionHandler {
        fn new(fail_step: Option<&'static str>, failures: u32) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let visits = Arc::new(Mutex::new(Vec::new()));
            let handler = Arc::new(Self {
                visits: visits.clone(),
                fail_step,
                failures: Mutex::new(failures),
            });
            (handler, visits)
        }
    }

    #[async_trait]
    impl StepHandler for ProvisionHandler {
        async fn execute_step(
            &self,
            _item: &WorkItem,
            step: &StepDescriptor,
            payload: &mut serde_json::Value,
        ) -> Result<StepResult, HandlerError> {
            self.visits.lock().unwrap().push(step.name.clone());

            if self.fail_step == Some(step.name.as_str()) {
                let mut remaining = self.failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    payload["poisoned"] = serde_json::json!(true);
                    return Err(HandlerError::retryable("dependency unavailable"));
                }
            }

            payload["done"]
                .as_array_mut()
                .expect("payload carries a done list")
                .push(serde_json::json!(step.name));
            Ok(StepResult::Complete)
        }
    }

    fn provision_type(max_attempts: u32) -> TaskType {
        TaskType::new("provision")
            .with_retry_policy(RetryPolicy::fixed(max_attempts, Duration::from_secs(10)))
            .with_steps(["reserve", "configure", "verify", "notify"])
    }

    #[tokio::test]
    async fn four_step_item_survives_two_retryable_failures() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = provision_type(3);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({"done": []})).scheduled_at(t0()))
            .await
            .unwrap();

        let (handler, visits) = ProvisionHandler::new(Some("configure"), 2);
        let mut registry = HandlerRegistry::new();
        registry.register_steps(task_type, handler).unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        let item = drive(&dispatcher, &store, id, 20).await;

        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(item.attempts, 2);
        assert_eq!(
            *visits.lock().unwrap(),
            vec!["reserve", "configure", "configure", "configure", "verify", "notify"]
        );
        // Failed executions never persisted their payload mutation.
        assert_eq!(
            item.payload,
            serde_json::json!({"done": ["reserve", "configure", "verify", "notify"]})
        );
        assert!(item.lock_owner.is_none());
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_into_poison() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = provision_type(3);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({"done": []})).scheduled_at(t0()))
            .await
            .unwrap();

        let (handler, visits) = ProvisionHandler::new(Some("reserve"), u32::MAX);
        let mut registry = HandlerRegistry::new();
        registry.register_steps(task_type, handler).unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        let item = drive(&dispatcher, &store, id, 20).await;

        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.failure_class, Some(FailureClass::Poison));
        assert_eq!(item.attempts, 3);
        assert_eq!(visits.lock().unwrap().len(), 3);
        assert_eq!(item.step, None);
    }

    #[tokio::test]
    async fn fatal_handler_fails_after_exactly_one_attempt() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("invoice.render").with_max_attempts(5);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, move |_item| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(HandlerError::fatal("template missing"))
                }
            })
            .unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        let item = drive(&dispatcher, &store, id, 10).await;

        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.failure_class, Some(FailureClass::Fatal));
        assert_eq!(item.attempts, 1);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(item.last_error.unwrap().contains("template missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("sms.send");

        for _ in 0..50 {
            let id = store
                .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
                .await
                .unwrap();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let contenders: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|name| {
                    let leases = LeaseManager::new(store.clone(), WorkerId::new(name).unwrap(), LEASE);
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        leases.try_claim(id, t0()).await.unwrap()
                    })
                })
                .collect();

            let mut winners = 0;
            let mut losers = 0;
            for contender in contenders {
                match contender.await.unwrap() {
                    ClaimResult::Claimed(_) => winners += 1,
                    ClaimResult::NotAvailable => losers += 1,
                }
            }
            assert_eq!((winners, losers), (1, 1));
        }
    }

    #[tokio::test]
    async fn recurring_item_runs_and_rearms_strictly_after_now() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("cleanup");
        let mut item = WorkItem::new(&task_type, serde_json::json!({}))
            .with_schedule(Schedule::Interval { every_secs: 3600 });
        item.next_execution_at = Some(t0() - chrono::Duration::minutes(5));
        let id = store.insert(item).await.unwrap();

        let runs = Arc::new(Mutex::new(0u32));
        let counter = runs.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, move |_item| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            })
            .unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        assert_eq!(dispatcher.poll_once(t0()).await.unwrap(), 1);

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.next_execution_at.unwrap() > t0());
        assert_eq!(*runs.lock().unwrap(), 1);

        // Not due again until the next fire.
        assert_eq!(dispatcher.poll_once(minutes(30)).await.unwrap(), 0);
        assert_eq!(dispatcher.poll_once(minutes(61)).await.unwrap(), 1);
        assert_eq!(*runs.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn crashed_lease_resumes_at_same_step_with_saved_payload() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = provision_type(3);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({"done": []})).scheduled_at(t0()))
            .await
            .unwrap();

        let (handler, visits) = ProvisionHandler::new(None, 0);
        let mut registry = HandlerRegistry::new();
        registry.register_steps(task_type, handler).unwrap();
        let survivor = dispatcher(&store, registry, "survivor");

        // First step runs normally.
        survivor.poll_once(t0()).await.unwrap();
        let after_first = store.get(id).await.unwrap().unwrap();
        assert_eq!(after_first.step.as_deref(), Some("configure"));

        // Another worker claims the second step and dies holding the lease.
        let crashed = LeaseManager::new(store.clone(), WorkerId::new("crashed").unwrap(), LEASE);
        assert!(matches!(crashed.try_claim(id, minutes(1)).await.unwrap(), ClaimResult::Claimed(_)));

        // Still leased: nobody can take it.
        assert_eq!(survivor.poll_once(minutes(1) + chrono::Duration::seconds(30)).await.unwrap(), 0);

        // Lease expired: the survivor reclaims and resumes at "configure".
        assert_eq!(survivor.poll_once(minutes(2) + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert_eq!(*visits.lock().unwrap(), vec!["reserve", "configure"]);

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.step.as_deref(), Some("verify"));
        assert_eq!(item.payload, serde_json::json!({"done": ["reserve", "configure"]}));
        assert_eq!(item.attempts, 1);
        assert_eq!(survivor.stats().reclaimed, 1);
    }

    /// Disables its own item mid-step, like an operator acting concurrently.
    struct DisablingHandler {
        store: Arc<InMemoryWorkItemStore>,
    }

    #[async_trait]
    impl StepHandler for DisablingHandler {
        async fn execute_step(
            &self,
            item: &WorkItem,
            _step: &StepDescriptor,
            payload: &mut serde_json::Value,
        ) -> Result<StepResult, HandlerError> {
            self.store.set_enabled(item.id, false, t0()).await.unwrap();
            payload["finished_first"] = serde_json::json!(true);
            Ok(StepResult::Complete)
        }
    }

    #[tokio::test]
    async fn disabling_in_flight_item_lets_the_execution_finish() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("export").with_steps(["collect", "upload"]);
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_steps(task_type, Arc::new(DisablingHandler { store: store.clone() }))
            .unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        assert_eq!(dispatcher.poll_once(t0()).await.unwrap(), 1);

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Disabled);
        assert_eq!(item.step.as_deref(), Some("upload"));
        assert_eq!(item.payload, serde_json::json!({"finished_first": true}));
        assert!(item.lock_owner.is_none());

        // Gone from future polls.
        assert_eq!(dispatcher.poll_once(minutes(10)).await.unwrap(), 0);
        assert!(store.find_candidates(minutes(10), LEASE, 10).await.unwrap().is_empty());
    }

    /// Reports "not ready" a fixed number of times per step.
    struct PollingHandler {
        not_ready: Mutex<u32>,
    }

    #[async_trait]
    impl StepHandler for PollingHandler {
        async fn execute_step(
            &self,
            _item: &WorkItem,
            _step: &StepDescriptor,
            payload: &mut serde_json::Value,
        ) -> Result<StepResult, HandlerError> {
            let polls = payload["polls"].as_u64().unwrap_or(0);
            payload["polls"] = serde_json::json!(polls + 1);

            let mut not_ready = self.not_ready.lock().unwrap();
            if *not_ready > 0 {
                *not_ready -= 1;
                return Ok(StepResult::Incomplete);
            }
            Ok(StepResult::Complete)
        }
    }

    #[tokio::test]
    async fn step_pending_never_spends_the_attempt_budget() {
        let store = InMemoryWorkItemStore::arc();
        let task_type = TaskType::new("await.settlement")
            .with_max_attempts(1)
            .with_steps(["wait"])
            .with_step_poll_interval(Duration::from_secs(30));
        let id = store
            .insert(WorkItem::new(&task_type, serde_json::json!({})).scheduled_at(t0()))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_steps(task_type, Arc::new(PollingHandler { not_ready: Mutex::new(4) }))
            .unwrap();
        let dispatcher = dispatcher(&store, registry, "w1");

        dispatcher.poll_once(t0()).await.unwrap();
        let held = store.get(id).await.unwrap().unwrap();
        assert_eq!(held.status, WorkItemStatus::Pending);
        assert_eq!(held.attempts, 0);
        assert_eq!(held.step, None);
        assert!(held.next_execution_at.unwrap() >= t0() + chrono::Duration::seconds(30));

        let item = drive(&dispatcher, &store, id, 20).await;
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.payload, serde_json::json!({"polls": 5}));
    }
}
