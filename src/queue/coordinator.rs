use super::delivery::{Delivery, DeliveryOutcome};
use super::inbox;
use super::retry::RetryPolicy;
use super::WorkItem;
use crate::runner::{DispatchOutcome, ExecutionResult, WorkerProcess};
use crate::shared::logging::append_event;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);
const IDLE_PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one work item for a group to a final outcome. `on_spawn` receives
/// the live worker handle as soon as it exists so shutdown can reach it.
pub trait WorkRunner: Send + Sync {
    fn run(
        &self,
        group_id: &str,
        item: &WorkItem,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> DispatchOutcome;
}

enum CoordinatorEvent {
    Spawned {
        group_id: String,
        process: Arc<dyn WorkerProcess>,
    },
    Exited {
        group_id: String,
        outcome: DispatchOutcome,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    seq: u64,
    item: WorkItem,
}

/// Per-group queue state. Created on first work for a group, never persisted.
#[derive(Default)]
pub struct QueueEntry {
    active: bool,
    process: Option<Arc<dyn WorkerProcess>>,
    pending_messages: VecDeque<Pending>,
    pending_tasks: VecDeque<Pending>,
    retry_count: u32,
    next_retry_at: Option<Instant>,
    /// Item currently running, or waiting out its retry backoff.
    current: Option<Pending>,
}

impl QueueEntry {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pending_len(&self) -> usize {
        self.pending_messages.len() + self.pending_tasks.len()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.next_retry_at.map(|at| at > now).unwrap_or(false)
    }

    fn has_work(&self) -> bool {
        self.current.is_some() || self.pending_len() > 0
    }

    /// Oldest pending item across both lists.
    fn pop_next(&mut self) -> Option<Pending> {
        let take_task = match (self.pending_messages.front(), self.pending_tasks.front()) {
            (Some(message), Some(task)) => task.seq < message.seq,
            (None, Some(_)) => true,
            _ => false,
        };
        if take_task {
            self.pending_tasks.pop_front()
        } else {
            self.pending_messages.pop_front()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub started: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub peak_active: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub signalled: usize,
    pub force_killed: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub log_path: PathBuf,
}

/// Owns all queue state. Only the thread holding `&mut Coordinator` mutates
/// it; worker threads report back over a channel.
pub struct Coordinator {
    runner: Arc<dyn WorkRunner>,
    delivery: Arc<dyn Delivery>,
    config: CoordinatorConfig,
    entries: BTreeMap<String, QueueEntry>,
    waiting: VecDeque<String>,
    active_count: usize,
    next_seq: u64,
    stopping: bool,
    stats: CoordinatorStats,
    events_tx: Sender<CoordinatorEvent>,
    events_rx: Receiver<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(
        runner: Arc<dyn WorkRunner>,
        delivery: Arc<dyn Delivery>,
        config: CoordinatorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            runner,
            delivery,
            config,
            entries: BTreeMap::new(),
            waiting: VecDeque::new(),
            active_count: 0,
            next_seq: 0,
            stopping: false,
            stats: CoordinatorStats::default(),
            events_tx,
            events_rx,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn entry(&self, group_id: &str) -> Option<&QueueEntry> {
        self.entries.get(group_id)
    }

    pub fn is_idle(&self) -> bool {
        self.active_count == 0 && self.entries.values().all(|entry| !entry.has_work())
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        append_event(&self.config.log_path, level, event, message);
    }

    /// Enqueues `item` for its group and starts it if the group is idle and
    /// a slot is free.
    pub fn admit(&mut self, item: WorkItem) {
        if self.stopping {
            self.log(
                "warn",
                "queue.admit_rejected",
                &format!("coordinator is stopping; item `{}` left for recovery", item.id),
            );
            return;
        }
        let group_id = item.group_id.clone();
        let seq = self.next_seq;
        self.next_seq += 1;
        let is_task = item.is_task();
        self.log(
            "info",
            "queue.admit",
            &format!("group=`{group_id}` item=`{}` task={is_task}", item.id),
        );

        let entry = self.entries.entry(group_id.clone()).or_default();
        let pending = Pending { seq, item };
        if is_task {
            entry.pending_tasks.push_back(pending);
        } else {
            entry.pending_messages.push_back(pending);
        }
        if entry.active || entry.in_backoff(Instant::now()) {
            return;
        }
        if self.active_count < self.config.max_concurrency {
            self.start_next(&group_id);
        } else if !self.waiting.contains(&group_id) {
            self.waiting.push_back(group_id);
        }
    }

    fn start_next(&mut self, group_id: &str) {
        let Some(entry) = self.entries.get_mut(group_id) else {
            return;
        };
        if entry.active {
            return;
        }
        let pending = match entry.current.take() {
            Some(retry) => retry,
            None => match entry.pop_next() {
                Some(next) => next,
                None => return,
            },
        };
        entry.active = true;
        entry.next_retry_at = None;
        entry.current = Some(pending.clone());
        self.active_count += 1;
        self.stats.started += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active_count);

        let runner = Arc::clone(&self.runner);
        let tx = self.events_tx.clone();
        let group = group_id.to_string();
        let item = pending.item;
        thread::spawn(move || {
            let spawn_tx = tx.clone();
            let spawn_group = group.clone();
            let on_spawn = move |process: Arc<dyn WorkerProcess>| {
                let _ = spawn_tx.send(CoordinatorEvent::Spawned {
                    group_id: spawn_group.clone(),
                    process,
                });
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(&group, &item, &on_spawn)))
                .unwrap_or_else(|_| {
                    DispatchOutcome::Completed(ExecutionResult::error("worker runner panicked"))
                });
            let _ = tx.send(CoordinatorEvent::Exited {
                group_id: group,
                outcome,
            });
        });
    }

    /// Releases the group's slot, resolves or reschedules its item, then
    /// refills free slots.
    pub fn on_worker_exit(&mut self, group_id: &str, outcome: DispatchOutcome) {
        let Some(entry) = self.entries.get_mut(group_id) else {
            return;
        };
        if !entry.active {
            return;
        }
        entry.active = false;
        entry.process = None;
        self.active_count = self.active_count.saturating_sub(1);
        self.stats.completed += 1;

        if self.stopping {
            entry.current = None;
            return;
        }
        let Some(pending) = entry.current.take() else {
            return;
        };

        let resolved = match outcome {
            DispatchOutcome::Completed(result) if result.is_success() => {
                entry.retry_count = 0;
                let outcome = match result.deliverable_message() {
                    Some(text) => DeliveryOutcome::Reply(text.to_string()),
                    None => DeliveryOutcome::Logged(
                        result.result.as_ref().and_then(|p| p.internal_log.clone()),
                    ),
                };
                Some(outcome)
            }
            DispatchOutcome::Completed(result) => {
                entry.retry_count += 1;
                let error = result
                    .error
                    .unwrap_or_else(|| "worker reported an error".to_string());
                if self.config.retry.should_retry(entry.retry_count) {
                    let delay = self.config.retry.delay_for(entry.retry_count);
                    entry.next_retry_at = Some(Instant::now() + delay);
                    entry.current = Some(pending.clone());
                    self.stats.retried += 1;
                    let attempt = entry.retry_count;
                    self.log(
                        "warn",
                        "queue.retry",
                        &format!(
                            "group=`{group_id}` item=`{}` attempt={attempt} retry_in_ms={} error={error}",
                            pending.item.id,
                            delay.as_millis()
                        ),
                    );
                    None
                } else {
                    let attempts = entry.retry_count;
                    entry.retry_count = 0;
                    entry.next_retry_at = None;
                    self.stats.failed += 1;
                    Some(DeliveryOutcome::Failed { error, attempts })
                }
            }
            DispatchOutcome::Unavailable { mode, message } => {
                entry.retry_count = 0;
                self.stats.failed += 1;
                self.log(
                    "warn",
                    "dispatch.unavailable",
                    &format!("group=`{group_id}` mode={mode}"),
                );
                Some(DeliveryOutcome::Unavailable(message))
            }
            DispatchOutcome::Rejected { reason } => {
                entry.retry_count = 0;
                self.stats.failed += 1;
                self.log(
                    "error",
                    "dispatch.rejected",
                    &format!("group=`{group_id}`: {reason}"),
                );
                Some(DeliveryOutcome::Failed {
                    error: reason,
                    attempts: 1,
                })
            }
        };

        if let Some(outcome) = resolved {
            self.resolve(group_id, &pending.item, &outcome);
        }
        self.refill(group_id);
    }

    fn resolve(&self, group_id: &str, item: &WorkItem, outcome: &DeliveryOutcome) {
        if let Err(err) = self.delivery.deliver(group_id, item, outcome) {
            self.log(
                "error",
                "queue.delivery_failed",
                &format!("group=`{group_id}` item=`{}`: {err}", item.id),
            );
            return;
        }
        if let Some(path) = &item.claim_path {
            if let Err(err) = inbox::complete(path) {
                self.log("warn", "queue.complete_failed", &err.to_string());
            }
        }
    }

    /// The group that just freed a slot continues with its own backlog;
    /// otherwise the slot goes to the longest-waiting group.
    fn refill(&mut self, freed_group: &str) {
        let now = Instant::now();
        let continue_same = self
            .entries
            .get(freed_group)
            .map(|entry| !entry.active && !entry.in_backoff(now) && entry.has_work())
            .unwrap_or(false);
        if continue_same && self.active_count < self.config.max_concurrency {
            self.waiting.retain(|group| group != freed_group);
            self.start_next(freed_group);
        }
        self.promote_waiting();
    }

    fn promote_waiting(&mut self) {
        let now = Instant::now();
        while self.active_count < self.config.max_concurrency {
            let Some(group_id) = self.waiting.pop_front() else {
                break;
            };
            let runnable = self
                .entries
                .get(&group_id)
                .map(|entry| !entry.active && !entry.in_backoff(now) && entry.has_work())
                .unwrap_or(false);
            if runnable {
                self.start_next(&group_id);
            }
        }
    }

    fn wake_due_retries(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                !entry.active && entry.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|(group_id, _)| group_id.clone())
            .collect();
        for group_id in due {
            if let Some(entry) = self.entries.get_mut(&group_id) {
                entry.next_retry_at = None;
            }
            if self.active_count < self.config.max_concurrency {
                self.start_next(&group_id);
            } else if !self.waiting.contains(&group_id) {
                self.waiting.push_back(group_id);
            }
        }
    }

    fn next_retry_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| !entry.active)
            .filter_map(|entry| entry.next_retry_at)
            .min()
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Spawned { group_id, process } => {
                if self.stopping {
                    if let Err(err) = process.signal_stop() {
                        self.log("warn", "queue.shutdown_signal_failed", &err.to_string());
                    }
                }
                if let Some(entry) = self.entries.get_mut(&group_id) {
                    if entry.active {
                        entry.process = Some(process);
                    }
                }
            }
            CoordinatorEvent::Exited { group_id, outcome } => {
                self.on_worker_exit(&group_id, outcome);
            }
        }
    }

    /// Waits up to `timeout` for worker events, applies them, and starts any
    /// retries whose backoff has elapsed. Returns the number of events seen.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let mut wait = timeout;
        if let Some(deadline) = self.next_retry_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        let mut handled = 0;
        match self.events_rx.recv_timeout(wait) {
            Ok(event) => {
                self.handle_event(event);
                handled += 1;
                while let Ok(event) = self.events_rx.try_recv() {
                    self.handle_event(event);
                    handled += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        self.wake_due_retries();
        handled
    }

    /// Pumps until nothing is running or pending, or `limit` elapses.
    /// Returns whether the coordinator went idle.
    pub fn run_until_idle(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.pump(remaining.min(IDLE_PUMP_INTERVAL));
        }
        true
    }

    fn live_processes(&self) -> Vec<Arc<dyn WorkerProcess>> {
        self.entries
            .values()
            .filter(|entry| entry.active)
            .filter_map(|entry| entry.process.clone())
            .collect()
    }

    fn wait_for_exits(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.active_count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.events_rx.recv_timeout(remaining.min(IDLE_PUMP_INTERVAL)) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Stops every live worker: graceful signal, `grace` to exit, then a
    /// forced kill. Queued work is dropped; its inbox files stay in
    /// `processing` and are recovered on the next start.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        self.stopping = true;
        let mut report = ShutdownReport::default();

        for entry in self.entries.values_mut() {
            report.abandoned += entry.pending_len();
            if !entry.active && entry.current.take().is_some() {
                report.abandoned += 1;
            }
            entry.pending_messages.clear();
            entry.pending_tasks.clear();
            entry.next_retry_at = None;
            entry.retry_count = 0;
        }
        self.waiting.clear();

        for process in self.live_processes() {
            report.signalled += 1;
            if let Err(err) = process.signal_stop() {
                self.log("warn", "queue.shutdown_signal_failed", &err.to_string());
            }
        }
        self.wait_for_exits(grace);

        if self.active_count > 0 {
            for process in self.live_processes() {
                if matches!(process.try_wait(), Ok(Some(_))) {
                    continue;
                }
                report.force_killed += 1;
                if let Err(err) = process.force_kill() {
                    self.log("warn", "queue.shutdown_kill_failed", &err.to_string());
                }
            }
            self.wait_for_exits(FORCE_KILL_WAIT);
        }

        self.log(
            "info",
            "queue.shutdown",
            &format!(
                "signalled={} force_killed={} abandoned={} still_active={}",
                report.signalled, report.force_killed, report.abandoned, self.active_count
            ),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingDelivery {
        delivered: Mutex<Vec<(String, String, DeliveryOutcome)>>,
    }

    impl Delivery for RecordingDelivery {
        fn deliver(
            &self,
            group_id: &str,
            item: &WorkItem,
            outcome: &DeliveryOutcome,
        ) -> Result<(), QueueError> {
            self.delivered.lock().expect("lock").push((
                group_id.to_string(),
                item.id.clone(),
                outcome.clone(),
            ));
            Ok(())
        }
    }

    /// Fails the first `failures` runs, then echoes the prompt.
    struct FlakyRunner {
        failures: usize,
        calls: AtomicUsize,
    }

    impl WorkRunner for FlakyRunner {
        fn run(
            &self,
            _group_id: &str,
            item: &WorkItem,
            _on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
        ) -> DispatchOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                DispatchOutcome::Completed(ExecutionResult::error("transient"))
            } else {
                DispatchOutcome::Completed(ExecutionResult::success_message(item.prompt.clone()))
            }
        }
    }

    fn coordinator(
        runner: Arc<dyn WorkRunner>,
        delivery: Arc<RecordingDelivery>,
        max_attempts: u32,
        log_dir: &std::path::Path,
    ) -> Coordinator {
        Coordinator::new(
            runner,
            delivery,
            CoordinatorConfig {
                max_concurrency: 2,
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                },
                log_path: log_dir.join("runtime.log"),
            },
        )
    }

    #[test]
    fn transient_errors_are_retried_then_delivered() {
        let dir = tempdir().expect("tempdir");
        let delivery = Arc::new(RecordingDelivery::default());
        let runner = Arc::new(FlakyRunner {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let mut coordinator = coordinator(runner.clone(), delivery.clone(), 5, dir.path());

        coordinator.admit(WorkItem::message("m1", "g1", "pong"));
        assert!(coordinator.run_until_idle(Duration::from_secs(5)));

        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        let delivered = delivery.delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].2, DeliveryOutcome::Reply("pong".to_string()));
        assert_eq!(coordinator.stats().retried, 2);
    }

    #[test]
    fn exhausted_retries_surface_the_error_and_free_the_group() {
        let dir = tempdir().expect("tempdir");
        let delivery = Arc::new(RecordingDelivery::default());
        let runner = Arc::new(FlakyRunner {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let mut coordinator = coordinator(runner.clone(), delivery.clone(), 3, dir.path());

        coordinator.admit(WorkItem::message("m1", "g1", "x"));
        coordinator.admit(WorkItem::message("m2", "g1", "y"));
        assert!(coordinator.run_until_idle(Duration::from_secs(5)));

        let delivered = delivery.delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].1, "m1");
        assert!(matches!(
            delivered[0].2,
            DeliveryOutcome::Failed { attempts: 3, .. }
        ));
        assert_eq!(delivered[1].1, "m2");
        let entry = coordinator.entry("g1").expect("entry");
        assert!(!entry.is_active());
        assert_eq!(entry.retry_count(), 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn messages_and_tasks_keep_arrival_order_within_a_group() {
        let dir = tempdir().expect("tempdir");
        let delivery = Arc::new(RecordingDelivery::default());
        let runner = Arc::new(FlakyRunner {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let mut coordinator = coordinator(runner, delivery.clone(), 1, dir.path());

        coordinator.admit(WorkItem::message("1", "g1", "a"));
        coordinator.admit(WorkItem::task("2", "g1", "t", "b"));
        coordinator.admit(WorkItem::message("3", "g1", "c"));
        coordinator.admit(WorkItem::task("4", "g1", "t", "d"));
        assert!(coordinator.run_until_idle(Duration::from_secs(5)));

        let order: Vec<String> = delivery
            .delivered
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, id, _)| id.clone())
            .collect();
        assert_eq!(order, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn unavailable_backends_are_reported_without_retry() {
        struct DownRunner;
        impl WorkRunner for DownRunner {
            fn run(
                &self,
                _group_id: &str,
                _item: &WorkItem,
                _on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
            ) -> DispatchOutcome {
                DispatchOutcome::Unavailable {
                    mode: crate::config::ExecutionMode::Isolated,
                    message: "isolated backend unavailable: docker is not running".to_string(),
                }
            }
        }
        let dir = tempdir().expect("tempdir");
        let delivery = Arc::new(RecordingDelivery::default());
        let mut coordinator = coordinator(Arc::new(DownRunner), delivery.clone(), 5, dir.path());
        coordinator.admit(WorkItem::message("m1", "g1", "x"));
        assert!(coordinator.run_until_idle(Duration::from_secs(5)));

        let delivered = delivery.delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 1);
        match &delivered[0].2 {
            DeliveryOutcome::Unavailable(message) => {
                assert!(message.contains("unavailable"));
                assert!(message.contains("docker is not running"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(coordinator.stats().retried, 0);
    }

    #[test]
    fn panicking_runner_does_not_wedge_the_group() {
        struct PanicRunner;
        impl WorkRunner for PanicRunner {
            fn run(
                &self,
                _group_id: &str,
                _item: &WorkItem,
                _on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
            ) -> DispatchOutcome {
                panic!("boom");
            }
        }
        let dir = tempdir().expect("tempdir");
        let delivery = Arc::new(RecordingDelivery::default());
        let mut coordinator = coordinator(Arc::new(PanicRunner), delivery.clone(), 1, dir.path());
        coordinator.admit(WorkItem::message("m1", "g1", "x"));
        assert!(coordinator.run_until_idle(Duration::from_secs(5)));
        assert!(!coordinator.entry("g1").expect("entry").is_active());
        assert_eq!(delivery.delivered.lock().expect("lock").len(), 1);
    }
}
