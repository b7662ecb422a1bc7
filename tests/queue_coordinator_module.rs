use groupclaw::queue::{
    Coordinator, CoordinatorConfig, Delivery, DeliveryOutcome, QueueError, RetryPolicy, WorkItem,
};
use groupclaw::runner::{DispatchOutcome, ExecutionResult, RunnerError, WorkerProcess};
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
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

impl RecordingDelivery {
    fn ids_for(&self, group_id: &str) -> Vec<String> {
        self.delivered
            .lock()
            .expect("lock")
            .iter()
            .filter(|(group, _, _)| group == group_id)
            .map(|(_, id, _)| id.clone())
            .collect()
    }
}

/// Records how many runs overlap, globally and per group.
#[derive(Default)]
struct TrackingRunner {
    active: AtomicUsize,
    peak: AtomicUsize,
    per_group: Mutex<BTreeMap<String, usize>>,
    per_group_peak: Mutex<BTreeMap<String, usize>>,
}

impl groupclaw::queue::WorkRunner for TrackingRunner {
    fn run(
        &self,
        group_id: &str,
        item: &WorkItem,
        _on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> DispatchOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut per_group = self.per_group.lock().expect("lock");
            let count = per_group.entry(group_id.to_string()).or_default();
            *count += 1;
            let mut peaks = self.per_group_peak.lock().expect("lock");
            let peak = peaks.entry(group_id.to_string()).or_default();
            *peak = (*peak).max(*count);
        }
        thread::sleep(Duration::from_millis(30));
        *self
            .per_group
            .lock()
            .expect("lock")
            .get_mut(group_id)
            .expect("group") -= 1;
        self.active.fetch_sub(1, Ordering::SeqCst);
        DispatchOutcome::Completed(ExecutionResult::success_message(item.prompt.clone()))
    }
}

fn config(max_concurrency: usize, log_dir: &std::path::Path) -> CoordinatorConfig {
    CoordinatorConfig {
        max_concurrency,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        log_path: log_dir.join("runtime.log"),
    }
}

#[test]
fn concurrency_cap_and_per_group_serialization_hold_under_load() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(TrackingRunner::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let mut coordinator = Coordinator::new(runner.clone(), delivery.clone(), config(2, dir.path()));

    for n in 0..3 {
        for group in ["g1", "g2", "g3", "g4"] {
            coordinator.admit(WorkItem::message(&format!("{group}-{n}"), group, "x"));
        }
    }
    assert!(coordinator.active_count() <= 2);
    assert!(coordinator.run_until_idle(Duration::from_secs(10)));

    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(coordinator.stats().peak_active, 2);
    for peak in runner.per_group_peak.lock().expect("lock").values() {
        assert_eq!(*peak, 1);
    }
    for group in ["g1", "g2", "g3", "g4"] {
        assert_eq!(
            delivery.ids_for(group),
            vec![format!("{group}-0"), format!("{group}-1"), format!("{group}-2")]
        );
    }
    assert_eq!(coordinator.stats().started, 12);
}

#[test]
fn waiting_groups_get_slots_in_arrival_order() {
    let dir = tempdir().expect("tempdir");
    let runner = Arc::new(TrackingRunner::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let mut coordinator = Coordinator::new(runner, delivery.clone(), config(1, dir.path()));

    coordinator.admit(WorkItem::message("a", "g1", "x"));
    coordinator.admit(WorkItem::message("b", "g2", "x"));
    coordinator.admit(WorkItem::message("c", "g3", "x"));
    assert_eq!(coordinator.active_count(), 1);
    assert!(coordinator.run_until_idle(Duration::from_secs(10)));

    let order: Vec<String> = delivery
        .delivered
        .lock()
        .expect("lock")
        .iter()
        .map(|(_, id, _)| id.clone())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

/// Worker handle that exits as soon as it is asked to stop.
#[derive(Default)]
struct CooperativeProcess {
    stopped: AtomicBool,
}

impl WorkerProcess for CooperativeProcess {
    fn label(&self) -> String {
        "cooperative".to_string()
    }

    fn signal_stop(&self) -> Result<(), RunnerError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn force_kill(&self) -> Result<(), RunnerError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>, RunnerError> {
        Ok(self
            .stopped
            .load(Ordering::SeqCst)
            .then(|| ExitStatus::from_raw(0)))
    }
}

struct BlockingRunner;

impl groupclaw::queue::WorkRunner for BlockingRunner {
    fn run(
        &self,
        _group_id: &str,
        _item: &WorkItem,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> DispatchOutcome {
        let process = Arc::new(CooperativeProcess::default());
        on_spawn(process.clone());
        while !process.stopped.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        DispatchOutcome::Completed(ExecutionResult::error("stopped"))
    }
}

#[test]
fn shutdown_stops_live_workers_and_drops_queued_work() {
    let dir = tempdir().expect("tempdir");
    let delivery = Arc::new(RecordingDelivery::default());
    let mut coordinator =
        Coordinator::new(Arc::new(BlockingRunner), delivery.clone(), config(2, dir.path()));

    coordinator.admit(WorkItem::message("m1", "g1", "x"));
    coordinator.admit(WorkItem::message("m2", "g1", "y"));
    coordinator.pump(Duration::from_secs(2));

    let report = coordinator.shutdown(Duration::from_secs(2));
    assert_eq!(report.signalled, 1);
    assert_eq!(report.force_killed, 0);
    assert_eq!(report.abandoned, 1);
    assert_eq!(coordinator.active_count(), 0);
    assert!(delivery.delivered.lock().expect("lock").is_empty());

    coordinator.admit(WorkItem::message("m3", "g1", "late"));
    assert!(coordinator.is_idle());
}
