//! Tracked batches of independent work items.
//!
//! A batch collects items while open, runs them on the worker pool once
//! started, and folds each item's first terminal outcome into one
//! [`BatchResult`]. Completion is published exactly once, after the last
//! item's outcome was recorded: registered callbacks run on the thread that
//! recorded that outcome, then waiters wake.

pub mod work;

use crate::backup::cancel::CancelToken;
use crate::backup::result_error::error::{human_readable, Error};
use crate::backup::result_error::result::Result;
use derive_more::Display;
use itertools::Itertools;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One unit of work in a batch.
pub trait WorkItem: Send {
    /// Unique within its batch
    fn id(&self) -> String;

    fn label(&self) -> String;

    fn run(&self, cancel: &CancelToken) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub label: String,
    pub state: ItemState,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn succeeded(&self) -> bool {
        self.state == ItemState::Succeeded
    }

    fn from_outcome(label: String, outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) => Self {
                label,
                state: ItemState::Succeeded,
                error: None,
            },
            Err(e) => Self {
                label,
                state: if e.is_cancelled() {
                    ItemState::Cancelled
                } else {
                    ItemState::Failed
                },
                error: Some(human_readable(e)),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[display("succeeded")]
    Succeeded,
    #[display("partially failed")]
    PartiallyFailed,
    #[display("failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_name: String,
    pub per_item: BTreeMap<String, ItemResult>,
}

impl BatchResult {
    /// True when every item succeeded, also when there were none.
    pub fn succeeded(&self) -> bool {
        self.per_item.values().all(ItemResult::succeeded)
    }

    pub fn status(&self) -> BatchStatus {
        let succeeded = self.per_item.values().filter(|i| i.succeeded()).count();
        if succeeded == self.per_item.len() {
            BatchStatus::Succeeded
        } else if succeeded == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyFailed
        }
    }

    /// One `"<label>: <error>"` line per item that did not succeed.
    pub fn error_report(&self) -> String {
        self.per_item
            .values()
            .filter_map(|i| i.error.as_ref().map(|e| format!("{}: {}\n", i.label, e)))
            .join("")
    }
}

/// Completed batches are forgotten once this many are tracked.
const MAX_TRACKED_BATCHES: usize = 64;

type CompletionCallback = Box<dyn FnOnce(&BatchResult) + Send>;

struct BatchInner {
    /// Every enqueued item id with its label
    items: BTreeMap<String, String>,
    results: BTreeMap<String, ItemResult>,
    queued: Vec<Box<dyn WorkItem>>,
    started: bool,
    completed: Option<BatchResult>,
    callbacks: Vec<CompletionCallback>,
}

struct BatchState {
    name: String,
    cancel: CancelToken,
    inner: Mutex<BatchInner>,
    done: Condvar,
}

impl BatchState {
    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `result` unless the item already has one; completes the batch
    /// when that was the last outstanding item.
    fn record(&self, id: &str, result: ItemResult) -> bool {
        let mut inner = self.lock();
        if !inner.items.contains_key(id) || inner.results.contains_key(id) {
            return false;
        }
        tracing::debug!("Batch {}: {} {}", self.name, result.label, result.state);
        inner.results.insert(id.to_string(), result);
        self.complete_if_done(inner);
        true
    }

    fn complete_if_done(&self, mut inner: MutexGuard<'_, BatchInner>) {
        if !inner.started || inner.completed.is_some() || inner.results.len() < inner.items.len() {
            return;
        }
        let result = BatchResult {
            batch_name: self.name.clone(),
            per_item: inner.results.clone(),
        };
        inner.completed = Some(result.clone());
        let callbacks = std::mem::take(&mut inner.callbacks);
        drop(inner);
        tracing::info!(
            "Batch {} completed: {} ({} items)",
            self.name,
            result.status(),
            result.per_item.len()
        );
        for callback in callbacks {
            callback(&result);
        }
        self.done.notify_all();
    }
}

/// Handle to one batch; clones refer to the same batch.
#[derive(Clone)]
pub struct BatchHandle {
    state: Arc<BatchState>,
}

impl BatchHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The result once the batch completed.
    pub fn result(&self) -> Option<BatchResult> {
        self.state.lock().completed.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed.is_some()
    }

    /// Blocks until the batch completed.
    pub fn wait(&self) -> BatchResult {
        let mut inner = self.state.lock();
        loop {
            if let Some(result) = &inner.completed {
                return result.clone();
            }
            inner = self
                .state
                .done
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BatchResult> {
        let inner = self.state.lock();
        let (inner, _) = self
            .state
            .done
            .wait_timeout_while(inner, timeout, |i| i.completed.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        inner.completed.clone()
    }

    /// Runs `callback` once with the final result; immediately when the batch
    /// already completed.
    pub fn on_complete<F: FnOnce(&BatchResult) + Send + 'static>(&self, callback: F) {
        let mut inner = self.state.lock();
        match inner.completed.clone() {
            Some(result) => {
                drop(inner);
                callback(&result);
            }
            None => inner.callbacks.push(Box::new(callback)),
        }
    }
}

/// Handle to one enqueued item.
#[derive(Clone)]
pub struct ItemHandle {
    id: String,
    label: String,
    batch: BatchHandle,
}

impl ItemHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reports a terminal outcome for this item. Only the first report per
    /// item counts; returns whether this one did.
    pub fn observe(&self, outcome: &Result<()>) -> bool {
        self.batch
            .state
            .record(&self.id, ItemResult::from_outcome(self.label.clone(), outcome))
    }
}

pub struct BatchOrchestrator {
    pool: Arc<ThreadPool>,
    batches: Mutex<BTreeMap<String, BatchHandle>>,
}

impl BatchOrchestrator {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self {
            pool,
            batches: Mutex::new(BTreeMap::new()),
        }
    }

    fn batches(&self) -> MutexGuard<'_, BTreeMap<String, BatchHandle>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_batch<S: Into<String>>(&self, name: S) -> BatchHandle {
        let name = name.into();
        let handle = BatchHandle {
            state: Arc::new(BatchState {
                name: name.clone(),
                cancel: CancelToken::new(),
                inner: Mutex::new(BatchInner {
                    items: BTreeMap::new(),
                    results: BTreeMap::new(),
                    queued: Vec::new(),
                    started: false,
                    completed: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        };
        let mut batches = self.batches();
        if batches.len() >= MAX_TRACKED_BATCHES {
            batches.retain(|_, b| !b.is_completed());
        }
        let previous = batches.insert(name.clone(), handle.clone());
        drop(batches);
        if previous.is_some_and(|p| !p.is_completed()) {
            tracing::warn!("Batch {} replaced an unfinished batch of the same name", name);
        }
        tracing::info!("Began batch {}", name);
        handle
    }

    /// Adds `item` to a batch that has not been started yet.
    pub fn enqueue(&self, batch: &BatchHandle, item: Box<dyn WorkItem>) -> Result<ItemHandle> {
        let id = item.id();
        let label = item.label();
        let mut inner = batch.state.lock();
        if inner.started {
            return Err(Error::BatchRejected(format!(
                "{} is already running, cannot add {}",
                batch.name(),
                id
            )));
        }
        if inner.items.contains_key(&id) {
            return Err(Error::BatchRejected(format!(
                "{} already contains {}",
                batch.name(),
                id
            )));
        }
        inner.items.insert(id.clone(), label.clone());
        inner.queued.push(item);
        tracing::debug!("Enqueued {} in batch {}", id, batch.name());
        Ok(ItemHandle {
            id,
            label,
            batch: batch.clone(),
        })
    }

    /// Seals the batch and runs its items. A batch without items completes here.
    pub fn start(&self, batch: &BatchHandle) {
        let mut inner = batch.state.lock();
        if inner.started {
            return;
        }
        inner.started = true;
        let queued = std::mem::take(&mut inner.queued);
        tracing::info!("Starting batch {} with {} items", batch.name(), queued.len());
        for item in queued {
            if inner.results.contains_key(&item.id()) {
                tracing::debug!("{} was already reported, not running it", item.id());
                continue;
            }
            let state = batch.state.clone();
            self.pool.spawn(move || run_item(&state, item));
        }
        batch.state.complete_if_done(inner);
    }

    /// The result of a completed batch, `None` while it is still open or unknown.
    pub fn observe(&self, name: &str) -> Option<BatchResult> {
        self.batches().get(name).and_then(BatchHandle::result)
    }

    /// Asks every unfinished item to stop, waits up to `grace` for them, then
    /// records whatever is still outstanding as cancelled.
    pub fn cancel_batch(&self, batch: &BatchHandle, grace: Duration) -> BatchResult {
        tracing::info!("Cancelling batch {}", batch.name());
        batch.state.cancel.cancel();
        {
            let mut inner = batch.state.lock();
            if !inner.started {
                // never ran, nothing to wait for
                inner.started = true;
                inner.queued.clear();
                let pending = inner
                    .items
                    .iter()
                    .map(|(id, label)| (id.clone(), label.clone()))
                    .collect::<Vec<_>>();
                for (id, label) in pending {
                    inner
                        .results
                        .insert(id, ItemResult::from_outcome(label, &Err(Error::Cancelled)));
                }
                batch.state.complete_if_done(inner);
            }
        }
        if let Some(result) = batch.wait_timeout(grace) {
            return result;
        }

        let outstanding = {
            let inner = batch.state.lock();
            inner
                .items
                .iter()
                .filter(|(id, _)| !inner.results.contains_key(*id))
                .map(|(id, label)| (id.clone(), label.clone()))
                .collect::<Vec<_>>()
        };
        for (id, label) in outstanding {
            tracing::warn!("Batch {}: {} did not stop in time", batch.name(), label);
            batch.state.record(
                &id,
                ItemResult {
                    label,
                    state: ItemState::Cancelled,
                    error: Some("timed out".into()),
                },
            );
        }
        batch.wait()
    }
}

fn run_item(state: &BatchState, item: Box<dyn WorkItem>) {
    let id = item.id();
    let label = item.label();
    let outcome = if state.cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        tracing::info!("Batch {}: running {}", state.name, label);
        catch_unwind(AssertUnwindSafe(|| item.run(&state.cancel)))
            .unwrap_or_else(|_| Err(Error::ItemPanicked(label.clone())))
    };
    if let Err(e) = &outcome {
        tracing::warn!("Batch {}: {} failed: {}", state.name, label, e);
    }
    state.record(&id, ItemResult::from_outcome(label, &outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::ThreadPoolBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Instant;

    struct TestItem {
        id: &'static str,
        delay: Duration,
        fail: Option<Error>,
    }

    impl TestItem {
        fn ok(id: &'static str) -> Box<dyn WorkItem> {
            Box::new(Self {
                id,
                delay: Duration::ZERO,
                fail: None,
            })
        }

        fn failing(id: &'static str, error: Error) -> Box<dyn WorkItem> {
            Box::new(Self {
                id,
                delay: Duration::ZERO,
                fail: Some(error),
            })
        }

        fn slow(id: &'static str, delay: Duration) -> Box<dyn WorkItem> {
            Box::new(Self {
                id,
                delay,
                fail: None,
            })
        }
    }

    impl WorkItem for TestItem {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn label(&self) -> String {
            format!("Label {}", self.id)
        }

        fn run(&self, cancel: &CancelToken) -> Result<()> {
            let started = Instant::now();
            while started.elapsed() < self.delay {
                cancel.check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
            match &self.fail {
                Some(Error::NotFound(msg)) => Err(Error::NotFound(msg.clone())),
                Some(_) => Err(Error::archive_corrupt("bad tag")),
                None => Ok(()),
            }
        }
    }

    /// Ignores cancellation entirely.
    struct StubbornItem;

    impl WorkItem for StubbornItem {
        fn id(&self) -> String {
            "stubborn".into()
        }

        fn label(&self) -> String {
            "Stubborn".into()
        }

        fn run(&self, _: &CancelToken) -> Result<()> {
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        }
    }

    /// Counts how often it was actually run.
    struct CountingItem {
        id: &'static str,
        runs: Arc<AtomicUsize>,
    }

    impl WorkItem for CountingItem {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn label(&self) -> String {
            format!("Label {}", self.id)
        }

        fn run(&self, _cancel: &CancelToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingItem;

    impl WorkItem for PanickingItem {
        fn id(&self) -> String {
            "panics".into()
        }

        fn label(&self) -> String {
            "Panics".into()
        }

        fn run(&self, _: &CancelToken) -> Result<()> {
            panic!("boom")
        }
    }

    fn orchestrator() -> BatchOrchestrator {
        BatchOrchestrator::new(Arc::new(ThreadPoolBuilder::new().num_threads(4).build().unwrap()))
    }

    #[test]
    fn test_empty_batch_completes_on_start() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("empty");
        assert!(!batch.is_completed());
        orchestrator.start(&batch);
        let result = batch.wait_timeout(Duration::from_secs(1)).unwrap();
        assert!(result.succeeded());
        assert_eq!(result.status(), BatchStatus::Succeeded);
        assert!(result.per_item.is_empty());
        assert_eq!(orchestrator.observe("empty"), Some(result));
    }

    #[test]
    fn test_one_entry_per_item_and_single_completion() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("mixed");
        orchestrator.enqueue(&batch, TestItem::ok("a")).unwrap();
        orchestrator
            .enqueue(&batch, TestItem::failing("b", Error::archive_corrupt("x")))
            .unwrap();
        orchestrator
            .enqueue(&batch, TestItem::slow("c", Duration::from_millis(50)))
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();
        let counter = fired.clone();
        batch.on_complete(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(result.per_item.len()).unwrap();
        });
        orchestrator.start(&batch);
        orchestrator.start(&batch);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        let result = batch.wait();
        assert_eq!(result.per_item.len(), 3);
        assert_eq!(result.status(), BatchStatus::PartiallyFailed);
        assert!(!result.succeeded());
        assert_eq!(
            result.error_report(),
            "Label b: backup is broken or the encryption password is wrong (bad tag)\n"
        );
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observation_is_idempotent() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("manual");
        let runs = Arc::new(AtomicUsize::new(0));
        let item = orchestrator
            .enqueue(&batch, Box::new(CountingItem { id: "a", runs: runs.clone() }))
            .unwrap();
        let other = orchestrator
            .enqueue(&batch, Box::new(CountingItem { id: "b", runs: runs.clone() }))
            .unwrap();
        assert!(item.observe(&Ok(())));
        assert!(!item.observe(&Err(Error::NotFound("late".into()))));
        assert!(!batch.is_completed());
        assert!(other.observe(&Err(Error::NotFound("gone".into()))));

        orchestrator.start(&batch);
        let result = batch.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.per_item["a"].state, ItemState::Succeeded);
        assert_eq!(result.per_item["b"].state, ItemState::Failed);
        assert_eq!(result.status(), BatchStatus::PartiallyFailed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_runs_only_unreported_items() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("partly reported");
        let runs = Arc::new(AtomicUsize::new(0));
        let reported = orchestrator
            .enqueue(&batch, Box::new(CountingItem { id: "a", runs: runs.clone() }))
            .unwrap();
        orchestrator
            .enqueue(&batch, Box::new(CountingItem { id: "b", runs: runs.clone() }))
            .unwrap();
        assert!(reported.observe(&Ok(())));

        orchestrator.start(&batch);
        let result = batch.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.succeeded());
        assert_eq!(result.per_item.len(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_failed_is_failed() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("bad");
        orchestrator
            .enqueue(&batch, TestItem::failing("a", Error::NotFound("x".into())))
            .unwrap();
        orchestrator.start(&batch);
        let result = batch.wait();
        assert_eq!(result.status(), BatchStatus::Failed);
        assert_eq!(result.error_report(), "Label a: not found: x\n");
    }

    #[test]
    fn test_panicking_item_is_failed() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("panic");
        orchestrator.enqueue(&batch, Box::new(PanickingItem)).unwrap();
        orchestrator.enqueue(&batch, TestItem::ok("a")).unwrap();
        orchestrator.start(&batch);
        let result = batch.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.per_item["panics"].state, ItemState::Failed);
        assert_eq!(result.per_item["panics"].error.as_deref(), Some("Panics panicked"));
        assert_eq!(result.status(), BatchStatus::PartiallyFailed);
    }

    #[test]
    fn test_enqueue_rules() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("rules");
        orchestrator.enqueue(&batch, TestItem::ok("a")).unwrap();
        assert!(matches!(
            orchestrator.enqueue(&batch, TestItem::ok("a")),
            Err(Error::BatchRejected(_))
        ));
        orchestrator.start(&batch);
        assert!(matches!(
            orchestrator.enqueue(&batch, TestItem::ok("b")),
            Err(Error::BatchRejected(_))
        ));
        assert_eq!(batch.wait().per_item.len(), 1);
    }

    #[test]
    fn test_cancel_stops_cooperative_items() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("cancel");
        orchestrator.enqueue(&batch, TestItem::ok("fast")).unwrap();
        orchestrator
            .enqueue(&batch, TestItem::slow("slow", Duration::from_secs(30)))
            .unwrap();
        orchestrator.start(&batch);
        std::thread::sleep(Duration::from_millis(100));

        let result = orchestrator.cancel_batch(&batch, Duration::from_secs(5));
        assert_eq!(result.per_item["fast"].state, ItemState::Succeeded);
        assert_eq!(result.per_item["slow"].state, ItemState::Cancelled);
        assert_eq!(result.status(), BatchStatus::PartiallyFailed);
    }

    #[test]
    fn test_cancel_times_out_stubborn_items() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("stubborn");
        orchestrator.enqueue(&batch, Box::new(StubbornItem)).unwrap();
        orchestrator.start(&batch);
        std::thread::sleep(Duration::from_millis(50));

        let result = orchestrator.cancel_batch(&batch, Duration::from_millis(100));
        let item = &result.per_item["stubborn"];
        assert_eq!(item.state, ItemState::Cancelled);
        assert_eq!(item.error.as_deref(), Some("timed out"));
        // the late finish does not change the published result
        std::thread::sleep(Duration::from_millis(1600));
        assert_eq!(batch.result(), Some(result));
    }

    #[test]
    fn test_cancel_before_start() {
        let orchestrator = orchestrator();
        let batch = orchestrator.begin_batch("never");
        orchestrator.enqueue(&batch, TestItem::ok("a")).unwrap();
        let result = orchestrator.cancel_batch(&batch, Duration::from_secs(1));
        assert_eq!(result.per_item["a"].state, ItemState::Cancelled);
        assert_eq!(result.status(), BatchStatus::Failed);
    }
}
