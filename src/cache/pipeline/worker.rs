// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The worker loop shared by all four stages.
//!
//! A worker owns one FIFO queue. It keeps up to `concurrency` items in flight
//! as tokio tasks, puts failed items back at the end of the queue after a
//! backoff (when the job allows it and attempts remain), and returns once its
//! queue is closed and every spawned task, including pending retries, has
//! finished.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::cache::events::{CacheEvent, EventBus, Stage};
use crate::cache::types::{AssetRecord, LoadedAsset};
use crate::error::{SyncError, SyncResult};

/// Anything a stage queue can carry.
pub trait StageItem: Send + Sync + 'static {
    fn path(&self) -> &str;
}

impl StageItem for AssetRecord {
    fn path(&self) -> &str {
        &self.path
    }
}

impl StageItem for Arc<LoadedAsset> {
    fn path(&self) -> &str {
        &self.path
    }
}

/// The work one stage performs on a single item.
#[async_trait]
pub trait StageJob: Send + Sync + 'static {
    type Item: StageItem;

    async fn run(&self, item: &Self::Item) -> SyncResult<()>;

    /// Whether a failed item may go back into the queue.
    fn should_retry(&self, _err: &SyncError) -> bool {
        false
    }
}

/// How often and how patiently a stage retries an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures:
    /// `base * 2^(failed_attempts - 1)`, capped at `max_delay`, plus up to
    /// 25% jitter.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay);
        let jitter_cap = (delay.as_millis() / 4) as u64;
        if jitter_cap == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub stage: Stage,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn new(stage: Stage, concurrency: usize) -> Self {
        Self {
            stage,
            concurrency,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// An asset a stage gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetFailure {
    pub stage: Stage,
    pub path: String,
    pub attempts: u32,
    pub reason: String,
}

/// What one worker did before it stopped.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    /// Paths the stage completed, in completion order
    pub completed: Vec<String>,
    pub failures: Vec<AssetFailure>,
    /// The worker loop itself died; the lists above are incomplete
    pub aborted: bool,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            completed: Vec::new(),
            failures: Vec::new(),
            aborted: false,
        }
    }
}

struct Attempt<T> {
    item: T,
    number: u32,
}

/// Drain `queue` through `job` until the queue is closed and all work is done.
pub async fn run_stage<J: StageJob>(
    job: Arc<J>,
    mut queue: mpsc::UnboundedReceiver<J::Item>,
    settings: WorkerSettings,
    events: EventBus,
) -> StageReport {
    let stage = settings.stage;
    let cap = settings.concurrency.max(1);
    let mut report = StageReport::new(stage);

    let mut pending: VecDeque<Attempt<J::Item>> = VecDeque::new();
    let mut in_flight: JoinSet<(Attempt<J::Item>, SyncResult<()>)> = JoinSet::new();
    let mut delayed: JoinSet<Attempt<J::Item>> = JoinSet::new();
    let mut running: HashSet<String> = HashSet::new();
    let mut open = true;

    tracing::debug!(stage = %stage, concurrency = cap, "Worker started");

    loop {
        while in_flight.len() < cap {
            let Some(attempt) = pending.pop_front() else {
                break;
            };
            let path = attempt.item.path().to_string();
            events.emit(CacheEvent::Started { stage, path: path.clone() });
            running.insert(path);

            let job = Arc::clone(&job);
            in_flight.spawn(async move {
                let result = job.run(&attempt.item).await;
                (attempt, result)
            });
        }

        if !open && pending.is_empty() && in_flight.is_empty() && delayed.is_empty() {
            break;
        }

        tokio::select! {
            received = queue.recv(), if open => {
                match received {
                    Some(item) => pending.push_back(Attempt { item, number: 1 }),
                    None => open = false,
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok((attempt, result)) => {
                        running.remove(attempt.item.path());
                        match result {
                            Ok(()) => {
                                let path = attempt.item.path().to_string();
                                tracing::debug!(stage = %stage, path = %path, "Stage finished");
                                events.emit(CacheEvent::Finished { stage, path: path.clone() });
                                report.completed.push(path);
                            }
                            Err(err) => {
                                let path = attempt.item.path().to_string();
                                if job.should_retry(&err) && attempt.number < settings.retry.max_attempts {
                                    let delay = settings.retry.backoff(attempt.number);
                                    tracing::warn!(
                                        stage = %stage,
                                        path = %path,
                                        attempt = attempt.number,
                                        delay_ms = delay.as_millis() as u64,
                                        "Stage failed, requeueing: {}",
                                        err
                                    );
                                    events.emit(CacheEvent::Retrying {
                                        stage,
                                        path,
                                        attempt: attempt.number,
                                        delay_ms: delay.as_millis() as u64,
                                    });
                                    let next = Attempt { item: attempt.item, number: attempt.number + 1 };
                                    delayed.spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        next
                                    });
                                } else {
                                    tracing::warn!(
                                        stage = %stage,
                                        path = %path,
                                        attempts = attempt.number,
                                        "Stage gave up: {}",
                                        err
                                    );
                                    let failure = AssetFailure {
                                        stage,
                                        path,
                                        attempts: attempt.number,
                                        reason: err.to_string(),
                                    };
                                    events.emit(CacheEvent::Failed {
                                        stage,
                                        path: failure.path.clone(),
                                        attempts: failure.attempts,
                                        reason: failure.reason.clone(),
                                    });
                                    report.failures.push(failure);
                                }
                            }
                        }
                    }
                    Err(e) => tracing::error!(stage = %stage, "Stage task panicked: {}", e),
                }
            }
            Some(joined) = delayed.join_next(), if !delayed.is_empty() => {
                match joined {
                    Ok(attempt) => pending.push_back(attempt),
                    Err(e) => tracing::error!(stage = %stage, "Retry timer failed: {}", e),
                }
            }
        }
    }

    // Tasks that panicked never reported back.
    for path in running {
        events.emit(CacheEvent::Failed {
            stage,
            path: path.clone(),
            attempts: 0,
            reason: "task panicked".into(),
        });
        report.failures.push(AssetFailure {
            stage,
            path,
            attempts: 0,
            reason: "task panicked".into(),
        });
    }

    tracing::debug!(
        stage = %stage,
        completed = report.completed.len(),
        failed = report.failures.len(),
        "Worker stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails each path a scripted number of times, tracks peak concurrency.
    struct ScriptedJob {
        failures_left: Mutex<HashMap<String, u32>>,
        permanent: bool,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedJob {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures_left: Mutex::new(
                    failures.iter().map(|(p, n)| (p.to_string(), *n)).collect(),
                ),
                permanent: false,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StageJob for ScriptedJob {
        type Item = AssetRecord;

        async fn run(&self, item: &AssetRecord) -> SyncResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut left = self.failures_left.lock().unwrap();
            match left.get_mut(&item.path) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(SyncError::Transport {
                        url: item.path.clone(),
                        message: "flaky".into(),
                        timeout: false,
                    })
                }
                _ => Ok(()),
            }
        }

        fn should_retry(&self, _err: &SyncError) -> bool {
            !self.permanent
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    async fn run_with(
        job: Arc<ScriptedJob>,
        paths: &[&str],
        settings: WorkerSettings,
    ) -> (StageReport, Vec<CacheEvent>) {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (tx, queue) = mpsc::unbounded_channel();
        for path in paths {
            tx.send(AssetRecord::new(*path, *path, "h")).unwrap();
        }
        drop(tx);

        let report = run_stage(job, queue, settings, events).await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        (report, seen)
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let job = Arc::new(ScriptedJob::new(&[]));
        let paths = ["a", "b", "c", "d", "e", "f"];
        let settings = WorkerSettings::new(Stage::Load, 2);

        let (report, _) = run_with(Arc::clone(&job), &paths, settings).await;
        assert_eq!(report.completed.len(), 6);
        assert!(report.failures.is_empty());
        assert!(job.peak.load(Ordering::SeqCst) <= 2);
        assert!(job.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_single_slot_runs_sequentially() {
        let job = Arc::new(ScriptedJob::new(&[]));
        let settings = WorkerSettings::new(Stage::Download, 1);
        let (report, _) = run_with(Arc::clone(&job), &["a", "b", "c"], settings).await;
        assert_eq!(report.completed, vec!["a", "b", "c"]);
        assert_eq!(job.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flaky_item_is_requeued_until_success() {
        let job = Arc::new(ScriptedJob::new(&[("b", 2)]));
        let settings = WorkerSettings::new(Stage::Download, 1).with_retry(fast_retry(5));

        let (report, events) = run_with(Arc::clone(&job), &["a", "b", "c"], settings).await;
        assert!(report.failures.is_empty());
        assert_eq!(report.completed.len(), 3);
        // requeued at the back: "b" finishes last
        assert_eq!(report.completed.last().map(String::as_str), Some("b"));
        assert_eq!(job.calls.load(Ordering::SeqCst), 5);

        let retries = events
            .iter()
            .filter(|e| matches!(e, CacheEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_attempt_cap_gives_up() {
        let job = Arc::new(ScriptedJob::new(&[("bad", u32::MAX)]));
        let settings = WorkerSettings::new(Stage::Download, 1).with_retry(fast_retry(3));

        let (report, events) = run_with(Arc::clone(&job), &["ok", "bad"], settings).await;
        assert_eq!(report.completed, vec!["ok"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "bad");
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(job.calls.load(Ordering::SeqCst), 4);
        assert!(events.iter().any(|e| matches!(
            e,
            CacheEvent::Failed { path, attempts: 3, .. } if path == "bad"
        )));
    }

    #[tokio::test]
    async fn test_no_retry_when_job_refuses() {
        let mut job = ScriptedJob::new(&[("bad", 1)]);
        job.permanent = true;
        let job = Arc::new(job);
        let settings = WorkerSettings::new(Stage::Download, 1).with_retry(fast_retry(5));

        let (report, _) = run_with(Arc::clone(&job), &["bad"], settings).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 1);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_closed_queue_stops_immediately() {
        let job = Arc::new(ScriptedJob::new(&[]));
        let (report, events) = run_with(job, &[], WorkerSettings::new(Stage::Delete, 1)).await;
        assert!(report.completed.is_empty());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let job = Arc::new(ScriptedJob::new(&[]));
        let (_, events) = run_with(job, &["x"], WorkerSettings::new(Stage::Write, 1)).await;
        assert_eq!(
            events,
            vec![
                CacheEvent::Started { stage: Stage::Write, path: "x".into() },
                CacheEvent::Finished { stage: Stage::Write, path: "x".into() },
            ]
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let late = policy.backoff(30);
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1250));
        assert_eq!(RetryPolicy::none().backoff(1), Duration::ZERO);
    }
}
