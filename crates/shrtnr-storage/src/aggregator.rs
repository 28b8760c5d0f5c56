//! Batches soft-delete requests and writes them in one statement per owner.
//!
//! A single background task owns the pending batch and is the only writer of
//! delete flags. Callers talk to it through one bounded channel carrying two
//! kinds of message: enqueue a delete, and flush now.

use crate::config::{AggregatorConfig, FlushPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use shrtnr_core::{Result, ShortCode, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

/// Where flushed deletes are written.
#[async_trait]
pub trait DeleteSink: Send + Sync + 'static {
    /// Soft-deletes `codes` owned by `owner`, returning the number of rows changed.
    async fn soft_delete(&self, owner: &str, codes: &[ShortCode]) -> Result<u64>;
}

/// Summary of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Owners that had pending codes.
    pub owners: usize,
    /// Distinct codes handed to the sink.
    pub codes: usize,
    /// Rows the sink reported as changed.
    pub rows_affected: u64,
    /// Owners whose write failed; their codes were dropped.
    pub failed_owners: usize,
}

enum Command {
    Enqueue {
        owner: String,
        codes: Vec<ShortCode>,
    },
    Flush {
        done: Option<oneshot::Sender<FlushReport>>,
        /// Stop the worker once this flush completes.
        stop: bool,
    },
}

/// Handle to the background delete aggregator.
pub struct DeleteAggregator {
    tx: mpsc::Sender<Command>,
    policy: FlushPolicy,
    debounce: std::time::Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    flush_cycles: Arc<AtomicU64>,
}

impl DeleteAggregator {
    /// Starts the worker task on the current tokio runtime.
    pub fn spawn<S: DeleteSink>(sink: S, config: AggregatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let flush_cycles = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            sink,
            rx,
            pending: HashMap::new(),
            policy: config.policy,
            debounce: config.debounce,
            max_delay: config.max_delay,
            deadline: None,
            first_pending_at: None,
            flush_cycles: Arc::clone(&flush_cycles),
        };
        let task = tokio::spawn(worker.run());

        debug!(
            policy = ?config.policy,
            debounce_ms = config.debounce.as_millis() as u64,
            "delete aggregator started"
        );

        Self {
            tx,
            policy: config.policy,
            debounce: config.debounce,
            task: Mutex::new(Some(task)),
            #[cfg(test)]
            flush_cycles,
        }
    }

    /// Hands a delete request to the worker.
    ///
    /// Waits only while the channel is full. Returns `Unavailable` once the
    /// aggregator has been shut down.
    pub async fn enqueue(&self, owner: &str, codes: Vec<ShortCode>) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }

        self.tx
            .send(Command::Enqueue {
                owner: owner.to_owned(),
                codes,
            })
            .await
            .map_err(|_| closed())?;

        if self.policy == FlushPolicy::PerRequest {
            let tx = self.tx.clone();
            let debounce = self.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                // The worker may be gone by now; nothing is pending then.
                let _ = tx
                    .send(Command::Flush {
                        done: None,
                        stop: false,
                    })
                    .await;
            });
        }

        Ok(())
    }

    /// Flushes the pending batch immediately and waits for it to be written.
    pub async fn flush(&self) -> Result<FlushReport> {
        let (done, report) = oneshot::channel();
        self.tx
            .send(Command::Flush {
                done: Some(done),
                stop: false,
            })
            .await
            .map_err(|_| closed())?;
        report.await.map_err(|_| closed())
    }

    /// Number of flush cycles the worker has run so far, empty ones included.
    #[cfg(test)]
    pub(crate) fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::SeqCst)
    }

    /// Runs a final flush, waits for it and stops the worker. Idempotent.
    ///
    /// Requests accepted before the worker sees the stop message are part of
    /// the final flush; later ones fail with `Unavailable`.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };

        let (done, report) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Flush {
                done: Some(done),
                stop: true,
            })
            .await;
        if sent.is_ok() {
            if let Ok(report) = report.await {
                info!(
                    owners = report.owners,
                    codes = report.codes,
                    "delete aggregator drained"
                );
            }
        }

        task.await.map_err(|e| {
            StorageError::Operation(format!("delete aggregator task failed: {e}"))
        })
    }
}

fn closed() -> StorageError {
    StorageError::Unavailable("delete aggregator is shut down".to_string())
}

enum Event {
    Command(Option<Command>),
    Deadline,
}

struct Worker<S> {
    sink: S,
    rx: mpsc::Receiver<Command>,
    pending: HashMap<String, HashSet<ShortCode>>,
    policy: FlushPolicy,
    debounce: std::time::Duration,
    max_delay: std::time::Duration,
    deadline: Option<Instant>,
    first_pending_at: Option<Instant>,
    flush_cycles: Arc<AtomicU64>,
}

impl<S: DeleteSink> Worker<S> {
    async fn run(mut self) {
        loop {
            let event = match self.deadline {
                Some(deadline) => tokio::select! {
                    command = self.rx.recv() => Event::Command(command),
                    _ = tokio::time::sleep_until(deadline) => Event::Deadline,
                },
                None => Event::Command(self.rx.recv().await),
            };

            match event {
                Event::Deadline => {
                    self.flush().await;
                }
                Event::Command(Some(Command::Enqueue { owner, codes })) => {
                    self.accumulate(owner, codes);
                }
                Event::Command(Some(Command::Flush { done, stop: false })) => {
                    let report = self.flush().await;
                    if let Some(done) = done {
                        let _ = done.send(report);
                    }
                }
                Event::Command(Some(Command::Flush { done, stop: true })) => {
                    self.drain(done).await;
                    break;
                }
                Event::Command(None) => {
                    // Every handle is gone; write what is left and stop.
                    self.flush().await;
                    break;
                }
            }
        }

        debug!("delete aggregator stopped");
    }

    /// Closes the channel, folds every request still buffered in it into the
    /// batch and writes the batch once.
    async fn drain(&mut self, done: Option<oneshot::Sender<FlushReport>>) {
        self.rx.close();

        let mut waiters: Vec<_> = done.into_iter().collect();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Enqueue { owner, codes } => self.accumulate(owner, codes),
                Command::Flush { done, .. } => waiters.extend(done),
            }
        }

        let report = self.flush().await;
        for done in waiters {
            let _ = done.send(report);
        }
    }

    fn accumulate(&mut self, owner: String, codes: Vec<ShortCode>) {
        trace!(owner = %owner, count = codes.len(), "delete request queued");
        self.pending.entry(owner).or_default().extend(codes);

        if self.policy == FlushPolicy::Coalesced {
            let now = Instant::now();
            let first = *self.first_pending_at.get_or_insert(now);
            self.deadline = Some((now + self.debounce).min(first + self.max_delay));
        }
    }

    /// Writes one statement per pending owner and clears the batch, whatever
    /// the outcome of each write.
    async fn flush(&mut self) -> FlushReport {
        self.deadline = None;
        self.first_pending_at = None;
        let cycle = self.flush_cycles.fetch_add(1, Ordering::SeqCst) + 1;

        let batch = std::mem::take(&mut self.pending);
        let mut report = FlushReport {
            owners: batch.len(),
            ..FlushReport::default()
        };

        for (owner, codes) in batch {
            let codes: Vec<ShortCode> = codes.into_iter().collect();
            report.codes += codes.len();

            match self.sink.soft_delete(&owner, &codes).await {
                Ok(rows) => {
                    report.rows_affected += rows;
                    debug!(owner = %owner, requested = codes.len(), rows, "flushed deletes");
                }
                Err(e) => {
                    report.failed_owners += 1;
                    error!(
                        owner = %owner,
                        count = codes.len(),
                        error = %e,
                        "failed to flush deletes; dropping them"
                    );
                }
            }
        }

        trace!(cycle, owners = report.owners, codes = report.codes, "delete flush finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<(String, HashSet<ShortCode>)>>>;

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Calls,
        failing_owner: Option<String>,
    }

    impl RecordingSink {
        fn failing_for(owner: &str) -> Self {
            Self {
                failing_owner: Some(owner.to_string()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, HashSet<ShortCode>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DeleteSink for RecordingSink {
        async fn soft_delete(&self, owner: &str, codes: &[ShortCode]) -> Result<u64> {
            self.calls
                .lock()
                .push((owner.to_string(), codes.iter().cloned().collect()));
            if self.failing_owner.as_deref() == Some(owner) {
                return Err(StorageError::Unavailable("connection reset".into()));
            }
            Ok(codes.len() as u64)
        }
    }

    fn codes(values: &[&str]) -> Vec<ShortCode> {
        values.iter().map(|v| ShortCode::new_unchecked(*v)).collect()
    }

    fn set(values: &[&str]) -> HashSet<ShortCode> {
        codes(values).into_iter().collect()
    }

    fn config(policy: FlushPolicy) -> AggregatorConfig {
        AggregatorConfig::builder()
            .policy(policy)
            .debounce(Duration::from_millis(500))
            .max_delay(Duration::from_millis(2000))
            .build()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn merges_requests_into_one_write_per_owner() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("u1", codes(&["a", "b"])).await.unwrap();
        aggregator.enqueue("u1", codes(&["b", "c"])).await.unwrap();
        aggregator.enqueue("u2", codes(&["d"])).await.unwrap();

        let report = aggregator.flush().await.unwrap();
        assert_eq!(report.owners, 2);
        assert_eq!(report.codes, 4);
        assert_eq!(report.failed_owners, 0);

        let mut calls = sink.calls();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            calls,
            vec![
                ("u1".to_string(), set(&["a", "b", "c"])),
                ("u2".to_string(), set(&["d"])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_written_before_the_debounce_elapses() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("u1", codes(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;
        assert!(sink.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(sink.calls(), vec![("u1".to_string(), set(&["a"]))]);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_policy_pushes_the_deadline_back() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("u1", codes(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        aggregator.enqueue("u1", codes(&["b"])).await.unwrap();

        // 600ms after the first request: the reset deadline (800ms) is still ahead.
        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        assert!(sink.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(sink.calls(), vec![("u1".to_string(), set(&["a", "b"]))]);
        assert_eq!(aggregator.flush_cycles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_policy_caps_the_delay() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        // A request every 400ms keeps resetting the 500ms debounce.
        for i in 0..6 {
            aggregator
                .enqueue("u1", vec![ShortCode::new_unchecked(format!("c{i}"))])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        settle().await;

        // The 2000ms cap forced a flush while requests were still arriving.
        assert!(!sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_policy_flushes_once_per_call() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::PerRequest));

        aggregator.enqueue("u1", codes(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        aggregator.enqueue("u1", codes(&["b"])).await.unwrap();

        // First timer fires at 500ms and writes both codes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(sink.calls(), vec![("u1".to_string(), set(&["a", "b"]))]);

        // Second timer fires at 800ms and finds nothing to write.
        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(sink.calls().len(), 1);
        assert_eq!(aggregator.flush_cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_owner_does_not_block_others_and_is_not_retried() {
        let sink = RecordingSink::failing_for("bad");
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("bad", codes(&["a"])).await.unwrap();
        aggregator.enqueue("good", codes(&["b"])).await.unwrap();

        let report = aggregator.flush().await.unwrap();
        assert_eq!(report.owners, 2);
        assert_eq!(report.failed_owners, 1);
        assert_eq!(report.rows_affected, 1);

        let report = aggregator.flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert_eq!(sink.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_pending_deletes() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("u1", codes(&["a", "b"])).await.unwrap();
        aggregator.shutdown().await.unwrap();

        assert_eq!(sink.calls(), vec![("u1".to_string(), set(&["a", "b"]))]);

        let err = aggregator.enqueue("u1", codes(&["c"])).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));

        // A second shutdown is a no-op.
        aggregator.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_racing_shutdown_is_written_or_rejected() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        aggregator.enqueue("u1", codes(&["early"])).await.unwrap();
        let (stopped, late) = tokio::join!(
            aggregator.shutdown(),
            aggregator.enqueue("u1", codes(&["late"]))
        );
        stopped.unwrap();

        let written: HashSet<ShortCode> = sink
            .calls()
            .into_iter()
            .flat_map(|(_, codes)| codes)
            .collect();
        assert!(written.contains(&ShortCode::new_unchecked("early")));
        match late {
            Ok(()) => assert!(written.contains(&ShortCode::new_unchecked("late"))),
            Err(e) => assert!(matches!(e, StorageError::Unavailable(_))),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_queued_behind_shutdown_are_drained() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::Coalesced));

        // Both messages sit in the channel before the worker runs: the stop
        // first, the delete right behind it.
        let (stopped, late) = tokio::join!(
            aggregator.shutdown(),
            aggregator.enqueue("u1", codes(&["late"]))
        );
        stopped.unwrap();
        late.unwrap();

        assert_eq!(sink.calls(), vec![("u1".to_string(), set(&["late"]))]);
        assert!(aggregator.enqueue("u1", codes(&["after"])).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_requests_are_ignored() {
        let sink = RecordingSink::default();
        let aggregator = DeleteAggregator::spawn(sink.clone(), config(FlushPolicy::PerRequest));

        aggregator.enqueue("u1", Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(aggregator.flush_cycles(), 0);
        assert!(sink.calls().is_empty());
    }
}
