use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::adapter::{FfmpegEngine, MediaEngine, RunRequest, RunSummary};
use crate::config::BatchConfig;
use crate::engine::CANCEL_MARKER;
use crate::job::{
    BatchAggregate, JobDescriptor, JobId, JobKind, JobOutcome, JobRecord, JobStatus,
    ProgressSample,
};
use crate::probe::{MediaMetadata, ProbeError};
use crate::validate;

const COMMAND_BUFFER: usize = 64;

/// Everything subscribers can observe about the queue
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    /// A job changed status; `error` is set for failures
    JobStatus {
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    },
    /// Progress sample for the currently running job, forwarded verbatim
    JobProgress { id: JobId, sample: ProgressSample },
    /// A job finished with an outcome (completed or failed; cancellations
    /// surface as status changes only)
    JobCompleted { id: JobId, outcome: JobOutcome },
    /// Whole-queue view, recomputed on every transition and sample
    BatchProgress { aggregate: BatchAggregate },
    /// The batch run has stopped dispatching
    RunFinished { aggregate: BatchAggregate },
}

/// What happened to each descriptor handed to `enqueue`
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueReport {
    pub accepted: Vec<JobId>,
    /// Input paths silently dropped because a non-terminal job already has them
    pub duplicates: Vec<PathBuf>,
    /// Descriptors that failed validation, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

enum Command {
    Enqueue {
        descriptors: Vec<JobDescriptor>,
        reply: oneshot::Sender<EnqueueReport>,
    },
    Start {
        kind_defaults: Option<JobKind>,
        reply: oneshot::Sender<Result<usize, String>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Remove {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Clear {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<JobRecord>>,
    },
    Aggregate {
        reply: oneshot::Sender<BatchAggregate>,
    },
    // Internal messages from probe and episode tasks
    ProbeDone {
        id: JobId,
        result: Result<MediaMetadata, ProbeError>,
    },
    Progress {
        id: JobId,
        sample: ProgressSample,
    },
    EpisodeFinished {
        id: JobId,
        result: Result<RunSummary>,
    },
}

/// Single-flight batch queue.
///
/// All state lives in one control task; commands go in through a channel and
/// observations come out as [`QueueEvent`]s. Probing runs concurrently with
/// an active episode, execution itself is strictly FIFO with at most one job
/// running.
pub struct Orchestrator {
    engine: Arc<dyn MediaEngine>,
    records: Vec<JobRecord>,
    commands: mpsc::Receiver<Command>,
    /// Weak so the control loop can end once every handle is gone
    internal_tx: mpsc::WeakSender<Command>,
    events: broadcast::Sender<QueueEvent>,
    run_active: bool,
    active_id: Option<JobId>,
    cancel_requested: bool,
    cancel_token: CancellationToken,
}

impl Orchestrator {
    /// Spawn the queue with the production ffmpeg engine
    pub fn spawn(config: BatchConfig) -> QueueHandle {
        let engine = Arc::new(FfmpegEngine::new(config.clone()));
        Self::spawn_with_engine(config, engine)
    }

    /// Spawn the queue with any engine implementation; tests inject scripted
    /// ones here
    pub fn spawn_with_engine(config: BatchConfig, engine: Arc<dyn MediaEngine>) -> QueueHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(16));

        let orchestrator = Orchestrator {
            engine,
            records: Vec::new(),
            commands: command_rx,
            internal_tx: command_tx.downgrade(),
            events: event_tx.clone(),
            run_active: false,
            active_id: None,
            cancel_requested: false,
            cancel_token: CancellationToken::new(),
        };
        tokio::spawn(orchestrator.run());

        QueueHandle {
            commands: command_tx,
            events: event_tx,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!("queue control loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { descriptors, reply } => {
                let report = self.handle_enqueue(descriptors);
                let _ = reply.send(report);
            }
            Command::Start { kind_defaults, reply } => {
                let _ = reply.send(self.handle_start(kind_defaults));
            }
            Command::Cancel { reply } => {
                self.handle_cancel();
                let _ = reply.send(());
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.handle_remove(id));
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.handle_clear());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.records.clone());
            }
            Command::Aggregate { reply } => {
                let _ = reply.send(BatchAggregate::from_records(&self.records));
            }
            Command::ProbeDone { id, result } => self.handle_probe_done(id, result),
            Command::Progress { id, sample } => self.handle_progress(id, sample),
            Command::EpisodeFinished { id, result } => self.handle_episode_finished(id, result),
        }
    }

    fn handle_enqueue(&mut self, descriptors: Vec<JobDescriptor>) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        for descriptor in descriptors {
            let already_queued = self
                .records
                .iter()
                .any(|r| !r.status.is_terminal() && r.descriptor.input == descriptor.input);
            if already_queued {
                debug!("duplicate enqueue ignored: {}", descriptor.input.display());
                report.duplicates.push(descriptor.input);
                continue;
            }
            if let Err(err) = descriptor.validate() {
                warn!("rejected {}: {}", descriptor.input.display(), err);
                report.rejected.push((descriptor.input.clone(), err.to_string()));
                continue;
            }

            let id = descriptor.id;
            let record = JobRecord::new(descriptor);
            info!("queued {} ({})", record.display_name(), record.descriptor.kind.label());
            self.records.push(record);
            report.accepted.push(id);
            self.begin_probe(id);
        }
        report
    }

    fn begin_probe(&mut self, id: JobId) {
        self.transition(id, JobStatus::Probing, None);
        let Some(input) = self
            .records
            .iter()
            .find(|r| r.id() == id)
            .map(|r| r.descriptor.input.clone())
        else {
            return;
        };
        let Some(tx) = self.internal_tx.upgrade() else { return };
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = engine.probe(&input).await;
            let _ = tx.send(Command::ProbeDone { id, result }).await;
        });
    }

    fn handle_probe_done(&mut self, id: JobId, result: Result<MediaMetadata, ProbeError>) {
        let Some(idx) = self.records.iter().position(|r| r.id() == id) else {
            return;
        };
        // The job may have been cancelled or removed while the probe ran
        if self.records[idx].status != JobStatus::Probing {
            return;
        }

        match result {
            Ok(metadata) => {
                debug!(
                    "probed {}: {:.2}s at {:.3} fps",
                    self.records[idx].display_name(),
                    metadata.duration,
                    metadata.fps
                );
                self.records[idx].metadata = Some(metadata);
                self.transition(id, JobStatus::Ready, None);
            }
            Err(err) => {
                warn!("probe failed for {}: {}", self.records[idx].display_name(), err);
                self.transition(id, JobStatus::Failed, Some(err.to_string()));
            }
        }

        // A probe resolving mid-run may unblock the dispatcher
        if self.run_active && self.active_id.is_none() {
            self.dispatch_next();
        }
    }

    fn handle_start(&mut self, kind_defaults: Option<JobKind>) -> Result<usize, String> {
        if self.run_active {
            return Err("a batch run is already in progress".to_string());
        }

        // Batch-level parameters replace each ready job's kind; the output
        // path follows automatically since it derives from the kind
        if let Some(defaults) = &kind_defaults {
            for record in self.records.iter_mut().filter(|r| r.status == JobStatus::Ready) {
                record.descriptor.kind = defaults.clone();
            }
            let invalid: Vec<(JobId, String)> = self
                .records
                .iter()
                .filter(|r| r.status == JobStatus::Ready)
                .filter_map(|r| r.descriptor.validate().err().map(|e| (r.id(), e.to_string())))
                .collect();
            for (id, err) in invalid {
                self.transition(id, JobStatus::Failed, Some(err));
            }
        }

        let ready = self.records.iter().filter(|r| r.status == JobStatus::Ready).count();
        if ready == 0 {
            return Err("no jobs are ready to run".to_string());
        }

        info!("🎬 starting batch run: {} ready of {} queued", ready, self.records.len());
        self.cancel_requested = false;
        self.cancel_token = CancellationToken::new();
        self.run_active = true;
        self.dispatch_next();
        Ok(ready)
    }

    fn dispatch_next(&mut self) {
        if !self.run_active || self.active_id.is_some() {
            return;
        }
        if self.cancel_requested {
            self.cancel_waiting();
            self.finish_run();
            return;
        }

        let Some(idx) = self.records.iter().position(|r| r.status == JobStatus::Ready) else {
            let probe_outstanding = self
                .records
                .iter()
                .any(|r| matches!(r.status, JobStatus::Pending | JobStatus::Probing));
            if !probe_outstanding {
                self.finish_run();
            }
            return;
        };

        let id = self.records[idx].id();
        let descriptor = self.records[idx].descriptor.clone();
        let Some(metadata) = self.records[idx].metadata.clone() else {
            self.transition(id, JobStatus::Failed, Some("ready job has no metadata".to_string()));
            self.dispatch_next();
            return;
        };

        self.active_id = Some(id);
        self.transition(id, JobStatus::Running, None);
        info!(
            "running {} -> {}",
            descriptor.input.display(),
            descriptor.output_path().display()
        );

        let Some(tx) = self.internal_tx.upgrade() else { return };
        let engine = self.engine.clone();
        let (progress_tx, mut progress_rx) = watch::channel(ProgressSample::default());
        let request = RunRequest {
            descriptor,
            metadata,
            progress: progress_tx,
            cancel: self.cancel_token.child_token(),
        };

        let forward_tx = tx.clone();
        tokio::spawn(async move {
            let forwarder = tokio::spawn(async move {
                // A lagging forwarder skips straight to the newest sample
                while progress_rx.changed().await.is_ok() {
                    let sample = progress_rx.borrow_and_update().clone();
                    if forward_tx.send(Command::Progress { id, sample }).await.is_err() {
                        break;
                    }
                }
            });
            let result = engine.run(request).await;
            // The last published sample is observed before the episode result
            // goes out, so subscribers never see progress after completion
            let _ = forwarder.await;
            let _ = tx.send(Command::EpisodeFinished { id, result }).await;
        });
    }

    fn handle_progress(&mut self, id: JobId, sample: ProgressSample) {
        // Only the running job reports progress; stragglers are dropped
        if self.active_id != Some(id) {
            return;
        }
        if let Some(record) = self.records.iter_mut().find(|r| r.id() == id) {
            record.progress = Some(sample.clone());
        }
        let _ = self.events.send(QueueEvent::JobProgress { id, sample });
        self.emit_aggregate();
    }

    fn handle_episode_finished(&mut self, id: JobId, result: Result<RunSummary>) {
        if self.active_id == Some(id) {
            self.active_id = None;
        }

        let Some(idx) = self.records.iter().position(|r| r.id() == id) else {
            self.dispatch_next();
            return;
        };

        match result {
            Ok(summary) => {
                let kind = self.records[idx].descriptor.kind.clone();
                let check = validate::check_for_kind(&kind, summary.input_duration, summary.output_duration);
                if !check.is_valid {
                    warn!("⚠️ {}: {}", self.records[idx].display_name(), check.message);
                }
                let outcome = JobOutcome {
                    success: true,
                    output_path: summary.output_path,
                    input_duration_seconds: summary.input_duration,
                    output_duration_seconds: summary.output_duration,
                    duration_delta_seconds: check.delta,
                    duration_valid: check.is_valid,
                    message: check.message,
                };
                self.records[idx].outcome = Some(outcome.clone());
                info!("✅ completed {}", self.records[idx].display_name());
                self.transition(id, JobStatus::Completed, None);
                let _ = self.events.send(QueueEvent::JobCompleted { id, outcome });
            }
            Err(err) => {
                let text = format!("{:#}", err);
                if text.contains(CANCEL_MARKER) {
                    info!("cancelled {}", self.records[idx].display_name());
                    self.transition(id, JobStatus::Cancelled, None);
                } else {
                    warn!("❌ failed {}: {}", self.records[idx].display_name(), text);
                    let outcome = JobOutcome {
                        success: false,
                        output_path: self.records[idx].descriptor.output_path(),
                        input_duration_seconds: self.records[idx]
                            .metadata
                            .as_ref()
                            .map(|m| m.duration)
                            .unwrap_or(0.0),
                        output_duration_seconds: 0.0,
                        duration_delta_seconds: 0.0,
                        duration_valid: false,
                        message: text.clone(),
                    };
                    self.records[idx].outcome = Some(outcome.clone());
                    self.transition(id, JobStatus::Failed, Some(text));
                    let _ = self.events.send(QueueEvent::JobCompleted { id, outcome });
                }
            }
        }

        if self.cancel_requested {
            self.cancel_waiting();
            self.finish_run();
        } else {
            self.dispatch_next();
        }
    }

    fn handle_cancel(&mut self) {
        info!("⚠️ cancellation requested");
        self.cancel_requested = true;
        self.cancel_token.cancel();
        // Jobs that never started go straight to cancelled; the running one
        // resolves through its episode teardown
        self.cancel_waiting();
        if self.run_active && self.active_id.is_none() {
            self.finish_run();
        }
    }

    fn cancel_waiting(&mut self) {
        let waiting: Vec<JobId> = self
            .records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    JobStatus::Pending | JobStatus::Probing | JobStatus::Ready
                )
            })
            .map(|r| r.id())
            .collect();
        for id in waiting {
            self.transition(id, JobStatus::Cancelled, None);
        }
    }

    fn handle_remove(&mut self, id: JobId) -> bool {
        let Some(idx) = self.records.iter().position(|r| r.id() == id) else {
            return false;
        };
        if self.records[idx].status == JobStatus::Running {
            debug!("refusing to remove the running job");
            return false;
        }
        let record = self.records.remove(idx);
        info!("removed {} from the queue", record.display_name());
        self.emit_aggregate();
        true
    }

    fn handle_clear(&mut self) -> bool {
        if self.records.iter().any(|r| r.status == JobStatus::Running) {
            debug!("refusing to clear while a job is running");
            return false;
        }
        self.records.clear();
        if self.run_active {
            self.finish_run();
        }
        self.emit_aggregate();
        true
    }

    fn finish_run(&mut self) {
        if !self.run_active {
            return;
        }
        self.run_active = false;
        let aggregate = BatchAggregate::from_records(&self.records);
        info!(
            "batch run finished: {} completed, {} failed, {} cancelled",
            aggregate.completed, aggregate.failed, aggregate.cancelled
        );
        let _ = self.events.send(QueueEvent::RunFinished { aggregate });
    }

    /// Apply a status change if the state machine allows it, stamping
    /// timestamps and notifying subscribers
    fn transition(&mut self, id: JobId, next: JobStatus, error: Option<String>) {
        let Some(record) = self.records.iter_mut().find(|r| r.id() == id) else {
            return;
        };
        if !record.status.can_transition_to(next) {
            warn!(
                "illegal transition {} -> {} for {}",
                record.status,
                next,
                record.display_name()
            );
            return;
        }

        record.status = next;
        if let Some(err) = &error {
            record.error = Some(err.clone());
        }
        match next {
            JobStatus::Running => record.started_at = Some(Utc::now()),
            s if s.is_terminal() => record.finished_at = Some(Utc::now()),
            _ => {}
        }

        let _ = self.events.send(QueueEvent::JobStatus { id, status: next, error });
        self.emit_aggregate();
    }

    fn emit_aggregate(&self) {
        let _ = self.events.send(QueueEvent::BatchProgress {
            aggregate: BatchAggregate::from_records(&self.records),
        });
    }
}

/// Clonable front door to the queue's control task
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueHandle {
    pub async fn enqueue(&self, descriptors: Vec<JobDescriptor>) -> Result<EnqueueReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Enqueue { descriptors, reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    /// Build one descriptor per path with a shared kind, then enqueue
    pub async fn enqueue_paths(
        &self,
        paths: impl IntoIterator<Item = PathBuf>,
        kind: &JobKind,
    ) -> Result<EnqueueReport> {
        let descriptors = paths
            .into_iter()
            .map(|p| JobDescriptor::new(p, kind.clone()))
            .collect();
        self.enqueue(descriptors).await
    }

    /// Begin FIFO execution over ready jobs. `kind_defaults` replaces every
    /// ready job's kind (batch-level parameters from the caller); None keeps
    /// each job's own kind. Returns how many jobs were ready at dispatch.
    pub async fn start(&self, kind_defaults: Option<JobKind>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { kind_defaults, reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await
            .map_err(|_| anyhow!("queue task dropped the reply"))?
            .map_err(|msg| anyhow!(msg))
    }

    /// Queue-wide cancellation: stops the active job and retires everything
    /// that has not started
    pub async fn cancel(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel { reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    /// Remove one job; returns false (and does nothing) for the running job
    /// or an unknown id
    pub async fn remove(&self, id: JobId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Remove { id, reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    /// Drop every job; returns false while any job is running
    pub async fn clear(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Clear { reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    /// Read-only snapshot of every job record
    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    pub async fn aggregate(&self) -> Result<BatchAggregate> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Aggregate { reply: tx })
            .await
            .map_err(|_| anyhow!("queue task has shut down"))?;
        rx.await.map_err(|_| anyhow!("queue task dropped the reply"))
    }

    /// Subscribe to queue events; dropping the stream unsubscribes
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.events.subscribe(),
        }
    }
}

/// Subscription handle over the queue's event channel
pub struct EventStream {
    rx: broadcast::Receiver<QueueEvent>,
}

impl EventStream {
    /// Next event, or None once the queue is gone. A consumer that falls
    /// behind skips over the gap instead of erroring out.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event consumer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EncodeOptions, InterpolationMethod, OutputFormat};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeEngine {
        delay: Duration,
        drift: f64,
        fail_probe_containing: Option<&'static str>,
        fail_run_containing: Option<&'static str>,
        samples: Vec<f64>,
        seen: Mutex<Vec<PathBuf>>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                delay: Duration::from_millis(20),
                drift: 0.0,
                fail_probe_containing: None,
                fail_run_containing: None,
                samples: Vec::new(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn ran(&self) -> Vec<PathBuf> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn probe(&self, path: &Path) -> Result<MediaMetadata, ProbeError> {
            if let Some(marker) = self.fail_probe_containing {
                if path.to_string_lossy().contains(marker) {
                    return Err(ProbeError::UnsupportedFormat(path.to_path_buf()));
                }
            }
            Ok(test_metadata())
        }

        async fn run(&self, request: RunRequest) -> Result<RunSummary> {
            self.seen.lock().unwrap().push(request.descriptor.input.clone());
            for pct in &self.samples {
                let sample = ProgressSample {
                    completion_percent: *pct,
                    ..ProgressSample::default()
                };
                let _ = request.progress.send(sample);
                // Paced so the forwarder observes every value, not just the
                // newest
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::select! {
                _ = request.cancel.cancelled() => bail!("conversion {}", CANCEL_MARKER),
                _ = tokio::time::sleep(self.delay) => {}
            }
            if let Some(marker) = self.fail_run_containing {
                if request.descriptor.input.to_string_lossy().contains(marker) {
                    bail!("engine crashed: exit status 137");
                }
            }
            Ok(RunSummary {
                output_path: request.descriptor.output_path(),
                input_duration: request.metadata.duration,
                output_duration: request.metadata.duration + self.drift,
            })
        }
    }

    fn test_metadata() -> MediaMetadata {
        MediaMetadata {
            duration: 10.0,
            fps: 30.0,
            width: 640,
            height: 360,
            codec: "h264".to_string(),
            bitrate: Some(1_000_000),
            file_size: 1024,
            sample_rate: Some(48_000),
            channels: Some(2),
            thumbnail: None,
        }
    }

    fn rate_kind(fps: f64) -> JobKind {
        JobKind::RateConvert {
            target_fps: fps,
            method: InterpolationMethod::Duplicate,
            encode: EncodeOptions::default(),
        }
    }

    fn rate_descriptor(path: &str) -> JobDescriptor {
        JobDescriptor::new(path, rate_kind(60.0))
    }

    async fn wait_until<F>(handle: &QueueHandle, mut predicate: F) -> Vec<JobRecord>
    where
        F: FnMut(&[JobRecord]) -> bool,
    {
        for _ in 0..500 {
            let jobs = handle.jobs().await.expect("queue alive");
            if predicate(&jobs) {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn all_terminal(jobs: &[JobRecord]) -> bool {
        !jobs.is_empty() && jobs.iter().all(|j| j.status.is_terminal())
    }

    async fn collect_until_finished(stream: &mut EventStream) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event channel closed");
            let done = matches!(event, QueueEvent::RunFinished { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_dedup_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        let report = handle
            .enqueue(vec![
                rate_descriptor("/media/a.mp4"),
                rate_descriptor("/media/b.mp4"),
                rate_descriptor("/media/a.mp4"),
            ])
            .await
            .expect("enqueue");
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.duplicates, vec![PathBuf::from("/media/a.mp4")]);

        let jobs = wait_until(&handle, |jobs| {
            jobs.iter().all(|j| j.status == JobStatus::Ready)
        })
        .await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.metadata.is_some()));

        // Re-enqueueing a queued path changes nothing
        let report = handle.enqueue(vec![rate_descriptor("/media/a.mp4")]).await.expect("enqueue");
        assert!(report.accepted.is_empty());
        assert_eq!(handle.jobs().await.expect("jobs").len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_descriptors() {
        let engine = Arc::new(FakeEngine::new());
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        let report = handle
            .enqueue(vec![JobDescriptor::new("/media/a.mp4", rate_kind(0.0))])
            .await
            .expect("enqueue");
        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].1.contains("out of range"));
        assert!(handle.jobs().await.expect("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_run_is_single_flight_with_terminal_transitions() {
        let engine = Arc::new(FakeEngine::new());
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine.clone());

        let inputs = ["/media/a.mp4", "/media/b.mp4", "/media/c.mp4", "/media/d.mp4"];
        handle
            .enqueue(inputs.iter().map(|p| rate_descriptor(p)).collect())
            .await
            .expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        let mut stream = handle.subscribe();
        let started = handle.start(None).await.expect("start");
        assert_eq!(started, 4);

        let events = collect_until_finished(&mut stream).await;

        let mut current: HashMap<JobId, JobStatus> = HashMap::new();
        let mut terminal_transitions = 0;
        for event in &events {
            if let QueueEvent::JobStatus { id, status, .. } = event {
                if *status == JobStatus::Running {
                    assert!(
                        !current.values().any(|s| *s == JobStatus::Running),
                        "two jobs running at once"
                    );
                }
                if status.is_terminal() {
                    terminal_transitions += 1;
                }
                current.insert(*id, *status);
            }
        }
        assert_eq!(terminal_transitions, 4);

        // FIFO order
        let ran = engine.ran();
        assert_eq!(ran, inputs.iter().map(PathBuf::from).collect::<Vec<_>>());

        let jobs = handle.jobs().await.expect("jobs");
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_probe_failure_never_runs() {
        let mut engine = FakeEngine::new();
        engine.fail_probe_containing = Some("bad");
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine.clone());

        handle
            .enqueue(vec![
                rate_descriptor("/media/ok1.mp4"),
                rate_descriptor("/media/bad-input.mp4"),
                rate_descriptor("/media/ok2.mp4"),
            ])
            .await
            .expect("enqueue");

        let jobs = wait_until(&handle, |jobs| {
            jobs.iter().all(|j| j.status == JobStatus::Ready || j.status == JobStatus::Failed)
        })
        .await;
        let bad = jobs.iter().find(|j| j.display_name() == "bad-input.mp4").expect("bad job");
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(bad.error.as_deref().unwrap_or("").contains("unsupported format"));

        let started = handle.start(None).await.expect("start");
        assert_eq!(started, 2);
        wait_until(&handle, all_terminal).await;

        let ran = engine.ran();
        assert_eq!(ran.len(), 2);
        assert!(!ran.contains(&PathBuf::from("/media/bad-input.mp4")));

        let jobs = handle.jobs().await.expect("jobs");
        let bad = jobs.iter().find(|j| j.display_name() == "bad-input.mp4").expect("bad job");
        assert_eq!(bad.status, JobStatus::Failed, "probe failure must stick");
    }

    #[tokio::test]
    async fn test_cancel_retires_the_tail() {
        let mut engine = FakeEngine::new();
        engine.delay = Duration::from_millis(300);
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine.clone());

        let inputs = ["/media/a.mp4", "/media/b.mp4", "/media/c.mp4", "/media/d.mp4"];
        handle
            .enqueue(inputs.iter().map(|p| rate_descriptor(p)).collect())
            .await
            .expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        handle.start(None).await.expect("start");
        wait_until(&handle, |jobs| jobs[0].status == JobStatus::Running).await;

        handle.cancel().await.expect("cancel");
        let jobs = wait_until(&handle, all_terminal).await;

        assert!(
            jobs.iter().all(|j| j.status == JobStatus::Cancelled),
            "whole batch should end cancelled: {:?}",
            jobs.iter().map(|j| j.status).collect::<Vec<_>>()
        );
        // Only the first job ever reached the engine
        assert_eq!(engine.ran(), vec![PathBuf::from("/media/a.mp4")]);
    }

    #[tokio::test]
    async fn test_remove_spares_the_running_job() {
        let mut engine = FakeEngine::new();
        engine.delay = Duration::from_millis(200);
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        let report = handle
            .enqueue(vec![rate_descriptor("/media/a.mp4"), rate_descriptor("/media/b.mp4")])
            .await
            .expect("enqueue");
        let (id_a, id_b) = (report.accepted[0], report.accepted[1]);
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        assert!(handle.remove(id_b).await.expect("remove"), "idle job should be removable");
        assert_eq!(handle.jobs().await.expect("jobs").len(), 1);

        handle.start(None).await.expect("start");
        wait_until(&handle, |jobs| jobs[0].status == JobStatus::Running).await;

        assert!(
            !handle.remove(id_a).await.expect("remove"),
            "removing the running job must be a no-op"
        );
        assert_eq!(handle.jobs().await.expect("jobs").len(), 1);

        wait_until(&handle, all_terminal).await;
    }

    #[tokio::test]
    async fn test_clear_rejected_while_running() {
        let mut engine = FakeEngine::new();
        engine.delay = Duration::from_millis(200);
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        handle.enqueue(vec![rate_descriptor("/media/a.mp4")]).await.expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;
        handle.start(None).await.expect("start");
        wait_until(&handle, |jobs| jobs[0].status == JobStatus::Running).await;

        assert!(!handle.clear().await.expect("clear"), "clear must be rejected mid-run");

        wait_until(&handle, all_terminal).await;
        assert!(handle.clear().await.expect("clear"), "clear should work when idle");
        assert!(handle.jobs().await.expect("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_advances_the_queue() {
        let mut engine = FakeEngine::new();
        engine.fail_run_containing = Some("crash");
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine.clone());

        handle
            .enqueue(vec![rate_descriptor("/media/crash.mp4"), rate_descriptor("/media/after.mp4")])
            .await
            .expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;
        handle.start(None).await.expect("start");
        let jobs = wait_until(&handle, all_terminal).await;

        let crashed = jobs.iter().find(|j| j.display_name() == "crash.mp4").expect("crash job");
        assert_eq!(crashed.status, JobStatus::Failed);
        assert!(!crashed.error.as_deref().unwrap_or("").is_empty(), "failure needs a message");

        let after = jobs.iter().find(|j| j.display_name() == "after.mp4").expect("after job");
        assert_eq!(after.status, JobStatus::Completed, "queue must advance past a failure");
        assert_eq!(engine.ran().len(), 2);
    }

    #[tokio::test]
    async fn test_duration_drift_warns_without_failing() {
        let mut engine = FakeEngine::new();
        engine.drift = 0.5;
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        handle
            .enqueue(vec![
                rate_descriptor("/media/rate.mp4"),
                JobDescriptor::new(
                    "/media/shrink.mp4",
                    JobKind::Compress {
                        target_size_mb: 25.0,
                        target_width: None,
                        target_height: None,
                        use_hw_accel: false,
                        container: OutputFormat::Mp4,
                    },
                ),
            ])
            .await
            .expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;
        handle.start(None).await.expect("start");
        let jobs = wait_until(&handle, all_terminal).await;

        let rate = jobs.iter().find(|j| j.display_name() == "rate.mp4").expect("rate job");
        assert_eq!(rate.status, JobStatus::Completed, "drift is a warning, not a failure");
        let outcome = rate.outcome.as_ref().expect("outcome");
        assert!(!outcome.duration_valid);
        assert!((outcome.duration_delta_seconds - 0.5).abs() < 1e-9);

        let shrink = jobs.iter().find(|j| j.display_name() == "shrink.mp4").expect("compress job");
        let outcome = shrink.outcome.as_ref().expect("outcome");
        assert!(outcome.duration_valid, "compression has no duration contract");
    }

    #[tokio::test]
    async fn test_nonmonotonic_progress_forwarded_unmodified() {
        let mut engine = FakeEngine::new();
        engine.samples = vec![40.0, 35.0, 50.0];
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        handle.enqueue(vec![rate_descriptor("/media/a.mp4")]).await.expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        let mut stream = handle.subscribe();
        handle.start(None).await.expect("start");
        let events = collect_until_finished(&mut stream).await;

        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::JobProgress { sample, .. } => Some(sample.completion_percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![40.0, 35.0, 50.0], "samples must pass through unclamped");
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let mut engine = FakeEngine::new();
        engine.delay = Duration::from_millis(150);
        let engine = Arc::new(engine);
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        // Nothing queued
        assert!(handle.start(None).await.is_err());

        handle.enqueue(vec![rate_descriptor("/media/a.mp4")]).await.expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        handle.start(None).await.expect("first start");
        let again = handle.start(None).await;
        assert!(again.is_err(), "second start during a run must be refused");
        assert!(format!("{:#}", again.unwrap_err()).contains("already in progress"));

        wait_until(&handle, all_terminal).await;
    }

    #[tokio::test]
    async fn test_kind_defaults_replace_ready_kinds() {
        let engine = Arc::new(FakeEngine::new());
        let handle = Orchestrator::spawn_with_engine(BatchConfig::default(), engine);

        handle.enqueue(vec![rate_descriptor("/media/a.mp4")]).await.expect("enqueue");
        wait_until(&handle, |jobs| jobs.iter().all(|j| j.status == JobStatus::Ready)).await;

        // Batch-level parameters override whatever was enqueued
        handle.start(Some(rate_kind(120.0))).await.expect("start");
        let jobs = wait_until(&handle, all_terminal).await;

        let outcome = jobs[0].outcome.as_ref().expect("outcome");
        assert!(
            outcome.output_path.to_string_lossy().ends_with("a_120fps.mp4"),
            "output path must be recomputed from the applied kind: {}",
            outcome.output_path.display()
        );
    }
}
