//! FIFO job queue with at-least-once delivery.
//!
//! Jobs are handed out in submission order. A delivered job must be
//! acknowledged; one that stays unacknowledged past the visibility timeout
//! is treated as a lost delivery (its worker died or stalled), marked
//! failed, and retried back to `queued` for redelivery. Workers must
//! tolerate seeing the same job twice; deterministic chunk identity makes
//! the resulting upsert a safe overwrite.
//!
//! Per-job phase is observable by polling ([`JobQueue::phase`]) or by push
//! through a `tokio::sync::watch` subscription ([`JobQueue::watch_phase`]).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::job::{Document, IngestionJob, JobId, JobPhase};
use crate::types::LoreError;

struct JobEntry {
    job: IngestionJob,
    phase_tx: watch::Sender<JobPhase>,
    delivered_at: Option<Instant>,
    acked: bool,
    failed_ordinals: Vec<usize>,
}

/// One delivery of a job to a worker. The snapshot reflects the job at
/// delivery time; phase updates go back through the queue.
#[derive(Clone, Debug)]
pub struct JobDelivery {
    pub job: IngestionJob,
}

pub struct JobQueue {
    tx: flume::Sender<JobId>,
    rx: flume::Receiver<JobId>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    visibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            jobs: Mutex::new(HashMap::new()),
            visibility_timeout,
        }
    }

    /// Accepts a document for indexing. Fast and non-blocking; indexing
    /// happens later on a worker.
    pub fn enqueue(&self, document: Document) -> JobId {
        let job = IngestionJob::new(document);
        let job_id = job.job_id;
        let (phase_tx, _) = watch::channel(JobPhase::Queued);

        self.jobs.lock().insert(
            job_id,
            JobEntry {
                job,
                phase_tx,
                delivered_at: None,
                acked: false,
                failed_ordinals: Vec::new(),
            },
        );
        // The receiver half lives in self, so this send cannot fail.
        let _ = self.tx.send(job_id);
        tracing::debug!(job_id = %job_id, "job enqueued");
        job_id
    }

    /// Waits for the next deliverable job. Returns `None` once the queue is
    /// closed and drained.
    pub async fn next_job(&self) -> Option<JobDelivery> {
        loop {
            let job_id = self.rx.recv_async().await.ok()?;
            if let Some(delivery) = self.deliver(job_id) {
                return Some(delivery);
            }
        }
    }

    /// Non-blocking variant of [`next_job`](Self::next_job).
    pub fn try_next_job(&self) -> Option<JobDelivery> {
        while let Ok(job_id) = self.rx.try_recv() {
            if let Some(delivery) = self.deliver(job_id) {
                return Some(delivery);
            }
        }
        None
    }

    fn deliver(&self, job_id: JobId) -> Option<JobDelivery> {
        let mut jobs = self.jobs.lock();
        let entry = jobs.get_mut(&job_id)?;
        if entry.acked && entry.job.phase.is_terminal() {
            // Stale queue entry for a job that already completed.
            return None;
        }
        entry.delivered_at = Some(Instant::now());
        entry.acked = false;
        Some(JobDelivery {
            job: entry.job.clone(),
        })
    }

    /// Advances a job's phase, enforcing the state machine, and notifies
    /// watchers.
    pub fn set_phase(&self, job_id: JobId, phase: JobPhase) -> Result<(), LoreError> {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| LoreError::Validation(format!("unknown job {job_id}")))?;
        entry.job.advance(phase)?;
        entry.phase_tx.send_replace(phase);
        Ok(())
    }

    /// Acknowledges a delivery, ending the redelivery window.
    pub fn ack(&self, job_id: JobId) {
        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.acked = true;
            entry.delivered_at = None;
        }
    }

    /// Current phase, or `None` for an unknown job (callers surface that as
    /// `idle`).
    pub fn phase(&self, job_id: JobId) -> Option<JobPhase> {
        self.jobs.lock().get(&job_id).map(|entry| entry.job.phase)
    }

    /// Push-style phase observation.
    pub fn watch_phase(&self, job_id: JobId) -> Option<watch::Receiver<JobPhase>> {
        self.jobs
            .lock()
            .get(&job_id)
            .map(|entry| entry.phase_tx.subscribe())
    }

    /// Records which ordinals of a job's document failed to embed.
    pub fn record_failed_ordinals(&self, job_id: JobId, ordinals: Vec<usize>) {
        if let Some(entry) = self.jobs.lock().get_mut(&job_id) {
            entry.failed_ordinals = ordinals;
        }
    }

    /// Failed ordinals reported for a job, if any.
    pub fn failed_ordinals(&self, job_id: JobId) -> Option<Vec<usize>> {
        self.jobs
            .lock()
            .get(&job_id)
            .map(|entry| entry.failed_ordinals.clone())
    }

    /// Manually retries a failed job: `failed → queued`, then redelivery.
    pub fn retry(&self, job_id: JobId) -> Result<(), LoreError> {
        {
            let mut jobs = self.jobs.lock();
            let entry = jobs
                .get_mut(&job_id)
                .ok_or_else(|| LoreError::Validation(format!("unknown job {job_id}")))?;
            entry.job.advance(JobPhase::Queued)?;
            entry.job.attempts += 1;
            entry.acked = false;
            entry.delivered_at = None;
            entry.phase_tx.send_replace(JobPhase::Queued);
        }
        let _ = self.tx.send(job_id);
        Ok(())
    }

    /// Requeues deliveries that outlived the visibility timeout without an
    /// ack. The lost delivery is recorded as a failure, then retried
    /// through the legal `failed → queued` edge. Returns the number of jobs
    /// redelivered.
    pub fn redeliver_stale(&self) -> usize {
        let mut stale = Vec::new();
        {
            let mut jobs = self.jobs.lock();
            for (job_id, entry) in jobs.iter_mut() {
                let Some(delivered_at) = entry.delivered_at else {
                    continue;
                };
                if entry.acked || delivered_at.elapsed() < self.visibility_timeout {
                    continue;
                }
                if entry.job.phase.can_advance_to(JobPhase::Failed) {
                    let _ = entry.job.advance(JobPhase::Failed);
                }
                if entry.job.advance(JobPhase::Queued).is_ok() {
                    entry.job.attempts += 1;
                    entry.delivered_at = None;
                    entry.phase_tx.send_replace(JobPhase::Queued);
                    stale.push(*job_id);
                }
            }
        }
        for job_id in &stale {
            tracing::warn!(job_id = %job_id, "redelivering unacknowledged job");
            let _ = self.tx.send(*job_id);
        }
        stale.len()
    }

    /// Number of jobs waiting for delivery.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
