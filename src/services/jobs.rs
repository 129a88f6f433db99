//! Optimization job lifecycle: submit, dispatch, cancel, read
//!
//! The manager owns the job records (through the store) and never shares
//! them; workers communicate results back only via the store and the
//! progress broker. Execution strategy is a build-time choice between the
//! inline and pooled runners.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::queries::job as job_store;
use crate::services::cancellation::CancellationRegistry;
use crate::services::optimizer::{run_optimization, OptimizeEnv};
use crate::services::progress::{BrokerHandle, ProgressSink};
use crate::services::travel_time::TravelTimeProvider;
use crate::types::{
    JobError, JobState, JobSubmitResponse, JobView, OptimizeJobRequest, OptimizeResult,
    OptimizerPhase, ProgressEvent,
};

/// Tuning for job execution
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub worker_concurrency: usize,
    pub job_time_limit: Duration,
    /// Backoff schedule for transient failures; length bounds the retries
    pub retry_backoff: Vec<Duration>,
    pub detour_factor: f64,
    pub speed_kmh: f64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            job_time_limit: Duration::from_secs(3_600),
            retry_backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
            ],
            detour_factor: crate::services::geo::DEFAULT_DETOUR_FACTOR,
            speed_kmh: crate::services::geo::DEFAULT_SPEED_KMH,
        }
    }
}

/// Sink that persists progress to the store and fans out to the broker,
/// enforcing monotonic progress per job
struct PersistingSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    last_progress: AtomicU8,
}

impl ProgressSink for PersistingSink {
    fn publish(&self, mut event: ProgressEvent) {
        let last = self.last_progress.load(Ordering::Relaxed);
        if event.progress < last {
            event.progress = last;
        } else {
            self.last_progress.store(event.progress, Ordering::Relaxed);
        }
        let _ = self.tx.send(event);
    }
}

/// Runs one job end-to-end: state transitions, retries, terminal events
pub struct JobExecutor {
    pool: PgPool,
    broker: BrokerHandle,
    cancellations: CancellationRegistry,
    provider: Arc<dyn TravelTimeProvider>,
    config: JobsConfig,
}

impl JobExecutor {
    pub fn new(
        pool: PgPool,
        broker: BrokerHandle,
        cancellations: CancellationRegistry,
        provider: Arc<dyn TravelTimeProvider>,
        config: JobsConfig,
    ) -> Self {
        Self {
            pool,
            broker,
            cancellations,
            provider,
            config,
        }
    }

    /// Execute a queued job. All failure paths land in the store; the
    /// returned error is for the worker's log only.
    pub async fn execute(&self, job_id: Uuid) -> Result<(), JobError> {
        let record = job_store::get_job(&self.pool, job_id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?
            .ok_or_else(|| JobError::internal(format!("job {} vanished from store", job_id)))?;

        if !job_store::mark_running(&self.pool, job_id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?
        {
            // Cancelled while queued, or picked up twice. A pre-cancelled
            // token may still sit in the registry; clear it.
            self.cancellations.remove(&job_id);
            debug!(%job_id, "job no longer queued, skipping");
            return Ok(());
        }

        let (_guard, token) = self.cancellations.register(job_id);
        let request = record.payload.0;

        // Forwarder task: one writer serializes store updates and broker
        // publishes for this job
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let forward_pool = self.pool.clone();
        let forward_broker = self.broker.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Err(e) = job_store::update_progress(
                    &forward_pool,
                    event.job_id,
                    event.phase.as_str(),
                    event.progress,
                )
                .await
                {
                    warn!(job_id = %event.job_id, error = %e, "progress persist failed");
                }
                forward_broker.publish(event);
            }
        });

        let sink: Arc<dyn ProgressSink> = Arc::new(PersistingSink {
            tx: event_tx,
            last_progress: AtomicU8::new(0),
        });

        let deadline = Instant::now() + self.config.job_time_limit;
        let outcome = self
            .run_with_retries(job_id, &request, Arc::clone(&sink), &token, deadline)
            .await;

        // Drop the sink so the forwarder drains and exits before the
        // terminal event is published
        drop(sink);
        let _ = forwarder.await;

        match outcome {
            Ok(result) => self.finish_completed(job_id, result).await,
            Err(e) => self.finish_failed(job_id, e).await,
        }
    }

    async fn run_with_retries(
        &self,
        job_id: Uuid,
        request: &OptimizeJobRequest,
        sink: Arc<dyn ProgressSink>,
        token: &tokio_util::sync::CancellationToken,
        deadline: Instant,
    ) -> Result<OptimizeResult, JobError> {
        let max_attempts = self.config.retry_backoff.len().max(1);
        let mut attempt = 0;

        loop {
            let env = OptimizeEnv {
                job_id,
                provider: Arc::clone(&self.provider),
                sink: Arc::clone(&sink),
                cancel: token.clone(),
                deadline: Some(deadline),
                detour_factor: self.config.detour_factor,
                speed_kmh: self.config.speed_kmh,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JobError::Timeout);
            }

            // Belt over the in-band deadline: the future itself is bounded
            let run = tokio::time::timeout(
                remaining + Duration::from_secs(5),
                run_optimization(request.clone(), env),
            );

            let result = match run.await {
                Ok(result) => result,
                Err(_elapsed) => {
                    token.cancel();
                    Err(JobError::Timeout)
                }
            };

            match result {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let backoff = self.config.retry_backoff[attempt];
                    warn!(
                        %job_id,
                        attempt,
                        backoff_s = backoff.as_secs(),
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_completed(&self, job_id: Uuid, result: OptimizeResult) -> Result<(), JobError> {
        let transitioned = job_store::complete_job(&self.pool, job_id, &result)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        if transitioned {
            info!(%job_id, buses = result.schedule.stats.bus_count, "job completed");
            self.broker
                .publish(ProgressEvent::completed(job_id, "schedule ready"));
        }
        Ok(())
    }

    /// Exactly one terminal event per job: only the caller that performs
    /// the store transition publishes it
    async fn finish_failed(&self, job_id: Uuid, e: JobError) -> Result<(), JobError> {
        let progress = job_store::get_job(&self.pool, job_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.progress.clamp(0, 100) as u8)
            .unwrap_or(0);

        match &e {
            JobError::Cancelled => {
                let transitioned = job_store::cancel_job(&self.pool, job_id)
                    .await
                    .map_err(|db| JobError::internal(db.to_string()))?;
                if transitioned {
                    info!(%job_id, "job cancelled");
                    self.broker.publish(ProgressEvent::cancelled(
                        job_id,
                        OptimizerPhase::Starting,
                        progress,
                    ));
                }
            }
            _ => {
                let transitioned =
                    job_store::fail_job(&self.pool, job_id, e.code(), &e.to_string())
                        .await
                        .map_err(|db| JobError::internal(db.to_string()))?;
                if transitioned {
                    error!(%job_id, code = e.code(), error = %e, "job failed");
                    self.broker.publish(ProgressEvent::error(
                        job_id,
                        OptimizerPhase::Starting,
                        progress,
                        format!("{}: {}", e.code(), e),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Execution strategy behind `JobManager::submit`
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Make a persisted, queued job execute
    async fn dispatch(&self, job_id: Uuid) -> Result<(), JobError>;

    /// Liveness for the health endpoint
    fn is_healthy(&self) -> bool;
}

/// Runs the job in the caller's context before returning. Used when the
/// async fabric is disabled and by the CLI runner.
pub struct InlineRunner {
    executor: Arc<JobExecutor>,
}

impl InlineRunner {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobRunner for InlineRunner {
    async fn dispatch(&self, job_id: Uuid) -> Result<(), JobError> {
        self.executor.execute(job_id).await
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Fixed worker pool with fair dispatch: each worker takes one job at a
/// time from a shared queue
pub struct PooledRunner {
    queue_tx: mpsc::UnboundedSender<Uuid>,
}

impl PooledRunner {
    pub fn start(executor: Arc<JobExecutor>, concurrency: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Uuid>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        for worker_id in 0..concurrency.max(1) {
            let executor = Arc::clone(&executor);
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                info!(worker_id, "worker started");
                loop {
                    // Lock only to pop; prefetch stays at one job per worker
                    let job_id = { queue_rx.lock().await.recv().await };
                    match job_id {
                        Some(job_id) => {
                            debug!(worker_id, %job_id, "worker picked up job");
                            if let Err(e) = executor.execute(job_id).await {
                                error!(worker_id, %job_id, error = %e, "job execution error");
                            }
                        }
                        None => {
                            info!(worker_id, "worker shutting down");
                            break;
                        }
                    }
                }
            });
        }

        Self { queue_tx }
    }
}

#[async_trait]
impl JobRunner for PooledRunner {
    async fn dispatch(&self, job_id: Uuid) -> Result<(), JobError> {
        self.queue_tx
            .send(job_id)
            .map_err(|_| JobError::internal("worker pool is shut down"))
    }

    fn is_healthy(&self) -> bool {
        !self.queue_tx.is_closed()
    }
}

/// Result of a `result(id)` read
pub enum ResultOutcome {
    NotFound,
    /// Job exists but is not completed
    NotReady(JobState),
    Ready(Box<OptimizeResult>),
}

/// Owns the lifecycle of optimization jobs. The only component that
/// touches job records.
pub struct JobManager {
    pool: PgPool,
    broker: BrokerHandle,
    cancellations: CancellationRegistry,
    runner: Arc<dyn JobRunner>,
}

impl JobManager {
    pub fn new(
        pool: PgPool,
        broker: BrokerHandle,
        cancellations: CancellationRegistry,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            pool,
            broker,
            cancellations,
            runner,
        }
    }

    /// Validate, persist, and dispatch a job. Heavy work is deferred; the
    /// queued response returns immediately on the pooled runner.
    pub async fn submit(&self, request: OptimizeJobRequest) -> Result<JobSubmitResponse, JobError> {
        validate_submission(&request)?;

        let job_id = Uuid::new_v4();
        job_store::insert_job(&self.pool, job_id, &request)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        info!(%job_id, routes = request.routes.len(), "job submitted");

        self.runner.dispatch(job_id).await?;

        // On the inline runner the job is already terminal here
        let status = job_store::get_job(&self.pool, job_id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?
            .map(|r| r.state())
            .unwrap_or(JobState::Queued);

        let mut response = JobSubmitResponse::queued(job_id);
        response.status = status;
        Ok(response)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobView>, JobError> {
        let record = job_store::get_job(&self.pool, id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        Ok(record.map(|r| r.view()))
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<JobView>, JobError> {
        let records = job_store::list_jobs(&self.pool, limit)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        Ok(records.iter().map(|r| r.view()).collect())
    }

    pub async fn result(&self, id: Uuid) -> Result<ResultOutcome, JobError> {
        let record = job_store::get_job(&self.pool, id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        Ok(match record {
            None => ResultOutcome::NotFound,
            Some(record) => match (record.state(), record.result) {
                (JobState::Completed, Some(result)) => ResultOutcome::Ready(Box::new(result.0)),
                (state, _) => ResultOutcome::NotReady(state),
            },
        })
    }

    /// Cancel a job. Queued jobs transition immediately; running jobs are
    /// signalled through their cancellation token and transition when the
    /// worker notices (or right here if the store flips first). Idempotent.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<JobView>, JobError> {
        let record = match job_store::get_job(&self.pool, id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?
        {
            Some(record) => record,
            None => return Ok(None),
        };

        if record.state().is_terminal() {
            return Ok(Some(record.view()));
        }

        // Flip the token first so a running worker stops emitting
        if !self.cancellations.cancel(&id) {
            self.cancellations.pre_cancel(id);
        }

        let transitioned = job_store::cancel_job(&self.pool, id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        if transitioned {
            info!(job_id = %id, "job cancelled");
            self.broker.publish(ProgressEvent::cancelled(
                id,
                OptimizerPhase::Starting,
                record.progress.clamp(0, 100) as u8,
            ));
        }

        let record = job_store::get_job(&self.pool, id)
            .await
            .map_err(|e| JobError::internal(e.to_string()))?;
        Ok(record.map(|r| r.view()))
    }

    /// Store reachability for the health endpoint
    pub async fn store_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub fn queue_healthy(&self) -> bool {
        self.runner.is_healthy()
    }

    pub fn broker_healthy(&self) -> bool {
        self.broker.is_alive()
    }
}

/// Submit-time validation: reject malformed input before it consumes a
/// worker slot
fn validate_submission(request: &OptimizeJobRequest) -> Result<(), JobError> {
    let mut seen = std::collections::HashSet::new();
    for route in &request.routes {
        route
            .validate()
            .map_err(|e| JobError::InvalidInput(e.to_string()))?;
        if !seen.insert(route.id.as_str()) {
            return Err(JobError::InvalidInput(format!(
                "duplicate route id '{}'",
                route.id
            )));
        }
    }
    if let Some(day) = &request.options.day {
        if !crate::types::route::DAY_CODES.contains(&day.as_str()) {
            return Err(JobError::InvalidInput(format!(
                "unknown day code '{}'",
                day
            )));
        }
    }
    if let Some(seats) = request.options.bus_seats {
        if seats == 0 {
            return Err(JobError::InvalidInput(
                "bus seats must be positive".to_string(),
            ));
        }
    }
    Ok(())
}
