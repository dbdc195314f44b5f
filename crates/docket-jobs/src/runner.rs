//! Uniform execution of one stage for one document.
//!
//! For a claimed message the runner checks the document's breaker, checks the
//! stage against the durable pipeline state, opens a task record, runs the
//! executor under the stage timeout (retrying transient errors locally),
//! closes the record, saves the pipeline state and only then enqueues the
//! next stage and acks the message. The message lease is renewed while the
//! stage runs. Validation failures, exhausted retries and an opened breaker
//! fail the document; sibling documents are never affected.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use docket_core::{
    defaults, BreakerState, Document, DocumentStatus, Error, PipelineState, QueuedTask, Result,
    Stage, StageFailure, StageMessage, StageResult, TaskOutcome,
};

use crate::batch;
use crate::context::PipelineContext;
use crate::events::PipelineEvent;
use crate::stages::StageRegistry;
use crate::state;

#[derive(Clone)]
pub struct StageRunner {
    ctx: PipelineContext,
    registry: StageRegistry,
}

impl StageRunner {
    pub fn new(ctx: PipelineContext, registry: StageRegistry) -> Self {
        Self { ctx, registry }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run `stage` for a document without touching the queue.
    pub async fn execute(&self, document_id: Uuid, stage: Stage) -> Result<StageResult> {
        let document = self
            .ctx
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;
        self.run(&document, stage).await
    }

    async fn run(&self, document: &Document, stage: Stage) -> Result<StageResult> {
        let ctx = &self.ctx;
        let executor = self
            .registry
            .get(stage)
            .ok_or_else(|| Error::Config(format!("no executor registered for {stage}")))?;

        let breaker = ctx.breaker.check(document.id).await;
        let mut pipeline = state::load_durable(ctx.store.as_ref(), document).await?;
        let in_order = stage
            .previous()
            .map_or(true, |prev| pipeline.is_complete(prev));

        if let Err(err) = breaker {
            if matches!(err, Error::CircuitOpen(_)) {
                return self.reject(document, stage, &err, in_order).await;
            }
            return Err(err);
        }

        if !in_order {
            let prev = stage.previous().unwrap_or(stage);
            let err = Error::Validation(format!(
                "{stage} requested before {prev} completed for document {}",
                document.id
            ));
            warn!(
                subsystem = "jobs",
                component = "runner",
                document_id = %document.id,
                stage = %stage,
                "Stage out of order, not attempted"
            );
            return Ok(StageResult::failure(document.id, stage, &err, 0));
        }

        ctx.store
            .update_document(document.id, DocumentStatus::Processing, stage)
            .await?;

        let mut attempt = 1u32;
        loop {
            let start = Instant::now();
            ctx.events.emit(PipelineEvent::StageStarted {
                document_id: document.id,
                stage,
                attempt,
            });
            let task = ctx.store.start_task(document.id, stage).await?;

            let outcome = match tokio::time::timeout(
                ctx.config.stage_timeout,
                executor.execute(ctx, document),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(format!(
                    "{stage} exceeded {}s",
                    ctx.config.stage_timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(output) => {
                    ctx.store
                        .finish_task(task.id, &TaskOutcome::succeeded(output.clone(), attempt - 1))
                        .await?;
                    ctx.breaker.record_success(document.id).await?;
                    // Re-read so a concurrent delivery's progress is kept
                    pipeline = state::load_durable(ctx.store.as_ref(), document).await?;
                    pipeline.record_success(output.clone());
                    state::save(ctx.store.as_ref(), &ctx.cache, &pipeline).await?;

                    info!(
                        subsystem = "jobs",
                        component = "runner",
                        document_id = %document.id,
                        stage = %stage,
                        attempt,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                    ctx.events.emit(PipelineEvent::StageCompleted {
                        document_id: document.id,
                        batch_id: document.batch_id,
                        output: output.clone(),
                    });
                    return Ok(StageResult::success(document.id, output, attempt));
                }
                Err(err) => {
                    if let Err(e) = ctx
                        .store
                        .finish_task(task.id, &TaskOutcome::failed(err.to_string(), attempt - 1))
                        .await
                    {
                        error!(
                            subsystem = "jobs",
                            component = "runner",
                            document_id = %document.id,
                            error = %e,
                            "Failed to close task record"
                        );
                    }
                    let breaker = ctx.breaker.record_failure(document.id).await?;

                    warn!(
                        subsystem = "jobs",
                        component = "runner",
                        document_id = %document.id,
                        stage = %stage,
                        attempt,
                        error_kind = %err.kind(),
                        error = %err,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Stage attempt failed"
                    );
                    ctx.events.emit(PipelineEvent::StageFailed {
                        document_id: document.id,
                        batch_id: document.batch_id,
                        stage,
                        kind: err.kind(),
                        error: err.to_string(),
                    });

                    let open = matches!(breaker, BreakerState::Open { .. });
                    if !open && ctx.config.retry.should_retry(&err, attempt) {
                        let delay = ctx.config.retry.delay_for(attempt);
                        debug!(
                            subsystem = "jobs",
                            component = "runner",
                            document_id = %document.id,
                            stage = %stage,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying stage"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    self.fail_document(document, stage, &mut pipeline, &err).await?;
                    return Ok(StageResult::failure(document.id, stage, &err, attempt));
                }
            }
        }
    }

    /// Report an attempt refused by the breaker. No work is done.
    ///
    /// The refusal is audited as a `rejected` task unless the stage was also
    /// out of order, which keeps the task history a pipeline prefix.
    async fn reject(
        &self,
        document: &Document,
        stage: Stage,
        err: &Error,
        audit: bool,
    ) -> Result<StageResult> {
        if audit {
            let task = self.ctx.store.start_task(document.id, stage).await?;
            self.ctx
                .store
                .finish_task(task.id, &TaskOutcome::rejected(err.to_string()))
                .await?;
        }
        info!(
            subsystem = "jobs",
            component = "runner",
            document_id = %document.id,
            stage = %stage,
            "Stage attempt rejected, circuit open"
        );
        self.ctx.events.emit(PipelineEvent::StageFailed {
            document_id: document.id,
            batch_id: document.batch_id,
            stage,
            kind: err.kind(),
            error: err.to_string(),
        });
        Ok(StageResult::failure(document.id, stage, err, 0))
    }

    async fn fail_document(
        &self,
        document: &Document,
        stage: Stage,
        pipeline: &mut PipelineState,
        err: &Error,
    ) -> Result<()> {
        let ctx = &self.ctx;
        pipeline.record_failure(StageFailure::from(err), true);
        if let Err(e) = state::save(ctx.store.as_ref(), &ctx.cache, pipeline).await {
            warn!(
                subsystem = "jobs",
                component = "runner",
                document_id = %document.id,
                error = %e,
                "Failed to save pipeline state"
            );
        }
        ctx.store
            .update_document(document.id, DocumentStatus::Failed, stage)
            .await?;
        error!(
            subsystem = "jobs",
            component = "runner",
            document_id = %document.id,
            stage = %stage,
            error_kind = %err.kind(),
            error = %err,
            "Document failed"
        );
        ctx.events.emit(PipelineEvent::DocumentFailed {
            document_id: document.id,
            batch_id: document.batch_id,
            stage,
            error: err.to_string(),
        });
        Ok(())
    }

    /// Process one claimed queue message end to end, including the ack.
    pub async fn handle(&self, task: QueuedTask) {
        let message = &task.message;
        let outcome = self.with_lease(&task, self.handle_inner(&task)).await;
        let Err(err) = outcome else { return };

        let queue = &self.ctx.queue;
        let give_up = !err.is_transient() || task.deliveries >= defaults::QUEUE_MAX_DELIVERIES;
        let result = if give_up {
            error!(
                subsystem = "jobs",
                component = "runner",
                document_id = %message.document_id,
                stage = %message.stage,
                task_id = %task.id,
                deliveries = task.deliveries,
                error = %err,
                "Dead-lettering stage message"
            );
            queue.dead_letter(task.id, &err.to_string()).await
        } else {
            let delay = self.ctx.config.retry.delay_for(task.deliveries);
            warn!(
                subsystem = "jobs",
                component = "runner",
                document_id = %message.document_id,
                stage = %message.stage,
                task_id = %task.id,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage message released for redelivery"
            );
            queue.retry(task.id, delay, &err.to_string()).await
        };
        if let Err(e) = result {
            error!(
                subsystem = "jobs",
                component = "runner",
                task_id = %task.id,
                error = %e,
                "Failed to release stage message"
            );
        }
    }

    /// Drive `work` to completion, renewing the message lease meanwhile.
    async fn with_lease<F>(&self, task: &QueuedTask, work: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let period = self
            .ctx
            .config
            .lease_renew_interval
            .max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticks.tick() => self.renew_lease(task).await,
            }
        }
    }

    async fn renew_lease(&self, task: &QueuedTask) {
        match self.ctx.queue.renew(task.id).await {
            Ok(true) => trace!(
                subsystem = "jobs",
                component = "runner",
                task_id = %task.id,
                "Lease renewed"
            ),
            Ok(false) => warn!(
                subsystem = "jobs",
                component = "runner",
                task_id = %task.id,
                document_id = %task.message.document_id,
                stage = %task.message.stage,
                "Lease no longer held while handling message"
            ),
            Err(e) => warn!(
                subsystem = "jobs",
                component = "runner",
                task_id = %task.id,
                error = %e,
                "Failed to renew lease"
            ),
        }
    }

    async fn handle_inner(&self, task: &QueuedTask) -> Result<()> {
        let ctx = &self.ctx;
        let message = &task.message;

        let document = ctx
            .store
            .get_document(message.document_id)
            .await?
            .ok_or(Error::DocumentNotFound(message.document_id))?;

        if document.status.is_terminal() {
            debug!(
                subsystem = "jobs",
                component = "runner",
                document_id = %document.id,
                stage = %message.stage,
                status = document.status.as_str(),
                "Skipping message for terminal document"
            );
            return ctx.queue.ack(task.id).await;
        }

        let pipeline = state::load_durable(ctx.store.as_ref(), &document).await?;
        let expected = pipeline.next_stage();
        if expected != Some(message.stage) {
            self.redirect(&document, message, expected).await?;
            return ctx.queue.ack(task.id).await;
        }

        let result = self.run(&document, message.stage).await?;
        if result.is_success() {
            match message.advance() {
                Some(next) => {
                    ctx.queue.enqueue(&next).await?;
                }
                None => {
                    ctx.events.emit(PipelineEvent::DocumentCompleted {
                        document_id: document.id,
                        batch_id: document.batch_id,
                    });
                    self.refresh_batch(document.batch_id).await;
                }
            }
        } else if !result.is_circuit_open() {
            self.refresh_batch(document.batch_id).await;
        }
        ctx.queue.ack(task.id).await
    }

    /// A message for a stage other than the document's next one: already
    /// done (a duplicate or redelivery) or ahead of its predecessor. The
    /// document's actual next stage is enqueued instead, which is a no-op
    /// when that message is already live.
    async fn redirect(
        &self,
        document: &Document,
        message: &StageMessage,
        expected: Option<Stage>,
    ) -> Result<()> {
        let Some(stage) = expected else {
            debug!(
                subsystem = "jobs",
                component = "runner",
                document_id = %document.id,
                stage = %message.stage,
                "Every stage already completed, message dropped"
            );
            self.refresh_batch(document.batch_id).await;
            return Ok(());
        };

        let resume = StageMessage {
            stage,
            attempt: 0,
            ..message.clone()
        };
        self.ctx.queue.enqueue(&resume).await?;
        warn!(
            subsystem = "jobs",
            component = "runner",
            document_id = %document.id,
            stage = %message.stage,
            expected = %stage,
            "Stage message out of order, enqueued the expected stage"
        );
        Ok(())
    }

    async fn refresh_batch(&self, batch_id: Option<Uuid>) {
        let Some(batch_id) = batch_id else { return };
        if let Err(e) = batch::refresh(self.ctx.store.as_ref(), batch_id).await {
            warn!(
                subsystem = "jobs",
                component = "runner",
                batch_id = %batch_id,
                error = %e,
                "Failed to refresh batch progress"
            );
        }
    }
}
