// Ingestion Pipeline
//
// Reads protocol lines in order on a single coordinator, validates them
// against the schema registry and fans records out to one worker task
// per stream. Checkpoints are recorded here with per-stream watermarks
// and released by the workers once their writes are durable.
//
//   stdin → decode → registry → [stream worker]* → warehouse
//                       ↓                ↓
//                  STATE + watermarks → checkpoint emitter → stdout

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::buffer::BufferedRecord;
use crate::checkpoint::{with_emitter, CheckpointEmitter};
use crate::config::{ConfigError, TargetConfig};
use crate::error::PipelineError;
use crate::message::{decode_line, Message};
use crate::provision::TableProvisioner;
use crate::schema::{SchemaRegistry, Validated};
use crate::state::{PhaseEvent, PhaseMachine, PipelinePhase};
use crate::warehouse::Warehouse;
use crate::writer::WriteExecutor;

mod worker;

pub use worker::StreamSummary;
use worker::{StreamCommand, StreamHandle, WorkerContext, WorkerEvent};

/// Totals for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub lines: u64,
    pub records: u64,
    /// Invalid records dropped by the registry.
    pub skipped: u64,
    pub states_emitted: u64,
    pub streams: Vec<StreamSummary>,
}

pub struct Pipeline {
    config: TargetConfig,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(config: TargetConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, warehouse })
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Consume `input` to the end, writing every record to the warehouse
    /// and every safe STATE value to `output`.
    ///
    /// When `shutdown` resolves, input stops being read and the run drains
    /// within the configured grace period.
    pub async fn run<R, W, S>(
        &self,
        input: R,
        output: W,
        shutdown: S,
    ) -> Result<RunSummary, PipelineError>
    where
        R: AsyncBufRead + Unpin,
        W: Write + Send + 'static,
        S: Future<Output = ()>,
    {
        let provisioner = Arc::new(TableProvisioner::new(
            self.warehouse.clone(),
            self.config.dataset(),
            self.config.table_naming(),
            self.config.write_timeout(),
        ));
        provisioner.ensure_dataset(&self.config.location).await?;

        let executor = WriteExecutor::new(
            self.warehouse.clone(),
            self.config.write_mode(),
            self.config.retry_policy(),
            self.config.write_timeout(),
        )
        .with_streaming_batch_size(self.config.streaming_batch_size);

        let (events, mut event_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            provisioner,
            executor: Arc::new(executor),
            checkpoints: CheckpointEmitter::new(output).shared(),
            events,
            flush_permits: Arc::new(Semaphore::new(self.config.max_parallel_flushes)),
            policy: self.config.flush_policy(),
            partition: self.config.partition(),
            channel_capacity: self.config.channel_capacity,
        };
        let mut coordinator = Coordinator::new(&self.config, ctx);

        info!(
            dataset = %self.config.dataset(),
            mode = ?self.config.write_mode(),
            "target started"
        );

        let mut lines = input.split(b'\n');
        tokio::pin!(shutdown);
        let mut interrupted = false;

        let read: Result<(), PipelineError> = loop {
            tokio::select! {
                biased;

                Some(event) = event_rx.recv() => {
                    if let Err(e) = coordinator.on_event(event) {
                        break Err(e);
                    }
                }
                _ = &mut shutdown => {
                    warn!(grace = ?self.config.shutdown_grace(), "shutdown requested; draining");
                    interrupted = true;
                    break Ok(());
                }
                line = lines.next_segment() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = coordinator.handle_line(&line).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            }
        };

        if let Err(e) = read {
            coordinator.abort();
            return Err(e);
        }

        let grace = interrupted.then(|| self.config.shutdown_grace());
        match coordinator.drain(&mut event_rx, grace).await {
            Ok(summary) => {
                info!(
                    lines = summary.lines,
                    records = summary.records,
                    states = summary.states_emitted,
                    "target finished"
                );
                Ok(summary)
            }
            Err(e) => {
                coordinator.abort();
                Err(e)
            }
        }
    }
}

/// Single-threaded owner of everything that must follow input order.
struct Coordinator {
    ctx: WorkerContext,
    registry: SchemaRegistry,
    workers: HashMap<String, StreamHandle>,
    /// Last sequence number handed to each stream.
    watermarks: HashMap<String, u64>,
    seq: u64,
    failed: HashSet<String>,
    /// First failure confined to a single stream, reported at the end.
    stream_failure: Option<PipelineError>,
    phase: PhaseMachine,
    in_flight: usize,
    summary: RunSummary,
}

impl Coordinator {
    fn new(config: &TargetConfig, ctx: WorkerContext) -> Self {
        Self {
            ctx,
            registry: SchemaRegistry::new(config.registry_options()),
            workers: HashMap::new(),
            watermarks: HashMap::new(),
            seq: 0,
            failed: HashSet::new(),
            stream_failure: None,
            phase: PhaseMachine::new(),
            in_flight: 0,
            summary: RunSummary::default(),
        }
    }

    async fn handle_line(&mut self, line: &[u8]) -> Result<(), PipelineError> {
        self.summary.lines += 1;
        let message = match decode_line(line) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(source) => {
                return Err(PipelineError::Decode {
                    line: self.summary.lines,
                    source,
                })
            }
        };
        self.phase.apply(PhaseEvent::InputReceived)?;

        match message {
            Message::Schema(msg) => {
                let declared = self.registry.declare_schema(
                    &msg.stream,
                    &msg.schema,
                    msg.key_properties.unwrap_or_default(),
                )?;
                self.worker(&msg.stream)
                    .send(StreamCommand::Schema {
                        schema: declared.schema,
                        flush_first: declared.flush_first,
                    })
                    .await?;
            }

            Message::Record(msg) => {
                let (record, widened) = match self.registry.validate(&msg.stream, msg.record)? {
                    Validated::Accepted { record, widened } => (record, widened),
                    Validated::Skipped => {
                        self.summary.skipped += 1;
                        return Ok(());
                    }
                };

                self.seq += 1;
                let seq = self.seq;
                self.watermarks.insert(msg.stream.clone(), seq);
                self.summary.records += 1;
                if self.failed.contains(&msg.stream) {
                    return Ok(());
                }

                let worker = self.worker(&msg.stream);
                if let Some(schema) = widened {
                    worker
                        .send(StreamCommand::Schema {
                            schema,
                            flush_first: false,
                        })
                        .await?;
                }
                worker
                    .send(StreamCommand::Record(BufferedRecord {
                        seq,
                        record,
                        bytes: line.len(),
                    }))
                    .await?;
            }

            Message::State(msg) => {
                let watermarks = self.watermarks.clone();
                with_emitter(&self.ctx.checkpoints, move |checkpoints| {
                    checkpoints.record_state(msg.value, watermarks);
                    checkpoints.emit_if_safe()
                })
                .await?;
            }

            Message::ActivateVersion(msg) => {
                debug!(stream = %msg.stream, version = msg.version, "ignoring ACTIVATE_VERSION");
            }
        }
        Ok(())
    }

    /// Worker for `stream`, started on first use.
    fn worker(&mut self, stream: &str) -> &StreamHandle {
        let ctx = &self.ctx;
        self.workers
            .entry(stream.to_string())
            .or_insert_with(|| StreamHandle::spawn(stream, ctx.clone()))
    }

    fn on_event(&mut self, event: WorkerEvent) -> Result<(), PipelineError> {
        match event {
            WorkerEvent::FlushStarted { stream } => {
                debug!(stream = %stream, "flush started");
                self.in_flight += 1;
                if self.in_flight == 1 {
                    self.phase.apply(PhaseEvent::FlushStarted)?;
                }
            }
            WorkerEvent::FlushFinished { stream } => {
                debug!(stream = %stream, "flush finished");
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.in_flight == 0 {
                    self.phase.apply(PhaseEvent::FlushFinished)?;
                }
            }
            WorkerEvent::Failed { stream, error } => {
                self.failed.insert(stream.clone());
                if !error.is_stream_local() {
                    CheckpointEmitter::lock(&self.ctx.checkpoints).poison();
                    return Err(error);
                }
                error!(stream = %stream, %error, "stream failed; continuing with other streams");
                if self.stream_failure.is_none() {
                    self.stream_failure = Some(error);
                }
            }
        }
        Ok(())
    }

    /// Flush every stream, wait for the workers and release the last
    /// checkpoint. With a grace period, give up once it elapses.
    async fn drain(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        grace: Option<std::time::Duration>,
    ) -> Result<RunSummary, PipelineError> {
        self.phase.apply(PhaseEvent::InputExhausted)?;
        debug!(streams = self.workers.len(), "draining");

        let mut pending: Vec<(String, oneshot::Receiver<StreamSummary>)> = Vec::new();
        for (stream, worker) in &self.workers {
            pending.push((stream.clone(), worker.begin_close().await?));
        }

        let closed = async {
            let mut summaries = Vec::with_capacity(pending.len());
            for (stream, done) in pending {
                summaries.push(done.await.map_err(|_| PipelineError::WorkerGone(stream))?);
            }
            Ok::<_, PipelineError>(summaries)
        };
        let mut summaries = match grace {
            None => closed.await?,
            Some(grace) => match tokio::time::timeout(grace, closed).await {
                Ok(result) => result?,
                Err(_) => {
                    error!(?grace, "buffers not drained within grace period");
                    CheckpointEmitter::lock(&self.ctx.checkpoints).poison();
                    return Err(PipelineError::Interrupted(grace));
                }
            },
        };

        // Workers report before acknowledging, so nothing is left behind.
        while let Ok(event) = events.try_recv() {
            self.on_event(event)?;
        }
        self.phase.apply(PhaseEvent::Drained)?;
        debug_assert_eq!(self.phase.current(), PipelinePhase::Terminated);

        let emitted = with_emitter(&self.ctx.checkpoints, |checkpoints| {
            checkpoints.emit_if_safe()?;
            if checkpoints.has_pending() {
                warn!("final state withheld: not every preceding record is durable");
            }
            Ok(checkpoints.emitted())
        })
        .await?;

        if let Some(error) = self.stream_failure.take() {
            return Err(error);
        }

        summaries.sort_by(|a, b| a.stream.cmp(&b.stream));
        let mut summary = std::mem::take(&mut self.summary);
        summary.states_emitted = emitted;
        summary.streams = summaries;
        Ok(summary)
    }

    /// Stop every worker without flushing. Buffered records are lost but
    /// no checkpoint covering them was ever emitted.
    fn abort(&self) {
        CheckpointEmitter::lock(&self.ctx.checkpoints).poison();
        for worker in self.workers.values() {
            debug!(stream = worker.stream(), "aborting worker");
            worker.abort();
        }
    }
}
