// Stream Worker
//
// One task per stream. The task owns the stream's buffer outright, so
// appends, timer flushes and the final drain are serialized without a
// lock and at most one write per table is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::buffer::{BufferedRecord, FlushPolicy, FlushTrigger, StreamBuffer};
use crate::checkpoint::{with_emitter, SharedEmitter};
use crate::error::PipelineError;
use crate::provision::TableProvisioner;
use crate::schema::StreamSchema;
use crate::warehouse::PartitionConfig;
use crate::writer::WriteExecutor;

/// Commands sent from the coordinator to a stream's task.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// New schema in force. Pending records go out under the old one
    /// first when `flush_first` is set.
    Schema {
        schema: Arc<StreamSchema>,
        flush_first: bool,
    },
    Record(BufferedRecord),
    /// Flush what is left and stop.
    Close { ack: oneshot::Sender<StreamSummary> },
}

/// Notifications sent back to the coordinator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    FlushStarted { stream: String },
    FlushFinished { stream: String },
    Failed { stream: String, error: PipelineError },
}

/// Per-stream totals reported when a worker closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub stream: String,
    pub rows_written: u64,
    pub flushes: u64,
    /// Records discarded after the stream failed.
    pub dropped: u64,
    pub failed: bool,
}

/// Everything a worker shares with the rest of the run.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub provisioner: Arc<TableProvisioner>,
    pub executor: Arc<WriteExecutor>,
    pub checkpoints: SharedEmitter,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub flush_permits: Arc<Semaphore>,
    pub policy: FlushPolicy,
    pub partition: Option<PartitionConfig>,
    pub channel_capacity: usize,
}

/// Coordinator-side handle to a stream's task.
pub(crate) struct StreamHandle {
    stream: String,
    tx: mpsc::Sender<StreamCommand>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn spawn(stream: &str, ctx: WorkerContext) -> Self {
        let (tx, rx) = mpsc::channel(ctx.channel_capacity.max(1));
        let worker = StreamWorker::new(stream, ctx);
        let task = tokio::spawn(worker.run(rx));
        debug!(stream, "stream worker started");

        Self {
            stream: stream.to_string(),
            tx,
            task,
        }
    }

    /// Send a command, waiting for room when the worker is behind.
    pub async fn send(&self, command: StreamCommand) -> Result<(), PipelineError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PipelineError::WorkerGone(self.stream.clone()))
    }

    /// Ask the worker to drain. The receiver resolves once it has.
    pub async fn begin_close(&self) -> Result<oneshot::Receiver<StreamSummary>, PipelineError> {
        let (ack, done) = oneshot::channel();
        self.send(StreamCommand::Close { ack }).await?;
        Ok(done)
    }

    /// Stop the worker without flushing.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

struct StreamWorker {
    stream: String,
    ctx: WorkerContext,
    buffer: StreamBuffer,
    schema: Option<Arc<StreamSchema>>,
    /// Schema version the table was last provisioned for.
    provisioned: Option<u64>,
    summary: StreamSummary,
}

impl StreamWorker {
    fn new(stream: &str, ctx: WorkerContext) -> Self {
        Self {
            stream: stream.to_string(),
            buffer: StreamBuffer::new(stream, ctx.policy),
            ctx,
            schema: None,
            provisioned: None,
            summary: StreamSummary {
                stream: stream.to_string(),
                ..StreamSummary::default()
            },
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StreamCommand>) {
        let mut ticker = interval(tick_period(self.ctx.policy.max_age));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        debug!(stream = %self.stream, pending = self.buffer.len(), "command channel closed");
                        break;
                    };
                    match command {
                        StreamCommand::Schema { schema, flush_first } => {
                            if flush_first {
                                self.flush(FlushTrigger::SchemaChange).await;
                            }
                            self.schema = Some(schema);
                        }
                        StreamCommand::Record(record) => {
                            if self.summary.failed {
                                self.summary.dropped += 1;
                            } else if let Some(trigger) = self.buffer.append(record) {
                                self.flush(trigger).await;
                            }
                        }
                        StreamCommand::Close { ack } => {
                            self.flush(FlushTrigger::Drain).await;
                            debug!(stream = %self.stream, "stream worker closed");
                            let _ = ack.send(self.summary.clone());
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Some(trigger) = self.buffer.check(Instant::now()) {
                        self.flush(trigger).await;
                    }
                }
            }
        }
    }

    /// Flush the buffer. A failure halts the stream and keeps its records.
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.summary.failed || self.buffer.is_empty() {
            return;
        }

        let _ = self.ctx.events.send(WorkerEvent::FlushStarted {
            stream: self.stream.clone(),
        });
        let result = self.write_pending(trigger).await;
        let _ = self.ctx.events.send(WorkerEvent::FlushFinished {
            stream: self.stream.clone(),
        });

        if let Err(error) = result {
            error!(
                stream = %self.stream,
                pending = self.buffer.len(),
                %error,
                "flush failed; stream halted"
            );
            self.summary.failed = true;
            let _ = self.ctx.events.send(WorkerEvent::Failed {
                stream: self.stream.clone(),
                error,
            });
        }
    }

    async fn write_pending(&mut self, trigger: FlushTrigger) -> Result<(), PipelineError> {
        let Some(schema) = self.schema.clone() else {
            return Ok(());
        };

        let _permit = self
            .ctx
            .flush_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::WorkerGone(self.stream.clone()))?;

        if self.provisioned != Some(schema.version) {
            self.ctx
                .provisioner
                .ensure_table(&self.stream, &schema, self.ctx.partition.as_ref())
                .await?;
            self.provisioned = Some(schema.version);
        }

        let table = self.ctx.provisioner.table_ref(&self.stream);
        let started = Instant::now();
        let report = self
            .ctx
            .executor
            .write(&table, &schema, self.buffer.pending())
            .await?;

        let Some(last_seq) = self.buffer.mark_flushed(Instant::now()) else {
            return Ok(());
        };
        self.summary.rows_written += report.rows as u64;
        self.summary.flushes += 1;
        info!(
            stream = %self.stream,
            table = %table,
            %trigger,
            rows = report.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed"
        );

        let stream = self.stream.clone();
        with_emitter(&self.ctx.checkpoints, move |checkpoints| {
            checkpoints.mark_durable(&stream, last_seq);
            checkpoints.emit_if_safe()
        })
        .await?;
        Ok(())
    }
}

/// Timer granularity for age-based flushes.
fn tick_period(max_age: Duration) -> Duration {
    max_age
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(10))
}
