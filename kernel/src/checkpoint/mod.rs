// Checkpoint Emitter
//
// Holds the newest upstream state message until every record that
// preceded it is durable, then echoes it to the output stream. A state
// is never emitted ahead of the data it covers.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

/// A state waiting for its records to land.
#[derive(Debug, Clone, PartialEq)]
struct PendingState {
    value: Value,
    /// Last record sequence enqueued per stream when the state arrived.
    watermarks: HashMap<String, u64>,
}

pub struct CheckpointEmitter {
    out: Box<dyn Write + Send>,
    pending: Option<PendingState>,
    durable: HashMap<String, u64>,
    last_emitted: Option<Value>,
    emitted: u64,
    poisoned: bool,
}

/// Emitter shared between the coordinator and stream workers.
pub type SharedEmitter = Arc<Mutex<CheckpointEmitter>>;

impl CheckpointEmitter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            pending: None,
            durable: HashMap::new(),
            last_emitted: None,
            emitted: 0,
            poisoned: false,
        }
    }

    pub fn shared(self) -> SharedEmitter {
        Arc::new(Mutex::new(self))
    }

    /// Lock a shared emitter, ignoring poisoning from a panicked holder.
    pub fn lock(shared: &SharedEmitter) -> MutexGuard<'_, CheckpointEmitter> {
        shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember `value` as the newest state. Any older pending state is
    /// superseded: the newer one covers strictly more records.
    pub fn record_state(&mut self, value: Value, watermarks: HashMap<String, u64>) {
        if self.pending.is_some() {
            debug!("superseding pending state");
        }
        self.pending = Some(PendingState { value, watermarks });
    }

    /// Every record of `stream` up to and including `seq` is durable.
    pub fn mark_durable(&mut self, stream: &str, seq: u64) {
        let entry = self.durable.entry(stream.to_string()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    fn is_safe(&self, pending: &PendingState) -> bool {
        pending
            .watermarks
            .iter()
            .all(|(stream, seq)| self.durable.get(stream).is_some_and(|d| d >= seq))
    }

    /// Write the pending state if all records before it are durable.
    /// Returns the emitted value, or `None` when nothing was written.
    pub fn emit_if_safe(&mut self) -> io::Result<Option<Value>> {
        if self.poisoned {
            return Ok(None);
        }
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };
        if !self.is_safe(&pending) {
            self.pending = Some(pending);
            return Ok(None);
        }

        if self.last_emitted.as_ref() == Some(&pending.value) {
            debug!("state unchanged since last emit; skipping");
            return Ok(None);
        }

        let mut line = serde_json::to_vec(&pending.value)?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.out.flush()?;

        self.emitted += 1;
        debug!(emitted = self.emitted, "state emitted");
        self.last_emitted = Some(pending.value.clone());
        Ok(Some(pending.value))
    }

    /// Stop emitting. Called once a write has failed for good, so no
    /// state covering the lost records can ever be written.
    pub fn poison(&mut self) {
        if !self.poisoned {
            warn!("checkpoint emission halted after write failure");
        }
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// States written so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Run `f` against the shared emitter on the blocking pool. Output is a
/// plain `Write` that may stall on a slow reader, and async workers must
/// not park while it does.
pub async fn with_emitter<T, F>(shared: &SharedEmitter, f: F) -> io::Result<T>
where
    F: FnOnce(&mut CheckpointEmitter) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || f(&mut CheckpointEmitter::lock(&shared)))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn marks(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(s, q)| (s.to_string(), *q)).collect()
    }

    #[test]
    fn state_waits_for_every_stream() {
        let sink = Sink::default();
        let mut emitter = CheckpointEmitter::new(sink.clone());

        emitter.record_state(json!({"bookmark": 1}), marks(&[("a", 3), ("b", 5)]));
        emitter.mark_durable("a", 3);
        assert_eq!(emitter.emit_if_safe().unwrap(), None);

        emitter.mark_durable("b", 5);
        assert_eq!(emitter.emit_if_safe().unwrap(), Some(json!({"bookmark": 1})));
        assert_eq!(sink.lines(), vec![json!({"bookmark": 1})]);
        assert!(!emitter.has_pending());
    }

    #[test]
    fn state_with_no_records_is_immediately_safe() {
        let sink = Sink::default();
        let mut emitter = CheckpointEmitter::new(sink.clone());

        emitter.record_state(json!({"v": 1}), HashMap::new());

        assert!(emitter.emit_if_safe().unwrap().is_some());
    }

    #[test]
    fn newer_state_supersedes_older() {
        let sink = Sink::default();
        let mut emitter = CheckpointEmitter::new(sink.clone());

        emitter.record_state(json!({"v": 1}), marks(&[("a", 1)]));
        emitter.record_state(json!({"v": 2}), marks(&[("a", 2)]));
        emitter.mark_durable("a", 2);
        emitter.emit_if_safe().unwrap();

        assert_eq!(sink.lines(), vec![json!({"v": 2})]);
    }

    #[test]
    fn identical_states_are_written_once() {
        let sink = Sink::default();
        let mut emitter = CheckpointEmitter::new(sink.clone());

        for _ in 0..2 {
            emitter.record_state(json!({"v": 1}), HashMap::new());
            emitter.emit_if_safe().unwrap();
        }

        assert_eq!(emitter.emitted(), 1);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn poisoned_emitter_writes_nothing() {
        let sink = Sink::default();
        let mut emitter = CheckpointEmitter::new(sink.clone());

        emitter.record_state(json!({"v": 1}), HashMap::new());
        emitter.poison();

        assert_eq!(emitter.emit_if_safe().unwrap(), None);
        assert!(sink.lines().is_empty());
        assert!(emitter.is_poisoned());
    }

    #[test]
    fn durability_never_moves_backwards() {
        let mut emitter = CheckpointEmitter::new(io::sink());

        emitter.mark_durable("a", 10);
        emitter.mark_durable("a", 4);
        emitter.record_state(json!({"v": 1}), marks(&[("a", 8)]));

        assert!(emitter.emit_if_safe().unwrap().is_some());
    }

    #[derive(Clone)]
    struct ThreadRecorder(Arc<Mutex<Vec<std::thread::ThreadId>>>);

    impl Write for ThreadRecorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().push(std::thread::current().id());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn shared_emitter_writes_off_the_async_thread() {
        let writers = Arc::new(Mutex::new(Vec::new()));
        let shared = CheckpointEmitter::new(ThreadRecorder(writers.clone())).shared();

        let emitted = with_emitter(&shared, |emitter| {
            emitter.record_state(json!({"v": 1}), HashMap::new());
            emitter.emit_if_safe()
        })
        .await
        .unwrap();

        assert_eq!(emitted, Some(json!({"v": 1})));
        let writers = writers.lock().unwrap();
        assert!(!writers.is_empty());
        assert!(writers.iter().all(|id| *id != std::thread::current().id()));
    }
}
