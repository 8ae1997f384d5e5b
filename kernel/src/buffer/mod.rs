// Batch Buffer
//
// Per-stream record accumulation and flush timing. The buffer never
// drains itself: records stay put until the owner reports a durable
// write through `mark_flushed`.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::schema::Record;

/// A validated record waiting for its flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    /// Position of the record in the input stream.
    pub seq: u64,
    pub record: Record,
    /// Approximate encoded size.
    pub bytes: usize,
}

/// Thresholds that trigger a flush. Whichever is met first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_age: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_bytes: 64 * 1024 * 1024,
            max_age: Duration::from_secs(60),
        }
    }
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    RecordCount,
    ByteSize,
    Age,
    SchemaChange,
    Drain,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::RecordCount => "record_count",
            FlushTrigger::ByteSize => "byte_size",
            FlushTrigger::Age => "age",
            FlushTrigger::SchemaChange => "schema_change",
            FlushTrigger::Drain => "drain",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct StreamBuffer {
    stream: String,
    policy: FlushPolicy,
    records: Vec<BufferedRecord>,
    bytes: usize,
    last_flush: Instant,
}

impl StreamBuffer {
    pub fn new(stream: impl Into<String>, policy: FlushPolicy) -> Self {
        Self {
            stream: stream.into(),
            policy,
            records: Vec::new(),
            bytes: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Add a record and report whether a flush is now due.
    pub fn append(&mut self, record: BufferedRecord) -> Option<FlushTrigger> {
        self.bytes += record.bytes;
        self.records.push(record);
        self.check(Instant::now())
    }

    /// Flush decision for the current contents at `now`.
    pub fn check(&self, now: Instant) -> Option<FlushTrigger> {
        if self.records.is_empty() {
            return None;
        }
        if self.records.len() >= self.policy.max_records {
            return Some(FlushTrigger::RecordCount);
        }
        if self.bytes >= self.policy.max_bytes {
            return Some(FlushTrigger::ByteSize);
        }
        if now.saturating_duration_since(self.last_flush) >= self.policy.max_age {
            return Some(FlushTrigger::Age);
        }
        None
    }

    /// Records not yet durably written, in arrival order.
    pub fn pending(&self) -> &[BufferedRecord] {
        &self.records
    }

    /// Clear the buffer after a durable write. Returns the highest
    /// sequence number that was flushed.
    pub fn mark_flushed(&mut self, now: Instant) -> Option<u64> {
        let last = self.records.last().map(|r| r.seq);
        self.records.clear();
        self.bytes = 0;
        self.last_flush = now;
        last
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }
}
