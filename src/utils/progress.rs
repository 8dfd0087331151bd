use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// Aggregate progress of a running operation or batch
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub items_done: u64,
    pub total_items: u64,
    pub bytes_done: u64,
    /// Known only when every item's size could be planned up front
    pub total_bytes: Option<u64>,
    pub current_item: String,
    pub status: String,
    /// 0.0 - 100.0, byte-based when `total_bytes` is known, item-based otherwise
    pub progress: f32,
}

/// Status update event for overall processing
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: String,
    pub message: String,
}

/// Receiver of progress and status events
///
/// Called from worker threads; implementations must be cheap and must not block
/// for long since they run inline with byte movement.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    fn on_status(&self, _event: &StatusEvent) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Adapts a closure into a sink
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        (self.0)(event)
    }
}

/// Message delivered through a [`ChannelSink`]
#[derive(Clone, Debug)]
pub enum ProgressMessage {
    Progress(ProgressEvent),
    Status(StatusEvent),
}

/// Forwards events to an mpsc channel. A dropped receiver is ignored.
pub struct ChannelSink {
    tx: Mutex<Sender<ProgressMessage>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ProgressMessage>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, message: ProgressMessage) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send(message);
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, event: &ProgressEvent) {
        self.send(ProgressMessage::Progress(event.clone()));
    }

    fn on_status(&self, event: &StatusEvent) {
        self.send(ProgressMessage::Status(event.clone()));
    }
}

/// Thin front over a sink with the event vocabulary the callers use
#[derive(Clone)]
pub struct ProgressEmitter {
    sink: Arc<dyn ProgressSink>,
}

impl ProgressEmitter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit_progress(&self, event: &ProgressEvent) {
        self.sink.on_progress(event);
    }

    /// Emit overall status update
    pub fn emit_status(&self, status: &str, message: String) {
        self.sink.on_status(&StatusEvent {
            status: status.to_string(),
            message,
        });
    }

    /// Emit completion event
    pub fn emit_complete(&self, message: String) {
        self.emit_status("complete", message)
    }

    /// Emit error event
    pub fn emit_error(&self, error: String) {
        self.emit_status("error", error)
    }
}

/// Monotonic aggregate progress shared by every worker of one operation
///
/// Counters only grow. Events are built and emitted under one lock so a sink
/// never observes a snapshot older than one it has already seen.
pub struct ProgressReporter {
    emitter: ProgressEmitter,
    granularity: u64,
    total_items: AtomicU64,
    /// `u64::MAX` while unknown
    total_bytes: AtomicU64,
    items_done: AtomicU64,
    bytes_done: AtomicU64,
    last_emitted_bytes: AtomicU64,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    current_item: String,
    status: String,
    /// Highest percentage handed out so far
    last_progress: f32,
}

const UNKNOWN: u64 = u64::MAX;

impl ProgressReporter {
    pub fn new(emitter: ProgressEmitter, granularity: u64) -> Self {
        Self {
            emitter,
            granularity: granularity.max(1),
            total_items: AtomicU64::new(0),
            total_bytes: AtomicU64::new(UNKNOWN),
            items_done: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            last_emitted_bytes: AtomicU64::new(0),
            state: Mutex::new(ReporterState {
                current_item: String::new(),
                status: "pending".to_string(),
                last_progress: 0.0,
            }),
        }
    }

    pub fn silent() -> Self {
        Self::new(ProgressEmitter::silent(), u64::MAX)
    }

    pub fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    /// Set the planned totals. `None` bytes switches percentages to item counts.
    pub fn set_totals(&self, items: u64, bytes: Option<u64>) {
        self.total_items.store(items, Ordering::Release);
        self.total_bytes
            .store(bytes.unwrap_or(UNKNOWN), Ordering::Release);
    }

    pub fn set_status(&self, status: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.status = status.to_string();
    }

    /// Mark the start of an entry; no event is emitted until bytes move or it finishes.
    pub fn begin_entry(&self, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current_item.clear();
        state.current_item.push_str(name);
    }

    /// Account streamed bytes, emitting once at least `granularity` bytes passed
    pub fn add_bytes(&self, n: u64) {
        if n == 0 {
            return;
        }
        let done = self.bytes_done.fetch_add(n, Ordering::AcqRel) + n;
        let last = self.last_emitted_bytes.load(Ordering::Acquire);
        if done.saturating_sub(last) >= self.granularity
            && self
                .last_emitted_bytes
                .compare_exchange(last, done, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.emit();
        }
    }

    /// Close an entry. Bytes not streamed (skipped or failed entries) are
    /// credited so the byte total stays reachable.
    pub fn finish_entry(&self, expected_bytes: u64, streamed_bytes: u64) {
        let remainder = expected_bytes.saturating_sub(streamed_bytes);
        if remainder > 0 {
            self.bytes_done.fetch_add(remainder, Ordering::AcqRel);
        }
        self.items_done.fetch_add(1, Ordering::AcqRel);
        self.last_emitted_bytes
            .store(self.bytes_done.load(Ordering::Acquire), Ordering::Release);
        self.emit();
    }

    /// Account items that will never run (aborted or failed before starting)
    pub fn credit(&self, items: u64, bytes: u64) {
        if items == 0 && bytes == 0 {
            return;
        }
        self.items_done.fetch_add(items, Ordering::AcqRel);
        let done = self.bytes_done.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.last_emitted_bytes.store(done, Ordering::Release);
        self.emit();
    }

    pub fn snapshot(&self) -> ProgressEvent {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.build(&mut state)
    }

    fn emit(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let event = self.build(&mut state);
        self.emitter.emit_progress(&event);
    }

    /// Planned totals can be estimates, so the percentage never moves backwards
    fn build(&self, state: &mut ReporterState) -> ProgressEvent {
        let items_done = self.items_done.load(Ordering::Acquire);
        let total_items = self.total_items.load(Ordering::Acquire);
        let bytes_done = self.bytes_done.load(Ordering::Acquire);
        let total_bytes = match self.total_bytes.load(Ordering::Acquire) {
            UNKNOWN => None,
            b => Some(b),
        };
        let progress = match total_bytes {
            Some(total) if total > 0 => bytes_done as f32 / total as f32 * 100.0,
            _ if total_items > 0 => items_done as f32 / total_items as f32 * 100.0,
            _ => 0.0,
        };
        let progress = progress.clamp(0.0, 100.0).max(state.last_progress);
        state.last_progress = progress;
        ProgressEvent {
            items_done,
            total_items,
            bytes_done,
            total_bytes,
            current_item: state.current_item.clone(),
            status: state.status.clone(),
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recording_reporter(granularity: u64) -> (ProgressReporter, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink = FnSink(move |e: &ProgressEvent| captured.lock().unwrap().push(e.clone()));
        let reporter = ProgressReporter::new(ProgressEmitter::new(Arc::new(sink)), granularity);
        (reporter, events)
    }

    #[test]
    fn test_emits_every_granularity_bytes() {
        let (reporter, events) = recording_reporter(100);
        reporter.set_totals(1, Some(350));
        reporter.begin_entry("a.bin");
        for _ in 0..7 {
            reporter.add_bytes(50);
        }
        assert_eq!(events.lock().unwrap().len(), 3);

        reporter.finish_entry(350, 350);
        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.items_done, 1);
        assert_eq!(last.bytes_done, 350);
        assert_eq!(last.current_item, "a.bin");
        assert!((last.progress - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_finish_entry_credits_unstreamed_bytes() {
        let (reporter, events) = recording_reporter(u64::MAX);
        reporter.set_totals(2, Some(300));
        reporter.begin_entry("skipped");
        reporter.finish_entry(200, 0);
        reporter.begin_entry("partial");
        reporter.add_bytes(40);
        reporter.finish_entry(100, 40);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes_done, 200);
        assert_eq!(events[1].bytes_done, 300);
    }

    #[test]
    fn test_item_based_when_bytes_unknown() {
        let reporter = ProgressReporter::silent();
        reporter.set_totals(4, None);
        reporter.finish_entry(0, 0);
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.total_bytes, None);
        assert!((snapshot.progress - 25.0).abs() < 0.01);
    }

    #[test]
    fn test_percentage_never_drops_when_totals_grow() {
        let reporter = ProgressReporter::silent();
        reporter.set_totals(2, None);
        reporter.credit(1, 0);
        assert!((reporter.snapshot().progress - 50.0).abs() < 0.01);
        reporter.set_totals(10, None);
        assert!((reporter.snapshot().progress - 50.0).abs() < 0.01);
        assert_eq!(reporter.snapshot().items_done, 1);
    }

    #[test]
    fn test_events_are_monotonic_across_threads() {
        let (reporter, events) = recording_reporter(10);
        let reporter = Arc::new(reporter);
        reporter.set_totals(40, Some(4000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reporter = reporter.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        reporter.add_bytes(100);
                        reporter.finish_entry(100, 100);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let events = events.lock().unwrap();
        for pair in events.windows(2) {
            assert!(pair[1].bytes_done >= pair[0].bytes_done);
            assert!(pair[1].items_done >= pair[0].items_done);
        }
        assert_eq!(reporter.snapshot().items_done, 40);
    }

    #[test]
    fn test_channel_sink_forwards_status() {
        let (tx, rx) = mpsc::channel();
        let emitter = ProgressEmitter::new(Arc::new(ChannelSink::new(tx)));
        emitter.emit_complete("done".to_string());
        match rx.recv().unwrap() {
            ProgressMessage::Status(s) => {
                assert_eq!(s.status, "complete");
                assert_eq!(s.message, "done");
            }
            other => panic!("Expected status, got {:?}", other),
        }
    }
}
