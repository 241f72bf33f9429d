//! Intake queue and persistence worker shared by both logger backends.
//!
//! Producers push [`PendingEvent`]s into a bounded queue. A single worker
//! thread drains it in FIFO order and hands each event to an [`EventSink`],
//! so sink writes never overlap and the sink's sequence counter has one
//! owner. Closing the queue is the shutdown signal: the worker persists
//! what is left, closes the sink and exits.

use super::{ErrorStream, FailurePolicy, LoggerOptions};
use crate::error::{KvsError, Result};
use crate::types::{LoggerState, PendingEvent, Sequence};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, trace, warn};

/// Durable destination for events, owned by the persistence worker.
pub(crate) trait EventSink: Send + 'static {
    /// Persist one event and return the sequence it was stored under.
    fn append(&mut self, event: &PendingEvent) -> Result<Sequence>;

    /// Flush and release the sink after the queue has drained.
    fn close(&mut self) -> Result<()>;
}

pub(crate) struct Pipeline {
    backend: &'static str,
    queue_capacity: usize,
    failure_policy: FailurePolicy,
    intake: RwLock<Option<Sender<PendingEvent>>>,
    errors_tx: Sender<KvsError>,
    errors_rx: Receiver<KvsError>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<Mutex<LoggerState>>,
}

impl Pipeline {
    pub(crate) fn new(
        backend: &'static str,
        options: &LoggerOptions,
        default_policy: FailurePolicy,
    ) -> Self {
        let (errors_tx, errors_rx) = bounded(options.error_capacity.max(1));

        Self {
            backend,
            queue_capacity: options.queue_capacity.max(1),
            failure_policy: options.failure_policy.unwrap_or(default_policy),
            intake: RwLock::new(None),
            errors_tx,
            errors_rx,
            worker: Mutex::new(None),
            state: Arc::new(Mutex::new(LoggerState::Idle)),
        }
    }

    pub(crate) fn state(&self) -> LoggerState {
        *self.state.lock()
    }

    pub(crate) fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub(crate) fn errors(&self) -> ErrorStream {
        ErrorStream::new(self.errors_rx.clone())
    }

    /// Fail unless the worker has never been started.
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        match self.state() {
            LoggerState::Idle => Ok(()),
            LoggerState::Running => Err(KvsError::AlreadyRunning),
            LoggerState::Stopped => Err(KvsError::LoggerClosed),
        }
    }

    /// Spawn the persistence worker around `sink`.
    pub(crate) fn start<S: EventSink>(&self, sink: S) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LoggerState::Idle => {}
            LoggerState::Running => return Err(KvsError::AlreadyRunning),
            LoggerState::Stopped => return Err(KvsError::LoggerClosed),
        }

        let (intake_tx, intake_rx) = bounded(self.queue_capacity);
        let worker = Worker {
            backend: self.backend,
            intake: intake_rx,
            sink,
            errors: self.errors_tx.clone(),
            policy: self.failure_policy,
            state: Arc::clone(&self.state),
        };

        let handle = thread::Builder::new()
            .name(format!("kvs-{}-writer", self.backend))
            .spawn(move || worker.run())?;

        *self.intake.write() = Some(intake_tx);
        *self.worker.lock() = Some(handle);
        *state = LoggerState::Running;

        info!(
            backend = self.backend,
            queue_capacity = self.queue_capacity,
            policy = ?self.failure_policy,
            "transaction logger running"
        );
        Ok(())
    }

    /// Queue an event, blocking while the queue is full.
    pub(crate) fn submit(&self, event: PendingEvent) -> Result<()> {
        let sender = self.intake.read().clone();
        let sender = match (sender, self.state()) {
            (Some(sender), LoggerState::Running) => sender,
            (_, LoggerState::Idle) => return Err(KvsError::NotRunning),
            // Stopped by a failed write or a dead worker
            _ => return Err(KvsError::LoggerClosed),
        };

        sender.send(event).map_err(|_| KvsError::LoggerClosed)
    }

    /// Close the queue and wait for the worker to drain it. Idempotent.
    pub(crate) fn shutdown(&self) -> Result<()> {
        // Producers holding a clone finish their send; the worker sees the
        // disconnect once the last clone is gone.
        let sender = self.intake.write().take();
        drop(sender);

        let handle = self.worker.lock().take();
        *self.state.lock() = LoggerState::Stopped;

        if let Some(handle) = handle {
            handle.join().map_err(|_| KvsError::WorkerPanicked)?;
            info!(backend = self.backend, "transaction logger shut down");
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Best-effort drain on drop
        let _ = self.shutdown();
    }
}

struct Worker<S> {
    backend: &'static str,
    intake: Receiver<PendingEvent>,
    sink: S,
    errors: Sender<KvsError>,
    policy: FailurePolicy,
    state: Arc<Mutex<LoggerState>>,
}

/// Marks the logger stopped however the worker exits.
struct ExitGuard {
    backend: &'static str,
    state: Arc<Mutex<LoggerState>>,
    errors: Sender<KvsError>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        *self.state.lock() = LoggerState::Stopped;
        if thread::panicking() {
            error!(backend = self.backend, "persistence worker panicked");
            let _ = self.errors.try_send(KvsError::WorkerPanicked);
        }
    }
}

impl<S: EventSink> Worker<S> {
    fn run(mut self) {
        let _guard = ExitGuard {
            backend: self.backend,
            state: Arc::clone(&self.state),
            errors: self.errors.clone(),
        };
        let mut written = 0u64;
        let mut failed = 0u64;

        while let Ok(event) = self.intake.recv() {
            match self.sink.append(&event) {
                Ok(sequence) => {
                    written += 1;
                    trace!(
                        backend = self.backend,
                        sequence = sequence.0,
                        kind = %event.event_type,
                        key = %event.key,
                        "event persisted"
                    );
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        backend = self.backend,
                        key = %event.key,
                        error = %e,
                        "failed to persist event"
                    );
                    // Refuse new writes before anyone can observe the error
                    let stop = self.policy == FailurePolicy::Stop;
                    if stop {
                        *self.state.lock() = LoggerState::Stopped;
                    }
                    self.report(KvsError::PersistenceWrite {
                        backend: self.backend,
                        reason: e.to_string(),
                    });

                    if stop {
                        let discarded = self.intake.len();
                        if discarded > 0 {
                            warn!(
                                backend = self.backend,
                                discarded, "persistence worker stopping with queued events"
                            );
                        }
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.sink.close() {
            error!(backend = self.backend, error = %e, "failed to close transaction log");
            self.report(KvsError::PersistenceWrite {
                backend: self.backend,
                reason: e.to_string(),
            });
        }

        info!(
            backend = self.backend,
            written, failed, "persistence worker stopped"
        );
    }

    /// Forward an error to the orchestrator without ever blocking the worker.
    fn report(&self, err: KvsError) {
        match self.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                warn!(backend = self.backend, error = %err, "error stream full; dropping error");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, EventType};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    /// Sink that records events and can hold the worker at a gate.
    struct RecordingSink {
        next: Sequence,
        written: Arc<Mutex<Vec<Event>>>,
        closed: Arc<Mutex<bool>>,
        entered: Option<Sender<String>>,
        gate: Option<Receiver<()>>,
        fail_key: Option<&'static str>,
        panic_key: Option<&'static str>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                next: Sequence(0),
                written: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
                entered: None,
                gate: None,
                fail_key: None,
                panic_key: None,
            }
        }
    }

    impl EventSink for RecordingSink {
        fn append(&mut self, event: &PendingEvent) -> Result<Sequence> {
            if let Some(entered) = &self.entered {
                let _ = entered.send(event.key.clone());
            }
            if let Some(gate) = &self.gate {
                // A dropped gate lets everything through
                let _ = gate.recv();
            }
            if self.fail_key == Some(event.key.as_str()) {
                return Err(KvsError::Io(std::io::Error::other("disk full")));
            }
            if self.panic_key == Some(event.key.as_str()) {
                panic!("sink exploded on {}", event.key);
            }

            self.next = Sequence(self.next.0 + 1);
            self.written.lock().push(event.clone().into_event(self.next));
            Ok(self.next)
        }

        fn close(&mut self) -> Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    fn put(key: &str) -> PendingEvent {
        PendingEvent::new(EventType::Put, key, "v").unwrap()
    }

    fn options(queue_capacity: usize, policy: FailurePolicy) -> LoggerOptions {
        LoggerOptions {
            queue_capacity,
            failure_policy: Some(policy),
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_before_start() {
        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Stop);
        assert!(matches!(pipeline.submit(put("a")), Err(KvsError::NotRunning)));
        assert_eq!(pipeline.state(), LoggerState::Idle);
    }

    #[test]
    fn test_start_twice() {
        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Stop);
        pipeline.start(RecordingSink::new()).unwrap();

        let again = pipeline.start(RecordingSink::new());
        assert!(matches!(again, Err(KvsError::AlreadyRunning)));
        assert!(matches!(pipeline.ensure_idle(), Err(KvsError::AlreadyRunning)));
    }

    #[test]
    fn test_shutdown_drains_queue_in_order() {
        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Stop);
        let sink = RecordingSink::new();
        let written = Arc::clone(&sink.written);
        let closed = Arc::clone(&sink.closed);
        pipeline.start(sink).unwrap();

        for i in 0..50 {
            pipeline.submit(put(&format!("k{}", i))).unwrap();
        }
        pipeline.shutdown().unwrap();

        let written = written.lock();
        assert_eq!(written.len(), 50);
        for (i, event) in written.iter().enumerate() {
            assert_eq!(event.sequence, Sequence(i as u64 + 1));
            assert_eq!(event.key, format!("k{}", i));
        }
        assert!(*closed.lock());

        assert_eq!(pipeline.state(), LoggerState::Stopped);
        assert!(matches!(pipeline.submit(put("late")), Err(KvsError::LoggerClosed)));
        assert!(matches!(
            pipeline.start(RecordingSink::new()),
            Err(KvsError::LoggerClosed)
        ));

        // Second shutdown is a no-op
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let (entered_tx, entered_rx) = unbounded();
        let (gate_tx, gate_rx) = bounded::<()>(0);

        let mut sink = RecordingSink::new();
        sink.entered = Some(entered_tx);
        sink.gate = Some(gate_rx);
        let written = Arc::clone(&sink.written);

        let pipeline = Arc::new(Pipeline::new(
            "test",
            &options(16, FailurePolicy::Stop),
            FailurePolicy::Stop,
        ));
        pipeline.start(sink).unwrap();

        // The worker takes the first event and parks at the gate
        pipeline.submit(put("k0")).unwrap();
        assert_eq!(
            entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "k0"
        );

        // Sixteen more fill the queue without blocking
        for i in 1..=16 {
            pipeline.submit(put(&format!("k{}", i))).unwrap();
        }

        let (done_tx, done_rx) = bounded(1);
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                pipeline.submit(put("k17")).unwrap();
                done_tx.send(()).unwrap();
            })
        };

        // Queue is full, so the next submission waits for the worker
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        // Let one event through; that frees a slot
        gate_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();

        drop(gate_tx);
        pipeline.shutdown().unwrap();

        let written = written.lock();
        assert_eq!(written.len(), 18);
        assert_eq!(written[17].key, "k17");
        assert_eq!(written[17].sequence, Sequence(18));
    }

    #[test]
    fn test_fail_stop_discards_rest() {
        let mut sink = RecordingSink::new();
        sink.fail_key = Some("bad");
        let written = Arc::clone(&sink.written);

        let pipeline = Pipeline::new(
            "test",
            &options(16, FailurePolicy::Stop),
            FailurePolicy::Continue,
        );
        assert_eq!(pipeline.failure_policy(), FailurePolicy::Stop);
        let errors = pipeline.errors();
        pipeline.start(sink).unwrap();

        pipeline.submit(put("ok")).unwrap();
        pipeline.submit(put("bad")).unwrap();
        // Refused instead if the worker has already stopped
        let _ = pipeline.submit(put("after"));

        let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(err, KvsError::PersistenceWrite { backend: "test", .. }));

        pipeline.shutdown().unwrap();
        let keys: Vec<String> = written.lock().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["ok"]);
    }

    #[test]
    fn test_fail_stop_refuses_later_writes() {
        let mut sink = RecordingSink::new();
        sink.fail_key = Some("bad");

        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Stop);
        let errors = pipeline.errors();
        pipeline.start(sink).unwrap();

        pipeline.submit(put("bad")).unwrap();
        assert!(errors.recv_timeout(Duration::from_secs(5)).is_some());

        assert_eq!(pipeline.state(), LoggerState::Stopped);
        assert!(matches!(pipeline.submit(put("late")), Err(KvsError::LoggerClosed)));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_worker_panic_marks_logger_stopped() {
        let mut sink = RecordingSink::new();
        sink.panic_key = Some("boom");
        let written = Arc::clone(&sink.written);

        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Continue);
        let errors = pipeline.errors();
        pipeline.start(sink).unwrap();

        pipeline.submit(put("ok")).unwrap();
        pipeline.submit(put("boom")).unwrap();

        let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(err, KvsError::WorkerPanicked));
        assert_eq!(pipeline.state(), LoggerState::Stopped);
        assert!(matches!(pipeline.submit(put("late")), Err(KvsError::LoggerClosed)));
        assert!(matches!(pipeline.shutdown(), Err(KvsError::WorkerPanicked)));

        let keys: Vec<String> = written.lock().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["ok"]);
    }

    #[test]
    fn test_fail_open_keeps_draining() {
        let mut sink = RecordingSink::new();
        sink.fail_key = Some("bad");
        let written = Arc::clone(&sink.written);

        let pipeline = Pipeline::new("test", &LoggerOptions::default(), FailurePolicy::Continue);
        let errors = pipeline.errors();
        pipeline.start(sink).unwrap();

        pipeline.submit(put("ok")).unwrap();
        pipeline.submit(put("bad")).unwrap();
        pipeline.submit(put("after")).unwrap();

        assert!(errors.recv_timeout(Duration::from_secs(5)).is_some());
        assert_eq!(pipeline.state(), LoggerState::Running);

        pipeline.shutdown().unwrap();
        let keys: Vec<String> = written.lock().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["ok", "after"]);
        assert!(errors.drain().is_empty());
    }

    #[test]
    fn test_error_overflow_never_blocks_worker() {
        let mut sink = RecordingSink::new();
        sink.fail_key = Some("bad");

        let pipeline = Pipeline::new(
            "test",
            &LoggerOptions {
                error_capacity: 1,
                ..Default::default()
            },
            FailurePolicy::Continue,
        );
        let errors = pipeline.errors();
        pipeline.start(sink).unwrap();

        for _ in 0..5 {
            pipeline.submit(put("bad")).unwrap();
        }
        pipeline.shutdown().unwrap();

        assert_eq!(errors.drain().len(), 1);
    }
}
