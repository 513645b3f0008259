//! Session-scoped timestamp recorder.
//!
//! A [`Recorder`] is a cheap cloneable handle; every clone appends to the same buffer.
//! Only one session may be open at a time and concurrent sessions across threads are
//! not supported: two drivers sharing a handle will interleave their events.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tracing::debug;

use crate::{
    error::RecorderError,
    trace::{TraceEvent, TraceLog},
};

pub trait Clock: Send + Sync {
    /// Monotonic time in nanoseconds.
    fn now(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[derive(Default)]
struct Session {
    events: Vec<TraceEvent>,
    last_timestamp: u64,
}

#[derive(Clone)]
pub struct Recorder {
    clock: Arc<dyn Clock>,
    session: Arc<Mutex<Option<Session>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    pub fn init(&self) -> Result<(), RecorderError> {
        let mut session = self.lock();
        if session.is_some() {
            return Err(RecorderError::AlreadyActive);
        }
        *session = Some(Session::default());
        debug!("recording session opened");
        Ok(())
    }

    pub fn record(&self, label: impl ToString) -> Result<(), RecorderError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(RecorderError::NotActive)?;
        // A clock that goes backwards or stalls is clamped so timestamps never decrease.
        let timestamp = self.clock.now().max(session.last_timestamp);
        session.last_timestamp = timestamp;
        let seq = session.events.len() as u64;
        session.events.push(TraceEvent {
            timestamp,
            seq,
            label: label.to_string(),
        });
        Ok(())
    }

    /// Records only while a session is open. Returns whether the event was kept.
    pub fn record_if_active(&self, label: impl ToString) -> Result<bool, RecorderError> {
        match self.record(label) {
            Ok(()) => Ok(true),
            Err(RecorderError::NotActive) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn finish(&self) -> Result<TraceLog, RecorderError> {
        let session = self.lock().take().ok_or(RecorderError::NotActive)?;
        debug!(events = session.events.len(), "recording session closed");
        Ok(TraceLog::new(session.events))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock advancing by a fixed step on every reading. A step of 0 models a clock
    /// too coarse to separate consecutive events.
    pub(crate) struct StepClock {
        now: AtomicU64,
        step: u64,
    }

    impl StepClock {
        pub(crate) fn new(step: u64) -> Self {
            Self {
                now: AtomicU64::new(0),
                step,
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> u64 {
            self.now.fetch_add(self.step, Ordering::Relaxed)
        }
    }

    struct BackwardsClock(AtomicU64);

    impl Clock for BackwardsClock {
        fn now(&self) -> u64 {
            self.0.fetch_sub(10, Ordering::Relaxed)
        }
    }

    #[test]
    fn test_record_without_init_fails() {
        let recorder = Recorder::new();
        assert_eq!(recorder.record("forward start fc1"), Err(RecorderError::NotActive));
    }

    #[test]
    fn test_double_init_fails() {
        let recorder = Recorder::new();
        recorder.init().unwrap();
        assert_eq!(recorder.init(), Err(RecorderError::AlreadyActive));
    }

    #[test]
    fn test_record_after_finish_fails() {
        let recorder = Recorder::new();
        recorder.init().unwrap();
        recorder.record("a").unwrap();
        let log = recorder.finish().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(recorder.record("b"), Err(RecorderError::NotActive));
        assert_eq!(recorder.finish().unwrap_err(), RecorderError::NotActive);
    }

    #[test]
    fn test_new_session_starts_empty() {
        let recorder = Recorder::new();
        recorder.init().unwrap();
        recorder.record("first").unwrap();
        recorder.finish().unwrap();

        recorder.init().unwrap();
        recorder.record("second").unwrap();
        let log = recorder.finish().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.events()[0].label, "second");
        assert_eq!(log.events()[0].seq, 0);
    }

    #[test]
    fn test_clones_share_session() {
        let recorder = Recorder::new();
        let other = recorder.clone();
        recorder.init().unwrap();
        other.record("from clone").unwrap();
        assert!(other.is_active());
        assert_eq!(recorder.finish().unwrap().count_label("from clone"), 1);
        assert!(!other.is_active());
    }

    #[test]
    fn test_record_if_active() {
        let recorder = Recorder::new();
        assert_eq!(recorder.record_if_active("dropped"), Ok(false));
        recorder.init().unwrap();
        assert_eq!(recorder.record_if_active("kept"), Ok(true));
        let log = recorder.finish().unwrap();
        assert_eq!(log.lines().len(), 1);
    }

    #[test]
    fn test_coarse_clock_keeps_program_order() {
        let recorder = Recorder::with_clock(Arc::new(StepClock::new(0)));
        recorder.init().unwrap();
        for i in 0..5 {
            recorder.record(format!("event {}", i)).unwrap();
        }
        let mut log = recorder.finish().unwrap();
        log.sort();
        let labels: Vec<_> = log.events().iter().map(|e| e.label.clone()).collect();
        assert_eq!(labels, vec!["event 0", "event 1", "event 2", "event 3", "event 4"]);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let recorder = Recorder::with_clock(Arc::new(BackwardsClock(AtomicU64::new(1_000))));
        recorder.init().unwrap();
        for _ in 0..4 {
            recorder.record("tick").unwrap();
        }
        let log = recorder.finish().unwrap();
        assert!(log
            .events()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_nested_records_keep_order() {
        let recorder = Recorder::with_clock(Arc::new(StepClock::new(1)));
        recorder.init().unwrap();
        let nested = |r: &Recorder, depth: usize| -> Result<(), RecorderError> {
            r.record(format!("enter {}", depth))?;
            r.record(format!("exit {}", depth))
        };
        recorder.record("enter outer").unwrap();
        nested(&recorder.clone(), 1).unwrap();
        recorder.record("exit outer").unwrap();
        let log = recorder.finish().unwrap();
        assert_eq!(
            log.lines(),
            vec!["0,enter outer", "1,enter 1", "2,exit 1", "3,exit outer"]
        );
    }
}
