//! A reporter that records assertion events for later replay.
//!
//! The recorder wraps another [`Reporter`] and buffers everything that
//! happens to it as replayable records. The retry engine runs every attempt
//! against a buffered recorder so a transient failure can be discarded; only
//! the last attempt's evidence is forwarded to the real reporter. Sub-case
//! composition (`run`) and contract suites build on the same mechanism.

use std::panic::panic_any;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::reporter::{CleanupFn, Reporter, lock};
use crate::sandbox::{self, FailNowSignal, Outcome, SkipNowSignal};

enum Event {
    Log(String),
    Error(String),
    Fail,
    FailNow,
    SkipNow,
    Helper,
    Cleanup(Option<CleanupFn>),
}

struct Record {
    event: Event,
    replayed: bool,
}

struct RecState {
    records: Vec<Record>,
    passthrough: bool,
    failed: bool,
    skipped: bool,
}

struct RecShared {
    inner: Arc<dyn Reporter>,
    name: String,
    state: Mutex<RecState>,
}

/// Records every reporter call as a replayable entry.
///
/// Two modes:
/// - **passthrough**: every event is forwarded to the wrapped reporter as it
///   is recorded; the recorder is transparent.
/// - **buffered**: events only take local effect (`fail_now` still ends the
///   test block); nothing reaches the wrapped reporter until [`replay`] or
///   [`cleanup_now`].
///
/// Handles are cheap clones of shared state, so a recorder can wrap itself
/// for sub-cases.
///
/// [`replay`]: RecordingReporter::replay
/// [`cleanup_now`]: RecordingReporter::cleanup_now
#[derive(Clone)]
pub struct RecordingReporter {
    shared: Arc<RecShared>,
}

impl RecordingReporter {
    pub fn passthrough(inner: Arc<dyn Reporter>) -> Self {
        Self::with_mode(inner, true)
    }

    pub fn buffered(inner: Arc<dyn Reporter>) -> Self {
        Self::with_mode(inner, false)
    }

    fn with_mode(inner: Arc<dyn Reporter>, passthrough: bool) -> Self {
        let name = inner.name();
        Self::with_mode_named(inner, name, passthrough)
    }

    fn with_mode_named(inner: Arc<dyn Reporter>, name: String, passthrough: bool) -> Self {
        RecordingReporter {
            shared: Arc::new(RecShared {
                inner,
                name,
                state: Mutex::new(RecState {
                    records: Vec::new(),
                    passthrough,
                    failed: false,
                    skipped: false,
                }),
            }),
        }
    }

    pub fn as_reporter(&self) -> Arc<dyn Reporter> {
        Arc::new(self.clone())
    }

    /// Records `event`; in passthrough mode forwards it to the wrapped
    /// reporter immediately (and marks it replayed so `replay` won't repeat
    /// it).
    fn record(&self, event: Event) {
        let mut st = lock(&self.shared.state);
        let passthrough = st.passthrough;
        if passthrough {
            st.records.push(Record {
                event: forwarded_placeholder(&event),
                replayed: true,
            });
            drop(st);
            self.forward(event);
        } else {
            st.records.push(Record {
                event,
                replayed: false,
            });
        }
    }

    fn forward(&self, event: Event) {
        let inner = &self.shared.inner;
        match event {
            Event::Log(msg) => inner.log(&msg),
            Event::Error(msg) => inner.error(&msg),
            Event::Fail => inner.fail(),
            Event::FailNow => inner.fail_now(),
            Event::SkipNow => inner.skip_now(),
            Event::Helper => inner.helper(),
            Event::Cleanup(f) => {
                if let Some(f) = f {
                    inner.cleanup(f);
                }
            }
        }
    }

    /// Forwards every not-yet-replayed record to the wrapped reporter, in
    /// recording order. A forwarded `fail_now` ends the calling test block,
    /// exactly as the original call would have.
    pub fn replay(&self) {
        let mut cursor = 0;
        loop {
            let event = {
                let mut st = lock(&self.shared.state);
                let next = st.records[cursor..]
                    .iter()
                    .position(|r| !r.replayed)
                    .map(|off| cursor + off);
                match next {
                    None => break,
                    Some(idx) => {
                        cursor = idx + 1;
                        take_for_replay(&mut st.records[idx])
                    }
                }
            };
            self.forward(event);
        }
    }

    /// Runs the recorded cleanup callbacks now, newest first, with
    /// passthrough temporarily enabled so failures inside a cleanup reach the
    /// wrapped reporter. Already-replayed cleanups never run twice.
    pub fn cleanup_now(&self) {
        let was_passthrough = {
            let mut st = lock(&self.shared.state);
            std::mem::replace(&mut st.passthrough, true)
        };
        loop {
            let f = {
                let mut st = lock(&self.shared.state);
                let mut found = None;
                for record in st.records.iter_mut().rev() {
                    if record.replayed {
                        continue;
                    }
                    if let Event::Cleanup(slot) = &mut record.event {
                        record.replayed = true;
                        found = slot.take();
                        break;
                    }
                }
                found
            };
            let Some(f) = f else { break };
            if let Outcome::Panicked(payload) = sandbox::run(f) {
                self.shared.inner.error(&sandbox::panic_message(&payload));
                lock(&self.shared.state).failed = true;
            }
        }
        lock(&self.shared.state).passthrough = was_passthrough;
    }
}

/// Replaces closure-bearing events with an inert marker for the passthrough
/// bookkeeping copy.
fn forwarded_placeholder(event: &Event) -> Event {
    match event {
        Event::Log(m) => Event::Log(m.clone()),
        Event::Error(m) => Event::Error(m.clone()),
        Event::Fail => Event::Fail,
        Event::FailNow => Event::FailNow,
        Event::SkipNow => Event::SkipNow,
        Event::Helper => Event::Helper,
        Event::Cleanup(_) => Event::Cleanup(None),
    }
}

fn take_for_replay(record: &mut Record) -> Event {
    record.replayed = true;
    match &mut record.event {
        Event::Log(m) => Event::Log(m.clone()),
        Event::Error(m) => Event::Error(m.clone()),
        Event::Fail => Event::Fail,
        Event::FailNow => Event::FailNow,
        Event::SkipNow => Event::SkipNow,
        Event::Helper => Event::Helper,
        Event::Cleanup(slot) => Event::Cleanup(slot.take()),
    }
}

impl Reporter for RecordingReporter {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn log(&self, msg: &str) {
        self.record(Event::Log(msg.to_string()));
    }

    fn error(&self, msg: &str) {
        lock(&self.shared.state).failed = true;
        self.record(Event::Error(msg.to_string()));
    }

    fn fail(&self) {
        lock(&self.shared.state).failed = true;
        self.record(Event::Fail);
    }

    fn fail_now(&self) -> ! {
        let passthrough = {
            let mut st = lock(&self.shared.state);
            st.failed = true;
            st.passthrough
        };
        if passthrough {
            let mut st = lock(&self.shared.state);
            st.records.push(Record {
                event: Event::FailNow,
                replayed: true,
            });
            drop(st);
            self.shared.inner.fail_now()
        } else {
            lock(&self.shared.state).records.push(Record {
                event: Event::FailNow,
                replayed: false,
            });
            panic_any(FailNowSignal)
        }
    }

    fn failed(&self) -> bool {
        let st = lock(&self.shared.state);
        st.failed || (st.passthrough && self.shared.inner.failed())
    }

    fn skip_now(&self) -> ! {
        let passthrough = {
            let mut st = lock(&self.shared.state);
            st.skipped = true;
            st.passthrough
        };
        if passthrough {
            self.shared.inner.skip_now()
        } else {
            lock(&self.shared.state).records.push(Record {
                event: Event::SkipNow,
                replayed: false,
            });
            panic_any(SkipNowSignal)
        }
    }

    fn skipped(&self) -> bool {
        lock(&self.shared.state).skipped
    }

    fn cleanup(&self, f: CleanupFn) {
        let passthrough = lock(&self.shared.state).passthrough;
        if passthrough {
            self.shared.inner.cleanup(f);
        } else {
            lock(&self.shared.state).records.push(Record {
                event: Event::Cleanup(Some(f)),
                replayed: false,
            });
        }
    }

    fn helper(&self) {
        self.record(Event::Helper);
    }

    fn temp_dir(&self) -> PathBuf {
        self.shared.inner.temp_dir()
    }

    fn set_env(&self, key: &str, value: &str) {
        self.shared.inner.set_env(key, value);
    }

    /// Runs `block` as a sub-case against a child recorder, absorbs any
    /// early exit, and propagates the child's failure flag upward.
    fn run(&self, name: &str, block: Box<dyn FnOnce(Arc<dyn Reporter>) + '_>) -> bool {
        let child_name = if self.shared.name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.shared.name, name)
        };
        let child = RecordingReporter::with_mode_named(self.as_reporter(), child_name, false);
        let outcome = sandbox::run(|| block(child.as_reporter()));
        if let Outcome::Panicked(payload) = &outcome {
            child.error(&sandbox::panic_message(payload));
        }
        if child.failed() {
            self.fail();
        }
        !child.failed()
    }
}
