//! The host-harness capability surface.
//!
//! The engine never talks to the harness directly; everything goes through
//! [`Reporter`], a wide capability trait the bundled reporters implement and
//! the recording reporter wraps. Composition only: a recording reporter holds
//! another `Reporter`, and `run` hands out a fresh one per sub-case.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::report;
use crate::sandbox::{self, FailNowSignal, Outcome, SkipNowSignal};
use crate::types::TestOutcome;

pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// What a test case may ask of its harness.
///
/// Formatted variants (`logf`, `errorf`, ...) are deliberately absent: build
/// the message with `format!` at the call site. The diverging methods
/// (`fatal`, `fail_now`, `skip`, `skip_now`) end the current test block by
/// unwinding; the engine absorbs that unwind at its sandbox boundaries so
/// teardowns still run.
pub trait Reporter: Send + Sync {
    /// The sub-test path of the current case.
    fn name(&self) -> String;

    fn log(&self, msg: &str);

    /// Reports a failure and marks the case failed, without stopping it.
    fn error(&self, msg: &str);

    /// `error` followed by `fail_now`.
    fn fatal(&self, msg: &str) -> ! {
        self.error(msg);
        self.fail_now()
    }

    /// Marks the case failed without a message.
    fn fail(&self);

    /// Marks the case failed and ends the test block.
    fn fail_now(&self) -> !;

    fn failed(&self) -> bool;

    /// Logs a reason, marks the case skipped, and ends the test block.
    fn skip(&self, msg: &str) -> ! {
        self.log(msg);
        self.skip_now()
    }

    /// Marks the case skipped and ends the test block.
    fn skip_now(&self) -> !;

    fn skipped(&self) -> bool;

    /// Registers a callback to run when the case (or suite) finishes.
    /// Callbacks run in reverse registration order.
    fn cleanup(&self, f: CleanupFn);

    /// Marks the calling function as a helper. Purely advisory.
    fn helper(&self) {}

    /// A fresh directory that lives at least as long as the current case.
    fn temp_dir(&self) -> PathBuf;

    /// Sets an environment variable and restores the previous value via
    /// `cleanup`. Not safe under parallel cases; prefer scope variables.
    fn set_env(&self, key: &str, value: &str);

    /// Runs `block` as a named sub-case; returns `true` when it passed.
    fn run(&self, name: &str, block: Box<dyn FnOnce(Arc<dyn Reporter>) + '_>) -> bool;
}

// ---------------------------------------------------------------------------
// shared per-node reporter state
// ---------------------------------------------------------------------------

struct NodeState {
    name: String,
    failed: AtomicBool,
    skipped: AtomicBool,
    cleanups: Mutex<Vec<CleanupFn>>,
    temp_dirs: Mutex<Vec<tempfile::TempDir>>,
}

impl NodeState {
    fn new(name: String) -> Self {
        NodeState {
            name,
            failed: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
            temp_dirs: Mutex::new(Vec::new()),
        }
    }

    fn child_name(&self, name: &str) -> String {
        if self.name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.name, name)
        }
    }

    fn temp_dir(&self) -> PathBuf {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();
        lock(&self.temp_dirs).push(dir);
        path
    }

    fn set_env(&self, key: &str, value: &str) {
        let key = key.to_string();
        let prev = std::env::var_os(&key);
        // Process-global mutation; the cleanup below restores it. SAFETY:
        // callers are warned off set_env in parallel cases.
        unsafe { std::env::set_var(&key, value) };
        lock(&self.cleanups).push(Box::new(move || unsafe {
            match prev {
                Some(v) => std::env::set_var(&key, v),
                None => std::env::remove_var(&key),
            }
        }));
    }

    /// Drains cleanups in reverse registration order, isolating each one.
    /// Returns `true` when one of them panicked.
    fn drain_cleanups(&self) -> bool {
        let mut saw_panic = false;
        loop {
            let next = lock(&self.cleanups).pop();
            let Some(f) = next else { break };
            if matches!(sandbox::run(f), Outcome::Panicked(_)) {
                saw_panic = true;
            }
        }
        saw_panic
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// HarnessReporter: the default host adapter
// ---------------------------------------------------------------------------

/// The bundled host adapter: prints styled result lines, allocates
/// real temp directories, and tracks failure per sub-case.
#[derive(Clone)]
pub struct HarnessReporter {
    state: Arc<NodeState>,
}

impl HarnessReporter {
    pub fn new(name: &str) -> Self {
        HarnessReporter {
            state: Arc::new(NodeState::new(name.to_string())),
        }
    }

    pub fn as_reporter(&self) -> Arc<dyn Reporter> {
        Arc::new(self.clone())
    }
}

impl Reporter for HarnessReporter {
    fn name(&self) -> String {
        self.state.name.clone()
    }

    fn log(&self, msg: &str) {
        report::print_message(msg);
    }

    fn error(&self, msg: &str) {
        report::print_failure(msg);
        self.fail();
    }

    fn fail(&self) {
        self.state.failed.store(true, Ordering::SeqCst);
    }

    fn fail_now(&self) -> ! {
        self.fail();
        std::panic::panic_any(FailNowSignal)
    }

    fn failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }

    fn skip_now(&self) -> ! {
        self.state.skipped.store(true, Ordering::SeqCst);
        std::panic::panic_any(SkipNowSignal)
    }

    fn skipped(&self) -> bool {
        self.state.skipped.load(Ordering::SeqCst)
    }

    fn cleanup(&self, f: CleanupFn) {
        lock(&self.state.cleanups).push(f);
    }

    fn temp_dir(&self) -> PathBuf {
        self.state.temp_dir()
    }

    fn set_env(&self, key: &str, value: &str) {
        self.state.set_env(key, value);
    }

    fn run(&self, name: &str, block: Box<dyn FnOnce(Arc<dyn Reporter>) + '_>) -> bool {
        let child = HarnessReporter {
            state: Arc::new(NodeState::new(self.state.child_name(name))),
        };
        let start = Instant::now();

        let outcome = sandbox::run(|| block(child.as_reporter()));
        if let Outcome::Panicked(payload) = &outcome {
            report::print_failure(&sandbox::panic_message(payload));
            child.fail();
        }
        if child.state.drain_cleanups() {
            child.fail();
        }

        let result = if child.failed() {
            TestOutcome::Failed
        } else if child.skipped() {
            TestOutcome::Skipped
        } else {
            TestOutcome::Passed
        };
        report::print_case_result(&child.state.name, &result, start.elapsed());

        if child.failed() {
            self.fail();
        }
        !child.failed()
    }
}

// ---------------------------------------------------------------------------
// NullReporter: a silent terminal reporter, mostly for tests
// ---------------------------------------------------------------------------

/// A reporter that swallows output and remembers what it saw. The engine's
/// own tests run whole suites against it to observe failures without failing
/// the host test.
#[derive(Clone)]
pub struct NullReporter {
    state: Arc<NodeState>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl NullReporter {
    pub fn new() -> Self {
        NullReporter {
            state: Arc::new(NodeState::new(String::new())),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn as_reporter(&self) -> Arc<dyn Reporter> {
        Arc::new(self.clone())
    }

    /// Every `log` and `error` message observed, in order, including those
    /// of sub-cases.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl Default for NullReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for NullReporter {
    fn name(&self) -> String {
        self.state.name.clone()
    }

    fn log(&self, msg: &str) {
        lock(&self.messages).push(msg.to_string());
    }

    fn error(&self, msg: &str) {
        lock(&self.messages).push(msg.to_string());
        self.fail();
    }

    fn fail(&self) {
        self.state.failed.store(true, Ordering::SeqCst);
    }

    fn fail_now(&self) -> ! {
        self.fail();
        std::panic::panic_any(FailNowSignal)
    }

    fn failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }

    fn skip_now(&self) -> ! {
        self.state.skipped.store(true, Ordering::SeqCst);
        std::panic::panic_any(SkipNowSignal)
    }

    fn skipped(&self) -> bool {
        self.state.skipped.load(Ordering::SeqCst)
    }

    fn cleanup(&self, f: CleanupFn) {
        lock(&self.state.cleanups).push(f);
    }

    fn temp_dir(&self) -> PathBuf {
        self.state.temp_dir()
    }

    fn set_env(&self, key: &str, value: &str) {
        self.state.set_env(key, value);
    }

    fn run(&self, name: &str, block: Box<dyn FnOnce(Arc<dyn Reporter>) + '_>) -> bool {
        let child = NullReporter {
            state: Arc::new(NodeState::new(self.state.child_name(name))),
            messages: Arc::clone(&self.messages),
        };
        let outcome = sandbox::run(|| block(child.as_reporter()));
        if let Outcome::Panicked(payload) = &outcome {
            child.error(&sandbox::panic_message(payload));
        }
        if child.state.drain_cleanups() {
            child.fail();
        }
        if child.failed() {
            self.fail();
        }
        !child.failed()
    }
}
