//! The per-test-case runtime environment.
//!
//! One [`TestContext`] exists per running test case. It owns the variable
//! cache, the teardown stack, a deterministically seeded random source, and
//! a handle to the case's reporter. It is created by the runner right before
//! the hook chain is installed and discarded once the teardown stack drains.

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::FrameworkError;
use crate::reporter::{CleanupFn, Reporter};
use crate::teardown::Teardown;
use crate::var::{Var, VarDef, VarId};

/// Pauses and resumes the measured window in benchmark dispatch. Variable
/// initialization is excluded from the measurement by suspending the timer
/// around every initializer run.
pub(crate) struct BenchTimer {
    running: std::cell::Cell<bool>,
    started: std::cell::Cell<std::time::Instant>,
    total: std::cell::Cell<std::time::Duration>,
}

impl BenchTimer {
    pub(crate) fn new() -> Self {
        BenchTimer {
            running: std::cell::Cell::new(false),
            started: std::cell::Cell::new(std::time::Instant::now()),
            total: std::cell::Cell::new(std::time::Duration::ZERO),
        }
    }

    pub(crate) fn start(&self) {
        if !self.running.replace(true) {
            self.started.set(std::time::Instant::now());
        }
    }

    pub(crate) fn stop(&self) {
        if self.running.replace(false) {
            self.total
                .set(self.total.get() + self.started.get().elapsed());
        }
    }

    /// Stops the timer if it was running; returns whether it was.
    fn suspend(&self) -> bool {
        let was_running = self.running.get();
        self.stop();
        was_running
    }

    fn restore(&self, was_running: bool) {
        if was_running {
            self.start();
        }
    }

    pub(crate) fn total(&self) -> std::time::Duration {
        self.total.get()
    }
}

pub struct TestContext {
    reporter: RefCell<Arc<dyn Reporter>>,
    defs: Vec<VarDef>,
    cache: RefCell<HashMap<VarId, Box<dyn Any>>>,
    before_fired: RefCell<HashSet<VarId>>,
    super_depth: RefCell<HashMap<VarId, usize>>,
    teardown: Teardown,
    rng: RefCell<StdRng>,
    tags: BTreeSet<String>,
    timer: Option<Rc<BenchTimer>>,
}

impl TestContext {
    pub(crate) fn new(
        reporter: Arc<dyn Reporter>,
        defs: Vec<VarDef>,
        tags: BTreeSet<String>,
        rng_seed: u64,
        timer: Option<Rc<BenchTimer>>,
    ) -> Self {
        TestContext {
            reporter: RefCell::new(reporter),
            defs,
            cache: RefCell::new(HashMap::new()),
            before_fired: RefCell::new(HashSet::new()),
            super_depth: RefCell::new(HashMap::new()),
            teardown: Teardown::new(),
            rng: RefCell::new(StdRng::seed_from_u64(rng_seed)),
            tags,
            timer,
        }
    }

    // -- reporting ----------------------------------------------------------

    /// The case's current reporter. During a retry attempt this is the
    /// attempt's recording reporter.
    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.reporter.borrow().clone()
    }

    pub fn name(&self) -> String {
        self.reporter().name()
    }

    pub fn log(&self, msg: &str) {
        self.reporter().log(msg);
    }

    pub fn error(&self, msg: &str) {
        self.reporter().error(msg);
    }

    pub fn fatal(&self, msg: &str) -> ! {
        self.reporter().fatal(msg)
    }

    pub fn fail(&self) {
        self.reporter().fail();
    }

    pub fn fail_now(&self) -> ! {
        self.reporter().fail_now()
    }

    pub fn failed(&self) -> bool {
        self.reporter().failed()
    }

    pub fn skip(&self, msg: &str) -> ! {
        self.reporter().skip(msg)
    }

    pub fn skip_now(&self) -> ! {
        self.reporter().skip_now()
    }

    pub fn cleanup(&self, f: CleanupFn) {
        self.reporter().cleanup(f);
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.reporter().temp_dir()
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.reporter().set_env(key, value);
    }

    // -- teardown -----------------------------------------------------------

    /// Defers `f` until the end of the current test case. Deferred callbacks
    /// run in reverse registration order, even when the test block panics or
    /// exits early.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.teardown.defer(f);
    }

    pub(crate) fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    /// Drains the teardown stack. Called by the runner; re-raises the first
    /// teardown panic after the drain completes.
    pub(crate) fn finish(&self) {
        self.teardown.finish(self);
    }

    // -- randomness & metadata ----------------------------------------------

    /// The case's deterministic random source, seeded from the suite seed
    /// and the case name.
    pub fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }

    pub fn random_u64(&self) -> u64 {
        self.rng.borrow_mut().r#gen()
    }

    /// The effective tag set of this case (union of ancestor scopes).
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    // -- variable plumbing --------------------------------------------------

    pub(crate) fn with_reporter<R>(&self, reporter: Arc<dyn Reporter>, f: impl FnOnce() -> R) -> R {
        struct Restore<'a> {
            ctx: &'a TestContext,
            prev: Option<Arc<dyn Reporter>>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Some(prev) = self.prev.take() {
                    *self.ctx.reporter.borrow_mut() = prev;
                }
            }
        }

        let prev = self.reporter.replace(reporter);
        let _restore = Restore {
            ctx: self,
            prev: Some(prev),
        };
        f()
    }

    fn find_def(&self, id: &VarId) -> Option<VarDef> {
        self.defs.iter().rev().find(|d| d.id == *id).cloned()
    }

    fn fatal_framework(&self, err: FrameworkError) -> ! {
        self.fatal(&err.to_string())
    }

    /// Runs `f` with the benchmark timer suspended, so variable
    /// initialization never counts against the measured window.
    fn eval_unmeasured<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.timer {
            Some(timer) => {
                let was_running = timer.suspend();
                let out = f();
                timer.restore(was_running);
                out
            }
            None => f(),
        }
    }

    /// Materializes the variable into the cache if it is not there yet.
    pub(crate) fn var_force<T: 'static>(&self, var: &Var<T>) {
        if self.cache.borrow().contains_key(var.id()) {
            return;
        }

        let def = self.find_def(var.id());

        if def.is_none() && var.has_on_let() {
            self.fatal_framework(FrameworkError::UnboundVariable {
                id: var.id().to_string(),
            });
        }

        if let Some(hook) = var.before_hook() {
            let newly_fired = self.before_fired.borrow_mut().insert(var.id().clone());
            if newly_fired {
                hook(self);
                // the hook may have evaluated or set the variable itself
                if self.cache.borrow().contains_key(var.id()) {
                    return;
                }
            }
        }

        let value: Box<dyn Any> = match (&def, var.default_init()) {
            (Some(d), _) => {
                let init = d.init.clone();
                self.eval_unmeasured(|| init(self))
            }
            (None, Some(init)) => {
                let init = init.clone();
                self.eval_unmeasured(|| Box::new(init(self)) as Box<dyn Any>)
            }
            (None, None) => self.fatal_framework(FrameworkError::unknown_variable(
                var.id().as_str(),
                self.defs.iter().map(|d| d.id.as_str()),
            )),
        };
        self.cache.borrow_mut().insert(var.id().clone(), value);
    }

    pub(crate) fn var_value<T: Clone + 'static>(&self, var: &Var<T>) -> T {
        self.var_force(var);
        let cache = self.cache.borrow();
        let slot = cache
            .get(var.id())
            .expect("var_force always leaves a cached value behind");
        match slot.downcast_ref::<T>() {
            Some(value) => value.clone(),
            None => {
                drop(cache);
                self.fatal_framework(FrameworkError::VariableTypeMismatch {
                    id: var.id().to_string(),
                })
            }
        }
    }

    pub(crate) fn var_set<T: 'static>(&self, var: &Var<T>, value: T) {
        self.cache
            .borrow_mut()
            .insert(var.id().clone(), Box::new(value));
    }

    pub(crate) fn var_super<T: 'static>(&self, var: &Var<T>) -> T {
        struct DepthGuard<'a> {
            ctx: &'a TestContext,
            id: VarId,
            prev: usize,
        }
        impl Drop for DepthGuard<'_> {
            fn drop(&mut self) {
                self.ctx
                    .super_depth
                    .borrow_mut()
                    .insert(self.id.clone(), self.prev);
            }
        }

        let Some(def) = self.find_def(var.id()) else {
            self.fatal_framework(FrameworkError::unknown_variable(
                var.id().as_str(),
                self.defs.iter().map(|d| d.id.as_str()),
            ));
        };

        let depth = self
            .super_depth
            .borrow()
            .get(var.id())
            .copied()
            .unwrap_or(0);
        let Some(init) = def.supers.get(depth).cloned() else {
            self.fatal_framework(FrameworkError::NoSuperDefinition {
                id: var.id().to_string(),
                depth,
                available: def.supers.len(),
            });
        };

        self.super_depth
            .borrow_mut()
            .insert(var.id().clone(), depth + 1);
        let _guard = DepthGuard {
            ctx: self,
            id: var.id().clone(),
            prev: depth,
        };

        let boxed = self.eval_unmeasured(|| init(self));
        match boxed.downcast::<T>() {
            Ok(value) => *value,
            Err(_) => self.fatal_framework(FrameworkError::VariableTypeMismatch {
                id: var.id().to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn stub() -> TestContext {
        use crate::reporter::NullReporter;
        TestContext::new(
            NullReporter::new().as_reporter(),
            Vec::new(),
            BTreeSet::new(),
            0,
            None,
        )
    }
}
