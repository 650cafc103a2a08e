//! Scope nodes and the specification-building API.
//!
//! A [`Spec`] handle mutates one node of the specification tree. Nodes
//! accumulate hooks, variable definitions, tags, and flags until the first
//! test is declared at that scope; from then on the scope is sealed and
//! further hook or variable registration is a framework-usage error. Child
//! scopes start unsealed.
//!
//! The tree is built single-threaded (the definition closure runs to
//! completion before anything executes) and is read-only afterwards.

use std::collections::{BTreeSet, HashMap};
use std::panic::Location;
use std::sync::{Arc, OnceLock, RwLock};

use crate::context::TestContext;
use crate::error::FrameworkError;
use crate::reporter::Reporter;
use crate::retry::RetryStrategy;
use crate::teardown::TeardownFn;
use crate::var::{ErasedInit, VarDef, VarId};

pub(crate) type TestBlock = Arc<dyn Fn(&TestContext) + Send + Sync>;
pub(crate) type AroundHook = Arc<dyn Fn(&TestContext) -> TeardownFn + Send + Sync>;
pub(crate) type SuiteHook = Arc<dyn Fn(&dyn Reporter) + Send + Sync>;

pub(crate) struct TestDecl {
    pub(crate) desc: String,
    pub(crate) block: TestBlock,
}

pub(crate) enum Child {
    Scope(SpecNode),
    Test(TestDecl),
}

pub(crate) struct SpecNode {
    pub(crate) desc: String,
    pub(crate) group: Option<String>,
    pub(crate) children: Vec<Child>,
    pub(crate) defs: Vec<VarDef>,
    pub(crate) arounds: Vec<AroundHook>,
    pub(crate) before_all: Vec<SuiteHook>,
    pub(crate) after_all: Vec<SuiteHook>,
    pub(crate) parallel: bool,
    pub(crate) sequential: bool,
    pub(crate) skip: Option<String>,
    pub(crate) skip_benchmark: bool,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) retry: Option<Arc<dyn RetryStrategy>>,
    pub(crate) sealed: bool,
}

impl SpecNode {
    pub(crate) fn new(desc: &str) -> Self {
        SpecNode {
            desc: desc.to_string(),
            group: None,
            children: Vec::new(),
            defs: Vec::new(),
            arounds: Vec::new(),
            before_all: Vec::new(),
            after_all: Vec::new(),
            parallel: false,
            sequential: false,
            skip: None,
            skip_benchmark: false,
            tags: BTreeSet::new(),
            retry: None,
            sealed: false,
        }
    }

    /// A root node, pre-loaded with the process-wide before-each hooks that
    /// were registered at the time of construction.
    pub(crate) fn root() -> Self {
        let mut node = SpecNode::new("");
        for hook in global_before_each_snapshot() {
            node.arounds.push(Arc::new(move |t: &TestContext| {
                hook(t);
                Box::new(|_: &TestContext| {}) as TeardownFn
            }));
        }
        node
    }
}

/// A handle for defining one lexical nesting level of a specification.
///
/// Obtained from [`run`](crate::run) / [`run_with`](crate::run_with) for the
/// root, and from [`context`](Spec::context) and its aliases for children.
pub struct Spec<'a> {
    node: &'a mut SpecNode,
    seen_ids: &'a mut HashMap<String, u32>,
    inherited: HashMap<VarId, VarDef>,
    reporter: Arc<dyn Reporter>,
}

impl<'a> Spec<'a> {
    pub(crate) fn root(
        node: &'a mut SpecNode,
        seen_ids: &'a mut HashMap<String, u32>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Spec {
            node,
            seen_ids,
            inherited: HashMap::new(),
            reporter,
        }
    }

    // -- scope structure ----------------------------------------------------

    /// Opens a child scope. `describe`, `when`, and `and` are aliases with
    /// the conventional BDD register.
    pub fn context(&mut self, desc: &str, body: impl FnOnce(&mut Spec<'_>)) {
        let mut inherited = self.inherited.clone();
        for def in &self.node.defs {
            inherited.insert(def.id.clone(), def.clone());
        }

        let mut child_node = SpecNode::new(desc);
        {
            let mut child = Spec {
                node: &mut child_node,
                seen_ids: &mut *self.seen_ids,
                inherited,
                reporter: self.reporter.clone(),
            };
            body(&mut child);
        }
        self.node.children.push(Child::Scope(child_node));
    }

    pub fn describe(&mut self, desc: &str, body: impl FnOnce(&mut Spec<'_>)) {
        self.context(desc, body);
    }

    pub fn when(&mut self, desc: &str, body: impl FnOnce(&mut Spec<'_>)) {
        self.context(desc, body);
    }

    pub fn and(&mut self, desc: &str, body: impl FnOnce(&mut Spec<'_>)) {
        self.context(desc, body);
    }

    /// Declares a test case at this scope and seals it: hooks and variable
    /// definitions added to this scope afterwards are a framework error.
    pub fn test(&mut self, desc: &str, block: impl Fn(&TestContext) + Send + Sync + 'static) {
        self.node.children.push(Child::Test(TestDecl {
            desc: desc.to_string(),
            block: Arc::new(block),
        }));
        self.node.sealed = true;
    }

    pub fn then(&mut self, desc: &str, block: impl Fn(&TestContext) + Send + Sync + 'static) {
        self.test(desc, block);
    }

    // -- hooks --------------------------------------------------------------

    /// Runs before every test case under this scope, after ancestor hooks.
    #[track_caller]
    pub fn before(&mut self, f: impl Fn(&TestContext) + Send + Sync + 'static) {
        self.ensure_open("a before hook", Location::caller());
        self.node.arounds.push(Arc::new(move |t: &TestContext| {
            f(t);
            Box::new(|_: &TestContext| {}) as TeardownFn
        }));
    }

    /// Runs after every test case under this scope, before ancestor after
    /// hooks (reverse registration order).
    #[track_caller]
    pub fn after(&mut self, f: impl Fn(&TestContext) + Send + Sync + 'static) {
        self.ensure_open("an after hook", Location::caller());
        let f = Arc::new(f);
        self.node.arounds.push(Arc::new(move |_: &TestContext| {
            let f = Arc::clone(&f);
            Box::new(move |t: &TestContext| f(t)) as TeardownFn
        }));
    }

    /// A setup that returns its own teardown. Setups run in registration
    /// order, teardowns in reverse; ancestor arounds nest outside descendant
    /// arounds.
    #[track_caller]
    pub fn around(
        &mut self,
        f: impl Fn(&TestContext) -> Box<dyn FnOnce() + 'static> + Send + Sync + 'static,
    ) {
        self.ensure_open("an around hook", Location::caller());
        self.node.arounds.push(Arc::new(move |t: &TestContext| {
            let teardown = f(t);
            Box::new(move |_: &TestContext| teardown()) as TeardownFn
        }));
    }

    /// Runs once before the first test case under this scope, under the
    /// suite reporter: a failure here fails the suite, not a single case.
    #[track_caller]
    pub fn before_all(&mut self, f: impl Fn(&dyn Reporter) + Send + Sync + 'static) {
        self.ensure_open("a before_all hook", Location::caller());
        self.node.before_all.push(Arc::new(f));
    }

    /// Runs once after the last test case under this scope completes.
    /// Multiple hooks run in reverse registration order.
    #[track_caller]
    pub fn after_all(&mut self, f: impl Fn(&dyn Reporter) + Send + Sync + 'static) {
        self.ensure_open("an after_all hook", Location::caller());
        self.node.after_all.push(Arc::new(f));
    }

    // -- flags --------------------------------------------------------------

    /// Marks every test case under this scope as eligible for parallel
    /// execution. Descendants may opt back out with [`sequential`].
    ///
    /// [`sequential`]: Spec::sequential
    #[track_caller]
    pub fn parallel(&mut self) {
        if self.node.sequential {
            self.fatal(FrameworkError::ParallelConflict {
                scope: self.node.desc.clone(),
                existing: "sequential",
                location: Location::caller(),
            });
        }
        self.node.parallel = true;
    }

    /// Forces serial execution for this subtree. Irreversible: descendants
    /// cannot opt back into parallel.
    #[track_caller]
    pub fn sequential(&mut self) {
        if self.node.parallel {
            self.fatal(FrameworkError::ParallelConflict {
                scope: self.node.desc.clone(),
                existing: "parallel",
                location: Location::caller(),
            });
        }
        self.node.sequential = true;
    }

    /// Skips every test case under this scope, reporting `reason`.
    pub fn skip(&mut self, reason: &str) {
        if self.node.skip.is_none() {
            self.node.skip = Some(if reason.is_empty() {
                "skipped".to_string()
            } else {
                reason.to_string()
            });
        }
    }

    /// Excludes this subtree from benchmark dispatch.
    pub fn skip_benchmark(&mut self) {
        self.node.skip_benchmark = true;
    }

    /// Attaches a tag, usable with `TESTCASE_TAG_INCLUDE` /
    /// `TESTCASE_TAG_EXCLUDE` filtering.
    pub fn tag(&mut self, tag: &str) {
        self.node.tags.insert(tag.to_string());
    }

    /// Labels this scope for grouping: the label is prepended to child case
    /// names and becomes part of the sub-test path.
    pub fn group(&mut self, name: &str) {
        self.node.group = Some(name.to_string());
    }

    /// Re-runs failing test blocks under this scope with `strategy`. The
    /// nearest scope with a strategy wins.
    pub fn retry(&mut self, strategy: impl RetryStrategy + 'static) {
        self.node.retry = Some(Arc::new(strategy));
    }

    // -- variables ----------------------------------------------------------

    /// Declares a variable with an identifier derived from the call site and
    /// registers `init` at this scope.
    #[track_caller]
    pub fn let_var<T: 'static>(
        &mut self,
        init: impl Fn(&TestContext) -> T + Send + Sync + 'static,
    ) -> crate::var::Var<T> {
        let var = crate::var::Var::new(&self.next_auto_id());
        var.let_(self, init);
        var
    }

    /// Declares a variable bound to a constant; each test case receives its
    /// own clone.
    #[track_caller]
    pub fn let_value<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> crate::var::Var<T> {
        let var = crate::var::Var::new(&self.next_auto_id());
        var.let_value(self, value);
        var
    }

    #[track_caller]
    fn next_auto_id(&mut self) -> String {
        let loc = Location::caller();
        let base = format!("{}:{}:{}", loc.file(), loc.line(), loc.column());
        let counter = self.seen_ids.entry(base.clone()).or_insert(0);
        *counter += 1;
        if *counter == 1 {
            base
        } else {
            format!("{}#{}", base, *counter - 1)
        }
    }

    /// Registers an erased initializer for `id` at this scope, snapshotting
    /// the shadowed ancestor definition into the super chain. Redefining at
    /// the same scope replaces the initializer in place; only cross-scope
    /// history feeds `super_get`.
    pub(crate) fn register_def(
        &mut self,
        id: &VarId,
        init: ErasedInit,
        location: &'static Location<'static>,
    ) {
        self.ensure_open_at("a variable definition", location);
        if let Some(existing) = self.node.defs.iter_mut().find(|d| d.id == *id) {
            existing.init = init;
            return;
        }
        let supers = match self.inherited.get(id) {
            Some(shadowed) => {
                let mut chain = Vec::with_capacity(shadowed.supers.len() + 1);
                chain.push(shadowed.init.clone());
                chain.extend(shadowed.supers.iter().cloned());
                chain
            }
            None => Vec::new(),
        };
        self.node.defs.push(VarDef {
            id: id.clone(),
            init,
            supers,
        });
    }

    // -- misuse detection ---------------------------------------------------

    fn ensure_open(&self, what: &'static str, location: &'static Location<'static>) {
        self.ensure_open_at(what, location);
    }

    fn ensure_open_at(&self, what: &'static str, location: &'static Location<'static>) {
        if self.node.sealed {
            self.fatal(FrameworkError::SealedScope {
                what,
                scope: self.node.desc.clone(),
                location,
            });
        }
    }

    fn fatal(&self, err: FrameworkError) -> ! {
        self.reporter.fatal(&err.to_string())
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }
}

// ---------------------------------------------------------------------------
// process-wide before-each hooks
// ---------------------------------------------------------------------------

fn global_registry() -> &'static RwLock<Vec<TestBlock>> {
    static REGISTRY: OnceLock<RwLock<Vec<TestBlock>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Registers a hook that runs before every test case of every specification
/// constructed after this call. Specifications snapshot the registry at
/// construction, so already-built suites are unaffected.
pub fn register_global_before_each(f: impl Fn(&TestContext) + Send + Sync + 'static) {
    global_registry()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(Arc::new(f));
}

fn global_before_each_snapshot() -> Vec<TestBlock> {
    global_registry()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
