//! Lazily-initialized, per-test-case variables.
//!
//! A [`Var`] is a typed handle over an opaque identifier. Definitions are
//! registered on scopes with [`Var::let_`] / [`Var::let_value`]; values are
//! materialized per test case on first [`Var::get`], cached for the rest of
//! that case, and never shared between cases. Values live in the test
//! context as tagged-any boxes; the typed surface is recovered by downcast.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::context::TestContext;
use crate::spec::Spec;

/// A stable variable identifier. Auto-derived identifiers use the
/// declaration's source location, with an offset suffix (`#1`, `#2`, ...)
/// to disambiguate declarations inside loops.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct VarId(Arc<str>);

impl VarId {
    pub(crate) fn new(raw: &str) -> Self {
        VarId(Arc::from(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) type ErasedInit = Arc<dyn Fn(&TestContext) -> Box<dyn Any> + Send + Sync>;
pub(crate) type VarBeforeHook = Arc<dyn Fn(&TestContext) + Send + Sync>;
pub(crate) type OnLetHook = Arc<dyn Fn(&mut Spec<'_>) + Send + Sync>;

/// One registered definition of a variable within a scope.
#[derive(Clone)]
pub(crate) struct VarDef {
    pub(crate) id: VarId,
    pub(crate) init: ErasedInit,
    /// Initializers this definition shadowed, nearest ancestor first.
    /// Only cross-scope history: redefining within the same scope replaces
    /// the initializer without growing this list.
    pub(crate) supers: Vec<ErasedInit>,
}

/// A typed, lazily-initialized, per-test-case variable.
///
/// Handles are cheap to clone and capture; two handles with the same
/// identifier refer to the same underlying slot.
///
/// ```
/// use testcase::run;
///
/// run(|s| {
///     let x = s.let_var(|_| 1);
///     s.context("shadowed", |s| {
///         x.let_(s, |_| 2);
///         let x = x.clone();
///         s.test("sees the override", move |t| assert_eq!(x.get(t), 2));
///     });
///     s.test("sees the root value", move |t| assert_eq!(x.get(t), 1));
/// });
/// ```
pub struct Var<T> {
    id: VarId,
    default_init: Option<Arc<dyn Fn(&TestContext) -> T + Send + Sync>>,
    on_let: Option<OnLetHook>,
    before: Option<VarBeforeHook>,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Var {
            id: self.id.clone(),
            default_init: self.default_init.clone(),
            on_let: self.on_let.clone(),
            before: self.before.clone(),
        }
    }
}

impl<T: 'static> Var<T> {
    /// A variable with an explicit identifier and no default initializer.
    pub fn new(id: &str) -> Self {
        Var {
            id: VarId::new(id),
            default_init: None,
            on_let: None,
            before: None,
        }
    }

    pub fn id(&self) -> &VarId {
        &self.id
    }

    /// A fallback initializer used when no scope in the chain defines the
    /// variable.
    pub fn with_default(mut self, init: impl Fn(&TestContext) -> T + Send + Sync + 'static) -> Self {
        self.default_init = Some(Arc::new(init));
        self
    }

    /// Attaches a side effect that must run against a scope before any test
    /// under it may access the variable. A variable carrying an on-let hook
    /// is unusable until [`bind`](Var::bind) or [`let_`](Var::let_) has been
    /// called on some enclosing scope.
    pub fn on_let(mut self, hook: impl Fn(&mut Spec<'_>) + Send + Sync + 'static) -> Self {
        self.on_let = Some(Arc::new(hook));
        self
    }

    /// Attaches a hook that fires once per test case, right before the
    /// variable is first materialized. Guarded against re-entry: the hook
    /// may `get` the variable itself.
    pub fn before(mut self, hook: impl Fn(&TestContext) + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(hook));
        self
    }

    pub(crate) fn has_on_let(&self) -> bool {
        self.on_let.is_some()
    }

    pub(crate) fn default_init(&self) -> Option<&Arc<dyn Fn(&TestContext) -> T + Send + Sync>> {
        self.default_init.as_ref()
    }

    pub(crate) fn before_hook(&self) -> Option<&VarBeforeHook> {
        self.before.as_ref()
    }

    /// Registers `init` as this variable's definition in `scope`, shadowing
    /// any ancestor definition (which remains reachable via
    /// [`super_get`](Var::super_get)).
    #[track_caller]
    pub fn let_(&self, scope: &mut Spec<'_>, init: impl Fn(&TestContext) -> T + Send + Sync + 'static) {
        let location = Location::caller();
        self.apply_on_let(scope);
        let erased: ErasedInit = Arc::new(move |t| Box::new(init(t)) as Box<dyn Any>);
        scope.register_def(&self.id, erased, location);
    }

    /// Registers a constant value. Every test case receives its own clone.
    /// Note that cloning is shallow isolation: a value with interior
    /// sharing, such as an `Arc<Mutex<_>>`, still points at state common to
    /// all cases.
    #[track_caller]
    pub fn let_value(&self, scope: &mut Spec<'_>, value: T)
    where
        T: Clone + Send + Sync,
    {
        let location = Location::caller();
        self.apply_on_let(scope);
        let erased: ErasedInit = Arc::new(move |_| Box::new(value.clone()) as Box<dyn Any>);
        scope.register_def(&self.id, erased, location);
    }

    /// Applies the on-let side effect and, when the variable has a default
    /// initializer, registers it in `scope`. Required before access for
    /// variables carrying an on-let hook.
    #[track_caller]
    pub fn bind(&self, scope: &mut Spec<'_>) {
        let location = Location::caller();
        self.apply_on_let(scope);
        if let Some(init) = self.default_init.clone() {
            let erased: ErasedInit = Arc::new(move |t| Box::new(init(t)) as Box<dyn Any>);
            scope.register_def(&self.id, erased, location);
        }
    }

    /// Forces evaluation before the user test block runs, via a scope-level
    /// before hook. Observationally equivalent to calling `get` at the top
    /// of every test under `scope`.
    #[track_caller]
    pub fn eager_loading(&self, scope: &mut Spec<'_>) {
        let var = self.clone();
        scope.before(move |t| t.var_force(&var));
    }

    /// The per-test-case value: materialized on first call, cached for the
    /// rest of the case.
    pub fn get(&self, t: &TestContext) -> T
    where
        T: Clone,
    {
        t.var_value(self)
    }

    /// Overrides the cached value for the current test case only. Ancestor
    /// definitions and sibling cases are unaffected.
    pub fn set(&self, t: &TestContext, value: T) {
        t.var_set(self, value);
    }

    /// Evaluates the previous definition of this variable, one shadowing
    /// level up. Calling `super_get` again while the super initializer runs
    /// goes one level further. Results are never cached: each call evaluates
    /// fresh, so side effects happen exactly as many times as `super_get` is
    /// called.
    pub fn super_get(&self, t: &TestContext) -> T {
        t.var_super(self)
    }

    fn apply_on_let(&self, scope: &mut Spec<'_>) {
        if let Some(hook) = self.on_let.clone() {
            hook(scope);
        }
    }
}
