//! Table-driven test declaration.
//!
//! [`table_test`] turns a name-to-setup mapping into one child scope per
//! entry. Entries come from a `BTreeMap`, so declaration order is
//! lexicographic by case name and the flattener's ordering policy works
//! from a stable basis. Each entry either binds a datum to a scope
//! variable, configures the child scope directly, or installs a per-case
//! before hook; the shared act runs as the leaf of every child scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::TestContext;
use crate::error::FrameworkError;
use crate::spec::Spec;
use crate::var::Var;

/// Per-entry setup.
pub enum TableCase<T> {
    /// Bind the table variable to this value for the case.
    Value(T),
    /// Configure the case's scope directly.
    Spec(Box<dyn Fn(&mut Spec<'_>) + Send + Sync>),
    /// Install a before hook on the case's scope.
    Before(Box<dyn Fn(&TestContext) + Send + Sync>),
}

/// The shared act registered under every table entry.
#[derive(Clone)]
pub enum TableAct {
    /// A leaf test block; the case name becomes the test name.
    Test(Arc<dyn Fn(&TestContext) + Send + Sync>),
    /// A sub-specification declaring its own leaves.
    Spec(Arc<dyn Fn(&mut Spec<'_>) + Send + Sync>),
}

impl TableAct {
    pub fn test(f: impl Fn(&TestContext) + Send + Sync + 'static) -> Self {
        TableAct::Test(Arc::new(f))
    }

    pub fn spec(f: impl Fn(&mut Spec<'_>) + Send + Sync + 'static) -> Self {
        TableAct::Spec(Arc::new(f))
    }
}

/// Declares one child scope per table entry, in lexicographic case-name
/// order.
///
/// A [`TableCase::Value`] entry combined with a [`TableAct::Spec`] act is
/// rejected: the sub-specification declares its own leaves, so there is no
/// unambiguous place for the datum to act. Pair values with
/// [`TableAct::Test`], or bind the variable inside the sub-specification
/// with [`TableCase::Spec`].
pub fn table_test<T: Clone + Send + Sync + 'static>(
    s: &mut Spec<'_>,
    var: &Var<T>,
    cases: BTreeMap<String, TableCase<T>>,
    act: TableAct,
) {
    for (name, case) in cases {
        if matches!(
            (&case, &act),
            (TableCase::Value(_), TableAct::Spec(_))
        ) {
            let err = FrameworkError::InvalidTableShape { case: name };
            s.reporter().fatal(&err.to_string());
        }

        let act = act.clone();
        let var = var.clone();
        s.context(&name, move |s| {
            match case {
                TableCase::Value(value) => var.let_value(s, value),
                TableCase::Spec(configure) => configure(s),
                TableCase::Before(hook) => s.before(hook),
            }
            match act {
                TableAct::Test(block) => s.test("", move |t| block(t)),
                TableAct::Spec(body) => body(s),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Ordering};
    use crate::flatten::flatten;
    use crate::reporter::{NullReporter, Reporter};
    use crate::sandbox;
    use crate::spec::SpecNode;
    use std::collections::HashMap;

    fn build(body: impl FnOnce(&mut Spec<'_>)) -> SpecNode {
        let mut root = SpecNode::new("");
        let mut seen = HashMap::new();
        let reporter = NullReporter::new().as_reporter();
        let mut spec = Spec::root(&mut root, &mut seen, reporter);
        body(&mut spec);
        root
    }

    fn entries(n: usize) -> BTreeMap<String, TableCase<usize>> {
        (1..=n)
            .map(|i| (i.to_string(), TableCase::Value(i)))
            .collect()
    }

    #[test]
    fn cases_are_declared_in_lexicographic_order() {
        let root = build(|s| {
            let v = s.let_value(0usize);
            let mut cases = entries(3);
            cases.insert("0-first".to_string(), TableCase::Value(9));
            table_test(s, &v, cases, TableAct::test(|_| {}));
        });
        let plan = flatten(root, &Config::for_testing(0, Ordering::Defined));
        let names: Vec<_> = plan.cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["0-first", "1", "2", "3"]);
    }

    #[test]
    fn same_seed_gives_the_same_shuffled_order() {
        let build_table = || {
            build(|s| {
                let v = s.let_value(0usize);
                table_test(s, &v, entries(7), TableAct::test(|_| {}));
            })
        };
        let cfg = Config::for_testing(42, Ordering::Random);
        let a = flatten(build_table(), &cfg);
        let b = flatten(build_table(), &cfg);
        let names = |p: &crate::flatten::Plan| {
            p.cases.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn value_entries_bind_the_variable() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
        use std::sync::Arc as StdArc;

        let sum = StdArc::new(AtomicUsize::new(0));
        let sum2 = StdArc::clone(&sum);
        let root = build(move |s| {
            let v = s.let_value(0usize);
            let act_var = v.clone();
            table_test(
                s,
                &v,
                entries(3),
                TableAct::test(move |t| {
                    sum2.fetch_add(act_var.get(t), AtomicOrdering::SeqCst);
                }),
            );
        });
        let plan = flatten(root, &Config::for_testing(0, Ordering::Defined));
        let host = NullReporter::new().as_reporter();
        crate::runner::execute(&plan, &host);
        assert_eq!(sum.load(AtomicOrdering::SeqCst), 1 + 2 + 3);
    }

    #[test]
    fn a_datum_with_a_spec_act_is_rejected() {
        let reporter = NullReporter::new();
        let handle = reporter.as_reporter();
        let mut root = SpecNode::new("");
        let mut seen = HashMap::new();
        let outcome = sandbox::run(|| {
            let mut s = Spec::root(&mut root, &mut seen, handle);
            let v = s.let_value(0usize);
            let cases: BTreeMap<_, _> =
                [("datum".to_string(), TableCase::Value(1usize))].into();
            table_test(&mut s, &v, cases, TableAct::spec(|_| {}));
        });
        assert!(outcome.is_abnormal());
        assert!(reporter.failed());
        let joined = reporter.messages().join("\n");
        assert!(joined.contains("datum"), "error must name the offending case");
    }
}
