//! Reusable specification bodies.
//!
//! A [`Suite`] packages a specification so the same behavioral contract can
//! be mounted under many parent scopes, typically to verify that several
//! implementations of a trait satisfy the same expectations. Mounting
//! nests the suite under a scope named after it; merging inlines it into
//! the current scope so its hooks and variables apply directly.

use std::sync::Arc;

use crate::reporter::{HarnessReporter, Reporter};
use crate::spec::Spec;
use crate::types::SuiteResult;

pub trait Suite: Send + Sync {
    /// The scope label the suite nests under when mounted.
    fn name(&self) -> &str;

    /// Declares the suite's specification on `s`.
    fn spec(&self, s: &mut Spec<'_>);
}

impl Spec<'_> {
    /// Mounts `suite` as a child scope named after it.
    pub fn mount(&mut self, suite: &dyn Suite) {
        self.context(suite.name(), |s| suite.spec(s));
    }

    /// Inlines `suite` into this scope: its hooks, variables, and flags
    /// register here directly, without an extra naming level.
    pub fn merge(&mut self, suite: &dyn Suite) {
        suite.spec(self);
    }
}

/// Runs `suite` as a whole specification under the bundled harness.
/// Panics when the suite fails, like [`run`](crate::run).
pub fn run_suite(suite: &dyn Suite) {
    crate::run(|s| s.mount(suite));
}

/// Runs `suite` against an explicit reporter and returns the outcome
/// instead of panicking.
pub fn run_suite_with(reporter: Arc<dyn Reporter>, suite: &dyn Suite) -> SuiteResult {
    crate::run_with(reporter, |s| s.mount(suite))
}

/// Runs `suite` under benchmark dispatch.
pub fn benchmark_suite(suite: &dyn Suite) -> SuiteResult {
    let harness = HarnessReporter::new("");
    crate::benchmark_with(harness.as_reporter(), |s| s.mount(suite))
}

/// A suite that can run itself standalone under either dispatch mode, so
/// callers pick test or benchmark execution without knowing the suite's
/// internals.
pub trait OpenSuite: Suite {
    fn test(&self, reporter: Arc<dyn Reporter>) -> SuiteResult
    where
        Self: Sized,
    {
        run_suite_with(reporter, self)
    }

    fn benchmark(&self, reporter: Arc<dyn Reporter>) -> SuiteResult
    where
        Self: Sized,
    {
        crate::benchmark_with(reporter, |s| s.mount(self))
    }
}

impl<T: Suite> OpenSuite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;

    struct CounterContract {
        expected_start: usize,
    }

    impl Suite for CounterContract {
        fn name(&self) -> &str {
            "counter contract"
        }

        fn spec(&self, s: &mut Spec<'_>) {
            let start = self.expected_start;
            let counter = s.let_var(move |_| start);
            let read = counter.clone();
            s.test("starts at the expected value", move |t| {
                assert_eq!(read.get(t), start);
            });
            let bump = counter.clone();
            s.test("can be rebound for one case", move |t| {
                bump.set(t, start + 1);
                assert_eq!(bump.get(t), start + 1);
            });
        }
    }

    #[test]
    fn mounting_prefixes_case_names_with_the_suite_name() {
        let null = NullReporter::new();
        let result = run_suite_with(null.as_reporter(), &CounterContract { expected_start: 0 });
        assert!(result.all_passed());
        assert!(result
            .results
            .iter()
            .all(|r| r.name.starts_with("counter contract/")));
    }

    #[test]
    fn merging_inlines_the_suite_without_a_naming_level() {
        let null = NullReporter::new();
        let result = crate::run_with(null.as_reporter(), |s| {
            s.context("adapter", |s| {
                s.merge(&CounterContract { expected_start: 3 });
            });
        });
        assert!(result.all_passed());
        assert!(result
            .results
            .iter()
            .all(|r| r.name.starts_with("adapter/") && !r.name.contains("counter contract")));
    }

    #[test]
    fn a_failing_contract_fails_the_mounted_run() {
        struct Broken;
        impl Suite for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn spec(&self, s: &mut Spec<'_>) {
                s.test("never holds", |t| t.error("contract violated"));
            }
        }

        let null = NullReporter::new();
        let result = run_suite_with(null.as_reporter(), &Broken);
        assert!(result.suite_failed);
        assert_eq!(result.failed(), 1);
    }

    #[test]
    fn open_suite_picks_the_dispatch_mode() {
        struct Mixed;
        impl Suite for Mixed {
            fn name(&self) -> &str {
                "mixed"
            }
            fn spec(&self, s: &mut Spec<'_>) {
                s.context("unmeasurable", |s| {
                    s.skip_benchmark();
                    s.test("slow path", |_| {});
                });
                s.test("measured", |_| {});
            }
        }

        let result = Mixed.test(NullReporter::new().as_reporter());
        assert_eq!(result.passed(), 2);
        assert_eq!(result.skipped(), 0);

        let result = Mixed.benchmark(NullReporter::new().as_reporter());
        assert!(result.all_passed());
        assert_eq!(result.passed(), 1);
        assert_eq!(result.skipped(), 1, "skip_benchmark only applies under benchmark dispatch");
    }
}
