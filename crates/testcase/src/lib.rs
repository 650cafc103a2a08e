//! A BDD-style test specification engine with lazy per-case variables,
//! nested hooks, deterministic shuffling, and retriable assertions.
//!
//! Specifications are built as a tree of scopes. Each scope collects
//! variable definitions, hooks, tags, and flags; each test declaration
//! becomes one executable case combining everything along its root-to-leaf
//! path. Sibling order is shuffled with a reproducible seed by default, so
//! hidden coupling between cases surfaces early and any failing order can
//! be replayed with `TESTCASE_SEED`.
//!
//! ```
//! use testcase::run;
//!
//! run(|s| {
//!     let count = s.let_value(2);
//!     s.context("when doubled", |s| {
//!         let doubled = {
//!             let count = count.clone();
//!             s.let_var(move |t| count.get(t) * 2)
//!         };
//!         s.test("is four", move |t| assert_eq!(doubled.get(t), 4));
//!     });
//! });
//! ```
//!
//! Variables are lazy and cached per case, never shared between cases.
//! Shadowed definitions stay reachable through [`Var::super_get`]. Hooks
//! follow RSpec nesting: ancestor setups run first, teardowns unwind in
//! reverse, and they run even when a case fails or panics. For flaky
//! external systems, [`eventually`] re-runs an assertion block under a
//! pluggable strategy and only the final attempt's evidence reaches the
//! report.
//!
//! ## Environment
//!
//! | Variable               | Effect                                        |
//! |------------------------|-----------------------------------------------|
//! | `TESTCASE_SEED`        | seeds shuffling and per-case randomness       |
//! | `TESTCASE_ORDERING`    | `defined` or `random` (default)               |
//! | `TESTCASE_TAG_INCLUDE` | run only cases carrying one of these tags     |
//! | `TESTCASE_TAG_EXCLUDE` | skip cases carrying one of these tags         |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod context;
mod error;
mod flatten;
mod recorder;
mod report;
mod reporter;
mod retry;
mod runner;
mod sandbox;
mod spec;
mod suite;
mod table;
mod teardown;
mod types;
mod var;

pub use config::{Config, Ordering};
pub use context::TestContext;
pub use error::FrameworkError;
pub use recorder::RecordingReporter;
pub use reporter::{CleanupFn, HarnessReporter, NullReporter, Reporter};
pub use retry::{Count, Retry, RetryStrategy, Timeout, Waiter, eventually};
pub use spec::{Spec, register_global_before_each};
pub use suite::{OpenSuite, Suite, benchmark_suite, run_suite, run_suite_with};
pub use table::{TableAct, TableCase, table_test};
pub use types::{SuiteResult, TestOutcome, TestResult};
pub use var::{Var, VarId};

/// The commonly-used surface in one import.
pub mod prelude {
    pub use crate::{
        Count, Retry, Spec, Suite, TableAct, TableCase, TestContext, Timeout, Var, benchmark,
        eventually, run, run_suite, run_with, table_test,
    };
}

use sandbox::Outcome;
use spec::SpecNode;

/// Builds and runs a specification under the bundled console harness.
///
/// Prints a header, one line per case, and a summary; panics when the
/// suite fails so the host test harness reports the failure.
pub fn run(body: impl FnOnce(&mut Spec<'_>)) {
    let harness = HarnessReporter::new("");
    if let Ok(cfg) = Config::global() {
        report::print_header(cfg.seed);
    }
    let result = run_with(harness.as_reporter(), body);
    report::print_summary(&result);
    if !result.all_passed() {
        panic!(
            "{} of {} test case(s) failed (reproduce with TESTCASE_SEED={})",
            result.failed(),
            result.results.len(),
            result.seed,
        );
    }
}

/// Builds and runs a specification against an explicit reporter, returning
/// the outcome instead of panicking. The engine's own tests run failing
/// suites through this with a [`NullReporter`].
pub fn run_with(reporter: Arc<dyn Reporter>, body: impl FnOnce(&mut Spec<'_>)) -> SuiteResult {
    execute_with(reporter, body, runner::execute)
}

/// Runs a specification under benchmark dispatch: each case's block is
/// measured over a calibrated iteration count, with variable
/// initialization excluded from the measured window.
pub fn benchmark(body: impl FnOnce(&mut Spec<'_>)) -> SuiteResult {
    let harness = HarnessReporter::new("");
    if let Ok(cfg) = Config::global() {
        report::print_header(cfg.seed);
    }
    let result = benchmark_with(harness.as_reporter(), body);
    report::print_summary(&result);
    if !result.all_passed() {
        panic!(
            "{} of {} benchmark case(s) failed (reproduce with TESTCASE_SEED={})",
            result.failed(),
            result.results.len(),
            result.seed,
        );
    }
    result
}

/// [`benchmark`] against an explicit reporter.
pub fn benchmark_with(
    reporter: Arc<dyn Reporter>,
    body: impl FnOnce(&mut Spec<'_>),
) -> SuiteResult {
    execute_with(reporter, body, runner::execute_benchmark)
}

fn execute_with(
    reporter: Arc<dyn Reporter>,
    body: impl FnOnce(&mut Spec<'_>),
    execute: fn(&flatten::Plan, &Arc<dyn Reporter>) -> SuiteResult,
) -> SuiteResult {
    let cfg = match Config::global() {
        Ok(cfg) => cfg,
        Err(err) => {
            reporter.error(&err.to_string());
            return SuiteResult {
                results: Vec::new(),
                seed: 0,
                total_duration: Duration::ZERO,
                suite_failed: true,
            };
        }
    };

    let Some(root) = define(&reporter, body) else {
        return SuiteResult {
            results: Vec::new(),
            seed: cfg.seed,
            total_duration: Duration::ZERO,
            suite_failed: reporter.failed(),
        };
    };

    let plan = flatten::flatten(root, cfg);
    let result = execute(&plan, &reporter);
    if !result.all_passed() {
        log::warn!(
            "suite failed; re-run with TESTCASE_SEED={} to reproduce the ordering",
            result.seed,
        );
    }
    result
}

/// Runs the definition phase inside an isolation wrapper. A framework
/// misuse fatal aborts the definition but leaves the process alive; the
/// reporter already carries the failure.
fn define(reporter: &Arc<dyn Reporter>, body: impl FnOnce(&mut Spec<'_>)) -> Option<SpecNode> {
    let mut root = SpecNode::root();
    let mut seen = HashMap::new();
    let outcome = sandbox::run(|| {
        let mut spec = Spec::root(&mut root, &mut seen, Arc::clone(reporter));
        body(&mut spec);
    });
    match outcome {
        Outcome::Passed => Some(root),
        Outcome::FailNow | Outcome::SkipNow => None,
        Outcome::Panicked(payload) => {
            reporter.error(&sandbox::panic_message(&payload));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_misuse_fatal_during_definition_fails_the_suite() {
        let null = NullReporter::new();
        let result = run_with(null.as_reporter(), |s| {
            s.test("first", |_| {});
            // hooks after a test at the same scope are rejected
            s.before(|_| {});
            unreachable!("the fatal must abort the definition body");
        });
        assert!(result.suite_failed);
        assert!(result.results.is_empty(), "nothing runs after a misuse fatal");
        assert!(null.failed());
    }

    #[test]
    fn a_panicking_definition_body_fails_the_suite() {
        let null = NullReporter::new();
        let result = run_with(null.as_reporter(), |_| panic!("bad definition"));
        assert!(result.suite_failed);
        assert!(
            null.messages()
                .iter()
                .any(|m| m.contains("bad definition"))
        );
    }

    #[test]
    fn an_empty_specification_passes() {
        let null = NullReporter::new();
        let result = run_with(null.as_reporter(), |_| {});
        assert!(result.all_passed());
        assert!(result.results.is_empty());
    }
}
