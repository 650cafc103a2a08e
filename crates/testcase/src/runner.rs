//! Drives a flattened plan to completion.
//!
//! Sequential cases run first, in plan order; parallel-flagged cases are
//! collected and run together on scoped threads afterwards. Each case runs
//! as a sub-case of the host reporter, with the before-all latches fired on
//! the way in and the after-all countdowns released on the way out, whatever
//! the case outcome was.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::resume_unwind;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::context::{BenchTimer, TestContext};
use crate::flatten::{CasePlan, Plan};
use crate::reporter::{Reporter, lock};
use crate::retry::Retry;
use crate::sandbox::{self, Outcome};
use crate::types::{SuiteResult, TestOutcome, TestResult};

pub(crate) fn execute(plan: &Plan, host: &Arc<dyn Reporter>) -> SuiteResult {
    let started = Instant::now();
    let results: Mutex<Vec<(usize, TestResult)>> = Mutex::new(Vec::new());

    let mut deferred = Vec::new();
    for (idx, case) in plan.cases.iter().enumerate() {
        if case.parallel {
            deferred.push(idx);
            continue;
        }
        run_one(plan, idx, case, host, &results);
    }

    if !deferred.is_empty() {
        std::thread::scope(|scope| {
            for idx in deferred {
                let case = &plan.cases[idx];
                let results = &results;
                scope.spawn(move || run_one(plan, idx, case, host, results));
            }
        });
    }

    let mut collected = results.into_inner().unwrap_or_else(|p| p.into_inner());
    collected.sort_by_key(|(idx, _)| *idx);

    SuiteResult {
        results: collected.into_iter().map(|(_, r)| r).collect(),
        seed: plan.seed,
        total_duration: started.elapsed(),
        suite_failed: host.failed(),
    }
}

fn run_one(
    plan: &Plan,
    idx: usize,
    case: &CasePlan,
    host: &Arc<dyn Reporter>,
    results: &Mutex<Vec<(usize, TestResult)>>,
) {
    let started = Instant::now();
    let mut case_reporter: Option<Arc<dyn Reporter>> = None;

    let passed = host.run(
        &case.name,
        Box::new(|rep| {
            case_reporter = Some(Arc::clone(&rep));
            run_case(plan, case, rep, host);
        }),
    );

    let skipped = case_reporter.map(|r| r.skipped()).unwrap_or(false);
    let outcome = if !passed {
        TestOutcome::Failed
    } else if skipped {
        TestOutcome::Skipped
    } else {
        TestOutcome::Passed
    };
    lock(results).push((
        idx,
        TestResult {
            name: case.name.clone(),
            outcome,
            duration: started.elapsed(),
        },
    ));
}

fn run_case(plan: &Plan, case: &CasePlan, rep: Arc<dyn Reporter>, host: &Arc<dyn Reporter>) {
    let finish_scopes = || {
        for &sid in case.scope_ids.iter().rev() {
            plan.scopes[sid].case_finished(host);
        }
    };

    // a case that never executes must not fire the before-all latches,
    // but it still releases the after-all countdowns
    if let Some(reason) = skip_reason(case, false) {
        let _ = sandbox::run(|| rep.skip(&reason));
        finish_scopes();
        return;
    }

    for &sid in &case.scope_ids {
        plan.scopes[sid].run_before_all(host);
    }

    let ctx = TestContext::new(
        Arc::clone(&rep),
        case.defs.clone(),
        case.tags.clone(),
        case_seed(plan.seed, &case.name),
        None,
    );

    let body = sandbox::run(|| {
        for setup in &case.arounds {
            let teardown = setup(&ctx);
            ctx.teardown().push(teardown);
        }
        match &case.retry {
            None => (case.block)(&ctx),
            Some(strategy) => {
                Retry::from_arc(Arc::clone(strategy)).assert(&rep, |attempt| {
                    ctx.with_reporter(attempt, || (case.block)(&ctx));
                });
            }
        }
    });

    // teardowns run whatever happened to the body
    let teardown = sandbox::run(|| ctx.finish());
    drop(ctx);
    finish_scopes();

    if let Outcome::Panicked(payload) = body {
        resume_unwind(payload);
    }
    if let Outcome::Panicked(payload) = teardown {
        resume_unwind(payload);
    }
}

fn skip_reason(case: &CasePlan, benchmark: bool) -> Option<String> {
    if case.excluded {
        return Some("excluded by tag filter".to_string());
    }
    if let Some(reason) = &case.skip {
        return Some(reason.clone());
    }
    if benchmark && case.skip_benchmark {
        return Some("excluded from benchmarks".to_string());
    }
    None
}

fn case_seed(suite_seed: i64, name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (suite_seed as u64) ^ hasher.finish()
}

// ---------------------------------------------------------------------------
// benchmark dispatch
// ---------------------------------------------------------------------------

/// How long a benchmark case is measured for after calibration.
const BENCH_BUDGET: Duration = Duration::from_millis(100);

pub(crate) fn execute_benchmark(plan: &Plan, host: &Arc<dyn Reporter>) -> SuiteResult {
    let started = Instant::now();
    let results = Mutex::new(Vec::new());
    for (idx, case) in plan.cases.iter().enumerate() {
        let case_started = Instant::now();
        let mut case_reporter: Option<Arc<dyn Reporter>> = None;
        let passed = host.run(
            &case.name,
            Box::new(|rep| {
                case_reporter = Some(Arc::clone(&rep));
                bench_case(plan, case, rep, host);
            }),
        );
        let skipped = case_reporter.map(|r| r.skipped()).unwrap_or(false);
        let outcome = if !passed {
            TestOutcome::Failed
        } else if skipped {
            TestOutcome::Skipped
        } else {
            TestOutcome::Passed
        };
        lock(&results).push((
            idx,
            TestResult {
                name: case.name.clone(),
                outcome,
                duration: case_started.elapsed(),
            },
        ));
    }

    let collected = results.into_inner().unwrap_or_else(|p| p.into_inner());
    SuiteResult {
        results: collected.into_iter().map(|(_, r)| r).collect(),
        seed: plan.seed,
        total_duration: started.elapsed(),
        suite_failed: host.failed(),
    }
}

fn bench_case(plan: &Plan, case: &CasePlan, rep: Arc<dyn Reporter>, host: &Arc<dyn Reporter>) {
    let finish_scopes = || {
        for &sid in case.scope_ids.iter().rev() {
            plan.scopes[sid].case_finished(host);
        }
    };

    if let Some(reason) = skip_reason(case, true) {
        let _ = sandbox::run(|| rep.skip(&reason));
        finish_scopes();
        return;
    }

    for &sid in &case.scope_ids {
        plan.scopes[sid].run_before_all(host);
    }

    let timer = Rc::new(BenchTimer::new());
    let ctx = TestContext::new(
        Arc::clone(&rep),
        case.defs.clone(),
        case.tags.clone(),
        case_seed(plan.seed, &case.name),
        Some(Rc::clone(&timer)),
    );

    let body = sandbox::run(|| {
        for setup in &case.arounds {
            let teardown = setup(&ctx);
            ctx.teardown().push(teardown);
        }

        // calibration run; variable initializers suspend the timer, so only
        // the block itself is measured
        timer.start();
        (case.block)(&ctx);
        timer.stop();

        let single = timer.total().max(Duration::from_nanos(1));
        let iterations =
            (BENCH_BUDGET.as_nanos() / single.as_nanos()).clamp(1, 10_000) as u32;

        timer.start();
        for _ in 1..iterations {
            (case.block)(&ctx);
        }
        timer.stop();

        rep.log(&format!(
            "{} iterations, {} ns/iter",
            iterations,
            timer.total().as_nanos() / iterations as u128
        ));
    });

    let teardown = sandbox::run(|| ctx.finish());
    drop(ctx);
    finish_scopes();

    if let Outcome::Panicked(payload) = body {
        resume_unwind(payload);
    }
    if let Outcome::Panicked(payload) = teardown {
        resume_unwind(payload);
    }
}
