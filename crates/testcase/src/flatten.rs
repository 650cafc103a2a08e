//! Turns the scope tree into a flat, ordered execution plan.
//!
//! Flattening resolves everything that can be decided before any test runs:
//! full case names, the root-to-leaf hook chain, the visible variable
//! definitions, effective flags, tag filtering, and sibling order. Under
//! random ordering each scope's children are shuffled with the suite seed,
//! which keeps every subtree contiguous: cases sharing a scope prefix stay
//! next to each other no matter how the shuffle lands.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Once};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{Config, Ordering};
use crate::reporter::Reporter;
use crate::retry::RetryStrategy;
use crate::sandbox::{self, Outcome};
use crate::spec::{AroundHook, Child, SpecNode, SuiteHook, TestBlock};
use crate::var::VarDef;

pub(crate) struct CasePlan {
    /// Slash-joined path of scope labels and the test description.
    pub(crate) name: String,
    /// Root-to-leaf setup chain; teardowns pop in reverse.
    pub(crate) arounds: Vec<AroundHook>,
    /// Variable definitions visible to this case, outermost first.
    pub(crate) defs: Vec<VarDef>,
    pub(crate) block: TestBlock,
    /// Nearest enclosing retry strategy, if any.
    pub(crate) retry: Option<Arc<dyn RetryStrategy>>,
    pub(crate) parallel: bool,
    /// Set when an enclosing scope skipped the subtree.
    pub(crate) skip: Option<String>,
    pub(crate) skip_benchmark: bool,
    /// Union of tags along the scope chain.
    pub(crate) tags: BTreeSet<String>,
    /// Indices into [`Plan::scopes`], root first.
    pub(crate) scope_ids: Vec<usize>,
    /// Tag-excluded cases stay in the plan and skip at run time.
    pub(crate) excluded: bool,
}

/// Once-per-scope suite hooks plus the countdown that triggers after-all.
pub(crate) struct ScopeState {
    before_all: Vec<SuiteHook>,
    after_all: Vec<SuiteHook>,
    latch: Once,
    remaining: AtomicUsize,
}

impl ScopeState {
    /// Fires the scope's before-all hooks exactly once, under the suite
    /// reporter. A failing hook marks the suite failed; later cases under
    /// the scope still run.
    pub(crate) fn run_before_all(&self, host: &Arc<dyn Reporter>) {
        self.latch.call_once(|| {
            for hook in &self.before_all {
                if let Outcome::Panicked(payload) = sandbox::run(|| hook(&**host)) {
                    host.error(&sandbox::panic_message(&payload));
                }
            }
        });
    }

    /// Counts one case as finished; the last one out fires the after-all
    /// hooks in reverse registration order.
    pub(crate) fn case_finished(&self, host: &Arc<dyn Reporter>) {
        if self.remaining.fetch_sub(1, AtomicOrdering::SeqCst) != 1 {
            return;
        }
        for hook in self.after_all.iter().rev() {
            if let Outcome::Panicked(payload) = sandbox::run(|| hook(&**host)) {
                host.error(&sandbox::panic_message(&payload));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(AtomicOrdering::SeqCst)
    }
}

pub(crate) struct Plan {
    pub(crate) cases: Vec<CasePlan>,
    pub(crate) scopes: Vec<ScopeState>,
    pub(crate) seed: i64,
}

/// The state inherited down one root-to-leaf path. Cloned at every scope
/// boundary; everything heavy inside is reference-counted.
#[derive(Clone)]
struct Chain {
    parts: Vec<String>,
    arounds: Vec<AroundHook>,
    defs: Vec<VarDef>,
    tags: BTreeSet<String>,
    retry: Option<Arc<dyn RetryStrategy>>,
    parallel: bool,
    sequential: bool,
    skip: Option<String>,
    skip_benchmark: bool,
    scope_ids: Vec<usize>,
}

impl Chain {
    fn root() -> Self {
        Chain {
            parts: Vec::new(),
            arounds: Vec::new(),
            defs: Vec::new(),
            tags: BTreeSet::new(),
            retry: None,
            parallel: false,
            sequential: false,
            skip: None,
            skip_benchmark: false,
            scope_ids: Vec::new(),
        }
    }

    fn case_name(&self, desc: &str) -> String {
        let mut parts: Vec<&str> = self.parts.iter().map(String::as_str).collect();
        if !desc.is_empty() {
            parts.push(desc);
        }
        parts.join("/")
    }
}

struct Builder<'a> {
    cfg: &'a Config,
    rng: StdRng,
    cases: Vec<CasePlan>,
    hooks: Vec<(Vec<SuiteHook>, Vec<SuiteHook>)>,
    counts: Vec<usize>,
}

pub(crate) fn flatten(root: SpecNode, cfg: &Config) -> Plan {
    let mut builder = Builder {
        cfg,
        rng: StdRng::seed_from_u64(cfg.seed as u64),
        cases: Vec::new(),
        hooks: Vec::new(),
        counts: Vec::new(),
    };
    builder.walk(root, Chain::root());

    let scopes = builder
        .hooks
        .into_iter()
        .zip(builder.counts)
        .map(|((before_all, after_all), count)| ScopeState {
            before_all,
            after_all,
            latch: Once::new(),
            remaining: AtomicUsize::new(count),
        })
        .collect();

    Plan {
        cases: builder.cases,
        scopes,
        seed: cfg.seed,
    }
}

impl Builder<'_> {
    fn walk(&mut self, node: SpecNode, inherited: Chain) {
        let scope_id = self.hooks.len();
        self.hooks.push((node.before_all, node.after_all));
        self.counts.push(0);

        let mut chain = inherited;
        chain.scope_ids.push(scope_id);
        if let Some(group) = &node.group {
            chain.parts.push(group.clone());
        }
        if !node.desc.is_empty() {
            chain.parts.push(node.desc.clone());
        }
        chain.arounds.extend(node.arounds.iter().cloned());
        chain.defs.extend(node.defs.iter().cloned());
        chain.tags.extend(node.tags.iter().cloned());
        if node.retry.is_some() {
            chain.retry = node.retry.clone();
        }
        if node.sequential {
            chain.sequential = true;
            chain.parallel = false;
        }
        if node.parallel && !chain.sequential {
            chain.parallel = true;
        }
        if chain.skip.is_none() {
            chain.skip = node.skip.clone();
        }
        chain.skip_benchmark |= node.skip_benchmark;

        let mut children = node.children;
        if self.cfg.ordering == Ordering::Random {
            children.shuffle(&mut self.rng);
        }

        for child in children {
            match child {
                Child::Scope(scope) => self.walk(scope, chain.clone()),
                Child::Test(test) => {
                    if !self.cfg.tag_included(&chain.tags) {
                        continue;
                    }
                    for &sid in &chain.scope_ids {
                        self.counts[sid] += 1;
                    }
                    self.cases.push(CasePlan {
                        name: chain.case_name(&test.desc),
                        arounds: chain.arounds.clone(),
                        defs: chain.defs.clone(),
                        block: test.block,
                        retry: chain.retry.clone(),
                        parallel: chain.parallel,
                        skip: chain.skip.clone(),
                        skip_benchmark: chain.skip_benchmark,
                        tags: chain.tags.clone(),
                        scope_ids: chain.scope_ids.clone(),
                        excluded: self.cfg.tag_excluded(&chain.tags),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Ordering};
    use crate::reporter::NullReporter;
    use crate::spec::{Spec, SpecNode};
    use std::collections::HashMap;

    fn build(body: impl FnOnce(&mut Spec<'_>)) -> SpecNode {
        let mut root = SpecNode::new("");
        let mut seen = HashMap::new();
        let reporter = NullReporter::new().as_reporter();
        let mut spec = Spec::root(&mut root, &mut seen, reporter);
        body(&mut spec);
        root
    }

    fn names(plan: &Plan) -> Vec<String> {
        plan.cases.iter().map(|c| c.name.clone()).collect()
    }

    fn wide_tree(s: &mut Spec<'_>) {
        for scope in ["alpha", "beta", "gamma", "delta"] {
            s.context(scope, |s| {
                for case in ["one", "two", "three"] {
                    s.test(case, |_| {});
                }
            });
        }
    }

    #[test]
    fn defined_ordering_preserves_declaration_order() {
        let plan = flatten(
            build(wide_tree),
            &Config::for_testing(7, Ordering::Defined),
        );
        assert_eq!(
            names(&plan)[..4],
            [
                "alpha/one".to_string(),
                "alpha/two".to_string(),
                "alpha/three".to_string(),
                "beta/one".to_string(),
            ]
        );
    }

    #[test]
    fn same_seed_same_order() {
        let a = flatten(build(wide_tree), &Config::for_testing(1234, Ordering::Random));
        let b = flatten(build(wide_tree), &Config::for_testing(1234, Ordering::Random));
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn different_seeds_eventually_differ() {
        let reference = names(&flatten(
            build(wide_tree),
            &Config::for_testing(0, Ordering::Random),
        ));
        let changed = (1..50).any(|seed| {
            names(&flatten(
                build(wide_tree),
                &Config::for_testing(seed, Ordering::Random),
            )) != reference
        });
        assert!(changed, "12 cases must not survive 49 reshuffles untouched");
    }

    #[test]
    fn shuffling_keeps_scopes_contiguous() {
        for seed in 0..20 {
            let plan = flatten(
                build(wide_tree),
                &Config::for_testing(seed, Ordering::Random),
            );
            let mut seen_prefixes: Vec<String> = Vec::new();
            for name in names(&plan) {
                let prefix = name.split('/').next().unwrap().to_string();
                if seen_prefixes.last() != Some(&prefix) {
                    assert!(
                        !seen_prefixes.contains(&prefix),
                        "scope {prefix} was split apart at seed {seed}"
                    );
                    seen_prefixes.push(prefix);
                }
            }
        }
    }

    #[test]
    fn group_labels_join_the_case_path() {
        let plan = flatten(
            build(|s| {
                s.context("storage", |s| {
                    s.group("smoke");
                    s.test("opens", |_| {});
                });
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        assert_eq!(names(&plan), vec!["smoke/storage/opens".to_string()]);
    }

    #[test]
    fn nearest_retry_strategy_wins() {
        let plan = flatten(
            build(|s| {
                s.retry(crate::retry::Count(5));
                s.context("inner", |s| {
                    s.retry(crate::retry::Count(1));
                    s.test("t", |_| {});
                });
                s.test("outer", |_| {});
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        assert!(plan.cases.iter().all(|c| c.retry.is_some()));
    }

    #[test]
    fn sequential_is_irreversible() {
        let plan = flatten(
            build(|s| {
                s.sequential();
                s.context("inner", |s| {
                    s.parallel();
                    s.test("t", |_| {});
                });
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        assert!(!plan.cases[0].parallel);
    }

    #[test]
    fn parallel_propagates_to_descendants() {
        let plan = flatten(
            build(|s| {
                s.parallel();
                s.context("inner", |s| s.test("t", |_| {}));
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        assert!(plan.cases[0].parallel);
    }

    #[test]
    fn include_filter_drops_cases_at_flatten_time() {
        let mut cfg = Config::for_testing(0, Ordering::Defined);
        cfg.include.insert("fast".to_string());
        let plan = flatten(
            build(|s| {
                s.context("tagged", |s| {
                    s.tag("fast");
                    s.test("kept", |_| {});
                });
                s.test("untagged", |_| {});
            }),
            &cfg,
        );
        assert_eq!(names(&plan), vec!["tagged/kept".to_string()]);
    }

    #[test]
    fn excluded_cases_stay_in_the_plan() {
        let mut cfg = Config::for_testing(0, Ordering::Defined);
        cfg.exclude.insert("slow".to_string());
        let plan = flatten(
            build(|s| {
                s.context("tagged", |s| {
                    s.tag("slow");
                    s.test("skipped at run time", |_| {});
                });
            }),
            &cfg,
        );
        assert_eq!(plan.cases.len(), 1);
        assert!(plan.cases[0].excluded);
    }

    #[test]
    fn scope_counts_cover_the_whole_subtree() {
        let plan = flatten(
            build(|s| {
                s.context("outer", |s| {
                    s.test("a", |_| {});
                    s.context("inner", |s| s.test("b", |_| {}));
                });
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        // root and "outer" cover both cases, "inner" covers one
        assert_eq!(plan.scopes[0].remaining(), 2);
        assert_eq!(plan.scopes[1].remaining(), 2);
        assert_eq!(plan.scopes[2].remaining(), 1);
    }

    #[test]
    fn outermost_skip_reason_wins() {
        let plan = flatten(
            build(|s| {
                s.context("outer", |s| {
                    s.skip("outer reason");
                    s.context("inner", |s| {
                        s.skip("inner reason");
                        s.test("t", |_| {});
                    });
                });
            }),
            &Config::for_testing(0, Ordering::Defined),
        );
        assert_eq!(plan.cases[0].skip.as_deref(), Some("outer reason"));
    }
}
