//! Result types produced by a suite run.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    /// Full sub-test path, root scope to leaf, joined with `/`.
    pub name: String,
    pub outcome: TestOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub results: Vec<TestResult>,
    pub seed: i64,
    pub total_duration: Duration,
    /// Set when something outside any single case failed the suite, e.g. a
    /// `before_all` hook or a framework-misuse fatal during definition.
    pub suite_failed: bool,
}

impl SuiteResult {
    pub fn passed(&self) -> usize {
        self.count(TestOutcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestOutcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestOutcome::Skipped)
    }

    pub fn all_passed(&self) -> bool {
        !self.suite_failed && self.failed() == 0
    }

    pub fn result_of(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }

    fn count(&self, outcome: TestOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}
