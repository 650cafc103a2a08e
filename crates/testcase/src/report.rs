//! Styled console output for the bundled harness reporter.

use std::io::{self, Write};
use std::time::Duration;

use crate::types::{SuiteResult, TestOutcome};

fn use_color() -> bool {
    std::env::var("NO_COLOR").is_err()
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

fn styled(code: &str, text: &str) -> String {
    if use_color() {
        format!("{}{}{}", code, text, RESET)
    } else {
        text.to_string()
    }
}

pub(crate) fn print_header(seed: i64) {
    println!(
        "\n{} {}\n",
        styled(BOLD, &format!("testcase v{}", env!("CARGO_PKG_VERSION"))),
        styled(DIM, &format!("(seed: {})", seed)),
    );
}

pub(crate) fn print_case_result(name: &str, outcome: &TestOutcome, duration: Duration) {
    let timing = format!("({:.1}ms)", duration.as_secs_f64() * 1000.0);
    match outcome {
        TestOutcome::Passed => {
            println!("  {} {} {}", styled(GREEN, "✓"), name, styled(DIM, &timing));
        }
        TestOutcome::Failed => {
            println!("  {} {} {}", styled(RED, "✗"), name, styled(DIM, &timing));
        }
        TestOutcome::Skipped => {
            println!("  {} {}", styled(YELLOW, "↷"), styled(DIM, name));
        }
    }
}

pub(crate) fn print_message(text: &str) {
    for line in text.lines() {
        println!("    {}", styled(DIM, line));
    }
}

pub(crate) fn print_failure(text: &str) {
    for line in text.lines() {
        println!("    {}", styled(RED, line));
    }
}

pub(crate) fn print_summary(result: &SuiteResult) {
    let total = result.results.len();
    let passed = result.passed();
    let failed = result.failed();
    let skipped = result.skipped();
    let total_ms = result.total_duration.as_secs_f64() * 1000.0;

    println!();

    let mut parts = vec![styled(GREEN, &format!("{} passed", passed))];
    if failed > 0 {
        parts.push(styled(RED, &format!("{} failed", failed)));
    }
    if skipped > 0 {
        parts.push(styled(YELLOW, &format!("{} skipped", skipped)));
    }
    println!(
        "{} {}, {} total",
        styled(BOLD, "Results:"),
        parts.join(", "),
        total,
    );

    println!("{} {:.1}ms", styled(BOLD, "Time:"), total_ms);
    println!(
        "{} {} (reproduce with TESTCASE_SEED={})",
        styled(BOLD, "Seed:"),
        result.seed,
        result.seed,
    );
    println!();

    let _ = io::stdout().flush();
}
