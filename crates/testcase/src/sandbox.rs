//! Panic isolation for user code.
//!
//! Rust has no goroutine-style early exit, so `fail_now` and `skip_now` are
//! emulated with private panic payloads raised via `panic_any` and recognized
//! only here. Every place the engine invokes user code (test blocks, hooks,
//! teardowns, retry attempts) goes through [`run`], which classifies the
//! unwind instead of letting it tear through the engine.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Payload raised by `Reporter::fail_now`. Absorbed at sandbox boundaries;
/// the reporter has already been marked failed by the time it is raised.
pub(crate) struct FailNowSignal;

/// Payload raised by `Reporter::skip_now`.
pub(crate) struct SkipNowSignal;

pub(crate) enum Outcome {
    Passed,
    FailNow,
    SkipNow,
    Panicked(Box<dyn Any + Send>),
}

impl Outcome {
    #[cfg(test)]
    pub(crate) fn is_abnormal(&self) -> bool {
        !matches!(self, Outcome::Passed)
    }
}

/// Runs `f`, absorbing any unwind and classifying it.
pub(crate) fn run(f: impl FnOnce()) -> Outcome {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Outcome::Passed,
        Err(payload) => {
            if payload.is::<FailNowSignal>() {
                Outcome::FailNow
            } else if payload.is::<SkipNowSignal>() {
                Outcome::SkipNow
            } else {
                Outcome::Panicked(payload)
            }
        }
    }
}

/// Renders a panic payload for display, the same way the host harness does:
/// `&str` and `String` payloads verbatim, anything else a generic marker.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::panic_any;

    #[test]
    fn normal_return_is_passed() {
        assert!(matches!(run(|| {}), Outcome::Passed));
    }

    #[test]
    fn fail_now_signal_is_classified() {
        assert!(matches!(run(|| panic_any(FailNowSignal)), Outcome::FailNow));
    }

    #[test]
    fn skip_now_signal_is_classified() {
        assert!(matches!(run(|| panic_any(SkipNowSignal)), Outcome::SkipNow));
    }

    #[test]
    fn other_panics_keep_their_payload() {
        match run(|| panic!("boom")) {
            Outcome::Panicked(p) => assert_eq!(panic_message(&p), "boom"),
            _ => panic!("expected Panicked"),
        }
    }

    #[test]
    fn panic_message_handles_string_payloads() {
        match run(|| panic_any(format!("dynamic {}", 42))) {
            Outcome::Panicked(p) => assert_eq!(panic_message(&p), "dynamic 42"),
            _ => panic!("expected Panicked"),
        }
    }
}
