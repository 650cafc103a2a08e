//! Deferred-teardown stack.
//!
//! The engine owns its teardown list instead of leaning on the host
//! harness's cleanup API so it can guarantee two things: teardowns run in
//! reverse registration order, and one failing teardown never skips the
//! rest. Hook teardowns and user `defer` calls share the same stack.

use std::cell::RefCell;
use std::panic::resume_unwind;

use crate::context::TestContext;
use crate::sandbox::{self, Outcome};

/// A teardown entry; receives the test context it runs under.
pub(crate) type TeardownFn = Box<dyn FnOnce(&TestContext)>;

pub struct Teardown {
    stack: RefCell<Vec<TeardownFn>>,
}

impl Teardown {
    pub(crate) fn new() -> Self {
        Teardown {
            stack: RefCell::new(Vec::new()),
        }
    }

    /// Registers a callback. Safe to call from within a running teardown;
    /// the new entry joins the same drain.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.push(Box::new(move |_| f()));
    }

    pub(crate) fn push(&self, f: TeardownFn) {
        self.stack.borrow_mut().push(f);
    }

    /// Drains the stack last-in-first-out. Every entry runs inside an
    /// isolation wrapper: an early exit (`fail_now`/`skip_now`) moves on to
    /// the next entry, and a panic is re-raised only after the whole stack
    /// has drained.
    pub(crate) fn finish(&self, t: &TestContext) {
        let mut first_panic = None;
        loop {
            let next = self.stack.borrow_mut().pop();
            let Some(f) = next else { break };
            if let Outcome::Panicked(payload) = sandbox::run(|| f(t)) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::TestContext;
    use crate::sandbox::{self, Outcome};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn trace() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn drains_in_reverse_registration_order() {
        let ctx = TestContext::stub();
        let t = trace();

        for label in ["a", "b", "c"] {
            let t = Rc::clone(&t);
            ctx.defer(move || t.borrow_mut().push(label));
        }
        ctx.finish();

        assert_eq!(*t.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn a_panicking_teardown_does_not_skip_the_rest() {
        let ctx = TestContext::stub();
        let t = trace();

        {
            let t = Rc::clone(&t);
            ctx.defer(move || t.borrow_mut().push("survivor"));
        }
        ctx.defer(|| panic!("teardown failed"));

        match sandbox::run(|| ctx.finish()) {
            Outcome::Panicked(p) => {
                assert_eq!(sandbox::panic_message(&p), "teardown failed");
            }
            _ => panic!("the teardown panic must be re-raised after the drain"),
        }
        assert_eq!(*t.borrow(), vec!["survivor"]);
    }

    #[test]
    fn defer_during_finish_joins_the_same_drain() {
        let ctx = TestContext::stub();
        let t = trace();

        let inner_trace = Rc::clone(&t);
        let ctx_handle = Rc::new(ctx);
        let ctx_for_defer = Rc::clone(&ctx_handle);
        {
            let t = Rc::clone(&t);
            ctx_handle.defer(move || {
                t.borrow_mut().push("outer");
                let t = Rc::clone(&inner_trace);
                ctx_for_defer.defer(move || t.borrow_mut().push("nested"));
            });
        }
        ctx_handle.finish();

        assert_eq!(*t.borrow(), vec!["outer", "nested"]);
    }

    #[test]
    fn only_the_first_panic_payload_is_re_raised() {
        let ctx = TestContext::stub();
        ctx.defer(|| panic!("second registered, first run"));
        ctx.defer(|| panic!("first registered, second run"));

        match sandbox::run(|| ctx.finish()) {
            Outcome::Panicked(p) => {
                assert_eq!(
                    sandbox::panic_message(&p),
                    "first registered, second run",
                    "the panic seen first during the drain wins"
                );
            }
            _ => panic!("expected a re-raised panic"),
        }
    }
}
