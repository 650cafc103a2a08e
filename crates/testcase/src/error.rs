//! Framework-misuse errors.
//!
//! Everything in here is a contract violation by the test author, not a test
//! failure: the engine surfaces these as a fatal on the current reporter and
//! moves on to the surrounding test cases. Messages carry the caller's file
//! and line so the offending declaration is one click away.

use std::panic::Location;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error(
        "{location}: cannot add {what} to scope `{scope}`: a test is already declared at this \
         scope; declare the {what} before the first test, or open a child scope"
    )]
    SealedScope {
        what: &'static str,
        scope: String,
        location: &'static Location<'static>,
    },

    #[error(
        "{location}: scope `{scope}` is already marked {existing}; `parallel` and `sequential` \
         are mutually exclusive within one scope"
    )]
    ParallelConflict {
        scope: String,
        existing: &'static str,
        location: &'static Location<'static>,
    },

    #[error(
        "variable `{id}` carries an on-let side effect and must be bound with `bind` or `let_` \
         in an enclosing scope before it can be accessed"
    )]
    UnboundVariable { id: String },

    #[error("variable `{id}` is not defined in the current scope chain; known variables: [{known}]")]
    UnknownVariable { id: String, known: String },

    #[error("variable `{id}` does not hold a value of the requested type")]
    VariableTypeMismatch { id: String },

    #[error(
        "`super_get` on variable `{id}` at depth {depth}, but only {available} shadowed \
         definition(s) exist above the current one"
    )]
    NoSuperDefinition {
        id: String,
        depth: usize,
        available: usize,
    },

    #[error("TESTCASE_SEED must be a 64-bit signed integer, got `{0}`")]
    InvalidSeed(String),

    #[error("TESTCASE_ORDERING must be `defined` or `random`, got `{0}`")]
    InvalidOrdering(String),

    #[error(
        "table case `{case}` supplies a plain datum, but the act is a scope configurator; \
         there is no unambiguous way to combine them. Use a per-case scope configurator \
         or a plain test act"
    )]
    InvalidTableShape { case: String },
}

impl FrameworkError {
    /// Renders the error and the list of known identifiers for an
    /// unknown-variable access.
    pub(crate) fn unknown_variable<'a>(id: &str, known: impl Iterator<Item = &'a str>) -> Self {
        let mut names: Vec<&str> = known.collect();
        names.sort_unstable();
        names.dedup();
        FrameworkError::UnknownVariable {
            id: id.to_string(),
            known: names.join(", "),
        }
    }
}
