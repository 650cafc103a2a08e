//! Process-wide execution configuration.
//!
//! Resolved once from the environment behind a one-shot latch and shared by
//! every suite in the process:
//!
//! | Variable               | Effect                                          |
//! |------------------------|-------------------------------------------------|
//! | `TESTCASE_SEED`        | 64-bit signed seed for all suite randomness     |
//! | `TESTCASE_ORDERING`    | `defined` or `random` (default `random`)        |
//! | `TESTCASE_TAG_INCLUDE` | comma-separated tags; only matching cases run   |
//! | `TESTCASE_TAG_EXCLUDE` | comma-separated tags; matching cases are skipped|
//!
//! Exclude wins over include. When no seed is given one is derived from the
//! wall clock at first use and logged, so a failing shuffle can always be
//! reproduced with `TESTCASE_SEED=<seed>`.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::FrameworkError;

pub(crate) const ENV_SEED: &str = "TESTCASE_SEED";
pub(crate) const ENV_ORDERING: &str = "TESTCASE_ORDERING";
pub(crate) const ENV_TAG_INCLUDE: &str = "TESTCASE_TAG_INCLUDE";
pub(crate) const ENV_TAG_EXCLUDE: &str = "TESTCASE_TAG_EXCLUDE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// Sibling test cases run in definition order.
    Defined,
    /// Sibling groups are shuffled with the suite seed.
    Random,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub seed: i64,
    pub ordering: Ordering,
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

static GLOBAL: OnceLock<Result<Config, FrameworkError>> = OnceLock::new();

impl Config {
    /// The process-wide configuration. Parsed from the environment on first
    /// use; every later call sees the same snapshot.
    pub fn global() -> Result<&'static Config, &'static FrameworkError> {
        GLOBAL
            .get_or_init(|| {
                let cfg = Config::from_lookup(|key| std::env::var(key).ok())?;
                log::debug!(
                    "testcase config: seed={} ordering={:?} include={:?} exclude={:?}",
                    cfg.seed,
                    cfg.ordering,
                    cfg.include,
                    cfg.exclude
                );
                Ok(cfg)
            })
            .as_ref()
    }

    /// Parses a configuration from an arbitrary key lookup.
    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, FrameworkError> {
        let seed = match lookup(ENV_SEED) {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| FrameworkError::InvalidSeed(raw))?,
            None => wall_clock_seed(),
        };

        let ordering = match lookup(ENV_ORDERING) {
            None => Ordering::Random,
            Some(raw) => match raw.trim() {
                "defined" => Ordering::Defined,
                "random" => Ordering::Random,
                _ => return Err(FrameworkError::InvalidOrdering(raw)),
            },
        };

        Ok(Config {
            seed,
            ordering,
            include: parse_tag_list(lookup(ENV_TAG_INCLUDE).as_deref()),
            exclude: parse_tag_list(lookup(ENV_TAG_EXCLUDE).as_deref()),
        })
    }

    /// Whether a case with `tags` should be emitted at all.
    /// A non-empty include list requires an intersection.
    pub(crate) fn tag_included(&self, tags: &BTreeSet<String>) -> bool {
        self.include.is_empty() || tags.iter().any(|t| self.include.contains(t))
    }

    /// Whether a case with `tags` must be skipped. Exclude wins over include.
    pub(crate) fn tag_excluded(&self, tags: &BTreeSet<String>) -> bool {
        tags.iter().any(|t| self.exclude.contains(t))
    }

    #[cfg(test)]
    pub(crate) fn for_testing(seed: i64, ordering: Ordering) -> Config {
        Config {
            seed,
            ordering,
            include: BTreeSet::new(),
            exclude: BTreeSet::new(),
        }
    }
}

fn parse_tag_list(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn wall_clock_seed() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0);
    nanos as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn explicit_seed_is_used() {
        let cfg = Config::from_lookup(lookup_from(&[("TESTCASE_SEED", "42")])).unwrap();
        assert_eq!(cfg.seed, 42);
    }

    #[test]
    fn negative_seed_is_accepted() {
        let cfg = Config::from_lookup(lookup_from(&[("TESTCASE_SEED", "-7")])).unwrap();
        assert_eq!(cfg.seed, -7);
    }

    #[test]
    fn bogus_seed_is_a_configuration_error() {
        let err = Config::from_lookup(lookup_from(&[("TESTCASE_SEED", "banana")])).unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidSeed(_)));
    }

    #[test]
    fn ordering_defaults_to_random() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.ordering, Ordering::Random);
    }

    #[test]
    fn defined_ordering_is_recognized() {
        let cfg = Config::from_lookup(lookup_from(&[("TESTCASE_ORDERING", "defined")])).unwrap();
        assert_eq!(cfg.ordering, Ordering::Defined);
    }

    #[test]
    fn bogus_ordering_is_fatal() {
        let err =
            Config::from_lookup(lookup_from(&[("TESTCASE_ORDERING", "bogus")])).unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidOrdering(_)));
    }

    #[test]
    fn tag_lists_are_split_and_trimmed() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("TESTCASE_TAG_INCLUDE", "fast, unit ,"),
            ("TESTCASE_TAG_EXCLUDE", "slow"),
        ]))
        .unwrap();
        assert!(cfg.include.contains("fast"));
        assert!(cfg.include.contains("unit"));
        assert_eq!(cfg.include.len(), 2);
        assert!(cfg.exclude.contains("slow"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("TESTCASE_TAG_INCLUDE", "integration"),
            ("TESTCASE_TAG_EXCLUDE", "integration"),
        ]))
        .unwrap();
        let tags: BTreeSet<String> = ["integration".to_string()].into();
        assert!(cfg.tag_included(&tags));
        assert!(cfg.tag_excluded(&tags));
    }

    #[test]
    fn empty_include_admits_everything() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert!(cfg.tag_included(&BTreeSet::new()));
    }
}
