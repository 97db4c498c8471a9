//! Freshness token of the bulk bundle.

use std::fmt;

/// Marks the state of the skin collection at the moment it was last mutated.
///
/// Ordered by the latest mutation instant first, then by the number of skins,
/// so a deletion that leaves the newest upload in place still yields a new token.
/// The cache only compares tokens and renders them into artifact names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FreshnessToken {
    latest: Option<i64>,
    population: u64,
}

const EMPTY_KEY: &str = "empty";

impl FreshnessToken {
    /// Token of a collection with no skins at all.
    pub const EMPTY: FreshnessToken = FreshnessToken {
        latest: None,
        population: 0,
    };

    /// `latest` is the unix timestamp (seconds) of the most recent mutation.
    pub fn new(latest: i64, population: u64) -> Self {
        Self {
            latest: Some(latest),
            population,
        }
    }

    /// Render as a filesystem-safe key: `{latest}_{population}` or `empty`.
    pub fn to_key(&self) -> String {
        match self.latest {
            Some(latest) => format!("{}_{}", latest, self.population),
            None => EMPTY_KEY.to_string(),
        }
    }

    /// Parse a key produced by [`FreshnessToken::to_key`].
    ///
    /// Only the canonical rendering is accepted, so distinct keys never map
    /// to the same token.
    pub fn from_key(key: &str) -> Option<Self> {
        if key == EMPTY_KEY {
            return Some(Self::EMPTY);
        }
        let (latest, population) = key.split_once('_')?;
        let token = Self::new(latest.parse().ok()?, population.parse().ok()?);
        (token.to_key() == key).then_some(token)
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}
