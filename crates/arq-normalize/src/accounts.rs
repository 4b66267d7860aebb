//! Budget-code → PGC account mapping.
//!
//! The mapping is external configuration (historically a hand-maintained
//! table covering IAE, water, waste, cemetery fees, …); the engine only
//! consults it. Unmapped codes resolve to `"000"`, matching the upstream
//! convention, so an unknown budget line never fails validation on its own.

use std::collections::BTreeMap;

/// Account to use when a budget code has no mapping.
pub const UNMAPPED_ACCOUNT: &str = "000";

/// Lookup table from budget line (económica) to PGC account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountMap {
    entries: BTreeMap<String, String>,
}

impl AccountMap {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Resolve a budget code, falling back to [`UNMAPPED_ACCOUNT`].
    pub fn lookup(&self, budget_code: &str) -> &str {
        self.entries
            .get(budget_code)
            .map(String::as_str)
            .unwrap_or(UNMAPPED_ACCOUNT)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
