use std::collections::BTreeSet;

use crate::normalize::comparison_key;

pub const DEFAULT_ALLOWED: [&str; 5] = ["Open 1", "Open 2", "Open 3", "Access 1", "Access 2"];

/// Decides whether an entrant's competition category is in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFilter {
    allowed: BTreeSet<String>,
    accept_unlabeled: bool,
}

impl Default for CategoryFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED)
    }
}

impl CategoryFilter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|label| label_key(label.as_ref()))
                .filter(|key| !key.is_empty())
                .collect(),
            accept_unlabeled: false,
        }
    }

    /// Whether rows without any category label pass. Sources whose listings
    /// are already filtered upstream turn this on.
    pub fn accept_unlabeled(mut self, accept: bool) -> Self {
        self.accept_unlabeled = accept;
        self
    }

    pub fn is_eligible(&self, label: &str) -> bool {
        let key = label_key(label);
        if key.is_empty() {
            return self.accept_unlabeled;
        }
        self.allowed.contains(&key)
    }
}

fn label_key(label: &str) -> String {
    comparison_key(label)
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect()
}
