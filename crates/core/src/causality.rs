#![forbid(unsafe_code)]

//! Vector clock used as the sync causality token.
//!
//! Every store numbers the rows it originates. A token records, per origin store, the highest
//! sequence number its holder has seen. Tokens are compared component-wise. An origin at zero
//! is never stored, so equal tokens are also structurally equal.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct CausalityToken(BTreeMap<String, u64>);

impl CausalityToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, origin: &str) -> u64 {
        self.0.get(origin).copied().unwrap_or(0)
    }

    /// Raises the entry for `origin` to `seq` (never lowers it).
    pub fn observe(&mut self, origin: &str, seq: u64) {
        if seq == 0 {
            return;
        }
        let entry = self.0.entry(origin.to_string()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    pub fn covers(&self, origin: &str, seq: u64) -> bool {
        self.get(origin) >= seq
    }

    /// Component-wise maximum.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (origin, seq) in &other.0 {
            out.observe(origin, *seq);
        }
        out
    }

    /// Every component of `self` is at least the one in `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        other.0.iter().all(|(origin, seq)| self.get(origin) >= *seq)
    }

    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(origin, seq)| (origin.as_str(), *seq))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl PartialOrd for CausalityToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

impl From<BTreeMap<String, u64>> for CausalityToken {
    fn from(entries: BTreeMap<String, u64>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<CausalityToken> for BTreeMap<String, u64> {
    fn from(token: CausalityToken) -> Self {
        token.0
    }
}

impl FromIterator<(String, u64)> for CausalityToken {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut token = Self::new();
        for (origin, seq) in iter {
            token.observe(&origin, seq);
        }
        token
    }
}
