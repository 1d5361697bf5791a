//! A/B Allocation
//!
//! Users are bucketed by the parity of the last byte of SHA-256(user_id),
//! so assignment is stable across processes and restarts. Variant B mixes
//! a random-explore half into the baseline list.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Experiment arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbGroup {
    A,
    B,
}

impl AbGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbGroup::A => "A",
            AbGroup::B => "B",
        }
    }

    /// Accepts exactly "A" or "B"
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(AbGroup::A),
            "B" => Some(AbGroup::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for AbGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of a variant-B list an item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbBucket {
    Baseline,
    Explore,
}

/// Resolve the arm for a request.
///
/// A valid explicit override wins; otherwise the user id is hashed.
/// Requests without a user id stay in A.
pub fn resolve_group(user_id: Option<&str>, requested: Option<&str>) -> AbGroup {
    if let Some(group) = requested.and_then(AbGroup::parse) {
        return group;
    }

    match user_id.filter(|id| !id.is_empty()) {
        Some(id) => hashed_group(id),
        None => AbGroup::A,
    }
}

/// Stable arm for a user id
pub fn hashed_group(user_id: &str) -> AbGroup {
    let digest = Sha256::digest(user_id.as_bytes());
    let last = digest[digest.len() - 1];
    let group = if last % 2 == 0 { AbGroup::A } else { AbGroup::B };

    tracing::trace!(
        "A/B bucket for {}: {} (digest {})",
        user_id,
        group,
        hex::encode(&digest[..4])
    );
    group
}

/// Size of the explore half for a variant-B list
pub fn explore_share(limit: usize) -> usize {
    (limit / 2).max(1)
}

/// Strictly alternate baseline and explore items, starting with baseline.
///
/// When one side runs out the rest of the other is appended. Output is
/// capped at `limit`.
pub fn interleave<T>(baseline: Vec<T>, explore: Vec<T>, limit: usize) -> Vec<(T, AbBucket)> {
    let mut out = Vec::with_capacity(limit.min(baseline.len() + explore.len()));
    let mut baseline = baseline.into_iter();
    let mut explore = explore.into_iter();

    loop {
        if out.len() >= limit {
            break;
        }
        let next_baseline = baseline.next();
        let took_baseline = next_baseline.is_some();
        if let Some(item) = next_baseline {
            out.push((item, AbBucket::Baseline));
        }
        if out.len() >= limit {
            break;
        }
        let next_explore = explore.next();
        let took_explore = next_explore.is_some();
        if let Some(item) = next_explore {
            out.push((item, AbBucket::Explore));
        }
        if !took_baseline && !took_explore {
            break;
        }
    }

    out
}
