use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Two codes that may never be billed together; the more specific one wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusivePair {
    pub winner: String,
    pub loser: String,
}

impl ExclusivePair {
    pub fn new(winner: &str, loser: &str) -> Self {
        Self { winner: winner.to_string(), loser: loser.to_string() }
    }
}

pub fn enforce_exclusive(
    codes: &BTreeSet<String>,
    pairs: &[ExclusivePair],
) -> (BTreeSet<String>, Vec<ExclusivePair>) {
    let mut kept = codes.clone();
    let mut applied = Vec::new();
    for pair in pairs {
        if kept.contains(&pair.winner) && kept.remove(&pair.loser) {
            applied.push(pair.clone());
        }
    }
    (kept, applied)
}
