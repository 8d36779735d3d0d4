//! Multi-hop context retrieval around the endpoints of a retraction.
//!
//! A plain symbolic subgraph extraction: an entity → facts adjacency index
//! (both directions) and a breadth-first expansion that visits each frontier
//! in sorted order, so the result is a pure function of its inputs.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::kb::Fact;

/// Limits for a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrievalConfig {
    /// Expansion rounds. `0` is treated as `1`: the facts touching the seeds
    /// are always returned, so `hops = 0` never yields an empty context.
    pub hops: usize,
    /// Hard cap on returned facts.
    pub max_facts: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hops: 2,
            max_facts: 80,
        }
    }
}

/// Result of a retrieval.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Facts in first-discovered order.
    pub facts: Vec<Fact>,
    /// Every entity reached, seeds included.
    pub visited: HashSet<String>,
    /// Number of hops actually expanded.
    pub hops_run: usize,
}

/// Extract the facts within `config.hops` of `seeds`.
pub fn retrieve(facts: &[Fact], seeds: &BTreeSet<String>, config: RetrievalConfig) -> RetrievalResult {
    let mut result = RetrievalResult::default();
    if facts.is_empty() || seeds.is_empty() || config.max_facts == 0 {
        return result;
    }

    let mut index: HashMap<&str, Vec<&Fact>> = HashMap::new();
    for f in facts {
        index.entry(f.subject.as_str()).or_default().push(f);
        if f.object != f.subject {
            index.entry(f.object.as_str()).or_default().push(f);
        }
    }

    let mut frontier: BTreeSet<&str> = seeds.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = frontier.iter().copied().collect();
    let mut seen: HashSet<&Fact> = HashSet::new();
    let mut selected: Vec<&Fact> = Vec::new();

    'hops: for _ in 0..config.hops.max(1) {
        result.hops_run += 1;
        let mut next: BTreeSet<&str> = BTreeSet::new();
        for node in &frontier {
            for &f in index.get(node).map(Vec::as_slice).unwrap_or_default() {
                if !seen.insert(f) {
                    continue;
                }
                selected.push(f);
                for end in [f.subject.as_str(), f.object.as_str()] {
                    if !visited.contains(end) {
                        next.insert(end);
                    }
                }
                if selected.len() >= config.max_facts {
                    visited.extend(next);
                    break 'hops;
                }
            }
        }
        visited.extend(next.iter().copied());
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }

    tracing::debug!(
        seeds = seeds.len(),
        hops = result.hops_run,
        facts = selected.len(),
        "retrieved context"
    );
    result.facts = selected.into_iter().cloned().collect();
    result.visited = visited.into_iter().map(str::to_string).collect();
    result
}

/// Facts around the subject and object of `retraction`.
pub fn retrieve_subgraph(facts: &[Fact], retraction: &Fact, config: RetrievalConfig) -> Vec<Fact> {
    let seeds: BTreeSet<String> = [&retraction.subject, &retraction.object]
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    retrieve(facts, &seeds, config).facts
}
