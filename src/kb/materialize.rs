//! Forward-chaining materialisation of the TBox rules into the ABox.
//!
//! Each round runs a fixed sequence of passes; a round that adds nothing
//! ends reasoning early. The deadline is checked between passes, so one
//! pass always completes before a timeout is reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use super::memory::MemoryStore;
use super::ontology::PropertyKind;
use super::KnowledgeStore;
use crate::error::{KbError, KbResult};
use crate::symbol::{EntityId, PropertyId};

/// Outcome of one reasoning call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReasoningStats {
    pub rounds: usize,
    pub added: usize,
    pub elapsed: Duration,
}

/// Materialiser configuration.
#[derive(Debug, Clone)]
pub struct Materializer {
    /// Upper bound on rounds; stops earlier on fixpoint.
    pub max_rounds: usize,
    pub include_chains: bool,
    pub include_transitive: bool,
}

impl Default for Materializer {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            include_chains: true,
            include_transitive: true,
        }
    }
}

type Pass = fn(&mut MemoryStore) -> usize;

impl Materializer {
    /// Run all passes over `store` until fixpoint, `max_rounds`, or `budget`.
    pub fn run(&self, store: &mut MemoryStore, budget: Duration) -> KbResult<ReasoningStats> {
        let start = Instant::now();
        let deadline = start + budget;

        let mut passes: Vec<(&str, Pass)> = vec![("subproperty", subproperty_closure as Pass)];
        if self.include_chains {
            passes.push(("chains", property_chains as Pass));
        }
        passes.push(("inverse", inverse_and_symmetric as Pass));
        if self.include_transitive {
            passes.push(("transitive", transitive_closure as Pass));
        }
        passes.push(("domain_range", domain_range_types as Pass));
        passes.push(("subclass", subclass_closure as Pass));

        let mut stats = ReasoningStats::default();
        for round in 1..=self.max_rounds.max(1) {
            let mut added = 0;
            for (name, pass) in &passes {
                if Instant::now() >= deadline {
                    return Err(KbError::ReasonerTimeout {
                        budget_ms: budget.as_millis() as u64,
                        rounds: stats.rounds,
                    });
                }
                let n = pass(store);
                tracing::trace!(round, pass = name, added = n, "materialisation pass");
                added += n;
            }
            stats.rounds = round;
            stats.added += added;
            tracing::debug!(round, added, "materialisation round");
            if added == 0 {
                break;
            }
        }
        stats.elapsed = start.elapsed();
        Ok(stats)
    }
}

// ── Passes ──────────────────────────────────────────────────────────────

fn subproperty_closure(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut added = 0;
    for p in tbox.property_ids() {
        let supers = &tbox.property_info(p).super_properties;
        if supers.is_empty() {
            continue;
        }
        for (s, o) in store.relations(p) {
            for &sp in supers {
                added += usize::from(store.infer_value(s, sp, o));
            }
        }
    }
    added
}

fn successor_map(store: &MemoryStore, p: PropertyId) -> BTreeMap<EntityId, BTreeSet<EntityId>> {
    let mut map: BTreeMap<EntityId, BTreeSet<EntityId>> = BTreeMap::new();
    for (s, o) in store.relations(p) {
        map.entry(s).or_default().insert(o);
    }
    map
}

fn property_chains(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut adjacency: HashMap<PropertyId, BTreeMap<EntityId, BTreeSet<EntityId>>> =
        HashMap::new();
    for p in tbox.object_property_ids() {
        adjacency.insert(p, successor_map(store, p));
    }

    let mut added = 0;
    for p in tbox.object_property_ids() {
        let chain = &tbox.property_info(p).chain;
        if chain.len() < 2 {
            continue;
        }
        let mut current = adjacency.get(&chain[0]).cloned().unwrap_or_default();
        for link in &chain[1..] {
            let empty = BTreeMap::new();
            let next_map = adjacency.get(link).unwrap_or(&empty);
            let mut next = BTreeMap::new();
            for (s, mids) in current {
                let outs: BTreeSet<EntityId> = mids
                    .iter()
                    .filter_map(|m| next_map.get(m))
                    .flatten()
                    .copied()
                    .collect();
                if !outs.is_empty() {
                    next.insert(s, outs);
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        for (s, outs) in current {
            for o in outs {
                added += usize::from(store.infer_value(s, p, o));
            }
        }
    }
    added
}

fn inverse_and_symmetric(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut added = 0;
    for p in tbox.object_property_ids() {
        let info = tbox.property_info(p);
        if info.inverse.is_none() && !info.symmetric {
            continue;
        }
        for (s, o) in store.relations(p) {
            if info.symmetric {
                added += usize::from(store.infer_value(o, p, s));
            }
            if let Some(inv) = info.inverse {
                added += usize::from(store.infer_value(o, inv, s));
            }
        }
    }
    added
}

fn transitive_closure(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut added = 0;
    for p in tbox.object_property_ids() {
        if !tbox.property_info(p).transitive {
            continue;
        }
        let succ = successor_map(store, p);
        for (&s, direct) in &succ {
            let mut frontier: Vec<EntityId> = direct.iter().copied().collect();
            let mut seen: BTreeSet<EntityId> = direct.clone();
            while let Some(mid) = frontier.pop() {
                let Some(next) = succ.get(&mid) else {
                    continue;
                };
                for &o in next {
                    if seen.insert(o) {
                        frontier.push(o);
                    }
                    added += usize::from(store.infer_value(s, p, o));
                }
            }
        }
    }
    added
}

fn domain_range_types(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut added = 0;
    for p in tbox.property_ids() {
        let info = tbox.property_info(p);
        if info.domain.is_empty() && info.range.is_empty() {
            continue;
        }
        for (s, o) in store.relations(p) {
            for &d in &info.domain {
                added += usize::from(store.infer_type(s, d));
            }
            if info.kind == PropertyKind::Object {
                for &r in &info.range {
                    added += usize::from(store.infer_type(o, r));
                }
            }
        }
    }
    added
}

fn subclass_closure(store: &mut MemoryStore) -> usize {
    let tbox = store.tbox_handle();
    let mut added = 0;
    for (x, c) in store.typings() {
        for &a in tbox.class_info(c).ancestors.iter().skip(1) {
            added += usize::from(store.infer_type(x, a));
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kb::TBox;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(TBox::bundled().unwrap()))
    }

    const BUDGET: Duration = Duration::from_secs(5);

    #[test]
    fn subproperty_feeds_classification() {
        let mut s = store();
        let exec = s.resolve_property("executesTask").unwrap();
        let occ = s.resolve_property("isOccurrenceOf").unwrap();
        let classified = s.resolve_property("isClassifiedBy").unwrap();
        let classifies = s.resolve_property("classifies").unwrap();
        let action = s.ensure_individual("Action_PlaceMedicine");
        let task = s.ensure_individual("Task_PlaceMedicine");
        s.add_value(action, exec, task);

        let stats = s.reason(BUDGET).unwrap();
        assert!(stats.added > 0);
        assert_eq!(s.values(action, occ), vec![task]);
        assert_eq!(s.values(action, classified), vec![task]);
        assert_eq!(s.values(task, classifies), vec![action]);
        // Asserted edges stay apart from inferred ones.
        assert!(s.asserted_values(action, occ).is_empty());
    }

    #[test]
    fn transitive_and_inverse() {
        let mut s = store();
        let part_of = s.resolve_property("isPartOf").unwrap();
        let has_part = s.resolve_property("hasPart").unwrap();
        let tray = s.ensure_individual("Tray");
        let robot = s.ensure_individual("Robot");
        let fleet = s.ensure_individual("Fleet");
        s.add_value(tray, part_of, robot);
        s.add_value(robot, part_of, fleet);
        s.reason(BUDGET).unwrap();
        assert!(s.values(tray, part_of).contains(&fleet));
        assert!(s.values(fleet, has_part).contains(&tray));
    }

    #[test]
    fn chain_and_domain_typing() {
        let mut s = store();
        let part = s.resolve_property("hasParticipant").unwrap();
        let loc = s.resolve_property("hasLocation").unwrap();
        let chained = s.resolve_property("isParticipantLocatedIn").unwrap();
        let event = s.resolve_class("Event").unwrap();
        let ev = s.ensure_individual("Ev");
        let nurse = s.ensure_individual("Nurse");
        let hall = s.ensure_individual("Hall");
        s.add_value(ev, part, nurse);
        s.add_value(nurse, loc, hall);
        s.reason(BUDGET).unwrap();
        assert_eq!(s.values(ev, chained), vec![hall]);
        assert!(s.is_instance_of(ev, event));
    }

    #[test]
    fn reasoning_is_recomputed_after_retraction() {
        let mut s = store();
        let exec = s.resolve_property("executesTask").unwrap();
        let occ = s.resolve_property("isOccurrenceOf").unwrap();
        let action = s.ensure_individual("A");
        let task = s.ensure_individual("T");
        s.add_value(action, exec, task);
        s.reason(BUDGET).unwrap();
        s.remove_value(action, exec, task);
        s.reason(BUDGET).unwrap();
        assert!(s.values(action, occ).is_empty());
    }

    #[test]
    fn zero_budget_times_out() {
        let mut s = store();
        s.ensure_individual("A");
        let err = s.reason(Duration::ZERO).unwrap_err();
        assert!(matches!(err, KbError::ReasonerTimeout { rounds: 0, .. }));
    }
}
