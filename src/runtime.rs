//! Step orchestrator: drives a scenario through a knowledge store.
//!
//! One step is one transition:
//!
//! 1. apply type assignments and register newly typed events,
//! 2. apply retractions, then assertions, then updates,
//! 3. if a location fact was retracted: re-run inference and ask the
//!    [`CausalMatcher`] about every such retraction,
//! 4. on any unexplained retraction, hand the gap to the caller and halt,
//! 5. otherwise apply deletions (unregister, then destroy) and advance.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::causal::{CausalMatcher, Explanation, MatcherConfig};
use crate::kb::{Fact, KnowledgeStore, MemoryStore, TBox};
use crate::scenario::{Scenario, Step};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub matcher: MatcherConfig,
    /// Budget for one reasoning call.
    pub reasoner_budget: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            reasoner_budget: Duration::from_secs(30),
        }
    }
}

/// Wall-clock time of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTiming {
    /// `<index>:<name>:step_total`
    pub label: String,
    pub seconds: f64,
}

/// Payload handed to the caller when a step leaves retractions unexplained.
pub struct UnexplainedEvent<'a, S: ?Sized> {
    pub scenario_id: &'a str,
    pub step: &'a Step,
    pub step_index: usize,
    pub errors: &'a [String],
    pub unexplained: &'a [Fact],
    pub timings: &'a [StepTiming],
    /// The live store, as it stands after the failed step.
    pub store: &'a S,
}

/// Where the run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Halt {
    pub step_index: usize,
    pub step_name: String,
}

/// Summary of a scenario run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub scenario_id: String,
    pub steps_completed: usize,
    pub halted: Option<Halt>,
    pub explanations: Vec<Explanation>,
    pub errors: Vec<String>,
    pub unexplained: Vec<Fact>,
    pub timings: Vec<StepTiming>,
}

impl RunReport {
    pub fn is_fully_explained(&self) -> bool {
        self.halted.is_none()
    }
}

/// Run `scenario` without an unexplained-gap callback.
pub fn run_scenario<S: KnowledgeStore>(
    store: &mut S,
    scenario: &Scenario,
    config: &ExperimentConfig,
) -> RunReport {
    run_experiment(store, scenario, config, |_| {})
}

/// Run `scenario` against `store`, calling `on_unexplained` for the first
/// step that leaves a retraction unexplained. The run halts after that step.
pub fn run_experiment<S, F>(
    store: &mut S,
    scenario: &Scenario,
    config: &ExperimentConfig,
    mut on_unexplained: F,
) -> RunReport
where
    S: KnowledgeStore,
    F: FnMut(&UnexplainedEvent<'_, S>),
{
    let mut matcher = CausalMatcher::new(&*store, config.matcher.clone());
    let mut report = RunReport {
        scenario_id: scenario.id.clone(),
        ..Default::default()
    };

    tracing::info!(scenario = %scenario.id, steps = scenario.steps.len(), "starting experiment");
    for (i, step) in scenario.steps.iter().enumerate() {
        let index = i + 1;
        let t_step = Instant::now();
        tracing::info!(step = index, name = %step.name, "step");

        if !step.types.is_empty() {
            apply_types(store, &step.types);
            matcher.register_new_types(&*store, &step.types, index, &step.tags);
        }
        apply_triples(store, step);

        let to_check = retractions_to_check(step, &config.matcher);
        if !to_check.is_empty() {
            if scenario.enable_reasoner {
                reason(store, &step.name, config.reasoner_budget);
            } else {
                tracing::info!(step = %step.name, "reasoning skipped (disabled for scenario)");
            }

            let validation = matcher.validate_step(store, &step.name, index, &to_check);
            if !validation.errors.is_empty() {
                for msg in &validation.errors {
                    tracing::warn!(step = index, "{msg}");
                }
                report.timings.push(timing(index, &step.name, t_step));
                on_unexplained(&UnexplainedEvent {
                    scenario_id: &scenario.id,
                    step,
                    step_index: index,
                    errors: &validation.errors,
                    unexplained: &validation.unexplained,
                    timings: &report.timings,
                    store: &*store,
                });
                report.explanations.extend(validation.explanations);
                report.errors = validation.errors;
                report.unexplained = validation.unexplained;
                report.halted = Some(Halt {
                    step_index: index,
                    step_name: step.name.clone(),
                });
                break;
            }
            for exp in &validation.explanations {
                tracing::info!(cause = %exp.cause, retraction = %exp.retraction, "explained");
            }
            report.explanations.extend(validation.explanations);
        }

        if !step.deletes.is_empty() {
            matcher.unregister_deleted(&step.deletes);
            delete_instances(store, &step.deletes);
        }

        report.timings.push(timing(index, &step.name, t_step));
        report.steps_completed = index;
    }

    tracing::info!(
        scenario = %scenario.id,
        completed = report.steps_completed,
        halted = report.halted.is_some(),
        "experiment finished"
    );
    report
}

/// Owned copy of an unexplained step and the store around it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapSnapshot {
    pub step_index: usize,
    pub step_name: String,
    pub errors: Vec<String>,
    pub unexplained: Vec<Fact>,
    /// Names of every live individual.
    pub entities: BTreeSet<String>,
    /// Every object-property fact of the store.
    pub facts: Vec<Fact>,
}

impl GapSnapshot {
    pub fn capture<S: KnowledgeStore + ?Sized>(event: &UnexplainedEvent<'_, S>) -> Self {
        let store = event.store;
        Self {
            step_index: event.step_index,
            step_name: event.step.name.clone(),
            errors: event.errors.to_vec(),
            unexplained: event.unexplained.to_vec(),
            entities: store
                .individuals()
                .into_iter()
                .filter_map(|id| store.entity_name(id).map(str::to_string))
                .collect(),
            facts: store.facts(),
        }
    }
}

/// Run `scenario` on a fresh [`MemoryStore`] and keep a snapshot of the
/// first gap, if any.
pub fn run_to_gap(
    scenario: &Scenario,
    tbox: Arc<TBox>,
    config: &ExperimentConfig,
) -> (RunReport, Option<GapSnapshot>) {
    let mut store = MemoryStore::new(tbox);
    let mut gap = None;
    let report = run_experiment(&mut store, scenario, config, |ev| {
        gap = Some(GapSnapshot::capture(ev));
    });
    (report, gap)
}

fn timing(index: usize, name: &str, start: Instant) -> StepTiming {
    StepTiming {
        label: format!("{index}:{name}:step_total"),
        seconds: start.elapsed().as_secs_f64(),
    }
}

/// Location retractions of a step, plus old location values of updates when
/// the matcher is configured to explain them.
fn retractions_to_check(step: &Step, matcher: &MatcherConfig) -> Vec<Fact> {
    let mut out: Vec<Fact> = step
        .retracts
        .iter()
        .filter(|r| matcher.is_location_property(&r.predicate))
        .cloned()
        .collect();
    if matcher.explain_updates {
        out.extend(
            step.updates
                .iter()
                .filter(|u| matcher.is_location_property(&u.property))
                .map(|u| u.old_fact()),
        );
    }
    out
}

fn reason<S: KnowledgeStore>(store: &mut S, label: &str, budget: Duration) {
    match store.reason(budget) {
        Ok(stats) => tracing::info!(
            step = label,
            rounds = stats.rounds,
            added = stats.added,
            secs = stats.elapsed.as_secs_f64(),
            "reasoned"
        ),
        Err(e) => tracing::warn!(step = label, error = %e, "reasoning incomplete, matching on partial inferences"),
    }
}

/// Type every listed individual, creating it if needed.
pub fn apply_types<S: KnowledgeStore>(store: &mut S, typings: &[(String, String)]) {
    for (inst, class_name) in typings {
        let Some(class) = store.resolve_class(class_name) else {
            tracing::warn!(class = %class_name, "class not found for typing, skipped");
            continue;
        };
        store.create_individual(inst, class);
    }
}

/// Apply a step's retractions, then assertions, then updates.
pub fn apply_triples<S: KnowledgeStore>(store: &mut S, step: &Step) {
    for r in &step.retracts {
        let Some(p) = store.resolve_property(&r.predicate) else {
            tracing::warn!(property = %r.predicate, "property not found (retract), skipped");
            continue;
        };
        let (Some(s), Some(o)) = (store.resolve_entity(&r.subject), store.resolve_entity(&r.object))
        else {
            tracing::debug!(fact = %r, "retracted fact mentions an unknown individual");
            continue;
        };
        if !store.remove_value(s, p, o) {
            tracing::debug!(fact = %r, "retracted fact was not present");
        }
    }

    for a in &step.asserts {
        let Some(p) = store.resolve_property(&a.predicate) else {
            tracing::warn!(property = %a.predicate, "property not found (assert), skipped");
            continue;
        };
        let s = store.ensure_individual(&a.subject);
        let o = store.ensure_individual(&a.object);
        store.add_value(s, p, o);
    }

    for u in &step.updates {
        let Some(p) = store.resolve_property(&u.property) else {
            tracing::warn!(property = %u.property, "property not found (update), skipped");
            continue;
        };
        let s = store.ensure_individual(&u.subject);
        if let Some(old) = store.resolve_entity(&u.old) {
            store.remove_value(s, p, old);
        }
        let new = store.ensure_individual(&u.new);
        store.add_value(s, p, new);
    }
}

/// Destroy the named individuals.
pub fn delete_instances<S: KnowledgeStore>(store: &mut S, names: &[String]) {
    for name in names {
        match store.resolve_entity(name) {
            Some(id) => {
                store.destroy_individual(id);
                tracing::info!(name = %name, "destroyed individual");
            }
            None => tracing::warn!(name = %name, "cannot delete unknown individual"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kb::{MemoryStore, TBox};

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(TBox::bundled().unwrap()))
    }

    #[test]
    fn update_replaces_old_value() {
        let mut s = store();
        let mut step = Step::new("Init");
        step.asserts = vec![Fact::new("Med", "DUL.hasLocation", "Hall")];
        apply_triples(&mut s, &step);

        let mut mv = Step::new("Move");
        mv.updates = vec![crate::scenario::Update {
            subject: "Med".into(),
            property: "hasLocation".into(),
            old: "Hall".into(),
            new: "Tray".into(),
        }];
        apply_triples(&mut s, &mv);

        let med = s.resolve_entity("Med").unwrap();
        let loc = s.resolve_property("hasLocation").unwrap();
        let names: Vec<_> = s
            .values(med, loc)
            .into_iter()
            .filter_map(|v| s.entity_name(v).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["Tray"]);
    }

    #[test]
    fn unknown_class_and_property_are_skipped() {
        let mut s = store();
        apply_types(&mut s, &[("X".into(), "NoSuchClass".into())]);
        assert!(s.resolve_entity("X").is_none());

        let mut step = Step::new("Bad");
        step.asserts = vec![Fact::new("A", "noSuchProp", "B")];
        apply_triples(&mut s, &step);
        assert!(s.facts().is_empty());
    }

    #[test]
    fn non_location_retraction_does_not_trigger_matching() {
        let mut s = store();
        let mut init = Step::new("Init");
        init.asserts = vec![Fact::new("Nurse", "hasPlan", "Plan")];
        let mut drop = Step::new("Drop_plan");
        drop.retracts = vec![Fact::new("Nurse", "hasPlan", "Plan")];
        let scenario = Scenario::inline("plan", vec![init, drop]);

        let report = run_scenario(&mut s, &scenario, &ExperimentConfig::default());
        assert!(report.is_fully_explained());
        assert_eq!(report.steps_completed, 2);
        assert_eq!(report.timings[1].label, "2:Drop_plan:step_total");
        assert!(s.resolve_entity("Ep_2_Nurse_hasPlan_Plan").is_none());
    }

    #[test]
    fn halts_on_first_gap_and_skips_deletes() {
        let mut s = store();
        let mut init = Step::new("Init");
        init.types = vec![("Box".into(), "PhysicalObject".into())];
        init.asserts = vec![Fact::new("Box", "hasLocation", "Shelf")];
        let mut vanish = Step::new("Vanish");
        vanish.retracts = vec![Fact::new("Box", "hasLocation", "Shelf")];
        vanish.deletes = vec!["Shelf".into()];
        let after = Step::new("After");
        let scenario = Scenario::inline("gap", vec![init, vanish, after]);

        let mut calls = Vec::new();
        let report = run_experiment(&mut s, &scenario, &ExperimentConfig::default(), |ev| {
            calls.push((ev.step_index, ev.step.name.clone(), ev.unexplained.to_vec()));
            assert!(ev.store.resolve_entity("Box").is_some());
        });

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 2);
        assert_eq!(calls[0].2, vec![Fact::new("Box", "hasLocation", "Shelf")]);
        assert_eq!(
            report.halted,
            Some(Halt {
                step_index: 2,
                step_name: "Vanish".into()
            })
        );
        assert_eq!(report.steps_completed, 1);
        assert_eq!(report.timings.len(), 2);
        assert!(s.resolve_entity("Shelf").is_some());
    }

    #[test]
    fn explain_updates_matches_old_value() {
        let mut cfg = ExperimentConfig::default();
        cfg.matcher.explain_updates = true;
        let mut mv = Step::new("Move");
        mv.updates = vec![crate::scenario::Update {
            subject: "Box".into(),
            property: "DUL.hasLocation".into(),
            old: "Shelf".into(),
            new: "Floor".into(),
        }];
        let checks = retractions_to_check(&mv, &cfg.matcher);
        assert_eq!(checks, vec![Fact::new("Box", "DUL.hasLocation", "Shelf")]);
        assert!(retractions_to_check(&mv, &MatcherConfig::default()).is_empty());
    }

    #[test]
    fn snapshot_keeps_live_entities_and_facts() {
        let scenario = Scenario::bundled("medicine_lost").unwrap();
        let tbox = Arc::new(scenario.build_tbox().unwrap());
        let (report, gap) = run_to_gap(&scenario, tbox, &ExperimentConfig::default());
        let gap = gap.expect("medicine_lost halts");
        assert_eq!(report.halted.as_ref().map(|h| h.step_index), Some(6));
        assert_eq!(gap.step_name, "Unexpected_event");
        assert_eq!(gap.unexplained.len(), 1);
        assert!(gap.entities.contains("Agent_Shadow"));
        assert!(gap.entities.contains("PhysicalObject_Medicine1"));
        assert!(!gap.entities.contains("Action_PlaceMedicine"));
        assert!(!gap.facts.is_empty());
    }
}
