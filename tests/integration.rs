//! End-to-end tests for the simulation pipeline.
//!
//! Scenarios run against a real `MemoryStore` over the bundled ontologies,
//! exercising step application, re-inference, the causal matcher and the
//! halting behaviour together.

use std::sync::Arc;

use causa::causal::CausalMatcher;
use causa::kb::{Fact, KnowledgeStore, MemoryStore};
use causa::runtime::{run_experiment, run_scenario, run_to_gap, ExperimentConfig};
use causa::scenario::{Scenario, Step, Update};

fn store_for(scenario: &Scenario) -> MemoryStore {
    MemoryStore::new(Arc::new(scenario.build_tbox().unwrap()))
}

fn fact(s: &str, p: &str, o: &str) -> Fact {
    Fact::new(s, p, o)
}

/// Tray world where the placing event stays alive until the medicine vanishes.
fn tray_scenario() -> Scenario {
    let mut init = Step::new("Init");
    init.types = [
        ("Agent_Nurse", "DUL.Agent"),
        ("Agent_Shadow", "DUL.Agent"),
        ("PhysicalPlace_Hospital", "DUL.PhysicalPlace"),
        ("PhysicalPlace_Hall", "DUL.PhysicalPlace"),
        ("PhysicalObject_ShadowTray", "DUL.PhysicalObject"),
        ("PhysicalObject_Medicine1", "DUL.PhysicalObject"),
        ("Task_PlaceMedicine", "SOMA.Task"),
        ("Task_FollowSupervisor", "DUL.Task"),
    ]
    .map(|(i, c)| (i.to_string(), c.to_string()))
    .to_vec();
    init.asserts = vec![
        fact("PhysicalPlace_Hall", "DUL.hasLocation", "PhysicalPlace_Hospital"),
        fact("Agent_Nurse", "DUL.hasLocation", "PhysicalPlace_Hall"),
        fact("Agent_Shadow", "DUL.hasLocation", "PhysicalPlace_Hall"),
        fact("PhysicalObject_Medicine1", "DUL.hasLocation", "PhysicalPlace_Hall"),
        fact("PhysicalObject_ShadowTray", "DUL.hasLocation", "Agent_Shadow"),
    ];

    let mut place = Step::new("Place_medicine");
    place.types = vec![("Action_PlaceMedicine".into(), "DUL.Action".into())];
    place.asserts = vec![
        fact("Action_PlaceMedicine", "DUL.hasParticipant", "Agent_Nurse"),
        fact("Action_PlaceMedicine", "DUL.hasParticipant", "Agent_Shadow"),
        fact("Action_PlaceMedicine", "DUL.hasParticipant", "PhysicalObject_Medicine1"),
        fact("Action_PlaceMedicine", "DUL.executesTask", "Task_PlaceMedicine"),
    ];
    place.updates = vec![Update {
        subject: "PhysicalObject_Medicine1".into(),
        property: "DUL.hasLocation".into(),
        old: "PhysicalPlace_Hall".into(),
        new: "PhysicalObject_ShadowTray".into(),
    }];

    let idle = Step::new("Idle");

    let mut follow = Step::new("Following");
    follow.tags = vec!["background".into()];
    follow.types = vec![("Action_Follow".into(), "DUL.Action".into())];
    follow.asserts = vec![
        fact("Action_Follow", "DUL.hasParticipant", "Agent_Shadow"),
        fact("Action_Follow", "DUL.hasParticipant", "PhysicalObject_Medicine1"),
        fact("Action_Follow", "DUL.executesTask", "Task_FollowSupervisor"),
    ];

    let idle2 = Step::new("Idle_again");

    let mut vanish = Step::new("Unexpected_event");
    vanish.retracts = vec![fact(
        "PhysicalObject_Medicine1",
        "DUL.hasLocation",
        "PhysicalObject_ShadowTray",
    )];

    Scenario::inline("tray", vec![init, place, idle, follow, idle2, vanish])
}

#[test]
fn nominal_is_explained_by_take_medicine() {
    let scenario = Scenario::bundled("nominal").unwrap();
    let mut store = store_for(&scenario);
    let report = run_scenario(&mut store, &scenario, &ExperimentConfig::default());

    assert!(report.is_fully_explained(), "errors: {:?}", report.errors);
    assert_eq!(report.steps_completed, scenario.steps.len());
    let exp = report
        .explanations
        .iter()
        .find(|e| e.retraction.subject == "PhysicalObject_Medicine1")
        .expect("the medicine retraction is explained");
    assert_eq!(exp.cause, "Action_TakeMedicine");
    assert!(exp.rationale.shared_participant);
    assert!(exp.text.contains("- How: E is classified as event type(s):"));
    // Deleted after its step.
    assert!(store.resolve_entity("Action_TakeMedicine").is_none());
}

#[test]
fn medicine_lost_halts_at_step_six() {
    let scenario = Scenario::bundled("medicine_lost").unwrap();
    let mut store = store_for(&scenario);
    let mut seen = Vec::new();
    let report = run_experiment(&mut store, &scenario, &ExperimentConfig::default(), |ev| {
        seen.push((ev.step_index, ev.step.name.clone(), ev.errors.len()));
    });

    assert_eq!(seen, vec![(6, "Unexpected_event".to_string(), 1)]);
    let halt = report.halted.expect("halted");
    assert_eq!(halt.step_index, 6);
    assert_eq!(report.steps_completed, 5);
    assert_eq!(
        report.unexplained,
        vec![fact(
            "PhysicalObject_Medicine1",
            "DUL.hasLocation",
            "PhysicalObject_ShadowTray"
        )]
    );
    // The change event exists even though nothing explained it.
    let ep = CausalMatcher::change_event_name(&report.unexplained[0], 6);
    assert!(store.resolve_entity(&ep).is_some());
}

#[test]
fn placing_event_wins_within_a_wide_window() {
    let scenario = tray_scenario();
    let mut config = ExperimentConfig::default();
    config.matcher.window = 4;
    let mut store = store_for(&scenario);
    let report = run_scenario(&mut store, &scenario, &config);

    assert!(report.is_fully_explained(), "errors: {:?}", report.errors);
    assert_eq!(report.explanations.len(), 1);
    let exp = &report.explanations[0];
    assert_eq!(exp.cause, "Action_PlaceMedicine");
    assert_eq!(exp.score, 2);

    let r = &exp.rationale;
    assert_eq!(r.birth_step, Some(2));
    assert_eq!(r.step, 6);
    assert!(r.location_compatible);
    assert!(r.event_location.is_some());
    assert_eq!(r.change_location, "PhysicalObject_ShadowTray");
    assert!(r.shared_participant);
    assert!(!r.event_types.is_empty());
    assert!(exp.text.contains("- When: E precedes Ep (birth_step(E)=2 < step(Ep)=6)."));
    assert!(exp.text.contains("-> compatible"));

    let ep = CausalMatcher::change_event_name(&exp.retraction, 6);
    assert!(
        store
            .facts()
            .contains(&fact("Action_PlaceMedicine", "causes", &ep))
    );
}

#[test]
fn background_event_alone_never_explains() {
    // With the default window the placing event is out of reach and only the
    // background follow event remains.
    let scenario = tray_scenario();
    let mut store = store_for(&scenario);
    let report = run_scenario(&mut store, &scenario, &ExperimentConfig::default());

    assert!(!report.is_fully_explained());
    assert!(report.explanations.is_empty());
    assert_eq!(report.halted.map(|h| h.step_index), Some(6));
}

#[test]
fn unknown_subject_is_unexplained_but_recorded() {
    let mut init = Step::new("Init");
    init.types = vec![("PhysicalPlace_Hall".into(), "DUL.PhysicalPlace".into())];
    let mut vanish = Step::new("Vanish");
    vanish.retracts = vec![fact("Ghost", "DUL.hasLocation", "PhysicalPlace_Hall")];
    let scenario = Scenario::inline("ghost", vec![init, vanish]);

    let tbox = Arc::new(scenario.build_tbox().unwrap());
    let (report, gap) = run_to_gap(&scenario, tbox, &ExperimentConfig::default());
    let gap = gap.expect("unresolved subject leaves a gap");
    assert_eq!(gap.step_index, 2);
    assert_eq!(report.unexplained.len(), 1);
    let ep = CausalMatcher::change_event_name(&report.unexplained[0], 2);
    assert!(gap.entities.contains(&ep));
}

#[test]
fn steps_without_location_retractions_skip_matching() {
    let mut init = Step::new("Init");
    init.asserts = vec![fact("Nurse", "DUL.hasParticipant", "Shadow")];
    let mut drop = Step::new("Drop");
    drop.retracts = vec![fact("Nurse", "DUL.hasParticipant", "Shadow")];
    let scenario = Scenario::inline("plain", vec![init, drop]);

    let mut store = store_for(&scenario);
    let report = run_scenario(&mut store, &scenario, &ExperimentConfig::default());
    assert!(report.is_fully_explained());
    assert!(report.explanations.is_empty());
    assert_eq!(report.timings.len(), 2);
    assert_eq!(report.timings[1].label, "2:Drop:step_total");
}
