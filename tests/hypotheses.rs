//! Hypothesis generation against a scripted model.
//!
//! Every test derives its gap from the `medicine_lost` scenario, so prompts
//! and vocabulary checks see the same live store a real batch would.

use std::sync::Arc;

use causa::batch::{BatchConfig, run_batch};
use causa::hypotheses::{
    self, Candidates, GenerationParams, GenerationRequest, Grounding, HypothesisError,
    PromptLimits, RepairState, SchemaErrorKind, Tier, TierExtras, Violation,
};
use causa::kb::TBox;
use causa::llm::{LlmError, ScriptedTransport};
use causa::runtime::{ExperimentConfig, GapSnapshot, run_to_gap};
use causa::scenario::Scenario;
use serde_json::{Value, json};

struct Fixture {
    scenario: Scenario,
    tbox: Arc<TBox>,
    gap: GapSnapshot,
    grounding: Grounding,
}

impl Fixture {
    fn medicine_lost() -> Self {
        let scenario = Scenario::bundled("medicine_lost").unwrap();
        let tbox = Arc::new(scenario.build_tbox().unwrap());
        let (_, gap) = run_to_gap(&scenario, Arc::clone(&tbox), &ExperimentConfig::default());
        let grounding = Grounding::from_tbox(&tbox, PromptLimits::default().max_event_types);
        Self {
            scenario,
            tbox,
            gap: gap.expect("medicine_lost leaves a gap"),
            grounding,
        }
    }

    fn request(&self) -> GenerationRequest<'_> {
        GenerationRequest {
            retraction: &self.gap.unexplained[0],
            step_name: &self.gap.step_name,
            entities: &self.gap.entities,
            facts: &self.gap.facts,
        }
    }

    fn generate(&self, tier: Tier, transport: &ScriptedTransport) -> hypotheses::GenerationRecord {
        hypotheses::generate(
            tier,
            transport,
            &self.request(),
            &self.grounding,
            &GenerationParams::for_tier(tier),
        )
        .unwrap()
    }
}

/// Three grounded hypotheses, ids suffixed `_H1` to `_H3`.
fn grounded_answer(classes: [&str; 3], participants: &[&str]) -> String {
    let items: Vec<Value> = classes
        .iter()
        .enumerate()
        .map(|(i, class)| {
            let id = format!("{class}_H{}", i + 1);
            json!({
                "title": format!("{class} explains the missing medicine"),
                "event_class": class,
                "event_id": id,
                "participants": participants,
                "where": "PhysicalPlace_Hall",
                "proposed_triples": [
                    [id, "hasParticipant", "PhysicalObject_Medicine1"],
                    [id, "hasParticipant", "PhysicalObject_ShadowTray"],
                    [id, "occursIn", "PhysicalPlace_Hall"],
                ],
            })
        })
        .collect();
    Value::Array(items).to_string()
}

fn open_answer() -> String {
    json!([
        {"title": "Nurse took it", "event_type": "Removal by nurse",
         "participants": ["nurse"], "where": "hall"},
        {"title": "It fell", "event_type": "Fall from tray",
         "participants": ["robot", "medicine"], "where": "corridor"},
        {"title": "Camera lost it", "event_type": "Occlusion",
         "participants": ["robot"], "where": "hall"},
    ])
    .to_string()
}

// ── Per-tier happy paths ────────────────────────────────────────────────

#[test]
fn c0_accepts_free_text_types() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(format!("```json\n{}\n```", open_answer()));

    let rec = fx.generate(Tier::C0, &t);
    assert!(rec.ok_json && rec.ok_schema);
    assert_eq!(rec.candidates.as_ref().map(Candidates::len), Some(3));
    assert!(rec.vocab.is_none());
    assert!(matches!(rec.extras, TierExtras::Open { content_checks: Some(_) }));

    let calls = t.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].max_tokens, Some(600));
    assert!(calls[0].messages[1].content.contains("PhysicalObject_Medicine1"));
}

#[test]
fn c1_grades_grounding_per_hypothesis() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["Action", "Process", "Action"],
        &["Agent_Nurse", "PhysicalObject_Medicine1"],
    ));

    let rec = fx.generate(Tier::C1, &t);
    assert!(rec.ok_schema, "{:?}", rec.schema_error_msg);
    let vocab = rec.vocab.as_ref().unwrap();
    assert!(vocab.ok_all_event_class);
    assert!(vocab.ok_all_entities);
    assert!(vocab.ok_all_triple_props);
    assert!(vocab.ok_all_triple_subjects);
    assert!(rec.is_vocab_strict());
    assert!(matches!(rec.extras, TierExtras::Vocabulary {}));
}

#[test]
fn c1_flags_instance_like_classes_only_through_membership() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["Action_H9", "Action", "Action"],
        &["Agent_Nurse"],
    ));

    let rec = fx.generate(Tier::C1, &t);
    assert!(rec.ok_schema);
    let vocab = rec.vocab.unwrap();
    assert!(!vocab.ok_all_event_class);
    assert!(!vocab.per_hypothesis[0].ok_event_class);
    assert!(vocab.per_hypothesis[0].ok_event_id_pattern);
    assert_eq!(vocab.per_hypothesis[0].ok_event_class_not_instance, None);
    assert!(!vocab.ok_vocab_strict);
}

#[test]
fn c2_records_retrieval_and_focus() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["Action", "Action", "Process"],
        &["Agent_Shadow", "PhysicalObject_Medicine1"],
    ));

    let rec = fx.generate(Tier::C2, &t);
    assert!(rec.ok_schema);
    let TierExtras::Retrieval { retrieval, focus } = &rec.extras else {
        panic!("expected retrieval extras, got {:?}", rec.extras);
    };
    assert_eq!(retrieval.hops, 2);
    assert!(retrieval.ctx_triples_n > 0);
    assert!(retrieval.ctx_triples_n <= retrieval.max_ctx_triples);
    assert!(focus.as_ref().unwrap().ok_all);
    assert!(t.calls()[0].messages[1].content.contains("PhysicalObject_ShadowTray"));
}

#[test]
fn c3_without_violations_skips_repair() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["ObjectRemovedByNurse", "ObjectFallsFromTray", "Placing"],
        &["Agent_Shadow", "PhysicalObject_Medicine1"],
    ));

    let rec = fx.generate(Tier::C3, &t);
    assert_eq!(t.call_count(), 1);
    assert!(rec.ok_schema);
    let TierExtras::Catalog { catalog, repair, .. } = &rec.extras else {
        panic!("expected catalog extras");
    };
    assert!(catalog.n_types > 0);
    let repair = repair.as_ref().unwrap();
    assert!(!repair.requested);
    assert_eq!(repair.state, RepairState::Accepted);
}

// ── Repair ──────────────────────────────────────────────────────────────

#[test]
fn c3_repairs_missing_participant_once() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    let first = grounded_answer(
        ["ObjectRemovedByNurse", "ObjectFallsFromTray", "TrayCollision"],
        &["Agent_Nurse", "PhysicalObject_Medicine1"],
    );
    t.push_text(first.clone()).push_text(grounded_answer(
        ["ObjectRemovedByNurse", "ObjectFallsFromTray", "TrayCollision"],
        &["Agent_Nurse", "Agent_Shadow", "PhysicalObject_Medicine1"],
    ));

    let rec = fx.generate(Tier::C3, &t);
    let calls = t.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].temperature, 0.0);
    assert_eq!(calls[1].max_tokens, calls[0].max_tokens);
    assert_eq!(calls[1].messages.len(), 4);
    assert_eq!(calls[1].messages[2].role, "assistant");
    assert!(calls[1].messages[3].content.starts_with("Your JSON is valid but violates constraints."));
    assert!(calls[1].messages[3].content.contains("\"Agent_Shadow\" (verbatim)"));

    assert!(rec.ok_schema);
    let grounded = rec.candidates.as_ref().and_then(Candidates::grounded).unwrap();
    assert!(grounded.iter().all(|h| h.participants.iter().any(|p| p == "Agent_Shadow")));

    let TierExtras::Catalog { repair: Some(repair), .. } = &rec.extras else {
        panic!("expected a repair report");
    };
    assert!(repair.requested);
    assert_eq!(repair.state, RepairState::Accepted);
    assert_eq!(
        repair.violations,
        vec![Violation::MissingParticipant {
            participant: "Agent_Shadow".into()
        }]
    );
    assert!(repair.remaining.is_empty());
    assert_eq!(repair.initial_raw_text.as_deref(), Some(first.as_str()));
}

#[test]
fn c3_coverage_violation_is_reported_after_repair() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    let fallback_only = grounded_answer(
        ["Placing", "Handover", "Transporting"],
        &["Agent_Shadow"],
    );
    t.push_text(fallback_only.clone()).push_text(fallback_only);

    let rec = fx.generate(Tier::C3, &t);
    assert_eq!(t.call_count(), 2);
    let TierExtras::Catalog { repair: Some(repair), .. } = &rec.extras else {
        panic!("expected a repair report");
    };
    assert_eq!(
        repair.violations,
        vec![Violation::Coverage { found: 0, required: 2 }]
    );
    assert_eq!(repair.remaining, repair.violations);
    // Still schema-valid and still grounded: coverage is a repair concern only.
    assert!(rec.ok_schema);
    assert!(rec.is_vocab_strict());
}

#[test]
fn c3_unparseable_repair_is_an_error() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["ObjectRemovedByNurse", "ObjectFallsFromTray", "TrayCollision"],
        &["Agent_Nurse"],
    ))
    .push_text("I cannot comply.");

    let err = hypotheses::generate(
        Tier::C3,
        &t,
        &fx.request(),
        &fx.grounding,
        &GenerationParams::for_tier(Tier::C3),
    )
    .unwrap_err();
    match err {
        HypothesisError::RepairFailed { stage, raw_text, .. } => {
            assert_eq!(stage, SchemaErrorKind::JsonParse);
            assert_eq!(raw_text, "I cannot comply.");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn c3_repair_transport_failure_is_an_error() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_text(grounded_answer(
        ["ObjectRemovedByNurse", "ObjectFallsFromTray", "TrayCollision"],
        &["Agent_Nurse"],
    ))
    .push_error(LlmError::Timeout { timeout_secs: 1 });

    let err = hypotheses::generate(
        Tier::C3,
        &t,
        &fx.request(),
        &fx.grounding,
        &GenerationParams::for_tier(Tier::C3),
    )
    .unwrap_err();
    assert!(matches!(err, HypothesisError::RepairTransport { .. }));
}

// ── Failures as records ─────────────────────────────────────────────────

#[test]
fn prose_is_a_json_parse_failure_on_every_tier() {
    let fx = Fixture::medicine_lost();
    for tier in Tier::ALL {
        let t = ScriptedTransport::new();
        t.push_text("Probably the nurse took it.");
        let rec = fx.generate(tier, &t);
        assert!(!rec.ok_json, "{tier}");
        assert!(!rec.ok_schema, "{tier}");
        assert_eq!(rec.schema_error_type, Some(SchemaErrorKind::JsonParse), "{tier}");
        assert_eq!(rec.raw_text, "Probably the nurse took it.");
        assert_eq!(t.call_count(), 1, "{tier} must not repair a parse failure");
    }
}

#[test]
fn transport_failures_become_records() {
    let fx = Fixture::medicine_lost();
    let t = ScriptedTransport::new();
    t.push_error(LlmError::Timeout { timeout_secs: 120 });
    let rec = fx.generate(Tier::C2, &t);
    assert_eq!(rec.schema_error_type, Some(SchemaErrorKind::Timeout));
    assert!(rec.latency_s.is_none());
    assert_eq!(rec.usage, json!({}));
}

// ── Batch ───────────────────────────────────────────────────────────────

#[test]
fn batch_writes_one_line_per_trial_and_meta() {
    let fx = Fixture::medicine_lost();
    let dir = tempfile::tempdir().unwrap();
    let config = BatchConfig {
        out_dir: dir.path().to_path_buf(),
        tier: Tier::C2,
        runs: 3,
        sleep_ms: Some(0),
        ..BatchConfig::default()
    };
    let t = ScriptedTransport::new();
    for _ in 0..3 {
        t.push_text(grounded_answer(
            ["Action", "Action", "Process"],
            &["Agent_Shadow"],
        ));
    }

    let out = run_batch(
        &fx.scenario,
        Arc::clone(&fx.tbox),
        &t,
        &config,
        &ExperimentConfig::default(),
        PromptLimits::default(),
    )
    .unwrap();

    assert_eq!(out.records, 3);
    assert_eq!(out.explained_trials, 0);
    assert!(out.jsonl_path.starts_with(dir.path().join("c2").join("medicine_lost")));

    let text = std::fs::read_to_string(&out.jsonl_path).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["run_id"], i + 1);
        assert_eq!(line["config"], "C2");
        assert_eq!(line["failed_step_index"], 6);
        assert_eq!(line["ok_schema"], true);
        assert_eq!(line["hops"], 2);
        assert!(line["retrieval"]["ctx_triples_n"].as_u64().unwrap() > 0);
    }

    let meta: Value =
        serde_json::from_str(&std::fs::read_to_string(&out.meta_path).unwrap()).unwrap();
    assert_eq!(meta["scenario_id"], "medicine_lost");
    assert_eq!(meta["n_runs"], 3);
    assert_eq!(meta["model"], "scripted");
    assert!(meta["tbox_vocab"]["n_event_types"].as_u64().unwrap() > 0);
}
