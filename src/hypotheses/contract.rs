//! Output contract for generated hypotheses.
//!
//! Untrusted model text goes through three stages:
//!
//! 1. [`strip_code_fences`] and JSON parsing (`json_parse` failures),
//! 2. shape validation against the tier's schema (`schema_validation`
//!    failures), producing typed candidates,
//! 3. for the grounded tiers, vocabulary flags against the allowed lists.
//!
//! Stages 1 and 2 fail with a message; stage 3 never fails, it reports.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::kb::Fact;

/// Number of hypotheses every generation must return.
pub const HYPOTHESES_PER_CALL: usize = 3;

// ── Parsing ─────────────────────────────────────────────────────────────

/// Remove a surrounding Markdown code fence and a leading `json` tag.
pub fn strip_code_fences(text: &str) -> String {
    let mut t = text.trim().to_string();
    if t.starts_with("```") {
        let mut lines: Vec<&str> = t.lines().skip(1).collect();
        if lines.last().is_some_and(|l| l.trim().starts_with("```")) {
            lines.pop();
        }
        t = lines.join("\n").trim().to_string();
    }
    if t.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("json")) {
        t = t[4..].trim().to_string();
    }
    t
}

/// Strip fences and parse. The error is the parser's message.
pub fn parse_json(text: &str) -> Result<Value, String> {
    serde_json::from_str(&strip_code_fences(text)).map_err(|e| e.to_string())
}

// ── Candidate types ─────────────────────────────────────────────────────

/// C0 hypothesis: free-text event type, no grounding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenHypothesis {
    pub title: String,
    pub event_type: String,
    pub participants: Vec<String>,
    #[serde(rename = "where")]
    pub location: String,
}

/// C1-C3 hypothesis: a named event individual plus the triples it would add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundedHypothesis {
    pub title: String,
    pub event_class: String,
    pub event_id: String,
    pub participants: Vec<String>,
    #[serde(rename = "where")]
    pub location: String,
    pub proposed_triples: Vec<Fact>,
}

impl GroundedHypothesis {
    /// The three ids an event of this hypothesis' class may take.
    pub fn allowed_ids(&self) -> [String; 3] {
        [1, 2, 3].map(|n| format!("{}_H{n}", self.event_class))
    }

    pub fn id_matches_class(&self) -> bool {
        self.allowed_ids().contains(&self.event_id)
    }
}

/// Validated candidates of either shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Candidates {
    Open(Vec<OpenHypothesis>),
    Grounded(Vec<GroundedHypothesis>),
}

impl Candidates {
    pub fn len(&self) -> usize {
        match self {
            Self::Open(v) => v.len(),
            Self::Grounded(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn grounded(&self) -> Option<&[GroundedHypothesis]> {
        match self {
            Self::Grounded(v) => Some(v),
            Self::Open(_) => None,
        }
    }
}

// ── Shape validation ────────────────────────────────────────────────────

/// Per-tier knobs of the grounded schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRules {
    /// Allowed number of proposed triples, if bounded.
    pub triples_len: Option<RangeInclusive<usize>>,
    /// Participants must be non-blank.
    pub nonblank_participants: bool,
    /// Triple subjects must be non-empty.
    pub nonempty_subjects: bool,
}

impl SchemaRules {
    /// C1: 2 to 6 triples with non-empty subjects.
    pub fn vocabulary() -> Self {
        Self {
            triples_len: Some(2..=6),
            nonblank_participants: false,
            nonempty_subjects: true,
        }
    }

    /// C2 and C3: any number of triples, non-blank participants.
    pub fn retrieval() -> Self {
        Self {
            triples_len: None,
            nonblank_participants: true,
            nonempty_subjects: false,
        }
    }
}

fn check_list(data: &Value) -> Result<&Vec<Value>, String> {
    let items = data
        .as_array()
        .ok_or_else(|| "LLM output is not a JSON list.".to_string())?;
    if items.len() != HYPOTHESES_PER_CALL {
        return Err(format!(
            "Expected exactly {HYPOTHESES_PER_CALL} hypotheses, got {}.",
            items.len()
        ));
    }
    Ok(items)
}

fn check_object<'a>(i: usize, item: &'a Value, required: &[&str]) -> Result<&'a Map<String, Value>, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| format!("Item {i} is not an object."))?;
    let mut missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| !obj.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        let listed: Vec<String> = missing.iter().map(|k| format!("'{k}'")).collect();
        return Err(format!("Item {i} missing keys: [{}]", listed.join(", ")));
    }
    Ok(obj)
}

/// A non-blank string field.
fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn strings(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

const OPEN_KEYS: &[&str] = &["title", "event_type", "participants", "where"];

/// C0 schema: title, event type, 1 or 2 participants, a where string.
pub fn validate_open(data: &Value) -> Result<Vec<OpenHypothesis>, String> {
    let items = check_list(data)?;
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let obj = check_object(i, item, OPEN_KEYS)?;
        let title = text(obj, "title").ok_or_else(|| format!("Item {i} title is empty."))?;
        let event_type =
            text(obj, "event_type").ok_or_else(|| format!("Item {i} event_type is empty."))?;
        let parts = obj
            .get("participants")
            .and_then(Value::as_array)
            .filter(|p| p.iter().all(Value::is_string))
            .ok_or_else(|| format!("Item {i} participants must be a list of strings."))?;
        if !(1..=2).contains(&parts.len()) {
            return Err(format!("Item {i} participants must have length 1 or 2."));
        }
        let location =
            text(obj, "where").ok_or_else(|| format!("Item {i} where is empty or not a string."))?;
        out.push(OpenHypothesis {
            title,
            event_type,
            participants: strings(parts),
            location,
        });
    }
    Ok(out)
}

const GROUNDED_KEYS: &[&str] = &[
    "title",
    "event_class",
    "event_id",
    "participants",
    "where",
    "proposed_triples",
];

/// C1-C3 schema.
pub fn validate_grounded(data: &Value, rules: &SchemaRules) -> Result<Vec<GroundedHypothesis>, String> {
    let items = check_list(data)?;
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let obj = check_object(i, item, GROUNDED_KEYS)?;
        let title = text(obj, "title").ok_or_else(|| format!("Item {i} title invalid."))?;
        let event_class =
            text(obj, "event_class").ok_or_else(|| format!("Item {i} event_class invalid."))?;
        let event_id = text(obj, "event_id").ok_or_else(|| format!("Item {i} event_id invalid."))?;
        let location = text(obj, "where").ok_or_else(|| format!("Item {i} where invalid."))?;

        let parts_msg = if rules.nonblank_participants {
            format!("Item {i} participants must be list[str] (non-empty strings).")
        } else {
            format!("Item {i} participants must be list[str] of len >= 1.")
        };
        let parts = obj
            .get("participants")
            .and_then(Value::as_array)
            .filter(|p| !p.is_empty())
            .filter(|p| {
                p.iter().all(|x| {
                    x.as_str()
                        .is_some_and(|s| !rules.nonblank_participants || !s.trim().is_empty())
                })
            })
            .ok_or(parts_msg)?;

        let triples = obj
            .get("proposed_triples")
            .and_then(Value::as_array)
            .filter(|ts| ts.iter().all(|t| t.as_array().is_some_and(|a| a.len() == 3)))
            .ok_or_else(|| format!("Item {i} proposed_triples must be list of [s,p,o]."))?;
        if let Some(range) = &rules.triples_len {
            if !range.contains(&triples.len()) {
                return Err(format!(
                    "Item {i} proposed_triples must have length {}..{}.",
                    range.start(),
                    range.end()
                ));
            }
        }

        let mut proposed = Vec::with_capacity(triples.len());
        for t in triples {
            let parts3 = t.as_array().map(Vec::as_slice).unwrap_or_default();
            let [s, p, o] = parts3 else {
                return Err(format!("Item {i} proposed_triples must be list of [s,p,o]."));
            };
            let (Some(s), Some(p), Some(o)) = (s.as_str(), p.as_str(), o.as_str()) else {
                return Err(format!("Item {i} proposed_triples contains non-string values."));
            };
            if rules.nonempty_subjects && s.trim().is_empty() {
                return Err(format!("Item {i} proposed_triples has empty subject."));
            }
            proposed.push(Fact::new(s, p, o));
        }

        out.push(GroundedHypothesis {
            title,
            event_class,
            event_id,
            participants: strings(parts),
            location,
            proposed_triples: proposed,
        });
    }
    Ok(out)
}

// ── C0 content checks ───────────────────────────────────────────────────

/// Smell test for C0 event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentChecks {
    pub distinct_event_types: usize,
    /// Event types that look like OWL properties rather than classes.
    pub event_type_bad_like_property_count: usize,
}

pub fn content_checks(candidates: &[OpenHypothesis]) -> ContentChecks {
    let types: Vec<&str> = candidates.iter().map(|c| c.event_type.trim()).collect();
    let distinct: BTreeSet<&str> = types.iter().copied().collect();
    ContentChecks {
        distinct_event_types: distinct.len(),
        event_type_bad_like_property_count: types
            .iter()
            .filter(|t| looks_like_property(t))
            .count(),
    }
}

fn looks_like_property(event_type: &str) -> bool {
    event_type.contains('.') || event_type.contains("has") || event_type.contains("DUL")
}

// ── Vocabulary grounding ────────────────────────────────────────────────

/// The universe a grounded hypothesis may draw from.
#[derive(Debug, Clone, Default)]
pub struct AllowedVocab {
    pub entities: BTreeSet<String>,
    pub event_classes: BTreeSet<String>,
    pub object_properties: BTreeSet<String>,
    /// Reject class names ending in `_H1`/`_H2`/`_H3` (C3).
    pub reject_instance_like_classes: bool,
}

/// Grounding flags of one hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HypothesisFlags {
    pub ok_event_class: bool,
    pub ok_event_id_pattern: bool,
    pub ok_entities: bool,
    pub ok_triple_props: bool,
    pub ok_triple_objects: bool,
    pub ok_triple_subjects: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok_event_class_not_instance: Option<bool>,
}

impl HypothesisFlags {
    pub fn all_ok(&self) -> bool {
        self.ok_event_class
            && self.ok_event_id_pattern
            && self.ok_entities
            && self.ok_triple_props
            && self.ok_triple_objects
            && self.ok_triple_subjects
            && self.ok_event_class_not_instance.unwrap_or(true)
    }
}

/// Per-hypothesis and aggregate grounding flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VocabReport {
    pub per_hypothesis: Vec<HypothesisFlags>,
    pub ok_all_event_class: bool,
    pub ok_all_event_id_pattern: bool,
    pub ok_all_entities: bool,
    pub ok_all_triple_props: bool,
    pub ok_all_triple_objects: bool,
    pub ok_all_triple_subjects: bool,
    /// Every rule holds for every hypothesis.
    pub ok_vocab_strict: bool,
}

static INSTANCE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_H[123]$").expect("static regex is valid"));

/// Whether a class name looks like an individual id.
pub fn looks_like_instance(class: &str) -> bool {
    INSTANCE_SUFFIX.is_match(class)
}

pub fn vocab_flags(candidates: &[GroundedHypothesis], allowed: &AllowedVocab) -> VocabReport {
    let per: Vec<HypothesisFlags> = candidates
        .iter()
        .map(|h| {
            let instance_like = looks_like_instance(&h.event_class);
            let class_ok = allowed.event_classes.contains(&h.event_class)
                && !(allowed.reject_instance_like_classes && instance_like);
            let parts_ok = h.participants.iter().all(|p| allowed.entities.contains(p));
            let where_ok = allowed.entities.contains(&h.location);
            HypothesisFlags {
                ok_event_class: class_ok,
                ok_event_id_pattern: h.id_matches_class(),
                ok_entities: parts_ok && where_ok,
                ok_triple_props: h
                    .proposed_triples
                    .iter()
                    .all(|t| allowed.object_properties.contains(&t.predicate)),
                ok_triple_objects: h
                    .proposed_triples
                    .iter()
                    .all(|t| allowed.entities.contains(&t.object)),
                ok_triple_subjects: h.proposed_triples.iter().all(|t| t.subject == h.event_id),
                ok_event_class_not_instance: allowed
                    .reject_instance_like_classes
                    .then_some(!instance_like),
            }
        })
        .collect();

    let all = |f: fn(&HypothesisFlags) -> bool| per.iter().all(f);
    VocabReport {
        ok_all_event_class: all(|x| x.ok_event_class),
        ok_all_event_id_pattern: all(|x| x.ok_event_id_pattern),
        ok_all_entities: all(|x| x.ok_entities),
        ok_all_triple_props: all(|x| x.ok_triple_props),
        ok_all_triple_objects: all(|x| x.ok_triple_objects),
        ok_all_triple_subjects: all(|x| x.ok_triple_subjects),
        ok_vocab_strict: all(HypothesisFlags::all_ok),
        per_hypothesis: per,
    }
}

// ── Focus (informational) ───────────────────────────────────────────────

/// Which endpoints of the retraction a hypothesis' triples point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FocusFlags {
    pub mentions_subject: bool,
    pub mentions_object: bool,
    pub ok: bool,
}

/// How a focus rule combines the two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusRule {
    /// At least one triple object is the subject or the object (C2).
    Either,
    /// Triple objects cover both the subject and the object (C3).
    Both,
}

/// Post-hoc check of the prompt's focus rule. Recorded, never enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FocusReport {
    pub rule: FocusRule,
    pub per_hypothesis: Vec<FocusFlags>,
    pub ok_all: bool,
}

pub fn focus_report(candidates: &[GroundedHypothesis], retraction: &Fact, rule: FocusRule) -> FocusReport {
    let per: Vec<FocusFlags> = candidates
        .iter()
        .map(|h| {
            let subj = h.proposed_triples.iter().any(|t| t.object == retraction.subject);
            let obj = h.proposed_triples.iter().any(|t| t.object == retraction.object);
            FocusFlags {
                mentions_subject: subj,
                mentions_object: obj,
                ok: match rule {
                    FocusRule::Either => subj || obj,
                    FocusRule::Both => subj && obj,
                },
            }
        })
        .collect();
    FocusReport {
        rule,
        ok_all: per.iter().all(|f| f.ok),
        per_hypothesis: per,
    }
}
