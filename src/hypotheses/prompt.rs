//! Prompt construction for the four tiers.
//!
//! Every prompt opens with the robot context and the observed retraction,
//! then (depending on the tier) retrieved context, the event-type catalog and
//! the allowed lists, and ends with the output schema and the rules.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::kb::Fact;

/// System message for C0.
pub const SYSTEM_OPEN: &str = "You propose causal hypotheses for observed structural changes. \
Return ALWAYS a valid JSON list. No extra text, no markdown.";

/// System message for C1-C3.
pub const SYSTEM_GROUNDED: &str = "You propose causal hypotheses for observed structural changes. \
Return ALWAYS valid JSON. No extra text, no markdown.";

/// Robot context for C0 and C1.
pub const ROBOT_CONTEXT: &str = "Context:
- Domain: indoor hospital logistics.
- Robot: mobile base with wheels, no arms; has a tray to carry small items like medicine.
- Mission: follow a supervisor/nurse during medicine delivery assistance.
";

/// Robot context for C2 and C3, which mention the tray camera.
pub const ROBOT_CONTEXT_CAMERA: &str = "Context:
- Domain: indoor hospital logistics.
- Robot: mobile base with wheels, no arms; has a tray for transporting small objects, such as medications, tracked by a camera.
- Mission: follow a supervisor/nurse during medicine delivery assistance.
";

/// The participant every C3 hypothesis must include.
pub const REQUIRED_PARTICIPANT: &str = "Agent_Shadow";

/// Caps on the lists quoted in a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptLimits {
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_event_types")]
    pub max_event_types: usize,
    #[serde(default = "default_max_properties")]
    pub max_properties: usize,
    #[serde(default = "default_max_context_triples")]
    pub max_context_triples: usize,
}

fn default_max_entities() -> usize {
    80
}
fn default_max_event_types() -> usize {
    120
}
fn default_max_properties() -> usize {
    80
}
fn default_max_context_triples() -> usize {
    90
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_entities: default_max_entities(),
            max_event_types: default_max_event_types(),
            max_properties: default_max_properties(),
            max_context_triples: default_max_context_triples(),
        }
    }
}

// ── Fragments ───────────────────────────────────────────────────────────

fn bullets<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items
        .into_iter()
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sorted, de-duplicated, truncated.
fn sorted_prefix<'a>(items: impl IntoIterator<Item = &'a String>, max: usize) -> Vec<&'a String> {
    items
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(max)
        .collect()
}

/// De-duplicated in first-seen order.
fn ordered_unique(items: &[String]) -> Vec<&String> {
    let mut seen = BTreeSet::new();
    items.iter().filter(|e| seen.insert(*e)).collect()
}

fn observed(context: &str, retraction: &Fact, step_name: &str) -> String {
    format!(
        "{context}\n\nObserved change (retract) at step '{step_name}':\n- retracted triple: ({}, {}, {})\n",
        retraction.subject, retraction.predicate, retraction.object
    )
}

fn context_block(context: &[Fact], max: usize) -> String {
    if context.is_empty() || max == 0 {
        return String::new();
    }
    let lines: Vec<String> = context
        .iter()
        .take(max)
        .map(|f| format!("- ({}, {}, {})", f.subject, f.predicate, f.object))
        .collect();
    format!(
        "\nRetrieved context triples (ABox, GraphRAG):\n{}\n",
        lines.join("\n")
    )
}

// ── C0 ──────────────────────────────────────────────────────────────────

pub fn open_prompt(retraction: &Fact, step_name: &str) -> String {
    format!(
        r#"{}
Task:
Propose EXACTLY 3 alternative causal hypotheses (cause events) that could explain this retract.

Return ONLY a JSON list with exactly 3 objects using this schema:
[
  {{
    "title": "short name of the hypothesis",
    "event_type": "EventTypeName_1",
    "participants": ["Entity1", "Entity2"],
    "where": "LocationOrCarrierEntity"
  }}
]

Rules:
- Output MUST be valid JSON only.
- EXACTLY 3 objects in the list.
- participants: list of 1 or 2 strings.
- where: a single string.
- event_type: a plausible event type name (NOT an OWL property).
"#,
        observed(ROBOT_CONTEXT, retraction, step_name)
    )
}

// ── C1 ──────────────────────────────────────────────────────────────────

/// Inputs shared by the grounded prompts.
#[derive(Debug, Clone, Copy)]
pub struct GroundedLists<'a> {
    pub entities: &'a BTreeSet<String>,
    pub event_classes: &'a [String],
    pub object_properties: &'a [String],
}

pub fn vocabulary_prompt(
    retraction: &Fact,
    step_name: &str,
    lists: GroundedLists<'_>,
    limits: &PromptLimits,
) -> String {
    let ents = sorted_prefix(lists.entities, limits.max_entities);
    let evts = sorted_prefix(lists.event_classes, limits.max_event_types);
    let props = sorted_prefix(lists.object_properties, limits.max_properties);
    format!(
        r#"{}
Allowed entities (ABox individuals from the current scenario; MUST be used verbatim for participants and where):
{}

Allowed event classes (MUST choose one of these verbatim):
{}

Allowed object properties (do NOT invent; use only these in proposed_triples):
{}

Task:
Propose EXACTLY 3 alternative causal hypotheses that could explain the retract.

Return ONLY valid JSON with exactly 3 objects using this schema:
[
  {{
    "title": "short name",
    "event_class": "OneAllowedEventClass",
    "event_id": "EventIndividualName",
    "participants": ["Entity1", "Entity2"], //1..N
    "where": "Entity",
    "proposed_triples": [
      ["<event_id>", "<object_property>", "<Entity>"],
      ["<event_id>", "<object_property>", "<Entity>"]
    ]
  }}
]

Rules (STRICT):
- Output MUST be valid JSON only.
- event_class MUST be one of Allowed event classes.
- event_id MUST follow the pattern "<event_class>_H1" / "<event_class>_H2" / "<event_class>_H3".
  Examples: "Action_H1", "Collaboration_H2".
- participants MUST be a non-empty list (1..N) of Allowed entities (verbatim).
- where MUST be from Allowed entities (verbatim).
- proposed_triples:
  - MUST be a list of triples [s,p,o] (strings).
  - Subject s MUST equal event_id (use the same exact string).
  - p MUST be one of Allowed object properties.
  - o MUST be one of Allowed entities.
- Keep proposed_triples minimal (2-4 triples). Prefer hasParticipant and hasLocation when applicable.
"#,
        observed(ROBOT_CONTEXT, retraction, step_name),
        bullets(ents),
        bullets(evts),
        bullets(props),
    )
}

// ── C2 ──────────────────────────────────────────────────────────────────

pub fn retrieval_prompt(
    retraction: &Fact,
    step_name: &str,
    lists: GroundedLists<'_>,
    context: &[Fact],
    limits: &PromptLimits,
) -> String {
    let ents = sorted_prefix(lists.entities, limits.max_entities);
    let evts = sorted_prefix(lists.event_classes, limits.max_event_types);
    let props = sorted_prefix(lists.object_properties, limits.max_properties);
    let (s, o) = (&retraction.subject, &retraction.object);
    format!(
        r#"{}{}
Allowed entities (ABox individuals from the current scenario; MUST be used verbatim for participants/where and triple objects):
{}

Allowed event classes (MUST choose one of these verbatim):
{}

Allowed object properties (do NOT invent; use only these in proposed_triples):
{}

Task:
Propose EXACTLY 3 alternative causal hypotheses that could explain the retract.
Use the Retrieved context triples to make the hypotheses consistent with the current state/history.

Return ONLY valid JSON with exactly 3 objects using this schema:
[
  {{
    "title": "short name",
    "event_class": "OneAllowedEventClass",
    "event_id": "EventIndividualName",
    "participants": ["Entity1", "Entity2"],
    "where": "Entity",
    "proposed_triples": [
      ["<event_id>", "<object_property>", "<Entity>"]
    ]
  }}
]

Rules (STRICT):
- Output MUST be valid JSON only.
- event_class MUST be one of Allowed event classes.
- event_id MUST be one of: "<event_class>_H1", "<event_class>_H2", "<event_class>_H3".
- participants and where MUST be from Allowed entities (verbatim).
- proposed_triples:
  - list of [s,p,o] strings
  - s MUST equal event_id
  - p MUST be one of Allowed object properties
  - o MUST be one of Allowed entities
- FOCUS CONSTRAINT (PER HYPOTHESIS): For EACH hypothesis object, its proposed_triples MUST contain at least one triple whose object (o) is exactly "{s}" OR exactly "{o}". (Do NOT satisfy this by referencing an intermediate episode/id; it must be the exact entity string.)
- Avoid generic/abstract explanations (e.g., "plan failure", "collaboration issue") unless you explicitly connect them to the retract via proposed_triples that mention "{s}" or "{o}".
"#,
        observed(ROBOT_CONTEXT_CAMERA, retraction, step_name),
        context_block(context, limits.max_context_triples),
        bullets(ents),
        bullets(evts),
        bullets(props),
    )
}

// ── C3 ──────────────────────────────────────────────────────────────────

/// Rendered catalog tiers for the C3 prompt.
#[derive(Debug, Clone, Default)]
pub struct CatalogText {
    pub preferred: String,
    pub fallback: String,
}

fn catalog_block(catalog: &CatalogText) -> String {
    let mut block = String::new();
    if !catalog.preferred.trim().is_empty() {
        block.push_str("\nPreferred EventType class catalog (TMO) \u{2014} prioritize these:\n");
        block.push_str(&catalog.preferred);
        block.push('\n');
    }
    if !catalog.fallback.trim().is_empty() {
        block.push_str(
            "\nFallback EventType class catalog (MLO) \u{2014} use only if none of the preferred TMO classes fit:\n",
        );
        block.push_str(&catalog.fallback);
        block.push('\n');
    }
    block
}

pub fn catalog_prompt(
    retraction: &Fact,
    step_name: &str,
    lists: GroundedLists<'_>,
    context: &[Fact],
    catalog: &CatalogText,
    limits: &PromptLimits,
) -> String {
    let ents = sorted_prefix(lists.entities, limits.max_entities);
    let evts = ordered_unique(lists.event_classes);
    let props = sorted_prefix(lists.object_properties, limits.max_properties);
    let (s, o) = (&retraction.subject, &retraction.object);
    format!(
        r#"{}{}
{}
Allowed entities (ABox individuals from the current scenario; MUST be used verbatim for participants/where and triple objects):
{}

Allowed object properties (do NOT invent; use only these in proposed_triples):
{}

Allowed EventType classes (MUST be used verbatim for event_class; copy/paste EXACTLY one of these strings, no prefixes, no colons):
{}


Task:
Propose EXACTLY 3 alternative causal hypotheses that could explain the retract.
Use the Retrieved context triples to make the hypotheses consistent with the current state/history.

Return ONLY valid JSON with exactly 3 objects using this schema:
[
  {{
    "title": "short name",
    "event_class": "OneAllowedEventTypeClass",
    "event_id": "EventTypeInstanceId",
    "participants": ["Entity1", "Entity2"],
    "where": "Entity",
    "proposed_triples": [
      ["<event_id>", "<object_property>", "<Entity>"]
    ]
  }}
]

Rules (STRICT):
- Output MUST be valid JSON only.
- event_class MUST be EXACTLY one of the strings in "Allowed EventType classes" (verbatim).
- Do NOT output individuals in event_class.
- Do NOT choose Event (or other non-EventType classes) unless it appears in Allowed EventType classes (it should not).
- event_class must NOT contain "_H" (those belong to event_id only).
- event_id MUST be one of: "<event_class>_H1", "<event_class>_H2", "<event_class>_H3".
  (event_id is an INDIVIDUAL name that starts with the chosen event_class plus an underscore.)
- COVERAGE CONSTRAINT: At least 2 of the 3 hypotheses MUST use an event_class from the Preferred (TMO) catalog.
- Only use Fallback (MLO) classes if no Preferred (TMO) class fits the hypothesis.
- participants and where MUST be from Allowed entities (verbatim).
- PARTICIPANT CONSTRAINT (PER HYPOTHESIS): For EACH hypothesis, "participants" MUST include "{REQUIRED_PARTICIPANT}".
- proposed_triples:
  - list of [s,p,o] strings
  - s MUST equal event_id
  - p MUST be one of Allowed object properties
  - o MUST be one of Allowed entities
- FOCUS CONSTRAINT (PER HYPOTHESIS):
  proposed_triples MUST include
  (at least one triple whose object (o) is exactly "{s}")
  AND
  (at least one triple whose object (o) is exactly "{o}").
- Avoid generic/abstract explanations unless you explicitly connect them to the retract via proposed_triples that mention "{s}" or "{o}".
- Prefer the MOST SPECIFIC EventType class from the catalog.
- Do NOT choose very generic classes unless there is no more specific option.
"#,
        observed(ROBOT_CONTEXT_CAMERA, retraction, step_name),
        context_block(context, limits.max_context_triples),
        catalog_block(catalog),
        bullets(ents),
        bullets(props),
        bullets(evts),
    )
}
