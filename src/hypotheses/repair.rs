//! Constraint checks and the one-shot repair round of the catalog tier.
//!
//! A schema-valid C3 answer is checked against the constraints the prompt
//! states. Any violation triggers exactly one follow-up call asking the
//! model to fix only what was violated. The protocol is a small state
//! machine; there is no path back into `RepairRequested`.

use std::collections::BTreeSet;

use serde::Serialize;

use super::contract::GroundedHypothesis;

/// Minimum number of hypotheses drawn from the preferred catalog.
pub const MIN_PREFERRED: usize = 2;

/// A constraint a schema-valid answer broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Event classes outside the allowed list, in answer order.
    InvalidEventClass { classes: Vec<String> },
    /// Some hypothesis lacks the required participant.
    MissingParticipant { participant: String },
    /// Some `event_id` is not `<event_class>_H1..3`.
    EventIdMismatch { ids: Vec<String> },
    /// Too few hypotheses use a preferred class.
    Coverage { found: usize, required: usize },
}

impl Violation {
    /// The fix instruction sent back to the model.
    pub fn instruction(&self) -> String {
        match self {
            Self::InvalidEventClass { classes } => format!(
                "Some event_class values are not in Allowed event classes: {}. \
                 Replace each invalid event_class with the closest EXACT string from Allowed event classes.",
                classes.join(", ")
            ),
            Self::MissingParticipant { participant } => format!(
                "For EACH hypothesis, ensure \"participants\" includes \"{participant}\" (verbatim) in addition to any others."
            ),
            Self::EventIdMismatch { .. } => "For EACH hypothesis, set \"event_id\" to exactly one of: \
                 \"<event_class>_H1\", \"<event_class>_H2\", \"<event_class>_H3\"."
                .to_string(),
            Self::Coverage { required, .. } => format!(
                "COVERAGE FIX: At least {required} hypotheses must use an event_class from the Preferred (TMO) catalog. \
                 Change event_class (and event_id accordingly) to satisfy this."
            ),
        }
    }
}

/// What a C3 answer is checked against.
#[derive(Debug, Clone, Copy)]
pub struct Constraints<'a> {
    pub allowed_classes: &'a BTreeSet<String>,
    /// Empty disables the coverage check.
    pub preferred: &'a BTreeSet<String>,
    pub required_participant: &'a str,
}

/// All violations, in a fixed order: classes, participant, ids, coverage.
pub fn check(candidates: &[GroundedHypothesis], constraints: &Constraints<'_>) -> Vec<Violation> {
    let mut out = Vec::new();

    let bad: Vec<String> = candidates
        .iter()
        .filter(|h| !constraints.allowed_classes.contains(&h.event_class))
        .map(|h| h.event_class.clone())
        .collect();
    if !bad.is_empty() {
        out.push(Violation::InvalidEventClass { classes: bad });
    }

    let required = constraints.required_participant;
    if candidates
        .iter()
        .any(|h| !h.participants.iter().any(|p| p == required))
    {
        out.push(Violation::MissingParticipant {
            participant: required.to_string(),
        });
    }

    let ids: Vec<String> = candidates
        .iter()
        .filter(|h| !h.id_matches_class())
        .map(|h| h.event_id.clone())
        .collect();
    if !ids.is_empty() {
        out.push(Violation::EventIdMismatch { ids });
    }

    if !constraints.preferred.is_empty() {
        let found = candidates
            .iter()
            .filter(|h| constraints.preferred.contains(&h.event_class))
            .count();
        if found < MIN_PREFERRED {
            out.push(Violation::Coverage {
                found,
                required: MIN_PREFERRED,
            });
        }
    }
    out
}

/// The repair message for `violations`.
pub fn repair_prompt(violations: &[Violation]) -> String {
    let instructions: Vec<String> = violations.iter().map(Violation::instruction).collect();
    format!(
        "Your JSON is valid but violates constraints.\n{}\n\
         Return ONLY the corrected JSON. Do not change any other fields unless required by these fixes.",
        instructions.join("\n")
    )
}

// ── Protocol ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Generated,
    Accepted,
    RepairRequested,
    RepairAttempted,
    RejectedFinal,
}

/// Generated → Accepted, or Generated → RepairRequested → RepairAttempted →
/// Accepted | RejectedFinal.
#[derive(Debug, Clone)]
pub struct RepairProtocol {
    state: RepairState,
    violations: Vec<Violation>,
}

impl Default for RepairProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl RepairProtocol {
    pub fn new() -> Self {
        Self {
            state: RepairState::Generated,
            violations: Vec::new(),
        }
    }

    pub fn state(&self) -> RepairState {
        self.state
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Review the first answer. Only acts in `Generated`.
    pub fn review(&mut self, violations: Vec<Violation>) -> RepairState {
        if self.state == RepairState::Generated {
            self.state = if violations.is_empty() {
                RepairState::Accepted
            } else {
                RepairState::RepairRequested
            };
            self.violations = violations;
        }
        self.state
    }

    /// The repair message, once. `None` unless a repair was requested.
    pub fn begin_repair(&mut self) -> Option<String> {
        if self.state != RepairState::RepairRequested {
            return None;
        }
        self.state = RepairState::RepairAttempted;
        Some(repair_prompt(&self.violations))
    }

    /// Record whether the repaired answer passed parse and schema.
    pub fn conclude(&mut self, parsed: bool) -> RepairState {
        if self.state == RepairState::RepairAttempted {
            self.state = if parsed {
                RepairState::Accepted
            } else {
                RepairState::RejectedFinal
            };
        }
        self.state
    }
}

/// What the repair round did, recorded on C3 records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    pub requested: bool,
    pub state: RepairState,
    pub violations: Vec<Violation>,
    /// Violations still present after the repair. Not repaired again.
    pub remaining: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_raw_text: Option<String>,
}

impl RepairReport {
    pub fn not_needed() -> Self {
        Self {
            requested: false,
            state: RepairState::Accepted,
            violations: Vec::new(),
            remaining: Vec::new(),
            initial_raw_text: None,
        }
    }
}
