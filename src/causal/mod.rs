//! Abductive causal matcher for retracted facts.
//!
//! Given a retraction and the events registered so far, the [`CausalMatcher`]
//! materialises a change event, filters recent events through the When,
//! Where and How gates plus the Who anchor, scores the survivors and links
//! the best one to the change event with a causal edge.
//!
//! Candidates are visited in registration order and sorted with a stable
//! sort, so among equally scored candidates the earliest-registered event
//! wins.

pub mod criteria;

use serde::{Deserialize, Serialize};

use crate::kb::{Fact, KnowledgeStore};
use crate::registry::EventRegistry;
use crate::symbol::{ClassId, EntityId, local_name};

use criteria::{CriteriaProps, Precedence};

// ── Configuration ───────────────────────────────────────────────────────

/// Class and property names the matcher works with, plus the look-back window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// How many steps before the retraction an event may be born.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Classes whose descendants count as events.
    #[serde(default = "default_event_roots")]
    pub event_roots: Vec<String>,
    #[serde(default = "default_change_event_class")]
    pub change_event_class: String,
    /// Used when `change_event_class` is unknown to the TBox.
    #[serde(default = "default_change_event_fallback")]
    pub change_event_fallback: String,
    #[serde(default = "default_participant_properties")]
    pub participant_properties: Vec<String>,
    #[serde(default = "default_location_properties")]
    pub location_properties: Vec<String>,
    #[serde(default = "default_causal_properties")]
    pub causal_properties: Vec<String>,
    #[serde(default = "default_classification_properties")]
    pub classification_properties: Vec<String>,
    /// Subjects of this class need a directly involved cause.
    #[serde(default = "default_anchor_class")]
    pub anchor_class: String,
    #[serde(default = "default_background_tag")]
    pub background_tag: String,
    /// Also match the old value of location updates.
    #[serde(default)]
    pub explain_updates: bool,
}

fn default_window() -> usize {
    2
}
fn default_event_roots() -> Vec<String> {
    vec!["SOMA.Event".into()]
}
fn default_change_event_class() -> String {
    "SOMA.ChangeDisappearanceEvent".into()
}
fn default_change_event_fallback() -> String {
    "SOMA.Event".into()
}
fn default_participant_properties() -> Vec<String> {
    vec!["hasParticipant".into()]
}
fn default_location_properties() -> Vec<String> {
    vec!["hasLocation".into(), "occursIn".into()]
}
fn default_causal_properties() -> Vec<String> {
    vec!["causes".into()]
}
fn default_classification_properties() -> Vec<String> {
    vec!["classifies".into(), "isOccurrenceOf".into()]
}
fn default_anchor_class() -> String {
    "PhysicalObject".into()
}
fn default_background_tag() -> String {
    "background".into()
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            event_roots: default_event_roots(),
            change_event_class: default_change_event_class(),
            change_event_fallback: default_change_event_fallback(),
            participant_properties: default_participant_properties(),
            location_properties: default_location_properties(),
            causal_properties: default_causal_properties(),
            classification_properties: default_classification_properties(),
            anchor_class: default_anchor_class(),
            background_tag: default_background_tag(),
            explain_updates: false,
        }
    }
}

impl MatcherConfig {
    /// Whether `property` (possibly qualified) is one of the location properties.
    pub fn is_location_property(&self, property: &str) -> bool {
        let local = local_name(property);
        self.location_properties
            .iter()
            .any(|p| local_name(p) == local)
    }
}

// ── Results ─────────────────────────────────────────────────────────────

/// Structured When/Where/Who/How account of a match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rationale {
    pub birth_step: Option<usize>,
    pub step: usize,
    pub precedence: Precedence,
    pub event_location: Option<String>,
    pub change_location: String,
    pub location_compatible: bool,
    pub subject: String,
    pub shared_participant: bool,
    pub participants: Vec<String>,
    pub event_types: Vec<String>,
}

/// A successful match. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explanation {
    pub retraction: Fact,
    pub cause: String,
    #[serde(skip)]
    pub cause_id: EntityId,
    pub change_event: String,
    pub score: u32,
    pub link_added: bool,
    pub rationale: Rationale,
    pub text: String,
}

/// Why a retraction stayed unexplained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Unexplained {
    /// The subject or the retracted object is not in the store.
    UnresolvedEntity { name: String },
    /// No candidate survived the gates.
    NoCandidate { considered: usize },
}

/// Outcome of [`CausalMatcher::explain`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Explained(Explanation),
    Unexplained {
        change_event: EntityId,
        reason: Unexplained,
    },
}

impl MatchOutcome {
    pub fn is_explained(&self) -> bool {
        matches!(self, Self::Explained(_))
    }

    pub fn explanation(&self) -> Option<&Explanation> {
        match self {
            Self::Explained(e) => Some(e),
            Self::Unexplained { .. } => None,
        }
    }
}

/// Result of validating one step's retractions.
#[derive(Debug, Clone, Default)]
pub struct StepValidation {
    pub errors: Vec<String>,
    pub explanations: Vec<Explanation>,
    pub unexplained: Vec<Fact>,
}

#[derive(Debug, Clone)]
struct Candidate {
    event: EntityId,
    score: u32,
    shared: bool,
}

// ── Matcher ─────────────────────────────────────────────────────────────

/// Symbolic explainer for retractions. Owns the event registry.
#[derive(Debug, Clone)]
pub struct CausalMatcher {
    config: MatcherConfig,
    props: CriteriaProps,
    event_roots: Vec<ClassId>,
    change_class: Option<ClassId>,
    anchor_class: Option<ClassId>,
    registry: EventRegistry,
}

impl CausalMatcher {
    /// Resolve every configured name against the store's TBox.
    pub fn new<S: KnowledgeStore + ?Sized>(store: &S, config: MatcherConfig) -> Self {
        let resolve_props = |names: &[String]| {
            names
                .iter()
                .filter_map(|n| {
                    let p = store.resolve_property(n);
                    if p.is_none() {
                        tracing::warn!(property = %n, "matcher property not in TBox, ignored");
                    }
                    p
                })
                .collect::<Vec<_>>()
        };
        let props = CriteriaProps {
            participant: resolve_props(&config.participant_properties),
            location: resolve_props(&config.location_properties),
            causal: resolve_props(&config.causal_properties),
            classification: resolve_props(&config.classification_properties),
        };
        let event_roots = config
            .event_roots
            .iter()
            .filter_map(|n| store.resolve_class(n))
            .collect::<Vec<_>>();
        if event_roots.is_empty() {
            tracing::warn!(roots = ?config.event_roots, "no event root class resolved");
        }
        let change_class = store
            .resolve_class(&config.change_event_class)
            .or_else(|| store.resolve_class(&config.change_event_fallback));
        let anchor_class = store.resolve_class(&config.anchor_class);

        Self {
            config,
            props,
            event_roots,
            change_class,
            anchor_class,
            registry: EventRegistry::new(),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn props(&self) -> &CriteriaProps {
        &self.props
    }

    /// Whether `class` descends from one of the event roots.
    pub fn is_event_class<S: KnowledgeStore + ?Sized>(&self, store: &S, class: ClassId) -> bool {
        self.event_roots
            .iter()
            .any(|&root| store.tbox().is_subclass_of(class, root))
    }

    /// Register every newly typed event of a step. Unknown classes and
    /// non-event classes are skipped.
    pub fn register_new_types<S: KnowledgeStore + ?Sized>(
        &mut self,
        store: &S,
        types: &[(String, String)],
        step_index: usize,
        tags: &[String],
    ) -> usize {
        let mut registered = 0;
        for (inst, class_name) in types {
            let Some(class) = store.resolve_class(class_name) else {
                continue;
            };
            if !self.is_event_class(store, class) {
                continue;
            }
            let Some(event) = store.resolve_entity(inst) else {
                continue;
            };
            if self
                .registry
                .register(event, local_name(inst), step_index, tags)
            {
                tracing::debug!(event = %local_name(inst), step = step_index, ?tags, "registered event");
                registered += 1;
            }
        }
        registered
    }

    /// Forget deleted events.
    pub fn unregister_deleted(&mut self, names: &[String]) -> usize {
        self.registry.unregister_names(names).len()
    }

    /// Name of the change event for `retraction` at `step_index`.
    pub fn change_event_name(retraction: &Fact, step_index: usize) -> String {
        format!(
            "Ep_{step_index}_{}_{}_{}",
            retraction.subject,
            local_name(&retraction.predicate),
            retraction.object
        )
        .replace('.', "_")
    }

    /// Create the change event for a retraction, linked to its subject as
    /// participant and to the retracted object as location.
    pub fn create_change_event<S: KnowledgeStore + ?Sized>(
        &self,
        store: &mut S,
        retraction: &Fact,
        step_index: usize,
    ) -> EntityId {
        let subject = store.resolve_entity(&retraction.subject);
        let old_location = store.resolve_entity(&retraction.object);

        let name = Self::change_event_name(retraction, step_index);
        let ep = match self.change_class {
            Some(class) => store.create_individual(&name, class),
            None => store.ensure_individual(&name),
        };
        if let (Some(s), Some(&p)) = (subject, self.props.participant.first()) {
            store.add_value(ep, p, s);
        }
        if let (Some(o), Some(&p)) = (old_location, self.props.location.first()) {
            store.add_value(ep, p, o);
        }
        ep
    }

    /// Link `cause → effect` over the first causal property. Re-adding an
    /// existing link is a no-op and returns `false`.
    pub fn record_causal_link<S: KnowledgeStore + ?Sized>(
        &self,
        store: &mut S,
        cause: EntityId,
        effect: EntityId,
    ) -> bool {
        let Some(&p) = self.props.causal.first() else {
            tracing::warn!("no causal property available; link not recorded");
            return false;
        };
        store.add_value(cause, p, effect)
    }

    /// Explain one retraction observed at `step_index`.
    pub fn explain<S: KnowledgeStore + ?Sized>(
        &self,
        store: &mut S,
        retraction: &Fact,
        step_index: usize,
    ) -> MatchOutcome {
        let ep = self.create_change_event(store, retraction, step_index);

        let Some(subject) = store.resolve_entity(&retraction.subject) else {
            return MatchOutcome::Unexplained {
                change_event: ep,
                reason: Unexplained::UnresolvedEntity {
                    name: retraction.subject.clone(),
                },
            };
        };
        let Some(old_location) = store.resolve_entity(&retraction.object) else {
            return MatchOutcome::Unexplained {
                change_event: ep,
                reason: Unexplained::UnresolvedEntity {
                    name: retraction.object.clone(),
                },
            };
        };

        let needs_anchor = self
            .anchor_class
            .is_some_and(|c| store.is_instance_of(subject, c));

        let lo = step_index.saturating_sub(self.config.window).max(1);
        let pool: Vec<_> = self.registry.born_between(lo, step_index).collect();
        let considered = pool.len();

        let mut scored = Vec::new();
        for reg in pool {
            let ev = reg.event;
            if reg.has_tag(&self.config.background_tag) {
                continue;
            }
            if !criteria::when_ok(Some(reg.birth_step), step_index) {
                continue;
            }
            if !criteria::where_ok(&*store, &self.props, &self.registry, ev, old_location) {
                continue;
            }
            if !criteria::has_event_type(&*store, &self.props, ev) {
                continue;
            }
            if needs_anchor
                && !criteria::who_anchor_ok(&*store, &self.props, ev, subject, old_location)
            {
                continue;
            }
            let shared = criteria::who_shared(&*store, &self.props, ev, subject);
            scored.push(Candidate {
                event: ev,
                score: 1 + u32::from(shared),
                shared,
            });
        }

        scored.sort_by(|a, b| b.score.cmp(&a.score));
        let Some(best) = scored.into_iter().next() else {
            tracing::debug!(%retraction, considered, "no causal candidate survived");
            return MatchOutcome::Unexplained {
                change_event: ep,
                reason: Unexplained::NoCandidate { considered },
            };
        };

        let link_added = self.record_causal_link(store, best.event, ep);
        let cause_name = name_of(&*store, best.event);
        let ep_name = name_of(&*store, ep);
        if link_added {
            tracing::info!(cause = %cause_name, effect = %ep_name, "added causal link");
        } else {
            tracing::info!(cause = %cause_name, effect = %ep_name, "causal link not added");
        }

        let rationale = self.rationale(&*store, &best, subject, old_location, step_index);
        let text = render_explanation(&cause_name, &ep_name, retraction, &rationale);
        MatchOutcome::Explained(Explanation {
            retraction: retraction.clone(),
            cause: cause_name,
            cause_id: best.event,
            change_event: ep_name,
            score: best.score,
            link_added,
            rationale,
            text,
        })
    }

    fn rationale<S: KnowledgeStore + ?Sized>(
        &self,
        store: &S,
        best: &Candidate,
        subject: EntityId,
        old_location: EntityId,
        step: usize,
    ) -> Rationale {
        let birth_step = self.registry.birth_step(best.event);
        let event_location = criteria::location_of(store, &self.props, &self.registry, best.event);
        Rationale {
            birth_step,
            step,
            precedence: Precedence::of(birth_step, step),
            event_location: event_location.map(|l| name_of(store, l)),
            change_location: name_of(store, old_location),
            location_compatible: criteria::where_ok(
                store,
                &self.props,
                &self.registry,
                best.event,
                old_location,
            ),
            subject: name_of(store, subject),
            shared_participant: best.shared,
            participants: criteria::participants(store, &self.props, best.event)
                .into_iter()
                .map(|p| name_of(store, p))
                .collect(),
            event_types: criteria::event_types(store, &self.props, best.event),
        }
    }

    /// Match every location retraction of a step (and, when enabled, the old
    /// value of every location update).
    pub fn validate_step<S: KnowledgeStore + ?Sized>(
        &self,
        store: &mut S,
        step_name: &str,
        step_index: usize,
        retractions: &[Fact],
    ) -> StepValidation {
        let mut out = StepValidation::default();
        for r in retractions {
            if !self.config.is_location_property(&r.predicate) {
                continue;
            }
            match self.explain(store, r, step_index) {
                MatchOutcome::Explained(exp) => out.explanations.push(exp),
                MatchOutcome::Unexplained { .. } => {
                    out.errors.push(format!(
                        "Retract {r} at step '{step_name}' has no known causal explanation."
                    ));
                    out.unexplained.push(r.clone());
                }
            }
        }
        out
    }
}

fn name_of<S: KnowledgeStore + ?Sized>(store: &S, id: EntityId) -> String {
    store
        .entity_name(id)
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string())
}

fn fmt_opt(name: &Option<String>) -> &str {
    name.as_deref().unwrap_or("∅")
}

/// Render the four-criteria explanation text.
pub fn render_explanation(
    cause: &str,
    change_event: &str,
    retraction: &Fact,
    r: &Rationale,
) -> String {
    let when = match (r.precedence, r.birth_step) {
        (Precedence::Before, Some(b)) => {
            format!("E precedes Ep (birth_step(E)={b} < step(Ep)={})", r.step)
        }
        (Precedence::Same, Some(b)) => {
            format!("E coincides with Ep (birth_step(E)={b} = step(Ep)={})", r.step)
        }
        (Precedence::After, Some(b)) => {
            format!("E happens after Ep (birth_step(E)={b} > step(Ep)={})", r.step)
        }
        _ => "the creation step of E is unknown".to_string(),
    };
    let where_ = format!(
        "E and Ep share a relative location: loc(E)={}, loc(Ep)={} -> {}",
        fmt_opt(&r.event_location),
        r.change_location,
        if r.location_compatible {
            "compatible"
        } else {
            "NOT compatible"
        }
    );
    let parts = r.participants.join(", ");
    let who = if r.shared_participant {
        format!(
            "E and Ep share the main participant: {} (participants of E: {parts})",
            r.subject
        )
    } else {
        format!(
            "E and Ep do not share the main participant; participants of E: {parts}; main participant of Ep: {}",
            r.subject
        )
    };
    let how = if r.event_types.is_empty() {
        "E has no explicit event type via classification (incomplete How)".to_string()
    } else {
        format!(
            "E is classified as event type(s): {}",
            r.event_types.join(", ")
        )
    };
    format!(
        "Event {cause} was selected as the cause of {change_event} for retraction {retraction} because:\n\
         - When: {when}.\n\
         - Where: {where_}.\n\
         - Who: {who}.\n\
         - How: {how}."
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kb::{MemoryStore, TBox};

    struct World {
        store: MemoryStore,
        matcher: CausalMatcher,
    }

    impl World {
        fn new() -> Self {
            let store = MemoryStore::new(Arc::new(TBox::bundled().unwrap()));
            let matcher = CausalMatcher::new(&store, MatcherConfig::default());
            Self { store, matcher }
        }

        fn typed(&mut self, name: &str, class: &str) -> EntityId {
            let c = self.store.resolve_class(class).unwrap();
            self.store.create_individual(name, c)
        }

        fn edge(&mut self, s: &str, p: &str, o: &str) {
            let s = self.store.ensure_individual(s);
            let o = self.store.ensure_individual(o);
            let p = self.store.resolve_property(p).unwrap();
            self.store.add_value(s, p, o);
        }

        fn event(&mut self, name: &str, step: usize, tags: &[&str]) {
            self.typed(name, "Action");
            let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
            self.matcher.register_new_types(
                &self.store,
                &[(name.to_string(), "DUL.Action".to_string())],
                step,
                &tags,
            );
        }

        /// Tray on robot in the hall, medicine on the tray.
        fn tray_world(&mut self) {
            self.typed("Medicine1", "PhysicalObject");
            self.typed("Tray", "PhysicalObject");
            self.typed("Robot", "Agent");
            self.typed("Nurse", "Agent");
            self.typed("Hall", "PhysicalPlace");
            self.typed("Task_Place", "Task");
            self.edge("Tray", "hasLocation", "Robot");
            self.edge("Robot", "hasLocation", "Hall");
            self.edge("Nurse", "hasLocation", "Hall");
        }

        fn place_event(&mut self, name: &str, step: usize, tags: &[&str]) {
            self.event(name, step, tags);
            self.edge(name, "hasParticipant", "Nurse");
            self.edge(name, "hasParticipant", "Medicine1");
            self.edge(name, "isOccurrenceOf", "Task_Place");
        }

        fn explain(&mut self, step: usize) -> MatchOutcome {
            let r = Fact::new("Medicine1", "DUL.hasLocation", "Tray");
            self.matcher.explain(&mut self.store, &r, step)
        }
    }

    #[test]
    fn unresolved_subject_still_creates_change_event() {
        let mut w = World::new();
        w.tray_world();
        let before = w.store.len();
        let r = Fact::new("Ghost", "hasLocation", "Tray");
        let outcome = w.matcher.explain(&mut w.store, &r, 3);
        assert!(matches!(
            outcome,
            MatchOutcome::Unexplained {
                reason: Unexplained::UnresolvedEntity { .. },
                ..
            }
        ));
        assert_eq!(w.store.len(), before + 1);
        assert!(w.store.resolve_entity("Ep_3_Ghost_hasLocation_Tray").is_some());
    }

    #[test]
    fn change_event_name_replaces_dots() {
        let r = Fact::new("DUL.Medicine1", "DUL.hasLocation", "x.Tray");
        assert_eq!(
            CausalMatcher::change_event_name(&r, 6),
            "Ep_6_DUL_Medicine1_hasLocation_x_Tray"
        );
    }

    #[test]
    fn explains_with_who_bonus() {
        let mut w = World::new();
        w.tray_world();
        w.place_event("Action_Place", 2, &[]);
        let outcome = w.explain(3);
        let exp = outcome.explanation().unwrap();
        assert_eq!(exp.cause, "Action_Place");
        assert_eq!(exp.score, 2);
        assert!(exp.link_added);
        assert_eq!(exp.rationale.precedence, Precedence::Before);
        assert_eq!(exp.rationale.event_location.as_deref(), Some("Hall"));
        assert!(exp.text.contains("- When: E precedes Ep (birth_step(E)=2 < step(Ep)=3)."));
        assert!(exp.text.contains("E is classified as event type(s): Task_Place"));

        let causes = w.store.resolve_property("causes").unwrap();
        let cause = w.store.resolve_entity("Action_Place").unwrap();
        let ep = w.store.resolve_entity("Ep_3_Medicine1_hasLocation_Tray").unwrap();
        assert_eq!(w.store.values(cause, causes), vec![ep]);
    }

    #[test]
    fn background_events_are_never_selected() {
        let mut w = World::new();
        w.tray_world();
        w.place_event("Action_Follow", 2, &["background"]);
        assert!(!w.explain(3).is_explained());
    }

    #[test]
    fn untyped_event_fails_how_gate() {
        let mut w = World::new();
        w.tray_world();
        w.event("Action_Untyped", 2, &[]);
        w.edge("Action_Untyped", "hasParticipant", "Medicine1");
        w.edge("Action_Untyped", "hasParticipant", "Nurse");
        assert!(!w.explain(2).is_explained());
    }

    #[test]
    fn window_excludes_old_events() {
        let mut w = World::new();
        w.tray_world();
        w.place_event("Action_Place", 2, &[]);
        match w.explain(5) {
            MatchOutcome::Unexplained {
                reason: Unexplained::NoCandidate { considered },
                ..
            } => assert_eq!(considered, 0),
            other => panic!("expected no candidate, got {other:?}"),
        }
    }

    #[test]
    fn physical_object_needs_anchor() {
        let mut w = World::new();
        w.tray_world();
        w.event("Action_Elsewhere", 2, &[]);
        w.edge("Action_Elsewhere", "hasParticipant", "Nurse");
        w.edge("Action_Elsewhere", "isOccurrenceOf", "Task_Place");
        assert!(!w.explain(2).is_explained());
    }

    #[test]
    fn ties_go_to_earliest_registration() {
        let mut w = World::new();
        w.tray_world();
        w.place_event("Action_B", 2, &[]);
        w.place_event("Action_A", 2, &[]);
        let outcome = w.explain(2);
        assert_eq!(outcome.explanation().unwrap().cause, "Action_B");
    }

    #[test]
    fn causal_link_is_idempotent() {
        let mut w = World::new();
        let a = w.typed("A", "Action");
        let b = w.typed("B", "Event");
        assert!(w.matcher.record_causal_link(&mut w.store, a, b));
        assert!(!w.matcher.record_causal_link(&mut w.store, a, b));
        let causes = w.store.resolve_property("causes").unwrap();
        assert_eq!(w.store.values(a, causes), vec![b]);
    }

    #[test]
    fn validate_step_only_matches_location_retractions() {
        let mut w = World::new();
        w.tray_world();
        let retracts = vec![
            Fact::new("Medicine1", "DUL.hasLocation", "Tray"),
            Fact::new("Nurse", "ocra.hasPlan", "Plan"),
        ];
        let v = w.matcher.validate_step(&mut w.store, "Drop", 4, &retracts);
        assert_eq!(v.errors.len(), 1);
        assert_eq!(v.unexplained, vec![retracts[0].clone()]);
        assert!(v.errors[0].contains("step 'Drop'"));
    }
}
