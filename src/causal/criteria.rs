//! The four abductive criteria (When, Where, Who, How) and the store queries
//! they rest on.

use std::collections::HashSet;

use crate::kb::KnowledgeStore;
use crate::registry::EventRegistry;
use crate::symbol::{EntityId, PropertyId};

/// Property handles the criteria read, resolved once against the TBox.
///
/// Each list keeps configuration order; names the TBox does not know are
/// dropped at resolution time.
#[derive(Debug, Clone, Default)]
pub struct CriteriaProps {
    pub participant: Vec<PropertyId>,
    pub location: Vec<PropertyId>,
    pub causal: Vec<PropertyId>,
    pub classification: Vec<PropertyId>,
}

/// Temporal relation between a candidate's birth step and the retraction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    Before,
    Same,
    After,
    Unknown,
}

impl Precedence {
    pub fn of(birth: Option<usize>, step: usize) -> Self {
        match birth {
            None => Self::Unknown,
            Some(b) if b < step => Self::Before,
            Some(b) if b == step => Self::Same,
            Some(_) => Self::After,
        }
    }
}

/// When: the candidate must not postdate the effect.
pub fn when_ok(birth: Option<usize>, step: usize) -> bool {
    birth.is_some_and(|b| b <= step)
}

/// Every value of every participant property, in property order.
pub fn participants<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    event: EntityId,
) -> Vec<EntityId> {
    props
        .participant
        .iter()
        .flat_map(|&p| store.values(event, p))
        .collect()
}

/// First direct location value of `entity`.
fn direct_location<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    entity: EntityId,
) -> Option<EntityId> {
    props
        .location
        .iter()
        .find_map(|&p| store.values(entity, p).first().copied())
}

/// Where an event happened: its own first location value, or else, for a
/// registered event, the first location of the first participant that has one.
pub fn location_of<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    registry: &EventRegistry,
    event: EntityId,
) -> Option<EntityId> {
    if let Some(loc) = direct_location(store, props, event) {
        return Some(loc);
    }
    if !registry.contains(event) {
        return None;
    }
    participants(store, props, event)
        .into_iter()
        .find_map(|part| direct_location(store, props, part))
}

/// Every entity reachable from `start` over location edges, `start` included.
pub fn location_closure<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    start: EntityId,
) -> HashSet<EntityId> {
    let mut visited = HashSet::new();
    let mut frontier = vec![start];
    while let Some(cur) = frontier.pop() {
        if !visited.insert(cur) {
            continue;
        }
        for &p in &props.location {
            for v in store.values(cur, p) {
                if !visited.contains(&v) {
                    frontier.push(v);
                }
            }
        }
    }
    visited
}

/// Where: the candidate's location lies in the closure of the old location.
pub fn where_ok<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    registry: &EventRegistry,
    event: EntityId,
    old_location: EntityId,
) -> bool {
    location_of(store, props, registry, event)
        .is_some_and(|loc| location_closure(store, props, old_location).contains(&loc))
}

/// Names of the event types classifying `event`.
pub fn event_types<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    event: EntityId,
) -> Vec<String> {
    props
        .classification
        .iter()
        .flat_map(|&p| store.values(event, p))
        .filter_map(|t| store.entity_name(t).map(str::to_string))
        .collect()
}

/// How: at least one classification edge.
pub fn has_event_type<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    event: EntityId,
) -> bool {
    props
        .classification
        .iter()
        .any(|&p| !store.values(event, p).is_empty())
}

/// Who (bonus): the retracted subject is a participant.
pub fn who_shared<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    event: EntityId,
    subject: EntityId,
) -> bool {
    participants(store, props, event).contains(&subject)
}

/// Who (anchor): the subject or the old location is a participant.
pub fn who_anchor_ok<S: KnowledgeStore + ?Sized>(
    store: &S,
    props: &CriteriaProps,
    event: EntityId,
    subject: EntityId,
    old_location: EntityId,
) -> bool {
    let parts = participants(store, props, event);
    parts.contains(&subject) || parts.contains(&old_location)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kb::{MemoryStore, TBox};

    fn setup() -> (MemoryStore, CriteriaProps) {
        let store = MemoryStore::new(Arc::new(TBox::bundled().unwrap()));
        let props = CriteriaProps {
            participant: vec![store.resolve_property("hasParticipant").unwrap()],
            location: vec![
                store.resolve_property("hasLocation").unwrap(),
                store.resolve_property("occursIn").unwrap(),
            ],
            causal: vec![store.resolve_property("causes").unwrap()],
            classification: vec![
                store.resolve_property("classifies").unwrap(),
                store.resolve_property("isOccurrenceOf").unwrap(),
            ],
        };
        (store, props)
    }

    #[test]
    fn precedence_cases() {
        assert_eq!(Precedence::of(Some(2), 6), Precedence::Before);
        assert_eq!(Precedence::of(Some(6), 6), Precedence::Same);
        assert_eq!(Precedence::of(Some(7), 6), Precedence::After);
        assert_eq!(Precedence::of(None, 6), Precedence::Unknown);
        assert!(when_ok(Some(6), 6));
        assert!(!when_ok(Some(7), 6));
        assert!(!when_ok(None, 6));
    }

    #[test]
    fn closure_follows_location_chain_and_survives_cycles() {
        let (mut s, props) = setup();
        let loc = props.location[0];
        let tray = s.ensure_individual("Tray");
        let robot = s.ensure_individual("Robot");
        let hall = s.ensure_individual("Hall");
        let hospital = s.ensure_individual("Hospital");
        let other = s.ensure_individual("Room101");
        s.add_value(tray, loc, robot);
        s.add_value(robot, loc, hall);
        s.add_value(hall, loc, hospital);
        s.add_value(hospital, loc, tray);

        let closure = location_closure(&s, &props, tray);
        assert_eq!(closure.len(), 4);
        assert!(closure.contains(&tray));
        assert!(closure.contains(&hospital));
        assert!(!closure.contains(&other));
    }

    #[test]
    fn location_falls_back_to_participants_for_registered_events() {
        let (mut s, props) = setup();
        let loc = props.location[0];
        let part = props.participant[0];
        let ev = s.ensure_individual("Action_X");
        let robot = s.ensure_individual("Robot");
        let nurse = s.ensure_individual("Nurse");
        let hall = s.ensure_individual("Hall");
        s.add_value(ev, part, robot);
        s.add_value(ev, part, nurse);
        s.add_value(nurse, loc, hall);

        let empty = EventRegistry::new();
        assert_eq!(location_of(&s, &props, &empty, ev), None);

        let mut reg = EventRegistry::new();
        reg.register(ev, "Action_X", 1, &[]);
        assert_eq!(location_of(&s, &props, &reg, ev), Some(hall));
    }

    #[test]
    fn anchor_accepts_old_location_participant() {
        let (mut s, props) = setup();
        let part = props.participant[0];
        let ev = s.ensure_individual("Action_Y");
        let med = s.ensure_individual("Medicine1");
        let tray = s.ensure_individual("Tray");
        s.add_value(ev, part, tray);
        assert!(who_anchor_ok(&s, &props, ev, med, tray));
        assert!(!who_shared(&s, &props, ev, med));
    }
}
