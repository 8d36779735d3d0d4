//! Knowledge store: the typed world model the matcher reasons over.
//!
//! The causal matcher and the orchestrator only see the store through the
//! [`KnowledgeStore`] trait: name resolution, typed individuals, per-property
//! value lists and a re-inference pass. [`MemoryStore`] is the in-memory
//! implementation backed by a [`TBox`] loaded from TOML ontology documents.

pub mod materialize;
pub mod memory;
pub mod ontology;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KbResult;
use crate::symbol::{ClassId, EntityId, PropertyId};

pub use materialize::ReasoningStats;
pub use memory::MemoryStore;
pub use ontology::{Ontology, OntologySource, PropertyKind, TBox};

/// A fact (subject, predicate, object) by local name.
///
/// Serialises as a JSON array `[s, p, o]` so it drops straight into prompts
/// and JSONL records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String, String)", into = "(String, String, String)")]
pub struct Fact {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Fact {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

impl From<(String, String, String)> for Fact {
    fn from((subject, predicate, object): (String, String, String)) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

impl From<Fact> for (String, String, String) {
    fn from(f: Fact) -> Self {
        (f.subject, f.predicate, f.object)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// Capabilities the core needs from a knowledge store.
///
/// Resolution never fails loudly: unknown names come back as `None` and the
/// caller decides whether to log and skip.
pub trait KnowledgeStore {
    /// The terminology this store was built against.
    fn tbox(&self) -> &TBox;

    /// Look up an existing individual by (possibly qualified) name.
    fn resolve_entity(&self, name: &str) -> Option<EntityId>;

    /// Local name of an individual.
    fn entity_name(&self, id: EntityId) -> Option<&str>;

    fn resolve_class(&self, name: &str) -> Option<ClassId> {
        self.tbox().class(name)
    }

    fn resolve_property(&self, name: &str) -> Option<PropertyId> {
        self.tbox().property(name)
    }

    /// Return the individual with this name, creating an untyped one if needed.
    fn ensure_individual(&mut self, name: &str) -> EntityId;

    /// Create (or reuse) an individual and give it `class`.
    fn create_individual(&mut self, name: &str, class: ClassId) -> EntityId {
        let id = self.ensure_individual(name);
        self.add_type(id, class);
        id
    }

    /// Add an asserted type. Returns `false` if it was already present.
    fn add_type(&mut self, entity: EntityId, class: ClassId) -> bool;

    /// Asserted and inferred types, asserted first.
    fn types_of(&self, entity: EntityId) -> Vec<ClassId>;

    /// Instance check through the class hierarchy.
    fn is_instance_of(&self, entity: EntityId, class: ClassId) -> bool {
        let tbox = self.tbox();
        self.types_of(entity)
            .into_iter()
            .any(|t| tbox.is_subclass_of(t, class))
    }

    /// Current values of `property` on `entity`, asserted first.
    fn values(&self, entity: EntityId, property: PropertyId) -> Vec<EntityId>;

    /// Append a value. Returns `false` if it was already present.
    fn add_value(&mut self, subject: EntityId, property: PropertyId, object: EntityId) -> bool;

    /// Remove a value. Returns `false` if it was not present.
    fn remove_value(&mut self, subject: EntityId, property: PropertyId, object: EntityId)
    -> bool;

    /// Destroy an individual and every edge that points at it.
    fn destroy_individual(&mut self, entity: EntityId) -> bool;

    /// Re-run inference over the whole store within `budget`.
    fn reason(&mut self, budget: Duration) -> KbResult<ReasoningStats>;

    /// All live individuals in creation order.
    fn individuals(&self) -> Vec<EntityId>;

    /// Every object-property fact, in deterministic order.
    fn facts(&self) -> Vec<Fact>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_serialises_as_array() {
        let f = Fact::new("Medicine1", "hasLocation", "ShadowTray");
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"["Medicine1","hasLocation","ShadowTray"]"#);
        let back: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
        assert_eq!(f.to_string(), "(Medicine1, hasLocation, ShadowTray)");
    }
}
