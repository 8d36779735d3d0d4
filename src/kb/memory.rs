//! In-memory ABox over a shared [`TBox`].
//!
//! Individuals keep their asserted types and edges apart from the inferred
//! ones, so every reasoning pass can start from a clean slate. All maps are
//! ordered, which keeps fact enumeration and value order deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::materialize::{Materializer, ReasoningStats};
use super::ontology::{PropertyKind, TBox};
use super::{Fact, KnowledgeStore};
use crate::error::KbResult;
use crate::symbol::{ClassId, EntityId, IdAllocator, PropertyId, local_name};

#[derive(Debug, Clone, Default)]
struct Individual {
    name: String,
    types: Vec<ClassId>,
    inferred_types: Vec<ClassId>,
    edges: BTreeMap<PropertyId, Vec<EntityId>>,
    inferred_edges: BTreeMap<PropertyId, Vec<EntityId>>,
}

impl Individual {
    fn has_type(&self, class: ClassId) -> bool {
        self.types.contains(&class) || self.inferred_types.contains(&class)
    }

    fn has_edge(&self, property: PropertyId, object: EntityId) -> bool {
        let asserted = self
            .edges
            .get(&property)
            .is_some_and(|v| v.contains(&object));
        asserted
            || self
                .inferred_edges
                .get(&property)
                .is_some_and(|v| v.contains(&object))
    }
}

/// Deterministic in-memory knowledge store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tbox: Arc<TBox>,
    ids: IdAllocator,
    individuals: BTreeMap<EntityId, Individual>,
    by_name: HashMap<String, EntityId>,
    materializer: Materializer,
}

impl MemoryStore {
    /// Create an empty store over `tbox`.
    pub fn new(tbox: Arc<TBox>) -> Self {
        Self {
            tbox,
            ids: IdAllocator::new(),
            individuals: BTreeMap::new(),
            by_name: HashMap::new(),
            materializer: Materializer::default(),
        }
    }

    /// Replace the materialiser (e.g. to change the round limit).
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    /// Shared handle to the terminology.
    pub fn tbox_handle(&self) -> Arc<TBox> {
        Arc::clone(&self.tbox)
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    /// Names of every live individual, sorted.
    pub fn individual_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.individuals.values().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    /// Only the asserted values of `property`, without inferences.
    pub fn asserted_values(&self, entity: EntityId, property: PropertyId) -> Vec<EntityId> {
        self.individuals
            .get(&entity)
            .and_then(|i| i.edges.get(&property))
            .cloned()
            .unwrap_or_default()
    }

    // ── Materialiser access ─────────────────────────────────────────────

    pub(super) fn clear_inferred(&mut self) {
        for ind in self.individuals.values_mut() {
            ind.inferred_types.clear();
            ind.inferred_edges.clear();
        }
    }

    /// Every current `(subject, object)` pair of `property`.
    pub(super) fn relations(&self, property: PropertyId) -> Vec<(EntityId, EntityId)> {
        let mut pairs = Vec::new();
        for (&id, ind) in &self.individuals {
            for map in [&ind.edges, &ind.inferred_edges] {
                if let Some(vals) = map.get(&property) {
                    pairs.extend(vals.iter().map(|&o| (id, o)));
                }
            }
        }
        pairs
    }

    /// Every current `(individual, class)` typing.
    pub(super) fn typings(&self) -> Vec<(EntityId, ClassId)> {
        let mut out = Vec::new();
        for (&id, ind) in &self.individuals {
            out.extend(ind.types.iter().map(|&c| (id, c)));
            out.extend(ind.inferred_types.iter().map(|&c| (id, c)));
        }
        out
    }

    /// Record an inferred edge unless the fact already holds.
    pub(super) fn infer_value(
        &mut self,
        subject: EntityId,
        property: PropertyId,
        object: EntityId,
    ) -> bool {
        if !self.individuals.contains_key(&object) {
            return false;
        }
        match self.individuals.get_mut(&subject) {
            Some(ind) if !ind.has_edge(property, object) => {
                ind.inferred_edges.entry(property).or_default().push(object);
                true
            }
            _ => false,
        }
    }

    /// Record an inferred type unless it already holds.
    pub(super) fn infer_type(&mut self, entity: EntityId, class: ClassId) -> bool {
        match self.individuals.get_mut(&entity) {
            Some(ind) if !ind.has_type(class) => {
                ind.inferred_types.push(class);
                true
            }
            _ => false,
        }
    }
}

impl KnowledgeStore for MemoryStore {
    fn tbox(&self) -> &TBox {
        &self.tbox
    }

    fn resolve_entity(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(local_name(name)).copied()
    }

    fn entity_name(&self, id: EntityId) -> Option<&str> {
        self.individuals.get(&id).map(|i| i.name.as_str())
    }

    fn ensure_individual(&mut self, name: &str) -> EntityId {
        let local = local_name(name);
        if let Some(&id) = self.by_name.get(local) {
            return id;
        }
        let id = self.ids.next_id();
        self.individuals.insert(
            id,
            Individual {
                name: local.to_string(),
                ..Default::default()
            },
        );
        self.by_name.insert(local.to_string(), id);
        tracing::trace!(%id, name = local, "created individual");
        id
    }

    fn add_type(&mut self, entity: EntityId, class: ClassId) -> bool {
        match self.individuals.get_mut(&entity) {
            Some(ind) if !ind.types.contains(&class) => {
                ind.types.push(class);
                true
            }
            _ => false,
        }
    }

    fn types_of(&self, entity: EntityId) -> Vec<ClassId> {
        self.individuals
            .get(&entity)
            .map(|i| {
                let mut all = i.types.clone();
                all.extend(i.inferred_types.iter().filter(|c| !i.types.contains(c)));
                all
            })
            .unwrap_or_default()
    }

    fn values(&self, entity: EntityId, property: PropertyId) -> Vec<EntityId> {
        let Some(ind) = self.individuals.get(&entity) else {
            return Vec::new();
        };
        let mut out = ind.edges.get(&property).cloned().unwrap_or_default();
        if let Some(inferred) = ind.inferred_edges.get(&property) {
            for &o in inferred {
                if !out.contains(&o) {
                    out.push(o);
                }
            }
        }
        out
    }

    fn add_value(&mut self, subject: EntityId, property: PropertyId, object: EntityId) -> bool {
        if !self.individuals.contains_key(&object) {
            return false;
        }
        let Some(ind) = self.individuals.get_mut(&subject) else {
            return false;
        };
        let vals = ind.edges.entry(property).or_default();
        if vals.contains(&object) {
            return false;
        }
        vals.push(object);
        true
    }

    fn remove_value(&mut self, subject: EntityId, property: PropertyId, object: EntityId) -> bool {
        let Some(ind) = self.individuals.get_mut(&subject) else {
            return false;
        };
        let mut removed = false;
        for map in [&mut ind.edges, &mut ind.inferred_edges] {
            if let Some(vals) = map.get_mut(&property) {
                let before = vals.len();
                vals.retain(|&o| o != object);
                removed |= vals.len() != before;
            }
        }
        removed
    }

    fn destroy_individual(&mut self, entity: EntityId) -> bool {
        let Some(ind) = self.individuals.remove(&entity) else {
            return false;
        };
        self.by_name.remove(&ind.name);
        for other in self.individuals.values_mut() {
            for map in [&mut other.edges, &mut other.inferred_edges] {
                for vals in map.values_mut() {
                    vals.retain(|&o| o != entity);
                }
            }
        }
        tracing::debug!(name = %ind.name, "destroyed individual");
        true
    }

    fn reason(&mut self, budget: Duration) -> KbResult<ReasoningStats> {
        self.clear_inferred();
        let materializer = self.materializer.clone();
        materializer.run(self, budget)
    }

    fn individuals(&self) -> Vec<EntityId> {
        self.individuals.keys().copied().collect()
    }

    fn facts(&self) -> Vec<Fact> {
        let mut out = Vec::new();
        for (&id, ind) in &self.individuals {
            let mut props: Vec<PropertyId> = ind
                .edges
                .keys()
                .chain(ind.inferred_edges.keys())
                .copied()
                .filter(|&p| self.tbox.property_info(p).kind == PropertyKind::Object)
                .collect();
            props.sort();
            props.dedup();
            for p in props {
                let pname = self.tbox.property_name(p);
                for o in self.values(id, p) {
                    if let Some(oname) = self.entity_name(o) {
                        out.push(Fact::new(ind.name.as_str(), pname, oname));
                    }
                }
            }
        }
        out
    }
}
