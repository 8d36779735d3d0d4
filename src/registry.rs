//! Event registry: birth step and lifecycle tags of every known event.
//!
//! The [`EventRegistry`] remembers, for each individual ever typed into an
//! event class, the step at which that first happened. Entries live in a
//! `Vec` in registration order, which is the order the causal matcher visits
//! candidates in.

use crate::symbol::EntityId;

/// One registered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    pub event: EntityId,
    /// Local name at registration time.
    pub name: String,
    /// Step index (1-based) of first classification as an event. Never changes.
    pub birth_step: usize,
    /// Tags of the registering step, e.g. `background`.
    pub tags: Vec<String>,
}

impl EventRegistration {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Registration-ordered set of events.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    entries: Vec<EventRegistration>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `event` born at `step`. Returns `false` if it was already
    /// registered; the original birth step and tags are kept.
    pub fn register(
        &mut self,
        event: EntityId,
        name: impl Into<String>,
        step: usize,
        tags: &[String],
    ) -> bool {
        if self.contains(event) {
            return false;
        }
        self.entries.push(EventRegistration {
            event,
            name: name.into(),
            birth_step: step,
            tags: tags.to_vec(),
        });
        true
    }

    pub fn contains(&self, event: EntityId) -> bool {
        self.entries.iter().any(|e| e.event == event)
    }

    pub fn get(&self, event: EntityId) -> Option<&EventRegistration> {
        self.entries.iter().find(|e| e.event == event)
    }

    pub fn birth_step(&self, event: EntityId) -> Option<usize> {
        self.get(event).map(|e| e.birth_step)
    }

    /// Remove every entry whose name matches one of `names` (local names).
    /// Returns the removed registrations.
    pub fn unregister_names(&mut self, names: &[String]) -> Vec<EventRegistration> {
        let locals: Vec<&str> = names
            .iter()
            .map(|n| crate::symbol::local_name(n))
            .collect();
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| locals.contains(&e.name.as_str()));
        self.entries = kept;
        for e in &removed {
            tracing::debug!(event = %e.name, "removed event from registry");
        }
        removed
    }

    /// Entries born within `[lo, hi]`, in registration order.
    pub fn born_between(&self, lo: usize, hi: usize) -> impl Iterator<Item = &EventRegistration> {
        self.entries
            .iter()
            .filter(move |e| (lo..=hi).contains(&e.birth_step))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRegistration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
