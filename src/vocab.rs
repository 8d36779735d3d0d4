//! Vocabulary extraction: the allowed lists the grounded generators quote.
//!
//! Two views of the TBox:
//!
//! - [`TBoxVocab`]: event types and property names of the *main* ontology,
//!   used by the C1 and C2 allowed lists.
//! - [`EventTypeCatalog`]: `EventType` subclasses with their descriptions,
//!   split into a preferred tier (declared by the extra ontologies) and a
//!   fallback tier (declared by the main ontology), used by C3.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::kb::{PropertyKind, TBox};
use crate::symbol::ClassId;

/// Default event roots for [`extract_tbox_vocab`].
pub const DEFAULT_EVENT_ROOTS: &[&str] = &["Event", "Action", "Process", "Occurrence"];

/// Root class of the event-type taxonomy.
pub const EVENT_TYPE_ROOT: &str = "EventType";

/// Description length in a rendered catalog line.
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Event types and property names of one ontology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TBoxVocab {
    pub event_types: Vec<String>,
    pub object_properties: Vec<String>,
    pub data_properties: Vec<String>,
}

/// Collect the main ontology's event types (classes under any of `roots`,
/// or every class when none of the roots exists), sorted and truncated to
/// `max_event_types`, plus its sorted property names.
pub fn extract_tbox_vocab(tbox: &TBox, roots: &[&str], max_event_types: usize) -> TBoxVocab {
    let main_classes: Vec<ClassId> = tbox
        .class_ids()
        .filter(|&c| tbox.class_info(c).declared_in.contains(&0))
        .collect();

    let root_ids: Vec<ClassId> = roots
        .iter()
        .filter_map(|r| {
            main_classes
                .iter()
                .copied()
                .find(|&c| tbox.class_name(c) == *r)
        })
        .collect();

    let event_set: BTreeSet<String> = main_classes
        .iter()
        .copied()
        .filter(|&c| root_ids.is_empty() || root_ids.iter().any(|&r| tbox.is_subclass_of(c, r)))
        .map(|c| tbox.class_name(c).to_string())
        .collect();

    let props = |kind: PropertyKind| -> Vec<String> {
        tbox.ontologies()
            .first()
            .map(|main| {
                main.properties
                    .iter()
                    .filter(|p| p.kind == kind)
                    .map(|p| p.name.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    };

    TBoxVocab {
        event_types: event_set.into_iter().take(max_event_types).collect(),
        object_properties: props(PropertyKind::Object),
        data_properties: props(PropertyKind::Data),
    }
}

// ── Event-type catalog ──────────────────────────────────────────────────

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub label: String,
    pub comment: String,
}

impl CatalogEntry {
    /// Comment, else label, cut to the catalog description length.
    pub fn description(&self) -> String {
        let desc = if self.comment.trim().is_empty() {
            self.label.trim()
        } else {
            self.comment.trim()
        };
        if desc.chars().count() > MAX_DESCRIPTION_CHARS {
            let cut: String = desc.chars().take(MAX_DESCRIPTION_CHARS).collect();
            format!("{}...", cut.trim_end())
        } else {
            desc.to_string()
        }
    }
}

/// The two-tier event-type catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventTypeCatalog {
    /// Declared by the extra ontologies.
    pub preferred: Vec<CatalogEntry>,
    /// Declared by the main ontology.
    pub fallback: Vec<CatalogEntry>,
}

impl EventTypeCatalog {
    /// Build both tiers. Entries are sorted by name and de-duplicated.
    pub fn from_tbox(tbox: &TBox) -> Self {
        let root = tbox.class(EVENT_TYPE_ROOT);
        Self {
            preferred: catalog_for(tbox, root, |declared| declared.iter().any(|&i| i >= 1)),
            fallback: catalog_for(tbox, root, |declared| declared.contains(&0)),
        }
    }

    /// Allowed class names: preferred first, then fallback, de-duplicated.
    pub fn allowed_classes(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.preferred
            .iter()
            .chain(&self.fallback)
            .filter(|e| seen.insert(e.name.clone()))
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn preferred_names(&self) -> BTreeSet<String> {
        self.preferred.iter().map(|e| e.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.preferred.is_empty() && self.fallback.is_empty()
    }
}

fn catalog_for(
    tbox: &TBox,
    root: Option<ClassId>,
    declared: impl Fn(&[usize]) -> bool,
) -> Vec<CatalogEntry> {
    let mut out: Vec<CatalogEntry> = tbox
        .class_ids()
        .filter(|&c| declared(&tbox.class_info(c).declared_in))
        .filter(|&c| match root {
            Some(r) => tbox.is_subclass_of(c, r),
            None => looks_like_event_type(tbox.class_name(c)),
        })
        .map(|c| {
            let info = tbox.class_info(c);
            CatalogEntry {
                name: info.name.clone(),
                label: info.label.trim().to_string(),
                comment: info.comment.trim().to_string(),
            }
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.dedup_by(|a, b| a.name == b.name);
    out
}

/// Name heuristic used when no `EventType` root exists.
fn looks_like_event_type(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["event", "action", "task", "process", "activity"]
        .iter()
        .any(|k| lower.contains(k))
}

/// Render at most `max_items` entries as `- Name: description` lines.
pub fn format_catalog(entries: &[CatalogEntry], max_items: usize) -> String {
    entries
        .iter()
        .take(max_items)
        .map(|e| {
            let desc = e.description();
            if desc.is_empty() {
                format!("- {}", e.name)
            } else {
                format!("- {}: {desc}", e.name)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::{Ontology, OntologySource};

    #[test]
    fn main_vocab_excludes_extra_ontology_classes() {
        let tbox = TBox::bundled().unwrap();
        let v = extract_tbox_vocab(&tbox, DEFAULT_EVENT_ROOTS, 120);
        assert!(v.event_types.contains(&"Action".to_string()));
        assert!(v.event_types.contains(&"ChangeDisappearanceEvent".to_string()));
        assert!(!v.event_types.contains(&"PhysicalObject".to_string()));
        assert!(!v.event_types.contains(&"ObjectFallsFromTray".to_string()));
        let mut sorted = v.event_types.clone();
        sorted.sort();
        assert_eq!(v.event_types, sorted);
        assert!(v.object_properties.contains(&"hasLocation".to_string()));
        assert!(v.data_properties.contains(&"hasName".to_string()));
    }

    #[test]
    fn vocab_respects_cap() {
        let tbox = TBox::bundled().unwrap();
        let v = extract_tbox_vocab(&tbox, DEFAULT_EVENT_ROOTS, 2);
        assert_eq!(v.event_types.len(), 2);
    }

    #[test]
    fn no_roots_means_every_class() {
        let tbox = TBox::bundled().unwrap();
        let v = extract_tbox_vocab(&tbox, &["NoSuchRoot"], 500);
        assert!(v.event_types.contains(&"PhysicalPlace".to_string()));
    }

    #[test]
    fn catalog_tiers_split_by_ontology() {
        let tbox = TBox::bundled().unwrap();
        let cat = EventTypeCatalog::from_tbox(&tbox);
        let preferred = cat.preferred_names();
        assert!(preferred.contains("ObjectFallsFromTray"));
        assert!(preferred.contains("TrayMishap"));
        assert!(!preferred.contains("Placing"));
        assert!(cat.fallback.iter().any(|e| e.name == "Placing"));
        assert!(cat.fallback.iter().any(|e| e.name == "EventType"));
        assert!(!cat.fallback.iter().any(|e| e.name == "Action"));

        let allowed = cat.allowed_classes();
        assert_eq!(allowed[0], cat.preferred[0].name);
        let unique: BTreeSet<_> = allowed.iter().collect();
        assert_eq!(unique.len(), allowed.len());
    }

    #[test]
    fn heuristic_catalog_without_event_type_root() {
        let text = r#"
            [ontology]
            id = "tiny"
            name = "Tiny"

            [[classes]]
            name = "SpillEvent"

            [[classes]]
            name = "CleaningTask"

            [[classes]]
            name = "Mop"
        "#;
        let onto = Ontology::parse(text, OntologySource::Bundled).unwrap();
        let tbox = TBox::new(onto, Vec::new()).unwrap();
        let cat = EventTypeCatalog::from_tbox(&tbox);
        let names: Vec<_> = cat.fallback.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["CleaningTask", "SpillEvent"]);
        assert!(cat.preferred.is_empty());
    }

    #[test]
    fn long_descriptions_are_cut() {
        let e = CatalogEntry {
            name: "X".into(),
            label: "short label".into(),
            comment: "a".repeat(250),
        };
        let desc = e.description();
        assert!(desc.ends_with("..."));
        assert_eq!(desc.chars().count(), 203);

        let labelled = CatalogEntry {
            comment: String::new(),
            ..e.clone()
        };
        assert_eq!(
            format_catalog(&[labelled, CatalogEntry { name: "Y".into(), label: String::new(), comment: String::new() }], 10),
            "- X: short label\n- Y"
        );
    }
}
