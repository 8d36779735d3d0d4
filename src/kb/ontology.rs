//! TBox: class and property hierarchy loaded from TOML ontology documents.
//!
//! An ontology document declares classes and properties by local name. A
//! [`TBox`] merges a main ontology with any extra ontologies into a single
//! name → descriptor index, resolved once at load time. Every later lookup is
//! by key and yields a typed [`ClassId`] / [`PropertyId`] or `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KbError, KbResult};
use crate::symbol::{ClassId, PropertyId, local_name};

// ── Document model ──────────────────────────────────────────────────────

/// Whether a property links individuals or carries literal data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    #[default]
    Object,
    Data,
}

/// A class declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub comment: String,
}

/// A property declaration with the characteristics the materialiser honours.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    #[serde(default)]
    pub kind: PropertyKind,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub inverse: Option<String>,
    #[serde(default)]
    pub transitive: bool,
    #[serde(default)]
    pub symmetric: bool,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub range: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OntologyMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Where an ontology document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OntologySource {
    /// Bundled into the binary via `include_str!`.
    Bundled,
    /// Loaded from a file.
    File(PathBuf),
}

/// One parsed ontology document.
#[derive(Debug, Clone)]
pub struct Ontology {
    pub meta: OntologyMeta,
    pub classes: Vec<ClassDef>,
    pub properties: Vec<PropertyDef>,
    pub source: OntologySource,
}

#[derive(Debug, Deserialize)]
struct OntologyToml {
    ontology: OntologyMeta,
    #[serde(default)]
    classes: Vec<ClassDef>,
    #[serde(default)]
    properties: Vec<PropertyDef>,
}

const MLO_TOML: &str = include_str!("../../data/ontology/mlo.toml");
const TMO_TOML: &str = include_str!("../../data/ontology/tmo.toml");

impl Ontology {
    /// Parse an ontology document from TOML text.
    pub fn parse(toml_str: &str, source: OntologySource) -> KbResult<Self> {
        let parsed: OntologyToml = toml::from_str(toml_str).map_err(|e| KbError::Parse {
            id: match &source {
                OntologySource::Bundled => "(bundled)".into(),
                OntologySource::File(p) => p.display().to_string(),
            },
            message: e.to_string(),
        })?;
        Ok(Self {
            meta: parsed.ontology,
            classes: parsed.classes,
            properties: parsed.properties,
            source,
        })
    }

    /// Load a bundled ontology by id (`mlo` or `tmo`).
    pub fn bundled(id: &str) -> KbResult<Self> {
        let text = match id.to_ascii_lowercase().as_str() {
            "mlo" => MLO_TOML,
            "tmo" => TMO_TOML,
            _ => return Err(KbError::UnknownOntology { id: id.to_string() }),
        };
        Self::parse(text, OntologySource::Bundled)
    }

    /// Load an ontology document from disk.
    pub fn load(path: &Path) -> KbResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KbError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, OntologySource::File(path.to_path_buf()))
    }

    /// Resolve a reference that is either a bundled id or a file path.
    pub fn resolve(reference: &str) -> KbResult<Self> {
        match Self::bundled(reference) {
            Ok(onto) => Ok(onto),
            Err(KbError::UnknownOntology { .. }) => Self::load(Path::new(reference)),
            Err(e) => Err(e),
        }
    }
}

// ── Merged index ────────────────────────────────────────────────────────

/// Resolved class descriptor.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub label: String,
    pub comment: String,
    pub parents: Vec<ClassId>,
    /// The class itself followed by every transitive superclass.
    pub ancestors: Vec<ClassId>,
    /// Indices into [`TBox::ontologies`] of the documents declaring this class.
    pub declared_in: Vec<usize>,
}

/// Resolved property descriptor.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub kind: PropertyKind,
    pub parents: Vec<PropertyId>,
    /// Transitive super-properties, excluding the property itself.
    pub super_properties: Vec<PropertyId>,
    pub inverse: Option<PropertyId>,
    pub transitive: bool,
    pub symmetric: bool,
    pub chain: Vec<PropertyId>,
    pub domain: Vec<ClassId>,
    pub range: Vec<ClassId>,
}

/// The merged terminology of a main ontology plus extras.
#[derive(Debug, Clone)]
pub struct TBox {
    ontologies: Vec<Ontology>,
    classes: Vec<ClassInfo>,
    class_index: HashMap<String, ClassId>,
    properties: Vec<PropertyInfo>,
    property_index: HashMap<String, PropertyId>,
}

impl TBox {
    /// Merge `main` with `extras`. Declarations sharing a local name are unified.
    pub fn new(main: Ontology, extras: Vec<Ontology>) -> KbResult<Self> {
        let mut ontologies = Vec::with_capacity(1 + extras.len());
        ontologies.push(main);
        ontologies.extend(extras);

        let mut tbox = Self {
            ontologies: Vec::new(),
            classes: Vec::new(),
            class_index: HashMap::new(),
            properties: Vec::new(),
            property_index: HashMap::new(),
        };

        // Pass 1: allocate ids for every declared name.
        for (doc_idx, onto) in ontologies.iter().enumerate() {
            for def in &onto.classes {
                let name = local_name(&def.name).to_string();
                let id = match tbox.class_index.get(&name) {
                    Some(&id) => id,
                    None => {
                        let id = ClassId(tbox.classes.len());
                        tbox.classes.push(ClassInfo {
                            name: name.clone(),
                            label: String::new(),
                            comment: String::new(),
                            parents: Vec::new(),
                            ancestors: Vec::new(),
                            declared_in: Vec::new(),
                        });
                        tbox.class_index.insert(name, id);
                        id
                    }
                };
                let info = &mut tbox.classes[id.0];
                if info.label.is_empty() {
                    info.label = def.label.trim().to_string();
                }
                if info.comment.is_empty() {
                    info.comment = def.comment.trim().to_string();
                }
                if !info.declared_in.contains(&doc_idx) {
                    info.declared_in.push(doc_idx);
                }
            }
            for def in &onto.properties {
                let name = local_name(&def.name).to_string();
                if tbox.property_index.contains_key(&name) {
                    continue;
                }
                let id = PropertyId(tbox.properties.len());
                tbox.properties.push(PropertyInfo {
                    name: name.clone(),
                    kind: def.kind,
                    parents: Vec::new(),
                    super_properties: Vec::new(),
                    inverse: None,
                    transitive: false,
                    symmetric: false,
                    chain: Vec::new(),
                    domain: Vec::new(),
                    range: Vec::new(),
                });
                tbox.property_index.insert(name, id);
            }
        }

        // Pass 2: resolve references.
        for onto in &ontologies {
            for def in &onto.classes {
                let id = tbox.require_class(&def.name, &def.name)?;
                for parent in &def.parents {
                    let pid = tbox.require_class(&def.name, parent)?;
                    if !tbox.classes[id.0].parents.contains(&pid) {
                        tbox.classes[id.0].parents.push(pid);
                    }
                }
            }
            for def in &onto.properties {
                let id = tbox.require_property(&def.name, &def.name)?;
                let mut parents = Vec::new();
                for parent in &def.parents {
                    parents.push(tbox.require_property(&def.name, parent)?);
                }
                let inverse = match &def.inverse {
                    Some(inv) => Some(tbox.require_property(&def.name, inv)?),
                    None => None,
                };
                let mut chain = Vec::new();
                for link in &def.chain {
                    chain.push(tbox.require_property(&def.name, link)?);
                }
                let mut domain = Vec::new();
                for c in &def.domain {
                    domain.push(tbox.require_class(&def.name, c)?);
                }
                let mut range = Vec::new();
                for c in &def.range {
                    range.push(tbox.require_class(&def.name, c)?);
                }

                let info = &mut tbox.properties[id.0];
                for p in parents {
                    if !info.parents.contains(&p) {
                        info.parents.push(p);
                    }
                }
                info.transitive |= def.transitive;
                info.symmetric |= def.symmetric;
                if info.chain.is_empty() {
                    info.chain = chain;
                }
                info.domain.extend(domain);
                info.range.extend(range);
                if let Some(inv) = inverse {
                    info.inverse = Some(inv);
                    // Inverse declarations hold both ways.
                    if tbox.properties[inv.0].inverse.is_none() {
                        tbox.properties[inv.0].inverse = Some(id);
                    }
                }
            }
        }

        // Pass 3: transitive hierarchies.
        for idx in 0..tbox.classes.len() {
            let ancestors = walk_up(ClassId(idx), |c| &tbox.classes[c.0].parents);
            tbox.classes[idx].ancestors = ancestors;
        }
        for idx in 0..tbox.properties.len() {
            let mut supers = walk_up(PropertyId(idx), |p| &tbox.properties[p.0].parents);
            supers.retain(|p| p.0 != idx);
            tbox.properties[idx].super_properties = supers;
        }

        tbox.ontologies = ontologies;
        Ok(tbox)
    }

    /// Build the default TBox from the bundled ontologies.
    pub fn bundled() -> KbResult<Self> {
        Self::new(Ontology::bundled("mlo")?, vec![Ontology::bundled("tmo")?])
    }

    fn require_class(&self, owner: &str, name: &str) -> KbResult<ClassId> {
        self.class(name).ok_or_else(|| KbError::DanglingReference {
            owner: owner.to_string(),
            reference: name.to_string(),
        })
    }

    fn require_property(&self, owner: &str, name: &str) -> KbResult<PropertyId> {
        self.property(name).ok_or_else(|| KbError::DanglingReference {
            owner: owner.to_string(),
            reference: name.to_string(),
        })
    }

    /// Look up a class by (possibly qualified) name.
    pub fn class(&self, name: &str) -> Option<ClassId> {
        self.class_index.get(local_name(name)).copied()
    }

    /// Look up a property by (possibly qualified) name.
    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.property_index.get(local_name(name)).copied()
    }

    pub fn class_info(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0]
    }

    pub fn property_info(&self, id: PropertyId) -> &PropertyInfo {
        &self.properties[id.0]
    }

    pub fn class_name(&self, id: ClassId) -> &str {
        &self.classes[id.0].name
    }

    pub fn property_name(&self, id: PropertyId) -> &str {
        &self.properties[id.0].name
    }

    /// `true` if `class` is `ancestor` or one of its subclasses.
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.classes[class.0].ancestors.contains(&ancestor)
    }

    /// All class ids in declaration order.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.classes.len()).map(ClassId)
    }

    /// All property ids in declaration order.
    pub fn property_ids(&self) -> impl Iterator<Item = PropertyId> + '_ {
        (0..self.properties.len()).map(PropertyId)
    }

    /// Object property ids in declaration order.
    pub fn object_property_ids(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.property_ids()
            .filter(|p| self.properties[p.0].kind == PropertyKind::Object)
    }

    /// Sorted names of every object property.
    pub fn object_property_names(&self) -> Vec<String> {
        self.sorted_property_names(PropertyKind::Object)
    }

    /// Sorted names of every data property.
    pub fn data_property_names(&self) -> Vec<String> {
        self.sorted_property_names(PropertyKind::Data)
    }

    fn sorted_property_names(&self, kind: PropertyKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .properties
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Source documents: index 0 is the main ontology.
    pub fn ontologies(&self) -> &[Ontology] {
        &self.ontologies
    }

    /// Paths of the extra ontologies that were loaded from disk.
    pub fn extra_sources(&self) -> Vec<String> {
        self.ontologies
            .iter()
            .skip(1)
            .map(|o| match &o.source {
                OntologySource::Bundled => o.meta.id.clone(),
                OntologySource::File(p) => p.display().to_string(),
            })
            .collect()
    }
}

/// Breadth-first walk up a parent relation; the start node comes first.
fn walk_up<'a, T, F>(start: T, parents: F) -> Vec<T>
where
    T: Copy + Eq + std::hash::Hash + 'a,
    F: Fn(T) -> &'a [T],
{
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        if !seen.insert(node) {
            continue;
        }
        order.push(node);
        for &p in parents(node) {
            if !seen.contains(&p) {
                queue.push_back(p);
            }
        }
    }
    order
}
