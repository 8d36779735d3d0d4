//! Scenarios: fixed step sequences that drive the simulated world.
//!
//! A scenario is a TOML document with a `[scenario]` table naming the
//! ontologies it runs against and a `[[steps]]` array. Two scenarios are
//! bundled into the binary: `medicine_lost` and `nominal`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

use crate::error::KbResult;
use crate::kb::{Fact, Ontology, TBox};

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum ScenarioError {
    #[error("scenario not found: \"{id}\"")]
    #[diagnostic(
        code(causa::scenario::not_found),
        help("Bundled scenarios are `medicine_lost` and `nominal`. Pass a path to a scenario TOML file otherwise.")
    )]
    NotFound { id: String },

    #[error("failed to read scenario file: {path}")]
    #[diagnostic(code(causa::scenario::io), help("Ensure the file exists and is readable."))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario \"{id}\": {message}")]
    #[diagnostic(
        code(causa::scenario::parse),
        help(
            "A scenario needs a [scenario] table (id, ontology) and [[steps]] entries. \
             Triples are written as [\"s\", \"p\", \"o\"], updates as [\"s\", \"p\", \"old\", \"new\"]."
        )
    )]
    Parse { id: String, message: String },

    #[error("invalid scenario \"{id}\": {message}")]
    #[diagnostic(
        code(causa::scenario::invalid),
        help("Every step needs a non-empty name and the scenario needs at least one step.")
    )]
    Invalid { id: String, message: String },
}

pub type ScenarioResult<T> = std::result::Result<T, ScenarioError>;

// ── Data model ──────────────────────────────────────────────────────────

/// Atomic replacement of one value of `(subject, property)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String, String, String)")]
pub struct Update {
    pub subject: String,
    pub property: String,
    pub old: String,
    pub new: String,
}

impl From<(String, String, String, String)> for Update {
    fn from((subject, property, old, new): (String, String, String, String)) -> Self {
        Self {
            subject,
            property,
            old,
            new,
        }
    }
}

impl Update {
    /// The fact this update removes.
    pub fn old_fact(&self) -> Fact {
        Fact::new(&self.subject, &self.property, &self.old)
    }

    /// The fact this update adds.
    pub fn new_fact(&self) -> Fact {
        Fact::new(&self.subject, &self.property, &self.new)
    }
}

/// One unit of simulated change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    pub name: String,
    /// `(individual, class)` assignments.
    #[serde(default)]
    pub types: Vec<(String, String)>,
    #[serde(default)]
    pub asserts: Vec<Fact>,
    #[serde(default)]
    pub retracts: Vec<Fact>,
    #[serde(default)]
    pub updates: Vec<Update>,
    /// Individuals destroyed at the end of the step.
    #[serde(default)]
    pub deletes: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Where a scenario came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioSource {
    Bundled,
    File(PathBuf),
    /// Built in code.
    Inline,
}

/// A complete scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    /// Main ontology: a bundled id or a path.
    pub ontology: String,
    pub extra_ontologies: Vec<String>,
    pub enable_reasoner: bool,
    pub steps: Vec<Step>,
    pub source: ScenarioSource,
}

#[derive(Debug, Deserialize)]
struct ScenarioToml {
    scenario: ScenarioMeta,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct ScenarioMeta {
    id: String,
    #[serde(default = "default_ontology")]
    ontology: String,
    #[serde(default)]
    extra_ontologies: Vec<String>,
    #[serde(default = "default_enable_reasoner")]
    enable_reasoner: bool,
}

fn default_ontology() -> String {
    "mlo".into()
}
fn default_enable_reasoner() -> bool {
    true
}

// ── Bundled scenarios ───────────────────────────────────────────────────

const MEDICINE_LOST_TOML: &str = include_str!("../data/scenarios/medicine_lost.toml");
const NOMINAL_TOML: &str = include_str!("../data/scenarios/nominal.toml");

/// Ids of the scenarios compiled into the binary.
pub const BUNDLED_SCENARIOS: &[&str] = &["medicine_lost", "nominal"];

impl Scenario {
    /// Build a scenario in code against the bundled ontologies.
    pub fn inline(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            ontology: default_ontology(),
            extra_ontologies: vec!["tmo".into()],
            enable_reasoner: true,
            steps,
            source: ScenarioSource::Inline,
        }
    }

    pub fn parse(toml_str: &str, source: ScenarioSource) -> ScenarioResult<Self> {
        let parsed: ScenarioToml = toml::from_str(toml_str).map_err(|e| ScenarioError::Parse {
            id: match &source {
                ScenarioSource::File(p) => p.display().to_string(),
                _ => "(bundled)".into(),
            },
            message: e.to_string(),
        })?;
        let scenario = Self {
            id: parsed.scenario.id,
            ontology: parsed.scenario.ontology,
            extra_ontologies: parsed.scenario.extra_ontologies,
            enable_reasoner: parsed.scenario.enable_reasoner,
            steps: parsed.steps,
            source,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> ScenarioResult<()> {
        if self.steps.is_empty() {
            return Err(ScenarioError::Invalid {
                id: self.id.clone(),
                message: "no steps".into(),
            });
        }
        if let Some(pos) = self.steps.iter().position(|s| s.name.trim().is_empty()) {
            return Err(ScenarioError::Invalid {
                id: self.id.clone(),
                message: format!("step {} has an empty name", pos + 1),
            });
        }
        Ok(())
    }

    pub fn bundled(id: &str) -> ScenarioResult<Self> {
        let text = match id {
            "medicine_lost" => MEDICINE_LOST_TOML,
            "nominal" => NOMINAL_TOML,
            _ => return Err(ScenarioError::NotFound { id: id.to_string() }),
        };
        Self::parse(text, ScenarioSource::Bundled)
    }

    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ScenarioError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, ScenarioSource::File(path.to_path_buf()))
    }

    /// A bundled id, or else a path to a scenario file.
    pub fn resolve(reference: &str) -> ScenarioResult<Self> {
        match Self::bundled(reference) {
            Err(ScenarioError::NotFound { .. }) if Path::new(reference).is_file() => {
                Self::load(Path::new(reference))
            }
            other => other,
        }
    }

    /// Load the main and extra ontologies and merge them.
    pub fn build_tbox(&self) -> KbResult<TBox> {
        let main = Ontology::resolve(&self.ontology)?;
        let extras = self
            .extra_ontologies
            .iter()
            .map(|r| Ontology::resolve(r))
            .collect::<KbResult<Vec<_>>>()?;
        TBox::new(main, extras)
    }

    /// Every entity name the scenario mentions, sorted.
    pub fn known_entities(&self) -> BTreeSet<String> {
        let mut ents = BTreeSet::new();
        let mut add = |n: &str| {
            if !n.trim().is_empty() {
                ents.insert(n.to_string());
            }
        };
        for step in &self.steps {
            for (inst, _) in &step.types {
                add(inst);
            }
            for f in step.asserts.iter().chain(&step.retracts) {
                add(&f.subject);
                add(&f.object);
            }
            for u in &step.updates {
                add(&u.subject);
                add(&u.old);
                add(&u.new);
            }
            for d in &step.deletes {
                add(d);
            }
        }
        ents
    }
}
