//! Rich diagnostic error types for causa.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so users know what went wrong and how to
//! fix it. [`CausaError`] wraps them all for callers that cross subsystems.

use miette::Diagnostic;
use thiserror::Error;

use crate::batch::BatchError;
use crate::config::ConfigError;
use crate::hypotheses::HypothesisError;
use crate::llm::LlmError;
use crate::scenario::ScenarioError;

/// Top-level error type for causa.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum CausaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kb(#[from] KbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hypothesis(#[from] HypothesisError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for cross-subsystem operations.
pub type CausaResult<T> = std::result::Result<T, CausaError>;

// ---------------------------------------------------------------------------
// Knowledge-store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum KbError {
    #[error("failed to read ontology file: {path}")]
    #[diagnostic(
        code(causa::kb::io),
        help("Check that the ontology path exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ontology \"{id}\": {message}")]
    #[diagnostic(
        code(causa::kb::parse),
        help(
            "Ontology documents are TOML with an [ontology] table, [[classes]] and \
             [[properties]] arrays. Check the syntax of the file."
        )
    )]
    Parse { id: String, message: String },

    #[error("unknown bundled ontology: \"{id}\"")]
    #[diagnostic(
        code(causa::kb::unknown_ontology),
        help("Bundled ontologies are `mlo` and `tmo`. Pass a file path for anything else.")
    )]
    UnknownOntology { id: String },

    #[error("\"{owner}\" refers to undeclared name \"{reference}\"")]
    #[diagnostic(
        code(causa::kb::dangling_reference),
        help(
            "Parents, inverses, chains, domains and ranges must be declared somewhere \
             in the main or extra ontologies."
        )
    )]
    DanglingReference { owner: String, reference: String },

    #[error("reasoning exceeded its {budget_ms}ms budget after {rounds} round(s)")]
    #[diagnostic(
        code(causa::kb::reasoner_timeout),
        help(
            "The store is left partially materialised. Raise the reasoner budget, \
             or disable reasoning for this scenario."
        )
    )]
    ReasonerTimeout { budget_ms: u64, rounds: usize },
}

/// Result type for knowledge-store operations.
pub type KbResult<T> = std::result::Result<T, KbError>;
