//! LLM hypothesis generators, invoked when the causal matcher finds no cause.
//!
//! Four escalating tiers share one shape: build a prompt, make one chat call,
//! strip fences, parse, validate, and report. They differ in grounding:
//!
//! | Tier | Grounding                                                      |
//! |------|----------------------------------------------------------------|
//! | C0   | none; shape only plus a property-likeness smell test           |
//! | C1   | allowed entities, event classes and properties; vocab flags    |
//! | C2   | C1 plus retrieved context triples and a focus rule             |
//! | C3   | C2 plus a two-tier event-type catalog and one repair round      |
//!
//! Contract and parse failures are values ([`GenerationRecord`] with
//! `ok_schema = false`). Only a failed C3 repair round is an error.

pub mod c0;
pub mod c1;
pub mod c2;
pub mod c3;
pub mod contract;
pub mod prompt;
pub mod repair;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kb::{Fact, TBox};
use crate::llm::{LlmError, LlmResponse, LlmTransport};
use crate::retrieval::RetrievalConfig;
use crate::vocab::{self, EventTypeCatalog, TBoxVocab};

pub use contract::{
    AllowedVocab, Candidates, ContentChecks, FocusReport, GroundedHypothesis, OpenHypothesis,
    VocabReport,
};
pub use prompt::PromptLimits;
pub use repair::{RepairProtocol, RepairReport, RepairState, Violation};

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum HypothesisError {
    #[error("repair round failed at {stage}: {message}")]
    #[diagnostic(
        code(causa::hypotheses::repair_failed),
        help(
            "The model's corrected answer could not be parsed or validated. \
             The repair round is never retried; inspect the raw text of the trial."
        )
    )]
    RepairFailed {
        stage: SchemaErrorKind,
        message: String,
        raw_text: String,
    },

    #[error("repair round could not reach the model")]
    #[diagnostic(
        code(causa::hypotheses::repair_transport),
        help("The first answer arrived but the repair request failed. Check the LLM endpoint.")
    )]
    RepairTransport {
        #[source]
        source: LlmError,
    },
}

pub type HypothesisResult<T> = std::result::Result<T, HypothesisError>;

// ── Tiers ───────────────────────────────────────────────────────────────

/// Generator tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    C0,
    C1,
    C2,
    C3,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::C0, Tier::C1, Tier::C2, Tier::C3];

    /// Lower-case name, used for output directories.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::C0 => "c0",
            Self::C1 => "c1",
            Self::C2 => "c2",
            Self::C3 => "c3",
        }
    }

    pub fn default_max_tokens(self) -> u32 {
        match self {
            Self::C0 => 600,
            Self::C1 => 700,
            Self::C2 | Self::C3 => 850,
        }
    }

    /// Pause between batch trials, in milliseconds.
    pub fn default_sleep_ms(self) -> u64 {
        match self {
            Self::C0 | Self::C1 => 0,
            Self::C2 | Self::C3 => 50,
        }
    }

    pub fn uses_retrieval(self) -> bool {
        matches!(self, Self::C2 | Self::C3)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::C0 => "C0",
            Self::C1 => "C1",
            Self::C2 => "C2",
            Self::C3 => "C3",
        };
        f.write_str(s)
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c0" => Ok(Self::C0),
            "c1" => Ok(Self::C1),
            "c2" => Ok(Self::C2),
            "c3" => Ok(Self::C3),
            other => Err(format!("unknown tier \"{other}\" (expected c0, c1, c2 or c3)")),
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────

/// Failure tag of a generation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaErrorKind {
    JsonParse,
    SchemaValidation,
    Transport,
    Timeout,
    RepairFailed,
    NoUnexplainedTrigger,
}

impl fmt::Display for SchemaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::JsonParse => "json_parse",
            Self::SchemaValidation => "schema_validation",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RepairFailed => "repair_failed",
            Self::NoUnexplainedTrigger => "no_unexplained_trigger",
        };
        f.write_str(s)
    }
}

/// Retrieval parameters echoed into C2/C3 records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrievalInfo {
    pub hops: usize,
    pub max_ctx_triples: usize,
    pub ctx_triples_n: usize,
}

/// Catalog size echoed into C3 records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogInfo {
    pub n_types: usize,
    pub max_items: usize,
}

/// Tier-specific record fields, flattened into the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TierExtras {
    Open {
        content_checks: Option<ContentChecks>,
    },
    Vocabulary {},
    Retrieval {
        retrieval: RetrievalInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        focus: Option<FocusReport>,
    },
    Catalog {
        retrieval: RetrievalInfo,
        catalog: CatalogInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        focus: Option<FocusReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repair: Option<RepairReport>,
    },
}

/// Result of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRecord {
    pub ok_json: bool,
    pub ok_schema: bool,
    pub schema_error_type: Option<SchemaErrorKind>,
    pub schema_error_msg: Option<String>,
    /// `None`, or exactly three hypotheses.
    pub candidates: Option<Candidates>,
    pub latency_s: Option<f64>,
    /// `{}` when the server reported none.
    pub usage: serde_json::Value,
    pub raw_text: String,
    /// Grounding flags; `None` for C0 and for failed records.
    pub vocab: Option<VocabReport>,
    #[serde(flatten)]
    pub extras: TierExtras,
}

impl GenerationRecord {
    pub(crate) fn transport_failure(err: &LlmError, extras: TierExtras) -> Self {
        let kind = match err {
            LlmError::Timeout { .. } => SchemaErrorKind::Timeout,
            _ => SchemaErrorKind::Transport,
        };
        tracing::warn!(error = %err, "generation transport failure");
        Self {
            ok_json: false,
            ok_schema: false,
            schema_error_type: Some(kind),
            schema_error_msg: Some(err.to_string()),
            candidates: None,
            latency_s: None,
            usage: serde_json::json!({}),
            raw_text: String::new(),
            vocab: None,
            extras,
        }
    }

    pub(crate) fn rejected(
        kind: SchemaErrorKind,
        message: String,
        response: &LlmResponse,
        extras: TierExtras,
    ) -> Self {
        tracing::debug!(kind = %kind, %message, "generation rejected");
        Self {
            ok_json: kind != SchemaErrorKind::JsonParse,
            ok_schema: false,
            schema_error_type: Some(kind),
            schema_error_msg: Some(message),
            candidates: None,
            latency_s: Some(response.latency_s),
            usage: response.usage_json(),
            raw_text: response.text.clone(),
            vocab: None,
            extras,
        }
    }

    pub(crate) fn accepted(
        candidates: Candidates,
        response: &LlmResponse,
        vocab: Option<VocabReport>,
        extras: TierExtras,
    ) -> Self {
        Self {
            ok_json: true,
            ok_schema: true,
            schema_error_type: None,
            schema_error_msg: None,
            candidates: Some(candidates),
            latency_s: Some(response.latency_s),
            usage: response.usage_json(),
            raw_text: response.text.clone(),
            vocab,
            extras,
        }
    }

    /// Record for a trial whose C3 repair round failed.
    pub fn repair_failed(err: &HypothesisError, extras: TierExtras) -> Self {
        let (ok_json, raw_text) = match err {
            HypothesisError::RepairFailed {
                stage, raw_text, ..
            } => (*stage != SchemaErrorKind::JsonParse, raw_text.clone()),
            HypothesisError::RepairTransport { .. } => (false, String::new()),
        };
        Self {
            ok_json,
            ok_schema: false,
            schema_error_type: Some(SchemaErrorKind::RepairFailed),
            schema_error_msg: Some(err.to_string()),
            candidates: None,
            latency_s: None,
            usage: serde_json::json!({}),
            raw_text,
            vocab: None,
            extras,
        }
    }

    /// Placeholder for a trial in which nothing needed explaining.
    pub fn no_trigger(extras: TierExtras) -> Self {
        Self {
            ok_json: false,
            ok_schema: false,
            schema_error_type: Some(SchemaErrorKind::NoUnexplainedTrigger),
            schema_error_msg: Some("No unexplained retracts were detected.".into()),
            candidates: None,
            latency_s: None,
            usage: serde_json::json!({}),
            raw_text: String::new(),
            vocab: None,
            extras,
        }
    }

    /// Strict grounding held for every hypothesis.
    pub fn is_vocab_strict(&self) -> bool {
        self.vocab.as_ref().is_some_and(|v| v.ok_vocab_strict)
    }
}

// ── Inputs ──────────────────────────────────────────────────────────────

/// What one generation call is about.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub retraction: &'a Fact,
    pub step_name: &'a str,
    /// Individuals of the live store.
    pub entities: &'a BTreeSet<String>,
    /// Object-property facts of the live store, for retrieval.
    pub facts: &'a [Fact],
}

/// TBox-derived vocabulary, built once per batch.
#[derive(Debug, Clone, Default)]
pub struct Grounding {
    pub vocab: TBoxVocab,
    pub catalog: EventTypeCatalog,
}

impl Grounding {
    pub fn from_tbox(tbox: &TBox, max_event_types: usize) -> Self {
        Self {
            vocab: vocab::extract_tbox_vocab(tbox, vocab::DEFAULT_EVENT_ROOTS, max_event_types),
            catalog: EventTypeCatalog::from_tbox(tbox),
        }
    }
}

/// Sampling and sizing knobs of a generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub limits: PromptLimits,
    pub retrieval: RetrievalConfig,
    /// Preferred catalog lines in the C3 prompt.
    pub max_eventtype_items: usize,
    /// Fallback catalog lines in the C3 prompt.
    pub max_fallback_items: usize,
}

impl GenerationParams {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            temperature: 0.3,
            max_tokens: tier.default_max_tokens(),
            limits: PromptLimits::default(),
            retrieval: RetrievalConfig::default(),
            max_eventtype_items: 250,
            max_fallback_items: 120,
        }
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

/// Run one generation call for `tier`.
pub fn generate<T: LlmTransport + ?Sized>(
    tier: Tier,
    transport: &T,
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> HypothesisResult<GenerationRecord> {
    tracing::info!(
        tier = %tier,
        retraction = %request.retraction,
        step = request.step_name,
        "generating hypotheses"
    );
    let record = match tier {
        Tier::C0 => c0::generate(transport, request, params),
        Tier::C1 => c1::generate(transport, request, grounding, params),
        Tier::C2 => c2::generate(transport, request, grounding, params),
        Tier::C3 => c3::generate(transport, request, grounding, params)?,
    };
    tracing::info!(
        tier = %tier,
        ok_schema = record.ok_schema,
        error = ?record.schema_error_type,
        strict = record.is_vocab_strict(),
        "hypotheses generated"
    );
    Ok(record)
}

/// The user prompt `tier` would send, without calling the model.
pub fn render_prompt(
    tier: Tier,
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> String {
    match tier {
        Tier::C0 => c0::build_prompt(request),
        Tier::C1 => c1::build_prompt(request, grounding, params),
        Tier::C2 => c2::prepare(request, grounding, params).prompt,
        Tier::C3 => c3::prepare(request, grounding, params).prompt,
    }
}
