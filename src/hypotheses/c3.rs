//! C3: C2 plus a two-tier event-type catalog and one constraint repair.

use std::collections::BTreeSet;

use super::contract::{self, AllowedVocab, Candidates, FocusRule, GroundedHypothesis, SchemaRules};
use super::prompt::{self, CatalogText, GroundedLists, REQUIRED_PARTICIPANT, SYSTEM_GROUNDED};
use super::repair::{self, Constraints, RepairProtocol, RepairReport};
use super::{
    CatalogInfo, GenerationParams, GenerationRecord, GenerationRequest, Grounding,
    HypothesisError, HypothesisResult, RetrievalInfo, SchemaErrorKind, TierExtras,
};
use crate::kb::Fact;
use crate::llm::{ChatMessage, LlmTransport};
use crate::retrieval;
use crate::vocab::{self, EVENT_TYPE_ROOT};

/// Prompt plus everything the checks need.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub prompt: String,
    pub context: Vec<Fact>,
    pub retrieval: RetrievalInfo,
    pub catalog: CatalogInfo,
    /// Preferred tier first, then fallback.
    pub allowed_classes: Vec<String>,
    pub preferred: BTreeSet<String>,
    /// Request entities plus the required participant.
    pub entities: BTreeSet<String>,
}

pub fn prepare(
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> Prepared {
    let context = retrieval::retrieve_subgraph(request.facts, request.retraction, params.retrieval);
    let catalog = &grounding.catalog;

    let mut allowed_classes = catalog.allowed_classes();
    let text = if allowed_classes.is_empty() {
        allowed_classes.push(EVENT_TYPE_ROOT.to_string());
        CatalogText {
            preferred: format!("- {EVENT_TYPE_ROOT}"),
            fallback: String::new(),
        }
    } else {
        CatalogText {
            preferred: vocab::format_catalog(&catalog.preferred, params.max_eventtype_items),
            fallback: vocab::format_catalog(&catalog.fallback, params.max_fallback_items),
        }
    };

    let mut entities = request.entities.clone();
    entities.insert(REQUIRED_PARTICIPANT.to_string());

    let lists = GroundedLists {
        entities: &entities,
        event_classes: &allowed_classes,
        object_properties: &grounding.vocab.object_properties,
    };
    let prompt = prompt::catalog_prompt(
        request.retraction,
        request.step_name,
        lists,
        &context,
        &text,
        &params.limits,
    );

    Prepared {
        prompt,
        retrieval: RetrievalInfo {
            hops: params.retrieval.hops,
            max_ctx_triples: params.retrieval.max_facts,
            ctx_triples_n: context.len(),
        },
        catalog: CatalogInfo {
            n_types: allowed_classes.len(),
            max_items: params.max_eventtype_items,
        },
        preferred: catalog.preferred_names(),
        context,
        allowed_classes,
        entities,
    }
}

fn parse_and_validate(text: &str) -> Result<Vec<GroundedHypothesis>, (SchemaErrorKind, String)> {
    let data = contract::parse_json(text).map_err(|m| (SchemaErrorKind::JsonParse, m))?;
    contract::validate_grounded(&data, &SchemaRules::retrieval())
        .map_err(|m| (SchemaErrorKind::SchemaValidation, m))
}

/// One generation with at most one repair round.
///
/// Errors only when the repair round itself fails; every other failure
/// is a record.
pub fn generate<T: LlmTransport + ?Sized>(
    transport: &T,
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> HypothesisResult<GenerationRecord> {
    let prepared = prepare(request, grounding, params);
    tracing::debug!(
        ctx_triples = prepared.context.len(),
        n_types = prepared.catalog.n_types,
        preferred = prepared.preferred.len(),
        "catalog prompt prepared"
    );
    let extras = |focus, report| TierExtras::Catalog {
        retrieval: prepared.retrieval,
        catalog: prepared.catalog,
        focus,
        repair: report,
    };

    let mut messages = vec![
        ChatMessage::system(SYSTEM_GROUNDED),
        ChatMessage::user(prepared.prompt.as_str()),
    ];
    let first = match transport.chat(&messages, params.temperature, Some(params.max_tokens)) {
        Ok(r) => r,
        Err(e) => return Ok(GenerationRecord::transport_failure(&e, extras(None, None))),
    };
    let candidates = match parse_and_validate(&first.text) {
        Ok(c) => c,
        Err((kind, msg)) => {
            return Ok(GenerationRecord::rejected(kind, msg, &first, extras(None, None)));
        }
    };

    let allowed_set: BTreeSet<String> = prepared.allowed_classes.iter().cloned().collect();
    let constraints = Constraints {
        allowed_classes: &allowed_set,
        preferred: &prepared.preferred,
        required_participant: REQUIRED_PARTICIPANT,
    };

    let mut protocol = RepairProtocol::new();
    let violations = repair::check(&candidates, &constraints);
    protocol.review(violations.clone());
    let (response, candidates, report) = match protocol.begin_repair() {
        None => (first, candidates, RepairReport::not_needed()),
        Some(repair_msg) => {
            tracing::info!(violations = violations.len(), "requesting repair");
            messages.push(ChatMessage::assistant(contract::strip_code_fences(&first.text)));
            messages.push(ChatMessage::user(repair_msg));

            let repaired = match transport.chat(&messages, 0.0, Some(params.max_tokens)) {
                Ok(r) => r,
                Err(source) => {
                    protocol.conclude(false);
                    return Err(HypothesisError::RepairTransport { source });
                }
            };
            let fixed = match parse_and_validate(&repaired.text) {
                Ok(c) => c,
                Err((stage, message)) => {
                    protocol.conclude(false);
                    tracing::warn!(%stage, %message, "repair answer rejected");
                    return Err(HypothesisError::RepairFailed {
                        stage,
                        message,
                        raw_text: repaired.text,
                    });
                }
            };
            let state = protocol.conclude(true);
            let remaining = repair::check(&fixed, &constraints);
            if !remaining.is_empty() {
                tracing::warn!(remaining = remaining.len(), "violations survive repair");
            }
            let report = RepairReport {
                requested: true,
                state,
                violations,
                remaining,
                initial_raw_text: Some(first.text.clone()),
            };
            (repaired, fixed, report)
        }
    };

    let allowed = AllowedVocab {
        entities: prepared.entities.clone(),
        event_classes: allowed_set,
        object_properties: grounding.vocab.object_properties.iter().cloned().collect(),
        reject_instance_like_classes: true,
    };
    let vocab = contract::vocab_flags(&candidates, &allowed);
    let focus = contract::focus_report(&candidates, request.retraction, FocusRule::Both);
    Ok(GenerationRecord::accepted(
        Candidates::Grounded(candidates),
        &response,
        Some(vocab),
        extras(Some(focus), Some(report)),
    ))
}
