//! C2: C1 plus a retrieved neighborhood of the retraction as context.

use super::contract::{self, Candidates, FocusRule, SchemaRules};
use super::prompt::{self, GroundedLists, SYSTEM_GROUNDED};
use super::{
    c1, GenerationParams, GenerationRecord, GenerationRequest, Grounding, RetrievalInfo,
    SchemaErrorKind, TierExtras,
};
use crate::kb::Fact;
use crate::llm::{ChatMessage, LlmTransport};
use crate::retrieval;

/// Prompt plus the context it quotes.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub prompt: String,
    pub context: Vec<Fact>,
    pub retrieval: RetrievalInfo,
}

pub fn prepare(
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> Prepared {
    let context = retrieval::retrieve_subgraph(request.facts, request.retraction, params.retrieval);
    let lists = GroundedLists {
        entities: request.entities,
        event_classes: &grounding.vocab.event_types,
        object_properties: &grounding.vocab.object_properties,
    };
    let prompt = prompt::retrieval_prompt(
        request.retraction,
        request.step_name,
        lists,
        &context,
        &params.limits,
    );
    Prepared {
        prompt,
        retrieval: RetrievalInfo {
            hops: params.retrieval.hops,
            max_ctx_triples: params.retrieval.max_facts,
            ctx_triples_n: context.len(),
        },
        context,
    }
}

pub fn generate<T: LlmTransport + ?Sized>(
    transport: &T,
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> GenerationRecord {
    let prepared = prepare(request, grounding, params);
    tracing::debug!(ctx_triples = prepared.context.len(), "retrieved context");
    let extras = |focus| TierExtras::Retrieval {
        retrieval: prepared.retrieval,
        focus,
    };

    let messages = [
        ChatMessage::system(SYSTEM_GROUNDED),
        ChatMessage::user(prepared.prompt.as_str()),
    ];
    let response = match transport.chat(&messages, params.temperature, Some(params.max_tokens)) {
        Ok(r) => r,
        Err(e) => return GenerationRecord::transport_failure(&e, extras(None)),
    };

    let data = match contract::parse_json(&response.text) {
        Ok(v) => v,
        Err(msg) => {
            return GenerationRecord::rejected(
                SchemaErrorKind::JsonParse,
                msg,
                &response,
                extras(None),
            );
        }
    };
    let candidates = match contract::validate_grounded(&data, &SchemaRules::retrieval()) {
        Ok(c) => c,
        Err(msg) => {
            return GenerationRecord::rejected(
                SchemaErrorKind::SchemaValidation,
                msg,
                &response,
                extras(None),
            );
        }
    };
    let vocab = contract::vocab_flags(&candidates, &c1::allowed_vocab(request, grounding));
    let focus = contract::focus_report(&candidates, request.retraction, FocusRule::Either);
    GenerationRecord::accepted(
        Candidates::Grounded(candidates),
        &response,
        Some(vocab),
        extras(Some(focus)),
    )
}
