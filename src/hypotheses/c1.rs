//! C1: hypotheses grounded in the TBox and the live individuals.

use super::contract::{self, AllowedVocab, Candidates, SchemaRules};
use super::prompt::{self, GroundedLists, SYSTEM_GROUNDED};
use super::{
    GenerationParams, GenerationRecord, GenerationRequest, Grounding, SchemaErrorKind, TierExtras,
};
use crate::llm::{ChatMessage, LlmTransport};

pub fn build_prompt(
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> String {
    let lists = GroundedLists {
        entities: request.entities,
        event_classes: &grounding.vocab.event_types,
        object_properties: &grounding.vocab.object_properties,
    };
    prompt::vocabulary_prompt(request.retraction, request.step_name, lists, &params.limits)
}

/// Allowed lists checked by C1. The prompt may quote fewer.
pub(crate) fn allowed_vocab(request: &GenerationRequest<'_>, grounding: &Grounding) -> AllowedVocab {
    AllowedVocab {
        entities: request.entities.clone(),
        event_classes: grounding.vocab.event_types.iter().cloned().collect(),
        object_properties: grounding.vocab.object_properties.iter().cloned().collect(),
        reject_instance_like_classes: false,
    }
}

pub fn generate<T: LlmTransport + ?Sized>(
    transport: &T,
    request: &GenerationRequest<'_>,
    grounding: &Grounding,
    params: &GenerationParams,
) -> GenerationRecord {
    let extras = || TierExtras::Vocabulary {};
    let messages = [
        ChatMessage::system(SYSTEM_GROUNDED),
        ChatMessage::user(build_prompt(request, grounding, params)),
    ];
    let response = match transport.chat(&messages, params.temperature, Some(params.max_tokens)) {
        Ok(r) => r,
        Err(e) => return GenerationRecord::transport_failure(&e, extras()),
    };

    let data = match contract::parse_json(&response.text) {
        Ok(v) => v,
        Err(msg) => {
            return GenerationRecord::rejected(SchemaErrorKind::JsonParse, msg, &response, extras());
        }
    };
    let candidates = match contract::validate_grounded(&data, &SchemaRules::vocabulary()) {
        Ok(c) => c,
        Err(msg) => {
            return GenerationRecord::rejected(
                SchemaErrorKind::SchemaValidation,
                msg,
                &response,
                extras(),
            );
        }
    };
    let vocab = contract::vocab_flags(&candidates, &allowed_vocab(request, grounding));
    GenerationRecord::accepted(
        Candidates::Grounded(candidates),
        &response,
        Some(vocab),
        extras(),
    )
}
