//! C0: unconstrained hypotheses. Shape is checked, content is only smelled.

use super::contract::{self, Candidates};
use super::prompt::{self, SYSTEM_OPEN};
use super::{GenerationParams, GenerationRecord, GenerationRequest, SchemaErrorKind, TierExtras};
use crate::llm::{ChatMessage, LlmTransport};

pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    prompt::open_prompt(request.retraction, request.step_name)
}

pub fn generate<T: LlmTransport + ?Sized>(
    transport: &T,
    request: &GenerationRequest<'_>,
    params: &GenerationParams,
) -> GenerationRecord {
    let failed = || TierExtras::Open {
        content_checks: None,
    };
    let messages = [
        ChatMessage::system(SYSTEM_OPEN),
        ChatMessage::user(build_prompt(request)),
    ];
    let response = match transport.chat(&messages, params.temperature, Some(params.max_tokens)) {
        Ok(r) => r,
        Err(e) => return GenerationRecord::transport_failure(&e, failed()),
    };

    let data = match contract::parse_json(&response.text) {
        Ok(v) => v,
        Err(msg) => {
            return GenerationRecord::rejected(SchemaErrorKind::JsonParse, msg, &response, failed());
        }
    };
    match contract::validate_open(&data) {
        Ok(candidates) => {
            let checks = contract::content_checks(&candidates);
            GenerationRecord::accepted(
                Candidates::Open(candidates),
                &response,
                None,
                TierExtras::Open {
                    content_checks: Some(checks),
                },
            )
        }
        Err(msg) => {
            GenerationRecord::rejected(SchemaErrorKind::SchemaValidation, msg, &response, failed())
        }
    }
}
