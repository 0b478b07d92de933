//! JSON codec with the legacy fallback decode.
//!
//! Wire payloads are UTF-8 JSON. A small population of legacy producers emits
//! framed plain strings instead; receivers strip non-printable characters,
//! drop the `'H'` framing prefix if present, and treat the remainder as a
//! bare string. New producers must emit well-formed JSON.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// Known framing prefix emitted by the legacy producer.
const LEGACY_FRAME_PREFIX: char = 'H';

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid UTF-8")]
    Utf8,

    #[error("payload is empty after fallback cleanup")]
    Empty,

    #[error("no event kind is carried on topic '{0}'")]
    UnknownTopic(String),

    #[error("message serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode a message for publication.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a raw bus payload into JSON, applying the legacy fallback.
///
/// Non-UTF-8 payloads are an error; there is no producer, legacy or otherwise,
/// that emits them.
pub fn decode_payload(bytes: &[u8]) -> Result<JsonValue, CodecError> {
    let text = core::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?;

    match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => Ok(value),
        Err(err) => {
            debug!(error = %err, "payload is not JSON, applying legacy fallback");
            fallback_decode(text)
        }
    }
}

/// Legacy fallback: printable characters only, optional frame prefix dropped,
/// result carried as a bare string.
fn fallback_decode(text: &str) -> Result<JsonValue, CodecError> {
    let mut clean: String = text.chars().filter(|c| !c.is_control()).collect();

    if clean.starts_with(LEGACY_FRAME_PREFIX) {
        clean.remove(0);
    }

    if clean.is_empty() {
        return Err(CodecError::Empty);
    }

    Ok(JsonValue::String(clean))
}
