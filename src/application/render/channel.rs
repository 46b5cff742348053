//! Decoding of messages posted by the script environment.
//!
//! Decoding is pure: it turns a [`ScriptMessage`] into an [`InboundMessage`]
//! or a [`ChannelError`]. Correlating results with pending jobs happens in the
//! coordinator, which owns the job state.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::surface::{READY_HANDLER, RESULT_HANDLER, ScriptMessage, TERMINATED_HANDLER};
use super::types::{FormulaImage, MediaType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("unknown message handler `{0}`")]
    UnknownHandler(String),
    #[error("malformed `{handler}` message: {message}")]
    MalformedBody {
        handler: &'static str,
        message: String,
    },
    #[error("invalid batch id `{0}`")]
    InvalidBatchId(String),
    #[error("result entry {position} names neither an index nor a formula")]
    UncorrelatedEntry { position: usize },
    #[error("image payload could not be decoded: {0}")]
    InvalidPayload(String),
}

/// Message after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ready,
    Terminated { reason: Option<String> },
    Results(BatchResults),
}

/// Results reported for (part of) a dispatched batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResults {
    pub batch_id: Uuid,
    pub entries: Vec<ResultEntry>,
    /// Entries that could not be tied to any slot.
    pub rejected: Vec<ChannelError>,
}

/// Outcome for one formula. `Err` carries the engine's failure message.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    pub index: Option<usize>,
    pub latex: Option<String>,
    pub outcome: Result<FormulaImage, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBatchResults {
    batch_id: String,
    results: Vec<RawResultEntry>,
}

#[derive(Debug, Deserialize)]
struct RawResultEntry {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    latex: Option<String>,
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTerminated {
    #[serde(default)]
    reason: Option<String>,
}

pub fn decode(message: &ScriptMessage) -> Result<InboundMessage, ChannelError> {
    match message.handler.as_str() {
        READY_HANDLER => Ok(InboundMessage::Ready),
        TERMINATED_HANDLER => {
            let raw = match &message.body {
                Value::Null => RawTerminated::default(),
                body => RawTerminated::deserialize(body).map_err(|err| {
                    ChannelError::MalformedBody {
                        handler: TERMINATED_HANDLER,
                        message: err.to_string(),
                    }
                })?,
            };
            Ok(InboundMessage::Terminated { reason: raw.reason })
        }
        RESULT_HANDLER => decode_results(&message.body).map(InboundMessage::Results),
        other => Err(ChannelError::UnknownHandler(other.to_string())),
    }
}

fn decode_results(body: &Value) -> Result<BatchResults, ChannelError> {
    let raw = RawBatchResults::deserialize(body).map_err(|err| ChannelError::MalformedBody {
        handler: RESULT_HANDLER,
        message: err.to_string(),
    })?;
    let batch_id =
        Uuid::parse_str(&raw.batch_id).map_err(|_| ChannelError::InvalidBatchId(raw.batch_id))?;

    let mut entries = Vec::with_capacity(raw.results.len());
    let mut rejected = Vec::new();
    for (position, entry) in raw.results.into_iter().enumerate() {
        if entry.index.is_none() && entry.latex.is_none() {
            rejected.push(ChannelError::UncorrelatedEntry { position });
            continue;
        }

        let outcome = match (entry.base64, entry.error) {
            (_, Some(error)) => Err(error),
            (Some(payload), None) => decode_image(&payload).map_err(|err| err.to_string()),
            (None, None) => Err("result carried neither an image nor an error".to_string()),
        };

        entries.push(ResultEntry {
            index: entry.index,
            latex: entry.latex,
            outcome,
        });
    }

    Ok(BatchResults {
        batch_id,
        entries,
        rejected,
    })
}

/// Decode either a `data:<mime>;base64,<payload>` URL or bare base64 (PNG).
pub fn decode_image(payload: &str) -> Result<FormulaImage, ChannelError> {
    let (media_type, encoded) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (header, encoded) = rest
                .split_once(',')
                .ok_or_else(|| ChannelError::InvalidPayload("data URL without payload".into()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| ChannelError::InvalidPayload("data URL is not base64".into()))?;
            (MediaType::from_mime(mime), encoded)
        }
        None => (MediaType::Png, payload),
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| ChannelError::InvalidPayload(err.to_string()))?;
    if bytes.is_empty() {
        return Err(ChannelError::InvalidPayload("empty image payload".into()));
    }

    Ok(FormulaImage::new(bytes, media_type))
}

/// Encode an image as a `data:` URL, the shape surfaces post results in.
pub fn encode_data_url(media_type: &MediaType, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        media_type.as_mime(),
        STANDARD.encode(bytes)
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_ready_and_termination() {
        assert_eq!(
            decode(&ScriptMessage::ready()).expect("ready"),
            InboundMessage::Ready
        );
        assert_eq!(
            decode(&ScriptMessage::terminated("oom")).expect("terminated"),
            InboundMessage::Terminated {
                reason: Some("oom".to_string())
            }
        );
        assert_eq!(
            decode(&ScriptMessage::new(TERMINATED_HANDLER, Value::Null)).expect("terminated"),
            InboundMessage::Terminated { reason: None }
        );
    }

    #[test]
    fn decodes_mixed_batch_results() {
        let batch_id = Uuid::new_v4();
        let png = encode_data_url(&MediaType::Png, b"png-bytes");
        let message = ScriptMessage::new(
            RESULT_HANDLER,
            json!({
                "batchId": batch_id.to_string(),
                "results": [
                    { "index": 0, "latex": "x^2", "base64": png },
                    { "latex": "y", "error": "ParseError" },
                    { "base64": "aGVsbG8=" },
                    { "index": 3, "base64": "!!not base64!!" },
                ]
            }),
        );

        let InboundMessage::Results(results) = decode(&message).expect("decoded") else {
            panic!("expected results");
        };
        assert_eq!(results.batch_id, batch_id);
        assert_eq!(results.entries.len(), 3);
        assert_eq!(
            results.rejected,
            vec![ChannelError::UncorrelatedEntry { position: 2 }]
        );

        let first = results.entries[0].outcome.as_ref().expect("image");
        assert_eq!(first.data().as_ref(), b"png-bytes");
        assert_eq!(first.media_type(), &MediaType::Png);

        assert_eq!(results.entries[1].index, None);
        assert_eq!(results.entries[1].latex.as_deref(), Some("y"));
        assert_eq!(results.entries[1].outcome, Err("ParseError".to_string()));

        assert!(results.entries[2].outcome.is_err());
    }

    #[test]
    fn rejects_wrong_shapes() {
        let missing_results = ScriptMessage::new(RESULT_HANDLER, json!({ "batchId": "x" }));
        assert!(matches!(
            decode(&missing_results),
            Err(ChannelError::MalformedBody { .. })
        ));

        let bad_id = ScriptMessage::new(
            RESULT_HANDLER,
            json!({ "batchId": "batch_1", "results": [] }),
        );
        assert_eq!(
            decode(&bad_id),
            Err(ChannelError::InvalidBatchId("batch_1".to_string()))
        );

        let unknown = ScriptMessage::new("selectionChange", Value::Null);
        assert_eq!(
            decode(&unknown),
            Err(ChannelError::UnknownHandler("selectionChange".to_string()))
        );
    }

    #[test]
    fn data_urls_carry_media_type() {
        let svg = decode_image(&encode_data_url(&MediaType::Svg, b"<svg/>")).expect("svg");
        assert_eq!(svg.media_type(), &MediaType::Svg);
        assert_eq!(svg.data().as_ref(), b"<svg/>");

        assert!(decode_image("data:image/png,raw").is_err());
        assert!(decode_image("data:image/png;base64").is_err());
        assert!(decode_image("").is_err());
    }
}
