//! ResultEnvelope - 結果チャネルを流れるメッセージ
//!
//! 1 ストリームにつき `is_final = true` はちょうど 1 通で、必ず最後に publish されます。
//! - 非 final: `text_piece` に断片
//! - final: `final_text` に全断片の連結

use serde::{Deserialize, Serialize};

use super::errors::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub is_final: bool,
    #[serde(default)]
    pub text_piece: String,
    #[serde(default)]
    pub final_text: String,
}

impl ResultEnvelope {
    pub fn piece(text: impl Into<String>) -> Self {
        Self {
            is_final: false,
            text_piece: text.into(),
            final_text: String::new(),
        }
    }

    pub fn complete(final_text: impl Into<String>) -> Self {
        Self {
            is_final: true,
            text_piece: String::new(),
            final_text: final_text.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// What the dispatcher hands to its caller's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Final(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_and_complete_set_the_right_fields() {
        let p = ResultEnvelope::piece("Hel");
        assert!(!p.is_final);
        assert_eq!(p.text_piece, "Hel");
        assert!(p.final_text.is_empty());

        let f = ResultEnvelope::complete("Hello");
        assert!(f.is_final);
        assert_eq!(f.final_text, "Hello");
    }

    #[test]
    fn decodes_envelopes_with_missing_optional_fields() {
        let env = ResultEnvelope::from_payload(br#"{"is_final": true, "final_text": "done"}"#).unwrap();
        assert_eq!(env, ResultEnvelope::complete("done"));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = ResultEnvelope::from_payload(b"not json").unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
    }
}
