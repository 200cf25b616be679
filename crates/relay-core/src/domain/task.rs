use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::RequestId;
use super::errors::RelayError;

/// Upper bound of a parameter value (parameters are scored 0..=10).
pub const MAX_PARAMETER_VALUE: u8 = 10;

/// Scale name -> score.
///
/// `BTreeMap` なので反復順序は決定的（プロンプト生成の順序もこれに従う）。
pub type Parameters = BTreeMap<String, u8>;

/// Scale name -> which explanation version to use.
pub type ExplanationSelector = BTreeMap<String, VersionSelector>;

/// Which explanation version a parameter should be rendered with.
///
/// Wire 上は文字列（`"LATEST"` または `"3"`）。数値そのものも受け付ける。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSelector", into = "String")]
pub enum VersionSelector {
    #[default]
    Latest,
    Version(u32),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Number(u32),
    Text(String),
}

impl TryFrom<RawSelector> for VersionSelector {
    type Error = String;

    fn try_from(raw: RawSelector) -> Result<Self, Self::Error> {
        match raw {
            RawSelector::Number(n) => Ok(VersionSelector::Version(n)),
            RawSelector::Text(s) => s.parse(),
        }
    }
}

impl FromStr for VersionSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(VersionSelector::Latest);
        }
        s.parse::<u32>()
            .map(VersionSelector::Version)
            .map_err(|_| format!("invalid version selector: {s:?}"))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("LATEST"),
            VersionSelector::Version(n) => n.fmt(f),
        }
    }
}

impl From<VersionSelector> for String {
    fn from(selector: VersionSelector) -> Self {
        selector.to_string()
    }
}

/// One unit of work as it travels over the task queue.
///
/// Fields are private: once published the envelope is never mutated. The
/// only "mutation" is [`TaskEnvelope::addressed_to`], which consumes the
/// envelope before publication to stamp the return channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    request_id: RequestId,
    input_text: String,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    explanation_selector: ExplanationSelector,
    model_name: String,
    /// Return channel. Empty until the dispatcher addresses the task.
    #[serde(default)]
    reply_to: String,
}

impl TaskEnvelope {
    pub fn new(
        request_id: RequestId,
        input_text: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            input_text: input_text.into(),
            parameters: Parameters::new(),
            explanation_selector: ExplanationSelector::new(),
            model_name: model_name.into(),
            reply_to: String::new(),
        }
    }

    /// Add a parameter rendered with the latest explanation.
    pub fn with_parameter(mut self, scale: impl Into<String>, value: u8) -> Self {
        self.parameters.insert(scale.into(), value);
        self
    }

    /// Add a parameter pinned to a specific explanation version selector.
    pub fn with_pinned_parameter(
        mut self,
        scale: impl Into<String>,
        value: u8,
        selector: VersionSelector,
    ) -> Self {
        let scale = scale.into();
        self.explanation_selector.insert(scale.clone(), selector);
        self.parameters.insert(scale, value);
        self
    }

    pub fn addressed_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn input_text(&self) -> &str {
        &self.input_text
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn explanation_selector(&self) -> &ExplanationSelector {
        &self.explanation_selector
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn reply_to(&self) -> Option<&str> {
        (!self.reply_to.is_empty()).then_some(self.reply_to.as_str())
    }

    /// Selector for a scale, falling back to `Latest` when none was given.
    pub fn selector_for(&self, scale: &str) -> VersionSelector {
        self.explanation_selector
            .get(scale)
            .copied()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.input_text.trim().is_empty() {
            return Err(RelayError::InvalidTask("input_text is empty".into()));
        }
        if self.model_name.trim().is_empty() {
            return Err(RelayError::InvalidTask("model_name is empty".into()));
        }
        if let Some((scale, value)) = self
            .parameters
            .iter()
            .find(|(_, value)| **value > MAX_PARAMETER_VALUE)
        {
            return Err(RelayError::InvalidTask(format!(
                "parameter {scale}={value} is outside 0..={MAX_PARAMETER_VALUE}"
            )));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> TaskEnvelope {
        TaskEnvelope::new(RequestId::new(5), "Hello", "gpt-4o-mini")
            .with_parameter("casualness", 8)
            .with_pinned_parameter("formality", 2, VersionSelector::Version(3))
    }

    #[rstest]
    #[case("LATEST", VersionSelector::Latest)]
    #[case("latest", VersionSelector::Latest)]
    #[case("3", VersionSelector::Version(3))]
    #[case(" 12 ", VersionSelector::Version(12))]
    fn selector_parses(#[case] input: &str, #[case] expected: VersionSelector) {
        assert_eq!(input.parse::<VersionSelector>().unwrap(), expected);
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!("newest".parse::<VersionSelector>().is_err());
    }

    #[test]
    fn selector_accepts_json_numbers_and_strings() {
        let map: ExplanationSelector =
            serde_json::from_str(r#"{"a": 2, "b": "LATEST", "c": "7"}"#).unwrap();
        assert_eq!(map["a"], VersionSelector::Version(2));
        assert_eq!(map["b"], VersionSelector::Latest);
        assert_eq!(map["c"], VersionSelector::Version(7));
    }

    #[test]
    fn wire_format_uses_field_names() {
        let task = sample().addressed_to("humanization_result_5");
        let v: serde_json::Value = serde_json::from_slice(&task.to_payload().unwrap()).unwrap();
        assert_eq!(v["request_id"], 5);
        assert_eq!(v["input_text"], "Hello");
        assert_eq!(v["parameters"]["casualness"], 8);
        assert_eq!(v["explanation_selector"]["formality"], "3");
        assert_eq!(v["model_name"], "gpt-4o-mini");
        assert_eq!(v["reply_to"], "humanization_result_5");
    }

    #[test]
    fn missing_selector_falls_back_to_latest() {
        let task = sample();
        assert_eq!(task.selector_for("casualness"), VersionSelector::Latest);
        assert_eq!(task.selector_for("formality"), VersionSelector::Version(3));
    }

    #[test]
    fn reply_to_is_none_until_addressed() {
        assert_eq!(sample().reply_to(), None);
        assert_eq!(sample().addressed_to("q").reply_to(), Some("q"));
    }

    #[test]
    fn validate_rejects_empty_text_and_out_of_range_values() {
        assert!(sample().validate().is_ok());

        let empty = TaskEnvelope::new(RequestId::new(1), "   ", "m");
        assert!(matches!(empty.validate(), Err(RelayError::InvalidTask(_))));

        let loud = TaskEnvelope::new(RequestId::new(1), "hi", "m").with_parameter("energy", 11);
        let err = loud.validate().unwrap_err();
        assert!(err.to_string().contains("energy=11"));
    }
}
