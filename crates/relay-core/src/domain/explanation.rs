use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A versioned description of what a parameter scale means.
///
/// Versions are immutable once stored, which is what makes caching them by
/// `(selector, scale)` safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub scale_name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    pub version_number: u32,
}

impl Explanation {
    pub fn new(
        scale_name: impl Into<String>,
        description: impl Into<String>,
        version_number: u32,
    ) -> Self {
        Self {
            scale_name: scale_name.into(),
            description: description.into(),
            examples: Vec::new(),
            version_number,
        }
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }
}

/// Concrete explanation versions a task was rendered with (scale -> version).
pub type ExplanationVersions = BTreeMap<String, u32>;
