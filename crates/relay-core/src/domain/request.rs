//! Request record: what the persistence side knows about a submitted job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::explanation::ExplanationVersions;
use super::ids::RequestId;
use super::task::Parameters;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub input_text: String,
    pub parameters: Parameters,
    pub model_name: String,

    /// Filled in once the stream completes.
    pub final_text: Option<String>,

    /// Explanation versions the worker actually rendered with.
    #[serde(default)]
    pub explanation_versions: ExplanationVersions,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub fn new(
        request_id: RequestId,
        input_text: impl Into<String>,
        parameters: Parameters,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            input_text: input_text.into(),
            parameters,
            model_name: model_name.into(),
            final_text: None,
            explanation_versions: ExplanationVersions::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.final_text.is_some()
    }

    pub fn complete(&mut self, final_text: &str) {
        self.final_text = Some(final_text.to_string());
        self.completed_at = Some(Utc::now());
    }
}
