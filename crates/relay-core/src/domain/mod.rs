//! Domain model (ids, envelopes, explanations, errors).

pub mod dead_letter;
pub mod envelope;
pub mod errors;
pub mod explanation;
pub mod ids;
pub mod request;
pub mod task;

pub use dead_letter::{DeadLetter, dead_letter_queue};
pub use envelope::{ResultEnvelope, StreamEvent};
pub use errors::{ErrorKind, RelayError};
pub use explanation::{Explanation, ExplanationVersions};
pub use ids::RequestId;
pub use request::RequestRecord;
pub use task::{ExplanationSelector, MAX_PARAMETER_VALUE, Parameters, TaskEnvelope, VersionSelector};
