use serde::{Deserialize, Serialize};

/// Point-in-time counts of one worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub capacity: usize,
    pub in_flight: usize,
    pub admitted_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}
