//! LoadSampler port - コントローラが読むシステム負荷

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::RelayError;

/// Utilisation percentages in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl LoadSample {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self {
            cpu_percent,
            memory_percent,
        }
    }
}

#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> Result<LoadSample, RelayError>;
}
