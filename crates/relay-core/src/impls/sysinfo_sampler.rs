//! SystemLoadSampler - sysinfo で CPU・メモリ使用率を読む
//!
//! CPU 使用率は前回の refresh との差分から計算されるため、
//! 生成直後の 1 回目は 0% 付近になります（コントローラの tick 間隔で解消）。

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sysinfo::System;

use crate::domain::RelayError;
use crate::ports::{LoadSample, LoadSampler};

pub struct SystemLoadSampler {
    system: Mutex<System>,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadSampler for SystemLoadSampler {
    async fn sample(&self) -> Result<LoadSample, RelayError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        Ok(LoadSample::new(
            system.global_cpu_usage().clamp(0.0, 100.0),
            memory_percent.clamp(0.0, 100.0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn samples_are_percentages() {
        let sampler = SystemLoadSampler::new();
        let sample = sampler.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
    }
}
